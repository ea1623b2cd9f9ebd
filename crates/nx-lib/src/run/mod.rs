//! Run orchestration: everything between "the user asked for these
//! targets" and "tasks executed, events emitted, exit code known".

pub mod cache;
pub mod reporter;
pub mod runner;

use std::{
    collections::HashSet,
    sync::Arc,
};

pub use cache::{RunCache, RunCacheOpts, TaskCache};
use miette::Diagnostic;
use nx_cache::{AsyncCache, CacheMultiplexer, CacheOpts, FsCache};
use nx_env::EnvironmentVariableMap;
use nx_hash::FileHasher;
use nx_process::ProcessManager;
use nxpath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
pub use runner::{RunOutcome, Runner, RunnerError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    config::{ConfigError, WorkspaceConfig},
    engine::{BuilderError, EngineBuilder, TaskSpec},
    lifecycle::LifecycleBus,
    opts::RunOpts,
    project_graph::{
        cache::graph_input_hash, plugins::PluginRegistry, ProjectGraph, ProjectGraphBuilder,
        ProjectGraphCache, ProjectGraphError,
    },
    signal::SignalHandler,
    task_hash::{tool_fingerprint, TaskHasher},
};

#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] ProjectGraphError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Planner(#[from] BuilderError),
    #[error("unable to hash workspace files: {0}")]
    Hash(#[from] nx_hash::Error),
    #[error("unable to open the task cache: {0}")]
    Cache(#[from] nx_cache::CacheError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Sync(#[from] crate::sync::SyncError),
    #[error("no tasks matched the requested targets")]
    #[diagnostic(code(no_matching_tasks))]
    NoTasks,
}

impl RunError {
    /// Invocation errors (planner aborted, misconfiguration) exit with 2;
    /// runtime trouble exits with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_)
            | RunError::Graph(_)
            | RunError::Planner(_)
            | RunError::NoTasks => 2,
            RunError::Hash(_) | RunError::Cache(_) | RunError::Runner(_) | RunError::Sync(_) => 1,
        }
    }
}

/// The loaded workspace state shared by the run, graph, and sync commands.
pub struct Workspace {
    pub config: WorkspaceConfig,
    pub registry: PluginRegistry,
    pub file_hasher: FileHasher,
    pub graph: ProjectGraph,
    pub graph_hash: String,
}

pub fn load_workspace(repo_root: &AbsoluteSystemPath) -> Result<Workspace, RunError> {
    let config = WorkspaceConfig::load(repo_root)?;
    let registry = PluginRegistry::from_config(&config)?
        .with_memo_dir(repo_root.join_components(&[".nx", "cache", "plugins"]));

    let mut file_hasher = FileHasher::new(repo_root);
    file_hasher.init()?;
    for warning in file_hasher.warnings() {
        warn!("unable to hash {}: {}", warning.path, warning.message);
    }
    if let Err(err) =
        file_hasher.persist(&repo_root.join_components(&[".nx", "cache", "file-hashes.json"]))
    {
        warn!("unable to persist the file hash index: {err}");
    }

    let graph_hash = graph_input_hash(repo_root, &registry, &file_hasher);
    let graph_cache = ProjectGraphCache::new(repo_root);
    let graph = match graph_cache.read(&graph_hash) {
        Some(graph) => {
            debug!("project graph loaded from cache");
            graph
        }
        None => {
            let (graph, warnings) =
                ProjectGraphBuilder::new(repo_root, &config, &file_hasher, &registry).build()?;
            for warning in warnings {
                warn!("{warning}");
            }
            if let Err(err) = graph_cache.write(&graph, &graph_hash) {
                warn!("unable to persist the project graph: {err}");
            }
            graph
        }
    };

    Ok(Workspace {
        config,
        registry,
        file_hasher,
        graph,
        graph_hash,
    })
}

/// Projects whose recorded file hashes differ from the snapshot taken for
/// `base`, plus every project that transitively depends on one of them.
/// With no snapshot yet, everything is affected and the snapshot is
/// recorded for next time.
fn affected_projects(
    repo_root: &AbsoluteSystemPath,
    workspace: &Workspace,
    base: &str,
) -> Option<HashSet<String>> {
    let safe_base: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let snapshot_path =
        repo_root.join_components(&[".nx", "cache", &format!("ref-{safe_base}.json")]);

    let previous = match FileHasher::load(repo_root, &snapshot_path) {
        Ok(previous) => previous,
        Err(_) => {
            if let Err(err) = workspace.file_hasher.persist(&snapshot_path) {
                warn!("unable to record file hashes for base {base}: {err}");
            }
            return None;
        }
    };

    let mut changed_projects = HashSet::new();
    for changed in workspace.file_hasher.diff(&previous) {
        if let Some(project) = workspace.graph.project_for_file(changed) {
            changed_projects.insert(project.name.as_str());
        } else {
            // a change outside every project (lockfile, workspace config)
            // affects everything
            return Some(workspace.graph.nodes.keys().cloned().collect());
        }
    }

    // a change affects the changed project and everything built on top of it
    let mut dependency_graph: petgraph::Graph<&str, ()> = petgraph::Graph::new();
    let mut indices = std::collections::HashMap::new();
    for name in workspace.graph.nodes.keys() {
        indices.insert(name.as_str(), dependency_graph.add_node(name.as_str()));
    }
    for (source, edges) in &workspace.graph.dependencies {
        let Some(&source_index) = indices.get(source.as_str()) else {
            continue;
        };
        for edge in edges {
            if let Some(&target_index) = indices.get(edge.target.as_str()) {
                dependency_graph.add_edge(source_index, target_index, ());
            }
        }
    }
    let starts = changed_projects
        .iter()
        .filter_map(|name| indices.get(name).copied());
    let affected = nx_graph_utils::transitive_closure(
        &dependency_graph,
        starts,
        petgraph::Direction::Incoming,
    );
    Some(affected.into_iter().map(|name| name.to_string()).collect())
}

/// Expands the requested target strings into initiating task specs.
/// `project:target` names one project; a bare target fans out to every
/// project declaring it, narrowed by `--projects` and the affected set.
pub(crate) fn initiating_specs(
    graph: &ProjectGraph,
    targets: &[String],
    projects_filter: &[String],
    affected: Option<&HashSet<String>>,
    configuration: Option<&str>,
) -> Vec<TaskSpec> {
    let mut specs = Vec::new();
    for target in targets {
        if let Some((project, target_name)) = target.split_once(':') {
            specs.push(TaskSpec {
                project: project.to_string(),
                target: target_name.to_string(),
                configuration: configuration.map(str::to_string),
            });
            continue;
        }
        for project in graph.nodes.values() {
            if !project.targets.contains_key(target) {
                continue;
            }
            if !projects_filter.is_empty() && !projects_filter.contains(&project.name) {
                continue;
            }
            if let Some(affected) = affected {
                if !affected.contains(&project.name) {
                    continue;
                }
            }
            specs.push(TaskSpec {
                project: project.name.clone(),
                target: target.to_string(),
                configuration: configuration.map(str::to_string),
            });
        }
    }
    specs.sort_by(|a, b| (&a.project, &a.target).cmp(&(&b.project, &b.target)));
    specs.dedup();
    specs
}

/// Plans and executes the requested targets end to end, returning the
/// process exit code.
pub async fn execute_run(
    repo_root: &AbsoluteSystemPath,
    targets: &[String],
    projects_filter: &[String],
    mut opts: RunOpts,
) -> Result<i32, RunError> {
    let workspace = load_workspace(repo_root)?;

    let affected = opts
        .base
        .as_deref()
        .and_then(|base| affected_projects(repo_root, &workspace, base));
    let specs = initiating_specs(
        &workspace.graph,
        targets,
        projects_filter,
        affected.as_ref(),
        opts.configuration.as_deref(),
    );
    if specs.is_empty() {
        return Err(RunError::NoTasks);
    }
    // run-one: exactly one initiating project streams its output live
    if opts.initiating_project.is_none() {
        let mut initiating_projects: Vec<&str> =
            specs.iter().map(|spec| spec.project.as_str()).collect();
        initiating_projects.dedup();
        if let [only] = initiating_projects.as_slice() {
            opts.initiating_project = Some(only.to_string());
        }
    }

    let engine = Arc::new(
        EngineBuilder::new(&workspace.graph, &workspace.config)
            .with_tasks(specs)
            .build()?,
    );

    let env_at_execution_start = EnvironmentVariableMap::infer();
    let fingerprint = tool_fingerprint(
        workspace
            .registry
            .plugin_specs()
            .map(|spec| spec.name.clone()),
    );
    let hasher = TaskHasher::new(
        repo_root,
        &workspace.graph,
        &workspace.config,
        &workspace.file_hasher,
        &env_at_execution_start,
        opts.overrides.clone(),
        fingerprint,
    );

    let cache_opts = CacheOpts {
        cache_dir: AnchoredSystemPathBuf::from_raw(".nx/cache/tasks")
            .expect("static cache path is relative"),
        workers: opts.parallel.max(2) as u32,
        remote_read_only: false,
    };
    let fs_cache = FsCache::new(repo_root, &cache_opts.cache_dir)?;
    let async_cache = AsyncCache::new(
        CacheMultiplexer::new(fs_cache, None, cache_opts.remote_read_only),
        cache_opts.workers as usize,
    );
    let run_cache = Arc::new(RunCache::new(
        async_cache,
        repo_root,
        RunCacheOpts {
            reads_disabled: !opts.cache_enabled,
            writes_disabled: !opts.cache_enabled,
        },
    ));

    let bus = Arc::new(LifecycleBus::new());
    let reporter = reporter::TerminalReporter::spawn(bus.subscribe(), opts.verbose);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let signal_handler = SignalHandler::for_ctrl_c();
    if let Some(subscriber) = signal_handler.subscribe() {
        tokio::spawn(async move {
            let _guard = subscriber.listen().await;
            cancel_tx.send(true).ok();
        });
    }

    let manager = ProcessManager::infer();
    let runner = Runner::new(
        repo_root,
        &workspace.graph,
        engine,
        &opts,
        run_cache.clone(),
        hasher,
        manager,
        bus.clone(),
    );
    let outcome = runner.run(cancel_rx).await?;

    // flush pending cache writes before reporting completion
    drop(bus);
    if let Ok(run_cache) = Arc::try_unwrap(run_cache).map_err(|_| ()) {
        run_cache.shutdown().await;
    }
    reporter.finish(&outcome).await;

    Ok(outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use nxpath::AbsoluteSystemPathBuf;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: AbsoluteSystemPathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
            Self { _dir: dir, root }
        }

        fn write(&self, path: &str, contents: &str) {
            let file = self.root.resolve(
                &nxpath::RelativeUnixPathBuf::new(path)
                    .unwrap()
                    .to_system(),
            );
            file.parent().unwrap().create_dir_all().unwrap();
            file.create_with_contents(contents).unwrap();
        }

        /// Two projects, `b` imports `a`; builds produce files under
        /// `dist/` and are cacheable; rule `build -> ^build`.
        fn seed_two_projects(&self) {
            self.write(
                "nx.json",
                r#"{
                    "targetDefaults": {
                        "build": { "dependsOn": ["^build"], "outputs": ["dist"], "cache": true }
                    }
                }"#,
            );
            self.write(
                "tsconfig.base.json",
                r#"{ "compilerOptions": { "paths": { "@proj/a": ["packages/a/index.ts"] } } }"#,
            );
            self.write(
                "packages/a/project.json",
                r#"{ "name": "a", "targets": { "build": { "command": "mkdir -p dist && echo built a > dist/out.txt" } } }"#,
            );
            self.write("packages/a/index.ts", "export const a = 1;");
            self.write(
                "packages/b/project.json",
                r#"{ "name": "b", "targets": { "build": { "command": "mkdir -p dist && echo built b > dist/out.txt" } } }"#,
            );
            self.write("packages/b/index.ts", "import {a} from '@proj/a';");
        }
    }

    #[test]
    fn test_load_workspace_builds_and_caches_graph() {
        let fixture = Fixture::new();
        fixture.seed_two_projects();

        let workspace = load_workspace(&fixture.root).unwrap();
        assert_eq!(workspace.graph.nodes.len(), 2);
        assert_eq!(workspace.graph.immediate_dependencies("b"), vec!["a"]);

        // second load hits the graph cache (same hash, same graph)
        let again = load_workspace(&fixture.root).unwrap();
        assert_eq!(again.graph_hash, workspace.graph_hash);
        assert_eq!(again.graph.nodes.len(), 2);
    }

    #[test]
    fn test_initiating_specs_fan_out_and_run_one() {
        let fixture = Fixture::new();
        fixture.seed_two_projects();
        let workspace = load_workspace(&fixture.root).unwrap();

        let fan_out = initiating_specs(
            &workspace.graph,
            &["build".to_string()],
            &[],
            None,
            None,
        );
        assert_eq!(fan_out.len(), 2);

        let run_one = initiating_specs(
            &workspace.graph,
            &["b:build".to_string()],
            &[],
            None,
            None,
        );
        assert_eq!(run_one.len(), 1);
        assert_eq!(run_one[0].project, "b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_run_end_to_end_with_cache() {
        let fixture = Fixture::new();
        fixture.seed_two_projects();

        let opts = RunOpts {
            parallel: 2,
            ..Default::default()
        };
        let code = execute_run(&fixture.root, &["build".to_string()], &[], opts.clone())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(
            fixture
                .root
                .resolve(
                    &nxpath::RelativeUnixPathBuf::new("packages/a/dist/out.txt")
                        .unwrap()
                        .to_system()
                )
                .read_to_string()
                .unwrap(),
            "built a\n"
        );

        // second run: both tasks come from the cache and outputs survive
        let code = execute_run(&fixture.root, &["build".to_string()], &[], opts)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(
            fixture
                .root
                .resolve(
                    &nxpath::RelativeUnixPathBuf::new("packages/b/dist/out.txt")
                        .unwrap()
                        .to_system()
                )
                .read_to_string()
                .unwrap(),
            "built b\n"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_prerequisite_skips_dependents() {
        let fixture = Fixture::new();
        fixture.seed_two_projects();
        fixture.write(
            "packages/a/project.json",
            r#"{ "name": "a", "targets": { "build": { "command": "exit 7" } } }"#,
        );

        let code = execute_run(
            &fixture.root,
            &["build".to_string()],
            &[],
            RunOpts {
                parallel: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 1);
        // b never ran
        assert!(!fixture
            .root
            .resolve(
                &nxpath::RelativeUnixPathBuf::new("packages/b/dist/out.txt")
                    .unwrap()
                    .to_system()
            )
            .exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_target_exits_two() {
        let fixture = Fixture::new();
        fixture.seed_two_projects();
        let err = execute_run(
            &fixture.root,
            &["a:deploy".to_string()],
            &[],
            RunOpts::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
