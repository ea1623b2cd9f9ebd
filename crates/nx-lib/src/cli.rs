//! The thin CLI shim over the core. Argument parsing stays here; all the
//! actual work happens in `run` and `commands`.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use nxpath::AbsoluteSystemPathBuf;
use tracing_subscriber::EnvFilter;

use crate::{config::WORKSPACE_CONFIG_FILENAME, opts::RunOpts, run};

#[derive(Debug, Parser)]
#[command(name = "nx", version, about = "Task orchestrator for monorepos")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
    /// Increase log output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbosity: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one or more targets. `target` fans out over every project that
    /// declares it; `project:target` runs one project.
    Run {
        #[arg(required = true)]
        targets: Vec<String>,
        /// Limit a fanned-out target to these projects.
        #[arg(long, value_delimiter = ',')]
        projects: Vec<String>,
        /// Named configuration to run the targets with.
        #[arg(long)]
        configuration: Option<String>,
        /// Maximum number of tasks run concurrently.
        #[arg(long)]
        parallel: Option<usize>,
        /// Ignore the task cache for this run.
        #[arg(long)]
        skip_cache: bool,
        /// Do not replay terminal output for cache hits.
        #[arg(long)]
        hide_cached_output: bool,
        /// Only run targets on projects affected since this base ref.
        #[arg(long)]
        base: Option<String>,
    },
    /// Print the project graph (or, with --targets, the task graph).
    Graph {
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,
        #[arg(long, value_enum, default_value = "dot")]
        format: GraphFormat,
    },
    /// Sync the root tsconfig.json project references with the graph.
    Sync,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum GraphFormat {
    #[default]
    Dot,
    Mermaid,
}

/// Entry point used by the `nx` binary. Returns the process exit code.
pub fn main() -> i32 {
    let args = Args::parse();
    init_tracing(args.verbosity);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("unable to start the runtime: {err}");
            return 1;
        }
    };
    runtime.block_on(dispatch(args))
}

fn init_tracing(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "warn",
        1 => "nx=info,warn",
        2 => "nx=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(args: Args) -> i32 {
    let repo_root = match find_workspace_root() {
        Ok(root) => root,
        Err(message) => {
            eprintln!("{message}");
            return 2;
        }
    };

    let result = match args.command {
        Command::Run {
            targets,
            projects,
            configuration,
            parallel,
            skip_cache,
            hide_cached_output,
            base,
        } => {
            let opts = RunOpts {
                parallel: parallel.unwrap_or_else(|| num_cpus::get().max(1)).max(1),
                cache_enabled: !skip_cache,
                hide_cached_output,
                verbose: args.verbosity > 0,
                configuration,
                initiating_project: None,
                base,
                overrides: serde_json::Value::Null,
            };
            run::execute_run(&repo_root, &targets, &projects, opts).await
        }
        Command::Graph { targets, format } => {
            crate::commands::graph::graph_command(&repo_root, &targets, format).await
        }
        Command::Sync => crate::commands::sync::sync_command(&repo_root).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            code
        }
    }
}

/// The workspace root is the nearest ancestor with an `nx.json`; with none
/// anywhere, the current directory is taken as a single-project workspace.
fn find_workspace_root() -> Result<AbsoluteSystemPathBuf, String> {
    let cwd = AbsoluteSystemPathBuf::cwd()
        .map_err(|err| format!("unable to determine the working directory: {err}"))?;
    for dir in cwd.ancestors() {
        if dir.join_component(WORKSPACE_CONFIG_FILENAME).is_file() {
            return Ok(dir.to_owned());
        }
    }
    Ok(cwd)
}
