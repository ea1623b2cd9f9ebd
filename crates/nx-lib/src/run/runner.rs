//! Task execution: consumes ready tasks from the engine, consults the
//! cache, spawns subprocesses, and emits lifecycle events.
//!
//! Per-task event order is `startTasks`, optional
//! `printTaskTerminalOutput`, then `endTasks`; skipped tasks get only the
//! `endTasks`. Failures never cross task boundaries except by marking
//! dependents skipped. Cancellation stops scheduling, interrupts running
//! children (kill after a short grace period), and preserves captured
//! output.

use std::{
    collections::HashMap,
    io::Write,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::{stream::FuturesUnordered, StreamExt};
use itertools::Itertools;
use nx_process::{ChildExit, Command, ProcessManager};
use nxpath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::cache::{CacheRestoreOutcome, RunCache, TaskCache};
use crate::{
    engine::{Engine, ExecuteError, ExecutionOptions, Message, TaskDefinition, TaskNode},
    lifecycle::{LifecycleBus, LifecycleEvent, RunTotals, TaskResult, TaskResultStatus},
    opts::RunOpts,
    project_graph::ProjectGraph,
    task_hash::{TaskHashError, TaskHasher},
    task_id::TaskId,
};

/// How long a child gets between the interrupt and the kill.
const CHILD_STOP_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Engine(#[from] ExecuteError),
    #[error(transparent)]
    Hash(#[from] TaskHashError),
    #[error("no definition recorded for task {0}")]
    MissingDefinition(String),
    #[error("task {0} references a project missing from the graph")]
    MissingProject(String),
}

#[derive(Debug)]
pub struct RunOutcome {
    pub results: Vec<TaskResult>,
    pub totals: RunTotals,
    pub canceled: bool,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.canceled {
            130
        } else if self.totals.failed > 0 {
            1
        } else {
            0
        }
    }
}

pub struct Runner<'a> {
    repo_root: &'a AbsoluteSystemPath,
    project_graph: &'a ProjectGraph,
    engine: Arc<Engine>,
    opts: &'a RunOpts,
    run_cache: Arc<RunCache>,
    hasher: TaskHasher<'a>,
    manager: ProcessManager,
    bus: Arc<LifecycleBus>,
}

impl<'a> Runner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        project_graph: &'a ProjectGraph,
        engine: Arc<Engine>,
        opts: &'a RunOpts,
        run_cache: Arc<RunCache>,
        hasher: TaskHasher<'a>,
        manager: ProcessManager,
        bus: Arc<LifecycleBus>,
    ) -> Self {
        Self {
            repo_root,
            project_graph,
            engine,
            opts,
            run_cache,
            hasher,
            manager,
            bus,
        }
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<RunOutcome, RunnerError> {
        let command_start = Instant::now();

        let task_names: Vec<String> = self
            .engine
            .task_ids()
            .map(ToString::to_string)
            .sorted()
            .collect();
        let project_names: Vec<String> = self
            .engine
            .task_ids()
            .map(|task_id| task_id.project().to_string())
            .sorted()
            .dedup()
            .collect();
        self.bus.publish(LifecycleEvent::StartCommand {
            initiating_project: self.opts.initiating_project.clone(),
            project_names,
            tasks: task_names,
            args: std::env::args().skip(1).collect(),
        });

        let (node_tx, mut node_rx) = mpsc::channel(self.opts.parallel.max(1));
        let engine_handle = tokio::spawn(
            self.engine
                .clone()
                .execute(ExecutionOptions::new(self.opts.parallel), node_tx),
        );

        let statuses: Arc<Mutex<HashMap<TaskId, TaskResultStatus>>> = Arc::default();
        let results: Arc<Mutex<Vec<TaskResult>>> = Arc::default();
        let mut executions: FuturesUnordered<tokio::task::JoinHandle<()>> =
            FuturesUnordered::new();

        let mut canceled = false;
        let mut cancel_open = true;
        loop {
            tokio::select! {
                biased;
                changed = cancel.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            canceled = true;
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
                message = node_rx.recv() => {
                    let Some(Message { info: task_id, callback }) = message else {
                        break;
                    };
                    self.visit(task_id, callback, &statuses, &results, &mut executions)?;
                }
            }
        }

        if canceled {
            debug!("cancellation requested; stopping scheduler and children");
            // dropping the receiver stops the walker from emitting more
            drop(node_rx);
            self.manager.stop().await;
        }

        while let Some(joined) = executions.next().await {
            joined.expect("task execution panicked");
        }
        match engine_handle.await.expect("engine execution panicked") {
            Ok(()) => {}
            // expected when we tore the channel down mid-walk
            Err(ExecuteError::Visitor) if canceled => {}
            Err(err) => return Err(err.into()),
        }
        self.manager.wait().await;

        let results = {
            let mut results = results.lock().expect("results lock poisoned");
            std::mem::take(&mut *results)
        };
        let mut totals = RunTotals {
            duration_ms: command_start.elapsed().as_millis() as u64,
            ..Default::default()
        };
        for result in &results {
            match result.status {
                TaskResultStatus::Success => totals.success += 1,
                TaskResultStatus::Failure => totals.failed += 1,
                TaskResultStatus::Skipped => totals.skipped += 1,
                _ => totals.cached += 1,
            }
        }
        self.bus.publish(LifecycleEvent::EndCommand { totals });

        Ok(RunOutcome {
            results,
            totals,
            canceled,
        })
    }

    fn visit(
        &self,
        task_id: TaskId,
        callback: oneshot::Sender<bool>,
        statuses: &Arc<Mutex<HashMap<TaskId, TaskResultStatus>>>,
        results: &Arc<Mutex<Vec<TaskResult>>>,
        executions: &mut FuturesUnordered<tokio::task::JoinHandle<()>>,
    ) -> Result<(), RunnerError> {
        let prerequisites: Vec<TaskId> = self
            .engine
            .dependencies(&task_id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|node| match node {
                TaskNode::Task(dep) => Some(dep.clone()),
                TaskNode::Root => None,
            })
            .collect();

        // A failed or skipped prerequisite skips this task: no
        // `startTasks`, a single `endTasks` with status skipped.
        let has_failed_prerequisite = {
            let statuses = statuses.lock().expect("status lock poisoned");
            prerequisites
                .iter()
                .any(|dep| !statuses.get(dep).map_or(false, |s| s.is_success()))
        };
        if has_failed_prerequisite {
            let result = TaskResult {
                task: task_id.to_string(),
                status: TaskResultStatus::Skipped,
                code: None,
                duration_ms: 0,
            };
            statuses
                .lock()
                .expect("status lock poisoned")
                .insert(task_id, TaskResultStatus::Skipped);
            results
                .lock()
                .expect("results lock poisoned")
                .push(result.clone());
            self.bus.publish(LifecycleEvent::EndTasks {
                results: vec![result],
            });
            callback.send(true).ok();
            return Ok(());
        }

        let definition = self
            .engine
            .task_definition(&task_id)
            .ok_or_else(|| RunnerError::MissingDefinition(task_id.to_string()))?;
        let project = self
            .project_graph
            .project(task_id.project())
            .ok_or_else(|| RunnerError::MissingProject(task_id.to_string()))?;

        // Prerequisites all succeeded, so their hashes are recorded; this
        // task's hash folds them in here.
        let (hash, _details) = self.hasher.calculate(&task_id, &definition, &prerequisites)?;

        let task_cache = self
            .run_cache
            .task_cache(&task_id, &definition, &project.root, &hash);
        let forward_live = self.opts.initiating_project.as_deref() == Some(task_id.project());

        let execution = TaskExecution {
            task_id,
            definition,
            task_cache,
            hash,
            forward_live,
            project_dir: self.repo_root.resolve(&project.root.to_system()),
            manager: self.manager.clone(),
            bus: self.bus.clone(),
            statuses: statuses.clone(),
            results: results.clone(),
            cache_enabled: self.opts.cache_enabled,
            hide_cached_output: self.opts.hide_cached_output,
        };
        executions.push(tokio::spawn(execution.execute(callback)));
        Ok(())
    }
}

struct TaskExecution {
    task_id: TaskId,
    definition: Arc<TaskDefinition>,
    task_cache: TaskCache,
    hash: String,
    forward_live: bool,
    project_dir: AbsoluteSystemPathBuf,
    manager: ProcessManager,
    bus: Arc<LifecycleBus>,
    statuses: Arc<Mutex<HashMap<TaskId, TaskResultStatus>>>,
    results: Arc<Mutex<Vec<TaskResult>>>,
    cache_enabled: bool,
    hide_cached_output: bool,
}

impl TaskExecution {
    async fn execute(self, callback: oneshot::Sender<bool>) {
        let start = Instant::now();
        self.bus.publish(LifecycleEvent::StartTasks {
            tasks: vec![self.task_id.to_string()],
        });

        if self.cache_enabled {
            match self.task_cache.restore().await {
                Ok(CacheRestoreOutcome::Hit {
                    status,
                    terminal_output,
                }) => {
                    if !self.hide_cached_output {
                        self.bus.publish(LifecycleEvent::PrintTaskTerminalOutput {
                            task: self.task_id.to_string(),
                            cache_status: status,
                            terminal_output: String::from_utf8_lossy(&terminal_output)
                                .into_owned(),
                        });
                    }
                    self.finish(status, Some(0), start, callback);
                    return;
                }
                Ok(CacheRestoreOutcome::Miss) => {}
                Err(err) => {
                    // a broken cache costs the benefit, not the run
                    warn!("cache read failed for {}: {err}", self.task_id);
                }
            }
        }

        let Some(command_line) = self.command_line() else {
            self.bus.publish(LifecycleEvent::PrintTaskTerminalOutput {
                task: self.task_id.to_string(),
                cache_status: TaskResultStatus::Failure,
                terminal_output: format!(
                    "{} declares neither a command nor a supported executor\n",
                    self.task_id
                ),
            });
            self.finish(TaskResultStatus::Failure, None, start, callback);
            return;
        };

        let command = Command::new("sh")
            .args(["-c", &command_line])
            .current_dir(self.project_dir.clone())
            .envs([("NX_TASK_HASH", self.hash.as_str())]);

        let mut child = match self.manager.spawn(command, CHILD_STOP_GRACE_PERIOD) {
            Some(Ok(child)) => child,
            Some(Err(err)) => {
                self.bus.publish(LifecycleEvent::PrintTaskTerminalOutput {
                    task: self.task_id.to_string(),
                    cache_status: TaskResultStatus::Failure,
                    terminal_output: format!("unable to spawn {}: {err}\n", self.task_id),
                });
                self.finish(TaskResultStatus::Failure, None, start, callback);
                return;
            }
            // the manager is closing: we were canceled before launch
            None => {
                self.finish(TaskResultStatus::Failure, None, start, callback);
                return;
            }
        };

        let mut captured = Vec::new();
        let exit = child
            .wait_with_piped_outputs(TaskOutputWriter {
                buffer: &mut captured,
                forward: self.forward_live,
            })
            .await
            .unwrap_or_else(|err| {
                warn!("unable to read output of {}: {err}", self.task_id);
                None
            });

        let duration_ms = start.elapsed().as_millis() as u64;
        match exit {
            Some(ChildExit::Completed(Some(0))) => {
                if self.cache_enabled {
                    if let Err(err) = self
                        .task_cache
                        .store(captured.clone(), 0, duration_ms)
                        .await
                    {
                        warn!("unable to store {} in the cache: {err}", self.task_id);
                    }
                }
                self.publish_output(TaskResultStatus::Success, &captured);
                self.finish(TaskResultStatus::Success, Some(0), start, callback);
            }
            Some(ChildExit::Completed(code)) => {
                self.publish_output(TaskResultStatus::Failure, &captured);
                self.finish(TaskResultStatus::Failure, code, start, callback);
            }
            // killed, interrupted, or lost: failed either way, with
            // whatever output was captured
            _ => {
                self.publish_output(TaskResultStatus::Failure, &captured);
                self.finish(TaskResultStatus::Failure, None, start, callback);
            }
        }
    }

    /// The shell line to run. Either an explicit `command`, or the
    /// run-commands executor's `command` option.
    fn command_line(&self) -> Option<String> {
        if let Some(command) = &self.definition.command {
            return Some(command.clone());
        }
        if self.definition.executor.as_deref() == Some("nx:run-commands") {
            if let Some(command) = self.definition.options.get("command").and_then(|v| v.as_str())
            {
                return Some(command.to_string());
            }
        }
        None
    }

    fn publish_output(&self, status: TaskResultStatus, captured: &[u8]) {
        // live-forwarded output has already reached the terminal
        if self.forward_live || captured.is_empty() {
            return;
        }
        self.bus.publish(LifecycleEvent::PrintTaskTerminalOutput {
            task: self.task_id.to_string(),
            cache_status: status,
            terminal_output: String::from_utf8_lossy(captured).into_owned(),
        });
    }

    fn finish(
        &self,
        status: TaskResultStatus,
        code: Option<i32>,
        start: Instant,
        callback: oneshot::Sender<bool>,
    ) {
        let result = TaskResult {
            task: self.task_id.to_string(),
            status,
            code,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.statuses
            .lock()
            .expect("status lock poisoned")
            .insert(self.task_id.clone(), status);
        self.results
            .lock()
            .expect("results lock poisoned")
            .push(result.clone());
        self.bus.publish(LifecycleEvent::EndTasks {
            results: vec![result],
        });
        callback.send(true).ok();
    }
}

/// Captures everything and optionally mirrors it to the live terminal.
struct TaskOutputWriter<'a> {
    buffer: &'a mut Vec<u8>,
    forward: bool,
}

impl Write for TaskOutputWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.forward {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.forward {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}
