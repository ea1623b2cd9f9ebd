//! Terminal observer of the lifecycle bus.
//!
//! The reporter is a pure sink: it renders events and keeps its own little
//! state machine (nothing here feeds back into the scheduler).

use std::sync::Arc;

use console::style;
use tokio::{sync::mpsc, task::JoinHandle};

use super::runner::RunOutcome;
use crate::lifecycle::{LifecycleEvent, TaskResultStatus};

pub struct TerminalReporter {
    handle: JoinHandle<()>,
}

impl TerminalReporter {
    pub fn spawn(
        mut events: mpsc::UnboundedReceiver<Arc<LifecycleEvent>>,
        verbose: bool,
    ) -> Self {
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                render(&event, verbose);
            }
        });
        Self { handle }
    }

    /// Waits for the event stream to drain, then prints the closing
    /// summary for failures and cancellations.
    pub async fn finish(self, outcome: &RunOutcome) {
        self.handle.await.ok();

        if outcome.canceled {
            let cancelled: Vec<&str> = outcome
                .results
                .iter()
                .filter(|result| result.status == TaskResultStatus::Failure)
                .map(|result| result.task.as_str())
                .collect();
            eprintln!();
            eprintln!(
                "{} {} completed, {} cancelled, {} skipped",
                style("Cancelled:").yellow().bold(),
                outcome.totals.success + outcome.totals.cached,
                cancelled.len(),
                outcome.totals.skipped,
            );
            for task in cancelled {
                eprintln!("   {} {}", style("-").yellow(), task);
            }
            return;
        }

        if outcome.totals.failed > 0 {
            let failed: Vec<&str> = outcome
                .results
                .iter()
                .filter(|result| result.status == TaskResultStatus::Failure)
                .map(|result| result.task.as_str())
                .collect();
            eprintln!();
            eprintln!(
                "{} {} task(s) failed:",
                style("✖").red().bold(),
                failed.len()
            );
            for task in &failed {
                eprintln!("   {} {}", style("✖").red(), task);
            }
            eprintln!("   rerun with {} for full hash details", style("--verbose").bold());
        }
    }
}

fn render(event: &LifecycleEvent, verbose: bool) {
    match event {
        LifecycleEvent::StartCommand {
            tasks,
            project_names,
            ..
        } => {
            println!(
                "{} {} task(s) for {} project(s)",
                style(">").dim(),
                tasks.len(),
                project_names.len()
            );
        }
        LifecycleEvent::StartTasks { tasks } => {
            for task in tasks {
                println!("{} {}", style("> nx run").cyan().bold(), style(task).bold());
            }
        }
        LifecycleEvent::PrintTaskTerminalOutput {
            task,
            cache_status,
            terminal_output,
        } => {
            if cache_status.is_cache_hit() {
                println!(
                    "{} {} {}",
                    style(">").dim(),
                    style(task).bold(),
                    style(format!("[{cache_status}]")).dim()
                );
            }
            print!("{terminal_output}");
            if !terminal_output.ends_with('\n') {
                println!();
            }
        }
        LifecycleEvent::EndTasks { results } => {
            for result in results {
                match result.status {
                    TaskResultStatus::Failure => {
                        let code = result
                            .code
                            .map(|code| format!(" (exit {code})"))
                            .unwrap_or_default();
                        println!("{} {}{code}", style("✖").red().bold(), result.task);
                    }
                    TaskResultStatus::Skipped => {
                        println!("{} {} skipped", style("-").dim(), style(&result.task).dim());
                    }
                    status if verbose => {
                        println!(
                            "{} {} [{}] {}ms",
                            style("✔").green(),
                            result.task,
                            status,
                            result.duration_ms
                        );
                    }
                    _ => {
                        println!("{} {}", style("✔").green(), result.task);
                    }
                }
            }
        }
        LifecycleEvent::EndCommand { totals } => {
            println!();
            println!(
                "{} {} succeeded, {} from cache, {} failed, {} skipped {}",
                style("Ran tasks:").bold(),
                totals.success,
                totals.cached,
                totals.failed,
                totals.skipped,
                style(format!("({}ms)", totals.duration_ms)).dim()
            );
        }
    }
}
