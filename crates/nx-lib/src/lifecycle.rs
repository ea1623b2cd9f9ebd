//! Lifecycle events and their fan-out bus.
//!
//! The runner is the only publisher; observers (terminal renderers, metrics
//! sinks) are pure consumers of immutable event values. Events flow one way
//! and carry everything an observer needs, so no observer ever reaches back
//! into the scheduler.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskResultStatus {
    Success,
    Failure,
    LocalCache,
    RemoteCache,
    LocalCacheKeptExisting,
    Skipped,
}

impl TaskResultStatus {
    pub fn is_cache_hit(&self) -> bool {
        matches!(
            self,
            TaskResultStatus::LocalCache
                | TaskResultStatus::RemoteCache
                | TaskResultStatus::LocalCacheKeptExisting
        )
    }

    /// Whether downstream tasks may proceed.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResultStatus::Success) || self.is_cache_hit()
    }
}

impl std::fmt::Display for TaskResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TaskResultStatus::Success => "success",
            TaskResultStatus::Failure => "failure",
            TaskResultStatus::LocalCache => "local-cache",
            TaskResultStatus::RemoteCache => "remote-cache",
            TaskResultStatus::LocalCacheKeptExisting => "local-cache-kept-existing",
            TaskResultStatus::Skipped => "skipped",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task: String,
    pub status: TaskResultStatus,
    pub code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub success: usize,
    pub failed: usize,
    pub cached: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

/// The event stream contract. When serialized for IPC, the variant arrives
/// under the self-describing `kind` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    StartCommand {
        initiating_project: Option<String>,
        project_names: Vec<String>,
        tasks: Vec<String>,
        args: Vec<String>,
    },
    StartTasks {
        tasks: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    PrintTaskTerminalOutput {
        task: String,
        cache_status: TaskResultStatus,
        terminal_output: String,
    },
    EndTasks {
        results: Vec<TaskResult>,
    },
    EndCommand {
        totals: RunTotals,
    },
}

/// Fan-out to any number of observers, no backpressure: delivery is bounded
/// only by the observers' own buffering.
#[derive(Debug, Default)]
pub struct LifecycleBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<LifecycleEvent>>>>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<LifecycleEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("lifecycle bus lock poisoned")
            .push(tx);
        rx
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let event = Arc::new(event);
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("lifecycle bus lock poisoned");
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = LifecycleBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(LifecycleEvent::StartTasks {
            tasks: vec!["a:build".into()],
        });

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.unwrap();
            assert!(matches!(&*event, LifecycleEvent::StartTasks { tasks } if tasks == &vec!["a:build".to_string()]));
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = LifecycleBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(LifecycleEvent::EndCommand {
            totals: RunTotals::default(),
        });
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_serialized_events_carry_kind() {
        let event = LifecycleEvent::EndTasks {
            results: vec![TaskResult {
                task: "a:build".into(),
                status: TaskResultStatus::LocalCacheKeptExisting,
                code: Some(0),
                duration_ms: 12,
            }],
        };
        insta::assert_snapshot!(serde_json::to_string_pretty(&event).unwrap(), @r###"
        {
          "kind": "endTasks",
          "results": [
            {
              "task": "a:build",
              "status": "local-cache-kept-existing",
              "code": 0,
              "durationMs": 12
            }
          ]
        }
        "###);
    }
}
