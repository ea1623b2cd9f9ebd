use std::sync::Arc;

use futures::{stream::FuturesUnordered, StreamExt};
use nx_graph_utils::Walker;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace};

use super::{Engine, TaskNode};
use crate::task_id::TaskId;

/// A ready task handed to the visitor, with a callback the visitor fires
/// when it finishes processing the task.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

type VisitorData = TaskId;
/// `false` from the visitor stops scheduling of further tasks.
type VisitorResult = bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("engine visitor closed channel before walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<VisitorData, VisitorResult>>> for ExecuteError {
    fn from(_: mpsc::error::SendError<Message<VisitorData, VisitorResult>>) -> Self {
        ExecuteError::Visitor
    }
}

impl Engine {
    /// Walks the task graph, sending each task to the visitor once its
    /// prerequisites have been processed, with at most `concurrency` tasks
    /// outstanding at any instant. The permit for a task is held until the
    /// visitor fires its callback, so the budget covers actual execution,
    /// not just dispatch.
    ///
    /// A `false` callback value stops new tasks from being scheduled;
    /// whatever is in flight finishes on its own terms.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions { concurrency } = options;
        let sema = Arc::new(Semaphore::new(concurrency));
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walk, mut nodes) = Walker::new(&self.task_graph).walk();
        let walk = Arc::new(walk);

        while let Some((node_id, done)) = nodes.recv().await {
            let visitor = visitor.clone();
            let sema = sema.clone();
            let walk = walk.clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let TaskNode::Task(task_id) = this
                    .task_graph
                    .node_weight(node_id)
                    .expect("node id should be present")
                else {
                    // the root node has nothing to run
                    if done.send(()).is_err() {
                        debug!("walker done callback closed before the root was marked");
                    }
                    return Ok(());
                };

                let _permit = sema
                    .acquire()
                    .await
                    .expect("semaphore closed while tasks are still running");

                let (message, result) = Message::new(task_id.clone());
                visitor.send(message).await?;

                let keep_going = result.await.unwrap_or_else(|_| {
                    // a dropped callback counts as the task being finished
                    trace!("visitor dropped callback without a result");
                    true
                });
                if !keep_going {
                    walk.cancel();
                }
                if done.send(()).is_err() {
                    debug!("walk done receiver closed before node finished");
                }
                Ok(())
            }));
        }

        while let Some(res) = tasks.next().await {
            res.expect("unable to join task")?;
        }

        Ok(())
    }
}
