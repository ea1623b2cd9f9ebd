use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::log::trace;

/// A ready node plus the callback the caller fires once it has processed it.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

/// Emits the nodes of a DAG in dependency order: a node is handed out only
/// after every node it points at (its `Outgoing` neighbors) has been marked
/// done, so leaves come first.
///
/// Rather than giving every node its own task, a single coordinator keeps a
/// count of unfinished dependencies per node and a FIFO queue of nodes whose
/// count has reached zero. Completions arrive through per-node oneshot
/// callbacks and unblock dependents by decrementing their counts.
pub struct Walker<N> {
    /// Unfinished dependency count per node.
    blockers: HashMap<N, usize>,
    /// Reverse adjacency: who is waiting on this node.
    dependents: HashMap<N, Vec<N>>,
    /// Node order as the graph declared it; ties in readiness resolve to
    /// the earlier node.
    order: Vec<N>,
}

impl<N: Eq + Hash + Copy + Send + 'static> Walker<N> {
    /// Captures the graph's topology. The graph must not change afterwards:
    /// the walk runs against this snapshot.
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let order: Vec<N> = graph.node_identifiers().collect();
        let mut blockers = HashMap::with_capacity(order.len());
        let mut dependents: HashMap<N, Vec<N>> = HashMap::with_capacity(order.len());
        for &node in &order {
            let mut count = 0;
            for dependency in graph.neighbors_directed(node, Direction::Outgoing) {
                count += 1;
                dependents.entry(dependency).or_default().push(node);
            }
            blockers.insert(node, count);
        }
        Self {
            blockers,
            dependents,
            order,
        }
    }

    /// Starts the walk. The receiver yields nodes as they become ready; the
    /// caller fires each node's callback to unblock its dependents. A
    /// dropped callback counts as done, so a sloppy caller cannot wedge the
    /// walk.
    pub fn walk(self) -> (WalkHandle, mpsc::Receiver<WalkMessage<N>>) {
        let Self {
            mut blockers,
            mut dependents,
            order,
        } = self;

        // Sized so that emitting every node without a single completion
        // still cannot block the coordinator.
        let (node_tx, node_rx) = mpsc::channel(order.len().max(1));
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ready: VecDeque<N> = order
                .into_iter()
                .filter(|node| blockers[node] == 0)
                .collect();
            let mut in_flight: FuturesUnordered<_> = FuturesUnordered::new();

            loop {
                while let Some(node) = ready.pop_front() {
                    let (done_tx, done_rx) = oneshot::channel::<()>();
                    if node_tx.send((node, done_tx)).await.is_err() {
                        // The caller dropped the receiver; nothing left to
                        // drive.
                        trace!("walk receiver dropped before the walk finished");
                        return;
                    }
                    in_flight.push(async move {
                        // Err means the callback was dropped; either way the
                        // node no longer blocks anything.
                        done_rx.await.ok();
                        node
                    });
                }

                if in_flight.is_empty() {
                    // Nothing ready and nothing running: every reachable
                    // node has been walked.
                    return;
                }

                tokio::select! {
                    biased;
                    _ = cancel_rx.recv() => {
                        // Stop emitting. Callbacks for nodes already handed
                        // out stay with the caller.
                        trace!("walk canceled");
                        return;
                    }
                    Some(finished) = in_flight.next() => {
                        for dependent in dependents.remove(&finished).unwrap_or_default() {
                            let count = blockers
                                .get_mut(&dependent)
                                .expect("dependents only reference known nodes");
                            *count -= 1;
                            if *count == 0 {
                                ready.push_back(dependent);
                            }
                        }
                    }
                }
            }
        });

        (
            WalkHandle {
                cancel: cancel_tx,
                task,
            },
            node_rx,
        )
    }
}

/// Controls a running walk.
pub struct WalkHandle {
    cancel: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl WalkHandle {
    /// Stops the walk from emitting further nodes. Nodes already handed to
    /// the caller are unaffected. Safe to call more than once.
    pub fn cancel(&self) {
        // A full or closed channel means cancellation is already under way.
        self.cancel.try_send(()).ok();
    }

    /// Waits for the coordinator to wind down.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod test {
    use petgraph::Graph;

    use super::*;

    /// b:build -> a:build, the smallest dependency chain a run produces.
    #[tokio::test]
    async fn test_dependency_emitted_before_dependent() {
        let mut g = Graph::new();
        let a_build = g.add_node("a:build");
        let b_build = g.add_node("b:build");
        g.add_edge(b_build, a_build, ());

        let (handle, mut nodes) = Walker::new(&g).walk();
        let mut order = Vec::new();
        while let Some((node, done)) = nodes.recv().await {
            order.push(g[node]);
            done.send(()).unwrap();
        }
        handle.wait().await.unwrap();
        assert_eq!(order, vec!["a:build", "b:build"]);
    }

    /// A diamond: app:build needs ui:build and core:build, which both need
    /// codegen. The shared leaf must come first and the top last; the two
    /// middles may interleave.
    #[tokio::test]
    async fn test_diamond_orders_shared_leaf_first() {
        let mut g = Graph::new();
        let codegen = g.add_node("shared:codegen");
        let ui = g.add_node("ui:build");
        let core = g.add_node("core:build");
        let app = g.add_node("app:build");
        g.add_edge(ui, codegen, ());
        g.add_edge(core, codegen, ());
        g.add_edge(app, ui, ());
        g.add_edge(app, core, ());

        let (handle, mut nodes) = Walker::new(&g).walk();
        let mut order = Vec::new();
        while let Some((node, done)) = nodes.recv().await {
            order.push(g[node]);
            done.send(()).unwrap();
        }
        handle.wait().await.unwrap();

        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "shared:codegen");
        assert_eq!(order[3], "app:build");
    }

    /// Cancelling after the first emission must not release the rest of the
    /// chain, and the coordinator must wind down cleanly.
    #[tokio::test]
    async fn test_cancel_stops_further_emissions() {
        let mut g = Graph::new();
        let lint = g.add_node("a:lint");
        let build = g.add_node("a:build");
        let e2e = g.add_node("a:e2e");
        g.add_edge(build, lint, ());
        g.add_edge(e2e, build, ());

        let (handle, mut nodes) = Walker::new(&g).walk();
        let (first, done) = nodes.recv().await.unwrap();
        assert_eq!(g[first], "a:lint");
        handle.cancel();
        handle.cancel(); // idempotent
        done.send(()).ok();

        assert!(nodes.recv().await.is_none(), "no emissions after cancel");
    }

    /// Dropping a node's callback counts as completing it; dependents still
    /// unblock.
    #[tokio::test]
    async fn test_dropped_callback_unblocks_dependents() {
        let mut g = Graph::new();
        let fetch = g.add_node("deps:fetch");
        let install = g.add_node("deps:install");
        g.add_edge(install, fetch, ());

        let (handle, mut nodes) = Walker::new(&g).walk();
        let mut seen = Vec::new();
        while let Some((node, done)) = nodes.recv().await {
            seen.push(g[node]);
            drop(done);
        }
        handle.wait().await.unwrap();
        assert_eq!(seen, vec!["deps:fetch", "deps:install"]);
    }

    /// Independent roots all get emitted even when completions come back in
    /// an arbitrary order.
    #[tokio::test]
    async fn test_independent_tasks_all_emitted() {
        let mut g: Graph<&str, ()> = Graph::new();
        for name in ["a:test", "b:test", "c:test"] {
            g.add_node(name);
        }

        let (handle, mut nodes) = Walker::new(&g).walk();
        let mut messages = Vec::new();
        while let Some(message) = nodes.recv().await {
            messages.push(message);
            if messages.len() == 3 {
                // complete in reverse order of emission
                while let Some((_, done)) = messages.pop() {
                    done.send(()).unwrap();
                }
            }
        }
        handle.wait().await.unwrap();
    }
}
