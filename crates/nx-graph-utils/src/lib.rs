//! Graph utilities shared by the project graph and the task graph.
//! Provides transitive closure computation, cycle detection that reports the
//! offending path, and a concurrency-aware DAG walker.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::prelude::*;
use thiserror::Error;
pub use walker::{WalkHandle, WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cyclic dependency detected: {}", path.iter().join(" -> "))]
    CyclicDependencies { path: Vec<String> },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

impl Error {
    /// The node names participating in the reported cycle.
    pub fn cycle_path(&self) -> &[String] {
        match self {
            Error::CyclicDependencies { path } => path,
            Error::SelfDependency(_) => &[],
        }
    }
}

/// Nodes reachable from `starts` along edges in `direction`, including the
/// starting nodes themselves. `Outgoing` walks toward dependencies,
/// `Incoming` toward dependents.
pub fn transitive_closure<N: Hash + Eq, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, ()>,
    starts: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut pending: Vec<NodeIndex> = starts.into_iter().collect();
    let mut reached: HashSet<NodeIndex> = pending.iter().copied().collect();

    while let Some(index) = pending.pop() {
        for neighbor in graph.neighbors_directed(index, direction) {
            if reached.insert(neighbor) {
                pending.push(neighbor);
            }
        }
    }

    reached
        .into_iter()
        .filter_map(|index| graph.node_weight(index))
        .collect()
}

/// Finds every strongly connected component with more than one node and
/// extracts an actual cycle path from each. The returned paths close on
/// themselves: following an edge from the last node reaches the first.
pub fn cycles<N, E>(graph: &Graph<N, E>) -> Vec<Vec<NodeIndex>> {
    petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .map(|scc| cycle_path_in_scc(graph, &scc))
        .collect()
}

// Walks edges restricted to the SCC until a node on the current path repeats,
// then returns the loop portion of the path.
fn cycle_path_in_scc<N, E>(graph: &Graph<N, E>, scc: &[NodeIndex]) -> Vec<NodeIndex> {
    let members: HashSet<_> = scc.iter().copied().collect();
    let mut path = vec![scc[0]];

    loop {
        let current = *path.last().expect("path is never empty");
        let next = graph
            .neighbors_directed(current, Direction::Outgoing)
            .find(|n| members.contains(n))
            .expect("every SCC node has an out-edge within its SCC");
        if let Some(loop_start) = path.iter().position(|&n| n == next) {
            return path.split_off(loop_start);
        }
        path.push(next);
    }
}

/// Validates that the graph has no cycles and no self edges. On failure the
/// error carries the offending path.
pub fn validate_graph<N: Display + Hash + Eq, E>(graph: &Graph<N, E>) -> Result<(), Error> {
    if let Some(cycle) = cycles(graph).into_iter().next() {
        let path = cycle
            .into_iter()
            .map(|ix| {
                graph
                    .node_weight(ix)
                    .expect("cycle nodes come from the graph")
                    .to_string()
            })
            .collect();
        return Err(Error::CyclicDependencies { path });
    }

    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cycle_path_is_a_cycle() {
        /*
         a -> b -> c -> d
              ^____/
        */
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, b, ());
        g.add_edge(c, d, ());

        let err = validate_graph(&g).unwrap_err();
        let path = err.cycle_path().to_vec();
        // The reported path must be a real cycle in the inputs.
        assert_eq!(path.len(), 2);
        assert!(path.contains(&"b".to_string()) && path.contains(&"c".to_string()));
        for pair in path.windows(2) {
            assert!(g
                .edge_indices()
                .map(|e| g.edge_endpoints(e).unwrap())
                .any(|(s, t)| g[s] == pair[0] && g[t] == pair[1]));
        }
    }

    #[test]
    fn test_longer_cycle_reported_in_order() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());

        let err = validate_graph(&g).unwrap_err();
        let path = err.cycle_path();
        assert_eq!(path.len(), 3);
        // Following each consecutive pair, plus the wrap-around edge, stays in
        // the graph.
        let has_edge = |s: &str, t: &str| {
            g.edge_indices()
                .map(|e| g.edge_endpoints(e).unwrap())
                .any(|(from, to)| g[from] == s && g[to] == t)
        };
        for pair in path.windows(2) {
            assert!(has_edge(&pair[0], &pair[1]));
        }
        assert!(has_edge(&path[path.len() - 1], &path[0]));
    }

    #[test]
    fn test_self_dependency() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());
        let err = validate_graph(&g).unwrap_err();
        assert!(matches!(err, Error::SelfDependency(node) if node == "a"));
    }

    #[test]
    fn test_acyclic_ok() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());
        g.add_edge(b, c, ());
        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_transitive_closure() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(d, c, ());

        let deps = transitive_closure(&g, Some(a), Direction::Outgoing);
        assert_eq!(deps, ["a", "b", "c"].iter().collect());
        let dependents = transitive_closure(&g, Some(c), Direction::Incoming);
        assert_eq!(dependents, ["a", "b", "c", "d"].iter().collect());
    }
}
