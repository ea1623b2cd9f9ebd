//! `nx graph`: textual graph visualization.

use std::fmt::Write;
use std::sync::Arc;

use nxpath::AbsoluteSystemPath;

use crate::{
    cli::GraphFormat,
    engine::EngineBuilder,
    project_graph::ProjectGraph,
    run::{initiating_specs, load_workspace, RunError},
};

pub async fn graph_command(
    repo_root: &AbsoluteSystemPath,
    targets: &[String],
    format: GraphFormat,
) -> Result<i32, RunError> {
    let workspace = load_workspace(repo_root)?;

    let rendered = if targets.is_empty() {
        match format {
            GraphFormat::Dot => project_graph_dot(&workspace.graph),
            GraphFormat::Mermaid => project_graph_mermaid(&workspace.graph),
        }
    } else {
        let specs = initiating_specs(&workspace.graph, targets, &[], None, None);
        if specs.is_empty() {
            return Err(RunError::NoTasks);
        }
        let engine = Arc::new(
            EngineBuilder::new(&workspace.graph, &workspace.config)
                .with_tasks(specs)
                .build()?,
        );
        match format {
            GraphFormat::Dot => engine.dot_graph(),
            GraphFormat::Mermaid => engine.mermaid_graph(),
        }
    };

    print!("{rendered}");
    Ok(0)
}

fn project_graph_dot(graph: &ProjectGraph) -> String {
    let mut out = String::from("digraph {\n");
    for name in graph.nodes.keys() {
        let _ = writeln!(out, "\t\"{name}\"");
    }
    for name in graph.external_nodes.keys() {
        let _ = writeln!(out, "\t\"{name}\" [shape=box]");
    }
    for edges in graph.dependencies.values() {
        for edge in edges {
            let style = match edge.kind {
                crate::project_graph::EdgeKind::Static => "",
                crate::project_graph::EdgeKind::Dynamic => " [style=dashed]",
                crate::project_graph::EdgeKind::Implicit => " [style=dotted]",
            };
            let _ = writeln!(out, "\t\"{}\" -> \"{}\"{style}", edge.source, edge.target);
        }
    }
    out.push_str("}\n");
    out
}

fn project_graph_mermaid(graph: &ProjectGraph) -> String {
    let mut out = String::from("graph TD\n");
    for name in graph.nodes.keys() {
        let _ = writeln!(out, "\t{}", name.replace(['@', '/'], "_"));
    }
    for edges in graph.dependencies.values() {
        for edge in edges {
            let _ = writeln!(
                out,
                "\t{} --> {}",
                edge.source.replace(['@', '/', ':'], "_"),
                edge.target.replace(['@', '/', ':'], "_")
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_graph::{Edge, EdgeKind};

    #[test]
    fn test_project_graph_dot_render() {
        let mut graph = ProjectGraph::default();
        graph.dependencies.insert(
            "b".into(),
            vec![Edge {
                source: "b".into(),
                target: "a".into(),
                kind: EdgeKind::Dynamic,
                source_file: None,
            }],
        );
        let dot = project_graph_dot(&graph);
        assert!(dot.contains("\"b\" -> \"a\" [style=dashed]"));
    }
}
