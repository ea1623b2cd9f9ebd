//! DOT rendering of the task graph.

use std::fmt::Write;

use super::{Engine, TaskNode};

impl Engine {
    pub fn dot_graph(&self) -> String {
        let mut out = String::from("digraph {\n");
        let _ = writeln!(out, "\tcompound = \"true\"");
        for task in self.tasks() {
            if let TaskNode::Task(task_id) = task {
                let _ = writeln!(out, "\t\"{task_id}\"");
            }
        }
        let mut edges: Vec<(String, String)> = self
            .task_ids()
            .flat_map(|task_id| {
                self.dependencies(task_id)
                    .into_iter()
                    .flatten()
                    .filter_map(move |dep| match dep {
                        TaskNode::Task(dep_id) => {
                            Some((task_id.to_string(), dep_id.to_string()))
                        }
                        TaskNode::Root => None,
                    })
            })
            .collect();
        edges.sort();
        for (from, to) in edges {
            let _ = writeln!(out, "\t\"{from}\" -> \"{to}\"");
        }
        out.push_str("}\n");
        out
    }
}
