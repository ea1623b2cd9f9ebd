//! Mermaid rendering of the task graph, for docs and issue reports.

use std::fmt::Write;

use super::{Engine, TaskNode};

impl Engine {
    pub fn mermaid_graph(&self) -> String {
        let mut out = String::from("graph TD\n");
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
        if edges.is_empty() {
            for task_id in self.task_ids() {
                let _ = writeln!(out, "\t{}", mermaid_id(&task_id.to_string()));
            }
            return out;
        }
        for (from, to) in edges {
            let _ = writeln!(out, "\t{} --> {}", mermaid_id(&from), mermaid_id(&to));
        }
        out
    }
}

// Mermaid node ids cannot contain colons; label the node with the real id.
fn mermaid_id(task_id: &str) -> String {
    format!("{}[\"{task_id}\"]", task_id.replace([':', '@', '/'], "_"))
}

#[cfg(test)]
mod tests {
    use super::mermaid_id;

    #[test]
    fn test_mermaid_id_escaping() {
        assert_eq!(mermaid_id("web:build"), "web_build[\"web:build\"]");
    }
}
