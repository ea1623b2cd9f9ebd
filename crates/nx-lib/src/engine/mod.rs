//! The task graph engine: expansion of requested targets into a task DAG
//! and concurrency-bounded execution over it.

mod builder;
mod dot;
mod execute;
mod mermaid;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

pub use builder::{BuilderError, EngineBuilder, TaskSpec};
pub use execute::{ExecuteError, ExecutionOptions, Message};
use petgraph::Graph;
use serde::Serialize;

use crate::task_id::{TargetDependencySpec, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId),
}

impl From<TaskId> for TaskNode {
    fn from(value: TaskId) -> Self {
        Self::Task(value)
    }
}

impl std::fmt::Display for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task) => task.fmt(f),
        }
    }
}

/// A task's fully resolved definition: target configuration merged with
/// `targetDefaults`, the chosen configuration overlaid, and option
/// interpolations substituted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskDefinition {
    pub command: Option<String>,
    pub executor: Option<String>,
    pub options: serde_json::Value,
    pub depends_on: Vec<TargetDependencySpec>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub cache: bool,
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: petgraph::graph::NodeIndex,
    task_lookup: HashMap<TaskId, petgraph::graph::NodeIndex>,
    task_definitions: HashMap<TaskId, Arc<TaskDefinition>>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_definitions: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId) -> petgraph::graph::NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    /// Marks a task as an entry point of this run.
    pub fn connect_to_root(&mut self, task_id: &TaskId) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, ());
    }

    pub fn add_dependency(&mut self, task_id: &TaskId, prerequisite: &TaskId) {
        let from = self.get_index(task_id);
        let to = self.get_index(prerequisite);
        self.task_graph.add_edge(from, to, ());
    }

    pub fn add_definition(
        &mut self,
        task_id: TaskId,
        definition: Arc<TaskDefinition>,
    ) -> Option<Arc<TaskDefinition>> {
        self.task_definitions.insert(task_id, definition)
    }

    pub fn has_task(&self, task_id: &TaskId) -> bool {
        self.task_lookup.contains_key(task_id)
    }

    // Seals the task graph from being mutated
    pub fn seal(self) -> Engine<Built> {
        let Engine {
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
            ..
        } = self;
        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    /// Direct prerequisites of a task.
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    /// Tasks that directly depend on this one.
    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("node index should be present")
                })
                .collect(),
        )
    }

    pub fn task_definition(&self, task_id: &TaskId) -> Option<Arc<TaskDefinition>> {
        self.task_definitions.get(task_id).cloned()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.task_graph.node_weights()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks().filter_map(|task| match task {
            TaskNode::Task(task_id) => Some(task_id),
            TaskNode::Root => None,
        })
    }

    pub fn task_count(&self) -> usize {
        self.task_lookup.len()
    }

    /// Validates that the graph is a DAG; a cycle is reported with its
    /// offending path before anything runs.
    pub fn validate(&self) -> Result<(), BuilderError> {
        nx_graph_utils::validate_graph(&self.task_graph).map_err(|err| match err {
            nx_graph_utils::Error::CyclicDependencies { path } => BuilderError::Cycle { path },
            nx_graph_utils::Error::SelfDependency(task) => BuilderError::Cycle { path: vec![task] },
        })
    }
}
