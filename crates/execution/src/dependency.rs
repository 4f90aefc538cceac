//! Dependency graphs for submitted work.
//!
//! [`DependencyGraph`] is only consulted at submission time: cycles and
//! dangling references are rejected before any execution is created. At
//! dispatch time the engine checks the recorded dependencies directly.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use taskmill_core::{TaskId, TaskSpec};

/// A dependency cycle. `members` lists the nodes on the cycle in edge order;
/// a self-dependency has a single member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError<K> {
    /// Nodes on the cycle
    pub members: Vec<K>,
}

impl<K: fmt::Display> fmt::Display for CycleError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dependency cycle: ")?;
        for member in &self.members {
            write!(f, "{} -> ", member)?;
        }
        match self.members.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

impl<K: fmt::Debug + fmt::Display> std::error::Error for CycleError<K> {}

/// A directed graph where an edge `a -> b` means "a depends on b".
///
/// Edges pointing at keys that were never added as nodes are kept but
/// treated as already satisfied by [`DependencyGraph::topological_order`].
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    /// node -> [dependencies]
    graph: HashMap<K, Vec<K>>,
    /// node -> [dependents]
    reverse: HashMap<K, Vec<K>>,
    /// Insertion order, for deterministic output
    order: Vec<K>,
}

impl<K> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self {
            graph: HashMap::new(),
            reverse: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> DependencyGraph<K> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `node` with the given dependencies. Adding a node twice merges
    /// its dependency lists.
    pub fn add_node(&mut self, node: K, dependencies: impl IntoIterator<Item = K>) {
        if !self.graph.contains_key(&node) {
            self.order.push(node.clone());
        }
        let deps = self.graph.entry(node.clone()).or_default();
        for dep in dependencies {
            if deps.contains(&dep) {
                continue;
            }
            deps.push(dep.clone());
            self.reverse.entry(dep).or_default().push(node.clone());
        }
    }

    /// Whether `node` was added.
    pub fn contains(&self, node: &K) -> bool {
        self.graph.contains_key(node)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct dependencies of `node`.
    pub fn dependencies(&self, node: &K) -> &[K] {
        self.graph.get(node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Nodes that depend directly on `node`.
    pub fn dependents(&self, node: &K) -> &[K] {
        self.reverse.get(node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Dependencies that are not nodes of this graph, per node.
    pub fn external_dependencies(&self) -> Vec<(&K, &K)> {
        self.order
            .iter()
            .flat_map(|node| {
                self.dependencies(node)
                    .iter()
                    .filter(|dep| !self.graph.contains_key(*dep))
                    .map(move |dep| (node, dep))
            })
            .collect()
    }

    /// Nodes ordered so every node comes after its dependencies (Kahn's
    /// algorithm, ties broken by insertion order).
    pub fn topological_order(&self) -> Result<Vec<K>, CycleError<K>> {
        let mut in_degree: HashMap<&K, usize> = self
            .order
            .iter()
            .map(|node| {
                let internal = self
                    .dependencies(node)
                    .iter()
                    .filter(|dep| self.graph.contains_key(*dep))
                    .count();
                (node, internal)
            })
            .collect();

        let mut ready: VecDeque<&K> = self
            .order
            .iter()
            .filter(|node| in_degree.get(node).copied() == Some(0))
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(node) = ready.pop_front() {
            sorted.push(node.clone());
            for dependent in self.dependents(node) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() == self.order.len() {
            return Ok(sorted);
        }

        let members = self.find_cycle().unwrap_or_else(|| {
            let done: HashSet<&K> = sorted.iter().collect();
            self.order
                .iter()
                .filter(|node| !done.contains(node))
                .cloned()
                .collect()
        });
        Err(CycleError { members })
    }

    /// Find one cycle by depth-first search over internal edges.
    pub fn find_cycle(&self) -> Option<Vec<K>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&K, Mark> = HashMap::new();

        for start in &self.order {
            if marks.contains_key(start) {
                continue;
            }
            marks.insert(start, Mark::Visiting);
            let mut stack: Vec<(&K, usize)> = vec![(start, 0)];

            while let Some(&(node, next)) = stack.last() {
                let deps = self.dependencies(node);
                if next >= deps.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let dep = &deps[next];
                if !self.graph.contains_key(dep) {
                    continue;
                }
                match marks.get(dep) {
                    Some(Mark::Visiting) => {
                        let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                        return Some(stack[from..].iter().map(|(n, _)| (*n).clone()).collect());
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep, Mark::Visiting);
                        stack.push((dep, 0));
                    }
                }
            }
        }
        None
    }
}

/// One node of a graph submission: a task plus the task ids it waits on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    /// The task itself
    #[serde(flatten)]
    pub spec: TaskSpec,

    /// Tasks of the same graph that must complete first
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
}

impl GraphNode {
    /// Node without dependencies.
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            depends_on: Vec::new(),
        }
    }

    /// Wait on another task of the graph.
    pub fn after(mut self, task_id: impl Into<TaskId>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }
}

/// A batch of tasks related by task-id dependencies, submitted atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    /// Nodes in submission order
    pub nodes: Vec<GraphNode>,
}

impl TaskGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node.
    pub fn node(mut self, node: GraphNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// The task-level dependency graph.
    pub fn dependency_graph(&self) -> DependencyGraph<TaskId> {
        let mut graph = DependencyGraph::new();
        for node in &self.nodes {
            graph.add_node(node.spec.task_id.clone(), node.depends_on.iter().cloned());
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&'static str, &[&'static str])]) -> DependencyGraph<&'static str> {
        let mut g = DependencyGraph::new();
        for (node, deps) in edges {
            g.add_node(*node, deps.iter().copied());
        }
        g
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let g = graph(&[("deploy", &["test", "build"]), ("test", &["build"]), ("build", &[])]);
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["build", "test", "deploy"]);
        assert_eq!(g.dependents(&"build"), &["deploy", "test"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b", "c"])]);
        let err = g.topological_order().unwrap_err();
        assert_eq!(err.members, vec!["c"]);
        assert_eq!(err.to_string(), "dependency cycle: c -> c");
    }

    #[test]
    fn test_longer_cycle_reports_members() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        let mut members = g.topological_order().unwrap_err().members;
        members.sort();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_external_dependencies_do_not_block_ordering() {
        let g = graph(&[("a", &["elsewhere"]), ("b", &["a"])]);
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b"]);
        assert_eq!(g.external_dependencies(), vec![(&"a", &"elsewhere")]);
    }

    #[test]
    fn test_duplicate_edges_are_merged() {
        let mut g = DependencyGraph::new();
        g.add_node(1, [2, 2]);
        g.add_node(1, [2, 3]);
        assert_eq!(g.len(), 1);
        assert_eq!(g.dependencies(&1), &[2, 3]);
    }

    #[test]
    fn test_task_graph_deserializes_flat_nodes() {
        let graph: TaskGraph = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"task_id": "build", "workflow_type": "command"},
                {"task_id": "test", "workflow_type": "command", "depends_on": ["build"], "timeout": 30}
            ]
        }))
        .unwrap();

        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[1].depends_on, vec![TaskId::from("build")]);
        assert_eq!(
            graph.dependency_graph().topological_order().unwrap(),
            vec![TaskId::from("build"), TaskId::from("test")]
        );
    }
}
