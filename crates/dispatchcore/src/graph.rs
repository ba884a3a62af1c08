//! Execution graph of one pipeline run.
//!
//! Vertices reference tasks; an edge `a -> b` means `b` waits for `a`. The
//! graph owns topology only, task state lives in [`Task`](crate::Task).

use crate::error::GraphError;
use crate::task::{TaskId, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;

pub type GraphId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskVertex {
    pub task_id: TaskId,
    pub task_context_id: String,
}

impl TaskVertex {
    pub fn new(task_id: TaskId, task_context_id: impl Into<String>) -> Self {
        Self {
            task_id,
            task_context_id: task_context_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: TaskId,
    pub to: TaskId,
}

impl Edge {
    pub fn new(from: TaskId, to: TaskId) -> Self {
        Self { from, to }
    }
}

/// What a successful mutation added to the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphMutationResult {
    pub inserted_vertices: Vec<TaskId>,
    pub inserted_edges: Vec<Edge>,
    pub removed_edges: Vec<Edge>,
}

/// Serializable view of a graph, used for persistence and inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub graph_id: GraphId,
    pub vertices: Vec<TaskVertex>,
    pub edges: Vec<Edge>,
}

/// Adjacency-list DAG.
///
/// Both directions are indexed so that ancestor and descendant lookups are
/// O(degree). Ordered collections keep iteration deterministic, which the
/// dispatch loop relies on for FIFO ordering inside a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGraph {
    id: GraphId,
    vertices: BTreeMap<TaskId, TaskVertex>,
    descendants: BTreeMap<TaskId, BTreeSet<TaskId>>,
    ancestors: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl ExecutionGraph {
    pub fn new(id: GraphId) -> Self {
        Self {
            id,
            vertices: BTreeMap::new(),
            descendants: BTreeMap::new(),
            ancestors: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.vertices.contains_key(&task_id)
    }

    pub fn vertex(&self, task_id: TaskId) -> Option<&TaskVertex> {
        self.vertices.get(&task_id)
    }

    /// Vertices in task id order.
    pub fn vertices(&self) -> impl Iterator<Item = &TaskVertex> {
        self.vertices.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.descendants
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| Edge::new(*from, *to)))
    }

    pub fn add_vertex(&mut self, vertex: TaskVertex) -> Result<(), GraphError> {
        if self.vertices.contains_key(&vertex.task_id) {
            return Err(GraphError::DuplicateVertex(vertex.task_id));
        }
        self.descendants.entry(vertex.task_id).or_default();
        self.ancestors.entry(vertex.task_id).or_default();
        self.vertices.insert(vertex.task_id, vertex);
        Ok(())
    }

    /// Adds `from -> to`. Returns `false` if the edge already existed.
    ///
    /// The cycle check runs before the edge is added: a cycle exists iff
    /// `from` is reachable from `to`.
    pub fn add_edge(&mut self, from: TaskId, to: TaskId) -> Result<bool, GraphError> {
        if !self.contains(from) {
            return Err(GraphError::VertexNotFound(from));
        }
        if !self.contains(to) {
            return Err(GraphError::VertexNotFound(to));
        }
        if from == to || self.reaches(to, from) {
            return Err(GraphError::CycleDetected { from, to });
        }
        let added = self.descendants.entry(from).or_default().insert(to);
        self.ancestors.entry(to).or_default().insert(from);
        Ok(added)
    }

    fn remove_edge(&mut self, from: TaskId, to: TaskId) -> bool {
        let removed = self
            .descendants
            .get_mut(&from)
            .map(|tos| tos.remove(&to))
            .unwrap_or(false);
        if let Some(froms) = self.ancestors.get_mut(&to) {
            froms.remove(&from);
        }
        removed
    }

    fn reaches(&self, start: TaskId, target: TaskId) -> bool {
        let mut stack = vec![start];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = self.descendants.get(&current) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    fn collect(&self, ids: impl IntoIterator<Item = TaskId>) -> Vec<&TaskVertex> {
        ids.into_iter().filter_map(|id| self.vertices.get(&id)).collect()
    }

    pub fn find_direct_descendants(&self, task_id: TaskId) -> Vec<&TaskVertex> {
        match self.descendants.get(&task_id) {
            Some(ids) => self.collect(ids.iter().copied()),
            None => Vec::new(),
        }
    }

    pub fn find_direct_ancestors(&self, task_id: TaskId) -> Vec<&TaskVertex> {
        match self.ancestors.get(&task_id) {
            Some(ids) => self.collect(ids.iter().copied()),
            None => Vec::new(),
        }
    }

    /// Transitive descendants of `task_id`, excluding the task itself, in
    /// task id order.
    pub fn find_descendants(&self, task_id: TaskId) -> Vec<&TaskVertex> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<TaskId> = self
            .descendants
            .get(&task_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        while let Some(current) = queue.pop_front() {
            if !found.insert(current) {
                continue;
            }
            if let Some(next) = self.descendants.get(&current) {
                queue.extend(next.iter().copied());
            }
        }
        self.collect(found)
    }

    pub fn roots(&self) -> Vec<&TaskVertex> {
        self.vertices
            .values()
            .filter(|v| self.ancestors.get(&v.task_id).map_or(true, BTreeSet::is_empty))
            .collect()
    }

    pub fn leaves(&self) -> Vec<&TaskVertex> {
        self.vertices
            .values()
            .filter(|v| self.is_leaf(v.task_id))
            .collect()
    }

    pub fn is_leaf(&self, task_id: TaskId) -> bool {
        self.contains(task_id)
            && self
                .descendants
                .get(&task_id)
                .map_or(true, BTreeSet::is_empty)
    }

    /// Leaves whose task has not reached a terminal state. A leaf whose state
    /// is unknown counts as unfinished.
    pub fn find_unfinished_leaves<F>(&self, state_of: F) -> Vec<&TaskVertex>
    where
        F: Fn(TaskId) -> Option<TaskState>,
    {
        self.leaves()
            .into_iter()
            .filter(|v| !state_of(v.task_id).map_or(false, |s| s.is_terminal()))
            .collect()
    }

    /// Atomically adds `vertices` and `edges` below `parent`.
    ///
    /// Fails without touching the graph if the parent is missing, a vertex is
    /// a duplicate, an edge references an unknown vertex, or an edge would
    /// close a cycle.
    pub fn insert_subgraph(
        &mut self,
        parent: TaskId,
        vertices: Vec<TaskVertex>,
        edges: Vec<Edge>,
    ) -> Result<GraphMutationResult, GraphError> {
        let mut staged = self.clone();
        let result = staged.insert_subgraph_in_place(parent, vertices, edges)?;
        *self = staged;
        Ok(result)
    }

    fn insert_subgraph_in_place(
        &mut self,
        parent: TaskId,
        vertices: Vec<TaskVertex>,
        edges: Vec<Edge>,
    ) -> Result<GraphMutationResult, GraphError> {
        if !self.contains(parent) {
            return Err(GraphError::Broken(format!(
                "parent vertex #{parent} does not exist in graph #{}",
                self.id
            )));
        }
        let mut result = GraphMutationResult::default();
        for vertex in vertices {
            result.inserted_vertices.push(vertex.task_id);
            self.add_vertex(vertex)?;
        }
        for edge in edges {
            if self.add_edge(edge.from, edge.to)? {
                result.inserted_edges.push(edge);
            }
        }
        Ok(result)
    }

    /// Replaces every edge `old_ancestor -> d` (for `d` in `descendants`) with
    /// edges from each of `terminals` to `d`. Atomic.
    pub fn rewire_descendants(
        &mut self,
        old_ancestor: TaskId,
        terminals: &[TaskId],
        descendants: &[TaskId],
    ) -> Result<GraphMutationResult, GraphError> {
        let mut staged = self.clone();
        let result = staged.rewire_in_place(old_ancestor, terminals, descendants)?;
        *self = staged;
        Ok(result)
    }

    fn rewire_in_place(
        &mut self,
        old_ancestor: TaskId,
        terminals: &[TaskId],
        descendants: &[TaskId],
    ) -> Result<GraphMutationResult, GraphError> {
        if !self.contains(old_ancestor) {
            return Err(GraphError::VertexNotFound(old_ancestor));
        }
        let mut result = GraphMutationResult::default();
        for &descendant in descendants {
            if self.remove_edge(old_ancestor, descendant) {
                result.removed_edges.push(Edge::new(old_ancestor, descendant));
            }
            for &terminal in terminals {
                if self.add_edge(terminal, descendant)? {
                    result.inserted_edges.push(Edge::new(terminal, descendant));
                }
            }
        }
        Ok(result)
    }

    /// `insert_subgraph` followed by `rewire_descendants`, committed only if
    /// both succeed.
    pub fn splice(
        &mut self,
        parent: TaskId,
        vertices: Vec<TaskVertex>,
        edges: Vec<Edge>,
        terminals: &[TaskId],
        descendants: &[TaskId],
    ) -> Result<GraphMutationResult, GraphError> {
        let mut staged = self.clone();
        let mut result = staged.insert_subgraph_in_place(parent, vertices, edges)?;
        let rewired = staged.rewire_in_place(parent, terminals, descendants)?;
        result.inserted_edges.extend(rewired.inserted_edges);
        result.removed_edges = rewired.removed_edges;
        *self = staged;
        Ok(result)
    }

    /// Kahn ordering; ties broken by task id.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        let mut in_degree: BTreeMap<TaskId, usize> = self
            .vertices
            .keys()
            .map(|id| (*id, self.ancestors.get(id).map_or(0, BTreeSet::len)))
            .collect();
        let mut ready: BTreeSet<TaskId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.vertices.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for next in self.descendants.get(&id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*next);
                    }
                }
            }
        }
        if order.len() != self.vertices.len() {
            return Err(GraphError::Broken(format!(
                "graph #{} contains a cycle",
                self.id
            )));
        }
        Ok(order)
    }

    /// Full structural check: every edge endpoint exists and there is no cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        for edge in self.edges() {
            if !self.contains(edge.from) {
                return Err(GraphError::VertexNotFound(edge.from));
            }
            if !self.contains(edge.to) {
                return Err(GraphError::VertexNotFound(edge.to));
            }
        }
        self.topological_order().map(|_| ())
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            graph_id: self.id,
            vertices: self.vertices.values().cloned().collect(),
            edges: self.edges().collect(),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, GraphError> {
        let mut graph = Self::new(snapshot.graph_id);
        for vertex in snapshot.vertices {
            graph.add_vertex(vertex)?;
        }
        for edge in snapshot.edges {
            graph.add_edge(edge.from, edge.to)?;
        }
        Ok(graph)
    }

    /// Graphviz rendering, labelled with task id, context and optionally state.
    pub fn to_dot<F>(&self, label: F) -> String
    where
        F: Fn(&TaskVertex) -> String,
    {
        let mut out = format!("digraph exec_context_{} {{\n", self.id);
        for vertex in self.vertices.values() {
            let _ = writeln!(
                out,
                "    t{} [label=\"{}\"];",
                vertex.task_id,
                label(vertex).replace('"', "\\\"")
            );
        }
        for edge in self.edges() {
            let _ = writeln!(out, "    t{} -> t{};", edge.from, edge.to);
        }
        out.push('}');
        out.push('\n');
        out
    }
}
