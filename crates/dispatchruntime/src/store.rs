//! Persistence collaborators.
//!
//! The engine treats these as synchronous, possibly failing calls. A saved
//! record must be visible to the next call with the same id.

use dashmap::DashMap;
use dispatchcore::{
    ExecContext, ExecutionGraph, GraphId, StoreError, Task, TaskId, Variable, VariableId,
};
use std::sync::atomic::{AtomicU64, Ordering};

pub trait TaskRepository: Send + Sync {
    fn next_task_id(&self) -> TaskId;
    fn load_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;
    fn save_task(&self, task: &Task) -> Result<(), StoreError>;
    /// Tasks of a graph in id (creation) order.
    fn find_by_graph(&self, graph_id: GraphId) -> Result<Vec<Task>, StoreError>;
    fn delete_by_graph(&self, graph_id: GraphId) -> Result<usize, StoreError>;
}

pub trait GraphRepository: Send + Sync {
    fn next_graph_id(&self) -> GraphId;
    fn load_exec_context(&self, id: GraphId) -> Result<Option<ExecContext>, StoreError>;
    fn save_exec_context(&self, exec_context: &ExecContext) -> Result<(), StoreError>;
    /// Replaces vertices and edges of an existing exec context.
    fn save_graph(&self, graph: &ExecutionGraph) -> Result<(), StoreError>;
    /// Ids of all exec contexts, ascending.
    fn list_ids(&self) -> Result<Vec<GraphId>, StoreError>;
    fn delete_exec_context(&self, id: GraphId) -> Result<bool, StoreError>;

    fn load_graph(&self, id: GraphId) -> Result<Option<ExecutionGraph>, StoreError> {
        Ok(self.load_exec_context(id)?.map(|ctx| ctx.graph))
    }
}

pub trait VariableRepository: Send + Sync {
    fn next_variable_id(&self) -> VariableId;
    fn load_variable(&self, id: VariableId) -> Result<Option<Variable>, StoreError>;
    fn save_variable(&self, variable: &Variable) -> Result<(), StoreError>;
    /// Exact lookup, no context walking.
    fn find_variable(
        &self,
        graph_id: GraphId,
        task_context_id: &str,
        name: &str,
    ) -> Result<Option<Variable>, StoreError>;
    /// Variables of a graph in id order.
    fn find_variables_by_graph(&self, graph_id: GraphId) -> Result<Vec<Variable>, StoreError>;
    fn delete_variables_by_graph(&self, graph_id: GraphId) -> Result<usize, StoreError>;
}

type VariableKey = (GraphId, String, String);

/// In-memory implementation of all repositories.
#[derive(Debug)]
pub struct MemoryStore {
    tasks: DashMap<TaskId, Task>,
    exec_contexts: DashMap<GraphId, ExecContext>,
    variables: DashMap<VariableId, Variable>,
    variable_index: DashMap<VariableKey, VariableId>,
    task_seq: AtomicU64,
    graph_seq: AtomicU64,
    variable_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            exec_contexts: DashMap::new(),
            variables: DashMap::new(),
            variable_index: DashMap::new(),
            task_seq: AtomicU64::new(1),
            graph_seq: AtomicU64::new(1),
            variable_seq: AtomicU64::new(1),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRepository for MemoryStore {
    fn next_task_id(&self) -> TaskId {
        self.task_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn load_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.get(&id).map(|t| t.value().clone()))
    }

    fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn find_by_graph(&self, graph_id: GraphId) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.graph_id == graph_id)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    fn delete_by_graph(&self, graph_id: GraphId) -> Result<usize, StoreError> {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| t.graph_id != graph_id);
        Ok(before - self.tasks.len())
    }
}

impl GraphRepository for MemoryStore {
    fn next_graph_id(&self) -> GraphId {
        self.graph_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn load_exec_context(&self, id: GraphId) -> Result<Option<ExecContext>, StoreError> {
        Ok(self.exec_contexts.get(&id).map(|c| c.value().clone()))
    }

    fn save_exec_context(&self, exec_context: &ExecContext) -> Result<(), StoreError> {
        self.exec_contexts.insert(exec_context.id, exec_context.clone());
        Ok(())
    }

    fn save_graph(&self, graph: &ExecutionGraph) -> Result<(), StoreError> {
        let mut ctx = self.exec_contexts.get_mut(&graph.id()).ok_or_else(|| {
            StoreError::Conflict(format!("exec context #{} does not exist", graph.id()))
        })?;
        ctx.graph = graph.clone();
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<GraphId>, StoreError> {
        let mut ids: Vec<GraphId> = self.exec_contexts.iter().map(|c| *c.key()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete_exec_context(&self, id: GraphId) -> Result<bool, StoreError> {
        Ok(self.exec_contexts.remove(&id).is_some())
    }
}

impl VariableRepository for MemoryStore {
    fn next_variable_id(&self) -> VariableId {
        self.variable_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn load_variable(&self, id: VariableId) -> Result<Option<Variable>, StoreError> {
        Ok(self.variables.get(&id).map(|v| v.value().clone()))
    }

    fn save_variable(&self, variable: &Variable) -> Result<(), StoreError> {
        let key = (
            variable.graph_id,
            variable.task_context_id.clone(),
            variable.name.clone(),
        );
        if let Some(existing) = self.variable_index.get(&key) {
            if *existing != variable.id {
                return Err(StoreError::Conflict(format!(
                    "variable '{}' already exists in context {}",
                    variable.name, variable.task_context_id
                )));
            }
        }
        self.variable_index.insert(key, variable.id);
        self.variables.insert(variable.id, variable.clone());
        Ok(())
    }

    fn find_variable(
        &self,
        graph_id: GraphId,
        task_context_id: &str,
        name: &str,
    ) -> Result<Option<Variable>, StoreError> {
        let key = (graph_id, task_context_id.to_string(), name.to_string());
        let Some(id) = self.variable_index.get(&key).map(|id| *id) else {
            return Ok(None);
        };
        self.load_variable(id)
    }

    fn find_variables_by_graph(&self, graph_id: GraphId) -> Result<Vec<Variable>, StoreError> {
        let mut vars: Vec<Variable> = self
            .variables
            .iter()
            .filter(|v| v.graph_id == graph_id)
            .map(|v| v.value().clone())
            .collect();
        vars.sort_by_key(|v| v.id);
        Ok(vars)
    }

    fn delete_variables_by_graph(&self, graph_id: GraphId) -> Result<usize, StoreError> {
        let before = self.variables.len();
        self.variables.retain(|_, v| v.graph_id != graph_id);
        self.variable_index.retain(|key, _| key.0 != graph_id);
        Ok(before - self.variables.len())
    }
}
