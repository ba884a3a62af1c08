use crate::graph::GraphId;
use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type VariableId = u64;

/// A named value scoped to a task context of one run.
///
/// Variables are created uninitialised together with the task that produces
/// them and filled in later, either by a processor upload or by an internal
/// function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: VariableId,
    pub graph_id: GraphId,
    pub name: String,
    pub task_context_id: String,
    pub value: Option<Value>,
    pub uploaded_on: Option<DateTime<Utc>>,
}

impl Variable {
    pub fn uninitialized(
        id: VariableId,
        graph_id: GraphId,
        name: impl Into<String>,
        task_context_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            graph_id,
            name: name.into(),
            task_context_id: task_context_id.into(),
            value: None,
            uploaded_on: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    pub fn set(&mut self, value: Value) {
        self.value = Some(value);
        self.uploaded_on = Some(Utc::now());
    }

    pub fn handle(&self) -> VariableHandle {
        VariableHandle {
            id: self.id,
            name: self.name.clone(),
            task_context_id: self.task_context_id.clone(),
        }
    }
}

/// Result of a successful variable lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableHandle {
    pub id: VariableId,
    pub name: String,
    pub task_context_id: String,
}
