use crate::graph::GraphId;
use crate::variable::VariableId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type TaskId = u64;
pub type ProcessorId = Uuid;
pub type CoreId = u32;

/// Execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    None,
    InProgress,
    Ok,
    Error,
    ErrorWithRecovery,
    Skipped,
}

impl TaskState {
    /// `OK`, `ERROR` and `SKIPPED` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Skipped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::InProgress => "IN_PROGRESS",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::ErrorWithRecovery => "ERROR_WITH_RECOVERY",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Where a function runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionContext {
    /// Executed by a remote processor.
    #[default]
    External,
    /// Executed by the dispatcher itself.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub code: String,
    #[serde(default)]
    pub context: FunctionContext,
}

impl FunctionRef {
    pub fn external(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            context: FunctionContext::External,
        }
    }

    pub fn internal(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            context: FunctionContext::Internal,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.context == FunctionContext::Internal
    }
}

/// Binding of a task input or output to a concrete variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableBinding {
    pub id: VariableId,
    pub name: String,
    pub task_context_id: String,
    /// Set once the value has been written.
    pub uploaded: bool,
}

/// Processor and core currently holding the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub processor_id: ProcessorId,
    pub core_id: CoreId,
}

/// A leaf unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub graph_id: GraphId,
    pub state: TaskState,
    pub process_code: String,
    pub task_context_id: String,
    pub function: FunctionRef,
    pub inputs: Vec<VariableBinding>,
    pub outputs: Vec<VariableBinding>,
    pub params: serde_json::Value,
    pub tag: Option<String>,
    pub assignment: Option<Assignment>,
    pub assigned_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub console: Option<String>,
    /// How many times a recovery sweep has put this task back into `NONE`.
    pub recovery_attempts: u32,
}

impl Task {
    pub fn new(
        id: TaskId,
        graph_id: GraphId,
        process_code: impl Into<String>,
        task_context_id: impl Into<String>,
        function: FunctionRef,
    ) -> Self {
        Self {
            id,
            graph_id,
            state: TaskState::None,
            process_code: process_code.into(),
            task_context_id: task_context_id.into(),
            function,
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: serde_json::Value::Null,
            tag: None,
            assignment: None,
            assigned_on: None,
            completed_on: None,
            result: None,
            console: None,
            recovery_attempts: 0,
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn is_internal(&self) -> bool {
        self.function.is_internal()
    }

    pub fn find_output(&self, name: &str) -> Option<&VariableBinding> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn find_input(&self, name: &str) -> Option<&VariableBinding> {
        self.inputs.iter().find(|i| i.name == name)
    }
}
