use crate::graph::GraphId;
use crate::task::{TaskId, TaskState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Typed reason attached to every failure that crosses a component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingErrorKind {
    FunctionNotFound,
    ProcessNotFound,
    BrokenGraphError,
    SourceCodeIsBroken,
    VariableNotFound,
    NumberOfOutputsIsIncorrect,
    SystemError,
    TaskNotFound,
    ExecContextNotFound,
    Unimplemented,
}

impl ProcessingErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunctionNotFound => "function_not_found",
            Self::ProcessNotFound => "process_not_found",
            Self::BrokenGraphError => "broken_graph_error",
            Self::SourceCodeIsBroken => "source_code_is_broken",
            Self::VariableNotFound => "variable_not_found",
            Self::NumberOfOutputsIsIncorrect => "number_of_outputs_is_incorrect",
            Self::SystemError => "system_error",
            Self::TaskNotFound => "task_not_found",
            Self::ExecContextNotFound => "exec_context_not_found",
            Self::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for ProcessingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure produced while running an internal function or expanding a graph.
///
/// The message ends up in the console of the originating task.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ProcessingFailure {
    pub kind: ProcessingErrorKind,
    pub message: String,
}

impl ProcessingFailure {
    pub fn new(kind: ProcessingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ProcessingErrorKind::SystemError, message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Vertex for task #{0} not found in graph")]
    VertexNotFound(TaskId),

    #[error("Vertex for task #{0} already exists in graph")]
    DuplicateVertex(TaskId),

    #[error("Edge {from} -> {to} would create a cycle")]
    CycleDetected { from: TaskId, to: TaskId },

    #[error("Graph #{0} is frozen")]
    Frozen(GraphId),

    #[error("Broken graph: {0}")]
    Broken(String),
}

impl GraphError {
    pub fn kind(&self) -> ProcessingErrorKind {
        match self {
            GraphError::Frozen(_) => ProcessingErrorKind::SystemError,
            _ => ProcessingErrorKind::BrokenGraphError,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid state transition for task #{task_id}: {event} is not allowed in state {from}")]
pub struct TransitionError {
    pub task_id: TaskId,
    pub from: TaskState,
    pub event: &'static str,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage conflict: {0}")]
    Conflict(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingFailure),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task #{0} not found")]
    TaskNotFound(TaskId),

    #[error("Exec context #{0} not found")]
    ExecContextNotFound(GraphId),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    /// Maps the error onto the processing taxonomy. Anything without a
    /// dedicated reason is a `system_error`.
    pub fn kind(&self) -> ProcessingErrorKind {
        match self {
            DispatchError::Graph(e) => e.kind(),
            DispatchError::Processing(f) => f.kind,
            DispatchError::TaskNotFound(_) => ProcessingErrorKind::TaskNotFound,
            DispatchError::ExecContextNotFound(_) => ProcessingErrorKind::ExecContextNotFound,
            DispatchError::InvalidTemplate(_) => ProcessingErrorKind::SourceCodeIsBroken,
            DispatchError::Transition(_)
            | DispatchError::Store(_)
            | DispatchError::Io(_)
            | DispatchError::Serialization(_) => ProcessingErrorKind::SystemError,
        }
    }

    pub fn into_failure(self) -> ProcessingFailure {
        match self {
            DispatchError::Processing(f) => f,
            other => ProcessingFailure::new(other.kind(), other.to_string()),
        }
    }
}
