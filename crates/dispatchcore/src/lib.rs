//! Core data model of the dispatcher
//!
//! Tasks, task context ids, the execution graph and its mutation engine,
//! process-graph templates, variables and the error taxonomy. Nothing in this
//! crate does I/O or holds locks.

pub mod context;
mod error;
pub mod events;
mod exec_context;
mod graph;
mod task;
mod template;
mod value;
mod variable;

pub use error::{
    DispatchError, GraphError, ProcessingErrorKind, ProcessingFailure, StoreError, TransitionError,
};
pub use events::*;
pub use exec_context::{ExecContext, ExecContextState};
pub use graph::{Edge, ExecutionGraph, GraphId, GraphMutationResult, GraphSnapshot, TaskVertex};
pub use task::{
    Assignment, CoreId, FunctionContext, FunctionRef, ProcessorId, Task, TaskId, TaskState,
    VariableBinding,
};
pub use template::{
    PipelineTemplate, ProcessDefinition, ProcessGraphTemplate, SubProcessLogic, SubProcesses,
    FINISH_PROCESS_CODE,
};
pub use value::Value;
pub use variable::{Variable, VariableHandle, VariableId};

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;
