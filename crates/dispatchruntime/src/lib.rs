//! Dispatcher runtime
//!
//! This crate turns the data model of `dispatchcore` into a running
//! dispatcher: storage, per-region locking, the task state machine,
//! readiness and assignment, sub-process expansion, internal functions and
//! the bounded internal-task executor.

pub mod condition;
mod config;
mod dispatcher;
mod engine;
mod executor;
mod expansion;
pub mod readiness;
mod registry;
mod runtime;
mod state_machine;
mod store;
pub mod sync;
mod variables;

pub use config::{ConfigError, RuntimeConfig};
pub use dispatcher::{AssignedTask, PollOutcome, PollRequest, QuotaRecord, QuotaTracker};
pub use engine::{Engine, ExecResult, ReportOutcome};
pub use executor::{InternalExecutor, InternalTaskProcessor};
pub use expansion::{ExpansionService, Staged};
pub use registry::{FunctionOutput, FunctionRegistry, InternalContext, InternalFunction, SubProcessInstance};
pub use runtime::Orchestrator;
pub use state_machine::{SideEffect, TaskEvent, TaskStateMachine, Transition};
pub use store::{GraphRepository, MemoryStore, TaskRepository, VariableRepository};
pub use variables::VariableService;
