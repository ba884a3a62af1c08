//! Legal task transitions.
//!
//! ```text
//! NONE --assign--> IN_PROGRESS --success--> OK
//!   ^ ^                 |-------failure--> ERROR | ERROR_WITH_RECOVERY
//!   | '-----release-----'                         |
//!   |--skip--> SKIPPED                            |
//!   ^-------------------recovery reset------------'
//! ```
//!
//! `release` takes back a task whose processor result was dropped or never
//! came; it does not use up a recovery attempt.
//!
//! Every other (state, event) pair is rejected and leaves the task untouched.

use chrono::Utc;
use dispatchcore::{Assignment, CoreId, ProcessorId, Task, TaskState, TransitionError};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Assign {
        processor_id: ProcessorId,
        core_id: CoreId,
    },
    ReportSuccess {
        result: Option<String>,
    },
    ReportFailure {
        message: String,
        recoverable: bool,
    },
    Skip,
    RecoveryReset,
    Release,
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Assign { .. } => "assign",
            TaskEvent::ReportSuccess { .. } => "report_success",
            TaskEvent::ReportFailure { .. } => "report_failure",
            TaskEvent::Skip => "skip",
            TaskEvent::RecoveryReset => "recovery_reset",
            TaskEvent::Release => "release",
        }
    }
}

/// Work the caller must do after a transition has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Re-check readiness of the task's direct descendants.
    ReevaluateDescendants,
    /// Skip unfinished descendants in the task's context subtree.
    PropagateSkip,
    /// Drop the task's quota record.
    ReleaseQuota,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: TaskState,
    pub to: TaskState,
    pub effects: Vec<SideEffect>,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskStateMachine {
    max_recovery_attempts: u32,
}

impl TaskStateMachine {
    pub fn new(max_recovery_attempts: u32) -> Self {
        Self {
            max_recovery_attempts,
        }
    }

    /// Target state of `event` without touching the task.
    pub fn next_state(&self, task: &Task, event: &TaskEvent) -> Result<TaskState, TransitionError> {
        let next = match (task.state, event) {
            (TaskState::None, TaskEvent::Assign { .. }) => TaskState::InProgress,
            (TaskState::None, TaskEvent::Skip) => TaskState::Skipped,
            (TaskState::InProgress, TaskEvent::ReportSuccess { .. }) => TaskState::Ok,
            (TaskState::InProgress, TaskEvent::ReportFailure { recoverable, .. }) => {
                if *recoverable && task.recovery_attempts < self.max_recovery_attempts {
                    TaskState::ErrorWithRecovery
                } else {
                    TaskState::Error
                }
            }
            (TaskState::ErrorWithRecovery, TaskEvent::RecoveryReset) => TaskState::None,
            (TaskState::InProgress, TaskEvent::Release) => TaskState::None,
            (from, event) => {
                return Err(TransitionError {
                    task_id: task.id,
                    from,
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }

    /// Applies `event` to `task`. On error the task is not modified.
    pub fn apply(&self, task: &mut Task, event: TaskEvent) -> Result<Transition, TransitionError> {
        let from = task.state;
        let to = self.next_state(task, &event)?;
        let now = Utc::now();

        match event {
            TaskEvent::Assign {
                processor_id,
                core_id,
            } => {
                task.assignment = Some(Assignment {
                    processor_id,
                    core_id,
                });
                task.assigned_on = Some(now);
            }
            TaskEvent::ReportSuccess { result } => {
                for output in &mut task.outputs {
                    output.uploaded = true;
                }
                task.result = result;
                task.completed_on = Some(now);
            }
            TaskEvent::ReportFailure { message, .. } => {
                task.console = Some(message);
                task.completed_on = Some(now);
            }
            TaskEvent::Skip => {
                task.completed_on = Some(now);
            }
            TaskEvent::RecoveryReset => {
                task.recovery_attempts += 1;
                task.assignment = None;
                task.assigned_on = None;
                task.completed_on = None;
            }
            TaskEvent::Release => {
                task.assignment = None;
                task.assigned_on = None;
            }
        }
        task.state = to;

        Ok(Transition {
            from,
            to,
            effects: effects_of(from, to),
        })
    }

    pub fn assign(
        &self,
        task: &mut Task,
        processor_id: ProcessorId,
        core_id: CoreId,
    ) -> Result<Transition, TransitionError> {
        self.apply(
            task,
            TaskEvent::Assign {
                processor_id,
                core_id,
            },
        )
    }

    pub fn report_success(&self, task: &mut Task, result: Option<String>) -> Result<Transition, TransitionError> {
        self.apply(task, TaskEvent::ReportSuccess { result })
    }

    pub fn report_failure(
        &self,
        task: &mut Task,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Result<Transition, TransitionError> {
        self.apply(
            task,
            TaskEvent::ReportFailure {
                message: message.into(),
                recoverable,
            },
        )
    }

    pub fn skip(&self, task: &mut Task) -> Result<Transition, TransitionError> {
        self.apply(task, TaskEvent::Skip)
    }

    pub fn recovery_reset(&self, task: &mut Task) -> Result<Transition, TransitionError> {
        self.apply(task, TaskEvent::RecoveryReset)
    }

    pub fn release(&self, task: &mut Task) -> Result<Transition, TransitionError> {
        self.apply(task, TaskEvent::Release)
    }
}

fn effects_of(from: TaskState, to: TaskState) -> Vec<SideEffect> {
    let mut effects = Vec::new();
    if from == TaskState::InProgress {
        effects.push(SideEffect::ReleaseQuota);
    }
    if to.is_terminal() {
        effects.push(SideEffect::ReevaluateDescendants);
    }
    if matches!(to, TaskState::Error | TaskState::Skipped) {
        effects.push(SideEffect::PropagateSkip);
    }
    effects
}
