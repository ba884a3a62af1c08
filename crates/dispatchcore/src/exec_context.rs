use crate::error::GraphError;
use crate::graph::{ExecutionGraph, GraphId};
use crate::template::ProcessGraphTemplate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Run-level state of an exec context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecContextState {
    Started,
    /// No new assignment or expansion until resumed.
    Stopped,
    /// Terminal; the graph is frozen.
    Finished,
}

impl fmt::Display for ExecContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::Finished => "FINISHED",
        })
    }
}

/// One pipeline run: its graph plus the template it was produced from.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub id: GraphId,
    pub state: ExecContextState,
    pub graph: ExecutionGraph,
    pub template: Arc<ProcessGraphTemplate>,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl ExecContext {
    pub fn new(id: GraphId, template: Arc<ProcessGraphTemplate>) -> Self {
        Self {
            id,
            state: ExecContextState::Started,
            graph: ExecutionGraph::new(id),
            template,
            created_on: Utc::now(),
            completed_on: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.state == ExecContextState::Started
    }

    pub fn is_finished(&self) -> bool {
        self.state == ExecContextState::Finished
    }

    /// Fails with `Frozen` once the run has finished.
    pub fn ensure_mutable(&self) -> Result<(), GraphError> {
        if self.is_finished() {
            return Err(GraphError::Frozen(self.id));
        }
        Ok(())
    }

    pub fn finish(&mut self) {
        self.state = ExecContextState::Finished;
        self.completed_on = Some(Utc::now());
    }
}
