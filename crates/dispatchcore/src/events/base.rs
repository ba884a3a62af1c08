use crate::graph::GraphId;
use crate::task::{CoreId, ProcessorId, TaskId, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DispatchEvent {
    ExecContextCreated {
        graph_id: GraphId,
        template_code: String,
        tasks: usize,
        timestamp: DateTime<Utc>,
    },
    TaskAssigned {
        graph_id: GraphId,
        task_id: TaskId,
        processor_id: ProcessorId,
        core_id: CoreId,
        timestamp: DateTime<Utc>,
    },
    TaskFinished {
        graph_id: GraphId,
        task_id: TaskId,
        state: TaskState,
        timestamp: DateTime<Utc>,
    },
    TasksSkipped {
        graph_id: GraphId,
        /// Failed or skipped task that started the cascade; `None` for
        /// vertices skipped because their ancestors can no longer all succeed.
        cause: Option<TaskId>,
        task_ids: Vec<TaskId>,
        timestamp: DateTime<Utc>,
    },
    SubProcessesExpanded {
        graph_id: GraphId,
        parent_task_id: TaskId,
        task_ids: Vec<TaskId>,
        timestamp: DateTime<Utc>,
    },
    InternalTaskProcessed {
        graph_id: GraphId,
        task_id: TaskId,
        state: TaskState,
        timestamp: DateTime<Utc>,
    },
    ExecContextStopped {
        graph_id: GraphId,
        timestamp: DateTime<Utc>,
    },
    ExecContextResumed {
        graph_id: GraphId,
        timestamp: DateTime<Utc>,
    },
    ExecContextFinished {
        graph_id: GraphId,
        timestamp: DateTime<Utc>,
    },
    TasksRecovered {
        graph_id: GraphId,
        task_ids: Vec<TaskId>,
        timestamp: DateTime<Utc>,
    },
    /// In-flight tasks put back to `NONE` because their result was dropped
    /// or their processor stayed silent too long.
    TasksReleased {
        graph_id: GraphId,
        task_ids: Vec<TaskId>,
        timestamp: DateTime<Utc>,
    },
}

impl DispatchEvent {
    pub fn graph_id(&self) -> GraphId {
        match self {
            DispatchEvent::ExecContextCreated { graph_id, .. }
            | DispatchEvent::TaskAssigned { graph_id, .. }
            | DispatchEvent::TaskFinished { graph_id, .. }
            | DispatchEvent::TasksSkipped { graph_id, .. }
            | DispatchEvent::SubProcessesExpanded { graph_id, .. }
            | DispatchEvent::InternalTaskProcessed { graph_id, .. }
            | DispatchEvent::ExecContextStopped { graph_id, .. }
            | DispatchEvent::ExecContextResumed { graph_id, .. }
            | DispatchEvent::ExecContextFinished { graph_id, .. }
            | DispatchEvent::TasksRecovered { graph_id, .. }
            | DispatchEvent::TasksReleased { graph_id, .. } => *graph_id,
        }
    }
}

/// Broadcast bus shared by every component of a dispatcher.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Sending without subscribers is not an error.
    pub fn emit(&self, event: DispatchEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(DispatchEvent::ExecContextStopped {
            graph_id: 3,
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.graph_id(), 3);
    }

    #[test]
    fn events_are_tagged_by_type() {
        let json = serde_json::to_value(DispatchEvent::ExecContextFinished {
            graph_id: 1,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(json["type"], "ExecContextFinished");
    }
}
