//! Bounded pool of per-graph internal-task drain loops.
//!
//! A fixed-size array of slots binds graphs to drain loops. A graph's queue
//! is drained by exactly one loop at a time; graphs queued while every slot
//! is taken wait for a free slot instead of spawning more work.

use async_trait::async_trait;
use dispatchcore::{GraphId, TaskId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Runs one internal task and returns the internal tasks it made ready.
#[async_trait]
pub trait InternalTaskProcessor: Send + Sync {
    async fn process_internal_task(&self, graph_id: GraphId, task_id: TaskId) -> Vec<TaskId>;
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Option<GraphId>>,
    queues: HashMap<GraphId, VecDeque<TaskId>>,
    waiting: VecDeque<GraphId>,
}

impl PoolState {
    fn slot_of(&self, graph_id: GraphId) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(graph_id))
    }

    fn is_busy(&self, graph_id: GraphId) -> bool {
        self.slot_of(graph_id).is_some()
            || self.waiting.contains(&graph_id)
            || self.queues.get(&graph_id).map_or(false, |q| !q.is_empty())
    }
}

pub struct InternalExecutor {
    processor: Arc<dyn InternalTaskProcessor>,
    state: Mutex<PoolState>,
    drained: Notify,
}

impl InternalExecutor {
    pub fn new(processor: Arc<dyn InternalTaskProcessor>, max_executors: usize) -> Arc<Self> {
        let state = PoolState {
            slots: vec![None; max_executors.max(1)],
            ..PoolState::default()
        };
        Arc::new(Self {
            processor,
            state: Mutex::new(state),
            drained: Notify::new(),
        })
    }

    /// Queues `task_id`. A task already waiting in the queue is not added
    /// twice.
    pub fn submit(self: &Arc<Self>, graph_id: GraphId, task_id: TaskId) {
        let spawn_slot = {
            let mut state = self.state.lock();
            let queue = state.queues.entry(graph_id).or_default();
            if queue.contains(&task_id) {
                return;
            }
            queue.push_back(task_id);

            if state.slot_of(graph_id).is_some() || state.waiting.contains(&graph_id) {
                None
            } else if let Some(free) = state.slots.iter().position(Option::is_none) {
                state.slots[free] = Some(graph_id);
                Some(free)
            } else {
                tracing::debug!("All internal executors busy, graph #{} waits", graph_id);
                state.waiting.push_back(graph_id);
                None
            }
        };

        if let Some(slot) = spawn_slot {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drain(slot, graph_id).await });
        }
    }

    async fn drain(self: Arc<Self>, slot: usize, mut graph_id: GraphId) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.queues.get_mut(&graph_id).and_then(VecDeque::pop_front) {
                    Some(task_id) => Some(task_id),
                    None => {
                        state.queues.remove(&graph_id);
                        match state.waiting.pop_front() {
                            Some(waiting) => {
                                state.slots[slot] = Some(waiting);
                                graph_id = waiting;
                            }
                            None => state.slots[slot] = None,
                        }
                        None
                    }
                }
            };

            match next {
                Some(task_id) => {
                    let follow_ups = self.processor.process_internal_task(graph_id, task_id).await;
                    if !follow_ups.is_empty() {
                        let mut state = self.state.lock();
                        let queue = state.queues.entry(graph_id).or_default();
                        for id in follow_ups {
                            if !queue.contains(&id) {
                                queue.push_back(id);
                            }
                        }
                    }
                }
                None => {
                    self.drained.notify_waiters();
                    if self.state.lock().slots[slot].is_none() {
                        return;
                    }
                }
            }
        }
    }

    pub fn is_busy(&self, graph_id: GraphId) -> bool {
        self.state.lock().is_busy(graph_id)
    }

    /// Waits until `graph_id` has no queued or running internal task.
    pub async fn wait_until_drained(&self, graph_id: GraphId) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_busy(graph_id) {
                return;
            }
            notified.await;
        }
    }

    /// Drops queued work of a deleted graph. A task already running finishes.
    pub fn forget(&self, graph_id: GraphId) {
        let mut state = self.state.lock();
        state.queues.remove(&graph_id);
        state.waiting.retain(|g| *g != graph_id);
    }

    /// Graphs currently bound to a slot.
    pub fn active_graphs(&self) -> Vec<GraphId> {
        self.state.lock().slots.iter().flatten().copied().collect()
    }
}
