//! Processor-facing assignment types and quota bookkeeping.

use dashmap::DashMap;
use dispatchcore::{CoreId, GraphId, ProcessorId, Task, TaskId};
use serde::{Deserialize, Serialize};

/// A poll from one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    pub processor_id: ProcessorId,
    /// Idle cores; each receives at most one task.
    pub cores: Vec<CoreId>,
    /// Maximum total weight of in-flight tasks on this processor.
    pub quota: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub core_id: CoreId,
    pub task: Task,
    pub weight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollOutcome {
    pub assigned: Vec<AssignedTask>,
    /// Set when the wall-clock budget ran out before every core was served.
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub task_id: TaskId,
    pub graph_id: GraphId,
    pub weight: u32,
}

/// In-flight task weights per processor.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    records: DashMap<ProcessorId, Vec<QuotaRecord>>,
    owners: DashMap<TaskId, ProcessorId>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `record` if the processor's sum stays within `limit`. The check
    /// and the insert happen under the processor's shard lock. A sum that
    /// overflows counts as over the limit.
    pub fn try_reserve(&self, processor_id: ProcessorId, record: QuotaRecord, limit: u32) -> bool {
        let mut records = self.records.entry(processor_id).or_default();
        let within = records
            .iter()
            .try_fold(record.weight, |sum, r| sum.checked_add(r.weight))
            .map_or(false, |total| total <= limit);
        if !within || records.iter().any(|r| r.task_id == record.task_id) {
            return false;
        }
        records.push(record);
        drop(records);
        self.owners.insert(record.task_id, processor_id);
        true
    }

    /// Drops the record of `task_id`, returning its weight.
    pub fn release(&self, task_id: TaskId) -> Option<u32> {
        let (_, processor_id) = self.owners.remove(&task_id)?;
        let mut records = self.records.get_mut(&processor_id)?;
        let idx = records.iter().position(|r| r.task_id == task_id)?;
        Some(records.swap_remove(idx).weight)
    }

    pub fn current(&self, processor_id: ProcessorId) -> u32 {
        self.records.get(&processor_id).map_or(0, |r| {
            r.iter().fold(0u32, |sum, r| sum.saturating_add(r.weight))
        })
    }

    /// In-flight tasks of `graph_id` on `processor_id`.
    pub fn graph_count(&self, processor_id: ProcessorId, graph_id: GraphId) -> usize {
        self.records
            .get(&processor_id)
            .map_or(0, |r| r.iter().filter(|r| r.graph_id == graph_id).count())
    }

    pub fn release_graph(&self, graph_id: GraphId) -> usize {
        let mut released = 0;
        for mut entry in self.records.iter_mut() {
            let before = entry.len();
            entry.retain(|r| r.graph_id != graph_id);
            released += before - entry.len();
        }
        self.owners.retain(|task_id, processor_id| {
            self.records
                .get(processor_id)
                .map_or(false, |r| r.iter().any(|r| r.task_id == *task_id))
        });
        released
    }
}
