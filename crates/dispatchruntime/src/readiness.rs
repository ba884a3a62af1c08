//! Which vertices may run.
//!
//! A vertex is ready when its task is `NONE` and every direct ancestor is
//! `OK`. The finish vertex only needs its ancestors to be terminal. While a
//! root is still `NONE`, only roots are offered.

use dispatchcore::context::is_within;
use dispatchcore::{ExecutionGraph, Task, TaskId, TaskState, FINISH_PROCESS_CODE};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Ready tasks in id order.
    pub ready: Vec<TaskId>,
    /// `NONE` tasks whose ancestors are all terminal but not all `OK`; they
    /// can never run and must be skipped.
    pub blocked: Vec<TaskId>,
}

enum Verdict {
    Ready,
    Blocked,
    Waiting,
}

fn verdict(graph: &ExecutionGraph, tasks: &BTreeMap<TaskId, Task>, task: &Task) -> Verdict {
    if task.state != TaskState::None {
        return Verdict::Waiting;
    }
    let mut all_ok = true;
    let mut all_terminal = true;
    for ancestor in graph.find_direct_ancestors(task.id) {
        match tasks.get(&ancestor.task_id).map(|t| t.state) {
            Some(TaskState::Ok) => {}
            Some(s) if s.is_terminal() => all_ok = false,
            _ => {
                all_ok = false;
                all_terminal = false;
            }
        }
    }
    if task.process_code == FINISH_PROCESS_CODE {
        return if all_terminal { Verdict::Ready } else { Verdict::Waiting };
    }
    match (all_ok, all_terminal) {
        (true, _) => Verdict::Ready,
        (false, true) => Verdict::Blocked,
        (false, false) => Verdict::Waiting,
    }
}

pub fn evaluate(graph: &ExecutionGraph, tasks: &BTreeMap<TaskId, Task>) -> Readiness {
    let pending_roots: Vec<TaskId> = graph
        .roots()
        .into_iter()
        .filter(|v| tasks.get(&v.task_id).map_or(false, |t| t.state == TaskState::None))
        .map(|v| v.task_id)
        .collect();
    if !pending_roots.is_empty() {
        return Readiness {
            ready: pending_roots,
            blocked: Vec::new(),
        };
    }

    let mut readiness = Readiness::default();
    for vertex in graph.vertices() {
        let Some(task) = tasks.get(&vertex.task_id) else {
            continue;
        };
        match verdict(graph, tasks, task) {
            Verdict::Ready => readiness.ready.push(task.id),
            Verdict::Blocked => readiness.blocked.push(task.id),
            Verdict::Waiting => {}
        }
    }
    readiness
}

/// Whether `task_id` is in the ready set [`evaluate`] would return.
pub fn is_ready(graph: &ExecutionGraph, tasks: &BTreeMap<TaskId, Task>, task_id: TaskId) -> bool {
    evaluate(graph, tasks).ready.contains(&task_id)
}

/// `NONE` descendants of `failed` inside its context subtree, excluding the
/// leaf.
pub fn skip_targets(graph: &ExecutionGraph, tasks: &BTreeMap<TaskId, Task>, failed: &Task) -> Vec<TaskId> {
    graph
        .find_descendants(failed.id)
        .into_iter()
        .filter(|v| !graph.is_leaf(v.task_id))
        .filter(|v| is_within(&v.task_context_id, &failed.task_context_id))
        .filter(|v| tasks.get(&v.task_id).map_or(false, |t| t.state == TaskState::None))
        .map(|v| v.task_id)
        .collect()
}

pub fn index(tasks: Vec<Task>) -> BTreeMap<TaskId, Task> {
    tasks.into_iter().map(|t| (t.id, t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatchcore::{FunctionRef, TaskVertex};
    use pretty_assertions::assert_eq;

    struct Fixture {
        graph: ExecutionGraph,
        tasks: BTreeMap<TaskId, Task>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                graph: ExecutionGraph::new(1),
                tasks: BTreeMap::new(),
            }
        }

        fn add(&mut self, id: TaskId, code: &str, ctx: &str, parents: &[TaskId]) {
            self.graph.add_vertex(TaskVertex::new(id, ctx)).unwrap();
            for p in parents {
                self.graph.add_edge(*p, id).unwrap();
            }
            self.tasks.insert(id, Task::new(id, 1, code, ctx, FunctionRef::external("f")));
        }

        fn set(&mut self, id: TaskId, state: TaskState) {
            self.tasks.get_mut(&id).unwrap().state = state;
        }

        fn ready(&self) -> Vec<TaskId> {
            evaluate(&self.graph, &self.tasks).ready
        }
    }

    #[test]
    fn linear_chain_releases_one_step_at_a_time() {
        let mut f = Fixture::new();
        f.add(1, "a", "1", &[]);
        f.add(2, "b", "1", &[1]);
        f.add(3, "c", "1", &[2]);
        assert_eq!(f.ready(), vec![1]);
        f.set(1, TaskState::Ok);
        assert_eq!(f.ready(), vec![2]);
        assert!(!is_ready(&f.graph, &f.tasks, 3));
    }

    #[test]
    fn pending_root_holds_back_other_vertices() {
        let mut f = Fixture::new();
        f.add(1, "a", "1", &[]);
        f.add(2, "b", "1", &[]);
        f.add(3, "c", "1", &[2]);
        f.set(2, TaskState::Ok);
        assert_eq!(f.ready(), vec![1]);
        assert!(is_ready(&f.graph, &f.tasks, 1));
        assert!(!is_ready(&f.graph, &f.tasks, 3));
        f.set(1, TaskState::Ok);
        assert!(is_ready(&f.graph, &f.tasks, 3));
    }

    #[test]
    fn and_join_waits_for_every_ancestor() {
        let mut f = Fixture::new();
        f.add(1, "p", "1", &[]);
        f.add(2, "x", "1,2#1", &[1]);
        f.add(3, "y", "1,3#1", &[1]);
        f.add(4, "d", "1", &[2, 3]);
        f.set(1, TaskState::Ok);
        f.set(2, TaskState::Ok);
        assert_eq!(f.ready(), vec![3]);
        f.set(3, TaskState::Ok);
        assert_eq!(f.ready(), vec![4]);
    }

    #[test]
    fn failed_ancestor_blocks_but_finish_still_runs() {
        let mut f = Fixture::new();
        f.add(1, "a", "1", &[]);
        f.add(2, "b", "1", &[1]);
        f.add(3, FINISH_PROCESS_CODE, "1", &[1, 2]);
        f.set(1, TaskState::Error);
        let r = evaluate(&f.graph, &f.tasks);
        assert_eq!(r.ready, Vec::<TaskId>::new());
        assert_eq!(r.blocked, vec![2]);
        f.set(2, TaskState::Skipped);
        assert_eq!(f.ready(), vec![3]);
    }

    #[test]
    fn skip_targets_stay_inside_failing_context() {
        let mut f = Fixture::new();
        f.add(1, "p", "1", &[]);
        f.add(2, "x1", "1,2#1", &[1]);
        f.add(3, "x2", "1,2#1", &[2]);
        f.add(4, "next", "1", &[3]);
        f.add(5, FINISH_PROCESS_CODE, "1", &[4]);
        let failed = f.tasks[&2].clone();
        assert_eq!(skip_targets(&f.graph, &f.tasks, &failed), vec![3]);
        let root = f.tasks[&1].clone();
        assert_eq!(skip_targets(&f.graph, &f.tasks, &root), vec![2, 3, 4]);
    }
}
