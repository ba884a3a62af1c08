use async_trait::async_trait;
use dispatchcore::{
    DispatchError, DispatchEvent, ExecContextState, FunctionRef, GraphError, GraphId,
    PipelineTemplate, ProcessDefinition, ProcessingErrorKind, ProcessingFailure, SubProcessLogic,
    TaskState, Value, FINISH_PROCESS_CODE,
};
use dispatchruntime::{
    ExecResult, FunctionOutput, FunctionRegistry, InternalContext, InternalFunction, Orchestrator,
    PollRequest, ReportOutcome, RuntimeConfig,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Finish;

#[async_trait]
impl InternalFunction for Finish {
    fn code(&self) -> &str {
        FINISH_PROCESS_CODE
    }

    async fn process(&self, _ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
        Ok(FunctionOutput::done())
    }
}

struct Group;

/// Writes `x` and, when `extra` is set, an output the task doesn't declare.
struct WriteX {
    extra: bool,
}

#[async_trait]
impl InternalFunction for WriteX {
    fn code(&self) -> &str {
        if self.extra {
            "test.write_extra"
        } else {
            "test.write"
        }
    }

    async fn process(&self, _ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
        let output = FunctionOutput::done().write("x", Value::Int(1));
        Ok(if self.extra {
            output.write("ghost", Value::Int(2))
        } else {
            output
        })
    }
}

#[async_trait]
impl InternalFunction for Group {
    fn code(&self) -> &str {
        "test.group"
    }

    async fn process(&self, _ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
        Ok(FunctionOutput::done())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn orchestrator(config: RuntimeConfig) -> Orchestrator {
    init_tracing();
    let registry = Arc::new(FunctionRegistry::new());
    registry.register(Arc::new(Finish));
    registry.register(Arc::new(Group));
    registry.register(Arc::new(WriteX { extra: false }));
    registry.register(Arc::new(WriteX { extra: true }));
    Orchestrator::with_registry(registry, config)
}

fn linear(codes: &[&str]) -> PipelineTemplate {
    codes.iter().fold(PipelineTemplate::new("linear"), |t, code| {
        t.with_process(ProcessDefinition::new(*code, FunctionRef::external("worker")))
    })
}

fn request(processor_id: Uuid, cores: u32, quota: u32) -> PollRequest {
    PollRequest {
        processor_id,
        cores: (0..cores).collect(),
        quota,
    }
}

fn state_of(orch: &Orchestrator, graph_id: GraphId, code: &str) -> TaskState {
    orch.tasks(graph_id)
        .unwrap()
        .into_iter()
        .find(|t| t.process_code == code)
        .map(|t| t.state)
        .unwrap()
}

async fn run_to_finish(orch: &Orchestrator, graph_id: GraphId) {
    let processor = Uuid::new_v4();
    for _ in 0..100 {
        orch.wait_until_drained(graph_id).await;
        if orch.exec_context_state(graph_id).unwrap() == ExecContextState::Finished {
            return;
        }
        let outcome = orch.poll(request(processor, 4, 100)).await.unwrap();
        for assigned in outcome.assigned {
            orch.report_task_result(assigned.task.id, ExecResult::ok("ok"))
                .await
                .unwrap();
        }
    }
    panic!("graph #{graph_id} did not finish");
}

#[tokio::test]
async fn linear_chain_runs_in_order() {
    let orch = orchestrator(RuntimeConfig::default());
    let graph_id = orch.create_exec_context(linear(&["a", "b", "c"]), Vec::new()).await.unwrap();
    let processor = Uuid::new_v4();

    let mut order = Vec::new();
    for _ in 0..3 {
        let outcome = orch.poll(request(processor, 2, 10)).await.unwrap();
        assert_eq!(outcome.assigned.len(), 1);
        let task = &outcome.assigned[0].task;
        assert_eq!(task.state, TaskState::InProgress);
        order.push(task.process_code.clone());
        let reported = orch.report_task_result(task.id, ExecResult::ok("ok")).await.unwrap();
        assert_eq!(reported, ReportOutcome::Recorded(TaskState::Ok));
    }
    assert_eq!(order, vec!["a", "b", "c"]);

    orch.wait_until_drained(graph_id).await;
    assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
    assert_eq!(state_of(&orch, graph_id, FINISH_PROCESS_CODE), TaskState::Ok);
}

#[tokio::test]
async fn and_join_waits_for_both_branches() {
    let orch = orchestrator(RuntimeConfig::default());
    let template = PipelineTemplate::new("join")
        .with_process(
            ProcessDefinition::new("fan", FunctionRef::internal("test.group")).with_sub_processes(
                SubProcessLogic::And,
                vec![
                    ProcessDefinition::new("x", FunctionRef::external("worker")),
                    ProcessDefinition::new("y", FunctionRef::external("worker")),
                ],
            ),
        )
        .with_process(ProcessDefinition::new("d", FunctionRef::external("worker")));
    let graph_id = orch.create_exec_context(template, Vec::new()).await.unwrap();
    orch.wait_until_drained(graph_id).await;

    let processor = Uuid::new_v4();
    let outcome = orch.poll(request(processor, 3, 10)).await.unwrap();
    assert_eq!(outcome.assigned.len(), 2);
    orch.report_task_result(outcome.assigned[0].task.id, ExecResult::ok("ok"))
        .await
        .unwrap();
    assert!(orch.find_ready_task(processor, 0, 10).await.unwrap().is_none());

    orch.report_task_result(outcome.assigned[1].task.id, ExecResult::ok("ok"))
        .await
        .unwrap();
    let d = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();
    assert_eq!(d.task.process_code, "d");

    let snapshot = orch.snapshot(graph_id).unwrap();
    let into_d = snapshot.edges.iter().filter(|e| e.to == d.task.id).count();
    assert_eq!(into_d, 2);
}

#[tokio::test]
async fn recoverable_failure_is_reset_once() {
    let orch = orchestrator(RuntimeConfig::default());
    let graph_id = orch.create_exec_context(linear(&["a", "b"]), Vec::new()).await.unwrap();
    let processor = Uuid::new_v4();

    let a = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();
    let reported = orch
        .report_task_result(a.task.id, ExecResult::failed("timeout", true))
        .await
        .unwrap();
    assert_eq!(reported, ReportOutcome::Recorded(TaskState::ErrorWithRecovery));
    assert!(orch.find_ready_task(processor, 0, 10).await.unwrap().is_none());

    assert_eq!(orch.recoverable_reset(graph_id).await.unwrap(), vec![a.task.id]);
    assert!(orch.recoverable_reset(graph_id).await.unwrap().is_empty());

    let again = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();
    assert_eq!(again.task.id, a.task.id);
    assert_eq!(again.task.recovery_attempts, 1);
    assert_eq!(again.task.console, Some("timeout".to_string()));
}

#[tokio::test]
async fn exhausted_recovery_fails_and_skips_the_rest() {
    let config = RuntimeConfig {
        max_recovery_attempts: 1,
        ..RuntimeConfig::default()
    };
    let orch = orchestrator(config);
    let graph_id = orch.create_exec_context(linear(&["a", "b"]), Vec::new()).await.unwrap();
    let processor = Uuid::new_v4();

    let a = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();
    orch.report_task_result(a.task.id, ExecResult::failed("boom", true))
        .await
        .unwrap();
    orch.recoverable_reset(graph_id).await.unwrap();
    let a = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();
    let reported = orch
        .report_task_result(a.task.id, ExecResult::failed("boom", true))
        .await
        .unwrap();
    assert_eq!(reported, ReportOutcome::Recorded(TaskState::Error));

    orch.wait_until_drained(graph_id).await;
    assert_eq!(state_of(&orch, graph_id, "b"), TaskState::Skipped);
    assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
}

#[tokio::test]
async fn duplicate_result_is_ignored() {
    let orch = orchestrator(RuntimeConfig::default());
    orch.create_exec_context(linear(&["a", "b"]), Vec::new()).await.unwrap();
    let a = orch.find_ready_task(Uuid::new_v4(), 0, 10).await.unwrap().unwrap();

    orch.report_task_result(a.task.id, ExecResult::ok("first")).await.unwrap();
    let second = orch
        .report_task_result(a.task.id, ExecResult::failed("late", false))
        .await
        .unwrap();
    assert_eq!(second, ReportOutcome::Ignored);

    let task = orch.task(a.task.id).unwrap();
    assert_eq!(task.state, TaskState::Ok);
    assert_eq!(task.result, Some("first".to_string()));
}

#[tokio::test]
async fn quota_limits_weighted_assignment() {
    let mut config = RuntimeConfig::default();
    config.tag_weights.insert("heavy".to_string(), 3);
    let orch = orchestrator(config);
    let heavy = |code: &str| ProcessDefinition::new(code, FunctionRef::external("worker")).with_tag("heavy");
    let template = PipelineTemplate::new("weights").with_process(
        ProcessDefinition::new("fan", FunctionRef::internal("test.group"))
            .with_sub_processes(SubProcessLogic::And, vec![heavy("x"), heavy("y"), heavy("z")]),
    );
    let graph_id = orch.create_exec_context(template, Vec::new()).await.unwrap();
    orch.wait_until_drained(graph_id).await;

    let processor = Uuid::new_v4();
    let outcome = orch.poll(request(processor, 3, 4)).await.unwrap();
    assert_eq!(outcome.assigned.len(), 1);
    assert_eq!(outcome.assigned[0].weight, 3);
    assert_eq!(orch.quota_in_use(processor), 3);
    assert!(orch.poll(request(processor, 3, 4)).await.unwrap().assigned.is_empty());

    let other = Uuid::new_v4();
    assert_eq!(orch.poll(request(other, 3, 6)).await.unwrap().assigned.len(), 2);

    orch.report_task_result(outcome.assigned[0].task.id, ExecResult::ok("ok"))
        .await
        .unwrap();
    assert_eq!(orch.quota_in_use(processor), 0);
    assert_eq!(orch.quota_in_use(other), 6);
}

#[tokio::test]
async fn stopped_graph_hands_out_nothing_until_resumed() {
    let orch = orchestrator(RuntimeConfig::default());
    let graph_id = orch.create_exec_context(linear(&["a", "b"]), Vec::new()).await.unwrap();
    let processor = Uuid::new_v4();
    let a = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();

    assert_eq!(orch.request_graph_stop(graph_id).await.unwrap(), ExecContextState::Stopped);
    let reported = orch.report_task_result(a.task.id, ExecResult::ok("ok")).await.unwrap();
    assert_eq!(reported, ReportOutcome::Recorded(TaskState::Ok));
    assert!(orch.find_ready_task(processor, 0, 10).await.unwrap().is_none());

    assert_eq!(orch.request_graph_resume(graph_id).await.unwrap(), ExecContextState::Started);
    let b = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();
    assert_eq!(b.task.process_code, "b");
}

#[tokio::test]
async fn stopped_graph_can_discard_late_results() {
    let config = RuntimeConfig {
        accept_results_after_stop: false,
        ..RuntimeConfig::default()
    };
    let orch = orchestrator(config);
    let graph_id = orch.create_exec_context(linear(&["a"]), Vec::new()).await.unwrap();
    let processor = Uuid::new_v4();
    let a = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();

    orch.request_graph_stop(graph_id).await.unwrap();
    let reported = orch.report_task_result(a.task.id, ExecResult::ok("ok")).await.unwrap();
    assert_eq!(reported, ReportOutcome::Discarded);
    let discarded = orch.task(a.task.id).unwrap();
    assert_eq!(discarded.state, TaskState::None);
    assert!(discarded.assignment.is_none());
    assert_eq!(orch.quota_in_use(processor), 0);

    orch.request_graph_resume(graph_id).await.unwrap();
    let late = orch.report_task_result(a.task.id, ExecResult::ok("late")).await.unwrap();
    assert_eq!(late, ReportOutcome::Ignored);

    let again = orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();
    assert_eq!(again.task.id, a.task.id);
    orch.report_task_result(again.task.id, ExecResult::ok("ok")).await.unwrap();
    orch.wait_until_drained(graph_id).await;
    assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
    assert_eq!(state_of(&orch, graph_id, "a"), TaskState::Ok);
}

#[tokio::test]
async fn silent_processor_loses_its_task_after_timeout() {
    let config = RuntimeConfig {
        task_timeout_ms: 50,
        ..RuntimeConfig::default()
    };
    let orch = orchestrator(config);
    let mut events = orch.subscribe_events();
    let graph_id = orch.create_exec_context(linear(&["a"]), Vec::new()).await.unwrap();

    let silent = Uuid::new_v4();
    let a = orch.find_ready_task(silent, 0, 10).await.unwrap().unwrap();
    let other = Uuid::new_v4();
    assert!(orch.find_ready_task(other, 0, 10).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let retried = orch.find_ready_task(other, 0, 10).await.unwrap().unwrap();
    assert_eq!(retried.task.id, a.task.id);
    assert_eq!(orch.quota_in_use(silent), 0);
    assert_eq!(orch.quota_in_use(other), 1);

    let mut released = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::TasksReleased { task_ids, .. } = event {
            released.extend(task_ids);
        }
    }
    assert_eq!(released, vec![a.task.id]);

    orch.report_task_result(retried.task.id, ExecResult::ok("ok")).await.unwrap();
    orch.wait_until_drained(graph_id).await;
    assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
}

#[tokio::test]
async fn undeclared_output_fails_task_without_partial_writes() {
    let orch = orchestrator(RuntimeConfig::default());
    let template = PipelineTemplate::new("outputs")
        .with_process(ProcessDefinition::new("a", FunctionRef::external("worker")).with_outputs(["x"]))
        .with_process(ProcessDefinition::new("b", FunctionRef::external("worker")));
    let graph_id = orch.create_exec_context(template, Vec::new()).await.unwrap();
    let a = orch.find_ready_task(Uuid::new_v4(), 0, 10).await.unwrap().unwrap();

    let result = ExecResult::ok("ok")
        .with_output("x", 1i64)
        .with_output("ghost", 2i64);
    let reported = orch.report_task_result(a.task.id, result).await.unwrap();
    assert_eq!(reported, ReportOutcome::Recorded(TaskState::Error));

    let failed = orch.task(a.task.id).unwrap();
    assert!(failed.console.unwrap().starts_with("variable_not_found"));
    assert!(orch.variable_value(graph_id, "1", "x").is_err());

    orch.wait_until_drained(graph_id).await;
    assert_eq!(state_of(&orch, graph_id, "b"), TaskState::Skipped);
    assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
}

#[tokio::test]
async fn internal_writes_are_dropped_with_a_failed_expansion() {
    let orch = orchestrator(RuntimeConfig::default());
    let template = PipelineTemplate::new("staged")
        .with_process(
            ProcessDefinition::new("or-group", FunctionRef::internal("test.write"))
                .with_outputs(["x"])
                .with_sub_processes(
                    SubProcessLogic::Or,
                    vec![ProcessDefinition::new("child", FunctionRef::external("worker"))],
                ),
        )
        .with_process(
            ProcessDefinition::new("extra", FunctionRef::internal("test.write_extra")).with_outputs(["x"]),
        );
    let graph_id = orch.create_exec_context(template, Vec::new()).await.unwrap();
    orch.wait_until_drained(graph_id).await;

    let tasks = orch.tasks(graph_id).unwrap();
    let group = tasks.iter().find(|t| t.process_code == "or-group").unwrap();
    assert_eq!(group.state, TaskState::Error);
    assert!(group.console.as_deref().unwrap().starts_with("unimplemented"));
    assert!(tasks.iter().all(|t| t.process_code != "child"));
    assert!(orch.variable_value(graph_id, "1", "x").is_err());
    assert_eq!(orch.snapshot(graph_id).unwrap().vertices.len(), 3);
    assert_eq!(state_of(&orch, graph_id, "extra"), TaskState::Skipped);
    assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
}

#[tokio::test]
async fn internal_write_to_undeclared_output_fails_task() {
    let orch = orchestrator(RuntimeConfig::default());
    let template = PipelineTemplate::new("ghost").with_process(
        ProcessDefinition::new("extra", FunctionRef::internal("test.write_extra")).with_outputs(["x"]),
    );
    let graph_id = orch.create_exec_context(template, Vec::new()).await.unwrap();
    orch.wait_until_drained(graph_id).await;

    let extra = orch
        .tasks(graph_id)
        .unwrap()
        .into_iter()
        .find(|t| t.process_code == "extra")
        .unwrap();
    assert_eq!(extra.state, TaskState::Error);
    assert!(extra.console.unwrap().starts_with("variable_not_found"));
    assert!(orch.variable_value(graph_id, "1", "x").is_err());
    assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
}

#[tokio::test]
async fn finished_graph_is_frozen() {
    let orch = orchestrator(RuntimeConfig::default());
    let graph_id = orch.create_exec_context(linear(&["a"]), Vec::new()).await.unwrap();
    run_to_finish(&orch, graph_id).await;

    let a = orch.tasks(graph_id).unwrap().into_iter().next().unwrap();
    let err = orch
        .report_task_result(a.id, ExecResult::ok("again"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Graph(GraphError::Frozen(id)) if id == graph_id));
    assert!(orch.request_graph_stop(graph_id).await.is_err());
}

#[tokio::test]
async fn unknown_internal_function_is_rejected() {
    let orch = orchestrator(RuntimeConfig::default());
    let template = PipelineTemplate::new("missing")
        .with_process(ProcessDefinition::new("m", FunctionRef::internal("test.missing")));
    let err = orch.create_exec_context(template, Vec::new()).await.unwrap_err();
    assert_eq!(err.kind(), ProcessingErrorKind::FunctionNotFound);
}

#[tokio::test]
async fn condition_on_missing_variable_fails_task() {
    let orch = orchestrator(RuntimeConfig::default());
    let template = PipelineTemplate::new("guarded")
        .with_process(ProcessDefinition::new("a", FunctionRef::external("worker")).with_condition("enabled == true"));
    let graph_id = orch.create_exec_context(template, Vec::new()).await.unwrap();

    assert!(orch.find_ready_task(Uuid::new_v4(), 0, 10).await.unwrap().is_none());
    orch.wait_until_drained(graph_id).await;

    let a = orch.tasks(graph_id).unwrap().into_iter().find(|t| t.process_code == "a").unwrap();
    assert_eq!(a.state, TaskState::Error);
    assert!(a.console.unwrap().starts_with("variable_not_found"));
    assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
}

#[tokio::test]
async fn events_describe_the_run() {
    let orch = orchestrator(RuntimeConfig::default());
    let mut events = orch.subscribe_events();
    let graph_id = orch.create_exec_context(linear(&["a"]), Vec::new()).await.unwrap();
    run_to_finish(&orch, graph_id).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.graph_id(), graph_id);
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(DispatchEvent::ExecContextCreated { tasks: 2, .. })));
    assert!(seen.iter().any(|e| matches!(e, DispatchEvent::TaskAssigned { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, DispatchEvent::InternalTaskProcessed { state: TaskState::Ok, .. })));
    assert!(matches!(seen.last(), Some(DispatchEvent::ExecContextFinished { .. })));
}

#[tokio::test]
async fn deleting_a_run_removes_everything() {
    let orch = orchestrator(RuntimeConfig::default());
    let graph_id = orch.create_exec_context(linear(&["a", "b"]), Vec::new()).await.unwrap();
    let processor = Uuid::new_v4();
    orch.find_ready_task(processor, 0, 10).await.unwrap().unwrap();

    assert!(orch.delete_exec_context(graph_id).await.unwrap());
    assert!(!orch.delete_exec_context(graph_id).await.unwrap());
    assert!(orch.tasks(graph_id).unwrap().is_empty());
    assert_eq!(orch.quota_in_use(processor), 0);
    assert!(matches!(
        orch.exec_context_state(graph_id),
        Err(DispatchError::ExecContextNotFound(_))
    ));
}

#[tokio::test]
async fn dot_export_shows_states() {
    let orch = orchestrator(RuntimeConfig::default());
    let graph_id = orch.create_exec_context(linear(&["a"]), Vec::new()).await.unwrap();
    run_to_finish(&orch, graph_id).await;

    let dot = orch.to_dot(graph_id).unwrap();
    assert!(dot.starts_with(&format!("digraph exec_context_{graph_id} {{")));
    assert!(dot.contains("a [1] OK"));
    assert!(dot.contains(" -> "));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_processors_never_share_a_task() {
    let orch = Arc::new(orchestrator(RuntimeConfig::default()));
    let mut graphs = Vec::new();
    for _ in 0..6 {
        graphs.push(
            orch.create_exec_context(linear(&["a", "b", "c"]), Vec::new())
                .await
                .unwrap(),
        );
    }

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let orch = Arc::clone(&orch);
        let seen = Arc::clone(&seen);
        let graphs = graphs.clone();
        handles.push(tokio::spawn(async move {
            let processor = Uuid::new_v4();
            for _ in 0..1000 {
                let finished = graphs
                    .iter()
                    .all(|g| orch.exec_context_state(*g).unwrap() == ExecContextState::Finished);
                if finished {
                    break;
                }
                let outcome = orch.poll(request(processor, 2, 10)).await.unwrap();
                if outcome.assigned.is_empty() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                for assigned in outcome.assigned {
                    assert!(seen.lock().insert(assigned.task.id), "task assigned twice");
                    orch.report_task_result(assigned.task.id, ExecResult::ok("ok"))
                        .await
                        .unwrap();
                }
            }
            assert_eq!(orch.quota_in_use(processor), 0);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(seen.lock().len(), 18);
    for graph_id in graphs {
        orch.wait_until_drained(graph_id).await;
        assert_eq!(orch.exec_context_state(graph_id).unwrap(), ExecContextState::Finished);
        assert!(orch
            .tasks(graph_id)
            .unwrap()
            .iter()
            .all(|t| t.state == TaskState::Ok));
    }
}
