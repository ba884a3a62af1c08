use dispatchcore::{
    ExecContextState, FunctionRef, GraphId, PipelineTemplate, ProcessDefinition, SubProcessLogic,
    Task, TaskState, Value, Variable, VariableBinding,
};
use dispatchfunctions::{register_all, SplitFunction};
use dispatchruntime::{
    ExecResult, FunctionRegistry, InternalContext, InternalFunction, MemoryStore, Orchestrator,
    PollRequest, RuntimeConfig, VariableRepository, VariableService,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn orchestrator() -> Orchestrator {
    let registry = Arc::new(FunctionRegistry::new());
    register_all(&registry);
    Orchestrator::with_registry(registry, RuntimeConfig::default())
}

/// Completes every external task, with outputs from `produce`, until the run
/// finishes.
async fn drive<F>(orch: &Orchestrator, graph_id: GraphId, produce: F)
where
    F: Fn(&Task) -> Vec<(String, Value)>,
{
    let processor = Uuid::new_v4();
    for _ in 0..100 {
        orch.wait_until_drained(graph_id).await;
        if orch.exec_context_state(graph_id).unwrap() == ExecContextState::Finished {
            return;
        }
        let outcome = orch
            .poll(PollRequest {
                processor_id: processor,
                cores: vec![0, 1, 2, 3],
                quota: 10,
            })
            .await
            .unwrap();
        for assigned in outcome.assigned {
            let mut result = ExecResult::ok("done");
            result.outputs = produce(&assigned.task);
            orch.report_task_result(assigned.task.id, result).await.unwrap();
        }
    }
    panic!("graph #{graph_id} did not finish");
}

fn state_of(orch: &Orchestrator, graph_id: GraphId, code: &str) -> TaskState {
    orch.tasks(graph_id)
        .unwrap()
        .into_iter()
        .find(|t| t.process_code == code)
        .map(|t| t.state)
        .unwrap()
}

#[test]
fn all_builtins_are_registered() {
    let registry = FunctionRegistry::new();
    register_all(&registry);
    assert_eq!(
        registry.codes(),
        vec![
            "pipeline.aggregate",
            "pipeline.evaluation",
            "pipeline.finish",
            "pipeline.nop",
            "pipeline.split",
        ]
    );
}

#[tokio::test]
async fn split_then_aggregate_collects_every_instance() {
    let orch = orchestrator();
    let template = PipelineTemplate::new("split-aggregate")
        .with_process(
            ProcessDefinition::new("split-items", FunctionRef::internal("pipeline.split"))
                .with_inputs(["items"])
                .with_meta("output-variable", "item")
                .with_sub_processes(
                    SubProcessLogic::Sequential,
                    vec![ProcessDefinition::new("process-item", FunctionRef::external("worker"))
                        .with_inputs(["item"])
                        .with_outputs(["processed"])],
                ),
        )
        .with_process(
            ProcessDefinition::new("collect", FunctionRef::internal("pipeline.aggregate"))
                .with_meta("variable", "processed")
                .with_outputs(["all"]),
        );

    let graph_id = orch
        .create_exec_context(template, vec![("items".to_string(), Value::Json(json!(["a", "b", "c"])))])
        .await
        .unwrap();

    drive(&orch, graph_id, |task| {
        let item = orch
            .variable_value(graph_id, &task.task_context_id, "item")
            .unwrap();
        vec![(
            "processed".to_string(),
            Value::from(item.as_str().unwrap().to_uppercase()),
        )]
    })
    .await;

    let contexts: Vec<String> = orch
        .tasks(graph_id)
        .unwrap()
        .into_iter()
        .filter(|t| t.process_code == "process-item")
        .map(|t| t.task_context_id)
        .collect();
    assert_eq!(contexts, vec!["1,2#1", "1,2#2", "1,2#3"]);
    assert_eq!(
        orch.variable_value(graph_id, "1", "all").unwrap(),
        Value::Json(json!(["A", "B", "C"]))
    );
}

#[tokio::test]
async fn evaluation_result_drives_conditions() {
    let orch = orchestrator();
    let template = PipelineTemplate::new("conditional")
        .with_process(
            ProcessDefinition::new("eval", FunctionRef::internal("pipeline.evaluation"))
                .with_meta("expression", "count >= 3")
                .with_outputs(["big"]),
        )
        .with_process(ProcessDefinition::new("heavy", FunctionRef::external("worker")).with_condition("big"))
        .with_process(ProcessDefinition::new("light", FunctionRef::external("worker")).with_condition("!big"));

    let graph_id = orch
        .create_exec_context(template, vec![("count".to_string(), Value::Int(5))])
        .await
        .unwrap();
    drive(&orch, graph_id, |_| Vec::new()).await;

    assert_eq!(orch.variable_value(graph_id, "1", "big").unwrap(), Value::Bool(true));
    assert_eq!(state_of(&orch, graph_id, "eval"), TaskState::Ok);
    assert_eq!(state_of(&orch, graph_id, "heavy"), TaskState::Ok);
    assert_eq!(state_of(&orch, graph_id, "light"), TaskState::Skipped);
    assert_eq!(state_of(&orch, graph_id, "pipeline.finish"), TaskState::Ok);
}

#[tokio::test]
async fn nop_group_runs_and_children_before_join() {
    let orch = orchestrator();
    let template = PipelineTemplate::new("and-join")
        .with_process(
            ProcessDefinition::new("group", FunctionRef::internal("pipeline.nop")).with_sub_processes(
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
    let first = orch
        .poll(PollRequest {
            processor_id: processor,
            cores: vec![0, 1, 2],
            quota: 10,
        })
        .await
        .unwrap();
    let mut codes: Vec<String> = first.assigned.iter().map(|a| a.task.process_code.clone()).collect();
    codes.sort();
    assert_eq!(codes, vec!["x", "y"]);

    let x = first.assigned.iter().find(|a| a.task.process_code == "x").unwrap();
    let y = first.assigned.iter().find(|a| a.task.process_code == "y").unwrap();
    assert_ne!(x.task.task_context_id, y.task.task_context_id);

    orch.report_task_result(x.task.id, ExecResult::ok("x")).await.unwrap();
    assert!(orch.find_ready_task(processor, 0, 10).await.unwrap().is_none());

    orch.report_task_result(y.task.id, ExecResult::ok("y")).await.unwrap();
    drive(&orch, graph_id, |_| Vec::new()).await;
    assert_eq!(state_of(&orch, graph_id, "d"), TaskState::Ok);
}

#[tokio::test]
async fn misconfigured_evaluation_fails_and_run_still_finishes() {
    let orch = orchestrator();
    let template = PipelineTemplate::new("broken")
        .with_process(ProcessDefinition::new("eval", FunctionRef::internal("pipeline.evaluation")).with_outputs(["r"]))
        .with_process(ProcessDefinition::new("after", FunctionRef::external("worker")));

    let graph_id = orch.create_exec_context(template, Vec::new()).await.unwrap();
    drive(&orch, graph_id, |_| Vec::new()).await;

    let eval = orch
        .tasks(graph_id)
        .unwrap()
        .into_iter()
        .find(|t| t.process_code == "eval")
        .unwrap();
    assert_eq!(eval.state, TaskState::Error);
    assert!(eval.console.unwrap().starts_with("source_code_is_broken"));
    assert_eq!(state_of(&orch, graph_id, "after"), TaskState::Skipped);
}

#[tokio::test]
async fn split_rejects_scalar_input() {
    let store = Arc::new(MemoryStore::new());
    let mut variable = Variable::uninitialized(1, 1, "items", "1");
    variable.set(Value::Int(3));
    store.save_variable(&variable).unwrap();
    let variables = VariableService::new(store);

    let process = ProcessDefinition::new("split", FunctionRef::internal("pipeline.split"))
        .with_inputs(["items"])
        .with_meta("output-variable", "item");
    let mut task = Task::new(1, 1, "split", "1", FunctionRef::internal("pipeline.split"));
    task.inputs.push(VariableBinding {
        id: 1,
        name: "items".to_string(),
        task_context_id: "1".to_string(),
        uploaded: true,
    });

    let ctx = InternalContext::new(&task, &process, &variables);
    let failure = SplitFunction.process(&ctx).await.unwrap_err();
    assert_eq!(failure.kind, dispatchcore::ProcessingErrorKind::SourceCodeIsBroken);
}
