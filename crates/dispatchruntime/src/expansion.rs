//! Materialisation of processes into tasks.
//!
//! Both the initial production of a run and the runtime expansion of a
//! composite process stage their tasks and variables in memory. The caller
//! persists them only after the graph mutation has been committed.

use crate::registry::SubProcessInstance;
use crate::store::TaskRepository;
use crate::variables::VariableService;
use dispatchcore::context::{build_task_context_id, context_chain, context_for_sub_processes, TOP_LEVEL_CONTEXT_ID};
use dispatchcore::{
    DispatchError, Edge, ExecContext, GraphId, ProcessDefinition, ProcessingErrorKind,
    ProcessingFailure, SubProcessLogic, Task, TaskId, TaskVertex, Value, Variable, VariableBinding,
};
use std::sync::Arc;

/// Tasks and variables produced by one materialisation, not yet saved.
#[derive(Debug, Clone, Default)]
pub struct Staged {
    pub tasks: Vec<Task>,
    pub variables: Vec<Variable>,
}

impl Staged {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.variables.is_empty()
    }

    fn find_variable(&self, task_context_id: &str, name: &str) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.task_context_id == task_context_id && v.name == name)
    }
}

pub struct ExpansionService {
    tasks: Arc<dyn TaskRepository>,
    variables: Arc<VariableService>,
}

impl ExpansionService {
    pub fn new(tasks: Arc<dyn TaskRepository>, variables: Arc<VariableService>) -> Self {
        Self { tasks, variables }
    }

    /// Builds the initial graph of a fresh exec context: the top-level
    /// processes in order, each depending on the previous one, ending with
    /// the finish step. `inputs` become initialised variables of context `1`.
    pub fn produce_initial(
        &self,
        exec: &mut ExecContext,
        inputs: Vec<(String, Value)>,
    ) -> Result<Staged, DispatchError> {
        let mut staged = Staged::default();
        for (name, value) in inputs {
            self.stage_variable(exec.id, TOP_LEVEL_CONTEXT_ID, &name, Some(value), &mut staged)?;
        }

        let template = Arc::clone(&exec.template);
        let mut previous: Option<TaskId> = None;
        for process in template.top_level() {
            let task = self.stage_task(exec.id, process, TOP_LEVEL_CONTEXT_ID, &mut staged)?;
            exec.graph
                .add_vertex(TaskVertex::new(task.id, TOP_LEVEL_CONTEXT_ID))?;
            if let Some(prev) = previous {
                exec.graph.add_edge(prev, task.id)?;
            }
            previous = Some(task.id);
        }
        Ok(staged)
    }

    /// Expands the children of `parent`'s process, one set per instance, and
    /// splices them between `parent` and its current direct descendants.
    ///
    /// On error the graph is left exactly as it was.
    pub fn expand(
        &self,
        exec: &mut ExecContext,
        parent: &Task,
        instances: &[SubProcessInstance],
    ) -> Result<Staged, ProcessingFailure> {
        let template = Arc::clone(&exec.template);
        let process = template.find_process(&parent.process_code).ok_or_else(|| {
            ProcessingFailure::new(
                ProcessingErrorKind::ProcessNotFound,
                format!("process '{}' not found", parent.process_code),
            )
        })?;
        let children = template.find_sub_processes(&process.code);
        if children.is_empty() || instances.is_empty() {
            return Ok(Staged::default());
        }

        let logic = process.logic().unwrap_or(SubProcessLogic::Sequential);
        match logic {
            SubProcessLogic::Or => {
                return Err(ProcessingFailure::new(
                    ProcessingErrorKind::Unimplemented,
                    format!("'or' logic of process '{}' can't be expanded", process.code),
                ))
            }
            SubProcessLogic::Sequential => {
                let first = &children[0].process_context_id;
                if let Some(other) = children.iter().find(|c| &c.process_context_id != first) {
                    return Err(ProcessingFailure::new(
                        ProcessingErrorKind::SourceCodeIsBroken,
                        format!(
                            "sub-processes of '{}' use different contexts: {} and {}",
                            process.code, first, other.process_context_id
                        ),
                    ));
                }
            }
            SubProcessLogic::And => {}
        }

        let descendants: Vec<TaskId> = exec
            .graph
            .find_direct_descendants(parent.id)
            .into_iter()
            .map(|v| v.task_id)
            .collect();

        let mut staged = Staged::default();
        let mut vertices = Vec::new();
        let mut edges = Vec::new();
        let mut terminals = Vec::new();

        for (idx, instance) in instances.iter().enumerate() {
            let number = (idx + 1).to_string();
            let mut previous = parent.id;
            for child in &children {
                let level = context_for_sub_processes(&parent.task_context_id, &child.process_context_id);
                let task_context_id = build_task_context_id(&level, &number);
                for (name, value) in &instance.variables {
                    if staged.find_variable(&task_context_id, name).is_none() {
                        self.stage_variable(exec.id, &task_context_id, name, Some(value.clone()), &mut staged)
                            .map_err(DispatchError::into_failure)?;
                    }
                }

                let task = self
                    .stage_task(exec.id, child, &task_context_id, &mut staged)
                    .map_err(DispatchError::into_failure)?;
                vertices.push(TaskVertex::new(task.id, task_context_id));
                match logic {
                    SubProcessLogic::Sequential => {
                        edges.push(Edge::new(previous, task.id));
                        previous = task.id;
                    }
                    _ => {
                        edges.push(Edge::new(parent.id, task.id));
                        terminals.push(task.id);
                    }
                }
            }
            if logic == SubProcessLogic::Sequential {
                terminals.push(previous);
            }
        }

        exec.graph
            .splice(parent.id, vertices, edges, &terminals, &descendants)
            .map_err(|e| ProcessingFailure::new(e.kind(), e.to_string()))?;

        tracing::debug!(
            "Expanded process '{}' of task #{} into {} tasks",
            process.code,
            parent.id,
            staged.tasks.len()
        );
        Ok(staged)
    }

    fn stage_task(
        &self,
        graph_id: GraphId,
        process: &ProcessDefinition,
        task_context_id: &str,
        staged: &mut Staged,
    ) -> Result<Task, DispatchError> {
        let id = self.tasks.next_task_id();
        let mut task = Task::new(id, graph_id, &process.code, task_context_id, process.function.clone())
            .with_tag(process.tag.clone())
            .with_params(process.params.clone());

        for input in &process.inputs {
            task.inputs.push(self.resolve_binding(graph_id, task_context_id, input, staged)?);
        }
        for output in &process.outputs {
            let variable = self.stage_variable(graph_id, task_context_id, output, None, staged)?;
            task.outputs.push(VariableService::binding_of(&variable));
        }

        staged.tasks.push(task.clone());
        Ok(task)
    }

    fn stage_variable(
        &self,
        graph_id: GraphId,
        task_context_id: &str,
        name: &str,
        value: Option<Value>,
        staged: &mut Staged,
    ) -> Result<Variable, DispatchError> {
        let exists = staged.find_variable(task_context_id, name).is_some()
            || self
                .variables
                .repository()
                .find_variable(graph_id, task_context_id, name)?
                .is_some();
        if exists {
            return Err(ProcessingFailure::new(
                ProcessingErrorKind::SourceCodeIsBroken,
                format!("variable '{name}' is declared twice in context {task_context_id}"),
            )
            .into());
        }

        let mut variable = Variable::uninitialized(
            self.variables.repository().next_variable_id(),
            graph_id,
            name,
            task_context_id,
        );
        if let Some(value) = value {
            variable.set(value);
        }
        staged.variables.push(variable.clone());
        Ok(variable)
    }

    /// Input lookup sees staged variables before persisted ones at every
    /// level of the context chain.
    fn resolve_binding(
        &self,
        graph_id: GraphId,
        task_context_id: &str,
        name: &str,
        staged: &Staged,
    ) -> Result<VariableBinding, DispatchError> {
        for ctx in context_chain(task_context_id) {
            if let Some(v) = staged.find_variable(&ctx, name) {
                return Ok(VariableService::binding_of(v));
            }
            if let Some(v) = self.variables.repository().find_variable(graph_id, &ctx, name)? {
                return Ok(VariableService::binding_of(&v));
            }
        }
        Err(ProcessingFailure::new(
            ProcessingErrorKind::VariableNotFound,
            format!("input '{name}' of context {task_context_id} is not produced by any process"),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use dispatchcore::{FunctionRef, PipelineTemplate, ProcessGraphTemplate, FINISH_PROCESS_CODE};
    use pretty_assertions::assert_eq;

    fn ext(code: &str) -> ProcessDefinition {
        ProcessDefinition::new(code, FunctionRef::external("fn"))
    }

    fn setup(template: PipelineTemplate) -> (ExpansionService, Arc<MemoryStore>, ExecContext) {
        let store = Arc::new(MemoryStore::new());
        let variables = Arc::new(VariableService::new(store.clone()));
        let service = ExpansionService::new(store.clone(), variables);
        let compiled = Arc::new(ProcessGraphTemplate::compile(template).unwrap());
        (service, store, ExecContext::new(1, compiled))
    }

    fn parent_of(staged: &Staged, code: &str) -> Task {
        staged.tasks.iter().find(|t| t.process_code == code).unwrap().clone()
    }

    fn ancestors(exec: &ExecContext, id: TaskId) -> Vec<TaskId> {
        exec.graph.find_direct_ancestors(id).iter().map(|v| v.task_id).collect()
    }

    #[test]
    fn initial_graph_is_a_chain_ending_in_finish() {
        let (service, _, mut exec) = setup(
            PipelineTemplate::new("p")
                .with_process(ext("a").with_outputs(["x"]))
                .with_process(ext("b").with_inputs(["x", "seed"])),
        );
        let staged = service
            .produce_initial(&mut exec, vec![("seed".into(), Value::Int(1))])
            .unwrap();
        let codes: Vec<&str> = staged.tasks.iter().map(|t| t.process_code.as_str()).collect();
        assert_eq!(codes, vec!["a", "b", FINISH_PROCESS_CODE]);
        assert_eq!(exec.graph.topological_order().unwrap(), staged.task_ids());
        let b = parent_of(&staged, "b");
        assert_eq!(b.inputs.len(), 2);
        assert!(!b.inputs[0].uploaded);
        assert!(b.inputs[1].uploaded);
    }

    #[test]
    fn unknown_input_is_variable_not_found() {
        let (service, _, mut exec) = setup(PipelineTemplate::new("p").with_process(ext("a").with_inputs(["ghost"])));
        let err = service.produce_initial(&mut exec, vec![]).unwrap_err();
        assert_eq!(err.kind(), ProcessingErrorKind::VariableNotFound);
    }

    #[test]
    fn and_block_gates_descendants_on_every_child() {
        let (service, _, mut exec) = setup(
            PipelineTemplate::new("p").with_process(
                ProcessDefinition::new("fan", FunctionRef::internal("pipeline.nop"))
                    .with_sub_processes(SubProcessLogic::And, vec![ext("x"), ext("y")]),
            ),
        );
        let initial = service.produce_initial(&mut exec, vec![]).unwrap();
        let fan = parent_of(&initial, "fan");
        let finish = parent_of(&initial, FINISH_PROCESS_CODE);

        let staged = service
            .expand(&mut exec, &fan, &[SubProcessInstance::default()])
            .unwrap();
        let ids = staged.task_ids();
        assert_eq!(staged.tasks[0].task_context_id, "1,2#1");
        assert_eq!(staged.tasks[1].task_context_id, "1,3#1");
        assert_eq!(ancestors(&exec, finish.id), ids);
        assert_eq!(ancestors(&exec, ids[0]), vec![fan.id]);
    }

    #[test]
    fn sequential_instances_run_in_parallel_chains() {
        let (service, _, mut exec) = setup(
            PipelineTemplate::new("p").with_process(
                ProcessDefinition::new("split", FunctionRef::internal("pipeline.split"))
                    .with_sub_processes(
                        SubProcessLogic::Sequential,
                        vec![ext("s1").with_inputs(["item"]).with_outputs(["r"]), ext("s2").with_inputs(["r"])],
                    ),
            ),
        );
        let initial = service.produce_initial(&mut exec, vec![]).unwrap();
        let split = parent_of(&initial, "split");
        let finish = parent_of(&initial, FINISH_PROCESS_CODE);

        let instances = vec![
            SubProcessInstance::with_variable("item", Value::from("a")),
            SubProcessInstance::with_variable("item", Value::from("b")),
        ];
        let staged = service.expand(&mut exec, &split, &instances).unwrap();
        let ctxs: Vec<&str> = staged.tasks.iter().map(|t| t.task_context_id.as_str()).collect();
        assert_eq!(ctxs, vec!["1,2#1", "1,2#1", "1,2#2", "1,2#2"]);
        let ids = staged.task_ids();
        assert_eq!(ancestors(&exec, ids[1]), vec![ids[0]]);
        assert_eq!(ancestors(&exec, finish.id), vec![ids[1], ids[3]]);
        // the element variable is bound as input of the first child
        assert_eq!(staged.tasks[0].inputs[0].task_context_id, "1,2#1");
        assert_eq!(staged.variables.len(), 4);
    }

    #[test]
    fn failed_expansion_leaves_graph_untouched() {
        let (service, _, mut exec) = setup(
            PipelineTemplate::new("p").with_process(
                ProcessDefinition::new("split", FunctionRef::internal("pipeline.split"))
                    .with_sub_processes(SubProcessLogic::Sequential, vec![ext("s1").with_inputs(["missing"])]),
            ),
        );
        let initial = service.produce_initial(&mut exec, vec![]).unwrap();
        let split = parent_of(&initial, "split");
        let before = exec.graph.clone();
        let err = service
            .expand(&mut exec, &split, &[SubProcessInstance::default()])
            .unwrap_err();
        assert_eq!(err.kind, ProcessingErrorKind::VariableNotFound);
        assert_eq!(exec.graph, before);
    }

    #[test]
    fn or_logic_is_unimplemented() {
        let (service, _, mut exec) = setup(
            PipelineTemplate::new("p").with_process(
                ProcessDefinition::new("either", FunctionRef::internal("pipeline.nop"))
                    .with_sub_processes(SubProcessLogic::Or, vec![ext("l"), ext("r")]),
            ),
        );
        let initial = service.produce_initial(&mut exec, vec![]).unwrap();
        let either = parent_of(&initial, "either");
        let err = service
            .expand(&mut exec, &either, &[SubProcessInstance::default()])
            .unwrap_err();
        assert_eq!(err.kind, ProcessingErrorKind::Unimplemented);
    }
}
