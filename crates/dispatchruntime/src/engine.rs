//! Graph-mutating operations of the dispatcher.
//!
//! Every operation that touches a graph takes the graph lock first, then the
//! lock of each task it mutates, then the lock of each variable it writes.
//! Locks are always released in reverse order.

use crate::condition;
use crate::config::RuntimeConfig;
use crate::dispatcher::{AssignedTask, PollOutcome, PollRequest, QuotaRecord, QuotaTracker};
use crate::executor::InternalTaskProcessor;
use crate::expansion::{ExpansionService, Staged};
use crate::readiness;
use crate::registry::{FunctionRegistry, InternalContext, SubProcessInstance};
use crate::state_machine::{SideEffect, TaskStateMachine, Transition};
use crate::store::{GraphRepository, TaskRepository, VariableRepository};
use crate::sync::SyncLayer;
use crate::variables::VariableService;
use async_trait::async_trait;
use chrono::Utc;
use dispatchcore::{
    CoreId, DispatchError, DispatchEvent, EventBus, ExecContext, ExecContextState,
    ExecutionGraph, GraphId, PipelineTemplate, ProcessDefinition, ProcessGraphTemplate,
    ProcessingErrorKind, ProcessingFailure, ProcessorId, Result, Task, TaskId, TaskState, Value,
    VariableHandle, VariableId, FINISH_PROCESS_CODE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Core id recorded on internal tasks.
const INTERNAL_CORE: CoreId = 0;

/// What a processor reports for a task it ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub success: bool,
    pub result: Option<String>,
    pub console: Option<String>,
    /// Whether a failure may be retried by a recovery sweep.
    pub recoverable: bool,
    /// Output values, by output name.
    #[serde(default)]
    pub outputs: Vec<(String, Value)>,
}

impl ExecResult {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            console: None,
            recoverable: false,
            outputs: Vec::new(),
        }
    }

    pub fn failed(console: impl Into<String>, recoverable: bool) -> Self {
        Self {
            success: false,
            result: None,
            console: Some(console.into()),
            recoverable,
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportOutcome {
    /// The task moved to this state.
    Recorded(TaskState),
    /// The run is stopped and configured to drop late results.
    Discarded,
    /// The task was not in a state that accepts a result.
    Ignored,
}

/// A checked write of one output value, applied after the task's other
/// changes are known to succeed.
struct OutputWrite {
    variable_id: VariableId,
    name: String,
    value: Value,
}

/// Result of checking a task's guard before assignment.
enum Guard {
    Proceed,
    Skip,
    Fail(ProcessingFailure),
}

pub struct Engine {
    config: RuntimeConfig,
    sync: SyncLayer,
    tasks: Arc<dyn TaskRepository>,
    graphs: Arc<dyn GraphRepository>,
    variables: Arc<VariableService>,
    registry: Arc<FunctionRegistry>,
    machine: TaskStateMachine,
    quotas: QuotaTracker,
    expansion: ExpansionService,
    events: EventBus,
}

impl Engine {
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<FunctionRegistry>,
        tasks: Arc<dyn TaskRepository>,
        graphs: Arc<dyn GraphRepository>,
        variables: Arc<dyn VariableRepository>,
    ) -> Self {
        let variables = Arc::new(VariableService::new(variables));
        let expansion = ExpansionService::new(Arc::clone(&tasks), Arc::clone(&variables));
        Self {
            machine: TaskStateMachine::new(config.max_recovery_attempts),
            events: EventBus::new(config.event_buffer_size),
            sync: SyncLayer::new(),
            quotas: QuotaTracker::new(),
            config,
            tasks,
            graphs,
            variables,
            registry,
            expansion,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn quotas(&self) -> &QuotaTracker {
        &self.quotas
    }

    pub fn variables(&self) -> &Arc<VariableService> {
        &self.variables
    }

    /// Compiles `template`, produces the initial graph and persists the run.
    /// Returns the new graph id and the internal tasks ready to run.
    pub async fn create_exec_context(
        &self,
        template: PipelineTemplate,
        inputs: Vec<(String, Value)>,
    ) -> Result<(GraphId, Vec<TaskId>)> {
        let compiled = ProcessGraphTemplate::compile(template)?;
        compiled
            .check_functions(|code| self.registry.contains(code))
            .map_err(|missing| {
                ProcessingFailure::new(
                    ProcessingErrorKind::FunctionNotFound,
                    format!("unknown internal functions: {}", missing.join(", ")),
                )
            })?;

        let graph_id = self.graphs.next_graph_id();
        let _graph = self.sync.graphs.acquire(graph_id).await;
        let mut exec = ExecContext::new(graph_id, Arc::new(compiled));
        let staged = self.expansion.produce_initial(&mut exec, inputs)?;
        self.commit(&staged)?;
        self.graphs.save_exec_context(&exec)?;

        tracing::info!(
            "Created exec context #{} from '{}' with {} tasks",
            graph_id,
            exec.template.code(),
            staged.tasks.len()
        );
        self.events.emit(DispatchEvent::ExecContextCreated {
            graph_id,
            template_code: exec.template.code().to_string(),
            tasks: staged.tasks.len(),
            timestamp: Utc::now(),
        });

        let tasks = readiness::index(staged.tasks);
        let ready = self.ready_internal(&exec, &tasks);
        Ok((graph_id, ready))
    }

    /// Serves `request`, one task per idle core. Internal tasks found ready on
    /// the way are returned with their graph so the caller can queue them.
    pub async fn poll(&self, request: &PollRequest) -> Result<(PollOutcome, Vec<(GraphId, TaskId)>)> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.poll_budget_ms);
        let mut outcome = PollOutcome::default();
        let mut internal = Vec::new();

        'cores: for &core_id in &request.cores {
            let mut assigned = None;
            for graph_id in self.graphs.list_ids()? {
                if started.elapsed() >= budget {
                    tracing::warn!(
                        "Poll of processor {} ran out of its {:?} budget",
                        request.processor_id,
                        budget
                    );
                    outcome.budget_exhausted = true;
                    break 'cores;
                }
                if self.quotas.graph_count(request.processor_id, graph_id)
                    >= self.config.graph_processor_budget
                {
                    continue;
                }
                match self
                    .assign_from_graph(graph_id, request, core_id, &mut internal)
                    .await
                {
                    Ok(Some(task)) => {
                        assigned = Some(task);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!("Assignment from graph #{} failed: {}", graph_id, e),
                }
            }
            match assigned {
                Some(task) => outcome.assigned.push(task),
                None => break,
            }
        }
        Ok((outcome, internal))
    }

    async fn assign_from_graph(
        &self,
        graph_id: GraphId,
        request: &PollRequest,
        core_id: CoreId,
        internal: &mut Vec<(GraphId, TaskId)>,
    ) -> Result<Option<AssignedTask>> {
        let _graph = self.sync.graphs.acquire(graph_id).await;
        let Some(mut exec) = self.graphs.load_exec_context(graph_id)? else {
            return Ok(None);
        };
        if !exec.is_started() {
            return Ok(None);
        }
        let mut tasks = readiness::index(self.tasks.find_by_graph(graph_id)?);
        self.release_expired(graph_id, &mut tasks).await?;
        let mut follow_ups = self.reconcile(&exec, &mut tasks).await?;

        let ready = readiness::evaluate(&exec.graph, &tasks).ready;
        tracing::debug!("Graph #{} has {} ready tasks", graph_id, ready.len());

        let mut result = None;
        for task_id in ready {
            let Some(task) = tasks.get(&task_id) else {
                continue;
            };
            if task.is_internal() {
                continue;
            }
            let weight = self.config.weight_for(task.tag.as_deref());
            let record = QuotaRecord {
                task_id,
                graph_id,
                weight,
            };
            if !self.quotas.try_reserve(request.processor_id, record, request.quota) {
                continue;
            }
            match self
                .try_assign(&exec, &mut tasks, task_id, request.processor_id, core_id, &mut follow_ups)
                .await
            {
                Ok(Some(task)) => {
                    tracing::info!(
                        "Assigned task #{} of graph #{} to processor {} core {}",
                        task_id,
                        graph_id,
                        request.processor_id,
                        core_id
                    );
                    self.events.emit(DispatchEvent::TaskAssigned {
                        graph_id,
                        task_id,
                        processor_id: request.processor_id,
                        core_id,
                        timestamp: Utc::now(),
                    });
                    result = Some(AssignedTask {
                        core_id,
                        task,
                        weight,
                    });
                    break;
                }
                Ok(None) => {
                    self.quotas.release(task_id);
                }
                Err(e) => {
                    self.quotas.release(task_id);
                    return Err(e);
                }
            }
        }

        self.finish_if_done(&mut exec, &tasks)?;
        internal.extend(follow_ups.into_iter().map(|t| (graph_id, t)));
        Ok(result)
    }

    /// Assigns one external task after checking its guard. A task whose guard
    /// skips or fails it is settled here and `None` is returned.
    async fn try_assign(
        &self,
        exec: &ExecContext,
        tasks: &mut BTreeMap<TaskId, Task>,
        task_id: TaskId,
        processor_id: ProcessorId,
        core_id: CoreId,
        follow_ups: &mut Vec<TaskId>,
    ) -> Result<Option<Task>> {
        let task_guard = self.sync.tasks.acquire(task_id).await;
        let Some(mut task) = self.tasks.load_task(task_id)? else {
            return Ok(None);
        };
        if task.state != TaskState::None {
            return Ok(None);
        }
        let template = Arc::clone(&exec.template);
        let process = template.find_process(&task.process_code);

        let transition = match self.check_guard(&task, process) {
            Guard::Proceed => {
                self.machine.assign(&mut task, processor_id, core_id)?;
                self.tasks.save_task(&task)?;
                tasks.insert(task_id, task.clone());
                return Ok(Some(task));
            }
            Guard::Skip => {
                tracing::info!("Condition of task #{} is false, skipping", task_id);
                self.machine.skip(&mut task)?
            }
            Guard::Fail(failure) => {
                tracing::error!("Task #{} can't be assigned: {}", task_id, failure);
                self.machine.assign(&mut task, processor_id, core_id)?;
                self.machine.report_failure(&mut task, failure.to_string(), false)?
            }
        };
        self.tasks.save_task(&task)?;
        drop(task_guard);

        self.emit_finished(&task);
        tasks.insert(task_id, task.clone());
        follow_ups.extend(self.settle(exec, tasks, &task, &transition).await?);
        Ok(None)
    }

    /// Records a processor's result for `task_id`.
    pub async fn report_task_result(
        &self,
        task_id: TaskId,
        result: ExecResult,
    ) -> Result<(ReportOutcome, Vec<TaskId>)> {
        let graph_id = self
            .tasks
            .load_task(task_id)?
            .ok_or(DispatchError::TaskNotFound(task_id))?
            .graph_id;

        let _graph = self.sync.graphs.acquire(graph_id).await;
        let mut exec = self.load_exec_context(graph_id)?;
        exec.ensure_mutable()?;
        if exec.state == ExecContextState::Stopped && !self.config.accept_results_after_stop {
            tracing::info!("Graph #{} is stopped, discarding result of task #{}", graph_id, task_id);
            self.discard_result(graph_id, task_id).await?;
            return Ok((ReportOutcome::Discarded, Vec::new()));
        }

        let task_guard = self.sync.tasks.acquire(task_id).await;
        let mut task = self
            .tasks
            .load_task(task_id)?
            .ok_or(DispatchError::TaskNotFound(task_id))?;
        if task.state != TaskState::InProgress {
            tracing::warn!(
                "Result of task #{} ignored, task is {}",
                task_id,
                task.state
            );
            return Ok((ReportOutcome::Ignored, Vec::new()));
        }

        let transition = if result.success {
            match self.plan_writes(&task, result.outputs) {
                Ok(writes) => {
                    self.apply_writes(writes).await?;
                    self.machine.report_success(&mut task, result.result)?
                }
                Err(failure) => {
                    tracing::error!("Result of task #{} rejected: {}", task_id, failure);
                    self.machine.report_failure(&mut task, failure.to_string(), false)?
                }
            }
        } else {
            let console = result.console.unwrap_or_default();
            self.machine
                .report_failure(&mut task, console, result.recoverable)?
        };
        self.tasks.save_task(&task)?;
        drop(task_guard);

        tracing::info!("Task #{} of graph #{} finished as {}", task_id, graph_id, task.state);
        self.emit_finished(&task);

        let mut tasks = readiness::index(self.tasks.find_by_graph(graph_id)?);
        let follow_ups = self.settle(&exec, &mut tasks, &task, &transition).await?;
        self.finish_if_done(&mut exec, &tasks)?;
        Ok((ReportOutcome::Recorded(task.state), follow_ups))
    }

    /// Stores the value of one output of `task_id` ahead of its result.
    pub async fn upload_variable(&self, task_id: TaskId, name: &str, value: Value) -> Result<VariableHandle> {
        let _task_guard = self.sync.tasks.acquire(task_id).await;
        let mut task = self
            .tasks
            .load_task(task_id)?
            .ok_or(DispatchError::TaskNotFound(task_id))?;
        let writes = self.plan_writes(&task, vec![(name.to_string(), value)])?;
        let handle = self
            .apply_writes(writes)
            .await?
            .pop()
            .ok_or_else(|| DispatchError::from(output_not_found(&task, name)))?;
        if let Some(output) = task.outputs.iter_mut().find(|o| o.name == name) {
            output.uploaded = true;
        }
        self.tasks.save_task(&task)?;
        Ok(handle)
    }

    pub async fn request_graph_stop(&self, graph_id: GraphId) -> Result<ExecContextState> {
        let _graph = self.sync.graphs.acquire(graph_id).await;
        let mut exec = self.load_exec_context(graph_id)?;
        exec.ensure_mutable()?;
        if exec.is_started() {
            exec.state = ExecContextState::Stopped;
            self.graphs.save_exec_context(&exec)?;
            tracing::info!("Graph #{} stopped", graph_id);
            self.events.emit(DispatchEvent::ExecContextStopped {
                graph_id,
                timestamp: Utc::now(),
            });
        }
        Ok(exec.state)
    }

    /// Restarts a stopped run and returns the internal tasks now ready.
    pub async fn request_graph_resume(&self, graph_id: GraphId) -> Result<Vec<TaskId>> {
        let _graph = self.sync.graphs.acquire(graph_id).await;
        let mut exec = self.load_exec_context(graph_id)?;
        exec.ensure_mutable()?;
        if exec.state == ExecContextState::Stopped {
            exec.state = ExecContextState::Started;
            self.graphs.save_exec_context(&exec)?;
            tracing::info!("Graph #{} resumed", graph_id);
            self.events.emit(DispatchEvent::ExecContextResumed {
                graph_id,
                timestamp: Utc::now(),
            });
        }
        let mut tasks = readiness::index(self.tasks.find_by_graph(graph_id)?);
        let follow_ups = self.reconcile(&exec, &mut tasks).await?;
        self.finish_if_done(&mut exec, &tasks)?;
        Ok(follow_ups)
    }

    /// Puts every `ERROR_WITH_RECOVERY` task of the graph back into `NONE`.
    /// Returns the reset tasks and the internal tasks now ready.
    pub async fn recoverable_reset(&self, graph_id: GraphId) -> Result<(Vec<TaskId>, Vec<TaskId>)> {
        let _graph = self.sync.graphs.acquire(graph_id).await;
        let exec = self.load_exec_context(graph_id)?;
        exec.ensure_mutable()?;

        let mut reset = Vec::new();
        for candidate in self.tasks.find_by_graph(graph_id)? {
            if candidate.state != TaskState::ErrorWithRecovery {
                continue;
            }
            let _task_guard = self.sync.tasks.acquire(candidate.id).await;
            let Some(mut task) = self.tasks.load_task(candidate.id)? else {
                continue;
            };
            if task.state != TaskState::ErrorWithRecovery {
                continue;
            }
            self.machine.recovery_reset(&mut task)?;
            self.tasks.save_task(&task)?;
            reset.push(task.id);
        }

        if reset.is_empty() {
            return Ok((reset, Vec::new()));
        }
        tracing::info!("Reset {} recoverable tasks of graph #{}", reset.len(), graph_id);
        self.events.emit(DispatchEvent::TasksRecovered {
            graph_id,
            task_ids: reset.clone(),
            timestamp: Utc::now(),
        });
        let follow_ups = if exec.is_started() {
            let mut tasks = readiness::index(self.tasks.find_by_graph(graph_id)?);
            self.reconcile(&exec, &mut tasks).await?
        } else {
            Vec::new()
        };
        Ok((reset, follow_ups))
    }

    /// Deletes a run with its tasks, variables and quota records.
    pub async fn delete_exec_context(&self, graph_id: GraphId) -> Result<bool> {
        let _graph = self.sync.graphs.acquire(graph_id).await;
        let tasks = self.tasks.delete_by_graph(graph_id)?;
        let variables = self.variables.repository().delete_variables_by_graph(graph_id)?;
        self.quotas.release_graph(graph_id);
        let existed = self.graphs.delete_exec_context(graph_id)?;
        if existed {
            tracing::info!(
                "Deleted graph #{} with {} tasks and {} variables",
                graph_id,
                tasks,
                variables
            );
        }
        Ok(existed)
    }

    pub fn load_exec_context(&self, graph_id: GraphId) -> Result<ExecContext> {
        self.graphs
            .load_exec_context(graph_id)?
            .ok_or(DispatchError::ExecContextNotFound(graph_id))
    }

    pub fn load_graph(&self, graph_id: GraphId) -> Result<ExecutionGraph> {
        self.graphs
            .load_graph(graph_id)?
            .ok_or(DispatchError::ExecContextNotFound(graph_id))
    }

    pub fn load_task(&self, task_id: TaskId) -> Result<Task> {
        self.tasks
            .load_task(task_id)?
            .ok_or(DispatchError::TaskNotFound(task_id))
    }

    pub fn tasks_of(&self, graph_id: GraphId) -> Result<Vec<Task>> {
        Ok(self.tasks.find_by_graph(graph_id)?)
    }

    async fn process_internal(&self, graph_id: GraphId, task_id: TaskId) -> Result<Vec<TaskId>> {
        let _graph = self.sync.graphs.acquire(graph_id).await;
        let Some(mut exec) = self.graphs.load_exec_context(graph_id)? else {
            return Ok(Vec::new());
        };
        if !exec.is_started() {
            tracing::debug!("Graph #{} is {}, internal task #{} waits", graph_id, exec.state, task_id);
            return Ok(Vec::new());
        }
        let mut tasks = readiness::index(self.tasks.find_by_graph(graph_id)?);
        if !readiness::is_ready(&exec.graph, &tasks, task_id) {
            return Ok(Vec::new());
        }

        let task_guard = self.sync.tasks.acquire(task_id).await;
        let Some(mut task) = self.tasks.load_task(task_id)? else {
            return Ok(Vec::new());
        };
        if task.state != TaskState::None || !task.is_internal() {
            return Ok(Vec::new());
        }
        let template = Arc::clone(&exec.template);
        let process = template.find_process(&task.process_code);

        let mut staged = Staged::default();
        let mut writes = Vec::new();
        let transition = match self.check_guard(&task, process) {
            Guard::Skip => {
                tracing::info!("Condition of internal task #{} is false, skipping", task_id);
                self.machine.skip(&mut task)?
            }
            Guard::Fail(failure) => {
                self.machine.assign(&mut task, Uuid::nil(), INTERNAL_CORE)?;
                tracing::error!("Internal task #{} failed: {}", task_id, failure);
                self.machine.report_failure(&mut task, failure.to_string(), false)?
            }
            Guard::Proceed => {
                self.machine.assign(&mut task, Uuid::nil(), INTERNAL_CORE)?;
                match self.run_function(&mut exec, &task, process).await {
                    Ok((expanded, planned)) => {
                        staged = expanded;
                        writes = planned;
                        self.machine.report_success(&mut task, None)?
                    }
                    Err(failure) => {
                        tracing::error!("Internal task #{} failed: {}", task_id, failure);
                        self.machine.report_failure(&mut task, failure.to_string(), false)?
                    }
                }
            }
        };

        self.apply_writes(writes).await?;
        if !staged.is_empty() {
            self.commit(&staged)?;
            self.graphs.save_graph(&exec.graph)?;
            self.events.emit(DispatchEvent::SubProcessesExpanded {
                graph_id,
                parent_task_id: task_id,
                task_ids: staged.task_ids(),
                timestamp: Utc::now(),
            });
        }
        self.tasks.save_task(&task)?;
        drop(task_guard);

        tracing::debug!("Internal task #{} of graph #{} finished as {}", task_id, graph_id, task.state);
        self.events.emit(DispatchEvent::InternalTaskProcessed {
            graph_id,
            task_id,
            state: task.state,
            timestamp: Utc::now(),
        });
        self.emit_finished(&task);

        tasks.extend(staged.tasks.into_iter().map(|t| (t.id, t)));
        tasks.insert(task_id, task.clone());
        let follow_ups = self.settle(&exec, &mut tasks, &task, &transition).await?;
        self.finish_if_done(&mut exec, &tasks)?;
        Ok(follow_ups)
    }

    /// Runs the internal function of `task` and stages its writes together
    /// with the expansion it asks for. Nothing is stored here, and the graph
    /// in `exec` is only changed when the whole expansion succeeds.
    async fn run_function(
        &self,
        exec: &mut ExecContext,
        task: &Task,
        process: Option<&ProcessDefinition>,
    ) -> std::result::Result<(Staged, Vec<OutputWrite>), ProcessingFailure> {
        let process = process.ok_or_else(|| process_not_found(&task.process_code))?;
        let function = self.registry.get(&task.function.code).ok_or_else(|| {
            ProcessingFailure::new(
                ProcessingErrorKind::FunctionNotFound,
                format!("internal function '{}' is not registered", task.function.code),
            )
        })?;

        let output = {
            let ctx = InternalContext::new(task, process, &self.variables);
            function.process(&ctx).await?
        };
        let writes = self.plan_writes(task, output.writes)?;

        let instances = match output.instances {
            Some(instances) => instances,
            None if process.is_composite() => vec![SubProcessInstance::default()],
            None => Vec::new(),
        };
        if instances.is_empty() {
            return Ok((Staged::default(), writes));
        }
        let staged = self.expansion.expand(exec, task, &instances)?;
        Ok((staged, writes))
    }

    fn check_guard(&self, task: &Task, process: Option<&ProcessDefinition>) -> Guard {
        let Some(process) = process else {
            return Guard::Fail(process_not_found(&task.process_code));
        };
        if task.outputs.len() != process.outputs.len() {
            return Guard::Fail(ProcessingFailure::new(
                ProcessingErrorKind::NumberOfOutputsIsIncorrect,
                format!(
                    "task #{} has {} outputs, process '{}' declares {}",
                    task.id,
                    task.outputs.len(),
                    process.code,
                    process.outputs.len()
                ),
            ));
        }
        let Some(expression) = &process.condition else {
            return Guard::Proceed;
        };
        let resolved = condition::evaluate_condition(expression, |name| {
            self.variables
                .resolve_value(task.graph_id, &task.task_context_id, name)
                .map_err(DispatchError::into_failure)
        });
        match resolved {
            Ok(true) => Guard::Proceed,
            Ok(false) => Guard::Skip,
            Err(failure) => Guard::Fail(failure),
        }
    }

    /// Resolves every output value of `task` to its variable. Fails on the
    /// first unknown name, before anything is written.
    fn plan_writes(
        &self,
        task: &Task,
        outputs: Vec<(String, Value)>,
    ) -> std::result::Result<Vec<OutputWrite>, ProcessingFailure> {
        let repo = self.variables.repository();
        outputs
            .into_iter()
            .map(|(name, value)| {
                let binding = task
                    .find_output(&name)
                    .ok_or_else(|| output_not_found(task, &name))?;
                let stored = repo
                    .load_variable(binding.id)
                    .map_err(|e| DispatchError::from(e).into_failure())?;
                if stored.is_none() {
                    return Err(variable_gone(binding.id, &name));
                }
                Ok(OutputWrite {
                    variable_id: binding.id,
                    name,
                    value,
                })
            })
            .collect()
    }

    async fn apply_writes(&self, writes: Vec<OutputWrite>) -> Result<Vec<VariableHandle>> {
        let repo = self.variables.repository();
        let mut handles = Vec::with_capacity(writes.len());
        for write in writes {
            let _variable_guard = self.sync.variables.acquire(write.variable_id).await;
            let mut variable = repo
                .load_variable(write.variable_id)?
                .ok_or_else(|| variable_gone(write.variable_id, &write.name))?;
            variable.set(write.value);
            repo.save_variable(&variable)?;
            handles.push(variable.handle());
        }
        Ok(handles)
    }

    /// Takes back a task whose result arrived while the run was stopped, so
    /// it is offered again after a resume.
    async fn discard_result(&self, graph_id: GraphId, task_id: TaskId) -> Result<()> {
        let _task_guard = self.sync.tasks.acquire(task_id).await;
        let mut task = self
            .tasks
            .load_task(task_id)?
            .ok_or(DispatchError::TaskNotFound(task_id))?;
        self.quotas.release(task_id);
        if task.state != TaskState::InProgress {
            return Ok(());
        }
        self.machine.release(&mut task)?;
        self.tasks.save_task(&task)?;
        self.events.emit(DispatchEvent::TasksReleased {
            graph_id,
            task_ids: vec![task_id],
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Puts external tasks that stayed `IN_PROGRESS` past the configured
    /// timeout back to `NONE`.
    async fn release_expired(&self, graph_id: GraphId, tasks: &mut BTreeMap<TaskId, Task>) -> Result<Vec<TaskId>> {
        let Some(timeout) = self.config.task_timeout() else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let expired = |task: &Task| {
            task.state == TaskState::InProgress
                && !task.is_internal()
                && task.assigned_on.map_or(false, |at| now - at > timeout)
        };
        let candidates: Vec<TaskId> = tasks.values().filter(|t| expired(*t)).map(|t| t.id).collect();

        let mut released = Vec::new();
        for task_id in candidates {
            let _task_guard = self.sync.tasks.acquire(task_id).await;
            let Some(mut task) = self.tasks.load_task(task_id)? else {
                continue;
            };
            if !expired(&task) {
                continue;
            }
            self.machine.release(&mut task)?;
            self.tasks.save_task(&task)?;
            self.quotas.release(task_id);
            tasks.insert(task_id, task);
            released.push(task_id);
        }

        if !released.is_empty() {
            tracing::warn!(
                "Tasks {:?} of graph #{} timed out and were released",
                released,
                graph_id
            );
            self.events.emit(DispatchEvent::TasksReleased {
                graph_id,
                task_ids: released.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(released)
    }

    /// Runs the side effects of `transition` on `task`, then skips vertices
    /// that can no longer run. Returns the internal tasks now ready.
    async fn settle(
        &self,
        exec: &ExecContext,
        tasks: &mut BTreeMap<TaskId, Task>,
        task: &Task,
        transition: &Transition,
    ) -> Result<Vec<TaskId>> {
        for effect in &transition.effects {
            match effect {
                SideEffect::ReleaseQuota => {
                    self.quotas.release(task.id);
                }
                SideEffect::PropagateSkip if exec.is_started() => {
                    let targets = readiness::skip_targets(&exec.graph, tasks, task);
                    self.skip_tasks(exec.id, tasks, &targets, Some(task.id)).await?;
                }
                SideEffect::PropagateSkip | SideEffect::ReevaluateDescendants => {}
            }
        }
        if !exec.is_started() {
            return Ok(Vec::new());
        }
        self.reconcile(exec, tasks).await
    }

    /// Skips blocked vertices until none are left and returns the ready
    /// internal tasks. Safe to repeat.
    async fn reconcile(&self, exec: &ExecContext, tasks: &mut BTreeMap<TaskId, Task>) -> Result<Vec<TaskId>> {
        loop {
            let evaluated = readiness::evaluate(&exec.graph, tasks);
            if evaluated.blocked.is_empty()
                || self.skip_tasks(exec.id, tasks, &evaluated.blocked, None).await? == 0
            {
                return Ok(self.ready_internal(exec, tasks));
            }
        }
    }

    async fn skip_tasks(
        &self,
        graph_id: GraphId,
        tasks: &mut BTreeMap<TaskId, Task>,
        targets: &[TaskId],
        cause: Option<TaskId>,
    ) -> Result<usize> {
        let mut skipped = Vec::new();
        for &task_id in targets {
            let _task_guard = self.sync.tasks.acquire(task_id).await;
            let Some(mut task) = self.tasks.load_task(task_id)? else {
                continue;
            };
            if self.machine.skip(&mut task).is_err() {
                continue;
            }
            self.tasks.save_task(&task)?;
            self.emit_finished(&task);
            tasks.insert(task_id, task);
            skipped.push(task_id);
        }
        if !skipped.is_empty() {
            tracing::info!("Skipped tasks {:?} of graph #{}", skipped, graph_id);
            self.events.emit(DispatchEvent::TasksSkipped {
                graph_id,
                cause,
                task_ids: skipped.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(skipped.len())
    }

    fn ready_internal(&self, exec: &ExecContext, tasks: &BTreeMap<TaskId, Task>) -> Vec<TaskId> {
        readiness::evaluate(&exec.graph, tasks)
            .ready
            .into_iter()
            .filter(|id| tasks.get(id).map_or(false, Task::is_internal))
            .collect()
    }

    /// Finishes the run once its finish vertex is terminal.
    fn finish_if_done(&self, exec: &mut ExecContext, tasks: &BTreeMap<TaskId, Task>) -> Result<()> {
        if exec.is_finished() {
            return Ok(());
        }
        let done = tasks
            .values()
            .any(|t| t.process_code == FINISH_PROCESS_CODE && t.state.is_terminal());
        if !done {
            return Ok(());
        }
        exec.finish();
        self.graphs.save_exec_context(exec)?;
        tracing::info!("Exec context #{} finished", exec.id);
        self.events.emit(DispatchEvent::ExecContextFinished {
            graph_id: exec.id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Persists staged variables before the tasks that bind them.
    fn commit(&self, staged: &Staged) -> Result<()> {
        let repo = self.variables.repository();
        for variable in &staged.variables {
            repo.save_variable(variable)?;
        }
        for task in &staged.tasks {
            self.tasks.save_task(task)?;
        }
        Ok(())
    }

    fn emit_finished(&self, task: &Task) {
        if task.state.is_terminal() {
            self.events.emit(DispatchEvent::TaskFinished {
                graph_id: task.graph_id,
                task_id: task.id,
                state: task.state,
                timestamp: Utc::now(),
            });
        }
    }
}

#[async_trait]
impl InternalTaskProcessor for Engine {
    async fn process_internal_task(&self, graph_id: GraphId, task_id: TaskId) -> Vec<TaskId> {
        match self.process_internal(graph_id, task_id).await {
            Ok(follow_ups) => follow_ups,
            Err(e) => {
                tracing::error!(
                    "Processing internal task #{} of graph #{} failed: {}",
                    task_id,
                    graph_id,
                    e
                );
                Vec::new()
            }
        }
    }
}

fn output_not_found(task: &Task, name: &str) -> ProcessingFailure {
    ProcessingFailure::new(
        ProcessingErrorKind::VariableNotFound,
        format!("task #{} has no output '{name}'", task.id),
    )
}

fn variable_gone(id: VariableId, name: &str) -> ProcessingFailure {
    ProcessingFailure::new(
        ProcessingErrorKind::VariableNotFound,
        format!("variable #{id} of output '{name}' is gone"),
    )
}

fn process_not_found(code: &str) -> ProcessingFailure {
    ProcessingFailure::new(
        ProcessingErrorKind::ProcessNotFound,
        format!("process '{code}' not found"),
    )
}
