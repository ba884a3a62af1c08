use crate::config::RuntimeConfig;
use crate::dispatcher::{AssignedTask, PollOutcome, PollRequest};
use crate::engine::{Engine, ExecResult, ReportOutcome};
use crate::executor::InternalExecutor;
use crate::registry::FunctionRegistry;
use crate::store::{GraphRepository, MemoryStore, TaskRepository, VariableRepository};
use dispatchcore::{
    CoreId, DispatchEvent, EventBus, ExecContextState, GraphId, GraphSnapshot, PipelineTemplate,
    ProcessorId, Result, Task, TaskId, Value, VariableHandle,
};
use std::sync::Arc;

/// Main entry point of the dispatcher
pub struct Orchestrator {
    registry: Arc<FunctionRegistry>,
    engine: Arc<Engine>,
    executor: Arc<InternalExecutor>,
}

impl Orchestrator {
    /// Create a dispatcher with default settings and in-memory storage
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a dispatcher with custom configuration and in-memory storage
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(FunctionRegistry::new()), config)
    }

    /// Create a dispatcher with a pre-filled function registry
    pub fn with_registry(registry: Arc<FunctionRegistry>, config: RuntimeConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_store(registry, config, store.clone(), store.clone(), store)
    }

    /// Create a dispatcher on top of the given repositories
    pub fn with_store(
        registry: Arc<FunctionRegistry>,
        config: RuntimeConfig,
        tasks: Arc<dyn TaskRepository>,
        graphs: Arc<dyn GraphRepository>,
        variables: Arc<dyn VariableRepository>,
    ) -> Self {
        let max_executors = config.max_internal_executors;
        let engine = Arc::new(Engine::new(
            config,
            Arc::clone(&registry),
            tasks,
            graphs,
            variables,
        ));
        let executor = InternalExecutor::new(engine.clone(), max_executors);
        Self {
            registry,
            engine,
            executor,
        }
    }

    /// Get access to the function registry for registering internal functions
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.engine.config()
    }

    /// Start a run of `template`. `inputs` become variables of the top-level
    /// context.
    pub async fn create_exec_context(
        &self,
        template: PipelineTemplate,
        inputs: Vec<(String, Value)>,
    ) -> Result<GraphId> {
        let (graph_id, ready) = self.engine.create_exec_context(template, inputs).await?;
        self.submit(graph_id, ready);
        Ok(graph_id)
    }

    /// Hand out ready tasks to the idle cores of a processor
    pub async fn poll(&self, request: PollRequest) -> Result<PollOutcome> {
        let (outcome, internal) = self.engine.poll(&request).await?;
        for (graph_id, task_id) in internal {
            self.executor.submit(graph_id, task_id);
        }
        Ok(outcome)
    }

    /// Single-core form of [`poll`](Self::poll)
    pub async fn find_ready_task(
        &self,
        processor_id: ProcessorId,
        core_id: CoreId,
        quota: u32,
    ) -> Result<Option<AssignedTask>> {
        let outcome = self
            .poll(PollRequest {
                processor_id,
                cores: vec![core_id],
                quota,
            })
            .await?;
        Ok(outcome.assigned.into_iter().next())
    }

    pub async fn report_task_result(&self, task_id: TaskId, result: ExecResult) -> Result<ReportOutcome> {
        let graph_id = self.engine.load_task(task_id)?.graph_id;
        let (outcome, ready) = self.engine.report_task_result(task_id, result).await?;
        self.submit(graph_id, ready);
        Ok(outcome)
    }

    pub async fn upload_variable(
        &self,
        task_id: TaskId,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<VariableHandle> {
        self.engine.upload_variable(task_id, name, value.into()).await
    }

    pub async fn request_graph_stop(&self, graph_id: GraphId) -> Result<ExecContextState> {
        self.engine.request_graph_stop(graph_id).await
    }

    pub async fn request_graph_resume(&self, graph_id: GraphId) -> Result<ExecContextState> {
        let ready = self.engine.request_graph_resume(graph_id).await?;
        self.submit(graph_id, ready);
        self.exec_context_state(graph_id)
    }

    /// Put recoverable failures of the graph back into play. Returns the ids
    /// of the reset tasks; a second call with nothing to reset is a no-op.
    pub async fn recoverable_reset(&self, graph_id: GraphId) -> Result<Vec<TaskId>> {
        let (reset, ready) = self.engine.recoverable_reset(graph_id).await?;
        self.submit(graph_id, ready);
        Ok(reset)
    }

    pub async fn delete_exec_context(&self, graph_id: GraphId) -> Result<bool> {
        self.executor.forget(graph_id);
        self.engine.delete_exec_context(graph_id).await
    }

    /// Wait until no internal task of the graph is queued or running
    pub async fn wait_until_drained(&self, graph_id: GraphId) {
        self.executor.wait_until_drained(graph_id).await
    }

    pub fn exec_context_state(&self, graph_id: GraphId) -> Result<ExecContextState> {
        Ok(self.engine.load_exec_context(graph_id)?.state)
    }

    pub fn task(&self, task_id: TaskId) -> Result<Task> {
        self.engine.load_task(task_id)
    }

    pub fn tasks(&self, graph_id: GraphId) -> Result<Vec<Task>> {
        self.engine.tasks_of(graph_id)
    }

    pub fn snapshot(&self, graph_id: GraphId) -> Result<GraphSnapshot> {
        Ok(self.engine.load_graph(graph_id)?.snapshot())
    }

    /// Graphviz rendering of the graph, each vertex labelled with its
    /// process code and state.
    pub fn to_dot(&self, graph_id: GraphId) -> Result<String> {
        let graph = self.engine.load_graph(graph_id)?;
        let tasks = crate::readiness::index(self.engine.tasks_of(graph_id)?);
        Ok(graph.to_dot(|vertex| match tasks.get(&vertex.task_id) {
            Some(task) => format!("{} [{}] {}", task.process_code, vertex.task_context_id, task.state),
            None => format!("#{}", vertex.task_id),
        }))
    }

    /// Value of the nearest variable called `name` seen from `task_context_id`
    pub fn variable_value(&self, graph_id: GraphId, task_context_id: &str, name: &str) -> Result<Value> {
        self.engine
            .variables()
            .resolve_value(graph_id, task_context_id, name)
    }

    /// Current quota weight held by a processor
    pub fn quota_in_use(&self, processor_id: ProcessorId) -> u32 {
        self.engine.quotas().current(processor_id)
    }

    /// Subscribe to dispatch events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<DispatchEvent> {
        self.engine.events().subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &EventBus {
        self.engine.events()
    }

    fn submit(&self, graph_id: GraphId, ready: Vec<TaskId>) {
        for task_id in ready {
            self.executor.submit(graph_id, task_id);
        }
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}
