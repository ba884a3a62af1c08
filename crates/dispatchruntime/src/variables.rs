use crate::store::VariableRepository;
use dispatchcore::context::{context_chain, is_within};
use dispatchcore::{
    DispatchError, GraphId, ProcessingErrorKind, ProcessingFailure, Value, Variable,
    VariableBinding, VariableHandle,
};
use std::sync::Arc;

/// Variable resolution scoped by task context ids.
pub struct VariableService {
    repo: Arc<dyn VariableRepository>,
}

impl VariableService {
    pub fn new(repo: Arc<dyn VariableRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn VariableRepository> {
        &self.repo
    }

    /// Nearest variable called `name`, looking in `task_context_id` and then
    /// in each enclosing context.
    pub fn find_in_scope(
        &self,
        graph_id: GraphId,
        task_context_id: &str,
        name: &str,
    ) -> Result<Option<Variable>, DispatchError> {
        for ctx in context_chain(task_context_id) {
            if let Some(v) = self.repo.find_variable(graph_id, &ctx, name)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    pub fn resolve_variable(
        &self,
        graph_id: GraphId,
        task_context_id: &str,
        name: &str,
    ) -> Result<VariableHandle, DispatchError> {
        self.find_in_scope(graph_id, task_context_id, name)?
            .map(|v| v.handle())
            .ok_or_else(|| not_found(name, task_context_id).into())
    }

    /// Value of the nearest initialised variable called `name`.
    pub fn resolve_value(
        &self,
        graph_id: GraphId,
        task_context_id: &str,
        name: &str,
    ) -> Result<Value, DispatchError> {
        let variable = self
            .find_in_scope(graph_id, task_context_id, name)?
            .ok_or_else(|| not_found(name, task_context_id))?;
        variable.value.ok_or_else(|| {
            ProcessingFailure::new(
                ProcessingErrorKind::VariableNotFound,
                format!("variable '{name}' (#{}) is not initialized", variable.id),
            )
            .into()
        })
    }

    /// Every initialised variable called `name` whose context lies inside
    /// `scope`, in creation order.
    pub fn collect_in_scope(
        &self,
        graph_id: GraphId,
        scope: &str,
        name: &str,
    ) -> Result<Vec<Variable>, DispatchError> {
        Ok(self
            .repo
            .find_variables_by_graph(graph_id)?
            .into_iter()
            .filter(|v| v.name == name && v.is_initialized() && is_within(&v.task_context_id, scope))
            .collect())
    }

    pub fn binding_of(variable: &Variable) -> VariableBinding {
        VariableBinding {
            id: variable.id,
            name: variable.name.clone(),
            task_context_id: variable.task_context_id.clone(),
            uploaded: variable.is_initialized(),
        }
    }
}

fn not_found(name: &str, task_context_id: &str) -> ProcessingFailure {
    ProcessingFailure::new(
        ProcessingErrorKind::VariableNotFound,
        format!("variable '{name}' not found from context {task_context_id}"),
    )
}
