use crate::condition;
use crate::sync::StampedLock;
use crate::variables::VariableService;
use async_trait::async_trait;
use dispatchcore::{
    ProcessDefinition, ProcessingErrorKind, ProcessingFailure, Task, Value, Variable,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Seed of one sub-process instance: variables created in the instance
/// context before its tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubProcessInstance {
    pub variables: Vec<(String, Value)>,
}

impl SubProcessInstance {
    pub fn with_variable(name: impl Into<String>, value: Value) -> Self {
        Self {
            variables: vec![(name.into(), value)],
        }
    }
}

/// What an internal function asks the engine to do once it returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionOutput {
    /// Values for the task's declared outputs, by output name.
    pub writes: Vec<(String, Value)>,
    /// Sub-process instances to expand. `None` expands a composite process
    /// exactly once.
    pub instances: Option<Vec<SubProcessInstance>>,
}

impl FunctionOutput {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn write(mut self, output: impl Into<String>, value: Value) -> Self {
        self.writes.push((output.into(), value));
        self
    }

    pub fn expand(mut self, instances: Vec<SubProcessInstance>) -> Self {
        self.instances = Some(instances);
        self
    }
}

/// Read-only view handed to an internal function.
pub struct InternalContext<'a> {
    pub task: &'a Task,
    pub process: &'a ProcessDefinition,
    variables: &'a VariableService,
}

impl<'a> InternalContext<'a> {
    pub fn new(task: &'a Task, process: &'a ProcessDefinition, variables: &'a VariableService) -> Self {
        Self {
            task,
            process,
            variables,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.process.meta(key)
    }

    pub fn required_meta(&self, key: &str) -> Result<&str, ProcessingFailure> {
        self.meta(key).ok_or_else(|| {
            ProcessingFailure::new(
                ProcessingErrorKind::SourceCodeIsBroken,
                format!("process '{}' requires meta '{key}'", self.process.code),
            )
        })
    }

    /// Value of the nearest variable called `name`, seen from the task.
    pub fn value(&self, name: &str) -> Result<Value, ProcessingFailure> {
        self.variables
            .resolve_value(self.task.graph_id, &self.task.task_context_id, name)
            .map_err(|e| e.into_failure())
    }

    /// First declared output, required by functions that produce one value.
    pub fn first_output(&self) -> Result<&str, ProcessingFailure> {
        self.task
            .outputs
            .first()
            .map(|o| o.name.as_str())
            .ok_or_else(|| {
                ProcessingFailure::new(
                    ProcessingErrorKind::NumberOfOutputsIsIncorrect,
                    format!("process '{}' must declare an output", self.process.code),
                )
            })
    }

    pub fn first_input(&self) -> Result<&str, ProcessingFailure> {
        self.task
            .inputs
            .first()
            .map(|i| i.name.as_str())
            .ok_or_else(|| {
                ProcessingFailure::new(
                    ProcessingErrorKind::SourceCodeIsBroken,
                    format!("process '{}' must declare an input", self.process.code),
                )
            })
    }

    /// Initialised variables called `name` anywhere inside the task's context.
    pub fn collect(&self, name: &str) -> Result<Vec<Variable>, ProcessingFailure> {
        self.variables
            .collect_in_scope(self.task.graph_id, &self.task.task_context_id, name)
            .map_err(|e| e.into_failure())
    }

    pub fn evaluate(&self, expression: &str) -> Result<condition::Scalar, ProcessingFailure> {
        condition::evaluate(expression, |name| self.value(name))
    }
}

/// A coordinator-side step.
#[async_trait]
pub trait InternalFunction: Send + Sync {
    /// Function code referenced by processes.
    fn code(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn process(&self, ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure>;
}

/// Mapping from function code to implementation, built at startup.
///
/// Lookups take the optimistic read path of [`StampedLock`]; registration is
/// rare.
pub struct FunctionRegistry {
    functions: StampedLock<HashMap<String, Arc<dyn InternalFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: StampedLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, function: Arc<dyn InternalFunction>) {
        let code = function.code().to_string();
        tracing::info!("Registering internal function: {}", code);
        self.functions.write_with(|map| {
            map.insert(code, function);
        });
    }

    pub fn get(&self, code: &str) -> Option<Arc<dyn InternalFunction>> {
        self.functions.read_with(|map| map.get(code).cloned())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.functions.read_with(|map| map.contains_key(code))
    }

    pub fn codes(&self) -> Vec<String> {
        let mut codes = self.functions.read_with(|map| map.keys().cloned().collect::<Vec<_>>());
        codes.sort();
        codes
    }

    pub fn describe(&self, code: &str) -> Option<String> {
        self.functions
            .read_with(|map| map.get(code).map(|f| f.description().to_string()))
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl InternalFunction for Echo {
        fn code(&self) -> &str {
            "test.echo"
        }

        async fn process(&self, _ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
            Ok(FunctionOutput::done())
        }
    }

    #[test]
    fn registered_functions_are_found_by_code() {
        let registry = FunctionRegistry::new();
        assert!(!registry.contains("test.echo"));
        registry.register(Arc::new(Echo));
        assert!(registry.get("test.echo").is_some());
        assert_eq!(registry.codes(), vec!["test.echo".to_string()]);
        assert_eq!(registry.describe("test.echo").as_deref(), Some(""));
    }
}
