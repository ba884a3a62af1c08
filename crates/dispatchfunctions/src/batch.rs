use async_trait::async_trait;
use dispatchcore::{ProcessingErrorKind, ProcessingFailure, Value};
use dispatchruntime::{FunctionOutput, InternalContext, InternalFunction, SubProcessInstance};

/// Fans out the first input: one sub-process instance per element
pub struct SplitFunction;

#[async_trait]
impl InternalFunction for SplitFunction {
    fn code(&self) -> &str {
        "pipeline.split"
    }

    fn description(&self) -> &str {
        "Runs the sub-processes once per element of the input"
    }

    async fn process(&self, ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
        let variable = ctx.required_meta("output-variable")?;
        let input = ctx.first_input()?;
        let value = ctx.value(input)?;

        let elements = value.elements().ok_or_else(|| {
            ProcessingFailure::new(
                ProcessingErrorKind::SourceCodeIsBroken,
                format!("input '{}' of type {} can't be split", input, value.type_name()),
            )
        })?;

        tracing::info!(
            "Task #{} splits '{}' into {} instances",
            ctx.task.id,
            input,
            elements.len()
        );

        let instances = elements
            .into_iter()
            .map(|element| SubProcessInstance::with_variable(variable, element))
            .collect();
        Ok(FunctionOutput::done().expand(instances))
    }
}

/// Gathers every value of meta `variable` in the task's context subtree
/// into a JSON array stored in the first output
pub struct AggregateFunction;

#[async_trait]
impl InternalFunction for AggregateFunction {
    fn code(&self) -> &str {
        "pipeline.aggregate"
    }

    fn description(&self) -> &str {
        "Collects values produced by sub-process instances"
    }

    async fn process(&self, ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
        let name = ctx.required_meta("variable")?;
        let output = ctx.first_output()?;

        let collected: Vec<serde_json::Value> = ctx
            .collect(name)?
            .into_iter()
            .filter_map(|v| v.value)
            .map(|v| v.to_json())
            .collect();

        tracing::debug!("Task #{} aggregated {} values of '{}'", ctx.task.id, collected.len(), name);

        Ok(FunctionOutput::done().write(output, Value::Json(serde_json::Value::Array(collected))))
    }
}
