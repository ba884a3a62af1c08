use async_trait::async_trait;
use dispatchcore::ProcessingFailure;
use dispatchruntime::{FunctionOutput, InternalContext, InternalFunction};

/// Evaluates meta `expression` and stores the result in the first output
pub struct EvaluationFunction;

#[async_trait]
impl InternalFunction for EvaluationFunction {
    fn code(&self) -> &str {
        "pipeline.evaluation"
    }

    fn description(&self) -> &str {
        "Evaluates an expression over variables in scope"
    }

    async fn process(&self, ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
        let expression = ctx.required_meta("expression")?;
        let output = ctx.first_output()?;
        let result = ctx.evaluate(expression)?;

        tracing::debug!("Task #{}: '{}' evaluated to {:?}", ctx.task.id, expression, result);

        Ok(FunctionOutput::done().write(output, result.into_value()))
    }
}
