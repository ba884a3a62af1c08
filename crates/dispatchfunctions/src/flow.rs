use async_trait::async_trait;
use dispatchcore::{ProcessingFailure, FINISH_PROCESS_CODE};
use dispatchruntime::{FunctionOutput, InternalContext, InternalFunction};

/// Last step of every run. Completing it finishes the exec context.
pub struct FinishFunction;

#[async_trait]
impl InternalFunction for FinishFunction {
    fn code(&self) -> &str {
        FINISH_PROCESS_CODE
    }

    fn description(&self) -> &str {
        "Marks the end of a run"
    }

    async fn process(&self, ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
        tracing::debug!("Finishing graph #{}", ctx.task.graph_id);
        Ok(FunctionOutput::done())
    }
}

/// Does nothing itself. A composite process using it has its children
/// expanded once.
pub struct NopFunction;

#[async_trait]
impl InternalFunction for NopFunction {
    fn code(&self) -> &str {
        "pipeline.nop"
    }

    fn description(&self) -> &str {
        "Groups sub-processes without doing any work"
    }

    async fn process(&self, _ctx: &InternalContext<'_>) -> Result<FunctionOutput, ProcessingFailure> {
        Ok(FunctionOutput::done())
    }
}
