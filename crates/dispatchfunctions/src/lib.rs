//! Built-in internal functions
//!
//! Coordinator-side steps available to every pipeline: the finish step,
//! no-op grouping, expression evaluation, fan-out and aggregation.

mod batch;
mod evaluation;
mod flow;

pub use batch::{AggregateFunction, SplitFunction};
pub use evaluation::EvaluationFunction;
pub use flow::{FinishFunction, NopFunction};
use dispatchruntime::FunctionRegistry;

use std::sync::Arc;

/// Register all built-in functions with a registry
pub fn register_all(registry: &FunctionRegistry) {
    registry.register(Arc::new(flow::FinishFunction));
    registry.register(Arc::new(flow::NopFunction));
    registry.register(Arc::new(evaluation::EvaluationFunction));
    registry.register(Arc::new(batch::SplitFunction));
    registry.register(Arc::new(batch::AggregateFunction));
}
