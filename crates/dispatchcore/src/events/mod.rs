mod base;

pub use base::{DispatchEvent, EventBus};
