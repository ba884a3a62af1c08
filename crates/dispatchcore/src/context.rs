//! Task context ids.
//!
//! A context id is a comma-separated path of levels with an optional
//! `#instance` suffix, e.g. `1,2,3#5`. It places a task inside the nested
//! fan-out structure of a run and scopes variable lookup.

/// Context id shared by every top-level process of a pipeline.
pub const TOP_LEVEL_CONTEXT_ID: &str = "1";

const LEVEL_DELIMITER: char = ',';
const INSTANCE_DELIMITER: char = '#';

/// Builds `level#instance`.
pub fn build_task_context_id(level: &str, instance: &str) -> String {
    format!("{level}{INSTANCE_DELIMITER}{instance}")
}

/// The level part of a context id, i.e. everything before `#`.
pub fn level(context_id: &str) -> &str {
    match context_id.find(INSTANCE_DELIMITER) {
        Some(idx) => &context_id[..idx],
        None => context_id,
    }
}

/// The instance part of a context id, if any.
pub fn instance(context_id: &str) -> Option<&str> {
    context_id
        .find(INSTANCE_DELIMITER)
        .map(|idx| &context_id[idx + 1..])
}

/// Enclosing context of `context_id`, `None` at the root.
///
/// An instance suffix is stripped first; otherwise the last level is removed:
/// `1,2,3#5` -> `1,2,3` -> `1,2` -> `1` -> `None`.
pub fn parent_context(context_id: &str) -> Option<String> {
    let context_id = context_id.trim();
    if let Some(idx) = context_id.find(INSTANCE_DELIMITER) {
        return Some(context_id[..idx].to_string());
    }
    context_id
        .rfind(LEVEL_DELIMITER)
        .map(|idx| context_id[..idx].trim().to_string())
}

/// Iterates over `context_id` and all of its enclosing contexts, innermost first.
pub fn context_chain(context_id: &str) -> ContextChain {
    ContextChain {
        next: Some(context_id.to_string()),
    }
}

pub struct ContextChain {
    next: Option<String>,
}

impl Iterator for ContextChain {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let current = self.next.take()?;
        self.next = parent_context(&current);
        Some(current)
    }
}

/// Level for tasks spawned from a sub-process block.
///
/// The instance path of the parent task is appended to the block's process
/// context so that sibling instances never share a level:
/// (`1,2#3`, `1,2,4`) -> `1,2,4,3`.
pub fn context_for_sub_processes(parent_task_context_id: &str, sub_process_context_id: &str) -> String {
    match instance(parent_task_context_id) {
        Some(path) => format!("{sub_process_context_id}{LEVEL_DELIMITER}{path}"),
        None => sub_process_context_id.to_string(),
    }
}

/// Whether the level of `context_id` equals, or is nested inside, the level of `scope`.
/// Instance suffixes are ignored.
pub fn is_within(context_id: &str, scope: &str) -> bool {
    let scope = level(scope);
    let candidate = level(context_id);
    candidate == scope
        || (candidate.starts_with(scope)
            && candidate[scope.len()..].starts_with(LEVEL_DELIMITER))
}

/// Number of parent steps needed to reach the root.
pub fn depth(context_id: &str) -> usize {
    context_chain(context_id).count()
}
