use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for the dispatcher runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    /// Number of graphs that may drain internal tasks at the same time.
    pub max_internal_executors: usize,
    /// Wall-clock budget of a single poll.
    pub poll_budget_ms: u64,
    /// How many times a task may go from `ERROR_WITH_RECOVERY` back to `NONE`.
    pub max_recovery_attempts: u32,
    pub default_task_weight: u32,
    pub tag_weights: HashMap<String, u32>,
    /// In-flight tasks of one graph allowed on one processor.
    pub graph_processor_budget: usize,
    pub accept_results_after_stop: bool,
    /// An `IN_PROGRESS` task assigned longer ago than this goes back to
    /// `NONE` on the next poll. `0` disables the check.
    pub task_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            max_internal_executors: 2,
            poll_budget_ms: 2000,
            max_recovery_attempts: 3,
            default_task_weight: 1,
            tag_weights: HashMap::new(),
            graph_processor_budget: 5,
            accept_results_after_stop: true,
            task_timeout_ms: 30 * 60 * 1000,
        }
    }
}

impl RuntimeConfig {
    /// Load config from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Quota weight of a task with the given tag.
    pub fn weight_for(&self, tag: Option<&str>) -> u32 {
        tag.and_then(|t| self.tag_weights.get(t))
            .copied()
            .unwrap_or(self.default_task_weight)
    }

    /// `None` when expiry is off or the value is too large to ever elapse.
    pub fn task_timeout(&self) -> Option<chrono::Duration> {
        match self.task_timeout_ms {
            0 => None,
            ms => chrono::Duration::from_std(std::time::Duration::from_millis(ms)).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            max_recovery_attempts = 5

            [tag_weights]
            gpu = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.max_recovery_attempts, 5);
        assert_eq!(config.poll_budget_ms, 2000);
        assert_eq!(config.weight_for(Some("gpu")), 4);
        assert_eq!(config.weight_for(Some("cpu")), 1);
        assert_eq!(config.weight_for(None), 1);
        assert_eq!(config.task_timeout(), Some(chrono::Duration::minutes(30)));
    }

    #[test]
    fn zero_timeout_disables_expiry() {
        let config = RuntimeConfig::from_toml_str("task_timeout_ms = 0").unwrap();
        assert_eq!(config.task_timeout(), None);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("poll_budget_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
