//! Pipeline definitions and the compiled process-graph template.

use crate::context::TOP_LEVEL_CONTEXT_ID;
use crate::error::DispatchError;
use crate::task::FunctionRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Reserved code of the synthetic step that closes every run.
pub const FINISH_PROCESS_CODE: &str = "pipeline.finish";

/// How the children of a composite process are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProcessLogic {
    /// Children run in parallel and all gate the parent's descendants.
    And,
    /// Declared but not executable.
    Or,
    /// Children run one after another.
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProcesses {
    pub logic: SubProcessLogic,
    pub processes: Vec<ProcessDefinition>,
}

/// One step of a pipeline as written by the author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    pub function: FunctionRef,
    /// Filled in when the template is compiled.
    #[serde(default)]
    pub process_context_id: String,
    #[serde(default)]
    pub sub_processes: Option<SubProcesses>,
    /// Guard evaluated before the task is dispatched.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub metas: BTreeMap<String, String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ProcessDefinition {
    pub fn new(code: impl Into<String>, function: FunctionRef) -> Self {
        Self {
            code: code.into(),
            name: None,
            function,
            process_context_id: String::new(),
            sub_processes: None,
            condition: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            tag: None,
            metas: BTreeMap::new(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metas.insert(key.into(), value.into());
        self
    }

    pub fn with_sub_processes(mut self, logic: SubProcessLogic, processes: Vec<ProcessDefinition>) -> Self {
        self.sub_processes = Some(SubProcesses { logic, processes });
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metas.get(key).map(String::as_str)
    }

    pub fn is_composite(&self) -> bool {
        self.sub_processes
            .as_ref()
            .map_or(false, |s| !s.processes.is_empty())
    }

    pub fn logic(&self) -> Option<SubProcessLogic> {
        self.sub_processes.as_ref().map(|s| s.logic)
    }

    fn finish() -> Self {
        Self::new(FINISH_PROCESS_CODE, FunctionRef::internal(FINISH_PROCESS_CODE))
    }
}

/// Pipeline source as loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    pub processes: Vec<ProcessDefinition>,
}

impl PipelineTemplate {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: None,
            processes: Vec::new(),
        }
    }

    pub fn with_process(mut self, process: ProcessDefinition) -> Self {
        self.processes.push(process);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, DispatchError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Read-only, validated form of a [`PipelineTemplate`].
///
/// Every process carries its context id, and composite processes are indexed
/// by code so that expansion can look up their children in O(1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGraphTemplate {
    code: String,
    top_level: Vec<String>,
    processes: BTreeMap<String, ProcessDefinition>,
    children: BTreeMap<String, Vec<String>>,
}

impl ProcessGraphTemplate {
    pub fn compile(template: PipelineTemplate) -> Result<Self, DispatchError> {
        if template.processes.is_empty() {
            return Err(DispatchError::InvalidTemplate(format!(
                "pipeline '{}' has no processes",
                template.code
            )));
        }

        let mut compiled = Self {
            code: template.code,
            top_level: Vec::new(),
            processes: BTreeMap::new(),
            children: BTreeMap::new(),
        };
        let mut seen = HashSet::new();
        let mut counter = 1u32;
        let last = template.processes.len() - 1;

        for (idx, mut process) in template.processes.into_iter().enumerate() {
            if process.code == FINISH_PROCESS_CODE && idx != last {
                return Err(DispatchError::InvalidTemplate(format!(
                    "'{FINISH_PROCESS_CODE}' must be the last process"
                )));
            }
            process.process_context_id = TOP_LEVEL_CONTEXT_ID.to_string();
            compiled.top_level.push(process.code.clone());
            compiled.register(process, &mut seen, &mut counter)?;
        }

        if !compiled.processes.contains_key(FINISH_PROCESS_CODE) {
            let mut finish = ProcessDefinition::finish();
            finish.process_context_id = TOP_LEVEL_CONTEXT_ID.to_string();
            compiled.top_level.push(finish.code.clone());
            compiled.processes.insert(finish.code.clone(), finish);
        }
        Ok(compiled)
    }

    fn register(
        &mut self,
        mut process: ProcessDefinition,
        seen: &mut HashSet<String>,
        counter: &mut u32,
    ) -> Result<(), DispatchError> {
        if !seen.insert(process.code.clone()) {
            return Err(DispatchError::InvalidTemplate(format!(
                "duplicate process code '{}'",
                process.code
            )));
        }

        if let Some(sub) = process.sub_processes.take() {
            if !sub.processes.is_empty() && !process.function.is_internal() {
                return Err(DispatchError::InvalidTemplate(format!(
                    "process '{}' has sub-processes but its function '{}' is not internal",
                    process.code, process.function.code
                )));
            }

            let parent_ctx = process.process_context_id.clone();
            let mut next_ctx = || {
                *counter += 1;
                format!("{parent_ctx},{counter}")
            };
            let shared_ctx = match sub.logic {
                SubProcessLogic::Sequential => Some(next_ctx()),
                SubProcessLogic::And | SubProcessLogic::Or => None,
            };

            let mut codes = Vec::with_capacity(sub.processes.len());
            let mut staged = Vec::with_capacity(sub.processes.len());
            for mut child in sub.processes.clone() {
                child.process_context_id = match &shared_ctx {
                    Some(ctx) => ctx.clone(),
                    None => next_ctx(),
                };
                codes.push(child.code.clone());
                staged.push(child);
            }
            for child in staged {
                self.register(child, seen, counter)?;
            }

            self.children.insert(process.code.clone(), codes);
            // keep the structure for serialization of the compiled form
            process.sub_processes = Some(sub);
        }

        self.processes.insert(process.code.clone(), process);
        Ok(())
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Resolves a process by code. The finish step always resolves.
    pub fn find_process(&self, code: &str) -> Option<&ProcessDefinition> {
        self.processes.get(code)
    }

    /// Children of a composite process, in declaration order, with their
    /// compiled context ids.
    pub fn find_sub_processes(&self, code: &str) -> Vec<&ProcessDefinition> {
        self.children
            .get(code)
            .into_iter()
            .flatten()
            .filter_map(|c| self.processes.get(c))
            .collect()
    }

    /// Top-level processes in execution order, ending with the finish step.
    pub fn top_level(&self) -> Vec<&ProcessDefinition> {
        self.top_level
            .iter()
            .filter_map(|c| self.processes.get(c))
            .collect()
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessDefinition> {
        self.processes.values()
    }

    /// Checks every internal function code against `is_known`.
    pub fn check_functions<F>(&self, is_known: F) -> Result<(), Vec<String>>
    where
        F: Fn(&str) -> bool,
    {
        let missing: Vec<String> = self
            .processes
            .values()
            .filter(|p| p.function.is_internal() && !is_known(&p.function.code))
            .map(|p| format!("{} ({})", p.function.code, p.code))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}
