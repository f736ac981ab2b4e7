//! Step and plan data model.
//!
//! A plan is a flat list of steps with declared dependencies, file targets
//! and parallel-safety flags, plus free-text cautions that are threaded into
//! every generation request.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Prefix a generator uses to ask for clarification instead of producing code.
pub const AMBIGUITY_MARKER: &str = "AMBIGUITY:";

/// Identifier of a step, unique within its plan.
///
/// Plans written by hand or by a model use both numeric and string ids,
/// so both are accepted and rendered without quotes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepId {
    Num(i64),
    Name(String),
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepId::Num(n) => write!(f, "{}", n),
            StepId::Name(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for StepId {
    fn from(n: i64) -> Self {
        StepId::Num(n)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId::Name(s.to_string())
    }
}

/// Identifier of the plan run that owns a set of steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a timestamped id of the form `task_YYYYMMDD_HHMMSS`.
    pub fn generate() -> Self {
        Self(Local::now().format("task_%Y%m%d_%H%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn default_parallelizable() -> bool {
    true
}

/// A unit of work handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    pub description: String,
    /// Files this step may write. Only the first one receives the output.
    #[serde(default, alias = "target_files")]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    /// `false` forces the step into a batch of its own.
    #[serde(default = "default_parallelizable")]
    pub parallelizable: bool,
    #[serde(default, alias = "test_command", skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<StepId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            target_files: Vec::new(),
            dependencies: Vec::new(),
            parallelizable: true,
            test_command: None,
        }
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.target_files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_deps(mut self, deps: Vec<StepId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.parallelizable = false;
        self
    }

    pub fn with_test(mut self, command: &str) -> Self {
        self.test_command = Some(command.to_string());
        self
    }

    /// The single file that receives this step's generated output.
    pub fn primary_target(&self) -> Option<&str> {
        self.target_files.first().map(String::as_str)
    }
}

/// Free-text guidance injected into every generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caution {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub instruction: String,
}

impl Caution {
    pub fn new(context: &str, instruction: &str) -> Self {
        Self {
            context: context.to_string(),
            instruction: instruction.to_string(),
        }
    }
}

impl std::fmt::Display for Caution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "- Context: {}\n  Instruction: {}", self.context, self.instruction)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    pub goal: String,
    #[serde(alias = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    pub specs: Vec<String>,
}

/// A complete change request: requirements, steps and cautions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub cautions: Vec<Caution>,
}

impl Plan {
    /// Load a plan from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(&text)?),
            _ => Ok(serde_json::from_str(&text)?),
        }
    }

    /// Check the plan's shape before it is handed to the batch planner.
    ///
    /// Returns warnings on success; structural problems are collected into
    /// a single [`Error::PlanInvalid`].
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.requirements.goal.trim().is_empty() {
            warnings.push("\"requirements.goal\" is empty.".to_string());
        }

        if self.steps.is_empty() {
            errors.push("Plan has no steps. At least one step is required.".to_string());
        }

        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if !seen.insert(&step.id) {
                errors.push(format!("Duplicate step ID found: {}", step.id));
            }
            if step.description.trim().is_empty() {
                errors.push(format!(
                    "Step {} (index {}) is missing \"description\".",
                    step.id, index
                ));
            }
            if step.target_files.len() > 1 {
                warnings.push(format!(
                    "Step {} lists {} target files; only {} will be written.",
                    step.id,
                    step.target_files.len(),
                    step.target_files[0]
                ));
            }
        }

        if self.cautions.is_empty() {
            warnings.push("\"cautions\" is empty. Cautions are recommended for safety.".to_string());
        }
        for (index, caution) in self.cautions.iter().enumerate() {
            if caution.context.is_empty() || caution.instruction.is_empty() {
                warnings.push(format!(
                    "Caution at index {} is missing \"context\" or \"instruction\".",
                    index
                ));
            }
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(Error::PlanInvalid(errors))
        }
    }
}

/// Captured outcome of a test or regression command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output, stderr first, for embedding in cautions and errors.
    pub fn output(&self) -> String {
        match (self.stderr.trim().is_empty(), self.stdout.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stderr.trim_end(), self.stdout.trim_end()),
            (false, true) => self.stderr.trim_end().to_string(),
            (true, false) => self.stdout.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Result of processing one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Extracted code, or the verbatim clarification request.
    pub text: String,
    pub test_result: Option<TestResult>,
    /// Set when the generator replied with a clarification request.
    pub ambiguous: bool,
}

impl ExecutionResult {
    pub fn applied(text: String) -> Self {
        Self {
            text,
            test_result: None,
            ambiguous: false,
        }
    }

    pub fn clarification(text: String) -> Self {
        Self {
            text,
            test_result: None,
            ambiguous: true,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        self.ambiguous
    }

    /// True when there is no test or the test exited zero.
    pub fn succeeded(&self) -> bool {
        self.test_result.as_ref().map_or(true, TestResult::passed)
    }
}
