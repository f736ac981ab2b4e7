//! Prompt assembly and response parsing for step generation.

use regex::Regex;
use std::sync::LazyLock;

use crate::core::{Caution, AMBIGUITY_MARKER};

/// First fenced block, with an optional language tag on the opening fence.
static FENCED_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[\w.+-]*[ \t]*\r?\n(.*?)```").unwrap());

/// Shown in place of a target file's contents when it does not exist yet.
pub const NEW_FILE_PLACEHOLDER: &str = "(new file)";

/// A target file as the generator sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContext {
    pub path: String,
    pub content: Option<String>,
}

/// Build the instruction prompt for one step.
pub fn build_step_prompt(description: &str, files: &[FileContext], cautions: &[Caution]) -> String {
    let file_section = if files.is_empty() {
        "(no target files)\n".to_string()
    } else {
        files
            .iter()
            .map(|f| {
                format!(
                    "### File: {}\n```\n{}\n```\n",
                    f.path,
                    f.content.as_deref().unwrap_or(NEW_FILE_PLACEHOLDER)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let caution_section = if cautions.is_empty() {
        "None.".to_string()
    } else {
        cautions
            .iter()
            .map(Caution::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Instructions\n\
         Carry out the implementation step below exactly. No design decisions are needed.\n\n\
         ## Step\n{description}\n\n\
         ## Target files\n{file_section}\n\
         ## Cautions\n{caution_section}\n\n\
         ## If anything is unclear\n\
         Do not change anything. Reply with a single line in this form:\n\
         {AMBIGUITY_MARKER} <what is unclear>\n\n\
         ## Output\n\
         Output the complete new contents of the first target file in one fenced code block.\n"
    )
}

/// True when the reply begins with the clarification marker.
pub fn is_ambiguous(text: &str) -> bool {
    text.starts_with(AMBIGUITY_MARKER)
}

/// Contents of the first fenced block, or the trimmed text when there is none.
pub fn extract_code_block(text: &str) -> String {
    FENCED_BLOCK_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| text.trim().to_string())
}

/// Caution describing a failed step test, fed into the regeneration prompt.
pub fn test_failure_caution(command: &str, exit_code: i32, output: &str) -> Caution {
    Caution::new(
        &format!("Test command `{}` failed with exit code {}", command, exit_code),
        &format!(
            "The previous output did not pass its test. Fix the following failure:\n{}",
            output.trim()
        ),
    )
}

/// Caution describing a failed batch-level regression run.
pub fn regression_caution(command: &str, output: &str) -> Caution {
    Caution::new(
        &format!("Regression suite `{}` failed after applying this batch", command),
        &format!(
            "Regenerate the change so the existing suite passes. Failure output:\n{}",
            output.trim()
        ),
    )
}
