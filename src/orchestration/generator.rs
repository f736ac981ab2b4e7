//! Text generation backends.
//!
//! The executor only sees the [`Generator`] trait: a prompt goes in, text
//! comes out. [`CommandGenerator`] shells out to a headless model CLI and
//! unwraps its JSON envelope.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::config::GeneratorConfig;
use crate::util::with_timeout;
use crate::{wlog_debug, wlog_trace, Error, Result};

/// Placeholder in configured arguments replaced by the prompt text.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Envelope fields checked, in order, for the generated text.
const RESPONSE_FIELDS: [&str; 3] = ["response", "text", "result"];

/// Output of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Extracted response text.
    pub text: String,
    /// Unprocessed backend output.
    pub raw: String,
    pub duration_ms: u64,
}

impl Generation {
    pub fn from_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            raw: text.to_string(),
            duration_ms: 0,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Generation>;
}

/// Headless CLI backend, configured by [`GeneratorConfig`].
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    binary: PathBuf,
    args: Vec<String>,
    model: Option<String>,
    timeout: Duration,
}

impl CommandGenerator {
    /// Resolve the configured command on `PATH`.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let binary = which::which(&config.command)
            .map_err(|_| Error::GeneratorNotFound(config.command.clone()))?;
        Ok(Self {
            binary,
            args: config.args.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self {
            binary,
            args,
            model: None,
            timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Command-line arguments for `prompt`, model flag first.
    pub fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 2);
        if let Some(model) = &self.model {
            args.push("-m".to_string());
            args.push(model.clone());
        }
        let mut substituted = false;
        for arg in &self.args {
            if arg.contains(PROMPT_PLACEHOLDER) {
                args.push(arg.replace(PROMPT_PLACEHOLDER, prompt));
                substituted = true;
            } else {
                args.push(arg.clone());
            }
        }
        if !substituted {
            args.push(prompt.to_string());
        }
        args
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, prompt: &str) -> Result<Generation> {
        wlog_debug!(
            "Generating with {} ({} chars prompt)",
            self.binary.display(),
            prompt.len()
        );
        let started = Instant::now();
        let child = Command::new(&self.binary)
            .args(self.build_args(prompt))
            .kill_on_drop(true)
            .output();
        let output = with_timeout(self.timeout, async { child.await.map_err(Error::Io) }).await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        wlog_trace!("Generator stdout: {}", stdout);

        if !output.status.success() && stdout.trim().is_empty() {
            let message = if stderr.trim().is_empty() {
                format!("exit code {}", output.status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Generation(message));
        }

        Ok(Generation {
            text: extract_response(&stdout),
            raw: stdout,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// The span from the first `{` to the last `}`, if there is one.
pub fn json_span(raw: &str) -> Option<&str> {
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&raw[start..=end]),
        _ => None,
    }
}

/// Pull the response text out of a JSON envelope.
///
/// The envelope is the span from the first `{` to the last `}` so that
/// banner lines around it are ignored. Anything unparseable falls back to
/// the trimmed raw output.
pub fn extract_response(raw: &str) -> String {
    let Some(envelope) = json_span(raw) else {
        return raw.trim().to_string();
    };
    match serde_json::from_str::<Value>(envelope) {
        Ok(value) => RESPONSE_FIELDS
            .iter()
            .find_map(|field| value.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| raw.trim().to_string()),
        Err(e) => {
            wlog_debug!("Generator output is not a JSON envelope: {}", e);
            raw.trim().to_string()
        }
    }
}
