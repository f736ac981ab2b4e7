use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::queue::QueuePaths;
use crate::{wlog_debug, Error, Result};

/// Default generator timeout (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Default queue poll interval for the worker.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub worktree_dir: Option<String>,
    pub queue_dir: Option<String>,
    pub snapshot_dir: Option<String>,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub regression: RegressionConfig,
}

/// How the external code-generation CLI is invoked.
///
/// `{prompt}` in `args` is replaced with the full prompt text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: "gemini".to_string(),
            args: vec![
                "-p".to_string(),
                "{prompt}".to_string(),
                "-o".to_string(),
                "json".to_string(),
            ],
            model: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// A project descriptor file and the test command it implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestProbe {
    pub descriptor: String,
    pub command: String,
}

impl TestProbe {
    pub fn new(descriptor: &str, command: &str) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            command: command.to_string(),
        }
    }
}

/// Batch-level regression check settings. First matching probe wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionConfig {
    pub probes: Vec<TestProbe>,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            probes: vec![
                TestProbe::new("package.json", "npm test"),
                TestProbe::new("Cargo.toml", "cargo test"),
            ],
        }
    }
}

impl Config {
    pub fn weft_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".weft"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::weft_dir()?.join("weft.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::weft_dir()?.join("worktrees")),
        }
    }

    /// Queue root, relative to the main repository unless configured.
    pub fn queue_paths(&self, repo_root: &Path) -> QueuePaths {
        let root = match &self.queue_dir {
            Some(dir) => expand_tilde(dir),
            None => repo_root.join(".weft").join("queue"),
        };
        QueuePaths::new(root)
    }

    pub fn snapshot_dir(&self, repo_root: &Path) -> PathBuf {
        match &self.snapshot_dir {
            Some(dir) => expand_tilde(dir),
            None => repo_root.join(".weft").join("snapshots"),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        wlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            wlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        wlog_debug!(
            "Config loaded: generator={} worktree_dir={:?} queue_dir={:?}",
            config.generator.command,
            config.worktree_dir,
            config.queue_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let weft_dir = Self::weft_dir()?;
        if !weft_dir.exists() {
            wlog_debug!("Creating weft directory: {}", weft_dir.display());
            fs::create_dir_all(&weft_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        wlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let worktrees_dir = self.worktrees_dir()?;
        if !worktrees_dir.exists() {
            wlog_debug!("Creating worktrees directory: {}", worktrees_dir.display());
            fs::create_dir_all(&worktrees_dir)
                .map_err(|e| Error::Setup(format!("{}: {}", worktrees_dir.display(), e)))?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
