//! Runtime configuration for cairn.
//!
//! Configuration is read from `.cairn/cairn.toml` inside the target
//! repository. Every section has defaults, so a missing file or a partial
//! file is valid. The assistant command can be overridden with the
//! `CAIRN_ASSISTANT_CMD` environment variable.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! max_iterations = 50
//! branch_prefix = "cairn/"
//! create_branch = true
//! push = true
//! remote = "origin"
//! state_dir = ".cairn/state"
//!
//! [memory]
//! dir = ".cairn/memory"
//! prune_interval_secs = 3600
//! context_limit = 20
//!
//! [assistant]
//! command = "claude"
//! skip_permissions = true
//!
//! [verify]
//! commands = ["cargo check"]
//! timeout_secs = 600
//!
//! [guidance]
//! enabled = true
//! file = "CLAUDE.md"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::OrchestratorError;

/// Directory (relative to the repository root) holding cairn's files.
pub const CAIRN_DIR: &str = ".cairn";

/// Name of the configuration file inside [`CAIRN_DIR`].
pub const CONFIG_FILE: &str = "cairn.toml";

/// Orchestration loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Upper bound on task dispatches per workflow
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Prefix for workflow branches
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Whether `start` creates and checks out a workflow branch
    #[serde(default = "default_true")]
    pub create_branch: bool,
    /// Whether phase checkpoints are pushed
    #[serde(default = "default_true")]
    pub push: bool,
    /// Remote used for pushes
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Where plan/status documents are written (relative to the repository)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_max_iterations() -> u32 {
    50
}

fn default_branch_prefix() -> String {
    "cairn/".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            branch_prefix: default_branch_prefix(),
            create_branch: true,
            push: true,
            remote: default_remote(),
            state_dir: None,
        }
    }
}

/// Memory subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    /// Directory for the durable memory collection
    #[serde(default = "default_memory_dir")]
    pub dir: PathBuf,
    /// Seconds between background prune runs
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Maximum number of verified memories injected into prompts
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
}

fn default_memory_dir() -> PathBuf {
    PathBuf::from(CAIRN_DIR).join("memory")
}

fn default_prune_interval_secs() -> u64 {
    3600
}

fn default_context_limit() -> usize {
    20
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            dir: default_memory_dir(),
            prune_interval_secs: default_prune_interval_secs(),
            context_limit: default_context_limit(),
        }
    }
}

impl MemorySection {
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// Generation assistant settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantSection {
    /// Assistant CLI command
    #[serde(default = "default_assistant_command")]
    pub command: String,
    /// Pass `--dangerously-skip-permissions`
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// Optional model override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_assistant_command() -> String {
    "claude".to_string()
}

impl Default for AssistantSection {
    fn default() -> Self {
        Self {
            command: default_assistant_command(),
            skip_permissions: true,
            model: None,
        }
    }
}

/// Task verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySection {
    /// Shell commands run after every Generate step; all must exit 0
    #[serde(default)]
    pub commands: Vec<String>,
    /// Per-command timeout
    #[serde(default = "default_verify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_verify_timeout_secs() -> u64 {
    600
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_secs: default_verify_timeout_secs(),
        }
    }
}

impl VerifySection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Persisted guidance file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_guidance_file")]
    pub file: PathBuf,
}

fn default_guidance_file() -> PathBuf {
    PathBuf::from("CLAUDE.md")
}

impl Default for GuidanceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            file: default_guidance_file(),
        }
    }
}

/// The full `cairn.toml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub assistant: AssistantSection,
    #[serde(default)]
    pub verify: VerifySection,
    #[serde(default)]
    pub guidance: GuidanceSection,
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cairn.toml")
    }

    /// Load `<repo>/.cairn/cairn.toml`, falling back to defaults when absent.
    ///
    /// Applies the `CAIRN_ASSISTANT_CMD` override and validates the result.
    pub fn load_or_default(repo_dir: &Path) -> Result<Self> {
        let path = repo_dir.join(CAIRN_DIR).join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        if let Ok(cmd) = std::env::var("CAIRN_ASSISTANT_CMD")
            && !cmd.trim().is_empty()
        {
            config.assistant.command = cmd;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let invalid = |msg: &str| Err(OrchestratorError::InvalidConfig(msg.to_string()));

        if self.orchestrator.max_iterations == 0 {
            return invalid("orchestrator.max_iterations must be at least 1");
        }
        if self.orchestrator.push && self.orchestrator.remote.trim().is_empty() {
            return invalid("orchestrator.remote must be set when push is enabled");
        }
        if self.memory.prune_interval_secs == 0 {
            return invalid("memory.prune_interval_secs must be at least 1");
        }
        if self.assistant.command.trim().is_empty() {
            return invalid("assistant.command must not be empty");
        }
        if self.verify.timeout_secs == 0 {
            return invalid("verify.timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Resolve a configured path against the repository root.
    pub fn resolve(repo_dir: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            repo_dir.join(path)
        }
    }
}
