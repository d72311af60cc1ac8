//! Typed error hierarchy for cairn.
//!
//! Three enums cover the three seams:
//! - `MemoryError`: memory store and memory service failures
//! - `OrchestratorError`: workflow control surface failures
//! - `PlanParseError`: assistant plan output that could not be decoded
//!
//! Step failures inside a task attempt are not errors; they are
//! `StepOutcome::Failed` values retried by the executor.

use thiserror::Error;

/// Errors from the memory subsystem.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Memory {id} not found")]
    NotFound { id: String },

    #[error("Memory {id} citations changed concurrently")]
    Conflict { id: String },

    #[error("Memory storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl MemoryError {
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        MemoryError::Storage(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MemoryError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MemoryError::Conflict { .. })
    }
}

/// Errors from the orchestration control surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: String },

    #[error("Repository {repository} already has an active workflow ({workflow_id})")]
    RepositoryBusy {
        repository: String,
        workflow_id: String,
    },

    #[error("Workflow {id} is still running")]
    WorkflowRunning { id: String },

    #[error("Workflow {id} has nothing to resume")]
    NothingToResume { id: String },

    #[error("Version control error: {0}")]
    Vcs(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reasons an assistant response could not be decoded into a plan.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("No structured block found in assistant output")]
    NoStructuredBlock,

    #[error("Structured block is not a valid plan: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Plan contains no phases with tasks")]
    NoPhases,
}
