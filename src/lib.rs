//! Phased code-change orchestration with a citation-backed repository memory.
//!
//! An [`Orchestrator`] turns requirements into an [`ImplementationPlan`],
//! drives every task through bounded Generate/Verify/Review attempts, and
//! commits at task and phase boundaries. The [`MemoryService`] keeps facts
//! about each repository together with the file citations that back them,
//! and feeds the ones that still check out into later prompts.

pub mod assistant;
pub mod config;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod phase;
pub mod plan;
pub mod stream;
pub mod util;
pub mod vcs;

pub use config::Config;
pub use errors::{MemoryError, OrchestratorError, PlanParseError};
pub use memory::{MemoryRecord, MemoryService, RepositoryId};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, Workflow, WorkflowEvent, WorkflowSnapshot, WorkflowStatus,
};
pub use plan::ImplementationPlan;
