//! Phase execution and checkpointing.
//!
//! [`PhaseRunner`] dispatches a phase's tasks in plan order through the
//! [`TaskExecutor`], stops at the first failed task, and on acceptance makes
//! the phase checkpoint: commit, push, then guidance update.

mod guidance;

use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use guidance::{GuidanceUpdater, MarkdownGuidance};

use crate::executor::{ProgressSink, TaskContext, TaskExecutor, TaskOutcome};
use crate::plan::{ImplementationPhase, WorkStatus};
use crate::vcs::VersionControl;

/// Workflow-wide cap on task dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    used: u32,
    max: u32,
}

impl IterationBudget {
    pub fn new(used: u32, max: u32) -> Self {
        Self { used, max }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Take one dispatch; `false` when none are left.
    pub fn consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used += 1;
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// `commit` is `None` when the phase was already complete
    Completed { commit: Option<String> },
    Failed { task_id: String, detail: String },
    Cancelled,
    BudgetExhausted,
}

pub struct PhaseRunner {
    executor: TaskExecutor,
    vcs: Arc<dyn VersionControl>,
    guidance: Option<Arc<dyn GuidanceUpdater>>,
    push_branch: Option<String>,
}

impl PhaseRunner {
    pub fn new(executor: TaskExecutor, vcs: Arc<dyn VersionControl>) -> Self {
        Self {
            executor,
            vcs,
            guidance: None,
            push_branch: None,
        }
    }

    pub fn with_guidance(mut self, guidance: Arc<dyn GuidanceUpdater>) -> Self {
        self.guidance = Some(guidance);
        self
    }

    /// Push `branch` after every phase commit.
    pub fn with_push(mut self, branch: impl Into<String>) -> Self {
        self.push_branch = Some(branch.into());
        self
    }

    /// Run every unfinished task of `phase`.
    ///
    /// `Err` is reserved for checkpoint failures (commit or push). The phase is
    /// left InProgress so a re-run finishes the checkpoint; a phase commit
    /// that already succeeded is not repeated.
    pub async fn run(
        &self,
        phase: &mut ImplementationPhase,
        memory: Option<String>,
        budget: &mut IterationBudget,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<PhaseOutcome> {
        if phase.status == WorkStatus::Completed {
            return Ok(PhaseOutcome::Completed { commit: None });
        }

        let ctx = TaskContext::for_phase(phase, memory);
        let mut conventions: Vec<String> = Vec::new();

        for i in 0..phase.tasks.len() {
            if phase.tasks[i].status == WorkStatus::Completed || phase.tasks[i].skipped {
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(PhaseOutcome::Cancelled);
            }
            if !budget.consume() {
                tracing::warn!(phase = phase.number(), used = budget.used(), "Iteration budget exhausted");
                return Ok(PhaseOutcome::BudgetExhausted);
            }
            if phase.status == WorkStatus::NotStarted {
                phase.advance(WorkStatus::InProgress);
                progress.progress(
                    &format!("Phase {} started: {}", phase.number(), phase.name),
                    json!({"phase": phase.number(), "name": phase.name}),
                );
            }

            let outcome = self
                .executor
                .execute(&mut phase.tasks[i], &ctx, cancel, progress)
                .await;
            progress.phase_updated(phase, budget.used());

            match outcome? {
                TaskOutcome::Completed {
                    conventions: found, ..
                } => conventions.extend(found),
                TaskOutcome::Failed { detail } => {
                    phase.advance(WorkStatus::Failed);
                    return Ok(PhaseOutcome::Failed {
                        task_id: phase.tasks[i].id.clone(),
                        detail,
                    });
                }
                TaskOutcome::Cancelled => return Ok(PhaseOutcome::Cancelled),
            }
        }

        if let Some(task) = phase
            .tasks
            .iter()
            .find(|t| !t.skipped && !(t.status == WorkStatus::Completed && t.is_verified()))
        {
            let task_id = task.id.clone();
            phase.advance(WorkStatus::Failed);
            return Ok(PhaseOutcome::Failed {
                detail: format!("Task {} has no passing verification on record", task_id),
                task_id,
            });
        }
        if cancel.is_cancelled() {
            return Ok(PhaseOutcome::Cancelled);
        }

        // Tasks may all be Completed from a previous run while the phase is not.
        if phase.status == WorkStatus::NotStarted {
            phase.advance(WorkStatus::InProgress);
        }

        // The phase stays InProgress until the checkpoint is fully made.
        let commit = match phase.checkpoint.clone() {
            Some(commit) => commit,
            None => {
                self.vcs.stage("*").await?;
                let commit = self
                    .vcs
                    .commit(&format!("[cairn] phase {}: {}", phase.number(), phase.name))
                    .await?;
                phase.checkpoint = Some(commit.clone());
                progress.phase_updated(phase, budget.used());
                commit
            }
        };
        if let Some(branch) = &self.push_branch {
            self.vcs
                .push(branch)
                .await
                .with_context(|| format!("Failed to push phase {} to {}", phase.number(), branch))?;
        }
        phase.advance(WorkStatus::Completed);
        progress.phase_updated(phase, budget.used());
        tracing::info!(phase = phase.number(), commit = %commit, "Phase completed");

        if !conventions.is_empty()
            && let Some(guidance) = &self.guidance
            && let Err(e) = guidance.update(&conventions).await
        {
            tracing::warn!(error = %e, "Failed to update guidance");
        }

        progress.progress(
            &format!("Phase {} completed: {}", phase.number(), phase.name),
            json!({"phase": phase.number(), "commit": commit, "conventions": conventions.len()}),
        );
        Ok(PhaseOutcome::Completed {
            commit: Some(commit),
        })
    }
}
