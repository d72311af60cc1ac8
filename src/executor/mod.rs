//! Bounded-retry execution of a single task.
//!
//! Each attempt runs three roles in order: Generate, Verify, Review. A
//! failing role ends the attempt and its feedback is handed to the next
//! Generate. Only an attempt where all three pass completes the task, which
//! is then committed on its own.

mod agent;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use agent::{AssistantTaskAgent, COMPLETION_PROMISE, parse_verdict};

use crate::memory::{MemoryService, RepositoryId, extract_conventions, extract_discoveries};
use crate::plan::{ImplementationPhase, PhaseTask, VerificationRecord, WorkStatus};
use crate::vcs::VersionControl;

/// Attempts per task before it is marked Failed.
pub const MAX_ATTEMPTS: u32 = 3;

/// Result of one role invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Passed { output: String },
    Failed { feedback: String },
}

impl StepOutcome {
    pub fn passed(output: impl Into<String>) -> Self {
        StepOutcome::Passed {
            output: output.into(),
        }
    }

    pub fn failed(feedback: impl Into<String>) -> Self {
        StepOutcome::Failed {
            feedback: feedback.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Generate,
    Verify,
    Review,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Generate => "generate",
            Step::Verify => "verify",
            Step::Review => "review",
        }
    }
}

/// What a role sees besides the task itself.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub phase_name: String,
    pub phase_description: String,
    pub acceptance_criteria: Vec<String>,
    /// Verified repository memory, already formatted for prompts
    pub memory: Option<String>,
}

impl TaskContext {
    pub fn for_phase(phase: &ImplementationPhase, memory: Option<String>) -> Self {
        Self {
            phase_name: phase.name.clone(),
            phase_description: phase.description.clone(),
            acceptance_criteria: phase.acceptance_criteria.clone(),
            memory,
        }
    }
}

/// The three roles of a task attempt.
///
/// An `Err` from any role is treated like `StepOutcome::Failed` with the
/// error text as feedback.
#[async_trait]
pub trait TaskAgent: Send + Sync {
    /// Produce or modify working-tree content. `task.last_feedback` carries
    /// the previous attempt's failure, if any.
    async fn generate(&self, task: &PhaseTask, ctx: &TaskContext) -> anyhow::Result<StepOutcome>;

    async fn verify(&self, task: &PhaseTask, generated: &str) -> anyhow::Result<StepOutcome>;

    async fn review(
        &self,
        task: &PhaseTask,
        ctx: &TaskContext,
        generated: &str,
    ) -> anyhow::Result<StepOutcome>;
}

/// Receives progress notes from the executor and phase runner.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, message: &str, data: serde_json::Value);

    /// Called after each task dispatch with the phase's current state.
    fn phase_updated(&self, _phase: &ImplementationPhase, _iterations: u32) {}
}

/// Discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&self, _message: &str, _data: serde_json::Value) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        commit: String,
        /// Conventions the assistant reported while generating
        conventions: Vec<String>,
    },
    Failed {
        detail: String,
    },
    /// Stopped between steps; the task stays InProgress and nothing was committed
    Cancelled,
}

pub struct TaskExecutor {
    agent: Arc<dyn TaskAgent>,
    vcs: Arc<dyn VersionControl>,
    memory: Option<(MemoryService, RepositoryId)>,
}

impl TaskExecutor {
    pub fn new(agent: Arc<dyn TaskAgent>, vcs: Arc<dyn VersionControl>) -> Self {
        Self {
            agent,
            vcs,
            memory: None,
        }
    }

    /// Store `<memory>` discoveries from Generate output for `repository`.
    pub fn with_memory(mut self, service: MemoryService, repository: RepositoryId) -> Self {
        self.memory = Some((service, repository));
        self
    }

    /// Drive `task` to Completed or Failed.
    ///
    /// Returns `Err` only for failures outside the attempt loop, such as a
    /// commit that could not be written. The task is then still InProgress and
    /// nothing from the attempt has been recorded as done.
    pub async fn execute(
        &self,
        task: &mut PhaseTask,
        ctx: &TaskContext,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<TaskOutcome> {
        if task.status == WorkStatus::Completed {
            return Ok(TaskOutcome::Completed {
                commit: String::new(),
                conventions: Vec::new(),
            });
        }
        task.status = WorkStatus::InProgress;

        while task.attempt_count < MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }
            task.attempt_count += 1;
            let attempt = task.attempt_count;
            tracing::debug!(task = %task.id, attempt, "Starting attempt");

            let generated = match self.run_step(Step::Generate, task, ctx, "", progress).await {
                StepOutcome::Passed { output } => output,
                StepOutcome::Failed { feedback } => {
                    task.last_feedback = Some(feedback);
                    continue;
                }
            };
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }

            let verified = self.run_step(Step::Verify, task, ctx, &generated, progress).await;
            task.verification = Some(match &verified {
                StepOutcome::Passed { output } => VerificationRecord::new(true, output.clone()),
                StepOutcome::Failed { feedback } => VerificationRecord::new(false, feedback.clone()),
            });
            if let StepOutcome::Failed { feedback } = verified {
                task.last_feedback = Some(format!("Verification failed:\n{}", feedback));
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }

            if let StepOutcome::Failed { feedback } =
                self.run_step(Step::Review, task, ctx, &generated, progress).await
            {
                task.last_feedback = Some(format!("Review rejected the change:\n{}", feedback));
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }

            // A failed commit leaves the task InProgress for a retry to redo.
            self.vcs.stage("*").await?;
            let commit = self
                .vcs
                .commit(&format!("[cairn] task {}: {}", task.id, commit_subject(&task.description)))
                .await
                .with_context(|| format!("Failed to commit task {}", task.id))?;
            let conventions = self.absorb(&generated).await;
            task.status = WorkStatus::Completed;
            task.last_feedback = None;
            tracing::info!(task = %task.id, attempts = attempt, commit = %commit, "Task completed");
            progress.progress(
                &format!("Task {} completed", task.id),
                json!({"task_id": task.id, "attempts": attempt, "commit": commit}),
            );
            return Ok(TaskOutcome::Completed { commit, conventions });
        }

        task.status = WorkStatus::Failed;
        let detail = task
            .last_feedback
            .clone()
            .unwrap_or_else(|| "No feedback recorded".to_string());
        tracing::warn!(task = %task.id, attempts = task.attempt_count, "Task failed after exhausting attempts");
        progress.progress(
            &format!("Task {} failed after {} attempts", task.id, task.attempt_count),
            json!({"task_id": task.id, "attempts": task.attempt_count, "detail": detail}),
        );
        Ok(TaskOutcome::Failed { detail })
    }

    async fn run_step(
        &self,
        step: Step,
        task: &PhaseTask,
        ctx: &TaskContext,
        generated: &str,
        progress: &dyn ProgressSink,
    ) -> StepOutcome {
        let result = match step {
            Step::Generate => self.agent.generate(task, ctx).await,
            Step::Verify => self.agent.verify(task, generated).await,
            Step::Review => self.agent.review(task, ctx, generated).await,
        };
        let outcome = result.unwrap_or_else(|e| StepOutcome::failed(format!("{:#}", e)));
        let passed = matches!(outcome, StepOutcome::Passed { .. });
        tracing::debug!(task = %task.id, step = step.as_str(), passed, "Step finished");
        progress.progress(
            &format!(
                "Task {} attempt {}: {} {}",
                task.id,
                task.attempt_count,
                step.as_str(),
                if passed { "passed" } else { "failed" }
            ),
            json!({
                "task_id": task.id,
                "attempt": task.attempt_count,
                "step": step.as_str(),
                "passed": passed,
            }),
        );
        outcome
    }

    /// Store discoveries and collect conventions from Generate output.
    async fn absorb(&self, generated: &str) -> Vec<String> {
        if let Some((service, repository)) = &self.memory {
            let discoveries = extract_discoveries(generated);
            if !discoveries.is_empty()
                && let Err(e) = service.record_discoveries(repository, discoveries).await
            {
                tracing::warn!(error = %e, "Failed to store discoveries");
            }
        }
        extract_conventions(generated)
    }
}

/// First line of a description, capped for commit subjects.
fn commit_subject(description: &str) -> String {
    let first = description.lines().next().unwrap_or_default().trim();
    if first.chars().count() > 72 {
        let head: String = first.chars().take(69).collect();
        format!("{}...", head)
    } else {
        first.to_string()
    }
}
