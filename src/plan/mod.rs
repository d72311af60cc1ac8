//! Implementation plans: ordered phases of ordered tasks.
//!
//! A plan is created once per workflow and only its statuses change
//! afterwards. Re-planning produces a new plan.

pub mod generator;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use generator::{PlanGenerator, PlanParse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Completed,
}

/// Status shared by phases and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl WorkStatus {
    /// Forward transitions. `Failed -> InProgress` is only valid through an
    /// explicit retry and is not listed here.
    pub fn can_advance_to(self, to: WorkStatus) -> bool {
        use WorkStatus::*;
        matches!(
            (self, to),
            (NotStarted, InProgress)
                | (NotStarted, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
        ) || self == to
    }
}

/// Last Verify result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub passed: bool,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl VerificationRecord {
    pub fn new(passed: bool, detail: impl Into<String>) -> Self {
        Self {
            passed,
            detail: detail.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTask {
    /// `"{phase number}.{task number}"`, both 1-based
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_feedback: Option<String>,
    #[serde(default)]
    pub verification: Option<VerificationRecord>,
    #[serde(default)]
    pub skipped: bool,
}

impl PhaseTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>, target_files: Vec<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            target_files,
            status: WorkStatus::NotStarted,
            attempt_count: 0,
            last_feedback: None,
            verification: None,
            skipped: false,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification.as_ref().is_some_and(|v| v.passed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationPhase {
    /// 0-based position in the plan
    pub index: usize,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: WorkStatus,
    pub tasks: Vec<PhaseTask>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub skipped: bool,
    /// Phase commit, recorded before the push so a retry only pushes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

impl ImplementationPhase {
    /// 1-based number used in ids and commit messages.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    /// Every task completed with a passing verification on record.
    pub fn is_accepted(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| t.status == WorkStatus::Completed && t.is_verified())
    }

    pub fn failed_task(&self) -> Option<usize> {
        self.tasks.iter().position(|t| t.status == WorkStatus::Failed)
    }

    /// Move forward; refuses regressions such as leaving `Completed`.
    pub fn advance(&mut self, to: WorkStatus) -> bool {
        if self.status.can_advance_to(to) {
            self.status = to;
            true
        } else {
            tracing::warn!(phase = self.number(), from = ?self.status, to = ?to, "Refused phase transition");
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub id: String,
    pub phases: Vec<ImplementationPhase>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

pub const FALLBACK_PHASE_NAME: &str = "Implement requirements";

/// Phase as described by a planner, before numbering.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    #[serde(default)]
    pub target_files: Vec<String>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            target_files: Vec::new(),
        }
    }
}

impl ImplementationPlan {
    /// Number phases and tasks in document order; everything starts NotStarted.
    pub fn from_specs(phases: Vec<PhaseSpec>, estimated_duration: Option<String>) -> Self {
        let phases = phases
            .into_iter()
            .enumerate()
            .map(|(index, spec)| ImplementationPhase {
                index,
                name: spec.name,
                description: spec.description,
                status: WorkStatus::NotStarted,
                tasks: spec
                    .tasks
                    .into_iter()
                    .enumerate()
                    .map(|(t, task)| {
                        PhaseTask::new(
                            format!("{}.{}", index + 1, t + 1),
                            task.description,
                            task.target_files,
                        )
                    })
                    .collect(),
                acceptance_criteria: spec.acceptance_criteria,
                skipped: false,
                checkpoint: None,
            })
            .collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            phases,
            estimated_duration,
            status: PlanStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// One phase with one task restating the requirements.
    pub fn fallback(requirements: &str) -> Self {
        Self::from_specs(
            vec![PhaseSpec {
                name: FALLBACK_PHASE_NAME.to_string(),
                description: "Single-phase plan used when no structured plan was available"
                    .to_string(),
                acceptance_criteria: Vec::new(),
                tasks: vec![TaskSpec::new(requirements.trim())],
            }],
            None,
        )
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    /// Index of the first phase that is neither completed nor skipped.
    pub fn next_open_phase(&self) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| !p.skipped && p.status != WorkStatus::Completed)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize plan")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))
    }
}
