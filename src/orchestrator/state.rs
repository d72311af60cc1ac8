use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::memory::RepositoryId;
use crate::plan::ImplementationPlan;

const PLAN_FILE: &str = "plan.json";
const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Planning,
    Implementation,
    Validation,
    Complete,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Complete | WorkflowStatus::Failed | WorkflowStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Implementation => "implementation",
            WorkflowStatus::Validation => "validation",
            WorkflowStatus::Complete => "complete",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run from requirements to a committed change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub requirements: String,
    /// Working tree the workflow owns while active
    pub repository: PathBuf,
    pub repository_id: RepositoryId,
    /// 0-based index into the plan's phases
    #[serde(default)]
    pub current_phase: usize,
    #[serde(default)]
    pub current_task: Option<String>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub iteration_count: u32,
    pub max_iterations: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(
        requirements: impl Into<String>,
        repository: impl Into<PathBuf>,
        repository_id: RepositoryId,
        max_iterations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requirements: requirements.into(),
            repository: repository.into(),
            repository_id,
            current_phase: 0,
            current_task: None,
            status: WorkflowStatus::Pending,
            iteration_count: 0,
            max_iterations,
            errors: Vec::new(),
            branch: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// First eight characters of the id.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!(workflow = %self.id, error = %error, "Workflow error");
        self.errors.push(error);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// The workflow record together with its plan, as published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSnapshot {
    pub workflow: Workflow,
    /// `None` until planning finishes
    pub plan: Option<ImplementationPlan>,
}

/// `<dir>/<workflow id>/{plan.json,status.json}`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn workflow_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let dir = self.workflow_dir(&snapshot.workflow.id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        if let Some(plan) = &snapshot.plan {
            write_atomic(&dir.join(PLAN_FILE), &serde_json::to_string_pretty(plan)?)?;
        }
        let status = serde_json::to_string_pretty(&snapshot.workflow)
            .context("Failed to serialize workflow status")?;
        write_atomic(&dir.join(STATUS_FILE), &status)
    }

    pub fn load(&self, id: &str) -> Result<WorkflowSnapshot> {
        let dir = self.workflow_dir(id);
        let status_path = dir.join(STATUS_FILE);
        let content = fs::read_to_string(&status_path)
            .with_context(|| format!("Failed to read workflow status: {}", status_path.display()))?;
        let workflow: Workflow = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse workflow status: {}", status_path.display()))?;

        let plan_path = dir.join(PLAN_FILE);
        let plan = if plan_path.exists() {
            Some(ImplementationPlan::load(&plan_path)?)
        } else {
            None
        };
        Ok(WorkflowSnapshot { workflow, plan })
    }

    pub fn exists(&self, id: &str) -> bool {
        self.workflow_dir(id).join(STATUS_FILE).exists()
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.workflow_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove state directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))
}
