//! Requirements text to [`ImplementationPlan`].
//!
//! The assistant's reply is free text expected to embed one JSON object.
//! Decoding never fails outward: an unusable reply becomes
//! [`PlanParse::Invalid`] and the caller gets the fallback plan.

use serde::Deserialize;
use std::sync::Arc;

use super::{ImplementationPlan, PhaseSpec};
use crate::assistant::{SessionConfig, SessionManager};
use crate::errors::PlanParseError;
use crate::util::{extract_json_object, tail_chars};

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a software engineering planner. Break the requirements into ordered phases of ordered tasks.

Respond with JSON matching this schema (no other JSON objects in the reply):
{
  "phases": [
    {
      "name": "Short phase name",
      "description": "What this phase achieves",
      "acceptance_criteria": ["Observable condition that must hold when the phase is done"],
      "tasks": [
        {
          "description": "Concrete change for one focused attempt",
          "target_files": ["path/the/task/creates/or/edits.rs"]
        }
      ]
    }
  ],
  "estimated_duration": "e.g. 2h"
}

Rules:
- Phases run strictly in order; later tasks may depend on earlier file changes.
- Every phase must have at least one task.
- For simple requirements, return one phase with one task. Don't over-decompose.
- target_files are paths relative to the repository root.
"#;

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    phases: Vec<PhaseSpec>,
    #[serde(default)]
    estimated_duration: Option<String>,
}

/// Result of decoding an assistant reply.
#[derive(Debug)]
pub enum PlanParse {
    Parsed(ImplementationPlan),
    Invalid(PlanParseError),
}

impl PlanParse {
    pub fn from_response(text: &str) -> Self {
        let Some(block) = extract_json_object(text) else {
            return PlanParse::Invalid(PlanParseError::NoStructuredBlock);
        };
        let raw: RawPlan = match serde_json::from_str(&block) {
            Ok(raw) => raw,
            Err(e) => return PlanParse::Invalid(PlanParseError::InvalidJson(e)),
        };

        let phases: Vec<PhaseSpec> = raw
            .phases
            .into_iter()
            .map(|mut phase| {
                phase.tasks.retain(|t| !t.description.trim().is_empty());
                phase
            })
            .filter(|phase| !phase.tasks.is_empty())
            .enumerate()
            .map(|(i, mut phase)| {
                if phase.name.trim().is_empty() {
                    phase.name = format!("Phase {}", i + 1);
                }
                phase
            })
            .collect();
        if phases.is_empty() {
            return PlanParse::Invalid(PlanParseError::NoPhases);
        }

        PlanParse::Parsed(ImplementationPlan::from_specs(phases, raw.estimated_duration))
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, PlanParse::Parsed(_))
    }

    /// The parsed plan, or the fallback built from `requirements`.
    pub fn into_plan(self, requirements: &str) -> ImplementationPlan {
        match self {
            PlanParse::Parsed(plan) => plan,
            PlanParse::Invalid(e) => {
                tracing::warn!(error = %e, "Invalid plan response, falling back to single-task plan");
                ImplementationPlan::fallback(requirements)
            }
        }
    }
}

/// Turns requirements into a plan through the assistant.
pub struct PlanGenerator {
    sessions: Arc<SessionManager>,
    session_config: SessionConfig,
}

impl PlanGenerator {
    pub fn new(sessions: Arc<SessionManager>, working_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            sessions,
            session_config: SessionConfig::new("planner", working_dir)
                .with_system_prompt(PLANNER_SYSTEM_PROMPT),
        }
    }

    pub fn build_prompt(requirements: &str, context: Option<&str>) -> String {
        let mut prompt = format!("## Requirements\n\n{}\n\n", requirements.trim());
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            prompt.push_str(context.trim());
            prompt.push_str("\n\n");
        }
        prompt.push_str("Respond with the JSON plan.");
        prompt
    }

    /// Always returns a plan; assistant or decoding failures yield the fallback.
    pub async fn generate(&self, requirements: &str, context: Option<&str>) -> ImplementationPlan {
        let prompt = Self::build_prompt(requirements, context);
        let response = match self.request(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Planner call failed, falling back to single-task plan");
                return ImplementationPlan::fallback(requirements);
            }
        };

        let parsed = PlanParse::from_response(&response);
        if !parsed.is_parsed() {
            tracing::debug!(response = %tail_chars(&response, 500), "Unusable planner response");
        }
        let plan = parsed.into_plan(requirements);
        tracing::info!(
            plan_id = %plan.id,
            phases = plan.phases.len(),
            tasks = plan.task_count(),
            "Generated plan"
        );
        plan
    }

    async fn request(&self, prompt: &str) -> anyhow::Result<String> {
        let lease = self.sessions.acquire(&self.session_config).await?;
        lease.send(prompt).await
    }
}
