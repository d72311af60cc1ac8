use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use tokio::process::Command;
use tokio::time::timeout;

use super::{StepOutcome, TaskAgent, TaskContext};
use crate::assistant::{SessionConfig, SessionManager};
use crate::config::VerifySection;
use crate::plan::PhaseTask;
use crate::util::tail_chars;

pub const COMPLETION_PROMISE: &str = "<promise>TASK COMPLETE</promise>";

static VERDICT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<verdict>\s*(approve|reject)\s*</verdict>").unwrap());

static FEEDBACK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<feedback>\s*(.*?)\s*</feedback>").unwrap());

const GENERATE_SYSTEM_PROMPT: &str = "You are implementing one task of a larger plan in this repository. \
Make the change directly in the working tree. Do not commit; commits are made for you.";

const REVIEW_SYSTEM_PROMPT: &str = "You are a strict code reviewer. Inspect the working tree for the \
described task and decide whether the change is correct, complete and consistent with the codebase. \
Do not modify any files.";

/// [`TaskAgent`] backed by the generation assistant and local verify commands.
pub struct AssistantTaskAgent {
    sessions: Arc<SessionManager>,
    repo_dir: PathBuf,
    verify: VerifySection,
}

impl AssistantTaskAgent {
    pub fn new(sessions: Arc<SessionManager>, repo_dir: impl Into<PathBuf>, verify: VerifySection) -> Self {
        Self {
            sessions,
            repo_dir: repo_dir.into(),
            verify,
        }
    }

    fn generate_prompt(task: &PhaseTask, ctx: &TaskContext) -> String {
        let mut prompt = String::new();
        if let Some(memory) = &ctx.memory {
            prompt.push_str(memory.trim());
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!(
            "## Phase: {}\n{}\n\n## Task {}\n{}\n",
            ctx.phase_name, ctx.phase_description, task.id, task.description
        ));
        if !task.target_files.is_empty() {
            prompt.push_str(&format!("\nTarget files: {}\n", task.target_files.join(", ")));
        }
        if !ctx.acceptance_criteria.is_empty() {
            prompt.push_str("\n## Acceptance criteria\n");
            for criterion in &ctx.acceptance_criteria {
                prompt.push_str(&format!("- {}\n", criterion));
            }
        }
        if let Some(feedback) = &task.last_feedback {
            prompt.push_str(&format!(
                "\n## Previous attempt failed\nAddress this feedback:\n{}\n",
                feedback
            ));
        }
        prompt.push_str(&format!(
            "\n## Reporting\n\
             - When you learn a durable fact about this repository, report it as \
             <memory>{{\"subject\": \"...\", \"fact\": \"...\", \"reason\": \"...\", \"citations\": [\"path:line\"]}}</memory>\n\
             - Report project conventions worth keeping as <convention>...</convention>\n\
             - Output {} only when the task is fully implemented.\n",
            COMPLETION_PROMISE
        ));
        prompt
    }

    fn review_prompt(task: &PhaseTask, ctx: &TaskContext, generated: &str) -> String {
        let mut prompt = format!(
            "## Task {}\n{}\n\nPhase: {}\n",
            task.id, task.description, ctx.phase_name
        );
        if !ctx.acceptance_criteria.is_empty() {
            prompt.push_str("\nAcceptance criteria:\n");
            for criterion in &ctx.acceptance_criteria {
                prompt.push_str(&format!("- {}\n", criterion));
            }
        }
        prompt.push_str(&format!(
            "\n## Implementer's report\n{}\n\n\
             Respond with <verdict>approve</verdict> or <verdict>reject</verdict>, \
             followed by <feedback>what must change</feedback>.",
            tail_chars(generated.trim(), 4000)
        ));
        prompt
    }

    async fn run_check(&self, command: &str) -> StepOutcome {
        tracing::debug!(command, "Running verify command");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return StepOutcome::failed(format!("Failed to spawn `{}`: {}", command, e)),
        };

        let output = match timeout(self.verify.timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return StepOutcome::failed(format!("Failed to wait for `{}`: {}", command, e)),
            Err(_) => {
                return StepOutcome::failed(format!(
                    "`{}` timed out after {} seconds",
                    command, self.verify.timeout_secs
                ));
            }
        };

        if output.status.success() {
            return StepOutcome::passed(format!("`{}` passed", command));
        }
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        StepOutcome::failed(format!(
            "`{}` exited with {}:\n{}",
            command,
            output.status.code().unwrap_or(-1),
            tail_chars(combined.trim(), 2000)
        ))
    }
}

/// Parse a reviewer reply. A missing verdict counts as a rejection.
pub fn parse_verdict(reply: &str) -> StepOutcome {
    let feedback = FEEDBACK_REGEX
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|f| !f.is_empty());
    let verdict = VERDICT_REGEX
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase());

    match verdict.as_deref() {
        Some("approve") => StepOutcome::passed(feedback.unwrap_or_else(|| "approved".to_string())),
        Some(_) => StepOutcome::failed(
            feedback.unwrap_or_else(|| "Reviewer rejected the change without feedback".to_string()),
        ),
        None => StepOutcome::failed(format!(
            "Reviewer gave no verdict: {}",
            tail_chars(reply.trim(), 500)
        )),
    }
}

#[async_trait]
impl TaskAgent for AssistantTaskAgent {
    async fn generate(&self, task: &PhaseTask, ctx: &TaskContext) -> anyhow::Result<StepOutcome> {
        let config = SessionConfig::new("generate", &self.repo_dir).with_system_prompt(GENERATE_SYSTEM_PROMPT);
        let lease = self.sessions.acquire(&config).await?;
        let output = lease.send(&Self::generate_prompt(task, ctx)).await?;
        if output.contains(COMPLETION_PROMISE) {
            Ok(StepOutcome::passed(output))
        } else {
            Ok(StepOutcome::failed(format!(
                "The assistant did not report the task as complete. Last output:\n{}",
                tail_chars(output.trim(), 1000)
            )))
        }
    }

    async fn verify(&self, task: &PhaseTask, _generated: &str) -> anyhow::Result<StepOutcome> {
        let missing: Vec<&str> = task
            .target_files
            .iter()
            .filter(|f| !self.repo_dir.join(f.as_str()).exists())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Ok(StepOutcome::failed(format!(
                "Target files missing: {}",
                missing.join(", ")
            )));
        }

        let mut passed = Vec::new();
        for command in &self.verify.commands {
            match self.run_check(command).await {
                StepOutcome::Passed { output } => passed.push(output),
                failed => return Ok(failed),
            }
        }
        Ok(StepOutcome::passed(if passed.is_empty() {
            "No verify commands configured; target files present".to_string()
        } else {
            passed.join("\n")
        }))
    }

    async fn review(
        &self,
        task: &PhaseTask,
        ctx: &TaskContext,
        generated: &str,
    ) -> anyhow::Result<StepOutcome> {
        let config = SessionConfig::new("review", &self.repo_dir).with_system_prompt(REVIEW_SYSTEM_PROMPT);
        let lease = self.sessions.acquire(&config).await?;
        let reply = lease.send(&Self::review_prompt(task, ctx, generated)).await?;
        Ok(parse_verdict(&reply))
    }
}
