use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{AssistantClient, SessionConfig, SessionId, StreamChunk};
use crate::config::AssistantSection;
use crate::stream::{Folded, StreamAccumulator};
use crate::util::tail_chars;

struct CliSession {
    config: SessionConfig,
    /// Assistant-side session id used for `--resume`
    resume: Option<String>,
}

/// [`AssistantClient`] that runs the assistant CLI once per prompt.
///
/// The prompt goes to stdin; stdout is decoded as `stream-json`. The
/// assistant's own session id is kept so later prompts in the same session
/// continue the conversation.
pub struct ClaudeCliAssistant {
    command: String,
    skip_permissions: bool,
    model: Option<String>,
    sessions: DashMap<SessionId, CliSession>,
}

impl ClaudeCliAssistant {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            skip_permissions: true,
            model: None,
            sessions: DashMap::new(),
        }
    }

    pub fn from_config(section: &AssistantSection) -> Self {
        Self {
            command: section.command.clone(),
            skip_permissions: section.skip_permissions,
            model: section.model.clone(),
            sessions: DashMap::new(),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn args(&self, resume: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(sid) = resume {
            args.push("--resume".to_string());
            args.push(sid.to_string());
        }
        args
    }

    async fn run(
        &self,
        session: &SessionId,
        prompt: &str,
        chunks: Option<&mpsc::UnboundedSender<StreamChunk>>,
    ) -> Result<String> {
        let (config, resume) = match self.sessions.get(session) {
            Some(s) => (s.config.clone(), s.resume.clone()),
            None => bail!("Unknown assistant session {}", session),
        };
        let full_prompt = match &config.system_prompt {
            Some(system) => format!("{}\n\n{}", system, prompt),
            None => prompt.to_string(),
        };

        let args = self.args(resume.as_deref());
        tracing::debug!(
            command = %self.command,
            args = %args.join(" "),
            prompt_chars = full_prompt.len(),
            "Spawning assistant"
        );

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&config.working_dir)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn assistant command '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(full_prompt.as_bytes()).await?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let mut stderr = child.stderr.take().context("Failed to get stderr")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut acc = StreamAccumulator::new();
        while let Some(line) = lines.next_line().await? {
            if let Folded::Text(text) = acc.push_line(&line)
                && let Some(tx) = chunks
            {
                let _ = tx.send(StreamChunk::Text(text));
            }
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if let Some(sid) = acc.session_id()
            && let Some(mut entry) = self.sessions.get_mut(session)
        {
            entry.resume = Some(sid.to_string());
        }

        let is_error = acc.is_error();
        let output = acc.into_output();
        if !status.success() && output.trim().is_empty() {
            bail!(
                "Assistant exited with {}: {}",
                status,
                tail_chars(stderr_text.trim(), 500)
            );
        }
        if is_error {
            bail!("Assistant reported an error: {}", tail_chars(output.trim(), 500));
        }

        if let Some(tx) = chunks {
            let _ = tx.send(StreamChunk::Done);
        }
        tracing::debug!(output_chars = output.len(), "Assistant finished");
        Ok(output)
    }
}

#[async_trait]
impl AssistantClient for ClaudeCliAssistant {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionId> {
        let id = SessionId::new(uuid::Uuid::new_v4().to_string());
        self.sessions.insert(
            id.clone(),
            CliSession {
                config: config.clone(),
                resume: None,
            },
        );
        Ok(id)
    }

    async fn send(&self, session: &SessionId, prompt: &str) -> Result<String> {
        self.run(session, prompt, None).await
    }

    async fn send_streaming(
        &self,
        session: &SessionId,
        prompt: &str,
        chunks: mpsc::UnboundedSender<StreamChunk>,
    ) -> Result<String> {
        self.run(session, prompt, Some(&chunks)).await
    }

    async fn close(&self, session: &SessionId) -> Result<()> {
        self.sessions.remove(session);
        Ok(())
    }
}
