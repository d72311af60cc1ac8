//! Generation assistant sessions.
//!
//! The core treats the assistant as opaque text-in/text-out. Structure
//! (plans, discoveries, verdicts) is encoded into prompts and decoded from
//! responses by the callers.
//!
//! - [`AssistantClient`]: the session interface
//! - [`SessionManager`]: pooled, explicitly shut down session reuse
//! - [`ClaudeCliAssistant`]: the CLI-backed client

mod claude;
mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;

pub use claude::ClaudeCliAssistant;
pub use session::{SessionLease, SessionManager};

/// Opaque handle for an open assistant session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a session is opened. Sessions with equal configs are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionConfig {
    /// Pool label, e.g. `"planner"`, `"generate"`, `"review"`
    pub role: String,
    /// Directory the assistant works in
    pub working_dir: PathBuf,
    /// Instructions prepended to every prompt of the session
    pub system_prompt: Option<String>,
}

impl SessionConfig {
    pub fn new(role: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            role: role.into(),
            working_dir: working_dir.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Incremental response delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    /// Completion marker; always the last chunk of a response
    Done,
}

#[async_trait]
pub trait AssistantClient: Send + Sync {
    async fn create_session(&self, config: &SessionConfig) -> anyhow::Result<SessionId>;

    /// Send a prompt and wait for the whole response.
    async fn send(&self, session: &SessionId, prompt: &str) -> anyhow::Result<String>;

    /// Send a prompt, forwarding text chunks as they arrive, then [`StreamChunk::Done`].
    ///
    /// Returns the complete response. A dropped receiver does not fail the call.
    async fn send_streaming(
        &self,
        session: &SessionId,
        prompt: &str,
        chunks: mpsc::UnboundedSender<StreamChunk>,
    ) -> anyhow::Result<String> {
        let response = self.send(session, prompt).await?;
        let _ = chunks.send(StreamChunk::Text(response.clone()));
        let _ = chunks.send(StreamChunk::Done);
        Ok(response)
    }

    async fn close(&self, session: &SessionId) -> anyhow::Result<()>;
}
