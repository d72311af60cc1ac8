//! Citation-backed repository memory.
//!
//! A [`MemoryRecord`] is a fact about one repository together with the
//! evidence ([`MemoryCitation`]s) that supports it. Records expire
//! [`MEMORY_TTL_DAYS`] after their last successful validation and are
//! re-checked against the live working tree by the
//! [`validator::MemoryValidator`].
//!
//! ## Components
//!
//! - [`store`]: the `MemoryStore` trait with in-memory and JSON-file backends
//! - [`validator`]: citation checks, confidence, and recommended actions
//! - [`service`]: the control surface (CRUD, validate, refresh, prune, prompt context)
//! - [`pruner`]: the recurring prune job
//! - [`extract`]: `<memory>` and `<convention>` blocks in assistant output

pub mod extract;
pub mod pruner;
pub mod service;
pub mod store;
pub mod validator;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use extract::{Discovery, extract_conventions, extract_discoveries};
pub use pruner::PruneJob;
pub use service::{MemoryService, ValidationReport};
pub use store::{InMemoryMemoryStore, JsonFileMemoryStore, MemoryFilter, MemoryStore, MemoryUpdate};
pub use validator::{
    CitationCheck, CitationStatus, FileSystem, LocalFileSystem, MemoryValidator,
    RecommendedAction, ValidationResult,
};

/// Days a record stays fresh after its last successful validation.
pub const MEMORY_TTL_DAYS: i64 = 28;

/// Identity of a target repository (e.g. `owner/name` or a canonical path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepositoryId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A pointer into the codebase used as evidence for a memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryCitation {
    /// Path relative to the repository root
    pub file_path: String,
    /// 1-based line number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    /// Text expected to still appear at the cited location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default)]
    pub last_verified: Option<DateTime<Utc>>,
    #[serde(default = "default_citation_valid")]
    pub is_valid: bool,
}

fn default_citation_valid() -> bool {
    true
}

impl MemoryCitation {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            file_path: path.into(),
            line_number: None,
            snippet: None,
            last_verified: None,
            is_valid: true,
        }
    }

    pub fn line(path: impl Into<String>, line: u32) -> Self {
        Self {
            line_number: Some(line),
            ..Self::file(path)
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    /// Same path, line and snippet; validation flags are ignored.
    pub fn same_location(&self, other: &MemoryCitation) -> bool {
        self.file_path == other.file_path
            && self.line_number == other.line_number
            && self.snippet == other.snippet
    }
}

impl FromStr for MemoryCitation {
    type Err = String;

    /// Parse `path` or `path:line`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty citation".to_string());
        }
        match s.rsplit_once(':') {
            Some((path, line))
                if !path.is_empty() && !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()) =>
            {
                let line: u32 = line
                    .parse()
                    .map_err(|e| format!("Invalid line number in citation '{}': {}", s, e))?;
                Ok(Self::line(path, line))
            }
            _ => Ok(Self::file(s)),
        }
    }
}

impl fmt::Display for MemoryCitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line_number {
            Some(line) => write!(f, "{}:{}", self.file_path, line),
            None => f.write_str(&self.file_path),
        }
    }
}

/// A durable, evidence-backed fact about a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub repository_id: RepositoryId,
    pub subject: String,
    pub fact: String,
    #[serde(default)]
    pub citations: Vec<MemoryCitation>,
    /// Why this fact was recorded
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub use_count: u64,
    /// Confidence from the most recent validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl MemoryRecord {
    pub fn new(
        repository_id: RepositoryId,
        subject: impl Into<String>,
        fact: impl Into<String>,
        citations: Vec<MemoryCitation>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            repository_id,
            subject: subject.into(),
            fact: fact.into(),
            citations,
            reason: reason.into(),
            created_at: Utc::now(),
            last_validated_at: None,
            last_used_at: None,
            use_count: 0,
            confidence: None,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_validated_at.unwrap_or(self.created_at) + Duration::days(MEMORY_TTL_DAYS)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Render the record as a single prompt bullet.
    pub fn to_prompt_line(&self) -> String {
        let evidence = self
            .citations
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("- **{}**: {} (evidence: {})", self.subject, self.fact, evidence)
    }
}
