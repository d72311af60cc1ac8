//! Re-checks memory citations against the live working tree.
//!
//! Validation is read-only: [`MemoryValidator::validate`] returns a
//! [`ValidationResult`] and never writes to a store. Persisting the outcome
//! is the job of [`super::MemoryService`].

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{MemoryCitation, MemoryRecord};

/// Read access to the files a citation points at.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, path: &str) -> bool;
    async fn read_to_string(&self, path: &str) -> anyhow::Result<String>;
}

/// [`FileSystem`] rooted at a repository checkout.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches("./"))
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.resolve(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn read_to_string(&self, path: &str) -> anyhow::Result<String> {
        let full = self.resolve(path);
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationStatus {
    Valid,
    /// The cited file does not exist
    Missing,
    /// The cited line is past the end of the file
    OutOfRange,
    /// The stored snippet no longer appears at the cited location
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Extend the record's lifetime
    Refresh,
    /// Keep, but flag the partially valid evidence
    UpdateCitations,
    ReviewManually,
    Delete,
}

impl RecommendedAction {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            RecommendedAction::Refresh
        } else if confidence >= 0.5 {
            RecommendedAction::UpdateCitations
        } else if confidence > 0.0 {
            RecommendedAction::ReviewManually
        } else {
            RecommendedAction::Delete
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationCheck {
    pub citation: MemoryCitation,
    pub status: CitationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CitationCheck {
    fn new(citation: &MemoryCitation, status: CitationStatus, detail: Option<String>) -> Self {
        Self {
            citation: citation.clone(),
            status,
            detail,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == CitationStatus::Valid
    }
}

/// Outcome of validating one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub memory_id: String,
    pub confidence: f64,
    pub action: RecommendedAction,
    /// One entry per citation, in citation order
    pub checks: Vec<CitationCheck>,
    pub checked_at: DateTime<Utc>,
}

impl ValidationResult {
    pub fn valid_count(&self) -> usize {
        self.checks.iter().filter(|c| c.is_valid()).count()
    }

    pub fn is_valid(&self) -> bool {
        self.action == RecommendedAction::Refresh
    }

    /// Copy per-citation flags and the confidence onto the record.
    ///
    /// Does not touch `last_validated_at`.
    pub fn apply_flags(&self, record: &mut MemoryRecord) {
        for (citation, check) in record.citations.iter_mut().zip(&self.checks) {
            citation.is_valid = check.is_valid();
            if citation.is_valid {
                citation.last_verified = Some(self.checked_at);
            }
        }
        record.confidence = Some(self.confidence);
    }
}

/// Validates memory citations through a [`FileSystem`].
#[derive(Clone)]
pub struct MemoryValidator {
    fs: Arc<dyn FileSystem>,
}

impl MemoryValidator {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(LocalFileSystem::new(root)))
    }

    /// Validate every citation of a record concurrently.
    pub async fn validate(&self, record: &MemoryRecord) -> ValidationResult {
        let checks = join_all(record.citations.iter().map(|c| self.check_citation(c))).await;
        let confidence = if checks.is_empty() {
            0.0
        } else {
            checks.iter().filter(|c| c.is_valid()).count() as f64 / checks.len() as f64
        };

        tracing::debug!(
            memory_id = %record.id,
            confidence,
            citations = checks.len(),
            "Validated memory"
        );

        ValidationResult {
            memory_id: record.id.clone(),
            confidence,
            action: RecommendedAction::from_confidence(confidence),
            checks,
            checked_at: Utc::now(),
        }
    }

    /// Validate a batch of records; results keep the input order.
    pub async fn validate_all(&self, records: &[MemoryRecord]) -> Vec<ValidationResult> {
        join_all(records.iter().map(|r| self.validate(r))).await
    }

    async fn check_citation(&self, citation: &MemoryCitation) -> CitationCheck {
        if !self.fs.exists(&citation.file_path).await {
            return CitationCheck::new(citation, CitationStatus::Missing, None);
        }
        let content = match self.fs.read_to_string(&citation.file_path).await {
            Ok(content) => content,
            Err(e) => {
                return CitationCheck::new(
                    citation,
                    CitationStatus::Missing,
                    Some(format!("{:#}", e)),
                );
            }
        };

        let cited_text = match citation.line_number {
            Some(line) => {
                let line_count = content.lines().count();
                if line == 0 || line as usize > line_count {
                    return CitationCheck::new(
                        citation,
                        CitationStatus::OutOfRange,
                        Some(format!("line {} of {}", line, line_count)),
                    );
                }
                content.lines().nth(line as usize - 1).unwrap_or_default()
            }
            None => content.as_str(),
        };

        if let Some(snippet) = citation.snippet.as_deref().map(str::trim)
            && !snippet.is_empty()
            && !cited_text.contains(snippet)
        {
            return CitationCheck::new(
                citation,
                CitationStatus::Stale,
                Some(format!("snippet not found: {}", snippet)),
            );
        }

        CitationCheck::new(citation, CitationStatus::Valid, None)
    }
}
