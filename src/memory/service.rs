//! Memory control surface: CRUD, validation, refresh, pruning, and the
//! verified-memory prompt section.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;

use super::extract::Discovery;
use super::store::{MemoryFilter, MemoryStore, MemoryUpdate};
use super::validator::{FileSystem, LocalFileSystem, MemoryValidator, RecommendedAction, ValidationResult};
use super::{MemoryRecord, RepositoryId};
use crate::errors::MemoryError;

/// Minimum confidence for a memory to be injected into prompts.
const CONTEXT_CONFIDENCE: f64 = 0.8;

/// Validations of one memory before a concurrent citation change wins.
const VALIDATION_ATTEMPTS: u32 = 3;

/// Outcome of validating every live memory of a repository.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub refreshed: usize,
    pub update_citations: usize,
    pub review_manually: usize,
    pub delete: usize,
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    fn record(&mut self, result: ValidationResult) {
        match result.action {
            RecommendedAction::Refresh => self.refreshed += 1,
            RecommendedAction::UpdateCitations => self.update_citations += 1,
            RecommendedAction::ReviewManually => self.review_manually += 1,
            RecommendedAction::Delete => self.delete += 1,
        }
        self.results.push(result);
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }
}

/// Memory operations addressed by memory id and repository identity.
///
/// Citations are checked through a [`FileSystem`] registered per repository.
/// An unregistered repository id is treated as a path to its checkout.
#[derive(Clone)]
pub struct MemoryService {
    store: Arc<dyn MemoryStore>,
    validators: Arc<DashMap<RepositoryId, MemoryValidator>>,
}

impl MemoryService {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            validators: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Check citations of `repository` against `fs`.
    pub fn register_repository(&self, repository: RepositoryId, fs: Arc<dyn FileSystem>) {
        self.validators.insert(repository, MemoryValidator::new(fs));
    }

    fn validator_for(&self, repository: &RepositoryId) -> MemoryValidator {
        self.validators
            .entry(repository.clone())
            .or_insert_with(|| {
                MemoryValidator::new(Arc::new(LocalFileSystem::new(repository.as_str())))
            })
            .clone()
    }

    pub async fn create(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
        self.store.store(record).await
    }

    pub async fn get(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        repository: &RepositoryId,
        filter: &MemoryFilter,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        self.store.list(repository, filter).await
    }

    pub async fn update(&self, id: &str, update: MemoryUpdate) -> Result<MemoryRecord, MemoryError> {
        self.store.update(id, update).await
    }

    pub async fn delete(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        self.store.delete(id).await
    }

    /// Validate one memory and persist the citation flags and confidence.
    ///
    /// Never moves `last_validated_at`; use [`MemoryService::refresh`] for that.
    pub async fn validate(&self, id: &str) -> Result<ValidationResult, MemoryError> {
        self.validate_current(id, false).await
    }

    /// Validate one memory; when the evidence holds, extend its lifetime.
    pub async fn refresh(&self, id: &str) -> Result<ValidationResult, MemoryError> {
        self.validate_current(id, true).await
    }

    /// Validate the stored record, starting over when its citations are
    /// replaced before the result is written.
    async fn validate_current(&self, id: &str, refresh: bool) -> Result<ValidationResult, MemoryError> {
        let mut attempt = 1;
        loop {
            let record = self.store.get(id).await?;
            let result = self.validator_for(&record.repository_id).validate(&record).await;
            match self.persist(&record, &result, refresh).await {
                Ok(_) => return Ok(result),
                Err(e) if e.is_conflict() && attempt < VALIDATION_ATTEMPTS => {
                    tracing::debug!(memory_id = %id, attempt, "Citations changed during validation");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate every memory of a repository concurrently, expired ones
    /// included.
    ///
    /// Records recommended for refresh have their lifetime extended, which
    /// revives an expired record whose evidence still holds; all others are
    /// only flagged. Nothing is deleted. Records deleted or re-cited while
    /// validating are left out of the report.
    pub async fn validate_repository(
        &self,
        repository: &RepositoryId,
    ) -> Result<ValidationReport, MemoryError> {
        let records = self
            .store
            .list(repository, &MemoryFilter::default().include_expired())
            .await?;
        let results = self.validator_for(repository).validate_all(&records).await;

        let persisted = join_all(
            records
                .iter()
                .zip(&results)
                .map(|(record, result)| self.persist(record, result, true)),
        )
        .await;

        let mut report = ValidationReport::default();
        for (result, outcome) in results.into_iter().zip(persisted) {
            match outcome {
                Ok(_) => report.record(result),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(memory_id = %result.memory_id, "Memory deleted during validation");
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(memory_id = %result.memory_id, "Citations changed during validation");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            repository = %repository,
            total = report.total(),
            refreshed = report.refreshed,
            update_citations = report.update_citations,
            review_manually = report.review_manually,
            delete = report.delete,
            "Validated repository memories"
        );
        Ok(report)
    }

    pub async fn prune(&self, repository: Option<&RepositoryId>) -> Result<usize, MemoryError> {
        let removed = self.store.prune_expired(repository).await?;
        if removed > 0 {
            tracing::info!(removed, "Pruned expired memories");
        }
        Ok(removed)
    }

    /// Store facts reported by the assistant.
    pub async fn record_discoveries(
        &self,
        repository: &RepositoryId,
        discoveries: Vec<Discovery>,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let mut stored = Vec::with_capacity(discoveries.len());
        for discovery in discoveries {
            let record = self
                .store
                .store(discovery.into_record(repository.clone()))
                .await?;
            tracing::debug!(memory_id = %record.id, subject = %record.subject, "Recorded discovery");
            stored.push(record);
        }
        Ok(stored)
    }

    /// Prompt section listing memories whose evidence currently holds.
    ///
    /// Returns `None` when no memory qualifies. Included memories are
    /// marked used.
    pub async fn verified_context(
        &self,
        repository: &RepositoryId,
        limit: usize,
    ) -> Result<Option<String>, MemoryError> {
        let records = self.store.list(repository, &MemoryFilter::default()).await?;
        let results = self.validator_for(repository).validate_all(&records).await;

        let mut lines = Vec::new();
        for (record, result) in records.iter().zip(&results) {
            if lines.len() >= limit {
                break;
            }
            if result.confidence < CONTEXT_CONFIDENCE {
                continue;
            }
            match self.store.update(&record.id, MemoryUpdate::touch()).await {
                Ok(_) => lines.push(record.to_prompt_line()),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        if lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!(
            "## REPOSITORY MEMORY\n\nVerified facts about this repository, each backed by evidence that was re-checked just now:\n\n{}\n",
            lines.join("\n")
        )))
    }

    async fn persist(
        &self,
        record: &MemoryRecord,
        result: &ValidationResult,
        refresh: bool,
    ) -> Result<MemoryRecord, MemoryError> {
        let mut flagged = record.clone();
        result.apply_flags(&mut flagged);
        let extend = refresh && result.action == RecommendedAction::Refresh;
        self.store
            .update(
                &record.id,
                MemoryUpdate {
                    citations: Some(flagged.citations),
                    confidence: Some(result.confidence),
                    last_validated_at: extend.then(Utc::now),
                    expected_citations: Some(record.citations.clone()),
                    ..MemoryUpdate::default()
                },
            )
            .await
    }
}
