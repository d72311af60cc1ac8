//! Memory record storage.
//!
//! [`MemoryStore`] is the repository interface; callers hold it as
//! `Arc<dyn MemoryStore>` so the backing store can be swapped.
//!
//! - [`InMemoryMemoryStore`] keeps records in a `DashMap`. Writes to one
//!   record serialize on its shard lock; unrelated records proceed in parallel.
//! - [`JsonFileMemoryStore`] adds durability: one pretty-printed JSON file per
//!   repository, rewritten atomically after each write while holding that
//!   repository's lock.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{MemoryCitation, MemoryRecord, RepositoryId};
use crate::errors::MemoryError;

/// Filter for [`MemoryStore::list`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    /// Case-insensitive substring matched against subject or fact
    pub query: Option<String>,
    /// Exact path or glob pattern matched against citation file paths
    pub citation_file: Option<String>,
    pub include_expired: bool,
    pub limit: Option<usize>,
}

impl MemoryFilter {
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn citation_file(mut self, file: impl Into<String>) -> Self {
        self.citation_file = Some(file.into());
        self
    }

    pub fn include_expired(mut self) -> Self {
        self.include_expired = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matcher(&self) -> FilterMatcher<'_> {
        FilterMatcher {
            filter: self,
            query: self.query.as_ref().map(|q| q.to_lowercase()),
            pattern: self
                .citation_file
                .as_deref()
                .and_then(|p| glob::Pattern::new(p).ok()),
            now: Utc::now(),
        }
    }
}

struct FilterMatcher<'a> {
    filter: &'a MemoryFilter,
    query: Option<String>,
    pattern: Option<glob::Pattern>,
    now: DateTime<Utc>,
}

impl FilterMatcher<'_> {
    fn matches(&self, record: &MemoryRecord) -> bool {
        if !self.filter.include_expired && record.is_expired_at(self.now) {
            return false;
        }
        if let Some(q) = &self.query
            && !record.subject.to_lowercase().contains(q)
            && !record.fact.to_lowercase().contains(q)
        {
            return false;
        }
        if let Some(file) = &self.filter.citation_file {
            let cited = record.citations.iter().any(|c| {
                c.file_path == *file || self.pattern.as_ref().is_some_and(|p| p.matches(&c.file_path))
            });
            if !cited {
                return false;
            }
        }
        true
    }
}

/// Partial update for [`MemoryStore::update`]. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdate {
    pub subject: Option<String>,
    pub fact: Option<String>,
    pub reason: Option<String>,
    pub citations: Option<Vec<MemoryCitation>>,
    pub confidence: Option<f64>,
    /// Only ever moves forward: the stored value becomes `max(old, new)`
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Mark the record as used now
    pub touch: bool,
    /// Reject the update with [`MemoryError::Conflict`] unless the record
    /// still cites exactly these locations
    pub expected_citations: Option<Vec<MemoryCitation>>,
}

impl MemoryUpdate {
    pub fn touch() -> Self {
        Self {
            touch: true,
            ..Self::default()
        }
    }

    /// `true` when `expected_citations` no longer describes the record.
    pub fn conflicts_with(&self, record: &MemoryRecord) -> bool {
        self.expected_citations.as_ref().is_some_and(|expected| {
            expected.len() != record.citations.len()
                || expected
                    .iter()
                    .zip(&record.citations)
                    .any(|(a, b)| !a.same_location(b))
        })
    }

    pub fn apply(&self, record: &mut MemoryRecord, now: DateTime<Utc>) {
        if let Some(subject) = &self.subject {
            record.subject = subject.clone();
        }
        if let Some(fact) = &self.fact {
            record.fact = fact.clone();
        }
        if let Some(reason) = &self.reason {
            record.reason = reason.clone();
        }
        if let Some(citations) = &self.citations {
            record.citations = citations.clone();
        }
        if let Some(confidence) = self.confidence {
            record.confidence = Some(confidence);
        }
        if let Some(validated) = self.last_validated_at {
            record.last_validated_at = Some(match record.last_validated_at {
                Some(previous) => previous.max(validated),
                None => validated,
            });
        }
        if self.touch {
            record.last_used_at = Some(now);
            record.use_count += 1;
        }
    }
}

/// Most recently used first; never-used records last, newest first among ties.
pub fn sort_by_recent_use(records: &mut [MemoryRecord]) {
    records.sort_by(|a, b| {
        b.last_used_at
            .cmp(&a.last_used_at)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

/// Keyed storage for memory records scoped to a repository.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert a record, replacing any record with the same id.
    async fn store(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError>;

    async fn get(&self, id: &str) -> Result<MemoryRecord, MemoryError>;

    /// Records of one repository, ordered by `last_used_at` descending.
    async fn list(
        &self,
        repository: &RepositoryId,
        filter: &MemoryFilter,
    ) -> Result<Vec<MemoryRecord>, MemoryError>;

    async fn update(&self, id: &str, update: MemoryUpdate) -> Result<MemoryRecord, MemoryError>;

    /// Remove a record, returning it.
    async fn delete(&self, id: &str) -> Result<MemoryRecord, MemoryError>;

    /// Remove expired records (of one repository, or all) and return how many went.
    async fn prune_expired(&self, repository: Option<&RepositoryId>) -> Result<usize, MemoryError>;
}

fn not_found(id: &str) -> MemoryError {
    MemoryError::NotFound { id: id.to_string() }
}

/// Map-backed store; the default for tests and short-lived hosts.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    records: DashMap<String, MemoryRecord>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record of one repository, unfiltered.
    fn records_for(&self, repository: &RepositoryId) -> Vec<MemoryRecord> {
        self.records
            .iter()
            .filter(|entry| entry.repository_id == *repository)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn repositories(&self) -> Vec<RepositoryId> {
        let mut repos: Vec<RepositoryId> = self
            .records
            .iter()
            .map(|entry| entry.repository_id.clone())
            .collect();
        repos.sort();
        repos.dedup();
        repos
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn store(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        self.records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(id))
    }

    async fn list(
        &self,
        repository: &RepositoryId,
        filter: &MemoryFilter,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let matcher = filter.matcher();
        let mut records: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|entry| entry.repository_id == *repository && matcher.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        sort_by_recent_use(&mut records);
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn update(&self, id: &str, update: MemoryUpdate) -> Result<MemoryRecord, MemoryError> {
        let mut entry = self.records.get_mut(id).ok_or_else(|| not_found(id))?;
        if update.conflicts_with(entry.value()) {
            return Err(MemoryError::Conflict { id: id.to_string() });
        }
        update.apply(entry.value_mut(), Utc::now());
        Ok(entry.value().clone())
    }

    async fn delete(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        self.records
            .remove(id)
            .map(|(_, record)| record)
            .ok_or_else(|| not_found(id))
    }

    async fn prune_expired(&self, repository: Option<&RepositoryId>) -> Result<usize, MemoryError> {
        let now = Utc::now();
        let mut removed = 0;
        self.records.retain(|_, record| {
            let in_scope = repository.is_none_or(|r| record.repository_id == *r);
            let expired = in_scope && record.is_expired_at(now);
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }
}

/// On-disk layout of one repository's memory collection.
#[derive(Debug, Serialize, Deserialize)]
struct MemoryCollection {
    repository_id: RepositoryId,
    records: Vec<MemoryRecord>,
}

/// Durable store: `<dir>/<encoded repository id>.json` per repository.
pub struct JsonFileMemoryStore {
    dir: PathBuf,
    cache: InMemoryMemoryStore,
    locks: DashMap<RepositoryId, Arc<tokio::sync::Mutex<()>>>,
}

impl JsonFileMemoryStore {
    /// Open (or create) a store directory and load every collection in it.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create memory directory: {}", dir.display()))
            .map_err(MemoryError::Storage)?;

        let cache = InMemoryMemoryStore::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context("Failed to read memory directory")
            .map_err(MemoryError::Storage)?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to read memory directory entry")
            .map_err(MemoryError::Storage)?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read memory file: {}", path.display()))
                .map_err(MemoryError::Storage)?;
            let collection: MemoryCollection = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse memory file: {}", path.display()))
                .map_err(MemoryError::Storage)?;
            for record in collection.records {
                cache.records.insert(record.id.clone(), record);
            }
        }

        tracing::debug!(dir = %dir.display(), records = cache.len(), "Opened memory store");
        Ok(Self {
            dir,
            cache,
            locks: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_for(&self, repository: &RepositoryId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(repository.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Lock several repositories, always in id order.
    async fn lock_all(
        &self,
        mut repositories: Vec<RepositoryId>,
    ) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        repositories.sort();
        repositories.dedup();
        let mut guards = Vec::with_capacity(repositories.len());
        for repository in &repositories {
            guards.push(self.lock_for(repository).lock_owned().await);
        }
        guards
    }

    fn file_for(&self, repository: &RepositoryId) -> PathBuf {
        self.dir
            .join(format!("{}.json", encode_file_stem(repository.as_str())))
    }

    /// Rewrite a repository's file from the cache. Caller holds the repository lock.
    async fn persist(&self, repository: &RepositoryId) -> Result<(), MemoryError> {
        let path = self.file_for(repository);
        let mut records = self.cache.records_for(repository);
        if records.is_empty() {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to remove memory file: {}", path.display()))
                    .map_err(MemoryError::Storage)?;
            }
            return Ok(());
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let collection = MemoryCollection {
            repository_id: repository.clone(),
            records,
        };
        let json = serde_json::to_string_pretty(&collection)
            .context("Failed to serialize memory collection")
            .map_err(MemoryError::Storage)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write memory file: {}", tmp.display()))
            .map_err(MemoryError::Storage)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace memory file: {}", path.display()))
            .map_err(MemoryError::Storage)?;
        Ok(())
    }
}

/// Reversible, collision-free file stem for a repository id.
fn encode_file_stem(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[async_trait]
impl MemoryStore for JsonFileMemoryStore {
    async fn store(&self, record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
        // A record moving between repositories rewrites both files.
        let (_guards, previous) = loop {
            let previous = self.cache.get(&record.id).await.ok().map(|r| r.repository_id);
            let mut repositories = vec![record.repository_id.clone()];
            repositories.extend(previous.clone());
            let guards = self.lock_all(repositories).await;
            let current = self.cache.get(&record.id).await.ok().map(|r| r.repository_id);
            if current == previous {
                break (guards, previous);
            }
        };
        let stored = self.cache.store(record).await?;
        self.persist(&stored.repository_id).await?;
        if let Some(previous) = previous
            && previous != stored.repository_id
        {
            self.persist(&previous).await?;
        }
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        self.cache.get(id).await
    }

    async fn list(
        &self,
        repository: &RepositoryId,
        filter: &MemoryFilter,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        self.cache.list(repository, filter).await
    }

    async fn update(&self, id: &str, update: MemoryUpdate) -> Result<MemoryRecord, MemoryError> {
        let repository = self.cache.get(id).await?.repository_id;
        let lock = self.lock_for(&repository);
        let _guard = lock.lock().await;
        let updated = self.cache.update(id, update).await?;
        self.persist(&repository).await?;
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        let repository = self.cache.get(id).await?.repository_id;
        let lock = self.lock_for(&repository);
        let _guard = lock.lock().await;
        let removed = self.cache.delete(id).await?;
        self.persist(&repository).await?;
        Ok(removed)
    }

    async fn prune_expired(&self, repository: Option<&RepositoryId>) -> Result<usize, MemoryError> {
        let repositories = match repository {
            Some(r) => vec![r.clone()],
            None => self.cache.repositories(),
        };
        let mut removed = 0;
        for repo in repositories {
            let lock = self.lock_for(&repo);
            let _guard = lock.lock().await;
            let pruned = self.cache.prune_expired(Some(&repo)).await?;
            if pruned > 0 {
                self.persist(&repo).await?;
            }
            removed += pruned;
        }
        Ok(removed)
    }
}
