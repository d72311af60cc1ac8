//! Discovery and convention tags in assistant output.
//!
//! - `<memory>{"subject": ..., "fact": ..., "reason": ..., "citations": [...]}</memory>`
//!   where each citation is either `"path"`, `"path:line"`, or an object
//!   `{"file_path", "line_number", "snippet"}`
//! - `<convention>text</convention>`

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use super::{MemoryCitation, MemoryRecord, RepositoryId};

static MEMORY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<memory>\s*(.*?)\s*</memory>").unwrap());

static CONVENTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<convention>\s*(.*?)\s*</convention>").unwrap());

/// A fact the assistant reported while working.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub subject: String,
    pub fact: String,
    pub reason: String,
    pub citations: Vec<MemoryCitation>,
}

impl Discovery {
    pub fn into_record(self, repository: RepositoryId) -> MemoryRecord {
        MemoryRecord::new(repository, self.subject, self.fact, self.citations, self.reason)
    }
}

#[derive(Deserialize)]
struct RawDiscovery {
    subject: String,
    fact: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    citations: Vec<RawCitation>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCitation {
    Text(String),
    Full {
        file_path: String,
        #[serde(default)]
        line_number: Option<u32>,
        #[serde(default)]
        snippet: Option<String>,
    },
}

impl RawCitation {
    fn into_citation(self) -> Option<MemoryCitation> {
        match self {
            RawCitation::Text(text) => text.parse().ok(),
            RawCitation::Full {
                file_path,
                line_number,
                snippet,
            } => {
                if file_path.trim().is_empty() {
                    return None;
                }
                let mut citation = MemoryCitation::file(file_path);
                citation.line_number = line_number;
                citation.snippet = snippet.filter(|s| !s.trim().is_empty());
                Some(citation)
            }
        }
    }
}

/// Every well-formed `<memory>` block in `text`.
///
/// Blocks that fail to parse, or that carry no usable citation, are skipped.
pub fn extract_discoveries(text: &str) -> Vec<Discovery> {
    let mut discoveries = Vec::new();
    for cap in MEMORY_REGEX.captures_iter(text) {
        let Some(body) = cap.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let raw: RawDiscovery = match serde_json::from_str(body) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed memory block");
                continue;
            }
        };
        let citations: Vec<MemoryCitation> = raw
            .citations
            .into_iter()
            .filter_map(RawCitation::into_citation)
            .collect();
        if raw.subject.trim().is_empty() || raw.fact.trim().is_empty() || citations.is_empty() {
            tracing::warn!(subject = %raw.subject, "Skipping memory block without subject, fact or citations");
            continue;
        }
        discoveries.push(Discovery {
            subject: raw.subject.trim().to_string(),
            fact: raw.fact.trim().to_string(),
            reason: raw.reason.trim().to_string(),
            citations,
        });
    }
    discoveries
}

/// Every non-empty `<convention>` tag in `text`, in order of appearance.
pub fn extract_conventions(text: &str) -> Vec<String> {
    CONVENTION_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
