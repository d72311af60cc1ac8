use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// Persists conventions surfaced during a phase.
#[async_trait]
pub trait GuidanceUpdater: Send + Sync {
    async fn update(&self, conventions: &[String]) -> Result<()>;
}

const CONVENTIONS_HEADING: &str = "## Conventions";

/// Appends conventions as bullets under `## Conventions` in a markdown file.
///
/// The file and heading are created when missing; bullets already present
/// are not repeated.
#[derive(Debug, Clone)]
pub struct MarkdownGuidance {
    path: PathBuf,
}

impl MarkdownGuidance {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn merge(existing: &str, conventions: &[String]) -> Option<String> {
        let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
        let fresh: Vec<String> = conventions
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(|c| format!("- {}", c))
            .filter(|bullet| !lines.iter().any(|l| l.trim() == bullet))
            .fold(Vec::new(), |mut acc, bullet| {
                if !acc.contains(&bullet) {
                    acc.push(bullet);
                }
                acc
            });
        if fresh.is_empty() {
            return None;
        }

        match lines.iter().position(|l| l.trim() == CONVENTIONS_HEADING) {
            Some(heading) => {
                let section_end = lines[heading + 1..]
                    .iter()
                    .position(|l| l.starts_with("## "))
                    .map(|offset| heading + 1 + offset)
                    .unwrap_or(lines.len());
                let mut insert_at = section_end;
                while insert_at > heading + 1 && lines[insert_at - 1].trim().is_empty() {
                    insert_at -= 1;
                }
                if insert_at == heading + 1 {
                    lines.insert(insert_at, String::new());
                    insert_at += 1;
                }
                for (offset, bullet) in fresh.into_iter().enumerate() {
                    lines.insert(insert_at + offset, bullet);
                }
            }
            None => {
                if lines.last().is_some_and(|l| !l.trim().is_empty()) {
                    lines.push(String::new());
                }
                lines.push(CONVENTIONS_HEADING.to_string());
                lines.push(String::new());
                lines.extend(fresh);
            }
        }

        let mut merged = lines.join("\n");
        merged.push('\n');
        Some(merged)
    }
}

#[async_trait]
impl GuidanceUpdater for MarkdownGuidance {
    async fn update(&self, conventions: &[String]) -> Result<()> {
        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };
        let Some(merged) = Self::merge(&existing, conventions) else {
            return Ok(());
        };
        tokio::fs::write(&self.path, merged)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        tracing::info!(file = %self.path.display(), "Updated guidance conventions");
        Ok(())
    }
}
