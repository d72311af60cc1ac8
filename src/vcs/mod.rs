//! Version-control collaborator.
//!
//! [`GitVcs`] does local operations through git2 on the blocking pool and
//! shells out to `git push` so the user's credential helpers apply.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{BranchType, IndexAddOption, Repository, Signature};
use std::path::{Path, PathBuf};
use std::process::Stdio;

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn stage(&self, pathspec: &str) -> Result<()>;

    /// Commit the index; returns the new commit sha.
    async fn commit(&self, message: &str) -> Result<String>;

    async fn push(&self, branch: &str) -> Result<()>;

    /// Create `name` at `base` (a revision), or at HEAD when `base` is `None`.
    async fn create_branch(&self, name: &str, base: Option<&str>) -> Result<()>;

    async fn checkout(&self, name: &str) -> Result<()>;
}

/// Git working tree at `repo_dir`.
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo_dir: PathBuf,
    remote: String,
}

impl GitVcs {
    pub fn open(repo_dir: impl Into<PathBuf>, remote: impl Into<String>) -> Result<Self> {
        let repo_dir = repo_dir.into();
        Repository::open(&repo_dir)
            .with_context(|| format!("Failed to open git repository at {}", repo_dir.display()))?;
        Ok(Self {
            repo_dir,
            remote: remote.into(),
        })
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Run `f` against a freshly opened repository on the blocking pool.
    async fn with_repo<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T> + Send + 'static,
    {
        let dir = self.repo_dir.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&dir).context("Failed to open git repository")?;
            f(&repo)
        })
        .await
        .context("Git task panicked")?
    }

    /// Current HEAD sha, `None` on an unborn branch.
    pub async fn head_sha(&self) -> Result<Option<String>> {
        self.with_repo(|repo| Ok(head_commit(repo).map(|c| c.id().to_string())))
            .await
    }

    /// Short name of the branch HEAD points at.
    pub async fn current_branch(&self) -> Result<Option<String>> {
        self.with_repo(|repo| {
            let name = match repo.head() {
                Ok(head) => head.shorthand().map(str::to_string),
                Err(_) => repo
                    .find_reference("HEAD")
                    .ok()
                    .and_then(|r| r.symbolic_target().map(str::to_string))
                    .map(|t| t.trim_start_matches("refs/heads/").to_string()),
            };
            Ok(name)
        })
        .await
    }
}

/// HEAD commit, or `None` for an unborn branch.
fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
    repo.head().ok().and_then(|head| head.peel_to_commit().ok())
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    repo.signature()
        .or_else(|_| Signature::now("cairn", "cairn@localhost"))
        .context("Failed to build signature")
}

#[async_trait]
impl VersionControl for GitVcs {
    async fn stage(&self, pathspec: &str) -> Result<()> {
        let spec = pathspec.to_string();
        self.with_repo(move |repo| {
            let mut index = repo.index()?;
            index.add_all([spec.as_str()].iter(), IndexAddOption::DEFAULT, None)?;
            index.update_all([spec.as_str()].iter(), None)?;
            index.write()?;
            Ok(())
        })
        .await
        .with_context(|| format!("Failed to stage '{}'", pathspec))
    }

    async fn commit(&self, message: &str) -> Result<String> {
        let message = message.to_string();
        let sha = self
            .with_repo(move |repo| {
                let mut index = repo.index()?;
                let tree_id = index.write_tree()?;
                let tree = repo.find_tree(tree_id)?;
                let sig = signature(repo)?;
                let parents: Vec<git2::Commit<'_>> = head_commit(repo).into_iter().collect();
                let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
                let oid = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &parent_refs)?;
                Ok(oid.to_string())
            })
            .await
            .context("Failed to commit")?;
        tracing::debug!(sha = %sha, "Committed");
        Ok(sha)
    }

    async fn push(&self, branch: &str) -> Result<()> {
        let output = tokio::process::Command::new("git")
            .args(["push", "-u", self.remote.as_str(), branch])
            .current_dir(&self.repo_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run git push")?;
        if !output.status.success() {
            bail!(
                "Failed to push branch {} to {}: {}",
                branch,
                self.remote,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        tracing::info!(branch, remote = %self.remote, "Pushed");
        Ok(())
    }

    async fn create_branch(&self, name: &str, base: Option<&str>) -> Result<()> {
        let name = name.to_string();
        let base = base.map(str::to_string);
        self.with_repo(move |repo| {
            let target = match &base {
                Some(rev) => Some(
                    repo.revparse_single(rev)
                        .with_context(|| format!("Unknown base revision '{}'", rev))?
                        .peel_to_commit()?,
                ),
                None => head_commit(repo),
            };
            match target {
                Some(commit) => {
                    repo.branch(&name, &commit, false)
                        .with_context(|| format!("Failed to create branch '{}'", name))?;
                }
                None => {
                    // Unborn HEAD: the branch comes into existence with the first commit.
                    if repo.find_branch(&name, BranchType::Local).is_ok() {
                        bail!("Branch '{}' already exists", name);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn checkout(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.with_repo(move |repo| {
            let refname = format!("refs/heads/{}", name);
            if repo.find_reference(&refname).is_ok() {
                let tree = repo.revparse_single(&refname)?;
                repo.checkout_tree(&tree, Some(git2::build::CheckoutBuilder::new().safe()))
                    .with_context(|| format!("Failed to check out '{}'", name))?;
            }
            repo.set_head(&refname)
                .with_context(|| format!("Failed to move HEAD to '{}'", name))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn setup_repo() -> (GitVcs, TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        let vcs = GitVcs::open(dir.path(), "origin").unwrap();
        (vcs, dir)
    }

    fn message_of(dir: &Path, rev: &str) -> String {
        let repo = Repository::open(dir).unwrap();
        let commit = repo.revparse_single(rev).unwrap().peel_to_commit().unwrap();
        commit.message().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_open_rejects_non_repository() {
        let dir = tempdir().unwrap();
        assert!(GitVcs::open(dir.path(), "origin").is_err());
    }

    #[tokio::test]
    async fn test_stage_and_commit_on_unborn_head() {
        let (vcs, dir) = setup_repo();
        assert_eq!(vcs.head_sha().await.unwrap(), None);

        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        vcs.stage("*").await.unwrap();
        let sha = vcs.commit("[cairn] task 1.1: add a").await.unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(vcs.head_sha().await.unwrap(), Some(sha));
        assert_eq!(message_of(dir.path(), "HEAD"), "[cairn] task 1.1: add a");
    }

    #[tokio::test]
    async fn test_commit_chains_parents() {
        let (vcs, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        vcs.stage("*").await.unwrap();
        let first = vcs.commit("first").await.unwrap();
        fs::write(dir.path().join("a.txt"), "two").unwrap();
        vcs.stage("*").await.unwrap();
        vcs.commit("second").await.unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.parent(0).unwrap().id().to_string(), first);
    }

    #[tokio::test]
    async fn test_stage_picks_up_deletions() {
        let (vcs, dir) = setup_repo();
        fs::write(dir.path().join("gone.txt"), "x").unwrap();
        fs::write(dir.path().join("kept.txt"), "y").unwrap();
        vcs.stage("*").await.unwrap();
        vcs.commit("init").await.unwrap();

        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        vcs.stage("*").await.unwrap();
        vcs.commit("remove").await.unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("gone.txt").is_none());
        assert!(tree.get_name("kept.txt").is_some());
    }

    #[tokio::test]
    async fn test_create_branch_and_checkout() {
        let (vcs, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "base").unwrap();
        vcs.stage("*").await.unwrap();
        vcs.commit("base").await.unwrap();
        let base_branch = vcs.current_branch().await.unwrap().unwrap();

        vcs.create_branch("cairn/feature", None).await.unwrap();
        vcs.checkout("cairn/feature").await.unwrap();
        assert_eq!(vcs.current_branch().await.unwrap().as_deref(), Some("cairn/feature"));

        fs::write(dir.path().join("b.txt"), "feature").unwrap();
        vcs.stage("*").await.unwrap();
        vcs.commit("feature work").await.unwrap();

        vcs.checkout(&base_branch).await.unwrap();
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(message_of(dir.path(), "cairn/feature"), "feature work");
    }

    #[tokio::test]
    async fn test_create_branch_from_base_revision() {
        let (vcs, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        vcs.stage("*").await.unwrap();
        let first = vcs.commit("one").await.unwrap();
        fs::write(dir.path().join("a.txt"), "two").unwrap();
        vcs.stage("*").await.unwrap();
        vcs.commit("two").await.unwrap();

        vcs.create_branch("old", Some(&first)).await.unwrap();
        assert_eq!(message_of(dir.path(), "old"), "one");
        assert!(vcs.create_branch("x", Some("no-such-rev")).await.is_err());
    }

    #[tokio::test]
    async fn test_branch_on_unborn_head_materializes_on_commit() {
        let (vcs, dir) = setup_repo();
        vcs.create_branch("cairn/fresh", None).await.unwrap();
        vcs.checkout("cairn/fresh").await.unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        vcs.stage("*").await.unwrap();
        vcs.commit("first").await.unwrap();
        assert_eq!(vcs.current_branch().await.unwrap().as_deref(), Some("cairn/fresh"));
        assert_eq!(message_of(dir.path(), "cairn/fresh"), "first");
    }

    #[tokio::test]
    async fn test_push_to_local_bare_remote() {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            return;
        }
        let (vcs, dir) = setup_repo();
        let remote_dir = tempdir().unwrap();
        Repository::init_bare(remote_dir.path()).unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        repo.remote("origin", remote_dir.path().to_str().unwrap()).unwrap();

        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        vcs.stage("*").await.unwrap();
        let sha = vcs.commit("init").await.unwrap();
        vcs.create_branch("cairn/pushed", None).await.unwrap();
        vcs.push("cairn/pushed").await.unwrap();

        let bare = Repository::open_bare(remote_dir.path()).unwrap();
        let pushed = bare.find_reference("refs/heads/cairn/pushed").unwrap();
        assert_eq!(pushed.target().unwrap().to_string(), sha);
    }

    #[tokio::test]
    async fn test_push_failure_is_reported() {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            return;
        }
        let (vcs, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        vcs.stage("*").await.unwrap();
        vcs.commit("init").await.unwrap();
        let err = vcs.push("main").await.unwrap_err();
        assert!(err.to_string().contains("Failed to push"));
    }
}
