//! Version control for rollback and publishing
//!
//! Rollback restores mutated files to their committed state. Publishing
//! stages everything except remediation artifacts, commits, and pushes the
//! current branch when an `origin` remote exists.

use crate::error::{FixError, FixResult};
use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{IndexAddOption, Repository, Signature};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Rollback and publish actions the orchestrator relies on
pub trait Vcs: Send {
    /// Restore `files` to their last committed content.
    fn rollback(&mut self, files: &[PathBuf]) -> FixResult<()>;

    /// Commit all working-tree changes and push them.
    fn commit_and_push(&mut self, message: &str) -> FixResult<()>;
}

/// git-backed implementation
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo_path: PathBuf,
}

impl GitVcs {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }
}

impl Vcs for GitVcs {
    fn rollback(&mut self, files: &[PathBuf]) -> FixResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let restored = restore_files(&self.repo_path, files)
            .map_err(|e| FixError::Rollback(format!("{:#}", e)))?;
        info!(restored, requested = files.len(), "rolled back changes");
        Ok(())
    }

    fn commit_and_push(&mut self, message: &str) -> FixResult<()> {
        stage_all(&self.repo_path).map_err(|e| FixError::Publish(format!("{:#}", e)))?;
        let oid = commit(&self.repo_path, message).map_err(|e| FixError::Publish(format!("{:#}", e)))?;
        info!(commit = %oid, "committed fixes");

        match push_current_branch(&self.repo_path).map_err(|e| FixError::Publish(format!("{:#}", e)))? {
            Some(branch) => info!(%branch, "pushed"),
            None => info!("no origin remote; skipping push"),
        }
        Ok(())
    }
}

/// Backups, store locks and temp files never go into a commit.
fn is_remediation_artifact(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".backup")
        || name.ends_with(".lock")
        || name.ends_with(".tmp")
        || name.contains(".corrupt-")
}

/// Stage every change except remediation artifacts
pub fn stage_all(repo_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;

    let mut skip_artifacts = |path: &Path, _spec: &[u8]| -> i32 {
        if is_remediation_artifact(path) {
            1
        } else {
            0
        }
    };
    index.add_all(
        ["*"].iter(),
        IndexAddOption::DEFAULT,
        Some(&mut skip_artifacts as &mut git2::IndexMatchedPath),
    )?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    Ok(())
}

/// Commit the index on top of HEAD (or as the root commit)
pub fn commit(repo_path: &Path, message: &str) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(_) => None,
    };
    let parents: Vec<&git2::Commit> = parent.iter().collect();

    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| "nightmend".to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| "nightmend@local".to_string());
    let sig = Signature::now(&name, &email)?;

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(oid.to_string())
}

/// Push the current branch to `origin` (shells out to git). `None` when
/// there is no origin to push to.
pub fn push_current_branch(repo_path: &Path) -> Result<Option<String>> {
    let repo = Repository::open(repo_path)?;
    if repo.find_remote("origin").is_err() {
        return Ok(None);
    }
    let head = repo.head().context("Failed to get HEAD")?;
    let branch = head
        .shorthand()
        .filter(|b| *b != "HEAD")
        .context("HEAD is detached; nothing to push")?
        .to_string();

    let output = Command::new("git")
        .current_dir(repo_path)
        .args(["push", "-u", "origin", &branch])
        .output()
        .context("Failed to execute git push")?;

    if output.status.success() {
        Ok(Some(branch))
    } else {
        Err(anyhow::anyhow!(
            "git push failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}

/// Force-checkout `files` from HEAD. Returns how many were restored; files
/// that HEAD does not track are left alone.
pub fn restore_files(repo_path: &Path, files: &[PathBuf]) -> Result<usize> {
    let repo = Repository::open(repo_path)?;
    let workdir = repo
        .workdir()
        .context("repository has no working directory")?
        .to_path_buf();
    let head_tree = repo
        .head()
        .and_then(|h| h.peel_to_tree())
        .context("Failed to resolve HEAD tree")?;

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    let mut restored = 0;
    for file in files {
        let relative = relative_to_workdir(&workdir, file)
            .with_context(|| format!("{} is outside the repository", file.display()))?;
        if head_tree.get_path(&relative).is_err() {
            warn!(file = %relative.display(), "not tracked in HEAD; left as is");
            continue;
        }
        debug!(file = %relative.display(), "restoring from HEAD");
        checkout.path(relative);
        restored += 1;
    }

    if restored > 0 {
        repo.checkout_head(Some(&mut checkout))
            .context("Failed to check out files from HEAD")?;
    }
    Ok(restored)
}

fn relative_to_workdir(workdir: &Path, file: &Path) -> Option<PathBuf> {
    if file.is_relative() {
        return Some(file.to_path_buf());
    }
    if let Ok(rel) = file.strip_prefix(workdir) {
        return Some(rel.to_path_buf());
    }
    let workdir = workdir.canonicalize().ok()?;
    let file = file.canonicalize().ok()?;
    file.strip_prefix(&workdir).ok().map(Path::to_path_buf)
}
