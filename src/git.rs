//! Git checkpoints through libgit2.
//!
//! [`GitCheckpoint`] stages the whole working tree (minus files that may
//! hold secrets) and commits it when an item completes.

use std::path::Path;

use anyhow::{Context, Result};
use git2::{IndexAddOption, Repository, Signature};
use tracing::debug;

use crate::agent::Artifacts;
use crate::checkpoint::{Checkpoint, commit_message};
use crate::state_machine::WorkItem;

/// Paths never staged by a checkpoint.
const EXCLUDED_NAMES: &[&str] = &[".env", ".env.local", "ralph.toml"];
const EXCLUDED_PATHS: &[&str] = &[".ralph/config.toml"];

pub struct GitCheckpoint {
    repo: Repository,
}

impl GitCheckpoint {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path).context("failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Stage everything and commit. Returns the short hash, or `None` if the
    /// tree is unchanged.
    pub fn commit(&self, message: &str) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut |path: &Path, _: &[u8]| -> i32 {
                if is_excluded(path) { 1 } else { 0 }
            }),
        )?;
        // Pick up deletions too.
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_oid = index.write_tree()?;
        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e).context("failed to resolve HEAD"),
        };

        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_oid) {
            debug!("nothing to commit");
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("ralph", "ralph@localhost"))?;
        let parents: Vec<_> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        let hash = oid.to_string();
        Ok(Some(hash[..7.min(hash.len())].to_string()))
    }

    pub fn current_branch(&self) -> Result<String> {
        let head = self.repo.head()?;
        let name = head
            .shorthand()
            .context("branch name is not valid UTF-8")?
            .to_string();
        Ok(name)
    }
}

fn is_excluded(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    EXCLUDED_NAMES.contains(&name)
        || name.ends_with(".key")
        || name.ends_with(".json.tmp")
        || EXCLUDED_PATHS.iter().any(|p| path == Path::new(p))
}

impl Checkpoint for GitCheckpoint {
    fn checkpoint(&self, item: &WorkItem, artifacts: &Artifacts) -> Result<Option<String>> {
        debug!(item = %item.id, artifact_len = artifacts.as_str().len(), "checkpointing");
        self.commit(&commit_message(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Temporary repository with one initial commit so HEAD exists.
    fn setup_temp_repo() -> (TempDir, GitCheckpoint) {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();

        let sig = Signature::now("test", "test@test.com").unwrap();
        let mut index = repo.index().unwrap();
        let tree_oid = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();

        drop(tree);
        drop(repo);
        let gc = GitCheckpoint::open(tmp.path()).unwrap();
        (tmp, gc)
    }

    fn head_message(path: &Path) -> String {
        let repo = Repository::open(path).unwrap();
        let commit = repo.head().unwrap().peel_to_commit().unwrap();
        commit.message().unwrap().to_string()
    }

    #[test]
    fn open_fails_on_non_repo_path() {
        let tmp = TempDir::new().unwrap();
        assert!(GitCheckpoint::open(tmp.path()).is_err());
    }

    #[test]
    fn checkpoint_commits_completed_item() {
        let (tmp, gc) = setup_temp_repo();
        fs::write(tmp.path().join("file.txt"), "hello").unwrap();

        let mut item = WorkItem::new("001", "Add login page");
        item.title = "Login page".into();
        let hash = gc.checkpoint(&item, &Artifacts::default()).unwrap().unwrap();

        assert_eq!(hash.len(), 7);
        assert_eq!(head_message(tmp.path()), "ralph: Complete 001 - Login page");
    }

    #[test]
    fn unchanged_tree_is_not_committed() {
        let (tmp, gc) = setup_temp_repo();
        fs::write(tmp.path().join("file.txt"), "hello").unwrap();
        assert!(gc.commit("first").unwrap().is_some());
        assert!(gc.commit("second").unwrap().is_none());
        assert_eq!(head_message(tmp.path()), "first");
    }

    #[test]
    fn secrets_are_not_staged() {
        let (tmp, gc) = setup_temp_repo();
        fs::write(tmp.path().join(".env"), "TOKEN=1").unwrap();
        fs::write(tmp.path().join("id.key"), "secret").unwrap();
        fs::write(tmp.path().join("main.rs"), "fn main() {}").unwrap();
        gc.commit("work").unwrap();

        let repo = Repository::open(tmp.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("main.rs").is_some());
        assert!(tree.get_name(".env").is_none());
        assert!(tree.get_name("id.key").is_none());
    }

    #[test]
    fn commits_on_unborn_branch() {
        let tmp = TempDir::new().unwrap();
        Repository::init(tmp.path()).unwrap();
        let gc = GitCheckpoint::open(tmp.path()).unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();

        assert!(gc.commit("root").unwrap().is_some());
        assert!(!gc.current_branch().unwrap().is_empty());
    }

    #[test]
    fn excluded_paths() {
        assert!(is_excluded(Path::new(".ralph/config.toml")));
        assert!(is_excluded(Path::new("deploy/prod.key")));
        assert!(!is_excluded(Path::new(".ralph/prd.json")));
    }
}
