//! Git worktree operations for worktree workspaces.
//!
//! Worktree workspaces give concurrent runs on the same repository branch
//! isolation: each step checks out its declared branch into its own
//! directory. Branches that do not exist yet are created from the current
//! HEAD of the configured repository root.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run_git(repo_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)
}

/// Check if a branch exists locally.
pub fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(repo_root)
        .output()?;
    Ok(output.status.success())
}

/// Create a branch from the current HEAD without checking it out.
pub fn create_branch_from_head(repo_root: &Path, branch: &str) -> Result<()> {
    run_git(repo_root, &["branch", branch, "HEAD"])?;
    Ok(())
}

/// Create a worktree for `branch` at `worktree_path`, creating the branch
/// from HEAD if it does not exist yet.
pub fn create_worktree(repo_root: &Path, worktree_path: &Path, branch: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("create parent directory: {e}")))?;
    }

    if !branch_exists(repo_root, branch)? {
        create_branch_from_head(repo_root, branch)?;
    }

    run_git(
        repo_root,
        &[
            "worktree",
            "add",
            worktree_path.to_string_lossy().as_ref(),
            branch,
        ],
    )?;
    Ok(())
}

/// Remove a worktree, discarding local changes.
pub fn remove_worktree(repo_root: &Path, worktree_path: &Path) -> Result<()> {
    run_git(
        repo_root,
        &[
            "worktree",
            "remove",
            "--force",
            worktree_path.to_string_lossy().as_ref(),
        ],
    )?;
    Ok(())
}

/// Discard all working-tree changes in a worktree. Retried steps keep the
/// branch but start from a clean tree.
pub fn reset_worktree(worktree_path: &Path) -> Result<()> {
    run_git(worktree_path, &["reset", "--hard", "HEAD"])?;
    run_git(worktree_path, &["clean", "-fd"])?;
    Ok(())
}

/// Check if the working tree has no uncommitted changes.
pub fn is_working_tree_clean(worktree_path: &Path) -> Result<bool> {
    let stdout = run_git(worktree_path, &["status", "--porcelain"])?;
    Ok(stdout.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap()
        };
        run(&["init"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial"]);
        dir
    }

    #[test]
    fn branch_exists_detects_head_branch() {
        let repo = setup_test_repo();
        assert!(!branch_exists(repo.path(), "wave/step").unwrap());
        create_branch_from_head(repo.path(), "wave/step").unwrap();
        assert!(branch_exists(repo.path(), "wave/step").unwrap());
    }

    #[test]
    fn create_worktree_creates_missing_branch() {
        let repo = setup_test_repo();
        let worktree_path = repo.path().parent().unwrap().join("wave-worktree-test");

        create_worktree(repo.path(), &worktree_path, "wave/build").unwrap();
        assert!(worktree_path.exists());
        assert!(branch_exists(repo.path(), "wave/build").unwrap());

        remove_worktree(repo.path(), &worktree_path).unwrap();
        assert!(!worktree_path.exists());
    }

    #[test]
    fn reset_worktree_discards_edits() {
        let repo = setup_test_repo();
        let worktree_path = repo.path().parent().unwrap().join("wave-worktree-reset");
        create_worktree(repo.path(), &worktree_path, "wave/reset").unwrap();

        std::fs::write(worktree_path.join("README.md"), "dirty").unwrap();
        std::fs::write(worktree_path.join("scratch.txt"), "junk").unwrap();
        assert!(!is_working_tree_clean(&worktree_path).unwrap());

        reset_worktree(&worktree_path).unwrap();
        assert!(is_working_tree_clean(&worktree_path).unwrap());
        assert!(!worktree_path.join("scratch.txt").exists());

        remove_worktree(repo.path(), &worktree_path).unwrap();
    }
}
