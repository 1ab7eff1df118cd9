//! Per-step workspace provisioning.
//!
//! Every step owns `<workspace_root>/<run_id>/<step_id>/` (fan-out workers
//! get a `worker_<k>` subdirectory). Staging workspaces are populated from
//! declared mounts; worktree workspaces are git worktree checkouts. Skill
//! command files are copied into the workspace's commands directory so the
//! persona can invoke them.

use crate::git;
use globset::{Glob, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use wave_core::{MountMode, WorkspaceKind, WorkspaceSpec};

/// Directory names never copied into a staging workspace.
const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "target", "__pycache__", ".venv"];

/// Engine state directory, excluded unless explicitly mounted.
const STATE_DIR: &str = ".wave";

/// Commands directory inside each workspace.
pub const COMMANDS_DIR: &str = ".claude/commands";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("mount source not found: {0}")]
    MountSourceNotFound(PathBuf),
    #[error("path escapes the workspace: {0}")]
    PathTraversal(String),
    #[error("worktree workspace requires a repository root and branch on step {0}")]
    WorktreeConfigMissing(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Creates and tears down step workspaces under a single root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<run_id>/<step_id>[/worker_<k>]`
    pub fn step_dir(&self, run_id: &str, step_id: &str, worker: Option<usize>) -> PathBuf {
        let mut dir = self.root.join(run_id).join(step_id);
        if let Some(index) = worker {
            dir = dir.join(format!("worker_{index}"));
        }
        dir
    }

    /// Create the workspace for a step according to its spec. Returns the
    /// workspace directory.
    pub fn provision(
        &self,
        run_id: &str,
        step_id: &str,
        worker: Option<usize>,
        spec: &WorkspaceSpec,
    ) -> Result<PathBuf> {
        let dir = self.step_dir(run_id, step_id, worker);

        match spec.kind {
            WorkspaceKind::Mount => {
                std::fs::create_dir_all(&dir)?;
                for mount in &spec.mounts {
                    self.apply_mount(&dir, &mount.source, &mount.target, mount.mode)?;
                }
            }
            WorkspaceKind::Worktree => {
                let (Some(repo_root), Some(branch)) = (&spec.root, &spec.branch) else {
                    return Err(WorkspaceError::WorktreeConfigMissing(step_id.to_string()));
                };
                git::create_worktree(repo_root, &dir, branch)?;
            }
        }

        debug!(run_id, step_id, workspace = %dir.display(), "workspace provisioned");
        Ok(dir)
    }

    /// Rebuild a workspace for a retry. Staging workspaces are recreated
    /// from scratch; worktree workspaces keep their branch and reset the
    /// working tree.
    pub fn rebuild(
        &self,
        run_id: &str,
        step_id: &str,
        worker: Option<usize>,
        spec: &WorkspaceSpec,
    ) -> Result<PathBuf> {
        let dir = self.step_dir(run_id, step_id, worker);

        match spec.kind {
            WorkspaceKind::Mount => {
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
                self.provision(run_id, step_id, worker, spec)
            }
            WorkspaceKind::Worktree => {
                if dir.exists() {
                    git::reset_worktree(&dir)?;
                    Ok(dir)
                } else {
                    self.provision(run_id, step_id, worker, spec)
                }
            }
        }
    }

    /// Remove a step workspace. Worktree workspaces are detached through
    /// git unless the step asked to keep them.
    pub fn cleanup(
        &self,
        run_id: &str,
        step_id: &str,
        worker: Option<usize>,
        spec: &WorkspaceSpec,
    ) -> Result<()> {
        let dir = self.step_dir(run_id, step_id, worker);
        if !dir.exists() {
            return Ok(());
        }

        if spec.kind == WorkspaceKind::Worktree {
            if spec.keep_worktree {
                return Ok(());
            }
            if let Some(repo_root) = &spec.root {
                if let Err(e) = git::remove_worktree(repo_root, &dir) {
                    warn!(run_id, step_id, error = %e, "worktree removal failed");
                }
                return Ok(());
            }
        }

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// Resolve a workspace-relative path, rejecting traversal outside the
    /// step directory. Adapter-provided paths always pass through here.
    pub fn resolve_in_workspace(&self, workspace: &Path, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            return Err(WorkspaceError::PathTraversal(relative.to_string()));
        }
        for component in candidate.components() {
            if matches!(component, Component::ParentDir) {
                return Err(WorkspaceError::PathTraversal(relative.to_string()));
            }
        }
        Ok(workspace.join(candidate))
    }

    /// Copy files matching a skill's commands glob into the workspace
    /// commands directory.
    pub fn install_skill_commands(&self, workspace: &Path, commands_glob: &str) -> Result<usize> {
        let commands_dir = workspace.join(COMMANDS_DIR);
        std::fs::create_dir_all(&commands_dir)?;

        let mut builder = GlobSetBuilder::new();
        if let Ok(glob) = Glob::new(commands_glob) {
            builder.add(glob);
        }
        let Ok(set) = builder.build() else {
            return Ok(0);
        };

        // Walk from the glob's literal prefix to avoid scanning the world.
        let base = glob_base(commands_glob);
        let mut copied = 0;
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if set.is_match(&path) {
                    if let Some(name) = path.file_name() {
                        std::fs::copy(&path, commands_dir.join(name))?;
                        copied += 1;
                    }
                }
            }
        }

        Ok(copied)
    }

    fn apply_mount(
        &self,
        workspace: &Path,
        source: &Path,
        target: &str,
        mode: MountMode,
    ) -> Result<()> {
        if !source.exists() {
            return Err(WorkspaceError::MountSourceNotFound(source.to_path_buf()));
        }

        let target_path = self.resolve_in_workspace(workspace, target)?;
        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match mode {
            MountMode::Readonly => {
                if source.is_dir() {
                    copy_dir_filtered(source, &target_path)?;
                } else {
                    std::fs::copy(source, &target_path)?;
                }
            }
            MountMode::Readwrite => {
                #[cfg(unix)]
                std::os::unix::fs::symlink(source, &target_path)?;
                #[cfg(not(unix))]
                {
                    if source.is_dir() {
                        copy_dir_filtered(source, &target_path)?;
                    } else {
                        std::fs::copy(source, &target_path)?;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Literal directory prefix of a glob pattern (components before the first
/// wildcard), used as the walk root.
fn glob_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    for part in Path::new(pattern).components() {
        let text = part.as_os_str().to_string_lossy();
        if text.contains('*') || text.contains('?') || text.contains('[') {
            break;
        }
        base.push(part);
    }
    if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base
    }
}

/// Recursive copy skipping noise directories and engine state.
fn copy_dir_filtered(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if EXCLUDED_DIRS.contains(&name_str.as_ref()) || name_str == STATE_DIR {
            continue;
        }
        let source_path = entry.path();
        let target_path = target.join(&name);
        if source_path.is_dir() {
            copy_dir_filtered(&source_path, &target_path)?;
        } else {
            std::fs::copy(&source_path, &target_path)?;
        }
    }
    Ok(())
}
