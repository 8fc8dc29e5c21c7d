//! Project/branch directory resolution.
//!
//! Worktree creation itself is the git layer's business; this module only
//! resolves the directory a run executes in and rejects branch paths that
//! would escape the project's worktrees root.

use std::path::{Component, PathBuf};

use thiserror::Error;

use crate::config::{Config, ConfigError, ProjectConfig};
use crate::router::RunContext;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("unknown project {0:?}")]
    UnknownProject(String),

    #[error("branch {branch:?} is not a valid worktree path")]
    IllegalBranch { branch: String },

    #[error("project {project:?} has no worktrees_dir; cannot use @branch")]
    NoWorktreesDir { project: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub fn validate_branch(branch: &str) -> Result<(), WorkspaceError> {
    let illegal = branch.is_empty()
        || branch.starts_with('/')
        || branch.starts_with('\\')
        || branch.ends_with('/')
        || PathBuf::from(branch)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if illegal {
        return Err(WorkspaceError::IllegalBranch {
            branch: branch.to_string(),
        });
    }
    Ok(())
}

/// Working directory for a run: project path, or the branch worktree under
/// the project's worktrees root; `None` when no project context applies.
pub fn resolve(config: &Config, context: &RunContext) -> Result<Option<PathBuf>, WorkspaceError> {
    let Some(project_key) = &context.project else {
        return Ok(None);
    };
    let project: &ProjectConfig = config
        .projects
        .get(project_key)
        .ok_or_else(|| WorkspaceError::UnknownProject(project_key.clone()))?;

    let Some(branch) = &context.branch else {
        return Ok(Some(project.path.clone()));
    };
    validate_branch(branch)?;
    let worktrees_dir =
        project
            .worktrees_dir
            .as_ref()
            .ok_or_else(|| WorkspaceError::NoWorktreesDir {
                project: project_key.clone(),
            })?;
    Ok(Some(worktrees_dir.join(branch)))
}
