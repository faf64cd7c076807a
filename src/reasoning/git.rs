//! Git capability consumed by the reasoning trace: current branch/commit,
//! and working-tree diffs to attach to a completed action.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct GitState {
    pub branch: String,
    pub commit_hash: String,
}

#[derive(Debug, Clone)]
pub struct WorkingDiff {
    pub file_path: String,
    pub unified_diff: String,
    pub additions: u32,
    pub removals: u32,
    pub commit_hash: String,
    pub captured_at: DateTime<Utc>,
}

#[async_trait]
pub trait GitCollaborator: Send + Sync {
    async fn current_state(&self) -> Result<GitState>;
    async fn capture_working_diffs(&self) -> Result<Vec<WorkingDiff>>;
}

/// Default `GitCollaborator`: shells out to the system `git` binary found
/// via `PATH`, falling back to a bare `git` invocation if lookup fails.
pub struct ProcessGitCollaborator {
    repo_root: PathBuf,
    binary: String,
}

impl ProcessGitCollaborator {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        let binary = which::which("git")
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| shellexpand::tilde("git").to_string());
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            binary,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.repo_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Internal(format!("failed to spawn git: {e}")))?;

        if !output.status.success() {
            return Err(Error::Internal(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl GitCollaborator for ProcessGitCollaborator {
    async fn current_state(&self) -> Result<GitState> {
        let branch = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let commit_hash = self.run(&["rev-parse", "HEAD"]).await?;
        Ok(GitState { branch, commit_hash })
    }

    async fn capture_working_diffs(&self) -> Result<Vec<WorkingDiff>> {
        let commit_hash = self.run(&["rev-parse", "HEAD"]).await.unwrap_or_default();
        let numstat = self.run(&["diff", "--numstat"]).await?;
        let now = Utc::now();

        let mut diffs = Vec::new();
        for line in numstat.lines() {
            let Some((additions, removals, file_path)) = parse_numstat_line(line) else {
                continue;
            };
            let unified_diff = self.run(&["diff", "--", &file_path]).await.unwrap_or_default();
            diffs.push(WorkingDiff {
                file_path,
                unified_diff,
                additions,
                removals,
                commit_hash: commit_hash.clone(),
                captured_at: now,
            });
        }

        Ok(diffs)
    }
}

/// Parse one line of `git diff --numstat` output (`additions\tremovals\tpath`).
/// Binary files report `-` for both counts; those are treated as zero.
fn parse_numstat_line(line: &str) -> Option<(u32, u32, String)> {
    let mut parts = line.split_whitespace();
    let additions = parts.next()?.parse().unwrap_or(0);
    let removals = parts.next()?.parse().unwrap_or(0);
    let file_path = parts.next()?.to_string();
    Some((additions, removals, file_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_numstat_line_reads_additions_removals_path() {
        let (additions, removals, path) = parse_numstat_line("12\t3\tsrc/main.rs").unwrap();
        assert_eq!(additions, 12);
        assert_eq!(removals, 3);
        assert_eq!(path, "src/main.rs");
    }

    #[test]
    fn parse_numstat_line_treats_binary_markers_as_zero() {
        let (additions, removals, path) = parse_numstat_line("-\t-\tassets/logo.png").unwrap();
        assert_eq!(additions, 0);
        assert_eq!(removals, 0);
        assert_eq!(path, "assets/logo.png");
    }

    #[test]
    fn parse_numstat_line_rejects_too_few_fields() {
        assert!(parse_numstat_line("12\t3").is_none());
    }
}
