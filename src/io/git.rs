//! Git adapter for workspace snapshots and diff capture.
//!
//! The loop needs a clean baseline before the first attempt and one commit
//! boundary per attempt so failure diffs attribute to the right attempt, so we
//! keep a small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the workdir is inside a git worktree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current HEAD SHA, used as the run baseline marker.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is fully clean (including untracked files).
    ///
    /// A dirty worktree at run start would corrupt diff attribution, so this
    /// is checked before any attempt.
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(entry_count = entries.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (commit or stash before running):\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Unified diff of the worktree against a baseline commit.
    ///
    /// An attempt with no file changes yields an empty string, never an error.
    pub fn diff_since(&self, baseline: &str) -> Result<String> {
        self.run_capture(&["diff", baseline])
    }

    /// Discard all changes after `baseline`, restoring the snapshot state.
    #[instrument(skip_all, fields(baseline))]
    pub fn reset_hard(&self, baseline: &str) -> Result<()> {
        debug!(baseline, "resetting worktree to baseline");
        self.run_checked(&["reset", "--hard", baseline])?;
        Ok(())
    }

    /// Remove untracked files and directories. Ignored files are kept, so
    /// state dirs covered by .gitignore survive.
    ///
    /// `reset --hard` only restores tracked content; uncommitted new files
    /// need this to get back to a true snapshot state.
    #[instrument(skip_all)]
    pub fn clean_untracked(&self) -> Result<()> {
        debug!("removing untracked files");
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn diff_since_baseline_is_empty_without_changes() {
        let repo = crate::test_support::TestRepo::new();
        let git = Git::new(repo.path());
        let baseline = git.head_sha().expect("head");
        assert_eq!(git.diff_since(&baseline).expect("diff"), "");
    }

    #[test]
    fn diff_and_reset_follow_the_baseline() {
        let repo = crate::test_support::TestRepo::new();
        let git = Git::new(repo.path());
        let baseline = git.head_sha().expect("head");

        std::fs::write(repo.path().join("change.txt"), "changed\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("change").expect("commit"));
        assert!(git.diff_since(&baseline).expect("diff").contains("change.txt"));

        git.reset_hard(&baseline).expect("reset");
        assert!(!repo.path().join("change.txt").exists());
        assert_eq!(git.head_sha().expect("head"), baseline);
    }

    #[test]
    fn clean_untracked_removes_new_files_but_keeps_ignored() {
        let repo = crate::test_support::TestRepo::new();
        let git = Git::new(repo.path());

        std::fs::create_dir_all(repo.path().join(".state")).expect("mkdir");
        std::fs::write(repo.path().join(".state/.gitignore"), "*\n").expect("write");
        std::fs::write(repo.path().join(".state/log.txt"), "kept\n").expect("write");
        std::fs::write(repo.path().join("stray.txt"), "debris\n").expect("write");

        git.clean_untracked().expect("clean");
        assert!(!repo.path().join("stray.txt").exists());
        assert!(repo.path().join(".state/log.txt").exists());
        assert!(git.status_porcelain().expect("status").is_empty());
    }
}
