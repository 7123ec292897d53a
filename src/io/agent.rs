//! Coding-agent abstraction for task attempts.
//!
//! The [`CodingAgent`] trait decouples loop orchestration from the actual
//! agent backend (currently headless `claude -p`). Tests use scripted agents
//! that mutate a workspace without spawning processes.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Workspace the agent operates on.
    pub workdir: PathBuf,
    /// Task description to attempt.
    pub task: String,
    /// Current knowledge-store contents, so previously learned rules are
    /// visible to the agent.
    pub instructions: String,
    /// Maximum agent turns before it must stop.
    pub max_turns: u32,
    /// Maximum time to wait for the invocation.
    pub timeout: Duration,
    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Path to write the raw invocation log.
    pub log_path: PathBuf,
}

/// Invocation-level result, distinct from test pass/fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    /// Final message the agent reported.
    pub result_text: String,
}

/// Infrastructure failure of the agent invocation itself (spawn failure,
/// timeout, crash, malformed output envelope). Recovered via `downcast_ref`
/// so the loop can apply the configured infrastructure-error policy.
#[derive(Debug)]
pub struct AgentInfraError {
    pub detail: String,
}

impl fmt::Display for AgentInfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent infrastructure error: {}", self.detail)
    }
}

impl std::error::Error for AgentInfraError {}

/// Abstraction over coding-agent backends.
pub trait CodingAgent {
    /// Attempt the task in the request's workspace.
    fn invoke(&self, request: &AgentRequest) -> Result<AgentInvocation>;
}

/// JSON envelope emitted by `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
struct ClaudeEnvelope {
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: String,
}

/// Agent that spawns headless `claude -p`.
pub struct ClaudeCodeAgent;

impl CodingAgent for ClaudeCodeAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), max_turns = request.max_turns))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentInvocation> {
        info!(workdir = %request.workdir.display(), "starting claude invocation");

        let prompt = build_prompt(&request.task, &request.instructions);
        let mut cmd = Command::new("claude");
        cmd.arg("-p")
            .arg(&prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--dangerously-skip-permissions")
            .arg("--max-turns")
            .arg(request.max_turns.to_string())
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        )
        .map_err(|err| {
            anyhow!(AgentInfraError {
                detail: format!("{err:#}"),
            })
        })?;

        write_invocation_log(&request.log_path, &output.combined_text())?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "claude timed out");
            return Err(anyhow!(AgentInfraError {
                detail: format!("timed out after {:?}", request.timeout),
            }));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "claude exited non-zero");
            return Err(anyhow!(AgentInfraError {
                detail: format!("exited with status {:?}", output.status.code()),
            }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope: ClaudeEnvelope = serde_json::from_str(stdout.trim()).map_err(|err| {
            anyhow!(AgentInfraError {
                detail: format!("malformed output envelope: {err}"),
            })
        })?;
        if envelope.is_error {
            return Err(anyhow!(AgentInfraError {
                detail: format!("agent reported error: {}", envelope.result),
            }));
        }

        debug!("claude invocation completed");
        Ok(AgentInvocation {
            result_text: envelope.result,
        })
    }
}

/// Prepend learned rules to the task so accumulated knowledge reaches the
/// agent even when the store lives outside its instruction search path.
fn build_prompt(task: &str, instructions: &str) -> String {
    if instructions.trim().is_empty() {
        return task.to_string();
    }
    format!(
        "{task}\n\n## Learned rules from previous runs\n\n{}\n",
        instructions.trim()
    )
}

fn write_invocation_log(path: &PathBuf, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_rules_when_present() {
        let prompt = build_prompt("fix the bug", "### Rule\n- **Rule**: x");
        assert!(prompt.starts_with("fix the bug"));
        assert!(prompt.contains("## Learned rules from previous runs"));
        assert!(prompt.contains("- **Rule**: x"));
    }

    #[test]
    fn prompt_is_bare_task_without_rules() {
        assert_eq!(build_prompt("fix the bug", "  \n"), "fix the bug");
    }

    #[test]
    fn envelope_parses_with_defaults() {
        let envelope: ClaudeEnvelope = serde_json::from_str("{}").expect("parse");
        assert!(!envelope.is_error);
        assert_eq!(envelope.result, "");
    }

    #[test]
    fn infra_error_downcasts_through_anyhow() {
        let err = anyhow!(AgentInfraError {
            detail: "boom".to_string(),
        });
        let infra = err.downcast_ref::<AgentInfraError>().expect("downcast");
        assert_eq!(infra.detail, "boom");
    }
}
