//! Verification runner adapter for the configured test command.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for one verification run.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    /// Test command, argv style (e.g. `["pytest","tests/","-v"]`).
    pub command: Vec<String>,
    pub timeout: Duration,
    /// Path to write the captured test output.
    pub log_path: PathBuf,
    pub output_limit_bytes: usize,
}

/// Result of a verification run. A failing test suite is a normal outcome
/// here; only runner breakage (spawn failure, timeout) is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub output: String,
}

/// Infrastructure failure of the verification run itself.
#[derive(Debug)]
pub struct VerifierInfraError {
    pub detail: String,
}

impl fmt::Display for VerifierInfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "verifier infrastructure error: {}", self.detail)
    }
}

impl std::error::Error for VerifierInfraError {}

/// Abstraction over verification backends.
pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome>;
}

/// Verifier that spawns the configured test command.
pub struct CommandVerifier;

impl Verifier for CommandVerifier {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let program = request
            .command
            .first()
            .ok_or_else(|| anyhow!("empty verification command"))?;
        debug!(command = ?request.command, "running verification");

        let mut cmd = Command::new(program);
        cmd.args(&request.command[1..]).current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        )
        .map_err(|err| {
            anyhow!(VerifierInfraError {
                detail: format!("{err:#}"),
            })
        })?;

        let text = output.combined_text();
        write_verify_log(&request.log_path, &text)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "verification timed out");
            return Err(anyhow!(VerifierInfraError {
                detail: format!("timed out after {:?}", request.timeout),
            }));
        }

        let passed = output.status.success();
        debug!(passed, exit_code = ?output.status.code(), "verification finished");
        Ok(VerifyOutcome {
            passed,
            output: text,
        })
    }
}

fn write_verify_log(path: &PathBuf, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write verify log {}", path.display()))
}
