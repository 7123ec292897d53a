//! Orchestration for the learning loop: attempt, verify, analyze, persist,
//! retry.
//!
//! The loop is strictly sequential. Each stage depends on the side effects of
//! the previous one (workspace state, commit history), so nothing here runs
//! concurrently. Cancellation is cooperative and only observed at stage
//! boundaries: a cancel between attempt and verify still lets verification
//! finish so workspace state is never ambiguous.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::attempt::{Attempt, AttemptOutcome, RunOutcome, RunReport};
use crate::core::failure::FailureRecord;
use crate::core::prompts::select_template;
use crate::io::agent::{AgentInfraError, AgentRequest, CodingAgent};
use crate::io::config::{InfraErrorPolicy, LoopConfig};
use crate::io::git::Git;
use crate::io::knowledge::{AppendOutcome, KnowledgeStore};
use crate::io::teacher::{MalformedVerdict, TeacherClient, TeacherUnavailable};
use crate::io::verifier::{Verifier, VerifierInfraError, VerifyRequest};

/// Backoff before the single teacher retry after `TeacherUnavailable`.
const TEACHER_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// External collaborators for one run.
pub struct LoopDeps<'a, A, V, T> {
    pub agent: &'a A,
    pub verifier: &'a V,
    pub teacher: &'a T,
    pub store: &'a KnowledgeStore,
}

/// Infrastructure failure of a stage, subject to the configured policy.
struct StageFailure {
    stage: &'static str,
    detail: String,
}

/// Drive one run of the learning loop to a terminal outcome.
///
/// Precondition failures (no git repo, dirty worktree, invalid config) abort
/// before the first attempt. After that, every path produces a report with
/// the full attempt history.
#[instrument(skip_all, fields(max_retries = cfg.learning.max_retries, auto_retry = cfg.learning.auto_retry))]
pub fn run_learning_loop<A, V, T>(
    root: &Path,
    deps: &LoopDeps<'_, A, V, T>,
    cfg: &LoopConfig,
    task: &str,
    cancel: &AtomicBool,
) -> Result<RunReport>
where
    A: CodingAgent,
    V: Verifier,
    T: TeacherClient,
{
    cfg.validate().context("validate run configuration")?;

    let git = Git::new(root);
    let mut attempts: Vec<Attempt> = Vec::new();
    let report = |outcome: RunOutcome, attempts: Vec<Attempt>| RunReport {
        task: task.to_string(),
        outcome,
        attempts,
    };

    // Start: the baseline snapshot must be unambiguous before any attempt.
    if !git.is_repo() {
        return Ok(report(
            aborted("start", 0, "project directory is not a git repository"),
            attempts,
        ));
    }
    if let Err(err) = git.ensure_clean() {
        return Ok(report(aborted("start", 0, &format!("{err:#}")), attempts));
    }
    ensure_loop_gitignore(root)?;
    let baseline = git.head_sha().context("read baseline snapshot")?;
    info!(baseline = %baseline, "run started");

    loop {
        let number = attempts.len() as u32 + 1;
        if cancel.load(Ordering::SeqCst) {
            return Ok(report(aborted("attempt", number, "cancelled"), attempts));
        }
        attempts.push(Attempt::started(number));
        info!(attempt = number, max_retries = cfg.learning.max_retries, "starting attempt");

        // Attempt: the agent sees the task plus everything learned so far.
        let instructions = deps.store.read().context("read knowledge store")?;
        let agent_request = AgentRequest {
            workdir: root.to_path_buf(),
            task: task.to_string(),
            instructions,
            max_turns: cfg.claude.max_turns,
            timeout: Duration::from_secs(cfg.claude.timeout_secs),
            output_limit_bytes: cfg.learning.output_limit_bytes,
            log_path: attempt_log_path(root, number, "agent.log"),
        };
        match deps.agent.invoke(&agent_request) {
            Ok(invocation) => {
                debug!(result = %truncate_for_log(&invocation.result_text), "agent finished");
                if let Some(last) = attempts.last_mut() {
                    last.agent_summary = Some(invocation.result_text);
                }
            }
            Err(err) => {
                let failure = classify_infra(&err, "attempt")?;
                match handle_infra(failure, cfg, &git, &baseline, &mut attempts)? {
                    InfraDecision::Abort(outcome) => return Ok(report(outcome, attempts)),
                    InfraDecision::ConsumeRetry => {
                        if attempts.len() as u32 >= cfg.learning.max_retries {
                            return Ok(report(RunOutcome::Exhausted, attempts));
                        }
                        continue;
                    }
                }
            }
        }

        // One commit boundary per attempt keeps diff attribution well-defined.
        git.add_all().context("stage attempt changes")?;
        let committed = git
            .commit_staged(&format!("learning-loop attempt {number}"))
            .context("commit attempt changes")?;
        if !committed {
            warn!(attempt = number, "agent made no changes");
        }

        // Verification always runs to completion, even when cancellation is
        // pending.
        let verify_request = VerifyRequest {
            workdir: root.to_path_buf(),
            command: cfg.tests.command.clone(),
            timeout: Duration::from_secs(cfg.tests.timeout_secs),
            log_path: attempt_log_path(root, number, "verify.log"),
            output_limit_bytes: cfg.learning.output_limit_bytes,
        };
        let verdict = match deps.verifier.verify(&verify_request) {
            Ok(verdict) => verdict,
            Err(err) => {
                let failure = classify_infra(&err, "verify")?;
                match handle_infra(failure, cfg, &git, &baseline, &mut attempts)? {
                    InfraDecision::Abort(outcome) => return Ok(report(outcome, attempts)),
                    InfraDecision::ConsumeRetry => {
                        if attempts.len() as u32 >= cfg.learning.max_retries {
                            return Ok(report(RunOutcome::Exhausted, attempts));
                        }
                        continue;
                    }
                }
            }
        };

        if verdict.passed {
            mark_last(&mut attempts, AttemptOutcome::Passed, None);
            info!(attempt = number, "verification passed");
            return Ok(report(RunOutcome::Success, attempts));
        }

        info!(attempt = number, "verification failed");
        let diff = git.diff_since(&baseline).context("capture attempt diff")?;
        mark_last(
            &mut attempts,
            AttemptOutcome::Failed,
            Some(tail_lines(&verdict.output, 5)),
        );
        let record = FailureRecord::automated(task, diff, verdict.output);

        if cancel.load(Ordering::SeqCst) {
            // Workspace state is settled (verify completed); stop before analyze.
            return Ok(report(aborted("analyze", number, "cancelled"), attempts));
        }

        // Analyze: teacher outage is recoverable (retry the attempt without a
        // new rule); a malformed verdict is a data error and must not be
        // silently dropped.
        let template = select_template(record.category);
        let verdict = match analyze_with_retry(deps.teacher, &record, template) {
            Ok(verdict) => Some(verdict),
            Err(err) => {
                if err.downcast_ref::<TeacherUnavailable>().is_some() {
                    warn!(attempt = number, err = %err, "teacher unavailable, no rule learned this attempt");
                    None
                } else if err.downcast_ref::<MalformedVerdict>().is_some() {
                    return Ok(report(
                        aborted("analyze", number, &format!("{err:#}")),
                        attempts,
                    ));
                } else {
                    return Err(err.context("teacher analysis"));
                }
            }
        };

        // Persist: duplicates are a normal outcome, an unwritable store is not.
        if let Some(verdict) = verdict {
            debug!(analysis = %truncate_for_log(&verdict.analysis), "teacher analysis received");
            match deps.store.append(&verdict.rule) {
                Ok(AppendOutcome::Appended) => {
                    if let Some(last) = attempts.last_mut() {
                        last.rule_learned = true;
                    }
                }
                Ok(AppendOutcome::Duplicate) => {
                    debug!(attempt = number, "rule already known, not re-appended");
                }
                Err(err) => {
                    return Ok(report(
                        aborted("persist", number, &format!("{err:#}")),
                        attempts,
                    ));
                }
            }
        }

        // Restore the baseline so the next attempt starts from the snapshot
        // and its diff stays attributable to that attempt alone.
        git.reset_hard(&baseline).context("reset to baseline")?;

        // Retry decision.
        if attempts.len() as u32 >= cfg.learning.max_retries {
            return Ok(report(RunOutcome::Exhausted, attempts));
        }
        if !cfg.learning.auto_retry {
            info!("auto-retry disabled, stopping for manual review");
            return Ok(report(RunOutcome::AwaitingManualReview, attempts));
        }
    }
}

enum InfraDecision {
    Abort(RunOutcome),
    ConsumeRetry,
}

/// Map an adapter error to a stage failure; non-infrastructure errors
/// propagate unchanged.
fn classify_infra(err: &anyhow::Error, stage: &'static str) -> Result<StageFailure> {
    if let Some(infra) = err.downcast_ref::<AgentInfraError>() {
        return Ok(StageFailure {
            stage,
            detail: infra.detail.clone(),
        });
    }
    if let Some(infra) = err.downcast_ref::<VerifierInfraError>() {
        return Ok(StageFailure {
            stage,
            detail: infra.detail.clone(),
        });
    }
    Err(anyhow!("{stage} failed: {err:#}"))
}

fn handle_infra(
    failure: StageFailure,
    cfg: &LoopConfig,
    git: &Git,
    baseline: &str,
    attempts: &mut [Attempt],
) -> Result<InfraDecision> {
    let StageFailure { stage, detail } = failure;
    let number = attempts.len() as u32;
    warn!(stage, attempt = number, detail = %detail, "infrastructure error");
    if let Some(last) = attempts.last_mut() {
        last.outcome = AttemptOutcome::Error;
        last.detail = Some(detail.clone());
    }
    match cfg.learning.on_infra_error {
        InfraErrorPolicy::Abort => Ok(InfraDecision::Abort(RunOutcome::Aborted {
            stage: stage.to_string(),
            attempt: number,
            reason: detail,
        })),
        InfraErrorPolicy::Retry => {
            // The failed stage may have left partial edits behind, including
            // uncommitted new files that a hard reset alone would keep and the
            // next attempt's commit would then absorb.
            git.reset_hard(baseline).context("reset after infra error")?;
            git.clean_untracked().context("clean after infra error")?;
            Ok(InfraDecision::ConsumeRetry)
        }
    }
}

fn analyze_with_retry<T: TeacherClient>(
    teacher: &T,
    record: &FailureRecord,
    template: crate::core::prompts::PromptTemplate,
) -> Result<crate::io::teacher::TeacherVerdict> {
    match teacher.analyze(record, template) {
        Ok(verdict) => Ok(verdict),
        Err(err) if err.downcast_ref::<TeacherUnavailable>().is_some() => {
            warn!(err = %err, "teacher unavailable, retrying once after backoff");
            thread::sleep(TEACHER_RETRY_BACKOFF);
            teacher.analyze(record, template)
        }
        Err(err) => Err(err),
    }
}

fn mark_last(attempts: &mut [Attempt], outcome: AttemptOutcome, detail: Option<String>) {
    if let Some(last) = attempts.last_mut() {
        last.outcome = outcome;
        last.detail = detail;
    }
}

fn aborted(stage: &str, attempt: u32, reason: &str) -> RunOutcome {
    RunOutcome::Aborted {
        stage: stage.to_string(),
        attempt,
        reason: reason.to_string(),
    }
}

/// Per-attempt log location inside the ignored `.learnloop/` state dir.
fn attempt_log_path(root: &Path, attempt: u32, name: &str) -> PathBuf {
    root.join(".learnloop")
        .join("attempts")
        .join(attempt.to_string())
        .join(name)
}

/// `.learnloop/` holds per-attempt logs and must never reach the attempt
/// commits, or diffs would attribute loop artifacts to the agent.
fn ensure_loop_gitignore(root: &Path) -> Result<()> {
    let dir = root.join(".learnloop");
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(".gitignore");
    if !path.exists() {
        fs::write(&path, "*\n").with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

fn truncate_for_log(text: &str) -> String {
    text.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), text);
    }

    #[test]
    fn attempt_log_paths_are_stable() {
        let path = attempt_log_path(Path::new("/work"), 2, "agent.log");
        assert!(path.ends_with(".learnloop/attempts/2/agent.log"));
    }
}
