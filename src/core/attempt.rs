//! Run-scoped attempt bookkeeping and the final run report.
//!
//! These types are owned by the orchestration loop for the duration of one run
//! and are never persisted beyond the report printed at the end.

use serde::Serialize;

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Pending,
    Passed,
    Failed,
    /// Infrastructure failure (agent crash/timeout, verifier crash), distinct
    /// from a task-logic failure.
    Error,
}

/// One iteration of the learning loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    /// 1-based, monotonically increasing within a run.
    pub number: u32,
    pub outcome: AttemptOutcome,
    /// Short description of what went wrong. Present iff outcome is not `Passed`.
    pub detail: Option<String>,
    /// Final message the agent reported. Absent when the invocation itself
    /// failed.
    pub agent_summary: Option<String>,
    /// Whether a rule was learned and persisted for this attempt.
    pub rule_learned: bool,
}

impl Attempt {
    pub fn started(number: u32) -> Self {
        Self {
            number,
            outcome: AttemptOutcome::Pending,
            detail: None,
            agent_summary: None,
            rule_learned: false,
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    Success,
    /// Retry budget exhausted without a passing verification.
    Exhausted,
    /// `auto_retry` is disabled; the run stopped after a failed attempt for
    /// manual review.
    AwaitingManualReview,
    /// Unrecoverable error. Names the failing stage and attempt.
    Aborted {
        stage: String,
        attempt: u32,
        reason: String,
    },
}

/// Final report for one run, including the full attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub task: String,
    pub outcome: RunOutcome,
    pub attempts: Vec<Attempt>,
}

impl RunReport {
    /// Number of attempts actually entered.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn rules_learned(&self) -> u32 {
        self.attempts.iter().filter(|a| a.rule_learned).count() as u32
    }
}
