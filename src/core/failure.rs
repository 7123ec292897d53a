//! Normalized failure records fed to the teacher.
//!
//! A [`FailureRecord`] describes one failure occurrence, whether it came from
//! an automated verification run or a manually reported process mistake. It is
//! immutable after construction and consumed exactly once by a teacher client.

use chrono::{DateTime, Local};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Closed set of failure categories.
///
/// Unrecognized or future categories map onto `Other`; prompt selection has an
/// explicit default arm, so extending this enum is a data change in the
/// selector table rather than control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum FailureCategory {
    TestFailure,
    PlanningError,
    IntegrationError,
    WorkflowError,
    ArchitectureError,
    ScopeError,
    ConfigError,
    Other,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestFailure => "test_failure",
            Self::PlanningError => "planning_error",
            Self::IntegrationError => "integration_error",
            Self::WorkflowError => "workflow_error",
            Self::ArchitectureError => "architecture_error",
            Self::ScopeError => "scope_error",
            Self::ConfigError => "config_error",
            Self::Other => "other",
        }
    }
}

/// Where a failure record originated. Determines whether retry is possible:
/// only automated failures sit inside the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    Automated,
    UserReported,
    /// Reserved for a future semantic-review path; nothing constructs this yet.
    LlmAnalysis,
}

impl FailureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automated => "automated",
            Self::UserReported => "user report",
            Self::LlmAnalysis => "llm analysis",
        }
    }
}

/// One normalized failure occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub category: FailureCategory,
    pub source: FailureSource,
    /// The original goal being attempted.
    pub task: String,
    /// Unified diff of the failing attempt. Present only for automated failures.
    pub diff: Option<String>,
    /// Error logs (automated) or failure description plus context (reported).
    pub evidence: String,
    pub occurred_at: DateTime<Local>,
}

impl FailureRecord {
    /// Record a verification failure from the automated loop.
    pub fn automated(task: impl Into<String>, diff: String, error_logs: String) -> Self {
        Self {
            category: FailureCategory::TestFailure,
            source: FailureSource::Automated,
            task: task.into(),
            diff: Some(diff),
            evidence: error_logs,
            occurred_at: Local::now(),
        }
    }

    /// Record a manually reported process failure (planning, integration, ...).
    pub fn reported(
        category: FailureCategory,
        task: impl Into<String>,
        description: &str,
        context: &str,
    ) -> Self {
        let evidence = format!("## Context\n{context}\n\n## Failure Description\n{description}\n");
        Self {
            category,
            source: FailureSource::UserReported,
            task: task.into(),
            diff: None,
            evidence,
            occurred_at: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automated_record_is_test_failure_with_diff() {
        let record = FailureRecord::automated("fix bug", "diff text".to_string(), "logs".to_string());
        assert_eq!(record.category, FailureCategory::TestFailure);
        assert_eq!(record.source, FailureSource::Automated);
        assert_eq!(record.diff.as_deref(), Some("diff text"));
        assert_eq!(record.evidence, "logs");
    }

    #[test]
    fn reported_record_renders_context_and_description() {
        let record = FailureRecord::reported(
            FailureCategory::PlanningError,
            "deploy workflow",
            "created a duplicate",
            "should have checked existing infrastructure",
        );
        assert_eq!(record.source, FailureSource::UserReported);
        assert!(record.diff.is_none());
        assert!(record.evidence.contains("## Context"));
        assert!(record.evidence.contains("should have checked existing infrastructure"));
        assert!(record.evidence.contains("## Failure Description"));
        assert!(record.evidence.contains("created a duplicate"));
    }

    #[test]
    fn category_wire_names_are_snake_case() {
        let json = serde_json::to_string(&FailureCategory::PlanningError).expect("serialize");
        assert_eq!(json, "\"planning_error\"");
    }
}
