//! Prompt selection and rendering for teacher analysis.
//!
//! The category-to-template mapping is a data table with an explicit default
//! arm: an unmapped (or future) category selects the root-cause template, so
//! adding a category means extending [`TEMPLATE_TABLE`], not touching control
//! flow. Selection is a total function and never fails.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::failure::{FailureCategory, FailureRecord, FailureSource};

const ROOT_CAUSE_SYSTEM: &str = include_str!("../prompts/root_cause.md");
const PLANNING_SYSTEM: &str = include_str!("../prompts/planning.md");
const INTEGRATION_SYSTEM: &str = include_str!("../prompts/integration.md");
const WORKFLOW_SYSTEM: &str = include_str!("../prompts/workflow.md");
const ARCHITECTURE_SYSTEM: &str = include_str!("../prompts/architecture.md");
const RULE_GENERATOR_SYSTEM: &str = include_str!("../prompts/rule_generator.md");

const FAILURE_AUTOMATED_TEMPLATE: &str = include_str!("../prompts/failure_automated.md");
const FAILURE_REPORTED_TEMPLATE: &str = include_str!("../prompts/failure_reported.md");
const RULE_REQUEST_TEMPLATE: &str = include_str!("../prompts/rule_request.md");

/// Input truncation limits, matching the payload limits of the webhook path
/// closely enough that both teacher backends see comparable context.
const DIFF_LIMIT_CHARS: usize = 8_000;
const EVIDENCE_LIMIT_CHARS: usize = 4_000;

/// Analysis template identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    /// Default: test failures and anything unmapped.
    RootCause,
    Planning,
    Integration,
    Workflow,
    Architecture,
}

impl PromptTemplate {
    pub fn id(&self) -> &'static str {
        match self {
            Self::RootCause => "root_cause",
            Self::Planning => "planning",
            Self::Integration => "integration",
            Self::Workflow => "workflow",
            Self::Architecture => "architecture",
        }
    }
}

/// Category-to-template mapping. Categories absent from this table fall back
/// to [`PromptTemplate::RootCause`].
const TEMPLATE_TABLE: &[(FailureCategory, PromptTemplate)] = &[
    (FailureCategory::TestFailure, PromptTemplate::RootCause),
    (FailureCategory::PlanningError, PromptTemplate::Planning),
    (FailureCategory::IntegrationError, PromptTemplate::Integration),
    (FailureCategory::WorkflowError, PromptTemplate::Workflow),
    (FailureCategory::ArchitectureError, PromptTemplate::Architecture),
    (FailureCategory::ScopeError, PromptTemplate::Planning),
    (FailureCategory::ConfigError, PromptTemplate::Integration),
];

/// Map a failure category to its analysis template. Total; never fails.
pub fn select_template(category: FailureCategory) -> PromptTemplate {
    TEMPLATE_TABLE
        .iter()
        .find(|(cat, _)| *cat == category)
        .map(|(_, template)| *template)
        .unwrap_or(PromptTemplate::RootCause)
}

/// System prompt text for an analysis template.
pub fn system_prompt(template: PromptTemplate) -> &'static str {
    match template {
        PromptTemplate::RootCause => ROOT_CAUSE_SYSTEM,
        PromptTemplate::Planning => PLANNING_SYSTEM,
        PromptTemplate::Integration => INTEGRATION_SYSTEM,
        PromptTemplate::Workflow => WORKFLOW_SYSTEM,
        PromptTemplate::Architecture => ARCHITECTURE_SYSTEM,
    }
}

/// System prompt for the rule-generation call.
pub fn rule_generator_prompt() -> &'static str {
    RULE_GENERATOR_SYSTEM
}

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("failure_automated", FAILURE_AUTOMATED_TEMPLATE)
        .expect("failure_automated template should be valid");
    env.add_template("failure_reported", FAILURE_REPORTED_TEMPLATE)
        .expect("failure_reported template should be valid");
    env.add_template("rule_request", RULE_REQUEST_TEMPLATE)
        .expect("rule_request template should be valid");
    env
});

/// Render the user message for the analysis call.
///
/// Automated failures use the diff/error-log layout; reported failures use
/// the context/description layout.
pub fn render_failure_message(record: &FailureRecord) -> Result<String> {
    let evidence = truncate_chars(&record.evidence, EVIDENCE_LIMIT_CHARS);
    let name = match record.source {
        FailureSource::Automated => "failure_automated",
        FailureSource::UserReported | FailureSource::LlmAnalysis => "failure_reported",
    };
    let diff = record
        .diff
        .as_deref()
        .map(|d| truncate_chars(d, DIFF_LIMIT_CHARS))
        .filter(|d| !d.trim().is_empty());
    let template = ENGINE.get_template(name).context("get failure template")?;
    let rendered = template
        .render(context! {
            task => record.task.trim(),
            diff => diff,
            evidence => (!evidence.trim().is_empty()).then(|| evidence.trim().to_string()),
        })
        .context("render failure message")?;
    Ok(rendered)
}

/// Render the user message for the rule-generation call.
pub fn render_rule_request(analysis: &str) -> Result<String> {
    let template = ENGINE.get_template("rule_request").context("get rule template")?;
    let rendered = template
        .render(context! { analysis => analysis.trim() })
        .context("render rule request")?;
    Ok(rendered)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_category_without_failing() {
        let all = [
            FailureCategory::TestFailure,
            FailureCategory::PlanningError,
            FailureCategory::IntegrationError,
            FailureCategory::WorkflowError,
            FailureCategory::ArchitectureError,
            FailureCategory::ScopeError,
            FailureCategory::ConfigError,
            FailureCategory::Other,
        ];
        for category in all {
            let template = select_template(category);
            assert!(!system_prompt(template).is_empty());
        }
    }

    #[test]
    fn unmapped_category_falls_back_to_root_cause() {
        assert_eq!(select_template(FailureCategory::Other), PromptTemplate::RootCause);
    }

    #[test]
    fn scope_and_config_reuse_existing_templates() {
        assert_eq!(select_template(FailureCategory::ScopeError), PromptTemplate::Planning);
        assert_eq!(
            select_template(FailureCategory::ConfigError),
            PromptTemplate::Integration
        );
    }

    #[test]
    fn automated_message_includes_diff_and_logs() {
        let record = FailureRecord::automated(
            "fix divide",
            "-return 0\n+return None".to_string(),
            "AssertionError: assert 0 is None".to_string(),
        );
        let message = render_failure_message(&record).expect("render");
        assert!(message.contains("## Code Diff"));
        assert!(message.contains("+return None"));
        assert!(message.contains("## Error Logs"));
        assert!(message.contains("test failure"));
    }

    #[test]
    fn automated_message_notes_missing_diff() {
        let record = FailureRecord::automated("task", String::new(), "boom".to_string());
        let message = render_failure_message(&record).expect("render");
        assert!(message.contains("No diff available"));
    }

    #[test]
    fn reported_message_uses_context_layout() {
        let record = FailureRecord::reported(
            FailureCategory::IntegrationError,
            "deploy",
            "made a duplicate",
            "check inventory first",
        );
        let message = render_failure_message(&record).expect("render");
        assert!(message.contains("## Context"));
        assert!(!message.contains("## Code Diff"));
    }

    #[test]
    fn evidence_is_truncated_to_limit() {
        let record = FailureRecord::automated("t", String::new(), "x".repeat(10_000));
        let message = render_failure_message(&record).expect("render");
        assert!(message.len() < 6_000);
    }

    #[test]
    fn rule_request_embeds_analysis() {
        let message = render_rule_request("the analysis body").expect("render");
        assert!(message.contains("the analysis body"));
        assert!(message.contains("preventive rule"));
    }
}
