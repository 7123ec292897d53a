//! End-to-end tests for the manual failure reporting path: no agent, no
//! verifier, no git. The reported failure goes straight to the teacher and
//! the rule lands in the knowledge store.

use std::fs;

use learnloop::core::failure::FailureCategory;
use learnloop::core::prompts::PromptTemplate;
use learnloop::io::knowledge::KnowledgeStore;
use learnloop::report::report_failure;
use learnloop::test_support::{ScriptedTeacher, TeacherStep, rule};

#[test]
fn reported_planning_error_routes_to_the_planning_template() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let store = KnowledgeStore::new(dir.path().join("CLAUDE.md"));
    let teacher = ScriptedTeacher::new(vec![TeacherStep::Verdict {
        analysis: "the plan skipped the migration step".to_string(),
        rule: rule("Plan migrations", "List schema migrations before coding"),
    }]);

    let result = report_failure(
        &teacher,
        &store,
        FailureCategory::PlanningError,
        "add pagination to the articles endpoint",
        "agent rewrote the wrong module",
        "working in the api crate",
    )
    .expect("report");

    assert!(result.appended);
    assert_eq!(result.analysis, "the plan skipped the migration step");
    assert_eq!(
        teacher.templates_seen.lock().unwrap().as_slice(),
        &[PromptTemplate::Planning]
    );
    let store_contents = fs::read_to_string(dir.path().join("CLAUDE.md")).expect("read store");
    assert!(store_contents.contains("List schema migrations before coding"));
    assert!(store_contents.contains("- **Source**: Learned on"));
}

#[test]
fn reporting_a_known_rule_is_a_no_op() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let store = KnowledgeStore::new(dir.path().join("CLAUDE.md"));
    let known = rule("Pin versions", "Pin dependency versions in CI");
    store.append(&known).expect("seed store");
    let before = fs::read_to_string(dir.path().join("CLAUDE.md")).expect("read store");

    let teacher = ScriptedTeacher::new(vec![TeacherStep::Verdict {
        analysis: "same mistake again".to_string(),
        rule: rule("Pin versions", "Pin dependency versions in CI"),
    }]);
    let result = report_failure(
        &teacher,
        &store,
        FailureCategory::ConfigError,
        "stabilize the CI pipeline",
        "builds drift between runs",
        "",
    )
    .expect("report");

    assert!(!result.appended);
    let after = fs::read_to_string(dir.path().join("CLAUDE.md")).expect("read store");
    assert_eq!(before, after);
}

#[test]
fn scope_and_config_errors_use_fallback_templates() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let store = KnowledgeStore::new(dir.path().join("CLAUDE.md"));
    let teacher = ScriptedTeacher::new(vec![
        TeacherStep::Verdict {
            analysis: "a".to_string(),
            rule: rule("Scope rule", "Confirm scope before starting"),
        },
        TeacherStep::Verdict {
            analysis: "b".to_string(),
            rule: rule("Config rule", "Check env files into the template repo"),
        },
    ]);

    report_failure(
        &teacher,
        &store,
        FailureCategory::ScopeError,
        "task",
        "scope creep",
        "",
    )
    .expect("scope report");
    report_failure(
        &teacher,
        &store,
        FailureCategory::ConfigError,
        "task",
        "missing env var",
        "",
    )
    .expect("config report");

    assert_eq!(
        teacher.templates_seen.lock().unwrap().as_slice(),
        &[PromptTemplate::Planning, PromptTemplate::Integration]
    );
}
