//! Feedback-driven retry loop for AI coding agents.
//!
//! Dispatches a task to a coding agent, verifies the result with the
//! project's test suite, and routes failures to a teacher reasoning service
//! that distills corrective rules into `~/.claude/CLAUDE.md`. Rules feed into
//! every later attempt so the agent stops repeating the same mistake.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use learnloop::core::attempt::{AttemptOutcome, RunOutcome, RunReport};
use learnloop::core::failure::{FailureCategory, FailureRecord};
use learnloop::core::prompts::PromptTemplate;
use learnloop::io::agent::ClaudeCodeAgent;
use learnloop::io::config::{LoopConfig, TeacherMode, load_config};
use learnloop::io::knowledge::KnowledgeStore;
use learnloop::io::teacher::{DirectTeacher, TeacherClient, TeacherVerdict, WebhookTeacher};
use learnloop::io::verifier::CommandVerifier;
use learnloop::run::{LoopDeps, run_learning_loop};
use learnloop::{exit_codes, logging, report};

/// HTTP timeout for the direct Anthropic backend (two short completions).
const DIRECT_TEACHER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(
    name = "learnloop",
    version,
    about = "Feedback-driven retry loop for AI coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the loop on a task until tests pass or retries run out.
    Run {
        /// Task description handed to the coding agent.
        task: String,
        /// Project to operate on (must be a clean git repository).
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
        /// Override `learning.max_retries` from the config.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Stop for manual review after the first failed attempt.
        #[arg(long)]
        no_auto_retry: bool,
        /// Override `teacher.mode` from the config.
        #[arg(long, value_enum)]
        teacher: Option<TeacherMode>,
        /// Config file (defaults to `learnloop.toml` in the project dir).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Report a failure you observed yourself and persist the resulting rule.
    ReportFailure {
        /// Category of the failure, used to pick the analysis template.
        #[arg(long = "failure-type", value_enum)]
        failure_type: FailureCategory,
        /// What went wrong, in your own words.
        #[arg(long)]
        description: String,
        /// Surrounding context (what was being attempted, environment, etc.).
        #[arg(long, default_value = "")]
        context: String,
        /// The task that was being worked on when the failure occurred.
        #[arg(long)]
        task: String,
        /// Override `teacher.mode` from the config.
        #[arg(long, value_enum)]
        teacher: Option<TeacherMode>,
        /// Config file (defaults to `learnloop.toml` in the current dir).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Teacher backend chosen at startup from config and CLI flags.
enum TeacherBackend {
    Local(DirectTeacher),
    Webhook(WebhookTeacher),
}

impl TeacherClient for TeacherBackend {
    fn analyze(&self, record: &FailureRecord, template: PromptTemplate) -> Result<TeacherVerdict> {
        match self {
            Self::Local(teacher) => teacher.analyze(record, template),
            Self::Webhook(teacher) => teacher.analyze(record, template),
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task,
            project_dir,
            max_retries,
            no_auto_retry,
            teacher,
            config,
        } => cmd_run(
            &task,
            &project_dir,
            max_retries,
            no_auto_retry,
            teacher,
            config,
        ),
        Command::ReportFailure {
            failure_type,
            description,
            context,
            task,
            teacher,
            config,
        } => cmd_report_failure(failure_type, &task, &description, &context, teacher, config),
    }
}

fn cmd_run(
    task: &str,
    project_dir: &PathBuf,
    max_retries: Option<u32>,
    no_auto_retry: bool,
    teacher: Option<TeacherMode>,
    config: Option<PathBuf>,
) -> Result<i32> {
    let config_path = config.unwrap_or_else(|| project_dir.join("learnloop.toml"));
    let mut cfg = load_config(&config_path)?;
    if let Some(max_retries) = max_retries {
        cfg.learning.max_retries = max_retries;
    }
    if no_auto_retry {
        cfg.learning.auto_retry = false;
    }
    if let Some(mode) = teacher {
        cfg.teacher.mode = mode;
    }

    let store = KnowledgeStore::new(cfg.store_path()?);
    let teacher = build_teacher(&cfg)?;
    let agent = ClaudeCodeAgent;
    let verifier = CommandVerifier;
    let deps = LoopDeps {
        agent: &agent,
        verifier: &verifier,
        teacher: &teacher,
        store: &store,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("install ctrl-c handler")?;

    let report = run_learning_loop(project_dir, &deps, &cfg, task, &cancel)?;
    print_report(&report);
    Ok(outcome_exit_code(&report.outcome))
}

fn cmd_report_failure(
    failure_type: FailureCategory,
    task: &str,
    description: &str,
    context: &str,
    teacher: Option<TeacherMode>,
    config: Option<PathBuf>,
) -> Result<i32> {
    let config_path = config.unwrap_or_else(|| PathBuf::from("learnloop.toml"));
    let mut cfg = load_config(&config_path)?;
    if let Some(mode) = teacher {
        cfg.teacher.mode = mode;
    }
    cfg.validate()?;

    let store = KnowledgeStore::new(cfg.store_path()?);
    let teacher = build_teacher(&cfg)?;
    let result = report::report_failure(&teacher, &store, failure_type, task, description, context)?;

    println!("Analysis:\n{}\n", result.analysis);
    if result.appended {
        println!("Rule persisted to knowledge store.");
    } else {
        println!("Rule already known; knowledge store unchanged.");
    }
    Ok(exit_codes::OK)
}

fn build_teacher(cfg: &LoopConfig) -> Result<TeacherBackend> {
    match cfg.teacher.mode {
        TeacherMode::Local => Ok(TeacherBackend::Local(DirectTeacher::new(
            &cfg.teacher,
            DIRECT_TEACHER_TIMEOUT,
        )?)),
        TeacherMode::Webhook => Ok(TeacherBackend::Webhook(WebhookTeacher::new(&cfg.n8n)?)),
    }
}

fn print_report(report: &RunReport) {
    for attempt in &report.attempts {
        let status = match attempt.outcome {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Passed => "passed",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Error => "error",
        };
        let learned = if attempt.rule_learned {
            " (rule learned)"
        } else {
            ""
        };
        println!("attempt {}: {}{}", attempt.number, status, learned);
        if let Some(text) = &attempt.agent_summary {
            if !text.trim().is_empty() {
                println!("  agent: {}", summary_line(text));
            }
        }
    }
    match &report.outcome {
        RunOutcome::Success => println!(
            "success after {} attempt(s), {} rule(s) learned",
            report.attempt_count(),
            report.rules_learned()
        ),
        RunOutcome::Exhausted => println!(
            "exhausted {} attempt(s) without passing; {} rule(s) learned",
            report.attempt_count(),
            report.rules_learned()
        ),
        RunOutcome::AwaitingManualReview => {
            println!("stopped after a failed attempt; auto-retry is disabled")
        }
        RunOutcome::Aborted {
            stage,
            attempt,
            reason,
        } => println!("aborted during {stage} (attempt {attempt}): {reason}"),
    }
}

/// First line of the agent's final message, bounded for one-line display.
fn summary_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    line.chars().take(120).collect()
}

fn outcome_exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Success => exit_codes::OK,
        RunOutcome::Exhausted => exit_codes::EXHAUSTED,
        RunOutcome::AwaitingManualReview => exit_codes::AWAITING_REVIEW,
        RunOutcome::Aborted { .. } => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["learnloop", "run", "fix the tests"]);
        match cli.command {
            Command::Run {
                task,
                max_retries,
                no_auto_retry,
                teacher,
                ..
            } => {
                assert_eq!(task, "fix the tests");
                assert_eq!(max_retries, None);
                assert!(!no_auto_retry);
                assert_eq!(teacher, None);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_run_overrides() {
        let cli = Cli::parse_from([
            "learnloop",
            "run",
            "fix the tests",
            "--max-retries",
            "5",
            "--no-auto-retry",
            "--teacher",
            "webhook",
        ]);
        match cli.command {
            Command::Run {
                max_retries,
                no_auto_retry,
                teacher,
                ..
            } => {
                assert_eq!(max_retries, Some(5));
                assert!(no_auto_retry);
                assert_eq!(teacher, Some(TeacherMode::Webhook));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_report_failure() {
        let cli = Cli::parse_from([
            "learnloop",
            "report-failure",
            "--failure-type",
            "planning_error",
            "--description",
            "agent rewrote the wrong module",
            "--task",
            "add pagination",
        ]);
        match cli.command {
            Command::ReportFailure {
                failure_type,
                context,
                ..
            } => {
                assert_eq!(failure_type, FailureCategory::PlanningError);
                assert_eq!(context, "");
            }
            _ => panic!("expected report-failure command"),
        }
    }

    #[test]
    fn summary_line_is_first_line_only() {
        assert_eq!(summary_line("fixed the bug\ndetails follow"), "fixed the bug");
        assert_eq!(summary_line("  \n"), "");
    }

    #[test]
    fn aborted_runs_exit_invalid() {
        let outcome = RunOutcome::Aborted {
            stage: "start".to_string(),
            attempt: 0,
            reason: "dirty worktree".to_string(),
        };
        assert_eq!(outcome_exit_code(&outcome), exit_codes::INVALID);
        assert_eq!(outcome_exit_code(&RunOutcome::Success), exit_codes::OK);
        assert_eq!(
            outcome_exit_code(&RunOutcome::Exhausted),
            exit_codes::EXHAUSTED
        );
    }
}
