//! Test-only fakes and fixtures for exercising the loop without spawning the
//! real agent, test suite, or teacher backend.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::Local;
use tempfile::TempDir;

use crate::core::failure::{FailureCategory, FailureRecord, FailureSource};
use crate::core::prompts::PromptTemplate;
use crate::core::rule::{LearnedRule, ParsedRule};
use crate::io::agent::{AgentInfraError, AgentInvocation, AgentRequest, CodingAgent};
use crate::io::teacher::{MalformedVerdict, TeacherClient, TeacherUnavailable, TeacherVerdict};
use crate::io::verifier::{Verifier, VerifierInfraError, VerifyOutcome, VerifyRequest};

/// Build a rule with deterministic clauses from a title and rule text.
pub fn rule(title: &str, rule_text: &str) -> LearnedRule {
    LearnedRule::from_parsed(
        ParsedRule {
            title: title.to_string(),
            rule_text: rule_text.to_string(),
            when_clause: format!("when working on {title}"),
            why_clause: format!("because {title} failed before"),
        },
        FailureCategory::TestFailure,
        FailureSource::Automated,
        Local::now(),
    )
}

/// One scripted behavior of the fake agent, consumed per invocation.
pub enum AgentStep {
    /// Write `contents` to `file` inside the workspace.
    Edit { file: String, contents: String },
    /// Touch nothing.
    NoChanges,
    /// Fail with an infrastructure error.
    Infra(String),
    /// Write `contents` to `file`, then fail with an infrastructure error,
    /// like an agent crashing mid-edit.
    EditThenInfra {
        file: String,
        contents: String,
        detail: String,
    },
}

/// Agent that replays a script and records the instructions it was given.
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<AgentStep>>,
    pub instructions_seen: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<AgentStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            instructions_seen: Mutex::new(Vec::new()),
        }
    }
}

impl CodingAgent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentInvocation> {
        self.instructions_seen
            .lock()
            .unwrap()
            .push(request.instructions.clone());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent exhausted"))?;
        match step {
            AgentStep::Edit { file, contents } => {
                fs::write(request.workdir.join(&file), contents)?;
                Ok(AgentInvocation {
                    result_text: format!("edited {file}"),
                })
            }
            AgentStep::NoChanges => Ok(AgentInvocation {
                result_text: "no changes needed".to_string(),
            }),
            AgentStep::Infra(detail) => Err(anyhow::Error::new(AgentInfraError { detail })),
            AgentStep::EditThenInfra {
                file,
                contents,
                detail,
            } => {
                fs::write(request.workdir.join(&file), contents)?;
                Err(anyhow::Error::new(AgentInfraError { detail }))
            }
        }
    }
}

/// One scripted verification result, consumed per call.
pub enum VerifierStep {
    Pass,
    Fail(String),
    Infra(String),
}

pub struct ScriptedVerifier {
    steps: Mutex<VecDeque<VerifierStep>>,
}

impl ScriptedVerifier {
    pub fn new(steps: Vec<VerifierStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
        }
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, _request: &VerifyRequest) -> Result<VerifyOutcome> {
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted verifier exhausted"))?;
        match step {
            VerifierStep::Pass => Ok(VerifyOutcome {
                passed: true,
                output: "all tests passed".to_string(),
            }),
            VerifierStep::Fail(output) => Ok(VerifyOutcome {
                passed: false,
                output,
            }),
            VerifierStep::Infra(detail) => Err(anyhow::Error::new(VerifierInfraError { detail })),
        }
    }
}

/// One scripted teacher response, consumed per analyze call.
pub enum TeacherStep {
    Verdict { analysis: String, rule: LearnedRule },
    Unavailable(String),
    Malformed(String),
}

/// Teacher that replays a script and records what it was asked to analyze.
pub struct ScriptedTeacher {
    steps: Mutex<VecDeque<TeacherStep>>,
    pub templates_seen: Mutex<Vec<PromptTemplate>>,
}

impl ScriptedTeacher {
    pub fn new(steps: Vec<TeacherStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            templates_seen: Mutex::new(Vec::new()),
        }
    }
}

impl TeacherClient for ScriptedTeacher {
    fn analyze(&self, _record: &FailureRecord, template: PromptTemplate) -> Result<TeacherVerdict> {
        self.templates_seen.lock().unwrap().push(template);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted teacher exhausted"))?;
        match step {
            TeacherStep::Verdict { analysis, rule } => Ok(TeacherVerdict { analysis, rule }),
            TeacherStep::Unavailable(detail) => {
                Err(anyhow::Error::new(TeacherUnavailable { detail }))
            }
            TeacherStep::Malformed(detail) => Err(anyhow::Error::new(MalformedVerdict { detail })),
        }
    }
}

/// A temporary git repository with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        git(root, &["init"]);
        git(root, &["config", "user.email", "test@example.com"]);
        git(root, &["config", "user.name", "test"]);
        fs::write(root.join("README.md"), "hi\n").expect("write");
        git(root, &["add", "README.md"]);
        git(root, &["commit", "-m", "init"]);
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(root: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .unwrap_or_else(|err| panic!("git {args:?}: {err}"));
    assert!(status.success(), "git {args:?} failed");
}
