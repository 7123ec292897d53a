//! Loop configuration (TOML).
//!
//! This file is intended to be edited by humans and must remain stable and
//! automatable. Missing fields default to sensible values matching the
//! headless-agent defaults; CLI flags override loaded values. The resolved
//! config is read-only for the duration of a run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WEBHOOK_URL: &str =
    "https://im4tlai.app.n8n.cloud/webhook/prompt-learning-teacher";

/// Which teacher backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum TeacherMode {
    /// Direct reasoning-service calls via the Anthropic API.
    Local,
    /// Remote workflow call via the n8n webhook.
    Webhook,
}

/// What to do when an attempt hits an infrastructure error (agent or verifier
/// crash/timeout). Explicit so neither behavior happens silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraErrorPolicy {
    /// Surface the error immediately and abort the run.
    Abort,
    /// Consume a retry and continue with the next attempt.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TeacherConfig {
    pub mode: TeacherMode,
    pub model: String,
    pub max_tokens: u32,
    pub anthropic_base_url: String,
}

impl Default for TeacherConfig {
    fn default() -> Self {
        Self {
            mode: TeacherMode::Local,
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 1024,
            anthropic_base_url: "https://api.anthropic.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct N8nConfig {
    pub webhook_url: String,
    pub timeout_secs: u64,
    /// Bearer credential for the webhook channel, if it requires one.
    pub bearer_token: Option<String>,
}

impl Default for N8nConfig {
    fn default() -> Self {
        Self {
            webhook_url: DEFAULT_WEBHOOK_URL.to_string(),
            timeout_secs: 60,
            bearer_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    /// Command to execute for verification (e.g. `["pytest","tests/","-v"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "pytest".to_string(),
                "tests/".to_string(),
                "-v".to_string(),
                "--tb=short".to_string(),
            ],
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClaudeConfig {
    pub max_turns: u32,
    pub timeout_secs: u64,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            max_turns: 15,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LearningConfig {
    pub max_retries: u32,
    pub auto_retry: bool,
    pub on_infra_error: InfraErrorPolicy,
    /// Knowledge store path. Defaults to `~/.claude/CLAUDE.md` when unset.
    pub store_path: Option<PathBuf>,
    /// Truncate captured agent/verifier logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            auto_retry: true,
            on_infra_error: InfraErrorPolicy::Abort,
            store_path: None,
            output_limit_bytes: 100_000,
        }
    }
}

/// Resolved operating parameters for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LoopConfig {
    pub teacher: TeacherConfig,
    pub n8n: N8nConfig,
    pub tests: TestsConfig,
    pub claude: ClaudeConfig,
    pub learning: LearningConfig,
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.learning.max_retries == 0 {
            return Err(anyhow!("learning.max_retries must be > 0"));
        }
        if self.learning.output_limit_bytes == 0 {
            return Err(anyhow!("learning.output_limit_bytes must be > 0"));
        }
        if self.tests.timeout_secs == 0 {
            return Err(anyhow!("tests.timeout_secs must be > 0"));
        }
        if self.claude.timeout_secs == 0 {
            return Err(anyhow!("claude.timeout_secs must be > 0"));
        }
        if self.n8n.timeout_secs == 0 {
            return Err(anyhow!("n8n.timeout_secs must be > 0"));
        }
        if self.tests.command.is_empty() || self.tests.command[0].trim().is_empty() {
            return Err(anyhow!("tests.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Resolve the knowledge store path, defaulting to `~/.claude/CLAUDE.md`.
    pub fn store_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.learning.store_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot resolve home directory"))?;
        Ok(home.join(".claude").join("CLAUDE.md"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = LoopConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[teacher]\nmode = \"webhook\"\n\n[learning]\nmax_retries = 5\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.teacher.mode, TeacherMode::Webhook);
        assert_eq!(cfg.learning.max_retries, 5);
        assert_eq!(cfg.tests.command[0], "pytest");
        assert!(cfg.learning.auto_retry);
    }

    #[test]
    fn zero_retries_is_rejected() {
        let cfg = LoopConfig {
            learning: LearningConfig {
                max_retries: 0,
                ..LearningConfig::default()
            },
            ..LoopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_test_command_is_rejected() {
        let cfg = LoopConfig {
            tests: TestsConfig {
                command: Vec::new(),
                ..TestsConfig::default()
            },
            ..LoopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
