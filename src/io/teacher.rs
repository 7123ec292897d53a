//! Teacher clients: failure analysis and rule generation.
//!
//! Two interchangeable backends satisfy [`TeacherClient`]:
//!
//! - [`WebhookTeacher`] posts the failure payload to a remote workflow
//!   endpoint that performs analysis and rule generation on its side.
//! - [`DirectTeacher`] talks to the reasoning service itself, as two
//!   sequential calls: root-cause analysis, then rule generation fed by the
//!   analysis text.
//!
//! Both must yield a rule in the fixed three-field shape; a malformed rule is
//! re-requested once and then fails fatally, since it must never reach the
//! knowledge store.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::failure::FailureRecord;
use crate::core::prompts::{
    PromptTemplate, render_failure_message, render_rule_request, rule_generator_prompt,
    system_prompt,
};
use crate::core::rule::{LearnedRule, parse_rule_block};
use crate::io::config::{N8nConfig, TeacherConfig};

const RESPONSE_SCHEMA: &str = include_str!("../../schemas/teacher_response.schema.json");

/// Webhook payload truncation limits, to avoid oversized request bodies.
const WEBHOOK_DIFF_LIMIT: usize = 10_000;
const WEBHOOK_LOGS_LIMIT: usize = 5_000;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const RULE_CALL_MAX_TOKENS: u32 = 512;

/// Successful teacher analysis: free-text root cause plus the learned rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeacherVerdict {
    pub analysis: String,
    pub rule: LearnedRule,
}

/// The teacher endpoint could not be reached (network failure or timeout).
/// Recoverable: the loop may retry the attempt without a new rule.
#[derive(Debug)]
pub struct TeacherUnavailable {
    pub detail: String,
}

impl fmt::Display for TeacherUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "teacher unavailable: {}", self.detail)
    }
}

impl std::error::Error for TeacherUnavailable {}

/// The teacher responded but the rule is missing required fields. Fatal for
/// the run after the client's internal re-request.
#[derive(Debug)]
pub struct MalformedVerdict {
    pub detail: String,
}

impl fmt::Display for MalformedVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed teacher response: {}", self.detail)
    }
}

impl std::error::Error for MalformedVerdict {}

/// Abstraction over teacher backends.
pub trait TeacherClient {
    /// Analyze a failure and produce a learned rule using the selected
    /// analysis template.
    fn analyze(&self, record: &FailureRecord, template: PromptTemplate) -> Result<TeacherVerdict>;
}

/// Remote-workflow backend posting to an n8n-style webhook.
pub struct WebhookTeacher {
    client: Client,
    webhook_url: String,
    bearer_token: Option<String>,
}

impl WebhookTeacher {
    pub fn new(cfg: &N8nConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("build webhook http client")?;
        Ok(Self {
            client,
            webhook_url: cfg.webhook_url.clone(),
            bearer_token: cfg.bearer_token.clone(),
        })
    }

    fn post_payload(&self, record: &FailureRecord) -> Result<Value> {
        let payload = json!({
            "diff": truncate(record.diff.as_deref().unwrap_or(""), WEBHOOK_DIFF_LIMIT),
            "error_logs": truncate(&record.evidence, WEBHOOK_LOGS_LIMIT),
            "task_description": record.task,
        });

        let mut request = self.client.post(&self.webhook_url).json(&payload);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|err| {
            anyhow!(TeacherUnavailable {
                detail: format!("webhook request failed: {err}"),
            })
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(TeacherUnavailable {
                detail: format!("webhook returned {status}"),
            }));
        }

        let body: Value = response.json().map_err(|err| {
            anyhow!(MalformedVerdict {
                detail: format!("webhook response is not JSON: {err}"),
            })
        })?;
        validate_response_schema(&body)?;
        Ok(body)
    }
}

impl TeacherClient for WebhookTeacher {
    #[instrument(skip_all, fields(template = template.id()))]
    fn analyze(&self, record: &FailureRecord, template: PromptTemplate) -> Result<TeacherVerdict> {
        info!(url = %self.webhook_url, "requesting webhook analysis");
        let body = self.post_payload(record)?;
        match verdict_from_webhook_body(&body, record) {
            Ok(verdict) => Ok(verdict),
            Err(first_err) => {
                // Re-request once; a transient upstream model wobble is common.
                warn!(err = %first_err, "webhook rule malformed, re-requesting once");
                let body = self.post_payload(record)?;
                verdict_from_webhook_body(&body, record).map_err(|err| {
                    anyhow!(MalformedVerdict {
                        detail: format!("{err:#}"),
                    })
                })
            }
        }
    }
}

fn verdict_from_webhook_body(body: &Value, record: &FailureRecord) -> Result<TeacherVerdict> {
    let analysis = body
        .get("analysis")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let rule_text = body
        .get("rule")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let parsed = parse_rule_block(rule_text)?;
    let rule = LearnedRule::from_parsed(parsed, record.category, record.source, record.occurred_at);
    Ok(TeacherVerdict { analysis, rule })
}

fn validate_response_schema(body: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(RESPONSE_SCHEMA).context("parse teacher response schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile teacher response schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(body)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(MalformedVerdict {
            detail: format!("schema validation failed:\n- {}", messages.join("\n- ")),
        }));
    }
    Ok(())
}

/// Direct-reasoning backend calling the Anthropic messages API.
pub struct DirectTeacher {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl DirectTeacher {
    /// Reads the API key from `ANTHROPIC_API_KEY`; a missing key is a
    /// construction-time error so a run fails before the first attempt
    /// rather than at the first failure.
    pub fn new(cfg: &TeacherConfig, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("ANTHROPIC_API_KEY is required for teacher.mode = \"local\""))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build teacher http client")?;
        Ok(Self {
            client,
            base_url: cfg.anthropic_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
        })
    }

    fn complete(&self, system: &str, user: &str, max_tokens: u32) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .map_err(|err| {
                anyhow!(TeacherUnavailable {
                    detail: format!("messages request failed: {err}"),
                })
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(TeacherUnavailable {
                detail: format!("messages endpoint returned {status}"),
            }));
        }

        let value: Value = response.json().map_err(|err| {
            anyhow!(MalformedVerdict {
                detail: format!("messages response is not JSON: {err}"),
            })
        })?;
        extract_message_text(&value).ok_or_else(|| {
            anyhow!(MalformedVerdict {
                detail: "messages response missing content text".to_string(),
            })
        })
    }

    fn request_rule(&self, analysis: &str) -> Result<String> {
        let rule_message = render_rule_request(analysis)?;
        self.complete(rule_generator_prompt(), &rule_message, RULE_CALL_MAX_TOKENS)
    }
}

impl TeacherClient for DirectTeacher {
    #[instrument(skip_all, fields(template = template.id(), model = %self.model))]
    fn analyze(&self, record: &FailureRecord, template: PromptTemplate) -> Result<TeacherVerdict> {
        let failure_message = render_failure_message(record)?;

        debug!("requesting root-cause analysis");
        let analysis = self.complete(system_prompt(template), &failure_message, self.max_tokens)?;

        debug!("requesting rule generation");
        let rule_text = self.request_rule(&analysis)?;
        let parsed = match parse_rule_block(&rule_text) {
            Ok(parsed) => parsed,
            Err(first_err) => {
                warn!(err = %first_err, "rule malformed, re-requesting once");
                let retry_text = self.request_rule(&analysis)?;
                parse_rule_block(&retry_text).map_err(|err| {
                    anyhow!(MalformedVerdict {
                        detail: format!("{err:#}"),
                    })
                })?
            }
        };

        let rule =
            LearnedRule::from_parsed(parsed, record.category, record.source, record.occurred_at);
        Ok(TeacherVerdict { analysis, rule })
    }
}

/// Pull the first text block out of a messages-API response.
fn extract_message_text(value: &Value) -> Option<String> {
    value
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| blocks.first())
        .and_then(|block| block.get("text"))
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
