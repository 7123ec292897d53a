//! Learned rules and the fixed three-field rule block format.
//!
//! Teacher responses must produce a rule in this exact markdown shape:
//!
//! ```text
//! ### Array Safety
//! - **Rule**: Always check if array is empty before accessing index 0
//! - **When**: Working with arrays from API responses or user input
//! - **Why**: Prevents IndexError on empty results
//! ```
//!
//! Parsing is strict (a block missing any field is rejected so a malformed
//! rule never reaches the store), while store-side dedup matches on a
//! normalized fingerprint of the rule text so formatting-only edits do not
//! create duplicate entries.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Local};
use regex::Regex;

use crate::core::failure::{FailureCategory, FailureSource};

/// Stable content identifier for a rule, derived from normalized rule text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleFingerprint([u8; 32]);

impl fmt::Display for RuleFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The three-field rule block as parsed from teacher output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    pub title: String,
    pub rule_text: String,
    pub when_clause: String,
    pub why_clause: String,
}

/// A rule together with its provenance, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedRule {
    pub title: String,
    /// Imperative instruction. Non-empty by construction.
    pub rule_text: String,
    pub when_clause: String,
    pub why_clause: String,
    pub category: FailureCategory,
    pub source: FailureSource,
    pub source_timestamp: DateTime<Local>,
}

impl LearnedRule {
    /// Attach provenance from the triggering failure record.
    pub fn from_parsed(
        parsed: ParsedRule,
        category: FailureCategory,
        source: FailureSource,
        source_timestamp: DateTime<Local>,
    ) -> Self {
        Self {
            title: parsed.title,
            rule_text: parsed.rule_text,
            when_clause: parsed.when_clause,
            why_clause: parsed.why_clause,
            category,
            source,
            source_timestamp,
        }
    }

    pub fn fingerprint(&self) -> RuleFingerprint {
        fingerprint_of(&self.rule_text)
    }

    /// Render the store entry: rule block plus one provenance line.
    pub fn render_entry(&self) -> String {
        format!(
            "\n### {}\n- **Rule**: {}\n- **When**: {}\n- **Why**: {}\n- **Source**: Learned on {} from {} ({})\n",
            self.title,
            self.rule_text,
            self.when_clause,
            self.why_clause,
            self.source_timestamp.format("%Y-%m-%d %H:%M"),
            self.category.as_str(),
            self.source.as_str(),
        )
    }
}

/// Fingerprint arbitrary rule text.
pub fn fingerprint_of(rule_text: &str) -> RuleFingerprint {
    let normalized = normalize_rule_text(rule_text);
    RuleFingerprint(*blake3::hash(normalized.as_bytes()).as_bytes())
}

/// Lowercase, strip punctuation, collapse whitespace. Shared by fingerprinting
/// and the store's duplicate scan so both agree on what "the same rule" means.
pub fn normalize_rule_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^###\s+(.+?)\s*$").expect("title regex"));
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^-\s*\*\*(Rule|When|Why)\*\*:\s*(.+?)\s*$").expect("field regex")
});

/// Parse a rule block from free-form teacher output.
///
/// Tolerates surrounding prose (the first `###` heading and the first
/// occurrence of each field win) but rejects output that omits any of the
/// three fields or has an empty rule text.
pub fn parse_rule_block(text: &str) -> Result<ParsedRule> {
    let title = TITLE_RE
        .captures(text)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| anyhow!("rule block missing '### <title>' heading"))?;

    let mut rule_text = None;
    let mut when_clause = None;
    let mut why_clause = None;
    for caps in FIELD_RE.captures_iter(text) {
        let value = caps[2].to_string();
        match &caps[1] {
            "Rule" => rule_text.get_or_insert(value),
            "When" => when_clause.get_or_insert(value),
            "Why" => why_clause.get_or_insert(value),
            _ => unreachable!("regex alternation is exhaustive"),
        };
    }

    let rule_text = rule_text.ok_or_else(|| anyhow!("rule block missing '- **Rule**:' field"))?;
    let when_clause = when_clause.ok_or_else(|| anyhow!("rule block missing '- **When**:' field"))?;
    let why_clause = why_clause.ok_or_else(|| anyhow!("rule block missing '- **Why**:' field"))?;
    if rule_text.trim().is_empty() {
        return Err(anyhow!("rule text must be non-empty"));
    }

    Ok(ParsedRule {
        title,
        rule_text,
        when_clause,
        why_clause,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "### Array Safety\n\
        - **Rule**: Always check if array is empty before accessing index 0\n\
        - **When**: Working with arrays from API responses or user input\n\
        - **Why**: Prevents IndexError on empty results\n";

    #[test]
    fn parses_well_formed_block() {
        let parsed = parse_rule_block(SAMPLE).expect("parse");
        assert_eq!(parsed.title, "Array Safety");
        assert!(parsed.rule_text.starts_with("Always check"));
        assert!(parsed.when_clause.starts_with("Working with"));
        assert!(parsed.why_clause.starts_with("Prevents"));
    }

    #[test]
    fn parses_block_with_surrounding_prose() {
        let text = format!("Here is the rule you asked for:\n\n{SAMPLE}\nHope that helps.");
        let parsed = parse_rule_block(&text).expect("parse");
        assert_eq!(parsed.title, "Array Safety");
    }

    #[test]
    fn rejects_block_missing_why() {
        let text = "### Title\n- **Rule**: do the thing\n- **When**: always\n";
        let err = parse_rule_block(text).unwrap_err();
        assert!(err.to_string().contains("**Why**"));
    }

    #[test]
    fn rejects_missing_heading() {
        let text = "- **Rule**: x\n- **When**: y\n- **Why**: z\n";
        assert!(parse_rule_block(text).is_err());
    }

    #[test]
    fn fingerprint_ignores_case_punctuation_and_spacing() {
        let a = fingerprint_of("Always check if array is empty, before accessing index 0!");
        let b = fingerprint_of("always   check if array is empty before accessing index 0");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_different_rules() {
        let a = fingerprint_of("check return values");
        let b = fingerprint_of("check input arguments");
        assert_ne!(a, b);
    }

    #[test]
    fn render_entry_contains_provenance_line() {
        let parsed = parse_rule_block(SAMPLE).expect("parse");
        let rule = LearnedRule::from_parsed(
            parsed,
            FailureCategory::TestFailure,
            FailureSource::Automated,
            Local::now(),
        );
        let entry = rule.render_entry();
        assert!(entry.contains("### Array Safety"));
        assert!(entry.contains("- **Source**: Learned on"));
        assert!(entry.contains("from test_failure (automated)"));
    }
}
