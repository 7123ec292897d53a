//! Append-only knowledge store for learned rules.
//!
//! The store is a human-editable markdown file (by default the shared
//! `~/.claude/CLAUDE.md`). Appends locate the rules section by heading text
//! search, never re-parse or reformat existing content, and dedup on a
//! normalized fingerprint of the rule text. Concurrent appends from
//! independent runs are serialized with an advisory file lock.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tracing::{debug, info, instrument};

use crate::core::rule::{LearnedRule, fingerprint_of};

pub const DEFAULT_SECTION_HEADING: &str = "## Learned Rules & Patterns";
const SECTION_INTRO: &str = "Rules automatically generated from the learning loop.";

/// The store path cannot be created or written.
#[derive(Debug)]
pub struct StoreUnwritable {
    pub path: PathBuf,
    pub detail: String,
}

impl fmt::Display for StoreUnwritable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "knowledge store unwritable at {}: {}", self.path.display(), self.detail)
    }
}

impl std::error::Error for StoreUnwritable {}

/// Result of an append call. `Duplicate` is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Duplicate,
}

/// Handle on the shared rules file.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    path: PathBuf,
    section_heading: String,
}

impl KnowledgeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            section_heading: DEFAULT_SECTION_HEADING.to_string(),
        }
    }

    pub fn with_section(path: impl Into<PathBuf>, section_heading: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            section_heading: section_heading.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full store contents; empty string when the file does not exist yet.
    pub fn read(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.path).with_context(|| format!("read {}", self.path.display()))
    }

    /// Append a rule under the configured section, deduplicating by
    /// fingerprint. All pre-existing content is preserved byte for byte.
    #[instrument(skip_all, fields(store = %self.path.display()))]
    pub fn append(&self, rule: &LearnedRule) -> Result<AppendOutcome> {
        let _lock = self.acquire_lock()?;

        let content = self.read()?;
        let section = locate_section(&content, &self.section_heading);

        if let Some(extent) = &section {
            let fingerprint = rule.fingerprint();
            if section_rule_texts(&content[extent.body_start..extent.body_end])
                .any(|text| fingerprint_of(text) == fingerprint)
            {
                info!(fingerprint = %fingerprint, "duplicate rule, skipping append");
                return Ok(AppendOutcome::Duplicate);
            }
        }

        let entry = rule.render_entry();
        let updated = match section {
            Some(extent) => {
                let mut buf = String::with_capacity(content.len() + entry.len());
                buf.push_str(&content[..extent.body_end]);
                if !buf.ends_with('\n') {
                    buf.push('\n');
                }
                buf.push_str(&entry);
                buf.push_str(&content[extent.body_end..]);
                buf
            }
            None => {
                let mut buf = content.clone();
                if !buf.is_empty() && !buf.ends_with('\n') {
                    buf.push('\n');
                }
                buf.push_str(&format!(
                    "\n{}\n\n{}\n{}",
                    self.section_heading, SECTION_INTRO, entry
                ));
                buf
            }
        };

        self.write(&updated)?;
        info!(title = %rule.title, "rule appended");
        Ok(AppendOutcome::Appended)
    }

    fn write(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                anyhow!(StoreUnwritable {
                    path: self.path.clone(),
                    detail: format!("create parent directory: {err}"),
                })
            })?;
        }
        fs::write(&self.path, contents).map_err(|err| {
            anyhow!(StoreUnwritable {
                path: self.path.clone(),
                detail: err.to_string(),
            })
        })
    }

    /// Exclusive advisory lock on a sibling lockfile. Both the automated loop
    /// and the manual report path go through this, so independent processes
    /// cannot interleave writes.
    fn acquire_lock(&self) -> Result<fs::File> {
        let lock_path = self.path.with_extension("md.lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                anyhow!(StoreUnwritable {
                    path: self.path.clone(),
                    detail: format!("create lock directory: {err}"),
                })
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| {
                anyhow!(StoreUnwritable {
                    path: self.path.clone(),
                    detail: format!("open lockfile: {err}"),
                })
            })?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", lock_path.display()))?;
        debug!(lock = %lock_path.display(), "store lock acquired");
        Ok(file)
    }
}

/// Byte extent of a section's body (after the heading line, up to the next
/// same-level heading or EOF).
#[derive(Debug, Clone, PartialEq, Eq)]
struct SectionExtent {
    body_start: usize,
    body_end: usize,
}

fn locate_section(content: &str, heading: &str) -> Option<SectionExtent> {
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if line.trim_end() == heading {
            let body_start = offset + line.len();
            let body_end = find_section_end(content, body_start);
            return Some(SectionExtent {
                body_start,
                body_end,
            });
        }
        offset += line.len();
    }
    // Heading may be the last line without a trailing newline.
    None
}

fn find_section_end(content: &str, body_start: usize) -> usize {
    let mut offset = body_start;
    for line in content[body_start..].split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed.starts_with("## ") && !trimmed.starts_with("###") {
            return offset;
        }
        offset += line.len();
    }
    content.len()
}

/// Rule texts of existing entries within a section body.
fn section_rule_texts(section_body: &str) -> impl Iterator<Item = &str> {
    section_body.lines().filter_map(|line| {
        line.trim_start()
            .strip_prefix("- **Rule**:")
            .map(str::trim)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::failure::{FailureCategory, FailureSource};
    use crate::core::rule::{LearnedRule, parse_rule_block};
    use chrono::Local;

    fn rule(title: &str, text: &str) -> LearnedRule {
        let block = format!("### {title}\n- **Rule**: {text}\n- **When**: always\n- **Why**: testing\n");
        LearnedRule::from_parsed(
            parse_rule_block(&block).expect("parse"),
            FailureCategory::TestFailure,
            FailureSource::Automated,
            Local::now(),
        )
    }

    #[test]
    fn append_creates_section_in_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = KnowledgeStore::new(temp.path().join("CLAUDE.md"));

        let outcome = store.append(&rule("First", "check nulls")).expect("append");
        assert_eq!(outcome, AppendOutcome::Appended);

        let content = store.read().expect("read");
        assert!(content.contains(DEFAULT_SECTION_HEADING));
        assert!(content.contains("- **Rule**: check nulls"));
    }

    #[test]
    fn append_is_idempotent_on_same_fingerprint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = KnowledgeStore::new(temp.path().join("CLAUDE.md"));

        store.append(&rule("First", "check nulls")).expect("append");
        // Formatting-only differences must still collide.
        let outcome = store.append(&rule("Other Title", "Check Nulls!")).expect("append");
        assert_eq!(outcome, AppendOutcome::Duplicate);

        let content = store.read().expect("read");
        assert_eq!(content.matches("- **Rule**:").count(), 1);
    }

    #[test]
    fn append_preserves_pre_existing_content_verbatim() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("CLAUDE.md");
        let existing = "# My instructions\n\nHand-written notes.\n\n## Another Section\n\n- manually curated entry\n";
        fs::write(&path, existing).expect("seed");

        let store = KnowledgeStore::new(&path);
        store.append(&rule("First", "check nulls")).expect("append");

        let content = store.read().expect("read");
        assert!(content.starts_with(existing));
        assert!(content.contains("## Learned Rules & Patterns"));
    }

    #[test]
    fn append_inserts_at_end_of_existing_section() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("CLAUDE.md");
        let existing = "## Learned Rules & Patterns\n\nIntro line kept as-is.\n\n### Old\n- **Rule**: old rule\n- **When**: w\n- **Why**: y\n\n## Trailing Section\n\ntrailing text\n";
        fs::write(&path, existing).expect("seed");

        let store = KnowledgeStore::new(&path);
        store.append(&rule("New", "new rule")).expect("append");

        let content = store.read().expect("read");
        let new_pos = content.find("- **Rule**: new rule").expect("new rule present");
        let old_pos = content.find("- **Rule**: old rule").expect("old rule kept");
        let trailing_pos = content.find("## Trailing Section").expect("trailing kept");
        assert!(old_pos < new_pos);
        assert!(new_pos < trailing_pos);
        assert!(content.ends_with("trailing text\n"));
    }

    #[test]
    fn dedup_scan_is_scoped_to_the_section() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("CLAUDE.md");
        // Same rule text exists outside the managed section; must not block append.
        let existing = "## Other Rules\n\n- **Rule**: check nulls\n";
        fs::write(&path, existing).expect("seed");

        let store = KnowledgeStore::new(&path);
        let outcome = store.append(&rule("First", "check nulls")).expect("append");
        assert_eq!(outcome, AppendOutcome::Appended);
    }

    #[test]
    fn distinct_rules_both_append() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = KnowledgeStore::new(temp.path().join("CLAUDE.md"));

        store.append(&rule("A", "check nulls")).expect("append");
        let outcome = store.append(&rule("B", "validate inputs")).expect("append");
        assert_eq!(outcome, AppendOutcome::Appended);

        let content = store.read().expect("read");
        assert_eq!(content.matches("- **Rule**:").count(), 2);
    }

    #[test]
    fn read_missing_store_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = KnowledgeStore::new(temp.path().join("missing.md"));
        assert_eq!(store.read().expect("read"), "");
    }

    #[test]
    fn section_locator_ignores_subheadings() {
        let content = "## Learned Rules & Patterns\nbody\n### sub\nmore\n## Next\n";
        let extent = locate_section(content, "## Learned Rules & Patterns").expect("found");
        assert_eq!(&content[extent.body_start..extent.body_end], "body\n### sub\nmore\n");
    }
}
