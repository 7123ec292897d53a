//! Manual failure reporting: a human-observed failure goes straight through
//! analyze and persist, with no agent dispatch and no verification.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::failure::{FailureCategory, FailureRecord};
use crate::core::prompts::select_template;
use crate::io::knowledge::{AppendOutcome, KnowledgeStore};
use crate::io::teacher::TeacherClient;

/// What came out of a manually reported failure.
#[derive(Debug)]
pub struct ReportResult {
    pub analysis: String,
    pub appended: bool,
}

/// Analyze a user-reported failure and persist the resulting rule.
///
/// The category is taken as given; routing uses the same template table as
/// the automated path.
pub fn report_failure<T: TeacherClient>(
    teacher: &T,
    store: &KnowledgeStore,
    category: FailureCategory,
    task: &str,
    description: &str,
    context: &str,
) -> Result<ReportResult> {
    let record = FailureRecord::reported(category, task, description, context);
    let template = select_template(record.category);
    info!(category = record.category.as_str(), template = template.id(), "analyzing reported failure");

    let verdict = teacher
        .analyze(&record, template)
        .context("analyze reported failure")?;

    let appended = match store.append(&verdict.rule).context("persist learned rule")? {
        AppendOutcome::Appended => true,
        AppendOutcome::Duplicate => {
            debug!("rule already known, not re-appended");
            false
        }
    };

    Ok(ReportResult {
        analysis: verdict.analysis,
        appended,
    })
}
