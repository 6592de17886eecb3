//! Batch report assembly and on-disk report files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bpre_core::{BatchFailure, BatchReport, CustomerRecord};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::gateway::MutationError;
use crate::session::BatchJob;

/// SHA-256 of the uploaded bytes, hex encoded. Lets two runs of the same
/// file be recognised without keeping the file.
pub fn upload_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn build_report(
    job: &BatchJob,
    results: Vec<Result<CustomerRecord, MutationError>>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> BatchReport {
    let total = results.len();
    let failures: Vec<BatchFailure> = results
        .into_iter()
        .filter_map(|r| r.err())
        .map(BatchFailure::from)
        .collect();
    let failed = failures.len();

    BatchReport {
        session_id: job.session_id,
        store_id: job.store_id.clone(),
        intent: job.intent,
        upload_sha256: job.upload_sha256.clone(),
        summary: job.summary,
        total,
        succeeded: total - failed,
        failed,
        failures,
        started_at,
        finished_at,
    }
}

pub fn render_summary_markdown(report: &BatchReport) -> String {
    let mut lines = vec![
        "# BPRE Batch Report".to_string(),
        String::new(),
        format!("- Session: `{}`", report.session_id),
        format!("- Store: `{}`", report.store_id),
        format!("- Intent: {}", report.intent.as_str()),
        format!("- Upload SHA-256: `{}`", report.upload_sha256),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        String::new(),
        "## Reconciliation".to_string(),
        format!("- Phone numbers in upload: {}", report.summary.total_csv),
        format!("- Found: {}", report.summary.found),
        format!("- Not found: {}", report.summary.not_found),
        format!("- Unique customers targeted: {}", report.summary.to_deactivate_unique_count),
        String::new(),
        "## Outcome".to_string(),
        format!("- {}", report.summary_line()),
    ];

    if !report.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for failure in &report.failures {
            let detail = failure.detail.as_deref().unwrap_or("-");
            lines.push(format!(
                "- `{}` ({}): {} [{}]",
                failure.customer_id, failure.phone_number, failure.message, detail
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Write `batch_report.json` and `summary.md` under `<root>/<session_id>/`.
pub async fn write_reports(reports_root: &Path, report: &BatchReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.session_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing batch report")?;
    fs::write(dir.join("batch_report.json"), json)
        .await
        .context("writing batch_report.json")?;
    fs::write(dir.join("summary.md"), render_summary_markdown(report))
        .await
        .context("writing summary.md")?;

    Ok(dir)
}
