//! Canonical report JSON: write-out, reload and garbage collection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ecr_core::{FormatKind, Report, ReportNumber};
use ecr_redact::markup::{parse_fragment, Element};
use ecr_storage::{remove_orphans, write_if_changed, FILES_DIR};
use tokio::fs;
use tracing::{debug, info};

pub const REPORTS_JSON_DIR: &str = "reports";

pub fn report_json_path(reports_dir: &Path, number: &ReportNumber) -> PathBuf {
    reports_dir.join(REPORTS_JSON_DIR).join(format!("{number}.json"))
}

pub fn serialize_report(report: &Report) -> Result<Vec<u8>> {
    let mut json = serde_json::to_string_pretty(report)
        .with_context(|| format!("serializing report {}", report.number))?;
    json.push('\n');
    Ok(json.into_bytes())
}

#[derive(Debug, Default)]
pub struct PublishSummary {
    pub written: usize,
    pub unchanged: usize,
    pub removed_reports: Vec<PathBuf>,
    pub removed_files: Vec<PathBuf>,
}

/// Rewrite each report wholesale (only when its bytes change) and delete report
/// files no current report maps to.
pub async fn write_reports(reports: &[Report], reports_dir: &Path) -> Result<PublishSummary> {
    let mut summary = PublishSummary::default();
    let mut keep = HashSet::new();
    for report in reports {
        let path = report_json_path(reports_dir, &report.number);
        if write_if_changed(&path, &serialize_report(report)?).await? {
            debug!(report = %report.number, "report JSON updated");
            summary.written += 1;
        } else {
            summary.unchanged += 1;
        }
        keep.insert(path);
    }
    summary.removed_reports = remove_orphans(&reports_dir.join(REPORTS_JSON_DIR), &keep).await?;
    info!(
        written = summary.written,
        unchanged = summary.unchanged,
        removed = summary.removed_reports.len(),
        "report JSON written"
    );
    Ok(summary)
}

/// Delete stored files no report refers to any more.
pub async fn collect_garbage_files(reports_dir: &Path, expected: &HashSet<String>) -> Result<Vec<PathBuf>> {
    let keep: HashSet<PathBuf> = expected.iter().map(|name| reports_dir.join(name)).collect();
    let removed = remove_orphans(&reports_dir.join(FILES_DIR), &keep).await?;
    if !removed.is_empty() {
        info!(removed = removed.len(), "deleted unreferenced files");
    }
    Ok(removed)
}

/// Load every persisted report, newest first. A file whose report number is unsafe
/// aborts the load.
pub async fn load_reports(reports_dir: &Path) -> Result<Vec<Report>> {
    let dir = reports_dir.join(REPORTS_JSON_DIR);
    let mut paths = Vec::new();
    let mut entries = fs::read_dir(&dir)
        .await
        .with_context(|| format!("listing {}", dir.display()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let report: Report =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        reports.push(report);
    }
    reports.sort_by(Report::newest_first);
    Ok(reports)
}

/// Visible text of a stored HTML rendition, if it exists.
pub async fn html_text(path: &Path) -> Result<Option<String>> {
    match fs::read(path).await {
        Ok(bytes) => {
            let mut root = Element::new("div");
            root.children = parse_fragment(&String::from_utf8_lossy(&bytes));
            Ok(Some(root.text()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Text of the newest version's HTML rendition, derived renditions included.
pub async fn newest_html_text(report: &Report, reports_dir: &Path) -> Result<Option<String>> {
    let Some(html) = report.newest().and_then(|v| v.format(FormatKind::Html)) else {
        return Ok(None);
    };
    html_text(&reports_dir.join(&html.filename)).await
}
