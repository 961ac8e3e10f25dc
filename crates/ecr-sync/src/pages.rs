//! Report pages for the static site, regenerated only when their inputs change.
//!
//! A page embeds the fingerprint of the report JSON, the renderer's dependency
//! files and the diff percentages it shows. Pages whose embedded fingerprint
//! matches are left alone.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ecr_artifacts::diff::{diff_pairs, parse_percent, percent_filename};
use ecr_artifacts::thumbnail::thumbnail_filename;
use ecr_core::{FormatKind, Report, VersionRecord};
use ecr_redact::markup::escape_text;
use ecr_storage::cache::{fingerprint_meta_tag, output_exists, page_is_current, Fingerprint};
use ecr_storage::{link_or_copy, remove_orphans, write_atomic};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::publish::{html_text, report_json_path};

pub const SITE_REPORTS_DIR: &str = "reports";

#[derive(Debug, Clone)]
pub struct PageVersion<'a> {
    pub version: &'a VersionRecord,
    /// Same HTML as the version before it; nothing new to show.
    pub hide: bool,
    /// Whole percent of text changed since the previous HTML version.
    pub percent_change: Option<i64>,
}

/// Everything a renderer gets for one report.
#[derive(Debug, Clone)]
pub struct ReportPage<'a> {
    pub report: &'a Report,
    /// Newest first.
    pub versions: Vec<PageVersion<'a>>,
    pub body_html: Option<String>,
    pub show_summary: bool,
    /// Site-relative thumbnail, when the newest PDF has one.
    pub thumbnail: Option<String>,
    /// Must be placed in the page head for the cache to recognize the page.
    pub fingerprint_meta: String,
}

/// Seam for the site templating engine.
pub trait ReportPageRenderer: Send + Sync {
    /// Files whose contents change the rendered output (templates, stylesheets).
    fn dependencies(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn render(&self, page: &ReportPage<'_>) -> Result<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BasicPageRenderer;

fn escaped(text: &str) -> String {
    let mut out = String::new();
    escape_text(text, &mut out);
    out.replace('"', "&quot;")
}

impl ReportPageRenderer for BasicPageRenderer {
    fn render(&self, page: &ReportPage<'_>) -> Result<String> {
        let report = page.report;
        let newest = report.newest().context("report without versions")?;
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str(&page.fingerprint_meta);
        html.push_str(&format!(
            "\n<title>{} ({})</title>\n</head>\n<body>\n<article class=\"report\">\n",
            escaped(&newest.title),
            report.number
        ));
        html.push_str(&format!("<h1>{}</h1>\n", escaped(&newest.title)));
        html.push_str(&format!(
            "<p class=\"report-meta\">{} &middot; {} &middot; {}</p>\n",
            report.number,
            escaped(&report.type_name),
            newest.date.format("%B %-d, %Y")
        ));
        if !report.topics.is_empty() {
            let topics: Vec<String> = report.topics.iter().map(|t| escaped(t)).collect();
            html.push_str(&format!("<p class=\"topics\">{}</p>\n", topics.join(", ")));
        }
        if let Some(thumbnail) = &page.thumbnail {
            html.push_str(&format!("<img class=\"thumbnail\" src=\"{}\" alt=\"\">\n", escaped(thumbnail)));
        }
        if let (true, Some(summary)) = (page.show_summary, newest.summary.as_deref()) {
            html.push_str(&format!("<div class=\"summary\"><p>{}</p></div>\n", escaped(summary)));
        }
        html.push_str("<ol class=\"versions\">\n");
        for entry in page.versions.iter().filter(|v| !v.hide) {
            let version = entry.version;
            html.push_str(&format!("<li>{} {}", version.date, escaped(&version.title)));
            if let Some(percent) = entry.percent_change {
                html.push_str(&format!(" <span class=\"pct-change\">{percent}% changed</span>"));
            }
            for format in &version.formats {
                let label = match (format.format, &format.derived_from) {
                    (FormatKind::Html, Some(_)) => "Text",
                    (FormatKind::Html, None) => "HTML",
                    (FormatKind::Pdf, _) => "PDF",
                };
                html.push_str(&format!(" <a href=\"/{}\">{label}</a>", escaped(&format.filename)));
            }
            html.push_str("</li>\n");
        }
        html.push_str("</ol>\n");
        if let Some(body) = &page.body_html {
            html.push_str("<div class=\"report-body\">\n");
            html.push_str(body);
            html.push_str("\n</div>\n");
        }
        html.push_str(&format!(
            "<p><a href=\"{}.json\">Report metadata (JSON)</a></p>\n</article>\n</body>\n</html>\n",
            report.number
        ));
        Ok(html)
    }
}

/// Short summaries duplicate the text and long ones are the text; only show the
/// summary when it is a meaningful abstract, or when there is no text at all.
pub fn show_summary(summary: Option<&str>, text: Option<&str>) -> bool {
    let Some(text) = text else {
        return true;
    };
    let summary_len = summary.map_or(0, |s| s.chars().count());
    let text_len = text.chars().count();
    summary_len > 10 && (summary_len as f64) < 0.25 * text_len as f64
}

/// Percent files keyed by the newer version's HTML filename.
async fn read_percentages(report: &Report, reports_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in diff_pairs(report) {
        let path = reports_dir.join(percent_filename(&pair.output_filename()?)?);
        match fs::read_to_string(&path).await {
            Ok(text) => {
                out.insert(pair.current, text);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
    Ok(out)
}

/// Walk oldest to newest; a version repeating the previous HTML is hidden.
fn page_versions<'a>(report: &'a Report, percentages: &BTreeMap<String, String>) -> Vec<PageVersion<'a>> {
    let mut previous: Option<&str> = None;
    let mut out: Vec<PageVersion<'a>> = report
        .versions
        .iter()
        .rev()
        .map(|version| {
            let html = version.format(FormatKind::Html).map(|f| f.filename.as_str());
            let hide = html.is_some() && html == previous;
            let percent_change = match html {
                Some(html) if !hide => percentages
                    .get(html)
                    .and_then(|text| parse_percent(text))
                    .map(|pct| (pct * 100.0).round() as i64),
                _ => None,
            };
            if html.is_some() {
                previous = html;
            }
            PageVersion {
                version,
                hide,
                percent_change,
            }
        })
        .collect();
    out.reverse();
    out
}

/// Thumbnail of the most recent version that has a PDF.
fn newest_thumbnail(report: &Report) -> Option<String> {
    report
        .versions
        .iter()
        .find_map(|v| v.format(FormatKind::Pdf))
        .and_then(|pdf| thumbnail_filename(&pdf.filename).ok())
}

#[derive(Debug, Default)]
pub struct PagesSummary {
    pub rendered: usize,
    pub current: usize,
    pub failed: usize,
    pub removed: Vec<PathBuf>,
}

struct PageOutputs {
    page: PathBuf,
    json: PathBuf,
    thumbnail: PathBuf,
}

fn page_outputs(site_reports: &Path, report: &Report) -> PageOutputs {
    let number = report.number.as_str();
    PageOutputs {
        page: site_reports.join(format!("{number}.html")),
        json: site_reports.join(format!("{number}.json")),
        thumbnail: site_reports.join(format!("{number}.png")),
    }
}

async fn generate_page(
    report: &Report,
    renderer: &dyn ReportPageRenderer,
    config: &PipelineConfig,
    outputs: &PageOutputs,
    keep: &mut HashSet<PathBuf>,
) -> Result<bool> {
    let reports_dir = &config.reports_dir;
    let json_path = report_json_path(reports_dir, &report.number);
    let json = fs::read(&json_path)
        .await
        .with_context(|| format!("reading {}", json_path.display()))?;
    link_or_copy(&json_path, &outputs.json).await?;
    keep.insert(outputs.json.clone());

    let mut thumbnail = None;
    if let Some(png) = newest_thumbnail(report) {
        let png = reports_dir.join(png);
        if output_exists(&png).await {
            link_or_copy(&png, &outputs.thumbnail).await?;
            keep.insert(outputs.thumbnail.clone());
            thumbnail = Some(format!("{}.png", report.number));
        }
    }

    let percentages = read_percentages(report, reports_dir).await?;
    let mut fingerprint = Fingerprint::new().bytes(&json);
    for dependency in renderer.dependencies() {
        fingerprint = fingerprint.file(&dependency).await?;
    }
    for (html, percent) in &percentages {
        fingerprint = fingerprint.bytes(html.as_bytes()).bytes(percent.as_bytes());
    }
    let fingerprint = fingerprint.finish();
    keep.insert(outputs.page.clone());
    if page_is_current(&outputs.page, &fingerprint).await? {
        return Ok(false);
    }

    let newest_html = report
        .newest()
        .and_then(|v| v.format(FormatKind::Html))
        .map(|f| reports_dir.join(&f.filename));
    let (body_html, text) = match &newest_html {
        Some(path) if output_exists(path).await => {
            let body = fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            (Some(String::from_utf8_lossy(&body).into_owned()), html_text(path).await?)
        }
        _ => (None, None),
    };
    let summary = report.newest().and_then(|v| v.summary.as_deref());
    let page = ReportPage {
        report,
        versions: page_versions(report, &percentages),
        show_summary: show_summary(summary, text.as_deref()),
        body_html,
        thumbnail,
        fingerprint_meta: fingerprint_meta_tag(&fingerprint),
    };
    let html = renderer
        .render(&page)
        .with_context(|| format!("rendering page for {}", report.number))?;
    write_atomic(&outputs.page, html.as_bytes()).await?;
    Ok(true)
}

pub async fn generate_pages(
    reports: &[Report],
    renderer: &dyn ReportPageRenderer,
    config: &PipelineConfig,
) -> Result<PagesSummary> {
    let site_reports = config.site_dir.join(SITE_REPORTS_DIR);
    let mut summary = PagesSummary::default();
    let mut keep = HashSet::new();
    for report in reports.iter().filter(|r| config.only_matches_report(r)) {
        let outputs = page_outputs(&site_reports, report);
        match generate_page(report, renderer, config, &outputs, &mut keep).await {
            Ok(true) => {
                debug!(report = %report.number, "page rendered");
                summary.rendered += 1;
            }
            Ok(false) => summary.current += 1,
            Err(err) => {
                summary.failed += 1;
                // Keep whatever page is already there.
                keep.insert(outputs.page);
                warn!(report = %report.number, error = %format!("{err:#}"), "page generation failed");
            }
        }
    }
    if config.only.is_none() {
        summary.removed = remove_orphans(&site_reports, &keep).await?;
    }
    info!(
        rendered = summary.rendered,
        current = summary.current,
        failed = summary.failed,
        removed = summary.removed.len(),
        "pages complete"
    );
    Ok(summary)
}
