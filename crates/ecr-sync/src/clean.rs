//! Redaction phase: sanitize HTML, redact PDFs, render thumbnails, link images and
//! synthesize text renditions for PDF-only versions.
//!
//! Every output lives at the same storage-relative name as its input, and those
//! names embed the input's content hash, so an existing output is never redone.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use ecr_artifacts::text::{text_fallback_filename, text_fallback_html};
use ecr_artifacts::thumbnail::{thumbnail_filename, Rasterizer};
use ecr_core::{FormatKind, FormatRecord, Report};
use ecr_redact::{clean_html, redact_pdf_or_pass_through, PdfMetadata, PdfOutcome, ScrubRules};
use ecr_storage::cache::output_exists;
use ecr_storage::{link_or_copy, write_atomic};
use tokio::fs;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::ingest::Ingested;
use crate::pool::{blocking, WorkerPool};

/// Read-only state shared by every clean job.
pub struct CleanContext {
    pub reports_dir: PathBuf,
    pub rules: ScrubRules,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub pdf_fallback_cutoff: NaiveDate,
}

#[derive(Debug)]
enum CleanJob {
    Html {
        input: PathBuf,
        output: PathBuf,
        images: Option<BTreeMap<String, String>>,
    },
    Pdf {
        input: PathBuf,
        output: PathBuf,
        thumbnail: PathBuf,
        title: String,
        date: NaiveDate,
        modified: NaiveDateTime,
    },
    Thumbnail {
        pdf: PathBuf,
        png: PathBuf,
    },
    TextFallback {
        pdf: PathBuf,
        output: PathBuf,
    },
}

impl fmt::Display for CleanJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = match self {
            CleanJob::Html { output, .. } | CleanJob::Pdf { output, .. } | CleanJob::TextFallback { output, .. } => output,
            CleanJob::Thumbnail { png, .. } => png,
        };
        write!(f, "{}", path.display())
    }
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

async fn render_thumbnail(ctx: &CleanContext, pdf: PathBuf, png: PathBuf) -> Result<()> {
    let rasterizer = Arc::clone(&ctx.rasterizer);
    blocking(move || {
        rasterizer
            .render_first_page(&pdf, &png)
            .with_context(|| format!("rendering thumbnail for {}", pdf.display()))
    })
    .await
}

impl CleanJob {
    async fn run(self, ctx: Arc<CleanContext>) -> Result<JobKind> {
        match self {
            CleanJob::Html { input, output, images } => {
                let page = String::from_utf8_lossy(&read(&input).await?).into_owned();
                let job_ctx = Arc::clone(&ctx);
                let cleaned = blocking(move || {
                    clean_html(&page, images.as_ref(), &job_ctx.rules)
                        .with_context(|| format!("sanitizing {}", input.display()))
                })
                .await?;
                write_atomic(&output, cleaned.as_bytes()).await?;
                Ok(JobKind::Html)
            }
            CleanJob::Pdf {
                input,
                output,
                thumbnail,
                title,
                date,
                modified,
            } => {
                let bytes = read(&input).await?;
                let job_ctx = Arc::clone(&ctx);
                let outcome = blocking(move || {
                    let meta = PdfMetadata {
                        title: &title,
                        date,
                        modified,
                    };
                    redact_pdf_or_pass_through(&bytes, &meta, &job_ctx.rules, job_ctx.pdf_fallback_cutoff)
                        .with_context(|| format!("redacting {}", input.display()))
                })
                .await?;
                if matches!(outcome, PdfOutcome::PassedThrough(_)) {
                    warn!(path = %output.display(), "published without redaction");
                }
                write_atomic(&output, outcome.bytes()).await?;
                render_thumbnail(&ctx, output, thumbnail).await?;
                Ok(JobKind::Pdf)
            }
            CleanJob::Thumbnail { pdf, png } => {
                render_thumbnail(&ctx, pdf, png).await?;
                Ok(JobKind::Thumbnail)
            }
            CleanJob::TextFallback { pdf, output } => {
                let bytes = read(&pdf).await?;
                let html = blocking(move || {
                    text_fallback_html(&bytes).with_context(|| format!("extracting text from {}", pdf.display()))
                })
                .await?;
                write_atomic(&output, html.as_bytes()).await?;
                Ok(JobKind::TextFallback)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Html,
    Pdf,
    Thumbnail,
    TextFallback,
}

#[derive(Debug, Default)]
pub struct CleanSummary {
    /// Storage-relative names every report refers to, derived files included.
    pub expected_files: HashSet<String>,
    pub html: usize,
    pub pdf: usize,
    pub thumbnails: usize,
    pub text_fallbacks: usize,
    pub images_linked: usize,
    pub missing_inputs: usize,
    /// Formats left unprocessed this run because their images could not be linked.
    pub image_failures: usize,
}

impl CleanSummary {
    fn count(&mut self, results: Vec<Option<JobKind>>) {
        for kind in results.into_iter().flatten() {
            match kind {
                JobKind::Html => self.html += 1,
                JobKind::Pdf => {
                    self.pdf += 1;
                    self.thumbnails += 1;
                }
                JobKind::Thumbnail => self.thumbnails += 1,
                JobKind::TextFallback => self.text_fallbacks += 1,
            }
        }
    }
}

async fn link_images(
    images: &BTreeMap<String, String>,
    ingested: &Ingested,
    reports_dir: &Path,
    summary: &mut CleanSummary,
) -> Result<()> {
    for stored in images.values() {
        let output = reports_dir.join(stored);
        match ingested.input_path(stored) {
            Some(input) if output_exists(&input).await => {
                if link_or_copy(&input, &output).await? {
                    summary.images_linked += 1;
                }
            }
            _ => {
                summary.missing_inputs += 1;
                warn!(image = %stored, "referenced image not found in incoming");
            }
        }
    }
    Ok(())
}

/// Queue work for every referenced file whose output is missing. Oldest versions
/// are visited first so their files are counted before newer duplicates.
async fn plan_jobs(
    reports: &[Report],
    ingested: &Ingested,
    config: &PipelineConfig,
    summary: &mut CleanSummary,
) -> Result<Vec<CleanJob>> {
    let reports_dir = &config.reports_dir;
    let mut jobs = Vec::new();
    let mut queued = HashSet::new();
    for report in reports {
        for version in report.versions.iter().rev() {
            for format in version.formats.iter().filter(|f| f.derived_from.is_none()) {
                summary.expected_files.insert(format.filename.clone());
                if let Some(images) = &format.images {
                    summary.expected_files.extend(images.values().cloned());
                }
                let thumbnail = match format.format {
                    FormatKind::Pdf => thumbnail_filename(&format.filename).ok(),
                    FormatKind::Html => None,
                };
                if let Some(thumbnail) = &thumbnail {
                    summary.expected_files.insert(thumbnail.clone());
                }
                if !config.only_matches(&format.filename) {
                    continue;
                }
                if let Some(images) = &format.images {
                    if let Err(err) = link_images(images, ingested, reports_dir, summary).await {
                        summary.image_failures += 1;
                        warn!(report = %report.number, file = %format.filename, error = %format!("{err:#}"), "linking images failed; skipping");
                        continue;
                    }
                }

                let output = reports_dir.join(&format.filename);
                if !queued.insert(output.clone()) {
                    continue;
                }
                let output_done = output_exists(&output).await;
                if let (true, Some(thumbnail)) = (output_done, &thumbnail) {
                    let png = reports_dir.join(thumbnail);
                    if !output_exists(&png).await {
                        jobs.push(CleanJob::Thumbnail { pdf: output, png });
                    }
                    continue;
                }
                if output_done {
                    continue;
                }
                let input = match ingested.input_path(&format.filename) {
                    Some(input) if output_exists(&input).await => input,
                    _ => {
                        summary.missing_inputs += 1;
                        warn!(report = %report.number, file = %format.filename, "referenced file not found in incoming");
                        continue;
                    }
                };
                jobs.push(match (format.format, thumbnail) {
                    (FormatKind::Pdf, Some(thumbnail)) => CleanJob::Pdf {
                        input,
                        output,
                        thumbnail: reports_dir.join(thumbnail),
                        title: version.title.clone(),
                        date: version.date,
                        modified: version.retrieved,
                    },
                    (FormatKind::Pdf, None) => {
                        warn!(file = %format.filename, "PDF name without .pdf extension; skipping");
                        continue;
                    }
                    (FormatKind::Html, _) => CleanJob::Html {
                        input,
                        output,
                        images: format.images.clone(),
                    },
                });
            }
        }
    }
    Ok(jobs)
}

/// The PDF a text rendition would be derived from, for versions without HTML.
fn text_fallback_source(formats: &[FormatRecord]) -> Option<(&FormatRecord, String)> {
    if formats.iter().any(|f| f.format == FormatKind::Html) {
        return None;
    }
    let pdf = formats.iter().find(|f| f.format == FormatKind::Pdf)?;
    let text = text_fallback_filename(&pdf.filename).ok()?;
    Some((pdf, text))
}

async fn plan_text_fallbacks(reports: &[Report], config: &PipelineConfig) -> Vec<CleanJob> {
    let mut jobs = Vec::new();
    let mut queued = HashSet::new();
    for version in reports.iter().flat_map(|r| r.versions.iter()) {
        let Some((pdf, text)) = text_fallback_source(&version.formats) else {
            continue;
        };
        if !config.only_matches(&pdf.filename) || !queued.insert(text.clone()) {
            continue;
        }
        let pdf = config.reports_dir.join(&pdf.filename);
        let output = config.reports_dir.join(&text);
        if output_exists(&pdf).await && !output_exists(&output).await {
            jobs.push(CleanJob::TextFallback { pdf, output });
        }
    }
    jobs
}

/// Record produced text renditions as HTML formats derived from their PDF.
async fn attach_text_fallbacks(reports: &mut [Report], reports_dir: &Path, summary: &mut CleanSummary) {
    for version in reports.iter_mut().flat_map(|r| r.versions.iter_mut()) {
        let Some((pdf, text)) =
            text_fallback_source(&version.formats).map(|(pdf, text)| (pdf.filename.clone(), text))
        else {
            continue;
        };
        if !output_exists(&reports_dir.join(&text)).await {
            continue;
        }
        let mut record = FormatRecord::new(FormatKind::Html, text.clone());
        record.derived_from = Some(pdf);
        version.formats.push(record);
        summary.expected_files.insert(text);
    }
}

pub async fn clean_files(
    reports: &mut [Report],
    ingested: &Ingested,
    config: &PipelineConfig,
    ctx: CleanContext,
    pool: &WorkerPool,
) -> Result<CleanSummary> {
    let ctx = Arc::new(ctx);
    let mut summary = CleanSummary::default();

    let jobs = plan_jobs(reports, ingested, config, &mut summary).await?;
    info!(jobs = jobs.len(), "cleaning files");
    let run = |job: CleanJob| job.run(Arc::clone(&ctx));
    let results = pool.run("cleaned", jobs, run).await;
    summary.count(results);

    let jobs = plan_text_fallbacks(reports, config).await;
    let results = pool.run("extracted", jobs, run).await;
    summary.count(results);
    attach_text_fallbacks(reports, &config.reports_dir, &mut summary).await;

    info!(
        html = summary.html,
        pdf = summary.pdf,
        thumbnails = summary.thumbnails,
        text = summary.text_fallbacks,
        images = summary.images_linked,
        missing = summary.missing_inputs,
        image_failures = summary.image_failures,
        "clean phase complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecr_core::{DocumentKind, ReportNumber, VersionRecord};

    fn version(day: u32, format: FormatRecord) -> VersionRecord {
        let date = NaiveDate::from_ymd_opt(2020, 1, day).unwrap();
        VersionRecord {
            source: "EveryCRSReport.com".into(),
            source_link: None,
            id: format!("R1-{day}"),
            date,
            retrieved: date.and_hms_opt(8, 0, 0).unwrap(),
            title: "Title".into(),
            summary: None,
            type_name: DocumentKind::Report.display_name().into(),
            type_id: DocumentKind::Report.type_id().into(),
            active: true,
            formats: vec![format],
            topics: vec![],
        }
    }

    #[tokio::test]
    async fn image_link_failures_skip_only_that_format() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("incoming");
        let reports_dir = dir.path().join("reports");
        for name in ["files/r1.html", "files/r1/fig.png", "files/r1-old.pdf"] {
            let path = raw.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"input").unwrap();
        }
        // A regular file where the image directory has to go.
        std::fs::create_dir_all(reports_dir.join("files")).unwrap();
        std::fs::write(reports_dir.join("files/r1"), b"in the way").unwrap();

        let mut html = FormatRecord::new(FormatKind::Html, "files/r1.html");
        html.images = Some(BTreeMap::from([("fig.png".to_string(), "files/r1/fig.png".to_string())]));
        let versions = vec![
            version(2, html),
            version(1, FormatRecord::new(FormatKind::Pdf, "files/r1-old.pdf")),
        ];
        let report = Report::from_sorted_versions(ReportNumber::parse("R1").unwrap(), versions).unwrap();

        let mut ingested = Ingested::default();
        for name in ["files/r1.html", "files/r1/fig.png", "files/r1-old.pdf"] {
            ingested.file_roots.insert(name.to_string(), raw.clone());
        }
        let config = PipelineConfig::from_lookup(|key| {
            (key == "ECR_REPORTS_DIR").then(|| reports_dir.display().to_string())
        });
        let mut summary = CleanSummary::default();

        let jobs = plan_jobs(&[report], &ingested, &config, &mut summary).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(&jobs[0], CleanJob::Pdf { input, .. } if input.ends_with("files/r1-old.pdf")));
        assert_eq!(summary.image_failures, 1);
        assert!(summary.expected_files.contains("files/r1/fig.png"));
    }
}
