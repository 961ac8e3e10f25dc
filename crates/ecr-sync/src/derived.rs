//! Artifacts built from already-redacted files: version diffs and ePub packages.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ecr_artifacts::diff::{diff_html, diff_pairs, percent_filename};
use ecr_artifacts::epub::{build_epub, epub_filename, EpubInput};
use ecr_artifacts::layout::reconstruct_html;
use ecr_artifacts::thumbnail::thumbnail_filename;
use ecr_core::{FormatKind, Report, VersionRecord};
use ecr_storage::cache::{output_exists, sidecar_is_current, write_sidecar};
use ecr_storage::write_atomic;
use tokio::fs;
use tracing::info;

use crate::config::PipelineConfig;
use crate::pool::{blocking, WorkerPool};

#[derive(Debug)]
struct DiffJob {
    previous: PathBuf,
    current: PathBuf,
    output: PathBuf,
    percent: PathBuf,
}

impl fmt::Display for DiffJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.output.display())
    }
}

async fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl DiffJob {
    async fn run(self) -> Result<()> {
        let previous = read_text(&self.previous).await?;
        let current = read_text(&self.current).await?;
        let diff = blocking(move || Ok(diff_html(&previous, &current))).await?;
        write_atomic(&self.output, diff.html.as_bytes()).await?;
        write_atomic(&self.percent, format!("{}\n", diff.percent_changed).as_bytes()).await?;
        Ok(())
    }
}

/// Diff every adjacent pair of differing HTML versions whose outputs are missing.
pub async fn generate_diffs(reports: &[Report], config: &PipelineConfig, pool: &WorkerPool) -> Result<usize> {
    let dir = &config.reports_dir;
    let mut jobs = Vec::new();
    for report in reports.iter().filter(|r| config.only_matches_report(r)) {
        for pair in diff_pairs(report) {
            let name = pair.output_filename()?;
            let output = dir.join(&name);
            let percent = dir.join(percent_filename(&name)?);
            if output_exists(&output).await && output_exists(&percent).await {
                continue;
            }
            jobs.push(DiffJob {
                previous: dir.join(&pair.previous),
                current: dir.join(&pair.current),
                output,
                percent,
            });
        }
    }
    info!(jobs = jobs.len(), "generating diffs");
    let done = pool.run("diffed", jobs, DiffJob::run).await;
    Ok(done.into_iter().flatten().count())
}

/// What an ePub is built from. `identity` changes whenever a different file would
/// be packaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubSource {
    pub number: String,
    pub title: String,
    pub date: chrono::NaiveDate,
    pub body: EpubBody,
    pub cover: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpubBody {
    Html(String),
    /// No HTML rendition: reconstruct from the PDF layout.
    Pdf(String),
}

impl EpubSource {
    pub fn for_version(number: &str, version: &VersionRecord) -> Option<Self> {
        let html = version
            .formats
            .iter()
            .find(|f| f.format == FormatKind::Html && f.derived_from.is_none());
        let pdf = version.format(FormatKind::Pdf);
        let body = match (html, pdf) {
            (Some(html), _) => EpubBody::Html(html.filename.clone()),
            (None, Some(pdf)) => EpubBody::Pdf(pdf.filename.clone()),
            (None, None) => return None,
        };
        Some(Self {
            number: number.to_string(),
            title: version.title.clone(),
            date: version.date,
            body,
            cover: pdf.and_then(|pdf| thumbnail_filename(&pdf.filename).ok()),
        })
    }

    /// Only a thumbnail that is already on disk is packaged or recorded.
    pub async fn with_existing_cover(mut self, reports_dir: &Path) -> Self {
        if let Some(png) = &self.cover {
            if !output_exists(&reports_dir.join(png)).await {
                self.cover = None;
            }
        }
        self
    }

    pub fn identity(&self) -> String {
        let body = match &self.body {
            EpubBody::Html(html) => html,
            EpubBody::Pdf(pdf) => pdf,
        };
        format!("{body}|{}", self.cover.as_deref().unwrap_or_default())
    }
}

#[derive(Debug)]
struct EpubJob {
    source: EpubSource,
    reports_dir: Arc<PathBuf>,
    output: PathBuf,
}

impl fmt::Display for EpubJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.output.display())
    }
}

impl EpubJob {
    async fn run(self) -> Result<()> {
        let EpubJob { source, reports_dir, output } = self;
        let identity = source.identity();
        let bytes = blocking(move || {
            let dir = reports_dir.as_path();
            let body = match &source.body {
                EpubBody::Html(html) => {
                    let path = dir.join(html);
                    let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                EpubBody::Pdf(pdf) => {
                    let path = dir.join(pdf);
                    let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                    reconstruct_html(&bytes).with_context(|| format!("reconstructing {}", path.display()))?
                }
            };
            let cover = source.cover.as_ref().and_then(|png| std::fs::read(dir.join(png)).ok());
            let input = EpubInput {
                number: &source.number,
                title: &source.title,
                date: source.date,
                body_html: &body,
                cover_png: cover.as_deref(),
            };
            build_epub(&input, |stored| std::fs::read(dir.join(stored)).ok())
                .with_context(|| format!("packaging ePub for {}", source.number))
        })
        .await?;
        write_atomic(&output, &bytes).await?;
        write_sidecar(&output, &identity).await?;
        Ok(())
    }
}

/// Package each report's newest version unless the recorded source identity matches.
pub async fn generate_epubs(reports: &[Report], config: &PipelineConfig, pool: &WorkerPool) -> Result<usize> {
    let reports_dir = Arc::new(config.reports_dir.clone());
    let mut jobs = Vec::new();
    for report in reports.iter().filter(|r| config.only_matches_report(r)) {
        let Some(source) = report
            .newest()
            .and_then(|v| EpubSource::for_version(report.number.as_str(), v))
        else {
            continue;
        };
        let source = source.with_existing_cover(&config.reports_dir).await;
        let output = config.reports_dir.join(epub_filename(report.number.as_str()));
        if sidecar_is_current(&output, &source.identity()).await? {
            continue;
        }
        jobs.push(EpubJob {
            source,
            reports_dir: Arc::clone(&reports_dir),
            output,
        });
    }
    info!(jobs = jobs.len(), "packaging ePubs");
    let done = pool.run("packaged", jobs, EpubJob::run).await;
    Ok(done.into_iter().flatten().count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn pdf_source() -> EpubSource {
        EpubSource {
            number: "RS20001".into(),
            title: "Older Report".into(),
            date: NaiveDate::from_ymd_opt(2018, 3, 1).unwrap(),
            body: EpubBody::Pdf("files/rs20001.pdf".into()),
            cover: Some("files/rs20001.png".into()),
        }
    }

    #[tokio::test]
    async fn cover_joins_the_identity_once_the_thumbnail_exists() {
        let dir = tempfile::tempdir().unwrap();
        let without = pdf_source().with_existing_cover(dir.path()).await;
        assert_eq!(without.cover, None);
        assert_eq!(without.identity(), "files/rs20001.pdf|");

        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/rs20001.png"), b"png").unwrap();
        let with = pdf_source().with_existing_cover(dir.path()).await;
        assert_eq!(with.identity(), "files/rs20001.pdf|files/rs20001.png");
        assert_ne!(with.identity(), without.identity());
    }
}
