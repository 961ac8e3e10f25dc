//! Pipeline orchestration: adapters, collation, redaction, derived artifacts and
//! report pages, in that order.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ecr_adapters::WithholdList;
use ecr_artifacts::thumbnail::{PdftoppmRasterizer, Rasterizer};
use ecr_redact::ScrubRules;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod clean;
pub mod collate;
pub mod config;
pub mod derived;
pub mod ingest;
pub mod pages;
pub mod pool;
pub mod publish;
pub mod topics;

pub use config::{PipelineConfig, SourceConfig, SourceRegistry};
pub use pages::{BasicPageRenderer, PagesSummary, ReportPageRenderer};

use clean::{clean_files, CleanContext};
use collate::collate;
use pool::WorkerPool;
use publish::{collect_garbage_files, load_reports, newest_html_text, write_reports};
use topics::TopicAreas;

pub const CRATE_NAME: &str = "ecr-sync";

#[derive(Debug, Clone)]
pub struct ProcessSummary {
    pub run_id: Uuid,
    pub raw_records: usize,
    pub adapted: usize,
    pub dropped: usize,
    pub failed_records: usize,
    pub reports: usize,
    pub same_day_conflicts: usize,
    pub files_cleaned: usize,
    pub thumbnails: usize,
    pub text_fallbacks: usize,
    pub reports_written: usize,
    pub reports_removed: usize,
    pub files_removed: usize,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub process: ProcessSummary,
    pub diffs: usize,
    pub epubs: usize,
    pub pages_rendered: usize,
}

/// A missing withhold list means nothing is withheld.
async fn load_withheld(path: &Path) -> Result<WithholdList> {
    if !tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        warn!(path = %path.display(), "no withhold list; publishing every report");
        return Ok(WithholdList::default());
    }
    WithholdList::load(path).await
}

pub struct Pipeline {
    config: PipelineConfig,
    pool: WorkerPool,
    rasterizer: Arc<dyn Rasterizer>,
    renderer: Box<dyn ReportPageRenderer>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let pool = WorkerPool::new(config.workers, config.max_in_flight);
        Self {
            config,
            pool,
            rasterizer: Arc::new(PdftoppmRasterizer::default()),
            renderer: Box::new(BasicPageRenderer),
        }
    }

    pub fn from_env() -> Self {
        Self::new(PipelineConfig::from_env())
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_renderer(mut self, renderer: Box<dyn ReportPageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Adapters -> collator -> redaction and thumbnails -> text renditions ->
    /// topics -> report JSON and garbage collection.
    pub async fn process(&self) -> Result<ProcessSummary> {
        let run_id = Uuid::new_v4();
        self.process_inner(run_id)
            .instrument(info_span!("process", %run_id))
            .await
    }

    async fn process_inner(&self, run_id: Uuid) -> Result<ProcessSummary> {
        let config = &self.config;
        let registry = SourceRegistry::load_or_builtin(&config.sources_file).await?;
        let withheld = load_withheld(&config.withheld_file).await?;
        info!(sources = registry.enabled().count(), withheld = withheld.len(), "starting");

        let mut ingested = ingest::run_adapters(&config.incoming_dir, &registry, &withheld).await?;
        let collation = collate(std::mem::take(&mut ingested.versions));
        let mut reports = collation.reports;
        info!(reports = reports.len(), conflicts = collation.conflicts.len(), "collated");

        // Redaction must not start before every adapter has contributed names.
        let names = std::mem::take(&mut ingested.vocabulary).finalize();
        let rules = ScrubRules::new(&names).context("compiling author-name patterns")?;
        info!(names = names.len(), "author vocabulary finalized");

        let ctx = CleanContext {
            reports_dir: config.reports_dir.clone(),
            rules,
            rasterizer: Arc::clone(&self.rasterizer),
            pdf_fallback_cutoff: config.pdf_fallback_cutoff,
        };
        let cleaned = clean_files(&mut reports, &ingested, config, ctx, &self.pool).await?;

        let areas = TopicAreas::load(&config.topic_areas_file).await?;
        for report in &mut reports {
            let text = newest_html_text(report, &config.reports_dir).await?;
            report.topics = areas.assign(report, text.as_deref());
        }

        let published = write_reports(&reports, &config.reports_dir).await?;
        let files_removed = match config.only {
            Some(_) => 0,
            None => collect_garbage_files(&config.reports_dir, &cleaned.expected_files)
                .await?
                .len(),
        };

        Ok(ProcessSummary {
            run_id,
            raw_records: ingested.summary.records,
            adapted: ingested.summary.adapted,
            dropped: ingested.summary.dropped,
            failed_records: ingested.summary.failed,
            reports: reports.len(),
            same_day_conflicts: collation.conflicts.len(),
            files_cleaned: cleaned.html + cleaned.pdf,
            thumbnails: cleaned.thumbnails,
            text_fallbacks: cleaned.text_fallbacks,
            reports_written: published.written,
            reports_removed: published.removed_reports.len(),
            files_removed,
        })
    }

    pub async fn diff(&self) -> Result<usize> {
        let reports = load_reports(&self.config.reports_dir).await?;
        derived::generate_diffs(&reports, &self.config, &self.pool)
            .instrument(info_span!("diff"))
            .await
    }

    pub async fn epub(&self) -> Result<usize> {
        let reports = load_reports(&self.config.reports_dir).await?;
        derived::generate_epubs(&reports, &self.config, &self.pool)
            .instrument(info_span!("epub"))
            .await
    }

    pub async fn pages(&self) -> Result<PagesSummary> {
        let reports = load_reports(&self.config.reports_dir).await?;
        pages::generate_pages(&reports, self.renderer.as_ref(), &self.config)
            .instrument(info_span!("pages"))
            .await
    }

    pub async fn run_all(&self) -> Result<RunSummary> {
        let process = self.process().await?;
        let diffs = self.diff().await?;
        let epubs = self.epub().await?;
        let pages = self.pages().await?;
        Ok(RunSummary {
            process,
            diffs,
            epubs,
            pages_rendered: pages.rendered,
        })
    }
}
