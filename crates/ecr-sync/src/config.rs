use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ecr_adapters::{congress, everycrsreport, unt};
use ecr_core::{timestamp, Report};
use serde::Deserialize;
use tokio::fs;

/// Ordered list of sources. Order is the adapter processing order, and therefore
/// decides which source wins when two report the same version on the same day.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Relative to the incoming directory.
    pub raw_dir: PathBuf,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        let source = |source_id: &str, display_name: &str, raw_dir: &str| SourceConfig {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            raw_dir: PathBuf::from(raw_dir),
        };
        Self {
            sources: vec![
                source(everycrsreport::SOURCE_ID, everycrsreport::DISPLAY_NAME, "."),
                source(congress::SOURCE_ID, congress::DISPLAY_NAME, "crsreports.congress.gov"),
                source(unt::SOURCE_ID, unt::DISPLAY_NAME, "unt"),
            ],
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// Falls back to the built-in registry when `path` does not exist.
    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text).with_context(|| format!("in {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::builtin()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub incoming_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub site_dir: PathBuf,
    pub withheld_file: PathBuf,
    pub topic_areas_file: PathBuf,
    pub sources_file: PathBuf,
    pub workers: usize,
    pub max_in_flight: usize,
    pub pdf_fallback_cutoff: NaiveDate,
    /// Restricts processing to matching filenames / report numbers.
    pub only: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| var(key).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default));
        let default_workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            incoming_dir: path("ECR_INCOMING_DIR", "incoming"),
            reports_dir: path("ECR_REPORTS_DIR", "reports"),
            site_dir: path("ECR_SITE_DIR", "static-site"),
            withheld_file: path("ECR_WITHHELD_FILE", "withheld-reports.txt"),
            topic_areas_file: path("ECR_TOPIC_AREAS_FILE", "topic_areas.txt"),
            sources_file: path("ECR_SOURCES_FILE", "sources.yaml"),
            workers: var("ECR_WORKERS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default_workers),
            max_in_flight: var("ECR_MAX_IN_FLIGHT")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(20),
            pdf_fallback_cutoff: var("ECR_PDF_FALLBACK_CUTOFF")
                .and_then(|v| timestamp::parse_date(&v, &[timestamp::DATE]).ok())
                .unwrap_or(default_cutoff()),
            only: var("ONLY").filter(|v| !v.is_empty()),
        }
    }

    pub fn only_matches(&self, value: &str) -> bool {
        self.only.as_deref().map_or(true, |only| value.contains(only))
    }

    /// Report-level phases select a report by its number or any of its file names.
    pub fn only_matches_report(&self, report: &Report) -> bool {
        self.only_matches(report.number.as_str())
            || report
                .versions
                .iter()
                .flat_map(|v| v.formats.iter())
                .any(|f| self.only_matches(&f.filename))
    }
}

fn default_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2003, 1, 1).unwrap_or_default()
}
