//! Source adapter contracts: one stateless adapter per upstream source, each the sole
//! consumer of that source's raw metadata schema.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use ecr_core::timestamp::TimestampError;
use ecr_core::{InvalidReportNumber, ReportNumber, VersionRecord};
use ecr_storage::ArtifactStore;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub mod congress;
pub mod everycrsreport;
pub mod unt;

pub const CRATE_NAME: &str = "ecr-adapters";

/// Subdirectory of a source's raw directory holding per-version metadata files.
pub const DOCUMENTS_DIR: &str = "documents";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed raw record: {0}")]
    Malformed(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
    #[error(transparent)]
    InvalidReportNumber(#[from] InvalidReportNumber),
    #[error("referenced file {0} does not exist")]
    MissingFile(PathBuf),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// An invalid report number would be embedded in output paths, so it aborts the run
    /// instead of skipping the record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::InvalidReportNumber(_))
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Malformed(err.to_string())
    }
}

/// Policy-driven drops. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Withheld,
    /// Known document type that is deliberately not published (blogs, sidebars).
    ExcludedType(String),
    /// Type code nobody has mapped yet; worth a log line.
    UnrecognizedType(String),
}

impl SkipReason {
    pub fn is_expected(&self) -> bool {
        !matches!(self, SkipReason::UnrecognizedType(_))
    }
}

#[derive(Debug, Clone)]
pub struct AdaptedVersion {
    pub number: ReportNumber,
    pub version: VersionRecord,
    /// Personal names to add to the redaction vocabulary.
    pub authors: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Adapted {
    Version(AdaptedVersion),
    Skip(SkipReason),
}

#[derive(Debug, Clone)]
pub struct RawRecord {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl RawRecord {
    pub async fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading raw record {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
        })
    }
}

/// Per-source state handed to every `adapt` call. `raw_dir` is the root the
/// source's format filenames are relative to.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub raw_dir: PathBuf,
    pub withheld: WithholdList,
    store: ArtifactStore,
}

impl AdapterContext {
    pub fn new(raw_dir: impl Into<PathBuf>, withheld: WithholdList) -> Self {
        let raw_dir = raw_dir.into();
        Self {
            store: ArtifactStore::new(raw_dir.clone()),
            raw_dir,
            withheld,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Value written to `VersionRecord::source`.
    fn display_name(&self) -> &'static str;

    /// Extension of the raw metadata files under `<raw_dir>/documents/`.
    fn raw_extension(&self) -> &'static str;

    /// Withheld reports must be dropped before anything is written to disk.
    async fn adapt(&self, raw: &RawRecord, ctx: &AdapterContext) -> Result<Adapted, AdapterError>;
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        everycrsreport::SOURCE_ID => Some(Box::new(everycrsreport::EveryCrsReportAdapter)),
        congress::SOURCE_ID => Some(Box::new(congress::CongressGovAdapter)),
        unt::SOURCE_ID => Some(Box::new(unt::UntArchiveAdapter)),
        _ => None,
    }
}

/// Report numbers that must never be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WithholdList {
    numbers: HashSet<String>,
}

impl WithholdList {
    /// One report number per line; anything after a tab is an annotation.
    pub fn parse(text: &str) -> Self {
        let numbers = text
            .lines()
            .filter_map(|line| line.split('\t').next())
            .map(str::trim)
            .filter(|number| !number.is_empty())
            .map(str::to_string)
            .collect();
        Self { numbers }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading withhold list {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn contains(&self, number: &str) -> bool {
        self.numbers.contains(number)
    }

    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}

/// Author names collected during the adapter phase. Redaction only ever sees the
/// finalized, read-only form, which cannot exist before every adapter has run.
#[derive(Debug, Clone, Default)]
pub struct AuthorVocabulary {
    names: BTreeSet<String>,
}

impl AuthorVocabulary {
    pub fn insert(&mut self, name: &str) {
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        if !name.is_empty() {
            self.names.insert(name);
        }
    }

    pub fn extend<I: IntoIterator<Item = S>, S: AsRef<str>>(&mut self, names: I) {
        for name in names {
            self.insert(name.as_ref());
        }
    }

    /// Adds "Jane Doe" for every "J. Jane Doe": documents sometimes drop a leading initial.
    pub fn finalize(mut self) -> Vec<String> {
        let variants: Vec<String> = self
            .names
            .iter()
            .filter_map(|name| {
                let parts: Vec<&str> = name.split(' ').collect();
                (parts.len() >= 3 && parts[0].ends_with('.')).then(|| parts[1..].join(" "))
            })
            .collect();
        self.names.extend(variants);
        self.names.into_iter().collect()
    }
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Upstream ids are sometimes JSON numbers, sometimes strings.
pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Int(n) => n.to_string(),
    })
}
