//! Core domain model and ordering rules for the report archive.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod timestamp;

pub const CRATE_NAME: &str = "ecr-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("report number {0:?} would produce an unsafe output path")]
pub struct InvalidReportNumber(pub String);

/// Identifier of one logical report, stable across sources and versions (e.g. `R41360`).
///
/// Only ASCII letters, digits and hyphens are accepted since the number is embedded
/// verbatim in output paths and URLs. Invalid values are rejected rather than
/// sanitized so two distinct reports can never share an output path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReportNumber(String);

impl ReportNumber {
    pub fn parse(value: &str) -> Result<Self, InvalidReportNumber> {
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(InvalidReportNumber(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ReportNumber {
    type Error = InvalidReportNumber;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ReportNumber> for String {
    fn from(value: ReportNumber) -> Self {
        value.0
    }
}

impl fmt::Display for ReportNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical document classification shared by all sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Report,
    Insight,
    InFocus,
}

impl DocumentKind {
    pub fn display_name(self) -> &'static str {
        match self {
            DocumentKind::Report => "CRS Report",
            DocumentKind::Insight => "CRS Insight",
            DocumentKind::InFocus => "CRS In Focus",
        }
    }

    pub fn type_id(self) -> &'static str {
        match self {
            DocumentKind::Report => "REPORTS",
            DocumentKind::Insight => "INSIGHTS",
            DocumentKind::InFocus => "INFOCUS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatKind {
    #[serde(rename = "PDF")]
    Pdf,
    #[serde(rename = "HTML")]
    Html,
}

impl FormatKind {
    pub fn extension(self) -> &'static str {
        match self {
            FormatKind::Pdf => "pdf",
            FormatKind::Html => "html",
        }
    }
}

/// One downloadable representation of a version. `filename` is storage-relative
/// and embeds the content hash, so the same bytes always land on the same path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRecord {
    pub format: FormatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub filename: String,
    /// Original image path in the scraped HTML -> stored image path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, String>>,
    /// Set on generated renditions (plain-text fallback) to the file they came from.
    #[serde(
        rename = "derivedFrom",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub derived_from: Option<String>,
}

impl FormatRecord {
    pub fn new(format: FormatKind, filename: impl Into<String>) -> Self {
        Self {
            format,
            encoding: None,
            url: None,
            sha1: None,
            sha256: None,
            filename: filename.into(),
            images: None,
            derived_from: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub source: String,
    pub id: TopicId,
    pub name: String,
}

/// At most one version per (report, calendar day) survives collation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub number: ReportNumber,
    pub day: NaiveDate,
}

/// One snapshot of a report as observed from a single source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub source: String,
    #[serde(
        rename = "sourceLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_link: Option<String>,
    pub id: String,
    #[serde(with = "timestamp::date")]
    pub date: NaiveDate,
    #[serde(with = "timestamp::datetime")]
    pub retrieved: NaiveDateTime,
    pub title: String,
    pub summary: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "typeId")]
    pub type_id: String,
    pub active: bool,
    pub formats: Vec<FormatRecord>,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

impl VersionRecord {
    pub fn dedup_key(&self, number: &ReportNumber) -> DedupKey {
        DedupKey {
            number: number.clone(),
            day: self.date,
        }
    }

    pub fn format(&self, kind: FormatKind) -> Option<&FormatRecord> {
        self.formats.iter().find(|f| f.format == kind)
    }

    /// Total order used everywhere versions are compared: publication date
    /// descending, then retrieval timestamp descending. Future-dated versions
    /// are not clamped.
    pub fn newest_first(a: &VersionRecord, b: &VersionRecord) -> Ordering {
        (b.date, b.retrieved).cmp(&(a.date, a.retrieved))
    }
}

/// Stable full resort; `versions[0]` is the authoritative newest version afterwards.
pub fn sort_newest_first(versions: &mut [VersionRecord]) {
    versions.sort_by(VersionRecord::newest_first);
}

/// Canonical published unit. Always rewritten wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportNumber,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "typeId")]
    pub type_id: String,
    pub number: ReportNumber,
    pub active: bool,
    pub source: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub versions: Vec<VersionRecord>,
}

impl Report {
    /// Build a report from versions already sorted newest-first. Report-level
    /// fields come from the newest version; `source` lists every contributing
    /// source once, in the order first met walking the sorted list.
    pub fn from_sorted_versions(number: ReportNumber, versions: Vec<VersionRecord>) -> Option<Self> {
        let newest = versions.first()?;
        Some(Self {
            id: number.clone(),
            type_name: newest.type_name.clone(),
            type_id: newest.type_id.clone(),
            number,
            active: newest.active,
            source: combined_source(&versions),
            topics: Vec::new(),
            versions,
        })
    }

    pub fn newest(&self) -> Option<&VersionRecord> {
        self.versions.first()
    }

    /// Site-wide listing order: newest version (date, retrieved) descending,
    /// report number ascending on exact ties.
    pub fn newest_first(a: &Report, b: &Report) -> Ordering {
        let key = |r: &Report| r.newest().map(|v| (v.date, v.retrieved));
        key(b).cmp(&key(a)).then_with(|| a.number.cmp(&b.number))
    }
}

pub fn combined_source(versions: &[VersionRecord]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for version in versions {
        if !seen.contains(&version.source.as_str()) {
            seen.push(&version.source);
        }
    }
    seen.join(", ")
}
