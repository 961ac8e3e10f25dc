//! Internal scraper snapshots: one JSON document per (version, fetch).

use std::collections::BTreeMap;

use async_trait::async_trait;
use ecr_core::timestamp::{self, ISO_FRACTIONAL, ISO_SECONDS};
use ecr_core::{FormatKind, FormatRecord, ReportNumber, Topic, TopicId, VersionRecord};
use serde::Deserialize;

use crate::{
    non_empty, string_or_number, Adapted, AdaptedVersion, AdapterContext, AdapterError, RawRecord,
    SkipReason, SourceAdapter,
};

pub const SOURCE_ID: &str = "everycrsreport";
pub const DISPLAY_NAME: &str = "EveryCRSReport.com";

const PUBLISHED_GROUPS: &[&str] = &["REPORTS", "INSIGHTS"];
const EXCLUDED_GROUPS: &[&str] = &["BLOG", "SIDEBAR"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Document {
    product_number: String,
    #[serde(deserialize_with = "string_or_number")]
    prds_prod_ver_id: String,
    cover_date: String,
    #[serde(rename = "_fetched")]
    fetched: String,
    title: String,
    #[serde(default)]
    summary: Option<String>,
    prod_type_display_name: String,
    prod_type_group_code: String,
    #[serde(default)]
    status_flag: Option<String>,
    #[serde(default)]
    format_list: Vec<Format>,
    #[serde(default, rename = "IBCList")]
    ibc_list: Vec<TopicEntry>,
    #[serde(default)]
    cong_ops_list: Vec<TopicEntry>,
    #[serde(default)]
    authors: Vec<Author>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Format {
    format_type: String,
    #[serde(default)]
    order: i64,
    /// Block the scraper adds describing where it stored the file.
    #[serde(rename = "_")]
    scraped: Scraped,
}

#[derive(Debug, Deserialize)]
struct Scraped {
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    sha1: Option<String>,
    filename: String,
    #[serde(default)]
    images: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TopicEntry {
    #[serde(deserialize_with = "string_or_number")]
    prds_cli_item_id: String,
    cli_title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Author {
    /// Holds the full name despite the field name.
    first_name: String,
}

pub struct EveryCrsReportAdapter;

fn format_kind(code: &str) -> Result<FormatKind, AdapterError> {
    match code {
        "PDF" => Ok(FormatKind::Pdf),
        "HTML" => Ok(FormatKind::Html),
        other => Err(AdapterError::Malformed(format!("unknown FormatType {other:?}"))),
    }
}

fn topics(list: &str, entries: &[TopicEntry]) -> Result<Vec<Topic>, AdapterError> {
    entries
        .iter()
        .map(|entry| {
            let id = entry.prds_cli_item_id.trim().parse::<i64>().map_err(|_| {
                AdapterError::Malformed(format!(
                    "{list} PrdsCliItemId {:?} is not an integer",
                    entry.prds_cli_item_id
                ))
            })?;
            Ok(Topic {
                source: list.to_string(),
                id: TopicId::Number(id),
                name: entry.cli_title.clone(),
            })
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for EveryCrsReportAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn display_name(&self) -> &'static str {
        DISPLAY_NAME
    }

    fn raw_extension(&self) -> &'static str {
        "json"
    }

    async fn adapt(&self, raw: &RawRecord, ctx: &AdapterContext) -> Result<Adapted, AdapterError> {
        let doc: Document = serde_json::from_slice(&raw.bytes)?;

        let group = doc.prod_type_group_code.as_str();
        if !PUBLISHED_GROUPS.contains(&group) {
            return Ok(Adapted::Skip(if EXCLUDED_GROUPS.contains(&group) {
                SkipReason::ExcludedType(group.to_string())
            } else {
                SkipReason::UnrecognizedType(group.to_string())
            }));
        }
        if ctx.withheld.contains(&doc.product_number) {
            return Ok(Adapted::Skip(SkipReason::Withheld));
        }
        let number = ReportNumber::parse(&doc.product_number)?;

        let mut formats = doc.format_list;
        formats.sort_by_key(|f| f.order);
        let formats = formats
            .into_iter()
            .map(|f| {
                Ok(FormatRecord {
                    format: format_kind(&f.format_type)?,
                    encoding: f.scraped.encoding,
                    url: f.scraped.url,
                    sha1: f.scraped.sha1,
                    sha256: None,
                    filename: f.scraped.filename,
                    images: f.scraped.images.filter(|images| !images.is_empty()),
                    derived_from: None,
                })
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;

        let mut topic_list = topics("IBCList", &doc.ibc_list)?;
        topic_list.extend(topics("CongOpsList", &doc.cong_ops_list)?);

        let version = VersionRecord {
            source: DISPLAY_NAME.to_string(),
            source_link: None,
            id: doc.prds_prod_ver_id,
            date: timestamp::parse_date(&doc.cover_date, &[ISO_SECONDS])?,
            retrieved: timestamp::parse_datetime(&doc.fetched, &[ISO_FRACTIONAL])?,
            title: doc.title,
            summary: non_empty(doc.summary),
            type_name: doc.prod_type_display_name,
            type_id: group.to_string(),
            active: doc.status_flag.as_deref() == Some("Active"),
            formats,
            topics: topic_list,
        };

        Ok(Adapted::Version(AdaptedVersion {
            number,
            version,
            authors: doc.authors.into_iter().map(|a| a.first_name).collect(),
        }))
    }
}
