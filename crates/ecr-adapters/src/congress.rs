//! Public-site scraper records (one JSON file per product version).

use async_trait::async_trait;
use ecr_core::timestamp::{self, DATE, ISO_FRACTIONAL, ISO_SECONDS};
use ecr_core::{DocumentKind, FormatKind, FormatRecord, ReportNumber, VersionRecord};
use serde::Deserialize;

use crate::{
    non_empty, Adapted, AdaptedVersion, AdapterContext, AdapterError, RawRecord, SkipReason,
    SourceAdapter,
};

pub const SOURCE_ID: &str = "crsreports-congress-gov";
pub const DISPLAY_NAME: &str = "CRSReports.Congress.gov";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    #[serde(default)]
    number: Option<String>,
    id: String,
    #[serde(default)]
    source_link: Option<String>,
    date: String,
    retrieved: String,
    title: String,
    #[serde(default)]
    summary: Option<String>,
    type_id: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    formats: Vec<Format>,
}

#[derive(Debug, Deserialize)]
struct Format {
    format: FormatKind,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    sha1: Option<String>,
    filename: String,
}

pub struct CongressGovAdapter;

fn document_kind(product_code: &str) -> Result<DocumentKind, SkipReason> {
    match product_code {
        "R" | "RS" | "RL" => Ok(DocumentKind::Report),
        "IN" => Ok(DocumentKind::Insight),
        "IF" => Ok(DocumentKind::InFocus),
        "LSB" => Err(SkipReason::ExcludedType(product_code.to_string())),
        other => Err(SkipReason::UnrecognizedType(other.to_string())),
    }
}

impl Record {
    /// Version ids look like `R41360_3_2020-01-01`; older records lack `number`.
    fn report_number(&self) -> &str {
        match &self.number {
            Some(number) => number,
            None => self.id.split('_').next().unwrap_or(&self.id),
        }
    }
}

#[async_trait]
impl SourceAdapter for CongressGovAdapter {
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
        let record: Record = serde_json::from_slice(&raw.bytes)?;

        let kind = match document_kind(&record.type_id) {
            Ok(kind) => kind,
            Err(reason) => return Ok(Adapted::Skip(reason)),
        };
        if ctx.withheld.contains(record.report_number()) {
            return Ok(Adapted::Skip(SkipReason::Withheld));
        }
        let number = ReportNumber::parse(record.report_number())?;
        if record.formats.is_empty() {
            return Err(AdapterError::MissingField("formats"));
        }

        let formats = record
            .formats
            .into_iter()
            .map(|f| FormatRecord {
                url: f.url,
                sha1: f.sha1,
                ..FormatRecord::new(f.format, f.filename)
            })
            .collect();

        let version = VersionRecord {
            source: DISPLAY_NAME.to_string(),
            source_link: record.source_link,
            id: record.id,
            date: timestamp::parse_date(&record.date, &[DATE])?,
            retrieved: timestamp::parse_datetime(&record.retrieved, &[ISO_FRACTIONAL, ISO_SECONDS])?,
            title: record.title,
            summary: non_empty(record.summary),
            type_name: kind.display_name().to_string(),
            type_id: kind.type_id().to_string(),
            active: record.active,
            formats,
            topics: Vec::new(),
        };

        Ok(Adapted::Version(AdaptedVersion {
            number,
            version,
            authors: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WithholdList;
    use serde_json::json;

    async fn adapt_json(value: serde_json::Value) -> Result<Adapted, AdapterError> {
        let raw = RawRecord {
            path: "documents/R41360_1_2020-01-01.json".into(),
            bytes: serde_json::to_vec(&value).unwrap(),
        };
        let ctx = AdapterContext::new("incoming/crsreports.congress.gov", WithholdList::default());
        CongressGovAdapter.adapt(&raw, &ctx).await
    }

    fn record(type_id: &str) -> serde_json::Value {
        json!({
            "source": "CRSReports.Congress.gov",
            "sourceLink": "https://crsreports.congress.gov/product/details?prodcode=R41360",
            "id": "R41360_1_2020-01-01",
            "date": "2020-01-01",
            "retrieved": "2020-01-02T08:00:00.125",
            "title": "Final",
            "summary": null,
            "type": "CRS Report",
            "typeId": type_id,
            "active": true,
            "formats": [{"format": "PDF", "url": "https://x/pdf", "sha1": "bb", "filename": "files/2020-01-01_R41360_bb.pdf"}]
        })
    }

    #[tokio::test]
    async fn product_codes_map_to_canonical_types() {
        let Adapted::Version(v) = adapt_json(record("RL")).await.unwrap() else {
            panic!("expected version");
        };
        assert_eq!(v.number.as_str(), "R41360");
        assert_eq!(v.version.type_id, "REPORTS");
        assert_eq!(v.version.type_name, "CRS Report");
        assert_eq!(v.version.source_link.as_deref(), Some("https://crsreports.congress.gov/product/details?prodcode=R41360"));

        let Adapted::Version(v) = adapt_json(record("IN")).await.unwrap() else {
            panic!("expected version");
        };
        assert_eq!(v.version.type_id, "INSIGHTS");
    }

    #[tokio::test]
    async fn legal_sidebars_and_unknown_codes_are_skipped() {
        assert!(matches!(
            adapt_json(record("LSB")).await.unwrap(),
            Adapted::Skip(SkipReason::ExcludedType(_))
        ));
        assert!(matches!(
            adapt_json(record("ZZ")).await.unwrap(),
            Adapted::Skip(SkipReason::UnrecognizedType(_))
        ));
    }

    #[tokio::test]
    async fn unsafe_report_numbers_are_fatal() {
        let mut value = record("R");
        value["number"] = json!("../R41360");
        let err = adapt_json(value).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
