//! Third-party archive records: one XML metadata file per version, with the PDF
//! alongside it under the same stem.

use async_trait::async_trait;
use chrono::NaiveDate;
use ecr_core::timestamp::{self, TimestampError, DATE};
use ecr_core::{DocumentKind, FormatKind, FormatRecord, ReportNumber, Topic, TopicId, VersionRecord};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::{
    non_empty, Adapted, AdaptedVersion, AdapterContext, AdapterError, RawRecord, SkipReason,
    SourceAdapter,
};

pub const SOURCE_ID: &str = "unt";
pub const DISPLAY_NAME: &str = "UNT";

const METADATA_CREATED: &str = "%Y-%m-%d, %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Element {
    tag: String,
    qualifier: String,
    text: String,
}

#[derive(Debug, Default)]
struct Metadata {
    elements: Vec<Element>,
    creators: Vec<String>,
}

impl Metadata {
    fn parse(bytes: &[u8]) -> Result<Self, AdapterError> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();
        let mut metadata = Metadata::default();
        let mut depth = 0usize;
        let mut current: Option<Element> = None;
        let mut creator_name: Option<String> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    depth += 1;
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if depth == 2 {
                        let qualifier = match e.try_get_attribute("qualifier") {
                            Ok(Some(attr)) => attr
                                .unescape_value()
                                .map(|v| v.into_owned())
                                .unwrap_or_default(),
                            _ => String::new(),
                        };
                        current = Some(Element {
                            tag,
                            qualifier,
                            text: String::new(),
                        });
                    } else if depth == 3
                        && tag == "name"
                        && current.as_ref().is_some_and(|el| el.tag == "creator")
                    {
                        creator_name = Some(String::new());
                    }
                }
                Ok(Event::Text(te)) => {
                    let text = te
                        .unescape()
                        .map_err(|err| AdapterError::Malformed(err.to_string()))?;
                    if let Some(name) = creator_name.as_mut() {
                        name.push_str(&text);
                    } else if depth == 2 {
                        if let Some(el) = current.as_mut() {
                            el.text.push_str(&text);
                        }
                    }
                }
                Ok(Event::CData(cdata)) => {
                    if depth == 2 {
                        if let Some(el) = current.as_mut() {
                            el.text.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    if depth == 3 {
                        if let Some(name) = creator_name.take() {
                            metadata.creators.push(name.trim().to_string());
                        }
                    }
                    if depth == 2 {
                        if let Some(mut el) = current.take() {
                            el.text = el.text.trim().to_string();
                            metadata.elements.push(el);
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(AdapterError::Malformed(format!(
                        "XML error at byte {}: {err}",
                        reader.buffer_position()
                    )))
                }
            }
            buf.clear();
        }

        if metadata.elements.is_empty() {
            return Err(AdapterError::Malformed("no metadata elements".into()));
        }
        Ok(metadata)
    }

    fn value(&self, tag: &str, qualifier: &str) -> Option<&str> {
        self.elements
            .iter()
            .find(|el| el.tag == tag && el.qualifier == qualifier)
            .map(|el| el.text.as_str())
    }

    fn all(&self, tag: &str) -> impl Iterator<Item = &Element> + '_ {
        let tag = tag.to_string();
        self.elements.iter().filter(move |el| el.tag == tag)
    }
}

/// Archive dates may carry only a year or a year and month; the missing parts become
/// the first of the period. The archive contains one impossible date we map to the
/// last day of that February.
fn creation_date(value: &str) -> Result<NaiveDate, AdapterError> {
    let value = value.trim();
    if value == "2002-02-29" {
        return Ok(NaiveDate::from_ymd_opt(2002, 2, 28).unwrap_or_default());
    }
    let invalid = || {
        AdapterError::Timestamp(TimestampError {
            value: value.to_string(),
            expected: "YYYY, YYYY-MM or YYYY-MM-DD".into(),
        })
    };
    let parts: Vec<&str> = value.split('-').collect();
    if parts.is_empty() || parts.len() > 3 || parts[0].len() != 4 {
        return Err(invalid());
    }
    let mut numbers = parts.iter().map(|p| p.parse::<u32>().map_err(|_| invalid()));
    let year = numbers.next().ok_or_else(invalid)??;
    let month = numbers.next().transpose()?.unwrap_or(1);
    let day = numbers.next().transpose()?.unwrap_or(1);
    NaiveDate::from_ymd_opt(year as i32, month, day).ok_or_else(invalid)
}

/// "Doe, Jane" -> "Jane Doe".
fn display_name(name: &str) -> String {
    match name.split_once(',') {
        Some((last, first)) if !first.trim().is_empty() => {
            format!("{} {}", first.trim(), last.trim())
        }
        _ => name.trim().to_string(),
    }
}

pub struct UntArchiveAdapter;

#[async_trait]
impl SourceAdapter for UntArchiveAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn display_name(&self) -> &'static str {
        DISPLAY_NAME
    }

    fn raw_extension(&self) -> &'static str {
        "xml"
    }

    async fn adapt(&self, raw: &RawRecord, ctx: &AdapterContext) -> Result<Adapted, AdapterError> {
        let md = Metadata::parse(&raw.bytes)?;

        // Legal Sidebars carry no report number.
        if md.value("title", "seriestitle") == Some("Legal Sidebar") {
            return Ok(Adapted::Skip(SkipReason::ExcludedType("Legal Sidebar".into())));
        }
        let number = md
            .value("identifier", "CRS")
            .ok_or(AdapterError::MissingField("identifier[@qualifier=CRS]"))?;
        if ctx.withheld.contains(number) {
            return Ok(Adapted::Skip(SkipReason::Withheld));
        }
        let number = ReportNumber::parse(number)?;

        let id = md
            .value("identifier", "LOCAL-CONT-NO")
            .or_else(|| md.value("identifier", "ark"))
            .map(str::to_string)
            .or_else(|| {
                raw.path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .ok_or(AdapterError::MissingField("identifier"))?;
        let date = creation_date(
            md.value("date", "creation")
                .ok_or(AdapterError::MissingField("date[@qualifier=creation]"))?,
        )?;
        let retrieved = timestamp::parse_datetime(
            md.value("meta", "metadataCreationDate")
                .ok_or(AdapterError::MissingField("meta[@qualifier=metadataCreationDate]"))?,
            &[METADATA_CREATED, DATE],
        )?;
        let title = md
            .value("title", "officialtitle")
            .or_else(|| md.value("title", ""))
            .ok_or(AdapterError::MissingField("title"))?
            .to_string();
        let topics = md
            .all("subject")
            .filter(|el| !el.text.is_empty())
            .map(|el| Topic {
                source: el.qualifier.clone(),
                id: TopicId::Text(el.text.clone()),
                name: el.text.clone(),
            })
            .collect();

        let pdf = raw.path.with_extension("pdf");
        if !tokio::fs::try_exists(&pdf).await.unwrap_or(false) {
            return Err(AdapterError::MissingFile(pdf));
        }
        let stored = ctx.store().ingest_file(&pdf, "pdf").await?;
        let format = FormatRecord {
            sha256: Some(stored.content_hash.clone()),
            ..FormatRecord::new(FormatKind::Pdf, stored.filename())
        };

        let kind = DocumentKind::Report;
        let version = VersionRecord {
            source: DISPLAY_NAME.to_string(),
            source_link: None,
            id,
            date,
            retrieved,
            title,
            summary: non_empty(md.value("description", "content").map(str::to_string)),
            type_name: kind.display_name().to_string(),
            type_id: kind.type_id().to_string(),
            active: true,
            formats: vec![format],
            topics,
        };

        Ok(Adapted::Version(AdaptedVersion {
            number,
            version,
            authors: md.creators.iter().map(|name| display_name(name)).collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_dates_become_first_of_period() {
        let d = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert_eq!(creation_date("1998").unwrap(), d(1998, 1, 1));
        assert_eq!(creation_date("1998-07").unwrap(), d(1998, 7, 1));
        assert_eq!(creation_date("1998-07-15").unwrap(), d(1998, 7, 15));
        assert_eq!(creation_date("2002-02-29").unwrap(), d(2002, 2, 28));
        assert!(creation_date("2003-02-29").is_err());
        assert!(creation_date("July 1998").is_err());
    }

    #[test]
    fn author_names_are_flipped() {
        assert_eq!(display_name("Doe, Jane M."), "Jane M. Doe");
        assert_eq!(display_name("Jane Doe"), "Jane Doe");
    }

    #[test]
    fn parses_qualified_elements_and_creators() {
        let xml = br#"<?xml version="1.0"?>
<metadata>
  <title qualifier="officialtitle">Water &amp; Power</title>
  <creator qualifier="aut"><type>per</type><name>Doe, Jane</name></creator>
  <identifier qualifier="CRS">RL30240</identifier>
  <subject qualifier="KWD">Dams</subject>
</metadata>"#;
        let md = Metadata::parse(xml).unwrap();
        assert_eq!(md.value("title", "officialtitle"), Some("Water & Power"));
        assert_eq!(md.value("identifier", "CRS"), Some("RL30240"));
        assert_eq!(md.creators, vec!["Doe, Jane"]);
        assert_eq!(md.all("subject").count(), 1);
        assert!(Metadata::parse(b"<metadata><title>x</metadata>").is_err());
    }
}
