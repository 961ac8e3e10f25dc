//! PDF redaction: content-stream text scrub, metadata replacement, link removal and
//! a trailer page.

use chrono::{NaiveDate, NaiveDateTime};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream, StringFormat};
use regex::Regex;
use tracing::{debug, warn};

use crate::scrub::ScrubRules;
use crate::RedactError;

pub const AUTHOR: &str = "Congressional Research Service, Library of Congress, USA";
pub const PRODUCER: &str = "EveryCRSReport.com";

const TRAILER_LINES: &[&str] = &[
    "EveryCRSReport.com",
    "",
    "The Congressional Research Service (CRS) is a federal legislative branch agency,",
    "housed inside the Library of Congress, charged with providing the United States",
    "Congress non-partisan advice on issues that may come before Congress.",
    "",
    "EveryCRSReport.com republishes CRS reports that are available to all Congressional",
    "staff. The reports are not classified, and Members of Congress routinely make",
    "individual reports available to the public.",
    "",
    "Prior to our republication, we redacted phone numbers and email addresses of",
    "individual CRS analysts. We also added this page to the report.",
];

/// Known-good metadata forced onto the output document.
#[derive(Debug, Clone)]
pub struct PdfMetadata<'a> {
    pub title: &'a str,
    pub date: NaiveDate,
    pub modified: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdfOutcome {
    Redacted(Vec<u8>),
    /// Redaction failed on a document old enough to be published as-is.
    PassedThrough(Vec<u8>),
}

impl PdfOutcome {
    pub fn bytes(&self) -> &[u8] {
        match self {
            PdfOutcome::Redacted(bytes) | PdfOutcome::PassedThrough(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            PdfOutcome::Redacted(bytes) | PdfOutcome::PassedThrough(bytes) => bytes,
        }
    }
}

pub fn redact_pdf(bytes: &[u8], meta: &PdfMetadata<'_>, rules: &ScrubRules) -> Result<Vec<u8>, RedactError> {
    let mut doc = Document::load_mem(bytes)?;
    scrub_content_streams(&mut doc, rules)?;
    remove_email_links(&mut doc)?;
    replace_metadata(&mut doc, meta)?;
    append_trailer_page(&mut doc)?;
    // Drops the original content streams and info dictionary.
    doc.prune_objects();

    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

/// Documents dated before `cutoff` that fail to redact are published unredacted,
/// still carrying the trailer page when the document loads at all.
pub fn redact_pdf_or_pass_through(
    bytes: &[u8],
    meta: &PdfMetadata<'_>,
    rules: &ScrubRules,
    cutoff: NaiveDate,
) -> Result<PdfOutcome, RedactError> {
    match redact_pdf(bytes, meta, rules) {
        Ok(out) => Ok(PdfOutcome::Redacted(out)),
        Err(err) if meta.date < cutoff => {
            warn!(date = %meta.date, %cutoff, error = %err, "redaction failed on old document; writing it unredacted");
            Ok(PdfOutcome::PassedThrough(pass_through(bytes)))
        }
        Err(err) => Err(err),
    }
}

fn with_trailer_page(bytes: &[u8]) -> Result<Vec<u8>, RedactError> {
    let mut doc = Document::load_mem(bytes)?;
    append_trailer_page(&mut doc)?;
    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

fn pass_through(bytes: &[u8]) -> Vec<u8> {
    match with_trailer_page(bytes) {
        Ok(out) => out,
        Err(err) => {
            debug!(error = %err, "trailer page not added; passing bytes through untouched");
            bytes.to_vec()
        }
    }
}

/// Where one run of shown text lives: the string operand of `Tj`, `'` or `"`, or
/// one string inside a `TJ` array.
#[derive(Debug, Clone, Copy)]
struct RunSlot {
    op: usize,
    item: Option<usize>,
}

/// The shown text of one page, kept as the runs it was drawn in. Producers split
/// names and addresses across operators, so patterns run over the whole layer and
/// each replacement is mapped back onto the runs it covers.
#[derive(Debug, Default)]
struct TextLayer {
    slots: Vec<RunSlot>,
    runs: Vec<Vec<u8>>,
}

/// Simple-font strings are single-byte; Latin-1 maps every byte to one char and back.
fn latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'#'))
        .collect()
}

impl TextLayer {
    fn collect(operations: &[Operation]) -> Self {
        let mut layer = Self::default();
        for (op, operation) in operations.iter().enumerate() {
            match operation.operator.as_str() {
                "Tj" | "'" | "\"" => {
                    if let Some(Object::String(bytes, _)) = operation.operands.last() {
                        layer.push(RunSlot { op, item: None }, bytes);
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = operation.operands.first() {
                        for (item, object) in items.iter().enumerate() {
                            if let Object::String(bytes, _) = object {
                                layer.push(RunSlot { op, item: Some(item) }, bytes);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        layer
    }

    fn push(&mut self, slot: RunSlot, bytes: &[u8]) {
        self.slots.push(slot);
        self.runs.push(bytes.to_vec());
    }

    /// The layer as text, plus the layer byte index for every text byte offset
    /// (one past the end included).
    fn text(&self) -> (String, Vec<usize>) {
        let mut text = String::new();
        let mut offsets = Vec::new();
        let mut index = 0;
        for &byte in self.runs.iter().flatten() {
            let c = char::from(byte);
            offsets.extend(std::iter::repeat(index).take(c.len_utf8()));
            text.push(c);
            index += 1;
        }
        offsets.push(index);
        (text, offsets)
    }

    /// Returns whether anything was replaced.
    fn apply(&mut self, re: &Regex, template: &str) -> bool {
        let (text, offsets) = self.text();
        let mut edits = Vec::new();
        for caps in re.captures_iter(&text) {
            let Some(m) = caps.get(0) else {
                continue;
            };
            let mut replacement = String::new();
            caps.expand(template, &mut replacement);
            if m.start() == m.end() || replacement == m.as_str() {
                continue;
            }
            edits.push((offsets[m.start()], offsets[m.end()], latin1(&replacement)));
        }
        let changed = !edits.is_empty();
        // Back to front so earlier offsets stay valid.
        for (start, end, replacement) in edits.into_iter().rev() {
            self.splice(start, end, replacement);
        }
        changed
    }

    /// The replacement goes into the run where the match starts; the rest of the
    /// match is cut out of the following runs it spans.
    fn splice(&mut self, start: usize, end: usize, replacement: Vec<u8>) {
        let mut replacement = Some(replacement);
        let mut run_start = 0;
        for run in &mut self.runs {
            let run_end = run_start + run.len();
            if run_start >= end {
                break;
            }
            if run_end > start {
                let from = start.saturating_sub(run_start);
                let to = end.min(run_end) - run_start;
                let mut spliced = run[..from].to_vec();
                if let Some(replacement) = replacement.take() {
                    spliced.extend(replacement);
                }
                spliced.extend_from_slice(&run[to..]);
                *run = spliced;
            }
            run_start = run_end;
        }
    }

    /// Kerning entries of `TJ` arrays are left where they were.
    fn write_back(self, operations: &mut [Operation]) {
        for (slot, run) in self.slots.into_iter().zip(self.runs) {
            let Some(operation) = operations.get_mut(slot.op) else {
                continue;
            };
            let target = match slot.item {
                None => operation.operands.last_mut(),
                Some(item) => match operation.operands.first_mut() {
                    Some(Object::Array(items)) => items.get_mut(item),
                    _ => None,
                },
            };
            if let Some(Object::String(bytes, _)) = target {
                *bytes = run;
            }
        }
    }
}

fn scrub_content_streams(doc: &mut Document, rules: &ScrubRules) -> Result<(), RedactError> {
    let pdf_rules = rules.pdf_rules();
    for (_, page_id) in doc.get_pages() {
        let data = doc.get_page_content(page_id)?;
        let mut content = Content::decode(&data)?;
        let mut layer = TextLayer::collect(&content.operations);
        let mut changed = false;
        for (re, template) in &pdf_rules {
            changed |= layer.apply(re, template);
        }
        if !changed {
            continue;
        }
        layer.write_back(&mut content.operations);
        let encoded = content.encode()?;
        let stream_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        doc.get_object_mut(page_id)?
            .as_dict_mut()?
            .set("Contents", Object::Reference(stream_id));
    }
    Ok(())
}

fn dictionary_of<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a lopdf::Dictionary> {
    match doc.dereference(object).ok()?.1 {
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn is_email_link(doc: &Document, annotation: &Object) -> bool {
    let uri = dictionary_of(doc, annotation)
        .and_then(|annot| annot.get(b"A").ok())
        .and_then(|action| dictionary_of(doc, action))
        .and_then(|action| action.get(b"URI").ok())
        .and_then(|uri| doc.dereference(uri).ok())
        .and_then(|(_, uri)| match uri {
            Object::String(bytes, _) => Some(String::from_utf8_lossy(bytes).to_ascii_lowercase()),
            _ => None,
        });
    uri.is_some_and(|uri| uri.starts_with("mailto:") || uri.contains('@'))
}

fn remove_email_links(doc: &mut Document) -> Result<(), RedactError> {
    let mut updates: Vec<(ObjectId, Vec<Object>)> = Vec::new();
    for (_, page_id) in doc.get_pages() {
        let page = doc.get_dictionary(page_id)?;
        let Ok(annots) = page.get(b"Annots") else {
            continue;
        };
        let Ok((_, Object::Array(annots))) = doc.dereference(annots) else {
            continue;
        };
        let kept: Vec<Object> = annots
            .iter()
            .filter(|annot| !is_email_link(doc, annot))
            .cloned()
            .collect();
        if kept.len() != annots.len() {
            updates.push((page_id, kept));
        }
    }
    for (page_id, kept) in updates {
        doc.get_object_mut(page_id)?
            .as_dict_mut()?
            .set("Annots", Object::Array(kept));
    }
    Ok(())
}

fn text_string(value: &str) -> Object {
    if value.is_ascii() {
        return Object::String(value.as_bytes().to_vec(), StringFormat::Literal);
    }
    let mut bytes = vec![0xFE, 0xFF];
    for unit in value.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    Object::String(bytes, StringFormat::Hexadecimal)
}

fn pdf_date(value: NaiveDateTime) -> Object {
    Object::String(
        value.format("D:%Y%m%d%H%M%SZ").to_string().into_bytes(),
        StringFormat::Literal,
    )
}

fn replace_metadata(doc: &mut Document, meta: &PdfMetadata<'_>) -> Result<(), RedactError> {
    let info = dictionary! {
        "Title" => text_string(meta.title),
        "Author" => text_string(AUTHOR),
        "CreationDate" => pdf_date(meta.date.and_hms_opt(0, 0, 0).unwrap_or_default()),
        "Producer" => text_string(PRODUCER),
        "ModDate" => pdf_date(meta.modified),
    };
    let info_id = doc.add_object(info);
    doc.trailer.set("Info", Object::Reference(info_id));

    // XMP document properties.
    let root_id = doc.trailer.get(b"Root")?.as_reference()?;
    doc.get_object_mut(root_id)?.as_dict_mut()?.remove(b"Metadata");
    for (_, page_id) in doc.get_pages() {
        doc.get_object_mut(page_id)?.as_dict_mut()?.remove(b"Metadata");
    }
    Ok(())
}

fn append_trailer_page(doc: &mut Document) -> Result<(), RedactError> {
    let root_id = doc.trailer.get(b"Root")?.as_reference()?;
    let pages_id = doc.get_dictionary(root_id)?.get(b"Pages")?.as_reference()?;

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), Object::Integer(11)]),
        Operation::new("TL", vec![Object::Integer(16)]),
        Operation::new("Td", vec![Object::Integer(72), Object::Integer(700)]),
    ];
    for line in TRAILER_LINES {
        operations.push(Operation::new(
            "Tj",
            vec![Object::String(line.as_bytes().to_vec(), StringFormat::Literal)],
        ));
        operations.push(Operation::new("T*", vec![]));
    }
    operations.push(Operation::new("ET", vec![]));
    let content_id = doc.add_object(Stream::new(dictionary! {}, Content { operations }.encode()?));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(612), Object::Integer(792)],
    });

    let pages = doc.get_object_mut(pages_id)?.as_dict_mut()?;
    let count = pages.get(b"Count")?.as_i64()?;
    pages.get_mut(b"Kids")?.as_array_mut()?.push(Object::Reference(page_id));
    pages.set("Count", Object::Integer(count + 1));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), Object::Integer(12)]),
                Operation::new("Td", vec![Object::Integer(72), Object::Integer(700)]),
                Operation::new("Tj", vec![Object::string_literal("Contact jdoe@crs.loc.gov or 7-1234.")]),
                Operation::new(
                    "TJ",
                    vec![Object::Array(vec![
                        Object::string_literal("Jane"),
                        Object::Integer(-250),
                        Object::string_literal("Doe"),
                    ])],
                ),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let link_id = doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Link",
            "A" => dictionary! { "S" => "URI", "URI" => Object::string_literal("mailto:jdoe@crs.loc.gov") },
        });
        let web_link = dictionary! {
            "Type" => "Annot",
            "Subtype" => "Link",
            "A" => dictionary! { "S" => "URI", "URI" => Object::string_literal("https://www.congress.gov") },
        };
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(612), Object::Integer(792)],
            "Annots" => vec![Object::Reference(link_id), Object::Dictionary(web_link)],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => Object::Integer(1),
            }),
        );
        let xmp_id = doc.add_object(Stream::new(dictionary! {"Type" => "Metadata"}, b"<x:xmpmeta>Jane Doe</x:xmpmeta>".to_vec()));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
            "Metadata" => xmp_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Author" => Object::string_literal("Jane Doe"),
            "Keywords" => Object::string_literal("internal"),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn meta(date: NaiveDate) -> PdfMetadata<'static> {
        PdfMetadata {
            title: "Farm Bill Primer",
            date,
            modified: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(3, 4, 5)
                .unwrap(),
        }
    }

    fn page_text(doc: &Document, page_id: ObjectId) -> String {
        let content = Content::decode(&doc.get_page_content(page_id).unwrap()).unwrap();
        let mut out = String::new();
        for op in content.operations {
            for operand in op.operands {
                match operand {
                    Object::String(bytes, _) => out.push_str(&String::from_utf8_lossy(&bytes)),
                    Object::Array(items) => {
                        for item in items {
                            if let Object::String(bytes, _) = item {
                                out.push_str(&String::from_utf8_lossy(&bytes));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        out
    }

    #[test]
    fn redacts_text_metadata_links_and_appends_page() {
        let rules = ScrubRules::new(&["Jane Doe".to_string()]).unwrap();
        let date = NaiveDate::from_ymd_opt(2016, 5, 1).unwrap();
        let out = redact_pdf(&sample_pdf(), &meta(date), &rules).unwrap();

        let doc = Document::load_mem(&out).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);

        let first = page_text(&doc, pages[&1]);
        assert!(!first.contains("jdoe@crs.loc.gov"));
        assert!(!first.contains("7-1234"));
        assert!(!first.contains("Jane"));
        assert!(first.contains("[redacted]@crs.loc"));
        assert!(first.contains("7-...."));
        assert!(first.contains("(name redacted)"));
        assert!(page_text(&doc, pages[&2]).contains("EveryCRSReport.com"));

        let info_id = doc.trailer.get(b"Info").unwrap().as_reference().unwrap();
        let info = doc.get_dictionary(info_id).unwrap();
        assert_eq!(info.get(b"Author").unwrap().as_str().unwrap(), AUTHOR.as_bytes());
        assert_eq!(info.get(b"Title").unwrap().as_str().unwrap(), b"Farm Bill Primer");
        assert_eq!(info.get(b"CreationDate").unwrap().as_str().unwrap(), b"D:20160501000000Z");
        assert!(info.get(b"Keywords").is_err());
        assert!(doc.catalog().unwrap().get(b"Metadata").is_err());

        let annots = doc.get_dictionary(pages[&1]).unwrap().get(b"Annots").unwrap().as_array().unwrap();
        assert_eq!(annots.len(), 1);

        assert!(!out.windows(4).any(|w| w == b"Jane"));
    }

    #[test]
    fn old_documents_fall_back_to_pass_through() {
        let rules = ScrubRules::default();
        let garbage = b"not a pdf at all".to_vec();

        let old = NaiveDate::from_ymd_opt(2001, 6, 1).unwrap();
        let cutoff = NaiveDate::from_ymd_opt(2003, 1, 1).unwrap();
        let outcome = redact_pdf_or_pass_through(&garbage, &meta(old), &rules, cutoff).unwrap();
        assert_eq!(outcome, PdfOutcome::PassedThrough(garbage.clone()));

        let recent = NaiveDate::from_ymd_opt(2010, 6, 1).unwrap();
        assert!(redact_pdf_or_pass_through(&garbage, &meta(recent), &rules, cutoff).is_err());
    }

    #[test]
    fn passed_through_documents_still_get_the_trailer_page() {
        let original = single_page_pdf(vec![Operation::new("Tj", vec![Object::string_literal("Jane Doe 7-1234")])]);
        let out = pass_through(&original);

        let doc = Document::load_mem(&out).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);
        assert!(page_text(&doc, pages[&1]).contains("Jane Doe 7-1234"));
        assert!(page_text(&doc, pages[&2]).contains("EveryCRSReport.com"));
    }

    fn single_page_pdf(shown: Vec<Operation>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), Object::Integer(12)]),
            Operation::new("Td", vec![Object::Integer(72), Object::Integer(700)]),
        ];
        operations.extend(shown);
        operations.push(Operation::new("ET", vec![]));
        let content_id = doc.add_object(Stream::new(dictionary! {}, Content { operations }.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(612), Object::Integer(792)],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => Object::Integer(1),
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn first_page_operations(pdf: &[u8]) -> Vec<Operation> {
        let doc = Document::load_mem(pdf).unwrap();
        let page_id = doc.get_pages()[&1];
        Content::decode(&doc.get_page_content(page_id).unwrap())
            .unwrap()
            .operations
    }

    #[test]
    fn matches_split_across_operators_are_redacted() {
        let rules = ScrubRules::new(&["Jane Doe".to_string()]).unwrap();
        let pdf = single_page_pdf(vec![
            Operation::new("Tj", vec![Object::string_literal("By Jane")]),
            Operation::new("Tj", vec![Object::string_literal(" Doe, jdoe")]),
            Operation::new("Tj", vec![Object::string_literal("@crs.loc.gov")]),
        ]);
        let date = NaiveDate::from_ymd_opt(2016, 5, 1).unwrap();
        let out = redact_pdf(&pdf, &meta(date), &rules).unwrap();

        let doc = Document::load_mem(&out).unwrap();
        let text = page_text(&doc, doc.get_pages()[&1]);
        assert_eq!(text, "By (name redacted), [redacted]@crs.loc.gov");
    }

    #[test]
    fn kerning_survives_in_changed_tj_arrays() {
        let rules = ScrubRules::default();
        let pdf = single_page_pdf(vec![Operation::new(
            "TJ",
            vec![Object::Array(vec![
                Object::string_literal("Call 7-"),
                Object::Integer(-120),
                Object::string_literal("1234"),
                Object::Integer(-250),
                Object::string_literal(" today"),
            ])],
        )]);
        let date = NaiveDate::from_ymd_opt(2016, 5, 1).unwrap();
        let out = redact_pdf(&pdf, &meta(date), &rules).unwrap();

        let operations = first_page_operations(&out);
        let tj = operations.iter().find(|op| op.operator == "TJ").unwrap();
        let Some(Object::Array(items)) = tj.operands.first() else {
            panic!("TJ without array operand");
        };
        let kerns: Vec<i64> = items
            .iter()
            .filter_map(|item| match item {
                Object::Integer(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(kerns, vec![-120, -250]);
        let strings: Vec<String> = items
            .iter()
            .filter_map(|item| match item {
                Object::String(bytes, _) => Some(String::from_utf8_lossy(bytes).into_owned()),
                _ => None,
            })
            .collect();
        assert_eq!(strings, vec!["Call 7-....", "", " today"]);
    }
}
