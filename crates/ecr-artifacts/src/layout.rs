//! Rebuild readable HTML from a PDF's text layout when no HTML rendition exists.
//!
//! Lines are classified by font size relative to the dominant body size: much larger
//! text becomes a heading, slightly larger or short bold lines a subheading, and
//! small text a footnote. Footnotes are collected at the end of the document.

use std::collections::HashMap;

use ecr_redact::markup::{render_html, Element, Node};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::ArtifactError;

const HEADING_RATIO: f32 = 1.3;
const SUBHEADING_RATIO: f32 = 1.1;
const FOOTNOTE_RATIO: f32 = 0.85;
/// Vertical gap, in multiples of the font size, that still counts as the next line
/// of the same paragraph.
const LINE_GAP_RATIO: f32 = 1.6;
const SHORT_LINE: usize = 80;
/// TJ adjustments (thousandths of an em) wide enough to stand for a word space.
const KERN_SPACE: f32 = -200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Heading,
    Subheading,
    Paragraph,
    Footnote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
}

#[derive(Debug, Clone)]
struct Line {
    text: String,
    size: f32,
    bold: bool,
    paragraph_start: bool,
}

fn resolve_dict<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match object {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn is_bold_font(base_font: &[u8]) -> bool {
    let name = String::from_utf8_lossy(base_font).to_ascii_lowercase();
    ["bold", "black", "heavy", "semibold"].iter().any(|w| name.contains(w))
}

/// Resource name -> whether the font is a bold face.
fn page_fonts(doc: &Document, page_id: ObjectId) -> HashMap<Vec<u8>, bool> {
    let mut fonts = HashMap::new();
    let font_dict = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|page| page.get(b"Resources").ok())
        .and_then(|resources| resolve_dict(doc, resources))
        .and_then(|resources| resources.get(b"Font").ok())
        .and_then(|fonts| resolve_dict(doc, fonts));
    let Some(font_dict) = font_dict else {
        return fonts;
    };
    for (name, font) in font_dict.iter() {
        let bold = resolve_dict(doc, font)
            .and_then(|font| font.get(b"BaseFont").ok())
            .and_then(|base| base.as_name().ok())
            .is_some_and(is_bold_font);
        fonts.insert(name.clone(), bold);
    }
    fonts
}

/// Single-byte strings only. Runs that are mostly control bytes are CID-encoded
/// glyph ids and carry no recoverable text.
fn decode_run(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let control = bytes
        .iter()
        .filter(|b| **b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r'))
        .count();
    if control * 2 > bytes.len() {
        return None;
    }
    Some(bytes.iter().map(|b| char::from(*b)).collect())
}

fn operand_f32(op: &Operation, index: usize) -> Option<f32> {
    op.operands.get(index).and_then(|o| o.as_float().ok())
}

struct PageReader<'a> {
    fonts: &'a HashMap<Vec<u8>, bool>,
    lines: Vec<Line>,
    font_size: f32,
    scale: f32,
    leading: Option<f32>,
    bold: bool,
    y: f32,
    last_y: Option<f32>,
    moved: bool,
}

impl<'a> PageReader<'a> {
    fn new(fonts: &'a HashMap<Vec<u8>, bool>) -> Self {
        Self {
            fonts,
            lines: Vec::new(),
            font_size: 12.0,
            scale: 1.0,
            leading: None,
            bold: false,
            y: 0.0,
            last_y: None,
            moved: false,
        }
    }

    fn effective_size(&self) -> f32 {
        self.font_size * self.scale
    }

    fn next_line(&mut self) {
        let leading = self.leading.unwrap_or(self.font_size * 1.2);
        self.y -= leading * self.scale;
        self.moved = true;
    }

    fn apply(&mut self, op: &Operation) {
        match op.operator.as_str() {
            "BT" => {
                self.scale = 1.0;
                self.y = 0.0;
            }
            "Tf" => {
                if let Some(name) = op.operands.first().and_then(|o| o.as_name().ok()) {
                    self.bold = self.fonts.get(name).copied().unwrap_or(false);
                }
                if let Some(size) = operand_f32(op, 1) {
                    self.font_size = size.abs();
                }
            }
            "TL" => self.leading = operand_f32(op, 0),
            "Td" | "TD" => {
                if let Some(ty) = operand_f32(op, 1) {
                    self.y += ty * self.scale;
                    if op.operator == "TD" {
                        self.leading = Some(-ty);
                    }
                }
                self.moved = true;
            }
            "Tm" => {
                if let Some(d) = operand_f32(op, 3) {
                    self.scale = if d == 0.0 { 1.0 } else { d.abs() };
                }
                if let Some(f) = operand_f32(op, 5) {
                    self.y = f;
                }
                self.moved = true;
            }
            "T*" => self.next_line(),
            "Tj" => self.show_strings(op.operands.first()),
            "'" => {
                self.next_line();
                self.show_strings(op.operands.first());
            }
            "\"" => {
                self.next_line();
                self.show_strings(op.operands.get(2));
            }
            "TJ" => self.show_strings(op.operands.first()),
            _ => {}
        }
    }

    fn show_strings(&mut self, operand: Option<&Object>) {
        let mut text = String::new();
        match operand {
            Some(Object::String(bytes, _)) => text.extend(decode_run(bytes)),
            Some(Object::Array(items)) => {
                for item in items {
                    match item {
                        Object::String(bytes, _) => text.extend(decode_run(bytes)),
                        other => {
                            if other.as_float().is_ok_and(|kern| kern < KERN_SPACE) {
                                text.push(' ');
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        if !text.trim().is_empty() {
            self.push_text(text);
        }
    }

    fn push_text(&mut self, text: String) {
        let size = self.effective_size();
        let gap = self.last_y.map(|last| last - self.y);
        self.last_y = Some(self.y);
        let moved = std::mem::take(&mut self.moved);

        if let (Some(gap), Some(line)) = (gap, self.lines.last_mut()) {
            if gap.abs() <= size * 0.5 {
                if moved && !line.text.ends_with(char::is_whitespace) && !text.starts_with(char::is_whitespace) {
                    line.text.push(' ');
                }
                line.text.push_str(&text);
                line.bold &= self.bold;
                return;
            }
        }
        let paragraph_start = !matches!(gap, Some(gap) if gap > 0.0 && gap <= size * LINE_GAP_RATIO);
        self.lines.push(Line {
            text,
            size,
            bold: self.bold,
            paragraph_start,
        });
    }
}

fn body_size(lines: &[Line]) -> f32 {
    let mut weights: HashMap<i32, usize> = HashMap::new();
    for line in lines {
        *weights.entry((line.size * 2.0).round() as i32).or_default() += line.text.chars().count();
    }
    weights
        .into_iter()
        .max_by_key(|(key, weight)| (*weight, -*key))
        .map(|(key, _)| key as f32 / 2.0)
        .unwrap_or(12.0)
}

fn classify(line: &Line, body: f32) -> BlockKind {
    if line.size >= body * HEADING_RATIO {
        BlockKind::Heading
    } else if line.size < body * FOOTNOTE_RATIO {
        BlockKind::Footnote
    } else if line.size >= body * SUBHEADING_RATIO
        || (line.bold && line.text.trim().chars().count() <= SHORT_LINE)
    {
        BlockKind::Subheading
    } else {
        BlockKind::Paragraph
    }
}

fn join_line(block: &mut String, line: &str) {
    let line = line.trim();
    if block.ends_with('-') {
        block.pop();
    } else {
        block.push(' ');
    }
    block.push_str(line);
}

fn group_lines(lines: &[Line]) -> Vec<Block> {
    let body = body_size(lines);
    let mut blocks: Vec<Block> = Vec::new();
    for line in lines {
        let kind = classify(line, body);
        match blocks.last_mut() {
            Some(block) if block.kind == kind && !line.paragraph_start => join_line(&mut block.text, &line.text),
            _ => blocks.push(Block {
                kind,
                text: line.text.trim().to_string(),
            }),
        }
    }
    blocks
}

pub fn reconstruct_blocks(pdf: &[u8]) -> Result<Vec<Block>, ArtifactError> {
    let doc = Document::load_mem(pdf)?;
    let mut lines = Vec::new();
    for page_id in doc.get_pages().into_values() {
        let fonts = page_fonts(&doc, page_id);
        let content = Content::decode(&doc.get_page_content(page_id)?)?;
        let mut reader = PageReader::new(&fonts);
        for op in &content.operations {
            reader.apply(op);
        }
        if let Some(first) = reader.lines.first_mut() {
            first.paragraph_start = true;
        }
        lines.extend(reader.lines);
    }
    Ok(group_lines(&lines))
}

fn text_element(name: &str, text: &str) -> Node {
    let mut el = Element::new(name);
    el.children.push(Node::Text(text.to_string()));
    Node::Element(el)
}

pub fn blocks_to_nodes(blocks: &[Block]) -> Vec<Node> {
    let mut nodes = Vec::new();
    let mut footnotes = Element::new("div");
    footnotes.set_attr("class", "footnotes");
    for block in blocks {
        match block.kind {
            BlockKind::Heading => nodes.push(text_element("h2", &block.text)),
            BlockKind::Subheading => nodes.push(text_element("h3", &block.text)),
            BlockKind::Paragraph => nodes.push(text_element("p", &block.text)),
            BlockKind::Footnote => footnotes.children.push(text_element("p", &block.text)),
        }
    }
    if !footnotes.children.is_empty() {
        nodes.push(Node::Element(footnotes));
    }
    nodes
}

pub fn reconstruct_html(pdf: &[u8]) -> Result<String, ArtifactError> {
    let blocks = reconstruct_blocks(pdf)?;
    Ok(render_html(&blocks_to_nodes(&blocks)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::{dictionary, Stream};

    fn line(font: &str, size: i64, y: i64, text: &str) -> Vec<Operation> {
        vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![font.into(), Object::Integer(size)]),
            Operation::new(
                "Tm",
                [1, 0, 0, 1, 72, y].into_iter().map(Object::Integer).collect(),
            ),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ]
    }

    pub(crate) fn layout_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let regular = doc.add_object(dictionary! {
            "Type" => "Font", "Subtype" => "Type1", "BaseFont" => "Helvetica",
        });
        let bold = doc.add_object(dictionary! {
            "Type" => "Font", "Subtype" => "Type1", "BaseFont" => "Helvetica-Bold",
        });
        let resources = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => regular, "F2" => bold },
        });
        let operations = [
            line("F2", 18, 720, "Farm Bill Primer"),
            line("F1", 10, 690, "The farm bill sets policy for"),
            line("F1", 10, 678, "agriculture and nutrition programs."),
            line("F2", 10, 650, "Background"),
            line("F1", 10, 636, "Congress reauthorizes it every five years."),
            line("F1", 7, 100, "1 See the 2018 act."),
        ]
        .concat();
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources,
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
        let catalog = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn classifies_lines_by_relative_font_size() {
        let blocks = reconstruct_blocks(&layout_pdf()).unwrap();
        let kinds: Vec<_> = blocks.iter().map(|b| (b.kind, b.text.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (BlockKind::Heading, "Farm Bill Primer"),
                (
                    BlockKind::Paragraph,
                    "The farm bill sets policy for agriculture and nutrition programs."
                ),
                (BlockKind::Subheading, "Background"),
                (BlockKind::Paragraph, "Congress reauthorizes it every five years."),
                (BlockKind::Footnote, "1 See the 2018 act."),
            ]
        );
    }

    #[test]
    fn footnotes_are_moved_to_the_end() {
        let html = reconstruct_html(&layout_pdf()).unwrap();
        assert!(html.starts_with("<h2>Farm Bill Primer</h2><p>The farm bill"));
        assert!(html.ends_with("<div class=\"footnotes\"><p>1 See the 2018 act.</p></div>"));
    }

    #[test]
    fn control_byte_runs_are_ignored() {
        assert_eq!(decode_run(&[0, 3, 0, 4]), None);
        assert_eq!(decode_run(b"caf\xe9").as_deref(), Some("café"));
    }

    #[test]
    fn hyphenated_line_breaks_are_joined() {
        let mut block = String::from("agri-");
        join_line(&mut block, "culture ");
        assert_eq!(block, "agriculture");
    }
}
