//! Scraped report page -> publishable HTML fragment.
//!
//! The rewrite is one visitor pass over the parsed page that builds a new owned tree
//! (see [`crate::markup`]), followed by an allow-list sanitizer over that tree. Every
//! site-specific rule lives in [`Rewriter::visit`] so each one can be read in isolation.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node as DomNode, Selector};

use crate::markup::{render_html, Element, Node};
use crate::scrub::{ScrubRules, EMAIL_MARKER};
use crate::RedactError;

/// Known report containers, most specific layout first.
const CONTAINERS: &[&str] = &[r#"[class="Report"]"#, r#"#Insightsdiv > [class="ReportContent"]"#];

/// Some legacy pages embed a whole document inside the container; the real content
/// then sits in a blockquote.
const NESTED_DOCUMENT_MARKER: &str = r#"<div class="Report"><!DOCTYPE"#;

const ALLOWED_CLASSES: &[&str] = &["ReportHeader"];

pub const ALLOWED_TAGS: &[&str] = &[
    "a", "img", "b", "strong", "i", "em", "u", "sup", "sub", "span", "div", "p", "br", "ul", "ol",
    "li", "table", "thead", "tbody", "tr", "th", "td", "hr", "h1", "h2", "h3", "h4", "h5", "h6",
];

/// Disallowed elements whose content is not prose either; everything else
/// disallowed is unwrapped and its children kept.
const DROPPED_WITH_CONTENT: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "noscript", "template", "head", "title", "svg",
    "math", "form", "textarea", "select",
];

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn containers() -> &'static [Selector] {
    static SELECTORS: OnceLock<Vec<Selector>> = OnceLock::new();
    SELECTORS.get_or_init(|| CONTAINERS.iter().map(|css| selector(css)).collect())
}

fn report_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^http://www\.crs\.gov/Reports/([0-9A-Z-]+)$").expect("static regex")
    })
}

pub const PUBLISHED_REPORT_URL: &str = "https://www.everycrsreport.com/reports/$1.html";

/// Extract, rewrite, scrub and sanitize one scraped HTML page.
///
/// `images` maps image paths as they appear in the page to their stored paths.
pub fn clean_html(
    page: &str,
    images: Option<&BTreeMap<String, String>>,
    rules: &ScrubRules,
) -> Result<String, RedactError> {
    let doc = Html::parse_document(page);
    let container = containers()
        .iter()
        .find_map(|sel| doc.select(sel).next())
        .ok_or(RedactError::NoContentContainer)?;

    let nested = page.contains(NESTED_DOCUMENT_MARKER);
    let container = if nested {
        container
            .select(&selector("blockquote"))
            .next()
            .ok_or(RedactError::MissingBlockquote)?
    } else {
        container
    };

    let mut rewriter = Rewriter {
        rules,
        images,
        image_whitelist: HashSet::new(),
    };
    let Some(mut root) = rewriter.visit(container, false) else {
        return Err(RedactError::NoContentContainer);
    };
    if nested {
        root.name = "div".into();
    }

    let sanitized = sanitize(vec![Node::Element(root)], &rewriter.image_whitelist);
    Ok(render_html(&sanitized))
}

struct Rewriter<'a> {
    rules: &'a ScrubRules,
    images: Option<&'a BTreeMap<String, String>>,
    image_whitelist: HashSet<String>,
}

impl Rewriter<'_> {
    /// `None` drops the element and everything under it.
    fn visit(&mut self, el: ElementRef<'_>, in_report_header: bool) -> Option<Element> {
        let source = el.value();
        let classes: Vec<&str> = source
            .attr("class")
            .unwrap_or("")
            .split(' ')
            .filter(|c| !c.is_empty())
            .collect();
        let has_class = |name: &str| classes.contains(&name);

        let mut out = Element::new(source.name());
        out.attrs = source
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut is_title = has_class("Title");

        // Report headers keep only the title and cover date; the rest lists authors.
        if in_report_header {
            if is_title {
                out.name = "h1".into();
            } else if !has_class("CoverDate") {
                return None;
            }
        }
        if has_class("titleline") {
            out.name = "h1".into();
            is_title = true;
        }
        if has_class("authorline") {
            return None;
        }
        if out.name == "a" && el.text().collect::<String>().trim() == "Print Version" {
            return None;
        }

        if out
            .attr("href")
            .is_some_and(|href| href.to_ascii_lowercase().starts_with("mailto:"))
        {
            out.name = "span".into();
            out.remove_attr("href");
            filter_classes(&mut out);
            out.children = vec![Node::Text(EMAIL_MARKER.into())];
            return Some(out);
        }

        if out.name == "img" {
            let stored = out
                .attr("src")
                .and_then(|src| self.images.and_then(|images| images.get(src)))
                .map(|stored| format!("/{stored}"));
            if let Some(path) = stored {
                out.set_attr("src", path.clone());
                self.image_whitelist.insert(path);
            }
        }

        if out.name == "a" {
            if let Some(href) = out.attr("href") {
                let rewritten = report_link().replace(href, PUBLISHED_REPORT_URL).into_owned();
                out.set_attr("href", rewritten);
            }
        }

        // Pages already have their own h1.
        if let Some(level) = heading_level(&out.name) {
            if level <= 5 && !is_title {
                out.name = format!("h{}", level + 1);
            }
        }
        for class in &classes {
            if let Some(level) = class
                .strip_prefix("Heading")
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| (1..=5).contains(n))
            {
                out.name = format!("h{}", level + 1);
            }
            if *class == "SummaryHeading" {
                out.name = "h2".into();
            }
        }

        filter_classes(&mut out);

        let header = has_class("ReportHeader");
        for child in el.children() {
            match child.value() {
                DomNode::Text(text) => {
                    let scrubbed = self.rules.scrub_html_text(text);
                    out.children.push(Node::Text(scrubbed.into_owned()));
                }
                DomNode::Element(_) => {
                    if let Some(child) = ElementRef::wrap(child).and_then(|c| self.visit(c, header)) {
                        out.children.push(Node::Element(child));
                    }
                }
                _ => {}
            }
        }
        Some(out)
    }
}

fn heading_level(name: &str) -> Option<u8> {
    name.strip_prefix('h')
        .and_then(|n| n.parse::<u8>().ok())
        .filter(|n| (1..=6).contains(n))
}

fn filter_classes(el: &mut Element) {
    let Some(class) = el.attr("class") else {
        return;
    };
    let mut kept: Vec<&str> = class
        .split(' ')
        .filter(|c| ALLOWED_CLASSES.contains(c))
        .collect();
    kept.sort_unstable();
    kept.dedup();
    if kept.is_empty() {
        el.remove_attr("class");
    } else {
        let joined = kept.join(" ");
        el.set_attr("class", joined);
    }
}

fn attribute_allowed(tag: &str, name: &str, value: &str, images: &HashSet<String>) -> bool {
    let web = value.starts_with("http:") || value.starts_with("https:");
    match (tag, name) {
        (_, "title" | "class") => true,
        ("a", "name") => true,
        ("a", "href") => web || value.starts_with('#'),
        ("img", "src") => web || images.contains(value),
        ("td" | "th", "colspan" | "rowspan") => true,
        _ => false,
    }
}

/// Strict allow-list pass. Disallowed markup is dropped, never escaped into text.
pub fn sanitize(nodes: Vec<Node>, image_whitelist: &HashSet<String>) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Text(text) => out.push(Node::Text(text)),
            Node::Element(mut el) => {
                if DROPPED_WITH_CONTENT.contains(&el.name.as_str()) {
                    continue;
                }
                let children = sanitize(std::mem::take(&mut el.children), image_whitelist);
                if !ALLOWED_TAGS.contains(&el.name.as_str()) {
                    out.extend(children);
                    continue;
                }
                let tag = el.name.clone();
                el.attrs
                    .retain(|(name, value)| attribute_allowed(&tag, name, value, image_whitelist));
                el.children = children;
                out.push(Node::Element(el));
            }
        }
    }
    out
}
