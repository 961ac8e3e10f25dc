//! Topic-area assignment from the curated vocabulary in `topic_areas.txt`.
//!
//! One area per line: `Name|term|*term`. The first field is the display name and
//! also a term. Plain terms match case-sensitively in the report text; `*` terms
//! match case-insensitively in the title and summary only.

use std::path::Path;

use anyhow::{Context, Result};
use ecr_core::{DocumentKind, Report};
use regex::Regex;
use tokio::fs;

pub const INSIGHTS_TOPIC: &str = "CRS Insights";

#[derive(Debug, Clone)]
struct Term {
    pattern: Regex,
    title_and_summary_only: bool,
}

#[derive(Debug, Clone)]
pub struct TopicArea {
    pub name: String,
    terms: Vec<Term>,
}

#[derive(Debug, Clone, Default)]
pub struct TopicAreas {
    areas: Vec<TopicArea>,
}

fn term_pattern(term: &str, case_insensitive: bool) -> Result<Regex> {
    let flags = if case_insensitive { "(?i)" } else { "" };
    Regex::new(&format!(r"{flags}\b{}\b", regex::escape(term)))
        .with_context(|| format!("building pattern for topic term {term:?}"))
}

impl TopicAreas {
    pub fn parse(text: &str) -> Result<Self> {
        let mut areas = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut terms = Vec::new();
            let mut name = None;
            for raw in line.split('|').map(str::trim).filter(|t| !t.is_empty()) {
                let (term, title_and_summary_only) = match raw.strip_prefix('*') {
                    Some(rest) => (rest.trim(), true),
                    None => (raw, false),
                };
                name.get_or_insert_with(|| term.to_string());
                terms.push(Term {
                    pattern: term_pattern(term, title_and_summary_only)?,
                    title_and_summary_only,
                });
            }
            if let Some(name) = name {
                areas.push(TopicArea { name, terms });
            }
        }
        Ok(Self { areas })
    }

    /// A missing vocabulary file means no topic areas.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text).with_context(|| format!("in {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Sorted topic names for the report. `text` is the newest HTML rendition's text;
    /// without it plain terms fall back to the title and summary.
    pub fn assign(&self, report: &Report, text: Option<&str>) -> Vec<String> {
        let Some(newest) = report.newest() else {
            return Vec::new();
        };
        let title_and_summary = format!("{}\n{}", newest.title, newest.summary.as_deref().unwrap_or_default());
        let body = text.unwrap_or(&title_and_summary);

        let mut topics: Vec<String> = self
            .areas
            .iter()
            .filter(|area| {
                area.terms.iter().any(|term| {
                    let haystack = if term.title_and_summary_only { &title_and_summary } else { body };
                    term.pattern.is_match(haystack)
                })
            })
            .map(|area| area.name.clone())
            .collect();
        if report.type_id == DocumentKind::Insight.type_id() {
            topics.push(INSIGHTS_TOPIC.to_string());
        }
        topics.sort();
        topics.dedup();
        topics
    }
}
