//! Word-level diffs between adjacent HTML versions of a report.

use std::sync::OnceLock;

use ecr_core::{FormatKind, Report};
use regex::Regex;
use similar::{DiffTag, TextDiff};

use crate::{sibling_filename, ArtifactError};

pub const DIFFS_DIR: &str = "diffs";

/// An (older, newer) pair of HTML files that differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffPair {
    pub previous: String,
    pub current: String,
}

impl DiffPair {
    pub fn output_filename(&self) -> Result<String, ArtifactError> {
        diff_filename(&self.previous, &self.current)
    }
}

/// Adjacent HTML versions, oldest first. Identical filenames mean identical content.
pub fn diff_pairs(report: &Report) -> Vec<DiffPair> {
    let mut pairs = Vec::new();
    let mut previous: Option<&str> = None;
    for version in report.versions.iter().rev() {
        let Some(html) = version.format(FormatKind::Html) else {
            continue;
        };
        if html.derived_from.is_some() {
            continue;
        }
        if let Some(prev) = previous {
            if prev != html.filename {
                pairs.push(DiffPair {
                    previous: prev.to_string(),
                    current: html.filename.clone(),
                });
            }
        }
        previous = Some(&html.filename);
    }
    pairs
}

fn basename(filename: &str) -> &str {
    filename.rsplit('/').next().unwrap_or(filename)
}

pub fn diff_filename(previous: &str, current: &str) -> Result<String, ArtifactError> {
    let prev_stem = basename(previous)
        .strip_suffix(".html")
        .ok_or_else(|| ArtifactError::UnexpectedFilename(previous.to_string()))?;
    let current = basename(current);
    if !current.ends_with(".html") {
        return Err(ArtifactError::UnexpectedFilename(current.to_string()));
    }
    Ok(format!("{DIFFS_DIR}/{prev_stem}__{current}"))
}

/// Companion file holding the fraction of text that changed.
pub fn percent_filename(diff_filename: &str) -> Result<String, ArtifactError> {
    sibling_filename(diff_filename, ".html", "-pctchg.txt")
}

pub fn parse_percent(contents: &str) -> Option<f64> {
    contents.trim().parse::<f64>().ok().filter(|v| (0.0..=1.0).contains(v))
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionDiff {
    pub html: String,
    /// 0.0 for identical text, 1.0 for nothing in common.
    pub percent_changed: f64,
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]+>|[^<\s]+|\s+").expect("static token pattern"))
}

fn tokenize(html: &str) -> Vec<&str> {
    token_pattern().find_iter(html).map(|m| m.as_str()).collect()
}

fn is_tag(token: &str) -> bool {
    token.starts_with('<')
}

fn words<'a>(tokens: &[&'a str]) -> Vec<&'a str> {
    tokens
        .iter()
        .copied()
        .filter(|t| !is_tag(t) && !t.trim().is_empty())
        .collect()
}

/// Emit a run of tokens from one side, wrapping text in `marker` and keeping tags only
/// when `keep_tags` is set.
fn emit_run(tokens: &[&str], marker: &str, keep_tags: bool, out: &mut String) {
    let mut open = false;
    for token in tokens {
        if is_tag(token) {
            if open {
                out.push_str("</");
                out.push_str(marker);
                out.push('>');
                open = false;
            }
            if keep_tags {
                out.push_str(token);
            }
            continue;
        }
        if !open && token.trim().is_empty() {
            if keep_tags {
                out.push_str(token);
            }
            continue;
        }
        if !open {
            out.push('<');
            out.push_str(marker);
            out.push('>');
            open = true;
        }
        out.push_str(token);
    }
    if open {
        out.push_str("</");
        out.push_str(marker);
        out.push('>');
    }
}

/// Markup follows the newer version; removed text shows as `<del>`, added text as `<ins>`.
pub fn diff_html(previous: &str, current: &str) -> VersionDiff {
    let old = tokenize(previous);
    let new = tokenize(current);
    let diff = TextDiff::from_slices(&old, &new);

    let mut html = String::with_capacity(current.len());
    for op in diff.ops() {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        match tag {
            DiffTag::Equal => new[new_range].iter().for_each(|t| html.push_str(t)),
            DiffTag::Delete => emit_run(&old[old_range], "del", false, &mut html),
            DiffTag::Insert => emit_run(&new[new_range], "ins", true, &mut html),
            DiffTag::Replace => {
                emit_run(&old[old_range], "del", false, &mut html);
                emit_run(&new[new_range], "ins", true, &mut html);
            }
        }
    }

    let old_words = words(&old);
    let new_words = words(&new);
    let ratio = TextDiff::from_slices(&old_words, &new_words).ratio();
    VersionDiff {
        html,
        percent_changed: f64::from(1.0 - ratio).clamp(0.0, 1.0),
    }
}
