//! Text patterns for personal contact data, shared by the HTML and PDF transforms.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

use crate::RedactError;

pub const EMAIL_MARKER: &str = "[email address scrubbed]";
pub const PHONE_MARKER: &str = "[phone number scrubbed]";
pub const AUTHOR_MARKER: &str = "[author name scrubbed]";

pub const PDF_REDACTED: &str = "[redacted]";
pub const PDF_NAME_REDACTED: &str = "(name redacted)";

const LOCAL_PART: &str = r"[a-zA-Z0-9_!#$%&'*+\-/=?^`{|}~]+";

struct Patterns {
    email: Regex,
    extension: Regex,
    phone: Regex,
    pdf_email: Regex,
    pdf_extension: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        email: Regex::new(&format!(r"{LOCAL_PART}@crs\.(loc\.)?gov")).expect("static regex"),
        // A preceding digit would make this a year range like 2007-2009.
        extension: Regex::new(r"(^|[^\d])7-\d{4}").expect("static regex"),
        phone: Regex::new(r"\(\d{3}\) \d{3}-\d{4}").expect("static regex"),
        pdf_email: Regex::new(&format!(r"{LOCAL_PART}(@crs.?(loc|gov))")).expect("static regex"),
        pdf_extension: Regex::new(r"((^|[^\d])7-)\d{4}").expect("static regex"),
    })
}

/// The read-only ruleset handed to every redaction task.
#[derive(Debug, Clone, Default)]
pub struct ScrubRules {
    html_names: Option<Regex>,
    pdf_names: Option<Regex>,
}

impl ScrubRules {
    /// Names are matched as escaped literals, longest first so a full name wins
    /// over a shorter variant of it. HTML matching tolerates any run of whitespace
    /// between name parts (names wrapped across source lines); PDF matching a
    /// missing or extra whitespace character.
    pub fn new(author_names: &[String]) -> Result<Self, RedactError> {
        let mut names: Vec<&str> = author_names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Ok(Self::default());
        }
        names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        names.dedup();

        Ok(Self {
            html_names: Some(Regex::new(&name_alternation(&names, r"\s*"))?),
            pdf_names: Some(Regex::new(&name_alternation(&names, r"\s?"))?),
        })
    }

    pub fn scrub_html_text<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let p = patterns();
        let mut out = Cow::Borrowed(text);
        replace(&mut out, &p.email, EMAIL_MARKER);
        replace(&mut out, &p.extension, &format!("${{1}}{PHONE_MARKER}"));
        replace(&mut out, &p.phone, PHONE_MARKER);
        if let Some(names) = &self.html_names {
            replace(&mut out, names, AUTHOR_MARKER);
        }
        out
    }

    /// Ordered pattern and replacement-template pairs for PDF text. Each pattern
    /// runs over the output of the one before it.
    ///
    /// PDF replacements are short ASCII so they render in whatever font the page uses.
    pub fn pdf_rules(&self) -> Vec<(&Regex, String)> {
        let p = patterns();
        let mut rules = vec![
            (&p.pdf_extension, "${1}....".to_string()),
            (&p.phone, PDF_REDACTED.to_string()),
            (&p.pdf_email, format!("{PDF_REDACTED}${{1}}")),
        ];
        if let Some(names) = &self.pdf_names {
            rules.push((names, PDF_NAME_REDACTED.to_string()));
        }
        rules
    }

    pub fn scrub_pdf_text<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for (re, with) in self.pdf_rules() {
            replace(&mut out, re, &with);
        }
        out
    }
}

/// Name parts are split on single spaces and rejoined with `gap`.
fn name_alternation(names: &[&str], gap: &str) -> String {
    names
        .iter()
        .map(|n| {
            n.split(' ')
                .filter(|part| !part.is_empty())
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(gap)
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn replace(text: &mut Cow<'_, str>, re: &Regex, with: &str) {
    let replaced = match re.replace_all(text.as_ref(), with) {
        Cow::Owned(replaced) => replaced,
        Cow::Borrowed(_) => return,
    };
    *text = Cow::Owned(replaced);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ScrubRules {
        ScrubRules::new(&["Jane Doe".to_string(), "J. Jane Doe".to_string()]).unwrap()
    }

    #[test]
    fn html_scrub_replaces_every_category() {
        let text = "7-1234 or Jane Doe, jdoe@crs.loc.gov, (202) 555-0100, x7-5678; J. Jane Doe";
        let out = rules().scrub_html_text(text);
        assert_eq!(
            out,
            "[phone number scrubbed] or [author name scrubbed], [email address scrubbed], \
             [phone number scrubbed], x[phone number scrubbed]; [author name scrubbed]"
        );
    }

    #[test]
    fn year_ranges_and_other_domains_survive() {
        let text = "FY2007-2009 budget, contact press@example.gov";
        assert!(matches!(rules().scrub_html_text(text), Cow::Borrowed(_)));
    }

    #[test]
    fn pdf_scrub_uses_short_markers_and_tolerates_broken_names() {
        let out = rules().scrub_pdf_text("JaneDoe 7-1234 jdoe@crs.gov");
        assert_eq!(out, "(name redacted) 7-.... [redacted]@crs.gov");
    }

    #[test]
    fn html_names_wrapped_across_lines_are_scrubbed() {
        let out = rules().scrub_html_text("Prepared by Jane\n   Doe and JaneDoe.");
        assert_eq!(out, "Prepared by [author name scrubbed] and [author name scrubbed].");
    }

    #[test]
    fn empty_vocabulary_matches_no_names() {
        let rules = ScrubRules::new(&[String::new()]).unwrap();
        assert_eq!(rules.scrub_html_text("Anyone at all"), "Anyone at all");
    }
}
