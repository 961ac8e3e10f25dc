//! Redaction & sanitization of published report files.
//!
//! Both transforms are pure: the same input bytes and the same [`ScrubRules`] always
//! produce the same output, so callers may cache by the input's content-addressed name.

use thiserror::Error;

pub mod html;
pub mod markup;
pub mod pdf;
pub mod scrub;

pub use html::clean_html;
pub use pdf::{redact_pdf, redact_pdf_or_pass_through, PdfMetadata, PdfOutcome};
pub use scrub::ScrubRules;

pub const CRATE_NAME: &str = "ecr-redact";

#[derive(Debug, Error)]
pub enum RedactError {
    #[error("HTML page doesn't contain an element that we know to pull body content from")]
    NoContentContainer,
    #[error("HTML page with an embedded document has no blockquote")]
    MissingBlockquote,
    #[error("PDF: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("author name pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
