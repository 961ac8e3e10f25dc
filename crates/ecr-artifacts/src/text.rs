//! Plain-text rendition for versions published only as PDF.

use ecr_redact::markup::escape_text;

use crate::{sibling_filename, ArtifactError};

pub fn text_fallback_filename(pdf_filename: &str) -> Result<String, ArtifactError> {
    sibling_filename(pdf_filename, ".pdf", ".text.html")
}

/// Extract raw text and wrap it in a minimal container that pages can style.
pub fn text_fallback_html(pdf: &[u8]) -> Result<String, ArtifactError> {
    let text = pdf_extract::extract_text_from_mem(pdf).map_err(|e| ArtifactError::Extract(e.to_string()))?;
    Ok(wrap_text(&text))
}

fn wrap_text(text: &str) -> String {
    let mut out = String::from("<div class=\"pdf-text\"><pre>");
    escape_text(text.trim(), &mut out);
    out.push_str("</pre></div>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_and_escapes_text() {
        assert_eq!(
            wrap_text("\n  A < B & C\n"),
            "<div class=\"pdf-text\"><pre>A &lt; B &amp; C</pre></div>"
        );
        assert_eq!(text_fallback_filename("files/x.pdf").unwrap(), "files/x.text.html");
    }

    #[test]
    fn garbage_input_is_reported() {
        assert!(matches!(text_fallback_html(b"not a pdf"), Err(ArtifactError::Extract(_))));
    }
}
