//! Derived artifacts: thumbnails, plain-text fallbacks, version diffs and ePub packages.
//!
//! Generators are pure functions of their inputs. Deciding whether an artifact is
//! stale is left to the caller (see `ecr_storage::cache`).

use std::path::PathBuf;

use thiserror::Error;

pub mod diff;
pub mod epub;
pub mod layout;
pub mod text;
pub mod thumbnail;

pub const CRATE_NAME: &str = "ecr-artifacts";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{0} is not a stored file name with the expected extension")]
    UnexpectedFilename(String),
    #[error("PDF: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("text extraction failed: {0}")]
    Extract(String),
    #[error("ePub packaging: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("{program} exited with {status}")]
    Command { program: String, status: String },
    #[error("expected output {0} was not produced")]
    MissingOutput(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Swap the extension of a stored file name, e.g. `files/x.pdf` -> `files/x.png`.
pub fn sibling_filename(filename: &str, from: &str, to: &str) -> Result<String, ArtifactError> {
    filename
        .strip_suffix(from)
        .map(|stem| format!("{stem}{to}"))
        .ok_or_else(|| ArtifactError::UnexpectedFilename(filename.to_string()))
}
