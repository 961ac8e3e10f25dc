//! Incremental build cache.
//!
//! Nothing here keeps a central dependency database. An artifact is current when its
//! output exists and, where the output name does not already embed a content hash,
//! a fingerprint recorded alongside it (an embedded `<meta>` tag or a `.src` sidecar)
//! matches the fingerprint of the current inputs.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;

pub const FINGERPRINT_META_NAME: &str = "source-content-hash";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("reading cache input {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing cache record {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Accumulates the semantic inputs of one artifact into a sha256 digest.
#[derive(Debug, Clone, Default)]
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.hasher.update(bytes);
        self
    }

    /// Mix in a dependency file (template, stylesheet, generator source).
    pub async fn file(self, path: &Path) -> Result<Self, CacheError> {
        let contents = fs::read(path).await.map_err(|source| CacheError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.bytes(&contents))
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

pub fn fingerprint_meta_tag(fingerprint: &str) -> String {
    format!("<meta name=\"{FINGERPRINT_META_NAME}\" content=\"{fingerprint}\" />")
}

pub fn embedded_fingerprint(html: &str) -> Option<&str> {
    static META: OnceLock<Regex> = OnceLock::new();
    let re = META.get_or_init(|| {
        Regex::new(r#"<meta name="source-content-hash" content="([^"]*)"\s*/?>"#)
            .expect("static regex")
    });
    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// True when `page` exists and carries `fingerprint` in its embedded meta tag.
pub async fn page_is_current(page: &Path, fingerprint: &str) -> Result<bool, CacheError> {
    match fs::read_to_string(page).await {
        Ok(html) => Ok(embedded_fingerprint(&html) == Some(fingerprint)),
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::InvalidData) => Ok(false),
        Err(source) => Err(CacheError::Read {
            path: page.to_path_buf(),
            source,
        }),
    }
}

/// Hash-bearing output names: existence alone proves the output is current.
pub async fn output_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".src");
    PathBuf::from(name)
}

/// True when `output` exists and its sidecar records exactly `identity`.
pub async fn sidecar_is_current(output: &Path, identity: &str) -> Result<bool, CacheError> {
    if !output_exists(output).await {
        return Ok(false);
    }
    let sidecar = sidecar_path(output);
    match fs::read_to_string(&sidecar).await {
        Ok(recorded) => Ok(recorded == identity),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(CacheError::Read {
            path: sidecar,
            source,
        }),
    }
}

pub async fn write_sidecar(output: &Path, identity: &str) -> Result<(), CacheError> {
    let sidecar = sidecar_path(output);
    fs::write(&sidecar, identity)
        .await
        .map_err(|source| CacheError::Write {
            path: sidecar,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fingerprint_changes_with_any_dependency() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("report.html");
        std::fs::write(&template, "v1").unwrap();

        let a = Fingerprint::new().bytes(b"{}").file(&template).await.unwrap().finish();
        let b = Fingerprint::new().bytes(b"{}").file(&template).await.unwrap().finish();
        std::fs::write(&template, "v2").unwrap();
        let c = Fingerprint::new().bytes(b"{}").file(&template).await.unwrap().finish();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Fingerprint::new().file(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn embedded_meta_round_trips_through_a_page() {
        let dir = tempdir().unwrap();
        let page = dir.path().join("R1.html");
        assert!(!page_is_current(&page, "abc").await.unwrap());

        let html = format!("<html><head>{}</head></html>", fingerprint_meta_tag("abc"));
        std::fs::write(&page, html).unwrap();
        assert_eq!(embedded_fingerprint(&std::fs::read_to_string(&page).unwrap()), Some("abc"));
        assert!(page_is_current(&page, "abc").await.unwrap());
        assert!(!page_is_current(&page, "abd").await.unwrap());
    }

    #[tokio::test]
    async fn sidecar_tracks_source_identity() {
        let dir = tempdir().unwrap();
        let epub = dir.path().join("R1.epub");
        assert_eq!(sidecar_path(&epub), dir.path().join("R1.epub.src"));

        assert!(!sidecar_is_current(&epub, "a.html|a.png").await.unwrap());
        std::fs::write(&epub, b"zip").unwrap();
        assert!(!sidecar_is_current(&epub, "a.html|a.png").await.unwrap());
        write_sidecar(&epub, "a.html|a.png").await.unwrap();
        assert!(sidecar_is_current(&epub, "a.html|a.png").await.unwrap());
        assert!(!sidecar_is_current(&epub, "b.html|a.png").await.unwrap());
    }
}
