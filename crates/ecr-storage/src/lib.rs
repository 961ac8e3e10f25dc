//! Content-addressed artifact storage, atomic writes and output-tree housekeeping.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub mod cache;

pub const CRATE_NAME: &str = "ecr-storage";

/// Directory (relative to a store root) holding every content-addressed file.
pub const FILES_DIR: &str = "files";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

impl StoredArtifact {
    /// Relative path with forward slashes, the form recorded in report JSON.
    pub fn filename(&self) -> String {
        to_slash(&self.relative_path)
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(&self, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(FILES_DIR).join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    /// Submitting bytes that are already stored is a no-op.
    pub async fn store_bytes(&self, extension: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(&content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        match write_new_atomic(&absolute_path, bytes).await? {
            true => Ok(stored(false)),
            false => Ok(stored(true)),
        }
    }

    /// Read a file from outside the store and content-address it.
    pub async fn ingest_file(&self, source: &Path, extension: &str) -> anyhow::Result<StoredArtifact> {
        let bytes = fs::read(source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;
        self.store_bytes(extension, &bytes).await
    }
}

pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn temp_path_for(path: &Path, len: usize) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    Ok(parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), len)))
}

async fn write_temp(path: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let temp_path = temp_path_for(path, bytes.len())?;
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    Ok(temp_path)
}

/// Returns `false` when another writer got there first.
async fn write_new_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = write_temp(path, bytes).await?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

/// Write `bytes` to `path` through a temp file so readers never see a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = write_temp(path, bytes).await?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}

/// Rewrite `path` only when its content differs. Returns whether a write happened.
pub async fn write_if_changed(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    match fs::read(path).await {
        Ok(existing) if existing == bytes => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    }
    write_atomic(path, bytes).await?;
    Ok(true)
}

/// Hard-link `src` to `dst`, replacing a `dst` that is a different file and falling
/// back to a copy across filesystems. Returns `false` when `dst` already was `src`.
pub async fn link_or_copy(src: &Path, dst: &Path) -> anyhow::Result<bool> {
    if let Ok(existing) = fs::metadata(dst).await {
        let source = fs::metadata(src)
            .await
            .with_context(|| format!("stat {}", src.display()))?;
        if same_file(&source, &existing) {
            return Ok(false);
        }
        fs::remove_file(dst)
            .await
            .with_context(|| format!("removing stale link {}", dst.display()))?;
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    if let Err(err) = fs::hard_link(src, dst).await {
        debug!(src = %src.display(), dst = %dst.display(), error = %err, "hard link failed; copying");
        fs::copy(src, dst)
            .await
            .with_context(|| format!("copying {} -> {}", src.display(), dst.display()))?;
    }
    Ok(true)
}

#[cfg(unix)]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_a: &std::fs::Metadata, _b: &std::fs::Metadata) -> bool {
    false
}

/// Delete every regular file directly inside `dir` whose path is not in `keep`.
/// Hidden temp files from interrupted writes are removed too.
pub async fn remove_orphans(dir: &Path, keep: &HashSet<PathBuf>) -> anyhow::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(removed),
        Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        if !file_type.is_file() || keep.contains(&path) {
            continue;
        }
        info!(path = %path.display(), "deleting orphaned file");
        fs::remove_file(&path)
            .await
            .with_context(|| format!("deleting {}", path.display()))?;
        removed.push(path);
    }
    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn same_content_under_different_names_maps_to_one_path() {
        let dir = tempdir().expect("tempdir");
        let incoming = dir.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(incoming.join("first.pdf"), b"%PDF-1.4 same").unwrap();
        std::fs::write(incoming.join("renamed copy.pdf"), b"%PDF-1.4 same").unwrap();

        let store = ArtifactStore::new(dir.path().join("reports"));
        let first = store
            .ingest_file(&incoming.join("first.pdf"), "pdf")
            .await
            .expect("first store");
        let modified = std::fs::metadata(&first.absolute_path).unwrap().modified().unwrap();
        let second = store
            .ingest_file(&incoming.join("renamed copy.pdf"), "pdf")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert_eq!(first.filename(), format!("files/{}.pdf", first.content_hash));
        assert_eq!(
            std::fs::metadata(&second.absolute_path).unwrap().modified().unwrap(),
            modified
        );
        let stored: Vec<_> = std::fs::read_dir(dir.path().join("reports/files"))
            .unwrap()
            .collect();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn write_if_changed_skips_identical_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reports/R1.json");
        assert!(write_if_changed(&path, b"{}").await.unwrap());
        assert!(!write_if_changed(&path, b"{}").await.unwrap());
        assert!(write_if_changed(&path, b"{\"a\":1}").await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn orphans_outside_keep_set_are_removed() {
        let dir = tempdir().expect("tempdir");
        let keep_path = dir.path().join("R1.json");
        let orphan = dir.path().join("R2.json");
        std::fs::write(&keep_path, b"{}").unwrap();
        std::fs::write(&orphan, b"{}").unwrap();

        let keep = HashSet::from([keep_path.clone()]);
        let removed = remove_orphans(dir.path(), &keep).await.unwrap();
        assert_eq!(removed, vec![orphan.clone()]);
        assert!(keep_path.exists());
        assert!(!orphan.exists());
        assert!(remove_orphans(&dir.path().join("missing"), &keep)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn linking_twice_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("img.png");
        std::fs::write(&src, b"png").unwrap();
        let dst = dir.path().join("out/files/img.png");
        assert!(link_or_copy(&src, &dst).await.unwrap());
        assert!(!link_or_copy(&src, &dst).await.unwrap());
        assert_eq!(std::fs::read(&dst).unwrap(), b"png");
    }
}
