//! Adapter phase: read every raw metadata snapshot of every enabled source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ecr_adapters::{
    adapter_for_source, Adapted, AdaptedVersion, AdapterContext, AuthorVocabulary, RawRecord, WithholdList,
    DOCUMENTS_DIR,
};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::SourceRegistry;

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub records: usize,
    pub adapted: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Adapter output in processing order, plus what later phases need to find the
/// referenced files again.
#[derive(Debug, Default)]
pub struct Ingested {
    pub versions: Vec<AdaptedVersion>,
    pub vocabulary: AuthorVocabulary,
    /// Stored filename -> raw directory it is relative to.
    pub file_roots: HashMap<String, PathBuf>,
    pub summary: IngestSummary,
}

impl Ingested {
    pub fn input_path(&self, filename: &str) -> Option<PathBuf> {
        self.file_roots.get(filename).map(|root| root.join(filename))
    }

    fn record_roots(&mut self, version: &AdaptedVersion, raw_dir: &Path) {
        for format in &version.version.formats {
            self.file_roots
                .entry(format.filename.clone())
                .or_insert_with(|| raw_dir.to_path_buf());
            for stored in format.images.iter().flat_map(|images| images.values()) {
                self.file_roots
                    .entry(stored.clone())
                    .or_insert_with(|| raw_dir.to_path_buf());
            }
        }
    }
}

async fn raw_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "source has no documents directory");
            return Ok(files);
        }
        Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Sources run in registry order and files in name order, so the first-seen
/// version of a day is stable from run to run.
pub async fn run_adapters(incoming: &Path, registry: &SourceRegistry, withheld: &WithholdList) -> Result<Ingested> {
    if !fs::try_exists(incoming)
        .await
        .with_context(|| format!("checking {}", incoming.display()))?
    {
        bail!("incoming directory {} does not exist", incoming.display());
    }

    let mut out = Ingested::default();
    for source in registry.enabled() {
        let adapter = adapter_for_source(&source.source_id)
            .with_context(|| format!("no adapter registered for {}", source.source_id))?;
        let raw_dir = incoming.join(&source.raw_dir);
        let ctx = AdapterContext::new(&raw_dir, withheld.clone());
        let files = raw_files(&raw_dir.join(DOCUMENTS_DIR), adapter.raw_extension()).await?;
        info!(source = %source.source_id, files = files.len(), "running adapter");

        for path in files {
            out.summary.records += 1;
            let raw = match RawRecord::read(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    out.summary.failed += 1;
                    warn!(path = %path.display(), error = %format!("{err:#}"), "skipping record that could not be read");
                    continue;
                }
            };
            match adapter.adapt(&raw, &ctx).await {
                Ok(Adapted::Version(version)) => {
                    out.summary.adapted += 1;
                    out.vocabulary.extend(&version.authors);
                    out.record_roots(&version, &raw_dir);
                    out.versions.push(version);
                }
                Ok(Adapted::Skip(reason)) => {
                    out.summary.dropped += 1;
                    if reason.is_expected() {
                        debug!(path = %path.display(), ?reason, "dropped");
                    } else {
                        warn!(path = %path.display(), ?reason, "skipping record of unknown type");
                    }
                }
                Err(err) if err.is_fatal() => {
                    return Err(err).with_context(|| format!("adapting {}", path.display()));
                }
                Err(err) => {
                    out.summary.failed += 1;
                    warn!(path = %path.display(), error = %err, "skipping unreadable record");
                }
            }
        }
    }
    info!(
        records = out.summary.records,
        adapted = out.summary.adapted,
        dropped = out.summary.dropped,
        failed = out.summary.failed,
        "adapter phase complete"
    );
    Ok(out)
}
