//! Result cache: recognize an already-parsed document and skip the remote
//! round trip.
//!
//! The cache is a directory of extraction outputs, each carrying a JSON
//! sidecar record ([`crate::fingerprint::CacheEntry`]). It is an
//! optimization, not a durability guarantee: entries are append-mostly,
//! never garbage-collected, and a missing Markdown file simply turns the
//! entry into a miss. The cache root may be a shared temp directory, so the
//! scan only ever considers directories carrying the
//! [`CACHE_DIR_PREFIX`] namespace.
//!
//! [`CACHE_DIR_PREFIX`]: crate::config::CACHE_DIR_PREFIX

use crate::config::{ParseConfig, CACHE_DIR_PREFIX};
use crate::fingerprint::{CacheEntry, ParseFingerprint};
use crate::pipeline::markdown::{find_markdown_files, select_markdown_file};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// File name of the best-effort copy of the uploaded source, stored beside
/// the extraction. The no-sidecar fallback uses it as a same-size witness.
pub const ORIGIN_COPY: &str = "origin.pdf";

/// Lookup/write interface over one cache root directory.
#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
}

impl ResultCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache over the configured root (override or system temp).
    pub fn from_config(config: &ParseConfig) -> Self {
        Self::new(config.cache_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh output directory for one parse attempt.
    ///
    /// The name carries the namespace prefix and the source-file id so the
    /// no-sidecar fallback can still associate the directory with its
    /// source.
    pub fn new_entry_dir(&self, fp: &ParseFingerprint) -> PathBuf {
        let suffix = Uuid::new_v4().simple().to_string();
        self.root.join(format!(
            "{CACHE_DIR_PREFIX}{}-{}",
            fp.source_file_id,
            &suffix[..12]
        ))
    }

    /// Find the newest valid cached Markdown for `fp`, if any.
    ///
    /// Candidates are validated in place: fingerprint equivalence, then the
    /// Markdown file's existence. Orphaned entries are skipped, never
    /// deleted — scanning continues so an older valid entry still hits.
    pub fn lookup(&self, fp: &ParseFingerprint) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.root).ok()?;
        let mut best: Option<(DateTime<Utc>, PathBuf)> = None;

        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(CACHE_DIR_PREFIX) || !path.is_dir() {
                continue;
            }

            let candidate = match CacheEntry::load(&path) {
                Some(record) => Self::validate_record(&path, &record, fp),
                None => Self::fallback_probe(&path, &name, fp),
            };

            if let Some((stamp, md)) = candidate {
                let newer = best
                    .as_ref()
                    .map(|(best_stamp, _)| stamp > *best_stamp)
                    .unwrap_or(true);
                if newer {
                    best = Some((stamp, md));
                }
            }
        }

        if let Some((_, ref md)) = best {
            debug!("Cache hit for {}: {}", fp.source_file_id, md.display());
        }
        best.map(|(_, md)| md)
    }

    /// Sidecar path: equivalence + markdown existence.
    fn validate_record(
        dir: &Path,
        record: &CacheEntry,
        fp: &ParseFingerprint,
    ) -> Option<(DateTime<Utc>, PathBuf)> {
        if !record.matches(fp) {
            return None;
        }
        if !record.markdown_path.is_file() {
            debug!(
                "Skipping orphaned cache entry {} (markdown gone)",
                dir.display()
            );
            return None;
        }
        Some((record.created_at, record.markdown_path.clone()))
    }

    /// No sidecar: fall back to the directory-naming convention plus a
    /// same-size check against the origin copy, then walk for any `.md`.
    fn fallback_probe(
        dir: &Path,
        dir_name: &str,
        fp: &ParseFingerprint,
    ) -> Option<(DateTime<Utc>, PathBuf)> {
        let convention = format!("{CACHE_DIR_PREFIX}{}-", fp.source_file_id);
        if !dir_name.starts_with(&convention) {
            return None;
        }
        if let Some(expected) = fp.source_size {
            let origin_size = std::fs::metadata(dir.join(ORIGIN_COPY)).ok().map(|m| m.len());
            if origin_size.is_some_and(|actual| actual != expected) {
                return None;
            }
        }
        let md = select_markdown_file(&find_markdown_files(dir))?;
        let stamp = std::fs::metadata(dir)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Some((stamp, md))
    }

    /// Record a successful extraction. Best-effort: a failed write is
    /// logged and swallowed — the parse result itself is already on disk.
    pub fn write(&self, dir: &Path, entry: &CacheEntry) {
        if let Err(e) = entry.write(dir) {
            warn!("Failed to write cache record in {}: {e}", dir.display());
        }
    }
}
