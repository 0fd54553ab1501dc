//! Parse identity: the fingerprint of one parse attempt and the cache
//! sidecar record it is matched against.
//!
//! A [`ParseFingerprint`] is computed once per attempt and never mutated.
//! Cache matching is deliberately tolerant of missing metadata: a host that
//! cannot report file size or mtime must still get cache hits for the same
//! document/attachment pair, so optional fields only mismatch when *both*
//! sides carry a value and the values differ.

use crate::config::{ModelVariant, ParseConfig};
use crate::error::ParseError;
use crate::store::{AttachmentRef, DocumentRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// File name of the sidecar record inside each cache output directory.
pub const SIDECAR_FILE: &str = ".parse-cache.json";

/// Identity of a parse request, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFingerprint {
    /// Owning document identifier.
    pub document_id: String,
    /// Source attachment identifier.
    pub source_file_id: String,
    /// Source file byte size, when known.
    pub source_size: Option<u64>,
    /// Source file modification time (unix seconds), when known.
    pub source_mtime: Option<i64>,
    /// Requested model variant.
    pub model: Option<ModelVariant>,
    /// OCR flag at submission time.
    pub ocr: bool,
    /// Formula recognition flag.
    pub formula: bool,
    /// Table recognition flag.
    pub table: bool,
    /// Language hint.
    pub language: String,
    /// Page-range string, empty for all pages.
    pub page_ranges: String,
}

impl ParseFingerprint {
    /// Compute the fingerprint for one attempt.
    ///
    /// Size and mtime come from the attachment metadata when present, else
    /// from the file itself; a file that cannot be statted leaves them
    /// `None` rather than failing — the fingerprint must be computable for
    /// cache lookup even when the source has gone missing.
    pub fn compute(doc: &DocumentRef, source: &AttachmentRef, config: &ParseConfig) -> Self {
        let meta = std::fs::metadata(&source.path).ok();
        let source_size = source.size.or_else(|| meta.as_ref().map(|m| m.len()));
        let source_mtime = source.mtime.or_else(|| {
            meta.as_ref()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
        });
        Self {
            document_id: doc.id.clone(),
            source_file_id: source.id.clone(),
            source_size,
            source_mtime,
            model: Some(config.model),
            ocr: config.ocr,
            formula: config.formula,
            table: config.table,
            language: config.language.clone(),
            page_ranges: config.page_ranges.clone(),
        }
    }
}

/// Optional fields match when either side is absent.
fn tolerant_eq<T: PartialEq + Copy>(a: Option<T>, b: Option<T>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

/// Persisted per cache output directory, written after successful
/// extraction and read-only afterward.
///
/// Serialized with the sidecar's camelCase field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub document_id: String,
    pub source_file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_mtime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_variant: Option<ModelVariant>,
    /// Absolute path of the extracted Markdown file.
    pub markdown_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Opaque remote batch identifier of the submission that produced this
    /// entry, kept for support/debugging only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_request_id: Option<String>,
}

impl CacheEntry {
    /// Build the entry recorded after a successful extraction.
    pub fn from_fingerprint(
        fp: &ParseFingerprint,
        markdown_path: PathBuf,
        remote_request_id: Option<String>,
    ) -> Self {
        Self {
            document_id: fp.document_id.clone(),
            source_file_id: fp.source_file_id.clone(),
            source_file_size: fp.source_size,
            source_file_mtime: fp.source_mtime,
            model_variant: fp.model,
            markdown_path,
            created_at: Utc::now(),
            remote_request_id,
        }
    }

    /// Fingerprint equivalence: identity fields exact, size/mtime
    /// tolerant-optional, model variant exact only when both sides specify
    /// one.
    pub fn matches(&self, fp: &ParseFingerprint) -> bool {
        self.document_id == fp.document_id
            && self.source_file_id == fp.source_file_id
            && tolerant_eq(self.source_file_size, fp.source_size)
            && tolerant_eq(self.source_file_mtime, fp.source_mtime)
            && tolerant_eq(self.model_variant, fp.model)
    }

    /// Read the sidecar record from a cache output directory, if present
    /// and parseable.
    pub fn load(dir: &Path) -> Option<CacheEntry> {
        let path = dir.join(SIDECAR_FILE);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Ignoring unreadable cache record {}: {e}", path.display());
                None
            }
        }
    }

    /// Write the sidecar record into `dir`.
    ///
    /// Callers treat failure as non-fatal; see
    /// [`crate::cache::ResultCache::write`].
    pub fn write(&self, dir: &Path) -> Result<(), ParseError> {
        let path = dir.join(SIDECAR_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ParseError::Internal(format!("cache record serialize: {e}")))?;
        std::fs::write(&path, json).map_err(|e| ParseError::io(path, e))
    }
}
