//! Image import: move the bundle's extracted images into the note as
//! embedded attachments and rewrite the markup to reference them.
//!
//! Two phases over the scanned [`ImageTask`] list:
//!
//! * **read** — parallel filesystem reads at bounded concurrency; a file
//!   that cannot be read is logged and dropped from the import, nothing
//!   more.
//! * **import** — strictly sequential attachment creation. The embedding
//!   call mutates the owning note and is not safe to run concurrently.
//!
//! The markup rewrite is one combined regex pass: a single alternation of
//! all matched sources, so cost is linear in markup size rather than image
//! count.

use crate::error::ParseError;
use crate::store::{DocumentStore, NoteRef};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One referenced image, from markup scan to imported attachment.
#[derive(Debug, Clone)]
pub struct ImageTask {
    /// The `src` value exactly as it appears in the markup.
    pub original: String,
    /// Percent-decoded form of `original`.
    pub decoded: String,
    /// Resolved absolute path on disk.
    pub path: PathBuf,
    /// File contents once the read phase has run.
    pub bytes: Option<Vec<u8>>,
    /// Media type inferred from the extension.
    pub media_type: &'static str,
}

/// Outcome of one import batch. A non-empty `failed` list is a partial
/// success: the note still exists with the images that resolved.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub total: usize,
    pub succeeded: usize,
    /// Original `src` strings that could not be read or imported.
    pub failed: Vec<String>,
    /// Original `src` → new attachment identifier.
    pub mapping: HashMap<String, String>,
}

static RE_IMG_SRC: Lazy<Regex> = Lazy::new(|| Regex::new(r#"src="([^"]+)""#).unwrap());

/// Minimal percent-decoding for image paths emitted by the remote service
/// (spaces and CJK file names arrive percent-encoded).
fn percent_decode(input: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn media_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Scan the markup for local image references, resolving each against
/// `base_dir` (the directory holding the Markdown file — bundle image paths
/// are relative to it).
///
/// Remote URLs and data URIs are left alone — only paths the bundle shipped
/// are importable.
pub fn scan_markup(markup: &str, base_dir: &Path) -> Vec<ImageTask> {
    let mut tasks = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for caps in RE_IMG_SRC.captures_iter(markup) {
        let original = caps[1].to_string();
        if original.starts_with("http://")
            || original.starts_with("https://")
            || original.starts_with("data:")
        {
            continue;
        }
        if !seen.insert(original.clone()) {
            continue;
        }
        let decoded = percent_decode(&original);
        let path = if Path::new(&decoded).is_absolute() {
            PathBuf::from(&decoded)
        } else {
            base_dir.join(&decoded)
        };
        let media_type = media_type_for(&path);
        tasks.push(ImageTask {
            original,
            decoded,
            path,
            bytes: None,
            media_type,
        });
    }
    tasks
}

/// Read phase: load every task's bytes at bounded concurrency.
async fn read_images(tasks: Vec<ImageTask>, concurrency: usize) -> Vec<ImageTask> {
    stream::iter(tasks.into_iter().map(|mut task| async move {
        match tokio::fs::read(&task.path).await {
            Ok(bytes) => {
                task.bytes = Some(bytes);
                task
            }
            Err(e) => {
                warn!("Failed to read image {}: {e}", task.path.display());
                task
            }
        }
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await
}

/// Run both phases and return the report.
pub async fn import_images(
    store: &dyn DocumentStore,
    note: &NoteRef,
    tasks: Vec<ImageTask>,
    concurrency: usize,
) -> Result<ImportReport, ParseError> {
    let total = tasks.len();
    let loaded = read_images(tasks, concurrency).await;

    let mut report = ImportReport {
        total,
        ..Default::default()
    };

    // Import phase stays sequential against the owning note.
    for task in loaded {
        let Some(bytes) = task.bytes else {
            report.failed.push(task.original);
            continue;
        };
        let name = task
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| task.decoded.clone());
        match store.import_image(note, &name, bytes, task.media_type).await {
            Ok(id) => {
                report.mapping.insert(task.original, id);
                report.succeeded += 1;
            }
            Err(e) => {
                warn!("Failed to import image {}: {e}", task.path.display());
                report.failed.push(task.original);
            }
        }
    }

    debug!(
        "Image import: {}/{} succeeded, {} failed",
        report.succeeded,
        report.total,
        report.failed.len()
    );
    Ok(report)
}

/// Rewrite every imported `src` reference to its attachment identifier in a
/// single pass.
pub fn rewrite_markup(markup: &str, mapping: &HashMap<String, String>) -> String {
    if mapping.is_empty() {
        return markup.to_string();
    }
    let mut sources: Vec<&String> = mapping.keys().collect();
    // Longest first, so a source that prefixes another cannot shadow it.
    sources.sort_by_key(|s| std::cmp::Reverse(s.len()));
    let alternation = sources
        .iter()
        .map(|s| regex::escape(s))
        .collect::<Vec<_>>()
        .join("|");
    let combined = match Regex::new(&format!("src=\"({alternation})\"")) {
        Ok(re) => re,
        Err(e) => {
            warn!("Combined rewrite regex failed to build: {e}");
            return markup.to_string();
        }
    };
    combined
        .replace_all(markup, |caps: &regex::Captures<'_>| {
            let key = &mapping[&caps[1]];
            format!("data-attachment-key=\"{key}\"")
        })
        .into_owned()
}
