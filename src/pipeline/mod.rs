//! The per-document parse pipeline.
//!
//! One [`ParsePipeline::parse`] call drives the whole state machine:
//!
//! ```text
//! fingerprint ──▶ cache check ──▶ (hit)  import ──▶ done
//!                     │
//!                     └─(miss)▶ upload ──▶ poll ──▶ download ──▶ extract ──▶ import ──▶ done
//! ```
//!
//! Stages run strictly forward; `error` and `cancelled` absorb from any
//! non-terminal stage. Cancellation is checked before and after every
//! blocking operation through the [`ParseCallbacks`] contract, and every
//! failure propagates as `Err` — the pipeline never half-succeeds silently.
//!
//! Two ordering decisions matter for crash behavior: on a cache hit the
//! destination note is created *before* images are imported, so a failed
//! import still leaves a visible note; on a cache miss the sidecar record is
//! written immediately after extraction and *before* import, so a failed
//! import leaves the remote result cached and the next call resumes without
//! re-uploading.

pub mod archive;
pub mod images;
pub mod markdown;

use crate::cache::{ResultCache, ORIGIN_COPY};
use crate::config::{ParseConfig, MAX_UPLOAD_BYTES};
use crate::error::ParseError;
use crate::fingerprint::{CacheEntry, ParseFingerprint};
use crate::progress::{ParseCallbacks, ParseStage};
use crate::remote::{poll_until_done, RemoteJob, RemoteParser};
use crate::store::{AttachmentRef, DocumentRef, DocumentStore, MarkupConverter, NoteRef};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Marker prefix on every note this pipeline creates. The scanner keys off
/// it to recognise already-parsed documents.
pub const NOTE_TITLE_PREFIX: &str = "PDF Parse";

/// All collaborators of one pipeline instance, injected once.
pub struct ParsePipeline {
    config: ParseConfig,
    remote: Arc<dyn RemoteParser>,
    store: Arc<dyn DocumentStore>,
    converter: Arc<dyn MarkupConverter>,
    cache: ResultCache,
}

fn check_cancel(callbacks: &dyn ParseCallbacks) -> Result<(), ParseError> {
    if callbacks.should_cancel() {
        Err(ParseError::Cancelled)
    } else {
        Ok(())
    }
}

impl ParsePipeline {
    pub fn new(
        config: ParseConfig,
        remote: Arc<dyn RemoteParser>,
        store: Arc<dyn DocumentStore>,
        converter: Arc<dyn MarkupConverter>,
    ) -> Self {
        let cache = ResultCache::from_config(&config);
        Self {
            config,
            remote,
            store,
            converter,
            cache,
        }
    }

    pub fn config(&self) -> &ParseConfig {
        &self.config
    }

    /// Parse one document's PDF into a child note.
    ///
    /// `force` skips the cache lookup (a fresh remote parse) but still
    /// records the new result. Fails with [`ParseError::Cancelled`] when
    /// the callbacks request cancellation at any checkpoint.
    pub async fn parse(
        &self,
        document: &DocumentRef,
        source: &AttachmentRef,
        force: bool,
        callbacks: &dyn ParseCallbacks,
    ) -> Result<NoteRef, ParseError> {
        let result = self.run(document, source, force, callbacks).await;
        match &result {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => {
                callbacks.on_status_change(ParseStage::Cancelled, ParseStage::Cancelled.label());
            }
            Err(e) => {
                callbacks.on_status_change(ParseStage::Error, &e.to_string());
            }
        }
        result
    }

    async fn run(
        &self,
        document: &DocumentRef,
        source: &AttachmentRef,
        force: bool,
        callbacks: &dyn ParseCallbacks,
    ) -> Result<NoteRef, ParseError> {
        let started = Instant::now();
        info!("Parsing '{}' ({})", document.title, source.filename);

        // ── Preconditions: fatal, never retried ──────────────────────────
        if self.config.token.is_none() {
            return Err(ParseError::MissingAuthToken);
        }
        if !self.converter.available() {
            return Err(ParseError::ConverterUnavailable);
        }
        let size = std::fs::metadata(&source.path)
            .map(|m| m.len())
            .map_err(|e| ParseError::io(&source.path, e))?;
        if size > MAX_UPLOAD_BYTES {
            return Err(ParseError::FileTooLarge {
                size,
                limit: MAX_UPLOAD_BYTES,
            });
        }
        check_cancel(callbacks)?;

        // Fingerprinting is instantaneous; no stage event is emitted for it.
        let fingerprint = ParseFingerprint::compute(document, source, &self.config);

        callbacks.on_status_change(ParseStage::CacheCheck, ParseStage::CacheCheck.label());
        callbacks.on_progress(3);
        let cached = if force {
            None
        } else {
            self.cache.lookup(&fingerprint)
        };

        let note = match cached {
            Some(markdown_path) => {
                // Cache hit: no remote contact at all. Import runs in a
                // compressed progress band since the slow phases are skipped.
                debug!("Cache hit, importing {}", markdown_path.display());
                check_cancel(callbacks)?;
                self.import_result(document, &markdown_path, callbacks, (40, 95))
                    .await?
            }
            None => {
                self.remote_parse(document, source, &fingerprint, callbacks)
                    .await?
            }
        };

        callbacks.on_progress(100);
        callbacks.on_status_change(ParseStage::Done, ParseStage::Done.label());
        info!(
            "Parsed '{}' in {}ms",
            document.title,
            started.elapsed().as_millis()
        );
        Ok(note)
    }

    /// Cache-miss path: upload, poll, download, extract, record, import.
    async fn remote_parse(
        &self,
        document: &DocumentRef,
        source: &AttachmentRef,
        fingerprint: &ParseFingerprint,
        callbacks: &dyn ParseCallbacks,
    ) -> Result<NoteRef, ParseError> {
        // ── Upload ───────────────────────────────────────────────────────
        callbacks.on_status_change(ParseStage::Uploading, ParseStage::Uploading.label());
        callbacks.on_progress(10);
        let bytes = tokio::fs::read(&source.path)
            .await
            .map_err(|e| ParseError::io(&source.path, e))?;
        check_cancel(callbacks)?;

        let correlation_id = Uuid::new_v4().to_string();
        let slot = self
            .remote
            .request_slot(&source.filename, &correlation_id, &self.config)
            .await?;
        callbacks.on_progress(20);
        check_cancel(callbacks)?;

        self.remote.upload(&slot.upload_url, bytes).await?;
        callbacks.on_progress(30);
        check_cancel(callbacks)?;

        // ── Poll until terminal ──────────────────────────────────────────
        let job = RemoteJob {
            upload_url: slot.upload_url,
            batch_id: slot.batch_id,
            correlation_id,
            file_name: source.filename.clone(),
        };
        let bundle_url = poll_until_done(self.remote.as_ref(), &job, &self.config, callbacks).await?;

        // ── Download ─────────────────────────────────────────────────────
        callbacks.on_status_change(ParseStage::Downloading, ParseStage::Downloading.label());
        callbacks.on_progress(70);
        let bundle = self.remote.download(&bundle_url).await?;
        check_cancel(callbacks)?;

        // ── Extract ──────────────────────────────────────────────────────
        callbacks.on_status_change(ParseStage::Extracting, ParseStage::Extracting.label());
        callbacks.on_progress(75);
        let out_dir = self.cache.new_entry_dir(fingerprint);
        let markdown_path = {
            let out_dir = out_dir.clone();
            tokio::task::spawn_blocking(move || archive::extract_bundle(&bundle, &out_dir))
                .await
                .map_err(|e| ParseError::Internal(format!("extraction task: {e}")))??
        };

        // Best-effort origin copy; the no-sidecar cache fallback uses it as
        // a same-size witness.
        if let Err(e) = std::fs::copy(&source.path, out_dir.join(ORIGIN_COPY)) {
            warn!("Could not store origin copy: {e}");
        }

        // Record the cache entry before import: a failed import must still
        // leave the remote result reusable.
        self.cache.write(
            &out_dir,
            &CacheEntry::from_fingerprint(
                fingerprint,
                markdown_path.clone(),
                Some(job.batch_id.clone()),
            ),
        );
        check_cancel(callbacks)?;

        self.import_result(document, &markdown_path, callbacks, (75, 99))
            .await
    }

    /// Shared tail of both paths: note creation, markup conversion, image
    /// import, body rewrite.
    ///
    /// `(lo, hi)` is the progress band this phase may occupy.
    async fn import_result(
        &self,
        document: &DocumentRef,
        markdown_path: &Path,
        callbacks: &dyn ParseCallbacks,
        (lo, hi): (u8, u8),
    ) -> Result<NoteRef, ParseError> {
        callbacks.on_status_change(ParseStage::Importing, ParseStage::Importing.label());
        callbacks.on_progress(lo);

        let raw = tokio::fs::read_to_string(markdown_path)
            .await
            .map_err(|e| ParseError::io(markdown_path, e))?;
        let trimmed = markdown::trim_preamble(&raw);
        check_cancel(callbacks)?;

        let markup = self.converter.markdown_to_markup(trimmed).await?;
        check_cancel(callbacks)?;

        // Create the note and persist the un-rewritten body first: a
        // partially failed image import still leaves a visible note.
        let title = format!("{NOTE_TITLE_PREFIX}: {}", document.title);
        let note = self.store.create_child_note(document, &title).await?;
        self.store.set_note_body(&note, &markup).await?;
        callbacks.on_progress(lo + (hi - lo) / 2);
        check_cancel(callbacks)?;

        let base_dir = markdown_path.parent().unwrap_or(Path::new("."));
        let tasks = images::scan_markup(&markup, base_dir);
        let report = images::import_images(
            self.store.as_ref(),
            &note,
            tasks,
            self.config.image_concurrency,
        )
        .await?;

        if !report.mapping.is_empty() {
            let rewritten = images::rewrite_markup(&markup, &report.mapping);
            self.store.set_note_body(&note, &rewritten).await?;
        }
        callbacks.on_progress(hi);

        if report.failed.is_empty() {
            debug!("Imported all {} images", report.total);
        } else {
            // Partial success: reported, never thrown.
            callbacks.on_status_change(
                ParseStage::Importing,
                &format!(
                    "Imported {} of {} images",
                    report.succeeded, report.total
                ),
            );
        }
        Ok(note)
    }
}

/// Where a parsed result would land, without parsing. Exposed for hosts
/// that want a dry-run display.
pub fn cache_probe(
    config: &ParseConfig,
    document: &DocumentRef,
    source: &AttachmentRef,
) -> Option<PathBuf> {
    let cache = ResultCache::from_config(config);
    let fp = ParseFingerprint::compute(document, source, config);
    cache.lookup(&fp)
}
