//! # pdf2note
//!
//! Turn PDF documents into structured rich-text notes by delegating
//! OCR/layout extraction to a remote parsing service.
//!
//! ## Why this crate?
//!
//! Local text extraction fails on scanned papers and complex layouts, and
//! running layout models locally is heavy. Instead this crate uploads the
//! PDF to a parsing service, polls until the service has produced a Markdown
//! + images bundle, and assembles that bundle into a child note of the
//! owning document — with a content-fingerprint cache so the same PDF is
//! never parsed remotely twice.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Fingerprint  document + file + model configuration
//!  ├─ 2. Cache        hit? skip the remote service entirely
//!  ├─ 3. Upload       request slot, PUT binary
//!  ├─ 4. Poll         queued / running / converting → done | failed
//!  ├─ 5. Download     result bundle (zip: markdown + images)
//!  ├─ 6. Extract      zip-slip-safe expansion, markdown selection
//!  └─ 7. Import       markup conversion, embedded images, note body
//! ```
//!
//! Many parses run under [`batch::BatchQueue`], a concurrency-bounded task
//! queue with pause/stop/retry; [`scanner::LibraryScanner`] finds documents
//! that still need parsing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2note::{
//!     HttpRemoteClient, IdentityConverter, NoopCallbacks, ParseConfig, ParsePipeline,
//!     MemoryStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ParseConfig::builder().token("sk-...").build()?;
//!     let remote = Arc::new(HttpRemoteClient::new(&config)?);
//!     let store = Arc::new(MemoryStore::new());
//!     let converter = Arc::new(IdentityConverter::new());
//!     let pipeline = ParsePipeline::new(config, remote, store.clone(), converter);
//!
//!     # let (document, attachment) = unimplemented!();
//!     let note = pipeline.parse(&document, &attachment, false, &NoopCallbacks).await?;
//!     println!("created note {}", note.id);
//!     Ok(())
//! }
//! ```
//!
//! ## External collaborators
//!
//! The host document store and its Markdown→markup converter are trait
//! seams ([`DocumentStore`], [`MarkupConverter`]); this crate never touches
//! storage directly except for its own cache directory.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod scanner;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{AddOutcome, BatchQueue, ParseTask, QueueStatus, TaskStatus};
pub use cache::ResultCache;
pub use config::{ModelVariant, ParseConfig, ParseConfigBuilder, MAX_UPLOAD_BYTES};
pub use error::ParseError;
pub use fingerprint::{CacheEntry, ParseFingerprint};
pub use pipeline::images::ImportReport;
pub use pipeline::{ParsePipeline, NOTE_TITLE_PREFIX};
pub use progress::{Callbacks, NoopCallbacks, ParseCallbacks, ParseStage};
pub use remote::{HttpRemoteClient, RemoteFileResult, RemoteJob, RemoteParser, RemoteState, UploadSlot};
pub use scanner::{LibraryScanner, ScanCandidate, ScanReport};
pub use store::{
    AttachmentRef, DocKind, DocumentRef, DocumentStore, IdentityConverter, MarkupConverter,
    MemoryStore, NoteMeta, NoteRef,
};
