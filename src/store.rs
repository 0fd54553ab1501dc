//! External collaborators: the host document store and the markup converter.
//!
//! The pipeline never touches storage directly (except its own cache files).
//! Everything it needs from the host — child notes, note bodies, embedded
//! image attachments, the best PDF of a document — goes through the
//! [`DocumentStore`] trait, injected as an `Arc<dyn DocumentStore>`.
//! Markdown-to-rich-text conversion is likewise behind [`MarkupConverter`];
//! its unavailability is a fatal precondition, not something the pipeline
//! works around.
//!
//! [`MemoryStore`] is a complete in-process implementation used by the test
//! suite and the CLI demo path.

use crate::error::ParseError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Coarse document category, used only for scan reporting.
///
/// Resolved once when a task is created and stored on it; never re-derived
/// from a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    Journal,
    Conference,
    Thesis,
    Book,
    Other,
}

impl DocKind {
    /// Classify from the host item-type string.
    pub fn classify(item_type: &str) -> Self {
        match item_type {
            "journalArticle" => DocKind::Journal,
            "conferencePaper" => DocKind::Conference,
            "thesis" => DocKind::Thesis,
            "book" | "bookSection" => DocKind::Book,
            _ => DocKind::Other,
        }
    }
}

/// A document (item) in the host store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Stable identifier, unique within the library.
    pub id: String,
    /// Display title, used for note naming and log lines.
    pub title: String,
    /// Host item-type string, e.g. "journalArticle".
    pub item_type: String,
}

/// A file attachment of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Stable attachment identifier.
    pub id: String,
    /// Absolute path of the attachment file on disk.
    pub path: PathBuf,
    /// File name as shown in the host, e.g. "paper.pdf".
    pub filename: String,
    /// Byte size, when the host knows it.
    pub size: Option<u64>,
    /// Modification time (unix seconds), when the host knows it.
    pub mtime: Option<i64>,
}

/// A child note of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRef {
    pub id: String,
}

/// Title + id of an existing note, as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteMeta {
    pub id: String,
    pub title: String,
}

/// Host document store operations the pipeline and scanner rely on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create an empty child note under `doc` with the given title.
    async fn create_child_note(
        &self,
        doc: &DocumentRef,
        title: &str,
    ) -> Result<NoteRef, ParseError>;

    /// Replace the note body with `markup`.
    async fn set_note_body(&self, note: &NoteRef, markup: &str) -> Result<(), ParseError>;

    /// Read the note body.
    async fn get_note_body(&self, note: &NoteRef) -> Result<String, ParseError>;

    /// List the existing child notes of `doc`.
    async fn list_notes(&self, doc: &DocumentRef) -> Result<Vec<NoteMeta>, ParseError>;

    /// Import `bytes` as an embedded image attachment of `note`; returns the
    /// new attachment identifier referenced from the note markup.
    ///
    /// Not safe to call concurrently against the same note — the image
    /// importer keeps this phase sequential.
    async fn import_image(
        &self,
        note: &NoteRef,
        name: &str,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<String, ParseError>;

    /// The best PDF attachment of `doc`, if any.
    async fn best_pdf_attachment(
        &self,
        doc: &DocumentRef,
    ) -> Result<Option<AttachmentRef>, ParseError>;

    /// All documents in the library, for the scanner.
    async fn all_documents(&self) -> Result<Vec<DocumentRef>, ParseError>;
}

/// Markdown → rich-text markup conversion, provided by the host.
#[async_trait]
pub trait MarkupConverter: Send + Sync {
    /// Whether the converter can be used right now. The pipeline treats
    /// `false` as a fatal precondition.
    fn available(&self) -> bool;

    /// Convert Markdown text to the store's note markup.
    async fn markdown_to_markup(&self, markdown: &str) -> Result<String, ParseError>;
}

// ── In-memory implementation ─────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    documents: Vec<DocumentRef>,
    attachments: HashMap<String, Vec<AttachmentRef>>,
    notes: HashMap<String, Vec<NoteMeta>>,
    note_bodies: HashMap<String, String>,
    images: HashMap<String, (String, Vec<u8>)>,
}

/// In-process [`DocumentStore`] backed by hash maps.
///
/// Used by the test suite and the CLI demo path; real hosts provide their
/// own implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}{n}")
    }

    /// Register a document.
    pub fn add_document(&self, doc: DocumentRef) {
        self.inner.lock().unwrap().documents.push(doc);
    }

    /// Attach a file to a document.
    pub fn add_attachment(&self, doc_id: &str, att: AttachmentRef) {
        self.inner
            .lock()
            .unwrap()
            .attachments
            .entry(doc_id.to_string())
            .or_default()
            .push(att);
    }

    /// Number of embedded images imported so far (test observability).
    pub fn image_count(&self) -> usize {
        self.inner.lock().unwrap().images.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_child_note(
        &self,
        doc: &DocumentRef,
        title: &str,
    ) -> Result<NoteRef, ParseError> {
        let id = self.fresh_id("note-");
        let mut inner = self.inner.lock().unwrap();
        inner
            .notes
            .entry(doc.id.clone())
            .or_default()
            .push(NoteMeta {
                id: id.clone(),
                title: title.to_string(),
            });
        inner.note_bodies.insert(id.clone(), String::new());
        Ok(NoteRef { id })
    }

    async fn set_note_body(&self, note: &NoteRef, markup: &str) -> Result<(), ParseError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.note_bodies.get_mut(&note.id) {
            Some(body) => {
                *body = markup.to_string();
                Ok(())
            }
            None => Err(ParseError::Store(format!("no such note: {}", note.id))),
        }
    }

    async fn get_note_body(&self, note: &NoteRef) -> Result<String, ParseError> {
        self.inner
            .lock()
            .unwrap()
            .note_bodies
            .get(&note.id)
            .cloned()
            .ok_or_else(|| ParseError::Store(format!("no such note: {}", note.id)))
    }

    async fn list_notes(&self, doc: &DocumentRef) -> Result<Vec<NoteMeta>, ParseError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .notes
            .get(&doc.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn import_image(
        &self,
        note: &NoteRef,
        name: &str,
        bytes: Vec<u8>,
        _media_type: &str,
    ) -> Result<String, ParseError> {
        if !self.inner.lock().unwrap().note_bodies.contains_key(&note.id) {
            return Err(ParseError::Store(format!("no such note: {}", note.id)));
        }
        let id = self.fresh_id("img-");
        self.inner
            .lock()
            .unwrap()
            .images
            .insert(id.clone(), (name.to_string(), bytes));
        Ok(id)
    }

    async fn best_pdf_attachment(
        &self,
        doc: &DocumentRef,
    ) -> Result<Option<AttachmentRef>, ParseError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .attachments
            .get(&doc.id)
            .and_then(|atts| {
                atts.iter()
                    .find(|a| a.filename.to_ascii_lowercase().ends_with(".pdf"))
                    .cloned()
            }))
    }

    async fn all_documents(&self) -> Result<Vec<DocumentRef>, ParseError> {
        Ok(self.inner.lock().unwrap().documents.clone())
    }
}

/// A [`MarkupConverter`] that passes Markdown through unchanged.
///
/// Useful in tests and the CLI, where the note body stays Markdown.
pub struct IdentityConverter {
    available: bool,
}

impl IdentityConverter {
    pub fn new() -> Self {
        Self { available: true }
    }

    /// An intentionally unavailable converter, for precondition tests.
    pub fn unavailable() -> Self {
        Self { available: false }
    }
}

impl Default for IdentityConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarkupConverter for IdentityConverter {
    fn available(&self) -> bool {
        self.available
    }

    async fn markdown_to_markup(&self, markdown: &str) -> Result<String, ParseError> {
        Ok(markdown.to_string())
    }
}
