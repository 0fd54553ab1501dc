//! Library scanner: discover documents that still need parsing.
//!
//! A candidate has a best-PDF attachment and no existing parsed note (a
//! child note whose title carries the pipeline's marker prefix). Libraries
//! can hold tens of thousands of documents, so the scan walks them in
//! bounded chunks and yields between chunks to keep the host event loop
//! responsive.

use crate::error::ParseError;
use crate::pipeline::NOTE_TITLE_PREFIX;
use crate::store::{AttachmentRef, DocKind, DocumentRef, DocumentStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Documents examined per chunk before yielding control.
const DEFAULT_CHUNK_SIZE: usize = 400;

/// One document found to need parsing.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub document: DocumentRef,
    pub source: AttachmentRef,
    pub kind: DocKind,
}

/// Per-kind candidate counts — reporting only, never pipeline behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub journal: usize,
    pub conference: usize,
    pub thesis: usize,
    pub book: usize,
    pub other: usize,
}

impl KindCounts {
    fn bump(&mut self, kind: DocKind) {
        match kind {
            DocKind::Journal => self.journal += 1,
            DocKind::Conference => self.conference += 1,
            DocKind::Thesis => self.thesis += 1,
            DocKind::Book => self.book += 1,
            DocKind::Other => self.other += 1,
        }
    }
}

/// Result of one full library scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Documents examined, including non-candidates.
    pub scanned: usize,
    pub candidates: Vec<ScanCandidate>,
    pub kinds: KindCounts,
}

/// Walks the library looking for parse candidates.
pub struct LibraryScanner {
    store: Arc<dyn DocumentStore>,
    chunk_size: usize,
}

impl LibraryScanner {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the chunk size (tests use small chunks).
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }

    /// Scan the whole library.
    pub async fn scan(&self) -> Result<ScanReport, ParseError> {
        let documents = self.store.all_documents().await?;
        info!("Scanning {} documents for parse candidates", documents.len());
        let mut report = ScanReport::default();

        for chunk in documents.chunks(self.chunk_size) {
            for doc in chunk {
                report.scanned += 1;

                let Some(source) = self.store.best_pdf_attachment(doc).await? else {
                    continue;
                };
                let notes = self.store.list_notes(doc).await?;
                if notes.iter().any(|n| n.title.starts_with(NOTE_TITLE_PREFIX)) {
                    continue;
                }

                let kind = DocKind::classify(&doc.item_type);
                report.kinds.bump(kind);
                report.candidates.push(ScanCandidate {
                    document: doc.clone(),
                    source,
                    kind,
                });
            }
            debug!(
                "Scan progress: {}/{} documents",
                report.scanned,
                documents.len()
            );
            // Cooperative yield between chunks.
            tokio::task::yield_now().await;
        }

        info!(
            "Scan complete: {} candidates of {} documents",
            report.candidates.len(),
            report.scanned
        );
        Ok(report)
    }
}
