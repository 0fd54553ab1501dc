//! Error types for the pdf2note library.
//!
//! One fatal error type, [`ParseError`], covers the whole pipeline. Its
//! variants fall into the groups callers actually branch on:
//!
//! * **Precondition** — the parse cannot start at all (missing token,
//!   oversized file, converter unavailable). Never retried automatically.
//! * **Remote** — the parsing service misbehaved (malformed response, upload
//!   rejected, remote-reported failure, poll timeout). Fatal per job; the
//!   batch queue marks the task failed and moves on.
//! * **Cancelled** — a distinguished variant raised when cancellation is
//!   observed; the batch queue maps it to a `Stopped` task, not `Failed`.
//! * **Local I/O** — archive corruption, the zip-slip security abort, or a
//!   missing result file.
//!
//! Individual image read/import failures are *not* errors at this level:
//! they degrade the result and are reported in
//! [`crate::pipeline::images::ImportReport`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2note library.
#[derive(Debug, Error)]
pub enum ParseError {
    // ── Precondition errors ───────────────────────────────────────────────
    /// No authentication token is configured for the remote service.
    #[error("No parsing-service token configured.\nSet one in the configuration before parsing.")]
    MissingAuthToken,

    /// Source file exceeds the upload size limit.
    #[error("PDF is too large to upload: {size} bytes (limit {limit} bytes)")]
    FileTooLarge { size: u64, limit: u64 },

    /// The markup conversion service is not available.
    #[error("Markdown-to-note conversion service is unavailable")]
    ConverterUnavailable,

    /// The document has no PDF attachment to parse.
    #[error("Document '{document}' has no PDF attachment")]
    NoPdfAttachment { document: String },

    // ── Remote errors ─────────────────────────────────────────────────────
    /// The slot-request response did not contain exactly one upload URL and
    /// one batch id. Treated as a configuration/contract error, not retried.
    #[error("Unexpected response from parsing service: {detail}")]
    InvalidResponse { detail: String },

    /// The service envelope carried a non-zero status code.
    #[error("Parsing service rejected the request (code {code}): {message}")]
    RemoteRejected { code: i64, message: String },

    /// Binary PUT to the pre-signed upload URL failed.
    #[error("Upload failed with HTTP {status}")]
    UploadFailed { status: u16 },

    /// The remote job reached the `failed` state.
    #[error("Remote parsing failed: {message}")]
    RemoteFailed { message: String },

    /// Polling exceeded the configured timeout without a terminal state.
    /// Distinct from [`ParseError::RemoteFailed`]: the job may still be
    /// running server-side.
    #[error("Parsing timed out after {secs}s waiting for the remote job")]
    PollTimeout { secs: u64 },

    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    // ── Cancellation ──────────────────────────────────────────────────────
    /// Cancellation was requested and observed at a checkpoint.
    #[error("Parse cancelled")]
    Cancelled,

    // ── Local I/O errors ──────────────────────────────────────────────────
    /// An archive entry tried to escape the output directory. This is a
    /// security abort: nothing of the archive is kept.
    #[error("Malicious archive entry '{entry}': path escapes the output directory")]
    MaliciousArchive { entry: String },

    /// The result bundle could not be read as a zip archive.
    #[error("Result bundle is corrupt: {detail}")]
    ArchiveCorrupt { detail: String },

    /// The extracted bundle contains no Markdown file.
    #[error("No Markdown file found in the extracted result at '{dir}'")]
    MarkdownMissing { dir: PathBuf },

    /// Filesystem operation failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Document store errors ─────────────────────────────────────────────
    /// The host document store rejected an operation.
    #[error("Document store error: {0}")]
    Store(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParseError {
    /// Shorthand for wrapping an I/O error with its path.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ParseError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error represents observed cancellation rather than a
    /// genuine failure. The batch queue uses this to pick `Stopped` over
    /// `Failed`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ParseError::Cancelled)
    }
}
