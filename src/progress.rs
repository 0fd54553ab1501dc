//! Progress, status, and cancellation callbacks for one parse invocation.
//!
//! The pipeline reports through a single [`ParseCallbacks`] object. Both the
//! single-item caller (CLI, UI action) and the batch queue implement the same
//! contract, so the pipeline never knows who is driving it. Cancellation is
//! pull-based: the pipeline calls [`ParseCallbacks::should_cancel`] at every
//! checkpoint rather than being interrupted preemptively.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stage of one pipeline invocation.
///
/// Transitions are strictly forward along the happy path; `Error` and
/// `Cancelled` are absorbing from any non-terminal stage. A cache hit jumps
/// from `CacheCheck` straight to `Importing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseStage {
    Idle,
    Fingerprinting,
    CacheCheck,
    Uploading,
    Queued,
    Parsing,
    Converting,
    Downloading,
    Extracting,
    Importing,
    Done,
    Error,
    Cancelled,
}

impl ParseStage {
    /// Human-readable label used as default status text.
    pub fn label(&self) -> &'static str {
        match self {
            ParseStage::Idle => "Idle",
            ParseStage::Fingerprinting => "Fingerprinting source",
            ParseStage::CacheCheck => "Checking cache",
            ParseStage::Uploading => "Uploading PDF",
            ParseStage::Queued => "Waiting in remote queue",
            ParseStage::Parsing => "Parsing remotely",
            ParseStage::Converting => "Converting result",
            ParseStage::Downloading => "Downloading result",
            ParseStage::Extracting => "Extracting archive",
            ParseStage::Importing => "Importing into note",
            ParseStage::Done => "Done",
            ParseStage::Error => "Error",
            ParseStage::Cancelled => "Cancelled",
        }
    }

    /// Whether the stage is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ParseStage::Done | ParseStage::Error | ParseStage::Cancelled
        )
    }
}

/// Callback contract between a parse invocation and its driver.
///
/// Implementations must be `Send + Sync`; the batch queue invokes pipelines
/// from spawned tasks. All methods default to no-ops except
/// [`should_cancel`], which defaults to `false`.
///
/// [`should_cancel`]: ParseCallbacks::should_cancel
pub trait ParseCallbacks: Send + Sync {
    /// Called on every stage transition with a short status text.
    fn on_status_change(&self, stage: ParseStage, text: &str) {
        let _ = (stage, text);
    }

    /// Called with overall progress in 0..=100. The mapping is continuous
    /// across remote and local phases so one bar can render the whole parse.
    fn on_progress(&self, percent: u8) {
        let _ = percent;
    }

    /// Polled before and after every blocking operation. Returning `true`
    /// makes the pipeline raise [`crate::error::ParseError::Cancelled`] at
    /// the next checkpoint.
    fn should_cancel(&self) -> bool {
        false
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopCallbacks;

impl ParseCallbacks for NoopCallbacks {}

/// Convenience alias for a shared callback handle.
pub type Callbacks = Arc<dyn ParseCallbacks>;
