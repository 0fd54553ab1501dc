//! Batch orchestrator: many pipeline invocations under one concurrency cap.
//!
//! [`BatchQueue`] owns its task list outright — there is no process-wide
//! singleton; hosts hold an `Arc<BatchQueue>` and inject it wherever a UI or
//! CLI needs it. All queue state lives behind one mutex mutated only from
//! the queue's own methods and completion handlers (single writer); the
//! pipeline reaches the queue exclusively through the
//! [`ParseCallbacks`] contract.
//!
//! Scheduling is a pump: while the queue is running, not stop-requested,
//! and below the concurrency cap, the next queued task starts; every
//! completing task re-invokes the pump so a freed slot refills immediately.
//! A monotonically increasing session id guards against completions from a
//! previous run mutating tasks that belong to a new one.

use crate::error::ParseError;
use crate::pipeline::ParsePipeline;
use crate::progress::{ParseCallbacks, ParseStage};
use crate::store::{AttachmentRef, DocKind, DocumentRef, NoteRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Queue-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Idle,
    Running,
    Paused,
}

/// Per-task lifecycle status.
///
/// Deliberately a different taxonomy from [`ParseStage`]: the queue only
/// mirrors pipeline stage/progress into `status_text`/`progress` while the
/// task itself stays `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Stopped
        )
    }
}

/// Outcome of [`BatchQueue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The document is already in the queue; duplicate adds are no-ops.
    Skipped,
}

/// One queued unit of work wrapping one pipeline invocation.
#[derive(Debug, Clone)]
pub struct ParseTask {
    /// Stable key: the owning document id.
    pub key: String,
    pub document: DocumentRef,
    pub source: AttachmentRef,
    /// Resolved once at creation, never re-derived from a live handle.
    pub kind: DocKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub status_text: String,
    pub error: Option<String>,
    pub note: Option<NoteRef>,
    cancel: Arc<AtomicBool>,
    session: u64,
}

struct QueueState {
    status: QueueStatus,
    stop_requested: bool,
    tasks: Vec<ParseTask>,
    index: HashMap<String, usize>,
    in_flight: usize,
}

struct BatchInner {
    pipeline: Arc<ParsePipeline>,
    concurrency: usize,
    state: Mutex<QueueState>,
    session: AtomicU64,
}

/// The batch orchestrator.
pub struct BatchQueue {
    inner: Arc<BatchInner>,
}

impl BatchQueue {
    /// Concurrency comes from the pipeline's configuration (clamped 1–5
    /// at config build time).
    pub fn new(pipeline: Arc<ParsePipeline>) -> Self {
        let concurrency = pipeline.config().batch_concurrency;
        Self {
            inner: Arc::new(BatchInner {
                pipeline,
                concurrency,
                state: Mutex::new(QueueState {
                    status: QueueStatus::Idle,
                    stop_requested: false,
                    tasks: Vec::new(),
                    index: HashMap::new(),
                    in_flight: 0,
                }),
                session: AtomicU64::new(0),
            }),
        }
    }

    // ── Insertion ────────────────────────────────────────────────────────

    /// Queue one document. Idempotent: a key already present (in any
    /// status) is skipped.
    pub fn add(&self, document: DocumentRef, source: AttachmentRef) -> AddOutcome {
        let mut state = self.inner.state.lock().unwrap();
        if state.index.contains_key(&document.id) {
            debug!("Skipping duplicate task for {}", document.id);
            return AddOutcome::Skipped;
        }
        let kind = DocKind::classify(&document.item_type);
        let task = ParseTask {
            key: document.id.clone(),
            document,
            source,
            kind,
            status: TaskStatus::Queued,
            progress: 0,
            status_text: "Queued".into(),
            error: None,
            note: None,
            cancel: Arc::new(AtomicBool::new(false)),
            session: self.inner.session.load(Ordering::SeqCst),
        };
        let idx = state.tasks.len();
        state.index.insert(task.key.clone(), idx);
        state.tasks.push(task);
        AddOutcome::Added
    }

    /// Queue many documents; returns how many were actually added.
    pub fn add_many(
        &self,
        items: impl IntoIterator<Item = (DocumentRef, AttachmentRef)>,
    ) -> usize {
        items
            .into_iter()
            .filter(|(d, s)| self.add(d.clone(), s.clone()) == AddOutcome::Added)
            .count()
    }

    // ── Control ──────────────────────────────────────────────────────────

    /// Start (or resume) draining the queue.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.status = QueueStatus::Running;
            state.stop_requested = false;
        }
        info!("Batch queue started");
        pump(&self.inner);
    }

    /// Pause: running tasks continue, no new task starts until [`start`].
    ///
    /// [`start`]: BatchQueue::start
    pub fn pause(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.status == QueueStatus::Running {
            state.status = QueueStatus::Paused;
            info!("Batch queue paused");
        }
    }

    /// Stop: request cancellation on every running task and flip every
    /// still-queued task to `Stopped` without starting it.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.stop_requested = true;
        for task in state.tasks.iter_mut() {
            match task.status {
                TaskStatus::Running => task.cancel.store(true, Ordering::SeqCst),
                TaskStatus::Queued => {
                    task.status = TaskStatus::Stopped;
                    task.status_text = "Stopped".into();
                }
                _ => {}
            }
        }
        if state.in_flight == 0 {
            state.status = QueueStatus::Idle;
        }
        info!("Batch queue stop requested");
    }

    /// Re-queue one task. Only `Failed` and `Stopped` tasks are eligible;
    /// anything else is a no-op. An idle queue wakes up to run the retry
    /// (a paused queue stays paused).
    pub fn retry(&self, key: &str) -> bool {
        let requeued = {
            let mut state = self.inner.state.lock().unwrap();
            let session = self.inner.session.load(Ordering::SeqCst);
            match state.index.get(key).copied() {
                Some(i) if matches!(state.tasks[i].status, TaskStatus::Failed | TaskStatus::Stopped) => {
                    reset_for_retry(&mut state.tasks[i], session);
                    wake_if_idle(&mut state);
                    true
                }
                _ => false,
            }
        };
        if requeued {
            pump(&self.inner);
        }
        requeued
    }

    /// Re-queue every failed or stopped task; returns the count.
    pub fn retry_all(&self) -> usize {
        let n = {
            let mut state = self.inner.state.lock().unwrap();
            let session = self.inner.session.load(Ordering::SeqCst);
            let mut n = 0;
            for task in state.tasks.iter_mut() {
                if matches!(task.status, TaskStatus::Failed | TaskStatus::Stopped) {
                    reset_for_retry(task, session);
                    n += 1;
                }
            }
            if n > 0 {
                wake_if_idle(&mut state);
            }
            n
        };
        if n > 0 {
            pump(&self.inner);
        }
        n
    }

    /// Drop every task in a terminal status from the list.
    pub fn clear_finished(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.tasks.retain(|t| !t.status.is_terminal());
        state.index = state
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key.clone(), i))
            .collect();
    }

    /// Abandon everything: cancel running tasks, clear the list, and bump
    /// the session so in-flight completions cannot touch the new state.
    pub fn reset(&self) {
        self.inner.session.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().unwrap();
        for task in state.tasks.iter() {
            task.cancel.store(true, Ordering::SeqCst);
        }
        state.tasks.clear();
        state.index.clear();
        state.in_flight = 0;
        state.stop_requested = false;
        state.status = QueueStatus::Idle;
        info!("Batch queue reset");
    }

    // ── Single-task actions ──────────────────────────────────────────────

    /// Start one task immediately, bypassing the queued-pull and the
    /// concurrency cap.
    pub fn start_one(&self, key: &str) -> bool {
        let spawned = {
            let mut state = self.inner.state.lock().unwrap();
            let session = self.inner.session.load(Ordering::SeqCst);
            match state.index.get(key).copied() {
                Some(i) if matches!(
                    state.tasks[i].status,
                    TaskStatus::Queued | TaskStatus::Failed | TaskStatus::Stopped
                ) =>
                {
                    reset_for_retry(&mut state.tasks[i], session);
                    Some(begin_task(&mut state, i))
                }
                _ => None,
            }
        };
        match spawned {
            Some(spec) => {
                spawn_task(self.inner.clone(), spec);
                true
            }
            None => false,
        }
    }

    /// Request cancellation of one running task, or stop a queued one.
    pub fn stop_one(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.index.get(key).copied() {
            Some(i) => match state.tasks[i].status {
                TaskStatus::Running => {
                    state.tasks[i].cancel.store(true, Ordering::SeqCst);
                    true
                }
                TaskStatus::Queued => {
                    state.tasks[i].status = TaskStatus::Stopped;
                    state.tasks[i].status_text = "Stopped".into();
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    // ── Observation ──────────────────────────────────────────────────────

    pub fn status(&self) -> QueueStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Point-in-time copy of every task.
    pub fn snapshot(&self) -> Vec<ParseTask> {
        self.inner.state.lock().unwrap().tasks.clone()
    }

    /// Number of tasks currently `Running`.
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().unwrap().in_flight
    }

    /// Whether no task is queued or running anymore.
    pub fn is_drained(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.in_flight == 0
            && !state
                .tasks
                .iter()
                .any(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
    }
}

fn wake_if_idle(state: &mut QueueState) {
    if state.status == QueueStatus::Idle {
        state.status = QueueStatus::Running;
        state.stop_requested = false;
    }
}

fn reset_for_retry(task: &mut ParseTask, session: u64) {
    task.status = TaskStatus::Queued;
    task.status_text = "Queued".into();
    task.progress = 0;
    task.error = None;
    task.note = None;
    task.cancel = Arc::new(AtomicBool::new(false));
    task.session = session;
}

/// Everything a spawned task needs, captured under the lock.
struct TaskSpec {
    key: String,
    document: DocumentRef,
    source: AttachmentRef,
    cancel: Arc<AtomicBool>,
    session: u64,
}

fn begin_task(state: &mut QueueState, i: usize) -> TaskSpec {
    let task = &mut state.tasks[i];
    task.status = TaskStatus::Running;
    task.status_text = "Starting".into();
    state.in_flight += 1;
    TaskSpec {
        key: task.key.clone(),
        document: task.document.clone(),
        source: task.source.clone(),
        cancel: task.cancel.clone(),
        session: task.session,
    }
}

/// Start queued tasks while a slot is free. Called from [`BatchQueue::start`]
/// and from every task's completion handler.
fn pump(inner: &Arc<BatchInner>) {
    loop {
        let spec = {
            let mut state = inner.state.lock().unwrap();
            if state.status != QueueStatus::Running
                || state.stop_requested
                || state.in_flight >= inner.concurrency
            {
                break;
            }
            let next = state
                .tasks
                .iter()
                .position(|t| t.status == TaskStatus::Queued);
            match next {
                Some(i) => begin_task(&mut state, i),
                None => {
                    if state.in_flight == 0 {
                        state.status = QueueStatus::Idle;
                    }
                    break;
                }
            }
        };
        spawn_task(inner.clone(), spec);
    }
}

fn spawn_task(inner: Arc<BatchInner>, spec: TaskSpec) {
    tokio::spawn(async move {
        let callbacks = TaskCallbacks {
            inner: inner.clone(),
            key: spec.key.clone(),
            session: spec.session,
            cancel: spec.cancel.clone(),
        };
        let result = inner
            .pipeline
            .parse(&spec.document, &spec.source, false, &callbacks)
            .await;
        finish_task(&inner, &spec, result);
        // Freed slot: refill immediately.
        pump(&inner);
    });
}

fn finish_task(inner: &Arc<BatchInner>, spec: &TaskSpec, result: Result<NoteRef, ParseError>) {
    let mut state = inner.state.lock().unwrap();
    if spec.session != inner.session.load(Ordering::SeqCst) {
        // Completion from a previous session: the task it belonged to is
        // gone; in_flight was reset with it.
        debug!("Discarding stale completion for {}", spec.key);
        return;
    }
    state.in_flight = state.in_flight.saturating_sub(1);

    if let Some(i) = state.index.get(&spec.key).copied() {
        let task = &mut state.tasks[i];
        match result {
            Ok(note) => {
                task.status = TaskStatus::Success;
                task.progress = 100;
                task.status_text = "Done".into();
                task.note = Some(note);
            }
            Err(e) if e.is_cancelled() => {
                task.status = TaskStatus::Stopped;
                task.status_text = "Stopped".into();
            }
            Err(e) => {
                warn!("Task {} failed: {e}", spec.key);
                task.status = TaskStatus::Failed;
                task.status_text = "Failed".into();
                task.error = Some(e.to_string());
            }
        }
    }

    let drained = state.in_flight == 0
        && !state
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Queued);
    if drained || (state.stop_requested && state.in_flight == 0) {
        state.status = QueueStatus::Idle;
    }
}

/// Mirrors pipeline events into the owning task row.
struct TaskCallbacks {
    inner: Arc<BatchInner>,
    key: String,
    session: u64,
    cancel: Arc<AtomicBool>,
}

impl TaskCallbacks {
    fn with_task(&self, f: impl FnOnce(&mut ParseTask)) {
        if self.session != self.inner.session.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        if let Some(i) = state.index.get(&self.key).copied() {
            f(&mut state.tasks[i]);
        }
    }
}

impl ParseCallbacks for TaskCallbacks {
    fn on_status_change(&self, stage: ParseStage, text: &str) {
        // The task's own status stays Running; only the mirror text moves.
        if !stage.is_terminal() {
            let text = text.to_string();
            self.with_task(move |t| t.status_text = text);
        }
    }

    fn on_progress(&self, percent: u8) {
        self.with_task(move |t| t.progress = percent.min(100));
    }

    fn should_cancel(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}
