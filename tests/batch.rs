//! Batch-queue properties: concurrency cap, stop, retry gating, sessions.
//!
//! The queue drives real pipelines against a fake remote whose timing is
//! controlled per test, so scheduling behavior is observed rather than
//! simulated.

use async_trait::async_trait;
use pdf2note::{
    AddOutcome, AttachmentRef, BatchQueue, DocumentRef, IdentityConverter, MemoryStore,
    ParseConfig, ParseError, ParsePipeline, QueueStatus, RemoteFileResult, RemoteParser,
    RemoteState, TaskStatus, UploadSlot,
};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn bundle() -> Vec<u8> {
    let mut w = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = zip::write::SimpleFileOptions::default();
    w.start_file("markdown/full.md", opts).unwrap();
    w.write_all(b"# Parsed\n\nbody\n").unwrap();
    w.finish().unwrap().into_inner()
}

/// Remote with controllable timing. `active`/`max_active` count jobs
/// between slot request and download, which is exactly the window a task is
/// `Running` for.
struct SlowRemote {
    bundle: Vec<u8>,
    upload_delay: Duration,
    hang_in_poll: bool,
    fail_with: Option<String>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SlowRemote {
    fn new() -> Self {
        Self {
            bundle: bundle(),
            upload_delay: Duration::from_millis(100),
            hang_in_poll: false,
            fail_with: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn hanging() -> Self {
        Self {
            hang_in_poll: true,
            ..Self::new()
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new()
        }
    }
}

#[async_trait]
impl RemoteParser for SlowRemote {
    async fn request_slot(
        &self,
        _file_name: &str,
        correlation_id: &str,
        _config: &ParseConfig,
    ) -> Result<UploadSlot, ParseError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        Ok(UploadSlot {
            upload_url: format!("fake://upload/{correlation_id}"),
            batch_id: format!("batch-{correlation_id}"),
        })
    }

    async fn upload(&self, _url: &str, _bytes: Vec<u8>) -> Result<(), ParseError> {
        tokio::time::sleep(self.upload_delay).await;
        Ok(())
    }

    async fn poll(&self, batch_id: &str) -> Result<Vec<RemoteFileResult>, ParseError> {
        let (state, err_msg, full_zip_url) = if self.hang_in_poll {
            (RemoteState::Queued, None, None)
        } else if let Some(message) = &self.fail_with {
            (RemoteState::Failed, Some(message.clone()), None)
        } else {
            (RemoteState::Done, None, Some(format!("fake://bundle/{batch_id}")))
        };
        if state != RemoteState::Queued {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(vec![RemoteFileResult {
            file_name: String::new(),
            data_id: None,
            state,
            err_msg,
            extracted_pages: None,
            total_pages: None,
            full_zip_url,
        }])
    }

    async fn download(&self, _url: &str) -> Result<Vec<u8>, ParseError> {
        Ok(self.bundle.clone())
    }
}

struct Fixture {
    _workdir: TempDir,
    queue: BatchQueue,
    docs: Vec<(DocumentRef, AttachmentRef)>,
}

fn fixture(remote: Arc<dyn RemoteParser>, concurrency: usize, n_docs: usize) -> Fixture {
    let workdir = tempfile::tempdir().unwrap();
    let pdf_path = workdir.path().join("paper.pdf");
    std::fs::write(&pdf_path, b"%PDF-1.7 fake").unwrap();

    let store = Arc::new(MemoryStore::new());
    let mut docs = Vec::new();
    for i in 0..n_docs {
        let doc = DocumentRef {
            id: format!("D{i}"),
            title: format!("Paper {i}"),
            item_type: "journalArticle".into(),
        };
        let att = AttachmentRef {
            id: format!("A{i}"),
            path: pdf_path.clone(),
            filename: "paper.pdf".into(),
            size: None,
            mtime: None,
        };
        store.add_document(doc.clone());
        docs.push((doc, att));
    }

    let config = ParseConfig::builder()
        .token("test-token")
        .cache_dir(workdir.path().join("cache"))
        .poll_interval_ms(100)
        .poll_timeout_secs(30)
        .batch_concurrency(concurrency)
        .build()
        .unwrap();
    let pipeline = Arc::new(ParsePipeline::new(
        config,
        remote,
        store,
        Arc::new(IdentityConverter::new()),
    ));

    Fixture {
        _workdir: workdir,
        queue: BatchQueue::new(pipeline),
        docs,
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within 10s");
}

fn statuses(queue: &BatchQueue) -> Vec<TaskStatus> {
    queue.snapshot().iter().map(|t| t.status).collect()
}

#[tokio::test]
async fn concurrency_cap_is_respected() {
    let remote = Arc::new(SlowRemote::new());
    let fx = fixture(remote.clone(), 2, 5);
    for (doc, att) in &fx.docs {
        assert_eq!(fx.queue.add(doc.clone(), att.clone()), AddOutcome::Added);
    }
    fx.queue.start();
    assert_eq!(fx.queue.status(), QueueStatus::Running);

    wait_for(|| statuses(&fx.queue).iter().all(|s| *s == TaskStatus::Success)).await;
    assert!(
        remote.max_active.load(Ordering::SeqCst) <= 2,
        "more than 2 jobs were in flight: {}",
        remote.max_active.load(Ordering::SeqCst)
    );
    assert_eq!(fx.queue.status(), QueueStatus::Idle);
}

#[tokio::test]
async fn duplicate_add_is_skipped() {
    let fx = fixture(Arc::new(SlowRemote::new()), 2, 1);
    let (doc, att) = &fx.docs[0];
    assert_eq!(fx.queue.add(doc.clone(), att.clone()), AddOutcome::Added);
    assert_eq!(fx.queue.add(doc.clone(), att.clone()), AddOutcome::Skipped);
    assert_eq!(fx.queue.snapshot().len(), 1);
}

#[tokio::test]
async fn stop_cancels_running_and_stops_queued() {
    let fx = fixture(Arc::new(SlowRemote::hanging()), 2, 5);
    for (doc, att) in &fx.docs {
        fx.queue.add(doc.clone(), att.clone());
    }
    fx.queue.start();

    // Two tasks enter the endless poll loop; three stay queued.
    wait_for(|| fx.queue.running_count() == 2).await;
    fx.queue.stop();

    // Queued tasks flip immediately, without ever starting.
    let stopped = fx
        .queue
        .snapshot()
        .iter()
        .filter(|t| t.status == TaskStatus::Stopped)
        .count();
    assert!(stopped >= 3, "queued tasks must be stopped synchronously");

    // Running ones observe cancellation within one poll interval.
    wait_for(|| statuses(&fx.queue).iter().all(|s| *s == TaskStatus::Stopped)).await;
    assert_eq!(fx.queue.status(), QueueStatus::Idle);
    assert_eq!(fx.queue.running_count(), 0);
}

#[tokio::test]
async fn pause_finishes_running_but_starts_nothing_new() {
    let fx = fixture(Arc::new(SlowRemote::new()), 1, 3);
    for (doc, att) in &fx.docs {
        fx.queue.add(doc.clone(), att.clone());
    }
    fx.queue.start();
    wait_for(|| fx.queue.running_count() == 1).await;
    fx.queue.pause();
    assert_eq!(fx.queue.status(), QueueStatus::Paused);

    // The in-flight task completes; no replacement starts.
    wait_for(|| fx.queue.running_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let done = statuses(&fx.queue)
        .iter()
        .filter(|s| **s == TaskStatus::Success)
        .count();
    assert_eq!(done, 1, "exactly the in-flight task finished");

    // Resume drains the rest.
    fx.queue.start();
    wait_for(|| statuses(&fx.queue).iter().all(|s| *s == TaskStatus::Success)).await;
}

#[tokio::test]
async fn failed_task_carries_remote_error_and_queue_survives() {
    let fx = fixture(Arc::new(SlowRemote::failing("corrupt pdf")), 2, 3);
    for (doc, att) in &fx.docs {
        fx.queue.add(doc.clone(), att.clone());
    }
    fx.queue.start();
    wait_for(|| statuses(&fx.queue).iter().all(|s| *s == TaskStatus::Failed)).await;

    for task in fx.queue.snapshot() {
        let error = task.error.expect("failed task records its error");
        assert!(error.contains("corrupt pdf"), "got: {error}");
    }
    assert_eq!(fx.queue.status(), QueueStatus::Idle);
}

#[tokio::test]
async fn retry_only_accepts_failed_or_stopped() {
    let fx = fixture(Arc::new(SlowRemote::failing("boom")), 2, 1);
    let (doc, att) = &fx.docs[0];
    fx.queue.add(doc.clone(), att.clone());

    // Queued task: retry is a no-op.
    assert!(!fx.queue.retry(&doc.id));

    fx.queue.start();
    wait_for(|| statuses(&fx.queue) == vec![TaskStatus::Failed]).await;

    // Failed task: retry re-queues and re-runs (and fails again).
    assert!(fx.queue.retry(&doc.id));
    wait_for(|| statuses(&fx.queue) == vec![TaskStatus::Failed]).await;
}

#[tokio::test]
async fn retry_on_success_is_a_noop() {
    let fx = fixture(Arc::new(SlowRemote::new()), 2, 1);
    let (doc, att) = &fx.docs[0];
    fx.queue.add(doc.clone(), att.clone());
    fx.queue.start();
    wait_for(|| statuses(&fx.queue) == vec![TaskStatus::Success]).await;

    assert!(!fx.queue.retry(&doc.id));
    assert_eq!(statuses(&fx.queue), vec![TaskStatus::Success]);
}

#[tokio::test]
async fn start_one_runs_without_starting_the_queue() {
    let fx = fixture(Arc::new(SlowRemote::new()), 2, 2);
    for (doc, att) in &fx.docs {
        fx.queue.add(doc.clone(), att.clone());
    }

    assert!(fx.queue.start_one(&fx.docs[0].0.id));
    wait_for(|| statuses(&fx.queue)[0] == TaskStatus::Success).await;

    // The other task never started.
    assert_eq!(statuses(&fx.queue)[1], TaskStatus::Queued);
}

#[tokio::test]
async fn stop_one_stops_a_single_running_task() {
    let fx = fixture(Arc::new(SlowRemote::hanging()), 2, 2);
    for (doc, att) in &fx.docs {
        fx.queue.add(doc.clone(), att.clone());
    }
    fx.queue.start();
    wait_for(|| fx.queue.running_count() == 2).await;

    assert!(fx.queue.stop_one(&fx.docs[0].0.id));
    wait_for(|| statuses(&fx.queue)[0] == TaskStatus::Stopped).await;
    // The sibling keeps polling, unaffected.
    assert_eq!(statuses(&fx.queue)[1], TaskStatus::Running);

    fx.queue.stop();
    wait_for(|| statuses(&fx.queue).iter().all(|s| *s == TaskStatus::Stopped)).await;
}

#[tokio::test]
async fn reset_discards_in_flight_completions() {
    let fx = fixture(Arc::new(SlowRemote::hanging()), 2, 2);
    for (doc, att) in &fx.docs {
        fx.queue.add(doc.clone(), att.clone());
    }
    fx.queue.start();
    wait_for(|| fx.queue.running_count() == 2).await;

    fx.queue.reset();
    assert!(fx.queue.snapshot().is_empty());
    assert_eq!(fx.queue.running_count(), 0);
    assert_eq!(fx.queue.status(), QueueStatus::Idle);

    // Give the cancelled pipelines time to finish; their completions must
    // not resurrect state from the old session.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.queue.snapshot().is_empty());
    assert_eq!(fx.queue.running_count(), 0);
}

#[tokio::test]
async fn clear_finished_removes_terminal_tasks_only() {
    let fx = fixture(Arc::new(SlowRemote::new()), 2, 2);
    for (doc, att) in &fx.docs {
        fx.queue.add(doc.clone(), att.clone());
    }
    fx.queue.start_one(&fx.docs[0].0.id);
    wait_for(|| statuses(&fx.queue)[0] == TaskStatus::Success).await;

    fx.queue.clear_finished();
    let remaining = fx.queue.snapshot();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key, fx.docs[1].0.id);
}
