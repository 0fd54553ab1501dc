//! Remote parse client: the three wire operations and the polling loop.
//!
//! One job is one round trip: request an upload slot, PUT the binary, poll
//! the batch until the sub-result reaches a terminal state, then download
//! the result bundle. Each operation has its own failure domain (§ error
//! taxonomy): a malformed slot response is a contract error and is never
//! retried, a non-2xx upload fails the job, a remote `failed` state carries
//! the service's own message, and exceeding the poll timeout is distinct
//! from all of those.
//!
//! The client sits behind the [`RemoteParser`] trait so the pipeline can be
//! driven by a scripted implementation in tests; [`HttpRemoteClient`] is the
//! production reqwest implementation.

use crate::config::ParseConfig;
use crate::error::ParseError;
use crate::progress::{ParseCallbacks, ParseStage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

/// JSON envelope wrapping every service response: `code` 0 means success.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ParseError> {
        if self.code != 0 {
            return Err(ParseError::RemoteRejected {
                code: self.code,
                message: self.msg.unwrap_or_else(|| "unspecified error".into()),
            });
        }
        self.data.ok_or_else(|| ParseError::InvalidResponse {
            detail: "envelope has no data payload".into(),
        })
    }
}

/// One file descriptor in the slot request.
#[derive(Debug, Serialize)]
struct FileDescriptor<'a> {
    name: &'a str,
    data_id: &'a str,
    is_ocr: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    page_ranges: &'a str,
}

/// Slot request body: one file plus the model configuration.
#[derive(Debug, Serialize)]
struct SlotRequest<'a> {
    files: Vec<FileDescriptor<'a>>,
    model_version: &'a str,
    enable_formula: bool,
    enable_table: bool,
    language: &'a str,
}

/// Slot response payload.
#[derive(Debug, Deserialize)]
struct SlotData {
    batch_id: String,
    file_urls: Vec<String>,
}

/// An upload slot granted by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSlot {
    pub upload_url: String,
    pub batch_id: String,
}

/// Transient identity of one submission. Never persisted.
#[derive(Debug, Clone)]
pub struct RemoteJob {
    pub upload_url: String,
    pub batch_id: String,
    /// Unique per submission; primary key for matching poll sub-results.
    pub correlation_id: String,
    pub file_name: String,
}

/// Remote job state as reported by the batch-status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Queued,
    Running,
    Converting,
    Done,
    Failed,
    /// Any state string this client does not know; treated as still
    /// in progress.
    #[serde(other)]
    Unknown,
}

/// One sub-result inside a batch-status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFileResult {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub data_id: Option<String>,
    pub state: RemoteState,
    #[serde(default)]
    pub err_msg: Option<String>,
    #[serde(default)]
    pub extracted_pages: Option<u32>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub full_zip_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchData {
    #[serde(default)]
    extract_result: Vec<RemoteFileResult>,
}

/// The wire operations of one parse job.
#[async_trait]
pub trait RemoteParser: Send + Sync {
    /// Request an upload slot for `file_name`. Must yield exactly one
    /// upload URL and one batch id.
    async fn request_slot(
        &self,
        file_name: &str,
        correlation_id: &str,
        config: &ParseConfig,
    ) -> Result<UploadSlot, ParseError>;

    /// Binary PUT of the PDF to the pre-signed URL.
    async fn upload(&self, url: &str, bytes: Vec<u8>) -> Result<(), ParseError>;

    /// One status GET for the batch.
    async fn poll(&self, batch_id: &str) -> Result<Vec<RemoteFileResult>, ParseError>;

    /// Fetch the result bundle.
    async fn download(&self, url: &str) -> Result<Vec<u8>, ParseError>;
}

// ── Production client ────────────────────────────────────────────────────

/// [`RemoteParser`] over HTTP, authenticated with the configured token.
pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRemoteClient {
    /// Build from configuration. Fails when no token is configured — the
    /// same precondition the pipeline checks, enforced here as well so the
    /// client cannot be constructed unauthenticated.
    pub fn new(config: &ParseConfig) -> Result<Self, ParseError> {
        let token = config.token.clone().ok_or(ParseError::MissingAuthToken)?;
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl RemoteParser for HttpRemoteClient {
    async fn request_slot(
        &self,
        file_name: &str,
        correlation_id: &str,
        config: &ParseConfig,
    ) -> Result<UploadSlot, ParseError> {
        let body = SlotRequest {
            files: vec![FileDescriptor {
                name: file_name,
                data_id: correlation_id,
                is_ocr: config.ocr,
                page_ranges: &config.page_ranges,
            }],
            model_version: config.model.as_str(),
            enable_formula: config.formula,
            enable_table: config.table,
            language: &config.language,
        };

        let response = self
            .http
            .post(format!("{}/file-urls/batch", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ParseError::InvalidResponse {
                detail: format!("slot request returned HTTP {}", response.status()),
            });
        }

        let envelope: Envelope<SlotData> = response.json().await?;
        let data = envelope.into_data()?;
        if data.file_urls.len() != 1 {
            return Err(ParseError::InvalidResponse {
                detail: format!(
                    "expected exactly one upload URL, got {}",
                    data.file_urls.len()
                ),
            });
        }
        if data.batch_id.is_empty() {
            return Err(ParseError::InvalidResponse {
                detail: "empty batch id".into(),
            });
        }
        let mut urls = data.file_urls;
        Ok(UploadSlot {
            upload_url: urls.remove(0),
            batch_id: data.batch_id,
        })
    }

    async fn upload(&self, url: &str, bytes: Vec<u8>) -> Result<(), ParseError> {
        // Pre-signed URL: no auth header.
        let response = self.http.put(url).body(bytes).send().await?;
        if !response.status().is_success() {
            return Err(ParseError::UploadFailed {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn poll(&self, batch_id: &str) -> Result<Vec<RemoteFileResult>, ParseError> {
        let response = self
            .http
            .get(format!("{}/extract-results/batch/{batch_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ParseError::InvalidResponse {
                detail: format!("batch status returned HTTP {}", response.status()),
            });
        }
        let envelope: Envelope<BatchData> = response.json().await?;
        Ok(envelope.into_data()?.extract_result)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ParseError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ParseError::RemoteFailed {
                message: format!("bundle download returned HTTP {}", response.status()),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

// ── Polling loop ─────────────────────────────────────────────────────────

/// Match the sub-result belonging to `job`: correlation id first, file name
/// second, first element last.
fn match_result<'a>(
    results: &'a [RemoteFileResult],
    job: &RemoteJob,
) -> Option<&'a RemoteFileResult> {
    results
        .iter()
        .find(|r| r.data_id.as_deref() == Some(job.correlation_id.as_str()))
        .or_else(|| results.iter().find(|r| r.file_name == job.file_name))
        .or_else(|| results.first())
}

/// Progress for the queued/running band (30–60), scaled by page counts when
/// the service reports them, else a fixed mid-point.
fn running_percent(result: &RemoteFileResult) -> u8 {
    match (result.extracted_pages, result.total_pages) {
        (Some(done), Some(total)) if total > 0 => {
            let frac = f64::from(done.min(total)) / f64::from(total);
            30 + (frac * 30.0) as u8
        }
        _ => 45,
    }
}

/// Poll until the job reaches a terminal remote state; returns the result
/// bundle URL.
///
/// Cancellation is checked before every poll and again before every sleep,
/// so observed latency is bounded by one poll interval.
pub async fn poll_until_done(
    remote: &dyn RemoteParser,
    job: &RemoteJob,
    config: &ParseConfig,
    callbacks: &dyn ParseCallbacks,
) -> Result<String, ParseError> {
    let deadline = Instant::now() + config.poll_timeout();
    let mut last_stage: Option<ParseStage> = None;

    loop {
        if callbacks.should_cancel() {
            return Err(ParseError::Cancelled);
        }
        if Instant::now() >= deadline {
            warn!(
                "Remote job {} timed out after {}s",
                job.batch_id, config.poll_timeout_secs
            );
            return Err(ParseError::PollTimeout {
                secs: config.poll_timeout_secs,
            });
        }

        let results = remote.poll(&job.batch_id).await?;
        let Some(result) = match_result(&results, job) else {
            return Err(ParseError::InvalidResponse {
                detail: format!("batch {} has no sub-results", job.batch_id),
            });
        };
        debug!("Remote job {}: {:?}", job.batch_id, result.state);

        let (stage, percent) = match result.state {
            RemoteState::Done => {
                return result.full_zip_url.clone().ok_or_else(|| {
                    ParseError::InvalidResponse {
                        detail: "done state without a result bundle URL".into(),
                    }
                });
            }
            RemoteState::Failed => {
                return Err(ParseError::RemoteFailed {
                    message: result
                        .err_msg
                        .clone()
                        .unwrap_or_else(|| "remote error".into()),
                });
            }
            RemoteState::Queued | RemoteState::Unknown => (ParseStage::Queued, 30),
            RemoteState::Running => (ParseStage::Parsing, running_percent(result)),
            RemoteState::Converting => (ParseStage::Converting, 60),
        };

        if last_stage != Some(stage) {
            callbacks.on_status_change(stage, stage.label());
            last_stage = Some(stage);
        }
        callbacks.on_progress(percent);

        if callbacks.should_cancel() {
            return Err(ParseError::Cancelled);
        }
        tokio::time::sleep(config.poll_interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopCallbacks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn job() -> RemoteJob {
        RemoteJob {
            upload_url: "http://upload".into(),
            batch_id: "B1".into(),
            correlation_id: "corr-1".into(),
            file_name: "paper.pdf".into(),
        }
    }

    fn result(state: RemoteState) -> RemoteFileResult {
        RemoteFileResult {
            file_name: "paper.pdf".into(),
            data_id: Some("corr-1".into()),
            state,
            err_msg: None,
            extracted_pages: None,
            total_pages: None,
            full_zip_url: None,
        }
    }

    /// Scripted remote: each poll pops the next canned response.
    struct ScriptedRemote {
        responses: Mutex<Vec<Vec<RemoteFileResult>>>,
        polls: AtomicUsize,
    }

    impl ScriptedRemote {
        fn new(mut responses: Vec<Vec<RemoteFileResult>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                polls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteParser for ScriptedRemote {
        async fn request_slot(
            &self,
            _file_name: &str,
            _correlation_id: &str,
            _config: &ParseConfig,
        ) -> Result<UploadSlot, ParseError> {
            unreachable!("not exercised here")
        }

        async fn upload(&self, _url: &str, _bytes: Vec<u8>) -> Result<(), ParseError> {
            Ok(())
        }

        async fn poll(&self, _batch_id: &str) -> Result<Vec<RemoteFileResult>, ParseError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.responses.lock().unwrap();
            Ok(guard.pop().unwrap_or_default())
        }

        async fn download(&self, _url: &str) -> Result<Vec<u8>, ParseError> {
            Ok(Vec::new())
        }
    }

    fn fast_config() -> ParseConfig {
        ParseConfig::builder()
            .token("t")
            .poll_interval_ms(100)
            .poll_timeout_secs(5)
            .build()
            .unwrap()
    }

    #[test]
    fn envelope_rejects_nonzero_code() {
        let env: Envelope<SlotData> =
            serde_json::from_str(r#"{"code": -60012, "msg": "no quota"}"#).unwrap();
        let err = env.into_data().unwrap_err();
        assert!(matches!(err, ParseError::RemoteRejected { code: -60012, .. }));
    }

    #[test]
    fn batch_response_deserializes() {
        let raw = r#"{
            "code": 0,
            "data": {"extract_result": [
                {"file_name": "paper.pdf", "data_id": "corr-1", "state": "running",
                 "extracted_pages": 5, "total_pages": 10}
            ]}
        }"#;
        let env: Envelope<BatchData> = serde_json::from_str(raw).unwrap();
        let data = env.into_data().unwrap();
        assert_eq!(data.extract_result.len(), 1);
        assert_eq!(data.extract_result[0].state, RemoteState::Running);
    }

    #[test]
    fn unknown_state_is_tolerated() {
        let raw = r#"{"file_name": "x.pdf", "state": "waiting-file"}"#;
        let parsed: RemoteFileResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.state, RemoteState::Unknown);
    }

    #[test]
    fn match_prefers_correlation_then_name_then_first() {
        let mut by_name = result(RemoteState::Queued);
        by_name.data_id = None;
        let mut other = result(RemoteState::Running);
        other.data_id = Some("someone-else".into());
        other.file_name = "other.pdf".into();

        // Correlation id wins over position.
        let results = vec![other.clone(), result(RemoteState::Done)];
        assert_eq!(match_result(&results, &job()).unwrap().state, RemoteState::Done);

        // File name when no correlation id matches.
        let results = vec![other.clone(), by_name.clone()];
        assert_eq!(match_result(&results, &job()).unwrap().state, RemoteState::Queued);

        // First element as last resort.
        let results = vec![other];
        assert_eq!(match_result(&results, &job()).unwrap().state, RemoteState::Running);
    }

    #[test]
    fn running_percent_scales_with_pages() {
        let mut r = result(RemoteState::Running);
        assert_eq!(running_percent(&r), 45);
        r.extracted_pages = Some(5);
        r.total_pages = Some(10);
        assert_eq!(running_percent(&r), 45);
        r.extracted_pages = Some(10);
        assert_eq!(running_percent(&r), 60);
        r.extracted_pages = Some(0);
        assert_eq!(running_percent(&r), 30);
    }

    #[tokio::test]
    async fn poll_loop_reaches_done() {
        let mut done = result(RemoteState::Done);
        done.full_zip_url = Some("http://bundle.zip".into());
        let remote = ScriptedRemote::new(vec![
            vec![result(RemoteState::Queued)],
            vec![result(RemoteState::Running)],
            vec![done],
        ]);
        let url = poll_until_done(&remote, &job(), &fast_config(), &NoopCallbacks)
            .await
            .unwrap();
        assert_eq!(url, "http://bundle.zip");
        assert_eq!(remote.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_loop_surfaces_remote_failure() {
        let mut failed = result(RemoteState::Failed);
        failed.err_msg = Some("corrupt pdf".into());
        let remote = ScriptedRemote::new(vec![vec![failed]]);
        let err = poll_until_done(&remote, &job(), &fast_config(), &NoopCallbacks)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("corrupt pdf"));
    }

    #[tokio::test]
    async fn poll_loop_times_out() {
        // Endless "queued" answers with a timeout shorter than two intervals.
        let remote = ScriptedRemote::new(vec![vec![result(RemoteState::Queued)]; 100]);
        let config = ParseConfig::builder()
            .token("t")
            .poll_interval_ms(600)
            .poll_timeout_secs(1)
            .build()
            .unwrap();
        let err = poll_until_done(&remote, &job(), &config, &NoopCallbacks)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::PollTimeout { secs: 1 }));
    }

    #[tokio::test]
    async fn cancellation_observed_before_first_poll() {
        struct AlwaysCancel;
        impl ParseCallbacks for AlwaysCancel {
            fn should_cancel(&self) -> bool {
                true
            }
        }
        let remote = ScriptedRemote::new(vec![vec![result(RemoteState::Queued)]]);
        let err = poll_until_done(&remote, &job(), &fast_config(), &AlwaysCancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(remote.polls.load(Ordering::SeqCst), 0, "no poll after cancel");
    }

    #[tokio::test]
    async fn done_without_bundle_url_is_contract_error() {
        let remote = ScriptedRemote::new(vec![vec![result(RemoteState::Done)]]);
        let err = poll_until_done(&remote, &job(), &fast_config(), &NoopCallbacks)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidResponse { .. }));
    }
}
