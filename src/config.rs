//! Configuration for the parse pipeline and batch queue.
//!
//! Every knob lives in one [`ParseConfig`] struct built via its
//! [`ParseConfigBuilder`], so configs can be shared across tasks, logged, and
//! diffed between runs. Setters clamp to valid ranges; [`build`] validates
//! the cross-field constraints.
//!
//! [`build`]: ParseConfigBuilder::build

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hard upper bound on the uploaded PDF size: 200 MiB.
///
/// The remote service rejects anything larger; checking locally avoids a
/// wasted upload round trip.
pub const MAX_UPLOAD_BYTES: u64 = 200 * 1024 * 1024;

/// Namespace prefix on every cache directory this crate creates.
///
/// The cache root may be a shared temp directory; the lookup scan skips
/// anything without this prefix.
pub const CACHE_DIR_PREFIX: &str = "pdf2note-";

/// Which remote parsing model handles the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVariant {
    /// Pipeline model: classic layout analysis, fastest.
    Pipeline,
    /// Vision-language model: better on complex layouts. (default)
    #[default]
    Vlm,
}

impl ModelVariant {
    /// Wire name sent to the remote service.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::Pipeline => "pipeline",
            ModelVariant::Vlm => "vlm",
        }
    }
}

/// Configuration for parsing PDFs into notes.
///
/// # Example
/// ```rust
/// use pdf2note::ParseConfig;
///
/// let config = ParseConfig::builder()
///     .token("sk-...")
///     .ocr(true)
///     .batch_concurrency(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseConfig {
    /// Authentication token for the remote parsing service. Required before
    /// any parse starts; checked as a precondition, not at config build time,
    /// so a queue can be assembled before credentials arrive.
    pub token: Option<String>,

    /// Base URL of the remote parsing service.
    pub base_url: String,

    /// Model variant requested from the service. Default: [`ModelVariant::Vlm`].
    pub model: ModelVariant,

    /// Force OCR even for PDFs with an embedded text layer. Default: false.
    pub ocr: bool,

    /// Ask the service to recognise formulas. Default: true.
    pub formula: bool,

    /// Ask the service to recognise tables. Default: true.
    pub table: bool,

    /// Document language hint passed to the service, e.g. "en", "zh".
    /// Default: "en".
    pub language: String,

    /// Page-range string forwarded verbatim, e.g. "1-20" or "2,4-6".
    /// Empty means all pages.
    pub page_ranges: String,

    /// Cache root override. Default (`None`): the system temp directory.
    pub cache_dir: Option<PathBuf>,

    /// Delay between status polls in milliseconds. Default: 3000.
    pub poll_interval_ms: u64,

    /// Overall polling timeout in seconds. Exceeding it fails the job with a
    /// timeout error even though the remote side may still finish. Default: 1200.
    pub poll_timeout_secs: u64,

    /// Batch queue concurrency. Clamped to 1–5: the remote service throttles
    /// per-token, so more in-flight jobs only queue server-side. Default: 2.
    pub batch_concurrency: usize,

    /// Bounded concurrency for local image reads during import. Default: 8.
    pub image_concurrency: usize,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: "https://mineru.net/api/v4".to_string(),
            model: ModelVariant::default(),
            ocr: false,
            formula: true,
            table: true,
            language: "en".to_string(),
            page_ranges: String::new(),
            cache_dir: None,
            poll_interval_ms: 3000,
            poll_timeout_secs: 1200,
            batch_concurrency: 2,
            image_concurrency: 8,
        }
    }
}

impl ParseConfig {
    /// Create a new builder for `ParseConfig`.
    pub fn builder() -> ParseConfigBuilder {
        ParseConfigBuilder {
            config: Self::default(),
        }
    }

    /// Poll cadence as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Poll timeout as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Resolved cache root: the override, or the system temp directory.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Builder for [`ParseConfig`].
#[derive(Debug)]
pub struct ParseConfigBuilder {
    config: ParseConfig,
}

impl ParseConfigBuilder {
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn model(mut self, model: ModelVariant) -> Self {
        self.config.model = model;
        self
    }

    pub fn ocr(mut self, v: bool) -> Self {
        self.config.ocr = v;
        self
    }

    pub fn formula(mut self, v: bool) -> Self {
        self.config.formula = v;
        self
    }

    pub fn table(mut self, v: bool) -> Self {
        self.config.table = v;
        self
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.config.language = lang.into();
        self
    }

    pub fn page_ranges(mut self, ranges: impl Into<String>) -> Self {
        self.config.page_ranges = ranges.into();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms.max(100);
        self
    }

    pub fn poll_timeout_secs(mut self, secs: u64) -> Self {
        self.config.poll_timeout_secs = secs.max(1);
        self
    }

    pub fn batch_concurrency(mut self, n: usize) -> Self {
        self.config.batch_concurrency = n.clamp(1, 5);
        self
    }

    pub fn image_concurrency(mut self, n: usize) -> Self {
        self.config.image_concurrency = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ParseConfig, crate::error::ParseError> {
        let c = &self.config;
        if c.base_url.is_empty() {
            return Err(crate::error::ParseError::Internal(
                "base_url must not be empty".into(),
            ));
        }
        if !(1..=5).contains(&c.batch_concurrency) {
            return Err(crate::error::ParseError::Internal(format!(
                "batch_concurrency must be 1–5, got {}",
                c.batch_concurrency
            )));
        }
        Ok(self.config)
    }
}
