//! CLI binary for pdf2note.
//!
//! A thin shim over the library crate: maps CLI flags to `ParseConfig`,
//! drives one parse against an in-memory store, and prints the resulting
//! note body.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdf2note::{
    AttachmentRef, DocumentRef, DocumentStore, HttpRemoteClient, IdentityConverter, MemoryStore,
    ModelVariant, ParseCallbacks, ParseConfig, ParsePipeline, ParseStage,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one continuous bar across the remote and
/// local phases, plus a cancellation flag wired to Ctrl-C.
struct CliCallbacks {
    bar: ProgressBar,
    cancelled: Arc<AtomicBool>,
}

impl CliCallbacks {
    fn new(cancelled: Arc<AtomicBool>) -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:40.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        bar.set_style(style);
        bar.set_prefix("Parsing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar, cancelled }
    }
}

impl ParseCallbacks for CliCallbacks {
    fn on_status_change(&self, stage: ParseStage, text: &str) {
        if !stage.is_terminal() {
            self.bar.set_message(text.to_string());
        }
    }

    fn on_progress(&self, percent: u8) {
        self.bar.set_position(u64::from(percent));
    }

    fn should_cancel(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Parse a PDF, print the note body to stdout
  pdf2note paper.pdf

  # Write the note body to a file
  pdf2note paper.pdf -o paper-note.md

  # Force OCR, Chinese documents, pages 1-20 only
  pdf2note --ocr --language zh --pages 1-20 scan.pdf

  # Skip the cache and parse fresh
  pdf2note --force paper.pdf

ENVIRONMENT VARIABLES:
  PDF2NOTE_TOKEN      Parsing-service token (alternative to --token)
  PDF2NOTE_BASE_URL   Service base URL override
  RUST_LOG            Log filter, e.g. RUST_LOG=pdf2note=debug
"#;

/// Parse a PDF into a structured note via the remote parsing service.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2note",
    version,
    about = "Parse PDF documents into structured notes via a remote parsing service",
    after_help = AFTER_HELP
)]
struct Cli {
    /// Path to the PDF file.
    input: PathBuf,

    /// Write the note body here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Parsing-service token.
    #[arg(long, env = "PDF2NOTE_TOKEN")]
    token: Option<String>,

    /// Service base URL.
    #[arg(long, env = "PDF2NOTE_BASE_URL")]
    base_url: Option<String>,

    /// Model variant: pipeline | vlm.
    #[arg(long, default_value = "vlm")]
    model: String,

    /// Force OCR even when the PDF has a text layer.
    #[arg(long)]
    ocr: bool,

    /// Disable formula recognition.
    #[arg(long)]
    no_formula: bool,

    /// Disable table recognition.
    #[arg(long)]
    no_table: bool,

    /// Document language hint.
    #[arg(long, default_value = "en")]
    language: String,

    /// Page ranges, e.g. "1-20" or "2,4-6". Empty = all pages.
    #[arg(long, default_value = "")]
    pages: String,

    /// Cache directory override.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 3000)]
    poll_interval_ms: u64,

    /// Poll timeout in seconds.
    #[arg(long, default_value_t = 1200)]
    poll_timeout: u64,

    /// Skip the result cache and parse fresh.
    #[arg(long)]
    force: bool,
}

fn build_config(cli: &Cli) -> Result<ParseConfig> {
    let model = match cli.model.as_str() {
        "pipeline" => ModelVariant::Pipeline,
        "vlm" => ModelVariant::Vlm,
        other => anyhow::bail!("unknown model variant '{other}' (expected pipeline | vlm)"),
    };
    let mut builder = ParseConfig::builder()
        .model(model)
        .ocr(cli.ocr)
        .formula(!cli.no_formula)
        .table(!cli.no_table)
        .language(&cli.language)
        .page_ranges(&cli.pages)
        .poll_interval_ms(cli.poll_interval_ms)
        .poll_timeout_secs(cli.poll_timeout);
    if let Some(ref token) = cli.token {
        builder = builder.token(token);
    }
    if let Some(ref url) = cli.base_url {
        builder = builder.base_url(url);
    }
    if let Some(ref dir) = cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let input = cli
        .input
        .canonicalize()
        .with_context(|| format!("cannot open '{}'", cli.input.display()))?;
    let filename = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".into());
    let meta = std::fs::metadata(&input)?;

    // One in-memory document wrapping the file on disk.
    let document = DocumentRef {
        id: filename.clone(),
        title: filename
            .trim_end_matches(".pdf")
            .trim_end_matches(".PDF")
            .to_string(),
        item_type: "document".into(),
    };
    let attachment = AttachmentRef {
        id: format!("file-{filename}"),
        path: input,
        filename,
        size: Some(meta.len()),
        mtime: None,
    };

    let remote = Arc::new(HttpRemoteClient::new(&config)?);
    let store = Arc::new(MemoryStore::new());
    store.add_document(document.clone());
    let converter = Arc::new(IdentityConverter::new());
    let pipeline = ParsePipeline::new(config, remote, store.clone(), converter);

    // Ctrl-C requests cooperative cancellation; the pipeline observes it at
    // its next checkpoint.
    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ncancelling…");
                cancelled.store(true, Ordering::SeqCst);
            }
        });
    }

    let callbacks = CliCallbacks::new(cancelled);
    let result = pipeline
        .parse(&document, &attachment, cli.force, &callbacks)
        .await;
    callbacks.bar.finish_and_clear();

    match result {
        Ok(note) => {
            let body = store.get_note_body(&note).await?;
            match cli.output {
                Some(path) => {
                    std::fs::write(&path, &body)
                        .with_context(|| format!("writing '{}'", path.display()))?;
                    eprintln!("{} note written to {}", green("✔"), bold(&path.display().to_string()));
                }
                None => println!("{body}"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {e}", red("✘"));
            std::process::exit(1);
        }
    }
}
