//! CLI binary for edgequake-ocr2md.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig`, wires the OCR backend and stores, and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ocr2md::pipeline::{render::PageRenderer, vision};
use edgequake_ocr2md::{
    load_input, reconcile, ConversionConfig, ConversionProgressCallback, DocumentOrchestrator,
    FsBlobStore, HttpOcrBackend, JobStatus, MemoryJobStore, OcrBackend, OcrGateway, OcrMode,
    PageSelection, PageSeparator, PdfiumRenderer, ProgressCallback, ReconcileStrategy,
    VisionOcrBackend,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per resolved page. Pages resolve out
/// of order, so start times are tracked per page.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rendering pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Recognizing");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&page_num)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, markdown_len: usize) {
        let secs = self.elapsed_secs(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{markdown_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);

        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_pages: usize, success_count: usize, from_cache: bool) {
        self.bar.finish_and_clear();
        let failed = total_pages.saturating_sub(success_count);

        if from_cache {
            eprintln!("{} cached result, {} pages", green("✔"), bold(&total_pages.to_string()));
        } else if failed == 0 {
            eprintln!(
                "{} {} pages converted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages converted  ({} failed)",
                if failed == total_pages { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Scanned PDF through an OCR service, Markdown to stdout
  ocr2md --ocr-endpoint http://localhost:8000/ocr scan.pdf

  # Write to a file, crops under ./artifacts
  ocr2md --ocr-endpoint http://localhost:8000/ocr --store-dir artifacts scan.pdf -o scan.md

  # No OCR service: a grounding-capable vision model via edgequake-llm
  ocr2md --provider openai --model gpt-4.1 scan.pdf

  # Only pages 3 to 7, JSON job report
  ocr2md --pages 3-7 --json scan.pdf > job.json

  # Compare with the anchor-matching strategy
  ocr2md --strategy legacy --provider openai scan.pdf

  # Inspect PDF metadata (no OCR)
  ocr2md --inspect-only scan.pdf

OCR SERVICE CONTRACT:
  POST {endpoint}  {"image": "<base64 png>", "mode": "grounding", "page": 1}
  200 OK           {"markdown": "... <|image|> ...", "regions": [[x1,y1,x2,y2], ...]}
  Coordinates are on a 0..999 grid. 429 and 5xx are retried with backoff.

ENVIRONMENT VARIABLES:
  OCR2MD_OCR_ENDPOINT     OCR service URL
  OCR2MD_OCR_API_KEY      Bearer token for the OCR service
  OPENAI_API_KEY          Vision provider key (when no endpoint is set)
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Convert scanned PDF files to Markdown with positioned images.
#[derive(Parser, Debug)]
#[command(
    name = "ocr2md",
    version,
    about = "Convert scanned PDF files to Markdown with positioned images",
    long_about = "Convert scanned PDF documents (local files or URLs) to Markdown. Pages are \
rasterised, sent to a grounding OCR service that marks every figure with a placeholder and a \
bounding box, and the cropped figures are substituted back in order.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "OCR2MD_OUTPUT")]
    output: Option<PathBuf>,

    /// OCR service endpoint. Without it a vision model is used.
    #[arg(long, env = "OCR2MD_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// Bearer token sent to the OCR service.
    #[arg(long, env = "OCR2MD_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,

    /// Model name forwarded to the OCR service.
    #[arg(long, env = "OCR2MD_OCR_MODEL")]
    ocr_model: Option<String>,

    /// Vision provider for grounding OCR or the legacy strategy.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Vision model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Directory where crops and results are stored.
    #[arg(long, env = "OCR2MD_STORE_DIR", default_value = "ocr2md-artifacts")]
    store_dir: PathBuf,

    /// Base URL for image links instead of file:// paths.
    #[arg(long, env = "OCR2MD_BASE_URL")]
    base_url: Option<String>,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "OCR2MD_PAGES", default_value = "all")]
    pages: String,

    /// Page separator: comment, hr, or custom string ({page} is replaced).
    #[arg(long, env = "OCR2MD_SEPARATOR", default_value = "comment")]
    separator: String,

    /// Reconciliation strategy.
    #[arg(long, env = "OCR2MD_STRATEGY", value_enum, default_value = "placeholder")]
    strategy: StrategyArg,

    /// OCR recognition mode.
    #[arg(long, env = "OCR2MD_MODE", value_enum, default_value = "grounding")]
    mode: ModeArg,

    /// Pages processed at once.
    #[arg(short, long, env = "OCR2MD_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Longest edge of rendered pages in pixels.
    #[arg(long, env = "OCR2MD_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// Retries per page on transient OCR failure.
    #[arg(long, env = "OCR2MD_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per retry.
    #[arg(long, env = "OCR2MD_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Upper bound of one retry delay in milliseconds.
    #[arg(long, env = "OCR2MD_MAX_BACKOFF_MS", default_value_t = 8000)]
    max_backoff_ms: u64,

    /// Per-page OCR call timeout in seconds.
    #[arg(long, env = "OCR2MD_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "OCR2MD_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "OCR2MD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Text rendered where an image is missing.
    #[arg(long, env = "OCR2MD_OMISSION_MARKER")]
    omission_marker: Option<String>,

    /// Output the full job report as JSON instead of Markdown.
    #[arg(long, env = "OCR2MD_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "OCR2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Print PDF metadata only, no conversion.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OCR2MD_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Placeholder,
    Legacy,
}

impl From<StrategyArg> for ReconcileStrategy {
    fn from(v: StrategyArg) -> Self {
        match v {
            StrategyArg::Placeholder => ReconcileStrategy::Placeholder,
            StrategyArg::Legacy => ReconcileStrategy::LegacyAnchor,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Grounding,
    Free,
}

impl From<ModeArg> for OcrMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Grounding => OcrMode::Grounding,
            ModeArg::Free => OcrMode::Free,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let bytes = load_input(&cli.input, cli.download_timeout)
        .await
        .context("Failed to load input")?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let password = cli.password.clone();
        let renderer = PdfiumRenderer::new(cli.max_pixels);
        let meta = tokio::task::spawn_blocking(move || renderer.inspect(&bytes, password.as_deref()))
            .await
            .context("Inspect task panicked")?
            .context("Failed to inspect PDF")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
            );
        } else {
            println!("File:         {}", cli.input);
            if let Some(ref t) = meta.title {
                println!("Title:        {}", t);
            }
            if let Some(ref a) = meta.author {
                println!("Author:       {}", a);
            }
            println!("Pages:        {}", meta.page_count);
            println!("PDF Version:  {}", meta.pdf_version);
            if let Some(ref p) = meta.producer {
                println!("Producer:     {}", p);
            }
        }
        return Ok(());
    }

    // ── Build config and collaborators ───────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    let needs_provider =
        cli.ocr_endpoint.is_none() || config.strategy == ReconcileStrategy::LegacyAnchor;
    let provider = if needs_provider {
        Some(
            vision::resolve_provider(cli.provider.as_deref(), cli.model.as_deref())
                .context("No OCR backend available")?,
        )
    } else {
        None
    };

    let backend: Arc<dyn OcrBackend> = match (&cli.ocr_endpoint, &provider) {
        (Some(endpoint), _) => {
            let mut http = HttpOcrBackend::new(endpoint.clone());
            if let Some(ref key) = cli.ocr_api_key {
                http = http.with_api_key(key.clone());
            }
            if let Some(ref model) = cli.ocr_model {
                http = http.with_model(model.clone());
            }
            Arc::new(http)
        }
        (None, Some(provider)) => Arc::new(VisionOcrBackend::new(Arc::clone(provider))),
        (None, None) => anyhow::bail!("Set --ocr-endpoint or a vision provider"),
    };

    let mut store = FsBlobStore::new(cli.store_dir.clone());
    if let Some(ref base) = cli.base_url {
        store = store.with_base_url(base.clone());
    }

    let gateway = OcrGateway::new(backend, config.ocr_mode, config.api_timeout());
    let reconciler = reconcile::for_strategy(&config, provider)?;
    let renderer = Arc::new(PdfiumRenderer::new(config.max_rendered_pixels));
    let orchestrator = DocumentOrchestrator::new(
        config,
        renderer,
        gateway,
        Arc::new(store),
        Arc::new(MemoryJobStore::new()),
        reconciler,
    );

    // ── Run conversion ───────────────────────────────────────────────────
    let job = orchestrator.process(&bytes).await.context("Conversion failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&job).context("Failed to serialise job")?;
        println!("{json}");
    } else if let Some(ref output_path) = cli.output {
        tokio::fs::write(output_path, job.markdown.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", output_path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{}  {}/{} pages  {}ms  →  {}",
                if job.status == JobStatus::Completed { green("✔") } else { cyan("⚠") },
                job.done_count(),
                job.pages.len(),
                job.duration_ms,
                bold(&output_path.display().to_string()),
            );
        }
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(job.markdown.as_bytes())
            .context("Failed to write to stdout")?;
    }

    let failed = job.failed_pages();
    if !cli.quiet && !failed.is_empty() {
        for page in job.pages.iter().filter_map(|p| p.error.as_ref()) {
            eprintln!("  {}", dim(&page.to_string()));
        }
        let list: Vec<String> = failed.iter().map(|p| p.to_string()).collect();
        eprintln!("Resubmit the failed pages with --pages {}", list.join(","));
    }
    if job.status == JobStatus::Failed {
        anyhow::bail!("No page could be converted");
    }

    Ok(())
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .max_rendered_pixels(cli.max_pixels)
        .concurrency(cli.concurrency)
        .ocr_mode(cli.mode.into())
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .max_backoff_ms(cli.max_backoff_ms)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .pages(parse_pages(&cli.pages)?)
        .page_separator(parse_separator(&cli.separator))
        .strategy(cli.strategy.into());

    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(ref marker) = cli.omission_marker {
        builder = builder.omission_marker(marker.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start.trim().parse().context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;
        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!("Invalid page range '{}-{}': start must be <= end", start, end);
        }
        return Ok(PageSelection::Range(start, end));
    }

    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;
        if pages.contains(&0) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1");
        }
        return Ok(PageSelection::Set(pages));
    }

    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }
    Ok(PageSelection::Single(page))
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "comment" => PageSeparator::Comment,
        "hr" | "---" => PageSeparator::HorizontalRule,
        _ => PageSeparator::Custom(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_parse() {
        assert_eq!(parse_pages("all").unwrap(), PageSelection::All);
        assert_eq!(parse_pages("5").unwrap(), PageSelection::Single(5));
        assert_eq!(parse_pages("3-7").unwrap(), PageSelection::Range(3, 7));
        assert_eq!(parse_pages("1, 3,5").unwrap(), PageSelection::Set(vec![1, 3, 5]));
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("7-3").is_err());
        assert!(parse_pages("x").is_err());
    }

    #[test]
    fn separator_parse() {
        assert_eq!(parse_separator("comment"), PageSeparator::Comment);
        assert_eq!(parse_separator("HR"), PageSeparator::HorizontalRule);
        assert_eq!(
            parse_separator("== {page} =="),
            PageSeparator::Custom("== {page} ==".into())
        );
    }
}
