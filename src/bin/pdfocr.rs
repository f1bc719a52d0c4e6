//! CLI binary for edgequake-ocr.
//!
//! A thin shim over the library crate: maps CLI flags onto the config
//! builders, submits every input as a job, and prints the results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ocr::pipeline::input::load_input;
use edgequake_ocr::{
    DocumentPipeline, JobId, JobOutcome, JobSnapshot, JobState, PageStatus, PipelineConfig,
    StandardRasterizer, SubmitOptions, VisionOcrConfig, VisionOcrEngine,
};
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
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

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract text (stdout)
  pdfocr scan.pdf

  # Several documents at once, shared worker pool
  pdfocr a.pdf b.pdf receipt.jpg -o out.txt

  # Page markers and a lower DPI for faster runs
  pdfocr --separator marker --dpi 200 book.pdf

  # From URL
  pdfocr https://arxiv.org/pdf/1706.03762

  # Full per-page results with confidence
  pdfocr --json scan.pdf > result.json

SUPPORTED INPUTS:
  PDF, PNG, JPEG, TIFF, BMP, GIF, WebP (images are single-page documents)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  RUST_LOG                Log filter, overrides --verbose
"#;

#[derive(Parser, Debug)]
#[command(
    name = "pdfocr",
    version,
    about = "Extract text from scanned documents with OCR",
    long_about = "Rasterise each page of a document (local file or URL) and recognise its text \
with a vision model. Pages are processed in parallel on a bounded worker pool; results keep \
page order and report a confidence per page.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Documents to process: local paths or http(s) URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Write text to this file instead of stdout.
    #[arg(short, long, env = "PDFOCR_OUTPUT")]
    output: Option<PathBuf>,

    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    #[arg(long, env = "PDFOCR_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Worker pool size. Default: available parallelism.
    #[arg(short, long, env = "PDFOCR_WORKERS")]
    workers: Option<usize>,

    #[arg(long, env = "PDFOCR_MAX_PAGES", default_value_t = 500)]
    max_pages: usize,

    #[arg(long, env = "PDFOCR_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    #[arg(long, env = "PDFOCR_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    #[arg(long, env = "PDFOCR_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    #[arg(long, env = "PDFOCR_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// File containing a replacement system prompt.
    #[arg(long, env = "PDFOCR_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Send colour pages to the model as-is instead of greyscale.
    #[arg(long, env = "PDFOCR_COLOR")]
    color: bool,

    #[arg(long, env = "PDFOCR_SEPARATOR", value_enum, default_value = "blank")]
    separator: SeparatorArg,

    /// Print the full job snapshot as JSON.
    #[arg(long, env = "PDFOCR_JSON")]
    json: bool,

    #[arg(long, env = "PDFOCR_NO_PROGRESS")]
    no_progress: bool,

    #[arg(short, long, env = "PDFOCR_VERBOSE")]
    verbose: bool,

    #[arg(short, long, env = "PDFOCR_QUIET")]
    quiet: bool,

    #[arg(long, env = "PDFOCR_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    #[arg(long, env = "PDFOCR_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SeparatorArg {
    /// A blank line between pages.
    Blank,
    /// A `---` rule between pages.
    Rule,
    /// A `--- page N ---` line before each page.
    Marker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would fight the progress bars for the terminal.
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

    // ── Build pipeline ───────────────────────────────────────────────────
    let (pipeline_config, vision_config) = build_config(&cli).await?;
    let engine = VisionOcrEngine::new(vision_config).context("Failed to set up OCR engine")?;
    let rasterizer = match cli.pdfium_lib {
        Some(ref path) => StandardRasterizer::with_pdfium_library(path),
        None => StandardRasterizer::new(),
    };
    let pipeline = DocumentPipeline::new(pipeline_config, Arc::new(rasterizer), Arc::new(engine))
        .context("Failed to start pipeline")?;

    // ── Submit every input ───────────────────────────────────────────────
    let mut jobs: Vec<(String, JobId)> = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let bytes = load_input(input, cli.download_timeout)
            .await
            .with_context(|| format!("Failed to load '{input}'"))?;
        let id = pipeline
            .submit(bytes, SubmitOptions::default())
            .with_context(|| format!("Failed to submit '{input}'"))?;
        jobs.push((input.clone(), id));
    }

    // ── Wait, with progress, and cancel on Ctrl-C ────────────────────────
    let bars = show_progress.then(MultiProgress::new);
    let waits = jobs.iter().map(|(input, id)| {
        let pipeline = pipeline.clone();
        let bar = bars.as_ref().map(|m| m.add(job_bar(input)));
        let id = *id;
        async move { track(&pipeline, id, bar).await }
    });
    let all = futures::future::join_all(waits);

    let snapshots = tokio::select! {
        snapshots = all => snapshots,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{} interrupted, cancelling jobs", red("✘"));
            for (_, id) in &jobs {
                // Already-finished jobs refuse the cancel; that is fine.
                let _ = pipeline.cancel(*id);
            }
            pipeline.shutdown().await;
            anyhow::bail!("Interrupted");
        }
    };
    let snapshots: Vec<JobSnapshot> = snapshots.into_iter().collect::<Result<_>>()?;

    // ── Output ───────────────────────────────────────────────────────────
    let failed = write_results(&cli, &jobs, &snapshots)?;
    pipeline.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{failed} of {} documents failed", jobs.len());
    }
    Ok(())
}

fn job_bar(input: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(TICKS);
    bar.set_style(style);
    bar.set_prefix(short_name(input));
    bar.set_message("queued");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn activate_bar(bar: &ProgressBar, total: usize) {
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  \
         [{bar:42.green/238}] {pos:>3}/{len} pages  \
         ⏱ {elapsed_precise}  ETA {eta_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS);
    bar.set_length(total as u64);
    bar.set_style(style);
    bar.reset_eta();
}

fn short_name(input: &str) -> String {
    let name = input.rsplit(['/', '\\']).next().unwrap_or(input);
    if name.chars().count() > 24 {
        let head: String = name.chars().take(23).collect();
        format!("{head}…")
    } else {
        name.to_string()
    }
}

/// Follow one job to its terminal snapshot, updating `bar` as it goes.
async fn track(
    pipeline: &DocumentPipeline,
    id: JobId,
    bar: Option<ProgressBar>,
) -> Result<JobSnapshot> {
    let Some(bar) = bar else {
        return pipeline.wait(id).await.context("Job disappeared");
    };

    let mut updates = pipeline.watch(id).context("Job disappeared")?;
    let mut activated = false;
    let mut last = None;
    while let Some(snap) = updates.next().await {
        if let (false, Some(total)) = (activated, snap.page_count) {
            activate_bar(&bar, total);
            activated = true;
        }
        bar.set_position(snap.finished_pages() as u64);
        bar.set_message(format!("{:?}", snap.state).to_lowercase());
        last = Some(snap);
    }

    match last {
        Some(snap) if snap.is_terminal() => {
            let mark = match snap.state {
                JobState::Completed => green("✓"),
                _ => red("✗"),
            };
            bar.finish_with_message(mark);
            Ok(snap)
        }
        _ => {
            bar.abandon();
            pipeline.wait(id).await.context("Job disappeared")
        }
    }
}

/// Print every job's result. Returns how many jobs failed.
fn write_results(cli: &Cli, jobs: &[(String, JobId)], snapshots: &[JobSnapshot]) -> Result<usize> {
    let mut out: Box<dyn Write> = match cli.output {
        Some(ref path) => Box::new(io::BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    if cli.json {
        let entries: Vec<serde_json::Value> = jobs
            .iter()
            .zip(snapshots)
            .map(|((input, _), snap)| serde_json::json!({ "input": input, "job": snap }))
            .collect();
        let json = serde_json::to_string_pretty(&entries).context("Failed to serialise output")?;
        writeln!(out, "{json}").context("Failed to write output")?;
    }

    let mut failed = 0;
    for ((input, _), snap) in jobs.iter().zip(snapshots) {
        match snap.outcome.as_deref() {
            Some(JobOutcome::Completed(result)) => {
                if !cli.json {
                    if jobs.len() > 1 {
                        writeln!(out, "==> {input} <==")?;
                    }
                    write_pages(&mut out, result, cli.separator)?;
                }
                if !cli.quiet {
                    let s = &result.stats;
                    let conf = s
                        .mean_confidence
                        .map(|c| format!("{:.0}%", c * 100.0))
                        .unwrap_or_else(|| "n/a".into());
                    eprintln!(
                        "{}  {}  {}/{} pages  {}  {}",
                        if s.failed_pages == 0 { green("✔") } else { cyan("⚠") },
                        bold(&short_name(input)),
                        s.succeeded_pages,
                        s.total_pages,
                        dim(&format!("confidence {conf}")),
                        dim(&format!("{:.1}s", s.total_duration_ms as f64 / 1000.0)),
                    );
                    for page in result.pages.iter().filter(|p| !p.is_success()) {
                        if let Some(ref e) = page.error {
                            eprintln!("   {} {}", red("✗"), red(&e.to_string()));
                        }
                    }
                }
            }
            Some(JobOutcome::Failed(error)) => {
                failed += 1;
                eprintln!("{}  {}  {}", red("✘"), bold(&short_name(input)), red(&error.to_string()));
            }
            None => {
                failed += 1;
                eprintln!("{}  {}  no result", red("✘"), bold(&short_name(input)));
            }
        }
    }

    out.flush().context("Failed to write output")?;
    Ok(failed)
}

fn write_pages(
    out: &mut dyn Write,
    result: &edgequake_ocr::DocumentResult,
    separator: SeparatorArg,
) -> Result<()> {
    let mut first = true;
    for page in &result.pages {
        if page.status != PageStatus::Completed {
            continue;
        }
        match separator {
            SeparatorArg::Blank if !first => writeln!(out)?,
            SeparatorArg::Rule if !first => writeln!(out, "\n---\n")?,
            SeparatorArg::Marker => writeln!(out, "--- page {} ---", page.index + 1)?,
            _ => {}
        }
        if !page.text.is_empty() {
            writeln!(out, "{}", page.text)?;
        }
        first = false;
    }
    Ok(())
}

async fn build_config(cli: &Cli) -> Result<(PipelineConfig, VisionOcrConfig)> {
    let system_prompt = match cli.system_prompt {
        Some(ref path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {path:?}"))?,
        ),
        None => None,
    };

    let mut pipeline = PipelineConfig::builder()
        .dpi(cli.dpi)
        .max_pages(cli.max_pages)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms);
    if let Some(workers) = cli.workers {
        pipeline = pipeline.workers(workers);
    }
    let pipeline = pipeline.build().context("Invalid configuration")?;

    let mut vision = VisionOcrConfig::builder()
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .api_timeout_secs(cli.api_timeout)
        .grayscale(!cli.color);
    if let Some(ref model) = cli.model {
        vision = vision.model(model);
    }
    if let Some(ref provider) = cli.provider {
        vision = vision.provider_name(provider);
    }
    if let Some(prompt) = system_prompt {
        vision = vision.system_prompt(prompt);
    }
    let vision = vision.build().context("Invalid OCR configuration")?;

    Ok((pipeline, vision))
}
