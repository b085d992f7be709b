//! CLI binary for edgequake-pdftranslate.
//!
//! A thin shim over [`TaskService`]: flags become a [`ServiceConfig`] and
//! [`ProviderOverrides`], each subcommand maps to one service operation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use edgequake_pdftranslate::pipeline::document::LopdfRenderer;
use edgequake_pdftranslate::pipeline::render::PdfiumRasterizer;
use edgequake_pdftranslate::{
    HttpBackend, InitialRange, LlmBackend, PageStatus, ProgressCallback, ProviderBackend,
    ProviderKind, ProviderOverrides, ProviderSettings, ServiceConfig, Task, TaskProgressCallback,
    TaskService, TranslationSettings,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
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

/// Live progress bar for page translation and formatting chunks. Pages
/// finish out of order, so per-page start times are keyed by page number.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    chunk_mode: AtomicBool,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            chunk_mode: AtomicBool::new(false),
        })
    }

    fn activate_bar(&self, total: usize, prefix: &'static str, unit: &str) {
        let template = format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  \
             [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {unit}  \
             ⏱ {{elapsed_precise}}  ETA {{eta_precise}}"
        );
        let style = ProgressStyle::with_template(&template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS);
        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix(prefix);
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&page_num)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl TaskProgressCallback for CliProgressCallback {
    fn on_pool_start(&self, _task_id: &str, pages: usize) {
        self.activate_bar(pages, "Translating", "pages");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Translating {pages} pages…"))
        ));
    }

    fn on_page_start(&self, _task_id: &str, page_num: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, _task_id: &str, page_num: usize, translated_len: usize) {
        let secs = self.elapsed_secs(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}  {:<8}  {}",
            green("✓"),
            page_num,
            dim(&format!("{translated_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, _task_id: &str, page_num: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);
        let msg: String = if error.chars().count() > 80 {
            format!("{}…", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}  {}  {}",
            red("✗"),
            page_num,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_pool_complete(&self, _task_id: &str, completed: usize, failed: usize) {
        self.finish();
        if failed == 0 {
            eprintln!(
                "{} {} pages translated",
                green("✔"),
                bold(&completed.to_string())
            );
        } else {
            eprintln!(
                "{} {} pages translated  ({} failed)",
                if completed == 0 { red("✘") } else { cyan("⚠") },
                bold(&completed.to_string()),
                red(&failed.to_string()),
            );
        }
    }

    fn on_chunk_complete(&self, _task_id: &str, completed: usize, total: usize) {
        if !self.chunk_mode.swap(true, Ordering::SeqCst) {
            self.activate_bar(total, "Formatting", "chunks");
        }
        self.bar.set_position(completed as u64);
    }

    fn on_formatting_complete(&self, _task_id: &str, success: bool) {
        self.finish();
        if success {
            eprintln!("{} formatting finished", green("✔"));
        } else {
            eprintln!("{} formatting failed", red("✘"));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Translate every page of a scan, showing progress
  pdftranslate create scan.pdf --wait

  # Only the first 3 pages, two at a time
  pdftranslate create scan.pdf --range first:3 --batch-limit 2

  # Re-translate one page with a different model
  pdftranslate --model gpt-4.1 retranslate <task-id> 4

  # Re-translate pages 5 to 9 in the background pool
  pdftranslate retranslate <task-id> --range 5-9

  # Exports
  pdftranslate export-txt <task-id>
  pdftranslate export-pdf <task-id>
  pdftranslate format <task-id>

  # Use any edgequake-llm provider (Ollama, Azure, OpenRouter, …)
  pdftranslate --llm-provider ollama --model llava create scan.pdf

RANGES:
  all         every page (default)
  first:N     the first N pages
  A-B         pages A through B; "-B" means 1-B, "A-" means A-last

ENVIRONMENT VARIABLES:
  PDFTRANSLATE_STORAGE      Storage root (default storage/pdf_tool)
  PDFTRANSLATE_PROVIDER     openai | gemini | anthropic
  PDFTRANSLATE_API_KEY      API key for the built-in provider
  PDFTRANSLATE_MODEL        Model ID
  PDFTRANSLATE_BASE_URL     Custom endpoint
  EDGEQUAKE_LLM_PROVIDER    Route calls through edgequake-llm instead
  PDFIUM_LIB_PATH           pdfium shared library (file or directory)
"#;

/// Translate scanned PDFs page by page with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdftranslate",
    version,
    about = "Translate scanned PDFs page by page with Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding one folder per task.
    #[arg(long, global = true, env = "PDFTRANSLATE_STORAGE", default_value = "storage/pdf_tool")]
    storage: PathBuf,

    /// URL prefix used for artifact links.
    #[arg(long, global = true, env = "PDFTRANSLATE_STATIC_PREFIX", default_value = "/pdf-data")]
    static_prefix: String,

    /// Provider protocol: openai, gemini, anthropic.
    #[arg(long, global = true, env = "PDFTRANSLATE_PROVIDER")]
    provider: Option<String>,

    /// Custom endpoint for the provider.
    #[arg(long, global = true, env = "PDFTRANSLATE_BASE_URL")]
    base_url: Option<String>,

    /// API key for the provider.
    #[arg(long, global = true, env = "PDFTRANSLATE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model ID.
    #[arg(long, global = true, env = "PDFTRANSLATE_MODEL")]
    model: Option<String>,

    /// Output token budget per call (≤ 0 means the default, 8192).
    #[arg(long, global = true, env = "PDFTRANSLATE_MAX_TOKENS")]
    max_tokens: Option<i64>,

    /// Per-call timeout in seconds.
    #[arg(long, global = true, env = "PDFTRANSLATE_TIMEOUT")]
    timeout: Option<u64>,

    /// Do not ask the model to preserve the page layout.
    #[arg(long, global = true, env = "PDFTRANSLATE_PLAIN_LAYOUT")]
    plain_layout: bool,

    /// Route provider calls through an edgequake-llm provider by name.
    #[arg(long, global = true, env = "EDGEQUAKE_LLM_PROVIDER")]
    llm_provider: Option<String>,

    /// Language pages are translated into.
    #[arg(long, global = true, env = "PDFTRANSLATE_TARGET_LANGUAGE")]
    target_language: Option<String>,

    /// Upper bound on concurrent page translations.
    #[arg(long, global = true, env = "PDFTRANSLATE_WORKERS", default_value_t = 4)]
    workers: usize,

    /// pdfium shared library (file or directory).
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Print JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFTRANSLATE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, env = "PDFTRANSLATE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a PDF and translate it.
    Create {
        pdf: PathBuf,
        /// Pages translated now: all, first:N or A-B.
        #[arg(long, default_value = "all")]
        range: String,
        /// Extra cap on concurrent page workers (0 = none).
        #[arg(long, default_value_t = 0)]
        batch_limit: i64,
        /// Show progress and print the task once translation has finished.
        #[arg(long)]
        wait: bool,
    },
    /// Show one task.
    Get { id: String },
    /// List all tasks, newest first.
    List,
    /// Delete a task and its files.
    Delete { id: String },
    /// Re-translate one page, or a range of pages with --range.
    Retranslate {
        id: String,
        page: Option<usize>,
        #[arg(long, conflicts_with = "page")]
        range: Option<String>,
        #[arg(long, default_value_t = 0)]
        batch_limit: i64,
    },
    /// Run the AI layout pass and write formatted.txt.
    Format { id: String },
    /// Write combined.txt.
    ExportTxt { id: String },
    /// Write combined.pdf.
    ExportPdf { id: String },
    /// Reset tasks left mid-work by a previous process.
    Recover,
}

impl Command {
    fn shows_progress(&self) -> bool {
        matches!(
            self,
            Command::Create { wait: true, .. }
                | Command::Retranslate { range: Some(_), .. }
                | Command::Format { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs while it is on screen.
    let show_progress = !cli.quiet && !cli.json && cli.command.shows_progress();
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

    let progress: Option<Arc<CliProgressCallback>> = show_progress.then(CliProgressCallback::new);
    let service = build_service(&cli, progress.clone().map(|p| p as ProgressCallback))?;
    let overrides = build_overrides(&cli);

    let result = run(&cli, &service, &overrides).await;
    if let Some(p) = progress {
        p.finish();
    }
    result
}

async fn run(cli: &Cli, service: &TaskService, overrides: &ProviderOverrides) -> Result<()> {
    match &cli.command {
        Command::Create {
            pdf,
            range,
            batch_limit,
            wait,
        } => {
            let settings = TranslationSettings {
                range: parse_range(range)?,
                batch_limit: *batch_limit,
            };
            let bytes = tokio::fs::read(pdf)
                .await
                .with_context(|| format!("Failed to read {}", pdf.display()))?;
            let file_name = pdf
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let created = service
                .create_task(&bytes, &file_name, overrides, settings)
                .await
                .context("Task creation failed")?;
            let id = created.task.id.clone();
            if !*wait {
                print_task(cli, &created.task)?;
            }
            // The pool lives in this process; leaving early would abandon it.
            if let Some(handle) = created.translation {
                handle.await.context("Translation pool panicked")?;
            }
            if *wait {
                let task = service.get_task(&id).await?;
                print_task(cli, &task)?;
            }
        }
        Command::Get { id } => {
            let task = service.get_task(id).await?;
            print_task(cli, &task)?;
        }
        Command::List => {
            let tasks = service.list_tasks().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                eprintln!("{}", dim("no tasks"));
            } else {
                for t in tasks {
                    println!(
                        "{}  {:<32}  {:>3} pages  {} done  {} pending  {} failed  {}",
                        bold(&t.id),
                        t.file_name,
                        t.total_pages,
                        green(&t.completed_pages.to_string()),
                        t.pending_pages,
                        red(&t.error_pages.to_string()),
                        dim(&t.updated_at.to_rfc3339()),
                    );
                }
            }
        }
        Command::Delete { id } => {
            service.delete_task(id).await?;
            if !cli.quiet {
                eprintln!("{} deleted {}", green("✔"), id);
            }
        }
        Command::Retranslate {
            id,
            page: Some(page),
            ..
        } => {
            let (_, page) = service.retranslate_page(id, *page, overrides).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&page.view())?);
            } else if page.status == PageStatus::Error {
                bail!(
                    "page {} failed: {}",
                    page.page_number,
                    page.error.as_deref().unwrap_or("unknown error")
                );
            } else {
                println!("{}", page.translation);
            }
        }
        Command::Retranslate {
            id,
            page: None,
            range,
            batch_limit,
        } => {
            let settings = TranslationSettings {
                range: parse_range(range.as_deref().unwrap_or("all"))?,
                batch_limit: *batch_limit,
            };
            if let Some(handle) = service.retranslate_range(id, settings, overrides).await? {
                handle.await.context("Translation pool panicked")?;
            }
            let task = service.get_task(id).await?;
            print_task(cli, &task)?;
        }
        Command::Format { id } => {
            let (_, url) = service
                .run_formatting(id, overrides)
                .await
                .context("Formatting failed")?;
            print_url(cli, &url)?;
        }
        Command::ExportTxt { id } => {
            let (_, url) = service.merge_text(id).await?;
            print_url(cli, &url)?;
        }
        Command::ExportPdf { id } => {
            let (_, url) = service.merge_document(id).await?;
            print_url(cli, &url)?;
        }
        Command::Recover => {
            let n = service.recover_interrupted().await?;
            if cli.json {
                println!("{}", serde_json::json!({ "recovered": n }));
            } else {
                println!("{n} task(s) recovered");
            }
        }
    }
    Ok(())
}

/// Map global flags to the service and its collaborators.
fn build_service(cli: &Cli, progress: Option<ProgressCallback>) -> Result<TaskService> {
    let mut defaults = ProviderSettings::default();
    let backend: Arc<dyn ProviderBackend> = match cli.llm_provider.as_deref() {
        Some(name) => {
            // Keys come from the provider's own environment variables.
            defaults.api_key = format!("edgequake-llm:{name}");
            defaults.model = cli.model.clone().unwrap_or_else(|| "gpt-4.1-nano".into());
            Arc::new(
                LlmBackend::from_factory(name, cli.model.as_deref())
                    .context("LLM provider setup failed")?,
            )
        }
        None => {
            defaults.kind = ProviderKind::normalize(cli.provider.as_deref().unwrap_or("openai"));
            Arc::new(HttpBackend)
        }
    };

    let mut builder = ServiceConfig::builder()
        .storage_dir(&cli.storage)
        .static_prefix(&cli.static_prefix)
        .max_workers(cli.workers)
        .default_provider(defaults);
    if let Some(lang) = &cli.target_language {
        builder = builder.target_language(lang.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    let config = builder.build().context("Invalid configuration")?;

    let mut rasterizer = PdfiumRasterizer::default();
    if let Some(path) = &cli.pdfium_lib {
        rasterizer = rasterizer.with_library_path(path);
    }
    Ok(TaskService::with_components(
        config,
        backend,
        Arc::new(rasterizer),
        Arc::new(LopdfRenderer),
    ))
}

fn build_overrides(cli: &Cli) -> ProviderOverrides {
    ProviderOverrides {
        kind: cli.llm_provider.is_none().then(|| cli.provider.clone()).flatten(),
        base_url: cli.base_url.clone(),
        api_key: cli.api_key.clone(),
        model: cli.model.clone(),
        max_tokens: cli.max_tokens,
        timeout: cli.timeout.map(Duration::from_secs),
        optimize_layout: cli.plain_layout.then_some(false),
    }
}

/// Parse `--range`: `all`, `first:N`, `A-B`, `-B` or `A-`.
fn parse_range(s: &str) -> Result<InitialRange> {
    let s = s.trim().to_lowercase();
    if s.is_empty() || s == "all" {
        return Ok(InitialRange::All);
    }
    if let Some(n) = s.strip_prefix("first:") {
        let n: i64 = n.trim().parse().context("Invalid page count in first:N")?;
        return Ok(InitialRange::First(n));
    }
    if let Some((start, end)) = s.split_once('-') {
        let bound = |v: &str, what: &str| -> Result<i64> {
            if v.trim().is_empty() {
                Ok(0)
            } else {
                v.trim()
                    .parse()
                    .with_context(|| format!("Invalid {what} page in range"))
            }
        };
        return Ok(InitialRange::Range(bound(start, "start")?, bound(end, "end")?));
    }
    bail!("Invalid range '{s}': expected all, first:N or A-B")
}

fn print_task(cli: &Cli, task: &Task) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&task.view())?);
        return Ok(());
    }
    println!("{}  {}", bold(&task.id), task.file_name);
    println!(
        "   {} pages  {} done  {} pending  {} failed",
        task.total_pages,
        green(&task.count_status(PageStatus::Completed).to_string()),
        task.count_status(PageStatus::Pending),
        red(&task.count_status(PageStatus::Error).to_string()),
    );
    for page in &task.pages {
        let mark = match page.status {
            PageStatus::Completed if page.skipped => dim("–"),
            PageStatus::Completed => green("✓"),
            PageStatus::Pending => cyan("…"),
            PageStatus::Error => red("✗"),
        };
        let detail = match (&page.status, &page.error) {
            (PageStatus::Error, Some(e)) => red(e),
            _ if page.skipped => dim("skipped"),
            _ => dim(&format!("{} chars", page.translation.chars().count())),
        };
        println!("   {mark} Page {:>3}  {detail}", page.page_number);
    }
    if let Some(url) = &task.formatted_txt_url {
        println!("   formatted: {url}");
    }
    Ok(())
}

fn print_url(cli: &Cli, url: &str) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::json!({ "url": url }));
    } else {
        println!("{url}");
    }
    Ok(())
}
