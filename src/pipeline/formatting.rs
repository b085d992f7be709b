//! Chunked AI formatting of a task's combined translation.
//!
//! ## Flow
//!
//! ```text
//! combined text ──▶ split ──▶ N chunk futures ──▶ join by index ──▶ formatted.txt
//!                    │          (AdaptiveLimiter,     │
//!                    │           retry/throttle)      └─ progress persisted per chunk
//!                    └─ formatter_chunks/chunk-NNN.txt (removed after the run)
//! ```
//!
//! ## Concurrency
//!
//! Chunks start with up to `worker_cap` concurrent provider calls. The first
//! throttle signal (rate limiting or a truncated reply) lowers the cap to 1
//! for the rest of the run; the failing chunk backs off `unit × attempt` and
//! retries. Any other failure, or running out of retries, records the first
//! error and cancels every sibling. A chunk that notices cancellation after
//! its call returns discards the result, so nothing is persisted once the run
//! is decided.

use crate::config::ServiceConfig;
use crate::error::{ProviderError, TaskError};
use crate::model::Task;
use crate::progress::TaskProgressCallback;
use crate::providers::{check_not_truncated, ChunkFormatter, FormatterChunk, ProviderKind};
use crate::store::{replace_file, TaskStore, CHUNKS_DIR, FORMATTED_TXT};
use futures::future::join_all;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest chunk sent to a formatter, in bytes.
pub const NOMINAL_CHUNK_BYTES: usize = 60 * 1024;
/// Smallest chunk size ever used.
pub const MIN_CHUNK_BYTES: usize = 12 * 1024;
/// A newline this close to the budget ends the chunk early.
const NEWLINE_WINDOW: usize = 512;

/// Chunk size for a provider's output budget.
///
/// Roughly 4 bytes per token with 40 % of the budget used, clamped to
/// `[MIN_CHUNK_BYTES, NOMINAL_CHUNK_BYTES]`. OpenAI-compatible endpoints get
/// half of that (or the floor).
pub fn estimate_chunk_size(kind: ProviderKind, max_tokens: usize) -> usize {
    let mut size = NOMINAL_CHUNK_BYTES;
    if max_tokens > 0 {
        let estimated = ((max_tokens as f64) * 4.0 * 0.4) as usize;
        size = size.min(estimated.clamp(MIN_CHUNK_BYTES, NOMINAL_CHUNK_BYTES));
    }
    if kind == ProviderKind::OpenAi {
        size = if size > MIN_CHUNK_BYTES * 2 {
            size / 2
        } else {
            MIN_CHUNK_BYTES
        };
    }
    size.max(MIN_CHUNK_BYTES)
}

/// Split `text` into pieces of at most `max_bytes` UTF-8 bytes without
/// breaking a character, preferring to cut after a newline once a piece is
/// within 512 bytes of the budget. Concatenating the pieces yields `text`.
pub fn split_text_chunks(text: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = if max_bytes == 0 {
        NOMINAL_CHUNK_BYTES
    } else {
        max_bytes
    };
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        let len = ch.len_utf8();
        if current.len() + len > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
        if ch == '\n' && current.len() > max_bytes.saturating_sub(NEWLINE_WINDOW) {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ── Adaptive limiter ─────────────────────────────────────────────────────

/// Counting slot pool whose capacity can only shrink.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    limit: AtomicUsize,
    active: AtomicUsize,
    poll: Duration,
}

/// Releases its slot on drop.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    limiter: &'a AdaptiveLimiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdaptiveLimiter {
    pub fn new(limit: usize, poll: Duration) -> Self {
        Self {
            limit: AtomicUsize::new(limit.max(1)),
            active: AtomicUsize::new(0),
            poll,
        }
    }

    /// Wait for a free slot. `None` once `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<SlotGuard<'_>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let limit = self.limit.load(Ordering::SeqCst);
            let active = self.active.load(Ordering::SeqCst);
            if active < limit {
                if self
                    .active
                    .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Some(SlotGuard { limiter: self });
                }
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }

    /// Drop the capacity to one. Returns `true` if this call changed it.
    pub fn throttle_to_serial(&self) -> bool {
        self.limit.swap(1, Ordering::SeqCst) > 1
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

// ── Run ──────────────────────────────────────────────────────────────────

/// Knobs for one formatting run, taken from [`ServiceConfig`].
#[derive(Debug, Clone, Copy)]
pub struct FormattingLimits {
    pub worker_cap: usize,
    pub max_retries: u32,
    pub backoff_unit: Duration,
    pub poll_interval: Duration,
    pub deadline: Option<Duration>,
}

impl From<&ServiceConfig> for FormattingLimits {
    fn from(c: &ServiceConfig) -> Self {
        Self {
            worker_cap: c.formatter_worker_cap,
            max_retries: c.formatter_max_retries,
            backoff_unit: c.formatter_backoff_unit,
            poll_interval: c.slot_poll_interval,
            deadline: c.formatting_deadline,
        }
    }
}

/// Collaborators shared by every chunk of one run.
struct RunState<'a> {
    store: &'a TaskStore,
    progress: &'a dyn TaskProgressCallback,
    formatter: &'a dyn ChunkFormatter,
    limits: FormattingLimits,
    task_id: &'a str,
    total: usize,
    limiter: AdaptiveLimiter,
    cancel: CancellationToken,
    completed: AtomicUsize,
    first_error: OnceLock<TaskError>,
}

impl RunState<'_> {
    /// First error wins and cancels the run; later ones are only logged.
    fn fail(&self, err: TaskError) {
        match self.first_error.set(err) {
            Ok(()) => self.cancel.cancel(),
            Err(later) => debug!(task = %self.task_id, "suppressed later error: {later}"),
        }
    }

    async fn process_chunk(&self, chunk: &FormatterChunk) -> Option<String> {
        let mut retries = 0u32;
        loop {
            let slot = self.limiter.acquire(&self.cancel).await?;
            debug!(
                task = %self.task_id,
                chunk = chunk.index + 1,
                total = self.total,
                bytes = chunk.text.len(),
                "formatting {}", chunk.file_name
            );
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                r = self.formatter.format_chunk(chunk) => r,
            };
            drop(slot);
            if self.cancel.is_cancelled() {
                return None;
            }

            let outcome = outcome.and_then(|text| {
                check_not_truncated(chunk, &text)?;
                Ok(text)
            });

            match outcome {
                Ok(text) => {
                    self.record_progress().await;
                    let text = text.trim().to_string();
                    debug!(
                        task = %self.task_id,
                        chunk = chunk.index + 1,
                        chars = text.chars().count(),
                        "chunk formatted"
                    );
                    return Some(text);
                }
                Err(e) if e.should_throttle() && retries < self.limits.max_retries => {
                    if self.limiter.throttle_to_serial() {
                        warn!(
                            task = %self.task_id,
                            chunk = chunk.index + 1,
                            "{e}; lowering formatter concurrency to 1"
                        );
                    }
                    retries += 1;
                    let backoff = self.limits.backoff_unit * retries;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    warn!(task = %self.task_id, chunk = chunk.index + 1, "chunk failed: {e}");
                    self.fail(chunk_error(e, retries));
                    return None;
                }
            }
        }
    }

    /// Count a success and persist it. The stored count never decreases and
    /// never exceeds the total.
    async fn record_progress(&self) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total;
        let saved = self
            .store
            .update(self.task_id, |t| {
                t.formatting_in_progress = true;
                if t.formatting_total_chunks == 0 {
                    t.formatting_total_chunks = total;
                }
                t.formatting_completed_chunks = t.formatting_completed_chunks.max(done).min(total);
                Ok(t.formatting_completed_chunks)
            })
            .await;
        match saved {
            Ok((_, persisted)) => self.progress.on_chunk_complete(self.task_id, persisted, total),
            Err(e) => warn!(task = %self.task_id, "failed to persist formatting progress: {e}"),
        }
    }
}

fn chunk_error(e: ProviderError, retries: u32) -> TaskError {
    if retries > 0 {
        debug!("giving up after {retries} retries");
    }
    TaskError::Provider(e)
}

/// Run the chunked formatter over `text` and persist the outcome on the task.
///
/// On success `formatted.txt` is written and the task records
/// `formatted_by_ai = true` with `completed == total`. On failure the task
/// records `formatting_in_progress = false` with the progress reached so far,
/// and the first error is returned.
#[allow(clippy::too_many_arguments)]
pub async fn run_formatting(
    store: &TaskStore,
    progress: &dyn TaskProgressCallback,
    limits: FormattingLimits,
    task_id: &str,
    text: &str,
    formatter: &dyn ChunkFormatter,
    kind: ProviderKind,
    max_tokens: usize,
) -> Result<Task, TaskError> {
    let chunk_size = estimate_chunk_size(kind, max_tokens);
    let pieces = split_text_chunks(text, chunk_size);
    if pieces.is_empty() {
        return Err(TaskError::NoUsableText("no text to format".into()));
    }

    let chunk_dir = store.task_dir(task_id).join(CHUNKS_DIR);
    let outcome = run_chunks(
        store, progress, limits, task_id, pieces, chunk_size, formatter, &chunk_dir,
    )
    .await;
    if let Err(e) = tokio::fs::remove_dir_all(&chunk_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(task = %task_id, "failed to remove {}: {e}", chunk_dir.display());
        }
    }

    let success = outcome.is_ok();
    progress.on_formatting_complete(task_id, success);
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_chunks(
    store: &TaskStore,
    progress: &dyn TaskProgressCallback,
    limits: FormattingLimits,
    task_id: &str,
    pieces: Vec<String>,
    chunk_size: usize,
    formatter: &dyn ChunkFormatter,
    chunk_dir: &Path,
) -> Result<Task, TaskError> {
    let chunks = write_chunks(chunk_dir, pieces).await?;
    let total = chunks.len();
    info!(task = %task_id, chunks = total, chunk_size, "formatting started");

    store
        .update(task_id, |t| {
            t.formatting_in_progress = true;
            t.formatting_total_chunks = total;
            t.formatting_completed_chunks = 0;
            t.formatted_by_ai = false;
            Ok(())
        })
        .await?;

    let state = RunState {
        store,
        progress,
        formatter,
        limits,
        task_id,
        total,
        limiter: AdaptiveLimiter::new(limits.worker_cap.min(total), limits.poll_interval),
        cancel: CancellationToken::new(),
        completed: AtomicUsize::new(0),
        first_error: OnceLock::new(),
    };

    let results = execute(&state, &chunks).await;
    let outcome = match state.first_error.into_inner() {
        Some(err) => Err(err),
        None => assemble(results),
    };

    match outcome {
        Ok(formatted) => finish_success(store, task_id, total, &formatted).await,
        Err(err) => {
            let done = state.completed.load(Ordering::SeqCst);
            let saved = store
                .update(task_id, |t| {
                    t.formatting_in_progress = false;
                    if t.formatting_total_chunks == 0 {
                        t.formatting_total_chunks = total;
                    }
                    t.formatting_completed_chunks =
                        t.formatting_completed_chunks.max(done).min(total);
                    Ok(())
                })
                .await;
            if let Err(e) = saved {
                warn!(task = %task_id, "failed to record formatting failure: {e}");
            }
            warn!(task = %task_id, "formatting failed: {err}");
            Err(err)
        }
    }
}

/// Drive every chunk to completion, honouring the run deadline.
async fn execute(state: &RunState<'_>, chunks: &[FormatterChunk]) -> Vec<Option<String>> {
    let work = join_all(chunks.iter().map(|c| state.process_chunk(c)));
    tokio::pin!(work);

    let Some(deadline) = state.limits.deadline else {
        return work.await;
    };
    tokio::select! {
        results = &mut work => results,
        _ = tokio::time::sleep(deadline) => {
            state.fail(TaskError::FormattingTimeout { secs: deadline.as_secs() });
            work.await
        }
    }
}

fn assemble(results: Vec<Option<String>>) -> Result<String, TaskError> {
    let parts: Vec<String> = results
        .into_iter()
        .map(|r| r.ok_or_else(|| TaskError::Internal("chunk finished without a result".into())))
        .collect::<Result<_, _>>()?;
    let formatted = parts.join("\n\n").trim().to_string();
    if formatted.is_empty() {
        return Err(TaskError::NoUsableText(
            "formatter returned empty text".into(),
        ));
    }
    Ok(formatted)
}

async fn finish_success(
    store: &TaskStore,
    task_id: &str,
    total: usize,
    formatted: &str,
) -> Result<Task, TaskError> {
    let path = store.task_dir(task_id).join(FORMATTED_TXT);
    replace_file(&path, formatted.as_bytes()).await?;
    let url = store.file_url(task_id, &[FORMATTED_TXT]);
    let (task, ()) = store
        .update(task_id, |t| {
            t.formatted_by_ai = true;
            t.formatted_txt_path = Some(path.clone());
            t.formatted_txt_url = Some(url.clone());
            t.formatting_in_progress = false;
            t.formatting_total_chunks = total;
            t.formatting_completed_chunks = total;
            Ok(())
        })
        .await?;
    info!(task = %task_id, url = %url, "formatting finished");
    Ok(task)
}

async fn write_chunks(dir: &Path, pieces: Vec<String>) -> Result<Vec<FormatterChunk>, TaskError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| TaskError::io(dir, e))?;
    let mut chunks = Vec::with_capacity(pieces.len());
    for (index, text) in pieces.into_iter().enumerate() {
        let file_name = format!("chunk-{:03}.txt", index + 1);
        let path = dir.join(&file_name);
        tokio::fs::write(&path, text.as_bytes())
            .await
            .map_err(|e| TaskError::io(&path, e))?;
        chunks.push(FormatterChunk {
            index,
            file_name,
            text,
        });
    }
    Ok(chunks)
}
