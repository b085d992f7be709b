//! Error types for the edgequake-pdftranslate library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`TaskError`]: **Fatal** for the operation that returned it: the task
//!   does not exist, the provider is misconfigured, an artifact could not be
//!   written, or a formatting run failed as a whole.
//!
//! * [`ProviderError`]: **Non-fatal**: a single page or chunk call failed.
//!   Page failures are recorded on the page itself (`status = error`) so the
//!   rest of the document keeps going; chunk failures are classified by the
//!   formatting pipeline into "throttle and retry" versus "abort the run".

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdftranslate library.
#[derive(Debug, Error)]
pub enum TaskError {
    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No task with this id exists in the store.
    #[error("Task '{id}' not found")]
    TaskNotFound { id: String },

    /// The task exists but has no page with this number.
    #[error("Page {page} not found in task '{id}'")]
    PageNotFound { id: String, page: usize },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Provider settings are incomplete (missing key or model) or invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Provider errors ───────────────────────────────────────────────────
    /// A provider call failed in a context where it is fatal
    /// (synchronous re-translation, a formatting chunk after retries).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    // ── Document errors ───────────────────────────────────────────────────
    /// The uploaded document could not be rasterised.
    #[error("Rasterisation failed: {0}")]
    Render(String),

    /// Nothing in the task is usable for the requested export.
    #[error("No usable content: {0}")]
    NoUsableText(String),

    // ── Formatting run errors ─────────────────────────────────────────────
    /// A formatting run for this task is already active.
    #[error("Formatting already in progress for task '{id}'")]
    FormattingBusy { id: String },

    /// The formatting run exceeded its deadline and was cancelled.
    #[error("Formatting timed out after {secs}s")]
    FormattingTimeout { secs: u64 },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not read or write a file in the task directory.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `meta.json` could not be encoded or decoded.
    #[error("Task metadata is invalid: {0}")]
    Metadata(#[from] serde_json::Error),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Shorthand for wrapping an `io::Error` with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TaskError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the lookup failures (`TaskNotFound`, `PageNotFound`).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TaskError::TaskNotFound { .. } | TaskError::PageNotFound { .. }
        )
    }
}

/// A non-fatal error from a single provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The request never produced an HTTP response (DNS, TLS, reset).
    #[error("{provider} request failed: {detail}")]
    Transport { provider: String, detail: String },

    /// The provider answered with a non-success status.
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    /// The per-call timeout elapsed.
    #[error("{provider} call timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    /// The response body could not be decoded into the expected shape.
    #[error("{provider} response could not be parsed: {detail}")]
    InvalidResponse { provider: String, detail: String },

    /// The response decoded but carried no text.
    #[error("{provider} returned an empty response")]
    EmptyResponse { provider: String },

    /// Formatted output is suspiciously shorter than its input.
    #[error(
        "chunk {chunk} output was truncated: {output_chars} chars for {input_chars} chars of input"
    )]
    TruncatedOutput {
        chunk: usize,
        input_chars: usize,
        output_chars: usize,
    },

    /// The image file for a page could not be read.
    #[error("Failed to read page image '{path}': {detail}")]
    Image { path: PathBuf, detail: String },
}

/// Lower-cased markers that identify rate limiting or provider overload in
/// an error message, independent of which provider produced it.
const RATE_LIMIT_MARKERS: &[&str] = &["429", "503", "rate limit", "concurrency", "provider_error"];

impl ProviderError {
    /// Whether this error signals rate limiting or overload.
    pub fn is_rate_limited(&self) -> bool {
        if let ProviderError::Status { status, .. } = self {
            if *status == 429 || *status == 503 {
                return true;
            }
        }
        is_rate_limit_message(&self.to_string())
    }

    /// Whether the formatting pipeline should drop to serial execution and
    /// retry rather than abort.
    pub fn should_throttle(&self) -> bool {
        matches!(self, ProviderError::TruncatedOutput { .. }) || self.is_rate_limited()
    }
}

/// Classify an arbitrary error message as rate limiting.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}
