//! Progress-callback trait for page-translation and formatting events.
//!
//! Inject an [`Arc<dyn TaskProgressCallback>`] via
//! [`crate::config::ServiceConfigBuilder::progress_callback`] to receive
//! events as the worker pool and formatting pipeline make progress. The CLI
//! drives its progress bar this way; an HTTP front-end could forward the same
//! events to a WebSocket.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdftranslate::{ServiceConfig, TaskProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl TaskProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, _task_id: &str, page_num: usize, translated_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page_num} done ({translated_len} chars)");
//!     }
//! }
//!
//! let config = ServiceConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the worker pool and the formatting pipeline.
///
/// Page callbacks fire concurrently from several workers, chunk callbacks
/// from several formatter calls. Implementations must synchronise their own
/// state. All methods default to no-ops.
pub trait TaskProgressCallback: Send + Sync {
    /// A batch of `pages` pages is about to be translated.
    fn on_pool_start(&self, task_id: &str, pages: usize) {
        let _ = (task_id, pages);
    }

    /// The provider call for a page is about to be sent.
    fn on_page_start(&self, task_id: &str, page_num: usize) {
        let _ = (task_id, page_num);
    }

    /// A page was translated and persisted.
    ///
    /// * `translated_len`: characters of translation recorded
    fn on_page_complete(&self, task_id: &str, page_num: usize, translated_len: usize) {
        let _ = (task_id, page_num, translated_len);
    }

    /// A page failed and was persisted with `status = error`.
    fn on_page_error(&self, task_id: &str, page_num: usize, error: &str) {
        let _ = (task_id, page_num, error);
    }

    /// Every page of the batch has been attempted.
    fn on_pool_complete(&self, task_id: &str, completed: usize, failed: usize) {
        let _ = (task_id, completed, failed);
    }

    /// A formatting chunk succeeded; `completed` is the persisted count.
    fn on_chunk_complete(&self, task_id: &str, completed: usize, total: usize) {
        let _ = (task_id, completed, total);
    }

    /// A formatting run ended, successfully or not.
    fn on_formatting_complete(&self, task_id: &str, success: bool) {
        let _ = (task_id, success);
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl TaskProgressCallback for NoopProgressCallback {}

/// Type stored in [`crate::config::ServiceConfig`].
pub type ProgressCallback = Arc<dyn TaskProgressCallback>;
