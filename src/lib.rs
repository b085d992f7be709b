//! # edgequake-pdftranslate
//!
//! Translate scanned or image-heavy PDF documents page by page with Vision
//! Language Models, then reassemble the result as text or PDF and optionally
//! run an AI layout pass over it.
//!
//! ## Why this crate?
//!
//! Text extraction fails on scans, and translating a whole document in one
//! request fails on length. Instead every page is rasterised and sent to a
//! vision model that reads and translates it in one step. Pages are
//! persisted as they finish, so a long document can be inspected, exported,
//! or partially re-translated while the rest is still running.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF upload
//!  │
//!  ├─ 1. Store     source.pdf under <storage>/<task-id>/
//!  ├─ 2. Render    rasterise pages via pdfium (spawn_blocking)
//!  ├─ 3. Translate bounded worker pool, one VLM call per page
//!  ├─ 4. Export    combined.txt / combined.pdf
//!  └─ 5. Format    chunked AI layout pass → formatted.txt
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdftranslate::{
//!     ProviderOverrides, ServiceConfig, TaskService, TranslationSettings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = TaskService::new(ServiceConfig::default());
//!     let overrides = ProviderOverrides {
//!         kind: Some("openai".into()),
//!         api_key: std::env::var("OPENAI_API_KEY").ok(),
//!         model: Some("gpt-4.1-mini".into()),
//!         ..Default::default()
//!     };
//!     let bytes = std::fs::read("scan.pdf")?;
//!     let created = service
//!         .create_task(&bytes, "scan.pdf", &overrides, TranslationSettings::default())
//!         .await?;
//!     if let Some(handle) = created.translation {
//!         handle.await?;
//!     }
//!     let (_, url) = service.merge_text(&created.task.id).await?;
//!     println!("{url}");
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdftranslate` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod service;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{InitialRange, ServiceConfig, ServiceConfigBuilder, TranslationSettings};
pub use error::{ProviderError, TaskError};
pub use model::{Page, PageStatus, PageView, ProviderInfo, Task, TaskSummary, TaskView};
pub use pipeline::pool::PoolReport;
pub use progress::{NoopProgressCallback, ProgressCallback, TaskProgressCallback};
pub use providers::{
    HttpBackend, LlmBackend, ProviderBackend, ProviderKind, ProviderOverrides, ProviderSettings,
};
pub use service::{CreatedTask, TaskService};
