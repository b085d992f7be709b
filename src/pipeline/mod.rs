//! Pipeline stages behind the task service.
//!
//! ## Data Flow
//!
//! ```text
//! upload ──▶ render ──▶ pool ──▶ document ──▶ formatting
//! (source)   (pdfium)   (OCR +    (combined    (chunked AI
//!                       translate) txt / pdf)   layout pass)
//! ```
//!
//! 1. [`render`] rasterises every page to PNG; runs in `spawn_blocking`
//!    because pdfium is not async-safe.
//! 2. [`pool`] translates a set of pages with bounded concurrency and merges
//!    each result into the stored task as it lands.
//! 3. [`document`] concatenates usable translations into `combined.txt` or
//!    lays them out as `combined.pdf`.
//! 4. [`formatting`] splits the combined text into chunks and runs them
//!    through the formatter with adaptive concurrency.

pub mod document;
pub mod formatting;
pub mod pool;
pub mod render;
