//! PDF rasterisation: every page of the uploaded source to `page-NNN.png`.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state; calling it from a Tokio
//! worker would stall the runtime during CPU-heavy rendering, so the whole
//! document is rendered on the blocking pool.
//!
//! ## Why cap pixels, not DPI?
//!
//! Page sizes vary wildly. Capping the longest edge keeps memory bounded and
//! keeps images in the range vision models read best.

use crate::error::TaskError;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Longest rendered edge in pixels.
pub const DEFAULT_MAX_PIXELS: u32 = 2000;

/// Turns a source document into one image file per page.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render every page into `out_dir`, returning the image paths in page
    /// order. Zero pages or an unreadable source is [`TaskError::Render`].
    async fn render_pages(&self, source: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, TaskError>;
}

/// [`Rasterizer`] backed by pdfium.
///
/// The pdfium shared library is loaded from `library_path` when set (a file
/// or the directory holding it), otherwise from the working directory, then
/// from the system library path.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    max_pixels: u32,
    library_path: Option<PathBuf>,
}

impl Default for PdfiumRasterizer {
    fn default() -> Self {
        Self {
            max_pixels: DEFAULT_MAX_PIXELS,
            library_path: None,
        }
    }
}

impl PdfiumRasterizer {
    pub fn with_max_pixels(mut self, max_pixels: u32) -> Self {
        self.max_pixels = max_pixels.max(64);
        self
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn render_pages(&self, source: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, TaskError> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| TaskError::io(out_dir, e))?;

        let source = source.to_path_buf();
        let out_dir = out_dir.to_path_buf();
        let max_pixels = self.max_pixels;
        let library = self.library_path.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium(library.as_deref())?;
            render_blocking(&pdfium, &source, &out_dir, max_pixels)
        })
        .await
        .map_err(|e| TaskError::Internal(format!("render task panicked: {e}")))?
    }
}

fn bind_pdfium(library: Option<&Path>) -> Result<Pdfium, TaskError> {
    let bindings = match library {
        Some(path) if path.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
        }
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| TaskError::Render(format!("pdfium library unavailable: {e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn render_blocking(
    pdfium: &Pdfium,
    source: &Path,
    out_dir: &Path,
    max_pixels: u32,
) -> Result<Vec<PathBuf>, TaskError> {
    let document = pdfium
        .load_pdf_from_file(source, None)
        .map_err(|e| TaskError::Render(format!("cannot open {}: {e:?}", source.display())))?;

    let pages = document.pages();
    let total = pages.len() as usize;
    if total == 0 {
        return Err(TaskError::Render("document has no pages".into()));
    }
    info!("PDF loaded: {total} pages");

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut paths = Vec::with_capacity(total);
    for (idx, page) in pages.iter().enumerate() {
        let number = idx + 1;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| TaskError::Render(format!("page {number}: {e:?}")))?;
        let img = bitmap.as_image();
        let path = out_dir.join(page_image_name(number));
        img.save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| TaskError::Render(format!("page {number}: encode PNG: {e}")))?;
        debug!(
            "Rendered page {number} → {}x{} px",
            img.width(),
            img.height()
        );
        paths.push(path);
    }
    Ok(paths)
}

/// `page-007.png` for page 7.
pub fn page_image_name(page_number: usize) -> String {
    format!("page-{page_number:03}.png")
}

/// `page-007.txt` for page 7.
pub fn page_text_name(page_number: usize) -> String {
    format!("page-{page_number:03}.txt")
}
