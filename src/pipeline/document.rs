//! Combined exports: `combined.txt` and `combined.pdf`.
//!
//! The PDF is assembled directly with `lopdf`: one A4 sheet (or more, when
//! the text overflows) per translated page, and the original page image,
//! scaled to fit, for pages that produced no text.

use crate::error::TaskError;
use crate::model::Task;
use crate::store::write_atomic;
use async_trait::async_trait;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Concatenate every usable translation as `"Page N\n" + text + "\n\n"`.
pub fn build_combined_text(task: &Task) -> Result<String, TaskError> {
    let mut out = String::new();
    for page in task.pages.iter().filter(|p| p.has_usable_translation()) {
        out.push_str(&format!("Page {}\n", page.page_number));
        out.push_str(page.translation.trim());
        out.push_str("\n\n");
    }
    if out.is_empty() {
        return Err(TaskError::NoUsableText(format!(
            "task '{}' has no translated text",
            task.id
        )));
    }
    Ok(out)
}

/// What one page of the exported document shows.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentPage {
    Text { page_number: usize, text: String },
    Image { page_number: usize, path: PathBuf },
}

/// Translation where there is one, otherwise the rendered image if it is
/// still on disk. Pages with neither are left out.
pub fn document_pages(task: &Task) -> Result<Vec<DocumentPage>, TaskError> {
    let pages: Vec<DocumentPage> = task
        .pages
        .iter()
        .filter_map(|p| {
            if p.has_usable_translation() {
                Some(DocumentPage::Text {
                    page_number: p.page_number,
                    text: p.translation.trim().to_string(),
                })
            } else if p.image_path.is_file() {
                Some(DocumentPage::Image {
                    page_number: p.page_number,
                    path: p.image_path.clone(),
                })
            } else {
                None
            }
        })
        .collect();
    if pages.is_empty() {
        return Err(TaskError::NoUsableText(format!(
            "task '{}' has neither translations nor page images",
            task.id
        )));
    }
    Ok(pages)
}

/// Lays out document pages into a file.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, pages: &[DocumentPage], out_path: &Path) -> Result<(), TaskError>;
}

/// [`DocumentRenderer`] writing PDF with `lopdf`.
///
/// Text uses the built-in Helvetica face with WinAnsi encoding; characters
/// outside Latin-1 print as `?`.
// TODO: embed a CID-keyed TrueType font so CJK translations render as text.
#[derive(Debug, Clone, Default)]
pub struct LopdfRenderer;

#[async_trait]
impl DocumentRenderer for LopdfRenderer {
    async fn render(&self, pages: &[DocumentPage], out_path: &Path) -> Result<(), TaskError> {
        let pages = pages.to_vec();
        let bytes = tokio::task::spawn_blocking(move || build_pdf(&pages))
            .await
            .map_err(|e| TaskError::Internal(format!("PDF task panicked: {e}")))??;
        debug!(bytes = bytes.len(), "combined PDF built");
        write_atomic(out_path, &bytes).await
    }
}

// ── Layout ───────────────────────────────────────────────────────────────

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const TEXT_MARGIN: i64 = 50;
const IMAGE_MARGIN: f64 = 28.0;
const HEADING_SIZE: i64 = 12;
const BODY_SIZE: i64 = 11;
const LEADING: i64 = 14;
const HEADING_GAP: i64 = 20;
const WRAP_CHARS: usize = 90;

fn lines_per_sheet() -> usize {
    ((PAGE_HEIGHT - 2 * TEXT_MARGIN - HEADING_GAP) / LEADING) as usize
}

/// Build the whole PDF in memory.
pub fn build_pdf(pages: &[DocumentPage]) -> Result<Vec<u8>, TaskError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });

    let mut kids: Vec<Object> = Vec::new();
    for page in pages {
        match page {
            DocumentPage::Text { page_number, text } => {
                for sheet in text_sheets(*page_number, text) {
                    let resources = font_resources(font_id);
                    kids.push(add_sheet(&mut doc, pages_id, resources, sheet));
                }
            }
            DocumentPage::Image { page_number, path } => match add_image(&mut doc, path) {
                Ok((image_id, w, h)) => {
                    let mut resources = font_resources(font_id);
                    resources.set("XObject", dictionary! { "Im1" => image_id });
                    kids.push(add_sheet(&mut doc, pages_id, resources, image_content(w, h)));
                }
                Err(e) => {
                    warn!(page = page_number, "cannot embed page image: {e}");
                    let content = text_content(
                        &format!("Page {page_number}"),
                        &["[page image unavailable]".to_string()],
                    );
                    kids.push(add_sheet(&mut doc, pages_id, font_resources(font_id), content));
                }
            },
        }
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| TaskError::Internal(format!("PDF serialisation failed: {e}")))?;
    Ok(buffer)
}

fn font_resources(font_id: ObjectId) -> Dictionary {
    dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    }
}

fn add_sheet(
    doc: &mut Document,
    pages_id: ObjectId,
    resources: Dictionary,
    content: Vec<u8>,
) -> Object {
    let mut stream = Stream::new(dictionary! {}, content);
    if let Err(e) = stream.compress() {
        debug!("content stream left uncompressed: {e}");
    }
    let content_id = doc.add_object(stream);
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        "Resources" => resources,
        "Contents" => content_id,
    });
    page_id.into()
}

/// Split one page's text into sheets, each a ready content stream.
fn text_sheets(page_number: usize, text: &str) -> Vec<Vec<u8>> {
    let lines = wrap_text(text, WRAP_CHARS);
    let per_sheet = lines_per_sheet().max(1);
    lines
        .chunks(per_sheet)
        .enumerate()
        .map(|(i, chunk)| {
            let heading = if i == 0 {
                format!("Page {page_number}")
            } else {
                format!("Page {page_number} (cont.)")
            };
            text_content(&heading, chunk)
        })
        .collect()
}

fn text_content(heading: &str, lines: &[String]) -> Vec<u8> {
    let top = PAGE_HEIGHT - TEXT_MARGIN;
    let mut out = Vec::new();
    out.extend_from_slice(b"BT\n");
    out.extend_from_slice(format!("/F1 {HEADING_SIZE} Tf\n{TEXT_MARGIN} {top} Td\n").as_bytes());
    push_text_op(&mut out, heading);
    out.extend_from_slice(
        format!("/F1 {BODY_SIZE} Tf\n{LEADING} TL\n0 -{HEADING_GAP} Td\n").as_bytes(),
    );
    for line in lines {
        push_text_op(&mut out, line);
        out.extend_from_slice(b"T*\n");
    }
    out.extend_from_slice(b"ET\n");
    out
}

fn push_text_op(out: &mut Vec<u8>, text: &str) {
    out.push(b'(');
    out.extend_from_slice(&encode_win_ansi(text));
    out.extend_from_slice(b") Tj\n");
}

/// Escape for a PDF literal string and map to single-byte WinAnsi.
fn encode_win_ansi(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            '\t' => out.push(b' '),
            ' '..='~' => out.push(c as u8),
            '\u{A0}'..='\u{FF}' => out.push(c as u32 as u8),
            _ => out.push(b'?'),
        }
    }
    out
}

/// Greedy word wrap by character count. Words longer than `width` are cut.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut line = String::new();
        let mut line_len = 0usize;
        for word in paragraph.split_whitespace() {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > width {
                if line_len > 0 {
                    lines.push(std::mem::take(&mut line));
                    line_len = 0;
                }
                let rest = word.split_off(width);
                lines.push(word.into_iter().collect());
                word = rest;
            }
            let needed = if line_len == 0 { word.len() } else { word.len() + 1 };
            if line_len + needed > width && line_len > 0 {
                lines.push(std::mem::take(&mut line));
                line_len = 0;
            }
            if line_len > 0 {
                line.push(' ');
                line_len += 1;
            }
            line.extend(word.iter());
            line_len += word.len();
        }
        lines.push(line);
    }
    lines
}

// ── Images ───────────────────────────────────────────────────────────────

fn add_image(doc: &mut Document, path: &Path) -> Result<(ObjectId, u32, u32), TaskError> {
    let img = image::open(path)
        .map_err(|e| TaskError::Render(format!("{}: {e}", path.display())))?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(TaskError::Render(format!("{}: empty image", path.display())));
    }
    let mut stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        rgb.into_raw(),
    );
    if let Err(e) = stream.compress() {
        debug!("image stream left uncompressed: {e}");
    }
    Ok((doc.add_object(stream), width, height))
}

/// Place `Im1` centred on the sheet, scaled to fit inside the margins.
fn image_content(width: u32, height: u32) -> Vec<u8> {
    let avail_w = PAGE_WIDTH as f64 - 2.0 * IMAGE_MARGIN;
    let avail_h = PAGE_HEIGHT as f64 - 2.0 * IMAGE_MARGIN;
    let scale = (avail_w / width as f64).min(avail_h / height as f64);
    let w = width as f64 * scale;
    let h = height as f64 * scale;
    let x = (PAGE_WIDTH as f64 - w) / 2.0;
    let y = (PAGE_HEIGHT as f64 - h) / 2.0;
    format!("q\n{w:.2} 0 0 {h:.2} {x:.2} {y:.2} cm\n/Im1 Do\nQ\n").into_bytes()
}
