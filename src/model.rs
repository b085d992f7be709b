//! Persisted task and page records, plus the sanitised views handed to callers.
//!
//! [`Task`] and [`Page`] are exactly what lives in `meta.json` (snake_case
//! keys). [`TaskView`] / [`PageView`] drop filesystem paths and are camelCase,
//! the shape a front-end consumes.

use crate::providers::{OcrResult, ProviderKind, ProviderSettings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Translation state of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Pending,
    Completed,
    Error,
}

/// One rendered page of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    /// 1-based.
    pub page_number: usize,
    pub image_path: PathBuf,
    pub image_url: String,
    pub text_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_url: Option<String>,
    pub has_text: bool,
    pub source_text: String,
    pub translation: String,
    pub status: PageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Left out of the initial translation set; status is `Completed` with
    /// empty text until someone re-translates it.
    #[serde(default)]
    pub skipped: bool,
}

impl Page {
    pub fn pending(
        page_number: usize,
        image_path: PathBuf,
        image_url: String,
        text_path: PathBuf,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            page_number,
            image_path,
            image_url,
            text_path,
            text_url: None,
            has_text: false,
            source_text: String::new(),
            translation: String::new(),
            status: PageStatus::Pending,
            error: None,
            updated_at: Utc::now(),
            skipped: false,
        }
    }

    /// Record a successful OCR + translation. `text_url` is `Some` when the
    /// per-page text file was written.
    pub fn mark_completed(&mut self, result: &OcrResult, text_url: Option<String>) {
        self.has_text = result.has_text;
        self.source_text = result.source_text.trim().to_string();
        self.translation = result.translated_text.trim().to_string();
        self.text_url = text_url;
        self.status = PageStatus::Completed;
        self.error = None;
        self.skipped = false;
        self.updated_at = Utc::now();
    }

    /// Record a failure. Previously recorded text stays untouched.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = PageStatus::Error;
        self.error = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_skipped(&mut self) {
        self.has_text = false;
        self.source_text.clear();
        self.translation.clear();
        self.text_url = None;
        self.status = PageStatus::Completed;
        self.error = None;
        self.skipped = true;
        self.updated_at = Utc::now();
    }

    /// Whether this page contributes text to combined exports.
    pub fn has_usable_translation(&self) -> bool {
        self.has_text && !self.translation.trim().is_empty()
    }
}

/// Non-secret snapshot of the provider a task was last translated with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub max_tokens: usize,
}

impl From<&ProviderSettings> for ProviderInfo {
    fn from(s: &ProviderSettings) -> Self {
        Self {
            kind: s.kind,
            base_url: s.base_url.clone(),
            model: s.model.clone(),
            max_tokens: s.max_tokens,
        }
    }
}

/// One uploaded document and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub file_name: String,
    pub original_path: PathBuf,
    pub total_pages: usize,
    pub pages: Vec<Page>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_txt_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_txt_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_pdf_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_pdf_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provider: ProviderInfo,
    #[serde(default)]
    pub formatting_optimized: bool,
    #[serde(default)]
    pub formatted_by_ai: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_txt_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_txt_url: Option<String>,
    #[serde(default)]
    pub formatting_in_progress: bool,
    #[serde(default)]
    pub formatting_total_chunks: usize,
    #[serde(default)]
    pub formatting_completed_chunks: usize,
}

impl Task {
    pub fn page(&self, page_number: usize) -> Option<&Page> {
        self.pages.iter().find(|p| p.page_number == page_number)
    }

    pub fn page_mut(&mut self, page_number: usize) -> Option<&mut Page> {
        self.pages.iter_mut().find(|p| p.page_number == page_number)
    }

    /// Insert or replace a page by id, keeping page-number order.
    pub fn upsert_page(&mut self, page: Page) {
        match self.pages.iter_mut().find(|p| p.id == page.id) {
            Some(slot) => *slot = page,
            None => self.pages.push(page),
        }
        self.sort_pages();
    }

    pub fn sort_pages(&mut self) {
        self.pages.sort_by_key(|p| p.page_number);
    }

    pub fn count_status(&self, status: PageStatus) -> usize {
        self.pages.iter().filter(|p| p.status == status).count()
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            total_pages: self.total_pages,
            completed_pages: self.count_status(PageStatus::Completed),
            pending_pages: self.count_status(PageStatus::Pending),
            error_pages: self.count_status(PageStatus::Error),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            total_pages: self.total_pages,
            created_at: self.created_at,
            updated_at: self.updated_at,
            combined_txt_url: self.combined_txt_url.clone(),
            combined_pdf_url: self.combined_pdf_url.clone(),
            formatted_txt_url: self.formatted_txt_url.clone(),
            provider: self.provider.clone(),
            pages: self.pages.iter().map(Page::view).collect(),
            formatting_optimized: self.formatting_optimized,
            formatted_by_ai: self.formatted_by_ai,
            formatting_in_progress: self.formatting_in_progress,
            formatting_total_chunks: self.formatting_total_chunks,
            formatting_completed_chunks: self.formatting_completed_chunks,
        }
    }
}

// ── Views ────────────────────────────────────────────────────────────────

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub file_name: String,
    pub total_pages: usize,
    pub completed_pages: usize,
    pub pending_pages: usize,
    pub error_pages: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    pub id: String,
    pub page_number: usize,
    pub image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_url: Option<String>,
    pub has_text: bool,
    pub source_text: String,
    pub translation: String,
    pub status: PageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub skipped: bool,
}

impl Page {
    pub fn view(&self) -> PageView {
        PageView {
            id: self.id.clone(),
            page_number: self.page_number,
            image_url: self.image_url.clone(),
            text_url: self.text_url.clone(),
            has_text: self.has_text,
            source_text: self.source_text.clone(),
            translation: self.translation.clone(),
            status: self.status,
            error: self.error.clone(),
            updated_at: self.updated_at,
            skipped: self.skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: String,
    pub file_name: String,
    pub total_pages: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_txt_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_pdf_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_txt_url: Option<String>,
    pub provider: ProviderInfo,
    pub pages: Vec<PageView>,
    pub formatting_optimized: bool,
    #[serde(rename = "formattedByAI")]
    pub formatted_by_ai: bool,
    pub formatting_in_progress: bool,
    pub formatting_total_chunks: usize,
    pub formatting_completed_chunks: usize,
}
