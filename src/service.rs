//! The task service: the one entry point for callers.
//!
//! ```text
//! create_task ──▶ store source ──▶ rasterise ──▶ save ──▶ spawn pool ──▶ pages land one by one
//! retranslate_page ─────────────────────────────────────▶ single page, synchronous
//! run_formatting ──▶ combined text ──▶ chunked formatter ──▶ formatted.txt
//! merge_text / merge_document ──▶ combined.txt / combined.pdf
//! ```
//!
//! [`TaskService`] is cheap to clone; clones share the store, its lock, and
//! the set of tasks currently being formatted.

use crate::config::{ServiceConfig, TranslationSettings};
use crate::error::TaskError;
use crate::model::{Page, PageStatus, ProviderInfo, Task, TaskSummary};
use crate::pipeline::document::{build_combined_text, document_pages, DocumentRenderer, LopdfRenderer};
use crate::pipeline::formatting::{self, FormattingLimits};
use crate::pipeline::pool::{translate_pages, translate_single_page, PoolReport};
use crate::pipeline::render::{page_text_name, PdfiumRasterizer, Rasterizer};
use crate::providers::{resolve_settings, HttpBackend, ProviderBackend, ProviderOverrides};
use crate::store::{replace_file, write_atomic, TaskStore, COMBINED_PDF, COMBINED_TXT, PAGES_DIR, SOURCE_FILE};
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Result of [`TaskService::create_task`].
#[derive(Debug)]
pub struct CreatedTask {
    /// The task as first saved: selected pages `Pending`, the rest skipped.
    pub task: Task,
    /// Background translation of the selected pages; `None` when nothing was
    /// selected. Dropping the handle does not stop the work.
    pub translation: Option<JoinHandle<PoolReport>>,
}

#[derive(Clone)]
pub struct TaskService {
    store: Arc<TaskStore>,
    backend: Arc<dyn ProviderBackend>,
    rasterizer: Arc<dyn Rasterizer>,
    renderer: Arc<dyn DocumentRenderer>,
    config: Arc<ServiceConfig>,
    formatting: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

/// Marks a task as being formatted until dropped.
struct FormattingSlot {
    active: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for FormattingSlot {
    fn drop(&mut self) {
        let mut set = self.active.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.id);
    }
}

impl TaskService {
    /// Service with the HTTP provider backend, pdfium rasteriser and lopdf
    /// renderer.
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_components(
            config,
            Arc::new(HttpBackend),
            Arc::new(PdfiumRasterizer::default()),
            Arc::new(LopdfRenderer),
        )
    }

    pub fn with_components(
        config: ServiceConfig,
        backend: Arc<dyn ProviderBackend>,
        rasterizer: Arc<dyn Rasterizer>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Self {
        let store = TaskStore::new(config.storage_dir.clone(), config.static_prefix.clone());
        Self {
            store: Arc::new(store),
            backend,
            rasterizer,
            renderer,
            config: Arc::new(config),
            formatting: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    // ── Creation ─────────────────────────────────────────────────────────

    /// Store an uploaded PDF, rasterise it and start translating the
    /// selected pages in the background.
    ///
    /// Provider settings are resolved and validated before anything touches
    /// the disk.
    pub async fn create_task(
        &self,
        pdf_bytes: &[u8],
        file_name: &str,
        overrides: &ProviderOverrides,
        settings: TranslationSettings,
    ) -> Result<CreatedTask, TaskError> {
        let provider = resolve_settings(&self.config.default_provider, None, overrides)?;
        let translator = self
            .backend
            .translator(&provider, &self.config.target_language)?;

        let id = uuid::Uuid::new_v4().to_string();
        let task_dir = self.store.task_dir(&id);
        let source = task_dir.join(SOURCE_FILE);
        write_atomic(&source, pdf_bytes).await?;

        let pages_dir = task_dir.join(PAGES_DIR);
        let images = match self.rasterizer.render_pages(&source, &pages_dir).await {
            Ok(images) if !images.is_empty() => images,
            Ok(_) => {
                self.discard_dir(&task_dir).await;
                return Err(TaskError::Render("document has no pages".into()));
            }
            Err(e) => {
                self.discard_dir(&task_dir).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut pages = Vec::with_capacity(images.len());
        for (idx, image) in images.into_iter().enumerate() {
            let number = idx + 1;
            let image_name = image
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let image_url = self.store.file_url(&id, &[PAGES_DIR, &image_name]);
            let text_path = pages_dir.join(page_text_name(number));
            pages.push(Page::pending(number, image, image_url, text_path));
        }

        let total = pages.len();
        let mut selected: BTreeSet<usize> = settings.range.to_page_numbers(total).into_iter().collect();
        if selected.is_empty() {
            selected = (1..=total).collect();
        }
        for page in pages.iter_mut().filter(|p| !selected.contains(&p.page_number)) {
            page.mark_skipped();
        }

        let mut task = Task {
            id: id.clone(),
            file_name: sanitize_file_name(file_name),
            original_path: source,
            total_pages: total,
            pages,
            combined_txt_path: None,
            combined_txt_url: None,
            combined_pdf_path: None,
            combined_pdf_url: None,
            created_at: now,
            updated_at: now,
            provider: ProviderInfo::from(&provider),
            formatting_optimized: true,
            formatted_by_ai: false,
            formatted_txt_path: None,
            formatted_txt_url: None,
            formatting_in_progress: false,
            formatting_total_chunks: 0,
            formatting_completed_chunks: 0,
        };
        self.store.save(&mut task).await?;
        info!(
            task = %id,
            file = %task.file_name,
            pages = total,
            selected = selected.len(),
            range = %settings.range,
            "task created"
        );

        let work: Vec<Page> = task
            .pages
            .iter()
            .filter(|p| selected.contains(&p.page_number))
            .cloned()
            .collect();
        let workers = settings.worker_count(self.config.max_workers, work.len());
        let translation = self.spawn_pool(&id, work, translator, workers);
        Ok(CreatedTask { task, translation })
    }

    fn spawn_pool(
        &self,
        id: &str,
        pages: Vec<Page>,
        translator: Arc<dyn crate::providers::Translator>,
        workers: usize,
    ) -> Option<JoinHandle<PoolReport>> {
        if pages.is_empty() || workers == 0 {
            return None;
        }
        let store = Arc::clone(&self.store);
        let progress = Arc::clone(&self.config.progress_callback);
        let id = id.to_string();
        Some(tokio::spawn(async move {
            translate_pages(
                &store,
                progress.as_ref(),
                &id,
                pages,
                translator.as_ref(),
                workers,
            )
            .await
        }))
    }

    async fn discard_dir(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!("failed to clean up {}: {e}", dir.display());
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn get_task(&self, id: &str) -> Result<Task, TaskError> {
        self.store.load(id).await
    }

    /// Newest first.
    pub async fn list_tasks(&self) -> Result<Vec<TaskSummary>, TaskError> {
        self.store.list_summaries().await
    }

    /// Remove a task and all of its files.
    pub async fn delete_task(&self, id: &str) -> Result<(), TaskError> {
        self.store.delete(id).await?;
        info!(task = %id, "task deleted");
        Ok(())
    }

    // ── Re-translation ───────────────────────────────────────────────────

    /// Translate one page again, synchronously.
    ///
    /// A provider failure is recorded on the page (status `error`, previous
    /// text kept) and returned as a normal result; only lookup, config and
    /// store failures are errors.
    pub async fn retranslate_page(
        &self,
        id: &str,
        page_number: usize,
        overrides: &ProviderOverrides,
    ) -> Result<(Task, Page), TaskError> {
        let task = self.store.load(id).await?;
        let provider = resolve_settings(&self.config.default_provider, Some(&task.provider), overrides)?;
        let translator = self
            .backend
            .translator(&provider, &self.config.target_language)?;
        let page = task
            .page(page_number)
            .cloned()
            .ok_or_else(|| TaskError::PageNotFound {
                id: id.to_string(),
                page: page_number,
            })?;

        self.store
            .update(id, |t| {
                t.provider = ProviderInfo::from(&provider);
                Ok(())
            })
            .await?;

        let progress = &self.config.progress_callback;
        progress.on_page_start(id, page_number);
        let (task, page) = translate_single_page(&self.store, id, page, translator.as_ref()).await?;
        match page.status {
            PageStatus::Error => progress.on_page_error(
                id,
                page_number,
                page.error.as_deref().unwrap_or("unknown error"),
            ),
            _ => progress.on_page_complete(id, page_number, page.translation.chars().count()),
        }
        info!(task = %id, page = page_number, status = ?page.status, "page re-translated");
        Ok((task, page))
    }

    /// Re-translate a range of pages in the background.
    ///
    /// Selected pages go back to `Pending` (their text is kept until a new
    /// result lands). An empty selection means every page.
    pub async fn retranslate_range(
        &self,
        id: &str,
        settings: TranslationSettings,
        overrides: &ProviderOverrides,
    ) -> Result<Option<JoinHandle<PoolReport>>, TaskError> {
        let task = self.store.load(id).await?;
        let provider = resolve_settings(&self.config.default_provider, Some(&task.provider), overrides)?;
        let translator = self
            .backend
            .translator(&provider, &self.config.target_language)?;

        let mut selected: BTreeSet<usize> =
            settings.range.to_page_numbers(task.total_pages).into_iter().collect();
        if selected.is_empty() {
            selected = task.pages.iter().map(|p| p.page_number).collect();
        }

        let (task, ()) = self
            .store
            .update(id, |t| {
                t.provider = ProviderInfo::from(&provider);
                for page in t.pages.iter_mut().filter(|p| selected.contains(&p.page_number)) {
                    page.status = PageStatus::Pending;
                    page.error = None;
                    page.updated_at = Utc::now();
                }
                Ok(())
            })
            .await?;

        let work: Vec<Page> = task
            .pages
            .into_iter()
            .filter(|p| selected.contains(&p.page_number))
            .collect();
        let workers = settings.worker_count(self.config.max_workers, work.len());
        info!(task = %id, pages = work.len(), range = %settings.range, "re-translation queued");
        Ok(self.spawn_pool(id, work, translator, workers))
    }

    // ── Formatting ───────────────────────────────────────────────────────

    /// Run the AI layout pass over the combined translation.
    ///
    /// Only one run per task may be active in this process; a second request
    /// gets [`TaskError::FormattingBusy`].
    pub async fn run_formatting(
        &self,
        id: &str,
        overrides: &ProviderOverrides,
    ) -> Result<(Task, String), TaskError> {
        let _slot = self.claim_formatting(id)?;
        let task = self.store.load(id).await?;
        let provider = resolve_settings(&self.config.default_provider, Some(&task.provider), overrides)?;
        let formatter = self.backend.formatter(&provider)?;
        let text = build_combined_text(&task)?;
        info!(task = %id, model = %provider.model, "AI layout started");

        let task = formatting::run_formatting(
            &self.store,
            self.config.progress_callback.as_ref(),
            FormattingLimits::from(self.config.as_ref()),
            id,
            &text,
            formatter.as_ref(),
            provider.kind,
            provider.max_tokens,
        )
        .await?;
        let url = task
            .formatted_txt_url
            .clone()
            .ok_or_else(|| TaskError::Internal("formatted text URL missing".into()))?;
        Ok((task, url))
    }

    /// Whether a formatting run for `id` is active in this process.
    pub fn is_formatting(&self, id: &str) -> bool {
        self.formatting
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }

    fn claim_formatting(&self, id: &str) -> Result<FormattingSlot, TaskError> {
        let mut set = self.formatting.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(id.to_string()) {
            return Err(TaskError::FormattingBusy { id: id.to_string() });
        }
        Ok(FormattingSlot {
            active: Arc::clone(&self.formatting),
            id: id.to_string(),
        })
    }

    // ── Exports ──────────────────────────────────────────────────────────

    /// Write `combined.txt` from every usable translation.
    pub async fn merge_text(&self, id: &str) -> Result<(Task, String), TaskError> {
        let task = self.store.load(id).await?;
        let text = build_combined_text(&task)?;
        let path = self.store.task_dir(id).join(COMBINED_TXT);
        replace_file(&path, text.as_bytes()).await?;
        let url = self.store.file_url(id, &[COMBINED_TXT]);
        let (task, ()) = self
            .store
            .update(id, |t| {
                t.combined_txt_path = Some(path.clone());
                t.combined_txt_url = Some(url.clone());
                Ok(())
            })
            .await?;
        info!(task = %id, url = %url, "combined text written");
        Ok((task, url))
    }

    /// Write `combined.pdf`: translations as text, untranslated pages as
    /// their rendered image.
    pub async fn merge_document(&self, id: &str) -> Result<(Task, String), TaskError> {
        let task = self.store.load(id).await?;
        let pages = document_pages(&task)?;
        let path = self.store.task_dir(id).join(COMBINED_PDF);
        self.renderer.render(&pages, &path).await?;
        let url = self.store.file_url(id, &[COMBINED_PDF]);
        let (task, ()) = self
            .store
            .update(id, |t| {
                t.combined_pdf_path = Some(path.clone());
                t.combined_pdf_url = Some(url.clone());
                Ok(())
            })
            .await?;
        info!(task = %id, url = %url, pages = pages.len(), "combined PDF written");
        Ok((task, url))
    }

    // ── Start-up ─────────────────────────────────────────────────────────

    /// Clear state left behind by a process that stopped mid-work.
    ///
    /// Call once at start-up, before accepting requests: any task still
    /// marked as formatting is reset, and every `Pending` page becomes an
    /// error the user can re-translate. Returns the number of tasks changed.
    pub async fn recover_interrupted(&self) -> Result<usize, TaskError> {
        let mut recovered = 0;
        for task in self.store.load_all().await? {
            let stale_pages = task.count_status(PageStatus::Pending);
            if !task.formatting_in_progress && stale_pages == 0 {
                continue;
            }
            self.store
                .update(&task.id, |t| {
                    t.formatting_in_progress = false;
                    t.formatting_completed_chunks =
                        t.formatting_completed_chunks.min(t.formatting_total_chunks);
                    for page in t.pages.iter_mut().filter(|p| p.status == PageStatus::Pending) {
                        page.mark_failed("translation interrupted");
                    }
                    Ok(())
                })
                .await?;
            warn!(task = %task.id, pending_pages = stale_pages, "recovered interrupted task");
            recovered += 1;
        }
        Ok(recovered)
    }
}

/// Base name of an uploaded file, `document.pdf` when nothing usable remains.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match base {
        "" | "." | ".." => "document.pdf".to_string(),
        other => other.to_string(),
    }
}
