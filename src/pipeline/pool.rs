//! Bounded-concurrency page translation.
//!
//! Pages are independent, so they run through `buffer_unordered` with at
//! most `workers` provider calls in flight. Each finished page is merged into
//! the stored task on its own (reload under the store lock, replace by page
//! id, save), so results land one by one and concurrent workers never
//! overwrite each other.

use crate::error::TaskError;
use crate::model::{Page, PageStatus, Task};
use crate::progress::TaskProgressCallback;
use crate::providers::Translator;
use crate::store::{remove_if_exists, replace_file, TaskStore, PAGES_DIR};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};

/// Outcome counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
}

/// Translate `pages` of task `task_id` with at most `workers` in flight.
///
/// Per-page failures are recorded on the page and counted, never returned.
pub async fn translate_pages(
    store: &TaskStore,
    progress: &dyn TaskProgressCallback,
    task_id: &str,
    pages: Vec<Page>,
    translator: &dyn Translator,
    workers: usize,
) -> PoolReport {
    if pages.is_empty() || workers == 0 {
        debug!(task = %task_id, "nothing to translate");
        return PoolReport::default();
    }
    info!(task = %task_id, pages = pages.len(), workers, "translation started");
    progress.on_pool_start(task_id, pages.len());

    let statuses: Vec<PageStatus> = stream::iter(pages.into_iter().map(move |page| {
        let number = page.page_number;
        let span = info_span!("page", task = %task_id, page = number);
        async move {
            progress.on_page_start(task_id, number);
            match translate_single_page(store, task_id, page, translator).await {
                Ok((_, page)) => {
                    match page.status {
                        PageStatus::Completed => progress.on_page_complete(
                            task_id,
                            number,
                            page.translation.chars().count(),
                        ),
                        _ => progress.on_page_error(
                            task_id,
                            number,
                            page.error.as_deref().unwrap_or("unknown error"),
                        ),
                    }
                    page.status
                }
                Err(e) => {
                    warn!("could not persist page result: {e}");
                    progress.on_page_error(task_id, number, &e.to_string());
                    PageStatus::Error
                }
            }
        }
        .instrument(span)
    }))
    .buffer_unordered(workers)
    .collect()
    .await;

    let report = PoolReport {
        completed: statuses.iter().filter(|s| **s == PageStatus::Completed).count(),
        failed: statuses.iter().filter(|s| **s == PageStatus::Error).count(),
    };
    info!(
        task = %task_id,
        completed = report.completed,
        failed = report.failed,
        "translation finished"
    );
    progress.on_pool_complete(task_id, report.completed, report.failed);
    report
}

/// Translate one page and merge the result into the stored task.
///
/// A provider failure is not an error here: the page is saved with
/// `status = error` and its previous text intact. Only store failures are
/// returned.
pub async fn translate_single_page(
    store: &TaskStore,
    task_id: &str,
    mut page: Page,
    translator: &dyn Translator,
) -> Result<(Task, Page), TaskError> {
    let number = page.page_number;
    match translator.translate(&page.image_path, number).await {
        Ok(result) => {
            let translation = result.translated_text.trim();
            let text_url = if result.has_text && !translation.is_empty() {
                replace_file(&page.text_path, translation.as_bytes())
                    .await
                    .map(|()| Some(page_text_url(store, task_id, &page)))
            } else {
                if let Err(e) = remove_if_exists(&page.text_path).await {
                    warn!("stale page text not removed: {e}");
                }
                Ok(None)
            };
            match text_url {
                Ok(url) => {
                    page.mark_completed(&result, url);
                    debug!(chars = page.translation.chars().count(), "page translated");
                }
                Err(e) => page.mark_failed(format!("failed to write page text: {e}")),
            }
        }
        Err(e) => {
            warn!("page translation failed: {e}");
            page.mark_failed(e.to_string());
        }
    }

    let task = store.merge_page(task_id, page.clone()).await?;
    Ok((task, page))
}

fn page_text_url(store: &TaskStore, task_id: &str, page: &Page) -> String {
    let file = page
        .text_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    store.file_url(task_id, &[PAGES_DIR, &file])
}
