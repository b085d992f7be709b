//! Filesystem-backed task store.
//!
//! Each task owns one directory under the storage root:
//!
//! ```text
//! <root>/<task-id>/
//!   source.pdf
//!   pages/page-001.png, page-001.txt, …
//!   combined.txt  combined.pdf  formatted.txt
//!   formatter_chunks/        (only while a formatting run is active)
//!   meta.json                (the Task record)
//! ```
//!
//! `meta.json` is always replaced atomically (write `meta.json.tmp`, then
//! rename), so a reader sees either the old or the new record, never a torn
//! one. All writers go through one coarse mutex per store; holding a
//! [`StoreGuard`] is what entitles a caller to use [`TaskStore::save_locked`].

use crate::error::TaskError;
use crate::model::{Page, Task, TaskSummary};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

pub const META_FILE: &str = "meta.json";
pub const SOURCE_FILE: &str = "source.pdf";
pub const PAGES_DIR: &str = "pages";
pub const COMBINED_TXT: &str = "combined.txt";
pub const COMBINED_PDF: &str = "combined.pdf";
pub const FORMATTED_TXT: &str = "formatted.txt";
pub const CHUNKS_DIR: &str = "formatter_chunks";

/// Proof that the store's write lock is held.
pub struct StoreGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

#[derive(Debug)]
pub struct TaskStore {
    root: PathBuf,
    static_prefix: String,
    lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>, static_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            static_prefix: static_prefix.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.task_dir(id).join(META_FILE)
    }

    /// Public URL of a file inside a task directory.
    pub fn file_url(&self, id: &str, parts: &[&str]) -> String {
        let mut url = format!("{}/{}", self.static_prefix.trim_end_matches('/'), id);
        for part in parts {
            url.push('/');
            url.push_str(part.trim_matches('/'));
        }
        url
    }

    pub async fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            _guard: self.lock.lock().await,
        }
    }

    /// Read a task record. Unknown or malformed ids are `TaskNotFound`.
    pub async fn load(&self, id: &str) -> Result<Task, TaskError> {
        validate_id(id)?;
        let path = self.meta_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskError::TaskNotFound { id: id.to_string() })
            }
            Err(e) => return Err(TaskError::io(path, e)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Persist a task, taking the lock for the duration of the write.
    pub async fn save(&self, task: &mut Task) -> Result<(), TaskError> {
        let guard = self.lock().await;
        self.save_locked(&guard, task).await
    }

    /// Persist a task while the caller already holds the lock.
    ///
    /// Stamps `updated_at` and sorts pages by number before writing.
    pub async fn save_locked(
        &self,
        _guard: &StoreGuard<'_>,
        task: &mut Task,
    ) -> Result<(), TaskError> {
        validate_id(&task.id)?;
        task.updated_at = Utc::now();
        task.sort_pages();

        let dir = self.task_dir(&task.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TaskError::io(&dir, e))?;

        let json = serde_json::to_vec_pretty(&task)?;
        let path = dir.join(META_FILE);
        let tmp = dir.join(format!("{META_FILE}.tmp"));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| TaskError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| TaskError::io(&path, e))?;
        debug!(task = %task.id, bytes = json.len(), "meta.json saved");
        Ok(())
    }

    /// Load, mutate and save as one critical section.
    pub async fn update<F, R>(&self, id: &str, mutate: F) -> Result<(Task, R), TaskError>
    where
        F: FnOnce(&mut Task) -> Result<R, TaskError>,
    {
        let guard = self.lock().await;
        let mut task = self.load(id).await?;
        let out = mutate(&mut task)?;
        self.save_locked(&guard, &mut task).await?;
        Ok((task, out))
    }

    /// Replace the page with the same id (or append it) in the stored task.
    ///
    /// Reloads under the lock so concurrent page workers never overwrite
    /// each other's results.
    pub async fn merge_page(&self, id: &str, page: Page) -> Result<Task, TaskError> {
        let (task, ()) = self
            .update(id, |task| {
                task.upsert_page(page);
                Ok(())
            })
            .await?;
        Ok(task)
    }

    /// Remove a task and every artifact it owns.
    pub async fn delete(&self, id: &str) -> Result<(), TaskError> {
        validate_id(id)?;
        let _guard = self.lock().await;
        let dir = self.task_dir(id);
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => return Err(TaskError::TaskNotFound { id: id.to_string() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskError::TaskNotFound { id: id.to_string() })
            }
            Err(e) => return Err(TaskError::io(dir, e)),
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| TaskError::io(&dir, e))
    }

    /// Every readable task, newest update first (ties: newest creation first).
    pub async fn list_summaries(&self) -> Result<Vec<TaskSummary>, TaskError> {
        let mut summaries: Vec<TaskSummary> =
            self.load_all().await?.iter().map(Task::summary).collect();
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(summaries)
    }

    /// Every readable task record, in directory order. Directories whose
    /// `meta.json` is missing or malformed are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<Task>, TaskError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TaskError::io(&self.root, e)),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TaskError::io(&self.root, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.load(&name).await {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(task = %name, "skipping unreadable task: {e}"),
            }
        }
        Ok(tasks)
    }
}

/// Task ids become directory names; reject anything that could escape the
/// storage root.
fn validate_id(id: &str) -> Result<(), TaskError> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\'])
        || id.contains("..")
        || id.contains('\0');
    if bad {
        return Err(TaskError::TaskNotFound { id: id.to_string() });
    }
    Ok(())
}

/// Write a file via a sibling temp file and rename, so readers never see a
/// partial artifact. Missing parent directories are created.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TaskError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TaskError::io(parent, e))?;
    }
    replace_file(path, bytes).await
}

/// Like [`write_atomic`] but never creates directories: writing into a task
/// whose folder was deleted fails instead of bringing the folder back.
pub async fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), TaskError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{file_name}.{}.tmp",
        uuid::Uuid::new_v4().simple()
    ));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| TaskError::io(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(TaskError::io(path, e));
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> Result<(), TaskError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TaskError::io(path, e)),
    }
}
