//! Configuration for the task service.
//!
//! All service behaviour is controlled through [`ServiceConfig`], built via
//! its [`ServiceConfigBuilder`]. Per-request choices (which pages to translate
//! first, how many at once) travel separately in [`TranslationSettings`].

use crate::error::TaskError;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::DEFAULT_TARGET_LANGUAGE;
use crate::providers::ProviderSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`crate::TaskService`].
///
/// # Example
/// ```rust
/// use edgequake_pdftranslate::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .storage_dir("/var/lib/pdftranslate")
///     .max_workers(8)
///     .build()
///     .unwrap();
/// assert_eq!(config.static_prefix, "/pdf-data");
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    /// Root under which one directory per task is created. Default: `storage/pdf_tool`.
    pub storage_dir: PathBuf,

    /// URL prefix for artifact links, always starting with `/`. Default: `/pdf-data`.
    pub static_prefix: String,

    /// Upper bound on concurrent page translations. Default: 4.
    pub max_workers: usize,

    /// Provider used when a request names none. Its key is never persisted.
    pub default_provider: ProviderSettings,

    /// Language every page is translated into. Default: Simplified Chinese.
    pub target_language: String,

    /// Concurrent formatter calls at the start of a run. Default: 3.
    ///
    /// Drops to 1 for the rest of the run on the first throttle signal.
    pub formatter_worker_cap: usize,

    /// Throttle-and-retry attempts per chunk before the run fails. Default: 3.
    pub formatter_max_retries: u32,

    /// Back-off is `backoff_unit × attempt`. Default: 1 s.
    pub formatter_backoff_unit: Duration,

    /// How often a chunk waiting for a slot re-checks. Default: 50 ms.
    pub slot_poll_interval: Duration,

    /// Hard limit on a whole formatting run. Default: 30 min; `None` disables it.
    pub formatting_deadline: Option<Duration>,

    /// Page and chunk events. Default: no-op.
    pub progress_callback: ProgressCallback,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("storage/pdf_tool"),
            static_prefix: "/pdf-data".to_string(),
            max_workers: 4,
            default_provider: ProviderSettings::default(),
            target_language: DEFAULT_TARGET_LANGUAGE.to_string(),
            formatter_worker_cap: 3,
            formatter_max_retries: 3,
            formatter_backoff_unit: Duration::from_secs(1),
            slot_poll_interval: Duration::from_millis(50),
            formatting_deadline: Some(Duration::from_secs(30 * 60)),
            progress_callback: Arc::new(NoopProgressCallback),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("storage_dir", &self.storage_dir)
            .field("static_prefix", &self.static_prefix)
            .field("max_workers", &self.max_workers)
            .field("default_provider", &self.default_provider)
            .field("target_language", &self.target_language)
            .field("formatter_worker_cap", &self.formatter_worker_cap)
            .field("formatter_max_retries", &self.formatter_max_retries)
            .field("formatter_backoff_unit", &self.formatter_backoff_unit)
            .field("slot_poll_interval", &self.slot_poll_interval)
            .field("formatting_deadline", &self.formatting_deadline)
            .finish()
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = dir.into();
        self
    }

    pub fn static_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.config.static_prefix = normalise_prefix(prefix.as_ref());
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n.max(1);
        self
    }

    pub fn default_provider(mut self, settings: ProviderSettings) -> Self {
        self.config.default_provider = settings;
        self
    }

    pub fn target_language(mut self, language: impl Into<String>) -> Self {
        self.config.target_language = language.into();
        self
    }

    pub fn formatter_worker_cap(mut self, n: usize) -> Self {
        self.config.formatter_worker_cap = n.max(1);
        self
    }

    pub fn formatter_max_retries(mut self, n: u32) -> Self {
        self.config.formatter_max_retries = n;
        self
    }

    pub fn formatter_backoff_unit(mut self, unit: Duration) -> Self {
        self.config.formatter_backoff_unit = unit;
        self
    }

    pub fn slot_poll_interval(mut self, interval: Duration) -> Self {
        self.config.slot_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn formatting_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.config.formatting_deadline = deadline;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = cb;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, TaskError> {
        let c = &self.config;
        if c.storage_dir.as_os_str().is_empty() {
            return Err(TaskError::InvalidConfig(
                "storage directory must not be empty".into(),
            ));
        }
        if c.target_language.trim().is_empty() {
            return Err(TaskError::InvalidConfig(
                "target language must not be empty".into(),
            ));
        }
        if matches!(c.formatting_deadline, Some(d) if d.is_zero()) {
            return Err(TaskError::InvalidConfig(
                "formatting deadline must be positive".into(),
            ));
        }
        Ok(self.config)
    }
}

fn normalise_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/pdf-data".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Which pages are translated when a task is created.
///
/// Zero (or a negative value from a loosely typed request) means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitialRange {
    /// Every page (default).
    #[default]
    All,
    /// The first `n` pages; `n <= 0` means all.
    First(i64),
    /// Pages `start..=end` (1-based). `start <= 0` means 1, `end <= 0` means
    /// the last page. Reversed bounds are swapped and both are clamped to
    /// the page count.
    Range(i64, i64),
}

impl InitialRange {
    /// Build from the string form used by the CLI and HTTP front-ends:
    /// `mode` is `"all"`, `"custom"`/`"first"` (uses `count`) or `"range"`.
    pub fn from_mode(mode: &str, count: i64, start: i64, end: i64) -> Self {
        match mode.trim().to_lowercase().as_str() {
            "custom" | "first" => InitialRange::First(count),
            "range" => InitialRange::Range(start, end),
            _ => InitialRange::All,
        }
    }

    /// Expand into sorted 1-based page numbers within `1..=total`.
    pub fn to_page_numbers(&self, total: usize) -> Vec<usize> {
        let all = || (1..=total).collect();
        match *self {
            InitialRange::All => all(),
            InitialRange::First(n) if n <= 0 => all(),
            InitialRange::First(n) => (1..=(n as usize).min(total)).collect(),
            InitialRange::Range(start, end) if start <= 0 && end <= 0 => all(),
            InitialRange::Range(start, end) => {
                let mut s = if start <= 0 { 1 } else { start as usize };
                let mut e = if end <= 0 { total } else { end as usize };
                if s > e {
                    std::mem::swap(&mut s, &mut e);
                }
                (s.min(total)..=e.min(total)).filter(|&n| n >= 1).collect()
            }
        }
    }
}

impl fmt::Display for InitialRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialRange::All => write!(f, "all"),
            InitialRange::First(n) => write!(f, "first:{n}"),
            InitialRange::Range(s, e) => write!(f, "{s}-{e}"),
        }
    }
}

/// Per-request translation knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TranslationSettings {
    pub range: InitialRange,
    /// Additional cap on concurrent page workers; `<= 0` means no cap.
    pub batch_limit: i64,
}

impl TranslationSettings {
    /// `min(max_workers, batch_limit if positive, pages)`, at least 1 when
    /// there is any work.
    pub fn worker_count(&self, max_workers: usize, pages: usize) -> usize {
        let mut n = max_workers.max(1);
        if self.batch_limit > 0 {
            n = n.min(self.batch_limit as usize);
        }
        n.min(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ServiceConfig::default();
        assert_eq!(c.max_workers, 4);
        assert_eq!(c.static_prefix, "/pdf-data");
        assert_eq!(c.formatter_worker_cap, 3);
        assert_eq!(c.formatter_max_retries, 3);
        assert_eq!(c.slot_poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn builder_clamps_and_normalises() {
        let c = ServiceConfig::builder()
            .max_workers(0)
            .static_prefix("files/")
            .build()
            .unwrap();
        assert_eq!(c.max_workers, 1);
        assert_eq!(c.static_prefix, "/files");
    }

    #[test]
    fn zero_deadline_rejected() {
        let err = ServiceConfig::builder()
            .formatting_deadline(Some(Duration::ZERO))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[test]
    fn first_n_clamps_and_non_positive_means_all() {
        assert_eq!(InitialRange::First(3).to_page_numbers(5), vec![1, 2, 3]);
        assert_eq!(InitialRange::First(9).to_page_numbers(5), vec![1, 2, 3, 4, 5]);
        assert_eq!(InitialRange::First(0).to_page_numbers(2), vec![1, 2]);
        assert_eq!(InitialRange::All.to_page_numbers(0), Vec::<usize>::new());
    }

    #[test]
    fn range_rules() {
        assert_eq!(InitialRange::Range(0, 0).to_page_numbers(3), vec![1, 2, 3]);
        assert_eq!(InitialRange::Range(0, 2).to_page_numbers(5), vec![1, 2]);
        assert_eq!(InitialRange::Range(4, 0).to_page_numbers(5), vec![4, 5]);
        assert_eq!(InitialRange::Range(4, 2).to_page_numbers(5), vec![2, 3, 4]);
        assert_eq!(InitialRange::Range(3, 99).to_page_numbers(5), vec![3, 4, 5]);
        assert_eq!(InitialRange::Range(7, 9).to_page_numbers(5), vec![5]);
    }

    #[test]
    fn mode_strings() {
        assert_eq!(InitialRange::from_mode("Custom", 2, 0, 0), InitialRange::First(2));
        assert_eq!(InitialRange::from_mode("range", 0, 2, 4), InitialRange::Range(2, 4));
        assert_eq!(InitialRange::from_mode("", 5, 5, 5), InitialRange::All);
    }

    #[test]
    fn worker_count_respects_batch_limit() {
        let s = TranslationSettings {
            range: InitialRange::All,
            batch_limit: 2,
        };
        assert_eq!(s.worker_count(4, 10), 2);
        assert_eq!(s.worker_count(4, 1), 1);
        assert_eq!(TranslationSettings::default().worker_count(4, 10), 4);
        assert_eq!(TranslationSettings::default().worker_count(4, 0), 0);
    }
}
