//! Task lifecycle tests against fake collaborators.
//!
//! The rasteriser writes small blank PNGs, the translator and formatter are
//! scripted, and every task lives in a fresh temporary storage root, so these
//! run offline and without pdfium.

use async_trait::async_trait;
use edgequake_pdftranslate::error::{ProviderError, TaskError};
use edgequake_pdftranslate::pipeline::document::{build_combined_text, LopdfRenderer};
use edgequake_pdftranslate::pipeline::formatting::{estimate_chunk_size, split_text_chunks};
use edgequake_pdftranslate::pipeline::render::{page_image_name, Rasterizer};
use edgequake_pdftranslate::providers::{
    ChunkFormatter, FormatterChunk, OcrResult, ProviderBackend, ProviderSettings, Translator,
};
use edgequake_pdftranslate::store::{CHUNKS_DIR, META_FILE};
use edgequake_pdftranslate::{
    InitialRange, PageStatus, ProviderKind, ProviderOverrides, ServiceConfig, ServiceConfigBuilder,
    Task, TaskService, TranslationSettings,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

// ── Fakes ────────────────────────────────────────────────────────────────────

struct FakeRasterizer {
    pages: usize,
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn render_pages(&self, _source: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, TaskError> {
        std::fs::create_dir_all(out_dir).map_err(|e| TaskError::io(out_dir, e))?;
        let mut paths = Vec::new();
        for n in 1..=self.pages {
            let path = out_dir.join(page_image_name(n));
            image::RgbImage::from_pixel(8, 10, image::Rgb([255, 255, 255]))
                .save(&path)
                .map_err(|e| TaskError::Render(e.to_string()))?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Translates page N to `"translated N"` (padded to `body_chars` when set),
/// failing the pages listed in `failing`.
#[derive(Default)]
struct FakeTranslator {
    failing: Mutex<HashSet<usize>>,
    calls: Mutex<Vec<usize>>,
    body_chars: usize,
    version: AtomicUsize,
    /// Time each call takes before answering.
    delay: Duration,
}

impl FakeTranslator {
    fn fail(&self, page: usize) {
        self.failing.lock().unwrap().insert(page);
    }

    fn recover(&self, page: usize) {
        self.failing.lock().unwrap().remove(&page);
    }

    fn calls_for(&self, page: usize) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| **p == page).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(&self, _image: &Path, page_number: usize) -> Result<OcrResult, ProviderError> {
        self.calls.lock().unwrap().push(page_number);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().unwrap().contains(&page_number) {
            return Err(ProviderError::InvalidResponse {
                provider: "fake".into(),
                detail: format!("page {page_number} unreadable"),
            });
        }
        let mut text = format!("translated {page_number}");
        let version = self.version.load(Ordering::SeqCst);
        if version > 0 {
            text.push_str(&format!(" v{version}"));
        }
        while text.chars().count() < self.body_chars {
            text.push_str(&format!("\nline of page {page_number}"));
        }
        Ok(OcrResult {
            has_text: true,
            source_text: format!("source {page_number}"),
            translated_text: format!("  {text}  "),
        })
    }
}

enum FormatMode {
    /// Echo the chunk with an index tag; later chunks answer sooner.
    Echo,
    AlwaysRateLimited,
    /// Echo after this long.
    Slow(Duration),
    /// Echo once notified.
    Gate(Arc<Notify>),
    /// Return almost nothing for the first call, then echo.
    TruncateOnce,
    /// This chunk is always rate limited; the others behave as in `Echo`.
    RateLimitAt(usize),
    /// This chunk answers 400 after `after`. Chunk 0 takes ten times as
    /// long and every other chunk answers after 10 ms.
    FailAt { index: usize, after: Duration },
}

struct FakeFormatter {
    mode: FormatMode,
    calls: AtomicUsize,
    /// Chunk index of every call, in call order.
    order: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    /// Set once a 429 has been returned.
    throttled: AtomicBool,
    /// Most calls seen in flight at once after the first 429.
    peak_after_throttle: AtomicUsize,
}

impl FakeFormatter {
    fn new(mode: FormatMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            throttled: AtomicBool::new(false),
            peak_after_throttle: AtomicUsize::new(0),
        })
    }

    fn calls_for(&self, index: usize) -> usize {
        self.order.lock().unwrap().iter().filter(|i| **i == index).count()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn echo(chunk: &FormatterChunk) -> String {
    format!("<{}>\n{}", chunk.index, chunk.text)
}

fn status(code: u16, body: &str) -> ProviderError {
    ProviderError::Status {
        provider: "fake".into(),
        status: code,
        body: body.into(),
    }
}

async fn echo_staggered(chunk: &FormatterChunk) -> String {
    let delay = 20u64.saturating_sub(chunk.index as u64 * 5);
    tokio::time::sleep(Duration::from_millis(delay)).await;
    echo(chunk)
}

#[async_trait]
impl ChunkFormatter for FakeFormatter {
    async fn format_chunk(&self, chunk: &FormatterChunk) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(chunk.index);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        if self.throttled.load(Ordering::SeqCst) {
            self.peak_after_throttle.fetch_max(now, Ordering::SeqCst);
        }
        match &self.mode {
            FormatMode::Echo => Ok(echo_staggered(chunk).await),
            FormatMode::AlwaysRateLimited => Err(status(429, "slow down")),
            FormatMode::Slow(d) => {
                tokio::time::sleep(*d).await;
                Ok(echo(chunk))
            }
            FormatMode::Gate(notify) => {
                notify.notified().await;
                Ok(echo(chunk))
            }
            FormatMode::TruncateOnce if call == 0 => Ok("x".into()),
            FormatMode::TruncateOnce => Ok(echo(chunk)),
            FormatMode::RateLimitAt(index) if chunk.index == *index => {
                self.throttled.store(true, Ordering::SeqCst);
                Err(status(429, "slow down"))
            }
            FormatMode::RateLimitAt(_) => Ok(echo_staggered(chunk).await),
            FormatMode::FailAt { index, after } if chunk.index == *index => {
                tokio::time::sleep(*after).await;
                Err(status(400, "bad request"))
            }
            FormatMode::FailAt { after, .. } => {
                let delay = if chunk.index == 0 {
                    *after * 10
                } else {
                    Duration::from_millis(10)
                };
                tokio::time::sleep(delay).await;
                Ok(echo(chunk))
            }
        }
    }
}

struct FakeBackend {
    translator: Arc<FakeTranslator>,
    formatter: Arc<FakeFormatter>,
}

impl ProviderBackend for FakeBackend {
    fn translator(
        &self,
        _settings: &ProviderSettings,
        _target_language: &str,
    ) -> Result<Arc<dyn Translator>, TaskError> {
        Ok(self.translator.clone())
    }

    fn formatter(&self, _settings: &ProviderSettings) -> Result<Arc<dyn ChunkFormatter>, TaskError> {
        Ok(self.formatter.clone())
    }
}

// ── Test helpers ─────────────────────────────────────────────────────────────

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    service: TaskService,
    translator: Arc<FakeTranslator>,
    formatter: Arc<FakeFormatter>,
}

fn provider_defaults(kind: ProviderKind) -> ProviderSettings {
    ProviderSettings {
        kind,
        api_key: "test-key".into(),
        model: "test-model".into(),
        ..ProviderSettings::default()
    }
}

fn harness_with(
    pages: usize,
    translator: FakeTranslator,
    formatter: Arc<FakeFormatter>,
    tweak: impl FnOnce(ServiceConfigBuilder) -> ServiceConfigBuilder,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("storage");
    let builder = ServiceConfig::builder()
        .storage_dir(&root)
        .default_provider(provider_defaults(ProviderKind::Gemini))
        .formatter_backoff_unit(Duration::from_millis(1))
        .slot_poll_interval(Duration::from_millis(1));
    let config = tweak(builder).build().unwrap();
    let translator = Arc::new(translator);
    let backend = Arc::new(FakeBackend {
        translator: translator.clone(),
        formatter: formatter.clone(),
    });
    let service = TaskService::with_components(
        config,
        backend,
        Arc::new(FakeRasterizer { pages }),
        Arc::new(LopdfRenderer),
    );
    Harness {
        _dir: dir,
        root,
        service,
        translator,
        formatter,
    }
}

fn harness(pages: usize) -> Harness {
    harness_with(pages, FakeTranslator::default(), FakeFormatter::new(FormatMode::Echo), |b| b)
}

/// Create a task and wait for its initial translation.
async fn create_and_wait(h: &Harness, range: InitialRange) -> Task {
    let created = h
        .service
        .create_task(
            b"%PDF-1.4 fake",
            "uploads/scan.pdf",
            &ProviderOverrides::default(),
            TranslationSettings {
                range,
                batch_limit: 0,
            },
        )
        .await
        .unwrap();
    if let Some(handle) = created.translation {
        handle.await.unwrap();
    }
    h.service.get_task(&created.task.id).await.unwrap()
}

fn assert_invariants(task: &Task) {
    for page in &task.pages {
        match page.status {
            PageStatus::Error => assert!(page.error.is_some(), "page {} lacks error", page.page_number),
            _ => assert!(page.error.is_none(), "page {} has stray error", page.page_number),
        }
    }
    assert!(task.formatting_completed_chunks <= task.formatting_total_chunks);
    if task.formatted_by_ai {
        assert_eq!(task.formatting_completed_chunks, task.formatting_total_chunks);
        assert!(!task.formatting_in_progress);
    }
    let numbers: Vec<usize> = task.pages.iter().map(|p| p.page_number).collect();
    let mut sorted = numbers.clone();
    sorted.sort_unstable();
    assert_eq!(numbers, sorted, "pages must be kept in page order");
}

// ── Creation ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_first_three_of_five() {
    let h = harness(5);
    let task = create_and_wait(&h, InitialRange::First(3)).await;

    assert_eq!(task.total_pages, 5);
    assert_eq!(task.pages.len(), 5);
    assert_eq!(task.file_name, "scan.pdf");
    assert_eq!(h.translator.total_calls(), 3);
    for n in 1..=3 {
        let page = task.page(n).unwrap();
        assert_eq!(page.status, PageStatus::Completed);
        assert!(!page.skipped);
        assert_eq!(page.translation, format!("translated {n}"));
        let expected_url = format!("/pdf-data/{}/pages/page-{n:03}.txt", task.id);
        assert_eq!(page.text_url.as_deref(), Some(expected_url.as_str()));
        assert_eq!(
            std::fs::read_to_string(&page.text_path).unwrap(),
            format!("translated {n}")
        );
    }
    for n in 4..=5 {
        let page = task.page(n).unwrap();
        assert_eq!(page.status, PageStatus::Completed);
        assert!(page.skipped);
        assert!(!page.has_text);
        assert!(page.translation.is_empty());
        assert!(page.text_url.is_none());
    }
    assert_invariants(&task);
}

#[tokio::test]
async fn test_create_with_range_selects_inclusive_pages() {
    let h = harness(6);
    let task = create_and_wait(&h, InitialRange::Range(2, 4)).await;
    let translated: Vec<usize> = task
        .pages
        .iter()
        .filter(|p| !p.skipped)
        .map(|p| p.page_number)
        .collect();
    assert_eq!(translated, vec![2, 3, 4]);
    assert_eq!(h.translator.total_calls(), 3);
}

#[tokio::test]
async fn test_missing_api_key_fails_before_writing() {
    let h = harness_with(
        2,
        FakeTranslator::default(),
        FakeFormatter::new(FormatMode::Echo),
        |b| b.default_provider(ProviderSettings::default()),
    );
    let err = h
        .service
        .create_task(
            b"%PDF",
            "a.pdf",
            &ProviderOverrides::default(),
            TranslationSettings::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidConfig(_)), "{err}");
    assert!(!h.root.exists() || std::fs::read_dir(&h.root).unwrap().next().is_none());
}

#[tokio::test]
async fn test_failed_page_is_recorded_with_message() {
    let translator = FakeTranslator::default();
    translator.fail(2);
    let h = harness_with(3, translator, FakeFormatter::new(FormatMode::Echo), |b| b);
    let task = create_and_wait(&h, InitialRange::All).await;

    let page = task.page(2).unwrap();
    assert_eq!(page.status, PageStatus::Error);
    assert!(page.error.as_deref().unwrap().contains("unreadable"));
    assert_eq!(task.count_status(PageStatus::Completed), 2);
    assert_invariants(&task);
}

// ── Re-translation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retranslate_is_idempotent() {
    let h = harness(2);
    let task = create_and_wait(&h, InitialRange::All).await;
    let before = task.page(1).unwrap().clone();

    let (task1, page1) = assert_ok!(
        h.service
            .retranslate_page(&task.id, 1, &ProviderOverrides::default())
            .await
    );
    let (task2, page2) = assert_ok!(
        h.service
            .retranslate_page(&task.id, 1, &ProviderOverrides::default())
            .await
    );

    assert_eq!(page1.translation, before.translation);
    assert_eq!(page2.translation, before.translation);
    assert_eq!(page2.id, before.id);
    assert_eq!(task1.pages.len(), 2);
    assert_eq!(task2.pages.len(), 2);
    assert_eq!(h.translator.calls_for(1), 3);
}

#[tokio::test]
async fn test_retranslate_failure_keeps_previous_translation() {
    let h = harness(2);
    let task = create_and_wait(&h, InitialRange::All).await;

    h.translator.fail(2);
    let (_, page) = h
        .service
        .retranslate_page(&task.id, 2, &ProviderOverrides::default())
        .await
        .unwrap();
    assert_eq!(page.status, PageStatus::Error);
    assert_eq!(page.translation, "translated 2");
    assert!(page.has_text);

    let stored = h.service.get_task(&task.id).await.unwrap();
    assert_eq!(stored.page(2).unwrap().translation, "translated 2");
    assert_invariants(&stored);

    h.translator.recover(2);
    h.translator.version.store(2, Ordering::SeqCst);
    let (_, page) = h
        .service
        .retranslate_page(&task.id, 2, &ProviderOverrides::default())
        .await
        .unwrap();
    assert_eq!(page.status, PageStatus::Completed);
    assert!(page.error.is_none());
    assert_eq!(page.translation, "translated 2 v2");
}

#[tokio::test]
async fn test_retranslate_skipped_page_clears_skip_flag() {
    let h = harness(3);
    let task = create_and_wait(&h, InitialRange::First(1)).await;
    assert!(task.page(3).unwrap().skipped);

    let (_, page) = h
        .service
        .retranslate_page(&task.id, 3, &ProviderOverrides::default())
        .await
        .unwrap();
    assert!(!page.skipped);
    assert_eq!(page.translation, "translated 3");
}

#[tokio::test]
async fn test_retranslate_unknown_page_and_task() {
    let h = harness(2);
    let task = create_and_wait(&h, InitialRange::All).await;

    let err = assert_err!(
        h.service
            .retranslate_page(&task.id, 9, &ProviderOverrides::default())
            .await
    );
    assert!(matches!(err, TaskError::PageNotFound { page: 9, .. }));

    let err = assert_err!(
        h.service
            .retranslate_page("no-such-task", 1, &ProviderOverrides::default())
            .await
    );
    assert!(matches!(err, TaskError::TaskNotFound { .. }));
}

#[tokio::test]
async fn test_retranslate_range_runs_only_selected_pages() {
    let h = harness(5);
    let task = create_and_wait(&h, InitialRange::All).await;
    h.translator.version.store(1, Ordering::SeqCst);

    let handle = h
        .service
        .retranslate_range(
            &task.id,
            TranslationSettings {
                range: InitialRange::Range(2, 3),
                batch_limit: 1,
            },
            &ProviderOverrides::default(),
        )
        .await
        .unwrap()
        .expect("pages were selected");
    let report = handle.await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);

    let stored = h.service.get_task(&task.id).await.unwrap();
    assert_eq!(stored.page(1).unwrap().translation, "translated 1");
    assert_eq!(stored.page(2).unwrap().translation, "translated 2 v1");
    assert_eq!(stored.page(3).unwrap().translation, "translated 3 v1");
    assert_eq!(stored.page(4).unwrap().translation, "translated 4");
    assert_eq!(h.translator.calls_for(2), 2);
    assert_eq!(h.translator.calls_for(4), 1);
}

// ── Formatting ───────────────────────────────────────────────────────────────

fn long_pages_harness(mode: FormatMode) -> Harness {
    let translator = FakeTranslator {
        body_chars: 6_000,
        ..FakeTranslator::default()
    };
    harness_with(8, translator, FakeFormatter::new(mode), |b| b)
}

#[tokio::test]
async fn test_formatting_reassembles_chunks_in_order() {
    let h = long_pages_harness(FormatMode::Echo);
    let task = create_and_wait(&h, InitialRange::All).await;

    let text = build_combined_text(&task).unwrap();
    let chunks = split_text_chunks(
        &text,
        estimate_chunk_size(ProviderKind::Gemini, task.provider.max_tokens),
    );
    assert!(chunks.len() >= 3, "expected several chunks, got {}", chunks.len());
    let expected = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("<{i}>\n{c}").trim().to_string())
        .collect::<Vec<_>>()
        .join("\n\n");

    let (task, url) = h
        .service
        .run_formatting(&task.id, &ProviderOverrides::default())
        .await
        .unwrap();
    assert_eq!(url, format!("/pdf-data/{}/formatted.txt", task.id));
    let written = std::fs::read_to_string(task.formatted_txt_path.as_ref().unwrap()).unwrap();
    assert_eq!(written, expected.trim());

    assert!(task.formatted_by_ai);
    assert!(!task.formatting_in_progress);
    assert_eq!(task.formatting_total_chunks, chunks.len());
    assert_eq!(task.formatting_completed_chunks, chunks.len());
    assert_eq!(h.formatter.calls.load(Ordering::SeqCst), chunks.len());
    assert!(!h.root.join(&task.id).join(CHUNKS_DIR).exists());
    assert_invariants(&task);
}

#[tokio::test]
async fn test_rate_limited_chunk_retries_three_times_then_fails() {
    let h = harness_with(
        1,
        FakeTranslator::default(),
        FakeFormatter::new(FormatMode::AlwaysRateLimited),
        |b| b,
    );
    let task = create_and_wait(&h, InitialRange::All).await;

    let err = h
        .service
        .run_formatting(&task.id, &ProviderOverrides::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, TaskError::Provider(ProviderError::Status { status: 429, .. })),
        "{err}"
    );
    assert_eq!(h.formatter.calls.load(Ordering::SeqCst), 4);

    let stored = h.service.get_task(&task.id).await.unwrap();
    assert!(!stored.formatting_in_progress);
    assert!(!stored.formatted_by_ai);
    assert_eq!(stored.formatting_total_chunks, 1);
    assert_eq!(stored.formatting_completed_chunks, 0);
    assert!(!h.service.is_formatting(&task.id));
    assert_invariants(&stored);
}

/// Chunks the formatter will see for `task`.
fn expected_chunks(task: &Task) -> Vec<String> {
    let text = build_combined_text(task).unwrap();
    split_text_chunks(
        &text,
        estimate_chunk_size(ProviderKind::Gemini, task.provider.max_tokens),
    )
}

#[tokio::test]
async fn test_rate_limited_chunk_serialises_siblings_and_keeps_their_progress() {
    let translator = FakeTranslator {
        body_chars: 6_000,
        ..FakeTranslator::default()
    };
    let h = harness_with(8, translator, FakeFormatter::new(FormatMode::RateLimitAt(1)), |b| {
        b.formatter_backoff_unit(Duration::from_millis(40))
    });
    let task = create_and_wait(&h, InitialRange::All).await;
    let total = expected_chunks(&task).len();
    assert!(total >= 4, "expected several chunks, got {total}");

    let err = h
        .service
        .run_formatting(&task.id, &ProviderOverrides::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, TaskError::Provider(ProviderError::Status { status: 429, .. })),
        "{err}"
    );

    // One call per sibling, one plus three retries for the limited chunk.
    assert_eq!(h.formatter.calls_for(1), 4);
    assert_eq!(h.formatter.calls.load(Ordering::SeqCst), total - 1 + 4);
    for index in (0..total).filter(|i| *i != 1) {
        assert_eq!(h.formatter.calls_for(index), 1, "chunk {index}");
    }
    assert_eq!(h.formatter.peak_after_throttle.load(Ordering::SeqCst), 1);

    let stored = h.service.get_task(&task.id).await.unwrap();
    assert!(!stored.formatting_in_progress);
    assert!(!stored.formatted_by_ai);
    assert_eq!(stored.formatting_total_chunks, total);
    assert_eq!(stored.formatting_completed_chunks, total - 1);
    assert!(stored.formatted_txt_path.is_none());
    assert!(!h.service.is_formatting(&task.id));
    assert_invariants(&stored);
}

#[tokio::test]
async fn test_hard_chunk_failure_cancels_siblings_and_keeps_progress() {
    let h = long_pages_harness(FormatMode::FailAt {
        index: 1,
        after: Duration::from_millis(100),
    });
    let task = create_and_wait(&h, InitialRange::All).await;
    let total = expected_chunks(&task).len();
    assert!(total >= 4, "expected several chunks, got {total}");

    let err = h
        .service
        .run_formatting(&task.id, &ProviderOverrides::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, TaskError::Provider(ProviderError::Status { status: 400, .. })),
        "{err}"
    );
    let calls = h.formatter.calls.load(Ordering::SeqCst);
    assert_eq!(calls, total);
    assert_eq!(h.formatter.calls_for(1), 1);

    // Chunk 0 was still running when chunk 1 failed; nothing runs afterwards.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.formatter.calls.load(Ordering::SeqCst), calls);
    assert_eq!(h.formatter.in_flight.load(Ordering::SeqCst), 0);

    let stored = h.service.get_task(&task.id).await.unwrap();
    assert!(!stored.formatting_in_progress);
    assert!(!stored.formatted_by_ai);
    assert_eq!(stored.formatting_total_chunks, total);
    assert_eq!(stored.formatting_completed_chunks, total - 2);
    assert!(!h.root.join(&task.id).join(CHUNKS_DIR).exists());
    assert!(!h.service.is_formatting(&task.id));
    assert_invariants(&stored);
}

#[tokio::test]
async fn test_truncated_chunk_is_retried() {
    let h = harness_with(
        2,
        FakeTranslator::default(),
        FakeFormatter::new(FormatMode::TruncateOnce),
        |b| b,
    );
    let task = create_and_wait(&h, InitialRange::All).await;
    let (task, _) = h
        .service
        .run_formatting(&task.id, &ProviderOverrides::default())
        .await
        .unwrap();
    assert!(task.formatted_by_ai);
    assert_eq!(h.formatter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_second_formatting_run_is_rejected_while_active() {
    let gate = Arc::new(Notify::new());
    let h = harness_with(
        1,
        FakeTranslator::default(),
        FakeFormatter::new(FormatMode::Gate(gate.clone())),
        |b| b,
    );
    let task = create_and_wait(&h, InitialRange::All).await;

    let service = h.service.clone();
    let id = task.id.clone();
    let first = tokio::spawn(async move {
        service
            .run_formatting(&id, &ProviderOverrides::default())
            .await
    });
    while h.formatter.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let stored = h.service.get_task(&task.id).await.unwrap();
    assert!(stored.formatting_in_progress);
    let err = h
        .service
        .run_formatting(&task.id, &ProviderOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::FormattingBusy { .. }));

    gate.notify_one();
    let (task, _) = first.await.unwrap().unwrap();
    assert!(task.formatted_by_ai);
    assert!(!h.service.is_formatting(&task.id));
}

#[tokio::test]
async fn test_formatting_deadline_cancels_the_run() {
    let h = harness_with(
        1,
        FakeTranslator::default(),
        FakeFormatter::new(FormatMode::Slow(Duration::from_secs(30))),
        |b| b.formatting_deadline(Some(Duration::from_millis(50))),
    );
    let task = create_and_wait(&h, InitialRange::All).await;

    let err = h
        .service
        .run_formatting(&task.id, &ProviderOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::FormattingTimeout { .. }), "{err}");
    let stored = h.service.get_task(&task.id).await.unwrap();
    assert!(!stored.formatting_in_progress);
    assert!(!stored.formatted_by_ai);
}

#[tokio::test]
async fn test_formatting_without_translations_is_rejected() {
    let translator = FakeTranslator::default();
    translator.fail(1);
    translator.fail(2);
    let h = harness_with(2, translator, FakeFormatter::new(FormatMode::Echo), |b| b);
    let task = create_and_wait(&h, InitialRange::All).await;

    let err = h
        .service
        .run_formatting(&task.id, &ProviderOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::NoUsableText(_)), "{err}");
    assert_eq!(h.formatter.calls.load(Ordering::SeqCst), 0);
    assert!(!h.service.is_formatting(&task.id));
    let stored = h.service.get_task(&task.id).await.unwrap();
    assert!(!stored.formatting_in_progress);
}

// ── Exports ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_merge_text_and_document() {
    let h = harness(3);
    let task = create_and_wait(&h, InitialRange::First(2)).await;

    let (task, url) = h.service.merge_text(&task.id).await.unwrap();
    assert_eq!(url, format!("/pdf-data/{}/combined.txt", task.id));
    let text = std::fs::read_to_string(task.combined_txt_path.as_ref().unwrap()).unwrap();
    assert_eq!(text, "Page 1\ntranslated 1\n\nPage 2\ntranslated 2\n\n");

    let (task, url) = h.service.merge_document(&task.id).await.unwrap();
    assert_eq!(url, format!("/pdf-data/{}/combined.pdf", task.id));
    let pdf = std::fs::read(task.combined_pdf_path.as_ref().unwrap()).unwrap();
    assert!(pdf.starts_with(b"%PDF"));
    let doc = lopdf::Document::load_mem(&pdf).unwrap();
    // Two text pages plus the skipped page's image.
    assert_eq!(doc.get_pages().len(), 3);
    let txt_url = format!("/pdf-data/{}/combined.txt", task.id);
    assert_eq!(task.combined_txt_url.as_deref(), Some(txt_url.as_str()));
}

#[tokio::test]
async fn test_merge_text_without_translations_fails() {
    let translator = FakeTranslator::default();
    translator.fail(1);
    let h = harness_with(1, translator, FakeFormatter::new(FormatMode::Echo), |b| b);
    let task = create_and_wait(&h, InitialRange::All).await;
    let err = h.service.merge_text(&task.id).await.unwrap_err();
    assert!(matches!(err, TaskError::NoUsableText(_)));
    assert!(!h.root.join(&task.id).join("combined.txt").exists());
}

// ── Store behaviour ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_delete_unknown_and_existing_task() {
    let h = harness(1);
    let err = h.service.delete_task("missing").await.unwrap_err();
    assert!(err.is_not_found());

    let task = create_and_wait(&h, InitialRange::All).await;
    h.service.delete_task(&task.id).await.unwrap();
    assert!(!h.root.join(&task.id).exists());
    assert!(h.service.get_task(&task.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_during_translation_leaves_no_directory() {
    let translator = FakeTranslator {
        delay: Duration::from_millis(100),
        ..Default::default()
    };
    let h = harness_with(3, translator, FakeFormatter::new(FormatMode::Echo), |b| b);
    let created = h
        .service
        .create_task(
            b"%PDF-1.4 fake",
            "scan.pdf",
            &ProviderOverrides::default(),
            TranslationSettings::default(),
        )
        .await
        .unwrap();
    let id = created.task.id.clone();
    let handle = created.translation.expect("pages selected");

    // Let the workers reach the translator before the folder disappears.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.translator.total_calls() > 0);
    h.service.delete_task(&id).await.unwrap();

    let report = handle.await.unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(report.failed, 3);
    assert!(!h.root.join(&id).exists());
    assert!(h.service.list_tasks().await.unwrap().is_empty());
    assert!(h.service.get_task(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_save_of_loaded_task_is_byte_identical_modulo_timestamp() {
    let h = harness(3);
    let task = create_and_wait(&h, InitialRange::First(2)).await;
    let meta = h.root.join(&task.id).join(META_FILE);
    let before = std::fs::read(&meta).unwrap();

    let mut loaded = h.service.store().load(&task.id).await.unwrap();
    let original_stamp = loaded.updated_at;
    h.service.store().save(&mut loaded).await.unwrap();

    let mut reloaded = h.service.store().load(&task.id).await.unwrap();
    assert!(reloaded.updated_at >= original_stamp);
    reloaded.updated_at = original_stamp;
    assert_eq!(serde_json::to_vec_pretty(&reloaded).unwrap(), before);
}

#[tokio::test]
async fn test_list_tasks_newest_first() {
    let h = harness(1);
    let first = create_and_wait(&h, InitialRange::All).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = create_and_wait(&h, InitialRange::All).await;

    let ids: Vec<String> = h
        .service
        .list_tasks()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec![second.id, first.id]);
}

#[tokio::test]
async fn test_recover_interrupted_resets_stale_state() {
    let h = harness(2);
    let task = create_and_wait(&h, InitialRange::All).await;
    h.service
        .store()
        .update(&task.id, |t| {
            t.formatting_in_progress = true;
            t.formatting_total_chunks = 4;
            t.formatting_completed_chunks = 1;
            if let Some(p) = t.page_mut(2) {
                p.status = PageStatus::Pending;
            }
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(h.service.recover_interrupted().await.unwrap(), 1);
    let stored = h.service.get_task(&task.id).await.unwrap();
    assert!(!stored.formatting_in_progress);
    assert_eq!(stored.formatting_completed_chunks, 1);
    let page = stored.page(2).unwrap();
    assert_eq!(page.status, PageStatus::Error);
    assert_eq!(page.error.as_deref(), Some("translation interrupted"));
    assert_eq!(page.translation, "translated 2");
    assert_invariants(&stored);

    assert_eq!(h.service.recover_interrupted().await.unwrap(), 0);
}

#[tokio::test]
async fn test_task_view_uses_front_end_keys() {
    let h = harness(1);
    let task = create_and_wait(&h, InitialRange::All).await;
    let json = serde_json::to_value(task.view()).unwrap();
    assert!(json.get("formattedByAI").is_some());
    assert!(json.get("totalPages").is_some());
    assert!(json["pages"][0].get("imageUrl").is_some());
    assert!(json["pages"][0].get("imagePath").is_none());
}
