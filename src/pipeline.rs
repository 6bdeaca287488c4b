use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clipboard::ClipboardSource;
use crate::errors::{CutError, Result};
use crate::image_bridge::{ImageProcessor, ProcessedImage};
use crate::notifier::UiNotifier;
use crate::storage::HistoryStore;
use crate::storage::models::{HistoryItem, ImageItem, TextItem};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Items persisted by a single tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub text: Option<TextItem>,
    pub image: Option<ImageItem>,
}

struct Timer {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type Capture = JoinHandle<Result<Option<ProcessedImage>>>;

/// Clipboard ingestion: a fixed-period timer driving the text lane and the
/// image lane against one store.
///
/// Each pipeline owns its dedup cache and timer, so several can coexist.
pub struct Pipeline {
    store: Arc<dyn HistoryStore>,
    clipboard: Arc<dyn ClipboardSource>,
    images: Arc<dyn ImageProcessor>,
    notifier: UiNotifier,
    last_text: Mutex<Option<String>>,
    timer: Mutex<Option<Timer>>,
    capture: AsyncMutex<Option<Capture>>,
    interval: Duration,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        clipboard: Arc<dyn ClipboardSource>,
        images: Arc<dyn ImageProcessor>,
    ) -> Self {
        Self {
            store,
            clipboard,
            images,
            notifier: UiNotifier::new(),
            last_text: Mutex::new(None),
            timer: Mutex::new(None),
            capture: AsyncMutex::new(None),
            interval: POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn notifier(&self) -> &UiNotifier {
        &self.notifier
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|timer| !timer.task.is_finished())
    }

    /// Starts the timer. Returns `false` and leaves the existing timer alone
    /// when already running. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.as_ref().is_some_and(|t| !t.task.is_finished()) {
            debug!("clipboard poller already running");
            return false;
        }

        let (stop, mut stopped) = watch::channel(false);
        let pipeline = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pipeline.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        pipeline.tick().await;
                    }
                }
            }
            debug!("clipboard poller loop exited");
        });

        *timer = Some(Timer { stop, task });
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "clipboard poller started"
        );
        true
    }

    /// Signals the timer to stop and returns without waiting. A tick already
    /// in progress still completes and may write to the store.
    pub fn stop(&self) -> bool {
        let Some(timer) = self.take_timer() else {
            return false;
        };
        let _ = timer.stop.send(true);
        info!("clipboard poller stopped");
        true
    }

    /// Stops the timer and waits for the tick in progress, if any.
    pub async fn shutdown(&self) {
        let Some(timer) = self.take_timer() else {
            return;
        };
        let _ = timer.stop.send(true);
        if let Err(e) = timer.task.await {
            warn!("clipboard poller ended abnormally: {}", e);
        }
        info!("clipboard poller shut down");
    }

    fn take_timer(&self) -> Option<Timer> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// One poll: the text lane runs to completion before the image lane
    /// starts. Failures in either lane are logged and end that lane only.
    pub async fn tick(&self) -> TickOutcome {
        let text = self.ingest_text().await;
        let image = self.ingest_image().await;
        TickOutcome { text, image }
    }

    async fn ingest_text(&self) -> Option<TextItem> {
        let clipboard = Arc::clone(&self.clipboard);
        let text = match blocking(move || clipboard.read_text()).await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => return None,
            Err(e) => {
                debug!("no clipboard text: {}", e);
                return None;
            }
        };

        {
            let mut last = self.last_text.lock().unwrap_or_else(PoisonError::into_inner);
            if last.as_deref() == Some(text.as_str()) {
                return None;
            }
            // Advance even on failure so a broken store is not retried every tick.
            *last = Some(text.clone());
        }

        let store = Arc::clone(&self.store);
        match blocking(move || store.add_text_item(&text)).await {
            Ok(item) => {
                self.notifier.notify(&HistoryItem::Text(item.clone()));
                Some(item)
            }
            Err(e) => {
                warn!("failed to store clipboard text: {}", e);
                None
            }
        }
    }

    /// At most one capture is in flight. A capture that outlives one poll
    /// period is left running and its result is collected by a later tick.
    async fn ingest_image(&self) -> Option<ImageItem> {
        let Ok(mut slot) = self.capture.try_lock() else {
            debug!("image lane busy in another tick");
            return None;
        };
        if slot.as_ref().is_some_and(|capture| !capture.is_finished()) {
            debug!("previous image capture still running, skipping");
            return None;
        }
        let capture = slot.get_or_insert_with(|| {
            let images = Arc::clone(&self.images);
            tokio::task::spawn_blocking(move || images.capture_and_process())
        });

        let joined = match tokio::time::timeout(self.interval, capture).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!("image capture is slow, collecting it on a later tick");
                return None;
            }
        };
        *slot = None;
        drop(slot);

        let captured = match joined {
            Ok(Ok(Some(image))) => image,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                debug!("image capture failed: {}", e);
                return None;
            }
            Err(e) => {
                warn!("image capture task failed: {}", e);
                return None;
            }
        };

        let store = Arc::clone(&self.store);
        match blocking(move || store.add_image_item(captured.into())).await {
            Ok(item) => {
                self.notifier.notify(&HistoryItem::Image(item.clone()));
                Some(item)
            }
            Err(e) => {
                warn!("failed to store clipboard image: {}", e);
                None
            }
        }
    }
}

/// Runs clipboard and SQLite calls on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CutError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigProvider, ConfigSource, RetentionConfig};
    use crate::storage::models::{HistoryCounts, NewImageItem};
    use crate::storage::sqlite::SqliteStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeClipboard {
        current: Mutex<Option<String>>,
        reads: AtomicUsize,
    }

    impl FakeClipboard {
        fn set(&self, text: Option<&str>) {
            *self.current.lock().unwrap() = text.map(String::from);
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl ClipboardSource for FakeClipboard {
        fn read_text(&self) -> Result<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.current
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| CutError::Clipboard("no text".into()))
        }

        fn write_text(&self, text: &str) -> Result<()> {
            self.set(Some(text));
            Ok(())
        }

        fn write_image(&self, _content: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedImages {
        script: Mutex<VecDeque<Result<Option<ProcessedImage>>>>,
    }

    impl ScriptedImages {
        fn push(&self, step: Result<Option<ProcessedImage>>) {
            self.script.lock().unwrap().push_back(step);
        }
    }

    impl ImageProcessor for ScriptedImages {
        fn capture_and_process(&self) -> Result<Option<ProcessedImage>> {
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    /// Store whose inserts always fail.
    #[derive(Default)]
    struct BrokenStore {
        attempts: AtomicUsize,
    }

    impl HistoryStore for BrokenStore {
        fn add_text_item(&self, _content: &str) -> Result<TextItem> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(CutError::Storage(rusqlite::Error::InvalidQuery))
        }
        fn add_image_item(&self, _image: NewImageItem) -> Result<ImageItem> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(CutError::Storage(rusqlite::Error::InvalidQuery))
        }
        fn list_text_items(&self) -> Result<Vec<TextItem>> {
            Ok(Vec::new())
        }
        fn list_image_items(&self) -> Result<Vec<ImageItem>> {
            Ok(Vec::new())
        }
        fn get_text_item(&self, id: &str) -> Result<TextItem> {
            Err(CutError::NotFound(id.to_string()))
        }
        fn get_image_item(&self, id: &str) -> Result<ImageItem> {
            Err(CutError::NotFound(id.to_string()))
        }
        fn remove_text_item(&self, _id: &str) -> bool {
            false
        }
        fn remove_image_item(&self, _id: &str) -> bool {
            false
        }
        fn counts(&self) -> Result<HistoryCounts> {
            Ok(HistoryCounts::default())
        }
    }

    struct Harness {
        pipeline: Arc<Pipeline>,
        clipboard: Arc<FakeClipboard>,
        images: Arc<ScriptedImages>,
        store: Arc<SqliteStore>,
    }

    fn harness_with(config: Arc<ConfigProvider>) -> Harness {
        let clipboard = Arc::new(FakeClipboard::default());
        let images = Arc::new(ScriptedImages::default());
        let store = Arc::new(SqliteStore::in_memory(config));
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            clipboard.clone(),
            images.clone(),
        ));
        Harness {
            pipeline,
            clipboard,
            images,
            store,
        }
    }

    fn harness(max_text: u32, max_image: u32) -> Harness {
        harness_with(Arc::new(ConfigProvider::with_config(RetentionConfig::new(
            max_text, max_image,
        ))))
    }

    fn processed(width: u32, height: u32) -> ProcessedImage {
        ProcessedImage {
            base64_data: format!("data:image/png;base64,{}x{}", width, height),
            width,
            height,
            original_size: u64::from(width * height * 4),
        }
    }

    // --- Text lane ---

    #[tokio::test]
    async fn test_unchanged_text_for_ten_ticks_inserts_once() {
        let h = harness(500, 30);
        h.clipboard.set(Some("hello"));
        for _ in 0..10 {
            h.pipeline.tick().await;
        }
        assert_eq!(h.clipboard.reads(), 10);
        assert_eq!(h.store.counts().unwrap().text_items, 1);
    }

    #[tokio::test]
    async fn test_dedup_is_against_last_seen_only() {
        let h = harness(500, 30);
        for text in ["a", "b", "a"] {
            h.clipboard.set(Some(text));
            let outcome = h.pipeline.tick().await;
            assert_eq!(outcome.text.unwrap().content, text);
        }
        assert_eq!(h.store.counts().unwrap().text_items, 3);
    }

    #[tokio::test]
    async fn test_read_failure_is_silent_and_next_tick_recovers() {
        let h = harness(500, 30);
        h.clipboard.set(None);
        assert_eq!(h.pipeline.tick().await, TickOutcome::default());
        h.clipboard.set(Some("late"));
        assert!(h.pipeline.tick().await.text.is_some());
    }

    #[tokio::test]
    async fn test_empty_text_is_ignored() {
        let h = harness(500, 30);
        h.clipboard.set(Some(""));
        assert!(h.pipeline.tick().await.text.is_none());
        assert_eq!(h.store.counts().unwrap().text_items, 0);
    }

    #[tokio::test]
    async fn test_distinct_captures_keep_most_recent() {
        let h = harness(4, 30);
        for i in 0..9 {
            h.clipboard.set(Some(&format!("copy {}", i)));
            h.pipeline.tick().await;
        }
        let contents: Vec<_> = h
            .store
            .list_text_items()
            .unwrap()
            .into_iter()
            .map(|i| i.content)
            .collect();
        assert_eq!(contents, vec!["copy 8", "copy 7", "copy 6", "copy 5"]);
    }

    #[tokio::test]
    async fn test_store_failure_still_advances_dedup_cache() {
        let clipboard = Arc::new(FakeClipboard::default());
        let store = Arc::new(BrokenStore::default());
        let pipeline = Pipeline::new(
            store.clone(),
            clipboard.clone(),
            Arc::new(ScriptedImages::default()),
        );
        let notified = Arc::new(AtomicUsize::new(0));
        let sink = notified.clone();
        pipeline.notifier().attach(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        clipboard.set(Some("doomed"));
        for _ in 0..3 {
            assert!(pipeline.tick().await.text.is_none());
        }
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    // --- Image lane ---

    #[tokio::test]
    async fn test_five_empty_captures_then_payload() {
        let h = harness(500, 30);
        for _ in 0..5 {
            h.images.push(Ok(None));
        }
        h.images.push(Ok(Some(processed(320, 200))));

        for _ in 0..6 {
            h.pipeline.tick().await;
        }
        let images = h.store.list_image_items().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!((images[0].width, images[0].height), (320, 200));
        assert_eq!(images[0].size, 320 * 200 * 4);
    }

    #[tokio::test]
    async fn test_bridge_error_skips_tick() {
        let h = harness(500, 30);
        h.images.push(Err(CutError::Image("decoder crashed".into())));
        h.images.push(Ok(Some(processed(10, 10))));
        assert!(h.pipeline.tick().await.image.is_none());
        assert!(h.pipeline.tick().await.image.is_some());
    }

    #[tokio::test]
    async fn test_invalid_payload_is_not_stored() {
        let h = harness(500, 30);
        h.images.push(Ok(Some(processed(0, 10))));
        assert!(h.pipeline.tick().await.image.is_none());
        assert_eq!(h.store.counts().unwrap().image_items, 0);
    }

    #[tokio::test]
    async fn test_failed_config_fetch_uses_default_image_limit() {
        struct Unreachable;
        impl ConfigSource for Unreachable {
            fn fetch(&self) -> Result<RetentionConfig> {
                Err(CutError::Config("no host".into()))
            }
        }

        let config = Arc::new(ConfigProvider::new());
        config.load(&Unreachable);
        let h = harness_with(config);
        for i in 0..31 {
            h.images.push(Ok(Some(processed(i + 1, 1))));
            h.pipeline.tick().await;
        }
        let images = h.store.list_image_items().unwrap();
        assert_eq!(images.len(), 30);
        assert!(images.iter().all(|img| img.width != 1));
    }

    /// Capture that blocks until the test releases it.
    struct StalledImages {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        calls: AtomicUsize,
    }

    impl StalledImages {
        fn new() -> (Arc<Self>, std::sync::mpsc::Sender<()>) {
            let (release, gate) = std::sync::mpsc::channel();
            let images = Arc::new(Self {
                gate: Mutex::new(gate),
                calls: AtomicUsize::new(0),
            });
            (images, release)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ImageProcessor for StalledImages {
        fn capture_and_process(&self) -> Result<Option<ProcessedImage>> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            // Released by a message or by the sender being dropped.
            let _ = self.gate.lock().unwrap().recv();
            Ok(first.then(|| processed(8, 8)))
        }
    }

    fn stalled_pipeline(
        interval: Duration,
    ) -> (
        Arc<Pipeline>,
        Arc<FakeClipboard>,
        Arc<StalledImages>,
        Arc<SqliteStore>,
        std::sync::mpsc::Sender<()>,
    ) {
        let clipboard = Arc::new(FakeClipboard::default());
        let (images, release) = StalledImages::new();
        let store = Arc::new(SqliteStore::in_memory(Arc::new(ConfigProvider::new())));
        let pipeline = Arc::new(
            Pipeline::new(store.clone(), clipboard.clone(), images.clone())
                .with_interval(interval),
        );
        (pipeline, clipboard, images, store, release)
    }

    #[tokio::test]
    async fn test_stalled_capture_does_not_block_text_lane() {
        let (pipeline, clipboard, images, store, release) =
            stalled_pipeline(Duration::from_millis(20));

        clipboard.set(Some("first"));
        let outcome = pipeline.tick().await;
        assert_eq!(outcome.text.unwrap().content, "first");
        assert!(outcome.image.is_none());

        clipboard.set(Some("second"));
        let outcome = pipeline.tick().await;
        assert_eq!(outcome.text.unwrap().content, "second");
        assert!(outcome.image.is_none());
        assert_eq!(images.calls(), 1, "no second capture while one is in flight");

        release.send(()).unwrap();
        let mut collected = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(image) = pipeline.tick().await.image {
                collected = Some(image);
                break;
            }
        }
        let image = collected.expect("late capture is collected by a later tick");
        assert_eq!((image.width, image.height), (8, 8));
        assert_eq!(store.counts().unwrap().image_items, 1);
        drop(release);
    }

    #[tokio::test]
    async fn test_timer_keeps_reading_text_while_capture_hangs() {
        let (pipeline, clipboard, _images, store, release) =
            stalled_pipeline(Duration::from_millis(50));

        clipboard.set(Some("first"));
        assert!(pipeline.start());
        tokio::time::sleep(Duration::from_millis(300)).await;
        clipboard.set(Some("second"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        pipeline.shutdown().await;

        assert!(clipboard.reads() >= 4);
        let contents: Vec<_> = store
            .list_text_items()
            .unwrap()
            .into_iter()
            .map(|i| i.content)
            .collect();
        assert_eq!(contents, vec!["second", "first"]);
        drop(release);
    }

    // --- Config ---

    #[tokio::test]
    async fn test_pushed_limit_applies_from_next_insert() {
        let config = Arc::new(ConfigProvider::with_config(RetentionConfig::new(5, 30)));
        let (updates, pushed) = tokio::sync::mpsc::unbounded_channel();
        let _subscription = config.subscribe(pushed);
        let h = harness_with(config.clone());

        for i in 0..5 {
            h.clipboard.set(Some(&format!("copy {}", i)));
            h.pipeline.tick().await;
        }

        updates.send(RetentionConfig::new(2, 30)).unwrap();
        for _ in 0..100 {
            if config.current().max_text_history == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(config.current().max_text_history, 2);
        // Lowering the limit does not trim by itself.
        assert_eq!(h.store.counts().unwrap().text_items, 5);

        h.clipboard.set(Some("after reload"));
        h.pipeline.tick().await;
        let contents: Vec<_> = h
            .store
            .list_text_items()
            .unwrap()
            .into_iter()
            .map(|i| i.content)
            .collect();
        assert_eq!(contents, vec!["after reload", "copy 4"]);
    }

    // --- Notifier ---

    #[tokio::test]
    async fn test_notifier_sees_text_before_image() {
        let h = harness(500, 30);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.pipeline.notifier().attach(move |item| {
            let kind = match item {
                HistoryItem::Text(_) => "text",
                HistoryItem::Image(_) => "image",
            };
            sink.lock().unwrap().push(kind);
        });

        h.clipboard.set(Some("caption"));
        h.images.push(Ok(Some(processed(4, 4))));
        let outcome = h.pipeline.tick().await;

        assert!(outcome.text.is_some() && outcome.image.is_some());
        assert_eq!(*seen.lock().unwrap(), vec!["text", "image"]);
    }

    // --- Timer ---

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_halts_ticks() {
        let h = harness(500, 30);
        h.clipboard.set(Some("steady"));

        assert!(h.pipeline.start());
        assert!(!h.pipeline.start());
        assert!(h.pipeline.is_running());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(h.clipboard.reads() >= 2);

        h.pipeline.shutdown().await;
        assert!(!h.pipeline.is_running());
        let reads = h.clipboard.reads();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.clipboard.reads(), reads);
        assert_eq!(h.store.counts().unwrap().text_items, 1);
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let h = harness(500, 30);
        assert!(!h.pipeline.stop());
        h.pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let h = harness(500, 30);
        assert!(h.pipeline.start());
        assert!(h.pipeline.stop());
        tokio::task::yield_now().await;
        assert!(h.pipeline.start());
        h.pipeline.shutdown().await;
    }
}
