//! Scriptable engines and services shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::engine::{
    AnnotationStyle, EngineProvider, FixedLayoutEngine, ReflowableEngine, Relocation,
    RelocationListener, RenderImage, RenderRequest, RenderedPage, SelectionListener,
    TextSelection, TextSpan,
};
use crate::geometry::{NormalizedRect, Rect, Size};
use crate::model::{
    Bookmark, DocumentId, Highlight, NewBookmark, NewHighlight, NewNote, Note, ProgressUpdate,
    SessionOpening, SessionState,
};
use crate::service::{MemoryProgressService, ProgressService};

pub const PDF_BYTES: &[u8] = b"%PDF-1.7\n%test\n";
pub const EPUB_BYTES: &[u8] = b"PK\x03\x04\x14\x00mimetypeapplication/epub+zip";

/// Reflowable engine whose addresses are `frac:<fraction>`.
pub struct FakeReflowableEngine {
    step: f64,
    fraction: Mutex<f64>,
    stall_turns: AtomicBool,
    fail_turns: AtomicBool,
    stall_display: AtomicBool,
    displayed: Mutex<Vec<String>>,
    annotations: Mutex<Vec<String>>,
    relocated: Mutex<Vec<RelocationListener>>,
    selected: Mutex<Vec<SelectionListener>>,
    destroyed: AtomicUsize,
}

impl FakeReflowableEngine {
    pub fn new(step: f64) -> Self {
        Self {
            step,
            fraction: Mutex::new(0.0),
            stall_turns: AtomicBool::new(false),
            fail_turns: AtomicBool::new(false),
            stall_display: AtomicBool::new(false),
            displayed: Mutex::new(Vec::new()),
            annotations: Mutex::new(Vec::new()),
            relocated: Mutex::new(Vec::new()),
            selected: Mutex::new(Vec::new()),
            destroyed: AtomicUsize::new(0),
        }
    }

    pub fn address(fraction: f64) -> String {
        format!("frac:{fraction:.6}")
    }

    pub fn stall_turns(&self, stall: bool) {
        self.stall_turns.store(stall, Ordering::SeqCst);
    }

    pub fn fail_turns(&self, fail: bool) {
        self.fail_turns.store(fail, Ordering::SeqCst);
    }

    pub fn stall_display(&self, stall: bool) {
        self.stall_display.store(stall, Ordering::SeqCst);
    }

    pub fn displayed(&self) -> Vec<String> {
        self.displayed.lock().clone()
    }

    pub fn annotations(&self) -> Vec<String> {
        self.annotations.lock().clone()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn select(&self, text: &str, bounds: Rect) {
        let fraction = *self.fraction.lock();
        let selection = TextSelection {
            range_address: format!("{}-{}", Self::address(fraction), Self::address(fraction + 0.001)),
            text: text.to_owned(),
            bounds,
        };
        for listener in self.selected.lock().iter() {
            listener(selection.clone());
        }
    }

    /// Moves without a command, as a reflow would.
    pub fn drift_to(&self, fraction: f64) {
        self.move_to(fraction);
    }

    fn move_to(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        *self.fraction.lock() = fraction;
        let relocation = Relocation {
            address: Self::address(fraction),
            page: None,
        };
        for listener in self.relocated.lock().iter() {
            listener(relocation.clone());
        }
    }

    async fn turn(&self, delta: f64) -> Result<()> {
        if self.stall_turns.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_turns.load(Ordering::SeqCst) {
            return Err(anyhow!("malformed package"));
        }
        let current = *self.fraction.lock();
        self.move_to(current + delta);
        Ok(())
    }
}

#[async_trait]
impl ReflowableEngine for FakeReflowableEngine {
    async fn display(&self, address: Option<&str>) -> Result<()> {
        if self.stall_display.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let fraction = match address {
            Some(address) => self
                .fraction_from_address(address)
                .ok_or_else(|| anyhow!("bad address {address}"))?,
            None => 0.0,
        };
        self.displayed.lock().push(Self::address(fraction));
        self.move_to(fraction);
        Ok(())
    }

    async fn next(&self) -> Result<()> {
        self.turn(self.step).await
    }

    async fn prev(&self) -> Result<()> {
        self.turn(-self.step).await
    }

    fn current_address(&self) -> Option<String> {
        Some(Self::address(*self.fraction.lock()))
    }

    fn fraction_from_address(&self, address: &str) -> Option<f64> {
        let start = address.split('-').next()?;
        start.strip_prefix("frac:")?.parse().ok()
    }

    fn address_from_fraction(&self, fraction: f64) -> Option<String> {
        Some(Self::address(fraction.clamp(0.0, 1.0)))
    }

    fn on_relocated(&self, listener: RelocationListener) {
        self.relocated.lock().push(listener);
    }

    fn on_selection(&self, listener: SelectionListener) {
        self.selected.lock().push(listener);
    }

    fn add_annotation(&self, address: &str, _style: &AnnotationStyle) -> Result<()> {
        self.annotations.lock().push(address.to_owned());
        Ok(())
    }

    fn remove_annotation(&self, address: &str) -> Result<()> {
        self.annotations.lock().retain(|a| a != address);
        Ok(())
    }

    fn destroy(&self) {
        self.relocated.lock().clear();
        self.selected.lock().clear();
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fixed-layout engine with 600x800 pages rendered as 60x80 images.
pub struct FakeFixedEngine {
    pages: u32,
    delays: Mutex<HashMap<u32, Duration>>,
    blank: Mutex<HashSet<u32>>,
    completed: Mutex<Vec<u32>>,
    requests: Mutex<Vec<RenderRequest>>,
    closed: AtomicBool,
}

impl FakeFixedEngine {
    pub const IMAGE_WIDTH: u32 = 60;
    pub const IMAGE_HEIGHT: u32 = 80;

    pub fn new(pages: u32) -> Self {
        Self {
            pages,
            delays: Mutex::new(HashMap::new()),
            blank: Mutex::new(HashSet::new()),
            completed: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_delay(&self, page: u32, delay: Duration) {
        self.delays.lock().insert(page, delay);
    }

    pub fn set_blank(&self, page: u32) {
        self.blank.lock().insert(page);
    }

    pub fn completed(&self) -> Vec<u32> {
        self.completed.lock().clone()
    }

    pub fn requests(&self) -> Vec<RenderRequest> {
        self.requests.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn image(&self, page: u32) -> RenderImage {
        let (width, height) = (Self::IMAGE_WIDTH, Self::IMAGE_HEIGHT);
        let mut pixels = vec![255u8; (width * height * 4) as usize];
        if !self.blank.lock().contains(&page) {
            for y in 10..40 {
                for x in 10..50 {
                    let offset = ((y * width + x) * 4) as usize;
                    pixels[offset..offset + 3].copy_from_slice(&[20, 20, 20]);
                }
            }
        }
        RenderImage {
            width,
            height,
            pixels,
        }
    }
}

#[async_trait]
impl FixedLayoutEngine for FakeFixedEngine {
    fn page_count(&self) -> u32 {
        self.pages
    }

    fn page_size(&self, page: u32) -> Option<Size> {
        (1..=self.pages)
            .contains(&page)
            .then(|| Size::new(600.0, 800.0))
    }

    async fn render_page(&self, request: RenderRequest) -> Result<RenderedPage> {
        self.requests.lock().push(request);
        let delay = self.delays.lock().get(&request.page).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !(1..=self.pages).contains(&request.page) {
            return Err(anyhow!("page {} out of range", request.page));
        }
        self.completed.lock().push(request.page);
        Ok(RenderedPage {
            page: request.page,
            image: self.image(request.page),
            text_layer: vec![TextSpan {
                text: format!("page {}", request.page),
                rect: NormalizedRect {
                    x: 0.1,
                    y: 0.1,
                    w: 0.8,
                    h: 0.05,
                },
            }],
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeEngineProvider {
    pub reflowable: Arc<FakeReflowableEngine>,
    pub fixed: Arc<FakeFixedEngine>,
    pub fail_reflowable: AtomicBool,
    pub opened: Mutex<Vec<&'static str>>,
}

impl FakeEngineProvider {
    pub fn new(step: f64, pages: u32) -> Self {
        Self {
            reflowable: Arc::new(FakeReflowableEngine::new(step)),
            fixed: Arc::new(FakeFixedEngine::new(pages)),
            fail_reflowable: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EngineProvider for FakeEngineProvider {
    async fn open_reflowable(&self, _content: Bytes) -> Result<Arc<dyn ReflowableEngine>> {
        if self.fail_reflowable.load(Ordering::SeqCst) {
            return Err(anyhow!("not a reflowable package"));
        }
        self.opened.lock().push("reflowable");
        Ok(self.reflowable.clone())
    }

    async fn open_fixed_layout(&self, _content: Bytes) -> Result<Arc<dyn FixedLayoutEngine>> {
        self.opened.lock().push("fixed-layout");
        Ok(self.fixed.clone())
    }
}

/// [`MemoryProgressService`] with injectable latency and failures.
pub struct ScriptedService {
    inner: MemoryProgressService,
    latency: Mutex<Duration>,
    update_failures: AtomicU32,
    create_failures: AtomicU32,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl ScriptedService {
    pub fn document() -> DocumentId {
        DocumentId::new("doc-test")
    }

    pub fn new() -> Self {
        Self::with_document(Bytes::from_static(PDF_BYTES), None, None)
    }

    pub fn with_document(content: Bytes, format: Option<&str>, total_pages: Option<u32>) -> Self {
        let inner = MemoryProgressService::new();
        inner.insert_document(Self::document(), content, format, total_pages);
        Self {
            inner,
            latency: Mutex::new(Duration::ZERO),
            update_failures: AtomicU32::new(0),
            create_failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &MemoryProgressService {
        &self.inner
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// The next `n` progress updates fail.
    pub fn fail_updates(&self, n: u32) {
        self.update_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` annotation creates fail.
    pub fn fail_creates(&self, n: u32) {
        self.create_failures.store(n, Ordering::SeqCst);
    }

    /// `update_progress` calls received, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn received_updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_create(&self) -> Result<()> {
        if Self::take_failure(&self.create_failures) {
            return Err(anyhow!("service unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressService for ScriptedService {
    async fn open_session(&self, document: &DocumentId) -> Result<SessionOpening> {
        self.inner.open_session(document).await
    }

    async fn fetch_document(&self, document: &DocumentId) -> Result<Bytes> {
        self.inner.fetch_document(document).await
    }

    async fn get_session_state(&self, document: &DocumentId) -> Result<SessionState> {
        self.inner.get_session_state(document).await
    }

    async fn update_progress(&self, document: &DocumentId, update: &ProgressUpdate) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if Self::take_failure(&self.update_failures) {
            return Err(anyhow!("network unreachable"));
        }
        self.updates.lock().push(update.clone());
        self.inner.update_progress(document, update).await
    }

    async fn create_bookmark(
        &self,
        document: &DocumentId,
        bookmark: &NewBookmark,
    ) -> Result<Bookmark> {
        self.check_create()?;
        self.inner.create_bookmark(document, bookmark).await
    }

    async fn delete_bookmark(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.inner.delete_bookmark(document, id).await
    }

    async fn create_note(&self, document: &DocumentId, note: &NewNote) -> Result<Note> {
        self.check_create()?;
        self.inner.create_note(document, note).await
    }

    async fn delete_note(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.inner.delete_note(document, id).await
    }

    async fn create_highlight(
        &self,
        document: &DocumentId,
        highlight: &NewHighlight,
    ) -> Result<Highlight> {
        self.check_create()?;
        self.inner.create_highlight(document, highlight).await
    }

    async fn delete_highlight(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.inner.delete_highlight(document, id).await
    }
}
