use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::{NavTarget, RendererAdapter};
use crate::annotation::{FixedAnchor, PageLayer};
use crate::engine::{FixedLayoutEngine, RenderImage, RenderRequest, RenderedPage, ThemeParams};
use crate::error::{Boundary, NavFailure};
use crate::events::{EventBus, FallbackReason, ReaderEvent};
use crate::geometry::{NormalizedRect, Rect, Size};
use crate::model::{DocumentFormat, Highlight, HighlightColor, Location, RecordId};
use crate::preferences::{Theme, ViewMode};

const MIN_SCALE: f32 = 0.1;
const MAX_SCALE: f32 = 8.0;
/// Per-channel distance under which a sample counts as background.
const BLANK_CHANNEL_TOLERANCE: i16 = 8;
const BLANK_SAMPLE_STRIDE: usize = 7;

#[derive(Debug, Clone)]
pub struct FixedLayoutOptions {
    pub render_timeout: Duration,
    pub blank_ratio: f64,
    pub viewport: Size,
    pub zoom: f32,
    pub view_mode: ViewMode,
    pub dark_mode: bool,
}

/// A persisted highlight painted over its page.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub page: u32,
    pub rects: Vec<NormalizedRect>,
    pub color: HighlightColor,
}

struct ViewState {
    page: u32,
    view_mode: ViewMode,
    zoom: f32,
    viewport: Size,
    dark_mode: bool,
    rendered: Vec<Arc<RenderedPage>>,
    layers: Vec<PageLayer>,
}

pub struct FixedLayoutAdapter {
    engine: Arc<dyn FixedLayoutEngine>,
    bus: EventBus,
    render_timeout: Duration,
    blank_ratio: f64,
    view: Mutex<ViewState>,
    overlays: Mutex<HashMap<RecordId, Overlay>>,
    /// One slot per visible canvas; a new render aborts what is there.
    renders: Mutex<[Option<AbortHandle>; 2]>,
    generation: AtomicU64,
    degraded: AtomicBool,
    mounted: AtomicBool,
}

impl FixedLayoutAdapter {
    pub fn mount(
        engine: Arc<dyn FixedLayoutEngine>,
        bus: EventBus,
        options: FixedLayoutOptions,
    ) -> Arc<Self> {
        info!(pages = engine.page_count(), view_mode = ?options.view_mode, "fixed-layout adapter mounted");
        Arc::new(Self {
            engine,
            bus,
            render_timeout: options.render_timeout,
            blank_ratio: options.blank_ratio,
            view: Mutex::new(ViewState {
                page: 1,
                view_mode: options.view_mode,
                zoom: options.zoom,
                viewport: options.viewport,
                dark_mode: options.dark_mode,
                rendered: Vec::new(),
                layers: Vec::new(),
            }),
            overlays: Mutex::new(HashMap::new()),
            renders: Mutex::new([None, None]),
            generation: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            mounted: AtomicBool::new(true),
        })
    }

    pub fn page_count(&self) -> u32 {
        self.engine.page_count()
    }

    pub fn current_page(&self) -> u32 {
        self.view.lock().page
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view.lock().view_mode
    }

    pub fn set_view_mode(&self, mode: ViewMode) {
        self.view.lock().view_mode = mode;
    }

    pub fn set_zoom(&self, zoom: f32) {
        self.view.lock().zoom = zoom;
    }

    pub fn set_viewport(&self, viewport: Size) {
        self.view.lock().viewport = viewport;
    }

    pub fn set_dark_mode(&self, dark_mode: bool) {
        self.view.lock().dark_mode = dark_mode;
    }

    /// Pages in spread mode start on odd numbers.
    pub fn normalize_page(&self, page: u32) -> u32 {
        let count = self.page_count().max(1);
        let page = page.clamp(1, count);
        match self.view_mode() {
            ViewMode::Spread if page % 2 == 0 => page - 1,
            _ => page,
        }
    }

    fn visible_pages(&self, first: u32) -> Vec<u32> {
        let count = self.page_count();
        match self.view_mode() {
            ViewMode::Spread if first < count => vec![first, first + 1],
            _ => vec![first],
        }
    }

    /// Fit-to-width scale for `page`, never smaller than the fit even when
    /// the zoom multiplier is below one.
    pub fn scale_for(&self, page: u32) -> f32 {
        let view = self.view.lock();
        let columns = match view.view_mode {
            ViewMode::Single => 1.0,
            ViewMode::Spread => 2.0,
        };
        let natural = self.engine.page_size(page).unwrap_or_default();
        if view.viewport.is_empty() || natural.is_empty() {
            return view.zoom.max(1.0).clamp(MIN_SCALE, MAX_SCALE);
        }
        let fit = (view.viewport.width / columns / natural.width) as f32;
        fit.max(fit * view.zoom).clamp(MIN_SCALE, MAX_SCALE)
    }

    fn location_for(&self, page: u32) -> Location {
        let count = self.page_count();
        let fraction = if count > 1 {
            f64::from(page - 1) / f64::from(count - 1)
        } else {
            0.0
        };
        Location {
            page,
            address: None,
            fraction,
        }
    }

    fn abort_renders(&self) {
        let mut slots = self.renders.lock();
        for slot in slots.iter_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    /// Renders `page` (and its spread partner) and makes it current.
    #[instrument(skip(self), level = "debug")]
    pub async fn show(&self, page: u32) -> Result<Location, NavFailure> {
        if !self.mounted.load(Ordering::SeqCst) {
            return Err(NavFailure::Engine("renderer is not mounted".to_owned()));
        }
        let first = self.normalize_page(page);
        let pages = self.visible_pages(first);
        let dark_mode = self.view.lock().dark_mode;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut handles: Vec<JoinHandle<anyhow::Result<RenderedPage>>> = Vec::new();
        {
            let mut slots = self.renders.lock();
            for slot in slots.iter_mut() {
                if let Some(previous) = slot.take() {
                    previous.abort();
                }
            }
            for (slot, number) in slots.iter_mut().zip(pages.iter().copied()) {
                let engine = Arc::clone(&self.engine);
                let request = RenderRequest {
                    page: number,
                    scale: self.scale_for(number),
                    dark_mode,
                };
                let handle = tokio::spawn(async move { engine.render_page(request).await });
                *slot = Some(handle.abort_handle());
                handles.push(handle);
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        let joined = timeout(self.render_timeout, async {
            for handle in handles.iter_mut() {
                results.push(handle.await);
            }
        })
        .await;

        if joined.is_err() {
            for handle in &handles {
                handle.abort();
            }
            warn!(page = first, timeout = ?self.render_timeout, "render stalled, degrading");
            self.degraded.store(true, Ordering::SeqCst);
            self.bus
                .publish(ReaderEvent::Degraded(FallbackReason::RenderStalled(first)));
            self.view.lock().page = first;
            return Ok(self.location_for(first));
        }

        let mut rendered = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(Ok(page)) => rendered.push(Arc::new(page)),
                Ok(Err(err)) => return Err(NavFailure::Engine(format!("{err:#}"))),
                Err(err) if err.is_cancelled() => return Err(NavFailure::Superseded),
                Err(err) => return Err(NavFailure::Engine(err.to_string())),
            }
        }
        {
            let mut slots = self.renders.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!(page = first, "discarding superseded render");
                return Err(NavFailure::Superseded);
            }
            *slots = [None, None];
        }

        for page in &rendered {
            if is_blank(&page.image, self.blank_ratio) {
                warn!(page = page.page, "rendered page is blank, degrading");
                self.degraded.store(true, Ordering::SeqCst);
                self.bus
                    .publish(ReaderEvent::Degraded(FallbackReason::BlankPage(page.page)));
            }
        }

        {
            let mut view = self.view.lock();
            view.layers = lay_out(&rendered, view.viewport);
            view.rendered = rendered;
            view.page = first;
        }
        for number in pages {
            self.bus.publish(ReaderEvent::RenderComplete { page: number });
        }
        Ok(self.location_for(first))
    }

    /// Re-renders the current page, e.g. after a zoom or viewport change.
    pub async fn refresh(&self) -> Result<Location, NavFailure> {
        let page = self.current_page();
        self.show(page).await
    }

    pub fn rendered_pages(&self) -> Vec<Arc<RenderedPage>> {
        self.view.lock().rendered.clone()
    }

    /// On-screen bounds of every rendered page.
    pub fn page_layers(&self) -> Vec<PageLayer> {
        self.view.lock().layers.clone()
    }

    pub fn text_selection_rects(&self, page: u32) -> Vec<NormalizedRect> {
        self.view
            .lock()
            .rendered
            .iter()
            .filter(|rendered| rendered.page == page)
            .flat_map(|rendered| rendered.text_layer.iter().map(|span| span.rect))
            .collect()
    }

    pub fn overlays_on(&self, page: u32) -> Vec<Overlay> {
        let mut overlays: Vec<_> = self
            .overlays
            .lock()
            .values()
            .filter(|overlay| overlay.page == page)
            .cloned()
            .collect();
        overlays.sort_by_key(|overlay| overlay.color as u8);
        overlays
    }

    /// Overlay rectangles projected onto the current page layers.
    pub fn overlay_rects(&self, page: u32) -> Vec<(Rect, HighlightColor)> {
        let Some(layer) = self.page_layers().into_iter().find(|layer| layer.page == page) else {
            return Vec::new();
        };
        self.overlays_on(page)
            .into_iter()
            .flat_map(|overlay| {
                overlay
                    .rects
                    .into_iter()
                    .map(move |rect| (rect.project(&layer.bounds), overlay.color))
            })
            .collect()
    }
}

/// Places rendered pages side by side, centred horizontally.
fn lay_out(pages: &[Arc<RenderedPage>], viewport: Size) -> Vec<PageLayer> {
    let total_width: f64 = pages.iter().map(|page| f64::from(page.image.width)).sum();
    let mut x = ((viewport.width - total_width) / 2.0).max(0.0);
    pages
        .iter()
        .map(|page| {
            let bounds = Rect::new(
                x,
                0.0,
                f64::from(page.image.width),
                f64::from(page.image.height),
            );
            x += bounds.width;
            PageLayer {
                page: page.page,
                bounds,
            }
        })
        .collect()
}

/// True when at least `ratio` of sampled pixels match the top-left corner
/// colour or are fully transparent.
pub(crate) fn is_blank(image: &RenderImage, ratio: f64) -> bool {
    let pixels = &image.pixels;
    if pixels.len() < 4 {
        return true;
    }
    let reference = [pixels[0], pixels[1], pixels[2]];
    let mut sampled = 0usize;
    let mut background = 0usize;
    for pixel in pixels.chunks_exact(4).step_by(BLANK_SAMPLE_STRIDE) {
        sampled += 1;
        let transparent = pixel[3] == 0;
        let close = pixel[..3]
            .iter()
            .zip(reference)
            .all(|(a, b)| (i16::from(*a) - i16::from(b)).abs() <= BLANK_CHANNEL_TOLERANCE);
        if transparent || close {
            background += 1;
        }
    }
    background as f64 / sampled as f64 >= ratio
}

#[async_trait]
impl RendererAdapter for FixedLayoutAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::FixedLayout
    }

    async fn next(&self) -> Result<Location, NavFailure> {
        let (page, step) = {
            let view = self.view.lock();
            let step = if view.view_mode == ViewMode::Spread { 2 } else { 1 };
            (view.page, step)
        };
        let target = page + step;
        if target > self.page_count() {
            return Err(NavFailure::Boundary(Boundary::End));
        }
        self.show(target).await
    }

    async fn prev(&self) -> Result<Location, NavFailure> {
        let (page, step) = {
            let view = self.view.lock();
            let step = if view.view_mode == ViewMode::Spread { 2 } else { 1 };
            (view.page, step)
        };
        if page <= 1 {
            return Err(NavFailure::Boundary(Boundary::Beginning));
        }
        self.show(page.saturating_sub(step).max(1)).await
    }

    async fn go_to(&self, target: NavTarget) -> Result<Location, NavFailure> {
        let page = match target {
            NavTarget::Page(page) => page,
            NavTarget::Fraction(fraction) => {
                let count = self.page_count().max(1);
                (fraction.clamp(0.0, 1.0) * f64::from(count - 1)).round() as u32 + 1
            }
            NavTarget::Address(address) => {
                return Err(NavFailure::Engine(format!(
                    "fixed-layout documents have no location address ({address})"
                )))
            }
        };
        self.show(page).await
    }

    fn current_location(&self) -> Location {
        self.location_for(self.current_page())
    }

    fn total_pages(&self) -> Option<u32> {
        Some(self.page_count())
    }

    fn show_highlight(&self, highlight: &Highlight) -> anyhow::Result<()> {
        let anchor = FixedAnchor::decode(&highlight.anchor)?;
        self.overlays.lock().insert(
            highlight.id.clone(),
            Overlay {
                page: anchor.page,
                rects: anchor.rects,
                color: highlight.color,
            },
        );
        Ok(())
    }

    fn hide_highlight(&self, highlight: &Highlight) -> anyhow::Result<()> {
        self.overlays.lock().remove(&highlight.id);
        Ok(())
    }

    fn apply_theme(&self, theme: &ThemeParams) -> anyhow::Result<()> {
        self.set_dark_mode(theme.theme == Theme::Dark);
        Ok(())
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    async fn teardown(&self) {
        if self.mounted.swap(false, Ordering::SeqCst) {
            self.abort_renders();
            self.engine.close();
            info!("fixed-layout adapter torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFixedEngine;

    fn options(view_mode: ViewMode) -> FixedLayoutOptions {
        FixedLayoutOptions {
            render_timeout: Duration::from_millis(5_000),
            blank_ratio: 0.995,
            viewport: Size::new(1_200.0, 900.0),
            zoom: 1.0,
            view_mode,
            dark_mode: false,
        }
    }

    fn mount(engine: &Arc<FakeFixedEngine>, view_mode: ViewMode) -> (Arc<FixedLayoutAdapter>, EventBus) {
        let bus = EventBus::new();
        let adapter = FixedLayoutAdapter::mount(engine.clone(), bus.clone(), options(view_mode));
        (adapter, bus)
    }

    #[tokio::test]
    async fn spread_mode_normalizes_to_odd_pages() {
        let engine = Arc::new(FakeFixedEngine::new(9));
        let (adapter, bus) = mount(&engine, ViewMode::Spread);

        let location = adapter.go_to(NavTarget::Page(4)).await.unwrap();
        assert_eq!(location.page, 3);
        let mut shown: Vec<_> = adapter.rendered_pages().iter().map(|p| p.page).collect();
        shown.sort_unstable();
        assert_eq!(shown, vec![3, 4]);
        let completed: Vec<_> = bus
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                ReaderEvent::RenderComplete { page } => Some(page),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![3, 4]);

        assert_eq!(adapter.next().await.unwrap().page, 5);
        adapter.go_to(NavTarget::Page(9)).await.unwrap();
        assert_eq!(adapter.rendered_pages().len(), 1);
        assert_eq!(adapter.next().await, Err(NavFailure::Boundary(Boundary::End)));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_render_is_cancelled() {
        let engine = Arc::new(FakeFixedEngine::new(20));
        engine.set_delay(2, Duration::from_millis(1_000));
        engine.set_delay(3, Duration::from_millis(10));
        let (adapter, _bus) = mount(&engine, ViewMode::Single);

        let slow = adapter.show(2);
        let fast = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            adapter.show(3).await
        };
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow, Err(NavFailure::Superseded));
        assert_eq!(fast.unwrap().page, 3);
        assert_eq!(adapter.current_page(), 3);
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(engine.completed(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_show_keeps_newer_render_abortable() {
        let engine = Arc::new(FakeFixedEngine::new(20));
        engine.set_delay(2, Duration::from_millis(1_000));
        engine.set_delay(3, Duration::from_millis(1_000));
        engine.set_delay(4, Duration::from_millis(10));
        let (adapter, _bus) = mount(&engine, ViewMode::Single);

        let newer_adapter = Arc::clone(&adapter);
        let (oldest, newer) = tokio::join!(adapter.show(2), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let newer = tokio::spawn(async move { newer_adapter.show(3).await });
            tokio::time::sleep(Duration::from_millis(10)).await;
            newer
        });
        assert_eq!(oldest, Err(NavFailure::Superseded));
        assert_eq!(adapter.renders.lock().iter().flatten().count(), 1);

        assert_eq!(adapter.show(4).await.unwrap().page, 4);
        assert_eq!(newer.await.unwrap(), Err(NavFailure::Superseded));
        assert!(adapter.renders.lock().iter().all(Option::is_none));
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(engine.completed(), vec![4]);
    }

    #[tokio::test]
    async fn blank_page_sets_degraded_mode() {
        let engine = Arc::new(FakeFixedEngine::new(3));
        engine.set_blank(2);
        let (adapter, bus) = mount(&engine, ViewMode::Single);

        adapter.show(1).await.unwrap();
        assert!(!adapter.is_degraded());
        adapter.show(2).await.unwrap();
        assert!(adapter.is_degraded());
        assert!(bus
            .drain()
            .contains(&ReaderEvent::Degraded(FallbackReason::BlankPage(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_render_degrades_instead_of_failing() {
        let engine = Arc::new(FakeFixedEngine::new(3));
        engine.set_delay(2, Duration::from_secs(60));
        let (adapter, bus) = mount(&engine, ViewMode::Single);

        let location = adapter.show(2).await.unwrap();
        assert_eq!(location.page, 2);
        assert!(adapter.is_degraded());
        assert!(bus
            .drain()
            .contains(&ReaderEvent::Degraded(FallbackReason::RenderStalled(2))));
    }

    #[test]
    fn scale_never_drops_below_fit_width() {
        let engine = Arc::new(FakeFixedEngine::new(4));
        let bus = EventBus::new();
        let adapter = FixedLayoutAdapter::mount(engine, bus, options(ViewMode::Single));

        // Fake pages are 600 wide, the viewport 1200.
        assert_eq!(adapter.scale_for(1), 2.0);
        adapter.set_zoom(0.5);
        assert_eq!(adapter.scale_for(1), 2.0);
        adapter.set_zoom(1.5);
        assert_eq!(adapter.scale_for(1), 3.0);
        adapter.set_view_mode(ViewMode::Spread);
        assert_eq!(adapter.scale_for(1), 1.5);
    }

    #[tokio::test]
    async fn overlays_project_onto_page_layers() {
        let engine = Arc::new(FakeFixedEngine::new(2));
        let (adapter, _bus) = mount(&engine, ViewMode::Single);
        adapter.show(1).await.unwrap();

        let anchor = FixedAnchor {
            page: 1,
            rects: vec![NormalizedRect {
                x: 0.25,
                y: 0.5,
                w: 0.5,
                h: 0.1,
            }],
        };
        let highlight = Highlight {
            id: "hl-1".into(),
            page: 1,
            anchor: anchor.encode().unwrap(),
            text_snippet: "quoted".into(),
            color: HighlightColor::Green,
        };
        adapter.show_highlight(&highlight).unwrap();

        let layer = adapter.page_layers()[0];
        let rects = adapter.overlay_rects(1);
        assert_eq!(rects.len(), 1);
        assert_eq!(rects[0].1, HighlightColor::Green);
        assert!((rects[0].0.x - (layer.bounds.x + 0.25 * layer.bounds.width)).abs() < 1e-9);

        adapter.hide_highlight(&highlight).unwrap();
        assert!(adapter.overlay_rects(1).is_empty());
    }

    #[test]
    fn blank_detection_uses_corner_colour() {
        let mut image = RenderImage {
            width: 10,
            height: 10,
            pixels: vec![255; 400],
        };
        assert!(is_blank(&image, 0.995));
        for pixel in image.pixels.chunks_exact_mut(4).take(30) {
            pixel[..3].copy_from_slice(&[0, 0, 0]);
        }
        image.pixels[..4].copy_from_slice(&[255, 255, 255, 255]);
        assert!(!is_blank(&image, 0.995));
    }
}
