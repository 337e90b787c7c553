use std::convert::TryFrom;
use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use pagewise_core::{
    FixedLayoutEngine, NormalizedRect, RenderImage, RenderRequest, RenderedPage, Size, TextSpan,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

/// Environment variable naming an explicit Pdfium library to load.
pub const PDFIUM_PATH_ENV: &str = "PAGEWISE_PDFIUM_PATH";

/// Fixed-layout engine over an in-memory PDF.
pub struct PdfiumEngine {
    inner: Arc<PdfiumDocument>,
}

struct PdfiumDocument {
    // Declared before `pdfium`: fields drop in declaration order, so the
    // document is released while its bindings are still alive.
    document: Mutex<Option<PdfDocument<'static>>>,
    cache: Mutex<RenderCache>,
    sizes: Vec<Size>,
    _pdfium: Arc<Pdfium>,
}

impl PdfiumEngine {
    pub fn open(pdfium: Arc<Pdfium>, bytes: Vec<u8>) -> Result<Self> {
        let document = pdfium
            .load_pdf_from_byte_vec(bytes, None)
            .context("failed to open PDF document")?;
        // SAFETY: the document borrows the bindings owned by `pdfium`, which
        // is stored next to it in `PdfiumDocument` and outlives it there.
        let document =
            unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let sizes: Vec<Size> = document
            .pages()
            .iter()
            .map(|page| Size::new(f64::from(page.width().value), f64::from(page.height().value)))
            .collect();
        debug!(pages = sizes.len(), "pdf opened");

        Ok(Self {
            inner: Arc::new(PdfiumDocument {
                document: Mutex::new(Some(document)),
                cache: Mutex::new(RenderCache::default()),
                sizes,
                _pdfium: pdfium,
            }),
        })
    }
}

impl PdfiumDocument {
    fn render(&self, request: &RenderRequest) -> Result<RenderedPage> {
        let guard = self.document.lock();
        let document = guard.as_ref().ok_or_else(|| anyhow!("document is closed"))?;
        let page_index = PdfPageIndex::try_from(request.page.saturating_sub(1))
            .map_err(|_| anyhow!("page {} is out of supported range", request.page))?;
        let page = document
            .pages()
            .get(page_index)
            .with_context(|| format!("page {} out of range", request.page))?;

        let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", request.page))?;
        let mut pixels = bitmap.as_image().to_rgba8().into_raw();
        if request.dark_mode {
            invert_pixels(&mut pixels);
        }

        let page_width = page.width().value;
        let page_height = page.height().value;
        let text_layer = match page.text() {
            Ok(text) => text
                .segments()
                .iter()
                .filter_map(|segment| {
                    let bounds = segment.bounds();
                    let rect = normalize_bounds(
                        [
                            bounds.left().value,
                            bounds.top().value,
                            bounds.right().value,
                            bounds.bottom().value,
                        ],
                        page_width,
                        page_height,
                    )?;
                    Some(TextSpan {
                        text: segment.text(),
                        rect,
                    })
                })
                .collect(),
            Err(err) => {
                warn!(?err, page = request.page, "failed to extract text layer");
                Vec::new()
            }
        };

        Ok(RenderedPage {
            page: request.page,
            image: RenderImage {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            },
            text_layer,
        })
    }

    fn render_cached(&self, request: RenderRequest) -> Result<RenderedPage> {
        if let Some(page) = self.cache.lock().get(&request) {
            return Ok(page.as_ref().clone());
        }
        let page = self.render(&request)?;
        self.cache.lock().insert(request, Arc::new(page.clone()));
        Ok(page)
    }
}

/// Holds the last renders of up to [`RenderCache::CAPACITY`] distinct pages,
/// so both halves of a spread stay cached across redraws.
#[derive(Default)]
struct RenderCache {
    // Least recently used first.
    entries: Vec<(RenderRequest, Arc<RenderedPage>)>,
}

impl RenderCache {
    const CAPACITY: usize = 2;

    fn get(&mut self, request: &RenderRequest) -> Option<Arc<RenderedPage>> {
        let idx = self.entries.iter().position(|(key, _)| key == request)?;
        let entry = self.entries.remove(idx);
        let page = Arc::clone(&entry.1);
        self.entries.push(entry);
        Some(page)
    }

    /// Replaces any render of the same page, evicting the least recently
    /// used page when full.
    fn insert(&mut self, request: RenderRequest, page: Arc<RenderedPage>) {
        self.entries.retain(|(key, _)| key.page != request.page);
        if self.entries.len() >= Self::CAPACITY {
            self.entries.remove(0);
        }
        self.entries.push((request, page));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[async_trait]
impl FixedLayoutEngine for PdfiumEngine {
    fn page_count(&self) -> u32 {
        u32::try_from(self.inner.sizes.len()).unwrap_or(u32::MAX)
    }

    fn page_size(&self, page: u32) -> Option<Size> {
        let index = usize::try_from(page.checked_sub(1)?).ok()?;
        self.inner.sizes.get(index).copied()
    }

    #[instrument(skip(self), level = "debug")]
    async fn render_page(&self, request: RenderRequest) -> Result<RenderedPage> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.render_cached(request))
            .await
            .context("render task failed")?
    }

    fn close(&self) {
        self.inner.cache.lock().clear();
        if self.inner.document.lock().take().is_some() {
            debug!("pdf document closed");
        }
    }
}

/// PDF user-space bounds (origin bottom-left) as page fractions with the
/// origin top-left.
pub(crate) fn normalize_bounds(
    [left, top, right, bottom]: [f32; 4],
    page_width: f32,
    page_height: f32,
) -> Option<NormalizedRect> {
    if page_width <= 0.0 || page_height <= 0.0 {
        return None;
    }
    let x = f64::from(left / page_width);
    let y = f64::from(1.0 - top / page_height);
    let rect = NormalizedRect {
        x,
        y,
        w: f64::from((right - left) / page_width),
        h: f64::from((top - bottom) / page_height),
    }
    .clamp();
    rect.is_valid().then_some(rect)
}

pub(crate) fn invert_pixels(pixels: &mut [u8]) {
    for chunk in pixels.chunks_exact_mut(4) {
        chunk[0] = 255 - chunk[0];
        chunk[1] = 255 - chunk[1];
        chunk[2] = 255 - chunk[2];
    }
}

/// Binds Pdfium from [`PDFIUM_PATH_ENV`], the working directory or the
/// system library path, in that order.
pub fn bind_pdfium() -> Result<Pdfium> {
    let mut errors = Vec::new();

    if let Ok(path) = std::env::var(PDFIUM_PATH_ENV) {
        if !path.is_empty() {
            match Pdfium::bind_to_library(&path) {
                Ok(bindings) => return Ok(Pdfium::new(bindings)),
                Err(err) => errors.push(format!("{path}: {err}")),
            }
        }
    }

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {PDFIUM_PATH_ENV} or install it ({})",
                errors.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_flip_to_top_left_origin() {
        let rect = normalize_bounds([60.0, 700.0, 300.0, 680.0], 600.0, 800.0).unwrap();
        assert!((rect.x - 0.1).abs() < 1e-6);
        assert!((rect.y - 0.125).abs() < 1e-6);
        assert!((rect.w - 0.4).abs() < 1e-6);
        assert!((rect.h - 0.025).abs() < 1e-6);
    }

    #[test]
    fn degenerate_bounds_are_dropped() {
        assert!(normalize_bounds([10.0, 10.0, 10.0, 0.0], 600.0, 800.0).is_none());
        assert!(normalize_bounds([0.0, 10.0, 10.0, 0.0], 0.0, 800.0).is_none());
    }

    fn rendered(page: u32) -> Arc<RenderedPage> {
        Arc::new(RenderedPage {
            page,
            image: RenderImage {
                width: 1,
                height: 1,
                pixels: vec![0, 0, 0, 255],
            },
            text_layer: Vec::new(),
        })
    }

    fn request(page: u32, scale: f32) -> RenderRequest {
        RenderRequest {
            page,
            scale,
            dark_mode: false,
        }
    }

    #[test]
    fn spread_pages_do_not_evict_each_other() {
        let mut cache = RenderCache::default();
        cache.insert(request(3, 1.0), rendered(3));
        cache.insert(request(4, 1.0), rendered(4));

        for _ in 0..3 {
            assert_eq!(cache.get(&request(3, 1.0)).unwrap().page, 3);
            assert_eq!(cache.get(&request(4, 1.0)).unwrap().page, 4);
        }
        assert!(cache.get(&request(4, 2.0)).is_none());
    }

    #[test]
    fn least_recently_used_page_is_evicted() {
        let mut cache = RenderCache::default();
        cache.insert(request(1, 1.0), rendered(1));
        cache.insert(request(2, 1.0), rendered(2));
        cache.get(&request(1, 1.0));
        cache.insert(request(3, 1.0), rendered(3));

        assert!(cache.get(&request(2, 1.0)).is_none());
        assert!(cache.get(&request(1, 1.0)).is_some());

        cache.insert(request(1, 1.5), rendered(1));
        assert!(cache.get(&request(1, 1.0)).is_none());
        assert!(cache.get(&request(3, 1.0)).is_some());
        cache.clear();
        assert!(cache.get(&request(3, 1.0)).is_none());
    }

    #[test]
    fn dark_mode_inverts_colour_but_not_alpha() {
        let mut pixels = vec![10, 20, 30, 255, 255, 255, 255, 128];
        invert_pixels(&mut pixels);
        assert_eq!(pixels, vec![245, 235, 225, 255, 0, 0, 0, 128]);
    }
}
