use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::{page_for_fraction, NavTarget, RendererAdapter};
use crate::engine::{AnnotationStyle, ReflowableEngine, Relocation, TextSelection, ThemeParams};
use crate::error::{Boundary, NavFailure};
use crate::events::{EventBus, ReaderEvent};
use crate::model::{DocumentFormat, Highlight, Location};

/// Per-page step used by the fallback estimate when the page count is
/// unknown.
pub const DEFAULT_PAGE_FRACTION: f64 = 0.005;

#[derive(Debug, Clone, Default)]
struct LastKnown {
    address: Option<String>,
    fraction: f64,
    page: Option<u32>,
}

pub struct ReflowableAdapter {
    engine: Arc<dyn ReflowableEngine>,
    total_pages: Option<u32>,
    engine_timeout: Duration,
    last: Arc<Mutex<LastKnown>>,
    mounted: AtomicBool,
}

impl ReflowableAdapter {
    /// Subscribes to the engine and returns the mounted adapter. The engine
    /// should already hold the document.
    pub fn mount(
        engine: Arc<dyn ReflowableEngine>,
        bus: EventBus,
        total_pages: Option<u32>,
        engine_timeout: Duration,
    ) -> Arc<Self> {
        let adapter = Arc::new(Self {
            engine: Arc::clone(&engine),
            total_pages: total_pages.filter(|total| *total > 0),
            engine_timeout,
            last: Arc::new(Mutex::new(LastKnown::default())),
            mounted: AtomicBool::new(true),
        });

        let weak: Weak<dyn ReflowableEngine> = Arc::downgrade(&engine);
        let last = Arc::clone(&adapter.last);
        let relocation_bus = bus.clone();
        let total = adapter.total_pages;
        engine.on_relocated(Box::new(move |relocation: Relocation| {
            let Some(engine) = weak.upgrade() else {
                return;
            };
            let fraction = engine
                .fraction_from_address(&relocation.address)
                .unwrap_or_else(|| last.lock().fraction);
            let location = locate(Some(relocation.address), fraction, relocation.page, total);
            remember(&last, &location);
            relocation_bus.publish(ReaderEvent::Relocated(location));
        }));

        let selection_bus = bus;
        engine.on_selection(Box::new(move |selection: TextSelection| {
            selection_bus.publish(ReaderEvent::Selected(selection));
        }));

        info!(total_pages = ?adapter.total_pages, "reflowable adapter mounted");
        adapter
    }

    fn ensure_mounted(&self) -> Result<(), NavFailure> {
        if self.mounted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NavFailure::Engine("renderer is not mounted".to_owned()))
        }
    }

    fn page_fraction(&self) -> f64 {
        self.total_pages
            .map(|total| 1.0 / f64::from(total))
            .unwrap_or(DEFAULT_PAGE_FRACTION)
    }

    /// Re-reads the engine's address after a successful call.
    fn settle(&self, address: Option<String>) -> Location {
        let fraction = address
            .as_deref()
            .and_then(|address| self.engine.fraction_from_address(address))
            .unwrap_or_else(|| self.last.lock().fraction);
        let location = locate(address, fraction, None, self.total_pages);
        remember(&self.last, &location);
        location
    }

    async fn raced<F>(&self, call: F) -> Result<(), NavFailure>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        match timeout(self.engine_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(NavFailure::Engine(err.to_string())),
            Err(_) => Err(NavFailure::Stalled),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn step(&self, forward: bool) -> Result<Location, NavFailure> {
        self.ensure_mounted()?;
        let edge = if forward { Boundary::End } else { Boundary::Beginning };
        let before = self.engine.current_address();
        let call = async {
            if forward {
                self.engine.next().await
            } else {
                self.engine.prev().await
            }
        };

        match self.raced(call).await {
            Ok(()) => {
                let after = self.engine.current_address();
                if after.is_some() && after == before {
                    return Err(NavFailure::Boundary(edge));
                }
                Ok(self.settle(after))
            }
            Err(failure) => {
                warn!(%failure, forward, "engine turn failed, estimating from fraction");
                self.estimate(forward, edge).await
            }
        }
    }

    /// Steps the last known fraction by one estimated page and displays the
    /// resulting address directly.
    async fn estimate(&self, forward: bool, edge: Boundary) -> Result<Location, NavFailure> {
        let current = self.last.lock().fraction;
        let step = self.page_fraction();
        let target = if forward { current + step } else { current - step }.clamp(0.0, 1.0);
        if (target - current).abs() < f64::EPSILON {
            return Err(NavFailure::Boundary(edge));
        }
        let Some(address) = self.engine.address_from_fraction(target) else {
            return Err(NavFailure::Boundary(edge));
        };
        match self.raced(self.engine.display(Some(&address))).await {
            Ok(()) => {
                debug!(from = current, to = target, "fallback estimate displayed");
                let location = locate(Some(address), target, None, self.total_pages);
                remember(&self.last, &location);
                Ok(location)
            }
            Err(failure) => {
                warn!(%failure, "fallback display failed");
                Err(NavFailure::Boundary(edge))
            }
        }
    }

    fn fraction_for_page(&self, page: u32) -> f64 {
        let index = f64::from(page.max(1) - 1);
        match self.total_pages {
            Some(total) => index / f64::from(total),
            None => index * DEFAULT_PAGE_FRACTION,
        }
        .clamp(0.0, 1.0)
    }

    pub fn engine(&self) -> &Arc<dyn ReflowableEngine> {
        &self.engine
    }
}

fn locate(address: Option<String>, fraction: f64, page: Option<u32>, total: Option<u32>) -> Location {
    let fraction = fraction.clamp(0.0, 1.0);
    let total = total.unwrap_or((1.0 / DEFAULT_PAGE_FRACTION).round() as u32);
    Location {
        page: page.unwrap_or_else(|| page_for_fraction(fraction, total)),
        address,
        fraction,
    }
}

fn remember(last: &Mutex<LastKnown>, location: &Location) {
    let mut last = last.lock();
    last.address = location.address.clone();
    last.fraction = location.fraction;
    last.page = Some(location.page);
}

#[async_trait]
impl RendererAdapter for ReflowableAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Reflowable
    }

    async fn next(&self) -> Result<Location, NavFailure> {
        self.step(true).await
    }

    async fn prev(&self) -> Result<Location, NavFailure> {
        self.step(false).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn go_to(&self, target: NavTarget) -> Result<Location, NavFailure> {
        self.ensure_mounted()?;
        let address = match target {
            NavTarget::Address(address) => address,
            NavTarget::Fraction(fraction) => self
                .engine
                .address_from_fraction(fraction.clamp(0.0, 1.0))
                .ok_or_else(|| NavFailure::Engine(format!("no address for {fraction}")))?,
            NavTarget::Page(page) => {
                let fraction = self.fraction_for_page(page);
                self.engine
                    .address_from_fraction(fraction)
                    .ok_or_else(|| NavFailure::Engine(format!("no address for page {page}")))?
            }
        };
        self.raced(self.engine.display(Some(&address))).await?;
        Ok(self.settle(self.engine.current_address().or(Some(address))))
    }

    fn current_location(&self) -> Location {
        let last = self.last.lock().clone();
        locate(last.address, last.fraction, last.page, self.total_pages)
    }

    fn total_pages(&self) -> Option<u32> {
        self.total_pages
    }

    fn show_highlight(&self, highlight: &Highlight) -> anyhow::Result<()> {
        self.engine.add_annotation(
            &highlight.anchor,
            &AnnotationStyle {
                color: highlight.color,
            },
        )
    }

    fn hide_highlight(&self, highlight: &Highlight) -> anyhow::Result<()> {
        self.engine.remove_annotation(&highlight.anchor)
    }

    fn apply_theme(&self, theme: &ThemeParams) -> anyhow::Result<()> {
        self.engine.apply_theme(theme)
    }

    async fn teardown(&self) {
        if self.mounted.swap(false, Ordering::SeqCst) {
            self.engine.destroy();
            info!("reflowable adapter torn down");
        }
    }
}
