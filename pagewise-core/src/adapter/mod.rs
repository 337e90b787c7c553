//! One navigation contract over the two rendering engines.
//!
//! The session mounts exactly one adapter at a time. Engine callbacks are
//! translated into [`ReaderEvent`](crate::events::ReaderEvent)s on the
//! session's bus, so nothing above this layer depends on engine-specific
//! listener signatures.

mod fixed;
mod reflowable;

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::ThemeParams;
use crate::error::NavFailure;
use crate::model::{DocumentFormat, Highlight, Location};

pub use fixed::{FixedLayoutAdapter, FixedLayoutOptions, Overlay};
pub use reflowable::{ReflowableAdapter, DEFAULT_PAGE_FRACTION};

#[derive(Debug, Clone, PartialEq)]
pub enum NavTarget {
    Page(u32),
    Address(String),
    /// Document fraction in `[0, 1]`.
    Fraction(f64),
}

#[async_trait]
pub trait RendererAdapter: Send + Sync {
    fn format(&self) -> DocumentFormat;

    async fn next(&self) -> Result<Location, NavFailure>;
    async fn prev(&self) -> Result<Location, NavFailure>;
    async fn go_to(&self, target: NavTarget) -> Result<Location, NavFailure>;

    /// Last confirmed location.
    fn current_location(&self) -> Location;
    fn total_pages(&self) -> Option<u32>;

    fn show_highlight(&self, highlight: &Highlight) -> anyhow::Result<()>;
    fn hide_highlight(&self, highlight: &Highlight) -> anyhow::Result<()>;
    fn apply_theme(&self, theme: &ThemeParams) -> anyhow::Result<()>;

    /// The custom renderer gave up and the raw asset should be shown
    /// through a generic viewer instead.
    fn is_degraded(&self) -> bool {
        false
    }

    /// Drops engine subscriptions and native handles.
    async fn teardown(&self);
}

#[derive(Clone)]
pub enum MountedAdapter {
    Reflowable(Arc<ReflowableAdapter>),
    FixedLayout(Arc<FixedLayoutAdapter>),
}

impl MountedAdapter {
    pub fn as_dyn(&self) -> &dyn RendererAdapter {
        match self {
            MountedAdapter::Reflowable(adapter) => adapter.as_ref(),
            MountedAdapter::FixedLayout(adapter) => adapter.as_ref(),
        }
    }

    pub fn format(&self) -> DocumentFormat {
        self.as_dyn().format()
    }

    pub fn reflowable(&self) -> Option<&Arc<ReflowableAdapter>> {
        match self {
            MountedAdapter::Reflowable(adapter) => Some(adapter),
            MountedAdapter::FixedLayout(_) => None,
        }
    }

    pub fn fixed_layout(&self) -> Option<&Arc<FixedLayoutAdapter>> {
        match self {
            MountedAdapter::FixedLayout(adapter) => Some(adapter),
            MountedAdapter::Reflowable(_) => None,
        }
    }
}

/// Page estimate for a document fraction: page `p` starts at
/// `(p - 1) / total`. Clamped to `[1, total]`.
pub(crate) fn page_for_fraction(fraction: f64, total: u32) -> u32 {
    let total = total.max(1);
    let index = (fraction.clamp(0.0, 1.0) * f64::from(total) + 1e-9).floor() as u32;
    (index + 1).clamp(1, total)
}
