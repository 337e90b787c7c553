//! Concrete engines behind the reading session: EPUB packages for
//! reflowable content and Pdfium for fixed-layout content.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pagewise_core::{EngineProvider, FixedLayoutEngine, ReflowableEngine};
use parking_lot::Mutex;
use tracing::instrument;

pub mod epub;
mod package;
#[cfg(feature = "pdf")]
pub mod pdf;

pub use epub::EpubEngine;
#[cfg(feature = "pdf")]
pub use pdf::PdfiumEngine;

/// Opens engines on demand. Pdfium is bound on first use and shared by
/// every document opened afterwards.
#[derive(Default)]
pub struct RenderEngines {
    last_reflowable: Mutex<Option<Arc<EpubEngine>>>,
    #[cfg(feature = "pdf")]
    pdfium: Mutex<Option<Arc<pdfium_render::prelude::Pdfium>>>,
}

impl RenderEngines {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently opened reflowable engine, for front-ends that need
    /// more than the session's view of it.
    pub fn reflowable(&self) -> Option<Arc<EpubEngine>> {
        self.last_reflowable.lock().clone()
    }

    #[cfg(feature = "pdf")]
    fn pdfium(&self) -> Result<Arc<pdfium_render::prelude::Pdfium>> {
        let mut slot = self.pdfium.lock();
        if let Some(pdfium) = slot.as_ref() {
            return Ok(Arc::clone(pdfium));
        }
        let pdfium = Arc::new(pdf::bind_pdfium()?);
        *slot = Some(Arc::clone(&pdfium));
        Ok(pdfium)
    }
}

#[async_trait]
impl EngineProvider for RenderEngines {
    #[instrument(skip_all, fields(bytes = content.len()))]
    async fn open_reflowable(&self, content: Bytes) -> Result<Arc<dyn ReflowableEngine>> {
        let engine = tokio::task::spawn_blocking(move || EpubEngine::open(&content))
            .await
            .context("epub parse task failed")??;
        let engine = Arc::new(engine);
        *self.last_reflowable.lock() = Some(Arc::clone(&engine));
        Ok(engine)
    }

    #[cfg(feature = "pdf")]
    #[instrument(skip_all, fields(bytes = content.len()))]
    async fn open_fixed_layout(&self, content: Bytes) -> Result<Arc<dyn FixedLayoutEngine>> {
        let pdfium = self.pdfium()?;
        let engine = tokio::task::spawn_blocking(move || PdfiumEngine::open(pdfium, content.to_vec()))
            .await
            .context("pdf open task failed")??;
        Ok(Arc::new(engine))
    }

    #[cfg(not(feature = "pdf"))]
    async fn open_fixed_layout(&self, _content: Bytes) -> Result<Arc<dyn FixedLayoutEngine>> {
        Err(anyhow::anyhow!(
            "fixed-layout documents need the `pdf` feature"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::fixtures;

    #[tokio::test]
    async fn reflowable_engines_are_remembered() {
        let engines = RenderEngines::new();
        let bytes = Bytes::from(fixtures::epub(&["<p>Hello there.</p>"]));

        let engine = engines.open_reflowable(bytes).await.unwrap();
        engine.display(None).await.unwrap();
        assert_eq!(engine.visible_text().as_deref(), Some("Hello there."));
        assert!(engines.reflowable().is_some());
    }

    #[tokio::test]
    async fn broken_package_is_an_error() {
        let engines = RenderEngines::new();
        let result = engines
            .open_reflowable(Bytes::from_static(b"PK\x03\x04 truncated"))
            .await;
        assert!(result.is_err());
        assert!(engines.reflowable().is_none());
    }
}
