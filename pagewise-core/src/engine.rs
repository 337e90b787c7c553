//! Contracts for the external rendering engines the adapters wrap.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::geometry::{NormalizedRect, Rect, Size};
use crate::model::HighlightColor;
use crate::preferences::Theme;

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    /// RGBA8, row-major.
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    /// 1-based.
    pub page: u32,
    pub scale: f32,
    pub dark_mode: bool,
}

/// A selectable run of text on a rendered page.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub rect: NormalizedRect,
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page: u32,
    pub image: RenderImage,
    pub text_layer: Vec<TextSpan>,
}

/// Emitted by a reflowable engine whenever the displayed location changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    pub address: String,
    pub page: Option<u32>,
}

/// A raw selection reported by a reflowable engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSelection {
    pub range_address: String,
    pub text: String,
    /// On-screen bounding box of the selection.
    pub bounds: Rect,
}

pub type RelocationListener = Box<dyn Fn(Relocation) + Send + Sync>;
pub type SelectionListener = Box<dyn Fn(TextSelection) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnotationStyle {
    pub color: HighlightColor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThemeParams {
    pub theme: Theme,
    pub font_scale: f32,
}

/// A continuous, address-based rendering engine.
#[async_trait]
pub trait ReflowableEngine: Send + Sync {
    /// Shows `address`, or the start of the document when `None`.
    async fn display(&self, address: Option<&str>) -> Result<()>;
    async fn next(&self) -> Result<()>;
    async fn prev(&self) -> Result<()>;
    fn current_address(&self) -> Option<String>;
    /// Document fraction in `[0, 1]` for an address.
    fn fraction_from_address(&self, address: &str) -> Option<f64>;
    fn address_from_fraction(&self, fraction: f64) -> Option<String>;
    fn on_relocated(&self, listener: RelocationListener);
    fn on_selection(&self, listener: SelectionListener);
    fn add_annotation(&self, address: &str, style: &AnnotationStyle) -> Result<()>;
    fn remove_annotation(&self, address: &str) -> Result<()>;
    fn apply_theme(&self, _theme: &ThemeParams) -> Result<()> {
        Ok(())
    }
    /// Plain text of the current view, for text-mode front-ends.
    fn visible_text(&self) -> Option<String> {
        None
    }
    /// Drops listeners and native resources.
    fn destroy(&self);
}

/// A page-based rendering engine.
#[async_trait]
pub trait FixedLayoutEngine: Send + Sync {
    fn page_count(&self) -> u32;
    /// Natural size of a page in engine units.
    fn page_size(&self, page: u32) -> Option<Size>;
    async fn render_page(&self, request: RenderRequest) -> Result<RenderedPage>;
    fn close(&self);
}

/// Opens engines over a document buffer.
#[async_trait]
pub trait EngineProvider: Send + Sync {
    async fn open_reflowable(&self, content: Bytes) -> Result<Arc<dyn ReflowableEngine>>;
    async fn open_fixed_layout(&self, content: Bytes) -> Result<Arc<dyn FixedLayoutEngine>>;
}
