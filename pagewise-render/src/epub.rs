use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pagewise_core::{
    AnnotationStyle, Rect, ReflowableEngine, Relocation, RelocationListener, SelectionListener,
    TextSelection, ThemeParams,
};
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::package::Package;

/// Characters per view at font scale 1.
pub const BASE_PAGE_CHARS: usize = 1_800;

/// Reflowable engine over an EPUB package. Addresses have the form
/// `loc:<chapter>:<char offset>`; a range is two addresses joined by `-`.
pub struct EpubEngine {
    title: Option<String>,
    chapters: Vec<Vec<char>>,
    /// Global char offset where each chapter starts, plus the total.
    starts: Vec<usize>,
    view: Mutex<View>,
    annotations: Mutex<Vec<(String, AnnotationStyle)>>,
    relocated: Mutex<Vec<RelocationListener>>,
    selected: Mutex<Vec<SelectionListener>>,
    destroyed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct View {
    chapter: usize,
    offset: usize,
    page_chars: usize,
}

impl EpubEngine {
    pub fn open(bytes: &[u8]) -> Result<Self> {
        let package = Package::parse(bytes)?;
        let chapters: Vec<Vec<char>> = package
            .chapters
            .iter()
            .map(|chapter| chapter.text.chars().collect())
            .collect();
        let mut starts = Vec::with_capacity(chapters.len() + 1);
        let mut total = 0;
        for chapter in &chapters {
            starts.push(total);
            total += chapter.len();
        }
        starts.push(total);
        debug!(chapters = chapters.len(), chars = total, "epub opened");

        Ok(Self {
            title: package.title,
            chapters,
            starts,
            view: Mutex::new(View {
                chapter: 0,
                offset: 0,
                page_chars: BASE_PAGE_CHARS,
            }),
            annotations: Mutex::new(Vec::new()),
            relocated: Mutex::new(Vec::new()),
            selected: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    fn total_chars(&self) -> usize {
        self.starts.last().copied().unwrap_or(0)
    }

    pub fn annotations(&self) -> Vec<String> {
        self.annotations
            .lock()
            .iter()
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Selects the first `len` chars of the current view, as a pointer
    /// selection would, and notifies selection listeners.
    pub fn select_visible(&self, len: usize, bounds: Rect) {
        let view = *self.view.lock();
        let chapter = &self.chapters[view.chapter];
        let end = (view.offset + len.min(view.page_chars)).min(chapter.len());
        if end <= view.offset {
            return;
        }
        let selection = TextSelection {
            range_address: format!(
                "{}-{}",
                address(view.chapter, view.offset),
                address(view.chapter, end)
            ),
            text: chapter[view.offset..end].iter().collect(),
            bounds,
        };
        for listener in self.selected.lock().iter() {
            listener(selection.clone());
        }
    }

    fn parse_address(&self, raw: &str) -> Option<(usize, usize)> {
        let start = raw.split('-').next()?;
        let mut parts = start.strip_prefix("loc:")?.split(':');
        let chapter: usize = parts.next()?.parse().ok()?;
        let offset: usize = parts.next()?.parse().ok()?;
        let text = self.chapters.get(chapter)?;
        Some((chapter, offset.min(text.len().saturating_sub(1))))
    }

    fn move_to(&self, chapter: usize, offset: usize) {
        let moved = {
            let mut view = self.view.lock();
            let aligned = offset - offset % view.page_chars.max(1);
            let moved = view.chapter != chapter || view.offset != aligned;
            view.chapter = chapter;
            view.offset = aligned;
            moved.then(|| address(chapter, aligned))
        };
        if let Some(address) = moved {
            self.notify(address);
        }
    }

    fn notify(&self, address: String) {
        let relocation = Relocation {
            address,
            page: None,
        };
        for listener in self.relocated.lock().iter() {
            listener(relocation.clone());
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(anyhow!("engine destroyed"));
        }
        Ok(())
    }
}

fn address(chapter: usize, offset: usize) -> String {
    format!("loc:{chapter}:{offset}")
}

#[async_trait]
impl ReflowableEngine for EpubEngine {
    #[instrument(skip(self), level = "debug")]
    async fn display(&self, target: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let (chapter, offset) = match target {
            Some(raw) => self
                .parse_address(raw)
                .ok_or_else(|| anyhow!("unknown location {raw}"))?,
            None => (0, 0),
        };
        self.move_to(chapter, offset);
        Ok(())
    }

    async fn next(&self) -> Result<()> {
        self.ensure_open()?;
        let view = *self.view.lock();
        let next = view.offset + view.page_chars;
        if next < self.chapters[view.chapter].len() {
            self.move_to(view.chapter, next);
        } else if view.chapter + 1 < self.chapters.len() {
            self.move_to(view.chapter + 1, 0);
        }
        Ok(())
    }

    async fn prev(&self) -> Result<()> {
        self.ensure_open()?;
        let view = *self.view.lock();
        if view.offset > 0 {
            self.move_to(view.chapter, view.offset.saturating_sub(view.page_chars));
        } else if view.chapter > 0 {
            let chapter = view.chapter - 1;
            let last = self.chapters[chapter].len().saturating_sub(1);
            self.move_to(chapter, last);
        }
        Ok(())
    }

    fn current_address(&self) -> Option<String> {
        let view = self.view.lock();
        Some(address(view.chapter, view.offset))
    }

    fn fraction_from_address(&self, raw: &str) -> Option<f64> {
        let (chapter, offset) = self.parse_address(raw)?;
        let total = self.total_chars();
        if total == 0 {
            return Some(0.0);
        }
        Some((self.starts[chapter] + offset) as f64 / total as f64)
    }

    fn address_from_fraction(&self, fraction: f64) -> Option<String> {
        let total = self.total_chars();
        if total == 0 {
            return None;
        }
        let global = ((fraction.clamp(0.0, 1.0) * total as f64) as usize).min(total - 1);
        let chapter = self
            .starts
            .partition_point(|start| *start <= global)
            .saturating_sub(1)
            .min(self.chapters.len() - 1);
        Some(address(chapter, global - self.starts[chapter]))
    }

    fn on_relocated(&self, listener: RelocationListener) {
        self.relocated.lock().push(listener);
    }

    fn on_selection(&self, listener: SelectionListener) {
        self.selected.lock().push(listener);
    }

    fn add_annotation(&self, range: &str, style: &AnnotationStyle) -> Result<()> {
        self.parse_address(range)
            .ok_or_else(|| anyhow!("unknown range {range}"))?;
        let mut annotations = self.annotations.lock();
        annotations.retain(|(existing, _)| existing != range);
        annotations.push((range.to_owned(), *style));
        Ok(())
    }

    fn remove_annotation(&self, range: &str) -> Result<()> {
        self.annotations
            .lock()
            .retain(|(existing, _)| existing != range);
        Ok(())
    }

    /// Font scale changes how many chars fit a view; the view is realigned
    /// and listeners hear about the new start.
    fn apply_theme(&self, theme: &ThemeParams) -> Result<()> {
        let page_chars = ((BASE_PAGE_CHARS as f32) / theme.font_scale.max(0.1)).round() as usize;
        let (chapter, offset) = {
            let mut view = self.view.lock();
            if view.page_chars == page_chars.max(1) {
                return Ok(());
            }
            view.page_chars = page_chars.max(1);
            (view.chapter, view.offset)
        };
        self.move_to(chapter, offset);
        Ok(())
    }

    fn visible_text(&self) -> Option<String> {
        let view = *self.view.lock();
        let chapter = self.chapters.get(view.chapter)?;
        let end = (view.offset + view.page_chars).min(chapter.len());
        Some(chapter[view.offset.min(end)..end].iter().collect())
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.relocated.lock().clear();
            self.selected.lock().clear();
            debug!("epub engine destroyed");
        }
    }
}
