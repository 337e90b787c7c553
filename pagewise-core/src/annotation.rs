//! Turns raw selections from either renderer into durable annotation
//! records, and keeps the local replica of the remote annotation store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::TextSelection;
use crate::error::{ReaderError, ReaderResult};
use crate::geometry::{NormalizedRect, Rect, Size};
use crate::model::{
    Bookmark, Highlight, HighlightColor, NewHighlight, Note, RecordId, SessionState,
};

const AFFORDANCE_WIDTH: f64 = 160.0;
const AFFORDANCE_HEIGHT: f64 = 40.0;
const AFFORDANCE_GAP: f64 = 8.0;

/// Top-left corner of the inline "highlight" action, in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affordance {
    pub x: f64,
    pub y: f64,
}

impl Affordance {
    /// Above the selection when there is room, below otherwise, always
    /// inside the viewport.
    pub fn near(bounds: &Rect, viewport: Size) -> Self {
        let (center_x, _) = bounds.center();
        let above = bounds.y - AFFORDANCE_GAP - AFFORDANCE_HEIGHT;
        let y = if above >= 0.0 {
            above
        } else {
            bounds.bottom() + AFFORDANCE_GAP
        };
        let max_x = (viewport.width - AFFORDANCE_WIDTH).max(0.0);
        let max_y = (viewport.height - AFFORDANCE_HEIGHT).max(0.0);
        Self {
            x: (center_x - AFFORDANCE_WIDTH / 2.0).clamp(0.0, max_x),
            y: y.clamp(0.0, max_y),
        }
    }
}

/// Page-relative anchor of a fixed-layout highlight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedAnchor {
    pub page: u32,
    pub rects: Vec<NormalizedRect>,
}

impl FixedAnchor {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode highlight anchor")
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).with_context(|| format!("invalid highlight anchor {raw:?}"))
    }
}

/// Selection as read from the fixed-layout text layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NativeSelection {
    pub text: String,
    pub client_rects: Vec<Rect>,
}

/// On-screen bounds of one rendered page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageLayer {
    pub page: u32,
    pub bounds: Rect,
}

/// A captured selection waiting for the reader to confirm it.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionCapture {
    Reflowable {
        page: u32,
        address: String,
        excerpt: String,
        affordance: Affordance,
    },
    FixedLayout {
        anchor: FixedAnchor,
        excerpt: String,
        affordance: Affordance,
    },
}

impl SelectionCapture {
    pub fn page(&self) -> u32 {
        match self {
            SelectionCapture::Reflowable { page, .. } => *page,
            SelectionCapture::FixedLayout { anchor, .. } => anchor.page,
        }
    }

    pub fn excerpt(&self) -> &str {
        match self {
            SelectionCapture::Reflowable { excerpt, .. }
            | SelectionCapture::FixedLayout { excerpt, .. } => excerpt,
        }
    }

    pub fn affordance(&self) -> Affordance {
        match self {
            SelectionCapture::Reflowable { affordance, .. }
            | SelectionCapture::FixedLayout { affordance, .. } => *affordance,
        }
    }

    pub fn to_highlight(&self, color: HighlightColor) -> Result<NewHighlight> {
        let anchor = match self {
            SelectionCapture::Reflowable { address, .. } => address.clone(),
            SelectionCapture::FixedLayout { anchor, .. } => anchor.encode()?,
        };
        Ok(NewHighlight {
            page: self.page(),
            anchor,
            text_snippet: self.excerpt().to_owned(),
            color,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AnnotationMapper {
    excerpt_limit: usize,
    min_rect_px: f64,
}

impl AnnotationMapper {
    pub fn new(excerpt_limit: usize, min_rect_px: f64) -> Self {
        Self {
            excerpt_limit,
            min_rect_px,
        }
    }

    /// Collapses whitespace and caps the excerpt at the configured length.
    pub fn excerpt(&self, text: &str) -> String {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.chars().take(self.excerpt_limit).collect()
    }

    pub fn capture_reflowable(
        &self,
        selection: &TextSelection,
        page: u32,
        viewport: Size,
    ) -> ReaderResult<SelectionCapture> {
        let excerpt = self.excerpt(&selection.text);
        if excerpt.is_empty() || selection.range_address.is_empty() {
            return Err(ReaderError::SelectionEmpty);
        }
        Ok(SelectionCapture::Reflowable {
            page,
            address: selection.range_address.clone(),
            excerpt,
            affordance: Affordance::near(&selection.bounds, viewport),
        })
    }

    /// Maps client rectangles onto the page layer they overlap most.
    pub fn capture_fixed(
        &self,
        selection: &NativeSelection,
        layers: &[PageLayer],
        viewport: Size,
    ) -> ReaderResult<SelectionCapture> {
        let layer = owning_layer(&selection.client_rects, layers).ok_or(ReaderError::SelectionEmpty)?;

        let mut kept: Vec<Rect> = Vec::new();
        let mut rects = Vec::new();
        for client in &selection.client_rects {
            let Some(clipped) = client.intersect(&layer.bounds) else {
                continue;
            };
            if clipped.is_degenerate(self.min_rect_px) {
                continue;
            }
            if let Some(normalized) = NormalizedRect::from_rect(&clipped, &layer.bounds) {
                let normalized = normalized.clamp();
                if normalized.is_valid() {
                    rects.push(normalized);
                    kept.push(clipped);
                }
            }
        }
        debug!(
            page = layer.page,
            client = selection.client_rects.len(),
            kept = rects.len(),
            "fixed-layout selection mapped"
        );
        let bounds = bounding_box(&kept).ok_or(ReaderError::SelectionEmpty)?;

        Ok(SelectionCapture::FixedLayout {
            anchor: FixedAnchor {
                page: layer.page,
                rects,
            },
            excerpt: self.excerpt(&selection.text),
            affordance: Affordance::near(&bounds, viewport),
        })
    }
}

fn owning_layer(rects: &[Rect], layers: &[PageLayer]) -> Option<PageLayer> {
    layers
        .iter()
        .map(|layer| {
            let overlap: f64 = rects
                .iter()
                .filter_map(|rect| rect.intersect(&layer.bounds))
                .map(|clipped| clipped.area())
                .sum();
            (layer, overlap)
        })
        .filter(|(_, overlap)| *overlap > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(layer, _)| *layer)
}

fn bounding_box(rects: &[Rect]) -> Option<Rect> {
    let first = rects.first()?;
    let (mut left, mut top, mut right, mut bottom) = (first.x, first.y, first.right(), first.bottom());
    for rect in &rects[1..] {
        left = left.min(rect.x);
        top = top.min(rect.y);
        right = right.max(rect.right());
        bottom = bottom.max(rect.bottom());
    }
    Some(Rect::new(left, top, right - left, bottom - top))
}

/// Local mirror of the remote bookmarks, notes and highlights, plus
/// optimistic inserts that still carry a local id.
#[derive(Debug, Clone, Default)]
pub struct AnnotationReplica {
    pub bookmarks: Vec<Bookmark>,
    pub notes: Vec<Note>,
    pub highlights: Vec<Highlight>,
}

macro_rules! replica_records {
    ($field:ident, $ty:ty, $insert:ident, $confirm:ident, $remove:ident, $find:ident) => {
        pub fn $insert(&mut self, record: $ty) {
            self.$field.push(record);
        }

        /// Swaps an optimistic record for the server's copy.
        pub fn $confirm(&mut self, local_id: &str, confirmed: $ty) {
            match self.$field.iter_mut().find(|r| r.id == local_id) {
                Some(slot) => *slot = confirmed,
                None => self.$field.push(confirmed),
            }
        }

        pub fn $remove(&mut self, id: &str) -> Option<$ty> {
            let index = self.$field.iter().position(|r| r.id == id)?;
            Some(self.$field.remove(index))
        }

        pub fn $find(&self, id: &str) -> Option<&$ty> {
            self.$field.iter().find(|r| r.id == id)
        }
    };
}

impl AnnotationReplica {
    pub fn hydrate(state: &SessionState) -> Self {
        Self {
            bookmarks: state.bookmarks.clone(),
            notes: state.notes.clone(),
            highlights: state.highlights.clone(),
        }
    }

    replica_records!(bookmarks, Bookmark, insert_bookmark, confirm_bookmark, remove_bookmark, bookmark);
    replica_records!(notes, Note, insert_note, confirm_note, remove_note, note);
    replica_records!(highlights, Highlight, insert_highlight, confirm_highlight, remove_highlight, highlight);

    pub fn highlight_ids(&self) -> Vec<RecordId> {
        self.highlights.iter().map(|h| h.id.clone()).collect()
    }
}
