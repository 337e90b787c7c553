use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// Rectangle in screen/client pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }
        Some(Rect::new(left, top, right - left, bottom - top))
    }

    /// Either dimension under `min_px`.
    pub fn is_degenerate(&self, min_px: f64) -> bool {
        self.width < min_px || self.height < min_px
    }
}

/// Region expressed as fractions of its owning page layer, independent of
/// zoom and viewport size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl NormalizedRect {
    /// Normalizes `rect` against `layer`. Returns `None` for an empty layer.
    pub fn from_rect(rect: &Rect, layer: &Rect) -> Option<Self> {
        if layer.width <= 0.0 || layer.height <= 0.0 {
            return None;
        }
        Some(Self {
            x: (rect.x - layer.x) / layer.width,
            y: (rect.y - layer.y) / layer.height,
            w: rect.width / layer.width,
            h: rect.height / layer.height,
        })
    }

    /// Re-projects onto a layer's current on-screen bounds.
    pub fn project(&self, layer: &Rect) -> Rect {
        Rect::new(
            layer.x + self.x * layer.width,
            layer.y + self.y * layer.height,
            self.w * layer.width,
            self.h * layer.height,
        )
    }

    pub fn clamp(self) -> Self {
        let x = self.x.clamp(0.0, 1.0);
        let y = self.y.clamp(0.0, 1.0);
        let right = (self.x + self.w).clamp(0.0, 1.0);
        let bottom = (self.y + self.h).clamp(0.0, 1.0);
        Self {
            x,
            y,
            w: (right - x).max(0.0),
            h: (bottom - y).max(0.0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.w > 0.0 && self.h > 0.0
    }
}
