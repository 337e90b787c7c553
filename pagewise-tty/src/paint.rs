//! Software compositing of a fixed-layout frame: rendered pages placed on
//! their layers, highlight overlays blended on top.

use std::sync::Arc;

use pagewise_core::{
    HighlightColor, NativeSelection, PageLayer, Rect, RenderImage, RenderedPage, Size,
};

const OVERLAY_ALPHA: f32 = 0.35;
const SELECTION_RGB: [u8; 3] = [80, 140, 255];
const CANVAS_LIMIT: f64 = 8192.0;

/// One composited frame covering the whole viewport.
pub fn compose_frame(
    pages: &[Arc<RenderedPage>],
    layers: &[PageLayer],
    viewport: Size,
    background: [u8; 3],
) -> RenderImage {
    let width = viewport.width.clamp(1.0, CANVAS_LIMIT) as u32;
    let height = viewport.height.clamp(1.0, CANVAS_LIMIT) as u32;
    let mut canvas = RenderImage {
        width,
        height,
        pixels: [background[0], background[1], background[2], 255]
            .into_iter()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect(),
    };
    for layer in layers {
        if let Some(page) = pages.iter().find(|page| page.page == layer.page) {
            blit(&mut canvas, &page.image, layer.bounds.x, layer.bounds.y);
        }
    }
    canvas
}

fn blit(canvas: &mut RenderImage, image: &RenderImage, x: f64, y: f64) {
    let left = x.max(0.0).round() as u32;
    let top = y.max(0.0).round() as u32;
    if left >= canvas.width || top >= canvas.height {
        return;
    }
    let columns = image.width.min(canvas.width - left) as usize;
    let rows = image.height.min(canvas.height - top);
    for row in 0..rows {
        let src = (row * image.width) as usize * 4;
        let dst = (((top + row) * canvas.width) + left) as usize * 4;
        let (Some(src), Some(dst)) = (
            image.pixels.get(src..src + columns * 4),
            canvas.pixels.get_mut(dst..dst + columns * 4),
        ) else {
            return;
        };
        dst.copy_from_slice(src);
    }
}

/// Blends translucent highlight rectangles given in viewport pixels.
pub fn paint_overlays(canvas: &mut RenderImage, overlays: &[(Rect, HighlightColor)]) {
    for (rect, color) in overlays {
        blend_rect(canvas, rect, color.rgb(), OVERLAY_ALPHA);
    }
}

/// Marks the rectangles of a selection waiting for confirmation.
pub fn paint_selection(canvas: &mut RenderImage, rects: &[Rect]) {
    for rect in rects {
        blend_rect(canvas, rect, SELECTION_RGB, OVERLAY_ALPHA);
    }
}

fn blend_rect(canvas: &mut RenderImage, rect: &Rect, rgb: [u8; 3], alpha: f32) {
    let bounds = Rect::new(0.0, 0.0, f64::from(canvas.width), f64::from(canvas.height));
    let Some(visible) = rect.intersect(&bounds) else {
        return;
    };
    let x0 = visible.x.floor() as u32;
    let y0 = visible.y.floor() as u32;
    let x1 = (visible.right().ceil() as u32).min(canvas.width);
    let y1 = (visible.bottom().ceil() as u32).min(canvas.height);
    for y in y0..y1 {
        for x in x0..x1 {
            let offset = ((y * canvas.width + x) * 4) as usize;
            for (channel, value) in rgb.iter().enumerate() {
                let current = f32::from(canvas.pixels[offset + channel]);
                let mixed = current * (1.0 - alpha) + f32::from(*value) * alpha;
                canvas.pixels[offset + channel] = mixed.round() as u8;
            }
        }
    }
}

/// A selection of `count` consecutive text spans of a rendered page,
/// starting at `first`, in viewport pixels.
pub fn select_spans(
    page: &RenderedPage,
    layer: &PageLayer,
    first: usize,
    count: usize,
) -> NativeSelection {
    let spans: Vec<_> = page.text_layer.iter().skip(first).take(count).collect();
    NativeSelection {
        text: spans
            .iter()
            .map(|span| span.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        client_rects: spans
            .iter()
            .map(|span| span.rect.project(&layer.bounds))
            .collect(),
    }
}

/// Greedy word wrap of reflowable text into terminal lines.
pub fn wrap_text(text: &str, columns: usize) -> Vec<String> {
    let columns = columns.max(1);
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let needed = if line.is_empty() {
                word.chars().count()
            } else {
                line.chars().count() + 1 + word.chars().count()
            };
            if needed > columns && !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
            while line.chars().count() > columns {
                let rest: String = line.chars().skip(columns).collect();
                line = line.chars().take(columns).collect();
                lines.push(std::mem::replace(&mut line, rest));
            }
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewise_core::{NormalizedRect, TextSpan};

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RenderImage {
        RenderImage {
            width,
            height,
            pixels: [rgb[0], rgb[1], rgb[2], 255]
                .into_iter()
                .cycle()
                .take((width * height * 4) as usize)
                .collect(),
        }
    }

    fn pixel(image: &RenderImage, x: u32, y: u32) -> [u8; 3] {
        let offset = ((y * image.width + x) * 4) as usize;
        [
            image.pixels[offset],
            image.pixels[offset + 1],
            image.pixels[offset + 2],
        ]
    }

    fn page(number: u32, image: RenderImage, text_layer: Vec<TextSpan>) -> Arc<RenderedPage> {
        Arc::new(RenderedPage {
            page: number,
            image,
            text_layer,
        })
    }

    #[test]
    fn pages_land_on_their_layers() {
        let pages = vec![
            page(3, solid(4, 4, [255, 0, 0]), Vec::new()),
            page(4, solid(4, 4, [0, 0, 255]), Vec::new()),
        ];
        let layers = vec![
            PageLayer {
                page: 3,
                bounds: Rect::new(2.0, 0.0, 4.0, 4.0),
            },
            PageLayer {
                page: 4,
                bounds: Rect::new(6.0, 0.0, 4.0, 4.0),
            },
        ];
        let frame = compose_frame(&pages, &layers, Size::new(12.0, 6.0), [0, 0, 0]);

        assert_eq!((frame.width, frame.height), (12, 6));
        assert_eq!(pixel(&frame, 0, 0), [0, 0, 0]);
        assert_eq!(pixel(&frame, 2, 0), [255, 0, 0]);
        assert_eq!(pixel(&frame, 9, 3), [0, 0, 255]);
        assert_eq!(pixel(&frame, 9, 5), [0, 0, 0]);
    }

    #[test]
    fn pages_are_clipped_to_the_viewport() {
        let pages = vec![page(1, solid(10, 10, [9, 9, 9]), Vec::new())];
        let layers = vec![PageLayer {
            page: 1,
            bounds: Rect::new(0.0, 0.0, 10.0, 10.0),
        }];
        let frame = compose_frame(&pages, &layers, Size::new(5.0, 5.0), [0, 0, 0]);
        assert_eq!(frame.pixels.len(), 5 * 5 * 4);
        assert_eq!(pixel(&frame, 4, 4), [9, 9, 9]);
    }

    #[test]
    fn overlays_blend_inside_their_rect_only() {
        let mut canvas = solid(10, 10, [255, 255, 255]);
        paint_overlays(
            &mut canvas,
            &[(Rect::new(2.0, 2.0, 3.0, 2.0), HighlightColor::Blue)],
        );
        let tinted = pixel(&canvas, 3, 3);
        assert!(tinted[0] < 255 && tinted[2] == 255);
        assert_eq!(pixel(&canvas, 6, 6), [255, 255, 255]);

        paint_overlays(
            &mut canvas,
            &[(Rect::new(-50.0, -50.0, 10.0, 10.0), HighlightColor::Pink)],
        );
        assert_eq!(pixel(&canvas, 0, 0), [255, 255, 255]);
    }

    #[test]
    fn spans_become_a_native_selection() {
        let spans = vec![
            TextSpan {
                text: "Call me".into(),
                rect: NormalizedRect {
                    x: 0.1,
                    y: 0.1,
                    w: 0.5,
                    h: 0.05,
                },
            },
            TextSpan {
                text: " Ishmael. ".into(),
                rect: NormalizedRect {
                    x: 0.1,
                    y: 0.2,
                    w: 0.3,
                    h: 0.05,
                },
            },
        ];
        let rendered = page(2, solid(1, 1, [0, 0, 0]), spans);
        let layer = PageLayer {
            page: 2,
            bounds: Rect::new(100.0, 0.0, 400.0, 600.0),
        };

        let selection = select_spans(&rendered, &layer, 0, 5);
        assert_eq!(selection.text, "Call me Ishmael.");
        assert_eq!(selection.client_rects.len(), 2);
        assert_eq!(selection.client_rects[0], Rect::new(140.0, 60.0, 200.0, 30.0));

        let empty = select_spans(&rendered, &layer, 7, 2);
        assert!(empty.text.is_empty() && empty.client_rects.is_empty());
    }

    #[test]
    fn text_wraps_on_word_boundaries() {
        let lines = wrap_text("the quick brown fox\n\njumps", 10);
        assert_eq!(lines, vec!["the quick", "brown fox", "", "jumps"]);
        assert_eq!(wrap_text("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert!(wrap_text("\n\n", 8).is_empty());
    }
}
