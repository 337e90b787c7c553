//! Terminal front-end pieces: Kitty graphics output, text pages, the status
//! line and key/mouse mapping onto session commands.

use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    style::Print,
    terminal::{Clear, ClearType},
};
use pagewise_core::{
    DocumentFormat, NavState, Notice, NoticeKind, RenderImage, SyncStatus, Theme, ViewMode,
};
use png::{BitDepth, ColorType, Encoder};
use tracing::trace;

mod input;
mod paint;

pub use input::{EventMapper, InputMode, UiEvent};
pub use paint::{compose_frame, paint_overlays, paint_selection, select_spans, wrap_text};

const CHUNK_SIZE: usize = 4096;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits `image` as PNG and places it at the cursor, scaled into
    /// the given cell box. Re-drawing replaces the previous frame.
    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        trace!(bytes = buffer.len(), "kitty frame encoded");
        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(CHUNK_SIZE).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={more},q=2")?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes the placed frame, e.g. before switching to a text page.
    pub fn delete_image(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=I,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders everything buffered since `begin_sync_update`
    /// at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// Writes wrapped reflowable text into the top `rows` lines.
pub fn write_text_page<W: Write>(
    writer: &mut W,
    text: &str,
    columns: u16,
    rows: u16,
) -> io::Result<()> {
    let margin = if columns > 40 { 2 } else { 0 };
    let width = usize::from(columns.saturating_sub(margin * 2));
    for (row, line) in wrap_text(text, width)
        .into_iter()
        .take(usize::from(rows))
        .enumerate()
    {
        crossterm::queue!(
            writer,
            cursor::MoveTo(margin, row as u16),
            Clear(ClearType::CurrentLine),
            Print(line)
        )?;
    }
    writer.flush()
}

/// Everything the bottom line reports about the session.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    pub page: u32,
    pub page_count: Option<u32>,
    pub fraction: f64,
    pub format: DocumentFormat,
    pub view_mode: ViewMode,
    pub theme: Theme,
    pub sync: SyncStatus,
    pub nav: NavState,
    pub notice: Option<Notice>,
    pub pending_input: Option<String>,
}

impl StatusLine {
    pub fn render(&self, columns: usize) -> String {
        let mut left = match self.page_count {
            Some(total) => format!(" {}/{}", self.page, total),
            None => format!(" p.{}", self.page),
        };
        left.push_str(&format!(" {:.0}%", self.fraction.clamp(0.0, 1.0) * 100.0));
        left.push_str(&format!(" [{}]", self.format.label()));
        if self.view_mode == ViewMode::Spread {
            left.push_str(" spread");
        }
        match self.theme {
            Theme::Light => {}
            Theme::Dark => left.push_str(" dark"),
            Theme::Sepia => left.push_str(" sepia"),
        }
        if self.sync == SyncStatus::Degraded {
            left.push_str(" !unsynced");
        }
        if self.nav.is_turning() {
            left.push_str(" …");
        }

        let right = if let Some(pending) = &self.pending_input {
            pending.clone()
        } else if let NavState::IdleError(message) = &self.nav {
            message.clone()
        } else if let Some(notice) = &self.notice {
            match notice.kind {
                NoticeKind::Error => format!("error: {}", notice.message),
                _ => notice.message.clone(),
            }
        } else {
            String::new()
        };

        let used = left.chars().count();
        let room = columns.saturating_sub(used + 1);
        let right: String = right.chars().take(room).collect();
        let gap = columns.saturating_sub(used + right.chars().count() + 1);
        let line = format!("{left}{}{right} ", " ".repeat(gap));
        line.chars().take(columns).collect()
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, row: u16, label: &str) -> io::Result<()> {
    crossterm::queue!(
        writer,
        cursor::MoveTo(0, row),
        Clear(ClearType::CurrentLine),
        Print(label)
    )?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> StatusLine {
        StatusLine {
            page: 12,
            page_count: Some(300),
            fraction: 0.0368,
            format: DocumentFormat::FixedLayout,
            view_mode: ViewMode::Single,
            theme: Theme::Light,
            sync: SyncStatus::Healthy,
            nav: NavState::Idle,
            notice: None,
            pending_input: None,
        }
    }

    #[test]
    fn kitty_draw_emits_protocol() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let image = RenderImage {
            width: 1,
            height: 1,
            pixels: vec![255, 0, 0, 255],
        };

        renderer.draw(&image, DrawParams::clamped(10, 0)).unwrap();
        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.starts_with("\u{1b}_Ga=T,f=100"));
        assert!(output.contains("c=10,r=1,s=1,v=1"));
        assert!(output.ends_with("\u{1b}\\"));
    }

    #[test]
    fn large_frames_are_chunked() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let mut seed = 0x2545_f491_u32;
        let pixels: Vec<u8> = (0..64 * 64 * 4)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect();
        let image = RenderImage {
            width: 64,
            height: 64,
            pixels,
        };

        renderer.draw(&image, DrawParams::clamped(20, 10)).unwrap();
        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.contains(",m=1;"));
        assert!(output.contains("\u{1b}_Gm=0,q=2;"));
        assert_eq!(
            output.matches("\u{1b}\\").count(),
            output.matches("\u{1b}_G").count()
        );
    }

    #[test]
    fn delete_targets_the_frame_image() {
        let mut renderer = KittyRenderer::new(Vec::new());
        renderer.delete_image().unwrap();
        assert_eq!(
            String::from_utf8(renderer.writer).unwrap(),
            "\u{1b}_Ga=d,d=I,i=1,q=2\u{1b}\\"
        );
    }

    #[test]
    fn status_line_shows_position_and_flags() {
        let mut line = status();
        assert!(line.render(60).starts_with(" 12/300 4% [fixed-layout]"));

        line.view_mode = ViewMode::Spread;
        line.theme = Theme::Dark;
        line.sync = SyncStatus::Degraded;
        let rendered = line.render(80);
        assert!(rendered.contains("spread dark !unsynced"));
        assert_eq!(rendered.chars().count(), 80);
    }

    #[test]
    fn status_line_prefers_pending_input_over_notices() {
        let mut line = status();
        line.notice = Some(Notice {
            kind: NoticeKind::Error,
            message: "Couldn't save highlight".into(),
        });
        assert!(line.render(80).trim_end().ends_with("error: Couldn't save highlight"));

        line.pending_input = Some("12".into());
        assert!(line.render(80).trim_end().ends_with("12"));

        line.pending_input = None;
        line.nav = NavState::IdleError("Already at the last page".into());
        assert!(line.render(80).trim_end().ends_with("Already at the last page"));
    }

    #[test]
    fn status_line_is_truncated_to_width() {
        let mut line = status();
        line.page_count = None;
        line.format = DocumentFormat::Reflowable;
        line.notice = Some(Notice {
            kind: NoticeKind::Info,
            message: "x".repeat(200),
        });
        let rendered = line.render(30);
        assert_eq!(rendered.chars().count(), 30);
        assert!(rendered.starts_with(" p.12 4% [reflowable]"));
    }

    #[test]
    fn text_page_is_wrapped_into_rows() {
        let mut out = Vec::new();
        write_text_page(&mut out, "one two three four", 9, 1).unwrap();
        let output = String::from_utf8(out).unwrap();
        assert!(output.contains("one two"));
        assert!(!output.contains("three"));
    }
}
