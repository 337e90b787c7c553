use std::time::{Duration, Instant};

use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};
use pagewise_core::{Command, HighlightColor, NavCommand, SwipeDetector};

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A session command, applied `count` times.
    Command { command: Command, count: usize },
    /// Select text in the current view.
    Select,
    /// Jump to the n-th bookmark (1-based) of the session's list.
    JumpToBookmark(usize),
    FontStep(f32),
    BeginNote,
    NoteChanged { text: String },
    NoteSubmit { text: String },
    NoteCancel,
    Resize { columns: u16, rows: u16 },
    Quit,
    None,
}

impl UiEvent {
    fn once(command: Command) -> Self {
        UiEvent::Command { command, count: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Note,
}

const COLORS: [HighlightColor; 4] = [
    HighlightColor::Yellow,
    HighlightColor::Green,
    HighlightColor::Blue,
    HighlightColor::Pink,
];

/// Keys and mouse gestures to [`UiEvent`]s. A numeric prefix is kept
/// between key events: `12g` goes to page 12, `40%` scrubs to 40%, `3j`
/// turns three pages, `2y` highlights in the second colour.
#[derive(Debug)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    char_stack: String,
    mode: InputMode,
    note_buffer: String,
    swipe: SwipeDetector,
    /// Pixel size of one terminal cell, for swipe distances.
    cell: (f64, f64),
}

impl Default for EventMapper {
    fn default() -> Self {
        Self::new(50.0, Duration::from_millis(600))
    }
}

impl EventMapper {
    pub const ZOOM_STEP: f32 = 1.1;
    pub const FONT_STEP: f32 = 0.1;

    pub fn new(swipe_min_distance: f64, swipe_max_duration: Duration) -> Self {
        Self {
            pending_count: None,
            pending_digits: String::new(),
            char_stack: String::new(),
            mode: InputMode::Normal,
            note_buffer: String::new(),
            swipe: SwipeDetector::new(swipe_min_distance, swipe_max_duration),
            cell: (8.0, 16.0),
        }
    }

    pub fn set_cell_size(&mut self, width: f64, height: f64) {
        if width > 0.0 && height > 0.0 {
            self.cell = (width, height);
        }
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.char_stack.clear();
            self.note_buffer.clear();
            self.swipe.cancel();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        self.map_event_at(event, Instant::now())
    }

    pub fn map_event_at(&mut self, event: Event, at: Instant) -> UiEvent {
        match event {
            Event::Resize(columns, rows) => UiEvent::Resize { columns, rows },
            Event::Mouse(mouse) if self.mode == InputMode::Normal => self.map_mouse(mouse, at),
            Event::Key(key) => match self.mode {
                InputMode::Normal => self.map_key_normal(key),
                InputMode::Note => self.map_key_note(key),
            },
            _ => UiEvent::None,
        }
    }

    fn map_mouse(&mut self, mouse: MouseEvent, at: Instant) -> UiEvent {
        let x = f64::from(mouse.column) * self.cell.0;
        let y = f64::from(mouse.row) * self.cell.1;
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                self.swipe.pointer_down(x, y, at);
                UiEvent::None
            }
            MouseEventKind::Up(MouseButton::Left) => match self.swipe.pointer_up(x, y, at) {
                Some(NavCommand::Next) => UiEvent::once(Command::NextPage),
                Some(NavCommand::Prev) => UiEvent::once(Command::PrevPage),
                _ => UiEvent::None,
            },
            MouseEventKind::ScrollDown => UiEvent::once(Command::NextPage),
            MouseEventKind::ScrollUp => UiEvent::once(Command::PrevPage),
            _ => UiEvent::None,
        }
    }

    fn map_key_normal(&mut self, key: KeyEvent) -> UiEvent {
        let KeyEvent {
            code, modifiers, ..
        } = key;
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() && self.char_stack == "'" => {
                self.char_stack.clear();
                let index = c.to_digit(10).unwrap_or(0) as usize;
                if index == 0 {
                    UiEvent::None
                } else {
                    UiEvent::JumpToBookmark(index)
                }
            }
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('\''), _) => {
                self.reset_count();
                self.char_stack = "'".to_owned();
                UiEvent::None
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Char(' '), _)
            | (KeyCode::Down, _)
            | (KeyCode::Right, _)
            | (KeyCode::PageDown, _) => self.counted(Command::NextPage),
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Backspace, _)
            | (KeyCode::Up, _)
            | (KeyCode::Left, _)
            | (KeyCode::PageUp, _) => self.counted(Command::PrevPage),
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                let page = self.take_count();
                UiEvent::once(Command::GotoPage(page as u32))
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => {
                self.reset_count();
                UiEvent::once(Command::Scrub(1.0))
            }
            (KeyCode::Char('%'), _) => match self.pending_count.take() {
                Some(percent) => {
                    self.pending_digits.clear();
                    UiEvent::once(Command::Scrub(percent.min(100) as f64 / 100.0))
                }
                None => UiEvent::None,
            },
            (KeyCode::Char('b'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::once(Command::AddBookmark { label: None })
            }
            (KeyCode::Char('v'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Select
            }
            (KeyCode::Char('y'), KeyModifiers::NONE) | (KeyCode::Enter, _) => {
                let index = self.take_count().clamp(1, COLORS.len()) - 1;
                UiEvent::once(Command::ConfirmHighlight {
                    color: COLORS[index],
                })
            }
            (KeyCode::Esc, _) => {
                self.reset_count();
                self.char_stack.clear();
                UiEvent::once(Command::DismissSelection)
            }
            (KeyCode::Char('a'), KeyModifiers::NONE) => {
                self.set_mode(InputMode::Note);
                UiEvent::BeginNote
            }
            (KeyCode::Char('s'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::once(Command::ToggleViewMode)
            }
            (KeyCode::Char('+'), _) => {
                self.reset_count();
                UiEvent::once(Command::ScaleBy(Self::ZOOM_STEP))
            }
            (KeyCode::Char('-'), _) => {
                self.reset_count();
                UiEvent::once(Command::ScaleBy(1.0 / Self::ZOOM_STEP))
            }
            (KeyCode::Char('='), _) => {
                self.reset_count();
                UiEvent::once(Command::SetZoom(1.0))
            }
            (KeyCode::Char('>'), _) => {
                self.reset_count();
                UiEvent::FontStep(Self::FONT_STEP)
            }
            (KeyCode::Char('<'), _) => {
                self.reset_count();
                UiEvent::FontStep(-Self::FONT_STEP)
            }
            (KeyCode::Char('d'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::once(Command::CycleTheme)
            }
            (KeyCode::Char('S'), _) => {
                self.reset_count();
                UiEvent::once(Command::SaveNow)
            }
            (KeyCode::Char('f'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::once(Command::ToggleFormat)
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                self.char_stack.clear();
                UiEvent::None
            }
        }
    }

    fn map_key_note(&mut self, key: KeyEvent) -> UiEvent {
        match (key.code, key.modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::NoteCancel
            }
            (KeyCode::Enter, _) => {
                let text = self.note_buffer.trim().to_owned();
                self.set_mode(InputMode::Normal);
                if text.is_empty() {
                    UiEvent::NoteCancel
                } else {
                    UiEvent::NoteSubmit { text }
                }
            }
            (KeyCode::Backspace, _) => {
                self.note_buffer.pop();
                UiEvent::NoteChanged {
                    text: self.note_buffer.clone(),
                }
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.note_buffer.push(c);
                UiEvent::NoteChanged {
                    text: self.note_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn counted(&mut self, command: Command) -> UiEvent {
        let count = self.take_count();
        UiEvent::Command { command, count }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    /// What the reader has typed so far, for the status line.
    pub fn pending_input(&self) -> Option<String> {
        if self.mode == InputMode::Note {
            return Some(format!("note: {}", self.note_buffer));
        }
        let pending = format!("{}{}", self.pending_digits, self.char_stack);
        (!pending.is_empty()).then_some(pending)
    }
}
