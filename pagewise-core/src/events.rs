use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::TextSelection;
use crate::model::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Confirmation,
    Boundary,
    Busy,
    Error,
}

/// One-line message meant for the reader.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

/// Why the fixed-layout renderer gave up and the raw asset should be shown
/// through a generic viewer instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    BlankPage(u32),
    RenderStalled(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Relocated(Location),
    Selected(TextSelection),
    RenderComplete { page: u32 },
    TurnStarted,
    TurnFinished,
    Notice(Notice),
    Degraded(FallbackReason),
}

/// Ordered in-process bus both renderer adapters publish to. Cloning shares
/// the same queue.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    queue: Arc<Mutex<VecDeque<ReaderEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ReaderEvent) {
        self.queue.lock().push_back(event);
    }

    pub fn notice(&self, kind: NoticeKind, message: impl Into<String>) {
        self.publish(ReaderEvent::Notice(Notice {
            kind,
            message: message.into(),
        }));
    }

    /// Takes every queued event, oldest first.
    pub fn drain(&self) -> Vec<ReaderEvent> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_emission_order() {
        let bus = EventBus::new();
        let other = bus.clone();
        bus.publish(ReaderEvent::TurnStarted);
        other.publish(ReaderEvent::RenderComplete { page: 3 });
        bus.notice(NoticeKind::Info, "hello");

        let events = bus.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ReaderEvent::TurnStarted);
        assert_eq!(events[1], ReaderEvent::RenderComplete { page: 3 });
        assert!(matches!(events[2], ReaderEvent::Notice(ref n) if n.message == "hello"));
        assert!(other.is_empty());
    }
}
