use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::adapter::{NavTarget, RendererAdapter};
use crate::error::{Boundary, NavFailure};
use crate::events::{EventBus, NoticeKind, ReaderEvent};
use crate::model::Location;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavState {
    Idle,
    Turning,
    /// Back to idle after a failed turn; carries the message shown.
    IdleError(String),
}

impl NavState {
    pub fn is_turning(&self) -> bool {
        matches!(self, NavState::Turning)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavCommand {
    Next,
    Prev,
    /// Scrub-bar commit, as a document fraction.
    Scrub(f64),
    GoTo(NavTarget),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavOutcome {
    Moved(Location),
    Boundary(Boundary),
    /// Another turn is in progress; nothing was queued.
    Busy,
    Superseded,
    Failed(String),
}

/// Page-turn state machine shared by both adapters.
#[derive(Clone)]
pub struct Navigator {
    state: Arc<Mutex<NavState>>,
    bus: EventBus,
    timeout: Duration,
}

/// Puts the state back to idle if a turn is dropped mid-flight.
struct TurnGuard {
    state: Arc<Mutex<NavState>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.is_turning() {
            *state = NavState::Idle;
        }
    }
}

impl Navigator {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(NavState::Idle)),
            bus,
            timeout,
        }
    }

    pub fn state(&self) -> NavState {
        self.state.lock().clone()
    }

    #[instrument(skip(self, adapter), fields(format = %adapter.format()))]
    pub async fn turn(&self, adapter: &dyn RendererAdapter, command: NavCommand) -> NavOutcome {
        {
            let mut state = self.state.lock();
            if state.is_turning() {
                debug!("turn rejected while another is in progress");
                self.bus.notice(NoticeKind::Busy, "Still loading");
                return NavOutcome::Busy;
            }
            *state = NavState::Turning;
        }
        let _guard = TurnGuard {
            state: Arc::clone(&self.state),
        };
        self.bus.publish(ReaderEvent::TurnStarted);

        let call = async {
            match command {
                NavCommand::Next => adapter.next().await,
                NavCommand::Prev => adapter.prev().await,
                NavCommand::Scrub(fraction) => adapter.go_to(NavTarget::Fraction(fraction)).await,
                NavCommand::GoTo(target) => adapter.go_to(target).await,
            }
        };

        let (state, outcome) = match timeout(self.timeout, call).await {
            Ok(Ok(location)) => (NavState::Idle, NavOutcome::Moved(location)),
            Ok(Err(NavFailure::Boundary(boundary))) => {
                let message = format!("Already at the {boundary}");
                self.bus.notice(NoticeKind::Boundary, message.clone());
                (NavState::IdleError(message), NavOutcome::Boundary(boundary))
            }
            Ok(Err(NavFailure::Superseded)) => (NavState::Idle, NavOutcome::Superseded),
            Ok(Err(failure)) => {
                warn!(%failure, "page turn failed");
                let message = failure.to_string();
                self.bus.notice(NoticeKind::Error, message.clone());
                (NavState::IdleError(message.clone()), NavOutcome::Failed(message))
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "page turn timed out");
                let message = NavFailure::Stalled.to_string();
                self.bus.notice(NoticeKind::Error, message.clone());
                (NavState::IdleError(message.clone()), NavOutcome::Failed(message))
            }
        };

        *self.state.lock() = state;
        self.bus.publish(ReaderEvent::TurnFinished);
        outcome
    }
}

/// Turns a horizontal pointer drag into a single next/prev command.
#[derive(Debug, Clone)]
pub struct SwipeDetector {
    min_distance: f64,
    max_duration: Duration,
    start: Option<(f64, f64, Instant)>,
}

impl SwipeDetector {
    pub fn new(min_distance: f64, max_duration: Duration) -> Self {
        Self {
            min_distance,
            max_duration,
            start: None,
        }
    }

    pub fn pointer_down(&mut self, x: f64, y: f64, at: Instant) {
        self.start = Some((x, y, at));
    }

    pub fn cancel(&mut self) {
        self.start = None;
    }

    pub fn pointer_up(&mut self, x: f64, y: f64, at: Instant) -> Option<NavCommand> {
        let (start_x, start_y, started) = self.start.take()?;
        if at.saturating_duration_since(started) > self.max_duration {
            return None;
        }
        let dx = x - start_x;
        let dy = y - start_y;
        if dx.abs() < self.min_distance || dx.abs() < dy.abs() {
            return None;
        }
        Some(if dx < 0.0 { NavCommand::Next } else { NavCommand::Prev })
    }
}

/// Scrub bar: previews while dragging, navigates only on commit.
#[derive(Debug, Clone, Default)]
pub struct ScrubBar {
    preview: Option<f64>,
}

impl ScrubBar {
    pub fn drag(&mut self, fraction: f64) {
        self.preview = Some(fraction.clamp(0.0, 1.0));
    }

    pub fn preview(&self) -> Option<f64> {
        self.preview
    }

    pub fn commit(&mut self) -> Option<NavCommand> {
        self.preview.take().map(NavCommand::Scrub)
    }

    pub fn cancel(&mut self) {
        self.preview = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ThemeParams;
    use crate::model::{DocumentFormat, Highlight};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::future::Future;
    use std::pin::Pin;
    use std::task::Poll;

    /// Adapter whose calls randomly succeed, fail, hit a boundary or hang.
    struct ChaosAdapter {
        rng: Mutex<StdRng>,
    }

    impl ChaosAdapter {
        async fn roll(&self) -> Result<Location, NavFailure> {
            let roll = self.rng.lock().gen_range(0..4);
            match roll {
                0 => Ok(Location {
                    page: 2,
                    address: None,
                    fraction: 0.1,
                }),
                1 => Err(NavFailure::Boundary(Boundary::End)),
                2 => Err(NavFailure::Engine("broken package".into())),
                _ => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl RendererAdapter for ChaosAdapter {
        fn format(&self) -> DocumentFormat {
            DocumentFormat::Reflowable
        }
        async fn next(&self) -> Result<Location, NavFailure> {
            self.roll().await
        }
        async fn prev(&self) -> Result<Location, NavFailure> {
            self.roll().await
        }
        async fn go_to(&self, _target: NavTarget) -> Result<Location, NavFailure> {
            self.roll().await
        }
        fn current_location(&self) -> Location {
            Location {
                page: 1,
                address: None,
                fraction: 0.0,
            }
        }
        fn total_pages(&self) -> Option<u32> {
            None
        }
        fn show_highlight(&self, _highlight: &Highlight) -> anyhow::Result<()> {
            Ok(())
        }
        fn hide_highlight(&self, _highlight: &Highlight) -> anyhow::Result<()> {
            Ok(())
        }
        fn apply_theme(&self, _theme: &ThemeParams) -> anyhow::Result<()> {
            Ok(())
        }
        async fn teardown(&self) {}
    }

    fn chaos(seed: u64) -> ChaosAdapter {
        ChaosAdapter {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_left_turning_under_forced_timeouts() {
        let bus = EventBus::new();
        let navigator = Navigator::new(bus.clone(), Duration::from_millis(500));
        let adapter = chaos(7);
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let command = match rng.gen_range(0..3) {
                0 => NavCommand::Next,
                1 => NavCommand::Prev,
                _ => NavCommand::Scrub(rng.gen()),
            };
            let started = tokio::time::Instant::now();
            let outcome = navigator.turn(&adapter, command).await;
            assert!(started.elapsed() <= Duration::from_millis(500));
            assert!(!navigator.state().is_turning(), "stuck after {outcome:?}");
        }
        let events = bus.drain();
        let started = events.iter().filter(|e| **e == ReaderEvent::TurnStarted).count();
        let finished = events.iter().filter(|e| **e == ReaderEvent::TurnFinished).count();
        assert_eq!(started, 200);
        assert_eq!(finished, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_turn_is_rejected_not_queued() {
        let bus = EventBus::new();
        let navigator = Navigator::new(bus.clone(), Duration::from_millis(500));
        let hanging = HangingAdapter;

        let (first, second) = tokio::join!(
            navigator.turn(&hanging, NavCommand::Next),
            navigator.turn(&hanging, NavCommand::Prev)
        );
        assert!(matches!(first, NavOutcome::Failed(_)));
        assert_eq!(second, NavOutcome::Busy);
        assert!(bus.drain().iter().any(|event| matches!(
            event,
            ReaderEvent::Notice(notice) if notice.kind == NoticeKind::Busy
        )));
        assert!(matches!(navigator.state(), NavState::IdleError(_)));
    }

    struct HangingAdapter;

    #[async_trait]
    impl RendererAdapter for HangingAdapter {
        fn format(&self) -> DocumentFormat {
            DocumentFormat::FixedLayout
        }
        async fn next(&self) -> Result<Location, NavFailure> {
            std::future::pending().await
        }
        async fn prev(&self) -> Result<Location, NavFailure> {
            std::future::pending().await
        }
        async fn go_to(&self, _target: NavTarget) -> Result<Location, NavFailure> {
            std::future::pending().await
        }
        fn current_location(&self) -> Location {
            Location {
                page: 1,
                address: None,
                fraction: 0.0,
            }
        }
        fn total_pages(&self) -> Option<u32> {
            Some(1)
        }
        fn show_highlight(&self, _highlight: &Highlight) -> anyhow::Result<()> {
            Ok(())
        }
        fn hide_highlight(&self, _highlight: &Highlight) -> anyhow::Result<()> {
            Ok(())
        }
        fn apply_theme(&self, _theme: &ThemeParams) -> anyhow::Result<()> {
            Ok(())
        }
        async fn teardown(&self) {}
    }

    #[tokio::test]
    async fn dropped_turn_resets_state() {
        let navigator = Navigator::new(EventBus::new(), Duration::from_secs(60));
        let hanging = HangingAdapter;
        {
            let turn = navigator.turn(&hanging, NavCommand::Prev);
            tokio::pin!(turn);
            assert!(poll_once(turn.as_mut()).await);
            assert!(navigator.state().is_turning());
        }
        assert_eq!(navigator.state(), NavState::Idle);
    }

    /// Polls once and reports whether the future was still pending.
    async fn poll_once<F: Future + Unpin>(mut future: F) -> bool {
        std::future::poll_fn(|cx| Poll::Ready(Future::poll(Pin::new(&mut future), cx).is_pending()))
            .await
    }

    #[test]
    fn swipe_needs_distance_and_speed() {
        let mut swipe = SwipeDetector::new(50.0, Duration::from_millis(600));
        let t0 = Instant::now();

        swipe.pointer_down(300.0, 100.0, t0);
        assert_eq!(
            swipe.pointer_up(200.0, 110.0, t0 + Duration::from_millis(200)),
            Some(NavCommand::Next)
        );

        swipe.pointer_down(100.0, 100.0, t0);
        assert_eq!(
            swipe.pointer_up(180.0, 100.0, t0 + Duration::from_millis(100)),
            Some(NavCommand::Prev)
        );

        swipe.pointer_down(100.0, 100.0, t0);
        assert_eq!(swipe.pointer_up(130.0, 100.0, t0 + Duration::from_millis(100)), None);

        swipe.pointer_down(100.0, 100.0, t0);
        assert_eq!(swipe.pointer_up(300.0, 100.0, t0 + Duration::from_secs(2)), None);

        swipe.pointer_down(100.0, 100.0, t0);
        assert_eq!(swipe.pointer_up(160.0, 300.0, t0 + Duration::from_millis(100)), None);

        assert_eq!(swipe.pointer_up(10.0, 100.0, t0), None);
    }

    #[test]
    fn scrub_bar_only_navigates_on_commit() {
        let mut bar = ScrubBar::default();
        assert_eq!(bar.commit(), None);
        bar.drag(0.3);
        bar.drag(1.7);
        assert_eq!(bar.preview(), Some(1.0));
        assert_eq!(bar.commit(), Some(NavCommand::Scrub(1.0)));
        assert_eq!(bar.preview(), None);
    }
}
