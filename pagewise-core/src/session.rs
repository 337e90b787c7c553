//! The reading session: one open document, one mounted renderer.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::adapter::{
    FixedLayoutAdapter, FixedLayoutOptions, MountedAdapter, NavTarget, ReflowableAdapter,
    RendererAdapter,
};
use crate::annotation::{AnnotationMapper, AnnotationReplica, NativeSelection, SelectionCapture};
use crate::config::ReaderConfig;
use crate::engine::{EngineProvider, TextSelection};
use crate::error::{ReaderError, ReaderResult};
use crate::events::{EventBus, FallbackReason, NoticeKind, ReaderEvent};
use crate::format::{self, FormatResolution, FormatSource};
use crate::geometry::Size;
use crate::model::{
    local_record_id, Bookmark, DocumentFormat, DocumentId, Highlight, HighlightColor,
    NewBookmark, NewNote, Note, PendingSave, Position, RecordId, SessionState,
};
use crate::navigation::{NavCommand, NavOutcome, NavState, Navigator};
use crate::position::{Origin, PositionCache, PositionStore};
use crate::preferences::{PreferencesStore, ReaderPreferences, Theme, ViewMode};
use crate::service::ProgressService;
use crate::sync::{retry_with_backoff, ProgressSaveQueue, Reconciler, SyncStatus};

const MIN_FONT_SCALE: f32 = 0.5;
const MAX_FONT_SCALE: f32 = 3.0;

/// Per-session state handed explicitly to the components that need it.
pub struct SessionContext {
    pub document: DocumentId,
    pub config: ReaderConfig,
    pub bus: EventBus,
    pub positions: Arc<PositionStore>,
    pub saves: ProgressSaveQueue,
    pub service: Arc<dyn ProgressService>,
}

pub struct SessionDeps {
    pub service: Arc<dyn ProgressService>,
    pub positions: Arc<dyn PositionCache>,
    pub preferences: Arc<dyn PreferencesStore>,
    pub engines: Arc<dyn EngineProvider>,
    pub config: ReaderConfig,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub format_override: Option<DocumentFormat>,
    pub viewport: Size,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NextPage,
    PrevPage,
    GotoPage(u32),
    /// Scrub-bar commit.
    Scrub(f64),
    JumpToBookmark(RecordId),
    AddBookmark { label: Option<String> },
    DeleteBookmark(RecordId),
    AddNote { content: String },
    DeleteNote(RecordId),
    /// Pointer-up over the fixed-layout text layer.
    CaptureFixedSelection(NativeSelection),
    ConfirmHighlight { color: HighlightColor },
    DismissSelection,
    DeleteHighlight(RecordId),
    SetZoom(f32),
    ScaleBy(f32),
    SetViewMode(ViewMode),
    ToggleViewMode,
    SetTheme(Theme),
    CycleTheme,
    SetFontScale(f32),
    SetViewport(Size),
    OverrideFormat(DocumentFormat),
    ToggleFormat,
    SaveNow,
}

pub struct ReadingSession {
    ctx: SessionContext,
    engines: Arc<dyn EngineProvider>,
    preference_store: Arc<dyn PreferencesStore>,
    preferences: ReaderPreferences,
    content: Bytes,
    hint: Option<DocumentFormat>,
    total_pages: Option<u32>,
    resolution: FormatResolution,
    adapter: Option<MountedAdapter>,
    navigator: Navigator,
    mapper: AnnotationMapper,
    replica: AnnotationReplica,
    selection: Option<SelectionCapture>,
    viewport: Size,
    fallback: Option<FallbackReason>,
    outbox: VecDeque<ReaderEvent>,
    autosave: Option<JoinHandle<()>>,
}

impl ReadingSession {
    /// Opens `document`: resolves its format, reconciles the position once,
    /// mounts a renderer and shows the starting page.
    #[instrument(skip(deps, options), fields(document = %document))]
    pub async fn open(
        document: DocumentId,
        deps: SessionDeps,
        options: SessionOptions,
    ) -> ReaderResult<Self> {
        let SessionDeps {
            service,
            positions: cache,
            preferences: preference_store,
            engines,
            config,
        } = deps;

        let opening = service
            .open_session(&document)
            .await
            .context("failed to open the reading session")?;
        let content = service
            .fetch_document(&document)
            .await
            .context("failed to fetch the document")?;
        let hint = opening.format.as_deref().and_then(DocumentFormat::from_hint);
        let resolution = format::resolve(&content, hint, options.format_override)?;

        let state = match service.get_session_state(&document).await {
            Ok(state) => state,
            Err(err) => {
                warn!(?err, "session state unavailable, continuing without annotations");
                SessionState::default()
            }
        };
        let remote = state
            .position
            .clone()
            .unwrap_or_else(|| opening.progress.clone());

        let bus = EventBus::new();
        let saves = ProgressSaveQueue::new(
            document.clone(),
            Arc::clone(&service),
            config.retry_policy(),
            bus.clone(),
        );
        let reconciler = Reconciler::new(config.reconcile_tolerance);
        let start = match reconciler.run(&document, cache.as_ref(), &saves, Some(&remote)) {
            Ok(Some(outcome)) => outcome.position,
            Ok(None) => remote,
            Err(err) => {
                warn!(?err, "local position cache unreadable, starting from remote");
                remote
            }
        };

        let preferences = match preference_store.load() {
            Ok(preferences) => preferences.unwrap_or_default(),
            Err(err) => {
                warn!(?err, "failed to load preferences, using defaults");
                ReaderPreferences::default()
            }
        };

        let mut session = Self {
            navigator: Navigator::new(bus.clone(), config.nav_timeout),
            mapper: AnnotationMapper::new(config.excerpt_limit, config.min_selection_px),
            ctx: SessionContext {
                positions: Arc::new(PositionStore::new(document.clone(), cache, start)),
                document,
                config,
                bus,
                saves,
                service,
            },
            engines,
            preference_store,
            preferences,
            content,
            hint,
            total_pages: opening.total_pages,
            resolution,
            adapter: None,
            replica: AnnotationReplica::hydrate(&state),
            selection: None,
            viewport: options.viewport,
            fallback: None,
            outbox: VecDeque::new(),
            autosave: None,
        };
        session.mount(resolution, None).await?;
        session.start_autosave();
        info!(format = %session.format(), page = session.position().page, "reading session opened");
        Ok(session)
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn format(&self) -> DocumentFormat {
        self.resolution.format
    }

    pub fn resolution(&self) -> FormatResolution {
        self.resolution
    }

    pub fn position(&self) -> Position {
        self.ctx.positions.current()
    }

    pub fn preferences(&self) -> &ReaderPreferences {
        &self.preferences
    }

    pub fn annotations(&self) -> &AnnotationReplica {
        &self.replica
    }

    pub fn adapter(&self) -> Option<&MountedAdapter> {
        self.adapter.as_ref()
    }

    pub fn pending_selection(&self) -> Option<&SelectionCapture> {
        self.selection.as_ref()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.ctx.saves.status()
    }

    pub fn nav_state(&self) -> NavState {
        self.navigator.state()
    }

    /// Set once the fixed-layout renderer gave up; the caller should show
    /// the raw asset through a generic viewer.
    pub fn fallback(&self) -> Option<FallbackReason> {
        self.fallback
    }

    pub fn viewport(&self) -> Size {
        self.viewport
    }

    /// The raw document bytes, for handing to an external viewer.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    async fn open_adapter(&self, format: DocumentFormat) -> ReaderResult<MountedAdapter> {
        let bus = self.ctx.bus.clone();
        let config = &self.ctx.config;
        match format {
            DocumentFormat::Reflowable => {
                let engine = self
                    .engines
                    .open_reflowable(self.content.clone())
                    .await
                    .context("failed to open the reflowable engine")?;
                let adapter =
                    ReflowableAdapter::mount(engine, bus, self.total_pages, config.engine_timeout);
                if let Err(err) = adapter.apply_theme(&self.preferences.theme_params()) {
                    warn!(?err, "failed to apply theme");
                }
                Ok(MountedAdapter::Reflowable(adapter))
            }
            DocumentFormat::FixedLayout => {
                let engine = self
                    .engines
                    .open_fixed_layout(self.content.clone())
                    .await
                    .context("failed to open the fixed-layout engine")?;
                let adapter = FixedLayoutAdapter::mount(
                    engine,
                    bus,
                    FixedLayoutOptions {
                        render_timeout: config.render_timeout,
                        blank_ratio: config.blank_ratio,
                        viewport: self.viewport,
                        zoom: self.preferences.zoom,
                        view_mode: self.preferences.view_mode,
                        dark_mode: self.preferences.theme == Theme::Dark,
                    },
                );
                Ok(MountedAdapter::FixedLayout(adapter))
            }
            DocumentFormat::Unknown => Err(ReaderError::FormatUnresolved),
        }
    }

    /// Tears down the current adapter, if any, and mounts one for
    /// `resolution`. A declared format that the engine rejects falls back
    /// to the sniffed one.
    async fn mount(
        &mut self,
        mut resolution: FormatResolution,
        target: Option<NavTarget>,
    ) -> ReaderResult<()> {
        if let Some(previous) = self.adapter.take() {
            previous.as_dyn().teardown().await;
        }
        self.selection = None;
        self.fallback = None;

        let adapter = match self.open_adapter(resolution.format).await {
            Ok(adapter) => adapter,
            Err(err) if resolution.source == FormatSource::Hint => {
                let sniffed = FormatResolution {
                    format: format::sniff(&self.content),
                    source: FormatSource::Sniffed,
                };
                match format::needs_remount(Some(resolution.format), &sniffed) {
                    Some(other) if other != DocumentFormat::Unknown => {
                        warn!(declared = %resolution.format, sniffed = %other, error = %err, "declared format rejected by engine");
                        let adapter = self.open_adapter(other).await?;
                        self.ctx.bus.notice(NoticeKind::Info, format::remount_notice(other));
                        resolution = sniffed;
                        adapter
                    }
                    _ => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        self.resolution = resolution;
        for highlight in &self.replica.highlights {
            if let Err(err) = adapter.as_dyn().show_highlight(highlight) {
                warn!(id = %highlight.id, ?err, "failed to restore highlight overlay");
            }
        }
        self.adapter = Some(adapter.clone());

        let position = self.ctx.positions.current();
        let target = target.unwrap_or_else(|| target_for(&position, resolution.format));
        let outcome = self
            .navigator
            .turn(adapter.as_dyn(), NavCommand::GoTo(target))
            .await;
        self.absorb_events();
        match outcome {
            NavOutcome::Moved(location) => {
                self.ctx.positions.record(&location, Origin::Navigation);
            }
            other => warn!(?other, "could not display the starting position"),
        }
        Ok(())
    }

    fn start_autosave(&mut self) {
        let positions = Arc::clone(&self.ctx.positions);
        let saves = self.ctx.saves.clone();
        let period = self.ctx.config.autosave_interval;
        let mut last_saved = positions.current();
        self.autosave = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let current = positions.current();
                if current != last_saved {
                    debug!(page = current.page, "autosave");
                    saves.enqueue(PendingSave::background(&current));
                    last_saved = current;
                }
            }
        }));
    }

    /// Drains the bus: relocations are applied in emission order, every
    /// event is kept for [`pump_events`](Self::pump_events). Returns the
    /// position if it moved.
    fn absorb_events(&mut self) -> Option<Position> {
        let mut changed = None;
        for event in self.ctx.bus.drain() {
            match &event {
                ReaderEvent::Relocated(location) => {
                    if let Some(position) = self.ctx.positions.record(location, Origin::Engine) {
                        changed = Some(position);
                    }
                }
                ReaderEvent::Selected(selection) => self.capture_reflowable(selection),
                ReaderEvent::Degraded(reason) => {
                    warn!(?reason, "renderer degraded, raw asset fallback required");
                    self.fallback = Some(*reason);
                }
                _ => {}
            }
            self.outbox.push_back(event);
        }
        changed
    }

    fn capture_reflowable(&mut self, selection: &TextSelection) {
        let page = self.ctx.positions.current().page;
        match self.mapper.capture_reflowable(selection, page, self.viewport) {
            Ok(capture) => self.selection = Some(capture),
            Err(err) => {
                debug!(%err, "ignoring empty selection");
                self.selection = None;
            }
        }
    }

    /// Events for the front-end, oldest first.
    pub fn pump_events(&mut self) -> Vec<ReaderEvent> {
        if let Some(position) = self.absorb_events() {
            self.ctx.saves.enqueue(PendingSave::background(&position));
        }
        self.outbox.drain(..).collect()
    }

    pub async fn navigate(&mut self, command: NavCommand) -> NavOutcome {
        let Some(adapter) = self.adapter.clone() else {
            return NavOutcome::Failed(ReaderError::NotMounted.to_string());
        };
        let outcome = self.navigator.turn(adapter.as_dyn(), command).await;
        let mut changed = self.absorb_events();
        if let NavOutcome::Moved(location) = &outcome {
            self.selection = None;
            if let Some(position) = self.ctx.positions.record(location, Origin::Navigation) {
                changed = Some(position);
            }
        }
        if let Some(position) = changed {
            self.ctx.saves.enqueue(PendingSave::background(&position));
        }
        outcome
    }

    #[instrument(skip(self), fields(document = %self.ctx.document))]
    pub async fn apply(&mut self, command: Command) -> ReaderResult<()> {
        match command {
            Command::NextPage => {
                self.navigate(NavCommand::Next).await;
            }
            Command::PrevPage => {
                self.navigate(NavCommand::Prev).await;
            }
            Command::GotoPage(page) => {
                self.navigate(NavCommand::GoTo(NavTarget::Page(page))).await;
            }
            Command::Scrub(fraction) => {
                self.navigate(NavCommand::Scrub(fraction)).await;
            }
            Command::JumpToBookmark(id) => self.jump_to_bookmark(&id).await?,
            Command::AddBookmark { label } => {
                self.add_bookmark(label).await?;
            }
            Command::DeleteBookmark(id) => self.delete_bookmark(&id).await?,
            Command::AddNote { content } => {
                self.add_note(content).await?;
            }
            Command::DeleteNote(id) => self.delete_note(&id).await?,
            Command::CaptureFixedSelection(selection) => self.capture_fixed(&selection)?,
            Command::ConfirmHighlight { color } => {
                self.confirm_highlight(color).await?;
            }
            Command::DismissSelection => self.selection = None,
            Command::DeleteHighlight(id) => self.delete_highlight(&id).await?,
            Command::SetZoom(zoom) => {
                if self.preferences.set_zoom(zoom) {
                    self.preferences_changed().await;
                }
            }
            Command::ScaleBy(factor) => {
                if self.preferences.set_zoom(self.preferences.zoom * factor) {
                    self.preferences_changed().await;
                }
            }
            Command::SetViewMode(mode) => self.set_view_mode(mode).await,
            Command::ToggleViewMode => {
                let mode = self.preferences.view_mode.toggled();
                self.set_view_mode(mode).await;
            }
            Command::SetTheme(theme) => self.set_theme(theme).await,
            Command::CycleTheme => {
                let theme = self.preferences.theme.next();
                self.set_theme(theme).await;
            }
            Command::SetFontScale(scale) => {
                let scale = scale.clamp(MIN_FONT_SCALE, MAX_FONT_SCALE);
                if (self.preferences.font_scale - scale).abs() > f32::EPSILON {
                    self.preferences.font_scale = scale;
                    self.preferences_changed().await;
                }
            }
            Command::SetViewport(viewport) => {
                self.viewport = viewport;
                if let Some(fixed) = self.adapter.as_ref().and_then(MountedAdapter::fixed_layout) {
                    fixed.set_viewport(viewport);
                }
                self.relayout().await;
            }
            Command::OverrideFormat(format) => self.override_format(format).await?,
            Command::ToggleFormat => {
                if let Some(other) = self.format().opposite() {
                    self.override_format(other).await?;
                }
            }
            Command::SaveNow => {
                let position = self.ctx.positions.current();
                self.ctx.saves.enqueue(PendingSave::interactive(&position));
            }
        }
        Ok(())
    }

    async fn jump_to_bookmark(&mut self, id: &str) -> ReaderResult<()> {
        let bookmark = self
            .replica
            .bookmark(id)
            .cloned()
            .ok_or_else(|| ReaderError::UnknownRecord(id.to_owned()))?;
        let target = match (self.format(), bookmark.location_address) {
            (DocumentFormat::Reflowable, Some(address)) => NavTarget::Address(address),
            _ => NavTarget::Page(bookmark.page),
        };
        self.navigate(NavCommand::GoTo(target)).await;
        Ok(())
    }

    /// Retries a write with the session's policy; the reader sees the
    /// failure once retries are exhausted.
    async fn persist<T, F, Fut>(&self, label: &str, op: F) -> ReaderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let result = retry_with_backoff(&self.ctx.config.retry_policy(), label, op).await;
        if let Err(err) = &result {
            self.ctx.bus.notice(NoticeKind::Error, err.to_string());
        }
        result
    }

    pub async fn add_bookmark(&mut self, label: Option<String>) -> ReaderResult<Bookmark> {
        let position = self.ctx.positions.current();
        let draft = NewBookmark {
            page: position.page,
            location_address: position.location_address.clone(),
            label: label
                .filter(|label| !label.trim().is_empty())
                .unwrap_or_else(|| format!("Page {}", position.page)),
        };
        let local_id = local_record_id();
        self.replica.insert_bookmark(draft.clone().with_id(local_id.clone()));

        let service = Arc::clone(&self.ctx.service);
        let document = self.ctx.document.clone();
        match self
            .persist("bookmark", || service.create_bookmark(&document, &draft))
            .await
        {
            Ok(created) => {
                self.replica.confirm_bookmark(&local_id, created.clone());
                self.ctx.bus.notice(NoticeKind::Confirmation, "Bookmark added");
                Ok(created)
            }
            Err(err) => {
                self.replica.remove_bookmark(&local_id);
                Err(err)
            }
        }
    }

    async fn delete_bookmark(&mut self, id: &str) -> ReaderResult<()> {
        let removed = self
            .replica
            .remove_bookmark(id)
            .ok_or_else(|| ReaderError::UnknownRecord(id.to_owned()))?;
        let service = Arc::clone(&self.ctx.service);
        let document = self.ctx.document.clone();
        if let Err(err) = self
            .persist("bookmark", || service.delete_bookmark(&document, id))
            .await
        {
            self.replica.insert_bookmark(removed);
            return Err(err);
        }
        self.ctx.bus.notice(NoticeKind::Confirmation, "Bookmark removed");
        Ok(())
    }

    pub async fn add_note(&mut self, content: String) -> ReaderResult<Note> {
        let draft = NewNote {
            page: self.ctx.positions.current().page,
            content,
        };
        let local_id = local_record_id();
        self.replica.insert_note(draft.clone().with_id(local_id.clone()));

        let service = Arc::clone(&self.ctx.service);
        let document = self.ctx.document.clone();
        match self
            .persist("note", || service.create_note(&document, &draft))
            .await
        {
            Ok(created) => {
                self.replica.confirm_note(&local_id, created.clone());
                self.ctx.bus.notice(NoticeKind::Confirmation, "Note saved");
                Ok(created)
            }
            Err(err) => {
                self.replica.remove_note(&local_id);
                Err(err)
            }
        }
    }

    async fn delete_note(&mut self, id: &str) -> ReaderResult<()> {
        let removed = self
            .replica
            .remove_note(id)
            .ok_or_else(|| ReaderError::UnknownRecord(id.to_owned()))?;
        let service = Arc::clone(&self.ctx.service);
        let document = self.ctx.document.clone();
        if let Err(err) = self
            .persist("note", || service.delete_note(&document, id))
            .await
        {
            self.replica.insert_note(removed);
            return Err(err);
        }
        Ok(())
    }

    fn capture_fixed(&mut self, selection: &NativeSelection) -> ReaderResult<()> {
        let adapter = self.adapter.as_ref().ok_or(ReaderError::NotMounted)?;
        let Some(fixed) = adapter.fixed_layout() else {
            debug!("native selection ignored by the reflowable renderer");
            return Ok(());
        };
        match self
            .mapper
            .capture_fixed(selection, &fixed.page_layers(), self.viewport)
        {
            Ok(capture) => self.selection = Some(capture),
            Err(ReaderError::SelectionEmpty) => {
                debug!("selection had no usable rectangles");
                self.selection = None;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Overlays the pending selection immediately, then persists it. A
    /// failed create removes the overlay and the local record again.
    pub async fn confirm_highlight(&mut self, color: HighlightColor) -> ReaderResult<Highlight> {
        let capture = self.selection.take().ok_or(ReaderError::SelectionEmpty)?;
        let adapter = self.adapter.clone().ok_or(ReaderError::NotMounted)?;
        let draft = capture.to_highlight(color)?;
        let optimistic = draft.clone().with_id(local_record_id());

        self.replica.insert_highlight(optimistic.clone());
        if let Err(err) = adapter.as_dyn().show_highlight(&optimistic) {
            warn!(?err, "failed to overlay highlight");
        }

        let service = Arc::clone(&self.ctx.service);
        let document = self.ctx.document.clone();
        let result = self
            .persist("highlight", || service.create_highlight(&document, &draft))
            .await;

        let renderer = adapter.as_dyn();
        if let Err(err) = renderer.hide_highlight(&optimistic) {
            warn!(?err, "failed to clear optimistic highlight");
        }
        match result {
            Ok(created) => {
                self.replica.confirm_highlight(&optimistic.id, created.clone());
                if let Err(err) = renderer.show_highlight(&created) {
                    warn!(?err, "failed to overlay highlight");
                }
                Ok(created)
            }
            Err(err) => {
                self.replica.remove_highlight(&optimistic.id);
                Err(err)
            }
        }
    }

    async fn delete_highlight(&mut self, id: &str) -> ReaderResult<()> {
        let removed = self
            .replica
            .remove_highlight(id)
            .ok_or_else(|| ReaderError::UnknownRecord(id.to_owned()))?;
        let adapter = self.adapter.clone();
        if let Some(adapter) = &adapter {
            if let Err(err) = adapter.as_dyn().hide_highlight(&removed) {
                warn!(?err, "failed to clear highlight overlay");
            }
        }

        let service = Arc::clone(&self.ctx.service);
        let document = self.ctx.document.clone();
        if let Err(err) = self
            .persist("highlight", || service.delete_highlight(&document, id))
            .await
        {
            if let Some(adapter) = &adapter {
                if let Err(err) = adapter.as_dyn().show_highlight(&removed) {
                    warn!(?err, "failed to restore highlight overlay");
                }
            }
            self.replica.insert_highlight(removed);
            return Err(err);
        }
        Ok(())
    }

    async fn set_view_mode(&mut self, mode: ViewMode) {
        if self.preferences.view_mode != mode {
            self.preferences.view_mode = mode;
            self.preferences_changed().await;
        }
    }

    async fn set_theme(&mut self, theme: Theme) {
        if self.preferences.theme != theme {
            self.preferences.theme = theme;
            self.preferences_changed().await;
        }
    }

    /// Persists preferences and pushes them into the mounted renderer.
    async fn preferences_changed(&mut self) {
        if let Err(err) = self.preference_store.save(&self.preferences) {
            warn!(?err, "failed to save preferences");
        }
        let Some(adapter) = self.adapter.clone() else {
            return;
        };
        if let Err(err) = adapter.as_dyn().apply_theme(&self.preferences.theme_params()) {
            warn!(?err, "failed to apply theme");
        }
        if let Some(fixed) = adapter.fixed_layout() {
            fixed.set_zoom(self.preferences.zoom);
            fixed.set_view_mode(self.preferences.view_mode);
        }
        self.relayout().await;
    }

    /// Re-renders the fixed-layout page in place.
    async fn relayout(&mut self) {
        let Some(page) = self
            .adapter
            .as_ref()
            .and_then(MountedAdapter::fixed_layout)
            .map(|fixed| fixed.current_page())
        else {
            return;
        };
        self.navigate(NavCommand::GoTo(NavTarget::Page(page))).await;
    }

    #[instrument(skip(self))]
    async fn override_format(&mut self, format: DocumentFormat) -> ReaderResult<()> {
        let resolution = format::resolve(&self.content, self.hint, Some(format))?;
        let mounted = self.adapter.as_ref().map(MountedAdapter::format);
        let Some(target) = format::needs_remount(mounted, &resolution) else {
            return Ok(());
        };
        info!(from = ?mounted, to = %target, "remounting renderer");
        let fraction = self.ctx.positions.current().fraction();
        self.mount(resolution, Some(NavTarget::Fraction(fraction)))
            .await?;
        self.ctx.bus.notice(NoticeKind::Info, format::remount_notice(target));
        Ok(())
    }

    /// Best-effort save when the front-end goes away without closing.
    pub fn unload(&self) {
        let position = self.ctx.positions.current();
        self.ctx.saves.enqueue(PendingSave::background(&position));
    }

    /// Waits for outstanding saves, bounded by the unload flush window.
    pub async fn flush(&self) -> bool {
        timeout(self.ctx.config.unload_flush, self.ctx.saves.flush())
            .await
            .is_ok()
    }

    /// Cancels autosave, flushes a final save and releases the renderer.
    #[instrument(skip(self), fields(document = %self.ctx.document))]
    pub async fn close(mut self) {
        if let Some(task) = self.autosave.take() {
            task.abort();
        }
        self.unload();
        if !self.flush().await {
            warn!("final progress save did not finish before teardown");
        }
        if let Some(adapter) = self.adapter.take() {
            adapter.as_dyn().teardown().await;
        }
        if let Err(err) = self.preference_store.save(&self.preferences) {
            warn!(?err, "failed to save preferences");
        }
        info!("reading session closed");
    }
}

impl Drop for ReadingSession {
    fn drop(&mut self) {
        if let Some(task) = self.autosave.take() {
            task.abort();
        }
    }
}

/// Where to display a stored position in a freshly mounted renderer.
fn target_for(position: &Position, format: DocumentFormat) -> NavTarget {
    match (format, &position.location_address) {
        (DocumentFormat::Reflowable, Some(address)) => NavTarget::Address(address.clone()),
        (DocumentFormat::Reflowable, None) if position.percent > 0.0 => {
            NavTarget::Fraction(position.fraction())
        }
        _ => NavTarget::Page(position.page),
    }
}
