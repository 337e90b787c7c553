use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use pagewise_core::config::config_path;
use pagewise_core::{
    Command, ConfigFile, DocumentFormat, DocumentId, FallbackReason, FilePositionCache,
    FilePreferencesStore, Notice, NoticeKind, PreferencesStore, ProgressService, ReaderConfig,
    ReaderError, ReaderEvent, ReadingSession, ReflowableEngine, Rect, RenderedPage,
    SelectionCapture, SessionDeps, SessionOptions, Size, Theme, ViewMode,
};
use pagewise_render::RenderEngines;
use pagewise_tty::{
    compose_frame, paint_overlays, paint_selection, select_spans, write_status_line,
    write_text_page, DrawParams, EventMapper, KittyRenderer, StatusLine, UiEvent,
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

mod fallback;
mod local;
mod remote;

use fallback::{fallback_text, RawAsset, RawAssetViewer};
use local::FileProgressService;
use remote::HttpProgressService;

const SELECT_SPANS: usize = 3;
const SELECT_CHARS: usize = 240;

#[derive(Debug, Parser)]
#[command(
    name = "pagewise",
    version,
    about = "Terminal reader for EPUB and PDF that keeps your place in sync"
)]
struct Args {
    /// Local EPUB or PDF to read
    #[arg(required_unless_present = "server")]
    file: Option<PathBuf>,

    /// Read as this format regardless of what the document declares
    /// (epub, pdf)
    #[arg(long)]
    format: Option<String>,

    /// Progress service base URL; without it progress is kept locally
    #[arg(long, requires = "document_id")]
    server: Option<String>,

    /// Document id on the progress service
    #[arg(long = "document-id")]
    document_id: Option<String>,

    /// Bearer token for the progress service
    #[arg(long)]
    token: Option<String>,

    /// Config file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Open fixed-layout documents in two-page spreads
    #[arg(long)]
    spread: bool,

    /// Seconds between background position saves
    #[arg(long = "autosave-secs")]
    autosave_secs: Option<u64>,

    /// Pages of local/remote divergence tolerated at open
    #[arg(long)]
    tolerance: Option<u32>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        crossterm::execute!(stdout, cursor::Hide, EnableMouseCapture)?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, DisableMouseCapture, cursor::Show);
        let _ = terminal::disable_raw_mode();
    }
}

/// Terminal geometry in cells and pixels. The last row holds the status
/// line.
#[derive(Debug, Clone, Copy)]
struct Screen {
    columns: u16,
    rows: u16,
    cell: (f64, f64),
}

impl Screen {
    fn query() -> Result<Self> {
        let window = terminal::window_size()?;
        Ok(Self::from_window(
            window.columns,
            window.rows,
            window.width,
            window.height,
        ))
    }

    fn from_window(columns: u16, rows: u16, width: u16, height: u16) -> Self {
        let columns = columns.max(1);
        let rows = rows.max(2);
        let cell = if width > 0 && height > 0 {
            (
                f64::from(width) / f64::from(columns),
                f64::from(height) / f64::from(rows),
            )
        } else {
            (8.0, 16.0)
        };
        Self {
            columns,
            rows,
            cell,
        }
    }

    fn content_rows(&self) -> u16 {
        self.rows - 1
    }

    fn viewport(&self) -> Size {
        Size::new(
            f64::from(self.columns) * self.cell.0,
            f64::from(self.content_rows()) * self.cell.1,
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "pagewise", "pagewise")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&args)?;

    let (document, service) = connect(&args, &project_dirs)?;
    let data_dir = project_dirs.data_local_dir();
    let positions = Arc::new(FilePositionCache::new(data_dir.join("positions"))?);
    let preferences = Arc::new(FilePreferencesStore::new(
        project_dirs.config_dir().join("preferences.json"),
    )?);
    if args.spread {
        seed_spread_preference(&preferences)?;
    }
    let engines = Arc::new(RenderEngines::new());

    let mut screen = Screen::query()?;
    let format_override = match args.format.as_deref() {
        Some(hint) => Some(
            DocumentFormat::from_hint(hint)
                .ok_or_else(|| anyhow!("unsupported format {hint:?}; use epub or pdf"))?,
        ),
        None => None,
    };

    let mut session = ReadingSession::open(
        document.clone(),
        SessionDeps {
            service,
            positions,
            preferences,
            engines: engines.clone(),
            config: config.clone(),
        },
        SessionOptions {
            format_override,
            viewport: screen.viewport(),
        },
    )
    .await
    .with_context(|| format!("failed to open document {document}"))?;

    let _raw = RawModeGuard::new()?;
    let mut renderer = KittyRenderer::new(io::stdout());
    let mut mapper = EventMapper::new(config.swipe_min_distance, config.swipe_max_duration);
    mapper.set_cell_size(screen.cell.0, screen.cell.1);
    let mut ui = UiState::new(RawAssetViewer::new(raw_asset(
        &args,
        &project_dirs,
        &document,
        &session,
    )));
    renderer.clear_all()?;
    let mut dirty = true;

    loop {
        for event in session.pump_events() {
            dirty |= ui.absorb(event);
        }

        if dirty {
            redraw(&mut renderer, &session, &screen, &ui, &mapper)?;
            dirty = false;
        }

        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let ui_event = mapper.map_event(event::read()?);
        match handle_event(ui_event, &mut session, &engines, &mut screen, &mut ui).await {
            LoopAction::Continue => {}
            LoopAction::ContinueRedraw => dirty = true,
            LoopAction::Quit => break,
        }
        if mapper.pending_input().is_some() {
            dirty = true;
        }
        mapper.set_cell_size(screen.cell.0, screen.cell.1);
    }

    renderer.delete_image()?;
    renderer.clear_all()?;
    session.close().await;
    info!("reader closed");
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

/// Front-end state that is not part of the session.
struct UiState {
    notice: Option<Notice>,
    message: Option<String>,
    viewer: RawAssetViewer,
}

impl UiState {
    fn new(viewer: RawAssetViewer) -> Self {
        Self {
            notice: None,
            message: None,
            viewer,
        }
    }

    /// Returns whether the event changes what is on screen.
    fn absorb(&mut self, event: ReaderEvent) -> bool {
        match event {
            ReaderEvent::Notice(notice) => {
                self.message = None;
                self.notice = Some(notice);
                true
            }
            ReaderEvent::Degraded(reason) => {
                warn!(?reason, "renderer degraded, handing off to the system viewer");
                self.message = None;
                self.notice = Some(Notice {
                    kind: NoticeKind::Info,
                    message: self.viewer.present_or_log(reason),
                });
                true
            }
            ReaderEvent::Relocated(_)
            | ReaderEvent::Selected(_)
            | ReaderEvent::RenderComplete { .. }
            | ReaderEvent::TurnStarted
            | ReaderEvent::TurnFinished => true,
        }
    }

    fn report(&mut self, err: &ReaderError) {
        self.notice = None;
        self.message = Some(err.to_string());
    }

    fn fallback_page(
        &self,
        reason: FallbackReason,
        pages: &[Arc<RenderedPage>],
        visible: &[u32],
    ) -> String {
        fallback_text(reason, pages, visible, self.viewer.opened())
    }
}

async fn handle_event(
    event: UiEvent,
    session: &mut ReadingSession,
    engines: &RenderEngines,
    screen: &mut Screen,
    ui: &mut UiState,
) -> LoopAction {
    let result = match event {
        UiEvent::None => return LoopAction::Continue,
        UiEvent::Quit => return LoopAction::Quit,
        UiEvent::Command { command, count } => {
            let mut result = Ok(());
            for _ in 0..count.max(1) {
                result = session.apply(command.clone()).await;
                if result.is_err() {
                    break;
                }
            }
            result
        }
        UiEvent::Select => select_visible(session, engines, screen).await,
        UiEvent::JumpToBookmark(index) => {
            let id = session
                .annotations()
                .bookmarks
                .get(index.saturating_sub(1))
                .map(|bookmark| bookmark.id.clone());
            match id {
                Some(id) => session.apply(Command::JumpToBookmark(id)).await,
                None => Err(ReaderError::UnknownRecord(format!("bookmark #{index}"))),
            }
        }
        UiEvent::FontStep(step) => {
            let scale = session.preferences().font_scale + step;
            session.apply(Command::SetFontScale(scale)).await
        }
        UiEvent::BeginNote | UiEvent::NoteChanged { .. } | UiEvent::NoteCancel => {
            return LoopAction::ContinueRedraw;
        }
        UiEvent::NoteSubmit { text } => session.apply(Command::AddNote { content: text }).await,
        UiEvent::Resize { columns, rows } => {
            let current = Screen::query().unwrap_or(*screen);
            *screen = Screen {
                columns: columns.max(1),
                rows: rows.max(2),
                cell: current.cell,
            };
            session.apply(Command::SetViewport(screen.viewport())).await
        }
    };

    if let Err(err) = result {
        ui.report(&err);
    } else {
        ui.message = None;
    }
    LoopAction::ContinueRedraw
}

/// Starts a selection at the top of the current view. Fixed-layout pages
/// select their first text spans; reflowable text asks the engine, whose
/// selection arrives through the event bus.
async fn select_visible(
    session: &mut ReadingSession,
    engines: &RenderEngines,
    screen: &Screen,
) -> Result<(), ReaderError> {
    let adapter = session.adapter().ok_or(ReaderError::NotMounted)?;
    if let Some(fixed) = adapter.fixed_layout() {
        let pages = fixed.rendered_pages();
        let selection = fixed.page_layers().into_iter().find_map(|layer| {
            let page = pages.iter().find(|page| page.page == layer.page)?;
            let selection = select_spans(page, &layer, 0, SELECT_SPANS);
            (!selection.text.is_empty()).then_some(selection)
        });
        return match selection {
            Some(selection) => session.apply(Command::CaptureFixedSelection(selection)).await,
            None => Err(ReaderError::SelectionEmpty),
        };
    }
    let engine = engines.reflowable().ok_or(ReaderError::NotMounted)?;
    let viewport = screen.viewport();
    engine.select_visible(
        SELECT_CHARS,
        Rect::new(0.0, 0.0, viewport.width, screen.cell.1 * 3.0),
    );
    Ok(())
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    session: &ReadingSession,
    screen: &Screen,
    ui: &UiState,
    mapper: &EventMapper,
) -> Result<()> {
    renderer.begin_sync_update()?;
    match (session.adapter(), session.fallback()) {
        (Some(adapter), None) => {
            if let Some(fixed) = adapter.fixed_layout() {
                let pages = fixed.rendered_pages();
                let layers = fixed.page_layers();
                let background = match session.preferences().theme {
                    Theme::Light => [250, 250, 250],
                    Theme::Dark => [24, 24, 24],
                    Theme::Sepia => [244, 236, 216],
                };
                let mut frame = compose_frame(&pages, &layers, session.viewport(), background);
                for layer in &layers {
                    paint_overlays(&mut frame, &fixed.overlay_rects(layer.page));
                }
                if let Some(SelectionCapture::FixedLayout { anchor, .. }) =
                    session.pending_selection()
                {
                    if let Some(layer) = layers.iter().find(|layer| layer.page == anchor.page) {
                        let rects: Vec<_> = anchor
                            .rects
                            .iter()
                            .map(|rect| rect.project(&layer.bounds))
                            .collect();
                        paint_selection(&mut frame, &rects);
                    }
                }
                {
                    let mut writer = renderer.writer();
                    crossterm::execute!(&mut writer, cursor::MoveTo(0, 0))?;
                }
                renderer.draw(
                    &frame,
                    DrawParams::clamped(u32::from(screen.columns), u32::from(screen.content_rows())),
                )?;
            } else {
                renderer.delete_image()?;
                {
                    let mut writer = renderer.writer();
                    crossterm::execute!(&mut writer, Clear(ClearType::All))?;
                }
                let text = adapter
                    .reflowable()
                    .and_then(|reflowable| reflowable.engine().visible_text())
                    .unwrap_or_default();
                write_text_page(renderer.writer(), &text, screen.columns, screen.content_rows())?;
            }
        }
        (adapter, fallback) => {
            renderer.delete_image()?;
            {
                let mut writer = renderer.writer();
                crossterm::execute!(&mut writer, Clear(ClearType::All))?;
            }
            let text = match fallback {
                Some(reason) => {
                    let pages = adapter
                        .and_then(|adapter| adapter.fixed_layout())
                        .map(|fixed| fixed.rendered_pages())
                        .unwrap_or_default();
                    let first = session.position().page;
                    let visible = match session.preferences().view_mode {
                        ViewMode::Spread => vec![first, first + 1],
                        ViewMode::Single => vec![first],
                    };
                    ui.fallback_page(reason, &pages, &visible)
                }
                None => "No document is open.".to_owned(),
            };
            write_text_page(renderer.writer(), &text, screen.columns, screen.content_rows())?;
        }
    }

    let position = session.position();
    let page_count = session
        .adapter()
        .and_then(|adapter| adapter.fixed_layout())
        .map(|fixed| fixed.page_count());
    let preferences = session.preferences();
    let mut notice = ui.notice.clone();
    if let Some(message) = &ui.message {
        notice = Some(Notice {
            kind: NoticeKind::Error,
            message: message.clone(),
        });
    }
    let status = StatusLine {
        page: position.page,
        page_count,
        fraction: position.fraction(),
        format: session.format(),
        view_mode: preferences.view_mode,
        theme: preferences.theme,
        sync: session.sync_status(),
        nav: session.nav_state(),
        notice,
        pending_input: mapper.pending_input(),
    };
    write_status_line(
        renderer.writer(),
        screen.rows - 1,
        &status.render(usize::from(screen.columns)),
    )?;
    renderer.end_sync_update()?;
    Ok(())
}

fn connect(
    args: &Args,
    project_dirs: &ProjectDirs,
) -> Result<(DocumentId, Arc<dyn ProgressService>)> {
    if let Some(server) = &args.server {
        let id = args
            .document_id
            .clone()
            .ok_or_else(|| anyhow!("--server needs --document-id"))?;
        info!(%server, document = %id, "using remote progress service");
        let service = HttpProgressService::new(server, args.token.clone())?;
        return Ok((DocumentId::new(id), Arc::new(service)));
    }

    let file = args
        .file
        .as_ref()
        .ok_or_else(|| anyhow!("no input file provided"))?;
    let document = match &args.document_id {
        Some(id) => DocumentId::new(id.clone()),
        None => DocumentId::for_path(file),
    };
    let root = project_dirs.data_local_dir().join("progress");
    let service = FileProgressService::open(&root, document.clone(), file)
        .with_context(|| format!("failed to open {:?}", file))?;
    info!(path = %file.display(), document = %document, "using local progress file");
    Ok((document, Arc::new(service)))
}

/// The document as a file the system viewer can open. Remote content is
/// written under the cache dir when first needed.
fn raw_asset(
    args: &Args,
    project_dirs: &ProjectDirs,
    document: &DocumentId,
    session: &ReadingSession,
) -> RawAsset {
    match (&args.server, &args.file) {
        (None, Some(file)) => RawAsset::File(file.clone()),
        _ => {
            let extension = match session.format() {
                DocumentFormat::Reflowable => "epub",
                _ => "pdf",
            };
            RawAsset::Download {
                content: session.content().clone(),
                path: project_dirs
                    .cache_dir()
                    .join("documents")
                    .join(format!("{document}.{extension}")),
            }
        }
    }
}

fn load_config(args: &Args) -> Result<ReaderConfig> {
    let path = args.config.clone().or_else(config_path);
    if let Some(explicit) = &args.config {
        if !explicit.exists() {
            return Err(anyhow!("config file {:?} does not exist", explicit));
        }
    }
    let mut file = ConfigFile::load_or_default(path.as_deref())?;
    file.merge_cli(args.autosave_secs, args.tolerance);
    Ok(file.resolve())
}

/// `--spread` only seeds the stored preference; toggling in the reader
/// still wins afterwards.
fn seed_spread_preference(store: &FilePreferencesStore) -> Result<()> {
    let mut preferences = store.load()?.unwrap_or_default();
    if preferences.view_mode != ViewMode::Spread {
        preferences.view_mode = ViewMode::Spread;
        store.save(&preferences)?;
    }
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagewise.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The terminal belongs to the reader view, so logs only go to the file.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
