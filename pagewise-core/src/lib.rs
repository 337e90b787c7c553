//! Reading-session engine: opens a reflowable or fixed-layout document,
//! tracks and persists the reader's position, and maps selections into
//! durable annotations.

pub mod adapter;
pub mod annotation;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod geometry;
pub mod model;
pub mod navigation;
pub mod position;
pub mod preferences;
pub mod service;
pub mod session;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{
    FixedLayoutAdapter, FixedLayoutOptions, MountedAdapter, NavTarget, Overlay, ReflowableAdapter,
    RendererAdapter,
};
pub use annotation::{
    Affordance, AnnotationMapper, AnnotationReplica, FixedAnchor, NativeSelection, PageLayer,
    SelectionCapture,
};
pub use config::{ConfigFile, ReaderConfig};
pub use engine::{
    AnnotationStyle, EngineProvider, FixedLayoutEngine, ReflowableEngine, Relocation,
    RelocationListener, RenderImage, RenderRequest, RenderedPage, SelectionListener, TextSelection,
    TextSpan, ThemeParams,
};
pub use error::{Boundary, NavFailure, ReaderError, ReaderResult};
pub use events::{EventBus, FallbackReason, Notice, NoticeKind, ReaderEvent};
pub use format::{FormatResolution, FormatSource};
pub use geometry::{NormalizedRect, Rect, Size};
pub use model::{
    Bookmark, DocumentFormat, DocumentId, Highlight, HighlightColor, Location, NewBookmark,
    NewHighlight, NewNote, Note, PendingSave, Position, ProgressUpdate, RecordId, SaveMode,
    SessionOpening, SessionState,
};
pub use navigation::{NavCommand, NavOutcome, NavState, Navigator, ScrubBar, SwipeDetector};
pub use position::{FilePositionCache, MemoryPositionCache, Origin, PositionCache, PositionStore};
pub use preferences::{
    FilePreferencesStore, MemoryPreferencesStore, PreferencesStore, ReaderPreferences, Theme,
    ViewMode,
};
pub use service::{MemoryProgressService, ProgressService, RemoteRecord};
pub use session::{Command, ReadingSession, SessionContext, SessionDeps, SessionOptions};
pub use sync::{
    reconcile, retry_with_backoff, Correction, ProgressSaveQueue, Reconciler, Reconciliation,
    RetryPolicy, SyncStatus,
};
