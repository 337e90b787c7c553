use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::model::{DocumentId, Location, Position};

/// Local, non-authoritative position snapshot keyed by document id. Safe to
/// read from several sessions; only reconciliation and the active session
/// write to it.
pub trait PositionCache: Send + Sync {
    fn load(&self, document: &DocumentId) -> Result<Option<Position>>;
    fn save(&self, document: &DocumentId, position: &Position) -> Result<()>;
}

pub struct FilePositionCache {
    root: PathBuf,
}

impl FilePositionCache {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create position cache at {:?}", root))?;
        Ok(Self { root })
    }

    fn entry_path(&self, document: &DocumentId) -> PathBuf {
        let safe: String = document
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}

impl PositionCache for FilePositionCache {
    fn load(&self, document: &DocumentId) -> Result<Option<Position>> {
        let path = self.entry_path(document);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open position file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let position = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode position file {:?}", path))?;
        Ok(Some(position))
    }

    fn save(&self, document: &DocumentId, position: &Position) -> Result<()> {
        let path = self.entry_path(document);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(position)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp position file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPositionCache {
    inner: Mutex<HashMap<DocumentId, Position>>,
}

impl MemoryPositionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionCache for MemoryPositionCache {
    fn load(&self, document: &DocumentId) -> Result<Option<Position>> {
        Ok(self.inner.lock().get(document).cloned())
    }

    fn save(&self, document: &DocumentId, position: &Position) -> Result<()> {
        self.inner.lock().insert(document.clone(), position.clone());
        Ok(())
    }
}

/// Where a location report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Result of an explicit navigation command; always applied.
    Navigation,
    /// Spontaneous engine relocation; never allowed to move backwards.
    Engine,
}

/// The session's current position, mirrored into the local cache on every
/// confirmed movement.
pub struct PositionStore {
    document: DocumentId,
    cache: Arc<dyn PositionCache>,
    current: Mutex<Position>,
}

impl PositionStore {
    pub fn new(document: DocumentId, cache: Arc<dyn PositionCache>, initial: Position) -> Self {
        Self {
            document,
            cache,
            current: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> Position {
        self.current.lock().clone()
    }

    /// Applies a move. Returns the new position when it changed.
    pub fn record(&self, location: &Location, origin: Origin) -> Option<Position> {
        let next = location.to_position();
        {
            let mut current = self.current.lock();
            if *current == next {
                return None;
            }
            if origin == Origin::Engine && regresses(&current, &next) {
                debug!(
                    from = current.page,
                    to = next.page,
                    "ignoring backwards relocation outside a navigation command"
                );
                return None;
            }
            *current = next.clone();
        }
        if let Err(err) = self.cache.save(&self.document, &next) {
            warn!(?err, document = %self.document, "failed to write position cache");
        }
        Some(next)
    }

    /// Replaces the position wholesale, e.g. after adopting the remote copy.
    pub fn replace(&self, position: Position) {
        *self.current.lock() = position.clone();
        if let Err(err) = self.cache.save(&self.document, &position) {
            warn!(?err, document = %self.document, "failed to write position cache");
        }
    }
}

fn regresses(current: &Position, next: &Position) -> bool {
    next.page < current.page || next.percent + f64::EPSILON < current.percent
}
