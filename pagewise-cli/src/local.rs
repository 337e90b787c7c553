//! Offline progress authority: a JSON file per document next to the local
//! position cache.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pagewise_core::{
    Bookmark, DocumentId, Highlight, NewBookmark, NewHighlight, NewNote, Note, ProgressService,
    ProgressUpdate, RemoteRecord, SessionOpening, SessionState,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub struct FileProgressService {
    document: DocumentId,
    source: PathBuf,
    content: Bytes,
    path: PathBuf,
    record: Mutex<RemoteRecord>,
}

impl FileProgressService {
    /// Serves `source` as `document`, keeping its records under `root`.
    pub fn open(root: &Path, document: DocumentId, source: &Path) -> Result<Self> {
        let content = fs::read(source).with_context(|| format!("failed to read {:?}", source))?;
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create progress directory {:?}", root))?;
        let path = root.join(format!("{document}.json"));
        let mut record = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(?err, path = %path.display(), "progress file unreadable, starting fresh");
                RemoteRecord::default()
            }),
            Err(_) => RemoteRecord::default(),
        };
        if record.format.is_none() {
            record.format = source
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase);
        }
        Ok(Self {
            document,
            source: source.to_path_buf(),
            content: Bytes::from(content),
            path,
            record: Mutex::new(record),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(&self, document: &DocumentId) -> Result<()> {
        if *document == self.document {
            Ok(())
        } else {
            Err(anyhow!("unknown document {document}"))
        }
    }

    /// Applies `f` to a copy of the record and swaps it in only once the
    /// copy is on disk.
    fn mutate<T>(
        &self,
        document: &DocumentId,
        f: impl FnOnce(&mut RemoteRecord) -> Result<T>,
    ) -> Result<T> {
        self.check(document)?;
        let mut record = self.record.lock();
        let mut next = record.clone();
        let value = f(&mut next)?;
        let json = serde_json::to_string_pretty(&next).context("failed to encode progress")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("failed to write {:?}", tmp))?;
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("failed to replace {:?}", self.path));
        }
        *record = next;
        Ok(value)
    }
}

#[async_trait]
impl ProgressService for FileProgressService {
    async fn open_session(&self, document: &DocumentId) -> Result<SessionOpening> {
        self.check(document)?;
        let record = self.record.lock();
        Ok(SessionOpening {
            content_url: format!("file://{}", self.source.display()),
            format: record.format.clone(),
            total_pages: record.total_pages,
            progress: record.position.clone(),
        })
    }

    async fn fetch_document(&self, document: &DocumentId) -> Result<Bytes> {
        self.check(document)?;
        Ok(self.content.clone())
    }

    async fn get_session_state(&self, document: &DocumentId) -> Result<SessionState> {
        self.check(document)?;
        Ok(self.record.lock().session_state())
    }

    async fn update_progress(&self, document: &DocumentId, update: &ProgressUpdate) -> Result<()> {
        self.mutate(document, |record| {
            record.apply_update(update);
            Ok(())
        })?;
        debug!(page = ?update.page, "progress written");
        Ok(())
    }

    async fn create_bookmark(
        &self,
        document: &DocumentId,
        bookmark: &NewBookmark,
    ) -> Result<Bookmark> {
        self.mutate(document, |record| Ok(record.add_bookmark(bookmark)))
    }

    async fn delete_bookmark(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.mutate(document, |record| record.remove_bookmark(id))
    }

    async fn create_note(&self, document: &DocumentId, note: &NewNote) -> Result<Note> {
        self.mutate(document, |record| Ok(record.add_note(note)))
    }

    async fn delete_note(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.mutate(document, |record| record.remove_note(id))
    }

    async fn create_highlight(
        &self,
        document: &DocumentId,
        highlight: &NewHighlight,
    ) -> Result<Highlight> {
        self.mutate(document, |record| Ok(record.add_highlight(highlight)))
    }

    async fn delete_highlight(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.mutate(document, |record| record.remove_highlight(id))
    }
}
