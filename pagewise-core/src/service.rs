use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{
    Bookmark, DocumentId, Highlight, NewBookmark, NewHighlight, NewNote, Note, Position,
    ProgressUpdate, SessionOpening, SessionState,
};

/// The content and reading-progress services a session talks to. Every call
/// is scoped to one document.
#[async_trait]
pub trait ProgressService: Send + Sync {
    async fn open_session(&self, document: &DocumentId) -> Result<SessionOpening>;
    /// Raw document bytes (credentialed fetch).
    async fn fetch_document(&self, document: &DocumentId) -> Result<Bytes>;
    async fn get_session_state(&self, document: &DocumentId) -> Result<SessionState>;
    /// Idempotent upsert of the reader's position.
    async fn update_progress(&self, document: &DocumentId, update: &ProgressUpdate) -> Result<()>;
    async fn create_bookmark(&self, document: &DocumentId, bookmark: &NewBookmark)
        -> Result<Bookmark>;
    async fn delete_bookmark(&self, document: &DocumentId, id: &str) -> Result<()>;
    async fn create_note(&self, document: &DocumentId, note: &NewNote) -> Result<Note>;
    async fn delete_note(&self, document: &DocumentId, id: &str) -> Result<()>;
    async fn create_highlight(
        &self,
        document: &DocumentId,
        highlight: &NewHighlight,
    ) -> Result<Highlight>;
    async fn delete_highlight(&self, document: &DocumentId, id: &str) -> Result<()>;
}

/// Server-side state for one document. Shared by the in-memory service and
/// the file-backed one in the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteRecord {
    pub format: Option<String>,
    pub total_pages: Option<u32>,
    pub position: Position,
    pub bookmarks: Vec<Bookmark>,
    pub notes: Vec<Note>,
    pub highlights: Vec<Highlight>,
    pub next_id: u64,
}

impl RemoteRecord {
    pub fn apply_update(&mut self, update: &ProgressUpdate) {
        if let Some(page) = update.page {
            self.position.page = page.max(1);
        }
        if let Some(address) = &update.location_address {
            self.position.location_address = Some(address.clone());
        }
        if let Some(percent) = update.percent {
            self.position.percent = percent.clamp(0.0, 100.0);
        }
    }

    pub fn session_state(&self) -> SessionState {
        SessionState {
            position: Some(self.position.clone()),
            bookmarks: self.bookmarks.clone(),
            notes: self.notes.clone(),
            highlights: self.highlights.clone(),
        }
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    pub fn add_bookmark(&mut self, bookmark: &NewBookmark) -> Bookmark {
        let created = bookmark.clone().with_id(self.allocate_id("bm"));
        self.bookmarks.push(created.clone());
        created
    }

    pub fn add_note(&mut self, note: &NewNote) -> Note {
        let created = note.clone().with_id(self.allocate_id("note"));
        self.notes.push(created.clone());
        created
    }

    pub fn add_highlight(&mut self, highlight: &NewHighlight) -> Highlight {
        let created = highlight.clone().with_id(self.allocate_id("hl"));
        self.highlights.push(created.clone());
        created
    }

    pub fn remove_bookmark(&mut self, id: &str) -> Result<()> {
        remove_by(&mut self.bookmarks, |b| b.id == id).ok_or_else(|| anyhow!("bookmark {id} not found"))
    }

    pub fn remove_note(&mut self, id: &str) -> Result<()> {
        remove_by(&mut self.notes, |n| n.id == id).ok_or_else(|| anyhow!("note {id} not found"))
    }

    pub fn remove_highlight(&mut self, id: &str) -> Result<()> {
        remove_by(&mut self.highlights, |h| h.id == id)
            .ok_or_else(|| anyhow!("highlight {id} not found"))
    }
}

fn remove_by<T>(items: &mut Vec<T>, predicate: impl Fn(&T) -> bool) -> Option<()> {
    let index = items.iter().position(predicate)?;
    items.remove(index);
    Some(())
}

struct StoredDocument {
    content: Bytes,
    record: RemoteRecord,
}

/// In-process authority. Used offline and as the reference behaviour for
/// the service contract.
#[derive(Default)]
pub struct MemoryProgressService {
    documents: Mutex<HashMap<DocumentId, StoredDocument>>,
    update_calls: AtomicUsize,
}

impl MemoryProgressService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_document(
        &self,
        document: DocumentId,
        content: Bytes,
        format: Option<&str>,
        total_pages: Option<u32>,
    ) {
        let record = RemoteRecord {
            format: format.map(str::to_owned),
            total_pages,
            ..RemoteRecord::default()
        };
        self.documents
            .lock()
            .insert(document, StoredDocument { content, record });
    }

    pub fn set_position(&self, document: &DocumentId, position: Position) {
        if let Some(stored) = self.documents.lock().get_mut(document) {
            stored.record.position = position;
        }
    }

    pub fn position(&self, document: &DocumentId) -> Option<Position> {
        self.documents
            .lock()
            .get(document)
            .map(|stored| stored.record.position.clone())
    }

    pub fn record(&self, document: &DocumentId) -> Option<RemoteRecord> {
        self.documents
            .lock()
            .get(document)
            .map(|stored| stored.record.clone())
    }

    /// Number of `update_progress` calls received so far.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn with_record<T>(
        &self,
        document: &DocumentId,
        f: impl FnOnce(&mut RemoteRecord) -> Result<T>,
    ) -> Result<T> {
        let mut documents = self.documents.lock();
        let stored = documents
            .get_mut(document)
            .ok_or_else(|| anyhow!("unknown document {document}"))?;
        f(&mut stored.record)
    }
}

#[async_trait]
impl ProgressService for MemoryProgressService {
    async fn open_session(&self, document: &DocumentId) -> Result<SessionOpening> {
        self.with_record(document, |record| {
            Ok(SessionOpening {
                content_url: format!("memory://{document}"),
                format: record.format.clone(),
                total_pages: record.total_pages,
                progress: record.position.clone(),
            })
        })
    }

    async fn fetch_document(&self, document: &DocumentId) -> Result<Bytes> {
        self.documents
            .lock()
            .get(document)
            .map(|stored| stored.content.clone())
            .ok_or_else(|| anyhow!("unknown document {document}"))
    }

    async fn get_session_state(&self, document: &DocumentId) -> Result<SessionState> {
        self.with_record(document, |record| Ok(record.session_state()))
    }

    async fn update_progress(&self, document: &DocumentId, update: &ProgressUpdate) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.with_record(document, |record| {
            record.apply_update(update);
            Ok(())
        })
    }

    async fn create_bookmark(
        &self,
        document: &DocumentId,
        bookmark: &NewBookmark,
    ) -> Result<Bookmark> {
        self.with_record(document, |record| Ok(record.add_bookmark(bookmark)))
    }

    async fn delete_bookmark(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.with_record(document, |record| record.remove_bookmark(id))
    }

    async fn create_note(&self, document: &DocumentId, note: &NewNote) -> Result<Note> {
        self.with_record(document, |record| Ok(record.add_note(note)))
    }

    async fn delete_note(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.with_record(document, |record| record.remove_note(id))
    }

    async fn create_highlight(
        &self,
        document: &DocumentId,
        highlight: &NewHighlight,
    ) -> Result<Highlight> {
        self.with_record(document, |record| Ok(record.add_highlight(highlight)))
    }

    async fn delete_highlight(&self, document: &DocumentId, id: &str) -> Result<()> {
        self.with_record(document, |record| record.remove_highlight(id))
    }
}
