use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0d2a8e-6c41-5b7e-9a2f-4d8c1e6b7a90").expect("valid namespace UUID")
});

/// Opaque document identifier handed out by the content service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Stable id for a local file, so the same book reopens onto the same
    /// cached position.
    pub fn for_path(path: &Path) -> Self {
        let resolved = path
            .canonicalize()
            .or_else(|_| {
                if path.is_absolute() {
                    Ok(path.to_path_buf())
                } else {
                    std::env::current_dir().map(|cwd| cwd.join(path))
                }
            })
            .unwrap_or_else(|_| path.to_path_buf());
        let rendered = resolved.to_string_lossy();
        Self(Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type RecordId = String;

const LOCAL_RECORD_PREFIX: &str = "local-";

/// Temporary id for an optimistic insert that the server has not confirmed.
pub fn local_record_id() -> RecordId {
    format!("{LOCAL_RECORD_PREFIX}{}", Uuid::new_v4())
}

pub fn is_local_record(id: &str) -> bool {
    id.starts_with(LOCAL_RECORD_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentFormat {
    Reflowable,
    FixedLayout,
    #[default]
    Unknown,
}

impl DocumentFormat {
    /// Interprets the loose format strings the session-open call returns.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "epub" | "reflowable" | "application/epub+zip" => Some(Self::Reflowable),
            "pdf" | "fixed" | "fixed-layout" | "fixed_layout" | "application/pdf" => {
                Some(Self::FixedLayout)
            }
            _ => None,
        }
    }

    pub fn opposite(self) -> Option<Self> {
        match self {
            Self::Reflowable => Some(Self::FixedLayout),
            Self::FixedLayout => Some(Self::Reflowable),
            Self::Unknown => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Reflowable => "reflowable",
            Self::FixedLayout => "fixed-layout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The reader's place in a document. `page` is 1-based in both formats,
/// `location_address` only exists for reflowable content and `percent` is
/// derived, in `0..=100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_address: Option<String>,
    #[serde(default)]
    pub percent: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            page: 1,
            location_address: None,
            percent: 0.0,
        }
    }
}

impl Position {
    pub fn at_page(page: u32) -> Self {
        Self {
            page: page.max(1),
            ..Self::default()
        }
    }

    pub fn fraction(&self) -> f64 {
        (self.percent / 100.0).clamp(0.0, 1.0)
    }
}

/// A place reported by a renderer adapter after a move.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub page: u32,
    pub address: Option<String>,
    /// Fraction of the document in `[0, 1]`.
    pub fraction: f64,
}

impl Location {
    pub fn to_position(&self) -> Position {
        Position {
            page: self.page.max(1),
            location_address: self.address.clone(),
            percent: (self.fraction * 100.0).clamp(0.0, 100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

impl From<&Position> for ProgressUpdate {
    fn from(position: &Position) -> Self {
        Self {
            page: Some(position.page),
            location_address: position.location_address.clone(),
            percent: Some(position.percent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Periodic tick or page-turn side effect: silent either way.
    Background,
    /// Explicitly requested by the reader: confirmation or failure is shown.
    Interactive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSave {
    pub update: ProgressUpdate,
    pub mode: SaveMode,
}

impl PendingSave {
    pub fn background(position: &Position) -> Self {
        Self {
            update: position.into(),
            mode: SaveMode::Background,
        }
    }

    pub fn interactive(position: &Position) -> Self {
        Self {
            update: position.into(),
            mode: SaveMode::Interactive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: RecordId,
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_address: Option<String>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBookmark {
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_address: Option<String>,
    pub label: String,
}

impl NewBookmark {
    pub fn with_id(self, id: RecordId) -> Bookmark {
        Bookmark {
            id,
            page: self.page,
            location_address: self.location_address,
            label: self.label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightColor {
    #[default]
    Yellow,
    Green,
    Blue,
    Pink,
}

impl HighlightColor {
    pub fn rgb(self) -> [u8; 3] {
        match self {
            Self::Yellow => [255, 221, 0],
            Self::Green => [120, 220, 120],
            Self::Blue => [120, 180, 255],
            Self::Pink => [255, 150, 200],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: RecordId,
    pub page: u32,
    /// A range address for reflowable content, an encoded
    /// [`FixedAnchor`](crate::annotation::FixedAnchor) for fixed-layout content.
    pub anchor: String,
    pub text_snippet: String,
    pub color: HighlightColor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHighlight {
    pub page: u32,
    pub anchor: String,
    pub text_snippet: String,
    pub color: HighlightColor,
}

impl NewHighlight {
    pub fn with_id(self, id: RecordId) -> Highlight {
        Highlight {
            id,
            page: self.page,
            anchor: self.anchor,
            text_snippet: self.text_snippet,
            color: self.color,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: RecordId,
    pub page: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNote {
    pub page: u32,
    pub content: String,
}

impl NewNote {
    pub fn with_id(self, id: RecordId) -> Note {
        Note {
            id,
            page: self.page,
            content: self.content,
        }
    }
}

/// Response of the session-open call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOpening {
    pub content_url: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub progress: Position,
}

/// Remote snapshot polled once at mount.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub highlights: Vec<Highlight>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.epub");
        std::fs::write(&file_path, b"dummy").unwrap();

        assert_eq!(DocumentId::for_path(&file_path), DocumentId::for_path(&file_path));
    }

    #[test]
    fn format_hints_cover_common_spellings() {
        assert_eq!(DocumentFormat::from_hint("EPUB"), Some(DocumentFormat::Reflowable));
        assert_eq!(DocumentFormat::from_hint(" pdf "), Some(DocumentFormat::FixedLayout));
        assert_eq!(
            DocumentFormat::from_hint("fixed-layout"),
            Some(DocumentFormat::FixedLayout)
        );
        assert_eq!(DocumentFormat::from_hint("cbz"), None);
    }

    #[test]
    fn location_percent_is_clamped() {
        let location = Location {
            page: 0,
            address: None,
            fraction: 1.2,
        };
        let position = location.to_position();
        assert_eq!(position.page, 1);
        assert_eq!(position.percent, 100.0);
    }

    #[test]
    fn session_opening_reads_camel_case_payload() {
        let payload = r#"{
            "contentUrl": "https://cdn.example/doc/1",
            "format": "epub",
            "totalPages": 320,
            "progress": { "page": 12, "percent": 3.75 }
        }"#;
        let opening: SessionOpening = serde_json::from_str(payload).unwrap();
        assert_eq!(opening.total_pages, Some(320));
        assert_eq!(opening.progress.page, 12);
        assert!(opening.progress.location_address.is_none());
    }

    #[test]
    fn local_record_ids_are_recognisable() {
        let id = local_record_id();
        assert!(is_local_record(&id));
        assert!(!is_local_record("bm-12"));
    }
}
