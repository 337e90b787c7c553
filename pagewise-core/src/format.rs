use tracing::debug;

use crate::error::{ReaderError, ReaderResult};
use crate::model::DocumentFormat;

/// Fixed-layout container magic.
const FIXED_LAYOUT_MAGIC: &[u8] = b"%PDF-";
/// Generic archive magic shared by reflowable packages.
const ARCHIVE_MAGIC: &[u8] = b"PK\x03\x04";
/// Some producers prepend junk before the header; this is how far we look.
const SNIFF_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSource {
    Override,
    Hint,
    Sniffed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatResolution {
    pub format: DocumentFormat,
    pub source: FormatSource,
}

/// Override first, then the declared hint, then the content sniff.
pub fn resolve(
    bytes: &[u8],
    hint: Option<DocumentFormat>,
    user_override: Option<DocumentFormat>,
) -> ReaderResult<FormatResolution> {
    let resolution = match (usable(user_override), usable(hint)) {
        (Some(format), _) => FormatResolution {
            format,
            source: FormatSource::Override,
        },
        (None, Some(format)) => FormatResolution {
            format,
            source: FormatSource::Hint,
        },
        (None, None) => FormatResolution {
            format: sniff(bytes),
            source: FormatSource::Sniffed,
        },
    };
    debug!(format = %resolution.format, source = ?resolution.source, "format resolved");

    if resolution.format == DocumentFormat::Unknown {
        return Err(ReaderError::FormatUnresolved);
    }
    Ok(resolution)
}

fn usable(format: Option<DocumentFormat>) -> Option<DocumentFormat> {
    format.filter(|format| *format != DocumentFormat::Unknown)
}

/// Classifies a buffer by its leading bytes.
pub fn sniff(bytes: &[u8]) -> DocumentFormat {
    if bytes.starts_with(ARCHIVE_MAGIC) {
        return DocumentFormat::Reflowable;
    }
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    if window
        .windows(FIXED_LAYOUT_MAGIC.len())
        .any(|candidate| candidate == FIXED_LAYOUT_MAGIC)
    {
        return DocumentFormat::FixedLayout;
    }
    DocumentFormat::Unknown
}

/// The adapter to mount when `resolution` disagrees with the one already
/// rendering, if any.
pub fn needs_remount(
    mounted: Option<DocumentFormat>,
    resolution: &FormatResolution,
) -> Option<DocumentFormat> {
    match mounted {
        Some(current) if current != resolution.format => Some(resolution.format),
        _ => None,
    }
}

/// One-line notice shown after a remount.
pub fn remount_notice(format: DocumentFormat) -> String {
    match format {
        DocumentFormat::FixedLayout => "Switched to the page view for this document".to_owned(),
        DocumentFormat::Reflowable => "Switched to the reflowing text view".to_owned(),
        DocumentFormat::Unknown => "This document's format could not be recognised".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PDF_HEAD: &[u8] = b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n1 0 obj";
    const EPUB_HEAD: &[u8] = b"PK\x03\x04\x14\x00\x00\x00\x00\x00mimetypeapplication/epub+zip";

    #[test]
    fn sniffs_both_container_signatures() {
        assert_eq!(sniff(PDF_HEAD), DocumentFormat::FixedLayout);
        assert_eq!(sniff(EPUB_HEAD), DocumentFormat::Reflowable);
        assert_eq!(sniff(b"GIF89a"), DocumentFormat::Unknown);
        assert_eq!(sniff(b""), DocumentFormat::Unknown);
    }

    #[test]
    fn tolerates_leading_garbage_before_pdf_header() {
        let mut bytes = vec![0u8; 16];
        bytes.extend_from_slice(PDF_HEAD);
        assert_eq!(sniff(&bytes), DocumentFormat::FixedLayout);
    }

    #[test]
    fn override_beats_hint_beats_sniff() {
        let resolved = resolve(
            EPUB_HEAD,
            Some(DocumentFormat::Reflowable),
            Some(DocumentFormat::FixedLayout),
        )
        .unwrap();
        assert_eq!(resolved.format, DocumentFormat::FixedLayout);
        assert_eq!(resolved.source, FormatSource::Override);

        let resolved = resolve(PDF_HEAD, Some(DocumentFormat::Reflowable), None).unwrap();
        assert_eq!(resolved.format, DocumentFormat::Reflowable);
        assert_eq!(resolved.source, FormatSource::Hint);

        let resolved = resolve(PDF_HEAD, None, None).unwrap();
        assert_eq!(resolved.format, DocumentFormat::FixedLayout);
        assert_eq!(resolved.source, FormatSource::Sniffed);
    }

    #[test]
    fn unknown_hint_falls_through_to_sniffing() {
        let resolved = resolve(EPUB_HEAD, Some(DocumentFormat::Unknown), None).unwrap();
        assert_eq!(resolved.format, DocumentFormat::Reflowable);
        assert_eq!(resolved.source, FormatSource::Sniffed);
    }

    #[test]
    fn unrecognised_content_is_terminal() {
        let err = resolve(b"\x89PNG\r\n", None, None).unwrap_err();
        assert!(matches!(err, ReaderError::FormatUnresolved));
    }

    #[test]
    fn remount_only_on_mismatch() {
        let resolution = FormatResolution {
            format: DocumentFormat::FixedLayout,
            source: FormatSource::Override,
        };
        assert_eq!(
            needs_remount(Some(DocumentFormat::Reflowable), &resolution),
            Some(DocumentFormat::FixedLayout)
        );
        assert_eq!(needs_remount(Some(DocumentFormat::FixedLayout), &resolution), None);
        assert_eq!(needs_remount(None, &resolution), None);
    }
}
