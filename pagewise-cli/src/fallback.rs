//! Degraded fixed-layout presentation: the raw document goes to the
//! platform's default viewer and the terminal shows the page's text layer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use pagewise_core::{FallbackReason, RenderedPage};
use tracing::{error, info};

pub type Launcher = Box<dyn Fn(&Path) -> io::Result<()> + Send>;

/// Where the raw asset lives. Remote documents are written out on first
/// use.
pub enum RawAsset {
    File(PathBuf),
    Download { content: Bytes, path: PathBuf },
}

pub struct RawAssetViewer {
    asset: RawAsset,
    launcher: Launcher,
    opened: Option<PathBuf>,
}

impl RawAssetViewer {
    pub fn new(asset: RawAsset) -> Self {
        Self::with_launcher(asset, Box::new(|path: &Path| open::that(path)))
    }

    pub fn with_launcher(asset: RawAsset, launcher: Launcher) -> Self {
        Self {
            asset,
            launcher,
            opened: None,
        }
    }

    pub fn opened(&self) -> Option<&Path> {
        self.opened.as_deref()
    }

    /// Opens the asset in the external viewer, at most once per viewer.
    pub fn present(&mut self) -> Result<&Path> {
        let opened = match self.opened.take() {
            Some(path) => path,
            None => {
                let path = match &self.asset {
                    RawAsset::File(path) => path.clone(),
                    RawAsset::Download { content, path } => {
                        if let Some(parent) = path.parent() {
                            fs::create_dir_all(parent)
                                .with_context(|| format!("failed to create {:?}", parent))?;
                        }
                        fs::write(path, content)
                            .with_context(|| format!("failed to write {:?}", path))?;
                        path.clone()
                    }
                };
                (self.launcher)(&path)
                    .with_context(|| format!("failed to open {:?} in the system viewer", path))?;
                info!(path = %path.display(), "raw document handed to system viewer");
                path
            }
        };
        Ok(self.opened.insert(opened).as_path())
    }

    /// Presents the asset, logging instead of failing. Returns the status
    /// message for the reader.
    pub fn present_or_log(&mut self, reason: FallbackReason) -> String {
        match self.present() {
            Ok(path) => format!(
                "{}; opened in the system viewer ({})",
                describe(reason),
                path.display()
            ),
            Err(err) => {
                error!(?err, ?reason, "failed to open raw document");
                format!("{}; no system viewer available", describe(reason))
            }
        }
    }
}

fn describe(reason: FallbackReason) -> String {
    match reason {
        FallbackReason::BlankPage(page) => format!("page {page} rendered blank"),
        FallbackReason::RenderStalled(page) => format!("page {page} took too long to render"),
    }
}

/// Text shown in place of the page image while degraded: the reason, where
/// the document went, then the text layer of the visible pages.
pub fn fallback_text(
    reason: FallbackReason,
    pages: &[Arc<RenderedPage>],
    visible: &[u32],
    opened: Option<&Path>,
) -> String {
    let mut text = describe(reason);
    text.push_str(". ");
    match opened {
        Some(path) => text.push_str(&format!(
            "The document is open in your system viewer ({}).",
            path.display()
        )),
        None => text.push_str("Open the document in another viewer."),
    }

    for page in pages.iter().filter(|page| visible.contains(&page.page)) {
        let spans: Vec<&str> = page
            .text_layer
            .iter()
            .map(|span| span.text.trim())
            .filter(|span| !span.is_empty())
            .collect();
        if !spans.is_empty() {
            text.push_str("\n\n");
            text.push_str(&spans.join(" "));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use pagewise_core::{NormalizedRect, RenderImage, TextSpan};
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;

    fn recording() -> (Arc<Mutex<Vec<PathBuf>>>, Launcher) {
        let launched = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&launched);
        let launcher: Launcher = Box::new(move |path: &Path| -> io::Result<()> {
            log.lock().push(path.to_path_buf());
            Ok(())
        });
        (launched, launcher)
    }

    fn page(number: u32, spans: &[&str]) -> Arc<RenderedPage> {
        Arc::new(RenderedPage {
            page: number,
            image: RenderImage {
                width: 1,
                height: 1,
                pixels: vec![255; 4],
            },
            text_layer: spans
                .iter()
                .map(|text| TextSpan {
                    text: (*text).to_owned(),
                    rect: NormalizedRect {
                        x: 0.1,
                        y: 0.1,
                        w: 0.2,
                        h: 0.05,
                    },
                })
                .collect(),
        })
    }

    #[test]
    fn local_file_is_launched_once() {
        let (launched, launcher) = recording();
        let mut viewer =
            RawAssetViewer::with_launcher(RawAsset::File("/books/a.pdf".into()), launcher);

        let message = viewer.present_or_log(FallbackReason::BlankPage(2));
        assert!(message.contains("page 2 rendered blank"));
        assert!(message.contains("/books/a.pdf"));
        viewer.present_or_log(FallbackReason::BlankPage(3));
        assert_eq!(*launched.lock(), vec![PathBuf::from("/books/a.pdf")]);
    }

    #[test]
    fn downloaded_content_is_written_before_launch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fallback").join("doc.pdf");
        let (launched, launcher) = recording();
        let mut viewer = RawAssetViewer::with_launcher(
            RawAsset::Download {
                content: Bytes::from_static(b"%PDF-1.7 raw"),
                path: path.clone(),
            },
            launcher,
        );

        assert_eq!(viewer.present().unwrap(), path.as_path());
        assert_eq!(fs::read(&path).unwrap(), b"%PDF-1.7 raw");
        assert_eq!(launched.lock().len(), 1);
    }

    #[test]
    fn launcher_failure_is_reported_not_fatal() {
        let mut viewer = RawAssetViewer::with_launcher(
            RawAsset::File("/books/a.pdf".into()),
            Box::new(|_: &Path| -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::NotFound, "no opener"))
            }),
        );
        let message = viewer.present_or_log(FallbackReason::RenderStalled(7));
        assert!(message.contains("page 7 took too long"));
        assert!(message.contains("no system viewer"));
        assert!(viewer.opened().is_none());
    }

    #[test]
    fn fallback_text_lists_visible_text_layer() {
        let pages = vec![page(1, &["stale"]), page(2, &["Hello", " world "])];
        let text = fallback_text(
            FallbackReason::BlankPage(2),
            &pages,
            &[2],
            Some(Path::new("/books/a.pdf")),
        );
        assert!(text.starts_with("page 2 rendered blank. The document is open"));
        assert!(text.ends_with("\n\nHello world"));
        assert!(!text.contains("stale"));

        let text = fallback_text(FallbackReason::RenderStalled(5), &pages, &[5], None);
        assert_eq!(
            text,
            "page 5 took too long to render. Open the document in another viewer."
        );
    }
}
