//! EPUB container reading: `container.xml`, the OPF spine and a plain-text
//! rendition of each spine document.

use std::borrow::Cow;
use std::io::{Cursor, Read};

use anyhow::{anyhow, Context, Result};
use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::{debug, warn};
use zip::ZipArchive;

const CONTAINER_PATH: &str = "META-INF/container.xml";

#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub href: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct Package {
    pub title: Option<String>,
    pub chapters: Vec<Chapter>,
}

impl Package {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).context("document is not a zip container")?;

        let container = read_entry(&mut archive, CONTAINER_PATH)?;
        let rootfile = find_rootfile(&container)?
            .ok_or_else(|| anyhow!("container.xml names no rootfile"))?;
        let opf = parse_opf(&read_entry(&mut archive, &rootfile)?)?;
        let base = match rootfile.rfind('/') {
            Some(idx) => &rootfile[..=idx],
            None => "",
        };

        let mut chapters = Vec::new();
        for idref in &opf.spine {
            let Some(item) = opf.manifest.iter().find(|item| item.id == *idref) else {
                warn!(%idref, "spine entry missing from manifest");
                continue;
            };
            if !item.media_type.contains("html") {
                debug!(href = %item.href, media_type = %item.media_type, "skipping non-text spine entry");
                continue;
            }
            let path = join_path(base, &item.href);
            let markup = match read_entry(&mut archive, &path) {
                Ok(markup) => markup,
                Err(err) => {
                    warn!(%path, ?err, "skipping unreadable chapter");
                    continue;
                }
            };
            let text = html_to_text(&markup);
            if !text.trim().is_empty() {
                chapters.push(Chapter { href: path, text });
            }
        }

        if chapters.is_empty() {
            return Err(anyhow!("package has no readable chapters"));
        }
        Ok(Self {
            title: opf.title,
            chapters,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ManifestItem {
    id: String,
    href: String,
    media_type: String,
}

#[derive(Debug, Default)]
struct Opf {
    title: Option<String>,
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<String> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("missing {name} in package"))?;
    let mut raw = Vec::new();
    entry
        .read_to_end(&mut raw)
        .with_context(|| format!("failed to read {name}"))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn xml_reader(markup: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(markup);
    let config = reader.config_mut();
    config.trim_text(false);
    config.check_end_names = false;
    reader
}

fn find_rootfile(container: &str) -> Result<Option<String>> {
    let mut reader = xml_reader(container);
    loop {
        match reader.read_event().context("malformed container.xml")? {
            Event::Start(e) | Event::Empty(e) if local_name(&e) == "rootfile" => {
                if let Some(path) = attribute(&e, "full-path") {
                    return Ok(Some(path));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Title, manifest and spine of the package document. Comments and
/// elements outside `metadata`/`manifest`/`spine` are ignored.
fn parse_opf(opf: &str) -> Result<Opf> {
    let mut reader = xml_reader(opf);
    let mut parsed = Opf::default();
    let mut in_metadata = false;
    let mut title: Option<String> = None;

    loop {
        match reader.read_event().context("malformed package document")? {
            Event::Start(e) => match local_name(&e).as_str() {
                "metadata" => in_metadata = true,
                "title" if in_metadata && parsed.title.is_none() => title = Some(String::new()),
                _ => collect_entry(&e, &mut parsed),
            },
            Event::Empty(e) => collect_entry(&e, &mut parsed),
            Event::Text(e) => {
                if let Some(title) = title.as_mut() {
                    title.push_str(&e.decode().context("undecodable package title")?);
                }
            }
            Event::GeneralRef(e) => {
                if let Some(title) = title.as_mut() {
                    title.push_str(&resolve_reference(&e.decode()?));
                }
            }
            Event::End(e) => match String::from_utf8_lossy(e.local_name().as_ref()).as_ref() {
                "metadata" => in_metadata = false,
                "title" => {
                    if let Some(text) = title.take() {
                        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                        if !text.is_empty() {
                            parsed.title = Some(text);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(parsed)
}

fn collect_entry(e: &BytesStart<'_>, opf: &mut Opf) {
    match local_name(e).as_str() {
        "item" => {
            if let (Some(id), Some(href)) = (attribute(e, "id"), attribute(e, "href")) {
                opf.manifest.push(ManifestItem {
                    id,
                    href,
                    media_type: attribute(e, "media-type").unwrap_or_default(),
                });
            }
        }
        "itemref" => {
            if let Some(idref) = attribute(e, "idref") {
                opf.spine.push(idref);
            }
        }
        _ => {}
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        (attr.key.local_name().as_ref() == name.as_bytes())
            .then(|| unescape(&String::from_utf8_lossy(&attr.value)).into_owned())
    })
}

/// Unescapes XML and HTML5 named references, leaving the text as-is when
/// it holds a reference neither knows.
fn unescape(raw: &str) -> Cow<'_, str> {
    unescape_with(raw, resolve_html5_entity).unwrap_or(Cow::Borrowed(raw))
}

fn resolve_reference(name: &str) -> String {
    let reference = format!("&{name};");
    unescape(&reference).into_owned()
}

/// Resolves `href` against the OPF directory, folding `.` and `..`.
fn join_path(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "h1", "h2", "h3", "h4", "h5", "h6", "li", "tr", "blockquote", "section",
];

fn skipped(tag: &str) -> bool {
    matches!(tag, "script" | "style" | "head")
}

/// Strips markup, keeping paragraph breaks for block elements. Script,
/// style and head contents are dropped. Malformed markup ends the chapter
/// at the point of the error.
pub fn html_to_text(markup: &str) -> String {
    let mut reader = xml_reader(markup);
    let mut out = String::with_capacity(markup.len() / 2);
    let mut run = String::new();
    let mut skip_depth = 0usize;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(err) => {
                warn!(?err, position = reader.buffer_position(), "chapter markup truncated");
                break;
            }
        };
        match event {
            Event::Start(e) => {
                let tag = local_name(&e);
                if skipped(&tag) {
                    flush_run(&mut out, &mut run);
                    skip_depth += 1;
                } else if skip_depth == 0 && BLOCK_TAGS.contains(&tag.as_str()) {
                    flush_run(&mut out, &mut run);
                    paragraph_break(&mut out);
                }
            }
            Event::Empty(e) => {
                if skip_depth == 0 && BLOCK_TAGS.contains(&local_name(&e).as_str()) {
                    flush_run(&mut out, &mut run);
                    paragraph_break(&mut out);
                }
            }
            Event::End(e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                if skipped(&tag) {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if skip_depth == 0 && BLOCK_TAGS.contains(&tag.as_str()) {
                    flush_run(&mut out, &mut run);
                    paragraph_break(&mut out);
                }
            }
            Event::Text(e) if skip_depth == 0 => {
                if let Ok(text) = e.decode() {
                    run.push_str(&text);
                }
            }
            Event::CData(e) if skip_depth == 0 => {
                run.push_str(&String::from_utf8_lossy(&e));
            }
            Event::GeneralRef(e) if skip_depth == 0 => {
                if let Ok(name) = e.decode() {
                    run.push_str(&resolve_reference(&name));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    flush_run(&mut out, &mut run);
    out.trim().to_owned()
}

fn paragraph_break(out: &mut String) {
    if !out.is_empty() && !out.ends_with("\n\n") {
        let trimmed = out.trim_end_matches(' ').len();
        out.truncate(trimmed);
        out.push_str(if out.ends_with('\n') { "\n" } else { "\n\n" });
    }
}

/// Appends the pending text run with whitespace collapsed.
fn flush_run(out: &mut String, run: &mut String) {
    for word in run.split_whitespace() {
        if !out.is_empty() && !out.ends_with(' ') && !out.ends_with('\n') {
            out.push(' ');
        }
        out.push_str(word);
    }
    if run.ends_with(char::is_whitespace) && !out.is_empty() && !out.ends_with('\n') {
        out.push(' ');
    }
    run.clear();
}
