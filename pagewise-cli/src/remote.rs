//! REST client for a hosted progress service.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pagewise_core::{
    Bookmark, DocumentId, Highlight, NewBookmark, NewHighlight, NewNote, Note, ProgressService,
    ProgressUpdate, SessionOpening, SessionState,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};
use ureq::{Agent, AgentBuilder, Error as UreqError, Request, Response};
use url::Url;

const MAX_DOCUMENT_BYTES: u64 = 512 * 1024 * 1024;

pub struct HttpProgressService {
    agent: Agent,
    base: Url,
    token: Option<String>,
}

impl HttpProgressService {
    pub fn new(base: &str, token: Option<String>) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("invalid server url {base:?}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("server url {base} cannot carry a path"));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let agent = AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .timeout_write(Duration::from_secs(30))
            .build();
        Ok(Self { agent, base, token })
    }

    /// `{base}/documents/{id}/{tail..}`.
    fn endpoint(&self, document: &DocumentId, tail: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url {} cannot carry a path", self.base))?
            .pop_if_empty()
            .push("documents")
            .push(document.as_str())
            .extend(tail);
        Ok(url)
    }

    fn request(&self, method: &str, url: &Url) -> Request {
        let request = self.agent.request_url(method, url);
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .context("http task failed")?
    }

    async fn get_json<T>(&self, url: Url) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request = self.request("GET", &url);
        self.blocking(move || {
            let response = check(request.call(), "GET", &url)?;
            response
                .into_json()
                .with_context(|| format!("invalid JSON from GET {url}"))
        })
        .await
    }

    async fn send_json<B, T>(&self, method: &'static str, url: Url, body: &B) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned + Send + 'static,
    {
        let body = serde_json::to_value(body).context("failed to encode request body")?;
        let request = self.request(method, &url);
        self.blocking(move || {
            let response = check(request.send_json(body), method, &url)?;
            response
                .into_json()
                .with_context(|| format!("invalid JSON from {method} {url}"))
        })
        .await
    }

    async fn send_unit<B: Serialize>(&self, method: &'static str, url: Url, body: Option<&B>) -> Result<()> {
        let body = body
            .map(|body| serde_json::to_value(body).context("failed to encode request body"))
            .transpose()?;
        let request = self.request(method, &url);
        self.blocking(move || {
            let result = match body {
                Some(body) => request.send_json(body),
                None => request.call(),
            };
            check(result, method, &url)?;
            Ok(())
        })
        .await
    }
}

fn check(result: Result<Response, UreqError>, method: &str, url: &Url) -> Result<Response> {
    match result {
        Ok(response) => {
            debug!(method, %url, status = response.status(), "http ok");
            Ok(response)
        }
        Err(UreqError::Status(code, _)) => {
            Err(anyhow!("{method} {url} failed with HTTP status {code}"))
        }
        Err(err) => Err(anyhow!("{method} {url} failed: {err}")),
    }
}

#[async_trait]
impl ProgressService for HttpProgressService {
    #[instrument(skip(self), fields(document = %document))]
    async fn open_session(&self, document: &DocumentId) -> Result<SessionOpening> {
        let url = self.endpoint(document, &["session"])?;
        self.send_json("POST", url, &serde_json::json!({})).await
    }

    #[instrument(skip(self), fields(document = %document))]
    async fn fetch_document(&self, document: &DocumentId) -> Result<Bytes> {
        let url = self.endpoint(document, &["content"])?;
        let request = self.request("GET", &url);
        self.blocking(move || {
            let response = check(request.call(), "GET", &url)?;
            let mut buffer = Vec::new();
            response
                .into_reader()
                .take(MAX_DOCUMENT_BYTES)
                .read_to_end(&mut buffer)
                .with_context(|| format!("failed to download {url}"))?;
            debug!(bytes = buffer.len(), "document downloaded");
            Ok(Bytes::from(buffer))
        })
        .await
    }

    async fn get_session_state(&self, document: &DocumentId) -> Result<SessionState> {
        let url = self.endpoint(document, &["state"])?;
        self.get_json(url).await
    }

    async fn update_progress(&self, document: &DocumentId, update: &ProgressUpdate) -> Result<()> {
        let url = self.endpoint(document, &["progress"])?;
        self.send_unit("PUT", url, Some(update)).await
    }

    async fn create_bookmark(
        &self,
        document: &DocumentId,
        bookmark: &NewBookmark,
    ) -> Result<Bookmark> {
        let url = self.endpoint(document, &["bookmarks"])?;
        self.send_json("POST", url, bookmark).await
    }

    async fn delete_bookmark(&self, document: &DocumentId, id: &str) -> Result<()> {
        let url = self.endpoint(document, &["bookmarks", id])?;
        self.send_unit::<()>("DELETE", url, None).await
    }

    async fn create_note(&self, document: &DocumentId, note: &NewNote) -> Result<Note> {
        let url = self.endpoint(document, &["notes"])?;
        self.send_json("POST", url, note).await
    }

    async fn delete_note(&self, document: &DocumentId, id: &str) -> Result<()> {
        let url = self.endpoint(document, &["notes", id])?;
        self.send_unit::<()>("DELETE", url, None).await
    }

    async fn create_highlight(
        &self,
        document: &DocumentId,
        highlight: &NewHighlight,
    ) -> Result<Highlight> {
        let url = self.endpoint(document, &["highlights"])?;
        self.send_json("POST", url, highlight).await
    }

    async fn delete_highlight(&self, document: &DocumentId, id: &str) -> Result<()> {
        let url = self.endpoint(document, &["highlights", id])?;
        self.send_unit::<()>("DELETE", url, None).await
    }
}
