//! Path-keyed artifact storage + page fetch utilities for hoopstat.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use hoopstat_core::{CrawlResource, FetchOutcome, ResourceKind};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hoopstat-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Filesystem-backed cache of raw markup keyed by resource id, one directory
/// per resource kind. Presence of a file means the resource was fetched;
/// entries are never invalidated.
///
/// Assumes a single writer. Two processes sharing a root can both miss the
/// same id and fetch it twice; the rename keeps each file whole either way.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, kind: ResourceKind) -> anyhow::Result<PathBuf> {
        match kind.namespace() {
            Some(ns) => Ok(self.root.join(ns)),
            None => bail!("{kind} resources are not persisted"),
        }
    }

    pub fn artifact_path(&self, kind: ResourceKind, id: &str) -> anyhow::Result<PathBuf> {
        validate_id(id)?;
        Ok(self.namespace_dir(kind)?.join(id))
    }

    pub async fn exists(&self, kind: ResourceKind, id: &str) -> anyhow::Result<bool> {
        let path = self.artifact_path(kind, id)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking artifact path {}", path.display()))
    }

    pub async fn read(&self, kind: ResourceKind, id: &str) -> anyhow::Result<String> {
        let path = self.artifact_path(kind, id)?;
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {kind} artifact {id} at {}", path.display()))
    }

    /// Write markup for `id` via temp file + rename. An id that is already
    /// present is left untouched.
    pub async fn write(&self, kind: ResourceKind, id: &str, markup: &str) -> anyhow::Result<StoredArtifact> {
        let absolute_path = self.artifact_path(kind, id)?;
        let bytes = markup.as_bytes();

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = absolute_path.with_file_name(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    /// Ids stored under `kind`, sorted. Temp files and directories are skipped;
    /// a missing namespace directory is an empty list.
    pub async fn list(&self, kind: ResourceKind) -> anyhow::Result<Vec<String>> {
        let dir = self.namespace_dir(kind)?;
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", dir.display()))?
        {
            if !entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }
}

fn validate_id(id: &str) -> anyhow::Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        bail!("invalid artifact id {id:?}");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry with a linearly growing pause before every attempt,
/// including the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            base_delay: Duration::from_secs(9),
        }
    }
}

impl RetryPolicy {
    /// Pause before `attempt` (1-based): `base_delay * attempt`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("timed out rendering {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    Throttled { status: u16, url: String },
    #[error("selector {selector} matched nothing on {url}")]
    SelectorNotFound { selector: String, url: String },
    #[error("invalid selector {selector}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
}

impl RenderError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout { .. } | Self::Throttled { .. } | Self::SelectorNotFound { .. } => {
                RetryDisposition::Retryable
            }
            Self::InvalidSelector { .. } | Self::Navigation { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Capability to load a page and read the inner markup of one region.
/// Every call is a fresh session.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render_inner_html(&self, url: &str, selector: &str) -> Result<String, RenderError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Renderer for server-rendered pages: plain GET, then selection over the
/// returned document.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn render_inner_html(&self, url: &str, selector: &str) -> Result<String, RenderError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(url, err))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }

        let body = resp.text().await.map_err(|err| classify_reqwest_error(url, err))?;
        select_inner_html(&body, url, selector)
    }
}

/// Render error for a non-success response.
pub fn status_error(url: &str, status: StatusCode) -> RenderError {
    match classify_status(status) {
        RetryDisposition::Retryable => RenderError::Throttled {
            status: status.as_u16(),
            url: url.to_string(),
        },
        RetryDisposition::NonRetryable => RenderError::Navigation {
            url: url.to_string(),
            message: format!("http status {}", status.as_u16()),
        },
    }
}

fn classify_reqwest_error(url: &str, err: reqwest::Error) -> RenderError {
    if err.is_timeout() {
        RenderError::Timeout { url: url.to_string() }
    } else {
        RenderError::Navigation {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Inner markup of the first element matching `selector` in `document`.
pub fn select_inner_html(document: &str, url: &str, selector: &str) -> Result<String, RenderError> {
    let sel = Selector::parse(selector).map_err(|e| RenderError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })?;
    let html = Html::parse_document(document);
    html.select(&sel)
        .next()
        .map(|el| el.inner_html())
        .ok_or_else(|| RenderError::SelectorNotFound {
            selector: selector.to_string(),
            url: url.to_string(),
        })
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Throttled, retrying front end over a [`PageRenderer`].
#[derive(Clone)]
pub struct Fetcher {
    renderer: Arc<dyn PageRenderer>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(renderer: Arc<dyn PageRenderer>, policy: RetryPolicy) -> Self {
        Self { renderer, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fetch the resource's selected region. Retryable render failures are
    /// retried up to the budget, after which the outcome is
    /// [`FetchOutcome::Exhausted`]; any other failure returns immediately.
    pub async fn fetch(&self, resource: &CrawlResource) -> Result<FetchOutcome, FetchError> {
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_before_attempt(attempt);
            if !delay.is_zero() {
                let delay_ms = delay.as_millis() as u64;
                debug!(id = %resource.id, attempt, delay_ms, "throttling before fetch");
                tokio::time::sleep(delay).await;
            }

            info!(url = %resource.url, kind = %resource.kind, attempt, "fetching");
            match self
                .renderer
                .render_inner_html(&resource.url, &resource.selector)
                .await
            {
                Ok(markup) => return Ok(FetchOutcome::Fragment(markup)),
                Err(err) if err.disposition() == RetryDisposition::Retryable => {
                    warn!(id = %resource.id, attempt, error = %err, "retryable fetch failure");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(
            id = %resource.id,
            attempts = self.policy.max_attempts,
            "retry budget exhausted"
        );
        Ok(FetchOutcome::Exhausted {
            attempts: self.policy.max_attempts,
        })
    }
}
