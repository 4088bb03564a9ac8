//! HTTP transport, upstream quota tracking and raw response archiving for pubgsync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pubgsync-storage";

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw upstream response bodies.
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

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn response_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        resource: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let resource = resource.trim_matches('/').replace('/', "_");
        let resource = if resource.is_empty() { "root".to_string() } else { resource };
        PathBuf::from(stamp)
            .join(resource)
            .join(format!("{content_hash}.json"))
    }

    /// Store a response body under a hash-addressed path, writing through a temp file and rename.
    pub async fn store_response(
        &self,
        fetched_at: DateTime<Utc>,
        resource: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedResponse> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = self.response_relative_path(fetched_at, resource, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedResponse {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: body.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), body.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    QuotaExceeded,
    Failed,
}

pub fn classify_status(status: StatusCode) -> ResponseClass {
    if status.is_success() {
        ResponseClass::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseClass::QuotaExceeded
    } else {
        ResponseClass::Failed
    }
}

/// Delay schedule for retrying quota-exceeded requests.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Rate-limit metadata reported by the upstream on each response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        fn header<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        }

        let remaining = header::<u32>(headers, RATE_LIMIT_REMAINING_HEADER)?;
        let reset_epoch = header::<i64>(headers, RATE_LIMIT_RESET_HEADER)?;
        Some(Self {
            limit: header(headers, RATE_LIMIT_LIMIT_HEADER),
            remaining,
            reset_at: DateTime::from_timestamp(reset_epoch, 0)?,
        })
    }

    /// How long a caller must hold off at `now` before the next request is permitted.
    pub fn wait_duration(&self, now: DateTime<Utc>, margin: Duration) -> Duration {
        if self.remaining > 0 {
            return Duration::ZERO;
        }
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        (self.reset_at + margin - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota wait of {wait:?} would pass the deadline")]
    DeadlineExceeded { wait: Duration },
}

/// Tracks the upstream quota from the most recent response and gates quota-bound requests.
#[derive(Debug)]
pub struct QuotaLimiter {
    margin: Duration,
    state: Mutex<Option<QuotaSnapshot>>,
}

impl QuotaLimiter {
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            state: Mutex::new(None),
        }
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    pub async fn observe(&self, snapshot: QuotaSnapshot) {
        *self.state.lock().await = Some(snapshot);
    }

    pub async fn snapshot(&self) -> Option<QuotaSnapshot> {
        *self.state.lock().await
    }

    /// Wait until a request is permitted, or fail fast when the wait would pass `deadline`.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<(), QuotaError> {
        let mut state = self.state.lock().await;
        let wait = state
            .as_ref()
            .map(|s| s.wait_duration(Utc::now(), self.margin))
            .unwrap_or(Duration::ZERO);

        if wait.is_zero() {
            if let Some(snapshot) = state.as_mut() {
                snapshot.remaining = snapshot.remaining.saturating_sub(1);
            }
            return Ok(());
        }

        if let Some(deadline) = deadline {
            if Instant::now() + wait > deadline {
                return Err(QuotaError::DeadlineExceeded { wait });
            }
        }

        info!(wait_ms = wait.as_millis() as u64, "upstream quota exhausted, waiting for reset");
        tokio::time::sleep(wait).await;
        *state = None;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub accept: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            accept: None,
            global_concurrency: 16,
        }
    }
}

/// Issues single-attempt GET requests; retry decisions belong to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn class(&self) -> ResponseClass {
        classify_status(self.status)
    }

    pub fn quota(&self) -> Option<QuotaSnapshot> {
        QuotaSnapshot::from_headers(&self.headers)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http client is shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building authorization header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(accept) = &config.accept {
            headers.insert(
                ACCEPT,
                HeaderValue::from_str(accept).context("building accept header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn get(
        &self,
        resource: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", resource, url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let headers = resp.headers().clone();
            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                headers,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
