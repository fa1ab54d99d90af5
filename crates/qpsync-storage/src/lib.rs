//! Raw extraction archive + retrying HTTP client for qpsync.

use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "qpsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    /// The same bytes were already archived under this path.
    pub deduplicated: bool,
}

/// Write-once archive of raw survey payloads, addressed by content hash.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `{YYYYmmdd_HHMMSS}/{survey_id}/{sha256}.{ext}` under the archive root.
    pub fn relative_path(
        fetched_at: DateTime<Utc>,
        survey_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        Path::new(&fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(survey_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archive `value` as pretty JSON.
    pub async fn store_json<T: Serialize + ?Sized>(
        &self,
        fetched_at: DateTime<Utc>,
        survey_id: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing raw responses")?;
        let content_hash = sha256_hex(&bytes);
        let relative_path = Self::relative_path(fetched_at, survey_id, &content_hash, "json");
        let absolute_path = self.root.join(&relative_path);
        let deduplicated = write_once(&absolute_path, &bytes).await?;
        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated,
        })
    }
}

/// Stage next to `target` and rename into place. Returns `true` when `target`
/// already existed and nothing was written.
async fn write_once(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let dir = target
        .parent()
        .with_context(|| format!("archive path {} has no parent", target.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating archive directory {}", dir.display()))?;

    if fs::try_exists(target)
        .await
        .with_context(|| format!("probing {}", target.display()))?
    {
        return Ok(true);
    }

    let staging = dir.join(format!(".{}.partial", Uuid::new_v4().simple()));
    fs::write(&staging, bytes)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;
    if let Err(err) = fs::rename(&staging, target).await {
        let _ = fs::remove_file(&staging).await;
        return Err(err).with_context(|| format!("moving archive into {}", target.display()));
    }
    Ok(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Timeouts and connection failures are transient; everything else is final.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// The last error from a retried operation, with how many attempts were made.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: usize,
    pub error: E,
}

/// Delay before retry `n` (0-based) is `base_delay * 2^n`, never above `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn uncapped(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::MAX,
        }
    }

    pub fn delay_for_attempt(&self, retry_index: usize) -> Duration {
        let factor = u32::try_from(retry_index)
            .ok()
            .and_then(|exp| 2u32.checked_pow(exp))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Call `op` with a 1-based attempt number until it succeeds, fails with a
    /// non-retryable error, or the retry budget is spent.
    pub async fn retry<T, E, F, Fut, C>(
        &self,
        operation: &str,
        mut op: F,
        classify: C,
    ) -> Result<T, RetryFailure<E>>
    where
        E: Display,
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDisposition,
    {
        let mut attempt = 1usize;
        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let retries_used = attempt - 1;
            if retries_used >= self.max_retries
                || classify(&error) == RetryDisposition::NonRetryable
            {
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                });
            }
            let delay = self.delay_for_attempt(retries_used);
            warn!(operation, attempt, ?delay, error = %error, "attempt failed; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// GET client that retries transport failures only.
///
/// Any HTTP status is handed back to the caller; deciding what a non-success
/// status means is the caller's job.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().map_err(FetchError::Client)?,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str, headers: &HeaderMap) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.backoff
            .retry("http get", |_| self.send_once(url, headers), classify_reqwest_error)
            .instrument(span)
            .await
            .map_err(|failure| FetchError::Request {
                url: url.to_string(),
                attempts: failure.attempts,
                source: failure.error,
            })
    }

    async fn send_once(&self, url: &str, headers: &HeaderMap) -> Result<FetchedResponse, reqwest::Error> {
        let resp = self.client.get(url).headers(headers.clone()).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse { status, body })
    }
}
