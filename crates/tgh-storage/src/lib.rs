//! Snapshot persistence and paced page fetching.

use std::fmt::Display;
use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tgh-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub file_name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// Directory of snapshot files. Every write fully replaces its target.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Write through a temp file in the target directory, then rename over the target.
    pub fn write(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredSnapshot> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))?;

        let path = self.path_for(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let result = (|| {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
            file.write_all(bytes)
                .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("syncing temp snapshot {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &path).with_context(|| {
                format!(
                    "renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        Ok(StoredSnapshot {
            file_name: file_name.to_string(),
            path,
            sha256: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
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

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

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
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy's retries are spent, returning the last error.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(label, attempt, ?delay, error = %err, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacing shared by all fetches of one client.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last_refill) = &mut *state;
                if !self.refill_every.is_zero() {
                    let refills = last_refill.elapsed().as_nanos() / self.refill_every.as_nanos();
                    if refills > 0 {
                        *tokens = tokens
                            .saturating_add(u32::try_from(refills).unwrap_or(u32::MAX))
                            .min(self.capacity);
                        *last_refill = Instant::now();
                    }
                } else {
                    *tokens = self.capacity;
                }

                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                self.refill_every.saturating_sub(last_refill.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(1),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    token_bucket: Option<TokenBucket>,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            token_bucket: config.token_bucket.map(TokenBucket::new),
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query`, retrying throttling and transient failures.
    pub async fn fetch_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, FetchError> {
        let span = info_span!("page_fetch", url, ?query);
        async {
            let mut attempt = 0;
            loop {
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }

                let retryable = match self.client.get(url).query(query).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            debug!(%status, "page fetched");
                            return resp.text().await.map_err(FetchError::from);
                        }
                        let err = FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        };
                        (classify_status(status) == RetryDisposition::Retryable, err)
                    }
                    Err(err) => (
                        classify_reqwest_error(&err) == RetryDisposition::Retryable,
                        FetchError::Request(err),
                    ),
                };

                match retryable {
                    (true, err) if attempt < self.backoff.max_retries => {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, ?delay, error = %err, "page fetch failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    (_, err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}
