//! Local roster cache + retrying HTTP client for the customer API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bpre_core::CustomerRecord;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "bpre-storage";

/// In-memory copy of one store's roster that optimistic writers update ahead
/// of the remote call. Writers only ever touch the entry keyed by their own
/// customer id; the mutex is held for single map operations only.
#[derive(Debug, Default)]
pub struct RosterCache {
    state: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    records: HashMap<String, CustomerRecord>,
    stale: bool,
    generation: u64,
}

/// A cached entry as it stood before an optimistic write, tagged with the
/// roster generation it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorEntry {
    pub record: CustomerRecord,
    pub generation: u64,
}

impl RosterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached roster with a fresh snapshot from the source of truth.
    pub async fn replace(&self, records: Vec<CustomerRecord>) {
        let mut state = self.state.lock().await;
        state.records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        state.stale = false;
        state.generation += 1;
    }

    pub async fn get(&self, customer_id: &str) -> Option<CustomerRecord> {
        self.state.lock().await.records.get(customer_id).cloned()
    }

    pub async fn active_flag(&self, customer_id: &str) -> Option<bool> {
        self.state
            .lock()
            .await
            .records
            .get(customer_id)
            .map(|r| r.active)
    }

    /// Write `active` into the cached entry and hand back the entry as it was
    /// before the write. `None` when the customer is not cached.
    pub async fn set_active(&self, customer_id: &str, active: bool) -> Option<PriorEntry> {
        let mut state = self.state.lock().await;
        let generation = state.generation;
        let entry = state.records.get_mut(customer_id)?;
        let record = entry.clone();
        entry.active = active;
        Some(PriorEntry { record, generation })
    }

    /// Put a captured entry back, unless the roster was replaced since it was
    /// captured. Returns whether the entry was written.
    pub async fn restore(&self, prior: PriorEntry) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != prior.generation {
            return false;
        }
        state.records.insert(prior.record.id.clone(), prior.record);
        true
    }

    /// Mark the roster for refetch. Cached entries stay readable until replaced.
    pub async fn invalidate(&self) {
        self.state.lock().await.stale = true;
    }

    pub async fn is_stale(&self) -> bool {
        self.state.lock().await.stale
    }

    /// Bumped on every [`RosterCache::replace`].
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }
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
    if err.is_timeout() || err.is_connect() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
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

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on requests in flight through this client.
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            bearer_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        detail: Option<String>,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

impl FetchError {
    /// Server-reported detail for failed responses, if the body carried one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            FetchError::HttpStatus { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }
}

/// Pull a human-readable message out of an error body: `message`, `error` or
/// `detail` from a JSON object, otherwise the trimmed text.
pub fn server_detail(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for key in ["message", "error", "detail"] {
            match value.get(key) {
                Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                    return Some(s.trim().to_string())
                }
                Some(serde_json::Value::Array(items)) if !items.is_empty() => {
                    let joined = items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Some(joined);
                }
                _ => {}
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.chars().take(512).collect())
    }
}

#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.filter(|t| !t.trim().is_empty()),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = self.endpoint(path);
        let span = info_span!("api_get", url = %url);
        let body = self
            .send_with_retry(&url, || self.authorized(self.client.get(&url).query(query)))
            .instrument(span)
            .await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode { url, source })
    }

    pub async fn post_json<B, T>(&self, path: &str, payload: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path);
        let span = info_span!("api_post", url = %url);
        let body = self
            .send_with_retry(&url, || self.authorized(self.client.post(&url).json(payload)))
            .instrument(span)
            .await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode { url, source })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    let retryable = classify_status(status) == RetryDisposition::Retryable;
                    if retryable && attempt < self.backoff.max_retries {
                        tracing::debug!(status = status.as_u16(), attempt, "retrying api call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        detail: server_detail(&body),
                    });
                }
                Err(err) => {
                    let retryable = classify_reqwest_error(&err) == RetryDisposition::Retryable;
                    if retryable && attempt < self.backoff.max_retries {
                        tracing::debug!(error = %err, attempt, "retrying api call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
