use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use scdp_core::{ContentHint, RawDocument, SourceRef};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

use crate::CancelToken;

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub declared_length: Option<u64>,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportFailure {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

/// One GET round-trip. Retries, integrity and pacing live in [`HttpFetcher`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportFailure>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportFailure::Connect(err.to_string())
    } else {
        TransportFailure::Other(err.to_string())
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportFailure> {
        let resp = self.client.get(url).send().await.map_err(classify_reqwest_error)?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let declared_length = resp.content_length();
        let body = resp.bytes().await.map_err(classify_reqwest_error)?.to_vec();
        Ok(TransportResponse {
            status,
            final_url,
            content_type,
            declared_length,
            retry_after,
            body,
        })
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the backoff delay randomised in either direction (0 disables jitter).
    pub jitter: f64,
    pub rate_limit_delay: Duration,
    pub max_rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
            rate_limit_delay: Duration::from_secs(30),
            max_rate_limit_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// `sample` is a uniform draw from `[0, 1)`.
    pub fn jittered_delay(&self, attempt_index: usize, sample: f64) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let scale = 1.0 + jitter * (2.0 * sample.clamp(0.0, 1.0) - 1.0);
        base.mul_f64(scale.max(0.0))
    }

    /// Delay after a 429. Honors the server hint, bounded below by the normal
    /// base delay and above by `max_rate_limit_delay`.
    pub fn rate_limited_delay(&self, hint: Option<Duration>) -> Duration {
        hint.map(|h| h.max(self.base_delay))
            .unwrap_or(self.rate_limit_delay)
            .min(self.max_rate_limit_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntegrityPolicy {
    pub min_body_bytes: usize,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        Self { min_body_bytes: 1 }
    }
}

impl IntegrityPolicy {
    pub fn check(&self, hint: ContentHint, resp: &TransportResponse) -> Result<(), String> {
        if resp.body.len() < self.min_body_bytes.max(1) {
            return Err(format!(
                "body of {} bytes is below the minimum of {}",
                resp.body.len(),
                self.min_body_bytes.max(1)
            ));
        }
        if let Some(declared) = resp.declared_length {
            if declared != resp.body.len() as u64 {
                return Err(format!(
                    "truncated body: declared {declared} bytes, received {}",
                    resp.body.len()
                ));
            }
        }
        let looks_pdf = hint == ContentHint::Pdf
            || resp
                .content_type
                .as_deref()
                .is_some_and(|ct| ContentHint::from_content_type(ct) == ContentHint::Pdf);
        if looks_pdf && !resp.body.starts_with(b"%PDF-") {
            return Err("pdf payload is missing the %PDF- header".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    Timeout,
    RateLimited,
    Transport,
    Integrity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryEvent {
    pub attempt: usize,
    pub reason: RetryReason,
    pub delay: Duration,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub document: RawDocument,
    pub retries: Vec<RetryEvent>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out fetching {url} after {attempts} attempts")]
    Timeout { url: String, attempts: usize },
    #[error("{url} not found (http {status})")]
    NotFound { url: String, status: u16 },
    #[error("rate limited by {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: usize },
    #[error("transport error for {url} after {attempts} attempts: {reason}")]
    Transport {
        url: String,
        attempts: usize,
        reason: String,
    },
    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

enum StatusClass {
    Success,
    NotFound,
    RateLimited,
    Timeout,
    Retryable,
    Fatal,
}

fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        404 | 410 => StatusClass::NotFound,
        429 => StatusClass::RateLimited,
        408 | 504 => StatusClass::Timeout,
        500..=599 => StatusClass::Retryable,
        _ => StatusClass::Fatal,
    }
}

struct AttemptFailure {
    reason: RetryReason,
    detail: String,
    retry_after: Option<Duration>,
}

impl AttemptFailure {
    fn new(reason: RetryReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
            retry_after: None,
        }
    }

    fn into_error(self, url: &str, attempts: usize) -> FetchError {
        let url = url.to_string();
        match self.reason {
            RetryReason::Timeout => FetchError::Timeout { url, attempts },
            RetryReason::RateLimited => FetchError::RateLimited { url, attempts },
            RetryReason::Transport | RetryReason::Integrity => FetchError::Transport {
                url,
                attempts,
                reason: self.detail,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub retry: RetryPolicy,
    pub integrity: IntegrityPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 4,
            per_host_concurrency: 2,
            retry: RetryPolicy::default(),
            integrity: IntegrityPolicy::default(),
        }
    }
}

pub struct HttpFetcher {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
    integrity: IntegrityPolicy,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("per_host_limit", &self.per_host_limit)
            .field("retry", &self.retry)
            .field("integrity", &self.integrity)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config.timeout, config.user_agent.as_deref())?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: FetcherConfig) -> Self {
        Self {
            transport,
            sleeper: Arc::new(TokioSleeper),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            retry: config.retry,
            integrity: config.integrity,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn per_host_semaphore(&self, url: &str) -> Arc<Semaphore> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let mut map = self.per_host.lock().await;
        map.entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch(&self, source: &SourceRef, cancel: &CancelToken) -> Result<Fetched, FetchError> {
        let span = info_span!("http_fetch", source_id = %source.source_id, url = %source.url);
        self.fetch_inner(source, cancel).instrument(span).await
    }

    async fn fetch_inner(&self, source: &SourceRef, cancel: &CancelToken) -> Result<Fetched, FetchError> {
        let url = source.url.as_str();
        let cancelled = || FetchError::Cancelled {
            url: url.to_string(),
        };

        let mut retries = Vec::new();
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            let result = {
                let _global = self.global_limit.acquire().await.map_err(|_| cancelled())?;
                let per_host = self.per_host_semaphore(url).await;
                let _host = per_host.acquire().await.map_err(|_| cancelled())?;
                self.transport.get(url).await
            };

            let failure = match result {
                Ok(resp) => match classify_status(resp.status) {
                    StatusClass::Success => match self.integrity.check(source.content_hint, &resp) {
                        Ok(()) => {
                            let document = RawDocument::new(
                                source.clone(),
                                resp.status,
                                resp.content_type,
                                resp.body,
                                Utc::now(),
                            );
                            return Ok(Fetched { document, retries });
                        }
                        Err(detail) => AttemptFailure::new(RetryReason::Integrity, detail),
                    },
                    StatusClass::NotFound => {
                        return Err(FetchError::NotFound {
                            url: url.to_string(),
                            status: resp.status,
                        })
                    }
                    StatusClass::RateLimited => AttemptFailure {
                        reason: RetryReason::RateLimited,
                        detail: "http status 429".to_string(),
                        retry_after: resp.retry_after,
                    },
                    StatusClass::Timeout => {
                        AttemptFailure::new(RetryReason::Timeout, format!("http status {}", resp.status))
                    }
                    StatusClass::Retryable => {
                        AttemptFailure::new(RetryReason::Transport, format!("http status {}", resp.status))
                    }
                    StatusClass::Fatal => {
                        return Err(FetchError::Transport {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            reason: format!("http status {}", resp.status),
                        })
                    }
                },
                Err(TransportFailure::Timeout(detail)) => AttemptFailure::new(RetryReason::Timeout, detail),
                Err(TransportFailure::Connect(detail)) | Err(TransportFailure::Other(detail)) => {
                    AttemptFailure::new(RetryReason::Transport, detail)
                }
            };

            if attempt >= self.retry.max_retries {
                return Err(failure.into_error(url, attempt + 1));
            }

            let delay = match failure.reason {
                RetryReason::RateLimited => self.retry.rate_limited_delay(failure.retry_after),
                _ => self.retry.jittered_delay(attempt, rand::random::<f64>()),
            };
            warn!(
                attempt = attempt + 1,
                reason = ?failure.reason,
                delay_ms = delay.as_millis() as u64,
                detail = %failure.detail,
                "fetch attempt failed; retrying"
            );
            retries.push(RetryEvent {
                attempt: attempt + 1,
                reason: failure.reason,
                delay,
                detail: failure.detail,
            });

            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = cancel.cancelled() => return Err(cancelled()),
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct ScriptedTransport {
        script: StdMutex<VecDeque<Result<TransportResponse, TransportFailure>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<TransportResponse, TransportFailure>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<TransportResponse, TransportFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportFailure::Other(format!("script exhausted for {url}"))))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: StdMutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    struct CancellingSleeper {
        token: CancelToken,
    }

    #[async_trait]
    impl Sleeper for CancellingSleeper {
        async fn sleep(&self, _duration: Duration) {
            self.token.cancel();
            std::future::pending::<()>().await;
        }
    }

    fn response(status: u16, body: &[u8]) -> Result<TransportResponse, TransportFailure> {
        Ok(TransportResponse {
            status,
            final_url: "https://example.test/list".to_string(),
            content_type: Some("text/html; charset=utf-8".to_string()),
            declared_length: None,
            retry_after: None,
            body: body.to_vec(),
        })
    }

    fn source() -> SourceRef {
        SourceRef::new("alrajhi-main", "https://example.test/list", ContentHint::Html)
    }

    fn config(max_retries: usize) -> FetcherConfig {
        FetcherConfig {
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(350),
                jitter: 0.0,
                rate_limit_delay: Duration::from_secs(10),
                max_rate_limit_delay: Duration::from_secs(60),
            },
            ..FetcherConfig::default()
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = config(5).retry;
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..config(3).retry
        };
        assert_eq!(policy.jittered_delay(0, 0.5), Duration::from_millis(100));
        assert_eq!(policy.jittered_delay(0, 0.0), Duration::from_millis(50));
        assert!(policy.jittered_delay(0, 0.999) <= Duration::from_millis(150));
    }

    #[test]
    fn rate_limit_delay_honors_and_clamps_hint() {
        let policy = config(3).retry;
        assert_eq!(policy.rate_limited_delay(None), Duration::from_secs(10));
        assert_eq!(policy.rate_limited_delay(Some(Duration::from_secs(3))), Duration::from_secs(3));
        assert_eq!(policy.rate_limited_delay(Some(Duration::from_secs(600))), Duration::from_secs(60));
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn rate_limited_twice_then_success_records_two_retries() {
        let transport = ScriptedTransport::new(vec![
            response(429, b""),
            response(429, b""),
            response(200, b"<table></table>"),
        ]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fetcher = HttpFetcher::with_transport(transport.clone(), config(3)).with_sleeper(sleeper.clone());

        let fetched = fetcher.fetch(&source(), &CancelToken::new()).await.expect("fetch succeeds");

        assert_eq!(transport.calls(), 3);
        assert_eq!(fetched.retries.len(), 2);
        assert!(fetched.retries.iter().all(|r| r.reason == RetryReason::RateLimited));
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_secs(10), Duration::from_secs(10)]
        );
        assert_eq!(fetched.document.body(), b"<table></table>");
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let transport = ScriptedTransport::new(vec![response(404, b"gone")]);
        let fetcher = HttpFetcher::with_transport(transport.clone(), config(3))
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let err = fetcher.fetch(&source(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn empty_bodies_are_retried_then_reported_as_transport_errors() {
        let transport = ScriptedTransport::new(vec![response(200, b""), response(200, b""), response(200, b"")]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let fetcher = HttpFetcher::with_transport(transport.clone(), config(2)).with_sleeper(sleeper.clone());
        let err = fetcher.fetch(&source(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport { attempts: 3, .. }));
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn truncated_pdf_is_retried() {
        let mut truncated = response(200, b"<html>error page</html>").unwrap();
        truncated.content_type = Some("application/pdf".into());
        let mut good = response(200, b"%PDF-1.4 body").unwrap();
        good.content_type = Some("application/pdf".into());
        let transport = ScriptedTransport::new(vec![Ok(truncated), Ok(good)]);
        let fetcher = HttpFetcher::with_transport(transport, config(3))
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let pdf = SourceRef::new("report", "https://example.test/r.pdf", ContentHint::Pdf);
        let fetched = fetcher.fetch(&pdf, &CancelToken::new()).await.expect("second attempt ok");
        assert_eq!(fetched.retries.len(), 1);
        assert_eq!(fetched.retries[0].reason, RetryReason::Integrity);
    }

    #[tokio::test]
    async fn declared_length_mismatch_is_an_integrity_failure() {
        let mut resp = response(200, b"abc").unwrap();
        resp.declared_length = Some(10);
        assert!(IntegrityPolicy::default().check(ContentHint::Html, &resp).is_err());
        resp.declared_length = Some(3);
        assert!(IntegrityPolicy::default().check(ContentHint::Html, &resp).is_ok());
    }

    #[tokio::test]
    async fn timeouts_exhaust_into_timeout_error() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportFailure::Timeout("slow".into())),
            Err(TransportFailure::Timeout("slow".into())),
        ]);
        let fetcher = HttpFetcher::with_transport(transport, config(1))
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let err = fetcher.fetch(&source(), &CancelToken::new()).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Timeout {
                url: "https://example.test/list".into(),
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_does_not_touch_transport() {
        let transport = ScriptedTransport::new(vec![response(200, b"ok")]);
        let fetcher = HttpFetcher::with_transport(transport.clone(), config(3));
        let token = CancelToken::new();
        token.cancel();
        let err = fetcher.fetch(&source(), &token).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_is_observed_during_backoff() {
        let transport = ScriptedTransport::new(vec![response(503, b""), response(200, b"ok")]);
        let token = CancelToken::new();
        let fetcher = HttpFetcher::with_transport(transport.clone(), config(3))
            .with_sleeper(Arc::new(CancellingSleeper { token: token.clone() }));
        let err = fetcher.fetch(&source(), &token).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert_eq!(transport.calls(), 1);
    }
}
