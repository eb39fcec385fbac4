// src/downloader.rs

use crate::limiter::SpeedLimiter;
use crate::progress::{Progress, ProgressCallback, ProgressMeter};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{redirect, Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors a transfer can end with.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The server answered with a 4xx/5xx (or an unusable 3xx). Never retried.
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String, body: String },
    #[error("download stalled after {downloaded} bytes")]
    Stalled { downloaded: u64 },
    #[error("download cancelled")]
    Cancelled,
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the attempt loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Stalled { .. } | TransferError::Io(_) => true,
            TransferError::Network(e) => !e.is_builder(),
            _ => false,
        }
    }
}

/// Tunables for [`Transfer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub stall_timeout_ms: u64,
    pub progress_interval_ms: u64,
    /// Pause before retrying after a network or disk error. Stalls retry at once.
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_redirects: usize,
    /// Characters of an error response body kept for diagnostics.
    pub error_body_limit: usize,
    pub user_agent: String,
    /// Bytes per second across all transfers sharing this instance, 0 = unlimited.
    pub speed_limit: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stall_timeout_ms: 30_000,
            progress_interval_ms: 250,
            retry_delay_ms: 2_000,
            connect_timeout_ms: 30_000,
            max_redirects: 10,
            error_body_limit: 2_000,
            user_agent: "ModelManager/1.0".to_string(),
            speed_limit: 0,
        }
    }
}

impl TransferConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Per-call parameters of [`Transfer::fetch`].
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Sent on every request to the original host; dropped after a cross-host redirect.
    pub headers: Vec<(String, String)>,
    /// Explicit resume offset. When `None`, the size of an existing file at the
    /// destination is used.
    pub resume_from: Option<u64>,
    pub cancel: CancellationToken,
    pub on_progress: Option<ProgressCallback>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn resume_from(mut self, offset: u64) -> Self {
        self.resume_from = Some(offset);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(std::sync::Arc::new(callback));
        self
    }

    fn report(&self, progress: Progress) {
        if let Some(callback) = &self.on_progress {
            callback(progress);
        }
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header values are usually credentials.
        let names: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("TransferOptions")
            .field("headers", &names)
            .field("resume_from", &self.resume_from)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Resumable HTTP(S) fetcher. Cheap to clone; clones share the connection
/// pool and the bandwidth limiter.
#[derive(Debug, Clone)]
pub struct Transfer {
    client: Client,
    config: TransferConfig,
    limiter: Option<SpeedLimiter>,
}

impl Transfer {
    pub fn new(config: TransferConfig) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .redirect(redirect::Policy::none())
            .build()?;
        let limiter = (config.speed_limit > 0).then(|| SpeedLimiter::new(config.speed_limit));

        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    /// Downloads `url` into `destination`, resuming and retrying as needed.
    ///
    /// A partial file is never deleted, whatever the outcome. HTTP errors and
    /// cancellation end the call at once; stalls and network/disk errors are
    /// retried up to `max_retries` times, each retry resuming from the bytes
    /// already on disk.
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        options: TransferOptions,
    ) -> Result<(), TransferError> {
        let url = parse_url(url)?;
        let mut resume_from = match options.resume_from {
            Some(offset) => offset,
            None => file_len(destination).await.unwrap_or(0),
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!(url = %url, attempt, resume_from, "starting transfer attempt");

            let err = match self.fetch_once(&url, destination, &options, resume_from).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(url = %url, attempt, "transfer succeeded after retry");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(url = %url, attempt, error = %err, "transfer failed, not retrying");
                return Err(err);
            }
            if attempt > self.config.max_retries {
                warn!(url = %url, attempts = attempt, error = %err, "transfer failed after retries");
                return Err(err);
            }

            match &err {
                TransferError::Stalled { downloaded } => {
                    resume_from = *downloaded;
                    warn!(
                        url = %url,
                        resume_from,
                        retry = attempt,
                        max_retries = self.config.max_retries,
                        "transfer stalled, retrying"
                    );
                }
                _ => {
                    // The file may have grown since the attempt started.
                    if let Some(len) = file_len(destination).await {
                        resume_from = len;
                    }
                    warn!(
                        url = %url,
                        resume_from,
                        retry = attempt,
                        max_retries = self.config.max_retries,
                        error = %err,
                        "transfer error, retrying"
                    );
                    tokio::select! {
                        _ = options.cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_delay()) => {}
                    }
                }
            }
        }
    }

    /// GETs `url` into memory. No resume, stall detection or retries; meant
    /// for small metadata payloads.
    pub async fn fetch_to_memory(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Bytes, TransferError> {
        let url = parse_url(url)?;
        let response = self.send(&url, headers, 0).await?;
        if !response.status().is_success() {
            return Err(self.http_error(response).await);
        }
        Ok(response.bytes().await?)
    }

    async fn fetch_once(
        &self,
        url: &Url,
        destination: &Path,
        options: &TransferOptions,
        resume_from: u64,
    ) -> Result<(), TransferError> {
        if options.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let response = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => return Err(TransferError::Cancelled),
            sent = tokio::time::timeout(
                self.config.stall_timeout(),
                self.send(url, &options.headers, resume_from),
            ) => match sent {
                Ok(response) => response?,
                Err(_) => return Err(TransferError::Stalled { downloaded: resume_from }),
            },
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE
            && resume_from > 0
            && content_range_total(response.headers()) == Some(resume_from)
        {
            debug!(url = %url, size = resume_from, "destination already complete");
            options.report(ProgressMeter::new(resume_from, resume_from).snapshot());
            return Ok(());
        }
        if !status.is_success() {
            return tokio::select! {
                biased;
                _ = options.cancel.cancelled() => Err(TransferError::Cancelled),
                err = self.http_error(response) => Err(err),
            };
        }

        let partial = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let offset = if partial { resume_from } else { 0 };
        let total = total_size(response.headers(), offset);
        if resume_from > 0 && !partial {
            debug!(url = %url, resume_from, "server ignored range request, starting over");
        }

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = if partial {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(destination)
                .await?
        } else {
            File::create(destination).await?
        };

        let mut meter = ProgressMeter::new(offset, total);
        let streamed = self.stream_body(response, &mut file, &mut meter, options).await;
        // Flush on every path so a later resume sees what was received.
        let flushed = file.flush().await;

        streamed?;
        flushed?;
        options.report(meter.snapshot());
        debug!(url = %url, downloaded = meter.downloaded(), "transfer attempt complete");
        Ok(())
    }

    /// Copies the body into `file`. The stall deadline and the progress ticker
    /// are locals, so both die with this call on every exit path.
    async fn stream_body(
        &self,
        response: Response,
        file: &mut File,
        meter: &mut ProgressMeter,
        options: &TransferOptions,
    ) -> Result<(), TransferError> {
        let stall_timeout = self.config.stall_timeout();
        let mut body = response.bytes_stream();

        let mut ticker = tokio::time::interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stall = tokio::time::sleep(stall_timeout);
        tokio::pin!(stall);

        loop {
            tokio::select! {
                biased;
                _ = options.cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = &mut stall => {
                    return Err(TransferError::Stalled { downloaded: meter.downloaded() });
                }
                _ = ticker.tick() => options.report(meter.snapshot()),
                chunk = body.next() => {
                    let Some(chunk) = chunk else {
                        return Ok(());
                    };
                    let chunk = chunk?;
                    if let Some(limiter) = &self.limiter {
                        tokio::select! {
                            _ = options.cancel.cancelled() => return Err(TransferError::Cancelled),
                            _ = limiter.take(chunk.len() as u64) => {}
                        }
                    }
                    file.write_all(&chunk).await?;
                    meter.record(chunk.len());
                    stall.as_mut().reset(Instant::now() + stall_timeout);
                }
            }
        }
    }

    /// GET with manual redirect handling, so custom headers never follow a
    /// redirect to another host.
    async fn send(
        &self,
        url: &Url,
        headers: &[(String, String)],
        resume_from: u64,
    ) -> Result<Response, TransferError> {
        let mut current = url.clone();
        let mut forward_headers = true;

        for _ in 0..=self.config.max_redirects {
            let mut request = self.client.get(current.clone());
            if forward_headers {
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }
            }
            if resume_from > 0 {
                request = request.header(RANGE, format!("bytes={resume_from}-"));
            }

            let response = request.send().await?;
            let Some(next) = redirect_target(&current, &response)? else {
                return Ok(response);
            };

            let same_host = next.host_str() == current.host_str();
            if forward_headers && !same_host && !headers.is_empty() {
                debug!(from = %current, to = %next, "cross-host redirect, dropping custom headers");
            }
            forward_headers &= same_host;
            debug!(status = response.status().as_u16(), location = %next, "following redirect");
            current = next;
        }

        Err(TransferError::TooManyRedirects(self.config.max_redirects))
    }

    /// Builds the error for a non-success reply. The body is read for at most
    /// one stall timeout and kept to `error_body_limit` characters.
    async fn http_error(&self, response: Response) -> TransferError {
        let status = response.status().as_u16();
        let url = response.url().to_string();

        let limit = self.config.error_body_limit;
        // A UTF-8 character is at most 4 bytes.
        let byte_cap = limit.saturating_mul(4);
        let mut raw = Vec::new();
        let mut stream = response.bytes_stream();
        let read = async {
            while raw.len() < byte_cap {
                match stream.next().await {
                    Some(Ok(chunk)) => raw.extend_from_slice(&chunk),
                    _ => break,
                }
            }
        };
        if tokio::time::timeout(self.config.stall_timeout(), read).await.is_err() {
            debug!(url = %url, status, "error body not received in time, keeping what arrived");
        }

        let body = String::from_utf8_lossy(&raw).chars().take(limit).collect();
        TransferError::Http { status, url, body }
    }
}

pub(crate) fn parse_url(url: &str) -> Result<Url, TransferError> {
    let parsed = Url::parse(url).map_err(|e| TransferError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(TransferError::InvalidUrl(format!(
            "{url}: unsupported scheme {scheme}"
        ))),
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

fn redirect_target(current: &Url, response: &Response) -> Result<Option<Url>, TransferError> {
    if !response.status().is_redirection() {
        return Ok(None);
    }
    let Some(location) = response.headers().get(LOCATION) else {
        return Ok(None);
    };
    let location = location
        .to_str()
        .map_err(|_| TransferError::InvalidUrl("non-ascii Location header".into()))?;
    current
        .join(location)
        .map(Some)
        .map_err(|e| TransferError::InvalidUrl(format!("{location}: {e}")))
}

/// Total from `Content-Range: bytes a-b/<total>`; `None` if absent or `*`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Expected final file size, 0 when unknown.
fn total_size(headers: &HeaderMap, offset: u64) -> u64 {
    if headers.contains_key(CONTENT_RANGE) {
        return content_range_total(headers).unwrap_or(0);
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| len + offset)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(reqwest::header::HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn total_prefers_content_range() {
        let map = headers(&[
            (CONTENT_RANGE, "bytes 40-99/100"),
            (CONTENT_LENGTH, "60"),
        ]);
        assert_eq!(total_size(&map, 40), 100);
    }

    #[test]
    fn unknown_content_range_total_is_zero() {
        let map = headers(&[(CONTENT_RANGE, "bytes 40-99/*"), (CONTENT_LENGTH, "60")]);
        assert_eq!(total_size(&map, 40), 0);
    }

    #[test]
    fn content_length_adds_offset() {
        let map = headers(&[(CONTENT_LENGTH, "60")]);
        assert_eq!(total_size(&map, 40), 100);
        assert_eq!(total_size(&HeaderMap::new(), 40), 0);
    }

    #[test]
    fn range_not_satisfiable_total() {
        let map = headers(&[(CONTENT_RANGE, "bytes */2048")]);
        assert_eq!(content_range_total(&map), Some(2048));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(TransferError::Stalled { downloaded: 10 }.is_retryable());
        assert!(TransferError::Io(std::io::Error::other("disk")).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(!TransferError::TooManyRedirects(10).is_retryable());
        assert!(!TransferError::Http {
            status: 404,
            url: "http://example.com".into(),
            body: String::new(),
        }
        .is_retryable());
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            parse_url("ftp://example.com/model.safetensors"),
            Err(TransferError::InvalidUrl(_))
        ));
        assert!(matches!(parse_url("not a url"), Err(TransferError::InvalidUrl(_))));
        assert!(parse_url("https://example.com/model.safetensors").is_ok());
    }

    #[test]
    fn options_debug_hides_header_values() {
        let options = TransferOptions::new().header("Authorization", "Bearer secret");
        let rendered = format!("{options:?}");
        assert!(rendered.contains("Authorization"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn default_config_matches_policy() {
        let config = TransferConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stall_timeout(), Duration::from_secs(30));
        assert_eq!(config.progress_interval(), Duration::from_millis(250));
        assert_eq!(config.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.max_redirects, 10);
        assert_eq!(config.error_body_limit, 2_000);
    }
}
