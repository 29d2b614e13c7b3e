//! Shared request lifecycle for HTTP-backed TTS providers.
//!
//! Every concrete backend is a thin [`SynthesisRequest`] builder over this
//! engine. The engine owns the full path: input validation, cache lookup,
//! rate limiting, the upstream call, typed error classification, retry with
//! exponential backoff, cache population, and per-instance metrics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::{NormalizationOptions, RetrySettings};
use crate::core::cache::{AudioCache, CacheEntryMetadata, CacheKeyParams, KeyNormalizer};
use crate::errors::{ErrorKind, ProviderError, ProviderResult};
use crate::utils::req_manager::{ReqManager, ReqManagerConfig};

use super::base::{
    Availability, HealthState, MetricsSnapshot, ProviderHealth, SpeakOptions, SpeakOutput,
};
use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;

/// Errors recorded within this window count toward the recent error rate.
const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Recent error rate above this degrades the provider's health.
const DEGRADED_ERROR_RATE: f64 = 0.5;
/// Average response time above this degrades the provider's health.
const DEGRADED_RESPONSE_TIME: Duration = Duration::from_secs(5);

/// Provider-specific request construction and wire-level error mapping.
///
/// This is the only part a concrete backend implements; everything else in
/// the synthesis path is shared.
pub trait SynthesisRequest: Send + Sync {
    /// Build the HTTP request with provider-specific URL, headers and body.
    fn build_http_request(
        &self,
        client: &reqwest::Client,
        text: &str,
        options: &SpeakOptions,
    ) -> reqwest::RequestBuilder;

    /// Voice that will actually be requested (after defaulting).
    fn resolved_voice(&self) -> &str;

    /// Model that will actually be requested (after defaulting).
    fn resolved_model(&self) -> &str;

    /// Classify a non-success HTTP status.
    ///
    /// The default mapping covers the usual REST conventions; backends with
    /// unusual wire formats override this where they know better.
    fn classify_status(&self, status: StatusCode, _body: &str) -> ErrorKind {
        match status.as_u16() {
            401 | 403 => ErrorKind::Authentication,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            400 | 404 | 413 | 415 | 422 => ErrorKind::InvalidRequest,
            500 | 502 | 503 | 504 => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Per-instance running counters plus a sliding error-timestamp window.
#[derive(Debug, Default)]
pub(crate) struct EngineMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_time_ms: AtomicU64,
    windows: Mutex<MetricWindows>,
}

#[derive(Debug, Default)]
struct MetricWindows {
    errors: VecDeque<Instant>,
    requests: VecDeque<Instant>,
}

impl EngineMetrics {
    fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut windows = self.windows.lock();
        windows.requests.push_back(Instant::now());
        trim_window(&mut windows.requests);
    }

    fn record_success(&self, elapsed: Duration) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, elapsed: Duration) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        let mut windows = self.windows.lock();
        windows.errors.push_back(Instant::now());
        trim_window(&mut windows.errors);
    }

    /// Errors divided by requests, both within the sliding window.
    fn recent_error_rate(&self) -> f64 {
        let mut windows = self.windows.lock();
        trim_window(&mut windows.errors);
        trim_window(&mut windows.requests);
        if windows.requests.is_empty() {
            return 0.0;
        }
        windows.errors.len() as f64 / windows.requests.len() as f64
    }

    fn average_response_time(&self) -> Duration {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_response_time_ms.load(Ordering::Relaxed) / total)
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let recent_errors = {
            let mut windows = self.windows.lock();
            trim_window(&mut windows.errors);
            windows.errors.len()
        };
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            average_response_time_ms: self.average_response_time().as_millis() as u64,
            recent_errors,
        }
    }
}

fn trim_window(window: &mut VecDeque<Instant>) {
    let Some(cutoff) = Instant::now().checked_sub(ERROR_WINDOW) else {
        return;
    };
    while window.front().is_some_and(|t| *t < cutoff) {
        window.pop_front();
    }
}

/// Shared synthesis engine embedded by every concrete backend.
pub struct ProviderEngine {
    name: &'static str,
    cache: Option<Arc<AudioCache>>,
    normalizer: KeyNormalizer,
    limiter: RateLimiter,
    retry: RetryPolicy,
    req_manager: Arc<ReqManager>,
    metrics: EngineMetrics,
}

impl ProviderEngine {
    pub fn new(
        name: &'static str,
        cache: Option<Arc<AudioCache>>,
        normalization: NormalizationOptions,
        retry: &RetrySettings,
        min_request_interval: Duration,
    ) -> ProviderResult<Self> {
        let req_manager = ReqManager::with_config(ReqManagerConfig::default()).map_err(|e| {
            ProviderError::new(
                ErrorKind::Configuration,
                name,
                "",
                format!("failed to build HTTP client: {e}"),
            )
        })?;
        Ok(Self {
            name,
            cache,
            normalizer: KeyNormalizer::new(normalization),
            limiter: RateLimiter::new(min_request_interval),
            retry: RetryPolicy::from(retry),
            req_manager: Arc::new(req_manager),
            metrics: EngineMetrics::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run the full synthesis lifecycle for one request.
    pub async fn synthesize<B: SynthesisRequest>(
        &self,
        builder: &B,
        text: &str,
        options: &SpeakOptions,
        correlation_id: &str,
    ) -> ProviderResult<SpeakOutput> {
        let started = Instant::now();

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ProviderError::new(
                ErrorKind::InvalidRequest,
                self.name,
                correlation_id,
                "text must not be empty",
            ));
        }

        // Cache first: a hit skips rate limiting and the network entirely
        let cache_key = self.cache_key(builder, trimmed, options);
        if let Some((cache, key)) = &cache_key {
            match cache.get(key, correlation_id).await {
                Ok(Some(entry)) => {
                    debug!(
                        provider = self.name,
                        correlation_id,
                        bytes = entry.data.len(),
                        "serving synthesis from cache"
                    );
                    return Ok(SpeakOutput {
                        audio: entry.data,
                        format: entry
                            .metadata
                            .format
                            .unwrap_or_else(|| options.format.clone()),
                        cached: true,
                        provider: self.name,
                        duration: started.elapsed(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    // A broken cache must not block synthesis
                    warn!(provider = self.name, correlation_id, error = %e, "cache lookup failed");
                }
            }
        }

        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            self.metrics.record_request();
            let attempt_started = Instant::now();

            match self
                .attempt_request(builder, trimmed, options, correlation_id)
                .await
            {
                Ok(audio) => {
                    self.metrics.record_success(attempt_started.elapsed());
                    self.limiter.on_success();

                    if let Some((cache, key)) = &cache_key {
                        let metadata = CacheEntryMetadata {
                            provider: self.name.to_string(),
                            voice: builder.resolved_voice().to_string(),
                            model: Some(builder.resolved_model().to_string()),
                            speed: Some(options.speed),
                            format: Some(options.format.clone()),
                            text: Some(trimmed.to_string()),
                            created_at: 0,
                            size_bytes: 0,
                            correlation_id: correlation_id.to_string(),
                        };
                        if let Err(e) = cache.set(key, audio.clone(), metadata).await {
                            warn!(provider = self.name, correlation_id, error = %e, "failed to cache synthesis result");
                        }
                    }

                    return Ok(SpeakOutput {
                        audio,
                        format: options.format.clone(),
                        cached: false,
                        provider: self.name,
                        duration: started.elapsed(),
                    });
                }
                Err(err) => {
                    self.metrics.record_failure(attempt_started.elapsed());
                    if matches!(err.kind, ErrorKind::RateLimit | ErrorKind::ServiceUnavailable) {
                        self.limiter.on_throttled();
                    }

                    if err.is_retryable() && self.retry.has_budget_after(attempt) {
                        let delay = err
                            .retry_after
                            .unwrap_or_else(|| self.retry.delay_for(attempt));
                        debug!(
                            provider = self.name,
                            correlation_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            kind = %err.kind,
                            "retrying after upstream failure"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    warn!(
                        provider = self.name,
                        correlation_id,
                        attempt,
                        kind = %err.kind,
                        "synthesis failed terminally"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// One upstream call, with typed classification of every failure path.
    async fn attempt_request<B: SynthesisRequest>(
        &self,
        builder: &B,
        text: &str,
        options: &SpeakOptions,
        correlation_id: &str,
    ) -> ProviderResult<Bytes> {
        let guard = self.req_manager.acquire().await.map_err(|e| {
            ProviderError::new(
                ErrorKind::Unknown,
                self.name,
                correlation_id,
                format!("request slot unavailable: {e}"),
            )
        })?;

        let request = builder.build_http_request(guard.client(), text, options);
        let response = request
            .send()
            .await
            .map_err(|e| self.classify_transport_error(&e, correlation_id))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let kind = builder.classify_status(status, &body);
            let mut err = ProviderError::new(
                kind,
                self.name,
                correlation_id,
                format!("upstream returned {status}: {}", truncate(&body, 200)),
            )
            .with_status(status.as_u16());
            if let Some(delay) = retry_after {
                err = err.with_retry_after(delay);
            }
            return Err(err);
        }

        response.bytes().await.map_err(|e| {
            ProviderError::new(
                ErrorKind::Network,
                self.name,
                correlation_id,
                format!("failed to read response body: {e}"),
            )
        })
    }

    fn classify_transport_error(&self, error: &reqwest::Error, correlation_id: &str) -> ProviderError {
        let kind = if error.is_timeout() {
            ErrorKind::Timeout
        } else if error.is_connect() || error.is_request() || error.is_body() {
            ErrorKind::Network
        } else {
            ErrorKind::Unknown
        };
        ProviderError::new(kind, self.name, correlation_id, error.to_string())
    }

    fn cache_key<B: SynthesisRequest>(
        &self,
        builder: &B,
        text: &str,
        options: &SpeakOptions,
    ) -> Option<(Arc<AudioCache>, String)> {
        if !options.use_cache {
            return None;
        }
        let cache = self.cache.as_ref()?;
        let key = self.normalizer.derive(&CacheKeyParams {
            provider: self.name,
            text,
            model: builder.resolved_model(),
            voice: builder.resolved_voice(),
            speed: options.speed,
            format: &options.format,
            extra_params: options.extra_params.as_ref(),
        });
        Some((Arc::clone(cache), key))
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Roll running metrics and a fresh availability probe into one health
    /// verdict.
    pub fn health_from(&self, availability: Availability) -> ProviderHealth {
        let recent_error_rate = self.metrics.recent_error_rate();
        let average = self.metrics.average_response_time();
        let state = if !availability.available {
            HealthState::Unhealthy
        } else if recent_error_rate > DEGRADED_ERROR_RATE || average > DEGRADED_RESPONSE_TIME {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        ProviderHealth {
            state,
            recent_error_rate,
            average_response_time_ms: average.as_millis() as u64,
            availability,
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
