//! Top-level programmatic API: synthesis with caching, provider selection,
//! and graceful fallback.
//!
//! [`SpeechService`] wires the audio cache into a provider registry and
//! exposes the non-panicking surface callers use: [`SpeechService::speak`],
//! [`SpeechService::preload`], cache statistics, cleanup, and health. All
//! terminal failures come back as a structured [`SpeakResult`] so calling
//! code branches on `success` instead of catching errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SpeechConfig;
use crate::core::cache::{
    AudioCache, CacheHealth, CacheResult, CacheStats, CleanupReport,
};
use crate::core::tts::{
    ProviderHealth, ProviderRegistry, SelectionCriteria, SpeakOptions,
};
use crate::errors::{ErrorKind, ProviderError};

/// Structured outcome of a `speak`/`preload` call.
///
/// `success == false` carries the classified failure instead of panicking or
/// bubbling an error type. `correlation_id` is `None` exactly when the input
/// was rejected before any work began.
#[derive(Debug, Clone)]
pub struct SpeakResult {
    pub success: bool,
    pub cached: bool,
    pub provider: Option<String>,
    pub audio: Option<Bytes>,
    pub format: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub correlation_id: Option<String>,
    /// True when an explicitly requested provider was replaced by another.
    pub is_fallback: bool,
    /// Provider names considered during selection, in order.
    pub alternatives_considered: Vec<String>,
    pub duration: Duration,
}

impl SpeakResult {
    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            success: false,
            cached: false,
            provider: None,
            audio: None,
            format: None,
            error: Some(message.into()),
            error_kind: Some(ErrorKind::InvalidRequest),
            correlation_id: None,
            is_fallback: false,
            alternatives_considered: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    fn from_error(
        err: ProviderError,
        correlation_id: String,
        alternatives_considered: Vec<String>,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            cached: false,
            provider: Some(err.provider.clone()),
            audio: None,
            format: None,
            error: Some(err.message.clone()),
            error_kind: Some(err.kind),
            correlation_id: Some(correlation_id),
            is_fallback: false,
            alternatives_considered,
            duration,
        }
    }
}

/// Combined health view: the cache plus every enabled provider.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub cache: CacheHealth,
    pub providers: Vec<(String, ProviderHealth)>,
}

/// Orchestrates cache and providers behind one handle.
pub struct SpeechService {
    config: SpeechConfig,
    cache: Arc<AudioCache>,
    registry: Arc<ProviderRegistry>,
}

impl SpeechService {
    /// Build a service with the built-in provider registry.
    pub fn new(config: SpeechConfig) -> Self {
        let cache = Arc::new(AudioCache::new(config.cache.clone()));
        let registry = Arc::new(ProviderRegistry::with_builtins(
            config.clone(),
            Some(Arc::clone(&cache)),
        ));
        Self {
            config,
            cache,
            registry,
        }
    }

    /// Build a service from environment variables.
    pub fn from_env() -> Self {
        Self::new(SpeechConfig::from_env())
    }

    /// Build a service around a caller-assembled registry (custom backends,
    /// test doubles).
    pub fn with_registry(
        config: SpeechConfig,
        cache: Arc<AudioCache>,
        registry: ProviderRegistry,
    ) -> Self {
        Self {
            config,
            cache,
            registry: Arc::new(registry),
        }
    }

    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Synthesize `text`, consulting the cache before any upstream call.
    pub async fn speak(&self, text: &str, options: &SpeakOptions) -> SpeakResult {
        self.synthesize("speak", text, options).await
    }

    /// Populate the cache for `text` without any playback concern. Identical
    /// synthesis path to [`speak`](Self::speak); the audio still comes back
    /// so callers can discard or store it.
    pub async fn preload(&self, text: &str, options: &SpeakOptions) -> SpeakResult {
        self.synthesize("preload", text, options).await
    }

    async fn synthesize(
        &self,
        operation: &'static str,
        text: &str,
        options: &SpeakOptions,
    ) -> SpeakResult {
        let started = Instant::now();

        // Rejected before a correlation id is allocated or any cache work runs
        if text.trim().is_empty() {
            return SpeakResult::invalid_input("text must not be empty");
        }

        let correlation_id = Uuid::new_v4().to_string();
        let requested = options
            .provider
            .as_deref()
            .or(self.config.default_provider.as_deref());
        let criteria = SelectionCriteria {
            allow_fallback: Some(self.config.allow_fallback),
            ..Default::default()
        };

        let selection = match self
            .registry
            .get_provider(requested, &criteria, &correlation_id)
            .await
        {
            Ok(selection) => selection,
            Err(err) => {
                warn!(correlation_id, operation, error = %err, "provider selection failed");
                return SpeakResult::from_error(err, correlation_id, Vec::new(), started.elapsed());
            }
        };

        debug!(
            correlation_id,
            operation,
            provider = %selection.name,
            is_fallback = selection.is_fallback,
            "provider selected"
        );

        match selection
            .provider
            .speak(text, options, &correlation_id)
            .await
        {
            Ok(output) => {
                info!(
                    correlation_id,
                    operation,
                    provider = %selection.name,
                    cached = output.cached,
                    bytes = output.audio.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "synthesis completed"
                );
                SpeakResult {
                    success: true,
                    cached: output.cached,
                    provider: Some(selection.name),
                    audio: Some(output.audio),
                    format: Some(output.format),
                    error: None,
                    error_kind: None,
                    correlation_id: Some(correlation_id),
                    is_fallback: selection.is_fallback,
                    alternatives_considered: selection.alternatives_considered,
                    duration: started.elapsed(),
                }
            }
            Err(err) => {
                warn!(correlation_id, operation, provider = %selection.name, error = %err, "synthesis failed");
                let mut result = SpeakResult::from_error(
                    err,
                    correlation_id,
                    selection.alternatives_considered,
                    started.elapsed(),
                );
                result.is_fallback = selection.is_fallback;
                result
            }
        }
    }

    /// Aggregate cache statistics.
    pub async fn cache_stats(&self) -> CacheResult<CacheStats> {
        self.cache.stats().await
    }

    /// Remove every cached entry.
    pub async fn clear_cache(&self) -> CacheResult<()> {
        self.cache.clear().await
    }

    /// One cleanup sweep: expired entries, corrupt pairs, limit enforcement.
    pub async fn cleanup(&self) -> CacheResult<CleanupReport> {
        let correlation_id = Uuid::new_v4().to_string();
        self.cache.cleanup(&correlation_id).await
    }

    /// Health of the cache and of every enabled provider.
    pub async fn health_status(&self) -> ServiceHealth {
        let correlation_id = Uuid::new_v4().to_string();
        ServiceHealth {
            cache: self.cache.health_check().await,
            providers: self.registry.health_statuses(&correlation_id).await,
        }
    }

    /// Spawn the periodic cache cleanup task.
    pub fn start_cleanup_task(&self) -> JoinHandle<()> {
        self.cache.start_cleanup_task()
    }
}
