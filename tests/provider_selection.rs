//! Integration tests for provider selection, fallback, and the cache-aware
//! speak path, using an in-crate mock backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use sonara::core::cache::{AudioCache, CacheEntryMetadata, CacheKeyParams, KeyNormalizer};
use sonara::core::tts::{
    Availability, MetricsSnapshot, ProviderConfigPatch, ProviderHealth, ProviderInfo,
    ProviderRegistration, ProviderRegistry, SpeakOptions, SpeakOutput, TtsProvider,
};
use sonara::errors::{ErrorKind, ProviderError, ProviderResult};
use sonara::{SpeechConfig, SpeechService};

/// Backend double that performs the real cache lifecycle but fakes the
/// upstream call, counting how often it is reached.
struct MockBackend {
    name: &'static str,
    available: bool,
    cache: Option<Arc<AudioCache>>,
    normalizer: KeyNormalizer,
    upstream_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TtsProvider for MockBackend {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name,
            display_name: self.name,
            requires_api_key: false,
            supported_features: vec!["speech"],
            supported_formats: vec!["mp3"],
            supported_languages: vec!["en"],
            rate_limit: None,
            supports_streaming: false,
            supports_ssml: false,
            quality: 70,
        }
    }

    async fn is_available(&self, _correlation_id: &str) -> Availability {
        if self.available {
            Availability::available(1)
        } else {
            Availability::unavailable("mock marked unavailable")
        }
    }

    async fn speak(
        &self,
        text: &str,
        options: &SpeakOptions,
        correlation_id: &str,
    ) -> ProviderResult<SpeakOutput> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ProviderError::new(
                ErrorKind::InvalidRequest,
                self.name,
                correlation_id,
                "text must not be empty",
            ));
        }

        let key = self.cache.as_ref().map(|_| {
            self.normalizer.derive(&CacheKeyParams {
                provider: self.name,
                text: trimmed,
                model: "mock-model",
                voice: "mock-voice",
                speed: options.speed,
                format: &options.format,
                extra_params: options.extra_params.as_ref(),
            })
        });

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Ok(Some(entry)) = cache.get(key, correlation_id).await {
                return Ok(SpeakOutput {
                    audio: entry.data,
                    format: options.format.clone(),
                    cached: true,
                    provider: self.name,
                    duration: Duration::ZERO,
                });
            }
        }

        // "Upstream" synthesis
        self.upstream_calls.fetch_add(1, Ordering::SeqCst);
        let audio = Bytes::from(format!("audio::{trimmed}"));

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            let metadata = CacheEntryMetadata {
                provider: self.name.to_string(),
                voice: "mock-voice".to_string(),
                model: Some("mock-model".to_string()),
                speed: Some(options.speed),
                format: Some(options.format.clone()),
                text: Some(trimmed.to_string()),
                created_at: 0,
                size_bytes: 0,
                correlation_id: correlation_id.to_string(),
            };
            cache
                .set(key, audio.clone(), metadata)
                .await
                .map_err(|e| {
                    ProviderError::new(ErrorKind::Unknown, self.name, correlation_id, e.to_string())
                })?;
        }

        Ok(SpeakOutput {
            audio,
            format: options.format.clone(),
            cached: false,
            provider: self.name,
            duration: Duration::ZERO,
        })
    }

    async fn configure(&self, _patch: ProviderConfigPatch) {}

    async fn health_status(&self, correlation_id: &str) -> ProviderHealth {
        ProviderHealth {
            state: sonara::core::tts::HealthState::Healthy,
            recent_error_rate: 0.0,
            average_response_time_ms: 0,
            availability: self.is_available(correlation_id).await,
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
}

struct Fixture {
    service: SpeechService,
    alpha_calls: Arc<AtomicUsize>,
    beta_calls: Arc<AtomicUsize>,
    _dir: TempDir,
}

fn fixture(alpha_available: bool, beta_available: bool, allow_fallback: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = SpeechConfig::default();
    config.cache.cache_dir = dir.path().to_path_buf();
    config.allow_fallback = allow_fallback;

    let cache = Arc::new(AudioCache::new(config.cache.clone()));
    let mut registry = ProviderRegistry::new(config.clone(), Some(Arc::clone(&cache)));

    let alpha_calls = Arc::new(AtomicUsize::new(0));
    let beta_calls = Arc::new(AtomicUsize::new(0));

    for (name, priority, available, calls) in [
        ("alpha", 10, alpha_available, Arc::clone(&alpha_calls)),
        ("beta", 5, beta_available, Arc::clone(&beta_calls)),
    ] {
        let normalization = config.normalization.clone();
        let cache_for_mock = Arc::clone(&cache);
        let backend = Arc::new(MockBackend {
            name,
            available,
            cache: Some(cache_for_mock),
            normalizer: KeyNormalizer::new(normalization),
            upstream_calls: calls,
        });
        registry.register(ProviderRegistration::new(
            name,
            priority,
            true,
            Box::new(move |_config, _cache| {
                let provider: Arc<dyn TtsProvider> = backend.clone();
                Ok(provider)
            }),
        ));
    }

    Fixture {
        service: SpeechService::with_registry(config, cache, registry),
        alpha_calls,
        beta_calls,
        _dir: dir,
    }
}

#[tokio::test]
async fn unnamed_request_selects_highest_available_priority() {
    let fixture = fixture(false, true, true);

    let result = fixture
        .service
        .speak("hello fallback", &SpeakOptions::default())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.provider.as_deref(), Some("beta"));
    // No explicit provider was requested, so this is not a fallback
    assert!(!result.is_fallback);
    assert_eq!(result.alternatives_considered, vec!["alpha", "beta"]);
    assert_eq!(fixture.beta_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.alpha_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn explicit_provider_falls_back_when_unavailable() {
    let fixture = fixture(false, true, true);

    let options = SpeakOptions {
        provider: Some("alpha".to_string()),
        ..Default::default()
    };
    let result = fixture.service.speak("explicit request", &options).await;

    assert!(result.success);
    assert_eq!(result.provider.as_deref(), Some("beta"));
    assert!(result.is_fallback);
    assert_eq!(result.alternatives_considered, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn fallback_disabled_surfaces_the_original_failure() {
    let fixture = fixture(false, true, false);

    let options = SpeakOptions {
        provider: Some("alpha".to_string()),
        ..Default::default()
    };
    let result = fixture.service.speak("no fallback", &options).await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ServiceUnavailable));
    assert_eq!(fixture.beta_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_speak_is_served_from_cache() {
    let fixture = fixture(true, true, true);
    let options = SpeakOptions::default();

    let first = fixture.service.speak("cache me", &options).await;
    assert!(first.success);
    assert!(!first.cached);

    let second = fixture.service.speak("cache me", &options).await;
    assert!(second.success);
    assert!(second.cached, "second call should be a cache hit");
    assert_eq!(second.audio, first.audio);

    // Exactly one upstream synthesis happened
    assert_eq!(fixture.alpha_calls.load(Ordering::SeqCst), 1);

    let stats = fixture.service.cache_stats().await.unwrap();
    assert!(stats.api_calls_saved >= 1);
}

#[tokio::test]
async fn normalized_variants_share_one_cache_entry() {
    let fixture = fixture(true, true, true);
    let options = SpeakOptions::default();

    let first = fixture
        .service
        .speak("high priority:  Hello   World", &options)
        .await;
    assert!(first.success);

    // Same logical request after normalization: prefix stripped, whitespace
    // collapsed, case folded
    let second = fixture.service.speak("hello world", &options).await;
    assert!(second.success);
    assert!(second.cached);
    assert_eq!(fixture.alpha_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_text_triggers_no_provider_or_cache_activity() {
    let fixture = fixture(true, true, true);

    let result = fixture.service.speak("   ", &SpeakOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::InvalidRequest));
    assert!(result.correlation_id.is_none());
    assert_eq!(fixture.alpha_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.beta_calls.load(Ordering::SeqCst), 0);

    let stats = fixture.service.cache_stats().await.unwrap();
    assert_eq!(stats.requests, 0);
}

#[tokio::test]
async fn preload_populates_cache_for_later_speak() {
    let fixture = fixture(true, true, true);
    let options = SpeakOptions::default();

    let preload = fixture.service.preload("warm me up", &options).await;
    assert!(preload.success);
    assert!(!preload.cached);

    let spoken = fixture.service.speak("warm me up", &options).await;
    assert!(spoken.success);
    assert!(spoken.cached);
    assert_eq!(fixture.alpha_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn health_status_covers_cache_and_providers() {
    let fixture = fixture(true, false, true);

    let health = fixture.service.health_status().await;
    assert!(health.cache.directory_accessible);
    assert_eq!(health.providers.len(), 2);

    let beta = health
        .providers
        .iter()
        .find(|(name, _)| name == "beta")
        .map(|(_, health)| health)
        .unwrap();
    assert!(!beta.availability.available);
}
