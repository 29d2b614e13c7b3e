//! # TTS Provider Contract
//!
//! This module defines the capability trait implemented by every speech
//! backend, plus the option/result/health types shared across the provider
//! layer. Backends are opaque collaborators: the cache and registry only see
//! this interface.
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use sonara::core::tts::{SpeakOptions, TtsProvider};
//!
//! async fn synthesize(provider: &dyn TtsProvider) {
//!     let options = SpeakOptions {
//!         voice: Some("alloy".to_string()),
//!         format: "mp3".to_string(),
//!         ..Default::default()
//!     };
//!     match provider.speak("Hello, world!", &options, "corr-1").await {
//!         Ok(output) => println!("got {} bytes (cached: {})", output.audio.len(), output.cached),
//!         Err(err) => eprintln!("synthesis failed: {err}"),
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::errors::ProviderError;

/// Static description of a backend's capabilities, used for selection
/// criteria matching and observability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub requires_api_key: bool,
    pub supported_features: Vec<&'static str>,
    pub supported_formats: Vec<&'static str>,
    pub supported_languages: Vec<&'static str>,
    /// Advisory requests-per-minute limit, when the backend documents one.
    pub rate_limit: Option<u32>,
    pub supports_streaming: bool,
    pub supports_ssml: bool,
    /// Relative output quality on a 0-100 scale, for `min_quality` criteria.
    pub quality: u8,
}

/// Per-request synthesis options.
#[derive(Debug, Clone)]
pub struct SpeakOptions {
    /// Explicit provider name; `None` lets the registry pick by priority.
    pub provider: Option<String>,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub speed: f32,
    pub format: String,
    /// Provider-specific extras; participate in cache key derivation.
    pub extra_params: Option<BTreeMap<String, String>>,
    pub use_cache: bool,
}

impl Default for SpeakOptions {
    fn default() -> Self {
        Self {
            provider: None,
            voice: None,
            model: None,
            speed: 1.0,
            format: "mp3".to_string(),
            extra_params: None,
            use_cache: true,
        }
    }
}

/// Successful synthesis output.
#[derive(Debug, Clone)]
pub struct SpeakOutput {
    pub audio: Bytes,
    pub format: String,
    /// True when the audio came from the cache and no network call was made.
    pub cached: bool,
    pub provider: &'static str,
    pub duration: Duration,
}

/// Result of the cheap availability probe. The probe is side-effect free and
/// does not perform a full upstream round-trip.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub response_time_ms: u64,
    /// Unix milliseconds of this probe.
    pub last_checked: u64,
}

impl Availability {
    pub fn available(response_time_ms: u64) -> Self {
        Self {
            available: true,
            reason: None,
            response_time_ms,
            last_checked: unix_ms_now(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
            response_time_ms: 0,
            last_checked: unix_ms_now(),
        }
    }
}

/// Rolled-up health state derived from running metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Recent error rate above 50% or responses slower than 5 seconds.
    Degraded,
    /// The availability probe itself failed.
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub state: HealthState,
    pub recent_error_rate: f64,
    pub average_response_time_ms: u64,
    pub availability: Availability,
}

/// Snapshot of a provider's running counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: u64,
    /// Errors inside the sliding window (default five minutes).
    pub recent_errors: usize,
}

/// Partial configuration merged into a live provider instance.
///
/// `configure` may be called any number of times over the provider's
/// lifetime; unset fields leave the current value untouched.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfigPatch {
    pub api_key: Option<String>,
    pub default_voice: Option<String>,
    pub default_model: Option<String>,
    pub min_request_interval: Option<Duration>,
}

/// Capability contract implemented by every speech backend.
///
/// Backends consult the audio cache before any network work, so repeated
/// requests for the same normalized parameters cost one upstream call.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Static capability description.
    fn info(&self) -> ProviderInfo;

    /// Cheap, side-effect-free probe: is this backend usable right now?
    ///
    /// A missing credential makes the provider unavailable rather than an
    /// error; the registry uses this to drive fallback.
    async fn is_available(&self, correlation_id: &str) -> Availability;

    /// Synthesize `text`.
    ///
    /// Empty or whitespace-only text is a terminal `invalid_request` failure
    /// with no cache or network activity. Retryable upstream failures are
    /// retried internally with exponential backoff before surfacing.
    async fn speak(
        &self,
        text: &str,
        options: &SpeakOptions,
        correlation_id: &str,
    ) -> Result<SpeakOutput, ProviderError>;

    /// Merge a partial configuration into the live instance.
    async fn configure(&self, patch: ProviderConfigPatch);

    /// Health derived from the availability probe plus running metrics.
    async fn health_status(&self, correlation_id: &str) -> ProviderHealth;

    /// Snapshot of the per-instance counters.
    fn metrics(&self) -> MetricsSnapshot;
}

impl std::fmt::Debug for dyn TtsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsProvider")
            .field("name", &self.info().name)
            .finish()
    }
}

/// Shared trait-object handle used by the registry.
pub type SharedProvider = Arc<dyn TtsProvider>;

pub(crate) fn unix_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
