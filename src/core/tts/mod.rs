pub mod base;
pub mod elevenlabs;
pub mod engine;
pub mod openai;
pub mod rate_limit;
pub mod registry;
pub mod retry;

use std::sync::Arc;

pub use base::{
    Availability, HealthState, MetricsSnapshot, ProviderConfigPatch, ProviderHealth,
    ProviderInfo, SharedProvider, SpeakOptions, SpeakOutput, TtsProvider,
};
pub use elevenlabs::{ElevenLabsTts, ELEVENLABS_TTS_URL};
pub use engine::{ProviderEngine, SynthesisRequest};
pub use openai::{OpenAiTts, OPENAI_TTS_URL};
pub use rate_limit::RateLimiter;
pub use registry::{
    ProviderRegistration, ProviderRegistry, ProviderSelection, SelectionCriteria,
};
pub use retry::RetryPolicy;

use crate::config::SpeechConfig;
use crate::core::cache::AudioCache;
use crate::errors::{ErrorKind, ProviderError, ProviderResult};

/// Factory function to create a single TTS provider instance.
///
/// Most callers want [`ProviderRegistry::with_builtins`] instead, which adds
/// priority-based fallback on top of the same backends.
///
/// # Supported Providers
///
/// - `"elevenlabs"` - ElevenLabs REST TTS API
/// - `"openai"` - OpenAI `/v1/audio/speech` endpoint
pub fn create_tts_provider(
    provider_type: &str,
    config: &SpeechConfig,
    cache: Option<Arc<AudioCache>>,
) -> ProviderResult<SharedProvider> {
    match provider_type.to_lowercase().as_str() {
        "elevenlabs" => Ok(Arc::new(ElevenLabsTts::new(config, cache)?)),
        "openai" => Ok(Arc::new(OpenAiTts::new(config, cache)?)),
        other => Err(ProviderError::new(
            ErrorKind::Configuration,
            other,
            "",
            format!(
                "Unsupported TTS provider: {other}. Supported providers: elevenlabs, openai"
            ),
        )),
    }
}
