//! OpenAI speech backend over the shared synthesis engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use crate::config::SpeechConfig;
use crate::core::cache::AudioCache;
use crate::errors::{ErrorKind, ProviderError, ProviderResult};

use super::base::{
    Availability, MetricsSnapshot, ProviderConfigPatch, ProviderHealth, ProviderInfo,
    SpeakOptions, SpeakOutput, TtsProvider,
};
use super::engine::{ProviderEngine, SynthesisRequest};

pub const OPENAI_TTS_URL: &str = "https://api.openai.com/v1/audio/speech";

const DEFAULT_VOICE: &str = "alloy";
const DEFAULT_MODEL: &str = "tts-1";

/// Formats the speech endpoint accepts directly.
const RESPONSE_FORMATS: [&str; 6] = ["mp3", "opus", "aac", "flac", "wav", "pcm"];

#[derive(Debug, Clone)]
struct OpenAiConfig {
    api_key: Option<String>,
    default_voice: String,
    default_model: String,
}

/// Map the generic format name onto the endpoint's `response_format`.
fn response_format_for(format: &str) -> &'static str {
    let lowered = format.to_ascii_lowercase();
    RESPONSE_FORMATS
        .iter()
        .find(|f| lowered.contains(*f))
        .copied()
        .unwrap_or("mp3")
}

#[derive(Clone)]
struct OpenAiRequest {
    api_key: String,
    voice: String,
    model: String,
}

impl SynthesisRequest for OpenAiRequest {
    fn build_http_request(
        &self,
        client: &reqwest::Client,
        text: &str,
        options: &SpeakOptions,
    ) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "speed": options.speed,
            "response_format": response_format_for(&options.format),
        });
        client
            .post(OPENAI_TTS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
    }

    fn resolved_voice(&self) -> &str {
        &self.voice
    }

    fn resolved_model(&self) -> &str {
        &self.model
    }
}

/// OpenAI TTS provider using the `/v1/audio/speech` REST endpoint.
pub struct OpenAiTts {
    engine: ProviderEngine,
    config: RwLock<OpenAiConfig>,
}

impl OpenAiTts {
    pub fn new(config: &SpeechConfig, cache: Option<Arc<AudioCache>>) -> ProviderResult<Self> {
        let engine = ProviderEngine::new(
            "openai",
            cache,
            config.normalization.clone(),
            &config.retry,
            Duration::from_millis(50),
        )?;
        Ok(Self {
            engine,
            config: RwLock::new(OpenAiConfig {
                api_key: config.openai_api_key.clone(),
                default_voice: DEFAULT_VOICE.to_string(),
                default_model: DEFAULT_MODEL.to_string(),
            }),
        })
    }

    fn request_for(
        &self,
        options: &SpeakOptions,
        correlation_id: &str,
    ) -> ProviderResult<OpenAiRequest> {
        let config = self.config.read().clone();
        let api_key = config.api_key.ok_or_else(|| {
            ProviderError::new(
                ErrorKind::Configuration,
                "openai",
                correlation_id,
                "API key is required for OpenAI speech",
            )
        })?;
        Ok(OpenAiRequest {
            api_key,
            voice: options.voice.clone().unwrap_or(config.default_voice),
            model: options.model.clone().unwrap_or(config.default_model),
        })
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "openai",
            display_name: "OpenAI Speech",
            requires_api_key: true,
            supported_features: vec!["speech", "speed-control"],
            supported_formats: vec!["mp3", "opus", "aac", "flac", "wav", "pcm"],
            supported_languages: vec![
                "en", "de", "es", "fr", "it", "pt", "nl", "ja", "ko", "zh",
            ],
            rate_limit: Some(50),
            supports_streaming: true,
            supports_ssml: false,
            quality: 80,
        }
    }

    async fn is_available(&self, _correlation_id: &str) -> Availability {
        let started = Instant::now();
        let configured = self.config.read().api_key.is_some();
        if configured {
            Availability::available(started.elapsed().as_millis() as u64)
        } else {
            Availability::unavailable("OPENAI_API_KEY not configured")
        }
    }

    async fn speak(
        &self,
        text: &str,
        options: &SpeakOptions,
        correlation_id: &str,
    ) -> ProviderResult<SpeakOutput> {
        let request = self.request_for(options, correlation_id)?;
        self.engine
            .synthesize(&request, text, options, correlation_id)
            .await
    }

    async fn configure(&self, patch: ProviderConfigPatch) {
        let mut config = self.config.write();
        if let Some(api_key) = patch.api_key {
            config.api_key = Some(api_key);
        }
        if let Some(voice) = patch.default_voice {
            config.default_voice = voice;
        }
        if let Some(model) = patch.default_model {
            config.default_model = model;
        }
        drop(config);
        if let Some(interval) = patch.min_request_interval {
            self.engine.limiter().set_min_interval(interval);
        }
    }

    async fn health_status(&self, correlation_id: &str) -> ProviderHealth {
        let availability = self.is_available(correlation_id).await;
        self.engine.health_from(availability)
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics_snapshot()
    }
}
