//! ElevenLabs TTS backend over the shared synthesis engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde_json::json;

use crate::config::SpeechConfig;
use crate::core::cache::AudioCache;
use crate::errors::{ErrorKind, ProviderError, ProviderResult};

use super::base::{
    Availability, MetricsSnapshot, ProviderConfigPatch, ProviderHealth, ProviderInfo,
    SpeakOptions, SpeakOutput, TtsProvider,
};
use super::engine::{ProviderEngine, SynthesisRequest};

pub const ELEVENLABS_TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";
const DEFAULT_MODEL: &str = "eleven_multilingual_v2";

/// Mutable per-instance configuration, merged into by `configure`.
#[derive(Debug, Clone)]
struct ElevenLabsConfig {
    api_key: Option<String>,
    default_voice: String,
    default_model: String,
}

/// Map the generic format name onto ElevenLabs' `output_format` values.
fn output_format_for(format: &str) -> &'static str {
    let lowered = format.to_ascii_lowercase();
    if lowered.contains("pcm") || lowered.contains("linear16") {
        "pcm_24000"
    } else if lowered.contains("ulaw") {
        "ulaw_8000"
    } else if lowered.contains("opus") {
        "opus_48000_64"
    } else {
        "mp3_44100_128"
    }
}

fn accept_for(output_format: &str) -> &'static str {
    if output_format.starts_with("pcm") {
        "audio/pcm"
    } else if output_format.starts_with("ulaw") {
        "audio/basic"
    } else {
        "audio/mpeg"
    }
}

/// One request's worth of resolved parameters.
#[derive(Clone)]
struct ElevenLabsRequest {
    api_key: String,
    voice: String,
    model: String,
}

impl SynthesisRequest for ElevenLabsRequest {
    fn build_http_request(
        &self,
        client: &reqwest::Client,
        text: &str,
        options: &SpeakOptions,
    ) -> reqwest::RequestBuilder {
        let output_format = output_format_for(&options.format);
        let url = format!("{ELEVENLABS_TTS_URL}/{}?output_format={output_format}", self.voice);

        let mut voice_settings = json!({ "speed": options.speed });
        if let Some(extra) = &options.extra_params {
            // Numeric extras (stability, similarity_boost, style) feed the
            // voice settings object
            for (key, value) in extra {
                if let Ok(number) = value.parse::<f64>() {
                    voice_settings[key] = json!(number);
                }
            }
        }
        let body = json!({
            "text": text,
            "model_id": self.model,
            "voice_settings": voice_settings,
        });

        client
            .post(url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .header("Accept", accept_for(output_format))
            .json(&body)
    }

    fn resolved_voice(&self) -> &str {
        &self.voice
    }

    fn resolved_model(&self) -> &str {
        &self.model
    }

    fn classify_status(&self, status: StatusCode, body: &str) -> ErrorKind {
        // ElevenLabs reports quota exhaustion as a 401 with a detail status
        if status == StatusCode::UNAUTHORIZED && body.contains("quota_exceeded") {
            return ErrorKind::RateLimit;
        }
        match status.as_u16() {
            401 | 403 => ErrorKind::Authentication,
            429 => ErrorKind::RateLimit,
            400 | 404 | 422 => ErrorKind::InvalidRequest,
            500 | 502 | 503 | 504 => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::Unknown,
        }
    }
}

/// ElevenLabs TTS provider using the HTTP REST API.
pub struct ElevenLabsTts {
    engine: ProviderEngine,
    config: RwLock<ElevenLabsConfig>,
}

impl ElevenLabsTts {
    pub fn new(config: &SpeechConfig, cache: Option<Arc<AudioCache>>) -> ProviderResult<Self> {
        let engine = ProviderEngine::new(
            "elevenlabs",
            cache,
            config.normalization.clone(),
            &config.retry,
            Duration::from_millis(100),
        )?;
        Ok(Self {
            engine,
            config: RwLock::new(ElevenLabsConfig {
                api_key: config.elevenlabs_api_key.clone(),
                default_voice: DEFAULT_VOICE.to_string(),
                default_model: DEFAULT_MODEL.to_string(),
            }),
        })
    }

    fn request_for(
        &self,
        options: &SpeakOptions,
        correlation_id: &str,
    ) -> ProviderResult<ElevenLabsRequest> {
        let config = self.config.read().clone();
        let api_key = config.api_key.ok_or_else(|| {
            ProviderError::new(
                ErrorKind::Configuration,
                "elevenlabs",
                correlation_id,
                "API key is required for ElevenLabs",
            )
        })?;
        Ok(ElevenLabsRequest {
            api_key,
            voice: options
                .voice
                .clone()
                .unwrap_or(config.default_voice),
            model: options
                .model
                .clone()
                .unwrap_or(config.default_model),
        })
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsTts {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "elevenlabs",
            display_name: "ElevenLabs",
            requires_api_key: true,
            supported_features: vec!["speech", "speed-control", "voice-settings"],
            supported_formats: vec!["mp3", "pcm", "ulaw", "opus"],
            supported_languages: vec![
                "en", "de", "es", "fr", "it", "pt", "pl", "hi", "ja", "ko", "zh",
            ],
            rate_limit: Some(120),
            supports_streaming: true,
            supports_ssml: false,
            quality: 90,
        }
    }

    async fn is_available(&self, _correlation_id: &str) -> Availability {
        let started = Instant::now();
        let configured = self.config.read().api_key.is_some();
        if configured {
            Availability::available(started.elapsed().as_millis() as u64)
        } else {
            Availability::unavailable("ELEVENLABS_API_KEY not configured")
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
