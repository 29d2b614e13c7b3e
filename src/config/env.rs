use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::utils::{parse_bool, parse_size};
use super::SpeechConfig;

impl SpeechConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// Provider credentials come from the per-backend variables
    /// (`OPENAI_API_KEY`, `ELEVENLABS_API_KEY`). A missing credential is not
    /// an error: the provider simply reports itself unavailable.
    ///
    /// Recognized variables:
    /// - `SONARA_CACHE_ENABLED` — bool
    /// - `SONARA_CACHE_DIR` — path
    /// - `SONARA_CACHE_MAX_SIZE` — byte size ("1gb", "524288000", ...)
    /// - `SONARA_CACHE_MAX_AGE_SECONDS` — integer seconds
    /// - `SONARA_CACHE_MAX_ENTRIES` — integer
    /// - `SONARA_CACHE_MIN_FREE_DISK` — byte size
    /// - `SONARA_CACHE_HIT_LOGGING` — bool
    /// - `SONARA_CACHE_CLEANUP_INTERVAL_SECONDS` — integer seconds
    /// - `SONARA_DEFAULT_PROVIDER` — provider name
    /// - `SONARA_ALLOW_FALLBACK` — bool
    /// - `SONARA_RETRY_MAX_ATTEMPTS` — integer
    /// - `SONARA_CASE_SENSITIVE_KEYS` — bool
    pub fn from_env() -> Self {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut config = SpeechConfig::default();

        if let Some(enabled) = env::var("SONARA_CACHE_ENABLED").ok().and_then(|v| parse_bool(&v)) {
            config.cache.enabled = enabled;
        }
        if let Ok(dir) = env::var("SONARA_CACHE_DIR") {
            config.cache.cache_dir = PathBuf::from(dir);
        }
        if let Some(size) = env::var("SONARA_CACHE_MAX_SIZE").ok().and_then(|v| parse_size(&v)) {
            config.cache.max_size_bytes = size;
        }
        if let Some(secs) = env::var("SONARA_CACHE_MAX_AGE_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.cache.max_age = Duration::from_secs(secs);
        }
        if let Some(entries) = env::var("SONARA_CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.cache.max_entries = entries;
        }
        if let Some(size) = env::var("SONARA_CACHE_MIN_FREE_DISK")
            .ok()
            .and_then(|v| parse_size(&v))
        {
            config.cache.min_free_disk_bytes = size;
        }
        if let Some(enabled) = env::var("SONARA_CACHE_HIT_LOGGING")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            config.cache.enable_hit_logging = enabled;
        }
        if let Some(secs) = env::var("SONARA_CACHE_CLEANUP_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.cache.cleanup_interval = Duration::from_secs(secs);
        }

        if let Ok(name) = env::var("SONARA_DEFAULT_PROVIDER") {
            if !name.trim().is_empty() {
                config.default_provider = Some(name);
            }
        }
        if let Some(allow) = env::var("SONARA_ALLOW_FALLBACK").ok().and_then(|v| parse_bool(&v)) {
            config.allow_fallback = allow;
        }
        if let Some(attempts) = env::var("SONARA_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.retry.max_attempts = attempts;
        }
        if let Some(case_sensitive) = env::var("SONARA_CASE_SENSITIVE_KEYS")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            config.normalization.case_sensitive = case_sensitive;
        }

        // Provider credentials: absence means "unavailable", never an error
        config.openai_api_key = env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        config.elevenlabs_api_key = env::var("ELEVENLABS_API_KEY").ok().filter(|k| !k.is_empty());

        config
    }
}
