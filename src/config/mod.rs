//! Configuration for the speech cache and provider layer.
//!
//! Configuration comes from two sources: explicit construction in code, or
//! environment variables via [`SpeechConfig::from_env`]. Environment values
//! always override the defaults. Every field has a sensible default so an
//! empty environment still yields a working (if credential-less) setup.
//!
//! # Modules
//! - `env`: Environment variable loading
//! - `utils`: Parsing helpers for booleans and byte sizes

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod env;
mod utils;

pub use utils::{parse_bool, parse_size};

/// Tuning for the on-disk audio cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Master switch. When false every lookup is a miss and writes are no-ops.
    pub enabled: bool,
    /// Root directory owning the `entries/` and `audio/` subtrees.
    pub cache_dir: PathBuf,
    /// Total payload budget across all entries.
    pub max_size_bytes: u64,
    /// Entries older than this are expired on access and during cleanup.
    pub max_age: Duration,
    /// Maximum number of entries before oldest-first eviction kicks in.
    pub max_entries: usize,
    /// Free-space floor checked by the health probe.
    pub min_free_disk_bytes: u64,
    /// Mode bits applied to entry and audio files (unix only).
    pub file_mode: u32,
    /// Mode bits applied to the cache directories (unix only).
    pub dir_mode: u32,
    /// Emit a debug record for every cache hit.
    pub enable_hit_logging: bool,
    /// Interval for the optional background cleanup task.
    pub cleanup_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: std::env::temp_dir().join("sonara-cache"),
            max_size_bytes: 1024 * 1024 * 1024, // 1 GiB
            max_age: Duration::from_secs(30 * 24 * 60 * 60), // 30 days
            max_entries: 10_000,
            min_free_disk_bytes: 100 * 1024 * 1024, // 100 MiB
            file_mode: 0o644,
            dir_mode: 0o755,
            enable_hit_logging: true,
            cleanup_interval: Duration::from_secs(60 * 60), // 1 hour
        }
    }
}

/// How synthesis text is canonicalized before key derivation.
///
/// Steps run in a fixed order; each one is applied only when its flag is set.
/// The optional custom transform always runs last.
#[derive(Clone)]
pub struct NormalizationOptions {
    /// Keep the original casing instead of lowercasing.
    pub case_sensitive: bool,
    /// Strip a leading `low|medium|high priority:` marker.
    pub strip_priority_prefixes: bool,
    /// Trim and collapse whitespace runs to single spaces.
    pub normalize_whitespace: bool,
    /// Remove all non-word, non-space characters.
    pub strip_punctuation: bool,
    /// Caller-supplied transform applied after all built-in steps.
    pub custom_transform: Option<Arc<dyn Fn(&str) -> String + Send + Sync>>,
}

impl Default for NormalizationOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            strip_priority_prefixes: true,
            normalize_whitespace: true,
            strip_punctuation: false,
            custom_transform: None,
        }
    }
}

impl fmt::Debug for NormalizationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizationOptions")
            .field("case_sensitive", &self.case_sensitive)
            .field("strip_priority_prefixes", &self.strip_priority_prefixes)
            .field("normalize_whitespace", &self.normalize_whitespace)
            .field("strip_punctuation", &self.strip_punctuation)
            .field("custom_transform", &self.custom_transform.is_some())
            .finish()
    }
}

/// Retry budget shared by all providers.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Backoff starts here and doubles per attempt.
    pub base_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// Top-level configuration for [`crate::SpeechService`].
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub cache: CacheSettings,
    pub normalization: NormalizationOptions,
    pub retry: RetrySettings,
    /// Provider used when a request names none. `None` means highest priority wins.
    pub default_provider: Option<String>,
    /// Whether selection may fall back to lower-priority providers.
    pub allow_fallback: bool,
    pub openai_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            normalization: NormalizationOptions::default(),
            retry: RetrySettings::default(),
            default_provider: None,
            allow_fallback: true,
            openai_api_key: None,
            elevenlabs_api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_defaults_match_documented_values() {
        let settings = CacheSettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.max_size_bytes, 1024 * 1024 * 1024);
        assert_eq!(settings.max_entries, 10_000);
        assert_eq!(settings.max_age, Duration::from_secs(30 * 24 * 60 * 60));
        assert_eq!(settings.min_free_disk_bytes, 100 * 1024 * 1024);
        assert_eq!(settings.file_mode, 0o644);
        assert_eq!(settings.dir_mode, 0o755);
        assert!(settings.enable_hit_logging);
        assert_eq!(settings.cleanup_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_normalization_defaults() {
        let options = NormalizationOptions::default();
        assert!(!options.case_sensitive);
        assert!(options.strip_priority_prefixes);
        assert!(options.normalize_whitespace);
        assert!(!options.strip_punctuation);
        assert!(options.custom_transform.is_none());
    }

    #[test]
    fn test_speech_config_allows_fallback_by_default() {
        let config = SpeechConfig::default();
        assert!(config.allow_fallback);
        assert!(config.default_provider.is_none());
        assert_eq!(config.retry.max_attempts, 3);
    }
}
