//! # sonara
//!
//! A text-to-speech result cache and provider-orchestration library.
//!
//! Given synthesis parameters (provider, text, voice, model, speed, format),
//! sonara derives a deterministic cache key, stores and retrieves previously
//! synthesized audio on disk, and coordinates which upstream TTS backend
//! actually gets called, with retry, adaptive rate limiting, and graceful
//! priority-based fallback across backends.
//!
//! ```rust,no_run
//! use sonara::{SpeakOptions, SpeechService};
//!
//! # async fn example() {
//! let service = SpeechService::from_env();
//! let result = service.speak("Hello, world!", &SpeakOptions::default()).await;
//! if result.success {
//!     println!(
//!         "{} bytes from {} (cached: {})",
//!         result.audio.as_ref().map(|a| a.len()).unwrap_or(0),
//!         result.provider.as_deref().unwrap_or("?"),
//!         result.cached,
//!     );
//! }
//! # }
//! ```

pub mod config;
pub mod core;
pub mod errors;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::{CacheSettings, NormalizationOptions, RetrySettings, SpeechConfig};
pub use core::cache::{
    AudioCache, CacheEntry, CacheEntryMetadata, CacheKeyParams, CacheStats, KeyNormalizer,
};
pub use core::speech::{ServiceHealth, SpeakResult, SpeechService};
pub use core::tts::{
    ProviderInfo, ProviderRegistration, ProviderRegistry, ProviderSelection, SelectionCriteria,
    SpeakOptions, TtsProvider,
};
pub use errors::{ErrorKind, ProviderError};
