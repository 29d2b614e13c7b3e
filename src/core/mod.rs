pub mod cache;
pub mod speech;
pub mod tts;

// Re-export commonly used types for convenience
pub use cache::{AudioCache, CacheKeyParams, CacheStats, KeyNormalizer};
pub use speech::{ServiceHealth, SpeakResult, SpeechService};
pub use tts::{
    ProviderInfo, ProviderRegistry, ProviderSelection, SelectionCriteria, SpeakOptions,
    TtsProvider,
};
