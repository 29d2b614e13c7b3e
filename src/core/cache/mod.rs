//! Audio result cache: deterministic key derivation, disk layout, eviction.
//!
//! The cache is the reason the provider layer can avoid redundant upstream
//! calls: every synthesis request is reduced to a stable SHA-256 key by the
//! [`KeyNormalizer`], and [`AudioCache`] persists the resulting audio as a
//! metadata-record/payload file pair under one owned directory tree.

pub mod entry;
pub mod key;
pub mod store;

pub use entry::{
    extension_for_format, CacheEntry, CacheEntryFile, CacheEntryMetadata, DEFAULT_EXTENSION,
};
pub use key::{CacheKeyParams, KeyNormalizer, NormalizationResult};
pub use store::{
    AudioCache, CacheError, CacheHealth, CachePerformance, CacheResult, CacheStats,
    CacheValidation, CleanupReport,
};
