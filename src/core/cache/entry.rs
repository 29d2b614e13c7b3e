//! On-disk record types for cached synthesis results.
//!
//! Each cached result is a pair of files: an `entries/<key>.json` record
//! described by [`CacheEntryFile`], and the raw payload at
//! `audio/<key>.<ext>`. A record without its payload (or vice versa) is
//! corrupt and gets purged lazily on the next access.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Extensions recognized by substring match against the requested format,
/// checked in this order.
const KNOWN_EXTENSIONS: [&str; 8] = ["mp3", "opus", "aac", "flac", "wav", "pcm", "ulaw", "alaw"];

/// Fallback extension for unrecognized formats.
pub const DEFAULT_EXTENSION: &str = "mp3";

/// Map a requested audio format to the payload file extension.
///
/// Matching is by substring so provider-specific format names like
/// `mp3_44100_128` or `pcm_24000` resolve to their base container.
pub fn extension_for_format(format: &str) -> &'static str {
    let lowered = format.to_ascii_lowercase();
    KNOWN_EXTENSIONS
        .iter()
        .find(|ext| lowered.contains(*ext))
        .copied()
        .unwrap_or(DEFAULT_EXTENSION)
}

/// Metadata persisted with every entry. Immutable once written; a full
/// re-`set` for the same key replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryMetadata {
    pub provider: String,
    pub voice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Unix milliseconds.
    pub created_at: u64,
    pub size_bytes: u64,
    pub correlation_id: String,
}

/// One `entries/<key>.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryFile {
    /// Unix milliseconds at write time; drives age-based expiry.
    pub timestamp: u64,
    pub metadata: CacheEntryMetadata,
    /// Payload filename relative to the `audio/` directory.
    pub audio_file: String,
    pub key: String,
}

impl CacheEntryFile {
    /// Structural validation beyond what deserialization guarantees.
    ///
    /// The payload path must stay inside `audio/` and the record must belong
    /// to the key it is stored under.
    pub fn is_valid_for(&self, key: &str) -> bool {
        self.key == key
            && self.timestamp > 0
            && !self.audio_file.is_empty()
            && !self.audio_file.contains('/')
            && !self.audio_file.contains('\\')
            && !self.metadata.provider.is_empty()
    }
}

/// Runtime view of a cache hit. Never mutated in place.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Bytes,
    pub metadata: CacheEntryMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_for_known_formats() {
        assert_eq!(extension_for_format("mp3"), "mp3");
        assert_eq!(extension_for_format("OPUS"), "opus");
        assert_eq!(extension_for_format("flac"), "flac");
        assert_eq!(extension_for_format("wav"), "wav");
    }

    #[test]
    fn test_extension_matches_by_substring() {
        assert_eq!(extension_for_format("mp3_44100_128"), "mp3");
        assert_eq!(extension_for_format("pcm_24000"), "pcm");
        assert_eq!(extension_for_format("ulaw_8000"), "ulaw");
    }

    #[test]
    fn test_unknown_format_defaults_to_mp3() {
        assert_eq!(extension_for_format("xyz"), "mp3");
        assert_eq!(extension_for_format(""), "mp3");
        assert_eq!(extension_for_format("ogg"), "mp3");
    }

    fn sample_record(key: &str) -> CacheEntryFile {
        CacheEntryFile {
            timestamp: 1_700_000_000_000,
            metadata: CacheEntryMetadata {
                provider: "openai".to_string(),
                voice: "alloy".to_string(),
                model: Some("tts-1".to_string()),
                speed: Some(1.0),
                format: Some("mp3".to_string()),
                text: Some("hello".to_string()),
                created_at: 1_700_000_000_000,
                size_bytes: 3,
                correlation_id: "corr-1".to_string(),
            },
            audio_file: format!("{key}.mp3"),
            key: key.to_string(),
        }
    }

    #[test]
    fn test_record_roundtrips_through_json() {
        let record = sample_record("abc123");
        let json = serde_json::to_string(&record).unwrap();
        // Documented camelCase schema
        assert!(json.contains("\"audioFile\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"sizeBytes\""));
        assert!(json.contains("\"correlationId\""));

        let back: CacheEntryFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, "abc123");
        assert_eq!(back.metadata, record.metadata);
    }

    #[test]
    fn test_optional_metadata_fields_may_be_absent() {
        let json = r#"{
            "timestamp": 1700000000000,
            "metadata": {
                "provider": "openai",
                "voice": "alloy",
                "createdAt": 1700000000000,
                "sizeBytes": 10,
                "correlationId": "corr-2"
            },
            "audioFile": "k.mp3",
            "key": "k"
        }"#;
        let record: CacheEntryFile = serde_json::from_str(json).unwrap();
        assert!(record.metadata.model.is_none());
        assert!(record.metadata.text.is_none());
        assert!(record.is_valid_for("k"));
    }

    #[test]
    fn test_validation_rejects_mismatched_or_unsafe_records() {
        let record = sample_record("abc");
        assert!(record.is_valid_for("abc"));
        assert!(!record.is_valid_for("other-key"));

        let mut traversal = sample_record("abc");
        traversal.audio_file = "../escape.mp3".to_string();
        assert!(!traversal.is_valid_for("abc"));

        let mut empty = sample_record("abc");
        empty.audio_file = String::new();
        assert!(!empty.is_valid_for("abc"));
    }
}
