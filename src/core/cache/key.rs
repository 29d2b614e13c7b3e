//! Deterministic cache key derivation for synthesis requests.
//!
//! Free-form text is reduced to a canonical form through an ordered set of
//! normalization steps, then combined with the remaining synthesis
//! parameters into a single SHA-256 key. The contract is strict: the same
//! logical request always produces the same key, regardless of format
//! casing or the order extra parameters were supplied in.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::config::NormalizationOptions;

// Pre-compiled normalization patterns
static WHITESPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static PRIORITY_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:low|medium|high)\s+priority:\s*").unwrap());
static PUNCTUATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());

/// Raw synthesis parameters fed into key derivation. Never persisted.
#[derive(Debug, Clone)]
pub struct CacheKeyParams<'a> {
    pub provider: &'a str,
    pub text: &'a str,
    pub model: &'a str,
    pub voice: &'a str,
    pub speed: f32,
    pub format: &'a str,
    /// Provider-specific extras. `BTreeMap` keeps keys sorted so insertion
    /// order can never influence the derived key.
    pub extra_params: Option<&'a BTreeMap<String, String>>,
}

/// Outcome of a single normalization pass. Ephemeral, regenerated per call.
#[derive(Debug, Clone)]
pub struct NormalizationResult {
    pub original_text: String,
    pub normalized_text: String,
    pub cache_key: String,
    /// Names of the steps that ran, in order.
    pub steps_applied: Vec<&'static str>,
    pub original_length: usize,
    pub normalized_length: usize,
    pub processing_time: Duration,
}

/// Canonicalizes synthesis text and derives cache keys.
///
/// Normalization is total: any input string, including the empty string,
/// yields a valid key.
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    options: NormalizationOptions,
}

impl KeyNormalizer {
    pub fn new(options: NormalizationOptions) -> Self {
        Self { options }
    }

    /// Run the normalization pipeline and derive the cache key.
    ///
    /// Step order is fixed: whitespace collapse, priority-prefix strip,
    /// punctuation strip, case folding, then the caller's custom transform.
    pub fn normalize(&self, params: &CacheKeyParams<'_>) -> NormalizationResult {
        let started = Instant::now();
        let mut steps = Vec::new();
        let mut text = params.text.to_string();

        if self.options.normalize_whitespace {
            text = WHITESPACE_RUN_RE.replace_all(text.trim(), " ").into_owned();
            steps.push("normalize_whitespace");
        }
        if self.options.strip_priority_prefixes {
            text = PRIORITY_PREFIX_RE.replace(&text, "").into_owned();
            steps.push("strip_priority_prefixes");
        }
        if self.options.strip_punctuation {
            text = PUNCTUATION_RE.replace_all(&text, "").into_owned();
            steps.push("strip_punctuation");
        }
        if !self.options.case_sensitive {
            text = text.to_lowercase();
            steps.push("case_fold");
        }
        if let Some(transform) = &self.options.custom_transform {
            text = transform(&text);
            steps.push("custom_transform");
        }

        let cache_key = derive_key(params, &text);
        trace!(cache_key = %cache_key, steps = ?steps, "derived cache key");

        NormalizationResult {
            original_length: params.text.len(),
            normalized_length: text.len(),
            original_text: params.text.to_string(),
            normalized_text: text,
            cache_key,
            steps_applied: steps,
            processing_time: started.elapsed(),
        }
    }

    /// Shorthand when only the key is needed.
    pub fn derive(&self, params: &CacheKeyParams<'_>) -> String {
        self.normalize(params).cache_key
    }
}

impl Default for KeyNormalizer {
    fn default() -> Self {
        Self::new(NormalizationOptions::default())
    }
}

/// Join the key components in fixed order and hash them.
///
/// Format is lowercased so `MP3` and `mp3` never produce duplicate entries;
/// extra params are appended as a sorted `k=v&k=v` component.
fn derive_key(params: &CacheKeyParams<'_>, normalized_text: &str) -> String {
    let mut components = vec![
        params.provider.to_string(),
        normalized_text.to_string(),
        params.model.to_string(),
        params.voice.to_string(),
        params.speed.to_string(),
        params.format.to_lowercase(),
    ];
    if let Some(extra) = params.extra_params {
        let sorted = extra
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        components.push(sorted);
    }

    let mut hasher = Sha256::new();
    hasher.update(components.join("|").as_bytes());
    format!("{:x}", hasher.finalize())
}
