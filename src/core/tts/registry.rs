//! Provider registry: named, prioritized backends with deterministic
//! fallback.
//!
//! Registrations pair a name and priority with a factory closure; instances
//! are created lazily, memoized for the registry's lifetime, and
//! reconfigured in place via [`TtsProvider::configure`] rather than being
//! recreated. Selection resolves a requested name (or none) plus criteria to
//! a live, available instance, falling back across the priority order when
//! permitted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info};

use crate::config::SpeechConfig;
use crate::core::cache::AudioCache;
use crate::errors::{ErrorKind, ProviderError, ProviderResult};

use super::base::{ProviderHealth, SharedProvider, TtsProvider};
use super::elevenlabs::ElevenLabsTts;
use super::openai::OpenAiTts;

/// Filters applied to a candidate provider during selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Features the provider must advertise (e.g. `"ssml"`, `"streaming"`).
    pub required_features: Vec<String>,
    /// Upper bound on the availability probe's response time.
    pub max_response_time: Option<Duration>,
    /// Language the provider must support.
    pub required_language: Option<String>,
    /// Minimum advertised quality (0-100).
    pub min_quality: Option<u8>,
    /// Overrides the registry-level fallback default when set.
    pub allow_fallback: Option<bool>,
}

type ProviderFactory = Box<
    dyn Fn(&SpeechConfig, Option<Arc<AudioCache>>) -> ProviderResult<SharedProvider>
        + Send
        + Sync,
>;

/// One named backend in the registry's table.
pub struct ProviderRegistration {
    pub name: String,
    pub priority: i32,
    pub enabled_by_default: bool,
    factory: ProviderFactory,
}

impl ProviderRegistration {
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        enabled_by_default: bool,
        factory: ProviderFactory,
    ) -> Self {
        Self {
            name: name.into().to_lowercase(),
            priority,
            enabled_by_default,
            factory,
        }
    }
}

/// Outcome of a selection: the instance plus how it was chosen.
#[derive(Clone, Debug)]
pub struct ProviderSelection {
    pub provider: SharedProvider,
    pub name: String,
    /// True only when an explicitly requested provider was replaced.
    pub is_fallback: bool,
    /// Every provider name tried, in order, including the winner.
    pub alternatives_considered: Vec<String>,
}

/// Holds registrations, memoized instances, and the enabled set.
pub struct ProviderRegistry {
    config: SpeechConfig,
    cache: Option<Arc<AudioCache>>,
    registrations: Vec<ProviderRegistration>,
    instances: AsyncRwLock<HashMap<String, SharedProvider>>,
    enabled: RwLock<HashSet<String>>,
}

impl ProviderRegistry {
    /// An empty registry; callers register their own providers.
    pub fn new(config: SpeechConfig, cache: Option<Arc<AudioCache>>) -> Self {
        Self {
            config,
            cache,
            registrations: Vec::new(),
            instances: AsyncRwLock::new(HashMap::new()),
            enabled: RwLock::new(HashSet::new()),
        }
    }

    /// Registry pre-populated with the built-in backends: ElevenLabs
    /// (priority 10) and OpenAI (priority 5).
    pub fn with_builtins(config: SpeechConfig, cache: Option<Arc<AudioCache>>) -> Self {
        let mut registry = Self::new(config, cache);
        registry.register(ProviderRegistration::new(
            "elevenlabs",
            10,
            true,
            Box::new(|config, cache| {
                Ok(Arc::new(ElevenLabsTts::new(config, cache)?) as SharedProvider)
            }),
        ));
        registry.register(ProviderRegistration::new(
            "openai",
            5,
            true,
            Box::new(|config, cache| {
                Ok(Arc::new(OpenAiTts::new(config, cache)?) as SharedProvider)
            }),
        ));
        registry
    }

    /// Add a registration. Later registrations with the same name shadow
    /// earlier ones for instantiation purposes.
    pub fn register(&mut self, registration: ProviderRegistration) {
        if registration.enabled_by_default {
            self.enabled.write().insert(registration.name.clone());
        }
        self.registrations.push(registration);
    }

    /// Enable or disable a provider without unregistering it.
    pub fn set_enabled(&self, name: &str, enabled: bool) {
        let name = name.to_lowercase();
        let mut set = self.enabled.write();
        if enabled {
            set.insert(name);
        } else {
            set.remove(&name);
        }
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.registrations.iter().map(|r| r.name.clone()).collect()
    }

    /// Resolve a request to a live, available provider.
    ///
    /// A named request tries that provider first; on failure, and with
    /// fallback permitted, the remaining providers are tried in descending
    /// priority order. Every name tried is recorded in the selection result.
    pub async fn get_provider(
        &self,
        name: Option<&str>,
        criteria: &SelectionCriteria,
        correlation_id: &str,
    ) -> ProviderResult<ProviderSelection> {
        let allow_fallback = criteria.allow_fallback.unwrap_or(self.config.allow_fallback);
        let mut tried: Vec<String> = Vec::new();

        if let Some(requested) = name {
            let requested = requested.to_lowercase();
            tried.push(requested.clone());
            match self.try_candidate(&requested, criteria, correlation_id).await {
                Ok(provider) => {
                    return Ok(ProviderSelection {
                        provider,
                        name: requested,
                        is_fallback: false,
                        alternatives_considered: tried,
                    });
                }
                Err(err) => {
                    debug!(
                        correlation_id,
                        provider = %requested,
                        error = %err,
                        "requested provider rejected"
                    );
                    if !allow_fallback {
                        return Err(err);
                    }
                }
            }
        }

        let mut candidates: Vec<(&str, i32)> = {
            let enabled = self.enabled.read();
            self.registrations
                .iter()
                .filter(|r| enabled.contains(&r.name))
                .map(|r| (r.name.as_str(), r.priority))
                .collect()
        };
        candidates.sort_by_key(|(_, priority)| std::cmp::Reverse(*priority));

        for (candidate, _) in candidates {
            if tried.iter().any(|t| t == candidate) {
                continue;
            }
            tried.push(candidate.to_string());
            match self.try_candidate(candidate, criteria, correlation_id).await {
                Ok(provider) => {
                    let is_fallback = name.is_some();
                    if is_fallback {
                        info!(
                            correlation_id,
                            requested = name.unwrap_or_default(),
                            selected = candidate,
                            "falling back to alternative provider"
                        );
                    }
                    return Ok(ProviderSelection {
                        provider,
                        name: candidate.to_string(),
                        is_fallback,
                        alternatives_considered: tried,
                    });
                }
                Err(err) => {
                    debug!(correlation_id, provider = candidate, error = %err, "candidate rejected");
                }
            }
        }

        let kind = if tried.is_empty() {
            ErrorKind::Configuration
        } else {
            ErrorKind::ServiceUnavailable
        };
        Err(ProviderError::new(
            kind,
            "registry",
            correlation_id,
            format!("no usable provider; tried: [{}]", tried.join(", ")),
        ))
    }

    /// Instantiate (or fetch) one provider and run it through the
    /// availability probe and selection criteria.
    async fn try_candidate(
        &self,
        name: &str,
        criteria: &SelectionCriteria,
        correlation_id: &str,
    ) -> ProviderResult<SharedProvider> {
        let provider = self.instance(name, correlation_id).await?;

        let availability = provider.is_available(correlation_id).await;
        if !availability.available {
            return Err(ProviderError::new(
                ErrorKind::ServiceUnavailable,
                name,
                correlation_id,
                availability
                    .reason
                    .unwrap_or_else(|| "provider unavailable".to_string()),
            ));
        }

        let info = provider.info();
        for feature in &criteria.required_features {
            if !info.supported_features.iter().any(|f| f == feature) {
                return Err(ProviderError::new(
                    ErrorKind::Configuration,
                    name,
                    correlation_id,
                    format!("missing required feature: {feature}"),
                ));
            }
        }
        if let Some(language) = &criteria.required_language {
            if !info.supported_languages.iter().any(|l| l == language) {
                return Err(ProviderError::new(
                    ErrorKind::Configuration,
                    name,
                    correlation_id,
                    format!("language not supported: {language}"),
                ));
            }
        }
        if let Some(min_quality) = criteria.min_quality {
            if info.quality < min_quality {
                return Err(ProviderError::new(
                    ErrorKind::Configuration,
                    name,
                    correlation_id,
                    format!("quality {} below required {min_quality}", info.quality),
                ));
            }
        }
        if let Some(max_response_time) = criteria.max_response_time {
            if Duration::from_millis(availability.response_time_ms) > max_response_time {
                return Err(ProviderError::new(
                    ErrorKind::Timeout,
                    name,
                    correlation_id,
                    format!(
                        "availability probe took {}ms, above the {}ms bound",
                        availability.response_time_ms,
                        max_response_time.as_millis()
                    ),
                ));
            }
        }

        Ok(provider)
    }

    /// Memoized instantiation: one instance per backend for the registry's
    /// lifetime.
    async fn instance(&self, name: &str, correlation_id: &str) -> ProviderResult<SharedProvider> {
        if let Some(existing) = self.instances.read().await.get(name) {
            return Ok(Arc::clone(existing));
        }

        let mut instances = self.instances.write().await;
        if let Some(existing) = instances.get(name) {
            return Ok(Arc::clone(existing));
        }

        // Last registration with the name wins
        let registration = self
            .registrations
            .iter()
            .rev()
            .find(|r| r.name == name)
            .ok_or_else(|| {
                ProviderError::new(
                    ErrorKind::Configuration,
                    name,
                    correlation_id,
                    format!("unknown provider: {name}"),
                )
            })?;

        let provider = (registration.factory)(&self.config, self.cache.clone())?;
        instances.insert(name.to_string(), Arc::clone(&provider));
        debug!(provider = name, "instantiated provider");
        Ok(provider)
    }

    /// Health of every enabled provider, probed concurrently and
    /// instantiating lazily as needed.
    pub async fn health_statuses(
        &self,
        correlation_id: &str,
    ) -> Vec<(String, ProviderHealth)> {
        let names: Vec<String> = {
            let enabled = self.enabled.read();
            self.registrations
                .iter()
                .filter(|r| enabled.contains(&r.name))
                .map(|r| r.name.clone())
                .collect()
        };

        let probes = names.into_iter().map(|name| async move {
            match self.instance(&name, correlation_id).await {
                Ok(provider) => Some((name, provider.health_status(correlation_id).await)),
                Err(_) => None,
            }
        });
        join_all(probes).await.into_iter().flatten().collect()
    }

    /// Merge a configuration patch into a (possibly not yet created)
    /// provider instance.
    pub async fn reconfigure(
        &self,
        name: &str,
        patch: super::base::ProviderConfigPatch,
        correlation_id: &str,
    ) -> ProviderResult<()> {
        let provider = self.instance(&name.to_lowercase(), correlation_id).await?;
        provider.configure(patch).await;
        Ok(())
    }
}
