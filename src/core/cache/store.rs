//! Disk-backed audio cache with concurrent-write coalescing.
//!
//! One cache instance exclusively owns the `entries/` and `audio/` subtrees
//! under its configured directory. Lookups and writes for the same key are
//! totally ordered through an in-process pending-writes table: a reader that
//! races an in-flight write awaits that write's outcome instead of touching
//! the filesystem, so it can never observe a half-written pair.
//!
//! Misses, expiry, and corruption are not errors: they all degrade to a
//! miss, healing corrupt pairs by deletion along the way. Only genuine write
//! failures surface, to the writer and to every reader awaiting that write.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{watch, OnceCell};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CacheSettings;

use super::entry::{
    extension_for_format, CacheEntry, CacheEntryFile, CacheEntryMetadata, DEFAULT_EXTENSION,
};

/// Errors that can occur during cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O error during a write or directory initialization.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry record serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An awaited in-flight write for the same key failed.
    #[error("pending write failed: {0}")]
    PendingWrite(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Broadcast state of an in-flight write: `None` until it settles.
type WriteState = Option<Result<CacheEntry, String>>;

/// Aggregate statistics, recomputed on demand from a directory scan plus
/// process-lifetime counters. Eventually consistent: a concurrent write may
/// or may not be reflected.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: usize,
    /// Sum of audio payload bytes; this is what the size limit applies to.
    pub total_size_bytes: u64,
    /// Payload plus entry-record bytes actually occupied on disk.
    pub disk_usage: u64,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Upstream synthesis calls avoided; one per hit.
    pub api_calls_saved: u64,
    pub average_entry_size: u64,
    /// Oldest entry modification time, unix milliseconds.
    pub oldest_entry: Option<u64>,
    /// Newest entry modification time, unix milliseconds.
    pub newest_entry: Option<u64>,
    pub performance: CachePerformance,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePerformance {
    pub average_lookup_micros: u64,
}

/// Read-only health probe result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub directory_accessible: bool,
    pub free_disk_bytes: Option<u64>,
    pub free_disk_ok: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Read-only structural scan result.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheValidation {
    pub valid_entries: usize,
    pub invalid_entries: usize,
    pub corrupted_entries: usize,
    pub orphaned_audio_files: usize,
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    pub expired_removed: usize,
    pub corrupted_removed: usize,
    pub evicted_for_limits: usize,
}

#[derive(Debug, Default)]
struct CacheCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    lookup_micros: AtomicU64,
}

/// Disk-backed cache for synthesized audio, keyed by the normalizer's output.
pub struct AudioCache {
    settings: CacheSettings,
    init: OnceCell<()>,
    pending: Mutex<HashMap<String, watch::Receiver<WriteState>>>,
    counters: CacheCounters,
}

impl AudioCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            init: OnceCell::new(),
            pending: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn entries_dir(&self) -> PathBuf {
        self.settings.cache_dir.join("entries")
    }

    fn audio_dir(&self) -> PathBuf {
        self.settings.cache_dir.join("audio")
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.entries_dir().join(format!("{key}.json"))
    }

    /// Create the two subdirectories exactly once per process. Concurrent
    /// callers share a single initialization future.
    async fn ensure_dirs(&self) -> CacheResult<()> {
        self.init
            .get_or_try_init(|| async {
                fs::create_dir_all(self.entries_dir()).await?;
                fs::create_dir_all(self.audio_dir()).await?;
                apply_mode(&self.settings.cache_dir, self.settings.dir_mode).await;
                apply_mode(&self.entries_dir(), self.settings.dir_mode).await;
                apply_mode(&self.audio_dir(), self.settings.dir_mode).await;
                debug!(cache_dir = %self.settings.cache_dir.display(), "cache directories initialized");
                Ok::<(), CacheError>(())
            })
            .await
            .map(|_| ())
    }

    /// Look up a cached entry.
    ///
    /// Returns `Ok(None)` for every routine absence: disabled cache, no
    /// entry, expired entry, corrupt or orphaned pair. The only error paths
    /// are directory initialization and an awaited in-flight write failing.
    pub async fn get(&self, key: &str, correlation_id: &str) -> CacheResult<Option<CacheEntry>> {
        let started = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        if !self.settings.enabled {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        // Coalesce with an in-flight write for the same key
        let waiter = self.pending.lock().get(key).cloned();
        if let Some(rx) = waiter {
            return match await_write(rx).await {
                Ok(entry) => {
                    self.record_hit(key, correlation_id, entry.data.len(), started);
                    Ok(Some(entry))
                }
                Err(message) => Err(CacheError::PendingWrite(message)),
            };
        }

        self.ensure_dirs().await?;

        let entry_path = self.entry_path(key);
        let raw = match fs::read(&entry_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                self.record_miss(key, started);
                return Ok(None);
            }
            Err(e) => {
                warn!(cache_key = %key, error = %e, "entry record unreadable, treating as miss");
                self.record_miss(key, started);
                return Ok(None);
            }
        };

        let record: CacheEntryFile = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                // A write may have registered after our pending-table check;
                // never heal a pair that is being (re)written right now
                if let Some(outcome) = self.coalesce_late(key, correlation_id, started).await {
                    return outcome;
                }
                debug!(cache_key = %key, error = %e, "corrupted entry record, purging");
                self.remove_pair(key, None).await;
                self.record_miss(key, started);
                return Ok(None);
            }
        };

        if !record.is_valid_for(key) {
            debug!(cache_key = %key, "structurally invalid entry record, purging");
            self.remove_pair(key, Some(&record.audio_file)).await;
            self.record_miss(key, started);
            return Ok(None);
        }

        let age_ms = now_ms().saturating_sub(record.timestamp);
        if Duration::from_millis(age_ms) > self.settings.max_age {
            debug!(cache_key = %key, age_ms, "entry expired, removing");
            self.remove_pair(key, Some(&record.audio_file)).await;
            self.record_miss(key, started);
            return Ok(None);
        }

        let audio_path = self.audio_dir().join(&record.audio_file);
        let data = match fs::read(&audio_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                if let Some(outcome) = self.coalesce_late(key, correlation_id, started).await {
                    return outcome;
                }
                debug!(cache_key = %key, error = %e, "audio payload unreadable, purging pair");
                self.remove_pair(key, Some(&record.audio_file)).await;
                self.record_miss(key, started);
                return Ok(None);
            }
        };

        self.record_hit(key, correlation_id, data.len(), started);
        Ok(Some(CacheEntry {
            data,
            metadata: record.metadata,
        }))
    }

    /// Store a synthesized payload under `key`.
    ///
    /// The pending write is registered before any I/O, so concurrent readers
    /// and a second writer for the same key await this write instead of
    /// racing it. Limits are enforced against the pre-write state, which
    /// keeps the new entry out of its own eviction pass. On failure the
    /// error reaches both this writer and everyone awaiting the key.
    pub async fn set(
        &self,
        key: &str,
        data: Bytes,
        metadata: CacheEntryMetadata,
    ) -> CacheResult<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let tx = loop {
            let waiter = {
                let mut pending = self.pending.lock();
                if let Some(rx) = pending.get(key) {
                    rx.clone()
                } else {
                    let (tx, rx) = watch::channel(None);
                    pending.insert(key.to_string(), rx);
                    break tx;
                }
            };
            // At most one in-flight write per key: wait for the current one
            let _ = await_write(waiter).await;
        };

        let result = self.write_entry(key, &data, &metadata).await;

        // Deregister first, then settle: readers holding the receiver get the
        // broadcast, later readers find the completed state on disk.
        self.pending.lock().remove(key);
        match &result {
            Ok(entry) => {
                let _ = tx.send(Some(Ok(entry.clone())));
            }
            Err(e) => {
                warn!(cache_key = %key, error = %e, "cache write failed");
                let _ = tx.send(Some(Err(e.to_string())));
            }
        }

        result.map(|_| ())
    }

    async fn write_entry(
        &self,
        key: &str,
        data: &Bytes,
        metadata: &CacheEntryMetadata,
    ) -> CacheResult<CacheEntry> {
        self.ensure_dirs().await?;
        self.enforce_limits(&metadata.correlation_id).await?;

        let format = metadata.format.as_deref().unwrap_or(DEFAULT_EXTENSION);
        let extension = extension_for_format(format);
        let audio_file = format!("{key}.{extension}");

        let mut metadata = metadata.clone();
        metadata.size_bytes = data.len() as u64;
        if metadata.created_at == 0 {
            metadata.created_at = now_ms();
        }
        let record = CacheEntryFile {
            timestamp: metadata.created_at,
            metadata,
            audio_file: audio_file.clone(),
            key: key.to_string(),
        };

        let json = serde_json::to_vec_pretty(&record)?;
        let entry_path = self.entry_path(key);
        let audio_path = self.audio_dir().join(&audio_file);

        // Record first, payload second: a crash in between leaves a
        // detectable invalid pair that the next get() heals by deletion.
        fs::write(&entry_path, &json).await?;
        apply_mode(&entry_path, self.settings.file_mode).await;
        fs::write(&audio_path, data.as_ref()).await?;
        apply_mode(&audio_path, self.settings.file_mode).await;

        debug!(cache_key = %key, bytes = data.len(), "cache entry written");
        Ok(CacheEntry {
            data: data.clone(),
            metadata: record.metadata,
        })
    }

    /// Sweep expired and corrupt pairs, then re-apply the size/count limits.
    pub async fn cleanup(&self, correlation_id: &str) -> CacheResult<CleanupReport> {
        if !self.settings.enabled {
            return Ok(CleanupReport::default());
        }
        self.ensure_dirs().await?;

        let mut report = CleanupReport::default();

        let mut entries = fs::read_dir(self.entries_dir()).await?;
        while let Some(dirent) = entries.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            if self.pending.lock().contains_key(&key) {
                continue;
            }
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match serde_json::from_slice::<CacheEntryFile>(&raw) {
                Ok(record) if record.is_valid_for(&key) => {
                    let age_ms = now_ms().saturating_sub(record.timestamp);
                    if Duration::from_millis(age_ms) > self.settings.max_age {
                        self.remove_pair(&key, Some(&record.audio_file)).await;
                        report.expired_removed += 1;
                    }
                }
                _ => {
                    self.remove_pair(&key, None).await;
                    report.corrupted_removed += 1;
                }
            }
        }

        // Orphaned payloads whose entry record is gone
        let mut audio = fs::read_dir(self.audio_dir()).await?;
        while let Some(dirent) = audio.next_entry().await? {
            let path = dirent.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            if self.pending.lock().contains_key(&stem) {
                continue;
            }
            if fs::metadata(self.entry_path(&stem)).await.is_err() {
                let _ = fs::remove_file(&path).await;
                report.corrupted_removed += 1;
            }
        }

        report.evicted_for_limits = self.enforce_limits(correlation_id).await?;

        info!(
            correlation_id,
            expired = report.expired_removed,
            corrupted = report.corrupted_removed,
            evicted = report.evicted_for_limits,
            "cache cleanup completed"
        );
        Ok(report)
    }

    /// Remove every entry.
    ///
    /// Waits for all in-flight writes to settle first, so a clear can never
    /// delete a pair that a concurrent `set` is mid-way through producing.
    pub async fn clear(&self) -> CacheResult<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        loop {
            let receivers: Vec<_> = self.pending.lock().values().cloned().collect();
            if receivers.is_empty() {
                break;
            }
            for rx in receivers {
                let _ = await_write(rx).await;
            }
        }

        for dir in [self.entries_dir(), self.audio_dir()] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&dir).await?;
            apply_mode(&dir, self.settings.dir_mode).await;
        }
        info!(cache_dir = %self.settings.cache_dir.display(), "cache cleared");
        Ok(())
    }

    /// Recompute aggregate statistics from a directory scan.
    pub async fn stats(&self) -> CacheResult<CacheStats> {
        let requests = self.counters.requests.load(Ordering::Relaxed);
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookup_micros = self.counters.lookup_micros.load(Ordering::Relaxed);
        let hit_rate = if requests > 0 {
            hits as f64 / requests as f64
        } else {
            0.0
        };
        let performance = CachePerformance {
            average_lookup_micros: if requests > 0 {
                lookup_micros / requests
            } else {
                0
            },
        };

        let scan = if self.settings.enabled {
            self.ensure_dirs().await?;
            self.scan_entries().await?
        } else {
            Vec::new()
        };

        let entry_count = scan.len();
        let total_size_bytes: u64 = scan.iter().map(|e| e.payload_bytes).sum();
        let disk_usage: u64 = scan.iter().map(|e| e.payload_bytes + e.record_bytes).sum();
        let mtimes: Vec<u64> = scan.iter().map(|e| system_time_ms(e.modified)).collect();

        Ok(CacheStats {
            entry_count,
            total_size_bytes,
            disk_usage,
            requests,
            hits,
            misses,
            hit_rate,
            api_calls_saved: hits,
            average_entry_size: if entry_count > 0 {
                total_size_bytes / entry_count as u64
            } else {
                0
            },
            oldest_entry: mtimes.iter().min().copied(),
            newest_entry: mtimes.iter().max().copied(),
            performance,
        })
    }

    /// Read-only diagnostics: directory accessibility and free disk space.
    ///
    /// A failed accessibility probe attempts to create the missing
    /// directories once; everything else is observation only.
    pub async fn health_check(&self) -> CacheHealth {
        if !self.settings.enabled {
            return CacheHealth {
                directory_accessible: false,
                free_disk_bytes: None,
                free_disk_ok: true,
                healthy: true,
                detail: Some("cache disabled".to_string()),
            };
        }

        let entries = self.entries_dir();
        let audio = self.audio_dir();
        let mut detail = None;
        let mut accessible =
            fs::metadata(&entries).await.is_ok() && fs::metadata(&audio).await.is_ok();
        if !accessible {
            let recreate = async {
                fs::create_dir_all(&entries).await?;
                fs::create_dir_all(&audio).await
            }
            .await;
            match recreate {
                Ok(()) => accessible = true,
                Err(e) => detail = Some(format!("cache directory inaccessible: {e}")),
            }
        }

        let free_disk_bytes = fs2::available_space(&self.settings.cache_dir).ok();
        let free_disk_ok = free_disk_bytes
            .map(|bytes| bytes >= self.settings.min_free_disk_bytes)
            .unwrap_or(false);
        if free_disk_bytes.is_none() && detail.is_none() {
            detail = Some("free disk space probe failed".to_string());
        }

        CacheHealth {
            directory_accessible: accessible,
            free_disk_bytes,
            free_disk_ok,
            healthy: accessible && free_disk_ok,
            detail,
        }
    }

    /// Read-only structural scan of every pair on disk.
    pub async fn validate(&self) -> CacheResult<CacheValidation> {
        if !self.settings.enabled {
            return Ok(CacheValidation::default());
        }
        self.ensure_dirs().await?;

        let mut validation = CacheValidation::default();

        let mut entries = fs::read_dir(self.entries_dir()).await?;
        while let Some(dirent) = entries.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(_) => {
                    validation.corrupted_entries += 1;
                    continue;
                }
            };
            match serde_json::from_slice::<CacheEntryFile>(&raw) {
                Err(_) => validation.corrupted_entries += 1,
                Ok(record) if !record.is_valid_for(key) => validation.invalid_entries += 1,
                Ok(record) => {
                    let audio_path = self.audio_dir().join(&record.audio_file);
                    if fs::metadata(&audio_path).await.is_ok() {
                        validation.valid_entries += 1;
                    } else {
                        validation.invalid_entries += 1;
                    }
                }
            }
        }

        let mut audio = fs::read_dir(self.audio_dir()).await?;
        while let Some(dirent) = audio.next_entry().await? {
            let Some(stem) = dirent
                .path()
                .file_stem()
                .and_then(|s| s.to_str())
                .map(String::from)
            else {
                continue;
            };
            if fs::metadata(self.entry_path(&stem)).await.is_err() {
                validation.orphaned_audio_files += 1;
            }
        }

        Ok(validation)
    }

    /// Spawn a background task sweeping the cache at the configured interval.
    pub fn start_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.settings.cleanup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let correlation_id = uuid::Uuid::new_v4().to_string();
                if let Err(e) = cache.cleanup(&correlation_id).await {
                    warn!(error = %e, "scheduled cache cleanup failed");
                }
            }
        })
    }

    /// List current entries with mtimes and sizes. Oldest-first ordering is
    /// decided by the caller.
    async fn scan_entries(&self) -> CacheResult<Vec<ScannedEntry>> {
        let mut audio_sizes: HashMap<String, (PathBuf, u64)> = HashMap::new();
        match fs::read_dir(self.audio_dir()).await {
            Ok(mut dir) => {
                while let Some(dirent) = dir.next_entry().await? {
                    let path = dirent.path();
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
                    else {
                        continue;
                    };
                    if let Ok(meta) = dirent.metadata().await {
                        audio_sizes.insert(stem, (path, meta.len()));
                    }
                }
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut scanned = Vec::new();
        let mut entries = match fs::read_dir(self.entries_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(scanned),
            Err(e) => return Err(e.into()),
        };
        while let Some(dirent) = entries.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let meta = match dirent.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let modified = meta.modified().unwrap_or(UNIX_EPOCH);
            let (audio_path, payload_bytes) = match audio_sizes.get(&key) {
                Some((path, size)) => (Some(path.clone()), *size),
                None => (None, 0),
            };
            scanned.push(ScannedEntry {
                key,
                entry_path: path,
                audio_path,
                payload_bytes,
                record_bytes: meta.len(),
                modified,
            });
        }
        Ok(scanned)
    }

    /// Delete oldest-mtime-first until both the entry-count and total-size
    /// limits hold again. Entries with a write in flight are never candidates.
    async fn enforce_limits(&self, correlation_id: &str) -> CacheResult<usize> {
        let mut scan = self.scan_entries().await?;
        let mut entry_count = scan.len();
        let mut total_payload: u64 = scan.iter().map(|e| e.payload_bytes).sum();

        if entry_count <= self.settings.max_entries
            && total_payload <= self.settings.max_size_bytes
        {
            return Ok(0);
        }

        scan.sort_by_key(|e| e.modified);

        let mut removed = 0;
        for entry in scan {
            if entry_count <= self.settings.max_entries
                && total_payload <= self.settings.max_size_bytes
            {
                break;
            }
            if self.pending.lock().contains_key(&entry.key) {
                continue;
            }
            let _ = fs::remove_file(&entry.entry_path).await;
            if let Some(audio_path) = entry.audio_path {
                let _ = fs::remove_file(audio_path).await;
            }
            entry_count -= 1;
            total_payload = total_payload.saturating_sub(entry.payload_bytes);
            removed += 1;
            debug!(correlation_id, cache_key = %entry.key, "evicted entry for limits");
        }
        Ok(removed)
    }

    /// Second pending-table check for readers that raced a writer's
    /// registration: if a write is in flight now, await it instead of
    /// treating the half-written pair as corruption.
    async fn coalesce_late(
        &self,
        key: &str,
        correlation_id: &str,
        started: Instant,
    ) -> Option<CacheResult<Option<CacheEntry>>> {
        let rx = self.pending.lock().get(key).cloned()?;
        Some(match await_write(rx).await {
            Ok(entry) => {
                self.record_hit(key, correlation_id, entry.data.len(), started);
                Ok(Some(entry))
            }
            Err(message) => Err(CacheError::PendingWrite(message)),
        })
    }

    /// Best-effort removal of an entry record and its payload.
    async fn remove_pair(&self, key: &str, audio_file: Option<&str>) {
        let _ = fs::remove_file(self.entry_path(key)).await;
        match audio_file {
            Some(name) => {
                let _ = fs::remove_file(self.audio_dir().join(name)).await;
            }
            None => {
                // Unknown extension: find the payload by stem
                if let Ok(mut dir) = fs::read_dir(self.audio_dir()).await {
                    while let Ok(Some(dirent)) = dir.next_entry().await {
                        let path = dirent.path();
                        if path.file_stem().and_then(|s| s.to_str()) == Some(key) {
                            let _ = fs::remove_file(&path).await;
                        }
                    }
                }
            }
        }
    }

    fn record_hit(&self, key: &str, correlation_id: &str, bytes: usize, started: Instant) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.counters
            .lookup_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if self.settings.enable_hit_logging {
            debug!(cache_key = %key, correlation_id, bytes, "cache hit");
        }
    }

    fn record_miss(&self, key: &str, started: Instant) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.counters
            .lookup_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        debug!(cache_key = %key, "cache miss");
    }
}

struct ScannedEntry {
    key: String,
    entry_path: PathBuf,
    audio_path: Option<PathBuf>,
    payload_bytes: u64,
    record_bytes: u64,
    modified: SystemTime,
}

/// Wait until an in-flight write settles, returning its outcome.
async fn await_write(mut rx: watch::Receiver<WriteState>) -> Result<CacheEntry, String> {
    loop {
        {
            let state = rx.borrow();
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }
        }
        if rx.changed().await.is_err() {
            return Err("write abandoned before completion".to_string());
        }
    }
}

fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}

fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(unix)]
async fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
        warn!(path = %path.display(), error = %e, "failed to set permissions");
    }
}

#[cfg(not(unix))]
async fn apply_mode(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> CacheSettings {
        CacheSettings {
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn metadata(correlation_id: &str) -> CacheEntryMetadata {
        CacheEntryMetadata {
            provider: "openai".to_string(),
            voice: "alloy".to_string(),
            model: Some("tts-1".to_string()),
            speed: Some(1.0),
            format: Some("mp3".to_string()),
            text: Some("hello".to_string()),
            created_at: 0,
            size_bytes: 0,
            correlation_id: correlation_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        let data = Bytes::from_static(b"fake audio bytes");
        cache
            .set("key1", data.clone(), metadata("c1"))
            .await
            .unwrap();

        let entry = cache.get("key1", "c2").await.unwrap().unwrap();
        assert_eq!(entry.data, data);
        assert_eq!(entry.metadata.provider, "openai");
        assert_eq!(entry.metadata.size_bytes, data.len() as u64);

        // Both files exist with the documented layout
        assert!(dir.path().join("entries/key1.json").exists());
        assert!(dir.path().join("audio/key1.mp3").exists());
    }

    #[tokio::test]
    async fn test_miss_for_unknown_key() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));
        assert!(cache.get("nope", "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(&dir);
        s.enabled = false;
        let cache = AudioCache::new(s);

        cache
            .set("key1", Bytes::from_static(b"data"), metadata("c1"))
            .await
            .unwrap();
        assert!(cache.get("key1", "c2").await.unwrap().is_none());
        // No directories were created
        assert!(!dir.path().join("entries").exists());
    }

    #[tokio::test]
    async fn test_unknown_format_stored_under_mp3() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        let mut meta = metadata("c1");
        meta.format = Some("xyz".to_string());
        cache
            .set("key1", Bytes::from_static(b"data"), meta)
            .await
            .unwrap();

        assert!(dir.path().join("audio/key1.mp3").exists());
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed_on_get() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        let mut meta = metadata("c1");
        // Written just past the age limit
        meta.created_at = now_ms().saturating_sub(cache.settings().max_age.as_millis() as u64 + 1);
        cache
            .set("old", Bytes::from_static(b"stale"), meta)
            .await
            .unwrap();

        assert!(cache.get("old", "c2").await.unwrap().is_none());
        assert!(!dir.path().join("entries/old.json").exists());
        assert!(!dir.path().join("audio/old.mp3").exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_heals_to_miss_and_allows_rewrite() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        cache
            .set("key1", Bytes::from_static(b"data"), metadata("c1"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("entries/key1.json"), b"{not json").unwrap();

        assert!(cache.get("key1", "c2").await.unwrap().is_none());
        assert!(!dir.path().join("entries/key1.json").exists());

        // A subsequent set for the same key succeeds normally
        cache
            .set("key1", Bytes::from_static(b"fresh"), metadata("c3"))
            .await
            .unwrap();
        let entry = cache.get("key1", "c4").await.unwrap().unwrap();
        assert_eq!(entry.data, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_missing_audio_payload_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        cache
            .set("key1", Bytes::from_static(b"data"), metadata("c1"))
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("audio/key1.mp3")).unwrap();

        assert!(cache.get("key1", "c2").await.unwrap().is_none());
        // The dangling record was purged too
        assert!(!dir.path().join("entries/key1.json").exists());
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        cache
            .set("key1", Bytes::from_static(b"12345678"), metadata("c1"))
            .await
            .unwrap();
        let _ = cache.get("key1", "c2").await.unwrap(); // hit
        let _ = cache.get("missing", "c3").await.unwrap(); // miss

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size_bytes, 8);
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.api_calls_saved, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert!(stats.oldest_entry.is_some());
        assert!(stats.disk_usage > stats.total_size_bytes);
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        cache
            .set("a", Bytes::from_static(b"one"), metadata("c1"))
            .await
            .unwrap();
        cache
            .set("b", Bytes::from_static(b"two"), metadata("c2"))
            .await
            .unwrap();

        cache.clear().await.unwrap();
        assert!(cache.get("a", "c3").await.unwrap().is_none());
        assert!(cache.get("b", "c4").await.unwrap().is_none());
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_and_corrupt_pairs() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        let mut old = metadata("c1");
        old.created_at = now_ms().saturating_sub(cache.settings().max_age.as_millis() as u64 + 1);
        cache
            .set("old", Bytes::from_static(b"x"), old)
            .await
            .unwrap();
        cache
            .set("live", Bytes::from_static(b"y"), metadata("c2"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("entries/bad.json"), b"???").unwrap();
        std::fs::write(dir.path().join("audio/orphan.mp3"), b"zzz").unwrap();

        let report = cache.cleanup("c3").await.unwrap();
        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.corrupted_removed, 2); // bad.json + orphan.mp3
        assert!(cache.get("live", "c4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_validate_counts_pair_states() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));

        cache
            .set("good", Bytes::from_static(b"x"), metadata("c1"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("entries/bad.json"), b"not json").unwrap();
        std::fs::write(dir.path().join("audio/orphan.mp3"), b"zzz").unwrap();

        let validation = cache.validate().await.unwrap();
        assert_eq!(validation.valid_entries, 1);
        assert_eq!(validation.corrupted_entries, 1);
        assert_eq!(validation.orphaned_audio_files, 1);
        // validate never mutates
        assert!(dir.path().join("entries/bad.json").exists());
        assert!(dir.path().join("audio/orphan.mp3").exists());
    }

    #[tokio::test]
    async fn test_health_check_reports_accessible_directories() {
        let dir = TempDir::new().unwrap();
        let cache = AudioCache::new(settings(&dir));
        let health = cache.health_check().await;
        assert!(health.directory_accessible);
        assert!(health.free_disk_bytes.is_some());
    }
}
