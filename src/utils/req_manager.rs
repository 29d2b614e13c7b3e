//! Semaphore-bounded HTTP client manager for provider calls.
//!
//! A single long-lived `reqwest` client (connection pooling, HTTP/2
//! keep-alive) shared behind a fair semaphore: callers over the concurrency
//! cap queue in FIFO order. Each acquisition is tracked in the manager's
//! metrics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Running counters for requests issued through the manager.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    /// Total number of requests made
    pub total_requests: AtomicU64,
    /// Number of currently active requests
    pub active_requests: AtomicUsize,
    /// Peak concurrent requests observed
    pub peak_concurrent: AtomicUsize,
}

/// Configuration for the HTTP request manager
#[derive(Debug, Clone)]
pub struct ReqManagerConfig {
    /// Maximum number of concurrent requests
    pub max_concurrent_requests: usize,
    /// Maximum idle connections per host
    pub pool_max_idle_per_host: usize,
    /// TCP keep-alive duration
    pub tcp_keepalive: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for ReqManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            pool_max_idle_per_host: 16,
            tcp_keepalive: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Shared HTTP client with a bounded, FIFO concurrency gate.
pub struct ReqManager {
    max_concurrent_requests: usize,
    client: Arc<Client>,
    semaphore: Arc<Semaphore>,
    metrics: Arc<RequestMetrics>,
}

/// A guard holding one concurrency slot. The slot is released and the
/// active-request count decremented when the guard drops.
pub struct ClientGuard<'a> {
    manager: &'a ReqManager,
    client: Arc<Client>,
    _permit: SemaphorePermit<'a>,
}

impl ClientGuard<'_> {
    /// Get the HTTP client for making requests
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .metrics
            .active_requests
            .fetch_sub(1, Ordering::Relaxed);
    }
}

impl ReqManager {
    /// Create a manager with the default configuration and the given cap.
    pub fn new(max_concurrent_requests: usize) -> Result<Self, reqwest::Error> {
        Self::with_config(ReqManagerConfig {
            max_concurrent_requests,
            ..Default::default()
        })
    }

    /// Create a manager with a custom configuration.
    pub fn with_config(config: ReqManagerConfig) -> Result<Self, reqwest::Error> {
        let max_concurrent_requests = config.max_concurrent_requests.max(1);
        let client = Arc::new(
            Client::builder()
                .pool_max_idle_per_host(config.pool_max_idle_per_host)
                .tcp_keepalive(config.tcp_keepalive)
                .tcp_nodelay(true)
                .connect_timeout(config.connect_timeout)
                .timeout(config.request_timeout)
                .user_agent(concat!("sonara/", env!("CARGO_PKG_VERSION")))
                .build()?,
        );

        Ok(Self {
            max_concurrent_requests,
            client,
            semaphore: Arc::new(Semaphore::new(max_concurrent_requests)),
            metrics: Arc::new(RequestMetrics::default()),
        })
    }

    /// Acquire a concurrency slot, waiting FIFO behind other callers when the
    /// cap is reached.
    pub async fn acquire(&self) -> Result<ClientGuard<'_>, tokio::sync::AcquireError> {
        let permit = self.semaphore.acquire().await?;

        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        let active = self.metrics.active_requests.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics
            .peak_concurrent
            .fetch_max(active, Ordering::Relaxed);

        Ok(ClientGuard {
            manager: self,
            client: Arc::clone(&self.client),
            _permit: permit,
        })
    }

    /// Get the maximum number of concurrent requests
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent_requests
    }

    /// Get the number of active requests
    pub fn active_requests(&self) -> usize {
        self.metrics.active_requests.load(Ordering::Relaxed)
    }

    /// Get performance metrics
    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_req_manager_creation() {
        let manager = ReqManager::new(3).unwrap();
        assert_eq!(manager.max_concurrent(), 3);
        assert_eq!(manager.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_zero_cap_is_clamped_to_one() {
        let manager = ReqManager::new(0).unwrap();
        assert_eq!(manager.max_concurrent(), 1);
        let _guard = manager.acquire().await.unwrap();
        assert_eq!(manager.active_requests(), 1);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let manager = ReqManager::new(2).unwrap();

        let guard1 = manager.acquire().await.unwrap();
        assert_eq!(manager.active_requests(), 1);
        let guard2 = manager.acquire().await.unwrap();
        assert_eq!(manager.active_requests(), 2);

        drop(guard1);
        let _guard3 = manager.acquire().await.unwrap();
        assert_eq!(manager.active_requests(), 2);

        drop(guard2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_limited() {
        let manager = Arc::new(ReqManager::new(3).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            let counter = Arc::clone(&counter);
            let max_concurrent = Arc::clone(&max_concurrent);

            handles.push(tokio::spawn(async move {
                let _guard = manager.acquire().await.unwrap();
                let active = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(active, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let max_seen = max_concurrent.load(Ordering::SeqCst);
        assert!(
            max_seen <= 3,
            "max concurrent was {max_seen} but should be <= 3"
        );
        assert_eq!(
            manager.metrics().total_requests.load(Ordering::Relaxed),
            10
        );
    }
}
