//! Health Monitor
//!
//! Time-windowed health cache for the collector connection, with a cheap
//! local check and a remote HEAD check.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::connection::factory::Connection;

/// Timeout for the remote health check
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct HealthCache {
    last_check: Option<Instant>,
    healthy: bool,
}

/// Cached connection health
#[derive(Debug)]
pub struct HealthMonitor {
    interval: Duration,
    health_path: String,
    cache: Mutex<HealthCache>,
}

impl HealthMonitor {
    pub fn new(interval: Duration, health_path: impl Into<String>) -> Self {
        Self {
            interval,
            health_path: health_path.into(),
            cache: Mutex::new(HealthCache::default()),
        }
    }

    /// Local health check that never touches the network. A disposed or
    /// expired connection is unhealthy regardless of the cache; otherwise a
    /// fresh healthy result is reused.
    pub fn check_cached(
        &self,
        connection: Option<&Connection>,
        initialized: bool,
        disposed: bool,
    ) -> bool {
        let usable = initialized
            && !disposed
            && connection.is_some_and(|c| !c.is_disposed() && !c.is_expired());

        let mut cache = self.cache.lock();
        if usable && cache.healthy && self.is_fresh(&cache) {
            return true;
        }

        cache.healthy = usable;
        cache.last_check = Some(Instant::now());
        usable
    }

    /// HEAD request against the health path. 2xx and 404 count as healthy,
    /// since collectors are not required to expose the path.
    pub async fn check_remote(&self, connection: &Connection) -> bool {
        let healthy = match connection.head(&self.health_path, HEALTH_CHECK_TIMEOUT).await {
            Ok(status) => (200..300).contains(&status) || status == 404,
            Err(e) => {
                warn!(error = %e, "Health check failed");
                false
            }
        };

        debug!(healthy, path = %self.health_path, "Health check completed");
        self.record(healthy);
        healthy
    }

    /// Trust the cache inside the interval, otherwise ask the collector.
    pub async fn check(&self, connection: &Connection) -> bool {
        {
            let cache = self.cache.lock();
            if cache.healthy && self.is_fresh(&cache) {
                return true;
            }
        }
        self.check_remote(connection).await
    }

    /// Overwrite the cached health
    pub fn record(&self, healthy: bool) {
        let mut cache = self.cache.lock();
        cache.healthy = healthy;
        cache.last_check = Some(Instant::now());
    }

    /// Forget the cached result so the next check re-derives it
    pub fn invalidate(&self) {
        let mut cache = self.cache.lock();
        cache.healthy = false;
        cache.last_check = None;
    }

    pub fn last_known(&self) -> bool {
        self.cache.lock().healthy
    }

    fn is_fresh(&self, cache: &HealthCache) -> bool {
        cache
            .last_check
            .is_some_and(|at| at.elapsed() < self.interval)
    }
}
