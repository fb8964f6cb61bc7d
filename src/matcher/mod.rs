//! Request matchers built on the lookup engine.
//!
//! Every matcher follows the same path for a client address: skip private
//! ranges, check the cache, collapse concurrent misses into one database
//! query, evaluate the result and store it. Lookup failures resolve to "no
//! match" and are never cached.

pub mod country;
pub mod region;

use crate::{
    addr::ClientAddr,
    cache::TtlCache,
    config::CacheConfig,
    singleflight::{FlightResult, FlightStats, SingleFlight},
};
use std::{future::Future, net::IpAddr, sync::Arc};
use tokio::runtime::Handle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;

/// What a matcher decided about one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: bool,
    /// The address the decision was made for.
    pub client_ip: Option<IpAddr>,
    /// Country code or raw region record, when the database knew the address.
    pub location: Option<String>,
}

impl MatchOutcome {
    pub fn unmatched(ip: IpAddr) -> Self {
        Self {
            matched: false,
            client_ip: Some(ip),
            location: None,
        }
    }
}

#[async_trait::async_trait]
pub trait Matcher: Send + Sync {
    async fn match_ip(&self, ip: IpAddr) -> MatchOutcome;

    /// Tries each candidate client address in turn and stops at the first
    /// match. Without one, the outcome for the last candidate is returned.
    async fn matches(&self, client: &ClientAddr) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();

        for ip in client.candidates() {
            outcome = self.match_ip(ip).await;
            if outcome.matched {
                break;
            }
        }

        outcome
    }
}

/// Cache plus stampede protection, shared by the matchers.
pub(crate) struct LookupCache<V> {
    cache: Option<Arc<TtlCache<V>>>,
    flight: SingleFlight<V>,
    // Stops the sweeper when the matcher goes away.
    _sweeper: Option<DropGuard>,
}

impl<V: Clone + Send + Sync + 'static> LookupCache<V> {
    /// The sweeper runs on the current Tokio runtime. Outside one, expired
    /// entries are only dropped when a full cache evicts them.
    pub(crate) fn new(config: &CacheConfig, shutdown: &CancellationToken) -> Self {
        let cache = config
            .enabled
            .then(|| Arc::new(TtlCache::new(config.max_size, config.ttl)));

        let sweeper = cache.as_ref().and_then(|cache| {
            if Handle::try_current().is_err() {
                warn!("No Tokio runtime, lookup cache will not be swept");
                return None;
            }

            let token = shutdown.child_token();
            cache.spawn_sweeper(config.sweep_interval, token.clone());
            Some(token.drop_guard())
        });

        Self {
            cache,
            flight: SingleFlight::new(),
            _sweeper: sweeper,
        }
    }

    fn cached(&self, key: &str) -> Option<V> {
        self.cache.as_ref().and_then(|cache| cache.get(key))
    }

    /// Returns the cached value for `key` or produces it with `resolve`.
    ///
    /// Concurrent misses for one key run `resolve` once. Only successful
    /// values are stored.
    pub(crate) async fn get_or_resolve<F, Fut>(&self, key: &str, resolve: F) -> FlightResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }

        self.flight
            .run(key, move || async move {
                // Another flight may have filled it since the first check.
                if let Some(hit) = self.cached(key) {
                    return Ok(hit);
                }

                let value = resolve().await?;
                if let Some(cache) = &self.cache {
                    cache.set(key, value.clone());
                }
                anyhow::Ok(value)
            })
            .await
    }

    pub(crate) fn cached_len(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.len())
    }

    pub(crate) fn stats(&self) -> FlightStats {
        self.flight.stats()
    }
}
