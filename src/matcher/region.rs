use super::{LookupCache, MatchOutcome, Matcher};
use crate::{
    addr::is_private,
    config::CacheConfig,
    database::{mmdb::CityReader, DatabaseHandle, GeoReader},
    policy::RegionPolicy,
    singleflight::FlightStats,
};
use std::{net::IpAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Cached verdict for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHit {
    pub location: Option<String>,
    pub matched: bool,
}

/// Matches addresses against a [`RegionPolicy`] using pipe-delimited
/// location records.
///
/// IPv6 addresses go to the dedicated IPv6 database when one is attached and
/// to the primary database otherwise.
pub struct RegionMatcher<R: GeoReader<Record = String> = CityReader> {
    policy: RegionPolicy,
    database: Arc<DatabaseHandle<R>>,
    ipv6: Option<Arc<DatabaseHandle<R>>>,
    lookups: LookupCache<RegionHit>,
}

impl<R: GeoReader<Record = String>> RegionMatcher<R> {
    /// Call from within a Tokio runtime to get the cache sweeper.
    pub fn new(
        policy: RegionPolicy,
        database: Arc<DatabaseHandle<R>>,
        cache: &CacheConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            policy,
            database,
            ipv6: None,
            lookups: LookupCache::new(cache, shutdown),
        }
    }

    pub fn with_ipv6(mut self, database: Arc<DatabaseHandle<R>>) -> Self {
        self.ipv6 = Some(database);
        self
    }

    pub fn policy(&self) -> &RegionPolicy {
        &self.policy
    }

    pub fn cached_entries(&self) -> usize {
        self.lookups.cached_len()
    }

    pub fn lookup_stats(&self) -> FlightStats {
        self.lookups.stats()
    }

    fn database_for(&self, ip: IpAddr) -> &DatabaseHandle<R> {
        match (ip, &self.ipv6) {
            (IpAddr::V6(_), Some(ipv6)) => ipv6,
            _ => &self.database,
        }
    }
}

#[async_trait::async_trait]
impl<R: GeoReader<Record = String>> Matcher for RegionMatcher<R> {
    async fn match_ip(&self, ip: IpAddr) -> MatchOutcome {
        if is_private(ip) {
            return MatchOutcome::unmatched(ip);
        }

        let database = self.database_for(ip);
        let policy = &self.policy;
        let hit = self
            .lookups
            .get_or_resolve(&ip.to_string(), || async move {
                let location = database.lookup(ip).await?;
                let matched = location.as_deref().is_some_and(|raw| policy.matches(raw));
                trace!(%ip, location = ?location, matched, "Resolved region");

                anyhow::Ok(RegionHit { location, matched })
            })
            .await;

        match hit {
            Ok(hit) => MatchOutcome {
                matched: hit.matched,
                client_ip: Some(ip),
                location: hit.location,
            },
            Err(err) => {
                debug!(%ip, "Region lookup failed: {:#}", err);
                MatchOutcome::unmatched(ip)
            }
        }
    }
}
