use super::{LookupCache, MatchOutcome, Matcher};
use crate::{
    addr::is_private,
    config::CacheConfig,
    database::{mmdb::CountryReader, DatabaseHandle, GeoReader},
    singleflight::FlightStats,
    Result,
};
use anyhow::ensure;
use std::{net::IpAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Matches public addresses located in one of a set of countries.
pub struct CountryMatcher<R: GeoReader<Record = String> = CountryReader> {
    countries: Vec<String>,
    database: Arc<DatabaseHandle<R>>,
    lookups: LookupCache<Option<String>>,
}

impl<R: GeoReader<Record = String>> CountryMatcher<R> {
    /// `countries` are ISO 3166-1 alpha-2 codes, compared case-insensitively.
    ///
    /// Call from within a Tokio runtime to get the cache sweeper.
    pub fn new(
        database: Arc<DatabaseHandle<R>>,
        countries: Vec<String>,
        cache: &CacheConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let countries: Vec<String> = countries
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .collect();
        ensure!(!countries.is_empty(), "at least one country is required");
        ensure!(
            countries.iter().all(|c| !c.is_empty()),
            "country codes must not be empty"
        );

        Ok(Self {
            countries,
            database,
            lookups: LookupCache::new(cache, shutdown),
        })
    }

    pub fn countries(&self) -> &[String] {
        &self.countries
    }

    pub fn cached_entries(&self) -> usize {
        self.lookups.cached_len()
    }

    pub fn lookup_stats(&self) -> FlightStats {
        self.lookups.stats()
    }

    fn is_listed(&self, code: &str) -> bool {
        self.countries.iter().any(|c| c.eq_ignore_ascii_case(code))
    }
}

#[async_trait::async_trait]
impl<R: GeoReader<Record = String>> Matcher for CountryMatcher<R> {
    async fn match_ip(&self, ip: IpAddr) -> MatchOutcome {
        if is_private(ip) {
            return MatchOutcome::unmatched(ip);
        }

        let database = &self.database;
        let country = self
            .lookups
            .get_or_resolve(&ip.to_string(), || async move {
                anyhow::Ok(database.lookup(ip).await?)
            })
            .await;

        match country {
            Ok(country) => MatchOutcome {
                matched: country.as_deref().is_some_and(|c| self.is_listed(c)),
                client_ip: Some(ip),
                location: country,
            },
            Err(err) => {
                debug!(%ip, "Country lookup failed: {:#}", err);
                MatchOutcome::unmatched(ip)
            }
        }
    }
}
