use crate::{
    cache::{DEFAULT_MAX_SIZE, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL},
    policy::{Mode, RegionPolicy, DEFAULT_DOMESTIC},
    refresh::{Source, DEFAULT_INTERVAL, DEFAULT_TIMEOUT},
    Result,
};
use anyhow::{ensure, Context};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationSeconds};
use std::{
    env,
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};

fn default_data_dir() -> PathBuf {
    env::temp_dir().join("geogate")
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_countries() -> Vec<String> {
    vec!["CN".to_owned()]
}

fn default_domestic() -> String {
    DEFAULT_DOMESTIC.to_owned()
}

/// Top level configuration, read from a RON file.
///
/// ```ron
/// (
///     data_dir: "/var/lib/geogate",
///     region: Some((
///         source: (source: "https://example.com/city.mmdb", interval: 86400),
///         mode: deny,
///         keywords: ["北京", "上海"],
///     )),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    /// Where downloaded databases are stored.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub country: Option<CountryConfig>,
    #[serde(default)]
    pub region: Option<RegionConfig>,
}

impl GeoConfig {
    pub fn from_ron(content: &str) -> Result<Self> {
        let config: Self = ron::de::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_ron(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.country.is_some() || self.region.is_some(),
            "no country or region matcher is configured"
        );

        if let Some(country) = &self.country {
            country.validate()?;
        }
        if let Some(region) = &self.region {
            region.validate()?;
        }
        Ok(())
    }
}

/// One database stream.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// HTTP(S) URL to download from, or a local path used in place.
    #[serde_as(as = "DisplayFromStr")]
    pub source: Source,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_interval")]
    pub interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

impl SourceConfig {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub ttl: Duration,
    /// Zero selects the default size.
    pub max_size: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_TTL,
            max_size: DEFAULT_MAX_SIZE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountryConfig {
    pub source: SourceConfig,
    /// ISO 3166-1 alpha-2 codes.
    #[serde(default = "default_countries")]
    pub countries: Vec<String>,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl CountryConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.countries.is_empty(), "country list must not be empty");
        ensure!(
            self.countries.iter().all(|c| !c.trim().is_empty()),
            "country codes must not be empty"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub source: SourceConfig,
    /// Answers IPv6 lookups instead of `source` when set.
    #[serde(default)]
    pub ipv6_source: Option<SourceConfig>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Country value whose records are subject to keyword matching.
    #[serde(default = "default_domestic")]
    pub domestic: String,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl RegionConfig {
    pub fn policy(&self) -> Result<RegionPolicy> {
        ensure!(
            !self.domestic.trim().is_empty(),
            "domestic country must not be empty"
        );
        let policy = RegionPolicy::new(self.mode, self.keywords.clone())?;
        Ok(policy.with_domestic(self.domestic.trim()))
    }

    pub fn validate(&self) -> Result<()> {
        self.policy().map(|_| ())
    }
}
