//! Application-lifetime owner of the databases.
//!
//! Matchers are built through a [`GeoApp`] so that every matcher configured
//! with the same source shares one reader, one local file and one refresh
//! task. Shutting the app down stops the background tasks and closes the
//! readers.

use crate::{
    config::{CountryConfig, GeoConfig, RegionConfig, SourceConfig},
    database::{DatabaseHandle, GeoReader},
    matcher::{country::CountryMatcher, region::RegionMatcher},
    refresh::{Source, Updater},
    Result,
};
use anyhow::{bail, Context};
use futures::future::join_all;
use std::{
    any::{type_name, Any},
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COUNTRY_STREAM: &str = "country";
const REGION_STREAM: &str = "region";
const REGION_V6_STREAM: &str = "region_v6";

/// A loaded database and the updater keeping it fresh.
pub struct GeoDatabase<R: GeoReader> {
    handle: Arc<DatabaseHandle<R>>,
    updater: Arc<Updater<R>>,
}

impl<R: GeoReader> GeoDatabase<R> {
    pub fn handle(&self) -> &Arc<DatabaseHandle<R>> {
        &self.handle
    }

    pub fn updater(&self) -> &Arc<Updater<R>> {
        &self.updater
    }
}

/// Reader-type-erased view of a [`GeoDatabase`].
#[async_trait::async_trait]
trait ManagedDatabase: Send + Sync {
    fn source(&self) -> &Source;

    fn local_file(&self) -> &Path;

    async fn update(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait::async_trait]
impl<R: GeoReader> ManagedDatabase for GeoDatabase<R> {
    fn source(&self) -> &Source {
        self.updater.source()
    }

    fn local_file(&self) -> &Path {
        self.updater.local_file()
    }

    async fn update(&self) -> Result<()> {
        self.updater.update().await
    }

    async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

struct Registered {
    typed: Arc<dyn Any + Send + Sync>,
    managed: Arc<dyn ManagedDatabase>,
}

pub struct GeoApp {
    data_dir: PathBuf,
    shutdown: CancellationToken,
    databases: Mutex<HashMap<String, Registered>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GeoApp {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            shutdown: CancellationToken::new(),
            databases: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &GeoConfig) -> Self {
        Self::new(&config.data_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the database for `config`, loading it on first use.
    ///
    /// Loading a remote source downloads it if no usable local copy exists
    /// and starts its refresh task. Downloads of `stream` are stored in the
    /// data directory under a name starting with `stream`. Failure to load is
    /// an error; nothing is registered in that case.
    pub async fn database<R: GeoReader>(
        &self,
        config: &SourceConfig,
        stream: &str,
    ) -> Result<Arc<GeoDatabase<R>>> {
        let key = format!("{}|{}", type_name::<R>(), config.source);
        // Held across provisioning so concurrent callers never download twice.
        let mut databases = self.databases.lock().await;

        if let Some(registered) = databases.get(&key) {
            if let Ok(database) = registered.typed.clone().downcast::<GeoDatabase<R>>() {
                debug!(source = %config.source, "Reusing loaded database");
                return Ok(database);
            }
        }

        // Readers may share a local file, but nothing may download over one
        // another database uses.
        let local_file = config.source.local_path(&self.data_dir, stream);
        if let Some(other) = databases.values().find(|registered| {
            registered.managed.local_file() == local_file.as_path()
                && (config.source.is_remote() || registered.managed.source().is_remote())
        }) {
            bail!(
                "{} and {} would share the database file {}",
                other.managed.source(),
                config.source,
                local_file.display()
            );
        }

        let handle = Arc::new(DatabaseHandle::empty());
        let updater = Updater::new(
            config.source.clone(),
            local_file,
            handle.clone(),
            self.shutdown.child_token(),
        )?
        .with_interval(config.interval)
        .with_timeout(config.timeout)?;

        updater
            .provision()
            .await
            .with_context(|| format!("Failed to load database from {}", config.source))?;

        let updater = Arc::new(updater);
        if config.source.is_remote() {
            self.tasks.lock().await.push(updater.spawn());
        }

        let database = Arc::new(GeoDatabase { handle, updater });
        databases.insert(
            key,
            Registered {
                typed: database.clone(),
                managed: database.clone(),
            },
        );

        Ok(database)
    }

    pub async fn country_matcher<R: GeoReader<Record = String>>(
        &self,
        config: &CountryConfig,
    ) -> Result<CountryMatcher<R>> {
        config.validate()?;
        let database = self.database::<R>(&config.source, COUNTRY_STREAM).await?;

        CountryMatcher::new(
            database.handle().clone(),
            config.countries.clone(),
            &config.cache,
            &self.shutdown,
        )
    }

    pub async fn region_matcher<R: GeoReader<Record = String>>(
        &self,
        config: &RegionConfig,
    ) -> Result<RegionMatcher<R>> {
        let policy = config.policy()?;
        let database = self.database::<R>(&config.source, REGION_STREAM).await?;

        let mut matcher = RegionMatcher::new(
            policy,
            database.handle().clone(),
            &config.cache,
            &self.shutdown,
        );
        if let Some(ipv6) = &config.ipv6_source {
            let ipv6 = self.database::<R>(ipv6, REGION_V6_STREAM).await?;
            matcher = matcher.with_ipv6(ipv6.handle().clone());
        }

        Ok(matcher)
    }

    fn managed(databases: &HashMap<String, Registered>) -> Vec<Arc<dyn ManagedDatabase>> {
        databases
            .values()
            .map(|registered| registered.managed.clone())
            .collect()
    }

    /// Downloads and installs a fresh copy of every remote database.
    ///
    /// Every source is tried. Returns how many were updated, or an error
    /// naming each source that failed.
    pub async fn update_all(&self) -> Result<usize> {
        let databases = Self::managed(&*self.databases.lock().await);
        let mut updated = 0;
        let mut failures = Vec::new();

        for database in databases.iter().filter(|db| db.source().is_remote()) {
            match database.update().await {
                Ok(()) => updated += 1,
                Err(err) => {
                    warn!(source = %database.source(), "Database update failed: {:#}", err);
                    failures.push(format!("{}: {:#}", database.source(), err));
                }
            }
        }

        if !failures.is_empty() {
            bail!(
                "Failed to update {} of {} databases: {}",
                failures.len(),
                updated + failures.len(),
                failures.join("; ")
            );
        }
        Ok(updated)
    }

    /// Stops every background task and closes every database.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!("Background task failed: {}", err);
            }
        }

        let databases = std::mem::take(&mut *self.databases.lock().await);
        for database in Self::managed(&databases) {
            if let Err(err) = database.close().await {
                warn!(source = %database.source(), "Failed to close database: {:#}", err);
            }
        }

        info!("Geo databases closed");
    }
}

impl Drop for GeoApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
