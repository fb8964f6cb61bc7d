use super::{fetch, Source, DEFAULT_INTERVAL, DEFAULT_TIMEOUT, TEMP_SUFFIX};
use crate::{
    database::{DatabaseHandle, GeoReader},
    Result,
};
use anyhow::{bail, Context};
use reqwest::{Client, Url};
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

async fn open_reader<R: GeoReader>(path: PathBuf) -> Result<R> {
    tokio::task::spawn_blocking(move || R::open(&path)).await?
}

async fn validate<R: GeoReader>(path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || R::open(&path)?.close()).await?
}

async fn discard(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "Failed to remove temporary file");
        }
    }
}

/// Keeps one database stream loaded and, for remote sources, fresh.
pub struct Updater<R: GeoReader> {
    source: Source,
    local_file: PathBuf,
    interval: Duration,
    timeout: Duration,
    client: Client,
    handle: Arc<DatabaseHandle<R>>,
    shutdown: CancellationToken,
    // One download at a time: concurrent updates share the temporary file.
    update_lock: Mutex<()>,
}

impl<R: GeoReader> Updater<R> {
    pub fn new(
        source: Source,
        local_file: impl Into<PathBuf>,
        handle: Arc<DatabaseHandle<R>>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            source,
            local_file: local_file.into(),
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            client: fetch::client(DEFAULT_TIMEOUT)?,
            handle,
            shutdown,
            update_lock: Mutex::new(()),
        })
    }

    /// A zero interval selects [`DEFAULT_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        self.client = fetch::client(timeout)?;
        self.timeout = timeout;
        Ok(self)
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn local_file(&self) -> &Path {
        &self.local_file
    }

    pub fn handle(&self) -> &Arc<DatabaseHandle<R>> {
        &self.handle
    }

    pub fn temp_file(&self) -> PathBuf {
        let mut name = self.local_file.clone().into_os_string();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }

    /// Loads the database before the first lookup.
    ///
    /// Remote sources reuse a valid file left by an earlier run and download
    /// one otherwise.
    pub async fn provision(&self) -> Result<()> {
        if let Source::Remote(_) = &self.source {
            if let Some(parent) = self.local_file.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            if tokio::fs::try_exists(&self.local_file).await.unwrap_or(false) {
                match open_reader::<R>(self.local_file.clone()).await {
                    Ok(reader) => {
                        self.install(reader).await;
                        info!(
                            source = %self.source,
                            path = %self.local_file.display(),
                            "Loaded existing database"
                        );
                        return Ok(());
                    }
                    Err(err) => warn!(
                        path = %self.local_file.display(),
                        "Existing database is unusable, downloading: {:#}",
                        err
                    ),
                }
            }

            return self
                .update()
                .await
                .context("Initial database download failed");
        }

        let reader = open_reader::<R>(self.local_file.clone())
            .await
            .with_context(|| {
                format!("Failed to open database {}", self.local_file.display())
            })?;
        self.install(reader).await;
        info!(path = %self.local_file.display(), "Loaded local database");
        Ok(())
    }

    /// Downloads, validates and installs a fresh copy unconditionally.
    ///
    /// On any failure the live reader and file stay untouched and the
    /// temporary file is removed. Concurrent calls run one after another.
    pub async fn update(&self) -> Result<()> {
        let Source::Remote(url) = &self.source else {
            bail!("{} is a local database and cannot be downloaded", self.source);
        };
        let _updating = self.update_lock.lock().await;

        let temp = self.temp_file();
        let staged = self.stage(url, &temp).await;
        if staged.is_err() {
            discard(&temp).await;
        }
        staged?;

        let reader = open_reader::<R>(self.local_file.clone())
            .await
            .context("open new database file failed")?;
        self.install(reader).await;

        info!(source = %self.source, path = %self.local_file.display(), "Database updated");
        Ok(())
    }

    async fn stage(&self, url: &Url, temp: &Path) -> Result<()> {
        let bytes = self
            .bounded("Download", fetch::download(&self.client, url, temp))
            .await
            .context("download failed")?;
        debug!(%url, bytes, temp = %temp.display(), "Downloaded database");

        validate::<R>(temp.to_owned())
            .await
            .context("invalid database file")?;

        tokio::fs::rename(temp, &self.local_file)
            .await
            .context("replace database file failed")
    }

    async fn install(&self, reader: R) {
        if let Some(previous) = self.handle.replace(reader).await {
            if let Err(err) = previous.close() {
                warn!(source = %self.source, "Failed to close replaced database: {:#}", err);
            }
        }
    }

    /// Updates the database if the remote copy changed. Returns whether a
    /// new reader was installed.
    pub async fn refresh_once(&self) -> Result<bool> {
        let Source::Remote(url) = &self.source else {
            return Ok(false);
        };

        let stale = self
            .bounded(
                "Freshness check",
                fetch::needs_update(&self.client, url, &self.local_file, self.interval),
            )
            .await?;
        if !stale {
            debug!(source = %self.source, "Database is up to date");
            return Ok(false);
        }

        self.update().await?;
        Ok(true)
    }

    async fn bounded<T>(
        &self,
        what: &str,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => bail!("{} cancelled by shutdown", what),

            result = tokio::time::timeout(self.timeout, operation) => result
                .with_context(|| format!("{} timed out after {:?}", what, self.timeout))?,
        }
    }

    /// Refreshes every `interval` until the shutdown token fires. Local
    /// sources are never refreshed and return immediately.
    pub async fn run(self: Arc<Self>) {
        if !self.source.is_remote() {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            source = %self.source,
            interval_secs = self.interval.as_secs(),
            "Starting database refresh"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!(source = %self.source, "Database refresh shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(err) = self.refresh_once().await {
                        warn!(source = %self.source, "Database refresh failed: {:#}", err);
                    }
                }
            }
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{text_db, FileServer, Served, TextReader};
    use std::net::IpAddr;

    const FUTURE: &str = "Fri, 01 Jan 2100 00:00:00 GMT";
    const PAST: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

    fn everywhere(record: &str) -> TextReader {
        TextReader::from_entries(&[("0.0.0.0/0", record)])
    }

    fn ip() -> IpAddr {
        "1.2.3.4".parse().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        _server: FileServer,
        probe: TextReader,
        updater: Updater<TextReader>,
    }

    /// An updater whose handle holds an "old" reader backed by a file on
    /// disk, pointed at `served` on a local server.
    async fn fixture(served: Option<Served>) -> Fixture {
        let mut files = Vec::new();
        if let Some(served) = served {
            files.push(("/geo.db", served));
        }
        let server = FileServer::start(files).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("geo.db");
        std::fs::write(&local, text_db(&[("0.0.0.0/0", "old")])).unwrap();

        let probe = everywhere("old");
        let handle = Arc::new(DatabaseHandle::new(probe.clone()));
        let source = server.url("/geo.db").parse().unwrap();
        let updater = Updater::new(source, &local, handle, CancellationToken::new()).unwrap();

        Fixture {
            _dir: dir,
            _server: server,
            probe,
            updater,
        }
    }

    async fn record(updater: &Updater<TextReader>) -> Option<String> {
        updater.handle().lookup(ip()).await.unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn refresh_swaps_in_newer_database() {
        let served = Served::new(text_db(&[("0.0.0.0/0", "new")])).last_modified(FUTURE);
        let Fixture { probe, updater, _dir, _server } = fixture(Some(served)).await;

        assert_eq!(record(&updater).await.as_deref(), Some("old"));
        assert!(updater.refresh_once().await.unwrap());

        assert!(probe.is_closed());
        assert!(probe.lookup(ip()).is_err());
        assert_eq!(probe.close_count(), 1);
        assert_eq!(record(&updater).await.as_deref(), Some("new"));
        assert!(!updater.temp_file().exists());
        assert!(std::fs::read_to_string(updater.local_file())
            .unwrap()
            .contains("new"));
    }

    #[test_log::test(tokio::test)]
    async fn refresh_skips_unchanged_database() {
        let served = Served::new(text_db(&[("0.0.0.0/0", "new")])).last_modified(PAST);
        let Fixture { probe, updater, _dir, _server } = fixture(Some(served)).await;

        assert!(!updater.refresh_once().await.unwrap());
        assert!(!probe.is_closed());
        assert_eq!(record(&updater).await.as_deref(), Some("old"));
    }

    #[test_log::test(tokio::test)]
    async fn invalid_download_keeps_live_database() {
        let served = Served::new("<html>captive portal</html>").last_modified(FUTURE);
        let Fixture { probe, updater, _dir, _server } = fixture(Some(served)).await;

        let err = updater.refresh_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid database file"));

        assert!(!probe.is_closed());
        assert_eq!(record(&updater).await.as_deref(), Some("old"));
        assert!(!updater.temp_file().exists());
        assert!(std::fs::read_to_string(updater.local_file())
            .unwrap()
            .contains("old"));
    }

    #[test_log::test(tokio::test)]
    async fn failed_download_keeps_live_database() {
        let Fixture { probe, updater, _dir, _server } = fixture(None).await;

        assert!(updater.refresh_once().await.is_err());

        let err = updater.update().await.unwrap_err();
        assert!(format!("{err:#}").contains("download failed"));
        assert!(!probe.is_closed());
        assert_eq!(record(&updater).await.as_deref(), Some("old"));
        assert!(!updater.temp_file().exists());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_updates_run_one_at_a_time() {
        let body = text_db(&[("0.0.0.0/0", "new")]);
        let served = Served::new(body.clone());
        let Fixture { probe, updater, _dir, _server } = fixture(Some(served)).await;

        let (first, second) = tokio::join!(updater.update(), updater.update());
        first.unwrap();
        second.unwrap();

        assert!(probe.is_closed());
        assert_eq!(record(&updater).await.as_deref(), Some("new"));
        assert_eq!(std::fs::read_to_string(updater.local_file()).unwrap(), body);
        assert!(!updater.temp_file().exists());
    }

    #[tokio::test]
    async fn temp_file_sits_next_to_live_file() {
        let updater: Updater<TextReader> = Updater::new(
            "https://example.com/geo.db".parse().unwrap(),
            "/data/geo.db",
            Arc::default(),
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(updater.temp_file(), PathBuf::from("/data/geo.db.temp"));
    }

    #[tokio::test]
    async fn local_source_is_never_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("geo.db");
        std::fs::write(&local, text_db(&[("0.0.0.0/0", "local")])).unwrap();

        let updater = Arc::new(
            Updater::<TextReader>::new(
                Source::Local(local.clone()),
                &local,
                Arc::default(),
                CancellationToken::new(),
            )
            .unwrap(),
        );
        updater.provision().await.unwrap();

        assert!(!updater.refresh_once().await.unwrap());
        assert!(updater.update().await.is_err());
        tokio::time::timeout(Duration::from_secs(1), updater.spawn())
            .await
            .expect("local refresh task should exit at once")
            .unwrap();
        assert_eq!(record(&updater).await.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn provision_fails_for_missing_local_database() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.db");
        let updater = Updater::<TextReader>::new(
            Source::Local(missing.clone()),
            &missing,
            Arc::default(),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(updater.provision().await.is_err());
        assert!(!updater.handle().is_loaded().await);
    }

    #[test_log::test(tokio::test)]
    async fn provision_downloads_missing_database() {
        let server = FileServer::start(vec![(
            "/geo.db",
            Served::new(text_db(&[("0.0.0.0/0", "downloaded")])),
        )])
        .await
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("nested").join("geo.db");

        let updater = Updater::<TextReader>::new(
            server.url("/geo.db").parse().unwrap(),
            &local,
            Arc::default(),
            CancellationToken::new(),
        )
        .unwrap();
        updater.provision().await.unwrap();

        assert!(local.exists());
        assert_eq!(record(&updater).await.as_deref(), Some("downloaded"));
    }

    #[test_log::test(tokio::test)]
    async fn provision_reuses_existing_download() {
        // Nothing is served; a download attempt would fail.
        let server = FileServer::start(vec![]).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("geo.db");
        std::fs::write(&local, text_db(&[("0.0.0.0/0", "cached")])).unwrap();

        let updater = Updater::<TextReader>::new(
            server.url("/geo.db").parse().unwrap(),
            &local,
            Arc::default(),
            CancellationToken::new(),
        )
        .unwrap();
        updater.provision().await.unwrap();

        assert_eq!(record(&updater).await.as_deref(), Some("cached"));
    }

    #[test_log::test(tokio::test)]
    async fn provision_reports_failed_initial_download() {
        let server = FileServer::start(vec![]).await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let updater = Updater::<TextReader>::new(
            server.url("/geo.db").parse().unwrap(),
            dir.path().join("geo.db"),
            Arc::default(),
            CancellationToken::new(),
        )
        .unwrap();

        let err = updater.provision().await.unwrap_err();
        assert!(err.to_string().contains("Initial database download failed"));
    }

    #[tokio::test]
    async fn network_operations_are_bounded() {
        let shutdown = CancellationToken::new();
        let updater = Updater::<TextReader>::new(
            "https://example.com/geo.db".parse().unwrap(),
            "geo.db",
            Arc::default(),
            shutdown.clone(),
        )
        .unwrap()
        .with_timeout(Duration::from_millis(20))
        .unwrap();

        let err = updater
            .bounded("Probe", futures::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        shutdown.cancel();
        let err = updater
            .bounded("Probe", futures::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test_log::test(tokio::test)]
    async fn run_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let updater = Arc::new(
            Updater::<TextReader>::new(
                "https://example.com/geo.db".parse().unwrap(),
                "geo.db",
                Arc::default(),
                shutdown.clone(),
            )
            .unwrap()
            .with_interval(Duration::from_secs(3600)),
        );

        let task = updater.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("refresh task should stop promptly")
            .unwrap();
    }
}
