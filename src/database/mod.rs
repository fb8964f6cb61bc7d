pub mod mmdb;

use crate::Result;
use std::{net::IpAddr, path::Path};
use tokio::sync::RwLock;

/// A geo database reader supplied by an external library.
///
/// The engine never looks at the file format behind it; it only opens,
/// queries and closes readers.
pub trait GeoReader: Send + Sync + Sized + 'static {
    type Record: Clone + Send + Sync + 'static;

    fn open(path: &Path) -> Result<Self>;

    /// Returns `Ok(None)` when the address is not present in the database.
    fn lookup(&self, ip: IpAddr) -> Result<Option<Self::Record>>;

    fn close(self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("geo database is not loaded")]
    Unavailable,

    #[error("geo database lookup failed: {0:#}")]
    Reader(anyhow::Error),
}

/// Owns the live reader of one database stream and swaps it atomically.
///
/// Lookups hold the shared lock for the duration of a single query, so a
/// replacement waits for in-flight queries against the old reader to drain
/// and every query observes either the old or the new reader in full.
pub struct DatabaseHandle<R> {
    reader: RwLock<Option<R>>,
}

impl<R: GeoReader> DatabaseHandle<R> {
    pub fn empty() -> Self {
        Self {
            reader: RwLock::new(None),
        }
    }

    pub fn new(reader: R) -> Self {
        Self {
            reader: RwLock::new(Some(reader)),
        }
    }

    pub async fn lookup(&self, ip: IpAddr) -> std::result::Result<Option<R::Record>, LookupError> {
        let reader = self.reader.read().await;
        let reader = reader.as_ref().ok_or(LookupError::Unavailable)?;

        reader.lookup(ip).map_err(LookupError::Reader)
    }

    /// Installs `reader` and hands back the previous one.
    ///
    /// The caller is responsible for closing the returned reader; it is no
    /// longer reachable through this handle.
    pub async fn replace(&self, reader: R) -> Option<R> {
        self.reader.write().await.replace(reader)
    }

    /// Closes the live reader, if any. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let reader = self.reader.write().await.take();

        match reader {
            Some(reader) => reader.close(),
            None => Ok(()),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.reader.read().await.is_some()
    }
}

impl<R: GeoReader> Default for DatabaseHandle<R> {
    fn default() -> Self {
        Self::empty()
    }
}
