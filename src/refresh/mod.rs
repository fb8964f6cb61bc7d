//! Keeps remote databases fresh.
//!
//! A remote database is probed with a HEAD request on a fixed interval. When
//! the remote copy is newer, it is downloaded next to the live file as
//! `<name>.temp`, validated, renamed over the live file, reopened and swapped
//! into its [`crate::DatabaseHandle`]. Any failure leaves the live reader in
//! place.

pub mod fetch;
pub mod source;
pub mod updater;

use std::time::Duration;

pub use source::Source;
pub use updater::Updater;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const TEMP_SUFFIX: &str = ".temp";
