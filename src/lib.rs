//! Geo-location request matching.
//!
//! Answers "does this client address belong to a configured region?" from a
//! local geo database that is refreshed in the background and swapped into
//! service without interrupting lookups already in flight.

pub mod addr;
pub mod app;
pub mod cache;
pub mod config;
pub mod database;
pub mod matcher;
pub mod policy;
pub mod refresh;
pub mod singleflight;

#[cfg(test)]
pub(crate) mod testing;

pub use anyhow::Result;
pub use app::GeoApp;
pub use database::{DatabaseHandle, GeoReader, LookupError};
pub use matcher::{country::CountryMatcher, region::RegionMatcher, MatchOutcome, Matcher};
