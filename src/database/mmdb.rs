use super::GeoReader;
use crate::Result;
use anyhow::Context;
use maxminddb::{geoip2, Mmap, Reader};
use std::{collections::BTreeMap, net::IpAddr, path::Path};

/// Locales tried, in order, when rendering place names.
const LOCALES: [&str; 2] = ["zh-CN", "en"];

/// Placeholder for fields the database has no value for.
const UNKNOWN: &str = "0";

fn open_mmap(path: &Path) -> Result<Reader<Mmap>> {
    Reader::open_mmap(path)
        .with_context(|| format!("Failed to load GeoIP database from {}", path.display()))
}

/// Country-level reader over a MaxMind country (or city) database.
///
/// Records are ISO 3166-1 alpha-2 codes.
pub struct CountryReader {
    reader: Reader<Mmap>,
}

impl GeoReader for CountryReader {
    type Record = String;

    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: open_mmap(path)?,
        })
    }

    fn lookup(&self, ip: IpAddr) -> Result<Option<String>> {
        let country: Option<geoip2::Country> = self.reader.lookup(ip)?;

        Ok(country
            .and_then(|c| c.country)
            .and_then(|c| c.iso_code)
            .map(str::to_owned))
    }
}

/// Region-level reader over a MaxMind city database.
///
/// Records use the pipe-delimited layout `country|0|province|city|0` with
/// localized names, the layout the region policy parses.
pub struct CityReader {
    reader: Reader<Mmap>,
}

fn localized<'a>(names: Option<&BTreeMap<&'a str, &'a str>>) -> Option<&'a str> {
    let names = names?;
    LOCALES
        .iter()
        .find_map(|locale| names.get(locale).copied())
}

impl GeoReader for CityReader {
    type Record = String;

    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: open_mmap(path)?,
        })
    }

    fn lookup(&self, ip: IpAddr) -> Result<Option<String>> {
        let Some(city) = self.reader.lookup::<geoip2::City>(ip)? else {
            return Ok(None);
        };

        let country = city
            .country
            .as_ref()
            .and_then(|c| localized(c.names.as_ref()))
            .unwrap_or(UNKNOWN);
        let province = city
            .subdivisions
            .as_ref()
            .and_then(|s| s.first())
            .and_then(|s| localized(s.names.as_ref()))
            .unwrap_or(UNKNOWN);
        let name = city
            .city
            .as_ref()
            .and_then(|c| localized(c.names.as_ref()))
            .unwrap_or(UNKNOWN);

        Ok(Some(format!(
            "{country}|{UNKNOWN}|{province}|{name}|{UNKNOWN}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localized_prefers_chinese_names() {
        let names = BTreeMap::from([("en", "China"), ("zh-CN", "中国")]);
        assert_eq!(localized(Some(&names)), Some("中国"));

        let names = BTreeMap::from([("en", "Beijing"), ("fr", "Pékin")]);
        assert_eq!(localized(Some(&names)), Some("Beijing"));

        let names = BTreeMap::from([("fr", "Pékin")]);
        assert_eq!(localized(Some(&names)), None);
        assert_eq!(localized(None), None);
    }

    #[test]
    fn open_rejects_non_database_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Country.mmdb");
        std::fs::write(&path, b"definitely not a maxmind database").unwrap();

        let err = CountryReader::open(&path).err().unwrap();
        assert!(format!("{err:#}").contains("Failed to load GeoIP database"));
        assert!(CityReader::open(&dir.path().join("missing.mmdb")).is_err());
    }
}
