use crate::Result;
use anyhow::{anyhow, ensure};
use serde::Deserialize;
use std::{fmt::Display, str::FromStr};

/// Country value marking a record as domestic, i.e. subject to keyword
/// matching.
pub const DEFAULT_DOMESTIC: &str = "中国";

const FIELD_SEPARATOR: char = '|';

/// Databases write `0` for fields they have no value for.
const UNKNOWN_FIELD: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Keywords list the permitted places.
    #[default]
    Allow,
    /// Keywords list the excluded places.
    Deny,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Mode::Allow),
            "deny" => Ok(Mode::Deny),
            other => Err(anyhow!("mode must be 'allow' or 'deny', got '{}'", other)),
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Allow => write!(f, "allow"),
            Mode::Deny => write!(f, "deny"),
        }
    }
}

/// One parsed `country|region|province|city|isp` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRecord<'a> {
    pub country: &'a str,
    pub region: &'a str,
    pub province: &'a str,
    pub city: &'a str,
    pub isp: Option<&'a str>,
    pub raw: &'a str,
}

impl<'a> LocationRecord<'a> {
    /// Returns `None` when fewer than four fields are present.
    pub fn parse(raw: &'a str) -> Option<Self> {
        let mut fields = raw.split(FIELD_SEPARATOR).map(str::trim);

        Some(Self {
            country: fields.next()?,
            region: fields.next()?,
            province: fields.next()?,
            city: fields.next()?,
            isp: fields.next(),
            raw,
        })
    }
}

// Either side may be the abbreviated form ("北京" vs "北京市").
fn overlaps(field: &str, keyword: &str) -> bool {
    if field.is_empty() || field == UNKNOWN_FIELD {
        return false;
    }

    field.contains(keyword) || keyword.contains(field)
}

/// Decides whether a region record matches the configured keyword set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPolicy {
    mode: Mode,
    keywords: Vec<String>,
    domestic: String,
}

impl RegionPolicy {
    pub fn new(mode: Mode, keywords: Vec<String>) -> Result<Self> {
        let keywords = keywords
            .into_iter()
            .map(|k| k.trim().to_owned())
            .collect::<Vec<_>>();
        ensure!(
            keywords.iter().all(|k| !k.is_empty()),
            "region keywords must not be empty"
        );

        Ok(Self {
            mode,
            keywords,
            domestic: DEFAULT_DOMESTIC.to_owned(),
        })
    }

    pub fn with_domestic(mut self, domestic: impl Into<String>) -> Self {
        self.domestic = domestic.into();
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Non-domestic and unparsable records never match, whatever the mode.
    pub fn matches(&self, raw: &str) -> bool {
        let Some(record) = LocationRecord::parse(raw) else {
            return false;
        };

        if record.country != self.domestic {
            return false;
        }

        if self.keywords.is_empty() {
            return true;
        }

        match self.mode {
            Mode::Allow => self.listed(&record),
            Mode::Deny => !self.listed(&record),
        }
    }

    fn listed(&self, record: &LocationRecord<'_>) -> bool {
        self.keywords.iter().any(|keyword| {
            overlaps(record.province, keyword)
                || overlaps(record.city, keyword)
                || record.raw.contains(keyword.as_str())
        })
    }
}
