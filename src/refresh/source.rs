use crate::Result;
use anyhow::{bail, Context};
use reqwest::Url;
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Where a database comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Downloaded over HTTP(S) into the data directory and refreshed.
    Remote(Url),
    /// Used in place and never downloaded.
    Local(PathBuf),
}

impl Source {
    pub fn is_remote(&self) -> bool {
        matches!(self, Source::Remote(_))
    }

    /// File name to store a download of stream `stream` under: the last URL
    /// path segment prefixed with the stream, or the bare stream name if the
    /// URL has none. Local sources keep their own name.
    pub fn file_name(&self, stream: &str) -> String {
        match self {
            Source::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .map_or_else(|| stream.to_owned(), |name| format!("{stream}-{name}")),
            Source::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| stream.to_owned()),
        }
    }

    /// The live database file: local sources are used in place, remote ones
    /// are stored under `data_dir`.
    pub fn local_path(&self, data_dir: &Path, stream: &str) -> PathBuf {
        match self {
            Source::Local(path) => path.clone(),
            Source::Remote(_) => data_dir.join(self.file_name(stream)),
        }
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            bail!("database source must not be empty");
        }

        if value.starts_with("http://") || value.starts_with("https://") {
            let url = Url::parse(value).with_context(|| format!("Invalid source URL {value}"))?;
            return Ok(Source::Remote(url));
        }

        Ok(Source::Local(PathBuf::from(value)))
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Remote(url) => write!(f, "{}", url),
            Source::Local(path) => write!(f, "{}", path.display()),
        }
    }
}
