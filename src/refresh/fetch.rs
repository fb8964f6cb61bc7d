use crate::Result;
use anyhow::{ensure, Context};
use reqwest::{header::LAST_MODIFIED, Client, Url};
use std::{
    path::Path,
    time::{Duration, SystemTime},
};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::debug;

use super::DEFAULT_INTERVAL;

pub fn client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(0)
        .build()?)
}

/// Decides whether a local copy is stale.
///
/// A missing local file is always stale. When the remote reports a
/// modification time the copy is stale iff the remote is strictly newer;
/// otherwise it is stale once it is at least `interval` old.
pub fn decide(
    local_modified: Option<SystemTime>,
    remote_modified: Option<SystemTime>,
    interval: Duration,
    now: SystemTime,
) -> bool {
    let Some(local_modified) = local_modified else {
        return true;
    };

    if let Some(remote_modified) = remote_modified {
        return remote_modified > local_modified;
    }

    let interval = if interval.is_zero() {
        DEFAULT_INTERVAL
    } else {
        interval
    };

    now.duration_since(local_modified)
        .map(|age| age >= interval)
        .unwrap_or(false)
}

pub fn parse_http_date(value: &str) -> Result<SystemTime> {
    let date = chrono::DateTime::parse_from_rfc2822(value.trim())
        .with_context(|| format!("Invalid Last-Modified header {value:?}"))?;
    Ok(date.into())
}

/// Probes `url` with a HEAD request and compares it with `local`.
pub async fn needs_update(
    client: &Client,
    url: &Url,
    local: &Path,
    interval: Duration,
) -> Result<bool> {
    let local_modified = match tokio::fs::metadata(local).await {
        Ok(metadata) => metadata.modified()?,
        Err(_) => return Ok(true),
    };

    let response = client
        .head(url.clone())
        .send()
        .await
        .with_context(|| format!("HEAD {url} failed"))?;
    ensure!(
        response.status().is_success(),
        "HEAD {} returned {}",
        url,
        response.status()
    );

    let remote_modified = response
        .headers()
        .get(LAST_MODIFIED)
        .map(|value| {
            value
                .to_str()
                .context("Last-Modified is not valid text")
                .and_then(parse_http_date)
        })
        .transpose()?;

    debug!(
        %url,
        remote_modified = ?remote_modified,
        local_modified = ?local_modified,
        "Probed remote database"
    );

    Ok(decide(
        Some(local_modified),
        remote_modified,
        interval,
        SystemTime::now(),
    ))
}

/// Downloads `url` into `to`, returning the number of bytes written.
///
/// `to` is left behind on failure; the caller owns its cleanup.
pub async fn download(client: &Client, url: &Url, to: &Path) -> Result<u64> {
    let mut response = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("Failed to download {url}"))?;
    ensure!(
        response.status().is_success(),
        "Unexpected status {} for {}",
        response.status(),
        url
    );

    let mut file = File::create(to)
        .await
        .with_context(|| format!("Failed to create {}", to.display()))?;
    let mut written = 0;

    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.sync_all().await?;
    Ok(written)
}
