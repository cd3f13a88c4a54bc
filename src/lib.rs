/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use config::builder::AsyncState;
use config::{ConfigBuilder, FileFormat};
use std::ffi::OsStr;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{read_dir, File};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod client;
pub mod daemon;
pub mod display;
pub mod process;
pub mod session;
pub mod switch;
pub mod systemd;
pub mod trigger;

#[cfg(test)]
mod testing;

pub trait Service
where
    Self: Sized + Send,
{
    const NAME: &'static str;

    fn run(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    fn start(mut self, token: CancellationToken) -> impl Future<Output = Result<()>> + Send {
        async move {
            info!("Starting {}", Self::NAME);
            let res = tokio::select! {
                r = self.run() => r,
                () = token.cancelled() => Ok(()),
            };
            if let Err(e) = &res {
                warn!("{} encountered an error: {e}", Self::NAME);
                token.cancel();
            }
            info!("Shutting down {}", Self::NAME);
            self.shutdown().await.and(res)
        }
    }
}

#[cfg(not(test))]
pub fn path<P: AsRef<Path>>(path: P) -> PathBuf {
    path.as_ref().to_path_buf()
}

#[cfg(test)]
pub fn path<P: AsRef<Path>>(path: P) -> PathBuf {
    let current_test = crate::testing::current();
    let path = path.as_ref();
    current_test
        .path()
        .join(path.strip_prefix("/").unwrap_or(path))
}

pub async fn write_synced<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path.as_ref()).await?;
    file.write_all(bytes).await?;
    Ok(file.sync_data().await?)
}

pub async fn read_config_directory<P: AsRef<Path> + Sync + Send>(
    builder: ConfigBuilder<AsyncState>,
    path: P,
    extensions: &[&str],
    format: FileFormat,
) -> Result<ConfigBuilder<AsyncState>> {
    let mut dir = match read_dir(&path).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(builder),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let Some(ext) = path.extension() else {
            continue;
        };
        if extensions.iter().any(|e| OsStr::new(e) == ext) {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries.into_iter().fold(builder, |builder, path| {
        builder.add_source(::config::File::from(path.as_path()).format(format))
    }))
}

/// Polls `predicate` up to `attempts` times, sleeping `interval` between
/// failed polls. Returns whether the predicate ever held.
pub async fn retry<F, Fut>(attempts: u32, interval: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=attempts {
        if predicate().await {
            return true;
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    false
}
