/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, bail, Result};
use inotify::{EventStream, Inotify, WatchMask};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::ffi::OsString;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{create_dir_all, set_permissions, OpenOptions as AsyncOpenOptions};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::{debug, info};

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Wake {
    Trigger,
    Timeout,
}

/// The request mailbox: a single world-writable file whose contents are
/// the pending request.
pub struct TriggerChannel {
    inotify: EventStream<[u8; 512]>,
    path: PathBuf,
    file_name: OsString,
}

impl TriggerChannel {
    /// Creates the trigger file if needed and starts watching it. The parent
    /// directory is watched so that clients replacing the file are noticed.
    pub async fn open(path: PathBuf) -> Result<TriggerChannel> {
        let dir = path
            .parent()
            .ok_or(anyhow!("Trigger path {} has no parent dir", path.display()))?
            .to_path_buf();
        let file_name = path
            .file_name()
            .ok_or(anyhow!("Trigger path {} has no file name", path.display()))?
            .to_os_string();

        create_dir_all(&dir).await?;
        AsyncOpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        // umask would otherwise strip the group and world write bits
        set_permissions(&path, Permissions::from_mode(0o666)).await?;

        let inotify = Inotify::init()?.into_event_stream([0; 512])?;
        inotify.watches().add(
            &dir,
            WatchMask::MODIFY | WatchMask::CREATE | WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO,
        )?;
        debug!("Watching {} for requests", path.display());

        Ok(TriggerChannel {
            inotify,
            path,
            file_name,
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Blocks until the trigger file changes or `interval` passes without
    /// any change.
    pub async fn wait(&mut self, interval: Duration) -> Result<Wake> {
        loop {
            let event = match timeout(interval, self.inotify.next()).await {
                Err(_) => return Ok(Wake::Timeout),
                Ok(Some(Ok(event))) => event,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => bail!("inotify event stream closed"),
            };
            if event.name.as_deref() == Some(self.file_name.as_os_str()) {
                debug!("Got trigger event: {:08x}", event.mask);
                return Ok(Wake::Trigger);
            }
        }
    }

    /// Reads the pending request and clears it. Must only be called with the
    /// switch lock held.
    pub async fn take(&self) -> Result<String> {
        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };
        // Clients write under the same lock, so nothing lands between the
        // read and the clear
        let mut file = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| e)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        // The clear queues one more trigger wake of our own, which then finds
        // the file empty and does nothing. Empty contents are not rewritten so
        // that this does not repeat.
        if !contents.is_empty() {
            file.set_len(0)?;
            file.sync_data()?;
        }
        Ok(contents)
    }
}

/// Replaces the pending request with `token`, holding the trigger lock so a
/// concurrent [`TriggerChannel::take`] sees either the old or the new request.
pub fn write_request(path: &Path, token: &str) -> Result<()> {
    // No create: a missing trigger means the daemon is not running
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| anyhow!("Could not open {}: {e}", path.display()))?;
    let mut file = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| e)?;
    file.set_len(0)?;
    file.write_all(format!("{token}\n").as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Advisory lock held for the duration of one switch. Released on drop.
#[derive(Debug)]
pub struct SwitchLock {
    _lock: Flock<File>,
}

impl SwitchLock {
    /// Returns `None` if another holder already has the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<SwitchLock>> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(SwitchLock { _lock: lock })),
            Err((_, Errno::EWOULDBLOCK)) => {
                info!("Switch lock {} is held elsewhere", path.display());
                Ok(None)
            }
            Err((_, e)) => Err(e.into()),
        }
    }
}
