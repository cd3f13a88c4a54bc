/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, Result};
use nix::sys::signal::Signal;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
#[cfg(not(test))]
use tokio::process::Command;
use tokio::fs::{self, read_dir, read_link};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::path;

// The kernel truncates comm to TASK_COMM_LEN - 1 bytes
const COMM_LEN: usize = 15;

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub exe: Option<String>,
    pub comm: String,
}

impl ProcessInfo {
    /// Exact identity match on either the executable's file name or the
    /// process name. Never a substring match.
    pub fn matches(&self, names: &[String]) -> bool {
        names.iter().any(|name| {
            if self.exe.as_deref() == Some(name.as_str()) {
                return true;
            }
            // The cut may land inside a multibyte character, which reads back
            // lossily the same way comm itself does
            let bytes = name.as_bytes();
            let truncated = String::from_utf8_lossy(&bytes[..bytes.len().min(COMM_LEN)]);
            self.comm == truncated
        })
    }
}

async fn process_info(proc_dir: &Path, pid: u32) -> Option<ProcessInfo> {
    // Kernel threads and processes that exited mid-scan have no comm
    let comm = fs::read(proc_dir.join("comm")).await.ok()?;
    let comm = String::from_utf8_lossy(comm.as_ref()).trim_end().to_string();
    let exe = read_link(proc_dir.join("exe")).await.ok().and_then(|exe| {
        exe.file_name()
            .map(|name| name.to_string_lossy().trim_end_matches(" (deleted)").to_string())
    });
    Some(ProcessInfo { pid, exe, comm })
}

pub async fn list_processes() -> Result<Vec<ProcessInfo>> {
    let own_pid = std::process::id();
    let mut processes = Vec::new();
    let mut dir = read_dir(path("/proc")).await?;
    while let Some(entry) = dir.next_entry().await? {
        let pid: u32 = match entry.file_name().to_str().map(str::parse) {
            Some(Ok(pid)) => pid,
            _ => continue,
        };
        if pid == own_pid {
            continue;
        }
        match process_info(entry.path().as_path(), pid).await {
            Some(info) => processes.push(info),
            None => debug!("Process {pid} disappeared while scanning"),
        }
    }
    Ok(processes)
}

pub async fn find_processes(names: &[String]) -> Result<Vec<ProcessInfo>> {
    Ok(list_processes()
        .await?
        .into_iter()
        .filter(|process| process.matches(names))
        .collect())
}

/// Whether `pid` runs inside the cgroup of systemd unit `unit`.
pub async fn in_unit(pid: u32, unit: &str) -> bool {
    let Ok(cgroup) = fs::read_to_string(path(format!("/proc/{pid}/cgroup"))).await else {
        return false;
    };
    // Lines are hierarchy-ID:controllers:path; the unit is a path component
    cgroup.lines().any(|line| {
        line.rsplit(':')
            .next()
            .is_some_and(|cgroup| cgroup.split('/').any(|part| part == unit))
    })
}

/// Matching processes that belong to `unit`, so that strays started by
/// anything else are not mistaken for the unit's own.
pub async fn find_unit_processes(names: &[String], unit: &str) -> Result<Vec<ProcessInfo>> {
    let mut found = Vec::new();
    for process in find_processes(names).await? {
        if in_unit(process.pid, unit).await {
            found.push(process);
        } else {
            debug!("{} ({}) is not part of {unit}", process.pid, process.comm);
        }
    }
    Ok(found)
}

#[cfg(not(test))]
fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid: libc::pid_t = pid.try_into()?;
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let test = crate::testing::current();
    test.signals.borrow_mut().push((pid, signal));
    if signal == Signal::SIGKILL || !test.stubborn.borrow().contains(&pid) {
        let _ = std::fs::remove_dir_all(path(format!("/proc/{pid}")));
    }
    Ok(())
}

fn signal_all(processes: &[ProcessInfo], signal: Signal) {
    for process in processes {
        debug!("Sending {signal} to {} ({})", process.pid, process.comm);
        if let Err(e) = send_signal(process.pid, signal) {
            warn!("Failed to send {signal} to {}: {e}", process.pid);
        }
    }
}

/// Asks every matching process to exit, then kills whatever is still around
/// once the grace period is over.
pub async fn terminate(names: &[String], grace_period: Duration) -> Result<()> {
    let processes = find_processes(names).await?;
    if processes.is_empty() {
        debug!("No processes matching {names:?}");
        return Ok(());
    }
    info!("Terminating {} leftover processes", processes.len());
    signal_all(&processes, Signal::SIGTERM);

    sleep(grace_period).await;

    let survivors = find_processes(names).await?;
    if !survivors.is_empty() {
        warn!(
            "{} processes ignored SIGTERM, killing them",
            survivors.len()
        );
        signal_all(&survivors, Signal::SIGKILL);
    }
    Ok(())
}

pub async fn kill(names: &[String]) -> Result<()> {
    let processes = find_processes(names).await?;
    if !processes.is_empty() {
        info!("Killing {} processes", processes.len());
        signal_all(&processes, Signal::SIGKILL);
    }
    Ok(())
}

#[cfg(not(test))]
pub async fn script_exit_code(
    executable: impl AsRef<OsStr>,
    args: &[impl AsRef<OsStr>],
) -> Result<i32> {
    // Run given script and return the exit code
    let mut child = Command::new(executable).args(args).spawn()?;
    let status = child.wait().await?;
    status.code().ok_or(anyhow!("Killed by signal"))
}

#[cfg(test)]
pub async fn script_exit_code(
    executable: impl AsRef<OsStr>,
    args: &[impl AsRef<OsStr>],
) -> Result<i32> {
    let test = crate::testing::current();
    let executable = executable.as_ref().to_string_lossy();
    let args: Vec<&OsStr> = args.iter().map(|arg| arg.as_ref()).collect();
    let cb = test.process_cb.get();
    cb(executable.as_ref(), args.as_ref()).map(|(res, _)| res)
}

pub async fn run_script(executable: impl AsRef<OsStr>, args: &[impl AsRef<OsStr>]) -> Result<()> {
    // Run given script to get exit code and return true on success.
    // Return Err on failure, but also print an error if needed
    match script_exit_code(executable, args).await {
        Ok(0) => Ok(()),
        Ok(code) => Err(anyhow!("Exited {code}")),
        Err(message) => Err(message),
    }
}
