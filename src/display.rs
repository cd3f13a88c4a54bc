/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum::Display;
use tokio::fs::{read_dir, read_to_string, try_exists};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::daemon::config::{DeviceConfig, DisplayConfig};
use crate::process::run_script;
use crate::{path, retry};

const ACTIVE_VT_PATH: &str = "/sys/class/tty/tty0/active";
const DRM_CLASS_PATH: &str = "/sys/class/drm";

/// The wake technique that last brought the display back.
#[derive(Display, Deserialize, Serialize, PartialEq, Eq, Debug, Copy, Clone)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WakeMethod {
    PowerCall,
    VtBounce,
    Unnecessary,
}

/// Waits for the render node to show up, then gives the driver a moment to
/// finish initializing before anything opens it.
pub async fn wait_for_device(config: &DeviceConfig) -> Result<()> {
    let node = path(&config.render_node);
    let node = node.as_path();
    let found = retry(config.attempts, config.interval(), || async move {
        try_exists(node).await.unwrap_or(false)
    })
    .await;
    if !found {
        bail!(
            "GPU device {} did not appear after {} checks",
            node.display(),
            config.attempts
        );
    }
    debug!("Found {}, settling", node.display());
    sleep(config.settle()).await;
    Ok(())
}

pub async fn active_vt() -> Result<u32> {
    let active = read_to_string(path(ACTIVE_VT_PATH)).await?;
    let active = active.trim();
    active
        .strip_prefix("tty")
        .and_then(|vt| vt.parse().ok())
        .ok_or(anyhow!("Unexpected active console {active:?}"))
}

pub async fn switch_vt(config: &DisplayConfig, vt: u32) -> Result<()> {
    run_script(&config.vt_switch, &[vt.to_string()]).await
}

pub async fn ensure_vt(config: &DisplayConfig, vt: u32) -> Result<()> {
    match active_vt().await {
        Ok(active) if active == vt => {
            debug!("Already on VT {vt}");
            return Ok(());
        }
        Ok(active) => info!("Switching from VT {active} to VT {vt}"),
        Err(e) => warn!("Could not determine active VT, switching anyway: {e}"),
    }
    switch_vt(config, vt).await
}

async fn connector_attribute(connector: &Path, name: &str) -> Option<String> {
    read_to_string(connector.join(name))
        .await
        .ok()
        .map(|value| value.trim().to_string())
}

/// Whether at least one display is connected and every connected display is
/// powered on.
pub async fn display_awake() -> Result<bool> {
    let mut dir = read_dir(path(DRM_CLASS_PATH)).await?;
    let mut connected = 0;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        // Connectors look like card0-HDMI-A-1; plain cards and render nodes are skipped
        if !name.starts_with("card") || !name.contains('-') {
            continue;
        }
        let connector = entry.path();
        if connector_attribute(&connector, "status").await.as_deref() != Some("connected") {
            continue;
        }
        connected += 1;
        if connector_attribute(&connector, "dpms").await.as_deref() != Some("On") {
            debug!("{name} is connected but not powered on");
            return Ok(false);
        }
    }
    Ok(connected > 0)
}

async fn awake_after(delay: std::time::Duration) -> bool {
    sleep(delay).await;
    display_awake().await.unwrap_or(false)
}

/// Display wake sequencing. Remembers which technique worked so a known
/// ineffective power call is skipped next time.
#[derive(Debug, Default)]
pub struct DisplayWaker {
    memory: Option<WakeMethod>,
}

impl DisplayWaker {
    pub fn new(memory: Option<WakeMethod>) -> DisplayWaker {
        DisplayWaker { memory }
    }

    pub fn memory(&self) -> Option<WakeMethod> {
        self.memory
    }

    async fn power_call(config: &DisplayConfig) -> Result<()> {
        let Some(power_on) = config.power_on.as_ref() else {
            bail!("No monitor power command configured");
        };
        run_script(&power_on.script, power_on.script_args.as_slice()).await
    }

    async fn vt_bounce(config: &DisplayConfig, vt: u32) -> Result<()> {
        switch_vt(config, config.bounce_vt).await?;
        sleep(config.bounce_delay()).await;
        switch_vt(config, vt).await
    }

    /// Wakes the display showing `vt`. Returns the technique that left the
    /// display awake.
    pub async fn wake(&mut self, config: &DisplayConfig, vt: u32) -> Result<WakeMethod> {
        if display_awake().await.unwrap_or(false) {
            debug!("Display already awake");
            // An awake display says nothing about which technique works
            self.memory.get_or_insert(WakeMethod::Unnecessary);
            return Ok(WakeMethod::Unnecessary);
        }

        if self.memory == Some(WakeMethod::VtBounce) {
            debug!("Skipping monitor power call, it did not help last time");
        } else {
            match DisplayWaker::power_call(config).await {
                Ok(()) => {
                    if awake_after(config.wake_check()).await {
                        info!("Display woken by monitor power call");
                        self.memory = Some(WakeMethod::PowerCall);
                        return Ok(WakeMethod::PowerCall);
                    }
                    debug!("Monitor power call did not wake the display");
                }
                Err(e) => debug!("Monitor power call failed: {e}"),
            }
        }

        DisplayWaker::vt_bounce(config, vt).await?;
        if awake_after(config.wake_check()).await {
            info!("Display woken by VT bounce");
            self.memory = Some(WakeMethod::VtBounce);
            return Ok(WakeMethod::VtBounce);
        }
        self.memory = None;
        bail!("Display still asleep after VT bounce")
    }
}
