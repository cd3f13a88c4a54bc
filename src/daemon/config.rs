/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use ::config::builder::AsyncState;
use ::config::{ConfigBuilder, FileFormat};
use anyhow::{anyhow, ensure, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{create_dir_all, read_to_string};
use tracing::{error, info};

use crate::display::WakeMethod;
use crate::session::Session;
use crate::{path, read_config_directory, write_synced};

const SYSTEM_CONFIG_PATH: &str = "/usr/share/session-switcher/config.d";
const USER_CONFIG_PATH: &str = "/etc/session-switcher/config.d";

#[derive(Clone, Default, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub units: UnitsConfig,
    pub processes: ProcessesConfig,
    pub device: DeviceConfig,
    pub display: DisplayConfig,
    pub switch: SwitchConfig,
    pub autologin: Option<AutologinConfig>,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct PathsConfig {
    pub trigger: PathBuf,
    pub lock: PathBuf,
    pub state: PathBuf,
    pub daemon_state: PathBuf,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct UnitsConfig {
    pub kodi: String,
    pub display_manager: String,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct ProcessesConfig {
    pub kodi: Vec<String>,
    pub kodi_verify: Vec<String>,
    pub gaming: Vec<String>,
    pub grace_period_ms: u64,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct DeviceConfig {
    pub render_node: PathBuf,
    pub attempts: u32,
    pub interval_ms: u64,
    pub settle_ms: u64,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct DisplayConfig {
    pub kodi_vt: u32,
    pub bounce_vt: u32,
    pub vt_switch: PathBuf,
    pub bounce_delay_ms: u64,
    pub power_on: Option<ScriptConfig>,
    pub wake_check_ms: u64,
}

#[derive(Clone, Default, Deserialize, Debug)]
pub struct ScriptConfig {
    pub script: PathBuf,
    #[serde(default)]
    pub script_args: Vec<String>,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct SwitchConfig {
    pub start_attempts: u32,
    pub start_backoff_ms: u64,
    pub verify_attempts: u32,
    pub verify_interval_ms: u64,
    pub stop_wait_attempts: u32,
    pub health_interval_secs: u64,
}

/// Display manager autologin drop-in, so that a reboot comes back up in
/// whichever session was last switched to.
#[derive(Clone, Deserialize, Debug)]
pub struct AutologinConfig {
    pub path: PathBuf,
    pub user: String,
    pub kodi_session: String,
    pub gaming_session: String,
}

impl Default for PathsConfig {
    fn default() -> PathsConfig {
        PathsConfig {
            trigger: PathBuf::from("/run/session-switch/request"),
            lock: PathBuf::from("/run/session-switch/lock"),
            state: PathBuf::from("/var/lib/session-switch/state"),
            daemon_state: PathBuf::from("/var/lib/session-switch/daemon.toml"),
        }
    }
}

impl Default for UnitsConfig {
    fn default() -> UnitsConfig {
        UnitsConfig {
            kodi: String::from("kodi-gbm.service"),
            display_manager: String::from("sddm.service"),
        }
    }
}

impl Default for ProcessesConfig {
    fn default() -> ProcessesConfig {
        ProcessesConfig {
            kodi: ["kodi", "kodi.bin", "kodi-gbm", "kodi-standalone"]
                .map(String::from)
                .to_vec(),
            kodi_verify: ["kodi.bin", "kodi-gbm"].map(String::from).to_vec(),
            gaming: ["gamescope", "gamescope-wl", "steam", "steamwebhelper"]
                .map(String::from)
                .to_vec(),
            grace_period_ms: 500,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> DeviceConfig {
        DeviceConfig {
            render_node: PathBuf::from("/dev/dri/renderD128"),
            attempts: 50,
            interval_ms: 100,
            settle_ms: 1000,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> DisplayConfig {
        DisplayConfig {
            kodi_vt: 1,
            bounce_vt: 2,
            vt_switch: PathBuf::from("/usr/bin/chvt"),
            bounce_delay_ms: 500,
            power_on: Some(ScriptConfig {
                script: PathBuf::from("/usr/bin/ddcutil"),
                script_args: ["setvcp", "d6", "01"].map(String::from).to_vec(),
            }),
            wake_check_ms: 1000,
        }
    }
}

impl Default for SwitchConfig {
    fn default() -> SwitchConfig {
        SwitchConfig {
            start_attempts: 2,
            start_backoff_ms: 2000,
            verify_attempts: 20,
            verify_interval_ms: 500,
            stop_wait_attempts: 20,
            health_interval_secs: 30,
        }
    }
}

impl ProcessesConfig {
    pub fn names(&self, session: Session) -> &[String] {
        match session {
            Session::Kodi => &self.kodi,
            Session::Gamemode => &self.gaming,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl UnitsConfig {
    pub fn unit(&self, session: Session) -> &str {
        match session {
            Session::Kodi => &self.kodi,
            Session::Gamemode => &self.display_manager,
        }
    }
}

impl DeviceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl DisplayConfig {
    pub fn bounce_delay(&self) -> Duration {
        Duration::from_millis(self.bounce_delay_ms)
    }

    pub fn wake_check(&self) -> Duration {
        Duration::from_millis(self.wake_check_ms)
    }
}

impl SwitchConfig {
    pub fn start_backoff(&self) -> Duration {
        Duration::from_millis(self.start_backoff_ms)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

impl AutologinConfig {
    pub fn session(&self, session: Session) -> &str {
        match session {
            Session::Kodi => &self.kodi_session,
            Session::Gamemode => &self.gaming_session,
        }
    }
}

impl Config {
    /// Rejects values that would make every switch fail or spin the control
    /// loop.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.switch.health_interval_secs > 0,
            "switch.health_interval_secs must be positive"
        );
        ensure!(
            self.switch.start_attempts > 0,
            "switch.start_attempts must be positive"
        );
        ensure!(
            self.switch.verify_attempts > 0,
            "switch.verify_attempts must be positive"
        );
        ensure!(self.device.attempts > 0, "device.attempts must be positive");
        ensure!(
            !self.processes.kodi_verify.is_empty(),
            "processes.kodi_verify must name at least one process"
        );
        ensure!(
            !self.units.kodi.is_empty() && !self.units.display_manager.is_empty(),
            "units must not be empty"
        );
        Ok(())
    }
}

pub async fn read_config() -> Result<Config> {
    let mut builder = ConfigBuilder::<AsyncState>::default();
    for dir in [SYSTEM_CONFIG_PATH, USER_CONFIG_PATH] {
        builder = read_config_directory(builder, path(dir), &["toml"], FileFormat::Toml).await?;
    }
    let config: Config = builder.build().await?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Values the daemon learns at runtime and keeps across restarts.
#[derive(Copy, Clone, Default, Deserialize, Serialize, PartialEq, Debug)]
#[serde(default)]
pub struct DaemonState {
    pub wake_method: Option<WakeMethod>,
}

pub async fn read_state(state_path: &Path) -> Result<DaemonState> {
    let state = match read_to_string(state_path).await {
        Ok(state) => state,
        Err(e) => {
            if e.kind() == ErrorKind::NotFound {
                info!("No daemon state file found, using default state");
                return Ok(DaemonState::default());
            }
            error!("Error loading daemon state: {e}");
            return Err(e.into());
        }
    };
    Ok(toml::from_str(state.as_str())?)
}

pub async fn write_state(state_path: &Path, state: &DaemonState) -> Result<()> {
    create_dir_all(state_path.parent().ok_or(anyhow!(
        "State path {} has no parent dir",
        state_path.to_string_lossy()
    ))?)
    .await?;
    let state = toml::to_string_pretty(state)?;
    write_synced(state_path, state.as_bytes()).await
}
