/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, Result};
use std::future::Future;
use std::path::PathBuf;
use tracing::debug;
use zbus::zvariant::OwnedObjectPath;
use zbus::{proxy::CacheProperties, Connection};

use crate::daemon::config::UnitsConfig;
use crate::session::Session;

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Unit",
    default_service = "org.freedesktop.systemd1"
)]
trait SystemdUnit {
    #[zbus(property)]
    fn active_state(&self) -> Result<String>;

    async fn start(&self, mode: &str) -> Result<OwnedObjectPath>;
    async fn stop(&self, mode: &str) -> Result<OwnedObjectPath>;
    async fn reset_failed(&self) -> Result<()>;
}

pub struct SystemdUnit<'dbus> {
    proxy: SystemdUnitProxy<'dbus>,
    name: String,
}

impl<'dbus> SystemdUnit<'dbus> {
    pub async fn new(connection: Connection, name: &str) -> Result<SystemdUnit<'dbus>> {
        let path = PathBuf::from("/org/freedesktop/systemd1/unit").join(escape(name));
        let path = String::from(path.to_str().ok_or(anyhow!("Unit name {name} invalid"))?);
        Ok(SystemdUnit {
            proxy: SystemdUnitProxy::builder(&connection)
                .cache_properties(CacheProperties::No)
                .path(path)?
                .build()
                .await?,
            name: String::from(name),
        })
    }

    pub async fn start(&self) -> Result<()> {
        debug!("Starting {}", self.name);
        self.proxy.start("replace").await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        debug!("Stopping {}", self.name);
        self.proxy.stop("replace").await?;
        Ok(())
    }

    pub async fn reset_failed(&self) -> Result<()> {
        debug!("Resetting failed state of {}", self.name);
        self.proxy.reset_failed().await?;
        Ok(())
    }

    pub async fn active_state(&self) -> Result<String> {
        Ok(self.proxy.active_state().await?)
    }

    pub async fn active(&self) -> Result<bool> {
        Ok(self.active_state().await? == "active")
    }
}

pub fn escape(name: &str) -> String {
    let mut parts = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            parts.push(c);
        } else {
            let escaped = format!("_{:02x}", u32::from(c));
            parts.push_str(escaped.as_str());
        }
    }
    parts
}

/// The service manager operations the switcher needs, keyed by session.
pub trait SessionServices: Send + Sync {
    fn start(&self, session: Session) -> impl Future<Output = Result<()>> + Send;

    fn stop(&self, session: Session) -> impl Future<Output = Result<()>> + Send;

    fn is_active(&self, session: Session) -> impl Future<Output = Result<bool>> + Send;

    fn reset_failed(&self, session: Session) -> impl Future<Output = Result<()>> + Send;
}

/// The Kodi unit and the display manager unit, driven over the system bus.
pub struct SystemdSessions {
    kodi: SystemdUnit<'static>,
    display_manager: SystemdUnit<'static>,
}

impl SystemdSessions {
    pub async fn new(connection: &Connection, units: &UnitsConfig) -> Result<SystemdSessions> {
        Ok(SystemdSessions {
            kodi: SystemdUnit::new(connection.clone(), units.unit(Session::Kodi)).await?,
            display_manager: SystemdUnit::new(connection.clone(), units.unit(Session::Gamemode))
                .await?,
        })
    }

    fn unit(&self, session: Session) -> &SystemdUnit<'static> {
        match session {
            Session::Kodi => &self.kodi,
            Session::Gamemode => &self.display_manager,
        }
    }
}

impl SessionServices for SystemdSessions {
    async fn start(&self, session: Session) -> Result<()> {
        self.unit(session).start().await
    }

    async fn stop(&self, session: Session) -> Result<()> {
        self.unit(session).stop().await
    }

    async fn is_active(&self, session: Session) -> Result<bool> {
        self.unit(session).active().await
    }

    async fn reset_failed(&self, session: Session) -> Result<()> {
        self.unit(session).reset_failed().await
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::testing;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_escape() {
        assert_eq!(escape("systemd"), "systemd");
        assert_eq!(escape("system d"), "system_20d");
        assert_eq!(escape("kodi-gbm.service"), "kodi_2dgbm_2eservice");
    }

    #[derive(PartialEq, Eq, Debug, Copy, Clone)]
    pub(crate) enum Call {
        Start(Session),
        Stop(Session),
        IsActive(Session),
        ResetFailed(Session),
    }

    #[derive(Default)]
    struct MockState {
        calls: Vec<Call>,
        active: HashSet<Session>,
        failing_starts: HashMap<Session, u32>,
        failing_stops: HashSet<Session>,
        silent_starts: HashSet<Session>,
        next_pid: u32,
    }

    /// In-memory service manager. Starting Kodi also populates the fake
    /// /proc with a Kodi process, as the real unit would.
    #[derive(Clone, Default)]
    pub(crate) struct MockServices {
        state: Arc<Mutex<MockState>>,
    }

    impl MockServices {
        pub(crate) fn set_active(&self, session: Session, active: bool) {
            let mut state = self.state.lock().unwrap();
            if active {
                state.active.insert(session);
            } else {
                state.active.remove(&session);
            }
        }

        /// The next `count` start calls for `session` fail.
        pub(crate) fn fail_starts(&self, session: Session, count: u32) {
            self.state
                .lock()
                .unwrap()
                .failing_starts
                .insert(session, count);
        }

        pub(crate) fn fail_stops(&self, session: Session) {
            self.state.lock().unwrap().failing_stops.insert(session);
        }

        /// Start calls for `session` succeed but nothing ever comes up.
        pub(crate) fn silent_starts(&self, session: Session) {
            self.state.lock().unwrap().silent_starts.insert(session);
        }

        /// Every call except active state queries, in order.
        pub(crate) fn actions(&self) -> Vec<Call> {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .copied()
                .filter(|call| !matches!(call, Call::IsActive(_)))
                .collect()
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.state.lock().unwrap().calls.clone()
        }

        pub(crate) fn count(&self, call: Call) -> usize {
            self.calls().into_iter().filter(|c| *c == call).count()
        }
    }

    impl SessionServices for MockServices {
        async fn start(&self, session: Session) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Start(session));
            if let Some(remaining) = state.failing_starts.get_mut(&session) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(anyhow!("Job for {session} failed"));
                }
            }
            if state.silent_starts.contains(&session) {
                return Ok(());
            }
            state.active.insert(session);
            if session == Session::Kodi {
                state.next_pid += 1;
                let pid = 500_000 + state.next_pid;
                testing::current().spawn_unit_process(
                    pid,
                    "/usr/lib/kodi/kodi.bin",
                    "kodi.bin",
                    "kodi-gbm.service",
                );
            }
            Ok(())
        }

        async fn stop(&self, session: Session) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Stop(session));
            if state.failing_stops.contains(&session) {
                return Err(anyhow!("Failed to stop {session}"));
            }
            state.active.remove(&session);
            Ok(())
        }

        async fn is_active(&self, session: Session) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::IsActive(session));
            Ok(state.active.contains(&session))
        }

        async fn reset_failed(&self, session: Session) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::ResetFailed(session));
            Ok(())
        }
    }

    #[tokio::test]
    async fn mock_start_spawns_kodi() {
        let h = testing::start();
        let services = MockServices::default();
        services.start(Session::Kodi).await.expect("start");
        assert!(services.is_active(Session::Kodi).await.unwrap());
        assert!(h.test.path().join("proc/500001/comm").exists());
        assert!(h.test.path().join("proc/500001/cgroup").exists());

        services.fail_starts(Session::Gamemode, 1);
        assert!(services.start(Session::Gamemode).await.is_err());
        assert!(services.start(Session::Gamemode).await.is_ok());
        assert_eq!(
            services.actions(),
            [
                Call::Start(Session::Kodi),
                Call::Start(Session::Gamemode),
                Call::Start(Session::Gamemode)
            ]
        );
    }
}
