/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, Result};
use tokio::fs::create_dir_all;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::daemon::config::{read_state, write_state, Config, DaemonState};
use crate::display::{ensure_vt, wait_for_device, DisplayWaker};
use crate::process::{find_unit_processes, kill, terminate};
use crate::session::{parse_request, read_session_state, write_session_state, Session, SessionState};
use crate::systemd::SessionServices;
use crate::trigger::{SwitchLock, TriggerChannel, Wake};
use crate::{path, retry, write_synced, Service};

/// Serializes switches between the Kodi session and the gaming session.
///
/// The in-memory `state` is the source of truth while the daemon runs; the
/// state file only mirrors it for observers and for the next start.
pub struct SessionSwitcher<S: SessionServices> {
    services: S,
    config: watch::Receiver<Config>,
    trigger: TriggerChannel,
    state: SessionState,
    waker: DisplayWaker,
}

impl<S: SessionServices> SessionSwitcher<S> {
    pub async fn init(services: S, config: watch::Receiver<Config>) -> Result<SessionSwitcher<S>> {
        let current = config.borrow().clone();
        let trigger = TriggerChannel::open(path(&current.paths.trigger)).await?;

        let daemon_state = match read_state(&path(&current.paths.daemon_state)).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring unreadable daemon state: {e}");
                DaemonState::default()
            }
        };

        let mut switcher = SessionSwitcher {
            services,
            config,
            trigger,
            state: SessionState::Unknown,
            waker: DisplayWaker::new(daemon_state.wake_method),
        };

        switcher.state = match read_session_state(&path(&current.paths.state)).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                let state = switcher.infer_state().await;
                info!("No previous session state, inferred {state}");
                switcher.set_state(&current, state).await;
                state
            }
            Err(e) => {
                warn!("Failed to read session state: {e}");
                switcher.infer_state().await
            }
        };
        info!("Starting in session state {}", switcher.state);
        Ok(switcher)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn infer_state(&self) -> SessionState {
        if self.confirmed_active(Session::Kodi).await {
            SessionState::Kodi
        } else if self.confirmed_active(Session::Gamemode).await {
            SessionState::Gamemode
        } else {
            SessionState::Unknown
        }
    }

    async fn confirmed_active(&self, session: Session) -> bool {
        match self.services.is_active(session).await {
            Ok(active) => active,
            Err(e) => {
                warn!("Could not query {session} service: {e}");
                false
            }
        }
    }

    async fn confirmed_inactive(&self, session: Session) -> bool {
        match self.services.is_active(session).await {
            Ok(active) => !active,
            Err(e) => {
                warn!("Could not query {session} service: {e}");
                false
            }
        }
    }

    async fn set_state(&mut self, config: &Config, state: SessionState) {
        self.state = state;
        if let Err(e) = write_session_state(&path(&config.paths.state), state).await {
            error!("Failed to persist session state {state}: {e}");
        }
    }

    async fn persist_wake_memory(&self, config: &Config) {
        let state = DaemonState {
            wake_method: self.waker.memory(),
        };
        if let Err(e) = write_state(&path(&config.paths.daemon_state), &state).await {
            warn!("Failed to persist display wake memory: {e}");
        }
    }

    /// Drops a stale belief so that a later request is not mistaken for a
    /// no-op.
    pub async fn reconcile_health(&mut self, config: &Config) {
        let session = match self.state {
            SessionState::Kodi => Session::Kodi,
            SessionState::Gamemode => Session::Gamemode,
            SessionState::Unknown | SessionState::Failed => return,
        };
        if !self.confirmed_active(session).await {
            warn!("State says {session} but its service is not active, resetting");
            self.set_state(config, SessionState::Unknown).await;
        }
    }

    /// Handles one wake-up of the control loop, whether a request arrived or
    /// the health interval elapsed.
    pub async fn process_wake(&mut self) -> Result<()> {
        let config = self.config.borrow().clone();
        self.reconcile_health(&config).await;

        let Some(_lock) = SwitchLock::try_acquire(&path(&config.paths.lock))? else {
            info!("A switch is already in progress, dropping this wake-up");
            return Ok(());
        };

        let contents = self.trigger.take().await?;
        let session = match parse_request(contents.as_str()) {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!("{e}");
                return Ok(());
            }
        };
        info!("Received request to switch to {session}");
        match session {
            Session::Kodi => self.switch_to_kodi(&config).await,
            Session::Gamemode => self.switch_to_gamemode(&config).await,
        }
    }

    async fn already_in(&self, session: Session) -> bool {
        self.state == SessionState::from(session)
            && self.confirmed_inactive(session.other()).await
            && self.confirmed_active(session).await
    }

    async fn write_autologin(&self, config: &Config, session: Session) -> Result<()> {
        let Some(autologin) = config.autologin.as_ref() else {
            return Ok(());
        };
        let dropin = path(&autologin.path);
        if let Some(dir) = dropin.parent() {
            create_dir_all(dir).await?;
        }
        let contents = format!(
            "[Autologin]\nUser={}\nSession={}\nRelogin=false\n",
            autologin.user,
            autologin.session(session)
        );
        write_synced(dropin, contents.as_bytes()).await
    }

    async fn stop_session(&self, config: &Config, session: Session) -> Result<()> {
        self.services.stop(session).await?;
        let stopped = retry(
            config.switch.stop_wait_attempts,
            config.switch.verify_interval(),
            || self.confirmed_inactive(session),
        )
        .await;
        if !stopped {
            warn!("{session} service still active after stopping, continuing teardown");
        }
        Ok(())
    }

    /// Whether the target of a start actually came up.
    async fn verify_started(&self, config: &Config, session: Session) -> bool {
        let attempts = config.switch.verify_attempts;
        let interval = config.switch.verify_interval();
        match session {
            Session::Kodi => {
                let names = config.processes.kodi_verify.as_slice();
                let unit = config.units.unit(session);
                retry(attempts, interval, || async move {
                    self.confirmed_active(session).await
                        && find_unit_processes(names, unit)
                            .await
                            .is_ok_and(|processes| !processes.is_empty())
                })
                .await
            }
            // The display manager forks the session itself, so the unit state
            // is all there is to check
            Session::Gamemode => {
                retry(attempts, interval, || self.confirmed_active(session)).await
            }
        }
    }

    async fn start_attempt(&self, config: &Config, session: Session) -> bool {
        if let Err(e) = self.services.start(session).await {
            warn!("Failed to start {session} service: {e}");
            return false;
        }
        if !self.verify_started(config, session).await {
            warn!("{session} service did not come up");
            return false;
        }
        true
    }

    async fn start_with_retry(&self, config: &Config, session: Session) -> bool {
        let attempts = config.switch.start_attempts;
        for attempt in 1..=attempts {
            info!("Starting {session}, attempt {attempt} of {attempts}");
            if self.start_attempt(config, session).await {
                return true;
            }
            if attempt < attempts {
                sleep(config.switch.start_backoff()).await;
            }
        }
        false
    }

    /// Last resort after the regular attempts: clear the unit's failed state,
    /// get rid of anything half-started and try once more.
    async fn recover(&self, config: &Config, session: Session) -> bool {
        warn!("Regular attempts to start {session} exhausted, trying recovery");
        if let Err(e) = self.services.reset_failed(session).await {
            warn!("Failed to reset failed state of {session} service: {e}");
        }
        if let Err(e) = kill(config.processes.names(session)).await {
            warn!("Failed to kill lingering {session} processes: {e}");
        }
        self.start_attempt(config, session).await
    }

    async fn fail(&mut self, config: &Config, message: String) -> Result<()> {
        error!("{message}");
        self.set_state(config, SessionState::Failed).await;
        Err(anyhow!(message))
    }

    async fn wake_display(&mut self, config: &Config) {
        let before = self.waker.memory();
        match self.waker.wake(&config.display, config.display.kodi_vt).await {
            Ok(method) => debug!("Display awake ({method})"),
            Err(e) => warn!("Display wake failed: {e}"),
        }
        if self.waker.memory() != before {
            self.persist_wake_memory(config).await;
        }
    }

    pub async fn switch_to_kodi(&mut self, config: &Config) -> Result<()> {
        if self.already_in(Session::Kodi).await {
            info!("Already in Kodi, nothing to do");
            return Ok(());
        }

        if let Err(e) = self.write_autologin(config, Session::Kodi).await {
            warn!("Failed to write autologin configuration: {e}");
        }

        if let Err(e) = self.stop_session(config, Session::Gamemode).await {
            return self
                .fail(config, format!("Failed to stop gaming session: {e}"))
                .await;
        }

        if let Err(e) = terminate(
            config.processes.names(Session::Gamemode),
            config.processes.grace_period(),
        )
        .await
        {
            warn!("Failed to clean up gaming processes: {e}");
        }

        if let Err(e) = wait_for_device(&config.device).await {
            return self.fail(config, format!("GPU not ready: {e}")).await;
        }

        if let Err(e) = ensure_vt(&config.display, config.display.kodi_vt).await {
            warn!("Failed to switch to VT {}: {e}", config.display.kodi_vt);
        }

        self.wake_display(config).await;

        if !self.start_with_retry(config, Session::Kodi).await
            && !self.recover(config, Session::Kodi).await
        {
            return self
                .fail(config, String::from("Kodi failed to start, giving up"))
                .await;
        }

        self.set_state(config, SessionState::Kodi).await;
        info!("Switched to Kodi");
        // Some displays go back to sleep once the client takes over
        self.wake_display(config).await;
        Ok(())
    }

    pub async fn switch_to_gamemode(&mut self, config: &Config) -> Result<()> {
        if self.already_in(Session::Gamemode).await {
            info!("Already in game mode, nothing to do");
            return Ok(());
        }

        if let Err(e) = self.write_autologin(config, Session::Gamemode).await {
            warn!("Failed to write autologin configuration: {e}");
        }

        if let Err(e) = self.stop_session(config, Session::Kodi).await {
            warn!("Failed to stop Kodi, continuing teardown: {e}");
        }

        if let Err(e) = terminate(
            config.processes.names(Session::Kodi),
            config.processes.grace_period(),
        )
        .await
        {
            warn!("Failed to clean up Kodi processes: {e}");
        }

        if let Err(e) = wait_for_device(&config.device).await {
            return self.fail(config, format!("GPU not ready: {e}")).await;
        }

        if !self.start_with_retry(config, Session::Gamemode).await
            && !self.recover(config, Session::Gamemode).await
        {
            return self
                .fail(config, String::from("Game mode failed to start, giving up"))
                .await;
        }

        self.set_state(config, SessionState::Gamemode).await;
        info!("Switched to game mode");
        Ok(())
    }
}

impl<S: SessionServices + 'static> SessionSwitcher<S> {
    async fn handle_wake(&mut self) {
        if let Err(e) = self.process_wake().await {
            error!("Switch failed: {e}");
        }
    }

    /// The control loop. Cancellation is only observed while idle, a switch
    /// that has begun always runs to completion.
    async fn serve(&mut self, token: &CancellationToken) -> Result<()> {
        // Pick up anything written while we were not running
        self.handle_wake().await;
        loop {
            let interval = self.config.borrow().switch.health_interval();
            let wake = tokio::select! {
                wake = self.trigger.wait(interval) => wake?,
                () = token.cancelled() => return Ok(()),
            };
            match wake {
                Wake::Trigger => debug!("Woken by trigger"),
                Wake::Timeout => debug!("Woken for health check"),
            }
            self.handle_wake().await;
        }
    }
}

impl<S: SessionServices + 'static> Service for SessionSwitcher<S> {
    const NAME: &'static str = "session-switcher";

    async fn run(&mut self) -> Result<()> {
        self.serve(&CancellationToken::new()).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Last session state was {}", self.state);
        Ok(())
    }

    async fn start(mut self, token: CancellationToken) -> Result<()> {
        info!("Starting {}", Self::NAME);
        let res = self.serve(&token).await;
        if let Err(e) = &res {
            warn!("{} encountered an error: {e}", Self::NAME);
            token.cancel();
        }
        info!("Shutting down {}", Self::NAME);
        self.shutdown().await.and(res)
    }
}
