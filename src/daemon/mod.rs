/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, bail, ensure, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};
use zbus::connection::Connection;

use crate::daemon::config::{read_config, Config};
use crate::switch::SessionSwitcher;
use crate::systemd::SystemdSessions;
use crate::Service;

pub mod config;

pub(crate) struct Daemon {
    services: JoinSet<Result<()>>,
    token: CancellationToken,
    config: watch::Sender<Config>,
}

impl Daemon {
    pub(crate) fn new(config: Config) -> Daemon {
        let (config, _) = watch::channel(config);
        Daemon {
            services: JoinSet::new(),
            token: CancellationToken::new(),
            config,
        }
    }

    pub(crate) fn config(&self) -> watch::Receiver<Config> {
        self.config.subscribe()
    }

    pub(crate) fn add_service<S: Service + 'static>(&mut self, service: S) -> CancellationToken {
        let token = self.token.child_token();
        let moved_token = token.clone();
        self.services
            .spawn(async move { service.start(moved_token).await });
        token
    }

    async fn reload(&self) {
        match read_config().await {
            Ok(config) => {
                info!("Reloaded configuration");
                self.config.send_replace(config);
            }
            Err(e) => error!("Failed to reload configuration, keeping the old one: {e}"),
        }
    }

    pub(crate) async fn run(&mut self) -> Result<()> {
        ensure!(
            !self.services.is_empty(),
            "Can't run a daemon with no services attached."
        );

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let mut res = loop {
            let res = tokio::select! {
                e = self.services.join_next() => match e {
                    Some(Ok(Ok(()))) => Ok(()),
                    Some(Ok(Err(e))) => Err(e),
                    Some(Err(e)) => Err(e.into()),
                    None => break Ok(()),
                },
                _ = tokio::signal::ctrl_c() => break Ok(()),
                e = sigterm.recv() => match e {
                    Some(_) => break Ok(()),
                    None => Err(anyhow!("SIGTERM machine broke")),
                },
                e = sighup.recv() => match e {
                    Some(_) => {
                        self.reload().await;
                        Ok(())
                    }
                    None => Err(anyhow!("SIGHUP machine broke")),
                },
                _ = sigquit.recv() => Err(anyhow!("Got SIGQUIT")),
            }
            .inspect_err(|e| error!("Encountered error running: {e}"));
            match res {
                Ok(()) => continue,
                r => break r,
            }
        };
        self.token.cancel();

        info!("Shutting down");

        while let Some(service_res) = self.services.join_next().await {
            res = match service_res {
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
                _ => continue,
            };
        }

        res.inspect_err(|e| error!("Encountered error: {e}"))
    }
}

pub async fn daemon() -> Result<()> {
    // Switches the machine between the Kodi session and the gaming session on
    // request. Runs as root since it drives system units and signals other
    // users' processes.

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match read_config().await {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration: {e}");
            bail!(e);
        }
    };

    let connection = match Connection::system().await {
        Ok(c) => c,
        Err(e) => {
            error!("Error connecting to DBus: {e}");
            bail!(e);
        }
    };

    let services = SystemdSessions::new(&connection, &config.units).await?;
    let mut daemon = Daemon::new(config);

    let switcher = SessionSwitcher::init(services, daemon.config()).await?;
    daemon.add_service(switcher);

    daemon.run().await
}
