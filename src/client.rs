/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;

use crate::daemon::config::{read_config, Config};
use crate::path;
use crate::session::{read_session_state, Session, SessionState};
use crate::trigger::write_request;

/// Asks the daemon to switch to `session`. Only the trigger file is touched;
/// the switch itself happens asynchronously.
pub async fn request_session_with(config: &Config, session: Session) -> Result<()> {
    write_request(&path(&config.paths.trigger), session.to_string().as_str())
}

pub async fn request_session(session: Session) -> Result<()> {
    let config = read_config().await?;
    request_session_with(&config, session).await
}

pub async fn read_status_with(config: &Config) -> Result<SessionState> {
    Ok(read_session_state(&path(&config.paths.state))
        .await?
        .unwrap_or(SessionState::Unknown))
}

pub async fn read_status() -> Result<SessionState> {
    let config = read_config().await?;
    read_status_with(&config).await
}
