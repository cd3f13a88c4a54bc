/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, Result};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::str::FromStr;
use strum::{Display, EnumString};
use tempfile::Builder as TempFileBuilder;
use tokio::fs::{create_dir_all, read_to_string};
use tracing::warn;

/// One of the two mutually exclusive graphical sessions.
#[derive(Display, EnumString, PartialEq, Eq, Hash, Debug, Copy, Clone)]
#[strum(ascii_case_insensitive)]
pub enum Session {
    #[strum(to_string = "kodi")]
    Kodi,
    #[strum(to_string = "gamemode", serialize = "gaming")]
    Gamemode,
}

/// What the daemon believes is running, as persisted in the state store.
#[derive(Display, EnumString, PartialEq, Eq, Debug, Copy, Clone)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Kodi,
    Gamemode,
    Unknown,
    Failed,
}

impl From<Session> for SessionState {
    fn from(session: Session) -> SessionState {
        match session {
            Session::Kodi => SessionState::Kodi,
            Session::Gamemode => SessionState::Gamemode,
        }
    }
}

impl Session {
    pub fn other(self) -> Session {
        match self {
            Session::Kodi => Session::Gamemode,
            Session::Gamemode => Session::Kodi,
        }
    }
}

/// Interprets the contents of the trigger file. Blank contents are not a
/// request.
pub fn parse_request(contents: &str) -> Result<Option<Session>> {
    let token = contents.trim();
    if token.is_empty() {
        return Ok(None);
    }
    Session::from_str(token)
        .map(Some)
        .map_err(|_| anyhow!("Unrecognized switch request {token:?}"))
}

pub async fn read_session_state(path: &Path) -> Result<Option<SessionState>> {
    let contents = match read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match SessionState::from_str(contents.trim()) {
        Ok(state) => Ok(Some(state)),
        Err(_) => {
            warn!(
                "Ignoring unreadable session state {:?} in {}",
                contents.trim(),
                path.display()
            );
            Ok(None)
        }
    }
}

pub async fn write_session_state(path: &Path, state: SessionState) -> Result<()> {
    let dir = path
        .parent()
        .ok_or(anyhow!("State path {} has no parent dir", path.display()))?;
    create_dir_all(dir).await?;

    // Readers must never observe a half-written token
    let mut output = TempFileBuilder::new().prefix(".state-").tempfile_in(dir)?;
    writeln!(output, "{state}")?;
    output.as_file().sync_data()?;
    output.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{enum_roundtrip, path, testing};
    use tokio::fs::write;

    #[test]
    fn session_state_roundtrip() {
        enum_roundtrip!(SessionState {
            "kodi": str = Kodi,
            "gamemode": str = Gamemode,
            "unknown": str = Unknown,
            "failed": str = Failed,
        });
        assert!(SessionState::from_str("desktop").is_err());
    }

    #[test]
    fn session_tokens() {
        enum_roundtrip!(Session {
            "kodi": str = Kodi,
            "gamemode": str = Gamemode,
        });
        assert_eq!(Session::from_str("gaming").unwrap(), Session::Gamemode);
        assert_eq!(Session::from_str("KODI").unwrap(), Session::Kodi);
        assert_eq!(Session::Kodi.other(), Session::Gamemode);
    }

    #[test]
    fn request_parsing() {
        assert_eq!(parse_request("kodi\n").unwrap(), Some(Session::Kodi));
        assert_eq!(parse_request("  gaming ").unwrap(), Some(Session::Gamemode));
        assert_eq!(parse_request("gamemode").unwrap(), Some(Session::Gamemode));
        assert_eq!(parse_request("").unwrap(), None);
        assert_eq!(parse_request(" \n\t").unwrap(), None);
        assert!(parse_request("desktop").is_err());
        assert!(parse_request("kodi gamemode").is_err());
    }

    #[tokio::test]
    async fn state_store() {
        let _h = testing::start();
        let state_path = path("/var/lib/session-switch/state");

        assert_eq!(read_session_state(&state_path).await.unwrap(), None);

        write_session_state(&state_path, SessionState::Kodi)
            .await
            .expect("write");
        assert_eq!(
            std::fs::read_to_string(&state_path).expect("read"),
            "kodi\n"
        );
        assert_eq!(
            read_session_state(&state_path).await.unwrap(),
            Some(SessionState::Kodi)
        );

        write_session_state(&state_path, SessionState::Failed)
            .await
            .expect("write");
        assert_eq!(
            read_session_state(&state_path).await.unwrap(),
            Some(SessionState::Failed)
        );

        write(&state_path, "garbage").await.expect("write");
        assert_eq!(read_session_state(&state_path).await.unwrap(), None);
    }
}
