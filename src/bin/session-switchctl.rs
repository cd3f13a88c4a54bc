/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use clap::{Parser, Subcommand};

use session_switcher::client::{read_status, request_session};
use session_switcher::session::Session;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a switch to another session
    Request {
        /// Valid sessions are kodi, gamemode
        session: Session,
    },

    /// Get the session the daemon last switched to
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Commands::Request { session } => {
            request_session(*session).await?;
            println!("Requested switch to {session}");
        }
        Commands::Status => {
            let state = read_status().await?;
            println!("Session state: {state}");
        }
    }

    Ok(())
}
