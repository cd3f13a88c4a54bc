/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use clap::Parser;

use session_switcher::daemon::daemon;

/// Switches between the Kodi session and the gaming session on request
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {}

#[tokio::main]
pub async fn main() -> Result<()> {
    let _args = Args::parse();
    daemon().await
}
