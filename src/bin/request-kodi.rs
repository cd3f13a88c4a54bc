/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use session_switcher::client::request_session;
use session_switcher::session::Session;

#[tokio::main]
pub async fn main() {
    // Exit status is 0 even when the request could not be written
    match request_session(Session::Kodi).await {
        Ok(()) => println!("Requested switch to Kodi"),
        Err(e) => eprintln!("Failed to request switch to Kodi: {e}"),
    }
}
