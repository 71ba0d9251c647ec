//! Credential management.

use super::session::build_connection;
use super::Invocation;
use mcplink_auth::{AuthStorage, CallbackChannel};
use std::sync::Arc;

/// Remove stored OAuth state for the configured server.
pub async fn logout(invocation: Invocation) -> anyhow::Result<()> {
    let url = invocation.options.url.clone();
    let storage = Arc::new(AuthStorage::new()?);
    let connection = build_connection(invocation.options, storage, CallbackChannel::new())?;

    let removed = connection.clear_storage().await;
    connection.shutdown().await;
    let removed = removed?;

    if invocation.json {
        println!(
            "{}",
            serde_json::json!({ "server": url, "removed": removed })
        );
    } else if removed == 0 {
        println!("No stored credentials for {url}");
    } else {
        println!("✓ Removed {removed} stored entries for {url}");
    }
    Ok(())
}
