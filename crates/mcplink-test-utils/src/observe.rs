//! Helpers for observing a connection.

use mcplink_client::{ConnectionState, McpConnection, SessionSnapshot};
use std::time::Duration;
use tokio::sync::broadcast;

/// Wait until the connection reaches `state`, panicking after `timeout`.
pub async fn wait_for_state(
    connection: &McpConnection,
    state: ConnectionState,
    timeout: Duration,
) -> SessionSnapshot {
    let mut updates = connection.subscribe();
    let waited = tokio::time::timeout(timeout, async {
        loop {
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.state == state {
                return snapshot;
            }
            if updates.changed().await.is_err() {
                panic!("connection dropped while waiting for {state}");
            }
        }
    })
    .await;

    waited.unwrap_or_else(|_| {
        panic!(
            "timed out waiting for {state}; current state is {}",
            connection.state()
        )
    })
}

/// Every state transition received so far.
pub fn drain_states(receiver: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(state) = receiver.try_recv() {
        states.push(state);
    }
    states
}
