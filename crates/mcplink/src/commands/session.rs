//! Opening a connection for one command.

use anyhow::bail;
use mcplink_auth::{AuthStorage, CallbackChannel, CallbackServer, PopupHandler};
use mcplink_client::{ConnectionOptions, ConnectionState, McpConnection, SessionSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Time allowed for the transport handshake on top of the auth timeout.
const CONNECT_GRACE: Duration = Duration::from_secs(60);

/// A settled connection plus the callback listener serving it.
pub struct LiveSession {
    pub connection: McpConnection,
    callback_server: Option<CallbackServer>,
}

impl LiveSession {
    /// Disconnect and stop the callback listener.
    pub async fn close(self) {
        self.connection.shutdown().await;
        if let Some(server) = self.callback_server {
            server.stop().await;
        }
    }
}

fn storage() -> Arc<AuthStorage> {
    Arc::new(AuthStorage::new().unwrap_or_else(|e| {
        warn!(error = %e, "No auth storage directory, keeping tokens in memory");
        AuthStorage::memory()
    }))
}

fn popup_handler(open_browser: bool) -> PopupHandler {
    PopupHandler::new(move |url| {
        eprintln!("Open this URL to authorize:");
        eprintln!("  {url}");
        if open_browser {
            if let Err(e) = open::that(url) {
                warn!(error = %e, "Could not open a browser");
            }
        }
        // Never blocked: the URL is on stderr.
        true
    })
}

/// Build a connection without connecting.
pub fn build_connection(
    options: ConnectionOptions,
    storage: Arc<AuthStorage>,
    channel: CallbackChannel,
) -> anyhow::Result<McpConnection> {
    Ok(McpConnection::builder(options)
        .with_storage(storage)
        .with_callback_channel(channel)
        .build()?)
}

/// Connect and wait until the session is ready.
pub async fn open_session(
    options: ConnectionOptions,
    open_browser: bool,
) -> anyhow::Result<LiveSession> {
    let storage = storage();
    let channel = CallbackChannel::new();
    let options = options.with_popup_handler(popup_handler(open_browser));
    let wait = options.auth_timeout() + CONNECT_GRACE;

    let server = CallbackServer::new(
        &options.resolved_callback_url(),
        options.host_origin.clone(),
        options.storage_key_prefix.clone(),
        storage.clone(),
        channel.clone(),
    )?;
    let callback_server = match server.start().await {
        Ok(addr) => {
            debug!(%addr, "Callback server listening");
            Some(server)
        }
        Err(e) => {
            warn!(error = %e, "Callback server unavailable; browser authorization will not complete");
            None
        }
    };

    let connection = build_connection(options, storage, channel)?;
    let session = LiveSession {
        connection,
        callback_server,
    };

    session.connection.connect().await;
    let mut snapshot = match settle(&session.connection, wait, is_settled).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            session.close().await;
            return Err(e);
        }
    };

    // The listener can finish a manual authorization while we wait.
    if snapshot.state == ConnectionState::PendingAuth && session.callback_server.is_some() {
        if let Some(url) = &snapshot.auth_url {
            eprintln!("Authorization required; open this URL to continue:");
            eprintln!("  {url}");
        }
        snapshot = match settle(&session.connection, wait, is_terminal).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
    }

    match snapshot.state {
        ConnectionState::Ready => Ok(session),
        ConnectionState::PendingAuth => {
            session.close().await;
            match snapshot.auth_url {
                Some(url) => bail!("Authorization required; open {url} and run the command again"),
                None => bail!("Authorization required"),
            }
        }
        _ => {
            session.close().await;
            let error = snapshot
                .error
                .unwrap_or_else(|| "connection failed".to_string());
            match snapshot.auth_url {
                Some(url) => bail!("{error}\nAuthorization URL: {url}"),
                None => bail!("{error}"),
            }
        }
    }
}

fn is_terminal(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Ready | ConnectionState::Failed)
}

fn is_settled(state: ConnectionState) -> bool {
    is_terminal(state) || state == ConnectionState::PendingAuth
}

/// Wait until `done` holds for the connection state.
pub async fn settle(
    connection: &McpConnection,
    wait: Duration,
    done: fn(ConnectionState) -> bool,
) -> anyhow::Result<SessionSnapshot> {
    let mut updates = connection.subscribe();
    let settled = tokio::time::timeout(wait, async {
        loop {
            let snapshot = updates.borrow_and_update().clone();
            if done(snapshot.state) {
                return Some(snapshot);
            }
            if updates.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;

    match settled {
        Ok(Some(snapshot)) => Ok(snapshot),
        Ok(None) => bail!("Connection closed unexpectedly"),
        Err(_) => bail!(
            "Timed out after {}s (state: {})",
            wait.as_secs(),
            connection.state()
        ),
    }
}
