//! Authorization scenarios: 401 handling, callbacks, timeouts and storage.

use mcplink_auth::CallbackMessage;
use mcplink_client::config::DEFAULT_HOST_ORIGIN;
use mcplink_client::protocol::METHOD_TOOLS_CALL;
use mcplink_client::{
    ConnectionOptions, ConnectionState, LogLevel, McpConnection, McpError, TransportKind,
    TransportPreference,
};
use mcplink_test_utils::{
    drain_states, wait_for_state, RecordingAuthProvider, ScriptedFailure,
    ScriptedTransportFactory, ServerScript,
};
use std::sync::Arc;
use std::time::Duration;

const URL: &str = "http://scripted.test/mcp";
const AUTH_URL: &str = "https://auth.example.com/authorize?state=test";
const WAIT: Duration = Duration::from_secs(5);

use ConnectionState::*;

fn build(
    options: ConnectionOptions,
    factory: &Arc<ScriptedTransportFactory>,
    provider: &Arc<RecordingAuthProvider>,
) -> McpConnection {
    McpConnection::builder(options)
        .with_transport_factory(factory.clone())
        .with_auth_provider(provider.clone())
        .build()
        .unwrap()
}

fn unauthorized() -> ServerScript {
    ServerScript::healthy().failing_start(ScriptedFailure::Unauthorized)
}

/// HTTP rejects the first connection, then accepts.
fn rejects_once() -> Arc<ScriptedTransportFactory> {
    Arc::new(
        ScriptedTransportFactory::new()
            .with_script(TransportKind::Http, unauthorized())
            .with_script(TransportKind::Http, ServerScript::healthy()),
    )
}

#[tokio::test]
async fn test_unauthorized_starts_authentication() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(
        ConnectionOptions::new(URL).with_transport(TransportPreference::Http),
        &factory,
        &provider,
    );
    let mut states = connection.state_changes();

    connection.connect().await;

    assert_eq!(drain_states(&mut states), vec![Connecting, Authenticating]);
    let snapshot = connection.snapshot();
    assert_eq!(snapshot.auth_url.as_deref(), Some(AUTH_URL));
    assert!(snapshot.error.is_none());
    assert_eq!(provider.redirects(), vec![AUTH_URL]);
    assert_eq!(factory.created_kinds(), vec![TransportKind::Http]);

    connection
        .callback_channel()
        .post_message(DEFAULT_HOST_ORIGIN, &CallbackMessage::success());
    let snapshot = wait_for_state(&connection, Ready, WAIT).await;

    assert_eq!(
        drain_states(&mut states),
        vec![Discovering, Connecting, Loading, Ready]
    );
    assert!(snapshot.auth_url.is_none());
    assert_eq!(snapshot.transport, Some(TransportKind::Http));
    assert!(snapshot
        .log
        .iter()
        .any(|entry| entry.message == "Authorization completed"));
}

#[tokio::test]
async fn test_callback_from_foreign_origin_is_ignored() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);
    connection.connect().await;
    assert_eq!(connection.state(), Authenticating);

    let channel = connection.callback_channel();
    channel.post_message("https://evil.example", &CallbackMessage::success());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connection.state(), Authenticating);
    assert_eq!(factory.transports().len(), 1);

    channel.post_message(DEFAULT_HOST_ORIGIN, &CallbackMessage::success());
    wait_for_state(&connection, Ready, WAIT).await;
}

#[tokio::test]
async fn test_allowed_origin_is_accepted() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(
        ConnectionOptions::new(URL).with_allowed_origin("https://app.example.com"),
        &factory,
        &provider,
    );
    connection.connect().await;

    connection
        .callback_channel()
        .post_message("https://app.example.com", &CallbackMessage::success());
    wait_for_state(&connection, Ready, WAIT).await;
}

#[tokio::test]
async fn test_callback_failure_fails_the_attempt() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);
    connection.connect().await;

    connection
        .callback_channel()
        .post_message(DEFAULT_HOST_ORIGIN, &CallbackMessage::failure("access_denied"));
    let snapshot = wait_for_state(&connection, Failed, WAIT).await;

    assert_eq!(
        snapshot.error.as_deref(),
        Some("Authentication failed: access_denied")
    );
    assert_eq!(snapshot.auth_url.as_deref(), Some(AUTH_URL));
}

#[tokio::test(start_paused = true)]
async fn test_authentication_times_out() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(
        ConnectionOptions::new(URL).with_auth_timeout(Duration::from_secs(1)),
        &factory,
        &provider,
    );
    connection.connect().await;
    assert_eq!(connection.state(), Authenticating);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let snapshot = wait_for_state(&connection, Failed, WAIT).await;
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Authentication timed out after 1s")
    );
    assert_eq!(snapshot.auth_url.as_deref(), Some(AUTH_URL));
}

#[tokio::test(start_paused = true)]
async fn test_completion_disarms_timeout() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(
        ConnectionOptions::new(URL).with_auth_timeout(Duration::from_secs(1)),
        &factory,
        &provider,
    );
    connection.connect().await;
    connection
        .callback_channel()
        .post_message(DEFAULT_HOST_ORIGIN, &CallbackMessage::success());
    wait_for_state(&connection, Ready, WAIT).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connection.state(), Ready);
}

#[tokio::test]
async fn test_refreshed_tokens_reconnect_directly() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL).with_refresh(true));
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);
    let mut states = connection.state_changes();

    connection.connect().await;

    assert_eq!(
        drain_states(&mut states),
        vec![
            Connecting,
            Authenticating,
            Discovering,
            Connecting,
            Loading,
            Ready
        ]
    );
    assert_eq!(provider.refresh_count(), 1);
    assert!(provider.redirects().is_empty());
}

#[tokio::test]
async fn test_rejected_fresh_credentials_fail() {
    let factory = Arc::new(
        ScriptedTransportFactory::new().with_script(TransportKind::Http, unauthorized()),
    );
    let provider = Arc::new(RecordingAuthProvider::new(URL).with_refresh(true));
    let connection = build(
        ConnectionOptions::new(URL).with_transport(TransportPreference::Http),
        &factory,
        &provider,
    );

    connection.connect().await;

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.state, Failed);
    let error = snapshot.error.unwrap();
    assert!(error.starts_with("Authentication failed"), "{error}");
    assert_eq!(provider.refresh_count(), 1);
    assert_eq!(factory.transports().len(), 2);
}

#[tokio::test]
async fn test_blocked_popup_exposes_manual_url() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL).with_popup_blocked());
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);

    connection.connect().await;

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.state, Failed);
    assert_eq!(snapshot.auth_url.as_deref(), Some(AUTH_URL));
    let error = snapshot.error.unwrap();
    assert!(error.contains("Popup blocked"), "{error}");
    assert!(error.contains(AUTH_URL), "{error}");
}

#[tokio::test]
async fn test_prevent_auto_auth_waits_for_user() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(
        ConnectionOptions::new(URL).with_prevent_auto_auth(true),
        &factory,
        &provider,
    );

    connection.connect().await;

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.state, PendingAuth);
    assert_eq!(snapshot.auth_url.as_deref(), Some(AUTH_URL));
    assert!(provider.redirects().is_empty());
    assert_eq!(provider.refresh_count(), 0);

    connection.authenticate().await;

    assert_eq!(connection.state(), Authenticating);
    assert_eq!(provider.redirects(), vec![AUTH_URL]);

    connection
        .callback_channel()
        .post_message(DEFAULT_HOST_ORIGIN, &CallbackMessage::success());
    wait_for_state(&connection, Ready, WAIT).await;
}

#[tokio::test]
async fn test_manual_url_completion_reconnects() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(
        ConnectionOptions::new(URL).with_prevent_auto_auth(true),
        &factory,
        &provider,
    );
    connection.connect().await;
    assert_eq!(connection.state(), PendingAuth);
    let mut states = connection.state_changes();

    connection
        .callback_channel()
        .post_message(DEFAULT_HOST_ORIGIN, &CallbackMessage::success());
    let snapshot = wait_for_state(&connection, Ready, WAIT).await;

    assert_eq!(
        drain_states(&mut states),
        vec![Discovering, Connecting, Loading, Ready]
    );
    assert!(snapshot.auth_url.is_none());
    assert!(provider.redirects().is_empty());
    assert_eq!(
        factory.created_kinds(),
        vec![TransportKind::Http, TransportKind::Http]
    );
}

#[tokio::test]
async fn test_manual_url_failure_fails() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(
        ConnectionOptions::new(URL).with_prevent_auto_auth(true),
        &factory,
        &provider,
    );
    connection.connect().await;
    assert_eq!(connection.state(), PendingAuth);

    connection
        .callback_channel()
        .post_message(DEFAULT_HOST_ORIGIN, &CallbackMessage::failure("access_denied"));
    let snapshot = wait_for_state(&connection, Failed, WAIT).await;

    assert_eq!(
        snapshot.error.as_deref(),
        Some("Authentication failed: access_denied")
    );
    assert_eq!(snapshot.auth_url.as_deref(), Some(AUTH_URL));
    assert_eq!(factory.transports().len(), 1);
}

#[tokio::test]
async fn test_authenticate_when_ready_does_nothing() {
    let factory = Arc::new(
        ScriptedTransportFactory::new().with_script(TransportKind::Http, ServerScript::healthy()),
    );
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);
    connection.connect().await;
    let mut states = connection.state_changes();
    let requests = factory.total_requests();
    let log_len = connection.snapshot().log.len();

    connection.authenticate().await;

    assert!(drain_states(&mut states).is_empty());
    assert_eq!(factory.total_requests(), requests);
    assert_eq!(provider.prepare_count(), 0);
    let log = connection.snapshot().log;
    assert_eq!(log.len(), log_len + 1);
    assert_eq!(log.last().unwrap().level, LogLevel::Warn);
}

#[tokio::test]
async fn test_authenticate_while_authenticating_is_idempotent() {
    let factory = rejects_once();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);
    connection.connect().await;

    connection.authenticate().await;

    assert_eq!(connection.state(), Authenticating);
    assert_eq!(provider.redirects().len(), 1);
}

fn rejects_tool_calls() -> Arc<ScriptedTransportFactory> {
    Arc::new(ScriptedTransportFactory::new().with_script(
        TransportKind::Http,
        ServerScript::healthy().with_failure(METHOD_TOOLS_CALL, ScriptedFailure::Unauthorized),
    ))
}

#[tokio::test]
async fn test_unauthorized_request_starts_authentication() {
    let factory = rejects_tool_calls();
    let provider = Arc::new(RecordingAuthProvider::new(URL));
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);
    connection.connect().await;

    let err = connection.call_tool("echo", None).await.unwrap_err();

    assert!(matches!(err, McpError::Unauthorized));
    assert_eq!(connection.state(), Authenticating);
    assert_eq!(connection.snapshot().auth_url.as_deref(), Some(AUTH_URL));
}

#[tokio::test]
async fn test_unauthorized_request_with_refresh_reconnects() {
    let factory = rejects_tool_calls();
    let provider = Arc::new(RecordingAuthProvider::new(URL).with_refresh(true));
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);
    connection.connect().await;

    let err = connection.call_tool("echo", None).await.unwrap_err();
    assert!(err.is_auth_error());

    wait_for_state(&connection, Ready, WAIT).await;
    assert_eq!(factory.created_kinds(), vec![TransportKind::Http, TransportKind::Http]);
    assert_eq!(provider.refresh_count(), 1);
}

#[tokio::test]
async fn test_clear_storage_resets_session() {
    let factory = Arc::new(
        ScriptedTransportFactory::new().with_script(TransportKind::Http, ServerScript::healthy()),
    );
    let provider = Arc::new(RecordingAuthProvider::new(URL).with_stored_entries(3));
    let connection = build(ConnectionOptions::new(URL), &factory, &provider);
    connection.connect().await;
    let transport = factory.last().unwrap();

    let removed = connection.clear_storage().await.unwrap();

    assert_eq!(removed, 3);
    assert_eq!(provider.stored_entries(), 0);
    let snapshot = connection.snapshot();
    assert_eq!(snapshot.state, Discovering);
    assert!(snapshot.tools.is_empty());
    assert!(snapshot.auth_url.is_none());
    assert!(snapshot.error.is_none());
    assert_eq!(transport.close_count(), 1);

    // Nothing left to clear.
    assert_eq!(connection.clear_storage().await.unwrap(), 0);
}
