//! Connection lifecycle scenarios: transport selection, readiness, retry,
//! reconnect and teardown.

use mcplink_client::protocol::{
    METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_TOOLS_LIST, NOTIFICATION_TOOLS_CHANGED,
};
use mcplink_client::{
    ConnectionOptions, ConnectionState, LogLevel, McpConnection, McpError, RetryPolicy,
    Transport, TransportKind, TransportPreference,
};
use mcplink_test_utils::{
    drain_states, wait_for_state, RecordingAuthProvider, ScriptedFailure,
    ScriptedTransportFactory, ServerScript,
};
use mcplink_util::log::MAX_LOG_ENTRIES;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const URL: &str = "http://scripted.test/mcp";
const WAIT: Duration = Duration::from_secs(5);

use ConnectionState::*;
use TransportKind::{Http, Sse};

fn connect_with(
    options: ConnectionOptions,
    factory: &Arc<ScriptedTransportFactory>,
) -> (McpConnection, Arc<RecordingAuthProvider>) {
    let provider = Arc::new(RecordingAuthProvider::new(URL).with_stored_entries(2));
    let connection = McpConnection::builder(options)
        .with_transport_factory(factory.clone())
        .with_auth_provider(provider.clone())
        .build()
        .unwrap();
    (connection, provider)
}

fn network_down() -> ServerScript {
    ServerScript::healthy().failing_start(ScriptedFailure::Network("connection refused".into()))
}

fn fallback_entries(connection: &McpConnection) -> usize {
    connection
        .snapshot()
        .log
        .iter()
        .filter(|entry| entry.message.contains("falling back"))
        .count()
}

#[tokio::test]
async fn test_auto_falls_back_to_sse_once() {
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, network_down())
            .with_script(Sse, ServerScript::healthy()),
    );
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);
    let mut states = connection.state_changes();

    connection.connect().await;

    assert_eq!(
        drain_states(&mut states),
        vec![Connecting, Connecting, Loading, Ready]
    );
    assert_eq!(factory.created_kinds(), vec![Http, Sse]);
    assert_eq!(fallback_entries(&connection), 1);

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.transport, Some(Sse));
    assert_eq!(snapshot.tools[0].name, "echo");
    let fallback = snapshot
        .log
        .iter()
        .find(|entry| entry.message.contains("falling back"))
        .unwrap();
    assert_eq!(fallback.level, LogLevel::Warn);
    assert_eq!(
        fallback.message,
        "HTTP transport failed, falling back to SSE: Connection failed: connection refused"
    );
}

#[tokio::test]
async fn test_fallback_is_a_single_hop() {
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, network_down())
            .with_script(Sse, network_down()),
    );
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);

    connection.connect().await;

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.state, Failed);
    assert_eq!(factory.created_kinds(), vec![Http, Sse]);
    assert_eq!(fallback_entries(&connection), 1);
    let error = snapshot.error.unwrap();
    assert!(error.contains("SSE"), "{error}");
    assert!(error.contains("connection refused"), "{error}");
}

#[tokio::test]
async fn test_forced_kind_never_falls_back() {
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, ServerScript::healthy())
            .with_script(Sse, network_down()),
    );
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL).with_transport(TransportPreference::Sse),
        &factory,
    );

    connection.connect().await;

    assert_eq!(connection.state(), Failed);
    assert_eq!(factory.created_kinds(), vec![Sse]);
    assert_eq!(fallback_entries(&connection), 0);
    assert!(connection.snapshot().error.unwrap().starts_with("Failed to connect via SSE"));
}

#[tokio::test]
async fn test_construction_error_is_fallback_eligible() {
    // No HTTP script: building the HTTP transport fails.
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Sse, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);

    connection.connect().await;

    assert_eq!(connection.state(), Ready);
    assert_eq!(factory.created_kinds(), vec![Sse]);
    assert_eq!(fallback_entries(&connection), 1);
}

#[tokio::test]
async fn test_actions_before_ready_fail_without_transport_activity() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);

    let err = connection.call_tool("echo", None).await.unwrap_err();
    assert!(matches!(err, McpError::NotReady {
            state: ConnectionState::Discovering
        }));
    assert!(err.to_string().contains("discovering"));
    assert!(connection.read_resource("file:///readme.md").await.is_err());
    assert!(connection.get_prompt("greet", None).await.is_err());
    assert!(connection.list_resources().await.is_err());
    assert!(connection.list_prompts().await.is_err());

    assert!(factory.transports().is_empty());
    assert_eq!(connection.state(), Discovering);
}

#[tokio::test]
async fn test_not_ready_names_failed_state() {
    let factory = Arc::new(ScriptedTransportFactory::new().with_script(Http, network_down()));
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL).with_transport(TransportPreference::Http),
        &factory,
    );
    connection.connect().await;
    let requests_before = factory.total_requests();

    let err = connection.call_tool("echo", None).await.unwrap_err();
    assert_eq!(err.to_string(), "MCP client not ready (current state: failed)");
    assert_eq!(factory.total_requests(), requests_before);
}

#[tokio::test]
async fn test_ready_requires_tools() {
    let factory = Arc::new(ScriptedTransportFactory::new().with_script(
        Http,
        ServerScript::healthy().with_failure(
            METHOD_TOOLS_LIST,
            ScriptedFailure::Rpc(-32601, "Method not found".into()),
        ),
    ));
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL).with_transport(TransportPreference::Http),
        &factory,
    );

    connection.connect().await;

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.state, Failed);
    assert!(snapshot.tools.is_empty());
    assert!(snapshot.error.unwrap().contains("Method not found"));
}

#[tokio::test]
async fn test_optional_lists_degrade_to_empty() {
    let factory = Arc::new(
        ScriptedTransportFactory::new().with_script(
            Http,
            ServerScript::healthy()
                .with_failure(METHOD_RESOURCES_LIST, ScriptedFailure::Rpc(-32601, "no".into()))
                .with_failure(METHOD_PROMPTS_LIST, ScriptedFailure::Network("reset".into())),
        ),
    );
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);

    connection.connect().await;

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.state, Ready);
    assert_eq!(snapshot.tools.len(), 1);
    assert!(snapshot.resources.is_empty());
    assert!(snapshot.prompts.is_empty());
    assert_eq!(factory.created_kinds(), vec![Http]);
}

#[tokio::test]
async fn test_requests_when_ready() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);
    connection.connect().await;

    let result = connection
        .call_tool("echo", Some(json!({"text": "hi"})))
        .await
        .unwrap();
    assert_eq!(result.text(), "echoed");

    let read = connection.read_resource("file:///readme.md").await.unwrap();
    assert_eq!(read.contents[0].text.as_deref(), Some("hello"));

    let prompt = connection.get_prompt("greet", None).await.unwrap();
    assert_eq!(prompt.messages[0].role, "user");

    assert_eq!(connection.list_prompts().await.unwrap()[0].name, "greet");
    assert_eq!(connection.list_resources().await.unwrap()[0].name, "readme");
}

#[tokio::test]
async fn test_overlapping_connect_is_dropped() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);

    tokio::join!(connection.connect(), connection.connect());

    assert_eq!(connection.state(), Ready);
    assert_eq!(factory.transports().len(), 1);
}

#[tokio::test]
async fn test_superseded_attempt_leaves_new_transport_alone() {
    let gate = Arc::new(Notify::new());
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, network_down().holding_start(gate.clone()))
            .with_script(Http, ServerScript::healthy()),
    );
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL).with_transport(TransportPreference::Http),
        &factory,
    );

    let superseded = tokio::spawn({
        let connection = connection.clone();
        async move { connection.connect().await }
    });
    tokio::time::timeout(WAIT, async {
        while factory.transports().first().map_or(0, |t| t.start_count()) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    connection.disconnect().await;
    connection.connect().await;
    assert_eq!(connection.state(), Ready);
    let transports = factory.transports();
    assert_eq!(transports.len(), 2);
    let (old, live) = (&transports[0], &transports[1]);
    assert_eq!(old.close_count(), 1);

    gate.notify_one();
    superseded.await.unwrap();

    assert_eq!(connection.state(), Ready);
    assert_eq!(live.close_count(), 0);
    assert!(live.is_connected());
    assert_eq!(old.close_count(), 1);
    let result = connection.call_tool("echo", None).await.unwrap();
    assert_eq!(result.text(), "echoed");
    assert!(connection.snapshot().error.is_none());
}

#[tokio::test]
async fn test_handshake_finishing_after_shutdown_is_dropped() {
    let gate = Arc::new(Notify::new());
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, ServerScript::healthy().holding_start(gate.clone())),
    );
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);

    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.connect().await }
    });
    tokio::time::timeout(WAIT, async {
        while factory.last().map_or(0, |t| t.start_count()) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    connection.shutdown().await;
    gate.notify_one();
    pending.await.unwrap();

    assert_eq!(connection.state(), Discovering);
    assert!(connection.snapshot().tools.is_empty());
    assert_eq!(factory.transports().len(), 1);
    assert!(!factory.transports()[0].requests().contains(&METHOD_TOOLS_LIST.to_string()));
}

#[tokio::test]
async fn test_retry_is_noop_unless_failed() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);
    connection.connect().await;

    let mut states = connection.state_changes();
    let log_before = connection.snapshot().log.len();

    connection.retry().await;

    assert!(drain_states(&mut states).is_empty());
    assert_eq!(connection.state(), Ready);
    assert_eq!(factory.transports().len(), 1);
    let log = connection.snapshot().log;
    assert_eq!(log.len(), log_before + 1);
    assert_eq!(log.last().unwrap().level, LogLevel::Warn);
}

#[tokio::test]
async fn test_retry_from_failed() {
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, network_down())
            .with_script(Http, ServerScript::healthy()),
    );
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL).with_transport(TransportPreference::Http),
        &factory,
    );
    connection.connect().await;
    assert_eq!(connection.state(), Failed);

    let mut states = connection.state_changes();
    connection.retry().await;

    assert_eq!(
        drain_states(&mut states),
        vec![Discovering, Connecting, Loading, Ready]
    );
    assert!(connection.snapshot().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_auto_retry_after_delay() {
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, network_down())
            .with_script(Http, ServerScript::healthy()),
    );
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL)
            .with_transport(TransportPreference::Http)
            .with_auto_retry(RetryPolicy::Milliseconds(500)),
        &factory,
    );

    connection.connect().await;
    assert_eq!(connection.state(), Failed);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(connection.state(), Failed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_for_state(&connection, Ready, WAIT).await;
    assert_eq!(factory.transports().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manual_retry_cancels_auto_retry() {
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, network_down())
            .with_script(Http, ServerScript::healthy()),
    );
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL)
            .with_transport(TransportPreference::Http)
            .with_auto_retry(RetryPolicy::Toggle(true)),
        &factory,
    );
    connection.connect().await;
    connection.retry().await;
    assert_eq!(connection.state(), Ready);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connection.state(), Ready);
    assert_eq!(factory.transports().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_close() {
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, ServerScript::healthy())
            .with_script(Http, ServerScript::healthy().with_tools(&["echo", "sum"])),
    );
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL).with_auto_reconnect(RetryPolicy::Milliseconds(1000)),
        &factory,
    );
    connection.connect().await;
    let first = factory.last().unwrap();
    let mut states = connection.state_changes();

    first.emit_close();
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(connection.state(), Ready);
    assert_eq!(factory.transports().len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = wait_for_state(&connection, Ready, WAIT).await;

    assert_eq!(drain_states(&mut states), vec![Connecting, Loading, Ready]);
    let names: Vec<_> = snapshot.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "sum"]);
    assert_eq!(factory.created_kinds(), vec![Http, Http]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_keeps_sse_after_fallback() {
    let factory = Arc::new(
        ScriptedTransportFactory::new()
            .with_script(Http, network_down())
            .with_script(Sse, ServerScript::healthy()),
    );
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL).with_auto_reconnect(RetryPolicy::Milliseconds(1000)),
        &factory,
    );
    connection.connect().await;
    assert_eq!(connection.snapshot().transport, Some(Sse));

    factory.last().unwrap().emit_close();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let snapshot = wait_for_state(&connection, Ready, WAIT).await;

    assert_eq!(snapshot.transport, Some(Sse));
    assert_eq!(factory.created_kinds(), vec![Http, Sse, Sse]);
    assert_eq!(fallback_entries(&connection), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_without_reconnect_fails() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(
        ConnectionOptions::new(URL).with_auto_reconnect(RetryPolicy::Toggle(false)),
        &factory,
    );
    connection.connect().await;

    factory.last().unwrap().emit_close();
    let snapshot = wait_for_state(&connection, Failed, WAIT).await;
    assert_eq!(snapshot.error.as_deref(), Some("Connection closed"));
}

#[tokio::test]
async fn test_list_changed_refreshes_tools() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);
    connection.connect().await;
    let mut updates = connection.subscribe();

    let transport = factory.last().unwrap();
    transport.set_script(ServerScript::healthy().with_tools(&["echo", "fresh"]));
    transport.emit_message(json!({"jsonrpc": "2.0", "method": NOTIFICATION_TOOLS_CHANGED}));

    let refreshed = tokio::time::timeout(WAIT, async {
        loop {
            updates.changed().await.unwrap();
            let tools = updates.borrow().tools.clone();
            if tools.len() == 2 {
                return tools;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(refreshed[1].name, "fresh");
    assert_eq!(connection.state(), Ready);
}

#[tokio::test]
async fn test_disconnect_resets() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);
    connection.connect().await;
    let transport = factory.last().unwrap();

    connection.disconnect().await;

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.state, Discovering);
    assert!(snapshot.tools.is_empty());
    assert!(snapshot.resources.is_empty());
    assert!(snapshot.prompts.is_empty());
    assert!(snapshot.transport.is_none());
    assert_eq!(transport.close_count(), 1);

    // The close event of the old transport is stale.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connection.state(), Discovering);
}

#[tokio::test]
async fn test_log_stays_bounded() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);
    connection.connect().await;

    for _ in 0..(MAX_LOG_ENTRIES + 50) {
        connection.retry().await;
    }

    let log = connection.snapshot().log;
    assert_eq!(log.len(), MAX_LOG_ENTRIES);
    assert!(log.iter().all(|entry| entry.message.starts_with("Retry ignored")));
    for pair in log.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn test_shutdown_drops_later_work() {
    let factory =
        Arc::new(ScriptedTransportFactory::new().with_script(Http, ServerScript::healthy()));
    let (connection, _) = connect_with(ConnectionOptions::new(URL), &factory);
    connection.connect().await;

    connection.shutdown().await;
    let log_len = connection.snapshot().log.len();

    connection.connect().await;
    connection.retry().await;

    assert_eq!(connection.state(), Discovering);
    assert_eq!(factory.transports().len(), 1);
    assert_eq!(connection.snapshot().log.len(), log_len);
}
