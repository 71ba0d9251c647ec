//! Protocol session: the MCP client bound to the active transport.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolParams, CallToolResult, GetPromptResult, Implementation, InitializeParams,
    InitializeResult, JsonRpcNotification, JsonRpcRequest, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt, ReadResourceResult,
    Resource, ResourceTemplate, Tool, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PROMPTS_GET,
    METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_RESOURCE_TEMPLATES_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    NOTIFICATION_PROMPTS_CHANGED, NOTIFICATION_RESOURCES_CHANGED, NOTIFICATION_TOOLS_CHANGED,
};
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Which capability list a `list_changed` notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChanged {
    Tools,
    Resources,
    Prompts,
}

impl ListChanged {
    /// Recognise a `notifications/*/list_changed` message.
    pub fn from_message(message: &Value) -> Option<Self> {
        match message.get("method").and_then(Value::as_str)? {
            NOTIFICATION_TOOLS_CHANGED => Some(ListChanged::Tools),
            NOTIFICATION_RESOURCES_CHANGED => Some(ListChanged::Resources),
            NOTIFICATION_PROMPTS_CHANGED => Some(ListChanged::Prompts),
            _ => None,
        }
    }
}

/// One MCP client, reused across transport replacements.
///
/// Only the transport is swapped by [`connect_client`](Self::connect_client);
/// request ids keep increasing for the lifetime of the session.
pub struct ProtocolSession {
    client_info: Implementation,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    server: RwLock<Option<InitializeResult>>,
    next_id: AtomicU64,
}

impl ProtocolSession {
    pub fn new(client_info: Implementation) -> Self {
        Self {
            client_info,
            transport: RwLock::new(None),
            server: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn current(&self) -> McpResult<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| McpError::connection_failed("No active transport"))
    }

    /// Start `transport` and run the initialize handshake over it.
    pub async fn connect_client(&self, transport: Arc<dyn Transport>) -> McpResult<InitializeResult> {
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = Some(transport.clone());

        transport.start().await?;

        let params = serde_json::to_value(InitializeParams::new(self.client_info.clone()))?;
        let result: InitializeResult = self
            .request_on(&transport, METHOD_INITIALIZE, Some(params))
            .await?;

        debug!(
            protocol_version = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP server initialized"
        );

        transport
            .notify(JsonRpcNotification::new(METHOD_INITIALIZED, None))
            .await?;

        if self.is_bound_to(&transport) {
            *self.server.write().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
        }
        Ok(result)
    }

    fn is_bound_to(&self, transport: &Arc<dyn Transport>) -> bool {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, transport))
    }

    /// Forget the transport without closing it; the selector owns closing.
    pub fn detach(&self) {
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = None;
        *self.server.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// [`detach`](Self::detach), but only while still bound to `transport`.
    pub fn detach_from(&self, transport: &Arc<dyn Transport>) {
        let mut current = self.transport.write().unwrap_or_else(|e| e.into_inner());
        if current
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, transport))
        {
            *current = None;
            *self.server.write().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    /// Initialize result of the current server, if connected.
    pub fn server(&self) -> Option<InitializeResult> {
        self.server.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Issue a request on the current transport and decode its result.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> McpResult<T> {
        let transport = self.current()?;
        self.request_on(&transport, method, params).await
    }

    async fn request_on<T: DeserializeOwned>(
        &self,
        transport: &Arc<dyn Transport>,
        method: &str,
        params: Option<Value>,
    ) -> McpResult<T> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        let response = transport.request(request).await?;

        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        let result = response
            .result
            .ok_or_else(|| McpError::protocol(format!("Missing {method} result")))?;
        serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("Invalid {method} result: {e}")))
    }

    /// Follow `nextCursor` until the server stops returning one.
    async fn paginate<R, T>(
        &self,
        method: &str,
        split: impl Fn(R) -> (Vec<T>, Option<String>),
    ) -> McpResult<Vec<T>>
    where
        R: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let (page, next) = split(self.request::<R>(method, params).await?);
            items.extend(page);
            match next {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                _ => return Ok(items),
            }
        }
    }

    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.paginate(METHOD_TOOLS_LIST, |r: ListToolsResult| (r.tools, r.next_cursor))
            .await
    }

    pub async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        self.paginate(METHOD_RESOURCES_LIST, |r: ListResourcesResult| {
            (r.resources, r.next_cursor)
        })
        .await
    }

    pub async fn list_resource_templates(&self) -> McpResult<Vec<ResourceTemplate>> {
        self.paginate(
            METHOD_RESOURCE_TEMPLATES_LIST,
            |r: ListResourceTemplatesResult| (r.resource_templates, r.next_cursor),
        )
        .await
    }

    pub async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.paginate(METHOD_PROMPTS_LIST, |r: ListPromptsResult| {
            (r.prompts, r.next_cursor)
        })
        .await
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        self.request(METHOD_TOOLS_CALL, Some(serde_json::to_value(&params)?))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.request(METHOD_RESOURCES_READ, Some(json!({ "uri": uri })))
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = serde_json::to_value(arguments)?;
        }
        self.request(METHOD_PROMPTS_GET, Some(params)).await
    }
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("client_info", &self.client_info)
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcResponse, PROTOCOL_VERSION};
    use crate::transport::MockTransport;
    use std::sync::Mutex;

    fn init_result() -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "test-server", "version": "1.0"}
        })
    }

    fn session() -> ProtocolSession {
        ProtocolSession::new(Implementation::default())
    }

    #[tokio::test]
    async fn test_connect_client_handshake() {
        let mut transport = MockTransport::new();
        transport.expect_start().times(1).returning(|| Ok(()));
        transport
            .expect_request()
            .withf(|req| req.method == METHOD_INITIALIZE)
            .returning(|req| Ok(JsonRpcResponse::success(req.id, init_result())));
        transport
            .expect_notify()
            .withf(|n| n.method == METHOD_INITIALIZED)
            .times(1)
            .returning(|_| Ok(()));

        let session = session();
        let result = session.connect_client(Arc::new(transport)).await.unwrap();
        assert_eq!(result.server_info.name, "test-server");
        assert!(session.server().is_some());
    }

    #[tokio::test]
    async fn test_initialize_rpc_error() {
        let mut transport = MockTransport::new();
        transport.expect_start().returning(|| Ok(()));
        transport
            .expect_request()
            .returning(|req| Ok(JsonRpcResponse::failure(req.id, 401, "Unauthorized")));
        transport.expect_notify().never();

        let err = session()
            .connect_client(Arc::new(transport))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: 401, .. }));
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_request_without_transport() {
        let err = session().list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let cursors = Arc::new(Mutex::new(Vec::new()));
        let seen = cursors.clone();

        let mut transport = MockTransport::new();
        transport.expect_start().returning(|| Ok(()));
        transport.expect_notify().returning(|_| Ok(()));
        transport.expect_request().returning(move |req| {
            let result = match req.method.as_str() {
                METHOD_INITIALIZE => init_result(),
                METHOD_TOOLS_LIST => {
                    let cursor = req
                        .params
                        .as_ref()
                        .and_then(|p| p["cursor"].as_str())
                        .map(str::to_string);
                    seen.lock().unwrap().push(cursor.clone());
                    match cursor.as_deref() {
                        None => json!({"tools": [{"name": "a"}], "nextCursor": "page2"}),
                        _ => json!({"tools": [{"name": "b"}]}),
                    }
                }
                other => panic!("unexpected {other}"),
            };
            Ok(JsonRpcResponse::success(req.id, result))
        });

        let session = session();
        session.connect_client(Arc::new(transport)).await.unwrap();
        let tools = session.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(
            *cursors.lock().unwrap(),
            vec![None, Some("page2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_get_prompt_params() {
        let mut transport = MockTransport::new();
        transport.expect_start().returning(|| Ok(()));
        transport.expect_notify().returning(|_| Ok(()));
        transport.expect_request().returning(|req| {
            let result = match req.method.as_str() {
                METHOD_INITIALIZE => init_result(),
                METHOD_PROMPTS_GET => {
                    let params = req.params.clone().unwrap();
                    assert_eq!(params["name"], "greet");
                    assert_eq!(params["arguments"]["who"], "world");
                    json!({"messages": [{"role": "user", "content": {"type": "text", "text": "hi world"}}]})
                }
                other => panic!("unexpected {other}"),
            };
            Ok(JsonRpcResponse::success(req.id, result))
        });

        let session = session();
        session.connect_client(Arc::new(transport)).await.unwrap();
        let mut args = HashMap::new();
        args.insert("who".to_string(), "world".to_string());
        let prompt = session.get_prompt("greet", Some(args)).await.unwrap();
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].role, "user");
    }

    #[tokio::test]
    async fn test_detach_from_replaced_transport_is_noop() {
        let handshake = || {
            let mut transport = MockTransport::new();
            transport.expect_start().returning(|| Ok(()));
            transport.expect_notify().returning(|_| Ok(()));
            transport
                .expect_request()
                .returning(|req| Ok(JsonRpcResponse::success(req.id, init_result())));
            Arc::new(transport) as Arc<dyn Transport>
        };
        let old = handshake();
        let new = handshake();

        let session = session();
        session.connect_client(old.clone()).await.unwrap();
        session.connect_client(new.clone()).await.unwrap();

        session.detach_from(&old);
        assert!(session.server().is_some());
        assert!(session.current().is_ok());

        session.detach_from(&new);
        assert!(session.server().is_none());
        assert!(session.current().is_err());
    }

    #[test]
    fn test_list_changed_from_message() {
        assert_eq!(
            ListChanged::from_message(&json!({"method": NOTIFICATION_RESOURCES_CHANGED})),
            Some(ListChanged::Resources)
        );
        assert_eq!(
            ListChanged::from_message(&json!({"method": "notifications/message"})),
            None
        );
        assert_eq!(ListChanged::from_message(&json!({"id": 1})), None);
    }
}
