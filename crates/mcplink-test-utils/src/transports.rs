//! Scripted transports.
//!
//! A [`ServerScript`] says how a fake server answers each method. The
//! [`ScriptedTransportFactory`] hands out [`ScriptedTransport`]s driven by
//! those scripts and keeps every transport it built for later inspection.

use async_trait::async_trait;
use mcplink_client::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE,
    METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_RESOURCE_TEMPLATES_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
};
use mcplink_client::{
    McpError, McpResult, Transport, TransportEvents, TransportFactory, TransportKind,
    TransportParams,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A scripted failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// HTTP 401.
    Unauthorized,
    /// Transport-level failure.
    Network(String),
    /// JSON-RPC error response.
    Rpc(i64, String),
}

/// How a fake server answers.
#[derive(Debug, Clone)]
pub struct ServerScript {
    start: Option<ScriptedFailure>,
    start_gate: Option<Arc<Notify>>,
    answers: HashMap<String, Result<Value, ScriptedFailure>>,
}

impl ServerScript {
    /// A server with one `echo` tool, one resource, one prompt and no templates.
    pub fn healthy() -> Self {
        let mut answers = HashMap::new();
        answers.insert(
            METHOD_INITIALIZE.to_string(),
            Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
                "serverInfo": {"name": "scripted", "version": "1.0.0"}
            })),
        );
        answers.insert(
            METHOD_TOOLS_LIST.to_string(),
            Ok(json!({"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]})),
        );
        answers.insert(
            METHOD_RESOURCES_LIST.to_string(),
            Ok(json!({"resources": [{"uri": "file:///readme.md", "name": "readme"}]})),
        );
        answers.insert(
            METHOD_RESOURCE_TEMPLATES_LIST.to_string(),
            Ok(json!({"resourceTemplates": []})),
        );
        answers.insert(
            METHOD_PROMPTS_LIST.to_string(),
            Ok(json!({"prompts": [{"name": "greet"}]})),
        );
        answers.insert(
            METHOD_TOOLS_CALL.to_string(),
            Ok(json!({"content": [{"type": "text", "text": "echoed"}]})),
        );
        answers.insert(
            METHOD_RESOURCES_READ.to_string(),
            Ok(json!({"contents": [{"uri": "file:///readme.md", "text": "hello"}]})),
        );
        answers.insert(
            METHOD_PROMPTS_GET.to_string(),
            Ok(json!({"messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}]})),
        );
        Self {
            start: None,
            start_gate: None,
            answers,
        }
    }

    /// Answer `method` with `result`.
    pub fn with_result(mut self, method: &str, result: Value) -> Self {
        self.answers.insert(method.to_string(), Ok(result));
        self
    }

    /// Make `method` fail.
    pub fn with_failure(mut self, method: &str, failure: ScriptedFailure) -> Self {
        self.answers.insert(method.to_string(), Err(failure));
        self
    }

    /// Make `start()` fail before any request is sent.
    pub fn failing_start(mut self, failure: ScriptedFailure) -> Self {
        self.start = Some(failure);
        self
    }

    /// Hold `start()` until `gate` is notified.
    pub fn holding_start(mut self, gate: Arc<Notify>) -> Self {
        self.start_gate = Some(gate);
        self
    }

    /// Replace the tool list with tools of the given names.
    pub fn with_tools(self, names: &[&str]) -> Self {
        let tools: Vec<Value> = names.iter().map(|name| json!({"name": name})).collect();
        self.with_result(METHOD_TOOLS_LIST, json!({ "tools": tools }))
    }
}

impl Default for ServerScript {
    fn default() -> Self {
        Self::healthy()
    }
}

fn failure_error(failure: &ScriptedFailure) -> McpError {
    match failure {
        ScriptedFailure::Unauthorized => McpError::Unauthorized,
        ScriptedFailure::Network(message) => McpError::connection_failed(message.clone()),
        ScriptedFailure::Rpc(code, message) => McpError::Rpc {
            code: *code,
            message: message.clone(),
        },
    }
}

/// A transport answering from a [`ServerScript`].
#[derive(Debug)]
pub struct ScriptedTransport {
    kind: TransportKind,
    url: String,
    script: Mutex<ServerScript>,
    events: TransportEvents,
    requests: Mutex<Vec<String>>,
    starts: AtomicUsize,
    closes: AtomicUsize,
    connected: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind, script: ServerScript, params: TransportParams) -> Self {
        Self {
            kind,
            url: params.url,
            script: Mutex::new(script),
            events: params.events,
            requests: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Methods of every request and notification sent, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Change how this transport answers from now on.
    pub fn set_script(&self, script: ServerScript) {
        *self.script.lock().unwrap() = script;
    }

    /// Simulate the server dropping the connection.
    pub fn emit_close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.closed();
    }

    pub fn emit_message(&self, message: Value) {
        self.events.message(message);
    }

    pub fn emit_error(&self, error: &str) {
        self.events.error(error);
    }

    fn record(&self, method: &str) {
        self.requests.lock().unwrap().push(method.to_string());
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start(&self) -> McpResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (gate, failure) = {
            let script = self.script.lock().unwrap();
            (script.start_gate.clone(), script.start.clone())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(failure) = failure {
            return Err(failure_error(&failure));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        self.record(&request.method);
        let answer = self.script.lock().unwrap().answers.get(&request.method).cloned();
        match answer {
            Some(Ok(result)) => Ok(JsonRpcResponse::success(request.id, result)),
            Some(Err(ScriptedFailure::Rpc(code, message))) => {
                Ok(JsonRpcResponse::failure(request.id, code, message))
            }
            Some(Err(failure)) => Err(failure_error(&failure)),
            None => Ok(JsonRpcResponse::failure(
                request.id,
                -32601,
                format!("Method not found: {}", request.method),
            )),
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        self.record(&notification.method);
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.events.closed();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Builds [`ScriptedTransport`]s from per-kind script queues.
///
/// Each kind's scripts are used in order; the last one is reused once the
/// queue is down to a single entry. A kind without scripts fails to build.
#[derive(Debug, Default)]
pub struct ScriptedTransportFactory {
    scripts: Mutex<HashMap<TransportKind, VecDeque<ServerScript>>>,
    created: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `script` for the next transport of `kind`.
    pub fn with_script(self, kind: TransportKind, script: ServerScript) -> Self {
        self.push_script(kind, script);
        self
    }

    pub fn push_script(&self, kind: TransportKind, script: ServerScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(script);
    }

    /// Every transport built so far, oldest first.
    pub fn transports(&self) -> Vec<Arc<ScriptedTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Arc<ScriptedTransport>> {
        self.created.lock().unwrap().last().cloned()
    }

    pub fn created_kinds(&self) -> Vec<TransportKind> {
        self.transports().iter().map(|t| t.kind()).collect()
    }

    /// Requests sent across every transport.
    pub fn total_requests(&self) -> usize {
        self.transports().iter().map(|t| t.requests().len()).sum()
    }
}

impl TransportFactory for ScriptedTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        params: TransportParams,
    ) -> McpResult<Arc<dyn Transport>> {
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts
                .get_mut(&kind)
                .filter(|queue| !queue.is_empty())
                .ok_or_else(|| McpError::construction(format!("no script for {kind}")))?;
            if queue.len() > 1 {
                queue.pop_front().unwrap_or_default()
            } else {
                queue.front().cloned().unwrap_or_default()
            }
        };

        let transport = Arc::new(ScriptedTransport::new(kind, script, params));
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> TransportParams {
        TransportParams {
            url: "http://scripted/mcp".to_string(),
            headers: HashMap::new(),
            auth: None,
            request_timeout: Duration::from_secs(1),
            events: TransportEvents::detached(),
        }
    }

    #[tokio::test]
    async fn test_scripted_answers() {
        let transport = ScriptedTransport::new(
            TransportKind::Http,
            ServerScript::healthy().with_failure(METHOD_PROMPTS_LIST, ScriptedFailure::Rpc(-32601, "nope".into())),
            params(),
        );
        transport.start().await.unwrap();

        let tools = transport
            .request(JsonRpcRequest::new(1, METHOD_TOOLS_LIST, None))
            .await
            .unwrap();
        assert_eq!(tools.result.unwrap()["tools"][0]["name"], "echo");

        let prompts = transport
            .request(JsonRpcRequest::new(2, METHOD_PROMPTS_LIST, None))
            .await
            .unwrap();
        assert_eq!(prompts.error.unwrap().code, -32601);
        assert_eq!(transport.requests(), vec![METHOD_TOOLS_LIST, METHOD_PROMPTS_LIST]);
    }

    #[test]
    fn test_factory_queue() {
        let factory = ScriptedTransportFactory::new()
            .with_script(
                TransportKind::Http,
                ServerScript::healthy().failing_start(ScriptedFailure::Unauthorized),
            )
            .with_script(TransportKind::Http, ServerScript::healthy());

        for _ in 0..3 {
            factory.create(TransportKind::Http, params()).unwrap();
        }
        assert!(factory.create(TransportKind::Sse, params()).is_err());

        let transports = factory.transports();
        assert_eq!(transports.len(), 3);
        assert!(transports[0].script.lock().unwrap().start.is_some());
        assert!(transports[2].script.lock().unwrap().start.is_none());
    }
}
