//! Connection state machine.
//!
//! All mutable state of a connection lives in [`Core`] behind one mutex that
//! is never held across an await. Every await point in a connect sequence is
//! followed by an epoch check: `disconnect` and `shutdown` bump the epoch, so
//! completions belonging to a superseded attempt are dropped.

use crate::config::ConnectionOptions;
use crate::coordinator::AuthFlowCoordinator;
use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolResult, GetPromptResult, IncomingMessage, Prompt, ReadResourceResult, Resource,
    ResourceTemplate, Tool,
};
use crate::session::{ListChanged, ProtocolSession};
use crate::snapshot::{ConnectionState, SessionSnapshot};
use crate::transport::{Transport, TransportEvent, TransportKind, TransportSelector};
use futures::future::BoxFuture;
use futures::FutureExt;
use mcplink_auth::{AuthOutcome, AuthSignal};
use mcplink_util::{LogLevel, SessionLog, TimerSlot};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

const TRANSITION_CAPACITY: usize = 64;

/// Mutable state of one connection.
#[derive(Debug, Default)]
struct Core {
    state: ConnectionState,
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    resource_templates: Vec<ResourceTemplate>,
    prompts: Vec<Prompt>,
    error: Option<String>,
    auth_url: Option<String>,
    transport: Option<TransportKind>,
    /// In-flight guard for top-level connect sequences.
    connecting: bool,
    /// Top-level connect calls so far.
    attempt: u64,
    epoch: u64,
    /// Kind of the last successful connection.
    last_kind: Option<TransportKind>,
    /// Kind to try first on the next attempt, set when auth interrupts one.
    resume_kind: Option<TransportKind>,
    auto_retry: TimerSlot,
    auto_reconnect: TimerSlot,
    auth_timeout: TimerSlot,
}

impl Core {
    fn clear_lists(&mut self) {
        self.tools.clear();
        self.resources.clear();
        self.resource_templates.clear();
        self.prompts.clear();
    }

    fn cancel_timers(&mut self) {
        self.auto_retry.cancel();
        self.auto_reconnect.cancel();
        self.auth_timeout.cancel();
    }

    fn snapshot(&self, log: &SessionLog) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            tools: self.tools.clone(),
            resources: self.resources.clone(),
            resource_templates: self.resource_templates.clone(),
            prompts: self.prompts.clone(),
            error: self.error.clone(),
            auth_url: self.auth_url.clone(),
            transport: self.transport,
            log: log.entries(),
        }
    }
}

/// How a top-level connect sequence begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptMode {
    /// Start from `discovering` with empty lists.
    Fresh,
    /// Re-establish a dropped connection; lists stay visible until refreshed.
    Reconnect,
}

/// How one pass over the transport plan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptEnd {
    /// Reached a state that needs no further work from this call.
    Done,
    /// Authorization succeeded directly; run the plan again.
    Reauthorized,
    /// A completion signal moved us back to `discovering` mid-flow.
    Resume,
}

enum Refreshed {
    Tools(Vec<Tool>),
    Resources(Vec<Resource>, Option<Vec<ResourceTemplate>>),
    Prompts(Vec<Prompt>),
}

enum KindResult {
    Ready,
    Stale,
    Failed(McpError),
}

/// Shared state of a connection. Owned by [`crate::McpConnection`].
pub(crate) struct Inner {
    options: ConnectionOptions,
    log: Arc<SessionLog>,
    selector: TransportSelector,
    session: ProtocolSession,
    coordinator: AuthFlowCoordinator,
    core: Mutex<Core>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    transitions: broadcast::Sender<ConnectionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    /// Build the connection and spawn its event and callback listeners.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        options: ConnectionOptions,
        log: Arc<SessionLog>,
        selector: TransportSelector,
        events_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
        coordinator: AuthFlowCoordinator,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let session = ProtocolSession::new(options.client_config.clone());
        let subscription = coordinator.subscribe();

        let inner = Arc::new(Self {
            options,
            log,
            selector,
            session,
            coordinator,
            core: Mutex::new(Core::default()),
            snapshot_tx,
            transitions,
            tasks: Mutex::new(Vec::new()),
        });

        let events_task = tokio::spawn(event_loop(Arc::downgrade(&inner), events_rx));
        let callback_task = tokio::spawn(callback_loop(Arc::downgrade(&inner), subscription));
        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([events_task, callback_task]);
        inner
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_mounted(&self) -> bool {
        self.log.is_mounted()
    }

    /// Whether an attempt started at `epoch` may still act.
    fn is_current(&self, epoch: u64) -> bool {
        self.is_mounted() && self.lock().epoch == epoch
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot(&self.log)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub(crate) fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    pub(crate) fn coordinator(&self) -> &AuthFlowCoordinator {
        &self.coordinator
    }

    fn publish_locked(&self, core: &Core) {
        self.snapshot_tx.send_replace(core.snapshot(&self.log));
    }

    /// Append to the session log while holding the core lock.
    fn log_locked(&self, core: &Core, level: LogLevel, message: impl Into<String>) {
        if self.log.log(level, message) {
            self.publish_locked(core);
        }
    }

    /// Append to the session log. Must not be called with the core lock held.
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        if self.log.log(level, message) {
            let core = self.lock();
            self.publish_locked(&core);
        }
    }

    fn set_state_locked(self: &Arc<Self>, core: &mut Core, state: ConnectionState) {
        let previous = core.state;
        core.state = state;

        if state != ConnectionState::Failed {
            core.auto_retry.cancel();
        }
        if previous == ConnectionState::Authenticating && state != ConnectionState::Authenticating
        {
            core.auth_timeout.cancel();
        }
        match state {
            ConnectionState::Discovering => {
                core.clear_lists();
                core.error = None;
                core.auth_url = None;
            }
            ConnectionState::Ready => {
                core.error = None;
                core.auth_url = None;
            }
            ConnectionState::Failed => self.schedule_auto_retry(core),
            _ => {}
        }

        debug!(from = %previous, to = %state, "Connection state changed");
        self.log.log(
            LogLevel::Debug,
            format!("State changed: {previous} -> {state}"),
        );
        self.publish_locked(core);
        let _ = self.transitions.send(state);
    }

    fn set_state(self: &Arc<Self>, state: ConnectionState) {
        let mut core = self.lock();
        self.set_state_locked(&mut core, state);
    }

    fn fail_locked(self: &Arc<Self>, core: &mut Core, message: String, auth_url: Option<String>) {
        if auth_url.is_some() {
            core.auth_url = auth_url;
        }
        core.error = Some(message.clone());
        self.log.log(LogLevel::Error, message);
        self.set_state_locked(core, ConnectionState::Failed);
    }

    /// Fail the attempt started at `epoch`, if it is still current.
    fn fail(self: &Arc<Self>, epoch: u64, message: String, auth_url: Option<String>) {
        if !self.is_mounted() {
            return;
        }
        let mut core = self.lock();
        if core.epoch != epoch {
            return;
        }
        self.fail_locked(&mut core, message, auth_url);
    }

    fn schedule_auto_retry(self: &Arc<Self>, core: &mut Core) {
        let Some(delay) = self.options.auto_retry_delay() else {
            return;
        };
        if core.attempt == 0 {
            return;
        }
        let weak = Arc::downgrade(self);
        core.auto_retry.schedule(delay, move |token| async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_auto_retry(token).await;
            }
        });
        self.log_locked(
            core,
            LogLevel::Info,
            format!("Retrying in {}ms", delay.as_millis()),
        );
    }

    fn on_auto_retry(self: Arc<Self>, token: u64) -> BoxFuture<'static, ()> {
        async move {
            {
                let mut core = self.lock();
                if !core.auto_retry.disarm(token) || core.state != ConnectionState::Failed {
                    return;
                }
            }
            if !self.is_mounted() {
                return;
            }
            self.log(LogLevel::Info, "Auto-retrying connection");
            self.retry().await;
        }
        .boxed()
    }

    fn arm_auth_timeout(self: &Arc<Self>, core: &mut Core) {
        let weak = Arc::downgrade(self);
        core.auth_timeout
            .schedule(self.coordinator.timeout(), move |token| async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_auth_timeout(token).await;
                }
            });
    }

    async fn on_auth_timeout(self: Arc<Self>, token: u64) {
        let epoch = {
            let mut core = self.lock();
            if !core.auth_timeout.disarm(token) || core.state != ConnectionState::Authenticating {
                return;
            }
            core.epoch
        };
        let url = self.coordinator.last_url().await;
        let still_waiting = self.state() == ConnectionState::Authenticating;
        if still_waiting {
            self.fail(
                epoch,
                format!(
                    "Authentication timed out after {}s",
                    self.coordinator.timeout().as_secs()
                ),
                url,
            );
        }
    }

    fn connect_boxed(self: Arc<Self>, mode: AttemptMode) -> BoxFuture<'static, ()> {
        async move { self.connect_with(mode).await }.boxed()
    }

    /// Top-level connect. Dropped (not queued) if one is already in flight.
    pub(crate) async fn connect(self: &Arc<Self>) {
        self.connect_with(AttemptMode::Fresh).await;
    }

    async fn connect_with(self: &Arc<Self>, mode: AttemptMode) {
        if !self.is_mounted() {
            return;
        }
        let epoch = {
            let mut core = self.lock();
            if core.connecting {
                self.log_locked(
                    &core,
                    LogLevel::Debug,
                    "Connection attempt already in progress",
                );
                return;
            }
            core.connecting = true;
            core.attempt += 1;
            core.epoch
        };

        let mut mode = mode;
        let mut reauthorized = false;
        loop {
            match self.run_attempt(epoch, mode, !reauthorized).await {
                AttemptEnd::Done => break,
                AttemptEnd::Reauthorized => reauthorized = true,
                AttemptEnd::Resume => {}
            }
            mode = AttemptMode::Fresh;
        }

        let mut core = self.lock();
        if core.epoch == epoch {
            core.connecting = false;
        }
    }

    async fn run_attempt(
        self: &Arc<Self>,
        epoch: u64,
        mode: AttemptMode,
        reauth_allowed: bool,
    ) -> AttemptEnd {
        let plan = {
            let mut core = self.lock();
            if core.epoch != epoch {
                return AttemptEnd::Done;
            }
            if core.state == ConnectionState::Authenticating {
                self.log_locked(
                    &core,
                    LogLevel::Debug,
                    "Authentication in progress, not connecting",
                );
                return AttemptEnd::Done;
            }
            if mode == AttemptMode::Fresh {
                if core.state == ConnectionState::Discovering {
                    core.clear_lists();
                    self.publish_locked(&core);
                } else {
                    self.set_state_locked(&mut core, ConnectionState::Discovering);
                }
            }
            let first = core.resume_kind.take().or(core.last_kind);
            self.options.transport_type.plan(first)
        };

        for (index, kind) in plan.iter().copied().enumerate() {
            let error = match self.try_kind(epoch, kind).await {
                KindResult::Ready | KindResult::Stale => return AttemptEnd::Done,
                KindResult::Failed(error) => error,
            };
            if !self.is_current(epoch) {
                return AttemptEnd::Done;
            }

            if error.is_auth_error() {
                return self.on_auth_required(epoch, kind, error, reauth_allowed).await;
            }

            match plan.get(index + 1) {
                Some(next) => self.log(
                    LogLevel::Warn,
                    format!(
                        "{} transport failed, falling back to {}: {error}",
                        kind.label(),
                        next.label()
                    ),
                ),
                None => {
                    self.fail(
                        epoch,
                        format!("Failed to connect via {}: {error}", kind.label()),
                        None,
                    );
                    return AttemptEnd::Done;
                }
            }
        }
        AttemptEnd::Done
    }

    /// One transport attempt: create, handshake, load capability lists.
    async fn try_kind(self: &Arc<Self>, epoch: u64, kind: TransportKind) -> KindResult {
        {
            let mut core = self.lock();
            if core.epoch != epoch {
                return KindResult::Stale;
            }
            core.transport = Some(kind);
            self.set_state_locked(&mut core, ConnectionState::Connecting);
        }
        self.log(
            LogLevel::Info,
            format!("Connecting to {} via {}", self.options.url, kind.label()),
        );

        let (generation, transport) = match self
            .selector
            .create_transport(
                kind,
                &self.options.url,
                Some(self.coordinator.provider().clone()),
                &self.options.custom_headers,
                self.options.request_timeout(),
            )
            .await
        {
            Ok(created) => created,
            Err(error) => {
                if self.is_current(epoch) {
                    self.session.detach();
                }
                return KindResult::Failed(error);
            }
        };

        let result = self.establish(epoch, kind, &transport).await;
        if !matches!(result, Ok(true)) {
            // A newer attempt may own the selector by now.
            self.session.detach_from(&transport);
            self.selector.close_generation(generation).await;
        }
        match result {
            Ok(true) => KindResult::Ready,
            Ok(false) => KindResult::Stale,
            Err(error) => KindResult::Failed(error),
        }
    }

    /// Handshake and load capability lists. `Ok(false)` when the attempt was
    /// superseded along the way.
    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        kind: TransportKind,
        transport: &Arc<dyn Transport>,
    ) -> McpResult<bool> {
        if !self.is_current(epoch) {
            return Ok(false);
        }

        self.session.connect_client(transport.clone()).await?;
        {
            let mut core = self.lock();
            if core.epoch != epoch || !self.is_mounted() {
                return Ok(false);
            }
            self.set_state_locked(&mut core, ConnectionState::Loading);
        }

        let tools = self.session.list_tools().await?;
        let resources = self.optional_list("resources", self.session.list_resources().await);
        let resource_templates = self.optional_list(
            "resource templates",
            self.session.list_resource_templates().await,
        );
        let prompts = self.optional_list("prompts", self.session.list_prompts().await);

        let mut core = self.lock();
        if core.epoch != epoch || !self.is_mounted() {
            return Ok(false);
        }
        core.tools = tools;
        core.resources = resources;
        core.resource_templates = resource_templates;
        core.prompts = prompts;
        core.last_kind = Some(kind);
        self.set_state_locked(&mut core, ConnectionState::Ready);
        let message = format!(
            "Connected via {} ({} tools, {} resources, {} prompts)",
            kind.label(),
            core.tools.len(),
            core.resources.len(),
            core.prompts.len()
        );
        self.log_locked(&core, LogLevel::Info, message);
        Ok(true)
    }

    /// Optional capability lists degrade to empty on failure.
    fn optional_list<T>(&self, what: &str, result: McpResult<Vec<T>>) -> Vec<T> {
        result.unwrap_or_else(|e| {
            self.log(
                LogLevel::Debug,
                format!("Server does not support listing {what}: {e}"),
            );
            Vec::new()
        })
    }

    async fn on_auth_required(
        self: &Arc<Self>,
        epoch: u64,
        kind: TransportKind,
        error: McpError,
        reauth_allowed: bool,
    ) -> AttemptEnd {
        if !reauth_allowed {
            let url = self.coordinator.last_url().await;
            self.fail(
                epoch,
                format!("Authentication failed: server rejected new credentials ({error})"),
                url,
            );
            return AttemptEnd::Done;
        }

        self.log(
            LogLevel::Info,
            format!("Authentication required for {}: {error}", kind.label()),
        );
        self.lock().resume_kind = Some(kind);

        if self.options.prevent_auto_auth {
            self.await_manual_auth(epoch).await;
            return AttemptEnd::Done;
        }
        self.begin_authentication(epoch).await
    }

    /// Stop at `pending_auth` with a URL the user can open.
    async fn await_manual_auth(self: &Arc<Self>, epoch: u64) {
        let url = self.coordinator.manual_url().await;
        if !self.is_current(epoch) {
            return;
        }
        match url {
            Ok(url) => {
                let mut core = self.lock();
                core.auth_url = Some(url);
                self.set_state_locked(&mut core, ConnectionState::PendingAuth);
                self.log_locked(
                    &core,
                    LogLevel::Info,
                    "Authentication required; open the authorization URL to continue",
                );
            }
            Err(e) => self.fail(
                epoch,
                format!("Failed to prepare authorization URL: {e}"),
                None,
            ),
        }
    }

    /// Enter `authenticating`, arm the timeout and run the coordinator.
    async fn begin_authentication(self: &Arc<Self>, epoch: u64) -> AttemptEnd {
        {
            let mut core = self.lock();
            if core.epoch != epoch {
                return AttemptEnd::Done;
            }
            self.set_state_locked(&mut core, ConnectionState::Authenticating);
            self.arm_auth_timeout(&mut core);
        }

        let outcome = self.coordinator.run_auth().await;
        if !self.is_current(epoch) {
            return AttemptEnd::Done;
        }
        match self.state() {
            ConnectionState::Authenticating => {}
            ConnectionState::Discovering => return AttemptEnd::Resume,
            _ => return AttemptEnd::Done,
        }

        match outcome {
            Ok(AuthOutcome::Authorized) => {
                self.log(LogLevel::Info, "Authorization succeeded, reconnecting");
                self.set_state(ConnectionState::Discovering);
                AttemptEnd::Reauthorized
            }
            Ok(AuthOutcome::Redirect) => {
                let url = self.coordinator.last_url().await;
                let mut core = self.lock();
                if core.epoch == epoch && core.state == ConnectionState::Authenticating {
                    core.auth_url = url;
                    self.publish_locked(&core);
                    self.log_locked(
                        &core,
                        LogLevel::Info,
                        "Waiting for authorization to complete",
                    );
                }
                AttemptEnd::Done
            }
            Err(e) => {
                let url = self.coordinator.last_url().await;
                self.fail(epoch, format!("Authentication failed: {e}"), url);
                AttemptEnd::Done
            }
        }
    }

    /// Act on an out-of-band completion signal.
    ///
    /// Accepted while `authenticating` and while `pending_auth`, where the
    /// user may complete the manual URL on their own.
    pub(crate) async fn on_auth_signal(self: &Arc<Self>, signal: AuthSignal) {
        let epoch = {
            let core = self.lock();
            if !awaits_authorization(core.state) {
                self.log_locked(
                    &core,
                    LogLevel::Debug,
                    format!("Ignoring authorization callback in state {}", core.state),
                );
                return;
            }
            core.epoch
        };

        match signal {
            AuthSignal::Success => {
                self.log(LogLevel::Info, "Authorization completed");
                {
                    let mut core = self.lock();
                    if core.epoch != epoch || !awaits_authorization(core.state) {
                        return;
                    }
                    self.set_state_locked(&mut core, ConnectionState::Discovering);
                }
                tokio::spawn(self.clone().connect_boxed(AttemptMode::Fresh));
            }
            AuthSignal::Failure { reason } => {
                let url = self.coordinator.last_url().await;
                if awaits_authorization(self.state()) {
                    self.fail(epoch, format!("Authentication failed: {reason}"), url);
                }
            }
        }
    }

    pub(crate) async fn on_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        if generation != self.selector.generation() {
            debug!(generation, "Ignoring event from replaced transport");
            return;
        }
        match event {
            TransportEvent::Message(message) => self.on_server_message(message),
            TransportEvent::Error(message) => self.on_transport_error(message),
            TransportEvent::Closed => self.on_transport_closed(),
        }
    }

    fn on_server_message(self: &Arc<Self>, message: Value) {
        if let Some(list) = ListChanged::from_message(&message) {
            if self.state() == ConnectionState::Ready {
                let inner = self.clone();
                tokio::spawn(async move { inner.refresh_list(list).await });
            }
            return;
        }
        match IncomingMessage::classify(message) {
            Some(IncomingMessage::Request { method, .. }) => self.log(
                LogLevel::Debug,
                format!("Ignoring server request {method}"),
            ),
            Some(IncomingMessage::Notification(notification)) => self.log(
                LogLevel::Debug,
                format!("Server notification {}", notification.method),
            ),
            _ => debug!("Ignoring unrecognised server message"),
        }
    }

    async fn refresh_list(self: &Arc<Self>, list: ListChanged) {
        let epoch = self.lock().epoch;
        let refreshed = match list {
            ListChanged::Tools => self.session.list_tools().await.map(Refreshed::Tools),
            ListChanged::Resources => {
                let resources = self.session.list_resources().await;
                let templates = self.session.list_resource_templates().await.ok();
                resources.map(|resources| Refreshed::Resources(resources, templates))
            }
            ListChanged::Prompts => self.session.list_prompts().await.map(Refreshed::Prompts),
        };
        let refreshed = match refreshed {
            Ok(refreshed) => refreshed,
            Err(e) => {
                self.log(LogLevel::Warn, format!("Failed to refresh {list:?} list: {e}"));
                return;
            }
        };

        let mut core = self.lock();
        if core.epoch != epoch || core.state != ConnectionState::Ready || !self.is_mounted() {
            return;
        }
        match refreshed {
            Refreshed::Tools(tools) => core.tools = tools,
            Refreshed::Resources(resources, templates) => {
                core.resources = resources;
                if let Some(templates) = templates {
                    core.resource_templates = templates;
                }
            }
            Refreshed::Prompts(prompts) => core.prompts = prompts,
        }
        self.publish_locked(&core);
        self.log_locked(&core, LogLevel::Debug, format!("Refreshed {list:?} list"));
    }

    fn on_transport_error(self: &Arc<Self>, message: String) {
        let mut core = self.lock();
        if !self.is_mounted() {
            return;
        }
        if core.connecting || core.state != ConnectionState::Ready {
            self.log_locked(&core, LogLevel::Warn, format!("Transport error: {message}"));
            return;
        }
        self.fail_locked(&mut core, format!("Connection error: {message}"), None);
    }

    fn on_transport_closed(self: &Arc<Self>) {
        let mut core = self.lock();
        if !self.is_mounted() || core.connecting {
            return;
        }
        match core.state {
            ConnectionState::Ready => match self.options.auto_reconnect_delay() {
                Some(delay) => {
                    self.log_locked(
                        &core,
                        LogLevel::Info,
                        format!("Connection closed, reconnecting in {}ms", delay.as_millis()),
                    );
                    let weak = Arc::downgrade(self);
                    core.auto_reconnect.schedule(delay, move |token| async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_auto_reconnect(token).await;
                        }
                    });
                }
                None => self.fail_locked(&mut core, "Connection closed".to_string(), None),
            },
            ConnectionState::Failed
            | ConnectionState::Authenticating
            | ConnectionState::PendingAuth => {
                debug!(state = %core.state, "Ignoring transport close");
            }
            _ => self.fail_locked(&mut core, "Cannot connect to server".to_string(), None),
        }
    }

    fn on_auto_reconnect(self: Arc<Self>, token: u64) -> BoxFuture<'static, ()> {
        async move {
            {
                let mut core = self.lock();
                if !core.auto_reconnect.disarm(token) || core.state != ConnectionState::Ready {
                    return;
                }
            }
            self.log(LogLevel::Info, "Reconnecting");
            self.connect_boxed(AttemptMode::Reconnect).await;
        }
        .boxed()
    }

    fn ensure_ready(&self) -> McpResult<()> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(McpError::NotReady { state });
        }
        Ok(())
    }

    /// Start re-authentication when a request was rejected as unauthorized.
    ///
    /// The original result is returned either way.
    async fn after_request<T>(self: &Arc<Self>, result: McpResult<T>) -> McpResult<T> {
        if let Err(e) = &result {
            if e.is_auth_error() {
                self.reauthenticate(e).await;
            }
        }
        result
    }

    async fn reauthenticate(self: &Arc<Self>, error: &McpError) {
        let epoch = {
            let mut core = self.lock();
            if core.state != ConnectionState::Ready {
                return;
            }
            core.resume_kind = core.last_kind;
            core.epoch
        };
        self.log(
            LogLevel::Warn,
            format!("Request rejected ({error}), re-authenticating"),
        );

        if self.options.prevent_auto_auth {
            self.await_manual_auth(epoch).await;
            return;
        }
        match self.begin_authentication(epoch).await {
            AttemptEnd::Reauthorized | AttemptEnd::Resume => {
                tokio::spawn(self.clone().connect_boxed(AttemptMode::Fresh));
            }
            AttemptEnd::Done => {}
        }
    }

    pub(crate) async fn call_tool(
        self: &Arc<Self>,
        name: &str,
        arguments: Option<Value>,
    ) -> McpResult<CallToolResult> {
        self.ensure_ready()?;
        let result = self.session.call_tool(name, arguments).await;
        self.after_request(result).await
    }

    pub(crate) async fn list_resources(self: &Arc<Self>) -> McpResult<Vec<Resource>> {
        self.ensure_ready()?;
        let result = self.session.list_resources().await;
        if let Ok(resources) = &result {
            let mut core = self.lock();
            core.resources = resources.clone();
            self.publish_locked(&core);
        }
        self.after_request(result).await
    }

    pub(crate) async fn read_resource(self: &Arc<Self>, uri: &str) -> McpResult<ReadResourceResult> {
        self.ensure_ready()?;
        let result = self.session.read_resource(uri).await;
        self.after_request(result).await
    }

    pub(crate) async fn list_prompts(self: &Arc<Self>) -> McpResult<Vec<Prompt>> {
        self.ensure_ready()?;
        let result = self.session.list_prompts().await;
        if let Ok(prompts) = &result {
            let mut core = self.lock();
            core.prompts = prompts.clone();
            self.publish_locked(&core);
        }
        self.after_request(result).await
    }

    pub(crate) async fn get_prompt(
        self: &Arc<Self>,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        self.ensure_ready()?;
        let result = self.session.get_prompt(name, arguments).await;
        self.after_request(result).await
    }

    /// Manual retry. Only acts from `failed`.
    pub(crate) async fn retry(self: &Arc<Self>) {
        {
            let mut core = self.lock();
            if core.state != ConnectionState::Failed {
                let message = format!("Retry ignored: not in failed state (current: {})", core.state);
                self.log_locked(&core, LogLevel::Warn, message);
                return;
            }
            self.set_state_locked(&mut core, ConnectionState::Discovering);
        }
        self.log(LogLevel::Info, "Retrying connection");
        self.connect().await;
    }

    pub(crate) async fn disconnect(self: &Arc<Self>) {
        {
            let mut core = self.lock();
            core.cancel_timers();
            core.epoch += 1;
            core.connecting = false;
            core.transport = None;
            core.last_kind = None;
            core.resume_kind = None;
            self.set_state_locked(&mut core, ConnectionState::Discovering);
        }
        self.session.detach();
        self.selector.close_active().await;
        self.log(LogLevel::Info, "Disconnected");
    }

    pub(crate) async fn authenticate(self: &Arc<Self>) {
        let (state, epoch) = {
            let core = self.lock();
            (core.state, core.epoch)
        };
        match state {
            ConnectionState::Failed => self.retry().await,
            ConnectionState::PendingAuth => match self.begin_authentication(epoch).await {
                AttemptEnd::Reauthorized | AttemptEnd::Resume => self.connect().await,
                AttemptEnd::Done => {}
            },
            ConnectionState::Authenticating => {
                self.log(LogLevel::Info, "Authentication already in progress")
            }
            ConnectionState::Ready => self.log(
                LogLevel::Warn,
                "Already connected; authenticate() has nothing to do",
            ),
            _ => self.connect().await,
        }
    }

    pub(crate) async fn clear_storage(self: &Arc<Self>) -> McpResult<usize> {
        let removed = self.coordinator.provider().clear_storage().await?;
        self.log(
            LogLevel::Info,
            format!("Cleared {removed} authorization storage entries"),
        );
        {
            let mut core = self.lock();
            core.auth_url = None;
            self.publish_locked(&core);
        }
        self.disconnect().await;
        Ok(removed)
    }

    /// Unmount: later completions are dropped and nothing is logged.
    pub(crate) async fn shutdown(self: &Arc<Self>) {
        self.disconnect().await;
        self.log.set_mounted(false);
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("url", &self.options.url)
            .field("state", &self.state())
            .finish()
    }
}

fn awaits_authorization(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::Authenticating | ConnectionState::PendingAuth
    )
}

async fn event_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
) {
    while let Some((generation, event)) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_transport_event(generation, event).await;
    }
}

async fn callback_loop(inner: Weak<Inner>, mut subscription: mcplink_auth::CallbackSubscription) {
    while let Some(signal) = subscription.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_auth_signal(signal).await;
    }
    debug!("Authorization callback channel closed");
}
