//! Connection state and the published snapshot.

use crate::protocol::{Prompt, Resource, ResourceTemplate, Tool};
use crate::transport::TransportKind;
use mcplink_util::LogEntry;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Discovering,
    PendingAuth,
    Authenticating,
    Connecting,
    Loading,
    Ready,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Discovering => "discovering",
            ConnectionState::PendingAuth => "pending_auth",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Loading => "loading",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        }
    }

    /// `ready` and `failed` end an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable view of a connection, republished on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    /// Transport kind of the current or last attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    pub log: Vec<LogEntry>,
}

impl SessionSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }
}
