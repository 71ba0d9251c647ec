//! Cross-context delivery of authorization completion messages.
//!
//! Whoever finishes an authorization (the loopback [`CallbackServer`], a
//! browser bridge, a test) posts a [`CallbackEnvelope`] on a
//! [`CallbackChannel`]. Each connection holds a [`CallbackSubscription`] that
//! only accepts envelopes from trusted origins whose payload has the
//! completion message shape, and turns them into an [`AuthSignal`].
//!
//! [`CallbackServer`]: crate::server::CallbackServer

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

/// Value of the `type` field of a completion message.
pub const CALLBACK_MESSAGE_TYPE: &str = "mcp_auth_callback";

const DEFAULT_CAPACITY: usize = 32;

/// Completion message: `{ "type": "mcp_auth_callback", "success": bool, "error"?: string }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallbackMessage {
    pub fn success() -> Self {
        Self {
            message_type: CALLBACK_MESSAGE_TYPE.to_string(),
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            message_type: CALLBACK_MESSAGE_TYPE.to_string(),
            success: false,
            error: Some(error.into()),
        }
    }

    /// Parse a raw payload. Anything that is not a completion message is `None`.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        let message: Self = serde_json::from_value(payload.clone()).ok()?;
        (message.message_type == CALLBACK_MESSAGE_TYPE).then_some(message)
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Outcome of an out-of-band authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSignal {
    Success,
    Failure { reason: String },
}

impl From<CallbackMessage> for AuthSignal {
    fn from(message: CallbackMessage) -> Self {
        if message.success {
            AuthSignal::Success
        } else {
            AuthSignal::Failure {
                reason: message
                    .error
                    .unwrap_or_else(|| "Authentication failed".to_string()),
            }
        }
    }
}

/// A message as posted by some context, tagged with that context's origin.
#[derive(Debug, Clone)]
pub struct CallbackEnvelope {
    pub origin: String,
    pub payload: serde_json::Value,
}

/// Which origins may deliver completion messages.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    host_origin: String,
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Accept the host origin plus every origin in `allowed`.
    pub fn new(host_origin: &str, allowed: &[String]) -> Self {
        Self {
            host_origin: normalize_origin(host_origin),
            allowed: allowed.iter().map(|o| normalize_origin(o)).collect(),
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        let origin = normalize_origin(origin);
        origin == self.host_origin || self.allowed.iter().any(|a| *a == origin)
    }
}

/// Reduce `scheme://host:port/path` to its origin; unparsable input is
/// compared verbatim, minus a trailing slash.
fn normalize_origin(origin: &str) -> String {
    match Url::parse(origin) {
        Ok(url) if url.origin().is_tuple() => url.origin().ascii_serialization(),
        _ => origin.trim_end_matches('/').to_string(),
    }
}

/// In-process stand-in for cross-window messaging.
#[derive(Debug, Clone)]
pub struct CallbackChannel {
    tx: broadcast::Sender<CallbackEnvelope>,
}

impl CallbackChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Post a raw payload. Returns the number of subscribers it reached.
    pub fn post(&self, origin: impl Into<String>, payload: serde_json::Value) -> usize {
        self.tx
            .send(CallbackEnvelope {
                origin: origin.into(),
                payload,
            })
            .unwrap_or(0)
    }

    /// Post a completion message.
    pub fn post_message(&self, origin: impl Into<String>, message: &CallbackMessage) -> usize {
        self.post(origin, message.to_payload())
    }

    /// Listen for completion messages accepted by `policy`.
    pub fn subscribe(&self, policy: OriginPolicy) -> CallbackSubscription {
        CallbackSubscription {
            rx: self.tx.subscribe(),
            policy,
        }
    }
}

impl Default for CallbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// A filtered view of a [`CallbackChannel`].
#[derive(Debug)]
pub struct CallbackSubscription {
    rx: broadcast::Receiver<CallbackEnvelope>,
    policy: OriginPolicy,
}

impl CallbackSubscription {
    /// Wait for the next accepted signal. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<AuthSignal> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if let Some(signal) = self.accept(&envelope) {
                        return Some(signal);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Callback subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&self, envelope: &CallbackEnvelope) -> Option<AuthSignal> {
        if !self.policy.allows(&envelope.origin) {
            debug!(origin = %envelope.origin, "Ignoring callback message from untrusted origin");
            return None;
        }
        CallbackMessage::from_payload(&envelope.payload).map(AuthSignal::from)
    }
}
