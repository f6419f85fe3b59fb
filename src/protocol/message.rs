//! DevTools protocol wire frames.
//!
//! Three frame shapes travel over the primary WebSocket:
//!
//! | Frame | Direction | Discriminator |
//! |-------|-----------|---------------|
//! | [`CdpCommand`] | local → browser | has `id` and `method` |
//! | [`CdpResponse`] | browser → local | has `id`, no `method` |
//! | [`CdpEvent`] | browser → local | has `method`, no `id` |
//!
//! Commands addressed to a sub-session carry a `sessionId` field; the
//! browser routes them to the attached target (flattened session mode).

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::identifiers::{RequestId, SessionId};

// ============================================================================
// CdpCommand
// ============================================================================

/// An outbound protocol command.
///
/// # Format
///
/// ```json
/// { "id": 7, "method": "Target.getTargets", "params": {}, "sessionId": "..." }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct CdpCommand {
    /// Correlation ID, unique per connection.
    pub id: RequestId,

    /// Method in `Domain.method` format.
    pub method: String,

    /// Method parameters.
    pub params: Value,

    /// Sub-session to route to; `None` targets the browser itself.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl CdpCommand {
    /// Creates a browser-level command with a fresh correlation ID.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: RequestId::next(),
            method: method.into(),
            params,
            session_id: None,
        }
    }

    /// Creates a command with no parameters.
    #[inline]
    #[must_use]
    pub fn simple(method: impl Into<String>) -> Self {
        Self::new(method, json!({}))
    }

    /// Routes this command to a sub-session.
    #[inline]
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

// ============================================================================
// CdpResponse
// ============================================================================

/// Protocol-level error payload inside a response.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpErrorPayload {
    /// Numeric protocol error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// A response to a [`CdpCommand`], correlated by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpResponse {
    /// Correlation ID matching the originating command.
    pub id: RequestId,

    /// Success payload.
    #[serde(default)]
    pub result: Option<Value>,

    /// Failure payload.
    #[serde(default)]
    pub error: Option<CdpErrorPayload>,

    /// Sub-session the response came from, if any.
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

impl CdpResponse {
    /// Unwraps the success payload or converts the protocol error.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the browser reported an error.
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(Error::protocol(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ============================================================================
// CdpEvent
// ============================================================================

/// An unsolicited notification from the browser.
///
/// # Format
///
/// ```json
/// { "method": "Target.targetCreated", "params": { ... }, "sessionId": "..." }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CdpEvent {
    /// Event name in `Domain.event` format.
    pub method: String,

    /// Event-specific data.
    #[serde(default)]
    pub params: Value,

    /// Sub-session that emitted the event; `None` for browser-level events.
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

impl CdpEvent {
    /// Returns the domain name from the method.
    #[inline]
    #[must_use]
    pub fn domain(&self) -> &str {
        self.method.split('.').next().unwrap_or_default()
    }

    /// Gets a string from params.
    #[inline]
    #[must_use]
    pub fn get_string(&self, key: &str) -> String {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Gets an optional string from params.
    #[inline]
    #[must_use]
    pub fn get_optional_string(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Gets a u64 from params.
    #[inline]
    #[must_use]
    pub fn get_u64(&self, key: &str) -> u64 {
        self.params
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or_default()
    }
}

// ============================================================================
// Frame Classification
// ============================================================================

/// A classified incoming frame.
#[derive(Debug, Clone)]
pub enum IncomingFrame {
    /// Response to an outbound command.
    Response(CdpResponse),
    /// Unsolicited event.
    Event(CdpEvent),
}

impl IncomingFrame {
    /// Classifies a raw text frame.
    ///
    /// A frame with an `id` is a response; a frame with a `method` but no
    /// `id` is an event. Anything else is a protocol violation.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] on malformed JSON, [`Error::Protocol`] on a frame
    /// that is neither response nor event.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;

        if value.get("id").is_some() {
            let response: CdpResponse = serde_json::from_value(value)?;
            return Ok(Self::Response(response));
        }

        if value.get("method").is_some() {
            let event: CdpEvent = serde_json::from_value(value)?;
            return Ok(Self::Event(event));
        }

        Err(Error::protocol(format!(
            "frame is neither response nor event: {text}"
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================
