//! Typed views of the protocol events the control plane consumes.
//!
//! The browser emits far more event traffic than the core cares about;
//! everything outside this table parses to [`ParsedEvent::Unknown`] and is
//! dropped by the dispatcher.
//!
//! | Domain | Events |
//! |--------|--------|
//! | `Target` | `targetCreated`, `targetInfoChanged`, `targetDestroyed`, `attachedToTarget`, `detachedFromTarget` |
//! | `Runtime` | `consoleAPICalled`, `executionContextCreated`, `executionContextsCleared` |
//! | `Log` | `entryAdded` |

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

use crate::identifiers::{SessionId, TargetId};

use super::message::CdpEvent;

// ============================================================================
// TargetDescriptor
// ============================================================================

/// Raw target metadata as reported by `Target.targetCreated` and friends.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetDescriptor {
    /// Protocol-assigned target ID.
    #[serde(rename = "targetId")]
    pub target_id: TargetId,

    /// Protocol target type string (`page`, `service_worker`, ...).
    #[serde(rename = "type")]
    pub target_type: String,

    /// Current URL of the target.
    #[serde(default)]
    pub url: String,

    /// Current title of the target.
    #[serde(default)]
    pub title: String,

    /// Whether a debugger is attached.
    #[serde(default)]
    pub attached: bool,
}

// ============================================================================
// ConsoleCall
// ============================================================================

/// A `Runtime.consoleAPICalled` notification, flattened for classification.
#[derive(Debug, Clone)]
pub struct ConsoleCall {
    /// Console method name (`log`, `warning`, `error`, ...).
    pub level: String,

    /// Space-joined preview of the console arguments.
    pub message: String,

    /// Execution context the call originated from.
    pub context_id: u64,

    /// URL of the topmost stack frame, when a stack trace was captured.
    pub stack_top_url: Option<String>,
}

// ============================================================================
// ContextDescriptor
// ============================================================================

/// A `Runtime.executionContextCreated` notification.
#[derive(Debug, Clone)]
pub struct ContextDescriptor {
    /// Context ID, unique within the session.
    pub context_id: u64,

    /// Security origin of the context.
    pub origin: String,

    /// Human-readable context name.
    pub name: String,

    /// `true` for the page's main world, `false` for isolated worlds.
    pub is_default_world: bool,
}

// ============================================================================
// ParsedEvent
// ============================================================================

/// Parsed event types for type-safe dispatch.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    /// A new target appeared.
    TargetCreated(TargetDescriptor),

    /// An existing target changed URL or title.
    TargetInfoChanged(TargetDescriptor),

    /// A target disappeared.
    TargetDestroyed {
        /// The destroyed target's ID.
        target_id: TargetId,
    },

    /// A sub-session attached to a target.
    AttachedToTarget {
        /// The new sub-session's ID.
        session_id: SessionId,
        /// The target the session is bound to.
        target: TargetDescriptor,
    },

    /// A sub-session detached.
    DetachedFromTarget {
        /// The detached session's ID.
        session_id: SessionId,
    },

    /// A console API call inside some execution context.
    ConsoleApiCalled(ConsoleCall),

    /// A new execution context appeared in the session.
    ExecutionContextCreated(ContextDescriptor),

    /// All execution contexts in the session were dropped (navigation).
    ExecutionContextsCleared,

    /// A browser-generated log entry (network errors, deprecations, ...).
    LogEntryAdded {
        /// Severity string (`verbose`, `info`, `warning`, `error`).
        level: String,
        /// Entry text.
        text: String,
        /// Associated resource URL, if any.
        url: Option<String>,
    },

    /// Event the control plane does not consume.
    Unknown {
        /// Event method.
        method: String,
    },
}

// ============================================================================
// Event Parsing
// ============================================================================

impl CdpEvent {
    /// Parses the event into a typed variant.
    #[must_use]
    pub fn parse(&self) -> ParsedEvent {
        match self.method.as_str() {
            "Target.targetCreated" => match self.descriptor("targetInfo") {
                Some(info) => ParsedEvent::TargetCreated(info),
                None => self.unknown(),
            },

            "Target.targetInfoChanged" => match self.descriptor("targetInfo") {
                Some(info) => ParsedEvent::TargetInfoChanged(info),
                None => self.unknown(),
            },

            "Target.targetDestroyed" => ParsedEvent::TargetDestroyed {
                target_id: TargetId::new(self.get_string("targetId")),
            },

            "Target.attachedToTarget" => match self.descriptor("targetInfo") {
                Some(target) => ParsedEvent::AttachedToTarget {
                    session_id: SessionId::new(self.get_string("sessionId")),
                    target,
                },
                None => self.unknown(),
            },

            "Target.detachedFromTarget" => ParsedEvent::DetachedFromTarget {
                session_id: SessionId::new(self.get_string("sessionId")),
            },

            "Runtime.consoleAPICalled" => ParsedEvent::ConsoleApiCalled(ConsoleCall {
                level: self.get_string("type"),
                message: preview_args(self.params.get("args")),
                context_id: self.get_u64("executionContextId"),
                stack_top_url: stack_top_url(self.params.get("stackTrace")),
            }),

            "Runtime.executionContextCreated" => {
                let ctx = self.params.get("context").cloned().unwrap_or(Value::Null);
                ParsedEvent::ExecutionContextCreated(ContextDescriptor {
                    context_id: ctx.get("id").and_then(Value::as_u64).unwrap_or_default(),
                    origin: str_field(&ctx, "origin"),
                    name: str_field(&ctx, "name"),
                    is_default_world: ctx
                        .get("auxData")
                        .and_then(|aux| aux.get("isDefault"))
                        .and_then(Value::as_bool)
                        // Missing auxData means an older engine; assume main world.
                        .unwrap_or(true),
                })
            }

            "Runtime.executionContextsCleared" => ParsedEvent::ExecutionContextsCleared,

            "Log.entryAdded" => {
                let entry = self.params.get("entry").cloned().unwrap_or(Value::Null);
                ParsedEvent::LogEntryAdded {
                    level: str_field(&entry, "level"),
                    text: str_field(&entry, "text"),
                    url: entry
                        .get("url")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            }

            _ => self.unknown(),
        }
    }

    /// Deserializes a [`TargetDescriptor`] out of a params field.
    fn descriptor(&self, key: &str) -> Option<TargetDescriptor> {
        self.params
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    #[inline]
    fn unknown(&self) -> ParsedEvent {
        ParsedEvent::Unknown {
            method: self.method.clone(),
        }
    }
}

/// Gets a string field out of a JSON object, defaulting to empty.
#[inline]
fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Builds a single-line preview from console call arguments.
///
/// Primitives render their value; objects fall back to the remote-object
/// description the browser already computed.
fn preview_args(args: Option<&Value>) -> String {
    let Some(args) = args.and_then(Value::as_array) else {
        return String::new();
    };

    args.iter()
        .map(|arg| {
            if let Some(s) = arg.get("value").and_then(Value::as_str) {
                return s.to_string();
            }
            if let Some(v) = arg.get("value") {
                return v.to_string();
            }
            arg.get("description")
                .and_then(Value::as_str)
                .unwrap_or("<object>")
                .to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extracts the URL of the topmost call frame from a stack trace.
fn stack_top_url(stack: Option<&Value>) -> Option<String> {
    let frames = stack?.get("callFrames")?.as_array()?;
    let url = frames.first()?.get("url")?.as_str()?;
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
