//! Chrome debugging control plane.
//!
//! A long-lived service that attaches to (or launches) a Chromium-family
//! browser over the DevTools protocol and keeps a stable, observable
//! debugging surface on top of it.
//!
//! # Architecture
//!
//! One WebSocket carries everything. Per-target sub-sessions are
//! flattened onto it and routed by session ID:
//!
//! - **[`Debugger`]** is the single entry point; every external command
//!   goes through its FIFO command lock
//! - **Connection** layer decides attach-vs-launch and owns teardown
//! - **Session** layer discovers targets, attaches sub-sessions, and
//!   classifies console output by provenance
//! - **Health** layer probes liveness and performs bounded reconnects
//! - **Tabs** layer maps volatile target IDs to stable `tab_N` handles
//!
//! # Quick Start
//!
//! ```no_run
//! use chrome_debug_core::{Debugger, DebuggerOptions, LogFilter, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Attach to a running browser, or launch one if none answers
//!     let debugger = Debugger::new(DebuggerOptions::default());
//!     debugger.ensure_connection().await?;
//!
//!     // Open a page and watch its console output
//!     let tab = debugger.create_tab(Some("https://example.com")).await?;
//!     debugger.switch_to_tab(&tab).await?;
//!     for entry in debugger.logs(&LogFilter::default()) {
//!         println!("[{}] {}", entry.source, entry.message);
//!     }
//!
//!     debugger.teardown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`debugger`] | Top-level facade: [`Debugger`] |
//! | [`connection`] | Attach/launch decision, ownership, teardown |
//! | [`session`] | Target discovery, sub-sessions, console classification |
//! | [`health`] | Liveness probing and bounded recovery |
//! | [`command`] | FIFO async command lock |
//! | [`tabs`] | Stable tab identities over volatile targets |
//! | [`logs`] | Bounded, filterable log aggregation |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | DevTools message types (internal) |
//! | [`transport`] | WebSocket transport layer (internal) |

// ============================================================================
// Modules
// ============================================================================

/// FIFO async command lock.
///
/// Serializes external commands in strict arrival order with direct
/// lock handoff.
pub mod command;

/// Connection lifecycle.
///
/// Endpoint discovery, attach-vs-launch, browser process ownership, and
/// ownership-aware teardown.
pub mod connection;

/// Top-level facade.
///
/// [`Debugger`] wires every component together and is the only type
/// most callers need.
pub mod debugger;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Liveness probing and bounded automatic recovery.
pub mod health;

/// Type-safe identifiers for protocol and control-plane entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Bounded, insertion-ordered log aggregation with provenance labels.
pub mod logs;

/// DevTools protocol message types.
///
/// Internal module defining command/response/event structures.
pub mod protocol;

/// Target discovery and flattened sub-session multiplexing.
pub mod session;

/// Stable tab identities over volatile page targets.
pub mod tabs;

/// WebSocket transport layer.
///
/// Internal module handling the wire connection and its event loop.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Facade
pub use debugger::{Debugger, DebuggerOptions};

// Connection types
pub use connection::{
    ConnectMode, ConnectOptions, ConnectionInfo, ConnectionManager, LaunchOptions,
};

// Session types
pub use session::{SessionMultiplexer, SubSession, TargetEntry, TargetKind, TargetRegistry};

// Health types
pub use health::{HealthMonitor, HealthOptions, HealthReport, HealthStatus};

// Command lock
pub use command::{CommandGuard, CommandMutex};

// Tab types
pub use tabs::{PageManager, TabInfo};

// Log types
pub use logs::{LogAggregator, LogEntry, LogFilter, LogLevel, SourceLabel};

// Error types
pub use error::{Error, ErrorClass, Result};

// Identifier types
pub use identifiers::{RequestId, SessionId, TabId, TargetId};
