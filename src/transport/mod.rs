//! Wire transport layer.
//!
//! One WebSocket carries all traffic between this process and the browser:
//! browser-level commands, flattened sub-session commands (routed by
//! `sessionId`), correlated responses, and asynchronous event frames.
//!
//! ```text
//! ┌──────────────────┐                            ┌──────────────────┐
//! │  Control plane   │                            │  Browser         │
//! │                  │         WebSocket          │  (DevTools       │
//! │  Connection ─────│◄──────────────────────────►│   endpoint)      │
//! │  event loop      │   ws://host:port/devtools  │                  │
//! └──────────────────┘                            └──────────────────┘
//! ```
//!
//! Responses resolve oneshot waiters by numeric `id`; events flow to a
//! single dispatcher task over an unbounded channel. Commands suspend the
//! caller, never the loop.

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket connection and event loop.
pub mod connection;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, WirePipe};

// ============================================================================
// Test Support
// ============================================================================
