//! DevTools protocol message types.
//!
//! The wire protocol itself is an external given; this module only defines
//! the frame shapes the control plane sends and the handful of events it
//! consumes. No protocol domain is reimplemented here.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Command/response/event frames and classification |
//! | `events` | Typed views of consumed events |

// ============================================================================
// Submodules
// ============================================================================

/// Wire frame types and incoming-frame classification.
pub mod message;

/// Typed views of the protocol events the core consumes.
pub mod events;

// ============================================================================
// Re-exports
// ============================================================================

pub use events::{ConsoleCall, ContextDescriptor, ParsedEvent, TargetDescriptor};
pub use message::{CdpCommand, CdpErrorPayload, CdpEvent, CdpResponse, IncomingFrame};
