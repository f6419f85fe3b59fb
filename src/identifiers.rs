//! Type-safe identifiers for protocol and control-plane entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//!
//! # Identifier Categories
//!
//! | Type | Assigned by | Stability |
//! |------|-------------|-----------|
//! | [`TargetId`] | browser (protocol) | volatile across restarts |
//! | [`SessionId`] | browser (protocol) | volatile, per attachment |
//! | [`RequestId`] | this process | monotonic, per connection lifetime |
//! | [`TabId`] | this process | stable, never reused |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// TargetId
// ============================================================================

/// Protocol-assigned identifier for a debuggable target.
///
/// Volatile: a browser restart invalidates all target IDs. Callers should
/// use [`TabId`] for anything that must survive re-indexing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    /// Creates a target ID from a protocol string.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw protocol string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// SessionId
// ============================================================================

/// Protocol-assigned identifier for an attached sub-session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session ID from a protocol string.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw protocol string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// RequestId
// ============================================================================

/// Monotonic wire-correlation identifier for outbound commands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(u64);

/// Global request counter. The protocol only requires uniqueness per
/// connection; a process-wide counter satisfies that trivially.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Returns the next request ID.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TabId
// ============================================================================

/// Caller-facing stable tab identifier (`tab_1`, `tab_2`, ...).
///
/// Monotonically generated and never reused: once a tab closes, its ID is
/// retired permanently and addressing it yields a "closed" error instead of
/// silently rebinding to another page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

static NEXT_TAB_SEQ: AtomicU64 = AtomicU64::new(1);

impl TabId {
    /// Generates a fresh, process-unique tab ID.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(format!("tab_{}", NEXT_TAB_SEQ.fetch_add(1, Ordering::Relaxed)))
    }

    /// Creates a tab ID from a caller-supplied string.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw string form.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_monotonic() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert!(b.value() > a.value());
    }

    #[test]
    fn test_tab_id_unique() {
        let a = TabId::next();
        let b = TabId::next();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tab_"));
    }

    #[test]
    fn test_target_id_roundtrip() {
        let id = TargetId::new("ABC123");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"ABC123\"");
        let back: TargetId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::new("S1");
        assert_eq!(id.to_string(), "S1");
    }
}
