//! In-memory table of known browser targets.
//!
//! Populated by discovery events on the single dispatch path, pruned on
//! destruction events, read concurrently by command handlers. Target IDs
//! are protocol-assigned and volatile; nothing here survives a browser
//! restart.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::identifiers::TargetId;
use crate::protocol::TargetDescriptor;

// ============================================================================
// TargetKind
// ============================================================================

/// Classified target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A normal tab/page.
    Page,
    /// An extension background service worker.
    ServiceWorker,
    /// An extension-hosted page (popup, options, MV2 background page).
    ExtensionPage,
    /// Anything else the browser reports (devtools, browser, iframes...).
    Other,
}

impl TargetKind {
    /// Classifies a protocol type string plus URL into a kind.
    ///
    /// A `page` target at an extension-scheme URL is an extension surface,
    /// not a normal page.
    #[must_use]
    pub fn classify(target_type: &str, url: &str) -> Self {
        let extension_url = url.starts_with("chrome-extension://");
        match target_type {
            "page" | "tab" if extension_url => Self::ExtensionPage,
            "page" | "tab" => Self::Page,
            "service_worker" => Self::ServiceWorker,
            "background_page" => Self::ExtensionPage,
            _ => Self::Other,
        }
    }

    /// Returns `true` if the control plane attaches a sub-session to
    /// targets of this kind.
    #[inline]
    #[must_use]
    pub fn is_debuggable(self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Page => "page",
            Self::ServiceWorker => "service_worker",
            Self::ExtensionPage => "extension_page",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

// ============================================================================
// TargetEntry
// ============================================================================

/// Metadata held per known target.
#[derive(Debug, Clone)]
pub struct TargetEntry {
    /// Classified kind.
    pub kind: TargetKind,
    /// Last observed URL.
    pub url: String,
    /// Last observed title.
    pub title: String,
}

impl TargetEntry {
    /// Builds an entry from a protocol descriptor.
    #[must_use]
    pub fn from_descriptor(desc: &TargetDescriptor) -> Self {
        Self {
            kind: TargetKind::classify(&desc.target_type, &desc.url),
            url: desc.url.clone(),
            title: desc.title.clone(),
        }
    }
}

// ============================================================================
// TargetRegistry
// ============================================================================

/// Table of known targets keyed by protocol target ID.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    targets: std::sync::Arc<RwLock<FxHashMap<TargetId, TargetEntry>>>,
}

impl TargetRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a target. Returns `true` if it was new.
    pub fn upsert(&self, target_id: TargetId, entry: TargetEntry) -> bool {
        self.targets.write().insert(target_id, entry).is_none()
    }

    /// Removes a target, returning its last known entry.
    pub fn remove(&self, target_id: &TargetId) -> Option<TargetEntry> {
        self.targets.write().remove(target_id)
    }

    /// Returns a snapshot of one target.
    #[must_use]
    pub fn get(&self, target_id: &TargetId) -> Option<TargetEntry> {
        self.targets.read().get(target_id).cloned()
    }

    /// Returns `true` if the target is known.
    #[inline]
    #[must_use]
    pub fn contains(&self, target_id: &TargetId) -> bool {
        self.targets.read().contains_key(target_id)
    }

    /// Returns a snapshot of all targets.
    #[must_use]
    pub fn list(&self) -> Vec<(TargetId, TargetEntry)> {
        self.targets
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Returns the IDs of all page targets (normal tabs).
    #[must_use]
    pub fn pages(&self) -> Vec<TargetId> {
        self.targets
            .read()
            .iter()
            .filter(|(_, entry)| entry.kind == TargetKind::Page)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the number of known targets.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    /// Returns `true` if no targets are known.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// Drops every entry. Used when the connection is replaced; discovery
    /// repopulates the table.
    pub fn clear(&self) {
        self.targets.write().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
