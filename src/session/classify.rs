//! Source labeling for console events.
//!
//! Which surface did a console line come from: the page itself, an
//! extension's content script, an extension page, or a background service
//! worker? The protocol never answers this directly; the label is derived
//! from several signals in priority order:
//!
//! 1. Isolated-world flag on the execution context (non-default world in
//!    a page target is a content script)
//! 2. Execution-context name heuristics
//! 3. Execution-context origin scheme (`chrome-extension://`)
//! 4. Stack-trace top-frame URL scheme, as a final override — stack
//!    evidence wins because context metadata for isolated worlds is
//!    sometimes absent on older engine versions
//!
//! This chain is a best-effort heuristic, not a protocol guarantee. An
//! engine update that changes which signal is authoritative changes the
//! labels here too.

// ============================================================================
// Imports
// ============================================================================

use url::Url;

use crate::logs::SourceLabel;

use super::registry::TargetKind;

// ============================================================================
// Constants
// ============================================================================

/// URL scheme of extension-hosted resources.
pub const EXTENSION_SCHEME: &str = "chrome-extension";

// ============================================================================
// ContextRecord
// ============================================================================

/// Cached metadata for one execution context within a sub-session.
///
/// Repopulated via `Runtime.executionContextCreated` after each
/// navigation clears the contexts.
#[derive(Debug, Clone)]
pub struct ContextRecord {
    /// Human-readable context name.
    pub name: String,
    /// Security origin.
    pub origin: String,
    /// `false` for isolated (content-script) worlds.
    pub is_default_world: bool,
}

// ============================================================================
// Classification
// ============================================================================

/// Returns the label a target's own events carry absent better evidence.
#[inline]
#[must_use]
pub fn base_label(kind: TargetKind) -> SourceLabel {
    match kind {
        TargetKind::ServiceWorker => SourceLabel::ServiceWorker,
        TargetKind::ExtensionPage => SourceLabel::Extension,
        TargetKind::Page | TargetKind::Other => SourceLabel::Page,
    }
}

/// Classifies one console event.
///
/// `base` comes from the owning target's kind; `context` is the cached
/// execution-context record, if the context-created notification was
/// seen; `stack_top_url` is the URL of the event's topmost stack frame.
#[must_use]
pub fn classify_console_event(
    base: SourceLabel,
    context: Option<&ContextRecord>,
    stack_top_url: Option<&str>,
) -> SourceLabel {
    // Worker and extension-page targets host no foreign worlds; their
    // events keep the target-derived label.
    if base != SourceLabel::Page {
        return base;
    }

    let mut label = base;

    if let Some(ctx) = context {
        if !ctx.is_default_world {
            label = SourceLabel::ContentScript;
        } else if name_suggests_content_script(&ctx.name) {
            label = SourceLabel::ContentScript;
        } else if is_extension_url(&ctx.origin) {
            label = SourceLabel::Extension;
        }
    }

    // Final override: a stack rooted in an extension URL inside a page
    // target is a content script, whatever the context metadata said.
    if let Some(url) = stack_top_url
        && is_extension_url(url)
    {
        label = SourceLabel::ContentScript;
    }

    label
}

/// Returns `true` if the context name reads like an isolated world.
#[must_use]
fn name_suggests_content_script(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("content") || lower.contains("isolated")
}

/// Returns `true` for extension-scheme URLs and origins.
#[inline]
#[must_use]
pub fn is_extension_url(url: &str) -> bool {
    url.starts_with("chrome-extension://")
}

/// Extracts the extension ID (host component) from an extension URL.
#[must_use]
pub fn extension_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != EXTENSION_SCHEME {
        return None;
    }
    parsed.host_str().map(str::to_string)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(name: &str, origin: &str, is_default_world: bool) -> ContextRecord {
        ContextRecord {
            name: name.into(),
            origin: origin.into(),
            is_default_world,
        }
    }

    #[test]
    fn test_main_world_page_event() {
        let context = ctx("", "https://example.com", true);
        let label = classify_console_event(SourceLabel::Page, Some(&context), None);
        assert_eq!(label, SourceLabel::Page);
    }

    #[test]
    fn test_isolated_world_is_content_script() {
        let context = ctx("", "https://example.com", false);
        let label = classify_console_event(SourceLabel::Page, Some(&context), None);
        assert_eq!(label, SourceLabel::ContentScript);
    }

    #[test]
    fn test_context_name_heuristic() {
        let context = ctx("My Extension Content World", "https://example.com", true);
        let label = classify_console_event(SourceLabel::Page, Some(&context), None);
        assert_eq!(label, SourceLabel::ContentScript);
    }

    #[test]
    fn test_extension_origin_scheme() {
        let context = ctx("", "chrome-extension://abcdef", true);
        let label = classify_console_event(SourceLabel::Page, Some(&context), None);
        assert_eq!(label, SourceLabel::Extension);
    }

    #[test]
    fn test_stack_override_beats_context() {
        // Context metadata claims main world; the stack says otherwise.
        let context = ctx("", "https://example.com", true);
        let label = classify_console_event(
            SourceLabel::Page,
            Some(&context),
            Some("chrome-extension://abcdef/content.js"),
        );
        assert_eq!(label, SourceLabel::ContentScript);
    }

    #[test]
    fn test_stack_override_without_context() {
        // Older engines omit isolated-world metadata entirely.
        let label = classify_console_event(
            SourceLabel::Page,
            None,
            Some("chrome-extension://abcdef/content.js"),
        );
        assert_eq!(label, SourceLabel::ContentScript);
    }

    #[test]
    fn test_worker_label_is_sticky() {
        let label = classify_console_event(
            SourceLabel::ServiceWorker,
            None,
            Some("chrome-extension://abcdef/bg.js"),
        );
        assert_eq!(label, SourceLabel::ServiceWorker);
    }

    #[test]
    fn test_extension_id_extraction() {
        assert_eq!(
            extension_id_from_url("chrome-extension://abcdefgh/popup.html"),
            Some("abcdefgh".to_string())
        );
        assert_eq!(extension_id_from_url("https://example.com"), None);
        assert_eq!(extension_id_from_url("not a url"), None);
    }
}
