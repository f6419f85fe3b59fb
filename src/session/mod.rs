//! Session multiplexing over the primary connection.
//!
//! One browser connection carries many flattened sub-sessions, one per
//! debuggable target (tabs, extension service workers, extension pages).
//! The multiplexer:
//!
//! - enables target discovery once per connection
//! - attaches a sub-session to each relevant target and enables the
//!   runtime/log/page domains on it
//! - guards against duplicate attachment (re-delivered `targetCreated`
//!   notifications and already-seen session IDs are no-ops)
//! - classifies every console event by originating execution context and
//!   funnels it into the log channel with correct provenance
//!
//! All mutation happens on the single event-dispatch path; commands only
//! read snapshots.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `registry` | Table of known targets |
//! | `classify` | Console-event source labeling |

// ============================================================================
// Submodules
// ============================================================================

/// In-memory table of known browser targets.
pub mod registry;

/// Source labeling for console events.
pub mod classify;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TargetId};
use crate::logs::{LogEntry, LogLevel, SourceLabel};
use crate::protocol::{CdpCommand, CdpEvent, ConsoleCall, ParsedEvent, TargetDescriptor};
use crate::transport::Connection;

use classify::{ContextRecord, base_label, classify_console_event, extension_id_from_url};

// ============================================================================
// Re-exports
// ============================================================================

pub use classify::{EXTENSION_SCHEME, is_extension_url};
pub use registry::{TargetEntry, TargetKind, TargetRegistry};

// ============================================================================
// SubSession
// ============================================================================

/// An attached, domain-enabled channel to one target.
#[derive(Debug, Clone)]
pub struct SubSession {
    /// Protocol-assigned session ID.
    pub session_id: SessionId,
    /// Owning target.
    pub target_id: TargetId,
    /// Classified target kind.
    pub kind: TargetKind,
    /// Label the target's events carry absent better evidence.
    pub label: SourceLabel,
    /// Target URL at attach time (refreshed on targetInfoChanged).
    pub url: String,
}

// ============================================================================
// SessionMultiplexer
// ============================================================================

/// Internal state, mutated only on the dispatch path.
struct MuxInner {
    /// Current primary connection, if bound.
    connection: Option<Connection>,
    /// Whether discovery notifications were enabled on this connection.
    discovery_enabled: bool,
    /// Attached sub-sessions by session ID.
    sessions: FxHashMap<SessionId, SubSession>,
    /// Reverse index: target → its one session.
    by_target: FxHashMap<TargetId, SessionId>,
    /// Targets with an attach in flight, to absorb duplicate notifications.
    attaching: FxHashSet<TargetId>,
    /// Execution-context metadata cache, keyed by (session, context id).
    contexts: FxHashMap<(SessionId, u64), ContextRecord>,
}

/// Attaches and tracks one sub-session per relevant target, classifying
/// and funneling their log events.
#[derive(Clone)]
pub struct SessionMultiplexer {
    inner: Arc<Mutex<MuxInner>>,
    registry: TargetRegistry,
    log_tx: mpsc::UnboundedSender<LogEntry>,
}

impl SessionMultiplexer {
    /// Creates a multiplexer feeding the given registry and log channel.
    #[must_use]
    pub fn new(registry: TargetRegistry, log_tx: mpsc::UnboundedSender<LogEntry>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MuxInner {
                connection: None,
                discovery_enabled: false,
                sessions: FxHashMap::default(),
                by_target: FxHashMap::default(),
                attaching: FxHashSet::default(),
                contexts: FxHashMap::default(),
            })),
            registry,
            log_tx,
        }
    }

    /// Binds a fresh connection, dropping all state from the previous one.
    ///
    /// Session IDs and target IDs do not survive a connection replacement;
    /// the next [`discover_and_attach`](Self::discover_and_attach) call
    /// repopulates everything.
    pub fn bind(&self, connection: Connection) {
        let mut inner = self.inner.lock();
        inner.connection = Some(connection);
        inner.discovery_enabled = false;
        inner.sessions.clear();
        inner.by_target.clear();
        inner.attaching.clear();
        inner.contexts.clear();
        self.registry.clear();
        debug!("Multiplexer bound to new connection");
    }

    /// Drops the bound connection and all per-connection state.
    pub fn unbind(&self) {
        let mut inner = self.inner.lock();
        inner.connection = None;
        inner.discovery_enabled = false;
        inner.sessions.clear();
        inner.by_target.clear();
        inner.attaching.clear();
        inner.contexts.clear();
        self.registry.clear();
    }

    /// Returns the target registry this multiplexer populates.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Returns the session attached to a target, if any.
    #[must_use]
    pub fn session_for_target(&self, target_id: &TargetId) -> Option<SessionId> {
        self.inner.lock().by_target.get(target_id).cloned()
    }

    /// Returns the number of attached sub-sessions.
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Returns the bound connection.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] if no connection is bound.
    pub fn connection(&self) -> Result<Connection> {
        self.inner
            .lock()
            .connection
            .clone()
            .ok_or(Error::ConnectionClosed)
    }

    /// Enables discovery (once per connection) and attaches a sub-session
    /// to every relevant existing target.
    ///
    /// # Errors
    ///
    /// Propagates connection failures; individual target attach failures
    /// are logged and skipped so one broken target cannot block the rest.
    pub async fn discover_and_attach(&self) -> Result<()> {
        let connection = self.connection()?;

        let needs_enable = !self.inner.lock().discovery_enabled;
        if needs_enable {
            connection
                .send(CdpCommand::new(
                    "Target.setDiscoverTargets",
                    json!({ "discover": true }),
                ))
                .await?;
            self.inner.lock().discovery_enabled = true;
            debug!("Target discovery enabled");
        }

        let result = connection
            .send(CdpCommand::simple("Target.getTargets"))
            .await?;

        let descriptors: Vec<TargetDescriptor> = result
            .get("targetInfos")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        for desc in &descriptors {
            if let Err(e) = self.on_target_created(desc).await {
                warn!(target = %desc.target_id, error = %e, "Failed to attach target");
            }
        }

        debug!(
            targets = descriptors.len(),
            sessions = self.session_count(),
            "Discovery pass complete"
        );
        Ok(())
    }

    /// Handles one protocol event from the dispatch task.
    pub async fn handle_event(&self, event: CdpEvent) {
        match event.parse() {
            ParsedEvent::TargetCreated(desc) => {
                if let Err(e) = self.on_target_created(&desc).await {
                    warn!(target = %desc.target_id, error = %e, "Attach on targetCreated failed");
                }
            }

            ParsedEvent::TargetInfoChanged(desc) => {
                self.on_target_info_changed(&desc);
            }

            ParsedEvent::TargetDestroyed { target_id } => {
                self.on_target_destroyed(&target_id);
            }

            ParsedEvent::AttachedToTarget { session_id, target } => {
                // Browser-initiated attach; register and enable like our own.
                if self.register_session(session_id.clone(), &target) {
                    if let Ok(connection) = self.connection()
                        && let Err(e) = self
                            .enable_domains(&connection, &session_id, kind_of(&target))
                            .await
                    {
                        warn!(session = %session_id, error = %e, "Domain enable failed");
                    }
                }
            }

            ParsedEvent::DetachedFromTarget { session_id } => {
                self.on_session_detached(&session_id);
            }

            ParsedEvent::ConsoleApiCalled(call) => {
                self.on_console(event.session_id.as_ref(), &call);
            }

            ParsedEvent::ExecutionContextCreated(ctx) => {
                if let Some(session_id) = event.session_id {
                    self.inner.lock().contexts.insert(
                        (session_id, ctx.context_id),
                        ContextRecord {
                            name: ctx.name,
                            origin: ctx.origin,
                            is_default_world: ctx.is_default_world,
                        },
                    );
                }
            }

            ParsedEvent::ExecutionContextsCleared => {
                // Navigation: drop the context cache for this session only.
                // The sub-session itself stays; the cache repopulates via
                // the next context-created notification.
                if let Some(session_id) = event.session_id {
                    let mut inner = self.inner.lock();
                    inner.contexts.retain(|(sid, _), _| *sid != session_id);
                    trace!(session = %session_id, "Context cache dropped on navigation");
                }
            }

            ParsedEvent::LogEntryAdded { level, text, url } => {
                self.on_log_entry(event.session_id.as_ref(), &level, text, url);
            }

            ParsedEvent::Unknown { method } => {
                trace!(%method, "Ignored event");
            }
        }
    }

    /// Handles a new (or re-announced) target.
    async fn on_target_created(&self, desc: &TargetDescriptor) -> Result<()> {
        self.registry
            .upsert(desc.target_id.clone(), TargetEntry::from_descriptor(desc));

        let kind = kind_of(desc);
        if !kind.is_debuggable() {
            return Ok(());
        }

        // Duplicate notifications for an already-attached (or in-flight)
        // target are no-ops.
        {
            let mut inner = self.inner.lock();
            if inner.by_target.contains_key(&desc.target_id)
                || !inner.attaching.insert(desc.target_id.clone())
            {
                trace!(target = %desc.target_id, "Target already handled");
                return Ok(());
            }
        }

        let attach_result = self.attach(desc).await;

        self.inner.lock().attaching.remove(&desc.target_id);
        attach_result
    }

    /// Attaches a flattened sub-session and enables its domains.
    async fn attach(&self, desc: &TargetDescriptor) -> Result<()> {
        let connection = self.connection()?;

        let result = connection
            .send(CdpCommand::new(
                "Target.attachToTarget",
                json!({ "targetId": desc.target_id, "flatten": true }),
            ))
            .await?;

        let session_id = result
            .get("sessionId")
            .and_then(serde_json::Value::as_str)
            .map(SessionId::new)
            .ok_or_else(|| Error::protocol("attachToTarget response missing sessionId"))?;

        if self.register_session(session_id.clone(), desc) {
            self.enable_domains(&connection, &session_id, kind_of(desc))
                .await?;
        }
        Ok(())
    }

    /// Records a sub-session. Returns `false` if the session ID was
    /// already seen (idempotent re-attach).
    fn register_session(&self, session_id: SessionId, desc: &TargetDescriptor) -> bool {
        let kind = kind_of(desc);
        let mut inner = self.inner.lock();

        if inner.sessions.contains_key(&session_id) {
            trace!(session = %session_id, "Session already registered");
            return false;
        }

        inner.by_target
            .insert(desc.target_id.clone(), session_id.clone());
        inner.sessions.insert(
            session_id.clone(),
            SubSession {
                session_id: session_id.clone(),
                target_id: desc.target_id.clone(),
                kind,
                label: base_label(kind),
                url: desc.url.clone(),
            },
        );
        debug!(session = %session_id, target = %desc.target_id, %kind, "Sub-session registered");
        true
    }

    /// Enables the protocol domains a sub-session needs.
    async fn enable_domains(
        &self,
        connection: &Connection,
        session_id: &SessionId,
        kind: TargetKind,
    ) -> Result<()> {
        connection
            .send(CdpCommand::simple("Runtime.enable").with_session(session_id.clone()))
            .await?;
        connection
            .send(CdpCommand::simple("Log.enable").with_session(session_id.clone()))
            .await?;

        if matches!(kind, TargetKind::Page | TargetKind::ExtensionPage) {
            connection
                .send(CdpCommand::simple("Page.enable").with_session(session_id.clone()))
                .await?;
        }
        Ok(())
    }

    /// Refreshes registry and session metadata for a changed target.
    fn on_target_info_changed(&self, desc: &TargetDescriptor) {
        self.registry
            .upsert(desc.target_id.clone(), TargetEntry::from_descriptor(desc));

        let mut inner = self.inner.lock();
        if let Some(session_id) = inner.by_target.get(&desc.target_id).cloned()
            && let Some(session) = inner.sessions.get_mut(&session_id)
        {
            session.url = desc.url.clone();
        }
    }

    /// Prunes all state for a destroyed target.
    fn on_target_destroyed(&self, target_id: &TargetId) {
        self.registry.remove(target_id);

        let mut inner = self.inner.lock();
        if let Some(session_id) = inner.by_target.remove(target_id) {
            inner.sessions.remove(&session_id);
            inner.contexts.retain(|(sid, _), _| *sid != session_id);
            debug!(target = %target_id, session = %session_id, "Target destroyed, session pruned");
        }
    }

    /// Prunes one detached session.
    fn on_session_detached(&self, session_id: &SessionId) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.remove(session_id) {
            inner.by_target.remove(&session.target_id);
            inner.contexts.retain(|(sid, _), _| sid != session_id);
            debug!(session = %session_id, "Session detached");
        }
    }

    /// Classifies one console event and funnels it into the log channel.
    fn on_console(&self, session_id: Option<&SessionId>, call: &ConsoleCall) {
        let Some(session_id) = session_id else {
            trace!("Console event without session, dropped");
            return;
        };

        let (base, session_url, context) = {
            let inner = self.inner.lock();
            let Some(session) = inner.sessions.get(session_id) else {
                trace!(session = %session_id, "Console event for unknown session");
                return;
            };
            (
                session.label,
                session.url.clone(),
                inner
                    .contexts
                    .get(&(session_id.clone(), call.context_id))
                    .cloned(),
            )
        };

        let label = classify_console_event(base, context.as_ref(), call.stack_top_url.as_deref());

        let extension_id = match label {
            SourceLabel::ContentScript => call
                .stack_top_url
                .as_deref()
                .and_then(extension_id_from_url),
            SourceLabel::Extension | SourceLabel::ServiceWorker => {
                extension_id_from_url(&session_url)
            }
            SourceLabel::Page => None,
        };

        let mut entry = LogEntry::new(
            LogLevel::from_protocol(&call.level),
            call.message.clone(),
            label,
        )
        .with_url(call.stack_top_url.clone().unwrap_or(session_url));

        if let Some(id) = extension_id {
            entry = entry.with_extension_id(id);
        }

        // Aggregator gone means shutdown; dropping the entry is fine.
        let _ = self.log_tx.send(entry);
    }

    /// Funnels a browser-generated log entry with the session's base label.
    fn on_log_entry(
        &self,
        session_id: Option<&SessionId>,
        level: &str,
        text: String,
        url: Option<String>,
    ) {
        let label = session_id
            .and_then(|sid| self.inner.lock().sessions.get(sid).map(|s| s.label))
            .unwrap_or(SourceLabel::Page);

        let mut entry = LogEntry::new(LogLevel::from_protocol(level), text, label);
        if let Some(url) = url {
            entry = entry.with_url(url);
        }
        let _ = self.log_tx.send(entry);
    }
}

/// Classified kind of a descriptor.
#[inline]
fn kind_of(desc: &TargetDescriptor) -> TargetKind {
    TargetKind::classify(&desc.target_type, &desc.url)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> (SessionMultiplexer, mpsc::UnboundedReceiver<LogEntry>) {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        (
            SessionMultiplexer::new(TargetRegistry::new(), log_tx),
            log_rx,
        )
    }

    fn page_descriptor(target_id: &str, url: &str) -> TargetDescriptor {
        TargetDescriptor {
            target_id: TargetId::new(target_id),
            target_type: "page".into(),
            url: url.into(),
            title: String::new(),
            attached: false,
        }
    }

    fn console_event(session_id: &str, level: &str, message: &str) -> CdpEvent {
        serde_json::from_value(json!({
            "method": "Runtime.consoleAPICalled",
            "params": {
                "type": level,
                "executionContextId": 1,
                "args": [{ "type": "string", "value": message }]
            },
            "sessionId": session_id
        }))
        .expect("event")
    }

    #[tokio::test]
    async fn test_register_session_idempotent() {
        let (mux, mut log_rx) = mux();
        let desc = page_descriptor("T1", "https://example.com");

        assert!(mux.register_session(SessionId::new("S1"), &desc));
        assert!(!mux.register_session(SessionId::new("S1"), &desc));
        assert_eq!(mux.session_count(), 1);

        // One injected console event yields exactly one log entry.
        mux.handle_event(console_event("S1", "log", "hello")).await;
        let entry = log_rx.try_recv().expect("one entry");
        assert_eq!(entry.message, "hello");
        assert_eq!(entry.source, SourceLabel::Page);
        assert!(log_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_worker_events_labeled_service_worker() {
        let (mux, mut log_rx) = mux();
        let desc = TargetDescriptor {
            target_id: TargetId::new("T2"),
            target_type: "service_worker".into(),
            url: "chrome-extension://abcdef/bg.js".into(),
            title: String::new(),
            attached: false,
        };
        mux.register_session(SessionId::new("S2"), &desc);

        mux.handle_event(console_event("S2", "error", "worker boom"))
            .await;
        let entry = log_rx.try_recv().expect("one entry");
        assert_eq!(entry.source, SourceLabel::ServiceWorker);
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.extension_id.as_deref(), Some("abcdef"));
    }

    #[tokio::test]
    async fn test_navigation_drops_context_cache_not_session() {
        let (mux, _log_rx) = mux();
        let desc = page_descriptor("T1", "https://example.com");
        mux.register_session(SessionId::new("S1"), &desc);

        mux.handle_event(
            serde_json::from_value(json!({
                "method": "Runtime.executionContextCreated",
                "params": { "context": { "id": 5, "origin": "https://example.com",
                                          "name": "", "auxData": { "isDefault": false } } },
                "sessionId": "S1"
            }))
            .expect("event"),
        )
        .await;
        assert_eq!(mux.inner.lock().contexts.len(), 1);

        mux.handle_event(
            serde_json::from_value(json!({
                "method": "Runtime.executionContextsCleared",
                "params": {},
                "sessionId": "S1"
            }))
            .expect("event"),
        )
        .await;

        assert_eq!(mux.inner.lock().contexts.len(), 0);
        assert_eq!(mux.session_count(), 1);
    }

    #[tokio::test]
    async fn test_target_destroyed_prunes_everything() {
        let (mux, _log_rx) = mux();
        let desc = page_descriptor("T1", "https://example.com");
        mux.registry
            .upsert(desc.target_id.clone(), TargetEntry::from_descriptor(&desc));
        mux.register_session(SessionId::new("S1"), &desc);

        mux.handle_event(
            serde_json::from_value(json!({
                "method": "Target.targetDestroyed",
                "params": { "targetId": "T1" }
            }))
            .expect("event"),
        )
        .await;

        assert!(mux.registry.is_empty());
        assert_eq!(mux.session_count(), 0);
        assert!(mux.session_for_target(&TargetId::new("T1")).is_none());
    }

    #[tokio::test]
    async fn test_isolated_world_console_is_content_script() {
        let (mux, mut log_rx) = mux();
        let desc = page_descriptor("T1", "https://example.com");
        mux.register_session(SessionId::new("S1"), &desc);

        mux.handle_event(
            serde_json::from_value(json!({
                "method": "Runtime.executionContextCreated",
                "params": { "context": { "id": 1, "origin": "https://example.com",
                                          "name": "", "auxData": { "isDefault": false } } },
                "sessionId": "S1"
            }))
            .expect("event"),
        )
        .await;

        mux.handle_event(console_event("S1", "log", "from content script"))
            .await;
        let entry = log_rx.try_recv().expect("one entry");
        assert_eq!(entry.source, SourceLabel::ContentScript);
    }
}
