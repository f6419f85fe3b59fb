//! Top-level control plane facade.
//!
//! [`Debugger`] wires together the connection manager, session
//! multiplexer, log aggregator, health monitor, command mutex, and tab
//! identity map, and exposes the boundary every caller goes through:
//!
//! | Operation group | Methods |
//! |-----------------|---------|
//! | Connection      | [`ensure_connection`], [`teardown`], [`reconnect`] |
//! | Health          | [`health`] |
//! | Discovery       | [`list_targets`] |
//! | Logs            | [`logs`], [`clear_logs`] |
//! | Serialization   | [`with_command_lock`] |
//! | Tabs            | [`list_tabs`], [`switch_to_tab`], [`create_tab`], [`close_tab`], [`resolve_active_page`] |
//!
//! Every operation that touches the wire runs inside the FIFO command
//! lock, so external callers never interleave protocol exchanges.
//!
//! [`ensure_connection`]: Debugger::ensure_connection
//! [`teardown`]: Debugger::teardown
//! [`reconnect`]: Debugger::reconnect
//! [`health`]: Debugger::health
//! [`list_targets`]: Debugger::list_targets
//! [`logs`]: Debugger::logs
//! [`clear_logs`]: Debugger::clear_logs
//! [`with_command_lock`]: Debugger::with_command_lock
//! [`list_tabs`]: Debugger::list_tabs
//! [`switch_to_tab`]: Debugger::switch_to_tab
//! [`create_tab`]: Debugger::create_tab
//! [`close_tab`]: Debugger::close_tab
//! [`resolve_active_page`]: Debugger::resolve_active_page

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::command::CommandMutex;
use crate::connection::{ConnectOptions, ConnectionInfo, ConnectionManager};
use crate::error::Result;
use crate::health::{HealthMonitor, HealthOptions, HealthReport};
use crate::identifiers::{SessionId, TabId, TargetId};
use crate::logs::{LogAggregator, LogEntry, LogFilter};
use crate::session::{SessionMultiplexer, TargetEntry, TargetRegistry};
use crate::tabs::{PageManager, TabInfo};
use crate::transport::WirePipe;

// ============================================================================
// DebuggerOptions
// ============================================================================

/// Aggregate configuration for the whole control plane.
#[derive(Debug, Clone, Default)]
pub struct DebuggerOptions {
    /// How to reach or start a browser.
    pub connect: ConnectOptions,

    /// Health probe and recovery tuning.
    pub health: HealthOptions,

    /// Log retention override; the aggregator default applies when `None`.
    pub log_capacity: Option<usize>,
}

// ============================================================================
// Debugger
// ============================================================================

/// The control plane. One instance per browser.
pub struct Debugger {
    manager: Arc<ConnectionManager>,
    mux: SessionMultiplexer,
    logs: LogAggregator,
    monitor: Arc<HealthMonitor>,
    command_mutex: CommandMutex,
    pages: PageManager,
    log_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl Debugger {
    /// Wires up all components and starts the background tasks.
    ///
    /// No connection is made yet; call [`ensure_connection`] first.
    ///
    /// [`ensure_connection`]: Debugger::ensure_connection
    #[must_use]
    pub fn new(options: DebuggerOptions) -> Self {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let logs = match options.log_capacity {
            Some(capacity) => LogAggregator::with_capacity(capacity),
            None => LogAggregator::new(),
        };
        let log_task = tokio::spawn(logs.clone().run(log_rx));

        let mux = SessionMultiplexer::new(TargetRegistry::new(), log_tx);
        let manager = Arc::new(ConnectionManager::new(options.connect, mux.clone()));
        let command_mutex = CommandMutex::new();
        let pages = PageManager::new(mux.clone());

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&manager),
            mux.clone(),
            command_mutex.clone(),
            options.health,
        ));
        let monitor_task = Arc::clone(&monitor).spawn();

        Self {
            manager,
            mux,
            logs,
            monitor,
            command_mutex,
            pages,
            log_task,
            monitor_task,
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Establishes (or re-validates) the connection and runs discovery.
    ///
    /// Idempotent: an already-live connection is kept as-is.
    ///
    /// # Errors
    ///
    /// Attach/launch failures from the connection manager, or protocol
    /// failures during discovery.
    pub async fn ensure_connection(&self) -> Result<ConnectionInfo> {
        self.command_mutex
            .with_lock(async {
                let info = self.manager.ensure_connection().await?;
                self.mux.discover_and_attach().await?;
                Ok(info)
            })
            .await
    }

    /// Adopts an externally established transport (tunnels, tests) and
    /// runs discovery over it. The browser behind it is never owned.
    ///
    /// # Errors
    ///
    /// Protocol failures during discovery.
    pub async fn adopt_transport<S: WirePipe>(&self, pipe: S) -> Result<ConnectionInfo> {
        self.command_mutex
            .with_lock(async {
                let info = self.manager.adopt_transport(pipe).await?;
                self.mux.discover_and_attach().await?;
                Ok(info)
            })
            .await
    }

    /// Tears the connection down, ownership-aware.
    ///
    /// A launched browser gets a graceful close and a bounded wait; an
    /// attached one is merely disconnected from.
    ///
    /// # Errors
    ///
    /// I/O failures while closing; the local state is cleared regardless.
    pub async fn teardown(&self) -> Result<()> {
        self.command_mutex
            .with_lock(self.manager.teardown())
            .await
    }

    /// Manual reconnect. Cancels any pending automatic backoff, tears
    /// down, reattaches with the last-known options, and rediscovers.
    ///
    /// Usable from any health state, including `Failed`.
    ///
    /// # Errors
    ///
    /// Attach/launch or discovery failures; health state is left for the
    /// next probe to classify.
    pub async fn reconnect(&self) -> Result<ConnectionInfo> {
        self.monitor.cancel_backoff();
        info!("Manual reconnect requested");

        let info = self
            .command_mutex
            .with_lock(async {
                let _ = self.manager.teardown().await;
                let info = self.manager.ensure_connection().await?;
                self.mux.discover_and_attach().await?;
                Ok::<_, crate::error::Error>(info)
            })
            .await?;

        self.monitor.mark_recovered();
        Ok(info)
    }

    /// Returns the current connection description, if connected.
    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.manager.info().await
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Returns the health snapshot.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.monitor.report()
    }

    // ------------------------------------------------------------------
    // Discovery and logs
    // ------------------------------------------------------------------

    /// Lists all known targets with their classification.
    #[must_use]
    pub fn list_targets(&self) -> Vec<(TargetId, TargetEntry)> {
        self.mux.registry().list()
    }

    /// Queries aggregated console/log output, oldest first.
    #[must_use]
    pub fn logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.logs.query(filter)
    }

    /// Drops all retained log entries.
    pub fn clear_logs(&self) {
        self.logs.clear();
    }

    // ------------------------------------------------------------------
    // Command serialization
    // ------------------------------------------------------------------

    /// Runs `fut` while holding the exclusive command lock.
    ///
    /// Waiters are served strictly in arrival order.
    pub async fn with_command_lock<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.command_mutex.with_lock(fut).await
    }

    // ------------------------------------------------------------------
    // Tabs
    // ------------------------------------------------------------------

    /// Lists open tabs with stable IDs.
    ///
    /// # Errors
    ///
    /// [`Error::HealthDegraded`](crate::error::Error::HealthDegraded)
    /// once automatic recovery has given up.
    pub async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        self.monitor.ensure_usable()?;
        Ok(self
            .command_mutex
            .with_lock(async { self.pages.list() })
            .await)
    }

    /// Switches to a tab, verified.
    ///
    /// # Errors
    ///
    /// [`Error::TabClosed`](crate::error::Error::TabClosed) for retired
    /// IDs; activation/verification failures otherwise.
    pub async fn switch_to_tab(&self, tab_id: &TabId) -> Result<()> {
        self.monitor.ensure_usable()?;
        self.command_mutex
            .with_lock(self.pages.switch_to(tab_id))
            .await
    }

    /// Opens a new tab (about:blank when `url` is `None`) and makes it
    /// the active one.
    ///
    /// # Errors
    ///
    /// Connection or protocol failures from target creation.
    pub async fn create_tab(&self, url: Option<&str>) -> Result<TabId> {
        self.monitor.ensure_usable()?;
        self.command_mutex
            .with_lock(self.pages.create(url))
            .await
    }

    /// Closes a tab and retires its ID permanently.
    ///
    /// # Errors
    ///
    /// [`Error::TabClosed`](crate::error::Error::TabClosed) when already
    /// closed.
    pub async fn close_tab(&self, tab_id: &TabId) -> Result<()> {
        self.monitor.ensure_usable()?;
        self.command_mutex
            .with_lock(self.pages.close(tab_id))
            .await
    }

    /// Resolves the active page: sticky designation with deterministic
    /// fallback to the first live tab.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`](crate::error::Error::Connection) when no
    /// live page target exists.
    pub async fn resolve_active_page(&self) -> Result<(TabId, TargetId, SessionId)> {
        self.monitor.ensure_usable()?;
        self.command_mutex
            .with_lock(async { self.pages.resolve_active() })
            .await
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.monitor_task.abort();
        self.log_task.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_disconnected() {
        let debugger = Debugger::new(DebuggerOptions::default());
        assert!(debugger.connection_info().await.is_none());
        assert!(debugger.list_targets().is_empty());
        assert!(debugger.logs(&LogFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_without_connection_is_noop() {
        let debugger = Debugger::new(DebuggerOptions::default());
        debugger.teardown().await.expect("noop teardown");
    }

    #[tokio::test]
    async fn test_command_lock_is_exclusive() {
        let debugger = Debugger::new(DebuggerOptions::default());
        let inside = debugger
            .with_command_lock(async { debugger.command_mutex.is_locked() })
            .await;
        assert!(inside);
        assert!(!debugger.command_mutex.is_locked());
    }
}
