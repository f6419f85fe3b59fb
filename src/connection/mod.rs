//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] owns the single primary link to the browser
//! and the decision that everything else hangs off: did this process
//! *attach* to a browser someone else owns, or did it *launch* one it is
//! allowed to kill?
//!
//! The teardown asymmetry is the core safety invariant of the whole
//! system: a connection with `owned_by_process == false` is only ever
//! severed locally — the user's browser is never terminated just because
//! a debugging tool happened to attach to it.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `endpoint` | Discovery-endpoint candidates and probing |
//! | `launch` | Browser process spawn and termination |

// ============================================================================
// Submodules
// ============================================================================

/// DevTools endpoint discovery.
pub mod endpoint;

/// Browser process launch.
pub mod launch;

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::CdpCommand;
use crate::session::SessionMultiplexer;
use crate::transport::{Connection, WirePipe};

pub use launch::{LaunchOptions, LaunchedBrowser};

// ============================================================================
// Constants
// ============================================================================

/// How long a freshly launched browser may take to open its debug port.
const LAUNCH_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the debug port.
const LAUNCH_READY_POLL: Duration = Duration::from_millis(200);

/// Budget for the graceful `Browser.close` call during owned teardown.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// ConnectOptions
// ============================================================================

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Host of an externally running browser's debug endpoint.
    pub host: String,

    /// Port of the debug endpoint.
    pub port: u16,

    /// Explicit discovery URL, tried before host/port candidates.
    pub browser_url: Option<String>,

    /// Try attaching to an existing browser before launching one.
    pub prefer_attach: bool,

    /// Permit launching a browser when attach finds nothing.
    /// With this off, attach exhaustion is a hard failure.
    pub allow_launch: bool,

    /// Launch configuration, used only on the launch path.
    pub launch: LaunchOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9222,
            browser_url: None,
            prefer_attach: true,
            allow_launch: true,
            launch: LaunchOptions::default(),
        }
    }
}

// ============================================================================
// ConnectionInfo
// ============================================================================

/// How the current connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Attached to an externally owned browser.
    Attach,
    /// Launched and owned by this process.
    Launch,
}

/// Snapshot of the current connection's provenance.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    /// `true` only if this process launched the browser.
    pub owned_by_process: bool,

    /// Attach or launch.
    pub mode: ConnectMode,

    /// When the connection was established.
    pub established_at: SystemTime,
}

// ============================================================================
// ManagedConnection
// ============================================================================

/// The live connection plus its ownership record.
///
/// Replaced wholesale on reconnect; never mutated in place, so a stale
/// handle can never masquerade as the fresh one.
struct ManagedConnection {
    connection: Connection,
    /// Present only for launched browsers. Its existence *is* the
    /// permission to terminate.
    owned: Option<LaunchedBrowser>,
    mode: ConnectMode,
    established_at: SystemTime,
}

impl ManagedConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            owned_by_process: self.owned.is_some(),
            mode: self.mode,
            established_at: self.established_at,
        }
    }
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Owns the primary connection and its attach/launch/teardown lifecycle.
pub struct ConnectionManager {
    current: tokio::sync::Mutex<Option<ManagedConnection>>,
    options: Mutex<ConnectOptions>,
    http: reqwest::Client,
    mux: SessionMultiplexer,
}

impl ConnectionManager {
    /// Creates a manager for the given multiplexer.
    #[must_use]
    pub fn new(options: ConnectOptions, mux: SessionMultiplexer) -> Self {
        Self {
            current: tokio::sync::Mutex::new(None),
            options: Mutex::new(options),
            http: reqwest::Client::new(),
            mux,
        }
    }

    /// Returns the last-known connect options.
    #[must_use]
    pub fn options(&self) -> ConnectOptions {
        self.options.lock().clone()
    }

    /// Replaces the connect options used by future connection attempts.
    pub fn set_options(&self, options: ConnectOptions) {
        *self.options.lock() = options;
    }

    /// Returns the current connection's provenance, if connected.
    pub async fn info(&self) -> Option<ConnectionInfo> {
        self.current.lock().await.as_ref().map(ManagedConnection::info)
    }

    /// Returns a handle to the live connection.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] when not connected.
    pub async fn connection(&self) -> Result<Connection> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|m| m.connection.is_alive())
            .map(|m| m.connection.clone())
            .ok_or(Error::ConnectionClosed)
    }

    /// Ensures a live connection exists, establishing one if needed.
    ///
    /// Idempotent: a live, healthy connection is returned unchanged. A
    /// dead one is discarded and replaced wholesale.
    ///
    /// # Errors
    ///
    /// [`Error::AttachFailed`] when attach exhausts all candidates and
    /// launch is not permitted; [`Error::LaunchFailed`] and friends when
    /// the launch path fails.
    pub async fn ensure_connection(&self) -> Result<ConnectionInfo> {
        let mut current = self.current.lock().await;

        if let Some(managed) = current.as_ref() {
            if managed.connection.is_alive() {
                return Ok(managed.info());
            }
            debug!("Existing connection is dead, replacing");
            *current = None;
        }

        let options = self.options();

        if options.prefer_attach {
            match endpoint::resolve_websocket_url(&self.http, &options).await {
                Ok(ws_url) => {
                    let managed = self.establish(&ws_url, None, ConnectMode::Attach).await?;
                    let connection_info = managed.info();
                    *current = Some(managed);
                    info!(url = %ws_url, "Attached to external browser");
                    return Ok(connection_info);
                }
                Err(e) if options.allow_launch => {
                    debug!(error = %e, "Attach found nothing, falling back to launch");
                }
                Err(e) => return Err(e),
            }
        } else if !options.allow_launch {
            return Err(Error::config(
                "neither attach nor launch permitted by options",
            ));
        }

        let browser = launch::launch(&options.launch)?;
        let ws_url = self.wait_for_debug_port(browser.port).await?;
        let managed = self
            .establish(&ws_url, Some(browser), ConnectMode::Launch)
            .await?;
        let connection_info = managed.info();
        *current = Some(managed);
        info!(url = %ws_url, "Launched and connected to owned browser");
        Ok(connection_info)
    }

    /// Attaches over an already-established message pipe.
    ///
    /// For transports the manager cannot dial itself (tunnels, proxies,
    /// test harnesses). The resulting connection is never owned.
    pub async fn adopt_transport<S: WirePipe>(&self, pipe: S) -> Result<ConnectionInfo> {
        let mut current = self.current.lock().await;

        let (connection, event_rx) = Connection::new(pipe);
        self.install(connection.clone(), event_rx);

        let managed = ManagedConnection {
            connection,
            owned: None,
            mode: ConnectMode::Attach,
            established_at: SystemTime::now(),
        };
        let connection_info = managed.info();
        *current = Some(managed);
        debug!("Adopted external transport");
        Ok(connection_info)
    }

    /// Tears down the current connection, respecting ownership.
    ///
    /// Owned browser: graceful `Browser.close`, then a bounded wait, then
    /// a forced kill. Non-owned: the local transport is severed and the
    /// browser is left untouched.
    pub async fn teardown(&self) -> Result<()> {
        let managed = self.current.lock().await.take();
        let Some(mut managed) = managed else {
            return Ok(());
        };

        self.mux.unbind();

        match managed.owned.take() {
            Some(browser) => {
                info!(pid = ?browser.pid(), "Tearing down owned browser");
                let close = managed
                    .connection
                    .send_with_timeout(CdpCommand::simple("Browser.close"), GRACEFUL_CLOSE_TIMEOUT)
                    .await;
                if let Err(e) = close {
                    warn!(error = %e, "Graceful Browser.close failed, escalating");
                }
                managed.connection.shutdown();
                browser.finish().await;
            }
            None => {
                info!("Severing connection to non-owned browser");
                managed.connection.shutdown();
            }
        }
        Ok(())
    }

    /// Explicitly terminates the browser process.
    ///
    /// # Errors
    ///
    /// [`Error::InvariantViolation`] if the current browser is not owned
    /// by this process. This is never downgraded to a disconnect.
    pub async fn terminate_browser(&self) -> Result<()> {
        let owned = {
            let current = self.current.lock().await;
            match current.as_ref() {
                None => return Err(Error::connection("not connected")),
                Some(managed) if managed.owned.is_none() => {
                    return Err(Error::invariant(
                        "refusing to terminate a browser this process does not own",
                    ));
                }
                Some(_) => true,
            }
        };
        debug_assert!(owned);
        self.teardown().await
    }

    /// Dials the WebSocket URL and wires the connection into the
    /// multiplexer and dispatch task.
    async fn establish(
        &self,
        ws_url: &str,
        owned: Option<LaunchedBrowser>,
        mode: ConnectMode,
    ) -> Result<ManagedConnection> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
        let (connection, event_rx) = Connection::new(ws_stream);
        self.install(connection.clone(), event_rx);

        Ok(ManagedConnection {
            connection,
            owned,
            mode,
            established_at: SystemTime::now(),
        })
    }

    /// Binds the multiplexer and spawns the single event-dispatch task.
    fn install(
        &self,
        connection: Connection,
        mut event_rx: tokio::sync::mpsc::UnboundedReceiver<crate::protocol::CdpEvent>,
    ) {
        self.mux.bind(connection);

        let mux = self.mux.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                mux.handle_event(event).await;
            }
            debug!("Event dispatch task exiting");
        });
    }

    /// Polls the launched browser's discovery endpoint until it answers.
    async fn wait_for_debug_port(&self, port: u16) -> Result<String> {
        let endpoint = format!("http://127.0.0.1:{port}");
        let deadline = tokio::time::Instant::now() + LAUNCH_READY_TIMEOUT;

        loop {
            match endpoint::probe(&self.http, &endpoint).await {
                Ok(version) => return Ok(version.web_socket_debugger_url),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    sleep(LAUNCH_READY_POLL).await;
                }
                Err(e) => {
                    warn!(error = %e, port, "Debug port never became ready");
                    return Err(Error::connection_timeout(
                        LAUNCH_READY_TIMEOUT.as_millis() as u64,
                    ));
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use crate::session::TargetRegistry;
    use crate::transport::testing::memory_pipe;

    fn manager() -> ConnectionManager {
        let (log_tx, _log_rx) = mpsc::unbounded_channel();
        let mux = SessionMultiplexer::new(TargetRegistry::new(), log_tx);
        ConnectionManager::new(ConnectOptions::default(), mux)
    }

    #[tokio::test]
    async fn test_non_owned_teardown_never_terminates() {
        let manager = manager();
        let (pipe, mut peer) = memory_pipe();

        let info = manager.adopt_transport(pipe).await.expect("adopt");
        assert!(!info.owned_by_process);
        assert_eq!(info.mode, ConnectMode::Attach);

        manager.teardown().await.expect("teardown");
        // Shutdown is processed by the event-loop task; let it run.
        sleep(Duration::from_millis(50)).await;

        // Drain everything the connection wrote: there must be no
        // Browser.close (terminate) call, only the local close frame.
        let mut close_frames = 0;
        while let Ok(frame) = peer.incoming.try_recv() {
            match frame {
                Message::Text(text) => {
                    assert!(
                        !text.contains("Browser.close"),
                        "non-owned teardown attempted to terminate the browser"
                    );
                }
                Message::Close(_) => close_frames += 1,
                _ => {}
            }
        }
        assert_eq!(close_frames, 1);
        assert!(manager.info().await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_browser_on_non_owned_is_invariant_violation() {
        let manager = manager();
        let (pipe, _peer) = memory_pipe();
        manager.adopt_transport(pipe).await.expect("adopt");

        let err = manager.terminate_browser().await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { .. }));

        // The connection must still be up; the violation is not a
        // silent disconnect either.
        assert!(manager.info().await.is_some());
    }

    #[tokio::test]
    async fn test_ensure_connection_is_idempotent_when_alive() {
        let manager = manager();
        let (pipe, _peer) = memory_pipe();
        let first = manager.adopt_transport(pipe).await.expect("adopt");

        let second = manager.ensure_connection().await.expect("ensure");
        assert_eq!(first.established_at, second.established_at);
        assert_eq!(second.mode, ConnectMode::Attach);
    }

    #[tokio::test]
    async fn test_attach_only_failure_names_candidates() {
        let manager = manager();
        manager.set_options(ConnectOptions {
            port: 1,
            prefer_attach: true,
            allow_launch: false,
            ..ConnectOptions::default()
        });

        let err = manager.ensure_connection().await.unwrap_err();
        assert!(matches!(err, Error::AttachFailed { .. }));
    }

    #[tokio::test]
    async fn test_teardown_without_connection_is_noop() {
        let manager = manager();
        manager.teardown().await.expect("teardown");
    }
}
