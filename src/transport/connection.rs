//! Primary WebSocket connection and event loop.
//!
//! One [`Connection`] wraps the single wire link to the browser. A spawned
//! tokio task owns the socket and handles:
//!
//! - Incoming frames (responses correlated by numeric `id`, events fanned
//!   out over an unbounded channel to the session dispatcher)
//! - Outgoing commands from the Rust API
//! - Per-call timeouts that clean up their correlation entry
//!
//! The loop is generic over the message pipe so integration tests can
//! drive it with an in-memory duplex instead of a live socket.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::{CdpCommand, CdpEvent, CdpResponse, IncomingFrame};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for interactive protocol calls.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum pending requests before rejecting new ones.
const MAX_PENDING_REQUESTS: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Map of request IDs to response channels.
type CorrelationMap = FxHashMap<RequestId, oneshot::Sender<Result<CdpResponse>>>;

/// Bound for anything that can carry WebSocket messages both ways.
///
/// Satisfied by `tokio_tungstenite::WebSocketStream` and by the in-memory
/// duplex used in tests.
pub trait WirePipe:
    Stream<Item = StdResult<Message, WsError>>
    + Sink<Message, Error = WsError>
    + Send
    + Unpin
    + 'static
{
}

impl<T> WirePipe for T where
    T: Stream<Item = StdResult<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Send
        + Unpin
        + 'static
{
}

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Send a command and wait for the correlated response.
    Send {
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<CdpResponse>>,
    },
    /// Remove a timed-out correlation entry.
    RemoveCorrelation(RequestId),
    /// Shutdown the connection.
    Shutdown,
}

// ============================================================================
// Connection
// ============================================================================

/// Primary wire link to the browser.
///
/// Cloneable handle over a spawned event-loop task. A reconnect never
/// reuses a `Connection`; the manager replaces it wholesale so no caller
/// can hold a half-torn-down handle that silently went stale.
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Correlation map (shared with event loop).
    correlation: Arc<Mutex<CorrelationMap>>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            correlation: Arc::clone(&self.correlation),
        }
    }
}

impl Connection {
    /// Creates a connection over a message pipe.
    ///
    /// Spawns the event-loop task and returns the handle plus the event
    /// stream all protocol notifications are delivered on. The receiver
    /// side is consumed by exactly one dispatcher task.
    pub fn new<S: WirePipe>(pipe: S) -> (Self, mpsc::UnboundedReceiver<CdpEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));

        tokio::spawn(Self::run_event_loop(
            pipe,
            command_rx,
            Arc::clone(&correlation),
            event_tx,
        ));

        (
            Self {
                command_tx,
                correlation,
            },
            event_rx,
        )
    }

    /// Sends a command and waits for its response with the default
    /// interactive timeout (10s).
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the event loop has exited
    /// - [`Error::RequestTimeout`] if no response arrives in time
    /// - [`Error::Protocol`] if the browser reports an error or too many
    ///   requests are already pending
    pub async fn send(&self, command: CdpCommand) -> Result<Value> {
        self.send_with_timeout(command, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    /// Sends a command and waits for its response with a custom timeout.
    ///
    /// A timed-out call removes its own correlation entry so the map
    /// cannot accumulate dead waiters.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub async fn send_with_timeout(
        &self,
        command: CdpCommand,
        request_timeout: Duration,
    ) -> Result<Value> {
        let request_id = command.id;

        {
            let correlation = self.correlation.lock();
            if correlation.len() >= MAX_PENDING_REQUESTS {
                warn!(
                    pending = correlation.len(),
                    max = MAX_PENDING_REQUESTS,
                    "Too many pending requests"
                );
                return Err(Error::protocol(format!(
                    "Too many pending requests: {}/{}",
                    correlation.len(),
                    MAX_PENDING_REQUESTS
                )));
            }
        }

        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(ConnectionCommand::Send {
                command,
                response_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        match timeout(request_timeout, response_rx).await {
            Ok(Ok(result)) => result?.into_result(),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                // Timeout - clean up correlation entry
                let _ = self
                    .command_tx
                    .send(ConnectionCommand::RemoveCorrelation(request_id));

                Err(Error::request_timeout(
                    request_id,
                    request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Returns the number of in-flight requests.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlation.lock().len()
    }

    /// Returns `true` while the event loop is still accepting commands.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Shuts down the connection, closing the socket.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }

    /// Event loop that owns the socket.
    async fn run_event_loop<S: WirePipe>(
        pipe: S,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        event_tx: mpsc::UnboundedSender<CdpEvent>,
    ) {
        let (mut ws_write, mut ws_read) = pipe.split();

        loop {
            tokio::select! {
                // Incoming frames from the browser
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_incoming_frame(&text, &correlation, &event_tx);
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                // Commands from the Rust API
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send { command, response_tx }) => {
                            Self::handle_send_command(
                                command,
                                response_tx,
                                &mut ws_write,
                                &correlation,
                            ).await;
                        }

                        Some(ConnectionCommand::RemoveCorrelation(request_id)) => {
                            correlation.lock().remove(&request_id);
                            debug!(%request_id, "Removed timed-out correlation");
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!("Command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        // Fail all pending requests on exit so no caller hangs
        Self::fail_pending_requests(&correlation);

        debug!("Connection event loop terminated");
    }

    /// Classifies one incoming frame and routes it.
    fn handle_incoming_frame(
        text: &str,
        correlation: &Arc<Mutex<CorrelationMap>>,
        event_tx: &mpsc::UnboundedSender<CdpEvent>,
    ) {
        match IncomingFrame::parse(text) {
            Ok(IncomingFrame::Response(response)) => {
                let tx = correlation.lock().remove(&response.id);

                if let Some(tx) = tx {
                    let _ = tx.send(Ok(response));
                } else {
                    warn!(id = %response.id, "Response for unknown request");
                }
            }

            Ok(IncomingFrame::Event(event)) => {
                trace!(method = %event.method, "Event received");
                // Dispatcher gone means we are shutting down; drop silently.
                let _ = event_tx.send(event);
            }

            Err(e) => {
                warn!(error = %e, "Failed to parse incoming frame");
            }
        }
    }

    /// Serializes and writes one outbound command.
    async fn handle_send_command<S: WirePipe>(
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<CdpResponse>>,
        ws_write: &mut SplitSink<S, Message>,
        correlation: &Arc<Mutex<CorrelationMap>>,
    ) {
        let request_id = command.id;

        let json = match serde_json::to_string(&command) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(Error::Json(e)));
                return;
            }
        };

        // Store correlation before sending
        correlation.lock().insert(request_id, response_tx);

        if let Err(e) = ws_write.send(Message::Text(json.into())).await {
            if let Some(tx) = correlation.lock().remove(&request_id) {
                let _ = tx.send(Err(Error::connection(e.to_string())));
            }
        }

        trace!(%request_id, method = %command.method, "Command sent");
    }

    /// Fails all pending requests with ConnectionClosed.
    fn fail_pending_requests(correlation: &Arc<Mutex<CorrelationMap>>) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on shutdown");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
