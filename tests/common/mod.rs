//! Scripted in-process browser for integration tests.
//!
//! Implements just enough of the DevTools wire behavior to exercise the
//! control plane end to end: a duplex message pipe the connection layer
//! adopts, plus a responder task that answers commands from a small
//! target table and can inject events on demand.

use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

static TRACING: Once = Once::new();

/// Installs the test tracing subscriber once per process; scenario output
/// is routed through the capture writer and honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Duplex Pipe
// ============================================================================

/// Connection-side half of the in-memory duplex.
pub struct FakePipe {
    rx: mpsc::UnboundedReceiver<Result<Message, WsError>>,
    tx: mpsc::UnboundedSender<Message>,
    close_sent: bool,
}

impl Stream for FakePipe {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Sink<Message> for FakePipe {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
        self.tx.send(item).map_err(|_| WsError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        if !self.close_sent {
            self.close_sent = true;
            let _ = self.tx.send(Message::Close(None));
        }
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// Fake Browser
// ============================================================================

/// One simulated target.
#[derive(Debug, Clone)]
pub struct FakeTarget {
    pub target_id: String,
    pub target_type: String,
    pub url: String,
}

#[derive(Default)]
pub struct FakeState {
    pub targets: Vec<FakeTarget>,
    /// Every command method received, in wire order.
    pub methods: Vec<String>,
    /// When set, every `Runtime.evaluate` answers with this payload
    /// instead of the scripted per-target one.
    pub evaluate_response: Option<Value>,
    next_target: u32,
}

impl FakeState {
    fn target_infos(&self) -> Value {
        let infos: Vec<Value> = self
            .targets
            .iter()
            .map(|t| {
                json!({
                    "targetId": t.target_id,
                    "type": t.target_type,
                    "url": t.url,
                    "title": "",
                    "attached": false,
                })
            })
            .collect();
        json!({ "targetInfos": infos })
    }
}

/// Handle to the scripted browser.
pub struct FakeBrowser {
    pub state: Arc<Mutex<FakeState>>,
    event_tx: mpsc::UnboundedSender<Result<Message, WsError>>,
}

impl FakeBrowser {
    /// Session ID the responder assigns to a target.
    pub fn session_for(target_id: &str) -> String {
        format!("sess-{target_id}")
    }

    /// Number of times a command method was received.
    pub fn count_method(&self, method: &str) -> usize {
        self.state
            .lock()
            .methods
            .iter()
            .filter(|m| *m == method)
            .count()
    }

    /// Injects a raw protocol event frame.
    pub fn emit(&self, method: &str, params: Value, session_id: Option<&str>) {
        let mut frame = json!({ "method": method, "params": params });
        if let Some(sid) = session_id {
            frame["sessionId"] = json!(sid);
        }
        let _ = self
            .event_tx
            .send(Ok(Message::Text(frame.to_string().into())));
    }

    /// Injects a console call from the given session.
    pub fn emit_console(&self, session_id: &str, level: &str, message: &str) {
        self.emit(
            "Runtime.consoleAPICalled",
            json!({
                "type": level,
                "executionContextId": 1,
                "args": [{ "type": "string", "value": message }],
            }),
            Some(session_id),
        );
    }

    /// Announces a target the way discovery notifications do.
    pub fn emit_target_created(&self, target: &FakeTarget) {
        self.emit(
            "Target.targetCreated",
            json!({
                "targetInfo": {
                    "targetId": target.target_id,
                    "type": target.target_type,
                    "url": target.url,
                    "title": "",
                    "attached": false,
                }
            }),
            None,
        );
    }
}

/// Starts a scripted browser seeded with `(target_id, type, url)` rows.
///
/// Returns the pipe to adopt and the browser handle.
pub fn fake_browser(seed: &[(&str, &str, &str)]) -> (FakePipe, FakeBrowser) {
    let (to_peer_tx, mut to_peer_rx) = mpsc::unbounded_channel::<Message>();
    let (from_peer_tx, from_peer_rx) = mpsc::unbounded_channel::<Result<Message, WsError>>();

    init_tracing();

    let state = Arc::new(Mutex::new(FakeState {
        targets: seed
            .iter()
            .map(|(id, ty, url)| FakeTarget {
                target_id: (*id).to_string(),
                target_type: (*ty).to_string(),
                url: (*url).to_string(),
            })
            .collect(),
        methods: Vec::new(),
        evaluate_response: None,
        next_target: 1,
    }));

    let pipe = FakePipe {
        rx: from_peer_rx,
        tx: to_peer_tx,
        close_sent: false,
    };
    let browser = FakeBrowser {
        state: Arc::clone(&state),
        event_tx: from_peer_tx.clone(),
    };

    tokio::spawn(async move {
        while let Some(message) = to_peer_rx.recv().await {
            let text = match message {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(command) = serde_json::from_str::<Value>(text.as_str()) else {
                continue;
            };

            let id = command["id"].as_u64().unwrap_or(0);
            let method = command["method"].as_str().unwrap_or("").to_string();
            let params = command["params"].clone();
            let session_id = command["sessionId"].as_str().map(str::to_string);

            let (result, followups) = respond(&state, &method, &params, session_id.as_deref());
            state.lock().methods.push(method);

            let response = json!({ "id": id, "result": result });
            if from_peer_tx
                .send(Ok(Message::Text(response.to_string().into())))
                .is_err()
            {
                break;
            }
            for frame in followups {
                let _ = from_peer_tx.send(Ok(Message::Text(frame.to_string().into())));
            }
        }
    });

    (pipe, browser)
}

/// Computes the response (and any follow-up event frames) for one command.
fn respond(
    state: &Arc<Mutex<FakeState>>,
    method: &str,
    params: &Value,
    session_id: Option<&str>,
) -> (Value, Vec<Value>) {
    match method {
        "Target.getTargets" => (state.lock().target_infos(), Vec::new()),

        "Target.attachToTarget" => {
            let target_id = params["targetId"].as_str().unwrap_or("");
            (
                json!({ "sessionId": FakeBrowser::session_for(target_id) }),
                Vec::new(),
            )
        }

        "Target.createTarget" => {
            let url = params["url"].as_str().unwrap_or("about:blank").to_string();
            let mut locked = state.lock();
            let target_id = format!("NEW{}", locked.next_target);
            locked.next_target += 1;
            locked.targets.push(FakeTarget {
                target_id: target_id.clone(),
                target_type: "page".to_string(),
                url: url.clone(),
            });
            let created = json!({
                "method": "Target.targetCreated",
                "params": { "targetInfo": {
                    "targetId": target_id,
                    "type": "page",
                    "url": url,
                    "title": "",
                    "attached": false,
                }},
            });
            (json!({ "targetId": target_id }), vec![created])
        }

        "Target.closeTarget" => {
            let target_id = params["targetId"].as_str().unwrap_or("").to_string();
            state.lock().targets.retain(|t| t.target_id != target_id);
            let destroyed = json!({
                "method": "Target.targetDestroyed",
                "params": { "targetId": target_id },
            });
            (json!({ "success": true }), vec![destroyed])
        }

        "Target.getTargetInfo" => {
            let target_id = params["targetId"].as_str().unwrap_or("");
            let locked = state.lock();
            let info = locked
                .targets
                .iter()
                .find(|t| t.target_id == target_id)
                .map(|t| {
                    json!({
                        "targetId": t.target_id,
                        "type": t.target_type,
                        "url": t.url,
                        "title": "",
                        "attached": true,
                    })
                })
                .unwrap_or_else(|| json!({}));
            (json!({ "targetInfo": info }), Vec::new())
        }

        // The page answers from the target the session is bound to, the
        // way a real page reports its own visibility and location.
        "Runtime.evaluate" => {
            let locked = state.lock();
            if let Some(scripted) = locked.evaluate_response.clone() {
                return (scripted, Vec::new());
            }
            let page_view = session_id
                .and_then(|sid| sid.strip_prefix("sess-"))
                .and_then(|tid| locked.targets.iter().find(|t| t.target_id == tid))
                .map_or_else(
                    || json!({ "visibility": "hidden", "href": "", "title": "" }),
                    |t| json!({ "visibility": "visible", "href": t.url, "title": "" }),
                );
            (
                json!({ "result": { "type": "string", "value": page_view.to_string() } }),
                Vec::new(),
            )
        }

        // setDiscoverTargets, enables, activation, Browser.close, ...
        _ => (json!({}), Vec::new()),
    }
}
