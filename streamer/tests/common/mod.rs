//! Shared fixtures for streamer integration tests
//!
//! `TestCollector` is a small axum websocket collector speaking the run
//! protocol. It records everything it receives and can be told to misbehave.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use url::Url;

use shared::{ClientMessage, HandshakeResponse, Hello, PROTOCOL_VERSION, SequencedEvent, ServerMessage};
use streamer::Config;

/// How the collector behaves
#[derive(Clone, Debug)]
pub struct CollectorOptions {
    pub reject: Option<String>,
    pub server_version: u32,
    pub run_id: String,
    pub run_url: Option<String>,
    pub group_url: Option<String>,
    /// Hang up the first connection once this many events arrived, without acking
    pub drop_after_events: Option<usize>,
    /// Never acknowledge events
    pub silent: bool,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            reject: None,
            server_version: PROTOCOL_VERSION,
            run_id: "collector-run-1".to_string(),
            run_url: None,
            group_url: None,
            drop_after_events: None,
            silent: false,
        }
    }
}

/// Everything the collector received
#[derive(Clone, Debug, Default)]
pub struct Recorded {
    pub connections: usize,
    pub hellos: Vec<Hello>,
    pub deliveries: Vec<SequencedEvent>,
    pub completes: Vec<Option<u64>>,
}

impl Recorded {
    /// Events deduplicated by sequence, in order of first delivery
    pub fn unique_events(&self) -> Vec<SequencedEvent> {
        let mut unique: Vec<SequencedEvent> = Vec::new();
        for event in &self.deliveries {
            if !unique.iter().any(|seen| seen.sequence == event.sequence) {
                unique.push(event.clone());
            }
        }
        unique
    }

    pub fn unique_kinds(&self) -> Vec<&'static str> {
        self.unique_events().iter().map(|event| event.event.kind()).collect()
    }
}

enum Reply {
    Send(ServerMessage),
    Nothing,
    HangUp,
}

struct CollectorState {
    options: CollectorOptions,
    recorded: Mutex<Recorded>,
    dropped_once: AtomicBool,
}

impl CollectorState {
    fn handle(&self, message: ClientMessage) -> Reply {
        match message {
            ClientMessage::Hello(hello) => {
                self.recorded.lock().unwrap().hellos.push(hello);
                let response = match &self.options.reject {
                    Some(reason) => HandshakeResponse::reject(reason.clone()),
                    None => {
                        let mut response = HandshakeResponse::accept(self.options.run_id.clone());
                        response.protocol_version = self.options.server_version;
                        response.run_url = self.options.run_url.clone();
                        response.group_url = self.options.group_url.clone();
                        response
                    }
                };
                Reply::Send(ServerMessage::HandshakeResponse(response))
            }
            ClientMessage::Events { events } => {
                let Some(last) = events.last().map(|event| event.sequence) else {
                    return Reply::Nothing;
                };
                let total = {
                    let mut recorded = self.recorded.lock().unwrap();
                    recorded.deliveries.extend(events);
                    recorded.deliveries.len()
                };

                let should_drop = self.options.drop_after_events.is_some_and(|limit| total >= limit);
                if should_drop && !self.dropped_once.swap(true, Ordering::SeqCst) {
                    Reply::HangUp
                } else if self.options.silent {
                    Reply::Nothing
                } else {
                    Reply::Send(ServerMessage::Ack { ack_up_to: last })
                }
            }
            ClientMessage::Complete { last_sequence } => {
                self.recorded.lock().unwrap().completes.push(last_sequence);
                Reply::Send(ServerMessage::Closed)
            }
        }
    }
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<CollectorState>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<CollectorState>) {
    state.recorded.lock().unwrap().connections += 1;

    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(message) = serde_json::from_str::<ClientMessage>(&text) else {
            continue;
        };

        match state.handle(message) {
            Reply::Send(reply) => {
                let frame = serde_json::to_string(&reply).unwrap();
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            Reply::Nothing => {}
            Reply::HangUp => return,
        }
    }
}

/// Collector listening on an ephemeral local port
pub struct TestCollector {
    addr: SocketAddr,
    state: Arc<CollectorState>,
}

impl TestCollector {
    pub async fn start(options: CollectorOptions) -> Self {
        let state = Arc::new(CollectorState {
            options,
            recorded: Mutex::new(Recorded::default()),
            dropped_once: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/ws/runs", get(websocket_handler))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Plain http URL; the client derives the websocket endpoint
    pub fn server_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn recorded(&self) -> Recorded {
        self.state.recorded.lock().unwrap().clone()
    }
}

/// Client config with timeouts short enough for tests
pub fn fast_config(server_url: Url) -> Config {
    let mut config = Config::new(server_url).unwrap();
    config.run_name = "integration-run".to_string();
    config.streaming.connect_timeout = Duration::from_millis(500);
    config.streaming.handshake_timeout = Duration::from_millis(500);
    config.streaming.ack_timeout = Duration::from_millis(500);
    config.streaming.close_timeout = Duration::from_millis(500);
    config.streaming.backoff_base = Duration::from_millis(20);
    config.streaming.backoff_cap = Duration::from_millis(100);
    config.streaming.max_reconnect_elapsed = Duration::from_millis(400);
    config.streaming.flush_timeout = Duration::from_secs(3);
    config
}

/// Port nothing listens on
pub fn closed_port_url() -> Url {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap()
}

/// Poll `condition` every 10ms until it holds or `timeout_ms` passes
pub async fn wait_for_condition<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    loop {
        if condition() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
