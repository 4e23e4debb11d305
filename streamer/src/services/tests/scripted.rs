//! In-memory collector for driving the connection manager

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use shared::{ClientMessage, ControlMessage, HandshakeResponse, Hello, PROTOCOL_VERSION, SequencedEvent, ServerMessage};

use crate::error::{StreamerError, StreamerResult};
use crate::traits::{Connector, MessageSink, MessageSource};

/// How the collector behaves
#[derive(Clone, Debug, Default)]
pub struct Script {
    pub reject: Option<String>,
    pub server_version: Option<u32>,
    pub assigned_run_id: Option<String>,
    pub run_url: Option<String>,
    pub group_url: Option<String>,
    /// Drop the first link once this many events were received, without acking
    pub drop_after_events: Option<usize>,
    /// Stop acknowledging on the first link once this many events were received, keeping it open
    pub stall_after_events: Option<usize>,
    /// Cancel the run once this many events were received
    pub cancel_after_events: Option<usize>,
    /// Report a fatal collector error once this many events were received
    pub fatal_after_events: Option<usize>,
    /// Send a run assignment with this run URL before the first ack
    pub reassign_run_url: Option<String>,
    /// Never answer `complete` with `closed`
    pub never_confirm_close: bool,
    /// Closing the client's side of the link never finishes
    pub stall_close: bool,
    /// Never acknowledge anything
    pub silent: bool,
    /// Refuse every connection attempt
    pub refuse_all: bool,
    /// Refuse this many connection attempts before accepting
    pub refuse_first: usize,
}

/// What the collector saw
#[derive(Clone, Debug, Default)]
pub struct Recorded {
    pub connects: usize,
    pub hellos: Vec<Hello>,
    pub deliveries: Vec<SequencedEvent>,
    pub completes: Vec<Option<u64>>,
}

impl Recorded {
    pub fn delivered_sequences(&self) -> Vec<u64> {
        self.deliveries.iter().map(|event| event.sequence).collect()
    }

    /// Sequences in order of first delivery
    pub fn first_deliveries(&self) -> Vec<u64> {
        let mut seen = Vec::new();
        for sequence in self.delivered_sequences() {
            if !seen.contains(&sequence) {
                seen.push(sequence);
            }
        }
        seen
    }
}

pub struct ScriptedConnector {
    script: Script,
    recorded: Arc<Mutex<Recorded>>,
    dropped_once: Arc<AtomicBool>,
    stalled_once: Arc<AtomicBool>,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            recorded: Arc::new(Mutex::new(Recorded::default())),
            dropped_once: Arc::new(AtomicBool::new(false)),
            stalled_once: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn recorded(&self) -> Recorded {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _endpoint: &Url) -> StreamerResult<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
        let attempt = {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.connects += 1;
            recorded.connects
        };
        if self.script.refuse_all || attempt <= self.script.refuse_first {
            return Err(StreamerError::transport("connection refused"));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(
            self.script.clone(),
            self.recorded.clone(),
            self.dropped_once.clone(),
            self.stalled_once.clone(),
            client_rx,
            server_tx,
        ));

        Ok((
            Box::new(ChannelSink {
                tx: Some(client_tx),
                stall_close: self.script.stall_close,
            }),
            Box::new(ChannelSource { rx: server_rx }),
        ))
    }
}

async fn serve(
    script: Script,
    recorded: Arc<Mutex<Recorded>>,
    dropped_once: Arc<AtomicBool>,
    stalled_once: Arc<AtomicBool>,
    mut inbound: mpsc::UnboundedReceiver<ClientMessage>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
) {
    let assigned_run_id = script.assigned_run_id.clone().unwrap_or_else(|| "run-1".to_string());
    let mut stalled = false;
    let mut reassigned = false;

    while let Some(message) = inbound.recv().await {
        let reply = match message {
            ClientMessage::Hello(hello) => {
                recorded.lock().unwrap().hellos.push(hello);
                match &script.reject {
                    Some(reason) => ServerMessage::HandshakeResponse(HandshakeResponse::reject(reason.clone())),
                    None => {
                        let mut response = HandshakeResponse::accept(assigned_run_id.clone());
                        response.protocol_version = script.server_version.unwrap_or(PROTOCOL_VERSION);
                        response.run_url = script.run_url.clone();
                        response.group_url = script.group_url.clone();
                        ServerMessage::HandshakeResponse(response)
                    }
                }
            }
            ClientMessage::Events { events } => {
                let Some(last) = events.last().map(|event| event.sequence) else {
                    continue;
                };
                let total = {
                    let mut recorded = recorded.lock().unwrap();
                    recorded.deliveries.extend(events);
                    recorded.deliveries.len()
                };

                if script.drop_after_events.is_some_and(|limit| total >= limit) && !dropped_once.swap(true, Ordering::SeqCst) {
                    return;
                }
                if script.stall_after_events.is_some_and(|limit| total >= limit) && !stalled_once.swap(true, Ordering::SeqCst) {
                    stalled = true;
                }
                if let Some(run_url) = script.reassign_run_url.clone().filter(|_| !reassigned) {
                    reassigned = true;
                    let assignment = ServerMessage::Control(ControlMessage::RunAssigned {
                        run_id: assigned_run_id.clone(),
                        run_url: Some(run_url),
                        group_url: None,
                    });
                    if outbound.send(assignment).is_err() {
                        return;
                    }
                }

                if script.cancel_after_events.is_some_and(|limit| total >= limit) {
                    ServerMessage::Control(ControlMessage::RunCancelled {
                        reason: "cancelled by operator".to_string(),
                    })
                } else if script.fatal_after_events.is_some_and(|limit| total >= limit) {
                    ServerMessage::Control(ControlMessage::Fatal {
                        reason: "storage full".to_string(),
                    })
                } else if script.silent || stalled {
                    continue;
                } else {
                    ServerMessage::Ack { ack_up_to: last }
                }
            }
            ClientMessage::Complete { last_sequence } => {
                recorded.lock().unwrap().completes.push(last_sequence);
                if script.never_confirm_close {
                    continue;
                }
                ServerMessage::Closed
            }
        };

        if outbound.send(reply).is_err() {
            return;
        }
    }
}

struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<ClientMessage>>,
    stall_close: bool,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, message: ClientMessage) -> StreamerResult<()> {
        let tx = self.tx.as_ref().ok_or_else(|| StreamerError::transport("link closed"))?;
        tx.send(message).map_err(|_| StreamerError::transport("collector went away"))
    }

    async fn close(&mut self) -> StreamerResult<()> {
        if self.stall_close {
            std::future::pending::<()>().await;
        }
        self.tx = None;
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next_message(&mut self) -> Option<StreamerResult<ServerMessage>> {
        self.rx.recv().await.map(Ok)
    }
}
