//! Connection supervisor
//!
//! One session task per run owns the link to the collector. It connects and
//! handshakes with backoff, streams batches from the outbound queue in
//! stop-and-wait fashion (a batch must be acknowledged before the next one
//! goes out), reconnects and resends from the oldest unacknowledged event
//! when the link drops, and falls back to local logging once reconnecting
//! has taken too long. The client side only closes the queue, sets a
//! shutdown deadline and waits for the session's outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use url::Url;

use shared::{
    ClientMessage, ControlMessage, HandshakeResponse, Hello, PROTOCOL_VERSION, ServerMessage, run_debug, run_error,
    run_info, run_warn,
};

use crate::config::{Config, StreamingSettings};
use crate::core::{Backoff, OutboundQueue};
use crate::error::{StreamerError, StreamerResult};
use crate::state::{SharedSessionInfo, with_session};
use crate::traits::{Connector, MessageSink, MessageSource};
use crate::types::{ConnectionState, DrainReason, StopReport};

/// Extra time `stop` waits past the flush window for the session to report back
pub const STOP_GRACE: Duration = Duration::from_millis(500);

const INBOUND_BUFFER: usize = 64;

/// How the session task ended
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionOutcome {
    pub flush_timed_out: bool,
    pub close_confirmed: bool,
    pub terminal: Option<StreamerError>,
}

/// Owns the session task and the connection state
pub struct ConnectionManager {
    endpoint: Url,
    settings: StreamingSettings,
    connector: Arc<dyn Connector>,
    queue: Arc<OutboundQueue>,
    session: SharedSessionInfo,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Sender<Option<Instant>>,
    outcome: Mutex<Option<std_mpsc::Receiver<SessionOutcome>>>,
    started: AtomicBool,
    runtime: Handle,
    run_label: String,
}

impl ConnectionManager {
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        queue: Arc<OutboundQueue>,
        session: SharedSessionInfo,
        runtime: Handle,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(None);

        Self {
            endpoint: config.endpoint.clone(),
            settings: config.streaming.clone(),
            connector,
            queue,
            session,
            state: Arc::new(state),
            shutdown,
            outcome: Mutex::new(None),
            started: AtomicBool::new(false),
            runtime,
            run_label: config.run_name.clone(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch connection state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn the session task; later calls are ignored
    pub fn start(&self, hello: Hello) {
        if self.started.swap(true, Ordering::SeqCst) {
            run_warn!(self.run_label, "⚠️ Connection manager already started");
            return;
        }

        let (outcome_tx, outcome_rx) = std_mpsc::channel();
        *self.outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(outcome_rx);

        let session = Session {
            endpoint: self.endpoint.clone(),
            settings: self.settings.clone(),
            connector: self.connector.clone(),
            queue: self.queue.clone(),
            session: self.session.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.subscribe(),
            hello,
            run_label: self.run_label.clone(),
        };

        run_info!(self.run_label, "📡 Streaming run events to {}", self.endpoint);
        self.runtime.spawn(async move {
            let outcome = session.run().await;
            let _ = outcome_tx.send(outcome);
        });
    }

    /// Flush what is queued and close the link
    ///
    /// Closes the queue, gives the session `flush_timeout` to get everything
    /// acknowledged and returns within that window plus [`STOP_GRACE`] no
    /// matter what the collector does. Whatever is still queued afterwards is
    /// counted as dropped. Blocks the calling thread; must not be called from
    /// a task running on the streaming runtime itself.
    pub fn stop(&self, flush_timeout: Duration) -> StopReport {
        let started_at = std::time::Instant::now();
        self.queue.close();

        let receiver = self.outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        let outcome = match receiver {
            Some(receiver) => {
                self.shutdown.send_replace(Some(Instant::now() + flush_timeout));
                match receiver.recv_timeout(flush_timeout + STOP_GRACE) {
                    Ok(outcome) => Some(outcome),
                    Err(_) => {
                        run_warn!(self.run_label, "⚠️ Session did not wind down within {:?}", flush_timeout);
                        Some(SessionOutcome {
                            flush_timed_out: true,
                            ..SessionOutcome::default()
                        })
                    }
                }
            }
            None => None,
        };

        let abandoned = self.queue.abandon() as u64;
        set_state(&self.state, &self.run_label, ConnectionState::Closed);

        let info = with_session(&self.session, |info| {
            info.undelivered_events += abandoned;
            info.clone()
        });
        let outcome = outcome.unwrap_or_default();

        let report = StopReport {
            delivered: info.acknowledged_events,
            dropped: info.undelivered_events,
            flush_timed_out: outcome.flush_timed_out,
            close_confirmed: outcome.close_confirmed,
            elapsed: started_at.elapsed(),
        };

        if report.is_clean() {
            run_info!(self.run_label, "✅ Stream closed: {} events delivered", report.delivered);
        } else {
            run_warn!(
                self.run_label,
                "⚠️ Stream closed: {} delivered, {} undelivered (flush timed out: {})",
                report.delivered,
                report.dropped,
                report.flush_timed_out
            );
        }
        report
    }
}

fn set_state(state: &watch::Sender<ConnectionState>, run_label: &str, next: ConnectionState) {
    let changed = state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next.clone();
            true
        }
    });
    if changed {
        run_debug!(run_label, "🔄 Connection state → {}", next);
    }
}

/// Resolves once a shutdown deadline is set and has passed
async fn wait_for_deadline(mut shutdown: watch::Receiver<Option<Instant>>) {
    loop {
        let deadline = *shutdown.borrow_and_update();
        if let Some(deadline) = deadline {
            sleep_until(deadline).await;
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Establish {
    Linked(Box<dyn MessageSink>, Box<dyn MessageSource>),
    /// Closed queue fully acknowledged; no reason to reconnect
    Drained,
    GaveUp(StreamerError),
    Terminal(StreamerError),
    DeadlineElapsed,
}

enum StreamEnd {
    Completed { close_confirmed: bool },
    Disconnected(StreamerError),
    Terminal(StreamerError),
    DeadlineElapsed,
}

enum Inbound {
    Message(ServerMessage),
    Lost(StreamerError),
}

enum InboundAction {
    Continue,
    Acked(u64),
    Closed,
    End(StreamEnd),
}

struct Session {
    endpoint: Url,
    settings: StreamingSettings,
    connector: Arc<dyn Connector>,
    queue: Arc<OutboundQueue>,
    session: SharedSessionInfo,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Receiver<Option<Instant>>,
    hello: Hello,
    run_label: String,
}

impl Session {
    async fn run(self) -> SessionOutcome {
        let mut reconnecting = false;

        loop {
            let (mut sink, source) = match self.establish(reconnecting).await {
                Establish::Linked(sink, source) => (sink, source),
                Establish::Drained => {
                    self.set_state(ConnectionState::Closed);
                    return SessionOutcome::default();
                }
                Establish::GaveUp(error) => return self.run_degraded(error).await,
                Establish::Terminal(error) => return self.terminate(error),
                Establish::DeadlineElapsed => return self.flush_timed_out(),
            };

            let end = self.stream(sink.as_mut(), source).await;
            self.close_link(sink.as_mut()).await;

            match end {
                StreamEnd::Completed { close_confirmed } => {
                    self.set_state(ConnectionState::Closed);
                    return SessionOutcome {
                        close_confirmed,
                        ..SessionOutcome::default()
                    };
                }
                StreamEnd::Disconnected(error) => {
                    run_warn!(self.run_label, "⚠️ Lost collector link: {}", error);
                    with_session(&self.session, |info| info.reconnects += 1);
                    reconnecting = true;
                }
                StreamEnd::Terminal(error) => return self.terminate(error),
                StreamEnd::DeadlineElapsed => return self.flush_timed_out(),
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        set_state(&self.state, &self.run_label, next);
    }

    /// Streaming turns into draining once the queue stops taking events
    fn mark_draining(&self) {
        if self.queue.is_closed() && matches!(*self.state.borrow(), ConnectionState::Streaming) {
            self.set_state(ConnectionState::Draining(DrainReason::Shutdown));
        }
    }

    /// Connect and handshake, retrying with backoff
    async fn establish(&self, reconnecting: bool) -> Establish {
        let started = Instant::now();
        let mut backoff = Backoff::from_settings(&self.settings);
        let deadline = wait_for_deadline(self.shutdown.clone());
        tokio::pin!(deadline);

        loop {
            if self.queue.is_drained() {
                return Establish::Drained;
            }
            self.set_state(if reconnecting {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            let result = tokio::select! {
                biased;
                _ = &mut deadline => return Establish::DeadlineElapsed,
                result = self.connect_and_handshake() => result,
            };

            let error = match result {
                Ok((sink, source)) => return Establish::Linked(sink, source),
                Err(error) if error.is_terminal() => return Establish::Terminal(error),
                Err(error) => error,
            };

            if started.elapsed() >= self.settings.max_reconnect_elapsed {
                return Establish::GaveUp(error);
            }

            let delay = backoff.next_delay();
            run_warn!(
                self.run_label,
                "⚠️ Collector attempt {} failed: {}, retrying in {:?}",
                backoff.attempts(),
                error,
                delay
            );

            tokio::select! {
                biased;
                _ = &mut deadline => return Establish::DeadlineElapsed,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn connect_and_handshake(&self) -> StreamerResult<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
        let (mut sink, mut source) = match timeout(self.settings.connect_timeout, self.connector.connect(&self.endpoint)).await {
            Ok(link) => link?,
            Err(_) => {
                return Err(StreamerError::transport(format!(
                    "Connect timed out after {:?}",
                    self.settings.connect_timeout
                )));
            }
        };

        self.set_state(ConnectionState::Handshaking);
        sink.send(ClientMessage::Hello(self.hello_for_epoch())).await?;

        let response = match timeout(self.settings.handshake_timeout, source.next_message()).await {
            Err(_) => {
                return Err(StreamerError::transport(format!(
                    "Handshake timed out after {:?}",
                    self.settings.handshake_timeout
                )));
            }
            Ok(None) => return Err(StreamerError::transport("Collector closed the link during handshake")),
            Ok(Some(Err(error))) => return Err(error),
            Ok(Some(Ok(ServerMessage::HandshakeResponse(response)))) => response,
            Ok(Some(Ok(ServerMessage::Control(control)))) if control.is_terminal() => {
                return Err(control_error(control));
            }
            Ok(Some(Ok(other))) => {
                return Err(StreamerError::transport(format!("Unexpected message during handshake: {:?}", other)));
            }
        };

        if response.protocol_version != PROTOCOL_VERSION {
            return Err(StreamerError::ProtocolVersionMismatch {
                client: PROTOCOL_VERSION,
                server: response.protocol_version,
            });
        }
        if !response.accepted {
            return Err(StreamerError::HandshakeRejected {
                reason: response.reason.unwrap_or_else(|| "no reason given".to_string()),
            });
        }

        self.apply_handshake(&response);
        Ok((sink, source))
    }

    /// Hello for the next connection epoch
    fn hello_for_epoch(&self) -> Hello {
        let mut hello = self.hello.clone();
        if let Some(run_id) = with_session(&self.session, |info| info.run_id.clone()) {
            hello.run_id = Some(run_id);
        }
        hello.resume_from = self.queue.oldest_unacknowledged();
        hello
    }

    fn apply_handshake(&self, response: &HandshakeResponse) {
        self.record_assignment(response.run_id.as_deref(), response.run_url.as_deref(), response.group_url.as_deref());
        let run_id = with_session(&self.session, |info| info.run_id.clone());
        run_info!(
            self.run_label,
            "🤝 Handshake accepted (run id {})",
            run_id.as_deref().unwrap_or("unassigned")
        );
    }

    fn record_assignment(&self, run_id: Option<&str>, run_url: Option<&str>, group_url: Option<&str>) {
        let warning = with_session(&self.session, |info| {
            if let Some(url) = run_url {
                info.run_url = Some(url.to_string());
            }
            if let Some(url) = group_url {
                info.group_url = Some(url.to_string());
            }
            run_id.and_then(|run_id| info.assign_run_id(run_id))
        });
        if let Some(warning) = warning {
            run_warn!(self.run_label, "⚠️ {}", warning);
        }
    }

    /// Send batches until the queue is drained or the link ends
    async fn stream(&self, sink: &mut dyn MessageSink, source: Box<dyn MessageSource>) -> StreamEnd {
        self.set_state(ConnectionState::Streaming);
        self.mark_draining();
        self.queue.rewind();

        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let receiver = tokio::spawn(receive_loop(source, inbound_tx));

        let end = self.send_loop(sink, &mut inbound_rx).await;
        receiver.abort();
        end
    }

    async fn send_loop(&self, sink: &mut dyn MessageSink, inbound: &mut mpsc::Receiver<Inbound>) -> StreamEnd {
        let queue = self.queue.clone();
        let batch_size = self.settings.batch_size;
        let deadline = wait_for_deadline(self.shutdown.clone());
        tokio::pin!(deadline);

        loop {
            let batch = tokio::select! {
                biased;
                _ = &mut deadline => return StreamEnd::DeadlineElapsed,
                message = inbound.recv() => {
                    if let InboundAction::End(end) = self.handle_inbound(message) {
                        return end;
                    }
                    continue;
                }
                batch = queue.next_batch(batch_size) => batch,
            };

            self.mark_draining();
            let Some(highest) = batch.last().map(|event| event.sequence) else {
                return self.complete(sink, inbound, deadline.as_mut()).await;
            };
            let count = batch.len();

            if let Err(error) = sink.send(ClientMessage::Events { events: batch }).await {
                return StreamEnd::Disconnected(error);
            }
            run_debug!(self.run_label, "📤 Sent {} events up to #{}", count, highest);

            let ack_wait = sleep(self.settings.ack_timeout);
            tokio::pin!(ack_wait);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut deadline => return StreamEnd::DeadlineElapsed,
                    message = inbound.recv() => match self.handle_inbound(message) {
                        InboundAction::Acked(up_to) if up_to >= highest => break,
                        InboundAction::End(end) => return end,
                        _ => {}
                    },
                    _ = &mut ack_wait => {
                        return StreamEnd::Disconnected(StreamerError::transport(format!(
                            "No ack for #{} within {:?}",
                            highest, self.settings.ack_timeout
                        )));
                    }
                }
            }
        }
    }

    /// Everything is acknowledged: announce completion and wait for `closed`
    async fn complete(
        &self,
        sink: &mut dyn MessageSink,
        inbound: &mut mpsc::Receiver<Inbound>,
        mut deadline: Pin<&mut impl Future<Output = ()>>,
    ) -> StreamEnd {
        self.mark_draining();
        let last_sequence = self.queue.next_sequence().checked_sub(1);

        if let Err(error) = sink.send(ClientMessage::Complete { last_sequence }).await {
            run_debug!(self.run_label, "Complete not delivered: {}", error);
            return StreamEnd::Completed { close_confirmed: false };
        }

        let close_wait = sleep(self.settings.close_timeout);
        tokio::pin!(close_wait);

        loop {
            tokio::select! {
                biased;
                _ = deadline.as_mut() => return StreamEnd::Completed { close_confirmed: false },
                _ = &mut close_wait => {
                    run_debug!(self.run_label, "No close confirmation within {:?}", self.settings.close_timeout);
                    return StreamEnd::Completed { close_confirmed: false };
                }
                message = inbound.recv() => match self.handle_inbound(message) {
                    InboundAction::Closed => return StreamEnd::Completed { close_confirmed: true },
                    InboundAction::End(_) => return StreamEnd::Completed { close_confirmed: false },
                    _ => {}
                },
            }
        }
    }

    fn handle_inbound(&self, message: Option<Inbound>) -> InboundAction {
        let message = match message {
            Some(Inbound::Message(message)) => message,
            Some(Inbound::Lost(error)) => return InboundAction::End(StreamEnd::Disconnected(error)),
            None => {
                return InboundAction::End(StreamEnd::Disconnected(StreamerError::transport("Receiver stopped")));
            }
        };

        match message {
            ServerMessage::Ack { ack_up_to } => {
                let removed = self.queue.acknowledge(ack_up_to);
                with_session(&self.session, |info| info.acknowledged_events += removed as u64);
                InboundAction::Acked(ack_up_to)
            }
            ServerMessage::Control(ControlMessage::RunAssigned {
                run_id,
                run_url,
                group_url,
            }) => {
                self.record_assignment(Some(&run_id), run_url.as_deref(), group_url.as_deref());
                InboundAction::Continue
            }
            ServerMessage::Control(control) => InboundAction::End(StreamEnd::Terminal(control_error(control))),
            ServerMessage::Closed => InboundAction::Closed,
            ServerMessage::HandshakeResponse(_) => {
                run_warn!(self.run_label, "⚠️ Ignoring handshake response outside a handshake");
                InboundAction::Continue
            }
        }
    }

    /// Close the link, never waiting past the shutdown deadline
    async fn close_link(&self, sink: &mut dyn MessageSink) {
        let budget = match *self.shutdown.borrow() {
            Some(deadline) => self
                .settings
                .close_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.settings.close_timeout,
        };
        match timeout(budget, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => run_debug!(self.run_label, "Link close failed: {}", error),
            Err(_) => run_debug!(self.run_label, "Link close timed out"),
        }
    }

    /// The session is over for good; nothing queued will be sent
    fn terminate(&self, error: StreamerError) -> SessionOutcome {
        run_error!(self.run_label, "❌ Streaming stopped: {}", error);

        let reason = match &error {
            StreamerError::RunCancelled { reason } => DrainReason::Cancelled(reason.clone()),
            other => DrainReason::Fatal(other.to_string()),
        };
        self.set_state(ConnectionState::Draining(reason));

        let dropped = self.queue.abandon() as u64;
        with_session(&self.session, |info| {
            info.undelivered_events += dropped;
            info.terminal_error = Some(error.clone());
        });

        self.set_state(ConnectionState::Closed);
        SessionOutcome {
            terminal: Some(error),
            ..SessionOutcome::default()
        }
    }

    /// Collector unreachable: keep the run going, log events locally
    async fn run_degraded(&self, error: StreamerError) -> SessionOutcome {
        let warning = format!("collector unreachable, events logged locally only: {}", error);
        run_warn!(self.run_label, "⚠️ Giving up on {}: {}", self.endpoint, error);
        with_session(&self.session, |info| info.warnings.push(warning));
        self.set_state(ConnectionState::Degraded);

        let queue = self.queue.clone();
        queue.rewind();

        loop {
            let batch = queue.next_batch(self.settings.batch_size).await;
            let Some(highest) = batch.last().map(|event| event.sequence) else {
                break;
            };

            for event in &batch {
                let rendered = serde_json::to_string(&event.event).unwrap_or_else(|_| event.event.kind().to_string());
                run_debug!(self.run_label, "📝 Undelivered #{}: {}", event.sequence, rendered);
            }

            let removed = queue.acknowledge(highest) as u64;
            with_session(&self.session, |info| info.undelivered_events += removed);
        }

        self.set_state(ConnectionState::Closed);
        SessionOutcome::default()
    }

    fn flush_timed_out(&self) -> SessionOutcome {
        run_warn!(
            self.run_label,
            "⚠️ Flush window elapsed with {} events unacknowledged",
            self.queue.len()
        );
        SessionOutcome {
            flush_timed_out: true,
            ..SessionOutcome::default()
        }
    }
}

fn control_error(control: ControlMessage) -> StreamerError {
    match control {
        ControlMessage::RunCancelled { reason } => StreamerError::RunCancelled { reason },
        ControlMessage::ProtocolVersionMismatch { server_version } => StreamerError::ProtocolVersionMismatch {
            client: PROTOCOL_VERSION,
            server: server_version,
        },
        ControlMessage::Fatal { reason } => StreamerError::CollectorFatal { reason },
        ControlMessage::RunAssigned { run_id, .. } => {
            StreamerError::transport(format!("Unexpected run assignment {} during handshake", run_id))
        }
    }
}

/// Forward collector messages until the link ends
async fn receive_loop(mut source: Box<dyn MessageSource>, inbound: mpsc::Sender<Inbound>) {
    loop {
        let message = match source.next_message().await {
            Some(Ok(message)) => Inbound::Message(message),
            Some(Err(error)) => Inbound::Lost(error),
            None => Inbound::Lost(StreamerError::transport("Collector closed the link")),
        };
        let lost = matches!(message, Inbound::Lost(_));
        if inbound.send(message).await.is_err() || lost {
            break;
        }
    }
}
