//! Streaming client implementation
//!
//! The facade a host test framework drives through [`EventSink`]. Lifecycle
//! calls validate scope ordering, turn into events and go through the
//! outbound queue; everything network related runs on the client's own tokio
//! runtime so hosts without one can use it. Transport trouble never reaches
//! the caller, it is visible through [`StreamingClient::status`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Runtime;

use shared::logging::{log_error, log_shutdown, log_startup};
use shared::{AttachmentPayload, Event, Hello, MetadataEntry, RunIdentity, TestStatus, run_debug, run_warn};

use crate::config::{Config, ConfigResolver};
use crate::core::{EnqueueError, OutboundQueue, ScopeRegistry};
use crate::error::{StreamerError, StreamerResult};
use crate::services::{ConnectionManager, WebSocketConnector, write_url_files};
use crate::state::{SharedSessionInfo, create_shared_session, with_session};
use crate::traits::{Connector, Environment, EventSink, ProcessEnvironment};
use crate::types::{CaseOutcome, ConnectionState, LogRecord, ScopeKind, StopReport, StreamStatus};

const RUNTIME_THREADS: usize = 2;

/// Flush window used when a client is dropped mid-run
const DROP_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Exit code after the Ctrl-C hook flushed the stream
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    NotStarted,
    Running,
    Finished,
}

#[derive(Debug, Default)]
struct Counters {
    queue_full_drops: AtomicU64,
    refused_events: AtomicU64,
    contract_violations: AtomicU64,
}

/// Everything that only exists when streaming is enabled
struct Streaming {
    config: Arc<Config>,
    queue: Arc<OutboundQueue>,
    manager: ConnectionManager,
    runtime: Mutex<Option<Runtime>>,
}

struct ClientInner {
    streaming: Option<Streaming>,
    identity: RunIdentity,
    session: SharedSessionInfo,
    phase: Mutex<RunPhase>,
    scopes: Mutex<ScopeRegistry>,
    counters: Counters,
    stop_report: Mutex<Option<StopReport>>,
    url_files_written: Mutex<Vec<PathBuf>>,
    run_label: String,
}

/// Run event streaming client
///
/// Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct StreamingClient {
    inner: Arc<ClientInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StreamingClient {
    /// Client streaming to the collector named in `config` over websockets
    pub fn init(config: Config) -> StreamerResult<Self> {
        Self::with_connector(config, Arc::new(WebSocketConnector::new()))
    }

    /// Client using a custom transport
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> StreamerResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name("testrift-streamer")
            .enable_all()
            .build()
            .map_err(|e| StreamerError::runtime(format!("Failed to start streaming runtime: {}", e)))?;

        let queue = Arc::new(OutboundQueue::new(config.streaming.queue_capacity));
        let session = create_shared_session(config.run_id.clone());
        let manager = ConnectionManager::new(&config, connector, queue.clone(), session.clone(), runtime.handle().clone());

        let identity = config.identity();
        let run_label = config.run_name.clone();
        let streaming = Streaming {
            config: Arc::new(config),
            queue,
            manager,
            runtime: Mutex::new(Some(runtime)),
        };

        Ok(Self::assemble(Some(streaming), identity, session, run_label))
    }

    /// Resolve config from `TESTRIFT_CONFIG` or `testrift.yaml` and connect
    pub fn from_environment() -> StreamerResult<Self> {
        Self::from_resolver(&ConfigResolver::from_current_dir(), &ProcessEnvironment)
    }

    /// Like [`from_environment`](Self::from_environment), but a config or
    /// startup failure yields a disabled client instead of an error
    ///
    /// The failure is logged once and kept as the status' terminal error.
    pub fn from_environment_or_disabled() -> Self {
        Self::from_resolver_or_disabled(&ConfigResolver::from_current_dir(), &ProcessEnvironment)
    }

    pub fn from_resolver(resolver: &ConfigResolver, env: &dyn Environment) -> StreamerResult<Self> {
        let config = resolver.resolve(env)?;
        Self::init(config)
    }

    pub fn from_resolver_or_disabled(resolver: &ConfigResolver, env: &dyn Environment) -> Self {
        match Self::from_resolver(resolver, env) {
            Ok(client) => client,
            Err(error) => {
                log_error("testrift", "Streaming setup", &error);
                let client = Self::disabled();
                with_session(&client.inner.session, |info| info.terminal_error = Some(error));
                client
            }
        }
    }

    /// Client that validates lifecycle calls but streams nothing
    pub fn disabled() -> Self {
        let run_label = crate::config::default_run_name();
        let identity = RunIdentity::new(run_label.clone());
        Self::assemble(None, identity, create_shared_session(None), run_label)
    }

    fn assemble(streaming: Option<Streaming>, identity: RunIdentity, session: SharedSessionInfo, run_label: String) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                streaming,
                identity,
                session,
                phase: Mutex::new(RunPhase::NotStarted),
                scopes: Mutex::new(ScopeRegistry::new()),
                counters: Counters::default(),
                stop_report: Mutex::new(None),
                url_files_written: Mutex::new(Vec::new()),
                run_label,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.streaming.is_some()
    }

    /// Resolved configuration, `None` for a disabled client
    pub fn config(&self) -> Option<&Config> {
        self.inner.streaming.as_ref().map(|streaming| streaming.config.as_ref())
    }

    /// Identity as configured; see [`status`](Self::status) for the authoritative run id
    pub fn run_identity(&self) -> &RunIdentity {
        &self.inner.identity
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    /// Snapshot of everything the client knows about the stream
    pub fn status(&self) -> StreamStatus {
        let inner = &self.inner;
        let info = with_session(&inner.session, |info| info.clone());

        let mut status = StreamStatus::new(inner.connection_state());
        status.run_id = info.run_id;
        status.run_url = info.run_url;
        status.group_url = info.group_url;
        status.terminal_error = info.terminal_error;
        status.acknowledged_events = info.acknowledged_events;
        status.reconnects = info.reconnects;
        status.warnings = info.warnings;
        status.queue_full_drops = inner.counters.queue_full_drops.load(Ordering::Relaxed);
        status.refused_events = inner.counters.refused_events.load(Ordering::Relaxed);
        status.contract_violations = inner.counters.contract_violations.load(Ordering::Relaxed);
        status.stop_report = lock(&inner.stop_report).clone();
        status.url_files_written = lock(&inner.url_files_written).clone();
        status
    }

    /// Flush and close the stream when the process receives Ctrl-C, then exit
    ///
    /// The hook holds no strong reference to the client. A run that is still
    /// going gets the short shutdown window; the process exits with 130 either way.
    pub fn install_shutdown_hook(&self) -> StreamerResult<()> {
        let Some(streaming) = &self.inner.streaming else {
            return Ok(());
        };
        let handle = lock(&streaming.runtime)
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or_else(|| StreamerError::runtime("Streaming runtime already shut down"))?;

        let weak = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let _ = tokio::task::spawn_blocking(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.interrupt();
                }
                std::process::exit(INTERRUPTED_EXIT_CODE);
            })
            .await;
        });
        Ok(())
    }
}

impl ClientInner {
    fn connection_state(&self) -> ConnectionState {
        match &self.streaming {
            Some(streaming) => streaming.manager.state(),
            None => ConnectionState::Closed,
        }
    }

    fn violation(&self, error: StreamerError) -> StreamerError {
        self.counters.contract_violations.fetch_add(1, Ordering::Relaxed);
        run_warn!(self.run_label, "⚠️ Lifecycle contract violation: {}", error);
        error
    }

    /// Validate against the scope registry and queue `event`
    ///
    /// Phase and scope locks stay held until the event is queued, so nothing
    /// lands after `RunFinished` or after the parent scope's finish event.
    fn emit_scoped(&self, check: impl FnOnce(&mut ScopeRegistry) -> StreamerResult<()>, event: Event) -> StreamerResult<()> {
        let phase = lock(&self.phase);
        match *phase {
            RunPhase::Running => {}
            RunPhase::NotStarted => return Err(self.violation(StreamerError::RunNotStarted)),
            RunPhase::Finished => return Err(self.violation(StreamerError::RunAlreadyFinished)),
        }

        let mut scopes = lock(&self.scopes);
        check(&mut *scopes).map_err(|error| self.violation(error))?;
        self.emit(event);
        Ok(())
    }

    /// Queue an event; delivery problems are counted, never returned
    fn emit(&self, event: Event) {
        let Some(streaming) = &self.streaming else {
            return;
        };
        let kind = event.kind();

        match streaming.queue.enqueue(event, streaming.config.streaming.enqueue_timeout) {
            Ok(sequence) => run_debug!(self.run_label, "📥 Queued #{} {}", sequence, kind),
            Err(EnqueueError::QueueFull(waited)) => {
                self.counters.queue_full_drops.fetch_add(1, Ordering::Relaxed);
                run_warn!(self.run_label, "⚠️ Outbound queue full after {:?}, dropped {}", waited, kind);
            }
            Err(EnqueueError::Closed) => {
                self.counters.refused_events.fetch_add(1, Ordering::Relaxed);
                run_debug!(self.run_label, "Streaming stopped, {} not queued", kind);
            }
        }
    }

    /// Identity to report at the end, with the collector's run id if one was assigned
    fn final_identity(&self) -> RunIdentity {
        let mut identity = self.identity.clone();
        if let Some(run_id) = with_session(&self.session, |info| info.run_id.clone()) {
            identity.run_id = Some(run_id);
        }
        identity
    }

    fn metadata(&self) -> (Vec<MetadataEntry>, Vec<MetadataEntry>) {
        match &self.streaming {
            Some(streaming) => (streaming.config.metadata.clone(), streaming.config.group_metadata()),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Stop streaming and record the outcome
    fn finish_stream(&self, flush_timeout: Duration) -> StopReport {
        let Some(streaming) = &self.streaming else {
            return StopReport::default();
        };

        let report = streaming.manager.stop(flush_timeout);
        if report.flush_timed_out {
            let error = StreamerError::FlushTimeout {
                undelivered: report.dropped,
            };
            run_warn!(self.run_label, "⚠️ {}", error);
            with_session(&self.session, |info| info.warnings.push(error.to_string()));
        }

        let (run_url, group_url) = with_session(&self.session, |info| (info.run_url.clone(), info.group_url.clone()));
        match write_url_files(&streaming.config.url_files, run_url.as_deref(), group_url.as_deref()) {
            Ok(written) => lock(&self.url_files_written).extend(written),
            Err(error) => with_session(&self.session, |info| info.warnings.push(error.to_string())),
        }

        *lock(&self.stop_report) = Some(report.clone());
        report
    }

    /// Ctrl-C path: finish the run with the short shutdown window
    fn interrupt(&self) {
        let shutdown_timeout = match &self.streaming {
            Some(streaming) => streaming.config.streaming.shutdown_timeout,
            None => return,
        };
        {
            let mut phase = lock(&self.phase);
            if *phase != RunPhase::Running {
                return;
            }
            *phase = RunPhase::Finished;
        }

        log_shutdown(&self.run_label, "interrupted");
        self.finish_stream(shutdown_timeout);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let running = *lock(&self.phase) == RunPhase::Running;
        if running && self.streaming.is_some() {
            run_warn!(self.run_label, "⚠️ Client dropped before the run finished, flushing briefly");
            self.finish_stream(DROP_FLUSH_TIMEOUT);
        }
        if let Some(streaming) = &self.streaming {
            if let Some(runtime) = lock(&streaming.runtime).take() {
                runtime.shutdown_background();
            }
        }
    }
}

impl EventSink for StreamingClient {
    fn on_run_start(&self) -> StreamerResult<()> {
        let inner = &self.inner;
        let (metadata, group_metadata) = inner.metadata();
        {
            let mut phase = lock(&inner.phase);
            match *phase {
                RunPhase::NotStarted => *phase = RunPhase::Running,
                RunPhase::Running => return Err(inner.violation(StreamerError::RunAlreadyStarted)),
                RunPhase::Finished => return Err(inner.violation(StreamerError::RunAlreadyFinished)),
            }

            inner.emit(Event::RunStarted {
                identity: inner.identity.clone(),
                metadata: metadata.clone(),
                group_metadata: group_metadata.clone(),
            });
        }

        if let Some(streaming) = &inner.streaming {
            streaming.manager.start(Hello::new(&inner.identity, metadata, group_metadata));
        }
        log_startup(&inner.run_label, &format!("run {}", inner.identity));
        Ok(())
    }

    fn on_suite_start(&self, suite_id: &str, name: &str, parent_id: Option<&str>) -> StreamerResult<()> {
        let event = Event::SuiteStarted {
            suite_id: suite_id.to_string(),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
        };
        self.inner.emit_scoped(
            |scopes| {
                if let Some(parent_id) = parent_id {
                    scopes.require_open(parent_id, Some(ScopeKind::Suite))?;
                }
                scopes.open(suite_id, ScopeKind::Suite)
            },
            event,
        )
    }

    fn on_suite_finish(&self, suite_id: &str, status: TestStatus, duration: Duration) -> StreamerResult<()> {
        let event = Event::SuiteFinished {
            suite_id: suite_id.to_string(),
            status,
            duration_ms: duration.as_millis() as u64,
        };
        self.inner.emit_scoped(|scopes| scopes.close(suite_id, ScopeKind::Suite), event)
    }

    fn on_case_start(&self, case_id: &str, suite_id: &str, name: &str) -> StreamerResult<()> {
        let event = Event::CaseStarted {
            case_id: case_id.to_string(),
            suite_id: suite_id.to_string(),
            name: name.to_string(),
        };
        self.inner.emit_scoped(
            |scopes| {
                scopes.require_open(suite_id, Some(ScopeKind::Suite))?;
                scopes.open(case_id, ScopeKind::Case)
            },
            event,
        )
    }

    fn on_case_finish(&self, case_id: &str, outcome: CaseOutcome) -> StreamerResult<()> {
        let event = Event::CaseFinished {
            case_id: case_id.to_string(),
            status: outcome.status,
            duration_ms: outcome.duration.as_millis() as u64,
            failure_message: outcome.failure_message,
            stack_trace: outcome.stack_trace,
        };
        self.inner.emit_scoped(|scopes| scopes.close(case_id, ScopeKind::Case), event)
    }

    fn on_log(&self, scope_id: Option<&str>, record: LogRecord) -> StreamerResult<()> {
        let event = Event::LogLine {
            scope_id: scopes_target(scope_id).map(str::to_string),
            level: record.level,
            text: record.text,
            component: record.component,
            channel: record.channel,
            timestamp: Utc::now(),
        };
        self.inner.emit_scoped(|scopes| require_scope(scopes, scope_id), event)
    }

    fn on_attachment(
        &self,
        scope_id: Option<&str>,
        file_name: &str,
        media_type: &str,
        payload: AttachmentPayload,
    ) -> StreamerResult<()> {
        let event = Event::Attachment {
            scope_id: scopes_target(scope_id).map(str::to_string),
            file_name: file_name.to_string(),
            media_type: media_type.to_string(),
            payload,
        };
        self.inner.emit_scoped(|scopes| require_scope(scopes, scope_id), event)
    }

    fn on_run_finish(&self, overall_status: TestStatus) -> StreamerResult<StopReport> {
        let inner = &self.inner;
        {
            let mut phase = lock(&inner.phase);
            match *phase {
                RunPhase::Running => *phase = RunPhase::Finished,
                RunPhase::NotStarted => return Err(inner.violation(StreamerError::RunNotStarted)),
                RunPhase::Finished => return Err(inner.violation(StreamerError::RunAlreadyFinished)),
            }

            let still_open = lock(&inner.scopes).open_scopes();
            if !still_open.is_empty() {
                let warning = format!("run finished with open scopes: {}", still_open.join(", "));
                run_warn!(inner.run_label, "⚠️ {}", warning);
                with_session(&inner.session, |info| info.warnings.push(warning));
            }

            inner.emit(Event::RunFinished {
                identity: inner.final_identity(),
                overall_status,
            });
        }

        let flush_timeout = match &inner.streaming {
            Some(streaming) => streaming.config.streaming.flush_timeout,
            None => Duration::ZERO,
        };
        let report = inner.finish_stream(flush_timeout);
        log_shutdown(&inner.run_label, &format!("run finished ({})", overall_status));
        Ok(report)
    }
}

/// Empty scope ids mean the run itself
fn scopes_target(scope_id: Option<&str>) -> Option<&str> {
    scope_id.filter(|scope_id| !scope_id.is_empty())
}

fn require_scope(scopes: &mut ScopeRegistry, scope_id: Option<&str>) -> StreamerResult<()> {
    match scopes_target(scope_id) {
        Some(scope_id) => scopes.require_open(scope_id, None).map(|_| ()),
        None => Ok(()),
    }
}
