//! The bridge: one supervised automation process and its command channel.
//!
//! A [`Bridge`] is constructed explicitly and owned by its caller; there is
//! no process-wide instance. `initialize` selects a runtime, launches the
//! script, and starts three tasks per launch:
//!
//! - the stdout pump, which owns the protocol [`LineCodec`] and routes
//!   responses to the [`Dispatcher`], events to subscribers, and other
//!   lines to the [`DiagnosticFilter`];
//! - the stderr pump, which only produces diagnostics;
//! - the monitor, which owns the child and reacts to its exit.
//!
//! Each launch gets a new generation number. Tasks from an older
//! generation never mutate the state of a newer one.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{load_runtime_override, BridgeConfig};
use crate::diagnostics::DiagnosticFilter;
use crate::dispatcher::{CommandError, Dispatcher};
use crate::protocol::{normalise_params, InboundMessage, LineCodec};
use crate::runtime::version::CompatibilityPolicy;
use crate::runtime::{
    ResolvedRuntime, RuntimeCandidate, RuntimeError, RuntimeProbe, RuntimeSelector, SystemProbe,
};
use crate::supervisor::{
    is_missing_executable, LaunchError, LaunchRequest, LaunchStrategy, OutputMode, ProcessHandle,
    Supervisor,
};

/// Stderr lines kept for exit diagnosis.
const STDERR_TAIL_LINES: usize = 20;

/// Read size for the output pumps.
const READ_CHUNK: usize = 8 * 1024;

/// Lifecycle of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Nothing has been attempted yet.
    Uninitialized,
    /// Probing runtime candidates.
    Detecting,
    /// Trying a launch strategy.
    Launching(LaunchStrategy),
    /// Process running and accepting commands.
    Ready,
    /// Process still running but its input stream failed.
    Degraded(String),
    /// No process; pending commands have been rejected.
    Terminated,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Detecting => f.write_str("detecting"),
            Self::Launching(strategy) => write!(f, "launching ({strategy})"),
            Self::Ready => f.write_str("ready"),
            Self::Degraded(reason) => write!(f, "degraded ({reason})"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// Notifications published to subscribers.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// An `EVENT:` line from the automation script.
    Automation {
        /// Event body.
        payload: serde_json::Value,
        /// When the bridge decoded it.
        received_at: DateTime<Utc>,
    },
    /// The process state changed.
    StateChanged(ProcessState),
}

/// Errors that make `initialize` fail.
#[derive(Debug, Error)]
pub enum InitError {
    /// Runtime discovery failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// Every launch strategy failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Outcome of `initialize`, shaped for UI callers.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    /// Whether the process is ready.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Runtime invocation, when one was selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Runtime version, when one was selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Strategy that started the process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl InitReport {
    fn ready(live: &LiveProcess, message: String) -> Self {
        Self {
            success: true,
            message,
            runtime: Some(live.runtime.invocation.to_string()),
            version: Some(live.runtime.version.to_string()),
            strategy: Some(live.strategy.to_string()),
        }
    }

    fn failed(error: &InitError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            runtime: None,
            version: None,
            strategy: None,
        }
    }
}

/// The process currently owned by the bridge.
struct LiveProcess {
    generation: u64,
    pid: Option<u32>,
    strategy: LaunchStrategy,
    runtime: ResolvedRuntime,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    dispatcher: Arc<Dispatcher>,
    // Dropping the sender also tells the monitor to kill the child.
    kill: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

struct Session {
    state: ProcessState,
    generation: u64,
    fallback_used: bool,
    live: Option<LiveProcess>,
}

struct Inner {
    config: BridgeConfig,
    probe: Arc<dyn RuntimeProbe>,
    supervisor: Supervisor,
    filter: Arc<DiagnosticFilter>,
    events: broadcast::Sender<BridgeEvent>,
    // Correlation ids stay unique across every process this bridge starts.
    next_id: Arc<AtomicU64>,
    session: Mutex<Session>,
    // Serialises initialize, cleanup and the fallback relaunch.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Supervised bridge to the automation script.
///
/// Dropping the bridge kills a still-running child.
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    /// Create a bridge that probes real interpreters.
    pub fn new(config: BridgeConfig) -> Self {
        let probe = Arc::new(SystemProbe::new(Duration::from_secs(
            config.runtime.probe_timeout_secs,
        )));
        Self::with_probe(config, probe)
    }

    /// Create a bridge with a custom runtime probe.
    pub fn with_probe(config: BridgeConfig, probe: Arc<dyn RuntimeProbe>) -> Self {
        let (events, _) = broadcast::channel(config.commands.event_buffer.max(1));
        let filter = Arc::new(DiagnosticFilter::from_config(&config.diagnostics));
        let supervisor = Supervisor::new(config.launch.strategies.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                probe,
                supervisor,
                filter,
                events,
                next_id: Arc::new(AtomicU64::new(1)),
                session: Mutex::new(Session {
                    state: ProcessState::Uninitialized,
                    generation: 0,
                    fallback_used: false,
                    live: None,
                }),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Select a runtime and start the process; idempotent while ready.
    ///
    /// Failures are reported in the returned [`InitReport`]; the bridge can
    /// be initialized again afterwards.
    pub async fn initialize(&self) -> InitReport {
        match self.try_initialize().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "bridge initialization failed");
                InitReport::failed(&e)
            }
        }
    }

    /// Like [`Bridge::initialize`] but returns the typed error.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] when no runtime qualifies or every launch strategy fails.
    pub async fn try_initialize(&self) -> Result<InitReport, InitError> {
        Inner::initialize(&self.inner).await
    }

    /// Send a command and wait for its response payload.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::ProcessUnavailable`] unless the process is
    /// ready, [`CommandError::CommandTimeout`] when no response arrives in
    /// time, and [`CommandError::ProcessCrashed`] if the process exits first.
    pub async fn send(
        &self,
        command: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CommandError> {
        self.inner.send(command, params).await
    }

    /// Terminate the process and reject all pending commands.
    ///
    /// Safe to call repeatedly and when nothing was ever started.
    pub async fn cleanup(&self) {
        self.inner.cleanup().await;
    }

    /// Whether commands can be sent right now.
    pub fn is_available(&self) -> bool {
        self.state() == ProcessState::Ready
    }

    /// Current process state.
    pub fn state(&self) -> ProcessState {
        self.inner.lock().state.clone()
    }

    /// Subscribe to automation events and state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Commands awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .live
            .as_ref()
            .map_or(0, |live| live.dispatcher.pending_count())
    }

    /// OS process id of the running child.
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().live.as_ref().and_then(|live| live.pid)
    }

    /// The runtime the running child was started with.
    pub fn runtime(&self) -> Option<ResolvedRuntime> {
        self.inner
            .lock()
            .live
            .as_ref()
            .map(|live| live.runtime.clone())
    }

    /// Strategy that started the running child.
    pub fn strategy(&self) -> Option<LaunchStrategy> {
        self.inner.lock().live.as_ref().map(|live| live.strategy)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, session: &mut Session, state: ProcessState) {
        if session.state == state {
            return;
        }
        debug!(from = %session.state, to = %state, "process state changed");
        session.state = state.clone();
        // No subscribers is fine.
        let _ = self.events.send(BridgeEvent::StateChanged(state));
    }

    fn selector(&self, with_override: bool) -> RuntimeSelector {
        let override_path = if with_override {
            self.config
                .override_file()
                .and_then(|path| load_runtime_override(&path))
                .map(|o| o.python_path)
        } else {
            None
        };
        RuntimeSelector::new(
            RuntimeCandidate::ranked(&self.config.runtime.candidates),
            override_path,
            CompatibilityPolicy::from(&self.config.runtime.policy),
            Arc::clone(&self.probe),
        )
    }

    async fn initialize(this: &Arc<Self>) -> Result<InitReport, InitError> {
        let _lifecycle = this.lifecycle.lock().await;

        {
            let mut session = this.lock();
            if session.state == ProcessState::Ready {
                if let Some(live) = &session.live {
                    return Ok(InitReport::ready(live, "already initialized".to_owned()));
                }
            }
            if let Some(stale) = session.live.take() {
                // A degraded process is replaced; dropping it kills the child.
                let rejected = stale.dispatcher.reject_all(|| CommandError::ProcessUnavailable);
                warn!(pid = ?stale.pid, rejected, "replacing degraded automation process");
            }
            session.fallback_used = false;
            this.set_state(&mut session, ProcessState::Detecting);
        }

        let result: Result<(ResolvedRuntime, ProcessHandle), InitError> = async {
            let runtime = this.selector(true).detect().await?;
            let launched = this.launch(&runtime).await;
            match launched {
                Ok(handle) => Ok((runtime, handle)),
                Err(e) if e.runtime_not_found() && this.claim_fallback() => {
                    warn!(
                        runtime = %runtime.invocation,
                        error = %e,
                        "runtime executable not found at spawn time, trying fallback candidates"
                    );
                    // The original failure names the vanished runtime; report that one.
                    this.launch_fallback(&runtime.candidate).await.map_err(|fallback| {
                        error!(error = %fallback, "fallback relaunch failed");
                        InitError::from(e)
                    })
                }
                Err(e) => Err(e.into()),
            }
        }
        .await;

        match result {
            Ok((runtime, handle)) => {
                let mut session = this.lock();
                let live = Self::install(this, &mut session, runtime, handle);
                let report = InitReport::ready(
                    &live,
                    format!(
                        "automation process ready (runtime {}, strategy {})",
                        live.runtime.invocation, live.strategy
                    ),
                );
                session.live = Some(live);
                this.set_state(&mut session, ProcessState::Ready);
                Ok(report)
            }
            Err(e) => {
                let mut session = this.lock();
                this.set_state(&mut session, ProcessState::Terminated);
                Err(e)
            }
        }
    }

    /// Mark the single fallback pass of this `initialize` as used.
    ///
    /// Returns `false` if it was already used.
    fn claim_fallback(&self) -> bool {
        let mut session = self.lock();
        !std::mem::replace(&mut session.fallback_used, true)
    }

    /// Detect over the fallback list without `failed` and launch the winner.
    async fn launch_fallback(
        &self,
        failed: &RuntimeCandidate,
    ) -> Result<(ResolvedRuntime, ProcessHandle), InitError> {
        {
            let mut session = self.lock();
            self.set_state(&mut session, ProcessState::Detecting);
        }
        let candidates: Vec<RuntimeCandidate> =
            RuntimeCandidate::ranked(&self.config.runtime.fallback_candidates)
                .into_iter()
                .filter(|c| c.id != failed.id)
                .collect();
        let runtime = self.selector(false).detect_from(&candidates).await?;
        let handle = self.launch(&runtime).await?;
        Ok((runtime, handle))
    }

    async fn launch(&self, runtime: &ResolvedRuntime) -> Result<ProcessHandle, LaunchError> {
        let script = self.config.launch.resolve_script();
        let work_dir = self.config.launch.resolve_work_dir();
        let request = LaunchRequest {
            runtime: &runtime.invocation,
            script: &script,
            work_dir: &work_dir,
            launcher: &self.config.launch.launcher,
            env: &self.config.launch.env,
        };
        info!(
            script = %script.display(),
            work_dir = %work_dir.display(),
            runtime = %runtime.invocation,
            "launching automation process"
        );
        self.supervisor
            .launch(&request, |strategy| {
                let mut session = self.lock();
                self.set_state(&mut session, ProcessState::Launching(strategy));
            })
            .await
    }

    /// Take ownership of a freshly launched child and start its tasks.
    fn install(
        this: &Arc<Self>,
        session: &mut Session,
        runtime: ResolvedRuntime,
        handle: ProcessHandle,
    ) -> LiveProcess {
        session.generation = session.generation.wrapping_add(1);
        let generation = session.generation;

        let pid = handle.pid();
        let ProcessHandle {
            child,
            stdin,
            stdout,
            stderr,
            strategy,
            output,
        } = handle;

        if output == OutputMode::Buffered {
            warn!(%strategy, "output is buffered until exit; responses arrive only when the process ends");
        }

        let dispatcher = Arc::new(Dispatcher::with_ids(
            Duration::from_secs(this.config.commands.timeout_secs),
            Arc::clone(&this.next_id),
        ));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stdout_router = Router {
            dispatcher: Arc::clone(&dispatcher),
            events: this.events.clone(),
            filter: Arc::clone(&this.filter),
            stream: Stream::Stdout,
            stderr_tail: None,
        };
        let stderr_router = Router {
            dispatcher: Arc::clone(&dispatcher),
            events: this.events.clone(),
            filter: Arc::clone(&this.filter),
            stream: Stream::Stderr,
            stderr_tail: Some(Arc::clone(&stderr_tail)),
        };

        let stdout_task = tokio::spawn(pump(stdout, output, stdout_router));
        let stderr_task = tokio::spawn(pump(stderr, OutputMode::Streaming, stderr_router));

        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            Arc::downgrade(this),
            generation,
            child,
            kill_rx,
            [stdout_task, stderr_task],
            stderr_tail,
            Duration::from_millis(this.config.launch.shutdown_grace_ms),
        ));

        info!(generation, pid = ?pid, %strategy, "automation process ready");

        LiveProcess {
            generation,
            pid,
            strategy,
            runtime,
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            dispatcher,
            kill: Some(kill_tx),
            monitor: Some(monitor),
        }
    }

    async fn send(
        &self,
        command: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CommandError> {
        let (generation, stdin, dispatcher) = {
            let session = self.lock();
            match (&session.state, &session.live) {
                (ProcessState::Ready, Some(live)) => (
                    live.generation,
                    Arc::clone(&live.stdin),
                    Arc::clone(&live.dispatcher),
                ),
                _ => return Err(CommandError::ProcessUnavailable),
            }
        };

        let params = normalise_params(params);
        let (ticket, line) = dispatcher.register(command, &params)?;

        let written = {
            let mut stdin = stdin.lock().await;
            match stdin.write_all(&line).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            dispatcher.abandon(&ticket.id);
            warn!(id = %ticket.id, command, error = %e, "failed to write command");
            self.degrade(generation, format!("stdin write failed: {e}"));
            return Err(CommandError::Io(e));
        }

        debug!(id = %ticket.id, command, "command sent");
        dispatcher.wait(ticket).await
    }

    fn degrade(&self, generation: u64, reason: String) {
        let mut session = self.lock();
        if session.generation == generation && session.state == ProcessState::Ready {
            self.set_state(&mut session, ProcessState::Degraded(reason));
        }
    }

    async fn cleanup(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let live = {
            let mut session = self.lock();
            // Invalidate any in-flight fallback relaunch.
            session.generation = session.generation.wrapping_add(1);
            self.set_state(&mut session, ProcessState::Terminated);
            session.live.take()
        };

        let Some(mut live) = live else {
            debug!("cleanup: no live process");
            return;
        };

        let rejected = live.dispatcher.reject_all(|| CommandError::ProcessUnavailable);
        if let Some(kill) = live.kill.take() {
            // The monitor may already have exited on its own.
            let _ = kill.send(());
        }
        if let Some(monitor) = live.monitor.take() {
            let grace = Duration::from_millis(self.config.launch.shutdown_grace_ms);
            if tokio::time::timeout(grace, monitor).await.is_err() {
                warn!(pid = ?live.pid, "automation process did not stop within the grace period");
            }
        }
        info!(pid = ?live.pid, rejected, "automation process shut down");
    }

    /// Record an unexpected exit. Returns the failed runtime when a
    /// missing-executable fallback pass should be attempted.
    fn on_exit(&self, generation: u64, status: &str, missing_executable: bool) -> Option<ResolvedRuntime> {
        let mut session = self.lock();
        if session.generation != generation {
            return None;
        }
        let live = session.live.take()?;
        self.set_state(&mut session, ProcessState::Terminated);
        let rejected = live
            .dispatcher
            .reject_all(|| CommandError::ProcessCrashed(status.to_owned()));
        error!(pid = ?live.pid, status, rejected, "automation process exited unexpectedly");

        if missing_executable && !session.fallback_used {
            session.fallback_used = true;
            return Some(live.runtime);
        }
        None
    }

    /// One extra launch pass over the reduced fallback list.
    fn fallback_relaunch(
        this: Arc<Self>,
        generation: u64,
        failed: ResolvedRuntime,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let _lifecycle = this.lifecycle.lock().await;
            {
                let mut session = this.lock();
                if session.generation != generation || session.state != ProcessState::Terminated {
                    debug!("fallback relaunch superseded");
                    return;
                }
            }

            warn!(
                runtime = %failed.invocation,
                "runtime executable exited as not found, trying fallback candidates"
            );
            let result = this.launch_fallback(&failed.candidate).await;

            let mut session = this.lock();
            match result {
                Ok((runtime, handle)) => {
                    let live = Self::install(&this, &mut session, runtime, handle);
                    info!(runtime = %live.runtime.invocation, "fallback relaunch succeeded");
                    session.live = Some(live);
                    this.set_state(&mut session, ProcessState::Ready);
                }
                Err(e) => {
                    error!(error = %e, "fallback relaunch failed");
                    this.set_state(&mut session, ProcessState::Terminated);
                }
            }
        })
    }
}

/// Own the child until it exits or a kill is requested.
async fn monitor(
    inner: Weak<Inner>,
    generation: u64,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    pumps: [JoinHandle<()>; 2],
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    drain_grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.kill().await {
                warn!(generation, error = %e, "failed to kill automation process");
            }
            for pump in pumps {
                pump.abort();
            }
            return;
        }
    };

    // Let the pumps deliver output written just before exit.
    for pump in pumps {
        if tokio::time::timeout(drain_grace, pump).await.is_err() {
            debug!(generation, "output pump did not finish after exit");
        }
    }

    let tail = stderr_tail
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    let (description, missing) = describe_exit(&status, &tail);

    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some(failed) = inner.on_exit(generation, &description, missing) {
        Inner::fallback_relaunch(inner, generation, failed).await;
    }
}

fn describe_exit(status: &std::io::Result<ExitStatus>, stderr_tail: &str) -> (String, bool) {
    match status {
        Ok(status) => {
            let missing = is_missing_executable(*status, stderr_tail);
            let last_line = stderr_tail.lines().last().unwrap_or_default();
            let description = if last_line.is_empty() {
                status.to_string()
            } else {
                format!("{status}: {last_line}")
            };
            (description, missing)
        }
        Err(e) => (format!("wait failed: {e}"), false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Delivers classified lines from one output stream.
struct Router {
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Sender<BridgeEvent>,
    filter: Arc<DiagnosticFilter>,
    stream: Stream,
    stderr_tail: Option<Arc<Mutex<VecDeque<String>>>>,
}

impl Router {
    fn route(&self, message: InboundMessage) {
        if self.stream == Stream::Stderr {
            let text = match message {
                InboundMessage::Diagnostic { text } | InboundMessage::Malformed { line: text, .. } => {
                    text
                }
                InboundMessage::Response { id, .. } => {
                    debug!(id = %id, "ignoring response line on stderr");
                    return;
                }
                InboundMessage::Event { .. } => {
                    debug!("ignoring event line on stderr");
                    return;
                }
            };
            self.diagnostic(text);
            return;
        }

        match message {
            InboundMessage::Response { id, payload } => {
                self.dispatcher.resolve(&id, payload);
            }
            InboundMessage::Event { payload } => {
                // No subscribers is fine.
                let _ = self.events.send(BridgeEvent::Automation {
                    payload,
                    received_at: Utc::now(),
                });
            }
            InboundMessage::Diagnostic { text } => self.diagnostic(text),
            InboundMessage::Malformed { error, line } => {
                warn!(error = %error, line = %truncate(&line, 200), "dropping malformed protocol line");
            }
        }
    }

    fn diagnostic(&self, text: String) {
        self.filter.emit(self.stream.name(), &text);
        if let Some(tail) = &self.stderr_tail {
            let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            if tail.len() >= STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(text);
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_owned(),
    }
}

/// Read one output stream to its end, routing every classified line.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, mode: OutputMode, router: Router) {
    let mut codec = LineCodec::new();
    let stream = router.stream.name();
    match mode {
        OutputMode::Streaming => {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for message in codec.feed(&buf[..n]) {
                            router.route(message);
                        }
                    }
                    Err(e) => {
                        warn!(stream, error = %e, "output read failed");
                        break;
                    }
                }
            }
        }
        OutputMode::Buffered => {
            let mut all = Vec::new();
            if let Err(e) = reader.read_to_end(&mut all).await {
                warn!(stream, error = %e, "buffered output read failed");
            }
            for message in codec.feed(&all) {
                router.route(message);
            }
        }
    }
    for message in codec.finish() {
        router.route(message);
    }
    debug!(stream, "output stream closed");
}
