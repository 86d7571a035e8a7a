//! Backend process supervisor
//!
//! Owns the one live worker process: spawns it, watches stdout for the
//! readiness handshake, restarts it after abnormal exits and tears it down
//! within a bounded time on shutdown.
//!
//! All state lives in a single actor task. Callers talk to it through the
//! cloneable [`Supervisor`] handle; child I/O and timers talk to it through
//! an internal event channel. Every event carries the spawn generation it
//! belongs to, so output, exits and timers from a replaced attempt are
//! ignored.
//!
//! ```text
//!   Supervisor (handle) ──Request──►┐
//!                                   ▼
//!   stdout reader ──Ready──► ┌────────────┐ ──publish──► StatusBroadcaster
//!   exit watcher ──Exited──► │   actor    │
//!   timers ──Timeout/Due───► └────────────┘ ──StopSignal──► exit watcher
//! ```

pub mod handshake;
pub mod process;
pub mod stale;
pub mod state;

pub use handshake::{LineAssembler, ReadinessToken};
pub use process::{Launcher, StopSignal, SystemLauncher, WorkerExit, WorkerProcess};
pub use state::SupervisorState;

use crate::config::WorkerConfig;
use crate::error::{HostError, ProvisionError, Result, SpawnError};
use crate::provision::SpawnSpec;
use crate::status::{StatusBroadcaster, WorkerStatus};
use crate::worker_log::WorkerLog;
use process::OutputStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// How long to wait for the exit notification after SIGKILL before
/// dropping the handle anyway
const ABANDON_AFTER: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 4096;

/// Supervision policy
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Ceiling between spawn and the readiness handshake
    pub startup_timeout: Duration,
    /// Automatic restarts before giving up
    pub max_restarts: u32,
    /// Restart N waits N times this long
    pub restart_step: Duration,
    /// Time between SIGTERM and SIGKILL
    pub shutdown_grace: Duration,
}

impl SupervisorOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            max_restarts: config.max_restarts,
            restart_step: config.restart_step(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(120),
            max_restarts: 3,
            restart_step: Duration::from_millis(1000),
            shutdown_grace: Duration::from_millis(5000),
        }
    }
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: SupervisorState,
    pub restart_count: u32,
    pub endpoint: Option<ReadinessToken>,
    pub pid: Option<u32>,
    pub last_message: Option<String>,
}

enum Request {
    Start,
    Restart,
    Shutdown(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<Snapshot>),
}

#[derive(Debug)]
enum Event {
    Progress {
        generation: u64,
        message: String,
    },
    Prepared {
        generation: u64,
        result: std::result::Result<SpawnSpec, ProvisionError>,
    },
    Ready {
        generation: u64,
        token: ReadinessToken,
    },
    Exited {
        generation: u64,
        result: std::io::Result<WorkerExit>,
    },
    ReadinessTimeout {
        generation: u64,
    },
    RestartDue {
        generation: u64,
    },
    KillDue {
        generation: u64,
    },
    Abandon {
        generation: u64,
    },
}

/// Handle to a running supervisor actor
#[derive(Clone)]
pub struct Supervisor {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SupervisorState>,
}

impl Supervisor {
    /// Spawn the actor on the current runtime
    ///
    /// Nothing is launched until [`Supervisor::start`]. The actor stops once
    /// a shutdown has completed, or when every handle has been dropped.
    pub fn spawn(
        launcher: Arc<dyn Launcher>,
        options: SupervisorOptions,
        status: StatusBroadcaster,
        log: WorkerLog,
    ) -> (Self, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SupervisorState::Idle);

        let actor = Actor {
            launcher,
            options,
            status,
            log,
            events: event_tx,
            state: SupervisorState::Idle,
            state_tx,
            restart_count: 0,
            spawning: false,
            generation: 0,
            endpoint: None,
            last_message: None,
            worker: None,
            prepare_task: None,
            readiness_timer: None,
            restart_timer: None,
            kill_timer: None,
            restart_after_exit: false,
            shutdown_waiters: Vec::new(),
        };

        let task = tokio::spawn(actor.run(request_rx, event_rx));
        (
            Self {
                requests: request_tx,
                state: state_rx,
            },
            task,
        )
    }

    /// Launch the backend; ignored while a launch is already in flight
    pub fn start(&self) -> Result<()> {
        self.send(Request::Start)
    }

    /// Kill any live backend, reset the restart budget and launch again
    pub fn restart(&self) -> Result<()> {
        self.send(Request::Restart)
    }

    /// Stop the backend and wait until it is gone
    ///
    /// Bounded by the shutdown grace window plus a short kill allowance.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Lifecycle state, updated on every transition
    ///
    /// Unlike [`WorkerStatus`], this also reports a worker that exited on its
    /// own and left the supervisor idle.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Snapshot(tx))?;
        rx.await.map_err(|_| HostError::SupervisorGone)
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| HostError::SupervisorGone)
    }
}

/// The live process as seen by the actor
struct WorkerHandle {
    pid: Option<u32>,
    generation: u64,
    control: mpsc::UnboundedSender<StopSignal>,
    watcher: JoinHandle<()>,
}

impl WorkerHandle {
    fn signal(&self, signal: StopSignal) {
        if self.control.send(signal).is_err() {
            tracing::debug!("Backend watcher already finished, {:?} not delivered", signal);
        }
    }
}

struct Actor {
    launcher: Arc<dyn Launcher>,
    options: SupervisorOptions,
    status: StatusBroadcaster,
    log: WorkerLog,
    events: mpsc::UnboundedSender<Event>,

    state: SupervisorState,
    state_tx: watch::Sender<SupervisorState>,
    restart_count: u32,
    spawning: bool,
    generation: u64,
    endpoint: Option<ReadinessToken>,
    last_message: Option<String>,
    worker: Option<WorkerHandle>,

    prepare_task: Option<JoinHandle<()>>,
    readiness_timer: Option<JoinHandle<()>>,
    restart_timer: Option<JoinHandle<()>>,
    kill_timer: Option<JoinHandle<()>>,

    restart_after_exit: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut requests_open = true;

        loop {
            if self.state == SupervisorState::ShuttingDown && self.worker.is_none() {
                break;
            }

            tokio::select! {
                request = requests.recv(), if requests_open => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        requests_open = false;
                        tracing::debug!("All supervisor handles dropped");
                        self.begin_shutdown(None);
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        self.resolve_shutdown();
        tracing::debug!("Supervisor stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start => self.start(),
            Request::Restart => self.manual_restart(),
            Request::Shutdown(reply) => self.begin_shutdown(Some(reply)),
            Request::Snapshot(reply) => {
                let _ = reply.send(Snapshot {
                    state: self.state,
                    restart_count: self.restart_count,
                    endpoint: self.endpoint.clone(),
                    pid: self.worker.as_ref().and_then(|w| w.pid),
                    last_message: self.last_message.clone(),
                });
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Progress {
                generation,
                message,
            } => self.on_progress(generation, message),
            Event::Prepared { generation, result } => self.on_prepared(generation, result),
            Event::Ready { generation, token } => self.on_ready(generation, token),
            Event::Exited { generation, result } => self.on_exit(generation, result),
            Event::ReadinessTimeout { generation } => self.on_readiness_timeout(generation),
            Event::RestartDue { generation } => {
                if generation == self.generation && self.state == SupervisorState::Restarting {
                    self.restart_timer = None;
                    self.start();
                }
            }
            Event::KillDue { generation } => self.on_kill_due(generation),
            Event::Abandon { generation } => self.on_abandon(generation),
        }
    }

    // === Spawning ===

    fn start(&mut self) {
        if self.spawning {
            tracing::debug!("Backend launch already in flight, ignoring start");
            return;
        }
        if self.state == SupervisorState::ShuttingDown {
            return;
        }
        if self.worker.is_some() {
            tracing::debug!("Backend already running, ignoring start");
            return;
        }

        self.spawning = true;
        self.generation += 1;
        cancel(&mut self.restart_timer);
        self.set_state(SupervisorState::Starting);
        self.emit(WorkerStatus::Starting {
            message: "Starting backend".to_string(),
        });

        let generation = self.generation;
        let launcher = self.launcher.clone();
        let events = self.events.clone();
        cancel(&mut self.prepare_task);
        self.prepare_task = Some(tokio::spawn(async move {
            let progress_events = events.clone();
            let progress = move |message: String| {
                let _ = progress_events.send(Event::Progress {
                    generation,
                    message,
                });
            };

            let result = launcher.prepare(&progress).await;
            if let Ok(ref spec) = result {
                launcher.reap_stale(spec).await;
            }
            let _ = events.send(Event::Prepared { generation, result });
        }));
    }

    fn on_progress(&mut self, generation: u64, message: String) {
        if generation != self.generation || !self.spawning {
            return;
        }
        if self.state == SupervisorState::Starting {
            self.set_state(SupervisorState::Provisioning);
        }
        self.emit(WorkerStatus::Loading { message });
    }

    fn on_prepared(
        &mut self,
        generation: u64,
        result: std::result::Result<SpawnSpec, ProvisionError>,
    ) {
        if generation != self.generation || !self.spawning {
            return;
        }
        self.prepare_task = None;

        let spec = match result {
            Ok(spec) => spec,
            Err(e) => {
                tracing::error!("Backend environment unavailable: {}", e);
                self.fail_spawn(e.to_string());
                return;
            }
        };

        if self.state == SupervisorState::Provisioning {
            self.set_state(SupervisorState::Starting);
            self.emit(WorkerStatus::Starting {
                message: "Starting backend".to_string(),
            });
        }

        self.arm_readiness_timer();

        let mut process = match self.launcher.launch(&spec) {
            Ok(process) => process,
            Err(e) => {
                tracing::error!("{}", e);
                self.fail_spawn(e.to_string());
                return;
            }
        };

        let Some(stdout) = process.take_stdout() else {
            let _ = process.signal(StopSignal::Kill);
            let e = SpawnError::MissingPipe("stdout");
            tracing::error!("{}", e);
            self.fail_spawn(e.to_string());
            return;
        };

        let pid = process.pid();
        tokio::spawn(read_stdout(
            stdout,
            generation,
            self.log.clone(),
            self.events.clone(),
        ));
        if let Some(stderr) = process.take_stderr() {
            tokio::spawn(forward_stderr(stderr, self.log.clone()));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(watch_exit(
            process,
            generation,
            control_rx,
            self.events.clone(),
        ));

        match pid {
            Some(pid) => tracing::info!("Backend started (pid {})", pid),
            None => tracing::info!("Backend started"),
        }

        self.worker = Some(WorkerHandle {
            pid,
            generation,
            control: control_tx,
            watcher,
        });
    }

    /// Spawn-time failure: terminal for this attempt, never retried
    fn fail_spawn(&mut self, message: String) {
        cancel(&mut self.readiness_timer);
        self.spawning = false;
        self.set_state(SupervisorState::Error);
        self.emit(WorkerStatus::Error { message });
    }

    fn arm_readiness_timer(&mut self) {
        cancel(&mut self.readiness_timer);
        self.readiness_timer = Some(self.schedule(
            self.options.startup_timeout,
            Event::ReadinessTimeout {
                generation: self.generation,
            },
        ));
    }

    // === Handshake and timeout ===

    fn on_ready(&mut self, generation: u64, token: ReadinessToken) {
        if generation != self.generation || self.state != SupervisorState::Starting {
            tracing::debug!("Ignoring readiness line from a superseded backend");
            return;
        }

        cancel(&mut self.readiness_timer);
        self.spawning = false;
        self.restart_count = 0;
        self.endpoint = Some(token.clone());
        self.set_state(SupervisorState::Ready);
        tracing::info!("Backend ready on port {}", token.port);
        self.emit(WorkerStatus::Ready {
            port: token.port,
            auth_token: token.auth_token,
        });
    }

    fn on_readiness_timeout(&mut self, generation: u64) {
        if generation != self.generation
            || !self.spawning
            || self.state != SupervisorState::Starting
        {
            return;
        }

        self.readiness_timer = None;
        self.spawning = false;
        let secs = self.options.startup_timeout.as_secs();
        tracing::error!("Backend did not become ready within {}s", secs);
        self.set_state(SupervisorState::Crashed);
        self.emit(WorkerStatus::Crashed {
            message: format!(
                "Backend did not start within {}s. The first launch may still be downloading a \
                 large speech model; check the backend log and restart.",
                secs
            ),
        });
        self.stop_worker();
    }

    // === Exit handling ===

    fn on_exit(&mut self, generation: u64, result: std::io::Result<WorkerExit>) {
        if self.worker.as_ref().map(|w| w.generation) != Some(generation) {
            return;
        }
        self.worker = None;
        self.spawning = false;
        self.endpoint = None;
        cancel(&mut self.readiness_timer);
        cancel(&mut self.kill_timer);

        let exit = match result {
            Ok(exit) => exit,
            Err(e) => {
                tracing::warn!("Failed to wait for backend: {}", e);
                WorkerExit { code: None }
            }
        };
        tracing::info!("Backend exited ({})", exit);

        if self.state == SupervisorState::ShuttingDown {
            self.resolve_shutdown();
            return;
        }

        if self.restart_after_exit {
            self.restart_after_exit = false;
            self.start();
            return;
        }

        if self.state.is_terminal() {
            return;
        }

        if exit.success() {
            tracing::warn!("Backend exited cleanly without being asked to stop; not restarting");
            self.set_state(SupervisorState::Idle);
            return;
        }

        if self.restart_count < self.options.max_restarts {
            self.restart_count += 1;
            let delay = self.options.restart_step * self.restart_count;
            tracing::warn!(
                "Backend crashed ({}), restart {}/{} in {}ms",
                exit,
                self.restart_count,
                self.options.max_restarts,
                delay.as_millis()
            );
            self.set_state(SupervisorState::Restarting);
            self.emit(WorkerStatus::Restarting {
                attempt: self.restart_count,
            });
            cancel(&mut self.restart_timer);
            self.restart_timer = Some(self.schedule(
                delay,
                Event::RestartDue {
                    generation: self.generation,
                },
            ));
        } else {
            tracing::error!(
                "Backend crashed ({}), giving up after {} restarts",
                exit,
                self.restart_count
            );
            self.set_state(SupervisorState::Crashed);
            self.emit(WorkerStatus::Crashed {
                message: "Max restarts exceeded".to_string(),
            });
        }
    }

    // === Manual restart and shutdown ===

    fn manual_restart(&mut self) {
        if self.state == SupervisorState::ShuttingDown {
            return;
        }
        tracing::info!("Restarting backend");

        cancel(&mut self.restart_timer);
        cancel(&mut self.readiness_timer);
        cancel(&mut self.prepare_task);
        self.restart_count = 0;
        self.spawning = false;
        self.generation += 1;

        if self.worker.is_some() {
            self.restart_after_exit = true;
            self.stop_worker();
        } else {
            self.start();
        }
    }

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.shutdown_waiters.extend(reply);

        if self.state != SupervisorState::ShuttingDown {
            tracing::info!("Stopping backend");
            self.set_state(SupervisorState::ShuttingDown);
            cancel(&mut self.restart_timer);
            cancel(&mut self.readiness_timer);
            cancel(&mut self.prepare_task);
            self.spawning = false;
            self.restart_after_exit = false;
            self.generation += 1;
            self.stop_worker();
        }

        if self.worker.is_none() {
            self.resolve_shutdown();
        }
    }

    /// SIGTERM now, SIGKILL after the grace window
    fn stop_worker(&mut self) {
        let Some(ref worker) = self.worker else {
            return;
        };
        worker.signal(StopSignal::Terminate);
        let generation = worker.generation;
        cancel(&mut self.kill_timer);
        self.kill_timer = Some(self.schedule(
            self.options.shutdown_grace,
            Event::KillDue { generation },
        ));
    }

    fn on_kill_due(&mut self, generation: u64) {
        let Some(ref worker) = self.worker else {
            return;
        };
        if worker.generation != generation {
            return;
        }
        tracing::warn!(
            "Backend still running after {}ms, killing",
            self.options.shutdown_grace.as_millis()
        );
        worker.signal(StopSignal::Kill);
        self.kill_timer = None;

        if self.state == SupervisorState::ShuttingDown {
            self.kill_timer = Some(self.schedule(ABANDON_AFTER, Event::Abandon { generation }));
        }
    }

    fn on_abandon(&mut self, generation: u64) {
        if self.worker.as_ref().map(|w| w.generation) != Some(generation) {
            return;
        }
        if let Some(worker) = self.worker.take() {
            tracing::warn!("Backend did not report exit after SIGKILL, dropping handle");
            worker.watcher.abort();
        }
        self.kill_timer = None;
        self.resolve_shutdown();
    }

    fn resolve_shutdown(&mut self) {
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // === Helpers ===

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            tracing::debug!("Supervisor: {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn emit(&mut self, status: WorkerStatus) {
        self.last_message = Some(status.to_string());
        self.status.publish(status);
    }

    fn schedule(&self, delay: Duration, event: Event) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        })
    }
}

fn cancel(timer: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = timer.take() {
        handle.abort();
    }
}

/// Assemble stdout into lines, log them, and report the first handshake
async fn read_stdout(
    mut stdout: OutputStream,
    generation: u64,
    log: WorkerLog,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut assembler = LineAssembler::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut announced = false;

    let mut handle_line = |line: String| {
        log.stdout_line(&line);
        if announced {
            return;
        }
        if let Some(token) = ReadinessToken::parse(&line) {
            announced = true;
            let _ = events.send(Event::Ready { generation, token });
        }
    };

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Backend stdout closed: {}", e);
                break;
            }
        };
        for line in assembler.push(&buf[..n]) {
            handle_line(line);
        }
    }

    if let Some(line) = assembler.finish() {
        handle_line(line);
    }
}

async fn forward_stderr(mut stderr: OutputStream, log: WorkerLog) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => log.stderr_chunk(&buf[..n]),
            Err(e) => {
                tracing::debug!("Backend stderr closed: {}", e);
                break;
            }
        }
    }
}

/// Own the process: deliver stop signals and report its exit
async fn watch_exit(
    mut process: Box<dyn WorkerProcess>,
    generation: u64,
    mut control: mpsc::UnboundedReceiver<StopSignal>,
    events: mpsc::UnboundedSender<Event>,
) {
    let result = loop {
        tokio::select! {
            result = process.wait() => break result,
            Some(signal) = control.recv() => {
                tracing::debug!("Sending {:?} to backend", signal);
                if let Err(e) = process.signal(signal) {
                    tracing::warn!("Failed to signal backend: {}", e);
                }
            }
        }
    };
    let _ = events.send(Event::Exited { generation, result });
}
