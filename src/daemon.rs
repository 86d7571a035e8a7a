//! Host main loop
//!
//! Wires the supervisor to the event channel: when the backend reports
//! ready, the transport connects to the published endpoint; when it goes
//! down (crash, restart, or a clean exit nobody asked for), the transport is
//! disconnected so it does not hammer a dead port.
//! The latest status is mirrored into the state file for external tools.

use crate::config::Config;
use crate::error::{HostError, Result};
use crate::provision::Provisioner;
use crate::status::{StatusBroadcaster, WorkerStatus};
use crate::supervisor::{
    Launcher, Supervisor, SupervisorOptions, SupervisorState, SystemLauncher,
};
use crate::transport::{ConnectionState, Endpoint, MessageKind, TransportClient, TransportOptions};
use crate::worker_log::WorkerLog;
use serde_json::Map;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// External control of a running host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Manual backend restart (SIGUSR1)
    Restart,
    /// Stop everything and exit (SIGINT/SIGTERM)
    Shutdown,
}

/// Write state to file for external integrations (e.g., Waybar)
fn write_state_file(path: &Path, state: &str) {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create state file directory: {}", e);
            return;
        }
    }

    if let Err(e) = std::fs::write(path, state) {
        tracing::warn!("Failed to write state file: {}", e);
    } else {
        tracing::trace!("State file updated: {}", state);
    }
}

/// Remove state file on shutdown
fn cleanup_state_file(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove state file: {}", e);
        }
    }
}

/// Owns one supervisor, one status broadcaster and one transport
pub struct Host {
    config: Config,
    state_file_path: Option<PathBuf>,
    status: StatusBroadcaster,
    initial_command: Option<String>,
    python: Option<PathBuf>,
}

impl Host {
    pub fn new(config: Config) -> Self {
        let state_file_path = config.resolve_state_file();
        Self {
            config,
            state_file_path,
            status: StatusBroadcaster::new(),
            initial_command: None,
            python: None,
        }
    }

    /// Send `action` once, the first time the channel opens
    pub fn with_initial_command(mut self, action: Option<String>) -> Self {
        self.initial_command = action;
        self
    }

    /// Interpreter given on the command line
    pub fn with_python(mut self, python: Option<PathBuf>) -> Self {
        self.python = python;
        self
    }

    /// Status fan-out, for observers attached before `run`
    pub fn status(&self) -> &StatusBroadcaster {
        &self.status
    }

    /// Run with the real launcher until SIGINT/SIGTERM
    pub async fn run(self) -> Result<()> {
        let launcher = Arc::new(SystemLauncher::new(
            Provisioner::from_config(&self.config).with_python_override(self.python.clone()),
            self.config.worker.stale_wait(),
        ));

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let forwarder = spawn_signal_forwarder(signal_tx)?;
        let result = self.run_with(launcher, signal_rx).await;
        forwarder.abort();
        result
    }

    /// Run with any launcher, controlled through `signals`
    ///
    /// Returns after a `Shutdown` signal (or the sender being dropped) once
    /// the backend is confirmed gone.
    pub async fn run_with(
        mut self,
        launcher: Arc<dyn Launcher>,
        mut signals: mpsc::UnboundedReceiver<HostSignal>,
    ) -> Result<()> {
        tracing::info!("Starting voicetotex host");
        if let Some(ref path) = self.state_file_path {
            tracing::info!("State file: {:?}", path);
        }

        let log = WorkerLog::new(self.config.log_file.as_deref());
        let (supervisor, supervisor_task) = Supervisor::spawn(
            launcher,
            SupervisorOptions::from_config(&self.config.worker),
            self.status.clone(),
            log,
        );
        let transport = TransportClient::new(TransportOptions::from_config(&self.config.transport));
        register_handlers(&transport);

        let mut status_rx = self.status.subscribe();
        let mut connection = transport.watch_state();
        let mut supervisor_state = supervisor.watch_state();

        supervisor.start()?;

        loop {
            tokio::select! {
                received = status_rx.recv() => match received {
                    Ok(status) => self.on_status(&status, &transport),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} status updates", skipped);
                        if let Some(latest) = self.status.latest() {
                            self.on_status(&latest, &transport);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                Ok(()) = supervisor_state.changed() => {
                    let state = *supervisor_state.borrow_and_update();
                    if state == SupervisorState::Idle {
                        self.on_worker_stopped(&transport);
                    }
                }

                Ok(()) = connection.changed() => {
                    let state = *connection.borrow_and_update();
                    if state == ConnectionState::Open {
                        if let Some(action) = self.initial_command.take() {
                            tracing::info!("Sending command: {}", action);
                            if !transport.send(&action, &Map::new()) {
                                tracing::warn!("Channel closed before '{}' could be sent", action);
                            }
                        }
                    }
                }

                signal = signals.recv() => match signal {
                    Some(HostSignal::Restart) => {
                        tracing::info!("Received restart request");
                        transport.disconnect();
                        if let Err(e) = supervisor.restart() {
                            tracing::error!("Restart failed: {}", e);
                            break;
                        }
                    }
                    Some(HostSignal::Shutdown) | None => {
                        tracing::info!("Shutting down...");
                        break;
                    }
                },
            }
        }

        transport.disconnect();
        supervisor.shutdown().await;
        if let Err(e) = supervisor_task.await {
            tracing::warn!("Supervisor task ended abnormally: {}", e);
        }

        if let Some(ref path) = self.state_file_path {
            cleanup_state_file(path);
        }

        tracing::info!("Host stopped");
        Ok(())
    }

    /// Backend exited with code 0 on its own; it is not restarted
    fn on_worker_stopped(&mut self, transport: &TransportClient) {
        tracing::warn!("Backend is no longer running; send SIGUSR1 to start it again");
        if let Some(ref path) = self.state_file_path {
            write_state_file(path, &SupervisorState::Idle.to_string());
        }
        transport.disconnect();
    }

    fn on_status(&mut self, status: &WorkerStatus, transport: &TransportClient) {
        if let Some(ref path) = self.state_file_path {
            write_state_file(path, status.name());
        }

        match status {
            WorkerStatus::Loading { message } | WorkerStatus::Starting { message } => {
                tracing::info!("{}", message);
            }
            WorkerStatus::Ready { port, auth_token } => {
                transport.connect(Endpoint {
                    host: self.config.transport.host.clone(),
                    port: *port,
                    token: auth_token.clone(),
                });
            }
            WorkerStatus::Restarting { attempt } => {
                tracing::warn!("Backend restarting (attempt {})", attempt);
                transport.disconnect();
            }
            WorkerStatus::Crashed { message } | WorkerStatus::Error { message } => {
                tracing::error!("{}", message);
                transport.disconnect();
            }
        }
    }
}

/// Log inbound traffic; error frames are shown to the user untouched
fn register_handlers(transport: &TransportClient) {
    transport.on(MessageKind::Error, |envelope| match envelope.message() {
        Some(message) => tracing::error!("Backend: {}", message),
        None => tracing::error!(
            "Backend error: {}",
            serde_json::Value::Object(envelope.fields.clone())
        ),
    });

    transport.on(MessageKind::Transcript, |envelope| {
        if let Some(text) = envelope.get_str("text") {
            tracing::info!("Transcript: {}", text);
        }
    });

    for kind in MessageKind::ALL {
        if matches!(kind, MessageKind::Error | MessageKind::Transcript | MessageKind::Pong) {
            continue;
        }
        transport.on(kind, move |envelope| {
            tracing::debug!("Backend {}: {} field(s)", kind, envelope.fields.len());
        });
    }

    transport.on(MessageKind::Pong, |_| tracing::trace!("Heartbeat pong"));
}

#[cfg(unix)]
fn spawn_signal_forwarder(
    tx: mpsc::UnboundedSender<HostSignal>,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigusr1 = signal(SignalKind::user_defined1())
        .map_err(|e| HostError::Config(format!("Failed to set up SIGUSR1 handler: {}", e)))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| HostError::Config(format!("Failed to set up SIGTERM handler: {}", e)))?;

    Ok(tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                _ = sigusr1.recv() => HostSignal::Restart,
                _ = sigterm.recv() => HostSignal::Shutdown,
                _ = tokio::signal::ctrl_c() => HostSignal::Shutdown,
            };
            if tx.send(signal).is_err() || signal == HostSignal::Shutdown {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_signal_forwarder(
    tx: mpsc::UnboundedSender<HostSignal>,
) -> Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(HostSignal::Shutdown);
        }
    }))
}
