//! Launching and signalling the worker process
//!
//! The supervisor never touches `tokio::process` directly. It goes through
//! [`Launcher`] (resolve + spawn) and [`WorkerProcess`] (streams, exit,
//! signals), so a scripted launcher can stand in for Python in tests.

use super::stale;
use crate::error::{ProvisionError, SpawnError};
use crate::provision::{Provisioner, SpawnSpec};
pub use crate::provision::ProgressFn;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

/// Byte stream from one of the worker's output pipes
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// How hard to ask the worker to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM; the worker gets to clean up
    Terminate,
    /// SIGKILL; unconditional
    Kill,
}

/// Outcome of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, None when killed by a signal
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "killed by signal"),
        }
    }
}

/// A running worker
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn take_stdout(&mut self) -> Option<OutputStream>;

    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> std::io::Result<WorkerExit>;

    fn signal(&mut self, signal: StopSignal) -> std::io::Result<()>;
}

/// Resolves spawn parameters and starts worker processes
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Locate (and if needed bootstrap) the runtime
    async fn prepare(&self, progress: &ProgressFn) -> Result<SpawnSpec, ProvisionError>;

    /// Stop a worker left over from a previous run, best-effort
    async fn reap_stale(&self, _spec: &SpawnSpec) {}

    fn launch(&self, spec: &SpawnSpec) -> Result<Box<dyn WorkerProcess>, SpawnError>;
}

/// Production launcher: [`Provisioner`] + `tokio::process`
pub struct SystemLauncher {
    provisioner: Provisioner,
    stale_wait: Duration,
}

impl SystemLauncher {
    pub fn new(provisioner: Provisioner, stale_wait: Duration) -> Self {
        Self {
            provisioner,
            stale_wait,
        }
    }
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn prepare(&self, progress: &ProgressFn) -> Result<SpawnSpec, ProvisionError> {
        self.provisioner.prepare(progress).await
    }

    async fn reap_stale(&self, spec: &SpawnSpec) {
        stale::reap_stale(&spec.signature, self.stale_wait).await;
    }

    fn launch(&self, spec: &SpawnSpec) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("Spawning backend: {:?}", cmd);

        let child = cmd.spawn().map_err(|source| SpawnError::Launch {
            program: spec.program.clone(),
            source,
        })?;

        Ok(Box::new(ChildProcess { child }))
    }
}

/// [`WorkerProcess`] backed by a real child process
pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputStream)
    }

    async fn wait(&mut self) -> std::io::Result<WorkerExit> {
        let status = self.child.wait().await?;
        Ok(WorkerExit {
            code: status.code(),
        })
    }

    fn signal(&mut self, signal: StopSignal) -> std::io::Result<()> {
        match signal {
            StopSignal::Terminate => self.terminate(),
            StopSignal::Kill => self.child.start_kill(),
        }
    }
}

impl ChildProcess {
    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // Already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        // No graceful signal for console-less children on Windows
        self.child.start_kill()
    }
}
