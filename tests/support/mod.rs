#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use voicetotex::error::{ProvisionError, SpawnError};
use voicetotex::provision::SpawnSpec;
use voicetotex::supervisor::process::{OutputStream, ProgressFn};
use voicetotex::supervisor::{Launcher, StopSignal, WorkerExit, WorkerProcess};
use voicetotex::WorkerStatus;

/// How one launched fake worker behaves
#[derive(Debug, Clone, Copy)]
pub struct WorkerScript {
    /// Exit when sent Terminate
    pub obey_terminate: bool,
    /// Ignore even Kill (never reports an exit on its own)
    pub unkillable: bool,
    /// Launch fails as if the executable were missing
    pub fail_launch: bool,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self {
            obey_terminate: true,
            unkillable: false,
            fail_launch: false,
        }
    }
}

/// Test-side handle to a launched fake worker
pub struct WorkerControl {
    pub index: usize,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit: mpsc::UnboundedSender<Option<i32>>,
    signals: Arc<Mutex<Vec<StopSignal>>>,
}

impl WorkerControl {
    pub async fn print(&mut self, text: &str) {
        self.stdout.write_all(text.as_bytes()).await.unwrap();
        self.stdout.flush().await.unwrap();
    }

    pub async fn eprint(&mut self, text: &str) {
        self.stderr.write_all(text.as_bytes()).await.unwrap();
        self.stderr.flush().await.unwrap();
    }

    pub fn exit(&self, code: i32) {
        let _ = self.exit.send(Some(code));
    }

    pub fn signals(&self) -> Vec<StopSignal> {
        self.signals.lock().unwrap().clone()
    }
}

struct FakeWorker {
    pid: u32,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    exit_tx: mpsc::UnboundedSender<Option<i32>>,
    exit_rx: mpsc::UnboundedReceiver<Option<i32>>,
    signals: Arc<Mutex<Vec<StopSignal>>>,
    script: WorkerScript,
}

#[async_trait]
impl WorkerProcess for FakeWorker {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> io::Result<WorkerExit> {
        match self.exit_rx.recv().await {
            Some(code) => Ok(WorkerExit { code }),
            None => std::future::pending().await,
        }
    }

    fn signal(&mut self, signal: StopSignal) -> io::Result<()> {
        self.signals.lock().unwrap().push(signal);
        let exits = match signal {
            StopSignal::Terminate => self.script.obey_terminate,
            StopSignal::Kill => !self.script.unkillable,
        };
        if exits {
            let _ = self.exit_tx.send(None);
        }
        Ok(())
    }
}

/// In-memory launcher handing out fake workers
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<WorkerScript>>,
    default_script: WorkerScript,
    progress: Vec<String>,
    prepare_error: Option<String>,
    attempts: AtomicUsize,
    launches: mpsc::UnboundedSender<WorkerControl>,
}

impl ScriptedLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerControl>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                scripts: Mutex::new(VecDeque::new()),
                default_script: WorkerScript::default(),
                progress: Vec::new(),
                prepare_error: None,
                attempts: AtomicUsize::new(0),
                launches: tx,
            },
            rx,
        )
    }

    /// Behaviour for every launch not covered by `then`
    pub fn with_default(mut self, script: WorkerScript) -> Self {
        self.default_script = script;
        self
    }

    /// Behaviour for the next launch (queued in order)
    pub fn then(self, script: WorkerScript) -> Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    /// Progress lines reported while "bootstrapping"
    pub fn with_progress(mut self, lines: &[&str]) -> Self {
        self.progress = lines.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn failing_prepare(mut self, reason: &str) -> Self {
        self.prepare_error = Some(reason.to_string());
        self
    }

    /// Launch attempts so far, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn prepare(&self, progress: &ProgressFn) -> Result<SpawnSpec, ProvisionError> {
        for line in &self.progress {
            progress(line.clone());
        }
        if let Some(ref reason) = self.prepare_error {
            return Err(ProvisionError::VenvFailed {
                path: PathBuf::from("/tmp/venv"),
                reason: reason.clone(),
            });
        }
        Ok(SpawnSpec {
            program: PathBuf::from("python3"),
            args: vec!["server.py".into()],
            cwd: PathBuf::from("."),
            env: vec![("PYTHONUNBUFFERED".into(), "1".into())],
            signature: "server.py".to_string(),
        })
    }

    fn launch(&self, spec: &SpawnSpec) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let index = self.attempts.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_script);

        if script.fail_launch {
            return Err(SpawnError::Launch {
                program: spec.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            });
        }

        let (stdout_writer, stdout_reader) = tokio::io::duplex(4096);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(4096);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let signals = Arc::new(Mutex::new(Vec::new()));

        let _ = self.launches.send(WorkerControl {
            index,
            stdout: stdout_writer,
            stderr: stderr_writer,
            exit: exit_tx.clone(),
            signals: signals.clone(),
        });

        Ok(Box::new(FakeWorker {
            pid: 10_000 + index as u32,
            stdout: Some(Box::new(stdout_reader)),
            stderr: Some(Box::new(stderr_reader)),
            exit_tx,
            exit_rx,
            signals,
            script,
        }))
    }
}

/// Next status, failing the test instead of hanging
pub async fn next_status(rx: &mut broadcast::Receiver<WorkerStatus>) -> WorkerStatus {
    tokio::time::timeout(Duration::from_secs(3600), rx.recv())
        .await
        .expect("no status published")
        .expect("status channel closed")
}

pub async fn next_launch(rx: &mut mpsc::UnboundedReceiver<WorkerControl>) -> WorkerControl {
    tokio::time::timeout(Duration::from_secs(3600), rx.recv())
        .await
        .expect("worker not launched")
        .expect("launcher dropped")
}

pub fn starting() -> WorkerStatus {
    WorkerStatus::Starting {
        message: "Starting backend".to_string(),
    }
}
