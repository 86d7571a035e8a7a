//! Backend status events and their fan-out to observers
//!
//! The supervisor publishes a [`WorkerStatus`] on every state transition.
//! [`StatusBroadcaster`] republishes each one unchanged to every subscriber
//! and remembers the latest, so a window attached late can render the
//! current status without waiting for the next transition.
//!
//! ```text
//!   Supervisor ──publish──► StatusBroadcaster ──► tray
//!                                 │          ├──► overlay
//!                             latest()       └──► main window
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Capacity of the fan-out ring; status transitions are rare
const STATUS_CAPACITY: usize = 64;

/// Status event sent from the supervisor to observers
///
/// Serializes as `{"status": "...", ...}` with camelCase field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Runtime is being located or bootstrapped
    Loading { message: String },

    /// Worker process spawned, waiting for the handshake
    Starting { message: String },

    /// Worker published its endpoint
    Ready {
        port: u16,
        #[serde(rename = "authToken", skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },

    /// Worker exited abnormally and a restart is scheduled
    Restarting { attempt: u32 },

    /// Worker cannot be recovered without a manual restart
    Crashed { message: String },

    /// Runtime or executable unusable
    Error { message: String },
}

impl WorkerStatus {
    /// Short status name, as written to the state file
    pub fn name(&self) -> &'static str {
        match self {
            WorkerStatus::Loading { .. } => "loading",
            WorkerStatus::Starting { .. } => "starting",
            WorkerStatus::Ready { .. } => "ready",
            WorkerStatus::Restarting { .. } => "restarting",
            WorkerStatus::Crashed { .. } => "crashed",
            WorkerStatus::Error { .. } => "error",
        }
    }

    /// Human-readable message, if the status carries one
    pub fn message(&self) -> Option<&str> {
        match self {
            WorkerStatus::Loading { message }
            | WorkerStatus::Starting { message }
            | WorkerStatus::Crashed { message }
            | WorkerStatus::Error { message } => Some(message),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Ready { port, .. } => write!(f, "ready (port {})", port),
            WorkerStatus::Restarting { attempt } => write!(f, "restarting (attempt {})", attempt),
            other => match other.message() {
                Some(msg) if !msg.is_empty() => write!(f, "{}: {}", other.name(), msg),
                _ => write!(f, "{}", other.name()),
            },
        }
    }
}

/// Fans out supervisor status to any number of observers
///
/// Cheap to clone; all clones share the same channel and latest value.
#[derive(Clone, Debug)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<WorkerStatus>,
    latest: Arc<Mutex<Option<WorkerStatus>>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(STATUS_CAPACITY);
        Self {
            tx,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// Record the status as latest and deliver it to current subscribers
    ///
    /// Never blocks; with no subscribers the event is only remembered.
    pub fn publish(&self, status: WorkerStatus) {
        tracing::debug!("Worker status: {}", status);
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(status.clone());
        }
        let _ = self.tx.send(status);
    }

    /// Receive every status published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerStatus> {
        self.tx.subscribe()
    }

    /// Last published status, if any
    pub fn latest(&self) -> Option<WorkerStatus> {
        self.latest.lock().ok().and_then(|latest| latest.clone())
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
