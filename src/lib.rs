//! VoiceToTex host: supervises the speech backend and talks to it
//!
//! This library provides:
//! - Locating or bootstrapping the backend's Python runtime, including
//!   GPU library discovery
//! - Spawning the backend, detecting its `READY:<port>[:<token>]` handshake,
//!   restarting it after crashes and stopping it within a bounded time
//! - Fanning out backend status to any number of observers
//! - An authenticated WebSocket channel to the backend with heartbeat,
//!   typed dispatch and reconnect backoff
//!
//! # Architecture
//!
//! ```text
//!                      ┌─────────────────────────────────────┐
//!                      │                Host                 │
//!                      └─────────────────────────────────────┘
//!                          │                          ▲    │
//!                          │ start/restart/shutdown   │    │ connect on ready
//!                          ▼                          │    ▼
//!   ┌──────────────┐  ┌──────────────┐   status  ┌─────────┴──────┐
//!   │ Provisioner  │◄─│  Supervisor  │──────────►│     Status     │
//!   │ (python/pip) │  │   (actor)    │           │  Broadcaster   │
//!   └──────────────┘  └──────────────┘           └────────────────┘
//!                          │ spawn                     │
//!                          ▼                           ▼ tray, overlay, ...
//!                   ┌──────────────┐  WebSocket  ┌────────────────┐
//!                   │   backend    │◄───────────►│   Transport    │
//!                   │ (server.py)  │             │    Client      │
//!                   └──────────────┘             └────────────────┘
//!                                                      │ EventBus
//!                                                      ▼ handlers
//! ```

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod provision;
pub mod status;
pub mod supervisor;
pub mod transport;
pub mod worker_log;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use daemon::{Host, HostSignal};
pub use error::{HostError, Result};
pub use status::{StatusBroadcaster, WorkerStatus};
pub use supervisor::{Supervisor, SupervisorOptions, SupervisorState};
pub use transport::{ConnectionState, Endpoint, TransportClient, TransportOptions};
