//! Host main loop: supervisor status drives the event channel

mod support;

use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use support::{next_launch, ScriptedLauncher};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use voicetotex::supervisor::StopSignal;
use voicetotex::{Config, Host, HostSignal, WorkerStatus};

const WAIT: Duration = Duration::from_secs(5);

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("host never connected")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("no frame from host")
            .expect("host went away")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn test_config(state_file: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.state_file = Some(state_file.to_string_lossy().into_owned());
    config.transport.host = "127.0.0.1".to_string();
    config.transport.heartbeat_interval_secs = 0;
    config
}

#[tokio::test]
async fn test_ready_backend_is_connected_then_shut_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state");

    let (launcher, mut launches) = ScriptedLauncher::new();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let host = Host::new(test_config(&state_file))
        .with_initial_command(Some("get_history".to_string()));
    let mut status = host.status().subscribe();
    let run = tokio::spawn(host.run_with(Arc::new(launcher), signal_rx));

    let mut worker = next_launch(&mut launches).await;
    worker.print(&format!("READY:{}:tok\n", port)).await;

    let mut ws = accept(&listener).await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "auth", "token": "tok"}));
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "command", "action": "get_history"})
    );
    assert_eq!(std::fs::read_to_string(&state_file).unwrap(), "ready");

    // Observers attached before run saw the whole sequence
    assert!(matches!(status.recv().await.unwrap(), WorkerStatus::Starting { .. }));
    assert!(matches!(status.recv().await.unwrap(), WorkerStatus::Ready { .. }));

    signal_tx.send(HostSignal::Shutdown).unwrap();
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();

    assert_eq!(worker.signals(), vec![StopSignal::Terminate]);
    assert!(!state_file.exists());
}

#[tokio::test]
async fn test_restart_signal_relaunches_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state");

    let (launcher, mut launches) = ScriptedLauncher::new();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let host = Host::new(test_config(&state_file));
    let run = tokio::spawn(host.run_with(Arc::new(launcher), signal_rx));

    let mut first = next_launch(&mut launches).await;
    first.print(&format!("READY:{}:one\n", port)).await;
    let mut ws = accept(&listener).await;
    assert_eq!(next_json(&mut ws).await["token"], "one");

    signal_tx.send(HostSignal::Restart).unwrap();
    let mut second = next_launch(&mut launches).await;
    assert_eq!(first.signals(), vec![StopSignal::Terminate]);

    second.print(&format!("READY:{}:two\n", port)).await;
    let mut ws = accept(&listener).await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "auth", "token": "two"}));

    drop(signal_tx);
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(second.signals(), vec![StopSignal::Terminate]);
}

#[tokio::test]
async fn test_clean_worker_exit_drops_the_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state");

    let (launcher, mut launches) = ScriptedLauncher::new();
    let launcher = Arc::new(launcher);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let host = Host::new(test_config(&state_file));
    let run = tokio::spawn(host.run_with(launcher.clone(), signal_rx));

    let mut worker = next_launch(&mut launches).await;
    worker.print(&format!("READY:{}:tok\n", port)).await;
    let mut ws = accept(&listener).await;
    assert_eq!(next_json(&mut ws).await["token"], "tok");

    worker.exit(0);
    loop {
        match timeout(WAIT, ws.next()).await.expect("channel left open") {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        }
    }
    assert_eq!(std::fs::read_to_string(&state_file).unwrap(), "idle");

    // Nothing dials the dead port, and nothing relaunches the backend
    drop(ws);
    assert!(timeout(Duration::from_millis(1500), listener.accept())
        .await
        .is_err());
    assert_eq!(launcher.attempts(), 1);

    signal_tx.send(HostSignal::Shutdown).unwrap();
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert!(worker.signals().is_empty());
    assert!(!state_file.exists());
}
