//! Cleanup of a backend left running by a previous host
//!
//! If the host crashed, its backend may still hold the WebSocket port.
//! Before spawning we look for processes whose command line contains the
//! backend script path, ask them to terminate and give them a moment.

use std::time::Duration;

/// Signal stale workers matching `signature`, then wait `settle`
pub async fn reap_stale(signature: &str, settle: Duration) {
    if signature.is_empty() {
        return;
    }

    let signalled = terminate_matching(signature).await;
    if signalled > 0 {
        tracing::info!(
            "Terminated {} stale backend process(es), waiting {}ms",
            signalled,
            settle.as_millis()
        );
        tokio::time::sleep(settle).await;
    }
}

/// True when a NUL-separated `/proc/<pid>/cmdline` contains `signature`
pub fn cmdline_matches(raw: &[u8], signature: &str) -> bool {
    if raw.is_empty() {
        return false;
    }
    let joined: String = raw
        .split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ");
    joined.contains(signature)
}

#[cfg(target_os = "linux")]
async fn terminate_matching(signature: &str) -> usize {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let own_pid = std::process::id();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };

    let mut signalled = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if !cmdline_matches(&raw, signature) {
            continue;
        }

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                tracing::debug!("Sent SIGTERM to stale backend pid {}", pid);
                signalled += 1;
            }
            Err(e) => tracing::debug!("Cannot signal stale backend pid {}: {}", pid, e),
        }
    }
    signalled
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn terminate_matching(signature: &str) -> usize {
    let status = tokio::process::Command::new("pkill")
        .args(["-TERM", "-f", signature])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;

    // pkill exits 0 when at least one process matched
    match status {
        Ok(status) if status.success() => 1,
        Ok(_) => 0,
        Err(e) => {
            tracing::debug!("pkill unavailable: {}", e);
            0
        }
    }
}

#[cfg(not(unix))]
async fn terminate_matching(_signature: &str) -> usize {
    0
}
