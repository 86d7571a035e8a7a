//! First-run runtime creation: `python -m venv` + `pip install -r`
//!
//! Both steps can take minutes (pip pulls large wheels), so they run with
//! generous timeouts and the child is killed if the timeout expires.

use crate::error::ProvisionError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Lines of stderr kept in an error message
const STDERR_TAIL_LINES: usize = 5;

/// Create a virtual environment at `venv_dir` using `base_python`
pub async fn create_venv(
    base_python: &Path,
    venv_dir: &Path,
    limit: Duration,
) -> Result<(), ProvisionError> {
    if let Some(parent) = venv_dir.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ProvisionError::VenvFailed {
            path: venv_dir.to_path_buf(),
            reason: e.to_string(),
        })?;
    }

    let mut cmd = Command::new(base_python);
    cmd.arg("-m").arg("venv").arg(venv_dir);

    run_step(cmd, "Creating Python environment", limit)
        .await
        .map_err(|e| match e {
            StepError::Timeout(secs) => ProvisionError::Timeout {
                step: "Creating Python environment",
                secs,
            },
            StepError::Failed(reason) => ProvisionError::VenvFailed {
                path: venv_dir.to_path_buf(),
                reason,
            },
        })
}

/// Install the dependency manifest into the environment owning `python`
pub async fn install_manifest(
    python: &Path,
    manifest: &Path,
    limit: Duration,
) -> Result<(), ProvisionError> {
    let mut cmd = Command::new(python);
    cmd.args(["-m", "pip", "install", "--disable-pip-version-check", "-r"])
        .arg(manifest);
    if let Some(dir) = manifest.parent() {
        cmd.current_dir(dir);
    }

    run_step(cmd, "Installing dependencies", limit)
        .await
        .map_err(|e| match e {
            StepError::Timeout(secs) => ProvisionError::Timeout {
                step: "Installing dependencies",
                secs,
            },
            StepError::Failed(reason) => ProvisionError::InstallFailed {
                manifest: manifest.to_path_buf(),
                reason,
            },
        })
}

#[derive(Debug)]
enum StepError {
    Timeout(u64),
    Failed(String),
}

async fn run_step(mut cmd: Command, step: &str, limit: Duration) -> Result<(), StepError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!("{}: {:?}", step, cmd);
    let started = std::time::Instant::now();

    let child = cmd
        .spawn()
        .map_err(|e| StepError::Failed(format!("failed to run: {}", e)))?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| StepError::Timeout(limit.as_secs()))?
        .map_err(|e| StepError::Failed(format!("failed to wait: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StepError::Failed(format!(
            "exited with code {:?}: {}",
            output.status.code(),
            stderr_tail(&stderr)
        )));
    }

    tracing::info!("{} finished in {:.1}s", step, started.elapsed().as_secs_f32());
    Ok(())
}

/// Last few non-empty lines, which is where pip puts the actual error
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
