//! Diagnostic sink for worker output
//!
//! Every stdout line and every stderr chunk is logged through `tracing`
//! under the `voicetotex::worker` target, and optionally appended verbatim
//! to a log file so crashes can be diagnosed after the fact.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct WorkerLog {
    file: Option<Arc<Mutex<File>>>,
}

impl WorkerLog {
    /// Log through tracing and, if `path` is given, append to that file
    pub fn new(path: Option<&Path>) -> Self {
        let file = path.and_then(|path| {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!("Failed to create log directory {:?}: {}", parent, e);
                    return None;
                }
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing::debug!("Appending backend output to {:?}", path);
                    Some(Arc::new(Mutex::new(file)))
                }
                Err(e) => {
                    tracing::warn!("Failed to open backend log {:?}: {}", path, e);
                    None
                }
            }
        });
        Self { file }
    }

    /// Tracing only
    pub fn disabled() -> Self {
        Self::default()
    }

    /// One complete stdout line (without newline)
    pub fn stdout_line(&self, line: &str) {
        tracing::info!(target: "voicetotex::worker", "{}", line);
        self.append(line.as_bytes());
        self.append(b"\n");
    }

    /// Raw stderr bytes, not split or parsed
    pub fn stderr_chunk(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let text = text.trim_end_matches(['\r', '\n']);
        if !text.is_empty() {
            tracing::info!(target: "voicetotex::worker", "{}", text);
        }
        self.append(chunk);
    }

    fn append(&self, bytes: &[u8]) {
        let Some(ref file) = self.file else {
            return;
        };
        if let Ok(mut file) = file.lock() {
            if let Err(e) = file.write_all(bytes) {
                tracing::trace!("Backend log write failed: {}", e);
            }
        }
    }
}
