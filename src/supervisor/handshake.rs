//! Readiness handshake on the worker's stdout
//!
//! Once its WebSocket server is listening the backend prints a single line:
//!
//! ```text
//! READY:<port>[:<token>]
//! ```
//!
//! Stdout arrives in arbitrary chunks, so bytes are assembled into lines
//! first; a marker split across two writes is recognized once the newline
//! arrives.

use regex::Regex;
use std::sync::OnceLock;

static READY_LINE: OnceLock<Option<Regex>> = OnceLock::new();

fn ready_regex() -> Option<&'static Regex> {
    READY_LINE
        .get_or_init(|| match Regex::new(r"^READY:(\d+)(?::(.*))?$") {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!("Invalid READY pattern: {}", e);
                None
            }
        })
        .as_ref()
}

/// Endpoint published by the worker's handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessToken {
    pub port: u16,
    /// None when the worker runs without authentication
    pub auth_token: Option<String>,
}

impl ReadinessToken {
    /// Parse a complete stdout line; None if it is not a handshake
    pub fn parse(line: &str) -> Option<Self> {
        let caps = ready_regex()?.captures(line.trim())?;
        let port = caps.get(1)?.as_str().parse::<u16>().ok()?;
        let auth_token = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .filter(|t| !t.is_empty());
        Some(Self { port, auth_token })
    }
}

/// Accumulates stdout bytes until a newline completes a line
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed (without `\r\n`)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flush an unterminated final line at EOF
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
