// Supervisor <-> driver wire protocol
//
// The driver (runtime/driver.py) is embedded in the binary and passed to the
// interpreter with `-c`. It prints one JSON object per line on a private copy
// of stdout; every object carries the nonce from the request so output the
// submission manages to smuggle onto the same stream is ignored.

use crate::runner::TestPlan;
use crate::types::{FunctionProfile, MemoryHotspot};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Python source of the driver
pub const DRIVER_SOURCE: &str = include_str!("../runtime/driver.py");

/// Longest protocol line accepted before the buffer is discarded
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct DriverRequest<'a> {
    pub nonce: &'a str,
    pub source: &'a str,
    pub entry_point: &'a str,
    pub tests: Option<&'a TestPlan>,
    pub limits: DriverLimits,
}

/// Ceilings the driver sizes its optional profiling call against
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DriverLimits {
    /// Seconds
    pub max_time: f64,
    /// Bytes
    pub max_memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Ok,
    CompileError,
    MissingEntryPoint,
    RuntimeError,
    MemoryError,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DriverError {
    pub exception: Option<String>,
    #[serde(default)]
    pub message: String,
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DriverFailure {
    pub name: String,
    pub outcome: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DriverTestReport {
    pub misuse: Option<String>,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub errored: u32,
    #[serde(default)]
    pub failures: Vec<DriverFailure>,
}

/// Final report of one driver run
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DriverReport {
    pub status: DriverStatus,
    pub error: Option<DriverError>,
    /// Seconds spent in the entry point
    pub elapsed: Option<f64>,
    /// tracemalloc peak during the call, bytes
    pub peak_memory: Option<u64>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub hotspots: Vec<MemoryHotspot>,
    /// cProfile rows of the untimed second call, by own time
    #[serde(default)]
    pub profile: Vec<FunctionProfile>,
    pub returned: Option<serde_json::Value>,
    pub returned_repr: Option<String>,
    pub tests: Option<DriverTestReport>,
}

impl DriverReport {
    pub fn new(status: DriverStatus) -> Self {
        Self {
            status,
            error: None,
            elapsed: None,
            peak_memory: None,
            stdout: String::new(),
            hotspots: Vec::new(),
            profile: Vec::new(),
            returned: None,
            returned_repr: None,
            tests: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DriverEvent {
    Ready {},
    CallFinished { elapsed: f64, peak_memory: u64 },
    Result(DriverReport),
}

/// Decode one protocol line, returning None for anything that is not a
/// well-formed event carrying `nonce`
pub fn parse_line(line: &str, nonce: &str) -> Option<DriverEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let mut value: serde_json::Value = serde_json::from_str(line).ok()?;
    let object = value.as_object_mut()?;
    if object.remove("nonce")?.as_str()? != nonce {
        return None;
    }
    match serde_json::from_value(value) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(error = %e, "Discarding malformed driver event");
            None
        }
    }
}

/// Splits an arbitrary byte stream into lines
///
/// Used by engines whose output arrives in chunks (container log frames)
/// rather than through a line reader.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    overflowed: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if !self.overflowed {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                }
                self.pending.clear();
                self.overflowed = false;
            } else if self.pending.len() < MAX_LINE_BYTES {
                self.pending.push(byte);
            } else {
                self.overflowed = true;
            }
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated
    pub fn finish(&mut self) -> Option<String> {
        let overflowed = std::mem::take(&mut self.overflowed);
        if self.pending.is_empty() || overflowed {
            self.pending.clear();
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
