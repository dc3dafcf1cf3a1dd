use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Why a step did not produce a clean, fully scored execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InputTooLong,
    Compilation,
    MissingEntryPoint,
    Runtime,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    TestHarnessMisuse,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputTooLong => "InputTooLong",
            ErrorKind::Compilation => "Compilation",
            ErrorKind::MissingEntryPoint => "MissingEntryPoint",
            ErrorKind::Runtime => "Runtime",
            ErrorKind::TimeLimitExceeded => "TimeLimitExceeded",
            ErrorKind::MemoryLimitExceeded => "MemoryLimitExceeded",
            ErrorKind::TestHarnessMisuse => "TestHarnessMisuse",
        }
    }

    /// Limit breaches end the episode as truncated rather than terminated
    pub fn is_limit_breach(&self) -> bool {
        matches!(
            self,
            ErrorKind::TimeLimitExceeded | ErrorKind::MemoryLimitExceeded
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error descriptor attached to a failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaisedError {
    pub kind: ErrorKind,
    /// Python exception class name, when the failure was an exception
    pub exception: Option<String>,
    pub message: String,
    pub traceback: Option<String>,
}

impl RaisedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            exception: None,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_exception(mut self, exception: Option<String>) -> Self {
        self.exception = exception;
        self
    }

    pub fn with_traceback(mut self, traceback: Option<String>) -> Self {
        self.traceback = traceback.filter(|t| !t.is_empty());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Failed,
    Errored,
}

/// One non-passing test method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub name: String,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub message: String,
}

/// Tally of the embedded test suite
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
    #[serde(default)]
    pub failures: Vec<TestFailure>,
    /// Set when the test suite itself could not be run (missing class, ...)
    #[serde(default)]
    pub misuse: Option<String>,
}

impl TestResults {
    pub fn misuse(message: impl Into<String>) -> Self {
        Self {
            misuse: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_misuse(&self) -> bool {
        self.misuse.is_some()
    }

    /// passed / total, or None when no test could be run
    pub fn pass_ratio(&self) -> Option<f64> {
        if self.is_misuse() || self.total == 0 {
            return None;
        }
        Some(f64::from(self.passed) / f64::from(self.total))
    }
}

/// A submission line holding live allocations after the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHotspot {
    pub line: u32,
    /// Bytes
    pub size: u64,
    pub count: u64,
}

/// One function's row from profiling the entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProfile {
    /// `file:line(name)`, or the bare name of a builtin
    pub function: String,
    pub ncalls: u64,
    /// Calls that were not recursive
    pub primitive_calls: u64,
    /// Seconds spent in the function itself
    pub tottime: f64,
    /// Seconds including callees
    pub cumtime: f64,
}

impl FunctionProfile {
    /// `ncalls` column as pstats prints it: `total/primitive` for recursion
    pub fn calls_label(&self) -> String {
        if self.ncalls == self.primitive_calls {
            self.ncalls.to_string()
        } else {
            format!("{}/{}", self.ncalls, self.primitive_calls)
        }
    }
}

/// Everything one step learned about a submission
///
/// Owned by the step that produced it; only the summarized fields survive
/// into the observation and `StepInfo`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub returned_value: Option<serde_json::Value>,
    /// Textual form of a return value that could not be serialized
    pub returned_repr: Option<String>,
    pub captured_output: String,
    pub elapsed_time: Option<Duration>,
    pub peak_memory: Option<u64>,
    /// Largest allocations still alive after the call, biggest first
    pub hotspots: Vec<MemoryHotspot>,
    /// Busiest functions of a profiled second call, by own time
    pub time_profile: Vec<FunctionProfile>,
    pub raised_error: Option<RaisedError>,
    pub test_results: Option<TestResults>,
}

impl ExecutionOutcome {
    pub fn failed(error: RaisedError) -> Self {
        Self {
            raised_error: Some(error),
            ..Default::default()
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.raised_error.as_ref().map(|e| e.kind)
    }

    /// True when the run was cut short by a resource ceiling
    pub fn is_truncation(&self) -> bool {
        self.error_kind().is_some_and(|k| k.is_limit_breach())
    }
}

/// Structured diagnostics returned alongside every reward
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub episode_id: Option<Uuid>,
    pub step: u64,
    pub engine: String,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub exception: Option<String>,
    /// Seconds spent inside the entry point
    pub elapsed_time: Option<f64>,
    /// Bytes
    pub peak_memory: Option<u64>,
    pub time_cost: Option<f64>,
    pub memory_cost: Option<f64>,
    pub pass_ratio: Option<f64>,
    pub tests: Option<TestResults>,
    pub returned_value: Option<serde_json::Value>,
}

/// Result of `Evaluator::step`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub observation: String,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: StepInfo,
}
