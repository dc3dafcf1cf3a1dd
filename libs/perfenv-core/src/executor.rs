/// Code Executor - one submission in, one ExecutionOutcome out
///
/// **Responsibility:**
/// 1. Reject oversized submissions before anything runs
/// 2. Hand the submission to the configured `ExecutionEngine`
/// 3. Classify the engine output into an `ExecutionOutcome`
///
/// Classification is a pure function of the engine output and the
/// configuration, so every error path is unit-testable without Python.
use crate::config::Configuration;
use crate::engine::{EngineOutput, ExecutionEngine, ExecutionRequest};
use crate::profiler::{LimitKind, ResourceLimits};
use crate::protocol::{DriverError, DriverStatus};
use crate::runner::TestRunner;
use crate::types::{ErrorKind, ExecutionOutcome, RaisedError, TestResults};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tail of interpreter stderr attached when the driver died without reporting
const STDERR_TAIL_CHARS: usize = 4096;

pub struct CodeExecutor {
    engine: Arc<dyn ExecutionEngine>,
    runner: TestRunner,
}

impl CodeExecutor {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            runner: TestRunner::new(),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Run `source` under the limits of `config`
    ///
    /// `Err` only for infrastructure failures; every submission failure is
    /// carried in the returned outcome.
    pub async fn execute(&self, source: &str, config: &Configuration) -> Result<ExecutionOutcome> {
        let length = source.chars().count();
        if length > config.max_input_len {
            debug!(length = length, max_input_len = config.max_input_len, "Submission too long");
            return Ok(ExecutionOutcome::failed(RaisedError::new(
                ErrorKind::InputTooLong,
                format!(
                    "submission is {} characters long, max_input_len is {}",
                    length, config.max_input_len
                ),
            )));
        }

        let request = ExecutionRequest::new(
            source,
            config.entry_point.as_str(),
            self.runner.plan(config),
            ResourceLimits::from_config(config),
        );

        let output = self
            .engine
            .run(&request)
            .await
            .with_context(|| format!("{} engine failed to run submission", self.engine.name()))?;

        Ok(classify(output, config, &self.runner))
    }
}

fn from_driver_error(kind: ErrorKind, error: Option<DriverError>, fallback: &str) -> RaisedError {
    let error = error.unwrap_or_default();
    let message = if error.message.is_empty() {
        fallback.to_string()
    } else {
        error.message
    };
    RaisedError::new(kind, message)
        .with_exception(error.exception)
        .with_traceback(error.traceback)
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Turn raw engine output into an outcome
///
/// Order of precedence:
/// 1. a ceiling crossed during the run
/// 2. a driver that died without reporting
/// 3. the driver's own status
/// 4. post-hoc ceiling checks on the reported measurements
/// 5. the test tally
pub fn classify(output: EngineOutput, config: &Configuration, runner: &TestRunner) -> ExecutionOutcome {
    if let Some(breach) = output.breach {
        let (kind, message) = match breach.kind {
            LimitKind::Time => (
                ErrorKind::TimeLimitExceeded,
                format!(
                    "execution exceeded max_time_cost of {}s during {}",
                    config.max_time_cost, breach.phase
                ),
            ),
            LimitKind::Memory => (
                ErrorKind::MemoryLimitExceeded,
                format!(
                    "execution exceeded max_memory_cost of {} bytes during {}",
                    config.max_memory_cost, breach.phase
                ),
            ),
        };
        return ExecutionOutcome {
            elapsed_time: Some(breach.elapsed),
            peak_memory: breach.peak_memory,
            raised_error: Some(RaisedError::new(kind, message)),
            ..Default::default()
        };
    }

    let Some(report) = output.report else {
        let message = match output.exit_code {
            Some(code) => format!("interpreter exited with code {} before reporting a result", code),
            None => "interpreter was terminated before reporting a result".to_string(),
        };
        let stderr = tail(output.stderr.trim_end(), STDERR_TAIL_CHARS);
        return ExecutionOutcome::failed(
            RaisedError::new(ErrorKind::Runtime, message).with_traceback(Some(stderr)),
        );
    };

    let elapsed_time = report
        .elapsed
        .and_then(|seconds| Duration::try_from_secs_f64(seconds.max(0.0)).ok())
        .or(output.call_elapsed);
    let peak_memory = report.peak_memory.or(output.call_peak_memory);

    let mut outcome = ExecutionOutcome {
        captured_output: report.stdout,
        elapsed_time,
        peak_memory,
        hotspots: report.hotspots,
        time_profile: report.profile,
        ..Default::default()
    };

    let failure = match report.status {
        DriverStatus::CompileError => Some(from_driver_error(
            ErrorKind::Compilation,
            report.error,
            "submission failed to compile",
        )),
        DriverStatus::MissingEntryPoint => Some(from_driver_error(
            ErrorKind::MissingEntryPoint,
            report.error,
            &format!("submission does not define a callable named {:?}", config.entry_point),
        )),
        DriverStatus::RuntimeError => Some(from_driver_error(
            ErrorKind::Runtime,
            report.error,
            "submission raised an exception",
        )),
        DriverStatus::MemoryError => Some(from_driver_error(
            ErrorKind::MemoryLimitExceeded,
            report.error,
            "submission ran out of memory",
        )),
        DriverStatus::Ok => None,
    };
    if let Some(error) = failure {
        outcome.raised_error = Some(error);
        return outcome;
    }

    if let Some(peak) = peak_memory {
        if peak > config.max_memory_cost {
            outcome.raised_error = Some(RaisedError::new(
                ErrorKind::MemoryLimitExceeded,
                format!(
                    "peak memory of {} bytes exceeds max_memory_cost of {} bytes",
                    peak, config.max_memory_cost
                ),
            ));
            return outcome;
        }
    }
    if let Some(elapsed) = elapsed_time {
        if elapsed > config.max_time() {
            outcome.raised_error = Some(RaisedError::new(
                ErrorKind::TimeLimitExceeded,
                format!(
                    "call took {:.3}s, exceeding max_time_cost of {}s",
                    elapsed.as_secs_f64(),
                    config.max_time_cost
                ),
            ));
            return outcome;
        }
    }

    outcome.returned_value = report.returned;
    outcome.returned_repr = report.returned_repr;

    if config.is_tdd() {
        outcome.test_results = Some(match report.tests {
            Some(tests) => runner.tally(tests),
            None => TestResults::misuse("driver did not run the test suite"),
        });
    }

    outcome
}
