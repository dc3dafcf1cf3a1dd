// Test doubles shared by the unit tests

use crate::engine::{EngineOutput, ExecutionEngine, ExecutionRequest};
use crate::protocol::{DriverReport, DriverStatus, DriverTestReport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Engine that replays queued outputs and records what it was asked to run
pub struct ScriptedEngine {
    outputs: Mutex<VecDeque<Result<EngineOutput, String>>>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedEngine {
    pub fn new(outputs: Vec<EngineOutput>) -> Self {
        Self::with_results(outputs.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<EngineOutput, String>>) -> Self {
        Self {
            outputs: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<EngineOutput> {
        self.requests.lock().unwrap().push(request.clone());
        match self.outputs.lock().unwrap().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted output left")),
        }
    }
}

/// Output of a clean run returning `value`
pub fn ok_output(elapsed: Duration, peak_memory: u64, value: serde_json::Value) -> EngineOutput {
    let report = DriverReport {
        elapsed: Some(elapsed.as_secs_f64()),
        peak_memory: Some(peak_memory),
        returned: Some(value),
        ..DriverReport::new(DriverStatus::Ok)
    };
    EngineOutput {
        report: Some(report),
        call_elapsed: Some(elapsed),
        call_peak_memory: Some(peak_memory),
        exit_code: Some(0),
        ..Default::default()
    }
}

/// Clean run whose test suite passed `passed` out of `total`
pub fn tested_output(passed: u32, total: u32) -> EngineOutput {
    let mut output = ok_output(Duration::from_millis(1), 1024, serde_json::Value::Null);
    if let Some(report) = output.report.as_mut() {
        report.tests = Some(DriverTestReport {
            misuse: None,
            total,
            passed,
            failed: total - passed,
            errored: 0,
            failures: Vec::new(),
        });
    }
    output
}

/// Output of a run whose driver reported `status`
pub fn status_output(status: DriverStatus) -> EngineOutput {
    EngineOutput {
        report: Some(DriverReport::new(status)),
        exit_code: Some(0),
        ..Default::default()
    }
}
