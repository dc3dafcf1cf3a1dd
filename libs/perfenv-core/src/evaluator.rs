/// Evaluator - the reset/step state machine
///
/// **States:**
/// - `Unreset`: constructed, no episode yet
/// - `Ready`: `reset()` was called, a submission may be stepped
/// - `Done`: one submission was scored; only `reset()` is accepted
///
/// Each episode scores exactly one submission. `reset()` may be called from
/// any state and always starts a fresh episode.
use crate::config::{ConfigResolver, Configuration, EngineSettings, TEST_CLASS_NAME};
use crate::engine::{ExecutionEngine, ProcessEngine};
use crate::error::{ConfigurationError, EnvError};
use crate::executor::CodeExecutor;
use crate::reward::{RewardBreakdown, RewardCalculator};
use crate::types::{ErrorKind, ExecutionOutcome, Step, StepInfo, TestOutcome};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Captured stdout shown in an observation, in characters
const OBSERVATION_OUTPUT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Unreset,
    Ready,
    Done,
}

impl EnvState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvState::Unreset => "unreset",
            EnvState::Ready => "ready",
            EnvState::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeState {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub steps: u64,
    pub terminal: bool,
    pub last_observation: String,
}

impl EpisodeState {
    fn new(observation: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            steps: 0,
            terminal: false,
            last_observation: observation,
        }
    }
}

pub struct Evaluator {
    config: Configuration,
    executor: CodeExecutor,
    episode: Option<EpisodeState>,
}

impl Evaluator {
    /// Evaluator running submissions in a local interpreter with default settings
    pub fn new(user_config: &serde_json::Value) -> Result<Self, ConfigurationError> {
        let engine = Arc::new(ProcessEngine::new(EngineSettings::default()));
        Self::with_engine(user_config, engine)
    }

    pub fn with_engine(
        user_config: &serde_json::Value,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Result<Self, ConfigurationError> {
        let config = ConfigResolver::resolve(user_config)?;
        Ok(Self::from_config(config, engine))
    }

    /// Build from an already resolved configuration
    pub fn from_config(config: Configuration, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            config,
            executor: CodeExecutor::new(engine),
            episode: None,
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn episode(&self) -> Option<&EpisodeState> {
        self.episode.as_ref()
    }

    pub fn state(&self) -> EnvState {
        match &self.episode {
            None => EnvState::Unreset,
            Some(episode) if episode.terminal => EnvState::Done,
            Some(_) => EnvState::Ready,
        }
    }

    /// Start a new episode and return the task description
    pub fn reset(&mut self) -> String {
        let observation = task_description(&self.config);
        let episode = EpisodeState::new(observation.clone());
        info!(episode_id = %episode.id, engine = self.executor.engine_name(), "Episode reset");
        self.episode = Some(episode);
        observation
    }

    /// Score one submission
    ///
    /// Engine failures leave the episode untouched so the same submission can
    /// be retried.
    pub async fn step(&mut self, code: &str) -> Result<Step, EnvError> {
        let episode_id = match &self.episode {
            None => return Err(EnvError::NotReset),
            Some(episode) if episode.terminal => return Err(EnvError::EpisodeFinished),
            Some(episode) => episode.id,
        };

        let outcome = match self.executor.execute(code, &self.config).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(episode_id = %episode_id, error = %format!("{:#}", e), "Execution engine failed");
                return Err(EnvError::Engine(e));
            }
        };

        let breakdown = RewardCalculator::breakdown(&outcome, &self.config);
        let truncated = outcome.is_truncation();
        let observation = render_observation(&outcome, &self.config);

        let step_number = match self.episode.as_mut() {
            Some(episode) => {
                episode.steps += 1;
                episode.terminal = true;
                episode.last_observation = observation.clone();
                episode.steps
            }
            None => 1,
        };

        let info = build_info(
            &outcome,
            &breakdown,
            episode_id,
            step_number,
            self.executor.engine_name(),
        );

        info!(
            episode_id = %episode_id,
            error_kind = info.error_kind.map(|k| k.as_str()),
            reward = breakdown.reward,
            elapsed_ms = outcome.elapsed_time.map(|d| d.as_millis() as u64),
            peak_memory = outcome.peak_memory,
            truncated = truncated,
            "Step completed"
        );

        Ok(Step {
            observation,
            reward: breakdown.reward,
            terminated: !truncated,
            truncated,
            info,
        })
    }
}

fn build_info(
    outcome: &ExecutionOutcome,
    breakdown: &RewardBreakdown,
    episode_id: Uuid,
    step: u64,
    engine: &str,
) -> StepInfo {
    let misuse = outcome
        .test_results
        .as_ref()
        .and_then(|tests| tests.misuse.clone());

    let (error_kind, error_message, exception) = match (&outcome.raised_error, misuse) {
        (Some(error), _) => (
            Some(error.kind),
            Some(error.message.clone()),
            error.exception.clone(),
        ),
        (None, Some(message)) => (Some(ErrorKind::TestHarnessMisuse), Some(message), None),
        (None, None) => (None, None, None),
    };

    StepInfo {
        episode_id: Some(episode_id),
        step,
        engine: engine.to_string(),
        error_kind,
        error_message,
        exception,
        elapsed_time: outcome.elapsed_time.map(|d| d.as_secs_f64()),
        peak_memory: outcome.peak_memory,
        time_cost: breakdown.time_cost,
        memory_cost: breakdown.memory_cost,
        pass_ratio: breakdown.pass_ratio,
        tests: outcome.test_results.clone(),
        returned_value: outcome.returned_value.clone(),
    }
}

/// Initial observation: what the agent is asked to write
pub fn task_description(config: &Configuration) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "Write Python code that defines a zero-argument function `{}()`.",
        config.entry_point
    );
    let _ = writeln!(
        text,
        "Running time and peak memory of one call are scored; lower is better."
    );
    let _ = writeln!(text);
    let _ = writeln!(text, "# Limits");
    let _ = writeln!(text, "- source length: {} characters", config.max_input_len);
    let _ = writeln!(text, "- time: {} s", config.max_time_cost);
    let _ = writeln!(text, "- memory: {} bytes", config.max_memory_cost);
    let _ = writeln!(text);
    let _ = writeln!(text, "# Scoring");
    let _ = writeln!(
        text,
        "- time weight {}, memory weight {}",
        config.time_weight, config.memory_weight
    );
    let _ = writeln!(
        text,
        "- any error or exceeded limit scores {}",
        config.exception_reward
    );
    if let Some(tests) = &config.unittest {
        let _ = writeln!(
            text,
            "- the score is multiplied by the fraction of `{}` tests that pass",
            TEST_CLASS_NAME
        );
        let _ = writeln!(text);
        let _ = writeln!(text, "# Tests");
        let _ = writeln!(text, "```python");
        let _ = writeln!(text, "{}", tests.trim_end());
        let _ = writeln!(text, "```");
    }
    text
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push_str("\n[... output truncated]");
    clipped
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        return 0.0;
    }
    part / whole * 100.0
}

/// Text report of one step
pub fn render_observation(outcome: &ExecutionOutcome, config: &Configuration) -> String {
    let mut text = String::new();

    if let Some(error) = &outcome.raised_error {
        let _ = writeln!(text, "# Error: {}", error.kind);
        match &error.exception {
            Some(exception) if !error.message.is_empty() => {
                let _ = writeln!(text, "{}: {}", exception, error.message);
            }
            Some(exception) => {
                let _ = writeln!(text, "{}", exception);
            }
            None => {
                let _ = writeln!(text, "{}", error.message);
            }
        }
        if let Some(traceback) = &error.traceback {
            let _ = writeln!(text);
            let _ = writeln!(text, "{}", traceback.trim_end());
        }
        if !outcome.captured_output.is_empty() {
            let _ = writeln!(text);
            let _ = writeln!(text, "# Output");
            let _ = writeln!(text, "{}", clip(&outcome.captured_output, OBSERVATION_OUTPUT_CHARS).trim_end());
        }
        return text;
    }

    if let Some(elapsed) = outcome.elapsed_time {
        let seconds = elapsed.as_secs_f64();
        let _ = writeln!(text, "# Time");
        let _ = writeln!(
            text,
            "{:.6} s ({:.2}% of max_time_cost)",
            seconds,
            percent(seconds, config.max_time_cost)
        );
        if !outcome.time_profile.is_empty() {
            let _ = writeln!(text);
            let _ = writeln!(text, "{:>9} {:>10} {:>10}  function", "ncalls", "tottime", "cumtime");
            for row in &outcome.time_profile {
                let _ = writeln!(
                    text,
                    "{:>9} {:>10.6} {:>10.6}  {}",
                    row.calls_label(),
                    row.tottime,
                    row.cumtime,
                    row.function
                );
            }
        }
        let _ = writeln!(text);
    }

    if let Some(peak) = outcome.peak_memory {
        let _ = writeln!(text, "# Memory");
        let _ = writeln!(
            text,
            "peak {} bytes ({:.2}% of max_memory_cost)",
            peak,
            percent(peak as f64, config.max_memory_cost as f64)
        );
        for hotspot in &outcome.hotspots {
            let _ = writeln!(
                text,
                "line {}: {} bytes in {} blocks",
                hotspot.line, hotspot.size, hotspot.count
            );
        }
        let _ = writeln!(text);
    }

    let _ = writeln!(text, "# Result");
    match (&outcome.returned_value, &outcome.returned_repr) {
        (Some(value), _) if !value.is_null() => {
            let _ = writeln!(text, "{}", value);
        }
        (_, Some(repr)) => {
            let _ = writeln!(text, "{}", repr);
        }
        _ => {
            let _ = writeln!(text, "None");
        }
    }

    if !outcome.captured_output.is_empty() {
        let _ = writeln!(text);
        let _ = writeln!(text, "# Output");
        let _ = writeln!(text, "{}", clip(&outcome.captured_output, OBSERVATION_OUTPUT_CHARS).trim_end());
    }

    if let Some(tests) = &outcome.test_results {
        let _ = writeln!(text);
        let _ = writeln!(text, "# Tests");
        match &tests.misuse {
            Some(message) => {
                let _ = writeln!(text, "test suite could not be run: {}", message);
            }
            None => {
                let _ = writeln!(
                    text,
                    "{}/{} passed, {} failed, {} errored",
                    tests.passed, tests.total, tests.failed, tests.errored
                );
                for failure in &tests.failures {
                    let label = match failure.outcome {
                        TestOutcome::Failed => "FAIL",
                        TestOutcome::Errored => "ERROR",
                    };
                    let _ = writeln!(text, "{}: {}", label, failure.name);
                    if !failure.message.is_empty() {
                        let _ = writeln!(text, "{}", failure.message.trim_end());
                    }
                }
            }
        }
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DriverStatus;
    use crate::testing::{ok_output, status_output, tested_output, ScriptedEngine};
    use crate::types::{FunctionProfile, MemoryHotspot, RaisedError, TestResults};
    use serde_json::json;
    use std::time::Duration;

    fn evaluator(engine: Arc<ScriptedEngine>, config: serde_json::Value) -> Evaluator {
        Evaluator::with_engine(&config, engine).unwrap()
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let result = Evaluator::with_engine(&json!({ "exception_reward": 1 }), engine);
        assert!(matches!(result, Err(ConfigurationError::NonNegativePenalty(_))));

        // a time budget no Duration can hold is refused up front
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let result = Evaluator::with_engine(&json!({ "max_time_cost": 1e20 }), engine);
        assert!(matches!(result, Err(ConfigurationError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn test_step_before_reset() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let mut env = evaluator(engine.clone(), json!({}));
        assert_eq!(env.state(), EnvState::Unreset);

        let err = env.step("def env_main(): return 0").await.unwrap_err();
        assert!(matches!(err, EnvError::NotReset));
        assert!(err.is_usage_error());
        assert_eq!(engine.calls(), 0);
        assert_eq!(env.state(), EnvState::Unreset);
    }

    #[tokio::test]
    async fn test_successful_step() {
        let engine = Arc::new(ScriptedEngine::new(vec![ok_output(
            Duration::from_millis(6),
            4096,
            json!(0),
        )]));
        let mut env = evaluator(engine.clone(), json!({ "max_time_cost": 1 }));
        env.reset();
        assert_eq!(env.state(), EnvState::Ready);

        let step = env.step("def env_main(): return 0").await.unwrap();
        assert!(step.terminated);
        assert!(!step.truncated);
        assert!(step.reward > 0.99, "reward was {}", step.reward);
        assert!(step.observation.contains("# Time"));
        assert!(step.observation.contains("# Memory"));
        assert!(step.info.error_kind.is_none());
        assert_eq!(step.info.step, 1);
        assert_eq!(step.info.engine, "scripted");
        assert_eq!(step.info.returned_value, Some(json!(0)));
        assert_eq!(step.info.peak_memory, Some(4096));
        assert_eq!(step.info.episode_id, env.episode().map(|e| e.id));

        let request = &engine.requests()[0];
        assert_eq!(request.entry_point, "env_main");
        assert_eq!(request.limits.max_time, Duration::from_secs(1));
        assert!(request.tests.is_none());

        assert_eq!(env.state(), EnvState::Done);
        assert_eq!(env.episode().unwrap().last_observation, step.observation);
    }

    #[tokio::test]
    async fn test_step_after_done_is_rejected() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            ok_output(Duration::from_millis(1), 1, json!(1)),
            ok_output(Duration::from_millis(1), 1, json!(2)),
        ]));
        let mut env = evaluator(engine.clone(), json!({}));
        env.reset();
        env.step("def env_main(): return 1").await.unwrap();

        let err = env.step("def env_main(): return 2").await.unwrap_err();
        assert!(matches!(err, EnvError::EpisodeFinished));
        assert_eq!(engine.calls(), 1);

        // a new episode accepts a new submission
        let first_id = env.episode().unwrap().id;
        env.reset();
        assert_ne!(env.episode().unwrap().id, first_id);
        let step = env.step("def env_main(): return 2").await.unwrap();
        assert_eq!(step.info.returned_value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_missing_entry_point_terminates() {
        let engine = Arc::new(ScriptedEngine::new(vec![status_output(
            DriverStatus::MissingEntryPoint,
        )]));
        let mut env = evaluator(engine, json!({}));
        env.reset();

        let step = env.step("def main(): return 0").await.unwrap();
        assert!(step.terminated);
        assert!(!step.truncated);
        assert_eq!(step.reward, -9.0);
        assert_eq!(step.info.error_kind, Some(ErrorKind::MissingEntryPoint));
        assert!(step.observation.starts_with("# Error: MissingEntryPoint"));
    }

    #[tokio::test]
    async fn test_limit_breach_truncates() {
        use crate::engine::EngineOutput;
        use crate::profiler::{LimitBreach, LimitKind, Phase};

        let breach = EngineOutput {
            breach: Some(LimitBreach {
                kind: LimitKind::Time,
                phase: Phase::Call,
                elapsed: Duration::from_millis(1500),
                peak_memory: None,
            }),
            ..Default::default()
        };
        let engine = Arc::new(ScriptedEngine::new(vec![breach]));
        let mut env = evaluator(engine, json!({ "max_time_cost": 1, "exception_reward": -5 }));
        env.reset();

        let step = env.step("import time\ndef env_main(): time.sleep(5)").await.unwrap();
        assert!(step.truncated);
        assert!(!step.terminated);
        assert_eq!(step.reward, -5.0);
        assert_eq!(step.info.error_kind, Some(ErrorKind::TimeLimitExceeded));
        assert_eq!(step.info.elapsed_time, Some(1.5));
        assert_eq!(env.state(), EnvState::Done);
    }

    #[tokio::test]
    async fn test_engine_failure_keeps_episode_ready() {
        let engine = Arc::new(ScriptedEngine::with_results(vec![
            Err("docker daemon unreachable".to_string()),
            Ok(ok_output(Duration::from_millis(1), 1, json!(null))),
        ]));
        let mut env = evaluator(engine, json!({}));
        env.reset();

        let err = env.step("def env_main(): pass").await.unwrap_err();
        assert!(matches!(err, EnvError::Engine(_)));
        assert!(!err.is_usage_error());
        assert!(err.to_string().contains("docker daemon unreachable"));
        assert_eq!(env.state(), EnvState::Ready);
        assert_eq!(env.episode().unwrap().steps, 0);

        let step = env.step("def env_main(): pass").await.unwrap();
        assert!(step.terminated);
        assert_eq!(step.info.step, 1);
    }

    #[tokio::test]
    async fn test_input_too_long() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let mut env = evaluator(engine.clone(), json!({ "max_input_len": 30 }));
        env.reset();

        let step = env.step(&"#".repeat(31)).await.unwrap();
        assert_eq!(step.info.error_kind, Some(ErrorKind::InputTooLong));
        assert_eq!(step.reward, -9.0);
        assert!(step.terminated);
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_tdd_pass_ratio_blends_reward() {
        let engine = Arc::new(ScriptedEngine::new(vec![tested_output(4, 4), tested_output(1, 4)]));
        let mut env = evaluator(
            engine.clone(),
            json!({ "unittest": "class SolutionTest:\n    def test_a(self): pass\n" }),
        );

        env.reset();
        let all = env.step("def env_main(): return 1").await.unwrap();
        env.reset();
        let some = env.step("def env_main(): return 2").await.unwrap();

        assert!(all.reward > some.reward);
        assert_eq!(all.info.pass_ratio, Some(1.0));
        assert_eq!(some.info.pass_ratio, Some(0.25));
        assert!(some.observation.contains("1/4 passed"));

        let plan = engine.requests()[0].tests.clone().unwrap();
        assert_eq!(plan.class_name, "SolutionTest");
    }

    #[tokio::test]
    async fn test_harness_misuse_is_reported_not_penalized() {
        let mut output = ok_output(Duration::from_millis(1), 1, json!(3));
        if let Some(report) = output.report.as_mut() {
            report.tests = Some(crate::protocol::DriverTestReport {
                misuse: Some("test source does not define class 'SolutionTest'".to_string()),
                ..Default::default()
            });
        }
        let engine = Arc::new(ScriptedEngine::new(vec![output]));
        let mut env = evaluator(engine, json!({ "unittest": "class Other: pass" }));
        env.reset();

        let step = env.step("def env_main(): return 3").await.unwrap();
        assert_eq!(step.info.error_kind, Some(ErrorKind::TestHarnessMisuse));
        assert!(step.info.error_message.unwrap().contains("SolutionTest"));
        assert!(step.reward > 0.99);
        assert!(step.terminated);
        assert!(step.observation.contains("test suite could not be run"));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let mut env = evaluator(engine, json!({ "entry_point": "solve" }));
        let first = env.reset();
        let second = env.reset();
        assert_eq!(first, second);
        assert!(first.contains("`solve()`"));
        assert_eq!(env.state(), EnvState::Ready);
        assert_eq!(env.episode().unwrap().steps, 0);
    }

    #[test]
    fn test_task_description_includes_tests() {
        let config = Configuration {
            unittest: Some("class SolutionTest:\n    def test_x(self): pass\n".to_string()),
            ..Default::default()
        };
        let text = task_description(&config);
        assert!(text.contains("# Tests"));
        assert!(text.contains("def test_x(self): pass"));
        assert!(!task_description(&Configuration::default()).contains("# Tests"));
    }

    #[test]
    fn test_render_error_observation() {
        let outcome = ExecutionOutcome {
            captured_output: "partial\n".to_string(),
            ..ExecutionOutcome::failed(
                RaisedError::new(ErrorKind::Runtime, "division by zero")
                    .with_exception(Some("ZeroDivisionError".to_string()))
                    .with_traceback(Some("Traceback (most recent call last):\n  File \"<submission>\", line 2\n".to_string())),
            )
        };
        let text = render_observation(&outcome, &Configuration::default());
        assert!(text.starts_with("# Error: Runtime\nZeroDivisionError: division by zero\n"));
        assert!(text.contains("line 2"));
        assert!(text.contains("# Output\npartial"));
    }

    #[test]
    fn test_render_success_observation() {
        let outcome = ExecutionOutcome {
            elapsed_time: Some(Duration::from_millis(30)),
            peak_memory: Some(2048),
            hotspots: vec![MemoryHotspot {
                line: 3,
                size: 2000,
                count: 1,
            }],
            time_profile: vec![
                FunctionProfile {
                    function: "<submission>:1(fib)".to_string(),
                    ncalls: 177,
                    primitive_calls: 1,
                    tottime: 0.02,
                    cumtime: 0.025,
                },
                FunctionProfile {
                    function: "<built-in method builtins.len>".to_string(),
                    ncalls: 4,
                    primitive_calls: 4,
                    tottime: 0.0,
                    cumtime: 0.0,
                },
            ],
            returned_repr: Some("<object at 0x1>".to_string()),
            test_results: Some(TestResults {
                total: 2,
                passed: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        let text = render_observation(&outcome, &Configuration::default());
        assert!(text.contains("# Time\n0.030000 s (0.05% of max_time_cost)"));
        assert!(text.contains("   ncalls    tottime    cumtime  function"));
        assert!(text.contains("    177/1   0.020000   0.025000  <submission>:1(fib)"));
        assert!(text.contains("        4   0.000000   0.000000  <built-in method builtins.len>"));
        assert!(text.contains("peak 2048 bytes"));
        assert!(text.contains("line 3: 2000 bytes in 1 blocks"));
        assert!(text.contains("# Result\n<object at 0x1>"));
        assert!(text.contains("2/2 passed"));
        assert!(!text.contains("# Output"));
    }
}
