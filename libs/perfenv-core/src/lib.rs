//! perfenv core: scores Python submissions by correctness, running time and
//! peak memory behind a reset/step environment contract.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use perfenv_core::Evaluator;
//!
//! let mut env = Evaluator::new(&serde_json::json!({ "max_time_cost": 5 }))?;
//! let task = env.reset();
//! let step = env.step("def env_main():\n    return sum(range(1000))\n").await?;
//! println!("{}\n{} -> {}", task, step.observation, step.reward);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod profiler;
pub mod protocol;
pub mod reward;
pub mod runner;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{Backend, ConfigResolver, Configuration, EngineSettings, TEST_CLASS_NAME};
pub use engine::{build_engine, EngineOutput, ExecutionEngine, ExecutionRequest, ProcessEngine};
pub use error::{ConfigurationError, EnvError};
pub use evaluator::{EnvState, EpisodeState, Evaluator};
pub use executor::CodeExecutor;
pub use profiler::{ResourceLimits, ResourceProfiler};
pub use reward::{RewardBreakdown, RewardCalculator};
pub use runner::{TestPlan, TestRunner};
pub use types::{
    ErrorKind, ExecutionOutcome, FunctionProfile, MemoryHotspot, RaisedError, Step, StepInfo,
    TestResults,
};

pub use docker::DockerEngine;
