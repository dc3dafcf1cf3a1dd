// Configuration for perfenv
//
// Two layers:
// - Configuration: per-evaluator scoring settings, resolved from a caller
//   mapping by ConfigResolver and immutable afterwards
// - EngineSettings: how submissions are executed on this host, read from
//   PERFENV_* environment variables

use crate::error::ConfigurationError;
use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const GB: u64 = 1024 * 1024 * 1024;
pub const MB: u64 = 1024 * 1024;

pub const DEFAULT_MAX_INPUT_LEN: usize = 32_000;
pub const DEFAULT_MAX_TIME_COST: f64 = 60.0;
pub const DEFAULT_MAX_MEMORY_COST: u64 = 4 * GB;
pub const DEFAULT_ENTRY_POINT: &str = "env_main";
pub const DEFAULT_EXCEPTION_REWARD: f64 = -9.0;

/// Largest accepted `max_time_cost`, in seconds (one day)
pub const MAX_TIME_COST_CEILING: f64 = 86_400.0;

/// Name of the class the embedded test source must define
pub const TEST_CLASS_NAME: &str = "SolutionTest";

/// Keys accepted by `ConfigResolver::resolve`; anything else is rejected
pub const RECOGNIZED_KEYS: &[&str] = &[
    "max_input_len",
    "max_time_cost",
    "max_memory_cost",
    "time_weight",
    "memory_weight",
    "entry_point",
    "exception_reward",
    "unittest",
];

// Shortest submission is `def <entry>():` followed by a body.
const MIN_DEFINITION_OVERHEAD: usize = 8;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[_\p{L}\p{Nl}][_\p{L}\p{Nl}\p{Mn}\p{Mc}\p{Nd}\p{Pc}]*$")
        .expect("identifier pattern is valid")
});

static TEST_CLASS_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?m)^\s*class\s+{}\b", TEST_CLASS_NAME))
        .expect("test class pattern is valid")
});

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// True if `name` can be bound by `def name():` in the scored language
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name) && !PYTHON_KEYWORDS.contains(&name)
}

/// Validated evaluator configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Configuration {
    /// Upper bound on submission length, in characters
    pub max_input_len: usize,
    /// Seconds
    pub max_time_cost: f64,
    /// Bytes
    pub max_memory_cost: u64,
    pub time_weight: f64,
    pub memory_weight: f64,
    pub entry_point: String,
    pub exception_reward: f64,
    /// Test source for the TDD variant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unittest: Option<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_input_len: DEFAULT_MAX_INPUT_LEN,
            max_time_cost: DEFAULT_MAX_TIME_COST,
            max_memory_cost: DEFAULT_MAX_MEMORY_COST,
            time_weight: 1.0,
            memory_weight: 1.0,
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            exception_reward: DEFAULT_EXCEPTION_REWARD,
            unittest: None,
        }
    }
}

impl Configuration {
    pub fn max_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_time_cost)
    }

    pub fn is_tdd(&self) -> bool {
        self.unittest.is_some()
    }

    /// Check every invariant; `ConfigResolver` calls this after merging
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_input_len == 0 {
            return Err(ConfigurationError::NonPositive {
                key: "max_input_len",
                value: self.max_input_len.to_string(),
            });
        }
        if !self.max_time_cost.is_finite() || self.max_time_cost <= 0.0 {
            return Err(ConfigurationError::NonPositive {
                key: "max_time_cost",
                value: self.max_time_cost.to_string(),
            });
        }
        if self.max_time_cost > MAX_TIME_COST_CEILING {
            return Err(ConfigurationError::OutOfRange {
                key: "max_time_cost",
                value: self.max_time_cost.to_string(),
                max: MAX_TIME_COST_CEILING.to_string(),
            });
        }
        if self.max_memory_cost == 0 {
            return Err(ConfigurationError::NonPositive {
                key: "max_memory_cost",
                value: self.max_memory_cost.to_string(),
            });
        }
        for (key, value) in [
            ("time_weight", self.time_weight),
            ("memory_weight", self.memory_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::InvalidWeight { key, value });
            }
        }
        if self.time_weight + self.memory_weight <= 0.0 {
            return Err(ConfigurationError::ZeroWeights);
        }
        if !self.exception_reward.is_finite() || self.exception_reward >= 0.0 {
            return Err(ConfigurationError::NonNegativePenalty(self.exception_reward));
        }
        if !is_valid_identifier(&self.entry_point) {
            return Err(ConfigurationError::InvalidEntryPoint(
                self.entry_point.clone(),
            ));
        }
        let required = MIN_DEFINITION_OVERHEAD + self.entry_point.chars().count();
        if self.max_input_len <= required {
            return Err(ConfigurationError::InputLenTooSmall {
                max_input_len: self.max_input_len,
                entry_point: self.entry_point.clone(),
                required,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    max_input_len: Option<usize>,
    max_time_cost: Option<f64>,
    max_memory_cost: Option<u64>,
    time_weight: Option<f64>,
    memory_weight: Option<f64>,
    entry_point: Option<String>,
    exception_reward: Option<f64>,
    unittest: Option<String>,
}

/// Merges a caller-supplied mapping over the built-in defaults
///
/// Policy: unknown keys are rejected, `null` means "use the default".
pub struct ConfigResolver;

impl ConfigResolver {
    pub fn resolve(user_config: &serde_json::Value) -> Result<Configuration, ConfigurationError> {
        let map = match user_config {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => return Self::finish(Configuration::default()),
            other => {
                return Err(ConfigurationError::NotAMapping(
                    json_type_name(other).to_string(),
                ))
            }
        };

        if let Some(key) = map
            .keys()
            .find(|key| !RECOGNIZED_KEYS.contains(&key.as_str()))
        {
            return Err(ConfigurationError::UnknownKey(key.clone()));
        }

        let raw: RawConfig = serde_json::from_value(user_config.clone())
            .map_err(|e| ConfigurationError::Malformed(e.to_string()))?;

        let defaults = Configuration::default();
        let config = Configuration {
            max_input_len: raw.max_input_len.unwrap_or(defaults.max_input_len),
            max_time_cost: raw.max_time_cost.unwrap_or(defaults.max_time_cost),
            max_memory_cost: raw.max_memory_cost.unwrap_or(defaults.max_memory_cost),
            time_weight: raw.time_weight.unwrap_or(defaults.time_weight),
            memory_weight: raw.memory_weight.unwrap_or(defaults.memory_weight),
            entry_point: raw.entry_point.unwrap_or(defaults.entry_point),
            exception_reward: raw.exception_reward.unwrap_or(defaults.exception_reward),
            unittest: raw.unittest,
        };
        Self::finish(config)
    }

    fn finish(config: Configuration) -> Result<Configuration, ConfigurationError> {
        config.validate()?;
        if let Some(source) = &config.unittest {
            if !TEST_CLASS_DECL.is_match(source) {
                warn!(
                    class_name = TEST_CLASS_NAME,
                    "unittest source does not visibly declare the test class; \
                     steps will report TestHarnessMisuse unless it is defined dynamically"
                );
            }
        }
        Ok(config)
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "a mapping",
    }
}

/// Which isolation backend runs submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Process,
    Docker,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Process => write!(f, "process"),
            Backend::Docker => write!(f, "docker"),
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Backend::Process),
            "docker" => Ok(Backend::Docker),
            _ => bail!("Invalid backend: {} (valid options: process, docker)", s),
        }
    }
}

/// Host-side execution settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub backend: Backend,
    /// Interpreter used by the process backend
    pub python: String,
    pub docker_image: String,
    pub docker_cpus: f64,
    /// Allowance for interpreter + driver memory on top of `max_memory_cost`
    pub memory_overhead: u64,
    /// Extra time granted to interpreter startup and module-level code
    pub startup_grace: Duration,
    pub sample_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Process,
            python: "python3".to_string(),
            docker_image: "python:3.12-slim".to_string(),
            docker_cpus: 1.0,
            memory_overhead: 64 * MB,
            startup_grace: Duration::from_millis(5000),
            sample_interval: Duration::from_millis(10),
        }
    }
}

impl EngineSettings {
    /// Read PERFENV_* variables from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(backend) = lookup("PERFENV_BACKEND") {
            settings.backend = backend.parse()?;
        }
        if let Some(python) = lookup("PERFENV_PYTHON") {
            settings.python = python;
        }
        if let Some(image) = lookup("PERFENV_DOCKER_IMAGE") {
            settings.docker_image = image;
        }
        if let Some(cpus) = lookup("PERFENV_DOCKER_CPUS") {
            settings.docker_cpus = cpus
                .parse()
                .with_context(|| format!("Invalid PERFENV_DOCKER_CPUS: {}", cpus))?;
            if !(settings.docker_cpus.is_finite() && settings.docker_cpus > 0.0) {
                bail!("PERFENV_DOCKER_CPUS must be positive (got {})", cpus);
            }
        }
        if let Some(mb) = lookup("PERFENV_MEMORY_OVERHEAD_MB") {
            let mb: u64 = mb
                .parse()
                .with_context(|| format!("Invalid PERFENV_MEMORY_OVERHEAD_MB: {}", mb))?;
            settings.memory_overhead = mb * MB;
        }
        if let Some(ms) = lookup("PERFENV_STARTUP_GRACE_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("Invalid PERFENV_STARTUP_GRACE_MS: {}", ms))?;
            settings.startup_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup("PERFENV_SAMPLE_INTERVAL_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("Invalid PERFENV_SAMPLE_INTERVAL_MS: {}", ms))?;
            if ms == 0 {
                bail!("PERFENV_SAMPLE_INTERVAL_MS must be at least 1");
            }
            settings.sample_interval = Duration::from_millis(ms);
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_empty_mapping_yields_defaults() {
        let config = ConfigResolver::resolve(&json!({})).unwrap();
        assert_eq!(config, Configuration::default());
        assert_eq!(config.max_input_len, 32_000);
        assert_eq!(config.max_time_cost, 60.0);
        assert_eq!(config.max_memory_cost, 4 * GB);
        assert_eq!(config.entry_point, "env_main");
        assert_eq!(config.exception_reward, -9.0);
        assert!(!config.is_tdd());
    }

    #[test]
    fn test_null_yields_defaults() {
        let config = ConfigResolver::resolve(&serde_json::Value::Null).unwrap();
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn test_overrides_are_merged() {
        let config = ConfigResolver::resolve(&json!({
            "max_input_len": 2048,
            "max_time_cost": 1,
            "max_memory_cost": GB,
            "time_weight": 2,
            "memory_weight": 0.5,
            "entry_point": "my_function",
            "exception_reward": -1
        }))
        .unwrap();

        assert_eq!(config.max_input_len, 2048);
        assert_eq!(config.max_time_cost, 1.0);
        assert_eq!(config.max_memory_cost, GB);
        assert_eq!(config.time_weight, 2.0);
        assert_eq!(config.memory_weight, 0.5);
        assert_eq!(config.entry_point, "my_function");
        assert_eq!(config.exception_reward, -1.0);
        assert_eq!(config.max_time(), Duration::from_secs(1));
    }

    #[test]
    fn test_null_values_take_defaults() {
        let config = ConfigResolver::resolve(&json!({ "entry_point": null, "unittest": null })).unwrap();
        assert_eq!(config.entry_point, DEFAULT_ENTRY_POINT);
        assert!(config.unittest.is_none());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = ConfigResolver::resolve(&json!({ "max_time": 5 })).unwrap_err();
        assert_eq!(err, ConfigurationError::UnknownKey("max_time".to_string()));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = ConfigResolver::resolve(&json!({ "max_input_len": "big" })).unwrap_err();
        assert!(matches!(err, ConfigurationError::Malformed(_)));

        let err = ConfigResolver::resolve(&json!({ "max_memory_cost": -1 })).unwrap_err();
        assert!(matches!(err, ConfigurationError::Malformed(_)));
    }

    #[test]
    fn test_not_a_mapping() {
        let err = ConfigResolver::resolve(&json!([1, 2])).unwrap_err();
        assert_eq!(err, ConfigurationError::NotAMapping("an array".to_string()));
    }

    #[test]
    fn test_non_positive_bounds_rejected() {
        for (key, value) in [
            ("max_input_len", json!(0)),
            ("max_time_cost", json!(0)),
            ("max_time_cost", json!(-1.5)),
            ("max_memory_cost", json!(0)),
        ] {
            let err = ConfigResolver::resolve(&json!({ key: value })).unwrap_err();
            assert!(
                matches!(err, ConfigurationError::NonPositive { .. }),
                "{} = {} should be rejected, got {:?}",
                key,
                value,
                err
            );
        }
    }

    #[test]
    fn test_max_time_cost_ceiling() {
        let err = ConfigResolver::resolve(&json!({ "max_time_cost": 1e20 })).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::OutOfRange { key: "max_time_cost", .. }
        ));

        let config = ConfigResolver::resolve(&json!({ "max_time_cost": MAX_TIME_COST_CEILING }))
            .unwrap();
        assert_eq!(config.max_time(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_weights_validation() {
        let err = ConfigResolver::resolve(&json!({ "time_weight": -1 })).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidWeight { key: "time_weight", .. }));

        let err =
            ConfigResolver::resolve(&json!({ "time_weight": 0, "memory_weight": 0 })).unwrap_err();
        assert_eq!(err, ConfigurationError::ZeroWeights);

        // A single zero weight is fine: the reward then ignores that axis
        let config = ConfigResolver::resolve(&json!({ "memory_weight": 0 })).unwrap();
        assert_eq!(config.memory_weight, 0.0);
    }

    #[test]
    fn test_exception_reward_must_be_negative() {
        let err = ConfigResolver::resolve(&json!({ "exception_reward": 0 })).unwrap_err();
        assert_eq!(err, ConfigurationError::NonNegativePenalty(0.0));
        let err = ConfigResolver::resolve(&json!({ "exception_reward": 3 })).unwrap_err();
        assert_eq!(err, ConfigurationError::NonNegativePenalty(3.0));
    }

    #[test]
    fn test_entry_point_must_be_identifier() {
        for bad in ["", "1abc", "env-main", "env main", "def", "None", "lambda", "f()"] {
            let err = ConfigResolver::resolve(&json!({ "entry_point": bad })).unwrap_err();
            assert_eq!(err, ConfigurationError::InvalidEntryPoint(bad.to_string()));
        }
        for good in ["env_main", "_private", "solve2", "match", "résoudre"] {
            assert!(
                ConfigResolver::resolve(&json!({ "entry_point": good })).is_ok(),
                "{} should be accepted",
                good
            );
        }
    }

    #[test]
    fn test_max_input_len_must_fit_definition() {
        // "def env_main():" needs more than 8 + 8 characters
        let err = ConfigResolver::resolve(&json!({ "max_input_len": 16 })).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InputLenTooSmall { required: 16, .. }
        ));
        assert!(ConfigResolver::resolve(&json!({ "max_input_len": 17 })).is_ok());
    }

    #[test]
    fn test_unittest_enables_tdd() {
        let config = ConfigResolver::resolve(&json!({
            "unittest": "import unittest\nclass SolutionTest(unittest.TestCase):\n    pass\n"
        }))
        .unwrap();
        assert!(config.is_tdd());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("process".parse::<Backend>().unwrap(), Backend::Process);
        assert_eq!("DOCKER".parse::<Backend>().unwrap(), Backend::Docker);
        assert!("podman".parse::<Backend>().is_err());
    }

    #[test]
    fn test_engine_settings_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("PERFENV_BACKEND", "docker"),
            ("PERFENV_PYTHON", "/usr/bin/python3.12"),
            ("PERFENV_MEMORY_OVERHEAD_MB", "128"),
            ("PERFENV_STARTUP_GRACE_MS", "250"),
        ]
        .into_iter()
        .collect();

        let settings =
            EngineSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(settings.backend, Backend::Docker);
        assert_eq!(settings.python, "/usr/bin/python3.12");
        assert_eq!(settings.memory_overhead, 128 * MB);
        assert_eq!(settings.startup_grace, Duration::from_millis(250));
        assert_eq!(settings.docker_image, "python:3.12-slim");
        assert_eq!(settings.sample_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_engine_settings_rejects_garbage() {
        let result = EngineSettings::from_lookup(|key| {
            (key == "PERFENV_SAMPLE_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());

        let result = EngineSettings::from_lookup(|key| {
            (key == "PERFENV_SAMPLE_INTERVAL_MS").then(|| "0".to_string())
        });
        assert!(result.is_err());
    }
}
