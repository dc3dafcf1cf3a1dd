// Error taxonomy for perfenv
//
// Only two error types ever reach a caller:
// - ConfigurationError: raised once, at construction
// - EnvError: misuse of the reset/step contract, or a broken execution backend
//
// Everything a submission can do wrong is contained inside ExecutionOutcome.

use thiserror::Error;

/// Invalid evaluator configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("configuration must be a mapping, got {0}")]
    NotAMapping(String),

    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),

    #[error("malformed configuration: {0}")]
    Malformed(String),

    #[error("`{key}` must be strictly positive (got {value})")]
    NonPositive { key: &'static str, value: String },

    #[error("`{key}` must be at most {max} (got {value})")]
    OutOfRange {
        key: &'static str,
        value: String,
        max: String,
    },

    #[error("`{key}` must be a finite, non-negative number (got {value})")]
    InvalidWeight { key: &'static str, value: f64 },

    #[error("`time_weight` and `memory_weight` cannot both be zero")]
    ZeroWeights,

    #[error("`exception_reward` must be a finite negative number (got {0})")]
    NonNegativePenalty(f64),

    #[error("`entry_point` {0:?} is not a valid identifier")]
    InvalidEntryPoint(String),

    #[error(
        "`max_input_len` ({max_input_len}) cannot hold a definition of `{entry_point}` \
         (must be greater than {required})"
    )]
    InputLenTooSmall {
        max_input_len: usize,
        entry_point: String,
        required: usize,
    },
}

/// Errors returned by `Evaluator::step`
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("step() called before reset()")]
    NotReset,

    #[error("episode already finished; call reset() to start a new one")]
    EpisodeFinished,

    /// The backend could not run the submission at all (interpreter missing,
    /// Docker unreachable, ...). The episode is left in its previous state.
    #[error("execution engine failure: {0:#}")]
    Engine(anyhow::Error),
}

impl EnvError {
    /// Usage errors are the caller's fault; engine errors are the host's.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, EnvError::NotReset | EnvError::EpisodeFinished)
    }
}
