/// Reward Calculator - pure scoring of one ExecutionOutcome
///
/// **Rules:**
/// - Any raised error → `exception_reward`
/// - Otherwise `base = 1 - (tw * time_cost + mw * memory_cost) / (tw + mw)`
///   with both costs normalized by their ceilings and clamped to [0, 1]
/// - With a usable test tally, `reward = base * passed / total`
///
/// Rewards therefore lie in `[exception_reward, 1]`.
use crate::config::Configuration;
use crate::types::ExecutionOutcome;
use serde::Serialize;

/// Intermediate terms of a reward, reported in `StepInfo`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RewardBreakdown {
    pub reward: f64,
    pub time_cost: Option<f64>,
    pub memory_cost: Option<f64>,
    pub base: Option<f64>,
    pub pass_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RewardCalculator;

impl RewardCalculator {
    pub fn compute(outcome: &ExecutionOutcome, config: &Configuration) -> f64 {
        Self::breakdown(outcome, config).reward
    }

    pub fn breakdown(outcome: &ExecutionOutcome, config: &Configuration) -> RewardBreakdown {
        if outcome.raised_error.is_some() {
            return RewardBreakdown {
                reward: config.exception_reward,
                time_cost: None,
                memory_cost: None,
                base: None,
                pass_ratio: None,
            };
        }

        let time_cost = outcome
            .elapsed_time
            .map(|elapsed| normalize(elapsed.as_secs_f64(), config.max_time_cost))
            .unwrap_or(0.0);
        let memory_cost = outcome
            .peak_memory
            .map(|peak| normalize(peak as f64, config.max_memory_cost as f64))
            .unwrap_or(0.0);

        let weight_sum = config.time_weight + config.memory_weight;
        let base = 1.0 - (config.time_weight * time_cost + config.memory_weight * memory_cost) / weight_sum;

        let pass_ratio = outcome.test_results.as_ref().and_then(|t| t.pass_ratio());
        let reward = match pass_ratio {
            Some(ratio) => base * ratio,
            None => base,
        };

        RewardBreakdown {
            reward,
            time_cost: Some(time_cost),
            memory_cost: Some(memory_cost),
            base: Some(base),
            pass_ratio,
        }
    }
}

fn normalize(value: f64, ceiling: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    (value / ceiling).min(1.0)
}
