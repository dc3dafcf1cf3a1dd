// Test runner for the TDD variant
//
// Test discovery and execution happen inside the driver, next to the
// submission's namespace. This side builds the plan that is shipped with the
// request and turns the driver's report into a consistent TestResults.

use crate::config::{Configuration, TEST_CLASS_NAME};
use crate::protocol::DriverTestReport;
use crate::types::{TestFailure, TestOutcome, TestResults};
use serde::Serialize;
use tracing::warn;

/// Upper bound on failure details kept per step
pub const MAX_FAILURE_DETAILS: usize = 32;

/// Embedded test suite shipped to the driver
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestPlan {
    pub source: String,
    pub class_name: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TestRunner;

impl TestRunner {
    pub fn new() -> Self {
        Self
    }

    /// Plan for `config`, or None outside the TDD variant
    pub fn plan(&self, config: &Configuration) -> Option<TestPlan> {
        config.unittest.as_ref().map(|source| TestPlan {
            source: source.clone(),
            class_name: TEST_CLASS_NAME.to_string(),
        })
    }

    /// Check a driver report and build the tally
    ///
    /// The driver's counts are trusted only if they add up; otherwise they are
    /// rebuilt from the failure list. A suite with no tests is misuse.
    pub fn tally(&self, report: DriverTestReport) -> TestResults {
        if let Some(message) = report.misuse {
            return TestResults::misuse(message);
        }
        if report.total == 0 {
            return TestResults::misuse(format!(
                "class {:?} defines no test methods",
                TEST_CLASS_NAME
            ));
        }

        let failures: Vec<TestFailure> = report
            .failures
            .into_iter()
            .map(|failure| TestFailure {
                outcome: match failure.outcome.as_str() {
                    "failed" => TestOutcome::Failed,
                    _ => TestOutcome::Errored,
                },
                name: failure.name,
                message: failure.message,
            })
            .take(MAX_FAILURE_DETAILS)
            .collect();

        let mut results = TestResults {
            total: report.total,
            passed: report.passed,
            failed: report.failed,
            errored: report.errored,
            failures,
            misuse: None,
        };

        let counted = u64::from(results.passed) + u64::from(results.failed) + u64::from(results.errored);
        if counted != u64::from(results.total) {
            warn!(
                total = results.total,
                passed = results.passed,
                failed = results.failed,
                errored = results.errored,
                "Inconsistent test tally from driver; recounting"
            );
            let total = results.total;
            results.failed = count(&results.failures, TestOutcome::Failed).min(total);
            results.errored = count(&results.failures, TestOutcome::Errored).min(total - results.failed);
            results.passed = total - results.failed - results.errored;
        }

        results
    }
}

fn count(failures: &[TestFailure], outcome: TestOutcome) -> u32 {
    failures.iter().filter(|f| f.outcome == outcome).count() as u32
}
