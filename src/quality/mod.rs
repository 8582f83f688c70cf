//! Quality gate validation.
//!
//! A gate is an ordered list of checks run against a unit before it may
//! leave the quality-assurance phase. Checks flagged `blocking` must
//! pass for the gate to pass; advisory checks are recorded but never
//! prevent advancement. A check that errors outright is treated as a
//! failure of that check (fail closed), not skipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state::UnitRecord;

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One structured finding produced by a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateFinding {
    pub severity: Severity,
    pub message: String,
    /// File the finding points at, when the check can locate it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl GateFinding {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    /// Sets the source location.
    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

/// Outcome of running one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub findings: Vec<GateFinding>,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            findings: Vec::new(),
        }
    }

    pub fn fail(findings: Vec<GateFinding>) -> Self {
        Self {
            passed: false,
            findings,
        }
    }
}

/// One validation check within the gate.
///
/// Implementations are opaque to the orchestrator: test suites, linters,
/// security scans. The gate only consumes name, blocking flag, and the
/// structured outcome.
#[async_trait]
pub trait GateCheck: Send + Sync {
    /// Stable check name for reports and logs.
    fn name(&self) -> &str;

    /// Whether a failure of this check blocks phase advancement.
    fn blocking(&self) -> bool;

    /// Run the check against a unit snapshot.
    async fn run(&self, unit: &UnitRecord) -> Result<CheckOutcome, String>;
}

/// Result of one check as recorded by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub check_name: String,
    pub blocking: bool,
    pub passed: bool,
    pub findings: Vec<GateFinding>,
}

/// Aggregate gate decision for one unit at one phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    /// True when every blocking check passed.
    pub passed: bool,
    pub results: Vec<CheckResult>,
}

impl GateReport {
    /// Names of blocking checks that failed.
    pub fn blocking_failures(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.blocking && !r.passed)
            .map(|r| r.check_name.as_str())
            .collect()
    }
}

/// Runs a configured, ordered list of checks and aggregates the verdict.
#[derive(Default)]
pub struct QualityGateValidator {
    checks: Vec<Box<dyn GateCheck>>,
}

impl QualityGateValidator {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// Append a check; checks run in registration order.
    pub fn with_check(mut self, check: Box<dyn GateCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check in order and aggregate. An empty gate passes.
    pub async fn validate(&self, unit: &UnitRecord) -> GateReport {
        let mut results = Vec::with_capacity(self.checks.len());
        let mut passed = true;

        for check in &self.checks {
            let outcome = match check.run(unit).await {
                Ok(outcome) => outcome,
                Err(reason) => {
                    warn!(
                        unit_id = %unit.unit_id,
                        check = check.name(),
                        %reason,
                        "gate check errored; treating as failed"
                    );
                    CheckOutcome::fail(vec![GateFinding::new(
                        Severity::Error,
                        format!("check failed to run: {}", reason),
                    )])
                }
            };

            if check.blocking() && !outcome.passed {
                passed = false;
            }
            debug!(
                unit_id = %unit.unit_id,
                check = check.name(),
                blocking = check.blocking(),
                passed = outcome.passed,
                "gate check finished"
            );
            results.push(CheckResult {
                check_name: check.name().to_string(),
                blocking: check.blocking(),
                passed: outcome.passed,
                findings: outcome.findings,
            });
        }

        GateReport { passed, results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;

    struct FixedCheck {
        name: &'static str,
        blocking: bool,
        outcome: Result<CheckOutcome, String>,
    }

    #[async_trait]
    impl GateCheck for FixedCheck {
        fn name(&self) -> &str {
            self.name
        }

        fn blocking(&self) -> bool {
            self.blocking
        }

        async fn run(&self, _unit: &UnitRecord) -> Result<CheckOutcome, String> {
            self.outcome.clone()
        }
    }

    fn unit() -> UnitRecord {
        UnitRecord::new("U-1", Phase::QualityAssurance)
    }

    #[tokio::test]
    async fn test_empty_gate_passes() {
        let report = QualityGateValidator::new().validate(&unit()).await;
        assert!(report.passed);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_failure_fails_the_gate() {
        let validator = QualityGateValidator::new()
            .with_check(Box::new(FixedCheck {
                name: "tests",
                blocking: true,
                outcome: Ok(CheckOutcome::fail(vec![GateFinding::new(
                    Severity::Error,
                    "2 tests failed",
                )])),
            }))
            .with_check(Box::new(FixedCheck {
                name: "lint",
                blocking: true,
                outcome: Ok(CheckOutcome::pass()),
            }));

        let report = validator.validate(&unit()).await;
        assert!(!report.passed);
        assert_eq!(report.blocking_failures(), vec!["tests"]);
        // All checks still ran and were recorded.
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn test_advisory_failure_does_not_block() {
        let validator = QualityGateValidator::new().with_check(Box::new(FixedCheck {
            name: "coverage",
            blocking: false,
            outcome: Ok(CheckOutcome::fail(vec![GateFinding::new(
                Severity::Warning,
                "coverage below 80%",
            )])),
        }));

        let report = validator.validate(&unit()).await;
        assert!(report.passed);
        assert!(report.blocking_failures().is_empty());
        assert!(!report.results[0].passed);
    }

    #[tokio::test]
    async fn test_erroring_check_fails_closed() {
        let validator = QualityGateValidator::new().with_check(Box::new(FixedCheck {
            name: "security",
            blocking: true,
            outcome: Err("scanner binary missing".to_string()),
        }));

        let report = validator.validate(&unit()).await;
        assert!(!report.passed);
        let findings = &report.results[0].findings;
        assert_eq!(findings[0].severity, Severity::Error);
        assert!(findings[0].message.contains("scanner binary missing"));
    }

    #[tokio::test]
    async fn test_checks_run_in_registration_order() {
        let validator = QualityGateValidator::new()
            .with_check(Box::new(FixedCheck {
                name: "format",
                blocking: false,
                outcome: Ok(CheckOutcome::pass()),
            }))
            .with_check(Box::new(FixedCheck {
                name: "tests",
                blocking: true,
                outcome: Ok(CheckOutcome::pass()),
            }));

        let report = validator.validate(&unit()).await;
        let names: Vec<&str> = report.results.iter().map(|r| r.check_name.as_str()).collect();
        assert_eq!(names, vec!["format", "tests"]);
    }

    #[test]
    fn test_finding_builder() {
        let finding =
            GateFinding::new(Severity::Warning, "unused import").with_location("src/lib.rs", 14);
        assert_eq!(finding.file.as_deref(), Some("src/lib.rs"));
        assert_eq!(finding.line, Some(14));
    }
}
