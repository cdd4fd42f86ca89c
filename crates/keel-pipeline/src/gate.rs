//! Severity threshold applied to scanner findings.

use serde::{Deserialize, Serialize};

use keel_core::{Finding, Severity};

/// Outcome of evaluating findings against the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,
    /// Findings at or above the threshold.
    pub violations: Vec<Finding>,
    pub message: String,
}

/// Fails when any finding is at or above `threshold`. Findings below it are
/// recorded by the caller but never block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityGate {
    pub threshold: Severity,
}

impl QualityGate {
    pub fn new(threshold: Severity) -> Self {
        Self { threshold }
    }

    pub fn evaluate<'a>(&self, findings: impl IntoIterator<Item = &'a Finding>) -> GateVerdict {
        let mut total = 0;
        let violations: Vec<Finding> = findings
            .into_iter()
            .inspect(|_| total += 1)
            .filter(|f| f.severity >= self.threshold)
            .cloned()
            .collect();

        if violations.is_empty() {
            GateVerdict {
                passed: true,
                violations,
                message: format!("{total} finding(s), none at or above {}", self.threshold),
            }
        } else {
            let ids: Vec<String> = violations
                .iter()
                .map(|f| format!("{} ({})", f.id, f.severity))
                .collect();
            GateVerdict {
                passed: false,
                message: format!(
                    "{} finding(s) at or above {}: {}",
                    violations.len(),
                    self.threshold,
                    ids.join(", ")
                ),
                violations,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medium_passes_high_threshold() {
        let gate = QualityGate::new(Severity::High);
        let findings = [Finding::new(Severity::Medium, "CVE-2024-0001")];
        let verdict = gate.evaluate(&findings);
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn high_and_critical_fail() {
        let gate = QualityGate::new(Severity::High);
        let findings = [
            Finding::new(Severity::Low, "L1"),
            Finding::new(Severity::High, "H1"),
            Finding::new(Severity::Critical, "C1"),
        ];
        let verdict = gate.evaluate(&findings);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 2);
        assert!(verdict.message.contains("H1 (high)"));
    }

    #[test]
    fn threshold_is_configurable() {
        let findings = [Finding::new(Severity::Medium, "M1")];
        assert!(!QualityGate::new(Severity::Medium).evaluate(&findings).passed);
        assert!(QualityGate::new(Severity::Critical).evaluate(&findings).passed);
    }
}
