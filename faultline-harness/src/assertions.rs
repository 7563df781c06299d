//! Assertion helpers for chaos runs.
//!
//! These are pure functions over replica state collected after (or during)
//! a run. They return an [`AssertionResult`]; [`AssertionResult::report_to`]
//! turns a failed check into a Fail signal for the completion monitor.

use std::collections::{BTreeMap, HashSet};

use faultline_core::SignalHandle;
use serde::Serialize;

use crate::error::Result;

/// Documents held by one replica, keyed by document id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaState {
    /// Replica name.
    pub replica: String,
    /// Document id to content.
    pub documents: BTreeMap<String, serde_json::Value>,
}

impl ReplicaState {
    /// An empty replica.
    pub fn new(replica: impl Into<String>) -> Self {
        Self {
            replica: replica.into(),
            documents: BTreeMap::new(),
        }
    }

    /// Add a document.
    pub fn with(mut self, id: impl Into<String>, content: serde_json::Value) -> Self {
        self.documents.insert(id.into(), content);
        self
    }
}

/// State of a whole replica group.
#[derive(Debug, Clone, Default)]
pub struct TopologyState {
    /// Every replica in the group.
    pub replicas: Vec<ReplicaState>,
    /// Ids of writes the system acknowledged.
    pub acknowledged: HashSet<String>,
}

/// Result of an assertion check.
#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    /// Whether the assertion passed
    pub passed: bool,
    /// Description of what was checked
    pub description: String,
    /// Details on failure
    pub failure_details: Option<String>,
}

impl AssertionResult {
    /// Create a passing result.
    pub fn pass(description: &str) -> Self {
        Self {
            passed: true,
            description: description.into(),
            failure_details: None,
        }
    }

    /// Create a failing result.
    pub fn fail(description: &str, details: &str) -> Self {
        Self {
            passed: false,
            description: description.into(),
            failure_details: Some(details.into()),
        }
    }

    /// First failure of `results`, or a pass summarising all of them.
    pub fn all(results: impl IntoIterator<Item = AssertionResult>) -> Self {
        let mut checked = 0;
        for result in results {
            if !result.passed {
                return result;
            }
            checked += 1;
        }
        Self::pass(&format!("All {} checks passed", checked))
    }

    /// JSON form, for run logs.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.description.clone())
    }

    /// Send a Fail signal through `handle` if this result failed.
    ///
    /// A passing result drops the handle without signalling.
    ///
    /// # Errors
    ///
    /// [`HarnessError::Monitor`](crate::HarnessError::Monitor) when the run has already ended.
    pub fn report_to(&self, handle: SignalHandle) -> Result<()> {
        if self.passed {
            tracing::debug!("{}: {}", handle.label(), self.description);
            return Ok(());
        }

        let reason = match &self.failure_details {
            Some(details) => format!("{}: {}", self.description, details),
            None => self.description.clone(),
        };
        handle.fail(reason)?;
        Ok(())
    }
}

/// Assert that a document is present on a replica.
pub fn assert_document_present(replica: &ReplicaState, id: &str) -> AssertionResult {
    if replica.documents.contains_key(id) {
        AssertionResult::pass(&format!("Document {} present on {}", id, replica.replica))
    } else {
        AssertionResult::fail(
            &format!("Document {} should be present on {}", id, replica.replica),
            &format!(
                "Replica has {} documents but not the expected one",
                replica.documents.len()
            ),
        )
    }
}

/// Assert that every acknowledged write survived on every replica.
pub fn assert_no_data_loss(topology: &TopologyState) -> AssertionResult {
    let mut expected: Vec<&String> = topology.acknowledged.iter().collect();
    expected.sort();

    for replica in &topology.replicas {
        for id in &expected {
            if !replica.documents.contains_key(*id) {
                return AssertionResult::fail(
                    "No data loss check",
                    &format!(
                        "Replica {} is missing document {}. Has {}/{} acknowledged documents.",
                        replica.replica,
                        id,
                        expected
                            .iter()
                            .filter(|id| replica.documents.contains_key(**id))
                            .count(),
                        expected.len()
                    ),
                );
            }
        }
    }

    AssertionResult::pass(&format!(
        "All {} replicas hold all {} acknowledged documents",
        topology.replicas.len(),
        expected.len()
    ))
}

/// Assert that every replica holds identical documents.
pub fn assert_replicas_converged(topology: &TopologyState) -> AssertionResult {
    let Some(reference) = topology.replicas.first() else {
        return AssertionResult::pass("No replicas to check");
    };

    for replica in topology.replicas.iter().skip(1) {
        if replica.documents == reference.documents {
            continue;
        }

        let differing = reference
            .documents
            .keys()
            .chain(replica.documents.keys())
            .find(|id| reference.documents.get(*id) != replica.documents.get(*id))
            .cloned()
            .unwrap_or_default();

        return AssertionResult::fail(
            "Replica convergence",
            &format!(
                "Replica {} differs from {} at document {} ({:?} vs {:?})",
                replica.replica,
                reference.replica,
                differing,
                reference.documents.get(&differing),
                replica.documents.get(&differing)
            ),
        );
    }

    AssertionResult::pass(&format!(
        "All {} replicas converged on {} documents",
        topology.replicas.len(),
        reference.documents.len()
    ))
}

/// Assert that `received` is exactly `first, first + 1, ...` with no gap,
/// duplicate or reordering.
pub fn assert_sequence_intact(received: &[u64], first: u64) -> AssertionResult {
    for (offset, value) in received.iter().enumerate() {
        let expected = first + offset as u64;
        if *value != expected {
            return AssertionResult::fail(
                "Sequence integrity",
                &format!(
                    "Position {} holds {} but {} was expected",
                    offset, value, expected
                ),
            );
        }
    }

    AssertionResult::pass(&format!("{} values arrived in order", received.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use faultline_core::{CompletionMonitor, Failure, MonitorError, SignalKind};
    use serde_json::json;
    use std::time::Duration;

    fn topology(replicas: Vec<ReplicaState>, acknowledged: &[&str]) -> TopologyState {
        TopologyState {
            replicas,
            acknowledged: acknowledged.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_document_present() {
        let replica = ReplicaState::new("db-1").with("a", json!({"n": 1}));

        assert!(assert_document_present(&replica, "a").passed);
        let missing = assert_document_present(&replica, "b");
        assert!(!missing.passed);
        assert!(missing.failure_details.is_some());
    }

    #[test]
    fn test_no_data_loss_pass() {
        let state = topology(
            vec![
                ReplicaState::new("db-1").with("a", json!(1)).with("b", json!(2)),
                ReplicaState::new("db-2").with("a", json!(1)).with("b", json!(2)),
            ],
            &["a", "b"],
        );
        assert!(assert_no_data_loss(&state).passed);
    }

    #[test]
    fn test_no_data_loss_fail() {
        let state = topology(
            vec![
                ReplicaState::new("db-1").with("a", json!(1)).with("b", json!(2)),
                ReplicaState::new("db-2").with("a", json!(1)), // Missing b
            ],
            &["a", "b"],
        );

        let result = assert_no_data_loss(&state);
        assert!(!result.passed);
        let details = result.failure_details.unwrap();
        assert!(details.contains("db-2 is missing document b"));
        assert!(details.contains("1/2"));
    }

    #[test]
    fn test_unacknowledged_writes_may_be_lost() {
        let state = topology(
            vec![ReplicaState::new("db-1").with("a", json!(1))],
            &["a"],
        );
        assert!(assert_no_data_loss(&state).passed);
    }

    #[test]
    fn test_converged() {
        let state = topology(
            vec![
                ReplicaState::new("db-1").with("a", json!({"v": 2})),
                ReplicaState::new("db-2").with("a", json!({"v": 2})),
                ReplicaState::new("db-3").with("a", json!({"v": 2})),
            ],
            &[],
        );
        assert!(assert_replicas_converged(&state).passed);
        assert!(assert_replicas_converged(&TopologyState::default()).passed);
    }

    #[test]
    fn test_diverged() {
        let state = topology(
            vec![
                ReplicaState::new("db-1").with("a", json!({"v": 2})),
                ReplicaState::new("db-2").with("a", json!({"v": 1})),
            ],
            &[],
        );

        let result = assert_replicas_converged(&state);
        assert!(!result.passed);
        assert!(result.failure_details.unwrap().contains("db-2 differs from db-1 at document a"));
    }

    #[test]
    fn test_sequence() {
        assert!(assert_sequence_intact(&[5, 6, 7], 5).passed);
        assert!(assert_sequence_intact(&[], 0).passed);

        let gap = assert_sequence_intact(&[0, 1, 3], 0);
        assert!(!gap.passed);
        assert!(gap.failure_details.unwrap().contains("Position 2 holds 3"));
    }

    #[test]
    fn test_all_returns_first_failure() {
        let combined = AssertionResult::all([
            AssertionResult::pass("one"),
            AssertionResult::fail("two", "broken"),
            AssertionResult::fail("three", "also broken"),
        ]);
        assert_eq!(combined.description, "two");

        assert!(AssertionResult::all([AssertionResult::pass("one")]).passed);
    }

    #[test]
    fn test_json_form() {
        let json = AssertionResult::fail("check", "details").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["passed"], json!(false));
        assert_eq!(value["failure_details"], json!("details"));
    }

    #[tokio::test]
    async fn test_failed_assertion_fails_run() {
        let mut monitor = CompletionMonitor::new();
        let checker = monitor.register_named("integrity", SignalKind::Fail);
        let _writer = monitor.register_named("writer", SignalKind::Done);

        AssertionResult::fail("No data loss check", "db-2 is missing document b")
            .report_to(checker)
            .unwrap();

        let verdict = monitor.wait(Duration::from_secs(5)).await;
        match verdict.failure() {
            Some(Failure::Fail {
                participant,
                reason,
            }) => {
                assert_eq!(participant, "integrity");
                assert!(reason.contains("missing document b"));
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_passed_assertion_is_silent() {
        let mut monitor = CompletionMonitor::new();
        let checker = monitor.register_named("integrity", SignalKind::Fail);
        let writer = monitor.register_named("writer", SignalKind::Done);

        AssertionResult::pass("ok").report_to(checker).unwrap();
        writer.done().unwrap();

        assert!(monitor.run(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn late_failure_is_a_monitor_error() {
        let mut monitor = CompletionMonitor::new();
        let checker = monitor.register_named("integrity", SignalKind::Fail);
        let writer = monitor.register_named("writer", SignalKind::Done);
        writer.done().unwrap();
        assert!(monitor.run(Duration::from_secs(5)).await);

        let err = AssertionResult::fail("Convergence check", "db-3 diverged")
            .report_to(checker)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Monitor(MonitorError::Closed)));
    }
}
