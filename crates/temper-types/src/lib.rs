//! Shared types, errors, states, and run records for the temper pipeline.
//!
//! This crate provides the foundational types used across all other temper
//! crates:
//! - `TemperError` — unified error taxonomy
//! - `StageState` — the per-(instance, stage) state derived from artifacts
//! - `RemediationAction` / `AppliedEffect` — classified fixes and their audit trail
//! - `StageRunRecord` — one append-only run-log entry per attempt
//! - `InstanceStatus` — the status-query payload rendered by front ends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Unified error type for all temper subsystems.
#[derive(Debug, thiserror::Error)]
pub enum TemperError {
    // === Artifact / instance errors ===
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Artifact '{artifact}' is present but malformed: {reason}")]
    SchemaInvalid { artifact: String, reason: String },

    // === Graph configuration errors ===
    #[error("Invalid stage graph: {0}")]
    InvalidGraph(String),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    // === Execution errors ===
    #[error("Stage '{stage}' is already running for instance '{instance}'")]
    AlreadyRunning { instance: String, stage: String },

    #[error("Stage '{stage}' is not eligible; missing or invalid inputs: {missing:?}")]
    StageNotEligible { stage: String, missing: Vec<String> },

    #[error("Stage '{stage}' exited 0 but did not produce: {missing:?}")]
    OutputsNotProduced { stage: String, missing: Vec<String> },

    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("Stage '{stage}' worker failed with exit code {exit_code}")]
    ProcessFailure { stage: String, exit_code: i32 },

    #[error(
        "Stage '{stage}' failed after {attempts} attempts; last signature: {signature}; \
         remediations attempted: {remediations:?}"
    )]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        signature: String,
        remediations: Vec<String>,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TemperError {
    /// Returns `true` if the failure is transient and another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TemperError::Timeout { .. } | TemperError::ProcessFailure { .. }
        )
    }

    /// Returns `true` if the error is permanent and must be surfaced, never
    /// auto-remediated.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TemperError::InvalidGraph(_)
                | TemperError::NotFound { .. }
                | TemperError::UnknownStage(_)
                | TemperError::OutputsNotProduced { .. }
                | TemperError::RetriesExhausted { .. }
        )
    }
}

/// A convenience alias for `Result<T, TemperError>`.
pub type Result<T> = std::result::Result<T, TemperError>;

// ---------------------------------------------------------------------------
// StageState — derived state of one stage for one instance
// ---------------------------------------------------------------------------

/// State of a stage, recomputed from artifacts on every query.
///
/// `FailedExhausted` is the only state that also consults the run log, to
/// distinguish "never ran" from "ran and gave up"; eligibility itself is
/// purely artifact-derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    NotEligible,
    Eligible,
    Running,
    Succeeded,
    FailedExhausted,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::NotEligible => "not_eligible",
            StageState::Eligible => "eligible",
            StageState::Running => "running",
            StageState::Succeeded => "succeeded",
            StageState::FailedExhausted => "failed_exhausted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RemediationAction — classified fix applied between retry attempts
// ---------------------------------------------------------------------------

/// An automatic corrective action selected by the failure classifier and
/// applied by the remediator before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemediationAction {
    /// Shrink a numeric launch parameter for the next attempt. Applications
    /// are monotone: the value never increases and never drops below `floor`.
    ReduceResourceParameter {
        param: String,
        new_value: u32,
        floor: u32,
    },
    /// Sleep before retrying, for transient failures.
    WaitAndRetry { seconds: u64 },
    /// Reinstall/upgrade a named dependency set.
    RepairDependencies { packages: Vec<String> },
    /// Recursively delete one cached directory so it is re-fetched.
    EvictCache { path: PathBuf },
}

impl RemediationAction {
    /// Short human-readable form used in run-log records and surfaced errors.
    pub fn describe(&self) -> String {
        match self {
            RemediationAction::ReduceResourceParameter {
                param, new_value, ..
            } => format!("{param} -> {new_value}"),
            RemediationAction::WaitAndRetry { seconds } => format!("wait {seconds}s"),
            RemediationAction::RepairDependencies { packages } => {
                format!("repair deps ({})", packages.join(", "))
            }
            RemediationAction::EvictCache { path } => {
                format!("evict cache {}", path.display())
            }
        }
    }
}

/// What a remediation actually changed, for audit logging. A refused or
/// failed application is recorded with `changed = false` — it never aborts
/// the retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedEffect {
    pub action: RemediationAction,
    pub changed: bool,
    pub detail: String,
}

impl AppliedEffect {
    pub fn summary(&self) -> String {
        if self.changed {
            self.action.describe()
        } else {
            format!("{} (no-op: {})", self.action.describe(), self.detail)
        }
    }
}

// ---------------------------------------------------------------------------
// StageRunRecord — append-only audit log of attempts
// ---------------------------------------------------------------------------

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDisposition {
    Succeeded,
    /// Failed, but another attempt follows within the same run.
    Retrying,
    /// Failed and the retry budget is spent (or the stage is not retryable).
    Exhausted,
    /// Worker exited 0 but its declared outputs are missing or invalid.
    OutputsMissing,
    /// Operator cancellation; does not count against the retry budget.
    Cancelled,
}

/// One run-log record per attempt. Persisted as a JSONL line under the
/// instance folder; never consulted for eligibility decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRunRecord {
    pub run_id: Uuid,
    pub stage: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Name of the matched failure signature, or `None` on success/cancel.
    pub signature: Option<String>,
    /// Summaries of remediations applied after this attempt failed.
    pub remediations: Vec<String>,
    pub disposition: RunDisposition,
    /// Tail of the captured combined output, truncated for the log.
    pub output_tail: String,
}

// ---------------------------------------------------------------------------
// Status query payload
// ---------------------------------------------------------------------------

/// Per-stage entry of the status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatusEntry {
    pub stage: String,
    pub state: StageState,
    /// Exit code of the most recent attempt, if the stage ever ran.
    pub last_exit_code: Option<i32>,
    /// Attempts used by the most recent run, 0 if the stage never ran.
    pub attempts_used: u32,
}

/// Full status of one workflow instance, in stage order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance: String,
    pub stages: Vec<StageStatusEntry>,
}

impl InstanceStatus {
    pub fn stage(&self, name: &str) -> Option<&StageStatusEntry> {
        self.stages.iter().find(|s| s.stage == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_not_found() {
        let err = TemperError::NotFound {
            what: "instance 'nigel'".into(),
        };
        assert_eq!(err.to_string(), "Not found: instance 'nigel'");
    }

    #[test]
    fn error_display_schema_invalid() {
        let err = TemperError::SchemaInvalid {
            artifact: "user_answers".into(),
            reason: "expected key 'responses'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Artifact 'user_answers' is present but malformed: expected key 'responses'"
        );
    }

    #[test]
    fn error_display_invalid_graph() {
        let err = TemperError::InvalidGraph("cycle: train -> export -> train".into());
        assert_eq!(
            err.to_string(),
            "Invalid stage graph: cycle: train -> export -> train"
        );
    }

    #[test]
    fn error_display_already_running() {
        let err = TemperError::AlreadyRunning {
            instance: "nigel".into(),
            stage: "train".into(),
        };
        assert_eq!(
            err.to_string(),
            "Stage 'train' is already running for instance 'nigel'"
        );
    }

    #[test]
    fn error_display_timeout() {
        let err = TemperError::Timeout {
            stage: "train".into(),
            timeout_secs: 14400,
        };
        assert_eq!(err.to_string(), "Stage 'train' timed out after 14400s");
    }

    #[test]
    fn error_display_retries_exhausted_includes_history() {
        let err = TemperError::RetriesExhausted {
            stage: "train".into(),
            attempts: 5,
            signature: "resource_exhaustion".into(),
            remediations: vec!["batch_size -> 4".into(), "batch_size -> 2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("after 5 attempts"));
        assert!(msg.contains("resource_exhaustion"));
        assert!(msg.contains("batch_size -> 4"));
    }

    // --- is_retryable / is_terminal ---

    #[test]
    fn retryable_process_failure_and_timeout() {
        assert!(TemperError::ProcessFailure {
            stage: "train".into(),
            exit_code: 1,
        }
        .is_retryable());
        assert!(TemperError::Timeout {
            stage: "train".into(),
            timeout_secs: 60,
        }
        .is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        let terminal = [
            TemperError::InvalidGraph("bad".into()),
            TemperError::NotFound { what: "x".into() },
            TemperError::UnknownStage("y".into()),
            TemperError::RetriesExhausted {
                stage: "train".into(),
                attempts: 5,
                signature: "unrecognized".into(),
                remediations: vec![],
            },
        ];
        for err in terminal {
            assert!(err.is_terminal(), "{err} should be terminal");
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
    }

    #[test]
    fn already_running_is_neither_terminal_nor_retryable() {
        let err = TemperError::AlreadyRunning {
            instance: "a".into(),
            stage: "b".into(),
        };
        assert!(!err.is_terminal());
        assert!(!err.is_retryable());
    }

    // --- From impls ---

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TemperError = io_err.into();
        assert!(matches!(err, TemperError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: TemperError = json_err.into();
        assert!(matches!(err, TemperError::Json(_)));
    }

    // --- StageState ---

    #[test]
    fn stage_state_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&StageState::NotEligible).unwrap(),
            "\"not_eligible\""
        );
        assert_eq!(
            serde_json::to_string(&StageState::FailedExhausted).unwrap(),
            "\"failed_exhausted\""
        );
    }

    #[test]
    fn stage_state_display_matches_serde() {
        for state in [
            StageState::NotEligible,
            StageState::Eligible,
            StageState::Running,
            StageState::Succeeded,
            StageState::FailedExhausted,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json.trim_matches('"'), state.to_string());
        }
    }

    // --- RemediationAction ---

    #[test]
    fn action_serde_round_trip() {
        let actions = vec![
            RemediationAction::ReduceResourceParameter {
                param: "batch_size".into(),
                new_value: 4,
                floor: 2,
            },
            RemediationAction::WaitAndRetry { seconds: 30 },
            RemediationAction::RepairDependencies {
                packages: vec!["transformers".into(), "peft".into()],
            },
            RemediationAction::EvictCache {
                path: PathBuf::from("/cache/models--base"),
            },
        ];
        for action in actions {
            let json = serde_json::to_string(&action).unwrap();
            let back: RemediationAction = serde_json::from_str(&json).unwrap();
            assert_eq!(back, action);
        }
    }

    #[test]
    fn action_tag_is_snake_case_kind() {
        let json = serde_json::to_string(&RemediationAction::WaitAndRetry { seconds: 30 }).unwrap();
        assert!(json.contains("\"kind\":\"wait_and_retry\""), "got: {json}");
    }

    #[test]
    fn action_describe_is_compact() {
        let action = RemediationAction::ReduceResourceParameter {
            param: "batch_size".into(),
            new_value: 4,
            floor: 2,
        };
        assert_eq!(action.describe(), "batch_size -> 4");
        assert_eq!(
            RemediationAction::WaitAndRetry { seconds: 30 }.describe(),
            "wait 30s"
        );
    }

    #[test]
    fn applied_effect_summary_marks_noops() {
        let action = RemediationAction::EvictCache {
            path: PathBuf::from("/elsewhere"),
        };
        let refused = AppliedEffect {
            action: action.clone(),
            changed: false,
            detail: "outside cache root".into(),
        };
        assert!(refused.summary().contains("no-op"));

        let applied = AppliedEffect {
            action,
            changed: true,
            detail: "removed".into(),
        };
        assert!(!applied.summary().contains("no-op"));
    }

    // --- StageRunRecord ---

    #[test]
    fn run_record_serde_round_trip() {
        let record = StageRunRecord {
            run_id: Uuid::new_v4(),
            stage: "train".into(),
            attempt: 2,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            exit_code: Some(1),
            timed_out: false,
            signature: Some("resource_exhaustion".into()),
            remediations: vec!["batch_size -> 4".into()],
            disposition: RunDisposition::Retrying,
            output_tail: "CUDA out of memory".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: StageRunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, record.run_id);
        assert_eq!(back.attempt, 2);
        assert_eq!(back.disposition, RunDisposition::Retrying);
        assert_eq!(back.signature.as_deref(), Some("resource_exhaustion"));
    }

    #[test]
    fn disposition_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunDisposition::OutputsMissing).unwrap(),
            "\"outputs_missing\""
        );
    }

    // --- InstanceStatus ---

    #[test]
    fn instance_status_lookup_by_stage_name() {
        let status = InstanceStatus {
            instance: "nigel".into(),
            stages: vec![
                StageStatusEntry {
                    stage: "calibrate".into(),
                    state: StageState::Succeeded,
                    last_exit_code: Some(0),
                    attempts_used: 1,
                },
                StageStatusEntry {
                    stage: "train".into(),
                    state: StageState::NotEligible,
                    last_exit_code: None,
                    attempts_used: 0,
                },
            ],
        };
        assert_eq!(
            status.stage("train").map(|s| s.state),
            Some(StageState::NotEligible)
        );
        assert!(status.stage("export").is_none());
    }
}
