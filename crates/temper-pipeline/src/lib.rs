//! Artifact-driven pipeline controller with supervised workers and
//! self-healing retries.
//!
//! This crate implements the temper core: artifact store and validity checks,
//! the static stage graph, the process supervisor, the failure-signature rule
//! table, the remediator, and the controller that ties them together with a
//! classify → remediate → retry loop. Pipeline state is always recomputed from
//! artifacts on disk; the append-only run log exists for audit and status
//! display only.

pub mod artifacts;
pub mod classify;
pub mod config;
pub mod controller;
pub mod events;
pub mod remediate;
pub mod runlog;
pub mod stages;
pub mod supervisor;

pub use artifacts::{ArtifactKind, ArtifactSpec, ArtifactStore, JsonShape};
pub use classify::{Classification, FailureClassifier};
pub use config::{LaunchConfig, QuantPreset, Settings};
pub use controller::{PipelineController, RunOutcome};
pub use events::{EventEmitter, PipelineEvent};
pub use remediate::{LaunchOverrides, Remediator};
pub use runlog::{append_record, last_run_for_stage, read_records, tail};
pub use stages::{render_template, StageDefinition, StageGraph};
pub use supervisor::{cancel_pair, CancelHandle, CancelToken, ProcessSupervisor, StageLauncher, SupervisorReport};
