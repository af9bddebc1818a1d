//! Pipeline controller: state derivation, the classify → remediate → retry
//! loop, single-flight enforcement, and the status query.
//!
//! The controller owns no persisted state machine. Every query recomputes
//! stage states from artifact validity, so a crashed controller resumes by
//! simply being asked again; the run log is consulted only to tell "never
//! ran" apart from "ran and gave up".

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use temper_types::{
    InstanceStatus, Result, RunDisposition, StageRunRecord, StageState, StageStatusEntry,
    TemperError,
};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::classify::FailureClassifier;
use crate::config::{LaunchConfig, Settings};
use crate::events::{EventEmitter, PipelineEvent};
use crate::remediate::{LaunchOverrides, Remediator};
use crate::runlog;
use crate::stages::{render_template, StageDefinition, StageGraph};
use crate::supervisor::{cancel_pair, CancelHandle, CancelToken, ProcessSupervisor, StageLauncher};

type FlightKey = (String, String);
type FlightMap = HashMap<FlightKey, CancelHandle>;

/// How a blocking `run_stage` call ended (errors aside).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded { attempts: u32 },
    /// All declared outputs were already valid and no re-run was forced.
    AlreadyComplete,
    /// The operator cancelled; the stage is eligible again, unpenalized.
    Cancelled,
}

/// Orchestrates stage execution for workflow instances.
pub struct PipelineController {
    settings: Settings,
    launch: LaunchConfig,
    graph: StageGraph,
    store: ArtifactStore,
    classifier: FailureClassifier,
    remediator: Remediator,
    emitter: EventEmitter,
    launcher: Arc<dyn StageLauncher>,
    inflight: Mutex<FlightMap>,
}

/// Removes the in-flight entry when a run ends, however it ends.
struct FlightGuard<'a> {
    inflight: &'a Mutex<FlightMap>,
    key: FlightKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock_recovering(self.inflight).remove(&self.key);
    }
}

fn lock_recovering(mutex: &Mutex<FlightMap>) -> MutexGuard<'_, FlightMap> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PipelineController {
    pub fn new(
        settings: Settings,
        launch: LaunchConfig,
        graph: StageGraph,
        launcher: Arc<dyn StageLauncher>,
    ) -> Self {
        let store = ArtifactStore::new(settings.models_root.clone());
        let classifier = FailureClassifier::new(
            launch.batch_size,
            launch.batch_floor,
            launch.backoff,
            launch.repair_packages.clone(),
            launch.cache_entry.clone(),
        );
        let remediator = Remediator::new(settings.cache_root.clone(), settings.python.clone());
        Self {
            settings,
            launch,
            graph,
            store,
            classifier,
            remediator,
            emitter: EventEmitter::default(),
            launcher,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Controller over the built-in pipeline with a real process supervisor.
    pub fn with_defaults(settings: Settings) -> Self {
        let launch = LaunchConfig::for_settings(&settings);
        Self::new(
            settings,
            launch,
            StageGraph::default_graph(),
            Arc::new(ProcessSupervisor),
        )
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn events(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Run one stage to completion, including the bounded self-healing retry
    /// loop. Blocks the caller until the run succeeds, is cancelled, or the
    /// retry budget is spent.
    pub async fn run_stage(
        &self,
        instance: &str,
        stage_name: &str,
        force_rerun: bool,
    ) -> Result<RunOutcome> {
        let stage = self
            .graph
            .stage(stage_name)
            .ok_or_else(|| TemperError::UnknownStage(stage_name.to_string()))?;
        self.store.require_instance(instance).await?;

        let missing = self
            .graph
            .unsatisfied_inputs(&self.store, instance, stage)
            .await?;
        if !missing.is_empty() {
            return Err(TemperError::StageNotEligible {
                stage: stage.name.clone(),
                missing,
            });
        }
        if !force_rerun {
            let missing_outputs = self
                .graph
                .unsatisfied_outputs(&self.store, instance, stage)
                .await?;
            if missing_outputs.is_empty() {
                return Ok(RunOutcome::AlreadyComplete);
            }
        }

        // Single-flight per (instance, stage).
        let key: FlightKey = (instance.to_string(), stage.name.clone());
        let token = {
            let mut map = lock_recovering(&self.inflight);
            if map.contains_key(&key) {
                return Err(TemperError::AlreadyRunning {
                    instance: instance.to_string(),
                    stage: stage.name.clone(),
                });
            }
            let (handle, token) = cancel_pair();
            map.insert(key.clone(), handle);
            token
        };
        let _guard = FlightGuard {
            inflight: &self.inflight,
            key,
        };

        self.drive_attempts(instance, stage, token).await
    }

    /// Request cancellation of an in-flight stage. Returns `false` when
    /// nothing is running for that (instance, stage).
    pub fn cancel_stage(&self, instance: &str, stage: &str) -> bool {
        let key: FlightKey = (instance.to_string(), stage.to_string());
        match lock_recovering(&self.inflight).get(&key) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Status of every stage, recomputed from artifacts (plus the in-flight
    /// set for `Running` and the run-log tail for `FailedExhausted`).
    pub async fn status(&self, instance: &str) -> Result<InstanceStatus> {
        self.store.require_instance(instance).await?;
        let instance_root = self.store.instance_root(instance);
        let mut entries = Vec::new();
        for stage in self.graph.stages() {
            let key: FlightKey = (instance.to_string(), stage.name.clone());
            let running = lock_recovering(&self.inflight).contains_key(&key);
            let inputs_ok = self
                .graph
                .unsatisfied_inputs(&self.store, instance, stage)
                .await?
                .is_empty();
            let outputs_ok = self
                .graph
                .unsatisfied_outputs(&self.store, instance, stage)
                .await?
                .is_empty();
            let last_run = runlog::last_run_for_stage(&instance_root, &stage.name).await?;
            let attempts_used = last_run.iter().map(|r| r.attempt).max().unwrap_or(0);
            let last_exit_code = last_run.last().and_then(|r| r.exit_code);
            let exhausted = matches!(
                last_run.last().map(|r| r.disposition),
                Some(RunDisposition::Exhausted | RunDisposition::OutputsMissing)
            );

            let state = if running {
                StageState::Running
            } else if outputs_ok {
                StageState::Succeeded
            } else if !inputs_ok {
                StageState::NotEligible
            } else if exhausted {
                StageState::FailedExhausted
            } else {
                StageState::Eligible
            };
            entries.push(StageStatusEntry {
                stage: stage.name.clone(),
                state,
                last_exit_code,
                attempts_used,
            });
        }
        Ok(InstanceStatus {
            instance: instance.to_string(),
            stages: entries,
        })
    }

    async fn drive_attempts(
        &self,
        instance: &str,
        stage: &StageDefinition,
        token: CancelToken,
    ) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let instance_root = self.store.instance_root(instance);
        let mut overrides = LaunchOverrides::default();
        let mut remediation_history: Vec<String> = Vec::new();
        let budget = stage.attempt_budget();
        let run_started = tokio::time::Instant::now();

        for attempt in 1..=budget {
            if token.is_cancelled() {
                let now = Utc::now();
                self.append_record(
                    &instance_root,
                    StageRunRecord {
                        run_id,
                        stage: stage.name.clone(),
                        attempt,
                        started_at: now,
                        finished_at: now,
                        exit_code: None,
                        timed_out: false,
                        signature: None,
                        remediations: Vec::new(),
                        disposition: RunDisposition::Cancelled,
                        output_tail: String::new(),
                    },
                )
                .await;
                self.emitter.emit(PipelineEvent::StageCancelled {
                    instance: instance.to_string(),
                    stage: stage.name.clone(),
                    attempt,
                });
                return Ok(RunOutcome::Cancelled);
            }

            let command = self.render_command(stage, instance, &overrides);
            tracing::info!(
                instance,
                stage = %stage.name,
                attempt,
                budget,
                "launching stage worker"
            );
            self.emitter.emit(PipelineEvent::StageStarted {
                instance: instance.to_string(),
                stage: stage.name.clone(),
                attempt,
            });

            let started_at = Utc::now();
            let report = self
                .launcher
                .launch(&command, &instance_root, stage.timeout, token.clone())
                .await?;
            let finished_at = Utc::now();

            if report.cancelled {
                self.append_record(
                    &instance_root,
                    StageRunRecord {
                        run_id,
                        stage: stage.name.clone(),
                        attempt,
                        started_at,
                        finished_at,
                        exit_code: None,
                        timed_out: false,
                        signature: None,
                        remediations: Vec::new(),
                        disposition: RunDisposition::Cancelled,
                        output_tail: runlog::default_tail(&report.combined_output),
                    },
                )
                .await;
                self.emitter.emit(PipelineEvent::StageCancelled {
                    instance: instance.to_string(),
                    stage: stage.name.clone(),
                    attempt,
                });
                tracing::info!(instance, stage = %stage.name, "stage cancelled by operator");
                return Ok(RunOutcome::Cancelled);
            }

            if report.is_clean_exit() {
                // A zero exit code alone is not trusted: the declared outputs
                // must be valid on disk before the stage counts as done.
                let missing = self
                    .graph
                    .unsatisfied_outputs(&self.store, instance, stage)
                    .await?;
                if missing.is_empty() {
                    self.append_record(
                        &instance_root,
                        StageRunRecord {
                            run_id,
                            stage: stage.name.clone(),
                            attempt,
                            started_at,
                            finished_at,
                            exit_code: Some(0),
                            timed_out: false,
                            signature: None,
                            remediations: Vec::new(),
                            disposition: RunDisposition::Succeeded,
                            output_tail: runlog::default_tail(&report.combined_output),
                        },
                    )
                    .await;
                    self.emitter.emit(PipelineEvent::StageSucceeded {
                        instance: instance.to_string(),
                        stage: stage.name.clone(),
                        attempts: attempt,
                        duration_ms: run_started.elapsed().as_millis() as u64,
                    });
                    tracing::info!(instance, stage = %stage.name, attempts = attempt, "stage succeeded");
                    return Ok(RunOutcome::Succeeded { attempts: attempt });
                }

                self.append_record(
                    &instance_root,
                    StageRunRecord {
                        run_id,
                        stage: stage.name.clone(),
                        attempt,
                        started_at,
                        finished_at,
                        exit_code: Some(0),
                        timed_out: false,
                        signature: None,
                        remediations: Vec::new(),
                        disposition: RunDisposition::OutputsMissing,
                        output_tail: runlog::default_tail(&report.combined_output),
                    },
                )
                .await;
                let err = TemperError::OutputsNotProduced {
                    stage: stage.name.clone(),
                    missing,
                };
                self.emitter.emit(PipelineEvent::StageFailed {
                    instance: instance.to_string(),
                    stage: stage.name.clone(),
                    error: err.to_string(),
                });
                return Err(err);
            }

            // Failed attempt: classify, maybe remediate, maybe retry.
            let attempt_error = if report.timed_out {
                TemperError::Timeout {
                    stage: stage.name.clone(),
                    timeout_secs: stage.timeout.as_secs(),
                }
            } else {
                TemperError::ProcessFailure {
                    stage: stage.name.clone(),
                    exit_code: report.exit_code,
                }
            };
            tracing::warn!(
                instance,
                stage = %stage.name,
                attempt,
                error = %attempt_error,
                "stage attempt failed"
            );

            let mut classifications = self.classifier.classify(&report.combined_output, attempt);
            if classifications.is_empty() && report.timed_out {
                classifications.push(self.classifier.timeout_default());
            }
            let signature = classifications
                .first()
                .map(|c| c.signature)
                .unwrap_or("unrecognized")
                .to_string();
            self.emitter.emit(PipelineEvent::StageAttemptFailed {
                instance: instance.to_string(),
                stage: stage.name.clone(),
                attempt,
                signature: signature.clone(),
                exit_code: report.exit_code,
                timed_out: report.timed_out,
            });

            let will_retry = attempt < budget
                && stage.retryable
                && (!classifications.is_empty() || stage.retry_unclassified);

            let mut applied: Vec<String> = Vec::new();
            if will_retry {
                for classification in &classifications {
                    let effect = self
                        .remediator
                        .apply(&classification.action, &mut overrides)
                        .await;
                    self.emitter.emit(PipelineEvent::RemediationApplied {
                        instance: instance.to_string(),
                        stage: stage.name.clone(),
                        detail: effect.summary(),
                    });
                    applied.push(effect.summary());
                }
                if classifications.is_empty() {
                    // Unclassified but the stage opted into plain retries.
                    let delay = self.launch.default_retry_delay;
                    tokio::time::sleep(delay).await;
                    applied.push(format!("wait {}s", delay.as_secs()));
                }
            }

            self.append_record(
                &instance_root,
                StageRunRecord {
                    run_id,
                    stage: stage.name.clone(),
                    attempt,
                    started_at,
                    finished_at,
                    exit_code: Some(report.exit_code),
                    timed_out: report.timed_out,
                    signature: Some(signature.clone()),
                    remediations: applied.clone(),
                    disposition: if will_retry {
                        RunDisposition::Retrying
                    } else {
                        RunDisposition::Exhausted
                    },
                    output_tail: runlog::default_tail(&report.combined_output),
                },
            )
            .await;
            remediation_history.extend(applied);

            if !will_retry {
                let err = TemperError::RetriesExhausted {
                    stage: stage.name.clone(),
                    attempts: attempt,
                    signature,
                    remediations: remediation_history,
                };
                self.emitter.emit(PipelineEvent::StageFailed {
                    instance: instance.to_string(),
                    stage: stage.name.clone(),
                    error: err.to_string(),
                });
                return Err(err);
            }
            self.emitter.emit(PipelineEvent::StageRetrying {
                instance: instance.to_string(),
                stage: stage.name.clone(),
                next_attempt: attempt + 1,
            });
        }

        // The loop always returns on its final iteration (will_retry is false
        // when attempt == budget).
        Err(TemperError::Other(format!(
            "stage '{}' attempt loop ended without an outcome",
            stage.name
        )))
    }

    /// A run-log write failure must not take down the run itself.
    async fn append_record(&self, instance_root: &std::path::Path, record: StageRunRecord) {
        if let Err(e) = runlog::append_record(instance_root, &record).await {
            tracing::warn!(error = %e, "failed to append run-log record");
        }
    }

    fn render_command(
        &self,
        stage: &StageDefinition,
        instance: &str,
        overrides: &LaunchOverrides,
    ) -> String {
        let instance_root = self.store.instance_root(instance);
        let mut subs: HashMap<String, String> = HashMap::new();
        subs.insert("python".into(), self.settings.python.clone());
        subs.insert(
            "workers_dir".into(),
            self.settings.workers_dir.display().to_string(),
        );
        subs.insert("model_dir".into(), instance_root.display().to_string());
        subs.insert(
            "cache_dir".into(),
            self.settings.cache_root.display().to_string(),
        );
        subs.insert("quant".into(), self.launch.quant.as_arg().to_string());
        let batch = overrides
            .get("batch_size")
            .map(|v| v.min(self.launch.batch_size))
            .unwrap_or(self.launch.batch_size);
        subs.insert("batch_size".into(), batch.to_string());
        for name in stage.inputs.iter() {
            if let Some(spec) = self.graph.artifact(name) {
                subs.insert(
                    format!("in:{name}"),
                    self.store.path(instance, spec).display().to_string(),
                );
            }
        }
        for name in stage.outputs.iter() {
            if let Some(spec) = self.graph.artifact(name) {
                subs.insert(
                    format!("out:{name}"),
                    self.store.path(instance, spec).display().to_string(),
                );
            }
        }
        render_template(&stage.command, &subs)
    }
}
