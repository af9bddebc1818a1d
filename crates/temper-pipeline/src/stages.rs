//! Static stage catalogue and dependency graph.
//!
//! Each stage declares its required input artifacts, the outputs it must
//! produce, a shell command template, and its retry/timeout policy. The graph
//! is validated once at load time; after that, eligibility is computed on
//! every query from artifact validity alone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use temper_types::{Result, TemperError};

use crate::artifacts::{ArtifactKind, ArtifactSpec, ArtifactStore, JsonShape};

/// One pipeline step with declared artifact dependencies and launch policy.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub name: String,
    pub label: String,
    /// Logical names of artifacts that must be valid before launch.
    pub inputs: Vec<String>,
    /// Logical names of artifacts this stage must produce on success.
    pub outputs: Vec<String>,
    /// Shell command template with `{key}` placeholders (see
    /// [`render_template`]).
    pub command: String,
    /// Whether a failed attempt may be retried at all.
    pub retryable: bool,
    /// Total attempt budget for one run (minimum 1).
    pub max_retries: u32,
    /// Wall-clock budget per attempt.
    pub timeout: Duration,
    /// Retry on a failure with no classified remediation, after the default
    /// backoff. Bounded by `max_retries` like any other retry.
    pub retry_unclassified: bool,
}

impl StageDefinition {
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Validated, ordered stage graph plus the artifact catalogue it references.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageDefinition>,
    artifacts: Vec<ArtifactSpec>,
    /// artifact name -> producing stage name
    producers: HashMap<String, String>,
}

impl StageGraph {
    /// Build and validate a graph. Fails fast with `InvalidGraph` on unknown
    /// artifact references, an artifact produced by more than one stage, or a
    /// dependency cycle. Artifacts no stage produces are sources (seeded
    /// externally) and satisfy inputs whenever they are valid on disk.
    pub fn new(stages: Vec<StageDefinition>, artifacts: Vec<ArtifactSpec>) -> Result<Self> {
        let known: HashSet<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
        let mut producers: HashMap<String, String> = HashMap::new();

        let mut seen_names: HashSet<&str> = HashSet::new();
        for stage in &stages {
            if !seen_names.insert(stage.name.as_str()) {
                return Err(TemperError::InvalidGraph(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        for stage in &stages {
            for name in stage.inputs.iter().chain(stage.outputs.iter()) {
                if !known.contains(name.as_str()) {
                    return Err(TemperError::InvalidGraph(format!(
                        "stage '{}' references unknown artifact '{}'",
                        stage.name, name
                    )));
                }
            }
            for output in &stage.outputs {
                if let Some(previous) = producers.insert(output.clone(), stage.name.clone()) {
                    return Err(TemperError::InvalidGraph(format!(
                        "artifact '{}' is produced by both '{}' and '{}'",
                        output, previous, stage.name
                    )));
                }
            }
        }

        // Kahn's algorithm over stage-to-stage edges (producer -> consumer).
        let mut indegree: HashMap<&str, usize> =
            stages.iter().map(|s| (s.name.as_str(), 0)).collect();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for stage in &stages {
            for input in &stage.inputs {
                if let Some(producer) = producers.get(input) {
                    if producer != &stage.name {
                        edges
                            .entry(producer.as_str())
                            .or_default()
                            .push(stage.name.as_str());
                        *indegree.entry(stage.name.as_str()).or_default() += 1;
                    } else {
                        return Err(TemperError::InvalidGraph(format!(
                            "stage '{}' consumes its own output '{}'",
                            stage.name, input
                        )));
                    }
                }
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for next in edges.get(node).into_iter().flatten() {
                let d = indegree
                    .get_mut(next)
                    .ok_or_else(|| TemperError::InvalidGraph(format!("unknown stage '{next}'")))?;
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
        if visited != stages.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| *n)
                .collect();
            return Err(TemperError::InvalidGraph(format!(
                "dependency cycle involving stages: {}",
                stuck.join(", ")
            )));
        }

        Ok(Self {
            stages,
            artifacts,
            producers,
        })
    }

    /// The built-in calibrate → synthesize → train → export pipeline, with
    /// retry budgets and timeouts matching the worker scripts it drives.
    pub fn default_graph() -> Self {
        let artifacts = vec![
            ArtifactSpec::new(
                "question_set",
                "questions_with_perspectives.json",
                ArtifactKind::Json(JsonShape::Any),
            ),
            ArtifactSpec::new("base_model", "base_model.txt", ArtifactKind::Text),
            ArtifactSpec::new(
                "user_answers",
                "user_answers.json",
                ArtifactKind::Json(JsonShape::ObjectWithKey("responses".into())),
            ),
            ArtifactSpec::new(
                "synthetic_qa",
                "synthetic_qa.json",
                ArtifactKind::Json(JsonShape::Array),
            ),
            ArtifactSpec::new(
                "adapter",
                "finetuned_adapter/adapter_model.safetensors",
                ArtifactKind::Binary,
            ),
            ArtifactSpec::new("quantized_model", "export/model.gguf", ArtifactKind::Binary),
        ];
        let stages = vec![
            StageDefinition {
                name: "calibrate".into(),
                label: "Answer calibration questions".into(),
                inputs: vec!["question_set".into()],
                outputs: vec!["user_answers".into()],
                command: "{python} {workers_dir}/calibrate.py \
                          --questions {in:question_set} --output {out:user_answers}"
                    .into(),
                retryable: false,
                max_retries: 1,
                timeout: Duration::from_secs(6 * 3600),
                retry_unclassified: false,
            },
            StageDefinition {
                name: "synthesize".into(),
                label: "Generate synthetic Q&A".into(),
                inputs: vec!["user_answers".into()],
                outputs: vec!["synthetic_qa".into()],
                command: "{python} {workers_dir}/synthetic_generate.py \
                          --user-answers {in:user_answers} --output {out:synthetic_qa}"
                    .into(),
                retryable: true,
                max_retries: 3,
                timeout: Duration::from_secs(3600),
                retry_unclassified: false,
            },
            StageDefinition {
                name: "train".into(),
                label: "Train adapter".into(),
                inputs: vec!["synthetic_qa".into(), "base_model".into()],
                outputs: vec!["adapter".into()],
                command: "{python} {workers_dir}/train_adapter.py \
                          --model-folder {model_dir} --output-dir {model_dir}/finetuned_adapter \
                          --batch-size {batch_size}"
                    .into(),
                retryable: true,
                max_retries: 5,
                timeout: Duration::from_secs(4 * 3600),
                retry_unclassified: true,
            },
            StageDefinition {
                name: "export".into(),
                label: "Export quantized model".into(),
                inputs: vec!["adapter".into(), "base_model".into()],
                outputs: vec!["quantized_model".into()],
                command: "{python} {workers_dir}/convert_to_gguf.py \
                          --model-folder {model_dir} --quant {quant} \
                          --output {out:quantized_model}"
                    .into(),
                retryable: true,
                max_retries: 2,
                timeout: Duration::from_secs(2 * 3600),
                retry_unclassified: false,
            },
        ];
        // The built-in catalogue is validated by the same path as user graphs.
        Self::new(stages, artifacts).expect("built-in stage graph is valid")
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactSpec> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub fn artifacts(&self) -> &[ArtifactSpec] {
        &self.artifacts
    }

    /// Name of the stage producing an artifact, or `None` for sources.
    pub fn producer_of(&self, artifact: &str) -> Option<&str> {
        self.producers.get(artifact).map(String::as_str)
    }

    /// Input artifacts of `stage` that are currently missing or invalid.
    pub async fn unsatisfied_inputs(
        &self,
        store: &ArtifactStore,
        instance: &str,
        stage: &StageDefinition,
    ) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for name in &stage.inputs {
            let spec = self.artifact(name).ok_or_else(|| {
                TemperError::InvalidGraph(format!("unknown artifact '{name}'"))
            })?;
            if !store.is_satisfied(instance, spec).await? {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    }

    /// Output artifacts of `stage` that are currently missing or invalid.
    pub async fn unsatisfied_outputs(
        &self,
        store: &ArtifactStore,
        instance: &str,
        stage: &StageDefinition,
    ) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for name in &stage.outputs {
            let spec = self.artifact(name).ok_or_else(|| {
                TemperError::InvalidGraph(format!("unknown artifact '{name}'"))
            })?;
            if !store.is_satisfied(instance, spec).await? {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    }

    /// Stages whose required inputs are all valid right now. Stages with no
    /// inputs are always eligible.
    pub async fn eligible_stages(
        &self,
        store: &ArtifactStore,
        instance: &str,
    ) -> Result<Vec<&StageDefinition>> {
        let mut eligible = Vec::new();
        for stage in &self.stages {
            if self
                .unsatisfied_inputs(store, instance, stage)
                .await?
                .is_empty()
            {
                eligible.push(stage);
            }
        }
        Ok(eligible)
    }
}

/// Substitute `{key}` placeholders from the map. Unknown placeholders are
/// left in place so a misconfigured template shows up verbatim in logs.
pub fn render_template(template: &str, substitutions: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in substitutions {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(name: &str) -> ArtifactSpec {
        ArtifactSpec::new(name, &format!("{name}.json"), ArtifactKind::Json(JsonShape::Any))
    }

    fn stage(name: &str, inputs: &[&str], outputs: &[&str]) -> StageDefinition {
        StageDefinition {
            name: name.into(),
            label: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            command: "true".into(),
            retryable: true,
            max_retries: 1,
            timeout: Duration::from_secs(5),
            retry_unclassified: false,
        }
    }

    #[test]
    fn default_graph_is_valid_and_ordered() {
        let graph = StageGraph::default_graph();
        let names: Vec<&str> = graph.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["calibrate", "synthesize", "train", "export"]);
        assert_eq!(graph.producer_of("synthetic_qa"), Some("synthesize"));
        // question_set and base_model are seeded, not produced.
        assert_eq!(graph.producer_of("question_set"), None);
        assert_eq!(graph.producer_of("base_model"), None);
    }

    #[test]
    fn unknown_artifact_reference_is_invalid_graph() {
        let err = StageGraph::new(vec![stage("a", &["ghost"], &[])], vec![]).unwrap_err();
        assert!(matches!(err, TemperError::InvalidGraph(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn doubly_produced_artifact_is_invalid_graph() {
        let err = StageGraph::new(
            vec![stage("a", &[], &["x"]), stage("b", &[], &["x"])],
            vec![spec("x")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("produced by both"));
    }

    #[test]
    fn two_stage_cycle_is_invalid_graph() {
        let err = StageGraph::new(
            vec![stage("a", &["y"], &["x"]), stage("b", &["x"], &["y"])],
            vec![spec("x"), spec("y")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"), "got: {err}");
    }

    #[test]
    fn duplicate_stage_name_is_invalid_graph() {
        let err = StageGraph::new(
            vec![stage("a", &[], &["x"]), stage("a", &[], &["y"])],
            vec![spec("x"), spec("y")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn self_consuming_stage_is_invalid_graph() {
        let err = StageGraph::new(
            vec![stage("a", &["x"], &["x"])],
            vec![spec("x")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("own output"));
    }

    #[test]
    fn attempt_budget_has_floor_of_one() {
        let mut s = stage("a", &[], &[]);
        s.max_retries = 0;
        assert_eq!(s.attempt_budget(), 1);
        s.max_retries = 5;
        assert_eq!(s.attempt_budget(), 5);
    }

    #[tokio::test]
    async fn stage_with_no_inputs_is_always_eligible() {
        let graph = StageGraph::new(
            vec![stage("seeded", &[], &["x"])],
            vec![spec("x")],
        )
        .unwrap();
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.create_instance("m").await.unwrap();

        let eligible = graph.eligible_stages(&store, "m").await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name, "seeded");
    }

    #[tokio::test]
    async fn eligibility_follows_artifact_validity() {
        let graph = StageGraph::new(
            vec![stage("a", &[], &["x"]), stage("b", &["x"], &["y"])],
            vec![spec("x"), spec("y")],
        )
        .unwrap();
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.create_instance("m").await.unwrap();

        let eligible = graph.eligible_stages(&store, "m").await.unwrap();
        assert_eq!(eligible.len(), 1, "only the source stage before x exists");

        store
            .write("m", graph.artifact("x").unwrap(), br#"{"ok":true}"#)
            .await
            .unwrap();
        let eligible = graph.eligible_stages(&store, "m").await.unwrap();
        assert_eq!(eligible.len(), 2);
    }

    #[tokio::test]
    async fn malformed_input_blocks_eligibility_without_error() {
        let graph = StageGraph::new(
            vec![stage("b", &["x"], &["y"])],
            vec![spec("x"), spec("y")],
        )
        .unwrap();
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.create_instance("m").await.unwrap();
        store
            .write("m", graph.artifact("x").unwrap(), b"{ broken")
            .await
            .unwrap();

        let missing = graph
            .unsatisfied_inputs(&store, "m", graph.stage("b").unwrap())
            .await
            .unwrap();
        assert_eq!(missing, vec!["x"]);
    }

    #[test]
    fn render_template_substitutes_known_keys() {
        let mut subs = HashMap::new();
        subs.insert("python".to_string(), "python3".to_string());
        subs.insert("in:user_answers".to_string(), "/m/user_answers.json".to_string());
        let rendered = render_template("{python} gen.py --in {in:user_answers} --keep {unknown}", &subs);
        assert_eq!(rendered, "python3 gen.py --in /m/user_answers.json --keep {unknown}");
    }
}
