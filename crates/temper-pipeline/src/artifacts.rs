//! Artifact catalogue and filesystem-backed store.
//!
//! An artifact is a named file under a workflow instance's folder with a
//! validity predicate: exists, non-empty, and — for structured kinds — parses
//! as the expected shape. Eligibility everywhere in the pipeline is derived
//! from these predicates, never from cached run state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use temper_types::{Result, TemperError};

/// Expected shape of a JSON artifact. The core only checks "present,
/// non-empty, parses" plus a minimal structural hint; full schemas are owned
/// by the external worker tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonShape {
    /// Any well-formed JSON document.
    Any,
    /// A top-level array.
    Array,
    /// An object containing the given key.
    ObjectWithKey(String),
}

/// Kind of an artifact, driving the validity predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Json(JsonShape),
    /// Non-blank UTF-8 text (e.g. a base-model reference).
    Text,
    /// Opaque bytes; valid when present and non-empty.
    Binary,
}

/// One entry of the artifact catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Logical name, e.g. `synthetic_qa`.
    pub name: String,
    /// Path relative to the instance folder.
    pub rel_path: String,
    pub kind: ArtifactKind,
}

impl ArtifactSpec {
    pub fn new(name: &str, rel_path: &str, kind: ArtifactKind) -> Self {
        Self {
            name: name.to_string(),
            rel_path: rel_path.to_string(),
            kind,
        }
    }
}

/// Filesystem-backed artifact store rooted at a models directory. Each
/// workflow instance owns one subdirectory; all side effects are confined to
/// it.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    models_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(models_root: impl Into<PathBuf>) -> Self {
        Self {
            models_root: models_root.into(),
        }
    }

    pub fn models_root(&self) -> &Path {
        &self.models_root
    }

    /// The folder owning all artifacts of one instance.
    pub fn instance_root(&self, instance: &str) -> PathBuf {
        self.models_root.join(instance)
    }

    /// Absolute location of an artifact, whether or not it exists yet.
    pub fn path(&self, instance: &str, spec: &ArtifactSpec) -> PathBuf {
        self.instance_root(instance).join(&spec.rel_path)
    }

    pub async fn instance_exists(&self, instance: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.instance_root(instance)).await?)
    }

    /// Errors with `NotFound` when the instance folder is missing.
    pub async fn require_instance(&self, instance: &str) -> Result<()> {
        if self.instance_exists(instance).await? {
            Ok(())
        } else {
            Err(TemperError::NotFound {
                what: format!("instance '{instance}'"),
            })
        }
    }

    /// Create an instance folder. The models root is created on demand;
    /// creating an instance that already exists is an error.
    pub async fn create_instance(&self, instance: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.models_root).await?;
        let root = self.instance_root(instance);
        tokio::fs::create_dir(&root).await?;
        Ok(root)
    }

    /// Sorted list of instance folders under the models root. A missing root
    /// means no instances yet, not an error.
    pub async fn list_instances(&self) -> Result<Vec<String>> {
        if !tokio::fs::try_exists(&self.models_root).await? {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.models_root).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn exists(&self, instance: &str, spec: &ArtifactSpec) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path(instance, spec)).await?)
    }

    /// Full validity check: exists, non-zero size, and kind-specific parse.
    ///
    /// Returns `Ok(false)` for missing or empty files, `SchemaInvalid` for a
    /// present-but-malformed structured artifact (never silently treated as
    /// empty), and `NotFound` when the instance folder itself is absent.
    pub async fn is_valid(&self, instance: &str, spec: &ArtifactSpec) -> Result<bool> {
        self.require_instance(instance).await?;
        let path = self.path(instance, spec);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() || meta.len() == 0 {
            return Ok(false);
        }
        match &spec.kind {
            ArtifactKind::Binary => Ok(true),
            ArtifactKind::Text => {
                let text = tokio::fs::read_to_string(&path).await?;
                Ok(!text.trim().is_empty())
            }
            ArtifactKind::Json(shape) => {
                let text = tokio::fs::read_to_string(&path).await?;
                let value: serde_json::Value =
                    serde_json::from_str(&text).map_err(|e| TemperError::SchemaInvalid {
                        artifact: spec.name.clone(),
                        reason: e.to_string(),
                    })?;
                match shape {
                    JsonShape::Any => Ok(true),
                    JsonShape::Array => {
                        if value.is_array() {
                            Ok(true)
                        } else {
                            Err(TemperError::SchemaInvalid {
                                artifact: spec.name.clone(),
                                reason: "expected a top-level array".into(),
                            })
                        }
                    }
                    JsonShape::ObjectWithKey(key) => {
                        if value.get(key).is_some() {
                            Ok(true)
                        } else {
                            Err(TemperError::SchemaInvalid {
                                artifact: spec.name.clone(),
                                reason: format!("expected key '{key}'"),
                            })
                        }
                    }
                }
            }
        }
    }

    /// Eligibility form of [`is_valid`](Self::is_valid): a malformed artifact
    /// simply does not satisfy its consumers (a normal precondition state,
    /// not an error). `NotFound` and IO errors still propagate.
    pub async fn is_satisfied(&self, instance: &str, spec: &ArtifactSpec) -> Result<bool> {
        match self.is_valid(instance, spec).await {
            Ok(v) => Ok(v),
            Err(TemperError::SchemaInvalid { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write an artifact's bytes, creating parent directories, and flush to
    /// disk so downstream eligibility checks observe a durable file.
    pub async fn write(&self, instance: &str, spec: &ArtifactSpec, bytes: &[u8]) -> Result<()> {
        self.require_instance(instance).await?;
        let path = self.path(instance, spec);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        {
            use tokio::io::AsyncWriteExt;
            let mut file = file;
            file.write_all(bytes).await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Read and parse a JSON artifact (used by the answers summary).
    pub async fn read_json(&self, instance: &str, spec: &ArtifactSpec) -> Result<serde_json::Value> {
        self.require_instance(instance).await?;
        let path = self.path(instance, spec);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemperError::NotFound {
                    what: format!("artifact '{}' for instance '{instance}'", spec.name),
                })
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text).map_err(|e| TemperError::SchemaInvalid {
            artifact: spec.name.clone(),
            reason: e.to_string(),
        })
    }
}
