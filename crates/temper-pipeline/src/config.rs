//! Settings file and per-run launch configuration.
//!
//! `Settings` is the operator-facing JSON file (models root, worker scripts,
//! interpreter, model cache). `LaunchConfig` is the base configuration a run
//! starts from; remediations never mutate it — each attempt folds accumulated
//! overrides on top of the immutable base.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use temper_types::{Result, TemperError};

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Operator settings persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Folder holding one subdirectory per workflow instance.
    pub models_root: PathBuf,
    /// Folder holding the external worker scripts.
    pub workers_dir: PathBuf,
    /// Interpreter used to launch workers and repair dependencies.
    pub python: String,
    /// Root of the shared model download cache (eviction scope).
    pub cache_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        let home = home_dir();
        Self {
            models_root: home.join("TemperModels"),
            workers_dir: PathBuf::from("workers"),
            python: "python3".into(),
            cache_root: home.join(".cache").join("huggingface").join("hub"),
        }
    }
}

impl Settings {
    /// Load settings from `path`. A missing file yields defaults and writes
    /// them back, so the operator has something to edit; a malformed file is
    /// an error rather than a silent fallback.
    pub async fn load_or_init(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                serde_json::from_str(&text).map_err(|e| TemperError::SchemaInvalid {
                    artifact: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default();
                settings.save(path).await?;
                Ok(settings)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

/// GGUF quantization presets accepted by the export worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantPreset {
    Q4KM,
    Q6K,
    Q8_0,
}

impl QuantPreset {
    /// The spelling the conversion tool expects.
    pub fn as_arg(&self) -> &'static str {
        match self {
            QuantPreset::Q4KM => "Q4_K_M",
            QuantPreset::Q6K => "Q6_K",
            QuantPreset::Q8_0 => "Q8_0",
        }
    }
}

impl FromStr for QuantPreset {
    type Err = TemperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "Q4" | "Q4_K_M" => Ok(QuantPreset::Q4KM),
            "Q6" | "Q6_K" => Ok(QuantPreset::Q6K),
            "Q8" | "Q8_0" => Ok(QuantPreset::Q8_0),
            other => Err(TemperError::Other(format!(
                "unknown quantization preset '{other}' (expected Q4_K_M, Q6_K, or Q8_0)"
            ))),
        }
    }
}

/// Base launch configuration for one run. Immutable once a run starts;
/// remediation effects accumulate separately and are folded in per attempt.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub batch_size: u32,
    pub batch_floor: u32,
    pub quant: QuantPreset,
    /// Fixed backoff for transient-network and bare-timeout retries.
    pub backoff: Duration,
    /// Dependency set reinstalled by the repair remediation.
    pub repair_packages: Vec<String>,
    /// Cached base-model directory targeted by cache eviction.
    pub cache_entry: PathBuf,
    /// Sleep between unclassified-failure retries.
    pub default_retry_delay: Duration,
}

impl LaunchConfig {
    pub fn for_settings(settings: &Settings) -> Self {
        Self {
            batch_size: 8,
            batch_floor: 2,
            quant: QuantPreset::Q4KM,
            backoff: Duration::from_secs(30),
            repair_packages: vec![
                "transformers".into(),
                "peft".into(),
                "datasets".into(),
                "accelerate".into(),
                "bitsandbytes".into(),
            ],
            cache_entry: settings.cache_root.join("models--base"),
            default_retry_delay: Duration::from_secs(60),
        }
    }
}
