//! Applying remediation actions between retry attempts.
//!
//! Remediations mutate only the next attempt's launch configuration or
//! clearly scoped shared resources (the model cache, the worker dependency
//! environment). Every application returns an [`AppliedEffect`] for the audit
//! log; a failed or refused application is recorded and the retry proceeds
//! regardless.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use temper_types::{AppliedEffect, RemediationAction};

/// Accumulated launch-parameter reductions for one run. The base
/// configuration is never mutated; each attempt folds these overrides on top.
#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    params: HashMap<String, u32>,
}

impl LaunchOverrides {
    /// Monotone reduction: the stored value only ever decreases, and never
    /// below `floor`. Returns the effective value and whether it changed.
    pub fn reduce(&mut self, param: &str, new_value: u32, floor: u32) -> (u32, bool) {
        let target = new_value.max(floor);
        match self.params.get(param) {
            Some(&current) if current <= target => (current, false),
            _ => {
                self.params.insert(param.to_string(), target);
                (target, true)
            }
        }
    }

    pub fn get(&self, param: &str) -> Option<u32> {
        self.params.get(param).copied()
    }
}

/// Applies classified remediation actions.
pub struct Remediator {
    cache_root: PathBuf,
    python: String,
}

impl Remediator {
    pub fn new(cache_root: impl Into<PathBuf>, python: impl Into<String>) -> Self {
        Self {
            cache_root: cache_root.into(),
            python: python.into(),
        }
    }

    /// Apply one action. Never errors: whatever goes wrong is folded into the
    /// returned effect and the outer retry loop continues.
    pub async fn apply(
        &self,
        action: &RemediationAction,
        overrides: &mut LaunchOverrides,
    ) -> AppliedEffect {
        match action {
            RemediationAction::ReduceResourceParameter {
                param,
                new_value,
                floor,
            } => {
                let (effective, changed) = overrides.reduce(param, *new_value, *floor);
                let detail = if changed {
                    format!("{param} reduced to {effective} for the next attempt")
                } else {
                    format!("{param} already at {effective}")
                };
                tracing::info!(%param, effective, changed, "resource parameter remediation");
                AppliedEffect {
                    action: action.clone(),
                    changed,
                    detail,
                }
            }
            RemediationAction::WaitAndRetry { seconds } => {
                tracing::info!(seconds, "backing off before retry");
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                AppliedEffect {
                    action: action.clone(),
                    changed: true,
                    detail: format!("waited {seconds}s"),
                }
            }
            RemediationAction::RepairDependencies { packages } => {
                self.repair_dependencies(action, packages).await
            }
            RemediationAction::EvictCache { path } => self.evict_cache(action, path).await,
        }
    }

    async fn repair_dependencies(
        &self,
        action: &RemediationAction,
        packages: &[String],
    ) -> AppliedEffect {
        let mut cmd = tokio::process::Command::new(&self.python);
        cmd.args(["-m", "pip", "install", "-q", "--upgrade"])
            .args(packages)
            .stdin(std::process::Stdio::null());
        match cmd.output().await {
            Ok(output) if output.status.success() => AppliedEffect {
                action: action.clone(),
                changed: true,
                detail: format!("reinstalled {}", packages.join(", ")),
            },
            Ok(output) => {
                let code = output.status.code().unwrap_or(-1);
                tracing::warn!(exit_code = code, "dependency repair failed; retry proceeds");
                AppliedEffect {
                    action: action.clone(),
                    changed: false,
                    detail: format!("pip exited {code}"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dependency repair could not start; retry proceeds");
                AppliedEffect {
                    action: action.clone(),
                    changed: false,
                    detail: format!("could not launch pip: {e}"),
                }
            }
        }
    }

    /// Scoped recursive delete. Refuses any path that is not strictly inside
    /// the configured cache root, so a misconfigured action cannot reach out
    /// of the cache.
    async fn evict_cache(&self, action: &RemediationAction, path: &Path) -> AppliedEffect {
        let inside = path.starts_with(&self.cache_root) && path != self.cache_root;
        if !inside {
            tracing::warn!(path = %path.display(), root = %self.cache_root.display(), "refusing cache eviction outside cache root");
            return AppliedEffect {
                action: action.clone(),
                changed: false,
                detail: format!("refused: {} is not under {}", path.display(), self.cache_root.display()),
            };
        }
        match tokio::fs::try_exists(path).await {
            Ok(false) => AppliedEffect {
                action: action.clone(),
                changed: false,
                detail: "cache entry not present".into(),
            },
            Ok(true) => {
                let result = if tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
                {
                    tokio::fs::remove_dir_all(path).await
                } else {
                    tokio::fs::remove_file(path).await
                };
                match result {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "evicted cached model");
                        AppliedEffect {
                            action: action.clone(),
                            changed: true,
                            detail: format!("removed {}", path.display()),
                        }
                    }
                    Err(e) => AppliedEffect {
                        action: action.clone(),
                        changed: false,
                        detail: format!("removal failed: {e}"),
                    },
                }
            }
            Err(e) => AppliedEffect {
                action: action.clone(),
                changed: false,
                detail: format!("could not stat cache entry: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn overrides_reduce_is_monotone_with_floor() {
        let mut overrides = LaunchOverrides::default();

        let (v, changed) = overrides.reduce("batch_size", 4, 2);
        assert_eq!((v, changed), (4, true));

        // A larger value later never re-grows the parameter.
        let (v, changed) = overrides.reduce("batch_size", 8, 2);
        assert_eq!((v, changed), (4, false));

        let (v, changed) = overrides.reduce("batch_size", 1, 2);
        assert_eq!((v, changed), (2, true), "clamped to floor");

        let (v, changed) = overrides.reduce("batch_size", 1, 2);
        assert_eq!((v, changed), (2, false), "idempotent at the floor");
    }

    #[tokio::test]
    async fn reduce_parameter_only_touches_overrides() {
        let dir = TempDir::new().unwrap();
        let remediator = Remediator::new(dir.path(), "python3");
        let mut overrides = LaunchOverrides::default();

        let action = RemediationAction::ReduceResourceParameter {
            param: "batch_size".into(),
            new_value: 4,
            floor: 2,
        };
        let effect = remediator.apply(&action, &mut overrides).await;
        assert!(effect.changed);
        assert_eq!(overrides.get("batch_size"), Some(4));

        // Re-applying across retries is idempotent-safe.
        let effect = remediator.apply(&action, &mut overrides).await;
        assert!(!effect.changed);
        assert_eq!(overrides.get("batch_size"), Some(4));
    }

    #[tokio::test]
    async fn evict_refuses_paths_outside_cache_root() {
        let cache = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let victim = elsewhere.path().join("precious");
        std::fs::create_dir(&victim).unwrap();

        let remediator = Remediator::new(cache.path(), "python3");
        let mut overrides = LaunchOverrides::default();
        let action = RemediationAction::EvictCache {
            path: victim.clone(),
        };

        let effect = remediator.apply(&action, &mut overrides).await;
        assert!(!effect.changed);
        assert!(effect.detail.contains("refused"));
        assert!(victim.exists(), "nothing outside the cache root is touched");
    }

    #[tokio::test]
    async fn evict_refuses_the_cache_root_itself() {
        let cache = TempDir::new().unwrap();
        let remediator = Remediator::new(cache.path(), "python3");
        let mut overrides = LaunchOverrides::default();
        let action = RemediationAction::EvictCache {
            path: cache.path().to_path_buf(),
        };

        let effect = remediator.apply(&action, &mut overrides).await;
        assert!(!effect.changed);
        assert!(cache.path().exists());
    }

    #[tokio::test]
    async fn evict_removes_a_cached_model_dir() {
        let cache = TempDir::new().unwrap();
        let entry = cache.path().join("models--base");
        std::fs::create_dir_all(entry.join("snapshots")).unwrap();
        std::fs::write(entry.join("snapshots").join("weights.safetensors"), b"x").unwrap();

        let remediator = Remediator::new(cache.path(), "python3");
        let mut overrides = LaunchOverrides::default();
        let action = RemediationAction::EvictCache { path: entry.clone() };

        let effect = remediator.apply(&action, &mut overrides).await;
        assert!(effect.changed);
        assert!(!entry.exists());

        // Evicting again is a recorded no-op.
        let effect = remediator.apply(&action, &mut overrides).await;
        assert!(!effect.changed);
        assert!(effect.detail.contains("not present"));
    }

    #[tokio::test]
    async fn wait_and_retry_sleeps_and_reports() {
        let dir = TempDir::new().unwrap();
        let remediator = Remediator::new(dir.path(), "python3");
        let mut overrides = LaunchOverrides::default();

        let start = std::time::Instant::now();
        let effect = remediator
            .apply(&RemediationAction::WaitAndRetry { seconds: 0 }, &mut overrides)
            .await;
        assert!(effect.changed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn failed_dependency_repair_is_non_fatal() {
        let dir = TempDir::new().unwrap();
        // A python that cannot exist; the effect records the problem instead
        // of erroring out of the retry loop.
        let remediator = Remediator::new(dir.path(), "/nonexistent/python");
        let mut overrides = LaunchOverrides::default();
        let action = RemediationAction::RepairDependencies {
            packages: vec!["transformers".into()],
        };

        let effect = remediator.apply(&action, &mut overrides).await;
        assert!(!effect.changed);
        assert!(effect.detail.contains("could not launch"));
    }
}
