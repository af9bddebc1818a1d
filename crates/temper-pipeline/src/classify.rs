//! Failure classification: captured worker output → remediation actions.
//!
//! Classification is an explicit, ordered rule table rather than scattered
//! conditionals: each rule names a failure signature, the patterns that
//! trigger it, and the action it selects. `classify` is pure and
//! deterministic given its inputs; unmatched failures yield an empty list and
//! are surfaced to the operator unchanged.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use temper_types::RemediationAction;

/// One matched signature with its selected action.
#[derive(Debug, Clone)]
pub struct Classification {
    pub signature: &'static str,
    pub action: RemediationAction,
}

/// Which remediation a rule selects; materialized per attempt against the
/// classifier's configuration.
#[derive(Debug, Clone, Copy)]
enum ActionKind {
    ReduceBatch,
    Backoff,
    RepairDeps,
    EvictCache,
}

struct SignatureRule {
    signature: &'static str,
    /// Any match fires the rule.
    triggers: Vec<Regex>,
    /// When set, must also match (e.g. "corrupt" near a weights filename).
    co_occurring: Option<Regex>,
    kind: ActionKind,
}

impl SignatureRule {
    fn matches(&self, output: &str) -> bool {
        self.triggers.iter().any(|re| re.is_match(output))
            && self
                .co_occurring
                .as_ref()
                .map_or(true, |re| re.is_match(output))
    }
}

/// The rule table plus the configuration its actions are materialized from.
pub struct FailureClassifier {
    rules: Vec<SignatureRule>,
    batch_base: u32,
    batch_floor: u32,
    backoff: Duration,
    repair_packages: Vec<String>,
    cache_dir: PathBuf,
}

fn pattern(p: &str) -> Regex {
    Regex::new(&format!("(?i){p}")).expect("built-in signature pattern compiles")
}

impl FailureClassifier {
    pub fn new(
        batch_base: u32,
        batch_floor: u32,
        backoff: Duration,
        repair_packages: Vec<String>,
        cache_dir: PathBuf,
    ) -> Self {
        let rules = vec![
            SignatureRule {
                signature: "resource_exhaustion",
                triggers: vec![pattern("out of memory"), pattern("outofmemoryerror")],
                co_occurring: None,
                kind: ActionKind::ReduceBatch,
            },
            SignatureRule {
                signature: "transient_network",
                triggers: vec![
                    pattern("connection"),
                    pattern("timeouterror"),
                    pattern("timed out"),
                ],
                co_occurring: None,
                kind: ActionKind::Backoff,
            },
            SignatureRule {
                signature: "missing_dependency",
                triggers: vec![
                    pattern("importerror"),
                    pattern("modulenotfounderror"),
                    pattern("import error"),
                    pattern("module not found"),
                ],
                co_occurring: None,
                kind: ActionKind::RepairDeps,
            },
            SignatureRule {
                signature: "corrupt_cache",
                triggers: vec![pattern("corrupt"), pattern("invalid")],
                co_occurring: Some(pattern("safetensors")),
                kind: ActionKind::EvictCache,
            },
        ];
        Self {
            rules,
            batch_base,
            batch_floor,
            backoff,
            repair_packages,
            cache_dir,
        }
    }

    /// Match the captured output against the rule table, in priority order.
    /// Multiple signatures may co-occur; an unrecognized failure returns an
    /// empty list, never a guess.
    pub fn classify(&self, output: &str, attempt: u32) -> Vec<Classification> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(output))
            .map(|rule| Classification {
                signature: rule.signature,
                action: self.materialize(rule.kind, attempt),
            })
            .collect()
    }

    /// The timeout signature in its own right: when an attempt hits its
    /// wall-clock budget and nothing else matched, retry after the standard
    /// backoff without other modification.
    pub fn timeout_default(&self) -> Classification {
        Classification {
            signature: "timeout",
            action: RemediationAction::WaitAndRetry {
                seconds: self.backoff.as_secs(),
            },
        }
    }

    fn materialize(&self, kind: ActionKind, attempt: u32) -> RemediationAction {
        match kind {
            ActionKind::ReduceBatch => {
                // Halve per failed attempt, floored; the remediator applies
                // this monotonically so retries never re-grow the batch.
                let shift = attempt.min(31);
                let new_value = (self.batch_base >> shift).max(self.batch_floor);
                RemediationAction::ReduceResourceParameter {
                    param: "batch_size".into(),
                    new_value,
                    floor: self.batch_floor,
                }
            }
            ActionKind::Backoff => RemediationAction::WaitAndRetry {
                seconds: self.backoff.as_secs(),
            },
            ActionKind::RepairDeps => RemediationAction::RepairDependencies {
                packages: self.repair_packages.clone(),
            },
            ActionKind::EvictCache => RemediationAction::EvictCache {
                path: self.cache_dir.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> FailureClassifier {
        FailureClassifier::new(
            8,
            2,
            Duration::from_secs(30),
            vec!["transformers".into(), "peft".into()],
            PathBuf::from("/cache/hub/models--base"),
        )
    }

    #[test]
    fn cuda_oom_selects_batch_reduction() {
        let c = classifier();
        let actions = c.classify("RuntimeError: CUDA out of memory. Tried to allocate...", 1);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].signature, "resource_exhaustion");
        assert_eq!(
            actions[0].action,
            RemediationAction::ReduceResourceParameter {
                param: "batch_size".into(),
                new_value: 4,
                floor: 2,
            }
        );
    }

    #[test]
    fn batch_reduction_halves_per_attempt_and_floors() {
        let c = classifier();
        let value_at = |attempt| {
            let actions = c.classify("out of memory", attempt);
            match &actions[0].action {
                RemediationAction::ReduceResourceParameter { new_value, .. } => *new_value,
                other => panic!("unexpected action: {other:?}"),
            }
        };
        assert_eq!(value_at(1), 4);
        assert_eq!(value_at(2), 2);
        assert_eq!(value_at(3), 2); // floored
        assert_eq!(value_at(40), 2); // shift is clamped, still floored
    }

    #[test]
    fn network_signature_selects_fixed_backoff() {
        let c = classifier();
        let actions = c.classify("requests.exceptions.ConnectionError: ...", 1);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].signature, "transient_network");
        assert_eq!(
            actions[0].action,
            RemediationAction::WaitAndRetry { seconds: 30 }
        );
    }

    #[test]
    fn missing_dependency_selects_repair() {
        let c = classifier();
        let actions = c.classify("ModuleNotFoundError: No module named 'peft'", 1);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].signature, "missing_dependency");
        match &actions[0].action {
            RemediationAction::RepairDependencies { packages } => {
                assert_eq!(packages, &["transformers", "peft"]);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn corrupt_cache_requires_weights_filename_nearby() {
        let c = classifier();
        // "invalid" alone is far too common to act on.
        assert!(c.classify("ValueError: invalid literal for int()", 1).is_empty());

        let actions = c.classify("Error: model.safetensors header is corrupt", 1);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].signature, "corrupt_cache");
        assert_eq!(
            actions[0].action,
            RemediationAction::EvictCache {
                path: PathBuf::from("/cache/hub/models--base"),
            }
        );
    }

    #[test]
    fn multiple_signatures_can_co_occur_in_table_order() {
        let c = classifier();
        let actions = c.classify(
            "CUDA out of memory\nModuleNotFoundError: No module named 'datasets'",
            1,
        );
        let signatures: Vec<&str> = actions.iter().map(|a| a.signature).collect();
        assert_eq!(signatures, vec!["resource_exhaustion", "missing_dependency"]);
    }

    #[test]
    fn unrecognized_failure_yields_empty_list() {
        let c = classifier();
        assert!(c.classify("Segmentation fault (core dumped)", 1).is_empty());
        assert!(c.classify("", 3).is_empty());
    }

    #[test]
    fn classification_is_deterministic() {
        let c = classifier();
        let text = "Connection reset by peer\nout of memory";
        let first = c.classify(text, 2);
        let second = c.classify(text, 2);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.signature, b.signature);
            assert_eq!(a.action, b.action);
        }
    }

    #[test]
    fn matching_is_case_insensitive() {
        let c = classifier();
        assert_eq!(c.classify("OUT OF MEMORY", 1)[0].signature, "resource_exhaustion");
        assert_eq!(c.classify("ImportError: x", 1)[0].signature, "missing_dependency");
    }

    #[test]
    fn timeout_default_retries_without_modification() {
        let c = classifier();
        let t = c.timeout_default();
        assert_eq!(t.signature, "timeout");
        assert_eq!(t.action, RemediationAction::WaitAndRetry { seconds: 30 });
    }
}
