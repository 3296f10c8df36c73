//! Hot-reloadable rule registry
//! Mission: Swap rule sets at runtime with validation, versioning, and rollback

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::{streams, EventBus};
use crate::engine::rules::{canonical_json, validate_rules, RuleFile, RuleSet};
use crate::error::{EngineError, EngineResult};
use crate::state::StateStore;

const KV_CURRENT_VERSION: &str = "rules:current_version";
const KV_VERSION_TTL: Duration = Duration::from_secs(86400 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadStatus {
    Success,
    Unchanged,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl RuleChanges {
    pub fn total(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub status: ReloadStatus,
    pub version: String,
    pub hash: String,
    pub changes: RuleChanges,
    pub rule_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub rolled_back_to: String,
    pub from_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: String,
    pub hash: String,
    pub loaded_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStats {
    pub version: String,
    pub total_rules: usize,
    pub rules_by_type: HashMap<String, usize>,
    pub hard_gates: usize,
    pub combinations: usize,
    pub scoring: crate::engine::rules::ScoringConfig,
    pub last_updated: String,
}

/// The only mutable shared singleton in the system. Readers are lock-free:
/// evaluators load the `ArcSwap` pointer once per evaluation and keep that
/// snapshot for all categories.
pub struct RuleRegistry {
    rules_path: PathBuf,
    current: ArcSwap<RuleSet>,
    /// Every version ever installed, in install order. Rollback targets live
    /// here; reloading a source whose hash matches a retained version
    /// reinstates it instead of minting a duplicate.
    versions: Mutex<Vec<Arc<RuleSet>>>,
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
}

impl RuleRegistry {
    /// Load the initial rule set. Startup fails on an invalid source; there
    /// is no safe default to fall back to.
    pub fn load(
        rules_path: impl Into<PathBuf>,
        state: Arc<StateStore>,
        bus: Arc<EventBus>,
    ) -> EngineResult<Self> {
        let rules_path = rules_path.into();
        let (raw, hash) = read_source(&rules_path)?;

        let issues = validate_rules(&raw);
        if !issues.is_empty() {
            return Err(EngineError::RuleValidationFailed(issues));
        }

        let file: RuleFile = serde_json::from_value(raw)
            .map_err(|e| EngineError::InvalidInput(format!("rule source shape: {e}")))?;

        let initial = Arc::new(RuleSet {
            version: "1.0.0".to_string(),
            hash,
            loaded_at: Utc::now(),
            file,
        });

        let registry = Self {
            rules_path,
            current: ArcSwap::from(initial.clone()),
            versions: Mutex::new(vec![initial.clone()]),
            state,
            bus,
        };
        registry.distribute(&initial);

        info!(
            version = %initial.version,
            hash = %initial.hash,
            rules = initial.file.rules.len(),
            gates = initial.file.gates.len(),
            "Rule set loaded"
        );
        Ok(registry)
    }

    /// Snapshot of the active rule set. Cheap pointer load.
    pub fn current(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn version(&self) -> String {
        self.current.load().version.clone()
    }

    /// Re-read the rule source. `unchanged` when the canonical hash matches
    /// the active version and `force` is off; otherwise validate and install
    /// atomically, retaining the prior version for rollback.
    pub fn reload(&self, force: bool) -> EngineResult<ReloadReport> {
        let (raw, hash) = read_source(&self.rules_path)?;
        let active = self.current.load_full();

        if !force && hash == active.hash {
            return Ok(ReloadReport {
                status: ReloadStatus::Unchanged,
                version: active.version.clone(),
                hash,
                changes: RuleChanges::default(),
                rule_count: active.file.rules.len(),
            });
        }

        let issues = validate_rules(&raw);
        if !issues.is_empty() {
            warn!(issues = issues.len(), "Rule reload rejected by validation");
            return Err(EngineError::RuleValidationFailed(issues));
        }

        let file: RuleFile = serde_json::from_value(raw)
            .map_err(|e| EngineError::InvalidInput(format!("rule source shape: {e}")))?;

        let mut versions = self.versions.lock();

        // Same content as a retained version (e.g. reload after rollback):
        // reinstate it rather than minting a duplicate history entry.
        if let Some(existing) = versions.iter().find(|v| v.hash == hash).cloned() {
            let changes = diff_rules(&active.file, &existing.file);
            self.current.store(existing.clone());
            self.distribute(&existing);
            info!(version = %existing.version, "Rule set reinstated from history");
            return Ok(ReloadReport {
                status: ReloadStatus::Success,
                version: existing.version.clone(),
                hash,
                changes,
                rule_count: existing.file.rules.len(),
            });
        }

        let version = next_patch_version(versions.last().map(|v| v.version.as_str()));
        let changes = diff_rules(&active.file, &file);
        let rule_count = file.rules.len();

        let installed = Arc::new(RuleSet {
            version: version.clone(),
            hash: hash.clone(),
            loaded_at: Utc::now(),
            file,
        });
        versions.push(installed.clone());
        drop(versions);

        self.current.store(installed.clone());
        self.distribute(&installed);

        info!(
            version = %version,
            added = changes.added.len(),
            removed = changes.removed.len(),
            modified = changes.modified.len(),
            "Rule set reloaded"
        );

        Ok(ReloadReport {
            status: ReloadStatus::Success,
            version,
            hash,
            changes,
            rule_count,
        })
    }

    /// Swap the active pointer to a retained prior version.
    pub fn rollback(&self, version: &str) -> EngineResult<RollbackReport> {
        let versions = self.versions.lock();
        let target = versions
            .iter()
            .find(|v| v.version == version)
            .cloned()
            .ok_or_else(|| EngineError::Conflict(format!("version {version} not in history")))?;
        drop(versions);

        let from = self.current.load().version.clone();
        if from == target.version {
            return Err(EngineError::Conflict(format!(
                "version {version} is already active"
            )));
        }

        self.current.store(target.clone());
        self.distribute(&target);

        warn!(from = %from, to = %version, "Rules rolled back");
        Ok(RollbackReport {
            rolled_back_to: version.to_string(),
            from_version: from,
        })
    }

    pub fn history(&self) -> Vec<VersionInfo> {
        self.versions
            .lock()
            .iter()
            .map(|v| VersionInfo {
                version: v.version.clone(),
                hash: v.hash.clone(),
                loaded_at: v.loaded_at.to_rfc3339(),
            })
            .collect()
    }

    pub fn stats(&self) -> RuleStats {
        let active = self.current.load_full();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for rule in &active.file.rules {
            let key = match rule.kind {
                crate::engine::rules::RuleKind::Hard => "hard",
                crate::engine::rules::RuleKind::Velocity => "velocity",
                crate::engine::rules::RuleKind::Behavioral => "behavioral",
                crate::engine::rules::RuleKind::BehavioralMl => "behavioral_ml",
            };
            *by_type.entry(key.to_string()).or_insert(0) += 1;
        }

        RuleStats {
            version: active.version.clone(),
            total_rules: active.file.rules.len(),
            rules_by_type: by_type,
            hard_gates: active.file.gates.len(),
            combinations: active.file.rule_combinations.len(),
            scoring: active.file.scoring.clone(),
            last_updated: active.loaded_at.to_rfc3339(),
        }
    }

    /// Validate the source file without installing.
    pub fn validate_source(&self) -> EngineResult<Vec<String>> {
        let (raw, _) = read_source(&self.rules_path)?;
        Ok(validate_rules(&raw))
    }

    /// Push the installed version into the shared KV and announce it so peer
    /// instances converge. A missing consumer is not an error here.
    fn distribute(&self, installed: &Arc<RuleSet>) {
        if let Ok(serialized) = serde_json::to_string(&installed.file) {
            self.state.kv_set(
                &format!("rules:version:{}", installed.version),
                &serialized,
                Some(KV_VERSION_TTL),
            );
        }
        self.state
            .kv_set(KV_CURRENT_VERSION, &installed.version, Some(KV_VERSION_TTL));

        let _ = self.bus.publish(
            streams::RULE_RELOAD,
            &installed.version,
            serde_json::json!({
                "version": installed.version,
                "hash": installed.hash,
                "timestamp": installed.loaded_at.to_rfc3339(),
            }),
        );
    }
}

fn read_source(path: &PathBuf) -> EngineResult<(Value, String)> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::NotFound(format!("rules file {}", path.display()))
        } else {
            EngineError::Transient(format!("reading rules file: {e}"))
        }
    })?;

    let raw: Value = serde_yaml::from_str(&text)
        .map_err(|e| EngineError::InvalidInput(format!("invalid rule YAML: {e}")))?;

    let canonical = canonical_json(&raw);
    let hash = hex::encode(Sha256::digest(canonical.as_bytes()));
    Ok((raw, hash))
}

fn next_patch_version(last: Option<&str>) -> String {
    let Some(last) = last else {
        return "1.0.0".to_string();
    };
    let parts: Vec<u64> = last.split('.').filter_map(|p| p.parse().ok()).collect();
    match parts.as_slice() {
        [major, minor, patch] => format!("{major}.{minor}.{}", patch + 1),
        _ => "1.0.0".to_string(),
    }
}

fn diff_rules(old: &RuleFile, new: &RuleFile) -> RuleChanges {
    let old_by_name: HashMap<&str, &crate::engine::rules::RuleDef> =
        old.rules.iter().map(|r| (r.name.as_str(), r)).collect();
    let new_names: std::collections::HashSet<&str> =
        new.rules.iter().map(|r| r.name.as_str()).collect();

    let mut changes = RuleChanges::default();
    for rule in &new.rules {
        match old_by_name.get(rule.name.as_str()) {
            None => changes.added.push(rule.name.clone()),
            Some(old_rule) => {
                let old_json = serde_json::to_value(old_rule).unwrap_or(Value::Null);
                let new_json = serde_json::to_value(rule).unwrap_or(Value::Null);
                if old_json != new_json {
                    changes.modified.push(rule.name.clone());
                }
            }
        }
    }
    for name in old_by_name.keys() {
        if !new_names.contains(name) {
            changes.removed.push((*name).to_string());
        }
    }
    changes
}
