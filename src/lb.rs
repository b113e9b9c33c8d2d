use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{ClpPaths, ConfigSnapshot, FileSignature, file_signature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LbMode {
    #[default]
    ActiveFirst,
    WeightBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbOptions {
    /// Reset all failure state when a full candidate round fails.
    #[serde(default = "default_true", rename = "autoResetOnAllFailed")]
    pub auto_reset_on_all_failed: bool,
    #[serde(default = "default_true", rename = "notifyEnabled")]
    pub notify_enabled: bool,
    /// Minimum seconds between two automatic resets per service.
    #[serde(default = "default_cooldown", rename = "resetCooldownSeconds")]
    pub reset_cooldown_seconds: u64,
    #[serde(default = "default_threshold", rename = "failureThreshold")]
    pub failure_threshold: u32,
    /// When true, a failing forced config (config-mapping) falls back into
    /// the normal candidate loop instead of hard-failing.
    #[serde(default, rename = "failoverOnForcedConfig")]
    pub failover_on_forced_config: bool,
}

fn default_true() -> bool {
    true
}

fn default_cooldown() -> u64 {
    30
}

fn default_threshold() -> u32 {
    3
}

impl Default for LbOptions {
    fn default() -> Self {
        Self {
            auto_reset_on_all_failed: true,
            notify_enabled: true,
            reset_cooldown_seconds: 30,
            failure_threshold: 3,
            failover_on_forced_config: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbServiceState {
    #[serde(default = "default_threshold", rename = "failureThreshold")]
    pub failure_threshold: u32,
    #[serde(default, rename = "currentFailures")]
    pub current_failures: HashMap<String, u32>,
    #[serde(default, rename = "excludedConfigs")]
    pub excluded_configs: Vec<String>,
    /// Unix seconds of the last automatic reset; 0 means never.
    #[serde(default, rename = "lastResetAt")]
    pub last_reset_at: f64,
}

impl Default for LbServiceState {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            current_failures: HashMap::new(),
            excluded_configs: Vec::new(),
            last_reset_at: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LbConfigFile {
    #[serde(default)]
    pub mode: LbMode,
    #[serde(default)]
    pub options: LbOptions,
    #[serde(default)]
    pub services: HashMap<String, LbServiceState>,
}

/// Outcome of a reset attempt after a candidate round was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Failure state was cleared; retry the full candidate list once.
    Reset,
    /// Still inside the cooldown window; seconds until the next reset.
    CoolingDown { remaining_seconds: u64 },
    /// autoResetOnAllFailed is off.
    Disabled,
}

struct LbInner {
    config: LbConfigFile,
    signature: FileSignature,
    loaded: bool,
}

/// Per-service load-balancer state: failure counters, exclusion list and the
/// reset cooldown stamp, persisted to `data/lb_config.json` after every
/// mutation. All entry points take the mutex once and use `_locked` helpers,
/// and the file signature is re-checked on entry so external edits win.
pub struct LoadBalancer {
    service: &'static str,
    path: PathBuf,
    inner: Mutex<LbInner>,
}

impl LoadBalancer {
    pub fn new(service: &'static str, paths: &ClpPaths) -> Self {
        Self {
            service,
            path: paths.lb_config(),
            inner: Mutex::new(LbInner {
                config: LbConfigFile::default(),
                signature: FileSignature(0, 0),
                loaded: false,
            }),
        }
    }

    pub fn mode(&self) -> LbMode {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        inner.config.mode
    }

    pub fn options(&self) -> LbOptions {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        let mut opts = inner.config.options.clone();
        opts.failure_threshold = opts.failure_threshold.clamp(1, 10);
        opts
    }

    pub fn threshold(&self) -> u32 {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        Self::service_state_locked(&mut inner, self.service)
            .failure_threshold
            .clamp(1, 10)
    }

    pub fn failures_of(&self, name: &str) -> u32 {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        Self::service_state_locked(&mut inner, self.service)
            .current_failures
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn cooldown_remaining_seconds(&self) -> u64 {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        let cooldown = inner.config.options.reset_cooldown_seconds;
        let last = Self::service_state_locked(&mut inner, self.service).last_reset_at;
        let elapsed = (now_secs() - last).max(0.0);
        (cooldown as f64 - elapsed).max(0.0).ceil() as u64
    }

    /// Ordered candidate list for one request.
    ///
    /// `active-first`: the single active non-deleted config (no retries).
    /// `weight-based`: every healthy config ordered by `(-weight, name)`.
    pub fn pick(&self, snapshot: &ConfigSnapshot) -> Vec<String> {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        match inner.config.mode {
            LbMode::ActiveFirst => snapshot
                .active_config()
                .map(|cfg| vec![cfg.name.clone()])
                .unwrap_or_default(),
            LbMode::WeightBased => {
                let state = Self::service_state_locked(&mut inner, self.service);
                let threshold = state.failure_threshold.clamp(1, 10);
                let mut healthy: Vec<&crate::config::UpstreamConfig> = snapshot
                    .configs
                    .values()
                    .filter(|cfg| {
                        state.current_failures.get(&cfg.name).copied().unwrap_or(0) < threshold
                            && !state.excluded_configs.contains(&cfg.name)
                    })
                    .collect();
                healthy.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.name.cmp(&b.name)));
                healthy.into_iter().map(|cfg| cfg.name.clone()).collect()
            }
        }
    }

    /// Full weight-ordered list ignoring health, used for the second round
    /// right after a reset cleared all failure state.
    pub fn all_candidates(&self, snapshot: &ConfigSnapshot) -> Vec<String> {
        let mut all: Vec<&crate::config::UpstreamConfig> = snapshot.configs.values().collect();
        all.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.name.cmp(&b.name)));
        all.into_iter().map(|cfg| cfg.name.clone()).collect()
    }

    /// A successful upstream response clears the config's failure state.
    /// Both map entries go in one critical section so observers never see a
    /// cleared counter alongside a stale exclusion.
    pub fn on_success(&self, name: &str) {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        if inner.config.mode != LbMode::WeightBased {
            return;
        }
        let state = Self::service_state_locked(&mut inner, self.service);
        let mut changed = false;
        if state.current_failures.get(name).copied().unwrap_or(0) != 0 {
            state.current_failures.insert(name.to_string(), 0);
            changed = true;
        }
        if let Some(pos) = state.excluded_configs.iter().position(|n| n == name) {
            state.excluded_configs.remove(pos);
            changed = true;
        }
        if changed {
            self.persist_locked(&mut inner);
        }
    }

    /// Record a failed exchange. Returns true when the config just crossed
    /// the threshold and was added to the exclusion list.
    pub fn on_failure(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        if inner.config.mode != LbMode::WeightBased {
            return false;
        }
        let state = Self::service_state_locked(&mut inner, self.service);
        let threshold = state.failure_threshold.clamp(1, 10);
        let prev = state.current_failures.get(name).copied().unwrap_or(0);
        // capped at the threshold so count >= threshold <=> excluded stays simple
        let next = (prev + 1).min(threshold);
        let mut newly_excluded = false;
        let mut changed = false;
        if next != prev {
            state.current_failures.insert(name.to_string(), next);
            changed = true;
        }
        if next >= threshold && !state.excluded_configs.iter().any(|n| n == name) {
            state.excluded_configs.push(name.to_string());
            newly_excluded = true;
            changed = true;
        }
        if changed {
            self.persist_locked(&mut inner);
        }
        newly_excluded
    }

    /// Attempt the all-failed reset. Honors `autoResetOnAllFailed` and the
    /// per-service cooldown.
    pub fn maybe_reset(&self) -> ResetOutcome {
        let mut inner = self.inner.lock().expect("lb lock");
        self.ensure_current_locked(&mut inner);
        if !inner.config.options.auto_reset_on_all_failed {
            return ResetOutcome::Disabled;
        }
        let cooldown = inner.config.options.reset_cooldown_seconds;
        let now = now_secs();
        let state = Self::service_state_locked(&mut inner, self.service);
        let last = state.last_reset_at;
        if last > 0.0 && now - last < cooldown as f64 {
            let remaining = (cooldown as f64 - (now - last)).max(0.0).ceil() as u64;
            return ResetOutcome::CoolingDown {
                remaining_seconds: remaining,
            };
        }
        state.current_failures.clear();
        state.excluded_configs.clear();
        state.last_reset_at = now;
        self.persist_locked(&mut inner);
        ResetOutcome::Reset
    }

    fn ensure_current_locked(&self, inner: &mut LbInner) {
        let current = file_signature(&self.path);
        if inner.loaded && inner.signature == current {
            return;
        }
        inner.config = crate::config::read_json_file(&self.path).unwrap_or_default();
        inner.signature = current;
        inner.loaded = true;
    }

    fn service_state_locked<'a>(
        inner: &'a mut LbInner,
        service: &'static str,
    ) -> &'a mut LbServiceState {
        // a fresh section inherits the threshold from the options block
        let default_threshold = inner.config.options.failure_threshold.clamp(1, 10);
        inner
            .config
            .services
            .entry(service.to_string())
            .or_insert_with(|| LbServiceState {
                failure_threshold: default_threshold,
                ..Default::default()
            })
    }

    fn persist_locked(&self, inner: &mut LbInner) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&inner.config) {
            Ok(json) => {
                if let Err(err) = fs::write(&self.path, json) {
                    warn!("failed to persist lb config: {err}");
                }
                inner.signature = file_signature(&self.path);
            }
            Err(err) => warn!("failed to serialize lb config: {err}"),
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn lb_with_mode(dir: &tempfile::TempDir, mode: &str) -> LoadBalancer {
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        std::fs::write(
            paths.lb_config(),
            serde_json::json!({
                "mode": mode,
                "options": {
                    "autoResetOnAllFailed": true,
                    "resetCooldownSeconds": 30,
                    "notifyEnabled": true,
                    "failureThreshold": 3
                },
                "services": {}
            })
            .to_string(),
        )
        .unwrap();
        LoadBalancer::new("claude", &paths)
    }

    fn snapshot(entries: &[(&str, u32, bool)]) -> ConfigSnapshot {
        let mut configs = HashMap::new();
        let mut active = None;
        for (name, weight, is_active) in entries {
            if *is_active {
                active = Some(name.to_string());
            }
            configs.insert(
                name.to_string(),
                UpstreamConfig {
                    name: name.to_string(),
                    base_url: format!("https://{name}.example/"),
                    auth_token: "t".to_string(),
                    api_key: None,
                    weight: *weight,
                    active: *is_active,
                    deleted: false,
                    deleted_at: None,
                },
            );
        }
        ConfigSnapshot { configs, active }
    }

    #[test]
    fn active_first_yields_at_most_one_candidate() {
        let dir = tempdir().unwrap();
        let lb = lb_with_mode(&dir, "active-first");
        let snap = snapshot(&[("a", 10, false), ("b", 5, true)]);
        assert_eq!(lb.pick(&snap), vec!["b".to_string()]);
        assert!(lb.pick(&snapshot(&[])).is_empty());
    }

    #[test]
    fn weight_based_orders_by_weight_desc_then_name() {
        let dir = tempdir().unwrap();
        let lb = lb_with_mode(&dir, "weight-based");
        let snap = snapshot(&[("b", 50, false), ("a", 100, false), ("c", 50, false)]);
        assert_eq!(
            lb.pick(&snap),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn threshold_failures_exclude_a_config() {
        let dir = tempdir().unwrap();
        let lb = lb_with_mode(&dir, "weight-based");
        let snap = snapshot(&[("a", 100, false), ("b", 50, false)]);

        assert!(!lb.on_failure("a"));
        assert!(!lb.on_failure("a"));
        assert!(lb.on_failure("a"));
        assert_eq!(lb.pick(&snap), vec!["b".to_string()]);
        // counter is capped at the threshold
        lb.on_failure("a");
        assert_eq!(lb.failures_of("a"), 3);
    }

    #[test]
    fn success_clears_failures_and_exclusion() {
        let dir = tempdir().unwrap();
        let lb = lb_with_mode(&dir, "weight-based");
        let snap = snapshot(&[("a", 100, false)]);

        for _ in 0..3 {
            lb.on_failure("a");
        }
        assert!(lb.pick(&snap).is_empty());
        lb.on_success("a");
        assert_eq!(lb.failures_of("a"), 0);
        assert_eq!(lb.pick(&snap), vec!["a".to_string()]);
    }

    #[test]
    fn success_on_one_config_does_not_touch_another() {
        let dir = tempdir().unwrap();
        let lb = lb_with_mode(&dir, "weight-based");
        for _ in 0..3 {
            lb.on_failure("a");
        }
        lb.on_success("b");
        assert_eq!(lb.failures_of("a"), 3);
    }

    #[test]
    fn maybe_reset_clears_state_then_cools_down() {
        let dir = tempdir().unwrap();
        let lb = lb_with_mode(&dir, "weight-based");
        let snap = snapshot(&[("a", 100, false)]);

        for _ in 0..3 {
            lb.on_failure("a");
        }
        assert_eq!(lb.maybe_reset(), ResetOutcome::Reset);
        assert_eq!(lb.pick(&snap), vec!["a".to_string()]);

        for _ in 0..3 {
            lb.on_failure("a");
        }
        // second reset within the cooldown window is refused
        match lb.maybe_reset() {
            ResetOutcome::CoolingDown { remaining_seconds } => {
                assert!(remaining_seconds <= 30);
            }
            other => panic!("expected CoolingDown, got {other:?}"),
        }
        assert!(lb.pick(&snap).is_empty());
    }

    #[test]
    fn maybe_reset_disabled_by_option() {
        let dir = tempdir().unwrap();
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        std::fs::write(
            paths.lb_config(),
            serde_json::json!({
                "mode": "weight-based",
                "options": {"autoResetOnAllFailed": false}
            })
            .to_string(),
        )
        .unwrap();
        let lb = LoadBalancer::new("claude", &paths);
        assert_eq!(lb.maybe_reset(), ResetOutcome::Disabled);
    }

    #[test]
    fn state_persists_across_instances() {
        let dir = tempdir().unwrap();
        let lb = lb_with_mode(&dir, "weight-based");
        for _ in 0..3 {
            lb.on_failure("a");
        }
        drop(lb);

        let paths = ClpPaths::new(dir.path());
        let lb2 = LoadBalancer::new("claude", &paths);
        assert_eq!(lb2.failures_of("a"), 3);
        assert!(lb2.pick(&snapshot(&[("a", 1, false)])).is_empty());
    }
}
