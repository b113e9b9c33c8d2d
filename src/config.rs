use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Root of all CLP state on disk. Defaults to `~/.clp`; tests inject a
/// temporary directory instead.
#[derive(Debug, Clone)]
pub struct ClpPaths {
    root: PathBuf,
}

impl ClpPaths {
    pub fn default_home() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".clp");
        Self { root }
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn service_config(&self, service: &str) -> PathBuf {
        self.root.join(format!("{service}.json"))
    }

    pub fn body_filter(&self) -> PathBuf {
        self.root.join("filter.json")
    }

    pub fn header_filter(&self) -> PathBuf {
        self.root.join("header_filter.json")
    }

    pub fn endpoint_filter(&self) -> PathBuf {
        self.root.join("endpoint_filter.json")
    }

    pub fn auth_config(&self) -> PathBuf {
        self.root.join("auth.json")
    }

    pub fn routing_config(&self) -> PathBuf {
        self.data_dir().join("model_router_config.json")
    }

    pub fn lb_config(&self) -> PathBuf {
        self.data_dir().join("lb_config.json")
    }

    pub fn request_log(&self, service: &str) -> PathBuf {
        self.data_dir().join(format!("proxy_requests_{service}.jsonl"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create {}", self.root.display()))?;
        fs::create_dir_all(self.data_dir())
            .with_context(|| format!("create {}", self.data_dir().display()))?;
        Ok(())
    }
}

/// (mtime_ns, size) pair used to detect on-disk changes without hashing.
/// A missing file maps to `(0, 0)` so "file appeared" is also a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileSignature(pub u128, pub u64);

pub fn file_signature(path: &Path) -> FileSignature {
    let Ok(meta) = fs::metadata(path) else {
        return FileSignature(0, 0);
    };
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    FileSignature(mtime_ns, meta.len())
}

/// One named upstream for a service. The map key in `{service}.json` is the
/// config name; `name` is filled in after load and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(skip)]
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

/// Upstream credential. When a config carries both, the API key wins; the
/// store refuses to write such a config in the first place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl UpstreamConfig {
    pub fn credential(&self) -> Option<Credential> {
        if let Some(key) = self.api_key.as_deref()
            && !key.trim().is_empty()
        {
            return Some(Credential::ApiKey(key.to_string()));
        }
        if !self.auth_token.trim().is_empty() {
            return Some(Credential::Bearer(self.auth_token.clone()));
        }
        None
    }
}

/// Immutable view of a service's configs at one point in time.
#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    /// Non-deleted configs only; the routing/LB layers never see deleted ones.
    pub configs: HashMap<String, UpstreamConfig>,
    pub active: Option<String>,
}

impl ConfigSnapshot {
    /// The single active non-deleted config, falling back to the
    /// lexicographically smallest name so the choice is stable.
    pub fn active_config(&self) -> Option<&UpstreamConfig> {
        self.active
            .as_ref()
            .and_then(|name| self.configs.get(name))
            .or_else(|| self.configs.iter().min_by_key(|(k, _)| *k).map(|(_, v)| v))
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

struct StoreState {
    snapshot: Arc<ConfigSnapshot>,
    signature: FileSignature,
    loaded: bool,
}

/// Per-service upstream config store. Every `get` stats the backing file and
/// reloads when the signature changed; `update` writes atomically via a
/// temp-file rename so readers never observe a partial file.
pub struct ConfigStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl ConfigStore {
    pub fn new(service: &'static str, paths: &ClpPaths) -> Self {
        Self {
            path: paths.service_config(service),
            state: RwLock::new(StoreState {
                snapshot: Arc::new(ConfigSnapshot::default()),
                signature: FileSignature(0, 0),
                loaded: false,
            }),
        }
    }

    /// Current snapshot, reloading from disk first if the file changed.
    /// A missing file is an empty map; unreadable or invalid JSON is an error
    /// the engine surfaces as a 500 for this service.
    pub fn get(&self) -> Result<Arc<ConfigSnapshot>> {
        let current = file_signature(&self.path);
        {
            let state = self.state.read().expect("config store lock");
            if state.loaded && state.signature == current {
                return Ok(state.snapshot.clone());
            }
        }

        let snapshot = Arc::new(self.load()?);
        let mut state = self.state.write().expect("config store lock");
        state.snapshot = snapshot.clone();
        state.signature = current;
        state.loaded = true;
        Ok(snapshot)
    }

    fn load(&self) -> Result<ConfigSnapshot> {
        if !self.path.exists() {
            return Ok(ConfigSnapshot::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(ConfigSnapshot::default());
        }
        let entries: HashMap<String, UpstreamConfig> = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Self::snapshot_from(entries))
    }

    fn snapshot_from(mut entries: HashMap<String, UpstreamConfig>) -> ConfigSnapshot {
        let mut configs = HashMap::new();
        let mut active = None;
        for (name, cfg) in entries.iter_mut() {
            cfg.name = name.clone();
            if cfg.deleted {
                // deleted implies inactive regardless of what the file says
                cfg.active = false;
                continue;
            }
            if cfg.active && active.is_none() {
                active = Some(name.clone());
            }
            configs.insert(name.clone(), cfg.clone());
        }
        ConfigSnapshot { configs, active }
    }

    /// Load all entries (deleted included), apply `mutation`, validate the
    /// invariants and write the result atomically.
    pub fn update(
        &self,
        mutation: impl FnOnce(&mut HashMap<String, UpstreamConfig>) -> Result<()>,
    ) -> Result<()> {
        let mut entries: HashMap<String, UpstreamConfig> = if self.path.exists() {
            let raw = fs::read_to_string(&self.path)
                .with_context(|| format!("read {}", self.path.display()))?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("parse {}", self.path.display()))?
            }
        } else {
            HashMap::new()
        };
        for (name, cfg) in entries.iter_mut() {
            cfg.name = name.clone();
        }

        mutation(&mut entries)?;
        // normalize the soft-delete invariants before validating, so a
        // hand-edited file cannot wedge every later write
        for cfg in entries.values_mut() {
            if cfg.deleted {
                cfg.active = false;
                if cfg.deleted_at.is_none() {
                    cfg.deleted_at = Some(chrono::Utc::now().to_rfc3339());
                }
            }
        }
        Self::validate(&entries)?;
        self.write_atomic(&entries)?;

        let mut state = self.state.write().expect("config store lock");
        state.snapshot = Arc::new(Self::snapshot_from(entries));
        state.signature = file_signature(&self.path);
        state.loaded = true;
        Ok(())
    }

    fn validate(entries: &HashMap<String, UpstreamConfig>) -> Result<()> {
        let mut active_count = 0usize;
        for (name, cfg) in entries {
            if cfg.base_url.trim().is_empty() {
                bail!("config '{name}': base_url is required");
            }
            if !cfg.auth_token.trim().is_empty()
                && cfg.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
            {
                bail!("config '{name}': auth_token and api_key are mutually exclusive");
            }
            if cfg.deleted {
                if cfg.active {
                    bail!("config '{name}': deleted config cannot be active");
                }
                if cfg.deleted_at.is_none() {
                    bail!("config '{name}': deleted config must carry deleted_at");
                }
            } else if cfg.active {
                active_count += 1;
            }
        }
        if active_count > 1 {
            bail!("at most one config may be active per service");
        }
        Ok(())
    }

    fn write_atomic(&self, entries: &HashMap<String, UpstreamConfig>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    /// Mark `name` active and deactivate every other non-deleted config.
    pub fn set_active(&self, name: &str) -> Result<()> {
        self.update(|entries| {
            let Some(target) = entries.get(name) else {
                bail!("config '{name}' does not exist");
            };
            if target.deleted {
                bail!("config '{name}' is deleted");
            }
            for (n, cfg) in entries.iter_mut() {
                cfg.active = n == name && !cfg.deleted;
            }
            Ok(())
        })
    }

    pub fn upsert(&self, cfg: UpstreamConfig) -> Result<()> {
        self.update(|entries| {
            let name = cfg.name.clone();
            if name.trim().is_empty() {
                bail!("config name is required");
            }
            entries.insert(name, cfg);
            Ok(())
        })
    }

    /// Soft delete: the entry stays in the file for audit but never routes.
    pub fn soft_delete(&self, name: &str) -> Result<()> {
        self.update(|entries| {
            let Some(cfg) = entries.get_mut(name) else {
                bail!("config '{name}' does not exist");
            };
            cfg.deleted = true;
            cfg.active = false;
            cfg.deleted_at = Some(chrono::Utc::now().to_rfc3339());
            Ok(())
        })
    }
}

/// Best-effort load of an arbitrary JSON config file, logging instead of
/// failing; used by the filters which degrade to disabled on bad input.
pub fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read_to_string(path).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(err) => {
            warn!("failed to parse {}: {err}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> ConfigStore {
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        ConfigStore::new("claude", &paths)
    }

    fn upstream(name: &str, weight: u32, active: bool) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            base_url: "https://api.example/".to_string(),
            auth_token: "tok".to_string(),
            api_key: None,
            weight,
            active,
            deleted: false,
            deleted_at: None,
        }
    }

    #[test]
    fn missing_file_is_empty_snapshot() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let snap = store.get().unwrap();
        assert!(snap.is_empty());
        assert_eq!(snap.active, None);
    }

    #[test]
    fn upsert_and_reload_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.upsert(upstream("prod", 100, true)).unwrap();
        let snap = store.get().unwrap();
        assert_eq!(snap.active.as_deref(), Some("prod"));
        assert_eq!(snap.configs["prod"].weight, 100);
    }

    #[test]
    fn reload_happens_when_file_changes_externally() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.upsert(upstream("a", 1, true)).unwrap();
        assert_eq!(store.get().unwrap().configs.len(), 1);

        // simulate another process rewriting the file
        let path = ClpPaths::new(dir.path()).service_config("claude");
        let raw = std::fs::read_to_string(&path).unwrap();
        let mut v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        v["b"] = serde_json::json!({"base_url": "https://b.example/", "auth_token": "t"});
        std::fs::write(&path, serde_json::to_string(&v).unwrap()).unwrap();

        assert_eq!(store.get().unwrap().configs.len(), 2);
    }

    #[test]
    fn rejects_two_active_configs() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.upsert(upstream("a", 1, true)).unwrap();
        let err = store.upsert(upstream("b", 1, true)).unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn rejects_both_credentials() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let mut cfg = upstream("dual", 0, false);
        cfg.api_key = Some("key".to_string());
        let err = store.upsert(cfg).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn api_key_wins_when_file_carries_both() {
        let mut cfg = upstream("dual", 0, false);
        cfg.api_key = Some("key".to_string());
        assert_eq!(cfg.credential(), Some(Credential::ApiKey("key".to_string())));
    }

    #[test]
    fn soft_delete_removes_from_routing_but_keeps_entry() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.upsert(upstream("a", 1, true)).unwrap();
        store.soft_delete("a").unwrap();
        let snap = store.get().unwrap();
        assert!(snap.configs.is_empty());

        let path = ClpPaths::new(dir.path()).service_config("claude");
        let raw = std::fs::read_to_string(path).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["a"]["deleted"], serde_json::json!(true));
        assert!(v["a"]["deleted_at"].is_string());
    }

    #[test]
    fn active_config_falls_back_to_smallest_name() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.upsert(upstream("zeta", 1, false)).unwrap();
        store.upsert(upstream("alpha", 1, false)).unwrap();
        let snap = store.get().unwrap();
        assert_eq!(snap.active, None);
        assert_eq!(snap.active_config().unwrap().name, "alpha");
    }
}
