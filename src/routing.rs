use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::{ClpPaths, FileSignature, file_signature, read_json_file};

/// Routing mode selected in `data/model_router_config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    #[default]
    Default,
    ModelMapping,
    ConfigMapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    #[serde(default)]
    pub source: String,
    /// "model" rewrites by request model, "config" rewrites by the config
    /// name the request is about to use.
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default)]
    pub target: String,
}

fn default_source_type() -> String {
    "model".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMapping {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub config: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default, rename = "modelMappings")]
    pub model_mappings: HashMap<String, Vec<ModelMapping>>,
    #[serde(default, rename = "configMappings")]
    pub config_mappings: HashMap<String, Vec<ConfigMapping>>,
}

/// Outcome of routing one request.
#[derive(Debug, Default, PartialEq)]
pub struct RoutingOutcome {
    /// Body with the model rewritten, when a model-mapping rule matched.
    pub body: Option<Vec<u8>>,
    /// Config the request must use, when a config-mapping rule matched.
    pub forced_config: Option<String>,
}

struct RoutingState {
    config: Arc<RoutingConfig>,
    signature: FileSignature,
    loaded: bool,
}

/// Hot-reloaded routing rules; checked by file signature on every access.
pub struct RoutingStore {
    path: PathBuf,
    state: RwLock<RoutingState>,
}

impl RoutingStore {
    pub fn new(paths: &ClpPaths) -> Self {
        Self {
            path: paths.routing_config(),
            state: RwLock::new(RoutingState {
                config: Arc::new(RoutingConfig::default()),
                signature: FileSignature(0, 0),
                loaded: false,
            }),
        }
    }

    pub fn get(&self) -> Arc<RoutingConfig> {
        let current = file_signature(&self.path);
        {
            let state = self.state.read().expect("routing store lock");
            if state.loaded && state.signature == current {
                return state.config.clone();
            }
        }
        let config: Arc<RoutingConfig> =
            Arc::new(read_json_file(&self.path).unwrap_or_default());
        let mut state = self.state.write().expect("routing store lock");
        state.config = config.clone();
        state.signature = current;
        state.loaded = true;
        config
    }

    /// Apply the routing rules to one request. Rules are scanned in list
    /// order and the first match wins. A non-JSON body or a body without a
    /// `model` field routes unchanged.
    ///
    /// `candidate_config` is the config the load balancer would pick; the
    /// `source_type = "config"` model mappings key off it.
    pub fn apply(
        &self,
        service: &str,
        body: &[u8],
        candidate_config: Option<&str>,
        config_exists: impl Fn(&str) -> bool,
    ) -> RoutingOutcome {
        let config = self.get();
        if config.mode == RoutingMode::Default || body.is_empty() {
            return RoutingOutcome::default();
        }

        let Ok(mut json) = serde_json::from_slice::<JsonValue>(body) else {
            return RoutingOutcome::default();
        };
        let Some(model) = json.get("model").and_then(|m| m.as_str()).map(String::from) else {
            return RoutingOutcome::default();
        };

        match config.mode {
            RoutingMode::Default => RoutingOutcome::default(),
            RoutingMode::ModelMapping => {
                let rules = config
                    .model_mappings
                    .get(service)
                    .map(|v| v.as_slice())
                    .unwrap_or_default();
                for rule in rules {
                    let source = rule.source.trim();
                    let target = rule.target.trim();
                    if source.is_empty() || target.is_empty() {
                        continue;
                    }
                    let hit = match rule.source_type.trim() {
                        "config" => candidate_config == Some(source),
                        _ => model == source,
                    };
                    if !hit {
                        continue;
                    }
                    if let Some(obj) = json.as_object_mut() {
                        obj.insert("model".to_string(), JsonValue::String(target.to_string()));
                    }
                    let body = serde_json::to_vec(&json).ok();
                    return RoutingOutcome {
                        body,
                        forced_config: None,
                    };
                }
                RoutingOutcome::default()
            }
            RoutingMode::ConfigMapping => {
                let rules = config
                    .config_mappings
                    .get(service)
                    .map(|v| v.as_slice())
                    .unwrap_or_default();
                for rule in rules {
                    let mapped_model = rule.model.trim();
                    let target_config = rule.config.trim();
                    if mapped_model.is_empty() || target_config.is_empty() {
                        continue;
                    }
                    if model != mapped_model {
                        continue;
                    }
                    if !config_exists(target_config) {
                        tracing::warn!(
                            "config-mapping target '{target_config}' does not exist, skipping rule"
                        );
                        continue;
                    }
                    return RoutingOutcome {
                        body: None,
                        forced_config: Some(target_config.to_string()),
                    };
                }
                RoutingOutcome::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn write_routing(dir: &tempfile::TempDir, json: serde_json::Value) -> RoutingStore {
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.routing_config(), json.to_string()).unwrap();
        RoutingStore::new(&paths)
    }

    #[test]
    fn default_mode_is_a_noop() {
        let dir = tempdir().unwrap();
        let store = write_routing(&dir, serde_json::json!({"mode": "default"}));
        let out = store.apply("claude", br#"{"model":"m"}"#, None, |_| true);
        assert_eq!(out, RoutingOutcome::default());
    }

    #[test]
    fn model_mapping_first_match_wins() {
        let dir = tempdir().unwrap();
        let store = write_routing(
            &dir,
            serde_json::json!({
                "mode": "model-mapping",
                "modelMappings": {"claude": [
                    {"source": "haiku", "source_type": "model", "target": "sonnet"},
                    {"source": "haiku", "source_type": "model", "target": "opus"}
                ]}
            }),
        );
        let out = store.apply("claude", br#"{"model":"haiku"}"#, None, |_| true);
        let body: serde_json::Value = serde_json::from_slice(&out.body.unwrap()).unwrap();
        assert_eq!(body["model"], "sonnet");
        assert_eq!(out.forced_config, None);
    }

    #[test]
    fn config_source_type_matches_candidate_config() {
        let dir = tempdir().unwrap();
        let store = write_routing(
            &dir,
            serde_json::json!({
                "mode": "model-mapping",
                "modelMappings": {"codex": [
                    {"source": "cheap", "source_type": "config", "target": "gpt-5-mini"}
                ]}
            }),
        );
        let out = store.apply("codex", br#"{"model":"gpt-5"}"#, Some("cheap"), |_| true);
        let body: serde_json::Value = serde_json::from_slice(&out.body.unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-5-mini");

        let miss = store.apply("codex", br#"{"model":"gpt-5"}"#, Some("other"), |_| true);
        assert_eq!(miss, RoutingOutcome::default());
    }

    #[test]
    fn config_mapping_forces_config_without_touching_body() {
        let dir = tempdir().unwrap();
        let store = write_routing(
            &dir,
            serde_json::json!({
                "mode": "config-mapping",
                "configMappings": {"claude": [
                    {"model": "claude-opus-4", "config": "premium"}
                ]}
            }),
        );
        let out = store.apply("claude", br#"{"model":"claude-opus-4"}"#, None, |_| true);
        assert_eq!(out.body, None);
        assert_eq!(out.forced_config.as_deref(), Some("premium"));
    }

    #[test]
    fn config_mapping_skips_missing_target_config() {
        let dir = tempdir().unwrap();
        let store = write_routing(
            &dir,
            serde_json::json!({
                "mode": "config-mapping",
                "configMappings": {"claude": [
                    {"model": "m", "config": "ghost"},
                    {"model": "m", "config": "real"}
                ]}
            }),
        );
        let out = store.apply("claude", br#"{"model":"m"}"#, None, |c| c == "real");
        assert_eq!(out.forced_config.as_deref(), Some("real"));
    }

    #[test]
    fn non_json_body_routes_unchanged() {
        let dir = tempdir().unwrap();
        let store = write_routing(&dir, serde_json::json!({"mode": "model-mapping"}));
        let out = store.apply("claude", b"not json", None, |_| true);
        assert_eq!(out, RoutingOutcome::default());
    }
}
