use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::config::{ClpPaths, FileSignature, file_signature, read_json_file};

/// One rule from `~/.clp/endpoint_filter.json`. Exactly one of
/// `path` / `prefix` / `regex` is honored, in that priority order.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointRule {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    /// Required query params; value "*" means presence is enough.
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub action: RuleAction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleAction {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_status() -> u16 {
    403
}

fn default_message() -> String {
    "Endpoint is blocked by proxy".to_string()
}

impl Default for RuleAction {
    fn default() -> Self {
        Self {
            status: default_status(),
            message: default_message(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct EndpointFilterFile {
    #[serde(default = "crate::filter::endpoint::default_enabled")]
    enabled: bool,
    #[serde(default)]
    rules: Vec<EndpointRule>,
}

pub(crate) fn default_enabled() -> bool {
    true
}

enum PathMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

struct CompiledRule {
    rule: EndpointRule,
    matcher: PathMatcher,
}

#[derive(Default)]
struct Compiled {
    enabled: bool,
    rules: Vec<CompiledRule>,
}

/// Result of a rule hit: the proxy answers with this instead of forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMatch {
    pub rule_id: Option<String>,
    pub status: u16,
    pub message: String,
}

struct FilterState {
    compiled: Arc<Compiled>,
    signature: FileSignature,
    loaded: bool,
}

/// Endpoint blocker: scans rules in list order, first match wins. Regexes
/// are compiled once per reload; a rule whose regex does not compile is
/// skipped with a warning. Broken JSON behaves as disabled.
pub struct EndpointFilter {
    path: PathBuf,
    state: RwLock<FilterState>,
}

impl EndpointFilter {
    pub fn new(paths: &ClpPaths) -> Self {
        Self {
            path: paths.endpoint_filter(),
            state: RwLock::new(FilterState {
                compiled: Arc::new(Compiled::default()),
                signature: FileSignature(0, 0),
                loaded: false,
            }),
        }
    }

    fn current(&self) -> Arc<Compiled> {
        let sig = file_signature(&self.path);
        {
            let state = self.state.read().expect("endpoint filter lock");
            if state.loaded && state.signature == sig {
                return state.compiled.clone();
            }
        }
        let compiled = Arc::new(self.compile());
        let mut state = self.state.write().expect("endpoint filter lock");
        state.compiled = compiled.clone();
        state.signature = sig;
        state.loaded = true;
        compiled
    }

    fn compile(&self) -> Compiled {
        if !self.path.exists() {
            return Compiled {
                enabled: true,
                rules: Vec::new(),
            };
        }
        let Some(file) = read_json_file::<EndpointFilterFile>(&self.path) else {
            // unreadable config degrades to disabled rather than failing requests
            warn!("endpoint filter config unreadable, treating as disabled");
            return Compiled::default();
        };
        let mut rules = Vec::new();
        for rule in file.rules {
            let matcher = if let Some(p) = rule.path.as_deref().filter(|s| !s.trim().is_empty()) {
                PathMatcher::Exact(p.trim().to_string())
            } else if let Some(p) = rule.prefix.as_deref().filter(|s| !s.trim().is_empty()) {
                PathMatcher::Prefix(p.trim().to_string())
            } else if let Some(p) = rule.regex.as_deref().filter(|s| !s.trim().is_empty()) {
                match Regex::new(p.trim()) {
                    Ok(re) => PathMatcher::Regex(re),
                    Err(err) => {
                        warn!(
                            "endpoint rule {:?}: invalid regex {p:?}, skipping: {err}",
                            rule.id
                        );
                        continue;
                    }
                }
            } else {
                continue;
            };
            rules.push(CompiledRule { rule, matcher });
        }
        Compiled {
            enabled: file.enabled,
            rules,
        }
    }

    /// Match one request against the rule list.
    pub fn evaluate(
        &self,
        service: &str,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
    ) -> Option<BlockMatch> {
        let compiled = self.current();
        if !compiled.enabled || compiled.rules.is_empty() {
            return None;
        }

        let service = service.trim().to_ascii_lowercase();
        let method = method.trim().to_ascii_uppercase();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        for entry in &compiled.rules {
            let rule = &entry.rule;
            if !rule.services.is_empty()
                && !rule
                    .services
                    .iter()
                    .any(|s| s.trim().eq_ignore_ascii_case(&service))
            {
                continue;
            }
            if !rule.methods.is_empty() {
                let allowed = rule
                    .methods
                    .iter()
                    .any(|m| m.trim() == "*" || m.trim().eq_ignore_ascii_case(&method));
                if !allowed {
                    continue;
                }
            }
            let path_hit = match &entry.matcher {
                PathMatcher::Exact(p) => path == *p,
                PathMatcher::Prefix(p) => path.starts_with(p.as_str()),
                PathMatcher::Regex(re) => re.is_match(&path),
            };
            if !path_hit {
                continue;
            }
            if !query_matches(&rule.query, query) {
                continue;
            }
            return Some(BlockMatch {
                rule_id: rule.id.clone(),
                status: rule.action.status,
                message: rule.action.message.clone(),
            });
        }
        None
    }
}

fn query_matches(required: &HashMap<String, String>, actual: &HashMap<String, String>) -> bool {
    for (key, value) in required {
        let Some(actual_value) = actual.get(key) else {
            return false;
        };
        if value == "*" {
            continue;
        }
        if actual_value != value {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn filter_with(dir: &tempfile::TempDir, json: serde_json::Value) -> EndpointFilter {
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.endpoint_filter(), json.to_string()).unwrap();
        EndpointFilter::new(&paths)
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn exact_path_with_query_value_match() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!({
                "enabled": true,
                "rules": [{
                    "id": "block-count-tokens",
                    "services": ["claude"],
                    "methods": ["GET", "POST"],
                    "path": "/v1/messages/count_tokens",
                    "query": {"beta": "true"},
                    "action": {"status": 403, "message": "disabled"}
                }]
            }),
        );

        let hit = filter
            .evaluate(
                "claude",
                "POST",
                "/v1/messages/count_tokens",
                &query(&[("beta", "true")]),
            )
            .unwrap();
        assert_eq!(hit.rule_id.as_deref(), Some("block-count-tokens"));
        assert_eq!(hit.status, 403);
        assert_eq!(hit.message, "disabled");

        // wrong query value, wrong service, missing query -> no match
        assert!(
            filter
                .evaluate("claude", "POST", "/v1/messages/count_tokens", &query(&[("beta", "false")]))
                .is_none()
        );
        assert!(
            filter
                .evaluate("codex", "POST", "/v1/messages/count_tokens", &query(&[("beta", "true")]))
                .is_none()
        );
        assert!(
            filter
                .evaluate("claude", "POST", "/v1/messages/count_tokens", &query(&[]))
                .is_none()
        );
    }

    #[test]
    fn wildcard_method_and_query_presence() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!({
                "enabled": true,
                "rules": [{
                    "methods": ["*"],
                    "prefix": "/internal/",
                    "query": {"debug": "*"}
                }]
            }),
        );
        assert!(
            filter
                .evaluate("claude", "DELETE", "/internal/x", &query(&[("debug", "anything")]))
                .is_some()
        );
        assert!(
            filter
                .evaluate("claude", "DELETE", "/internal/x", &query(&[]))
                .is_none()
        );
    }

    #[test]
    fn regex_rules_compile_once_and_bad_regex_is_skipped() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!({
                "enabled": true,
                "rules": [
                    {"regex": "([invalid", "action": {"status": 400, "message": "bad"}},
                    {"regex": "^/api/experimental/.*$", "action": {"status": 410, "message": "gone"}}
                ]
            }),
        );
        let hit = filter
            .evaluate("codex", "GET", "/api/experimental/foo", &query(&[]))
            .unwrap();
        assert_eq!(hit.status, 410);
    }

    #[test]
    fn disabled_filter_never_matches() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!({
                "enabled": false,
                "rules": [{"path": "/x"}]
            }),
        );
        assert!(filter.evaluate("claude", "GET", "/x", &query(&[])).is_none());
    }

    #[test]
    fn first_match_wins_in_list_order() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!({
                "enabled": true,
                "rules": [
                    {"prefix": "/v1/", "action": {"status": 451, "message": "first"}},
                    {"path": "/v1/messages", "action": {"status": 403, "message": "second"}}
                ]
            }),
        );
        let hit = filter
            .evaluate("claude", "POST", "/v1/messages", &query(&[]))
            .unwrap();
        assert_eq!(hit.message, "first");
    }

    #[test]
    fn broken_json_behaves_as_disabled() {
        let dir = tempdir().unwrap();
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.endpoint_filter(), "{not json").unwrap();
        let filter = EndpointFilter::new(&paths);
        assert!(filter.evaluate("claude", "GET", "/any", &query(&[])).is_none());
    }
}
