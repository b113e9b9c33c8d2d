use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tracing::warn;

use crate::config::{ClpPaths, FileSignature, file_signature, read_json_file};

/// One rewrite rule from `~/.clp/filter.json`. Rules apply in file order to
/// the request body decoded as UTF-8.
#[derive(Debug, Clone, Deserialize)]
pub struct BodyRule {
    pub source: String,
    pub op: BodyOp,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyOp {
    Replace,
    Remove,
}

#[derive(Default)]
struct Compiled {
    /// (source, replacement) pairs; `remove` is a replace with "".
    rules: Vec<(String, String)>,
}

struct FilterState {
    compiled: Arc<Compiled>,
    signature: FileSignature,
    loaded: bool,
}

/// Body rewriter. Non-UTF-8 bodies bypass the filter untouched; the engine
/// recomputes content-length afterwards.
pub struct BodyFilter {
    path: PathBuf,
    state: RwLock<FilterState>,
}

impl BodyFilter {
    pub fn new(paths: &ClpPaths) -> Self {
        Self {
            path: paths.body_filter(),
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
            let state = self.state.read().expect("body filter lock");
            if state.loaded && state.signature == sig {
                return state.compiled.clone();
            }
        }
        let compiled = Arc::new(self.load());
        let mut state = self.state.write().expect("body filter lock");
        state.compiled = compiled.clone();
        state.signature = sig;
        state.loaded = true;
        compiled
    }

    fn load(&self) -> Compiled {
        let Some(rules) = read_json_file::<Vec<BodyRule>>(&self.path) else {
            return Compiled::default();
        };
        let mut compiled = Vec::new();
        for rule in rules {
            if rule.source.is_empty() {
                continue;
            }
            let replacement = match rule.op {
                BodyOp::Remove => String::new(),
                BodyOp::Replace => match rule.target {
                    Some(t) => t,
                    None => {
                        warn!("body rule for {:?}: replace without target, rejected", rule.source);
                        continue;
                    }
                },
            };
            compiled.push((rule.source, replacement));
        }
        Compiled { rules: compiled }
    }

    pub fn apply(&self, body: &[u8]) -> Vec<u8> {
        let compiled = self.current();
        if compiled.rules.is_empty() || body.is_empty() {
            return body.to_vec();
        }
        let Ok(text) = std::str::from_utf8(body) else {
            return body.to_vec();
        };
        let mut text = text.to_string();
        for (source, replacement) in &compiled.rules {
            if text.contains(source.as_str()) {
                text = text.replace(source.as_str(), replacement);
            }
        }
        text.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn filter_with(dir: &tempfile::TempDir, json: serde_json::Value) -> BodyFilter {
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.body_filter(), json.to_string()).unwrap();
        BodyFilter::new(&paths)
    }

    #[test]
    fn replace_substitutes_all_occurrences() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!([{"source": "sk-live-ABC", "op": "replace", "target": "[REDACTED]"}]),
        );
        let out = filter.apply(br#"{"a":"sk-live-ABC","b":"sk-live-ABC"}"#);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"{"a":"[REDACTED]","b":"[REDACTED]"}"#
        );
    }

    #[test]
    fn remove_equals_replace_with_empty() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!([{"source": " secret", "op": "remove"}]),
        );
        let out = filter.apply(b"keep secret here");
        assert_eq!(String::from_utf8(out).unwrap(), "keep here");
    }

    #[test]
    fn rules_apply_in_order() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!([
                {"source": "aaa", "op": "replace", "target": "bbb"},
                {"source": "bbb", "op": "replace", "target": "ccc"}
            ]),
        );
        assert_eq!(filter.apply(b"aaa"), b"ccc".to_vec());
    }

    #[test]
    fn applying_twice_equals_once_when_output_has_no_source() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!([{"source": "token", "op": "replace", "target": "[T]"}]),
        );
        let once = filter.apply(b"my token and token");
        let twice = filter.apply(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn non_utf8_body_bypasses_filter() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!([{"source": "x", "op": "remove"}]),
        );
        let body = vec![0xff, 0xfe, b'x', 0xfd];
        assert_eq!(filter.apply(&body), body);
    }

    #[test]
    fn replace_without_target_is_rejected_at_load() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!([
                {"source": "gone", "op": "replace"},
                {"source": "kept", "op": "remove"}
            ]),
        );
        // the malformed rule is dropped, the valid one still applies
        assert_eq!(filter.apply(b"gone kept"), b"gone ".to_vec());
    }
}
