use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::http::HeaderMap;
use serde::Deserialize;

use crate::config::{ClpPaths, FileSignature, file_signature, read_json_file};

#[derive(Debug, Deserialize)]
struct HeaderFilterFile {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    blocked_headers: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Default)]
struct Compiled {
    enabled: bool,
    blocked: HashSet<String>,
}

struct FilterState {
    compiled: Arc<Compiled>,
    signature: FileSignature,
    loaded: bool,
}

/// Header stripper: removes every header named in `blocked_headers`,
/// case-insensitively. Only ever applied to request headers.
pub struct HeaderFilter {
    path: PathBuf,
    state: RwLock<FilterState>,
}

impl HeaderFilter {
    pub fn new(paths: &ClpPaths) -> Self {
        Self {
            path: paths.header_filter(),
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
            let state = self.state.read().expect("header filter lock");
            if state.loaded && state.signature == sig {
                return state.compiled.clone();
            }
        }
        let compiled = Arc::new(self.load());
        let mut state = self.state.write().expect("header filter lock");
        state.compiled = compiled.clone();
        state.signature = sig;
        state.loaded = true;
        compiled
    }

    fn load(&self) -> Compiled {
        let Some(file) = read_json_file::<HeaderFilterFile>(&self.path) else {
            return Compiled::default();
        };
        Compiled {
            enabled: file.enabled,
            blocked: file
                .blocked_headers
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn apply(&self, headers: &HeaderMap) -> HeaderMap {
        let compiled = self.current();
        if !compiled.enabled || compiled.blocked.is_empty() {
            return headers.clone();
        }
        let mut out = HeaderMap::new();
        for (name, value) in headers.iter() {
            // HeaderName is already lowercase in the http crate
            if compiled.blocked.contains(name.as_str()) {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn filter_with(dir: &tempfile::TempDir, json: serde_json::Value) -> HeaderFilter {
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.header_filter(), json.to_string()).unwrap();
        HeaderFilter::new(&paths)
    }

    #[test]
    fn removal_is_case_insensitive_both_ways() {
        let dir = tempdir().unwrap();
        // blocklist in mixed case strips the lowercase wire header
        let filter = filter_with(
            &dir,
            serde_json::json!({"enabled": true, "blocked_headers": ["X-Forwarded-For"]}),
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let out = filter.apply(&headers);
        assert!(out.get("x-forwarded-for").is_none());
        assert_eq!(out.get("accept").unwrap(), "*/*");

        // and a lowercase blocklist entry matches however the client cased it
        // (header names normalize to lowercase on the wire)
        let filter2 = filter_with(
            &dir,
            serde_json::json!({"enabled": true, "blocked_headers": ["x-real-ip"]}),
        );
        let mut headers2 = HeaderMap::new();
        headers2.insert("X-Real-IP", HeaderValue::from_static("9.9.9.9"));
        assert!(filter2.apply(&headers2).get("x-real-ip").is_none());
    }

    #[test]
    fn disabled_filter_returns_input_unchanged() {
        let dir = tempdir().unwrap();
        let filter = filter_with(
            &dir,
            serde_json::json!({"enabled": false, "blocked_headers": ["accept"]}),
        );
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let out = filter.apply(&headers);
        assert_eq!(out.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn missing_config_blocks_nothing() {
        let dir = tempdir().unwrap();
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let filter = HeaderFilter::new(&paths);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        assert!(filter.apply(&headers).get("x-forwarded-for").is_some());
    }
}
