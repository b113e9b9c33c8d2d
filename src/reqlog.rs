use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ClpPaths;
use crate::usage::UsageTotals;

pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// Logged bodies are capped at 1 MB; anything longer is cut and marked.
const MAX_LOGGED_BODY_BYTES: usize = 1024 * 1024;
const TRUNCATION_SENTINEL: &[u8] = b"...[truncated]";

/// One proxied exchange as it lands in `data/proxy_requests_{service}.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub service: String,
    pub timestamp: String,
    pub client_method: String,
    pub client_path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub original_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub target_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_body_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_body_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_content_b64: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub response_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<u64>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub usage: UsageTotals,
}

/// Cap a body for logging and base64-encode it. Returns the encoded body
/// and whether it was cut.
pub fn encode_body_for_log(body: &[u8]) -> (String, bool) {
    if body.len() <= MAX_LOGGED_BODY_BYTES {
        return (BASE64.encode(body), false);
    }
    let mut cut = body[..MAX_LOGGED_BODY_BYTES].to_vec();
    cut.extend_from_slice(TRUNCATION_SENTINEL);
    (BASE64.encode(cut), true)
}

struct LogInner {
    ring: VecDeque<RequestRecord>,
    file_lines: usize,
    loaded: bool,
}

/// Append-only request log: a bounded in-memory ring mirrored to a JSONL
/// file. Appends take an OS exclusive lock so multiple proxy processes can
/// share a log directory; the file is lazily rewritten from the ring once
/// it grows past twice the ring capacity.
pub struct RequestLog {
    path: PathBuf,
    capacity: usize,
    inner: Mutex<LogInner>,
}

impl RequestLog {
    pub fn new(service: &'static str, paths: &ClpPaths) -> Self {
        Self::with_capacity(service, paths, DEFAULT_MAX_RECORDS)
    }

    pub fn with_capacity(service: &'static str, paths: &ClpPaths, capacity: usize) -> Self {
        Self {
            path: paths.request_log(service),
            capacity: capacity.max(1),
            inner: Mutex::new(LogInner {
                ring: VecDeque::new(),
                file_lines: 0,
                loaded: false,
            }),
        }
    }

    fn ensure_loaded_locked(&self, inner: &mut LogInner) {
        if inner.loaded {
            return;
        }
        inner.loaded = true;
        let Ok(file) = fs::File::open(&self.path) else {
            return;
        };
        let reader = BufReader::new(file);
        let mut lines = 0usize;
        for line in reader.lines() {
            let Ok(line) = line else { break };
            lines += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RequestRecord>(line) {
                Ok(record) => {
                    if inner.ring.len() == self.capacity {
                        inner.ring.pop_front();
                    }
                    inner.ring.push_back(record);
                }
                Err(_) => continue,
            }
        }
        inner.file_lines = lines;
    }

    /// Append one record: into the ring (evicting the oldest past capacity)
    /// and as one JSON line on disk under an exclusive file lock.
    pub fn append(&self, record: RequestRecord) {
        let mut inner = self.inner.lock().expect("request log lock");
        self.ensure_loaded_locked(&mut inner);

        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record.clone());

        let Ok(line) = serde_json::to_string(&record) else {
            warn!("request record not serializable, skipping disk write");
            return;
        };

        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        if inner.file_lines + 1 > self.capacity * 2 {
            self.rewrite_from_ring_locked(&mut inner);
            return;
        }

        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => {
                if let Err(err) = file.lock_exclusive() {
                    warn!("request log lock failed: {err}");
                }
                let write_result = writeln!(file, "{line}");
                let _ = fs2::FileExt::unlock(&file);
                match write_result {
                    Ok(()) => inner.file_lines += 1,
                    Err(err) => warn!("request log append failed: {err}"),
                }
            }
            Err(err) => warn!("request log open failed: {err}"),
        }
    }

    fn rewrite_from_ring_locked(&self, inner: &mut LogInner) {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                if let Err(err) = file.lock_exclusive() {
                    warn!("request log lock failed: {err}");
                }
                let mut written = 0usize;
                for record in &inner.ring {
                    if let Ok(line) = serde_json::to_string(record) {
                        if writeln!(file, "{line}").is_ok() {
                            written += 1;
                        }
                    }
                }
                let _ = fs2::FileExt::unlock(&file);
                inner.file_lines = written;
            }
            Err(err) => warn!("request log rewrite failed: {err}"),
        }
    }

    /// Most recent records first, up to `limit`.
    pub fn list(&self, limit: usize) -> Vec<RequestRecord> {
        let mut inner = self.inner.lock().expect("request log lock");
        self.ensure_loaded_locked(&mut inner);
        inner.ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<RequestRecord> {
        let mut inner = self.inner.lock().expect("request log lock");
        self.ensure_loaded_locked(&mut inner);
        inner.ring.iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().expect("request log lock");
        self.ensure_loaded_locked(&mut inner);
        inner.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn record(id: &str) -> RequestRecord {
        RequestRecord {
            id: id.to_string(),
            service: "claude".to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            client_method: "POST".to_string(),
            client_path: "/v1/messages".to_string(),
            original_headers: HashMap::new(),
            target_headers: HashMap::new(),
            original_body_b64: None,
            filtered_body_b64: None,
            target_url: None,
            config_name: Some("prod".to_string()),
            channel: Some("prod".to_string()),
            status_code: 200,
            response_content_b64: None,
            response_truncated: false,
            response_bytes: None,
            duration_ms: 5,
            blocked: false,
            blocked_by: None,
            blocked_reason: None,
            usage: UsageTotals::default(),
        }
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let dir = tempdir().unwrap();
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let log = RequestLog::with_capacity("claude", &paths, 3);
        for i in 0..5 {
            log.append(record(&format!("r{i}")));
        }
        assert_eq!(log.len(), 3);
        let recent = log.list(10);
        assert_eq!(recent[0].id, "r4");
        assert_eq!(recent[2].id, "r2");
        assert!(log.get("r0").is_none());
        assert!(log.get("r3").is_some());
    }

    #[test]
    fn file_is_rewritten_after_twice_capacity() {
        let dir = tempdir().unwrap();
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let log = RequestLog::with_capacity("claude", &paths, 3);
        for i in 0..10 {
            log.append(record(&format!("r{i}")));
        }
        let raw = std::fs::read_to_string(paths.request_log("claude")).unwrap();
        let lines = raw.lines().filter(|l| !l.trim().is_empty()).count();
        assert!(lines <= 6, "expected lazy truncation, got {lines} lines");
    }

    #[test]
    fn reload_picks_up_existing_file() {
        let dir = tempdir().unwrap();
        let paths = ClpPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        {
            let log = RequestLog::with_capacity("claude", &paths, 10);
            log.append(record("persisted"));
        }
        let log = RequestLog::with_capacity("claude", &paths, 10);
        assert_eq!(log.get("persisted").unwrap().status_code, 200);
    }

    #[test]
    fn oversized_body_is_truncated_with_sentinel() {
        let big = vec![b'a'; MAX_LOGGED_BODY_BYTES + 100];
        let (encoded, truncated) = encode_body_for_log(&big);
        assert!(truncated);
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded.len(), MAX_LOGGED_BODY_BYTES + TRUNCATION_SENTINEL.len());
        assert!(decoded.ends_with(TRUNCATION_SENTINEL));

        let (_, small_truncated) = encode_body_for_log(b"small");
        assert!(!small_truncated);
    }
}
