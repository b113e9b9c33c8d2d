use std::time::Instant;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::debug;

use crate::reqlog::{RequestRecord, encode_body_for_log};
use crate::usage::UsageParser;

use super::{ProxyService, filter_response_headers, now_iso};

/// Cap on the response copy kept for the request log.
const MAX_RECORD_RESPONSE_BYTES: usize = 1024 * 1024;

/// Everything the finalizer needs to close out the exchange once the
/// stream ends, fails, or the client walks away.
pub(super) struct StreamMeta {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub started_at: Instant,
    pub original_headers: std::collections::HashMap<String, String>,
    pub target_headers: std::collections::HashMap<String, String>,
    pub original_body: Bytes,
    pub filtered_body: Bytes,
    pub target_url: String,
    pub config_name: String,
}

enum StreamOutcome {
    UpstreamDone,
    UpstreamError { message: String, timeout: bool },
    ClientCancelled,
}

/// Owns the per-stream bookkeeping. Exactly one terminal transition runs:
/// explicitly on upstream end/error, or via Drop when the client
/// disconnects mid-stream and the body future is cancelled.
struct StreamFinalizer {
    proxy: ProxyService,
    meta: StreamMeta,
    status: StatusCode,
    parser: UsageParser,
    collected: Vec<u8>,
    truncated: bool,
    total_bytes: u64,
    first_chunk: bool,
    completed: bool,
}

impl StreamFinalizer {
    fn on_chunk(&mut self, chunk: &[u8]) {
        let duration = self.meta.started_at.elapsed().as_millis() as u64;
        if self.first_chunk {
            self.first_chunk = false;
            self.proxy
                .hub
                .request_streaming(&self.meta.request_id, duration);
        }
        self.total_bytes += chunk.len() as u64;
        self.parser.feed(chunk);

        if self.collected.len() < MAX_RECORD_RESPONSE_BYTES {
            let room = MAX_RECORD_RESPONSE_BYTES - self.collected.len();
            self.collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if chunk.len() > room {
                self.truncated = true;
            }
        } else {
            self.truncated = true;
        }

        let text = String::from_utf8_lossy(chunk);
        self.proxy
            .hub
            .response_chunk(&self.meta.request_id, &text, duration);
    }

    fn complete(&mut self, outcome: StreamOutcome) {
        if self.completed {
            return;
        }
        self.completed = true;

        let duration = self.meta.started_at.elapsed().as_millis() as u64;
        let usage = self.parser.finish();

        let (status_for_log, success, reason) = match &outcome {
            StreamOutcome::UpstreamDone => (self.status.as_u16(), true, None),
            StreamOutcome::UpstreamError { timeout, .. } => {
                // a broken stream counts against the config like any failure
                self.proxy.lb.on_failure(&self.meta.config_name);
                (if *timeout { 504 } else { 502 }, false, None)
            }
            // the upstream was not at fault; leave its health alone
            StreamOutcome::ClientCancelled => (499, false, Some("client_cancelled")),
        };

        if let StreamOutcome::UpstreamError { message, .. } = &outcome {
            debug!(
                "{}: stream from {} broke: {message}",
                self.proxy.service.name(),
                self.meta.config_name
            );
        }

        self.proxy.hub.request_completed(
            &self.meta.request_id,
            status_for_log,
            duration,
            success,
            reason,
        );

        let original_body_b64 = if self.meta.original_body.is_empty() {
            None
        } else {
            Some(encode_body_for_log(&self.meta.original_body).0)
        };
        let filtered_body_b64 = if self.meta.filtered_body.is_empty() {
            None
        } else {
            Some(encode_body_for_log(&self.meta.filtered_body).0)
        };
        let response_content_b64 = if self.collected.is_empty() {
            None
        } else {
            Some(encode_body_for_log(&self.collected).0)
        };

        let record = RequestRecord {
            id: self.meta.request_id.clone(),
            service: self.proxy.service.name().to_string(),
            timestamp: now_iso(),
            client_method: self.meta.method.clone(),
            client_path: self.meta.path.clone(),
            original_headers: std::mem::take(&mut self.meta.original_headers),
            target_headers: std::mem::take(&mut self.meta.target_headers),
            original_body_b64,
            filtered_body_b64,
            target_url: Some(self.meta.target_url.clone()),
            config_name: Some(self.meta.config_name.clone()),
            channel: Some(self.meta.config_name.clone()),
            status_code: status_for_log,
            response_content_b64,
            response_truncated: self.truncated,
            response_bytes: Some(self.total_bytes),
            duration_ms: duration,
            blocked: false,
            blocked_by: None,
            blocked_reason: None,
            usage,
        };
        super::append_record(&self.proxy.reqlog, record);
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        if !self.completed {
            self.complete(StreamOutcome::ClientCancelled);
        }
    }
}

/// Phase 5: forward the upstream response unbuffered. Every chunk goes to
/// the client socket, the usage parser, the capped record buffer and the
/// realtime hub at once.
pub(super) fn forward_streaming(
    proxy: &ProxyService,
    upstream: reqwest::Response,
    status: StatusCode,
    meta: StreamMeta,
) -> Response<Body> {
    // reqwest and axum share the http crate, so the header map passes through
    let resp_headers = filter_response_headers(upstream.headers());
    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let mut finalizer = StreamFinalizer {
        proxy: proxy.clone(),
        meta,
        status,
        parser: UsageParser::new(proxy.service, content_type.as_deref()),
        collected: Vec::new(),
        truncated: false,
        total_bytes: 0,
        first_chunk: true,
        completed: false,
    };

    let body_stream = async_stream::stream! {
        let mut upstream_stream = upstream.bytes_stream();
        loop {
            match upstream_stream.next().await {
                Some(Ok(chunk)) => {
                    finalizer.on_chunk(&chunk);
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
                Some(Err(err)) => {
                    finalizer.complete(StreamOutcome::UpstreamError {
                        message: err.to_string(),
                        timeout: err.is_timeout(),
                    });
                    yield Err(std::io::Error::other(err.to_string()));
                    return;
                }
                None => {
                    finalizer.complete(StreamOutcome::UpstreamDone);
                    return;
                }
            }
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_default()
}
