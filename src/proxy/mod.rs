use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Result, anyhow};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use axum::routing::{any, get};
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, warn};

mod stream;
#[cfg(test)]
mod tests;

use crate::auth::{AuthLayerState, AuthManager};
use crate::config::{ClpPaths, ConfigSnapshot, ConfigStore, Credential, UpstreamConfig};
use crate::filter::{BodyFilter, EndpointFilter, HeaderFilter};
use crate::hub::RealtimeHub;
use crate::lb::{LbMode, LoadBalancer, ResetOutcome};
use crate::reqlog::{RequestLog, RequestRecord, encode_body_for_log};
use crate::routing::RoutingStore;
use crate::service::ServiceKind;
use crate::usage::{UsageTotals, extract_usage_from_bytes};

use self::stream::{StreamMeta, forward_streaming};

/// Largest client request body the proxy will buffer for filtering.
const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Generic per-service proxy engine; one instance fronts one upstream API.
#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    pub service: ServiceKind,
    pub(crate) configs: Arc<ConfigStore>,
    pub(crate) routing: Arc<RoutingStore>,
    pub(crate) lb: Arc<LoadBalancer>,
    pub(crate) endpoint_filter: Arc<EndpointFilter>,
    pub(crate) header_filter: Arc<HeaderFilter>,
    pub(crate) body_filter: Arc<BodyFilter>,
    pub(crate) hub: Arc<RealtimeHub>,
    pub(crate) reqlog: Arc<RequestLog>,
    pub(crate) auth: Arc<AuthManager>,
    request_seq: Arc<AtomicU64>,
    salt: u32,
}

impl ProxyService {
    pub fn new(client: Client, service: ServiceKind, paths: &ClpPaths) -> Self {
        let name = service.name();
        Self {
            client,
            service,
            configs: Arc::new(ConfigStore::new(name, paths)),
            routing: Arc::new(RoutingStore::new(paths)),
            lb: Arc::new(LoadBalancer::new(name, paths)),
            endpoint_filter: Arc::new(EndpointFilter::new(paths)),
            header_filter: Arc::new(HeaderFilter::new(paths)),
            body_filter: Arc::new(BodyFilter::new(paths)),
            hub: Arc::new(RealtimeHub::new(name)),
            reqlog: Arc::new(RequestLog::new(name, paths)),
            auth: Arc::new(AuthManager::new(paths)),
            request_seq: Arc::new(AtomicU64::new(0)),
            salt: rand::random(),
        }
    }

    pub fn hub(&self) -> Arc<RealtimeHub> {
        self.hub.clone()
    }

    pub fn request_log(&self) -> Arc<RequestLog> {
        self.reqlog.clone()
    }

    pub fn config_store(&self) -> Arc<ConfigStore> {
        self.configs.clone()
    }

    pub fn auth_manager(&self) -> Arc<AuthManager> {
        self.auth.clone()
    }

    /// Monotonic within the process plus a per-process random salt, so ids
    /// from interleaved proxy processes never collide and event ordering is
    /// diagnosable at a glance.
    fn next_request_id(&self) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:08x}-{:06}", self.salt, seq)
    }

    fn build_target_url(&self, cfg: &UpstreamConfig, uri: &Uri) -> Result<reqwest::Url> {
        let base = cfg.base_url.trim_end_matches('/').to_string();
        let base_url = reqwest::Url::parse(&base)
            .map_err(|e| anyhow!("invalid upstream base_url {base}: {e}"))?;
        let base_path = base_url.path().trim_end_matches('/').to_string();

        let mut path = uri.path().to_string();
        if !base_path.is_empty()
            && base_path != "/"
            && (path == base_path || path.starts_with(&format!("{base_path}/")))
        {
            // the client already sent the base path; avoid double-prefixing
            let rest = &path[base_path.len()..];
            path = if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            };
            if !path.starts_with('/') {
                path = format!("/{path}");
            }
        }
        let path_and_query = if let Some(q) = uri.query() {
            format!("{path}?{q}")
        } else {
            path
        };
        let full = format!("{base}{path_and_query}");
        reqwest::Url::parse(&full).map_err(|e| anyhow!("invalid upstream url {full}: {e}"))
    }

    /// Copy the client headers, strip what must never reach the upstream,
    /// then attach the config's credential. Content-length is recomputed by
    /// the HTTP client from the filtered body.
    fn build_upstream_headers(&self, client_headers: &HeaderMap, cfg: &UpstreamConfig) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in self.header_filter.apply(client_headers).iter() {
            let lower = name.as_str();
            if lower == "authorization"
                || lower == "host"
                || lower == "content-length"
                || is_hop_by_hop_header(lower)
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        match cfg.credential() {
            Some(Credential::Bearer(token)) => {
                if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert("authorization", v);
                }
            }
            Some(Credential::ApiKey(key)) => {
                headers.remove("x-api-key");
                if let Ok(v) = HeaderValue::from_str(&key) {
                    headers.insert("x-api-key", v);
                }
            }
            None => {}
        }
        headers
    }
}

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let lower = name.as_str();
        // the body passes through verbatim (still encoded), so only the
        // framing headers go; content-encoding must survive
        if is_hop_by_hop_header(lower) || lower == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Success per the engine: 2xx plus the pass-through statuses 304 / 307.
pub(crate) fn is_success_status(status: StatusCode) -> bool {
    status.is_success() || matches!(status.as_u16(), 304 | 307)
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(query) = query else {
        return out;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => out.entry(k.to_string()).or_insert_with(|| v.to_string()),
            None => out.entry(pair.to_string()).or_insert_with(String::new),
        };
    }
    out
}

pub(crate) fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers.iter() {
        out.insert(
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }
    out
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Everything the engine knows about the request before candidate selection;
/// shared by the record-building paths.
struct RequestContext {
    request_id: String,
    method: Method,
    uri: Uri,
    client_headers: HeaderMap,
    original_body: Bytes,
    start: Instant,
}

impl RequestContext {
    fn record(&self, service: &str, status: u16) -> RequestRecord {
        let original_body_b64 = if self.original_body.is_empty() {
            None
        } else {
            Some(encode_body_for_log(&self.original_body).0)
        };
        RequestRecord {
            id: self.request_id.clone(),
            service: service.to_string(),
            timestamp: now_iso(),
            client_method: self.method.to_string(),
            client_path: self.uri.path().to_string(),
            original_headers: headers_to_map(&self.client_headers),
            target_headers: HashMap::new(),
            original_body_b64,
            filtered_body_b64: None,
            target_url: None,
            config_name: None,
            channel: None,
            status_code: status,
            response_content_b64: None,
            response_truncated: false,
            response_bytes: None,
            duration_ms: self.start.elapsed().as_millis() as u64,
            blocked: false,
            blocked_by: None,
            blocked_reason: None,
            usage: UsageTotals::default(),
        }
    }
}

fn append_record(reqlog: &Arc<RequestLog>, record: RequestRecord) {
    let reqlog = reqlog.clone();
    if tokio::runtime::Handle::try_current().is_ok() {
        tokio::task::spawn_blocking(move || reqlog.append(record));
    } else {
        reqlog.append(record);
    }
}

/// Outcome of one candidate attempt that did not finish the request.
struct AttemptFailure {
    /// Upstream status, when the failure was a non-success response.
    status: Option<StatusCode>,
    error: String,
}

enum Attempt {
    /// The request is answered; hand the response to the client.
    Done(Response<Body>),
    Failed(AttemptFailure),
}

/// The seven-phase request pipeline. Everything that leaves this function
/// has produced exactly one `request_started` and one terminal
/// `request_completed`/`failed` event, and one appended log record.
pub async fn handle_proxy(proxy: ProxyService, req: Request<Body>) -> Response<Body> {
    let start = Instant::now();
    let request_id = proxy.next_request_id();
    let service_name = proxy.service.name();

    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let client_headers = parts.headers;

    let original_body = match to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(b) => b,
        Err(err) => {
            proxy
                .hub
                .request_started(&request_id, method.as_str(), uri.path(), "unassigned", None, None);
            let duration = start.elapsed().as_millis() as u64;
            proxy.hub.request_completed(&request_id, 400, duration, false, None);
            let ctx = RequestContext {
                request_id: request_id.clone(),
                method: method.clone(),
                uri: uri.clone(),
                client_headers: client_headers.clone(),
                original_body: Bytes::new(),
                start,
            };
            append_record(&proxy.reqlog, ctx.record(service_name, 400));
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": "failed to read request body", "detail": err.to_string()}),
            );
        }
    };

    let ctx = RequestContext {
        request_id: request_id.clone(),
        method: method.clone(),
        uri: uri.clone(),
        client_headers: client_headers.clone(),
        original_body: original_body.clone(),
        start,
    };

    // Phase 1: endpoint blocker. A hit never reaches the upstream.
    let query_map = parse_query(uri.query());
    if let Some(block) =
        proxy
            .endpoint_filter
            .evaluate(service_name, method.as_str(), uri.path(), &query_map)
    {
        proxy
            .hub
            .request_started(&request_id, method.as_str(), uri.path(), "blocked", None, None);
        let status = StatusCode::from_u16(block.status).unwrap_or(StatusCode::FORBIDDEN);
        let duration = start.elapsed().as_millis() as u64;
        proxy
            .hub
            .request_completed(&request_id, status.as_u16(), duration, false, None);

        let mut record = ctx.record(service_name, status.as_u16());
        record.blocked = true;
        record.blocked_by = block.rule_id.clone();
        record.blocked_reason = Some(block.message.clone());
        record.channel = Some("blocked".to_string());
        append_record(&proxy.reqlog, record);

        return json_response(
            status,
            serde_json::json!({
                "error": "ENDPOINT_BLOCKED",
                "message": block.message,
                "rule_id": block.rule_id,
                "service": service_name,
            }),
        );
    }

    // Phase 2: parse & route.
    let snapshot = match proxy.configs.get() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!("{service_name}: config load failed: {err:#}");
            proxy
                .hub
                .request_started(&request_id, method.as_str(), uri.path(), "unassigned", None, None);
            let duration = start.elapsed().as_millis() as u64;
            proxy.hub.request_completed(&request_id, 500, duration, false, None);
            append_record(&proxy.reqlog, ctx.record(service_name, 500));
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": "config load failed", "service": service_name}),
            );
        }
    };

    if snapshot.is_empty() {
        proxy
            .hub
            .request_started(&request_id, method.as_str(), uri.path(), "unassigned", None, None);
        let duration = start.elapsed().as_millis() as u64;
        proxy.hub.request_completed(&request_id, 503, duration, false, None);
        append_record(&proxy.reqlog, ctx.record(service_name, 503));
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "error": "CONFIG_UNAVAILABLE",
                "message": format!("no upstream config for {service_name}; edit ~/.clp/{service_name}.json"),
                "service": service_name,
            }),
        );
    }

    let lb_mode = proxy.lb.mode();
    let preview_candidate = proxy.lb.pick(&snapshot).into_iter().next();
    let routed = proxy.routing.apply(
        service_name,
        &original_body,
        preview_candidate.as_deref(),
        |name| snapshot.configs.contains_key(name),
    );
    let routed_body: Bytes = routed
        .body
        .map(Bytes::from)
        .unwrap_or_else(|| original_body.clone());
    let forced_config = routed.forced_config;
    let request_model = proxy.service.extract_model(&routed_body);

    // Phase 4 prep: the body filter does not depend on the candidate.
    let filtered_body = Bytes::from(proxy.body_filter.apply(&routed_body));

    // Phase 3: candidate selection. A forced config bypasses the balancer's
    // choice; whether it may fail over is an LB option.
    let options = proxy.lb.options();
    let forced = forced_config.is_some();
    let retry_candidates = !forced || options.failover_on_forced_config;
    let mut candidates = match &forced_config {
        Some(name) => vec![name.clone()],
        None => proxy.lb.pick(&snapshot),
    };
    // active-first never retries across configs
    let retry_candidates = retry_candidates && lb_mode == LbMode::WeightBased;

    let mut started_sent = false;
    let mut previous: Option<String> = None;
    let mut last_status: Option<StatusCode> = None;
    let mut attempt: u32 = 0;
    let mut round = 1u8;

    loop {
        for name in candidates.clone() {
            attempt += 1;
            if let Some(prev) = previous.as_deref()
                && prev != name
            {
                let reason = if last_status.is_some() {
                    "http_non2xx"
                } else {
                    "request_error"
                };
                proxy.hub.lb_switch(
                    &request_id,
                    prev,
                    &name,
                    reason,
                    proxy.lb.failures_of(prev),
                    proxy.lb.threshold(),
                    attempt,
                    uri.path(),
                );
            }

            match try_candidate(
                &proxy,
                &ctx,
                &snapshot,
                &name,
                &filtered_body,
                request_model.as_deref(),
                &mut started_sent,
                retry_candidates,
            )
            .await
            {
                Attempt::Done(response) => return response,
                Attempt::Failed(failure) => {
                    debug!(
                        "{service_name}: candidate {name} failed (attempt {attempt}): {}",
                        failure.error
                    );
                    last_status = failure.status;
                    previous = Some(name);
                }
            }
        }

        // Round exhausted. One reset, one more round, then give up.
        if round >= 2 || !retry_candidates {
            break;
        }
        if forced {
            // forced-config failover: fall back into the balancer's own
            // candidate order instead of resetting anything
            let forced_name = forced_config.as_deref();
            candidates = proxy
                .lb
                .pick(&snapshot)
                .into_iter()
                .filter(|n| Some(n.as_str()) != forced_name)
                .collect();
            round = 2;
            if candidates.is_empty() {
                break;
            }
            continue;
        }
        match proxy.lb.maybe_reset() {
            ResetOutcome::Reset => {
                proxy.hub.lb_reset(
                    &request_id,
                    "last_candidate_failed",
                    snapshot.configs.len(),
                    proxy.lb.threshold(),
                );
                candidates = proxy.lb.all_candidates(&snapshot);
                // the reset wiped the failure history; switch accounting
                // starts over for the second round
                previous = None;
                round = 2;
                if candidates.is_empty() {
                    break;
                }
            }
            ResetOutcome::CoolingDown { .. } | ResetOutcome::Disabled => break,
        }
    }

    // Phase 6 tail: every candidate failed (or none existed).
    if !started_sent {
        proxy
            .hub
            .request_started(&request_id, method.as_str(), uri.path(), "unassigned", None, None);
    }
    proxy.hub.lb_exhausted(
        &request_id,
        "no_healthy_candidates",
        snapshot.configs.len(),
        proxy.lb.threshold(),
        options.reset_cooldown_seconds,
        proxy.lb.cooldown_remaining_seconds(),
    );
    let duration = start.elapsed().as_millis() as u64;
    proxy.hub.request_completed(&request_id, 503, duration, false, None);

    let mut record = ctx.record(service_name, 503);
    record.channel = previous.clone();
    append_record(&proxy.reqlog, record);

    json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        serde_json::json!({
            "error": "NO_HEALTHY_UPSTREAM",
            "message": "no healthy upstream: all candidates failed or are excluded",
            "service": service_name,
            "threshold": proxy.lb.threshold(),
            "auto_reset": options.auto_reset_on_all_failed,
            "reset_cooldown_seconds": options.reset_cooldown_seconds,
            "cooldown_remaining_seconds": proxy.lb.cooldown_remaining_seconds(),
        }),
    )
}

/// Phases 4–6 for one candidate: build the upstream request, open the
/// streamed exchange and classify the outcome.
#[allow(clippy::too_many_arguments)]
async fn try_candidate(
    proxy: &ProxyService,
    ctx: &RequestContext,
    snapshot: &ConfigSnapshot,
    name: &str,
    filtered_body: &Bytes,
    request_model: Option<&str>,
    started_sent: &mut bool,
    retrying: bool,
) -> Attempt {
    let service_name = proxy.service.name();
    let Some(cfg) = snapshot.configs.get(name) else {
        return Attempt::Failed(AttemptFailure {
            status: None,
            error: format!("config '{name}' disappeared from the snapshot"),
        });
    };

    let target_url = match proxy.build_target_url(cfg, &ctx.uri) {
        Ok(url) => url,
        Err(err) => {
            return Attempt::Failed(AttemptFailure {
                status: None,
                error: err.to_string(),
            });
        }
    };
    let upstream_headers = proxy.build_upstream_headers(&ctx.client_headers, cfg);

    if !*started_sent {
        proxy.hub.request_started(
            &ctx.request_id,
            ctx.method.as_str(),
            ctx.uri.path(),
            name,
            Some(target_url.as_str()),
            request_model,
        );
        *started_sent = true;
    }

    let response = match proxy
        .client
        .request(ctx.method.clone(), target_url.clone())
        .headers(upstream_headers.clone())
        .body(filtered_body.clone())
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            // connect errors and timeouts count against the config and are
            // retryable per the normal candidate loop
            proxy.lb.on_failure(name);
            return Attempt::Failed(AttemptFailure {
                status: None,
                error: err.to_string(),
            });
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    if is_success_status(status) {
        proxy.lb.on_success(name);
        let meta = StreamMeta {
            request_id: ctx.request_id.clone(),
            method: ctx.method.to_string(),
            path: ctx.uri.path().to_string(),
            started_at: ctx.start,
            original_headers: headers_to_map(&ctx.client_headers),
            target_headers: headers_to_map(&upstream_headers),
            original_body: ctx.original_body.clone(),
            filtered_body: filtered_body.clone(),
            target_url: target_url.to_string(),
            config_name: name.to_string(),
        };
        return Attempt::Done(forward_streaming(proxy, response, status, meta));
    }

    // Non-success upstream status.
    proxy.lb.on_failure(name);

    if retrying {
        // capture enough for diagnostics, then let the loop move on
        let body = response.bytes().await.unwrap_or_default();
        return Attempt::Failed(AttemptFailure {
            status: Some(status),
            error: format!(
                "upstream {name} returned {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body[..body.len().min(256)])
            ),
        });
    }

    // Active-first / forced config: the error is propagated verbatim.
    let resp_headers = filter_response_headers(response.headers());
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let body = response.bytes().await.unwrap_or_default();
    let duration = ctx.start.elapsed().as_millis() as u64;
    proxy
        .hub
        .request_completed(&ctx.request_id, status.as_u16(), duration, false, None);

    let mut record = ctx.record(service_name, status.as_u16());
    record.target_headers = headers_to_map(&upstream_headers);
    record.target_url = Some(target_url.to_string());
    record.config_name = Some(name.to_string());
    record.channel = Some(name.to_string());
    record.filtered_body_b64 = if filtered_body.is_empty() {
        None
    } else {
        Some(encode_body_for_log(filtered_body).0)
    };
    if !body.is_empty() {
        let (encoded, truncated) = encode_body_for_log(&body);
        record.response_content_b64 = Some(encoded);
        record.response_truncated = truncated;
        record.response_bytes = Some(body.len() as u64);
    }
    record.usage = extract_usage_from_bytes(proxy.service, content_type.as_deref(), &body);
    append_record(&proxy.reqlog, record);

    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        builder = builder.header(name, value);
    }
    Attempt::Done(builder.body(Body::from(body)).unwrap_or_default())
}

async fn ws_realtime(ws: WebSocketUpgrade, proxy: ProxyService) -> Response<Body> {
    ws.on_upgrade(move |socket| handle_realtime_socket(socket, proxy))
}

/// Push the connection banner, the active-request snapshot, then live
/// events until either side goes away.
async fn handle_realtime_socket(mut socket: WebSocket, proxy: ProxyService) {
    let hub = proxy.hub();
    if socket
        .send(WsMessage::Text(hub.connection_event().to_string().into()))
        .await
        .is_err()
    {
        return;
    }
    for event in hub.snapshot_events() {
        if socket
            .send(WsMessage::Text(event.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    let mut subscription = hub.subscribe();
    loop {
        tokio::select! {
            event = subscription.next() => {
                match event {
                    Some(event) => {
                        if socket
                            .send(WsMessage::Text(event.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }
            message = socket.recv() => {
                match message {
                    // clients ping to keep the connection alive; ignore payloads
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }
}

/// The public HTTP surface of one proxy service: health probes, the
/// realtime WebSocket, and the catch-all forwarding route, all behind the
/// token gate.
pub fn router(proxy: ProxyService) -> Router {
    let auth_state = AuthLayerState {
        auth: proxy.auth_manager(),
        service: proxy.service.name(),
    };
    let ws_proxy = proxy.clone();
    let root_proxy = proxy.clone();
    let engine_proxy = proxy.clone();

    Router::new()
        .route("/health", get(crate::auth::health))
        .route("/ping", get(crate::auth::health))
        .route(
            "/ws/realtime",
            get(move |ws: WebSocketUpgrade| ws_realtime(ws, ws_proxy.clone())),
        )
        // the catch-all needs at least one segment, so the bare root path
        // gets its own route to keep the surface fully verbatim
        .route(
            "/",
            any(move |req: Request<Body>| handle_proxy(root_proxy.clone(), req)),
        )
        .route(
            "/{*path}",
            any(move |req: Request<Body>| handle_proxy(engine_proxy.clone(), req)),
        )
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            crate::auth::require_token,
        ))
}
