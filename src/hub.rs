use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

/// Bound of each subscriber's event queue; when a slow consumer falls
/// behind, the oldest events are dropped rather than stalling the
/// request hot path.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// How many in-flight/recent requests the snapshot keeps.
const MAX_TRACKED_REQUESTS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct TrackedRequest {
    pub request_id: String,
    pub service: String,
    pub channel: String,
    pub method: String,
    pub path: String,
    pub start_time: String,
    pub status: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Process-wide pub/sub for one service's request lifecycle events.
///
/// Events are JSON objects with a top-level `type` and RFC 3339
/// `timestamp`. Within a request they are published in causal order;
/// across requests only arrival order holds.
pub struct RealtimeHub {
    service: &'static str,
    tx: broadcast::Sender<Arc<JsonValue>>,
    tracked: Mutex<HashMap<String, TrackedRequest>>,
}

/// One subscriber's view of the event stream. Dropping the handle
/// unsubscribes.
pub struct EventSubscription {
    rx: broadcast::Receiver<Arc<JsonValue>>,
}

impl EventSubscription {
    /// Next event, skipping over anything dropped while lagging.
    /// Returns None once the hub is gone.
    pub async fn next(&mut self) -> Option<Arc<JsonValue>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl RealtimeHub {
    pub fn new(service: &'static str) -> Self {
        let (tx, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Self {
            service,
            tx,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of tracked requests, oldest first, for a fresh subscriber.
    pub fn snapshot_events(&self) -> Vec<JsonValue> {
        let tracked = self.tracked.lock().expect("hub lock");
        let mut entries: Vec<&TrackedRequest> = tracked.values().collect();
        entries.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        entries
            .into_iter()
            .map(|req| {
                let mut event = serde_json::to_value(req).unwrap_or_default();
                event["type"] = JsonValue::from("snapshot");
                event["timestamp"] = JsonValue::from(now_iso());
                event
            })
            .collect()
    }

    pub fn connection_event(&self) -> JsonValue {
        serde_json::json!({
            "type": "connection",
            "service": self.service,
            "timestamp": now_iso(),
            "active_requests": self.tracked.lock().expect("hub lock").len(),
            "subscribers": self.subscriber_count(),
        })
    }

    fn publish(&self, event: JsonValue) {
        // no receivers is fine; events are lossy by design
        let _ = self.tx.send(Arc::new(event));
    }

    fn base_event(&self, kind: &str, request_id: &str) -> serde_json::Map<String, JsonValue> {
        let mut map = serde_json::Map::new();
        map.insert("type".to_string(), JsonValue::from(kind));
        map.insert("service".to_string(), JsonValue::from(self.service));
        map.insert("request_id".to_string(), JsonValue::from(request_id));
        map.insert("timestamp".to_string(), JsonValue::from(now_iso()));
        map
    }

    pub fn request_started(
        &self,
        request_id: &str,
        method: &str,
        path: &str,
        channel: &str,
        target_url: Option<&str>,
        model: Option<&str>,
    ) {
        let entry = TrackedRequest {
            request_id: request_id.to_string(),
            service: self.service.to_string(),
            channel: channel.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            start_time: now_iso(),
            status: "PENDING".to_string(),
            duration_ms: 0,
            status_code: None,
            target_url: target_url.map(String::from),
            model: model.map(String::from),
        };
        {
            let mut tracked = self.tracked.lock().expect("hub lock");
            tracked.insert(request_id.to_string(), entry.clone());
            if tracked.len() > MAX_TRACKED_REQUESTS {
                let oldest = tracked
                    .values()
                    .min_by(|a, b| a.start_time.cmp(&b.start_time))
                    .map(|r| r.request_id.clone());
                if let Some(id) = oldest {
                    tracked.remove(&id);
                }
            }
        }

        let mut event = self.base_event("started", request_id);
        event.insert("method".to_string(), JsonValue::from(method));
        event.insert("path".to_string(), JsonValue::from(path));
        event.insert("channel".to_string(), JsonValue::from(channel));
        if let Some(url) = target_url {
            event.insert("target_url".to_string(), JsonValue::from(url));
        }
        if let Some(model) = model {
            event.insert("model".to_string(), JsonValue::from(model));
        }
        self.publish(JsonValue::Object(event));
    }

    /// First byte arrived; the request is now streaming.
    pub fn request_streaming(&self, request_id: &str, duration_ms: u64) {
        if let Some(req) = self
            .tracked
            .lock()
            .expect("hub lock")
            .get_mut(request_id)
        {
            req.status = "STREAMING".to_string();
            req.duration_ms = duration_ms;
        }
        let mut event = self.base_event("progress", request_id);
        event.insert("status".to_string(), JsonValue::from("STREAMING"));
        event.insert("duration_ms".to_string(), JsonValue::from(duration_ms));
        self.publish(JsonValue::Object(event));
    }

    pub fn response_chunk(&self, request_id: &str, delta: &str, duration_ms: u64) {
        if delta.trim().is_empty() {
            return;
        }
        if let Some(req) = self
            .tracked
            .lock()
            .expect("hub lock")
            .get_mut(request_id)
        {
            req.duration_ms = duration_ms;
        }
        let mut event = self.base_event("progress", request_id);
        event.insert("response_delta".to_string(), JsonValue::from(delta));
        event.insert("duration_ms".to_string(), JsonValue::from(duration_ms));
        self.publish(JsonValue::Object(event));
    }

    pub fn request_completed(
        &self,
        request_id: &str,
        status_code: u16,
        duration_ms: u64,
        success: bool,
        reason: Option<&str>,
    ) {
        {
            let mut tracked = self.tracked.lock().expect("hub lock");
            if let Some(req) = tracked.get_mut(request_id) {
                req.status = if success { "COMPLETED" } else { "FAILED" }.to_string();
                req.status_code = Some(status_code);
                req.duration_ms = duration_ms;
            }
        }
        let kind = if success { "completed" } else { "failed" };
        let mut event = self.base_event(kind, request_id);
        event.insert(
            "status".to_string(),
            JsonValue::from(if success { "COMPLETED" } else { "FAILED" }),
        );
        event.insert("status_code".to_string(), JsonValue::from(status_code));
        event.insert("duration_ms".to_string(), JsonValue::from(duration_ms));
        if let Some(reason) = reason {
            event.insert("reason".to_string(), JsonValue::from(reason));
        }
        self.publish(JsonValue::Object(event));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn lb_switch(
        &self,
        request_id: &str,
        from_channel: &str,
        to_channel: &str,
        reason: &str,
        failures: u32,
        threshold: u32,
        attempt: u32,
        path: &str,
    ) {
        let mut event = self.base_event("lb_switch", request_id);
        event.insert("from_channel".to_string(), JsonValue::from(from_channel));
        event.insert("to_channel".to_string(), JsonValue::from(to_channel));
        event.insert("reason".to_string(), JsonValue::from(reason));
        event.insert("failures".to_string(), JsonValue::from(failures));
        event.insert("threshold".to_string(), JsonValue::from(threshold));
        event.insert("attempt".to_string(), JsonValue::from(attempt));
        event.insert("path".to_string(), JsonValue::from(path));
        self.publish(JsonValue::Object(event));
    }

    pub fn lb_reset(&self, request_id: &str, reason: &str, total_configs: usize, threshold: u32) {
        let mut event = self.base_event("lb_reset", request_id);
        event.insert("reason".to_string(), JsonValue::from(reason));
        event.insert("total_configs".to_string(), JsonValue::from(total_configs));
        event.insert("threshold".to_string(), JsonValue::from(threshold));
        self.publish(JsonValue::Object(event));
    }

    pub fn lb_exhausted(
        &self,
        request_id: &str,
        reason: &str,
        total_configs: usize,
        threshold: u32,
        cooldown_seconds: u64,
        cooldown_remaining_seconds: u64,
    ) {
        let mut event = self.base_event("lb_exhausted", request_id);
        event.insert("reason".to_string(), JsonValue::from(reason));
        event.insert("total_configs".to_string(), JsonValue::from(total_configs));
        event.insert("threshold".to_string(), JsonValue::from(threshold));
        event.insert(
            "cooldown_seconds".to_string(),
            JsonValue::from(cooldown_seconds),
        );
        event.insert(
            "cooldown_remaining_seconds".to_string(),
            JsonValue::from(cooldown_remaining_seconds),
        );
        self.publish(JsonValue::Object(event));
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn started_then_completed_arrive_in_order() {
        let hub = RealtimeHub::new("claude");
        let mut sub = hub.subscribe();
        hub.request_started("r1", "POST", "/v1/messages", "prod", None, Some("m"));
        hub.request_completed("r1", 200, 42, true, None);

        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(first["type"], "started");
        assert_eq!(first["channel"], "prod");
        assert_eq!(second["type"], "completed");
        assert_eq!(second["status_code"], 200);
        assert_eq!(second["duration_ms"], 42);
    }

    #[tokio::test]
    async fn failure_publishes_failed_event() {
        let hub = RealtimeHub::new("codex");
        let mut sub = hub.subscribe();
        hub.request_completed("r1", 502, 10, false, Some("client_cancelled"));
        let event = sub.next().await.unwrap();
        assert_eq!(event["type"], "failed");
        assert_eq!(event["reason"], "client_cancelled");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_not_newest() {
        let hub = RealtimeHub::new("claude");
        let mut sub = hub.subscribe();
        for i in 0..(EVENT_QUEUE_CAPACITY + 50) {
            hub.response_chunk("r", &format!("chunk-{i}"), i as u64);
        }
        // the first events were pushed out; the subscription resumes at the
        // oldest retained event and still sees the newest one
        let first = sub.next().await.unwrap();
        assert_ne!(first["response_delta"], "chunk-0");
        let mut last = first;
        while let Ok(event) = sub.rx.try_recv() {
            last = event;
        }
        assert_eq!(
            last["response_delta"],
            format!("chunk-{}", EVENT_QUEUE_CAPACITY + 49)
        );
    }

    #[tokio::test]
    async fn snapshot_lists_tracked_requests() {
        let hub = RealtimeHub::new("claude");
        hub.request_started("r1", "GET", "/a", "prod", None, None);
        let events = hub.snapshot_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "snapshot");
        assert_eq!(events[0]["request_id"], "r1");
        assert_eq!(events[0]["status"], "PENDING");
    }

    #[tokio::test]
    async fn empty_chunks_are_not_published() {
        let hub = RealtimeHub::new("claude");
        let mut sub = hub.subscribe();
        hub.response_chunk("r", "   ", 1);
        hub.request_completed("r", 200, 2, true, None);
        let event = sub.next().await.unwrap();
        assert_eq!(event["type"], "completed");
    }
}
