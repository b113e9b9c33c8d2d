use serde_json::Value as JsonValue;

/// The AI service a proxy instance fronts. The engine is generic over this;
/// everything service-specific funnels through the methods below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Claude,
    Codex,
}

impl ServiceKind {
    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Claude => "claude",
            ServiceKind::Codex => "codex",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            ServiceKind::Claude => 3210,
            ServiceKind::Codex => 3211,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(ServiceKind::Claude),
            "codex" => Some(ServiceKind::Codex),
            _ => None,
        }
    }

    /// Pull the model name out of a request body. Both services put it at
    /// the top-level `model` field of a JSON object.
    pub fn extract_model(self, body: &[u8]) -> Option<String> {
        let v: JsonValue = serde_json::from_slice(body).ok()?;
        v.get("model")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
    }

    /// Minimal upstream request used by `clp test` to probe connectivity.
    /// Returns (path, JSON body).
    pub fn probe_request(self, model: &str) -> (&'static str, JsonValue) {
        match self {
            ServiceKind::Claude => (
                "/v1/messages",
                serde_json::json!({
                    "model": model,
                    "max_tokens": 1,
                    "messages": [{"role": "user", "content": "ping"}],
                }),
            ),
            ServiceKind::Codex => (
                "/responses",
                serde_json::json!({
                    "model": model,
                    "input": "ping",
                    "stream": false,
                }),
            ),
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_model_reads_top_level_field() {
        let body = br#"{"model":"claude-sonnet-4","messages":[]}"#;
        assert_eq!(
            ServiceKind::Claude.extract_model(body).as_deref(),
            Some("claude-sonnet-4")
        );
    }

    #[test]
    fn extract_model_is_none_for_non_json() {
        assert_eq!(ServiceKind::Codex.extract_model(b"plain text"), None);
        assert_eq!(ServiceKind::Codex.extract_model(br#"{"other":1}"#), None);
    }

    #[test]
    fn default_ports_match_services() {
        assert_eq!(ServiceKind::Claude.default_port(), 3210);
        assert_eq!(ServiceKind::Codex.default_port(), 3211);
    }
}
