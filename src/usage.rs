use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::service::ServiceKind;

/// Normalized token-usage counters. Storage and logs always hold the raw
/// parsed numbers; see [`display_totals`] for the Codex UI projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input: u64,
    pub cached_create: u64,
    pub cached_read: u64,
    pub output: u64,
    pub reasoning: u64,
    pub total: u64,
}

/// UI projection of usage numbers. Codex reports cached reads inside
/// `input_tokens`/`total_tokens`, so display surfaces subtract them;
/// logs must never apply this.
pub fn display_totals(service: ServiceKind, totals: UsageTotals) -> UsageTotals {
    match service {
        ServiceKind::Claude => totals,
        ServiceKind::Codex => UsageTotals {
            input: totals.input.saturating_sub(totals.cached_read),
            total: totals.total.saturating_sub(totals.cached_read),
            ..totals
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Sse,
    Ndjson,
    Json,
}

/// Stateful incremental usage parser fed arbitrary byte chunks of the
/// upstream response. Framing is decided once from the response
/// Content-Type; malformed JSON fragments are dropped silently and never
/// fail the stream.
pub struct UsageParser {
    service: ServiceKind,
    framing: Framing,
    buf: Vec<u8>,
    input: Option<u64>,
    cached_create: Option<u64>,
    cached_read: Option<u64>,
    output: Option<u64>,
    reasoning: Option<u64>,
    total: Option<u64>,
}

/// Single-JSON bodies are buffered whole before the one parse at stream
/// end; anything past this cap cannot be a usage payload worth keeping.
const MAX_JSON_BUFFER: usize = 8 * 1024 * 1024;

impl UsageParser {
    pub fn new(service: ServiceKind, content_type: Option<&str>) -> Self {
        let ct = content_type.unwrap_or("").to_ascii_lowercase();
        let framing = if ct.contains("text/event-stream") {
            Framing::Sse
        } else if ct.contains("application/x-ndjson") {
            Framing::Ndjson
        } else {
            Framing::Json
        };
        Self {
            service,
            framing,
            buf: Vec::new(),
            input: None,
            cached_create: None,
            cached_read: None,
            output: None,
            reasoning: None,
            total: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        match self.framing {
            Framing::Sse => {
                self.buf.extend_from_slice(chunk);
                // complete SSE events end with a blank line
                while let Some(pos) = find_double_newline(&self.buf) {
                    let event: Vec<u8> = self.buf.drain(..pos + 2).collect();
                    self.consume_sse_event(&event);
                }
            }
            Framing::Ndjson => {
                self.buf.extend_from_slice(chunk);
                while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = self.buf.drain(..pos + 1).collect();
                    self.consume_json_line(&line);
                }
            }
            Framing::Json => {
                if self.buf.len() < MAX_JSON_BUFFER {
                    let room = MAX_JSON_BUFFER - self.buf.len();
                    self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
            }
        }
    }

    /// Flush any buffered remainder and return the final totals.
    pub fn finish(&mut self) -> UsageTotals {
        match self.framing {
            Framing::Sse => {
                if !self.buf.is_empty() {
                    let rest = std::mem::take(&mut self.buf);
                    self.consume_sse_event(&rest);
                }
            }
            Framing::Ndjson => {
                if !self.buf.is_empty() {
                    let rest = std::mem::take(&mut self.buf);
                    self.consume_json_line(&rest);
                }
            }
            Framing::Json => {
                let rest = std::mem::take(&mut self.buf);
                let text = String::from_utf8_lossy(&rest);
                let text = text.trim();
                if !text.is_empty() {
                    if let Ok(payload) = serde_json::from_str::<JsonValue>(text) {
                        self.absorb_payload(&payload);
                    } else if text.starts_with("event:") || text.contains("\ndata:") {
                        // some upstreams stream SSE without declaring the content type
                        for event in text.split("\n\n") {
                            self.consume_sse_event(event.as_bytes());
                        }
                    }
                }
            }
        }
        self.totals()
    }

    pub fn totals(&self) -> UsageTotals {
        let input = self.input.unwrap_or(0);
        let output = self.output.unwrap_or(0);
        UsageTotals {
            input,
            cached_create: self.cached_create.unwrap_or(0),
            cached_read: self.cached_read.unwrap_or(0),
            output,
            reasoning: self.reasoning.unwrap_or(0),
            total: self.total.unwrap_or(input + output),
        }
    }

    fn consume_sse_event(&mut self, event: &[u8]) {
        let text = String::from_utf8_lossy(event);
        for line in text.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if let Ok(payload) = serde_json::from_str::<JsonValue>(data) {
                    self.absorb_payload(&payload);
                }
            }
        }
    }

    fn consume_json_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if let Ok(payload) = serde_json::from_str::<JsonValue>(text) {
            self.absorb_payload(&payload);
        }
    }

    fn absorb_payload(&mut self, payload: &JsonValue) {
        let Some(usage) = extract_usage(self.service, payload) else {
            return;
        };
        match self.service {
            ServiceKind::Claude => {
                merge_field(&mut self.input, usage.get("input_tokens"));
                merge_field(&mut self.cached_create, usage.get("cache_creation_input_tokens"));
                merge_field(&mut self.cached_read, usage.get("cache_read_input_tokens"));
                merge_field(&mut self.output, usage.get("output_tokens"));
                merge_field(&mut self.reasoning, usage.get("reasoning_tokens"));
                merge_field(&mut self.total, usage.get("total_tokens"));
            }
            ServiceKind::Codex => {
                merge_field(&mut self.input, usage.get("input_tokens"));
                merge_field(&mut self.cached_create, usage.get("cache_creation_input_tokens"));
                merge_field(
                    &mut self.cached_read,
                    usage
                        .get("input_tokens_details")
                        .and_then(|d| d.get("cached_tokens")),
                );
                merge_field(&mut self.output, usage.get("output_tokens"));
                merge_field(
                    &mut self.reasoning,
                    usage
                        .get("output_tokens_details")
                        .and_then(|d| d.get("reasoning_tokens")),
                );
                merge_field(&mut self.total, usage.get("total_tokens"));
            }
        }
    }
}

/// Where each dialect hides its usage object.
fn extract_usage(service: ServiceKind, payload: &JsonValue) -> Option<&JsonValue> {
    let direct = payload.get("usage").filter(|u| u.is_object());
    if direct.is_some() {
        return direct;
    }
    let nested = match service {
        ServiceKind::Claude => payload.get("message"),
        ServiceKind::Codex => payload.get("response"),
    };
    nested
        .and_then(|n| n.get("usage"))
        .filter(|u| u.is_object())
}

/// Update the accumulator only when the payload actually carries the key;
/// later events never wipe out fields they do not mention.
fn merge_field(slot: &mut Option<u64>, value: Option<&JsonValue>) {
    if let Some(v) = value {
        *slot = Some(to_u64(v));
    }
}

fn to_u64(value: &JsonValue) -> u64 {
    if let Some(n) = value.as_u64() {
        return n;
    }
    if let Some(f) = value.as_f64() {
        return if f > 0.0 { f as u64 } else { 0 };
    }
    value
        .as_str()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|f| if f > 0.0 { f as u64 } else { 0 })
        .unwrap_or(0)
}

/// One-shot extraction from a fully buffered response body, used for
/// non-streamed exchanges.
pub fn extract_usage_from_bytes(
    service: ServiceKind,
    content_type: Option<&str>,
    body: &[u8],
) -> UsageTotals {
    let mut parser = UsageParser::new(service, content_type);
    parser.feed(body);
    parser.finish()
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CLAUDE_SSE: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10,\"cache_read_input_tokens\":3}}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n",
        "\n",
        "event: message_delta\n",
        "data: {\"usage\":{\"output_tokens\":7}}\n",
        "\n",
    );

    #[test]
    fn claude_sse_merges_fields_across_events() {
        let mut parser = UsageParser::new(ServiceKind::Claude, Some("text/event-stream"));
        parser.feed(CLAUDE_SSE.as_bytes());
        let totals = parser.finish();
        assert_eq!(
            totals,
            UsageTotals {
                input: 10,
                cached_create: 0,
                cached_read: 3,
                output: 7,
                reasoning: 0,
                total: 17,
            }
        );
    }

    #[test]
    fn byte_at_a_time_equals_one_shot() {
        let mut whole = UsageParser::new(ServiceKind::Claude, Some("text/event-stream"));
        whole.feed(CLAUDE_SSE.as_bytes());
        let expected = whole.finish();

        let mut trickle = UsageParser::new(ServiceKind::Claude, Some("text/event-stream"));
        for b in CLAUDE_SSE.as_bytes() {
            trickle.feed(std::slice::from_ref(b));
        }
        assert_eq!(trickle.finish(), expected);
    }

    #[test]
    fn codex_ndjson_reads_detail_fields() {
        let lines = concat!(
            "{\"response\":{\"usage\":{\"input_tokens\":300,\"input_tokens_details\":{\"cached_tokens\":120},",
            "\"output_tokens\":210,\"output_tokens_details\":{\"reasoning_tokens\":30},\"total_tokens\":660}}}\n",
        );
        let mut parser = UsageParser::new(ServiceKind::Codex, Some("application/x-ndjson"));
        parser.feed(lines.as_bytes());
        let totals = parser.finish();
        assert_eq!(
            totals,
            UsageTotals {
                input: 300,
                cached_create: 0,
                cached_read: 120,
                output: 210,
                reasoning: 30,
                total: 660,
            }
        );
    }

    #[test]
    fn ndjson_final_line_without_newline_is_flushed_at_finish() {
        let mut parser = UsageParser::new(ServiceKind::Codex, Some("application/x-ndjson"));
        parser.feed(b"{\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}");
        assert_eq!(parser.totals().input, 0);
        let totals = parser.finish();
        assert_eq!(totals.input, 5);
        assert_eq!(totals.total, 7);
    }

    #[test]
    fn malformed_fragments_are_dropped_silently() {
        let mut parser = UsageParser::new(ServiceKind::Claude, Some("text/event-stream"));
        parser.feed(b"data: {broken json\n\n");
        parser.feed(b"data: {\"usage\":{\"output_tokens\":1}}\n\n");
        let totals = parser.finish();
        assert_eq!(totals.output, 1);
    }

    #[test]
    fn single_json_response_parses_at_stream_end() {
        let body = br#"{"id":"msg_1","usage":{"input_tokens":4,"output_tokens":6,"total_tokens":10}}"#;
        let totals =
            extract_usage_from_bytes(ServiceKind::Claude, Some("application/json"), body);
        assert_eq!(totals.input, 4);
        assert_eq!(totals.total, 10);
    }

    #[test]
    fn undeclared_sse_is_sniffed_in_json_framing() {
        let body = b"event: message_start\ndata: {\"message\":{\"usage\":{\"input_tokens\":9}}}\n\n";
        let totals = extract_usage_from_bytes(ServiceKind::Claude, None, body);
        assert_eq!(totals.input, 9);
    }

    #[test]
    fn codex_display_subtracts_cached_read_but_storage_does_not() {
        let raw = UsageTotals {
            input: 300,
            cached_create: 0,
            cached_read: 120,
            output: 210,
            reasoning: 30,
            total: 660,
        };
        let shown = display_totals(ServiceKind::Codex, raw);
        assert_eq!(shown.input, 180);
        assert_eq!(shown.total, 540);
        assert_eq!(shown.cached_read, 120);
        // Claude projection is the identity
        assert_eq!(display_totals(ServiceKind::Claude, raw), raw);
    }

    #[test]
    fn totals_fall_back_to_input_plus_output() {
        let mut parser = UsageParser::new(ServiceKind::Claude, Some("text/event-stream"));
        parser.feed(b"data: {\"usage\":{\"input_tokens\":2,\"output_tokens\":3}}\n\n");
        assert_eq!(parser.finish().total, 5);
    }
}
