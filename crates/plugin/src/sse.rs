use serde_json::Value;

/// Hidden field carrying the SSE `event:` type on a parsed chunk.
pub const EVENT_FIELD: &str = "__event";

/// The `[DONE]` sentinel as it travels through the stream executor.
pub fn done_sentinel() -> Value {
    Value::String("[DONE]".to_string())
}

pub fn is_done(chunk: &Value) -> bool {
    chunk.as_str() == Some("[DONE]")
}

/// Incremental SSE frame parser. Feed raw bytes, get parsed event
/// payloads out. Frames are split on blank lines; JSON-parse failures
/// on a data line are logged and the frame dropped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some((frame_end, skip)) = find_frame_boundary(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..frame_end + skip).collect();
            let block = String::from_utf8_lossy(&frame[..frame_end]);
            if let Some(event) = parse_frame(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Drain whatever remains after the stream ends.
    pub fn finish(&mut self) -> Vec<Value> {
        let rest = std::mem::take(&mut self.buffer);
        let block = String::from_utf8_lossy(&rest);
        if block.trim().is_empty() {
            return Vec::new();
        }
        parse_frame(&block).into_iter().collect()
    }
}

/// Position of the next blank-line terminator and its byte width.
fn find_frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some((a, wa)), Some((b, wb))) => Some(if a <= b { (a, wa) } else { (b, wb) }),
        (Some(found), None) | (None, Some(found)) => Some(found),
        (None, None) => None,
    }
}

/// Parse one frame: optional `event:` plus required `data:` lines.
fn parse_frame(block: &str) -> Option<Value> {
    let mut event_type: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start().to_string());
        }
        // id: and retry: fields are ignored
    }

    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");

    if data == "[DONE]" {
        return Some(done_sentinel());
    }

    match serde_json::from_str::<Value>(&data) {
        Ok(mut payload) => {
            if let (Some(event), Some(obj)) = (event_type, payload.as_object_mut()) {
                obj.insert(EVENT_FIELD.to_string(), Value::String(event));
            }
            Some(payload)
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping SSE frame with unparseable data");
            None
        }
    }
}

/// Serialize one chunk back to wire format. Objects with a string
/// `type` field get an `event:` line, matching the Anthropic framing.
pub fn serialize_event(chunk: &Value) -> String {
    if is_done(chunk) {
        return "data: [DONE]\n\n".to_string();
    }

    let mut payload = chunk.clone();
    let mut event_type = None;
    if let Some(obj) = payload.as_object_mut() {
        obj.remove(EVENT_FIELD);
        event_type = obj.get("type").and_then(|t| t.as_str()).map(String::from);
    }

    let data = payload.to_string();
    match event_type {
        Some(event) => format!("event: {event}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_complete_frames() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"a\": 1}\n\ndata: {\"b\": 2}\n\n");
        assert_eq!(events, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn buffers_partial_frames_across_feeds() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\"").is_empty());
        let events = parser.feed(b": 1}\n\n");
        assert_eq!(events, vec![json!({"a": 1})]);
    }

    #[test]
    fn event_type_attached_as_hidden_field() {
        let mut parser = SseParser::new();
        let events =
            parser.feed(b"event: message_start\ndata: {\"type\": \"message_start\"}\n\n");
        assert_eq!(events[0][EVENT_FIELD], "message_start");
        assert_eq!(events[0]["type"], "message_start");
    }

    #[test]
    fn crlf_frames() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"a\": 1}\r\n\r\n");
        assert_eq!(events, vec![json!({"a": 1})]);
    }

    #[test]
    fn done_sentinel_recognized() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [DONE]\n\n");
        assert!(is_done(&events[0]));
    }

    #[test]
    fn bad_json_frame_dropped() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {nope\n\ndata: {\"ok\": true}\n\n");
        assert_eq!(events, vec![json!({"ok": true})]);
    }

    #[test]
    fn multiline_data_joined() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [1,\ndata: 2]\n\n");
        assert_eq!(events, vec![json!([1, 2])]);
    }

    #[test]
    fn finish_drains_trailing_frame() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"tail\": true}").is_empty());
        assert_eq!(parser.finish(), vec![json!({"tail": true})]);
    }

    #[test]
    fn serializer_round_trip() {
        assert_eq!(serialize_event(&done_sentinel()), "data: [DONE]\n\n");
        assert_eq!(
            serialize_event(&json!({"choices": []})),
            "data: {\"choices\":[]}\n\n"
        );
        let typed = json!({"type": "message_stop", "__event": "message_stop"});
        assert_eq!(
            serialize_event(&typed),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
    }
}
