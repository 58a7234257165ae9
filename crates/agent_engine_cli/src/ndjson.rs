use agent_engine::EngineEvent;
use serde_json::Value;

/// One decoded line of agent stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event(EngineEvent),
    /// Request from the agent that the host must answer.
    ControlRequest { request_id: String, request: Value },
    /// Answer to a control request the host sent.
    ControlResponse {
        request_id: String,
        outcome: Result<Value, String>,
    },
    ControlCancel { request_id: String },
    /// Well-formed line of a kind the host does not consume.
    Ignored { kind: String },
    Malformed { line: String, reason: String },
}

/// Incremental parser for newline-delimited JSON streams.
#[derive(Debug, Default)]
pub struct NdjsonParser {
    buffer: Vec<u8>,
}

impl NdjsonParser {
    /// Feed arbitrary bytes into the parser and drain complete lines.
    ///
    /// Bytes are buffered until a newline, so multi-byte characters split
    /// across reads decode correctly.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<InboundFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(split) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=split).collect();
            let line = String::from_utf8_lossy(&line[..split]);
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Drains a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<InboundFrame> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        parse_line(&line).into_iter().collect()
    }

    /// Parse a complete payload string in one shot.
    pub fn parse_lines(input: &str) -> Vec<InboundFrame> {
        let mut parser = Self::default();
        let mut frames = parser.feed(input.as_bytes());
        frames.extend(parser.finish());
        frames
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

/// Decodes one line. Blank lines yield nothing.
pub fn parse_line(line: &str) -> Option<InboundFrame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(error) => {
            return Some(malformed(line, error.to_string()));
        }
    };
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Some(malformed(line, "missing `type` field".to_string()));
    };

    let frame = match kind.as_str() {
        "control_request" => {
            let request_id = string_field(&value, "request_id")?;
            let request = value.get("request").cloned().unwrap_or(Value::Null);
            InboundFrame::ControlRequest {
                request_id,
                request,
            }
        }
        "control_response" => {
            let response = value.get("response")?;
            let request_id = string_field(response, "request_id")?;
            let outcome = match response.get("subtype").and_then(Value::as_str) {
                Some("error") => Err(response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown control error")
                    .to_string()),
                _ => Ok(response.get("response").cloned().unwrap_or(Value::Null)),
            };
            InboundFrame::ControlResponse {
                request_id,
                outcome,
            }
        }
        "control_cancel_request" => InboundFrame::ControlCancel {
            request_id: string_field(&value, "request_id")?,
        },
        "system" | "assistant" | "user" | "result" => {
            match serde_json::from_value::<EngineEvent>(value) {
                Ok(event) => InboundFrame::Event(event),
                Err(error) => malformed(line, error.to_string()),
            }
        }
        _ => InboundFrame::Ignored { kind },
    };

    Some(frame)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToString::to_string)
}

fn malformed(line: &str, reason: String) -> InboundFrame {
    InboundFrame::Malformed {
        line: line.to_string(),
        reason,
    }
}
