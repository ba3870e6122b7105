//! Event channel frames.
//!
//! Text frames are JSON envelopes `{"type": ..., "data": {...}}` and are
//! decoded into [`ComfyUIMessage`]. Binary frames carry result images
//! behind a fixed 8-byte header, split by [`BinaryFrame::parse`].

use serde::Deserialize;

/// A decoded control event.
///
/// Custom nodes broadcast their own event kinds, so anything not listed
/// here becomes [`ComfyUIMessage::Other`] instead of an error.
#[derive(Debug, Clone)]
pub enum ComfyUIMessage {
    /// Queue depth broadcast, sent to every client.
    Status(StatusData),
    ExecutionStart(ExecutionStartData),
    /// Nodes whose previous outputs were reused.
    ExecutionCached(ExecutionCachedData),
    /// Announces the node now running; `node == None` ends the prompt.
    Executing(ExecutingData),
    /// Step counter inside one node.
    Progress(ProgressData),
    Executed(ExecutedData),
    ExecutionError(ErrorData),
    Other { kind: String },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: StatusBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusBody {
    pub exec_info: QueueInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    /// Prompts still waiting or running on the server.
    pub queue_remaining: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    /// Absent on some older servers; such events never match a prompt.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

impl ExecutingData {
    /// Whether this event belongs to `prompt_id`.
    pub fn is_for(&self, prompt_id: &str) -> bool {
        self.prompt_id.as_deref() == Some(prompt_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// `value / max` as a whole percentage in `0..=100`; 0 when `max`
    /// is not positive.
    pub fn percent(&self) -> i16 {
        if self.max <= 0 {
            return 0;
        }
        let value = i128::from(self.value.clamp(0, self.max));
        (value * 100 / i128::from(self.max)) as i16
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Output summary as reported by the node (file listings and such).
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Failure report for one node.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Decode one text frame.
///
/// Fails on invalid JSON and on a known kind whose `data` has the wrong
/// shape.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    let message = match kind.as_str() {
        "status" => ComfyUIMessage::Status(serde_json::from_value(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(serde_json::from_value(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(serde_json::from_value(data)?),
        "executing" => ComfyUIMessage::Executing(serde_json::from_value(data)?),
        "progress" => ComfyUIMessage::Progress(serde_json::from_value(data)?),
        "executed" => ComfyUIMessage::Executed(serde_json::from_value(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(serde_json::from_value(data)?),
        _ => ComfyUIMessage::Other { kind },
    };
    Ok(message)
}

/// Size of the header that precedes every binary payload.
pub const BINARY_HEADER_LEN: usize = 8;

/// A binary frame split into header fields and payload.
///
/// The header is two big-endian `u32`s: the event type (1 = image) and
/// the image format (1 = JPEG, 2 = PNG). Neither is needed to decode
/// the payload, which carries its own container signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub event_type: u32,
    pub image_format: u32,
    pub payload: Vec<u8>,
}

impl BinaryFrame {
    /// Split a raw frame. Returns `None` when it is shorter than the header.
    pub fn parse(mut bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() < BINARY_HEADER_LEN {
            return None;
        }
        let payload = bytes.split_off(BINARY_HEADER_LEN);
        let word = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(Self {
            event_type: word(0),
            image_format: word(4),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn parse(json: &str) -> ComfyUIMessage {
        parse_message(json).unwrap()
    }

    #[test]
    fn queue_status_is_read() {
        let message =
            parse(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}},"sid":"c1"}}"#);
        assert_matches!(message, ComfyUIMessage::Status(s) if s.status.exec_info.queue_remaining == 3);
    }

    #[test]
    fn lifecycle_events_carry_prompt_id() {
        assert_matches!(
            parse(r#"{"type":"execution_start","data":{"prompt_id":"p1","timestamp":1}}"#),
            ComfyUIMessage::ExecutionStart(d) if d.prompt_id == "p1"
        );
        assert_matches!(
            parse(r#"{"type":"execution_cached","data":{"prompt_id":"p1"}}"#),
            ComfyUIMessage::ExecutionCached(d) if d.nodes.is_empty()
        );
        assert_matches!(
            parse(r#"{"type":"executed","data":{"node":"9","output":{"images":[]},"prompt_id":"p1"}}"#),
            ComfyUIMessage::Executed(d) if d.node == "9" && d.output.is_object()
        );
    }

    #[test]
    fn executing_announces_node_or_completion() {
        let running = parse(r#"{"type":"executing","data":{"node":"5","display_node":"5","prompt_id":"p1"}}"#);
        assert_matches!(running, ComfyUIMessage::Executing(d) => {
            assert_eq!(d.node.as_deref(), Some("5"));
            assert!(d.is_for("p1"));
            assert!(!d.is_for("p2"));
        });

        let done = parse(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#);
        assert_matches!(done, ComfyUIMessage::Executing(d) if d.node.is_none());

        let anonymous = parse(r#"{"type":"executing","data":{"node":null}}"#);
        assert_matches!(anonymous, ComfyUIMessage::Executing(d) if !d.is_for(""));
    }

    #[test]
    fn progress_percentage() {
        let quarter = parse(r#"{"type":"progress","data":{"value":5,"max":20}}"#);
        assert_matches!(quarter, ComfyUIMessage::Progress(d) if d.percent() == 25);

        let no_max = parse(r#"{"type":"progress","data":{"value":5,"max":0}}"#);
        assert_matches!(no_max, ComfyUIMessage::Progress(d) if d.percent() == 0);

        let overshoot = parse(r#"{"type":"progress","data":{"value":30,"max":20,"prompt_id":"p1"}}"#);
        assert_matches!(overshoot, ComfyUIMessage::Progress(d) if d.percent() == 100);
    }

    #[test]
    fn progress_near_i64_max_does_not_overflow() {
        let json = format!(
            r#"{{"type":"progress","data":{{"value":{},"max":{}}}}}"#,
            i64::MAX / 2,
            i64::MAX
        );
        assert_matches!(parse(&json), ComfyUIMessage::Progress(d) if d.percent() == 49);

        let done = format!(
            r#"{{"type":"progress","data":{{"value":{0},"max":{0}}}}}"#,
            i64::MAX
        );
        assert_matches!(parse(&done), ComfyUIMessage::Progress(d) if d.percent() == 100);
    }

    #[test]
    fn node_failure_details() {
        let message = parse(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"5","node_type":"ReActorFaceSwap","exception_message":"no face detected","exception_type":"RuntimeError","traceback":[]}}"#,
        );
        assert_matches!(message, ComfyUIMessage::ExecutionError(d) => {
            assert_eq!(d.node_id, "5");
            assert_eq!(d.node_type, "ReActorFaceSwap");
            assert_eq!(d.exception_message, "no face detected");
        });
    }

    #[test]
    fn custom_node_events_are_kept_as_other() {
        let message = parse(r#"{"type":"crystools.monitor","data":{"cpu_utilization":3}}"#);
        assert_matches!(message, ComfyUIMessage::Other { kind } if kind == "crystools.monitor");
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(parse_message("not json at all").is_err());
        assert!(parse_message(r#"{"data":{}}"#).is_err());
        assert!(parse_message(r#"{"type":"progress","data":{"value":"x"}}"#).is_err());
    }

    #[test]
    fn binary_header_is_stripped() {
        let mut raw = vec![0, 0, 0, 1, 0, 0, 0, 2];
        raw.extend_from_slice(b"\x89PNG");

        let frame = BinaryFrame::parse(raw).unwrap();

        assert_eq!(frame.event_type, 1);
        assert_eq!(frame.image_format, 2);
        assert_eq!(frame.payload, b"\x89PNG");
    }

    #[test]
    fn short_binary_frames() {
        assert_eq!(BinaryFrame::parse(vec![0, 0, 0, 1]), None);
        let header_only = BinaryFrame::parse(vec![0; BINARY_HEADER_LEN]).unwrap();
        assert!(header_only.payload.is_empty());
    }
}
