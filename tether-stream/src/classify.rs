//! Turns extracted JSON objects into [`ProtocolEvent`]s.
//!
//! Dispatch is on the `type` discriminator. Each wire shape is deserialized into
//! a permissive struct (optional fields default) and then mapped onto the event
//! union, so extra or missing optional fields never fail a parse.

use serde::Deserialize;
use serde::de::Error as _;
use serde_json::Value;
use tether_api::TokenUsage;

use crate::ansi::strip_ansi;
use crate::error::ParseFailure;
use crate::protocol::{BlockKind, Delta, ProtocolEvent, SnapshotBlock, TurnStatus};

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            input_tokens: u.input_tokens.unwrap_or(0),
            output_tokens: u.output_tokens.unwrap_or(0),
            cache_creation_input_tokens: u.cache_creation_input_tokens.unwrap_or(0),
            cache_read_input_tokens: u.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    event: Value,
}

#[derive(Debug, Deserialize)]
struct SystemEvent {
    subtype: Option<String>,
    session_id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    tools: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageHead {
    id: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    #[serde(default)]
    message: MessageHead,
}

/// A content block as it appears in `content_block_start` and in full messages.
#[derive(Debug, Deserialize)]
struct WireBlock {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
    text: Option<String>,
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: WireBlock,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    partial_json: Option<String>,
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: WireDelta,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStopEvent {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageStopEvent {
    usage: Option<WireUsage>,
    message: Option<MessageHead>,
}

#[derive(Debug, Deserialize)]
struct AssistantEvent {
    message: AssistantBody,
}

#[derive(Debug, Deserialize)]
struct AssistantBody {
    id: Option<String>,
    #[serde(default)]
    content: Vec<WireBlock>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct UserEvent {
    message: UserBody,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ResultEvent {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    total_cost_usd: Option<f64>,
    cost_usd: Option<f64>,
    result: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

// =============================================================================
// Classification
// =============================================================================

/// Classify one extracted object.
///
/// On failure the text is retried once with ANSI escape sequences removed.
/// One object can yield several events (a user message carrying several tool
/// results) or none.
pub fn classify(object: &str) -> Result<Vec<ProtocolEvent>, ParseFailure> {
    let error = match parse(object) {
        Ok(events) => return Ok(events),
        Err(e) => e,
    };

    let stripped = strip_ansi(object);
    match parse(&stripped) {
        Ok(events) => {
            tracing::debug!("Recovered event after stripping ANSI codes");
            Ok(events)
        }
        Err(retry_error) => Err(ParseFailure {
            raw: object.to_string(),
            error,
            retry_error,
        }),
    }
}

fn parse(text: &str) -> Result<Vec<ProtocolEvent>, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    classify_value(value).map_err(|e| e.to_string())
}

fn classify_value(value: Value) -> Result<Vec<ProtocolEvent>, serde_json::Error> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| serde_json::Error::custom("missing \"type\" discriminator"))?
        .to_string();

    let event = match kind.as_str() {
        "stream_event" => {
            let envelope: StreamEnvelope = serde_json::from_value(value)?;
            return classify_value(envelope.event);
        }
        "system" => {
            let sys: SystemEvent = serde_json::from_value(value)?;
            match (sys.subtype.as_deref(), sys.session_id) {
                (Some("init"), Some(resume_id)) => ProtocolEvent::SessionInit {
                    resume_id,
                    model: sys.model,
                    tools: sys.tools.iter().filter_map(tool_name).collect(),
                },
                (subtype, _) => ProtocolEvent::Other {
                    kind: format!("system/{}", subtype.unwrap_or("unknown")),
                },
            }
        }
        "message_start" => {
            let start: MessageStartEvent = serde_json::from_value(value)?;
            ProtocolEvent::MessageStart {
                message_id: start.message.id,
                initial_usage: start.message.usage.unwrap_or_default().into(),
            }
        }
        "content_block_start" => {
            let start: ContentBlockStartEvent = serde_json::from_value(value)?;
            let block = start.content_block;
            let kind = block_kind(&block.kind);
            ProtocolEvent::ContentBlockStart {
                index: start.index,
                initial_text: block.text.or(block.thinking).filter(|t| !t.is_empty()),
                kind,
                tool_id: block.id,
                tool_name: block.name,
                initial_input: block.input,
            }
        }
        "content_block_delta" => {
            let delta: ContentBlockDeltaEvent = serde_json::from_value(value)?;
            let d = delta.delta;
            let payload = match d.kind.as_str() {
                "text_delta" => Delta::Text(d.text.unwrap_or_default()),
                "input_json_delta" => Delta::PartialJson(d.partial_json.unwrap_or_default()),
                "thinking_delta" => Delta::Thinking(d.thinking.unwrap_or_default()),
                other => {
                    return Ok(vec![ProtocolEvent::Other {
                        kind: other.to_string(),
                    }]);
                }
            };
            ProtocolEvent::ContentBlockDelta {
                index: delta.index,
                delta: payload,
            }
        }
        "content_block_stop" => {
            let stop: ContentBlockStopEvent = serde_json::from_value(value)?;
            ProtocolEvent::ContentBlockStop { index: stop.index }
        }
        "message_delta" => {
            let delta: MessageDeltaEvent = serde_json::from_value(value)?;
            ProtocolEvent::MessageDelta {
                usage_delta: delta.usage.unwrap_or_default().into(),
            }
        }
        "message_stop" => {
            let stop: MessageStopEvent = serde_json::from_value(value)?;
            let usage = stop.usage.or(stop.message.and_then(|m| m.usage));
            ProtocolEvent::MessageStop {
                final_usage: usage.map(TokenUsage::from),
            }
        }
        "assistant" => {
            let msg: AssistantEvent = serde_json::from_value(value)?;
            ProtocolEvent::AssistantSnapshot {
                message_id: msg.message.id,
                blocks: msg
                    .message
                    .content
                    .into_iter()
                    .filter_map(snapshot_block)
                    .collect(),
                usage: msg.message.usage.map(TokenUsage::from),
            }
        }
        "user" => {
            let msg: UserEvent = serde_json::from_value(value)?;
            return Ok(user_events(msg.message.content));
        }
        "result" => {
            let result: ResultEvent = serde_json::from_value(value)?;
            let failed = result.is_error
                || result.subtype.as_deref().is_some_and(|s| s != "success");
            let error_text = if failed {
                Some(
                    result
                        .result
                        .clone()
                        .filter(|r| !r.is_empty())
                        .or(result.subtype.clone())
                        .unwrap_or_else(|| "turn failed".to_string()),
                )
            } else {
                None
            };
            ProtocolEvent::TurnResult {
                status: if failed {
                    TurnStatus::Error
                } else {
                    TurnStatus::Success
                },
                cost_usd: result.total_cost_usd.or(result.cost_usd),
                error_text,
                resume_id: result.session_id,
            }
        }
        "error" => {
            let err: ErrorEvent = serde_json::from_value(value)?;
            ProtocolEvent::ErrorEvent {
                kind: err.error.kind.unwrap_or_else(|| "error".to_string()),
                message: err.error.message.unwrap_or_default(),
            }
        }
        _ => ProtocolEvent::Other { kind },
    };

    Ok(vec![event])
}

fn block_kind(kind: &str) -> BlockKind {
    match kind {
        "text" => BlockKind::Text,
        "thinking" | "redacted_thinking" => BlockKind::Thinking,
        "tool_use" | "server_tool_use" => BlockKind::ToolUse,
        other => BlockKind::Other(other.to_string()),
    }
}

fn snapshot_block(block: WireBlock) -> Option<SnapshotBlock> {
    match block_kind(&block.kind) {
        BlockKind::Text => Some(SnapshotBlock::Text(block.text.unwrap_or_default())),
        BlockKind::Thinking => Some(SnapshotBlock::Thinking(block.thinking.unwrap_or_default())),
        BlockKind::ToolUse => Some(SnapshotBlock::ToolUse {
            id: block.id.unwrap_or_default(),
            name: block.name.unwrap_or_default(),
            input: block.input.unwrap_or(Value::Object(Default::default())),
        }),
        BlockKind::Other(_) => None,
    }
}

/// Tools are listed as names, or as objects carrying a `name`.
fn tool_name(tool: &Value) -> Option<String> {
    match tool {
        Value::String(name) => Some(name.clone()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

/// Events carried by a `user` message: one per tool result, plus the echoed text.
fn user_events(content: Value) -> Vec<ProtocolEvent> {
    let blocks = match content {
        Value::String(text) => return vec![ProtocolEvent::UserEcho { text }],
        Value::Array(blocks) => blocks,
        _ => return Vec::new(),
    };

    let mut events = Vec::new();
    let mut echo = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_result") => {
                let raw = block.get("content").cloned().unwrap_or(Value::Null);
                events.push(ProtocolEvent::ToolResult {
                    tool_id: block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    content: display_content(&raw),
                    is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                    raw,
                });
            }
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    echo.push(text.to_string());
                }
            }
            _ => {}
        }
    }
    if !echo.is_empty() {
        events.push(ProtocolEvent::UserEcho {
            text: echo.join("\n"),
        });
    }
    events
}

/// Display text of a tool result, which is either a plain string or an array
/// of `{"type":"text","text":..}` blocks.
pub fn display_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one(text: &str) -> ProtocolEvent {
        let mut events = classify(text).unwrap();
        assert_eq!(events.len(), 1, "expected one event from {text}");
        events.remove(0)
    }

    #[test]
    fn test_text_delta() {
        let event =
            one(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#);
        assert_eq!(
            event,
            ProtocolEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::Text("Hello".into())
            }
        );
    }

    #[test]
    fn test_stream_event_envelope() {
        let event = one(
            r#"{"type":"stream_event","session_id":"s","event":{"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}}"#,
        );
        assert_eq!(
            event,
            ProtocolEvent::ContentBlockDelta {
                index: 2,
                delta: Delta::PartialJson("{\"a\"".into())
            }
        );
    }

    #[test]
    fn test_system_init() {
        let event = one(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-sonnet","tools":["Read","Bash",{"name":"mcp__x"}]}"#,
        );
        assert_eq!(
            event,
            ProtocolEvent::SessionInit {
                resume_id: "abc".into(),
                model: Some("claude-sonnet".into()),
                tools: vec!["Read".into(), "Bash".into(), "mcp__x".into()],
            }
        );

        let other = one(r#"{"type":"system","subtype":"compact_boundary","session_id":"abc"}"#);
        assert_eq!(
            other,
            ProtocolEvent::Other {
                kind: "system/compact_boundary".into()
            }
        );
    }

    #[test]
    fn test_message_start_usage() {
        let event = one(
            r#"{"type":"message_start","message":{"id":"m1","usage":{"input_tokens":10,"output_tokens":0}}}"#,
        );
        match event {
            ProtocolEvent::MessageStart {
                message_id,
                initial_usage,
            } => {
                assert_eq!(message_id.as_deref(), Some("m1"));
                assert_eq!(initial_usage.input_tokens, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tool_block_start() {
        let event = one(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"Read","input":{}}}"#,
        );
        match event {
            ProtocolEvent::ContentBlockStart {
                index,
                kind,
                tool_id,
                tool_name,
                initial_input,
                initial_text,
            } => {
                assert_eq!(index, 1);
                assert_eq!(kind, BlockKind::ToolUse);
                assert_eq!(tool_id.as_deref(), Some("toolu_1"));
                assert_eq!(tool_name.as_deref(), Some("Read"));
                assert_eq!(initial_input, Some(json!({})));
                assert_eq!(initial_text, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_signature_delta_is_other() {
        let event = one(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"xyz"}}"#,
        );
        assert_eq!(
            event,
            ProtocolEvent::Other {
                kind: "signature_delta".into()
            }
        );
    }

    #[test]
    fn test_user_tool_results() {
        let events = classify(
            r#"{"type":"user","message":{"role":"user","content":[
                {"type":"tool_result","tool_use_id":"t1","content":"ok"},
                {"type":"tool_result","tool_use_id":"t2","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"is_error":true}
            ]}}"#,
        )
        .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ProtocolEvent::ToolResult {
                tool_id: "t1".into(),
                content: "ok".into(),
                raw: json!("ok"),
                is_error: false,
            }
        );
        match &events[1] {
            ProtocolEvent::ToolResult {
                content, is_error, raw, ..
            } => {
                assert_eq!(content, "a\nb");
                assert!(is_error);
                assert!(raw.is_array());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_user_echo() {
        assert_eq!(
            one(r#"{"type":"user","message":{"content":"hello"}}"#),
            ProtocolEvent::UserEcho {
                text: "hello".into()
            }
        );
        assert_eq!(
            one(r#"{"type":"user","message":{"content":[{"type":"text","text":"hi"}]}}"#),
            ProtocolEvent::UserEcho { text: "hi".into() }
        );
    }

    #[test]
    fn test_result_success_and_error() {
        let ok = one(
            r#"{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.0123,"result":"done","session_id":"abc"}"#,
        );
        assert_eq!(
            ok,
            ProtocolEvent::TurnResult {
                status: TurnStatus::Success,
                cost_usd: Some(0.0123),
                error_text: None,
                resume_id: Some("abc".into()),
            }
        );

        let err = one(r#"{"type":"result","subtype":"error_max_turns","cost_usd":0.5}"#);
        assert_eq!(
            err,
            ProtocolEvent::TurnResult {
                status: TurnStatus::Error,
                cost_usd: Some(0.5),
                error_text: Some("error_max_turns".into()),
                resume_id: None,
            }
        );

        let flagged = one(r#"{"type":"result","subtype":"success","is_error":true,"result":"API Error: 529"}"#);
        match flagged {
            ProtocolEvent::TurnResult {
                status, error_text, ..
            } => {
                assert_eq!(status, TurnStatus::Error);
                assert_eq!(error_text.as_deref(), Some("API Error: 529"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_event() {
        assert_eq!(
            one(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            ProtocolEvent::ErrorEvent {
                kind: "overloaded_error".into(),
                message: "Overloaded".into()
            }
        );
    }

    #[test]
    fn test_assistant_snapshot() {
        let event = one(
            r#"{"type":"assistant","message":{"id":"m9","content":[
                {"type":"thinking","thinking":"hmm"},
                {"type":"text","text":"Hi"},
                {"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}},
                {"type":"image","source":{}}
            ],"usage":{"output_tokens":4}}}"#,
        );
        match event {
            ProtocolEvent::AssistantSnapshot {
                message_id,
                blocks,
                usage,
            } => {
                assert_eq!(message_id.as_deref(), Some("m9"));
                assert_eq!(blocks.len(), 3);
                assert_eq!(blocks[1], SnapshotBlock::Text("Hi".into()));
                assert_eq!(usage.map(|u| u.output_tokens), Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_other() {
        assert_eq!(one(r#"{"type":"ping"}"#), ProtocolEvent::Other { kind: "ping".into() });
    }

    #[test]
    fn test_ansi_retry() {
        let colored = "{\"type\":\"message_stop\"\x1b[0m}";
        assert_eq!(one(colored), ProtocolEvent::MessageStop { final_usage: None });
    }

    #[test]
    fn test_parse_failure_carries_both_errors() {
        let failure = classify(r#"{"type":"content_block_delta","delta":{}}"#).unwrap_err();
        assert!(failure.raw.contains("content_block_delta"));
        assert!(!failure.error.is_empty());
        assert!(!failure.retry_error.is_empty());

        let missing = classify(r#"{"index":0}"#).unwrap_err();
        assert!(missing.error.contains("type"));

        assert!(classify("{not json}").is_err());
    }

    #[test]
    fn test_display_content() {
        assert_eq!(display_content(&Value::Null), "");
        assert_eq!(display_content(&json!("x")), "x");
        assert_eq!(display_content(&json!([{"type":"image"}])), "");
        assert_eq!(display_content(&json!(42)), "42");
    }
}
