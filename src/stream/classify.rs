//! JSON object to typed stream event classification

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A malformed line. Local to that line - the stream keeps going.
#[derive(Debug, Error)]
#[error("malformed stream line: {message}")]
pub struct ParseError {
    pub message: String,
}

/// Token usage reported by one assistant message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UsageDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub thinking_tokens: u64,
}

/// One typed event decoded from the agent's stream-json output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    SystemInit {
        model: String,
        session_id: String,
        tools: Vec<String>,
        capability_servers: Vec<String>,
    },
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolInvocation {
        id: String,
        name: String,
        input: Value,
        parent_id: Option<String>,
    },
    ToolResult {
        id: String,
        result: String,
        is_error: bool,
    },
    UsageUpdate {
        usage: UsageDelta,
    },
    ResultFinal {
        cost_usd: f64,
        duration_ms: u64,
        is_error: bool,
        subtype: String,
    },
    /// Forward-compatible fallback for shapes this version does not know
    Unknown {
        raw: Value,
    },
}

/// Classify one complete frame into its ordered list of events.
///
/// An object with a single semantic payload yields exactly one event; an
/// assistant message expands to one event per content block plus a usage
/// update when the message carries one. Shapes that do not match anything
/// known come back as [`StreamEvent::Unknown`] - never dropped, never a
/// panic.
pub fn classify_line(line: &str) -> Result<Vec<StreamEvent>, ParseError> {
    let value: Value = serde_json::from_str(line).map_err(|e| ParseError {
        message: e.to_string(),
    })?;
    Ok(classify_value(value))
}

fn classify_value(value: Value) -> Vec<StreamEvent> {
    match value.get("type").and_then(Value::as_str) {
        Some("system") => classify_system(value),
        Some("assistant") => classify_assistant(&value),
        Some("user") => classify_user(&value),
        Some("result") => vec![classify_result(&value)],
        other => {
            tracing::debug!(event_type = ?other, "unknown stream event shape");
            vec![StreamEvent::Unknown { raw: value }]
        }
    }
}

fn classify_system(value: Value) -> Vec<StreamEvent> {
    if value.get("subtype").and_then(Value::as_str) != Some("init") {
        tracing::debug!("unknown system subtype");
        return vec![StreamEvent::Unknown { raw: value }];
    }

    let tools = value
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(name_of).collect())
        .unwrap_or_default();
    let capability_servers = value
        .get("mcp_servers")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(name_of).collect())
        .unwrap_or_default();

    vec![StreamEvent::SystemInit {
        model: string_field(&value, "model"),
        session_id: string_field(&value, "session_id"),
        tools,
        capability_servers,
    }]
}

fn classify_assistant(value: &Value) -> Vec<StreamEvent> {
    let message = &value["message"];
    let mut events = Vec::new();

    if let Some(blocks) = message.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => events.push(StreamEvent::TextDelta {
                    text: string_field(block, "text"),
                }),
                Some("thinking") => {
                    // Some CLI versions key the trace "thinking", some "text"
                    let text = block
                        .get("thinking")
                        .or_else(|| block.get("text"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    events.push(StreamEvent::ThinkingDelta { text });
                }
                Some("tool_use") => events.push(StreamEvent::ToolInvocation {
                    id: string_field(block, "id"),
                    name: string_field(block, "name"),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                    parent_id: value
                        .get("parent_tool_use_id")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                }),
                other => {
                    tracing::debug!(block_type = ?other, "unknown assistant content block");
                }
            }
        }
    }

    if let Some(usage) = message.get("usage").filter(|u| u.is_object()) {
        events.push(StreamEvent::UsageUpdate {
            usage: usage_from(usage),
        });
    }

    if events.is_empty() {
        tracing::debug!("assistant event carried no recognizable content");
        events.push(StreamEvent::Unknown { raw: value.clone() });
    }
    events
}

fn classify_user(value: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(blocks) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                let result = block
                    .get("content")
                    .or_else(|| block.get("text"))
                    .or_else(|| block.get("output"))
                    .map(flatten_result)
                    .unwrap_or_default();
                events.push(StreamEvent::ToolResult {
                    id: string_field(block, "tool_use_id"),
                    result,
                    is_error: block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                });
            }
        }
    }
    if events.is_empty() {
        tracing::debug!("user event carried no tool results");
        events.push(StreamEvent::Unknown { raw: value.clone() });
    }
    events
}

fn classify_result(value: &Value) -> StreamEvent {
    StreamEvent::ResultFinal {
        cost_usd: value
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        duration_ms: value
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        subtype: string_field(value, "subtype"),
    }
}

/// Tool results arrive either as a bare string or as an array of
/// `{"type":"text","text":...}` parts; flatten both to plain text.
fn flatten_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => part.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn name_of(entry: &Value) -> Option<String> {
    match entry {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => entry
            .get("name")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        _ => None,
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn usage_from(usage: &Value) -> UsageDelta {
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    UsageDelta {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_tokens: field("cache_read_input_tokens") + field("cache_creation_input_tokens"),
        thinking_tokens: field("thinking_tokens"),
    }
}
