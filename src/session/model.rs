//! Conversation model types

use crate::stream::UsageDelta;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Fixed result attached to tool invocations the process left unresolved
pub const TIMEOUT_RESULT_PLACEHOLDER: &str =
    "[no result received before the turn ended]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Why a segment exists, for downstream presentation grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// First assistant text of the turn
    Intro,
    /// Empty anchor synthesized so a tool invocation has a segment to hang off
    ToolPreface,
    /// Text following a completed tool result
    ToolResponse,
    /// Any later text block in the same turn
    Continuation,
}

/// A contiguous unit of conversational content attributed to one role
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSegment {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub kind: SegmentKind,
    pub attached_tool_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageSegment {
    pub fn new(role: Role, content: impl Into<String>, kind: SegmentKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            kind,
            attached_tool_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Calling,
    Complete,
    Timeout,
    Error,
}

/// One tool invocation and its (eventual) resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecution {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
    pub parent_tool_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub is_error: bool,
}

impl ToolExecution {
    pub fn calling(id: String, name: String, input: Value, parent_tool_id: Option<String>) -> Self {
        Self {
            id,
            name,
            input,
            status: ToolStatus::Calling,
            parent_tool_id,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            is_error: false,
        }
    }

    pub fn resolve(&mut self, status: ToolStatus, result: String, is_error: bool) {
        self.status = status;
        self.result = Some(result);
        self.is_error = is_error;
        self.ended_at = Some(Utc::now());
    }
}

/// Running token totals for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub thinking_tokens: u64,
}

impl TokenTotals {
    pub fn absorb(&mut self, delta: &UsageDelta) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.cache_tokens += delta.cache_tokens;
        self.thinking_tokens += delta.thinking_tokens;
    }
}

/// Accumulated reasoning trace for the in-flight turn
#[derive(Debug, Clone)]
pub struct ThinkingAccumulator {
    pub text: String,
    pub started_at: Instant,
    /// Last line of the accumulated text, kept as a cheap headline
    pub last_line: String,
}

impl ThinkingAccumulator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            started_at: Instant::now(),
            last_line: String::new(),
        }
    }

    pub fn append(&mut self, delta: &str) {
        self.text.push_str(delta);
        self.last_line = self
            .text
            .rsplit('\n')
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default()
            .to_string();
    }
}

impl Default for ThinkingAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable conversation state, owned by one reconstructor
#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    /// Unset until the first init event of the session
    pub id: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub capability_servers: Vec<String>,
    pub segments: Vec<MessageSegment>,
    /// Always exactly the executions whose status is `Calling`
    pub pending_tool_ids: HashSet<String>,
    pub tool_executions: HashMap<String, ToolExecution>,
    pub thinking: Option<ThinkingAccumulator>,
    pub total_cost_usd: f64,
    pub totals: TokenTotals,
    /// Tool-result ids that referenced no known invocation
    pub orphan_result_ids: Vec<String>,
}

impl ConversationSession {
    pub fn segment_by_id(&self, id: &str) -> Option<&MessageSegment> {
        self.segments.iter().find(|s| s.id == id)
    }
}
