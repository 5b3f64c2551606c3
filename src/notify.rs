//! Output notification surface
//!
//! Everything downstream collaborators (presentation, the two state
//! holders) learn about a conversation arrives as one of these.

use crate::session::{MessageSegment, TokenTotals, ToolExecution};
use serde::Serialize;
use serde_json::Value;

/// How a turn ended. Exactly one `TurnComplete` carries this per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Success,
    Failure,
    Aborted,
}

/// One reconstructed delta, fanned out to the state holders
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    MessageAdded {
        segment: MessageSegment,
    },
    MessageUpdated {
        segment: MessageSegment,
    },
    ThinkingUpdate {
        content: String,
        is_active: bool,
        /// Incremental updates carry only the delta, not the growing buffer
        is_incremental: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    PlanProposal {
        plan: Value,
    },
    ToolUse {
        execution: ToolExecution,
    },
    ToolResult {
        execution: ToolExecution,
    },
    TokenUsage {
        totals: TokenTotals,
    },
    TurnComplete {
        outcome: TurnOutcome,
    },
    Processing {
        active: bool,
    },
    ErrorShown {
        message: String,
    },
}

impl Notification {
    /// Notifications that must flush any debounced batch immediately
    pub fn is_terminal(&self) -> bool {
        match self {
            Notification::TurnComplete { .. } | Notification::ErrorShown { .. } => true,
            Notification::ThinkingUpdate { is_active, .. } => !is_active,
            _ => false,
        }
    }
}
