//! Conversation reconstruction
//!
//! Consumes classified [`StreamEvent`](crate::stream::StreamEvent)s and
//! maintains the ordered conversation model: session identity, message
//! segmentation, thinking accumulation, and pending-tool bookkeeping.
//! Exactly one reconstructor instance writes a session's state, so none of
//! it needs locking.

mod model;
mod plan;
mod reconstructor;

#[cfg(test)]
mod proptests;

pub use model::{
    ConversationSession, MessageSegment, Role, SegmentKind, ThinkingAccumulator, TokenTotals,
    ToolExecution, ToolStatus, TIMEOUT_RESULT_PLACEHOLDER,
};
pub use plan::{extract_plan, PlanScan};
pub use reconstructor::{Reconstructor, SegmentPolicy, TurnPhase};
