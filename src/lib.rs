//! Conversation reconstruction core for line-delimited JSON agent streams.
//!
//! A host application hands [`ConversationService`](service::ConversationService)
//! a user message; the service spawns the external CLI agent, decodes its
//! stream-json stdout chunk by chunk, rebuilds the conversation
//! incrementally, and projects the resulting notifications into two state
//! stores without feedback loops.
//!
//! The layers, bottom up:
//!
//! - [`stream`]: chunk-boundary-invariant line framing and event
//!   classification. Pure; no IO.
//! - [`session`]: the single-writer reconstruction state machine over one
//!   conversation.
//! - [`notify`]: the notification surface everything downstream consumes.
//! - [`tracker`]: tool-execution lifecycle analytics.
//! - [`supervisor`]: the agent subprocess, its watchdog, and cancellation.
//! - [`sync`]: debouncing and dual-store projection.
//! - [`service`]: the orchestration facade tying the above together.

pub mod notify;
pub mod service;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod sync;
pub mod tracker;

pub use notify::{Notification, TurnOutcome};
pub use service::{ConversationService, ServiceError};
pub use session::{ConversationSession, MessageSegment, SegmentPolicy, ToolExecution};
pub use stream::StreamEvent;
pub use supervisor::{AgentCommand, ExitClass, TurnOptions, TurnSupervisor};
pub use sync::{StateBridge, StateSink};
