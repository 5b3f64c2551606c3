//! Incremental conversation reconstruction state machine

use super::model::{
    ConversationSession, MessageSegment, Role, SegmentKind, ThinkingAccumulator, ToolExecution,
    ToolStatus, TIMEOUT_RESULT_PLACEHOLDER,
};
use super::plan::extract_plan;
use crate::notify::{Notification, TurnOutcome};
use crate::stream::StreamEvent;

/// Per-turn phase of the reconstructor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    AwaitingInit,
    Streaming,
    Finalizing,
}

/// How text blocks map onto message segments.
///
/// The default reuses the first block's segment and starts a fresh segment
/// for every later block, keeping segments short and independently
/// renderable. Exposed as a policy rather than hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentPolicy {
    #[default]
    ReuseFirstBlock,
    NewSegmentPerBlock,
}

/// Single-writer state machine over one [`ConversationSession`].
///
/// Events must arrive in line-completion order; there is no internal
/// locking because there is only ever one writer.
#[derive(Debug, Default)]
pub struct Reconstructor {
    session: ConversationSession,
    phase: TurnPhase,
    policy: SegmentPolicy,
    /// Text blocks seen since the turn began
    text_blocks_seen: u32,
    /// Index of the first segment belonging to the current turn
    turn_segment_start: usize,
    /// Set when the previous event was a tool result, to pick segment kinds
    after_tool_result: bool,
    turn_complete_emitted: bool,
}

impl Reconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: SegmentPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Drop all session state. Used for an explicit new-session request.
    pub fn start_new_session(&mut self) {
        tracing::info!("resetting conversation session");
        self.session = ConversationSession::default();
        self.phase = TurnPhase::Idle;
        self.text_blocks_seen = 0;
        self.turn_segment_start = 0;
        self.after_tool_result = false;
        self.turn_complete_emitted = false;
    }

    /// Begin a turn with the user's message. The caller must have verified
    /// no other turn is live for this session.
    pub fn begin_turn(&mut self, user_text: &str) -> Vec<Notification> {
        debug_assert!(
            matches!(self.phase, TurnPhase::Idle),
            "turn started while previous one is live"
        );
        self.phase = TurnPhase::AwaitingInit;
        self.text_blocks_seen = 0;
        self.after_tool_result = false;
        self.turn_complete_emitted = false;

        let segment = MessageSegment::new(Role::User, user_text, SegmentKind::Intro);
        self.session.segments.push(segment.clone());
        self.turn_segment_start = self.session.segments.len();

        vec![
            Notification::Processing { active: true },
            Notification::MessageAdded { segment },
        ]
    }

    /// Feed one classified event through the state machine.
    pub fn handle_event(&mut self, event: StreamEvent) -> Vec<Notification> {
        match event {
            StreamEvent::SystemInit {
                model,
                session_id,
                tools,
                capability_servers,
            } => self.on_init(model, session_id, tools, capability_servers),
            StreamEvent::TextDelta { text } => self.on_text(&text),
            StreamEvent::ThinkingDelta { text } => self.on_thinking(&text),
            StreamEvent::ToolInvocation {
                id,
                name,
                input,
                parent_id,
            } => self.on_tool_invocation(id, name, input, parent_id),
            StreamEvent::ToolResult {
                id,
                result,
                is_error,
            } => self.on_tool_result(&id, result, is_error),
            StreamEvent::UsageUpdate { usage } => {
                self.session.totals.absorb(&usage);
                vec![Notification::TokenUsage {
                    totals: self.session.totals,
                }]
            }
            StreamEvent::ResultFinal {
                cost_usd,
                duration_ms: _,
                is_error,
                subtype,
            } => self.on_result_final(cost_usd, is_error, &subtype),
            StreamEvent::Unknown { raw } => {
                tracing::debug!(%raw, "ignoring unknown stream event");
                vec![]
            }
        }
    }

    /// Tear a turn down on a terminal path the stream itself did not
    /// announce: process exit, watchdog expiry, or abort.
    ///
    /// Still-pending tool invocations are finalized as synthetic timeouts
    /// so nothing is left observably unresolved, and the single
    /// turn-complete for the turn is emitted if the stream never delivered
    /// a final result.
    pub fn finish_turn(&mut self, outcome: TurnOutcome) -> Vec<Notification> {
        let mut notes = Vec::new();

        let mut pending: Vec<String> = self.session.pending_tool_ids.drain().collect();
        pending.sort_unstable();
        for id in pending {
            if let Some(execution) = self.session.tool_executions.get_mut(&id) {
                execution.resolve(
                    ToolStatus::Timeout,
                    TIMEOUT_RESULT_PLACEHOLDER.to_string(),
                    false,
                );
                tracing::warn!(tool_id = %id, "tool left pending at turn end, synthesizing timeout");
                notes.push(Notification::ToolResult {
                    execution: execution.clone(),
                });
            }
        }

        notes.extend(self.flush_thinking());

        if !self.turn_complete_emitted {
            self.turn_complete_emitted = true;
            notes.push(Notification::TurnComplete { outcome });
        }
        notes.push(Notification::Processing { active: false });
        self.phase = TurnPhase::Idle;
        notes
    }

    fn on_init(
        &mut self,
        model: String,
        session_id: String,
        tools: Vec<String>,
        capability_servers: Vec<String>,
    ) -> Vec<Notification> {
        match &self.session.id {
            None => {
                tracing::info!(session_id = %session_id, model = %model, "session initialized");
                self.session.id = Some(session_id);
            }
            Some(existing) if *existing != session_id => {
                // Anomaly: report, keep the original id
                tracing::warn!(
                    existing = %existing,
                    received = %session_id,
                    "init carried a different session id"
                );
            }
            Some(_) => {}
        }
        self.session.model = Some(model);
        self.session.tools = tools;
        self.session.capability_servers = capability_servers;
        self.phase = TurnPhase::Streaming;
        vec![]
    }

    fn on_text(&mut self, text: &str) -> Vec<Notification> {
        self.phase = TurnPhase::Streaming;
        let mut notes = Vec::new();

        let scan = extract_plan(text);
        if let Some(plan) = scan.plan {
            notes.push(Notification::PlanProposal { plan });
        }
        if scan.text.trim().is_empty() {
            return notes;
        }

        let reuse_current = self.text_blocks_seen == 0
            && self.policy == SegmentPolicy::ReuseFirstBlock
            && self.current_segment().is_some();
        self.text_blocks_seen += 1;

        if reuse_current {
            if let Some(segment) = self.current_segment_mut() {
                segment.content = scan.text;
                notes.push(Notification::MessageUpdated {
                    segment: segment.clone(),
                });
            }
        } else {
            let kind = self.next_segment_kind();
            let segment = MessageSegment::new(Role::Assistant, scan.text, kind);
            self.session.segments.push(segment.clone());
            notes.push(Notification::MessageAdded { segment });
        }
        self.after_tool_result = false;
        notes
    }

    fn next_segment_kind(&self) -> SegmentKind {
        if self.current_segment().is_none() {
            SegmentKind::Intro
        } else if self.after_tool_result {
            SegmentKind::ToolResponse
        } else {
            SegmentKind::Continuation
        }
    }

    fn on_thinking(&mut self, delta: &str) -> Vec<Notification> {
        self.phase = TurnPhase::Streaming;
        let acc = self
            .session
            .thinking
            .get_or_insert_with(ThinkingAccumulator::new);
        acc.append(delta);
        // Forward only the delta; re-sending the growing buffer would make
        // every update cost as much as the whole trace so far.
        vec![Notification::ThinkingUpdate {
            content: delta.to_string(),
            is_active: true,
            is_incremental: true,
            duration_ms: None,
        }]
    }

    fn on_tool_invocation(
        &mut self,
        id: String,
        name: String,
        input: serde_json::Value,
        parent_id: Option<String>,
    ) -> Vec<Notification> {
        self.phase = TurnPhase::Streaming;
        let mut notes = Vec::new();

        let execution = ToolExecution::calling(id.clone(), name, input, parent_id);
        self.session.pending_tool_ids.insert(id.clone());
        self.session
            .tool_executions
            .insert(id.clone(), execution.clone());

        // Attach to the most recently active segment of the turn,
        // synthesizing an empty anchor when no text has arrived yet.
        if self.current_segment().is_none() {
            let anchor = MessageSegment::new(Role::Assistant, "", SegmentKind::ToolPreface);
            self.session.segments.push(anchor.clone());
            notes.push(Notification::MessageAdded { segment: anchor });
        }
        if let Some(segment) = self.current_segment_mut() {
            segment.attached_tool_ids.push(id);
            notes.push(Notification::MessageUpdated {
                segment: segment.clone(),
            });
        }

        notes.push(Notification::ToolUse { execution });
        notes
    }

    fn on_tool_result(&mut self, id: &str, result: String, is_error: bool) -> Vec<Notification> {
        self.phase = TurnPhase::Streaming;
        if !self.session.pending_tool_ids.remove(id) {
            tracing::warn!(tool_id = %id, "result references no pending invocation");
            self.session.orphan_result_ids.push(id.to_string());
            return vec![];
        }
        self.after_tool_result = true;

        let Some(execution) = self.session.tool_executions.get_mut(id) else {
            // pending_tool_ids and tool_executions are kept in lockstep
            return vec![];
        };
        let status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Complete
        };
        execution.resolve(status, result, is_error);
        vec![Notification::ToolResult {
            execution: execution.clone(),
        }]
    }

    fn on_result_final(&mut self, cost_usd: f64, is_error: bool, subtype: &str) -> Vec<Notification> {
        self.phase = TurnPhase::Finalizing;
        tracing::info!(cost_usd, is_error, subtype, "turn result received");

        let mut notes = self.flush_thinking();
        self.session.total_cost_usd += cost_usd;

        if !self.turn_complete_emitted {
            self.turn_complete_emitted = true;
            let outcome = if is_error {
                TurnOutcome::Failure
            } else {
                TurnOutcome::Success
            };
            notes.push(Notification::TurnComplete { outcome });
        }
        self.phase = TurnPhase::Idle;
        notes
    }

    /// Emit the one finalization update carrying the full accumulated
    /// trace plus elapsed duration, then reset the accumulator.
    fn flush_thinking(&mut self) -> Vec<Notification> {
        let Some(acc) = self.session.thinking.take() else {
            return vec![];
        };
        let elapsed = acc.started_at.elapsed();
        vec![Notification::ThinkingUpdate {
            content: acc.text,
            is_active: false,
            is_incremental: false,
            duration_ms: Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
        }]
    }

    /// Most recent assistant segment belonging to the current turn
    fn current_segment(&self) -> Option<&MessageSegment> {
        self.session
            .segments
            .get(self.turn_segment_start..)?
            .iter()
            .rev()
            .find(|s| s.role == Role::Assistant)
    }

    fn current_segment_mut(&mut self) -> Option<&mut MessageSegment> {
        let start = self.turn_segment_start;
        self.session
            .segments
            .get_mut(start..)?
            .iter_mut()
            .rev()
            .find(|s| s.role == Role::Assistant)
    }
}
