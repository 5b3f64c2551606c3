//! Session orchestration
//!
//! Ties the pieces together for one conversation: the supervisor runs the
//! agent process, classified events flow through the reconstructor and the
//! tool tracker, and the resulting notifications are debounced and
//! projected into both state stores through the bridge. The service is
//! the single writer over all of that state; queries and control calls
//! arrive from other tasks but never mutate mid-turn state directly.

use crate::notify::{Notification, TurnOutcome};
use crate::session::{
    ConversationSession, Reconstructor, SegmentPolicy, ToolStatus, TIMEOUT_RESULT_PLACEHOLDER,
};
use crate::stream::StreamEvent;
use crate::supervisor::{
    AgentCommand, ExitClass, SupervisorError, TurnExit, TurnOptions, TurnSupervisor,
};
use crate::sync::{DebouncePolicy, Debouncer, StateBridge, StateSink};
use crate::tracker::ToolTracker;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Events buffered between the supervisor's read loop and the service
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How many trailing stderr characters ride along with an error message
const STDERR_TAIL: usize = 500;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("a turn is already in progress")]
    Busy,
    #[error("turn task failed: {0}")]
    Internal(String),
}

/// Control surface for one conversation session.
pub struct ConversationService {
    supervisor: Arc<TurnSupervisor>,
    bridge: StateBridge,
    debounce_policy: DebouncePolicy,
    state: Mutex<ServiceState>,
}

struct ServiceState {
    reconstructor: Reconstructor,
    tracker: ToolTracker,
}

impl ConversationService {
    pub fn new(command: AgentCommand, primary: Arc<dyn StateSink>, mirror: Arc<dyn StateSink>) -> Self {
        Self::with_policy(command, primary, mirror, SegmentPolicy::default())
    }

    pub fn with_policy(
        command: AgentCommand,
        primary: Arc<dyn StateSink>,
        mirror: Arc<dyn StateSink>,
        policy: SegmentPolicy,
    ) -> Self {
        Self {
            supervisor: Arc::new(TurnSupervisor::new(command)),
            bridge: StateBridge::new(primary, mirror),
            debounce_policy: DebouncePolicy::default(),
            state: Mutex::new(ServiceState {
                reconstructor: Reconstructor::with_policy(policy),
                tracker: ToolTracker::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Snapshot the current conversation. Blocks only between turns or
    /// between events, never mid-event.
    pub async fn session(&self) -> ConversationSession {
        self.state.lock().await.reconstructor.session().clone()
    }

    /// Abort the live turn, if any. Safe to call repeatedly.
    pub fn stop_request(&self) {
        self.supervisor.request_stop();
    }

    /// Answer a pending tool permission prompt over the process's stdin.
    /// Returns false when no turn is live to receive it.
    pub async fn permission_response(&self, tool_id: &str, approved: bool) -> bool {
        let line = json!({
            "type": "permission_response",
            "tool_use_id": tool_id,
            "behavior": if approved { "allow" } else { "deny" },
        })
        .to_string();
        self.supervisor.send_control(&line).await
    }

    /// Discard the current session so the next turn starts fresh.
    pub async fn start_new_session(&self) -> Result<(), ServiceError> {
        if self.supervisor.is_running() {
            return Err(ServiceError::Busy);
        }
        let mut state = self.state.lock().await;
        if let Some(id) = state.reconstructor.session().id.clone() {
            state.tracker.end_session(&id);
        }
        state.reconstructor.start_new_session();
        Ok(())
    }

    /// Run one full turn: spawn the agent with the prompt, stream events
    /// through reconstruction and tracking, and project every resulting
    /// notification. Returns how the turn ended.
    ///
    /// The session state lock is held for the whole turn; that is the
    /// single-writer discipline, not an accident.
    pub async fn send_message(
        &self,
        text: &str,
        mut options: TurnOptions,
    ) -> Result<TurnOutcome, ServiceError> {
        if self.supervisor.is_running() {
            return Err(ServiceError::Busy);
        }
        let mut state = self.state.lock().await;

        // Continue the established session unless the caller overrode it
        if options.resume_session.is_none() {
            options.resume_session = state.reconstructor.session().id.clone();
        }

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let turn = {
            let supervisor = Arc::clone(&self.supervisor);
            let prompt = text.to_string();
            let options = options.clone();
            tokio::spawn(async move { supervisor.run_turn(&prompt, &options, tx).await })
        };

        let mut debouncer = Debouncer::new(self.debounce_policy);
        for note in state.reconstructor.begin_turn(text) {
            self.dispatch(&mut debouncer, note).await;
        }

        loop {
            let deadline = debouncer
                .deadline()
                .map(tokio::time::Instant::from_std);
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        let session_id = state.reconstructor.session().id.clone();
                        Self::track(&mut state.tracker, &event, session_id.as_deref());
                        for note in state.reconstructor.handle_event(event) {
                            self.dispatch(&mut debouncer, note).await;
                        }
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(
                    deadline.unwrap_or_else(tokio::time::Instant::now)
                ), if deadline.is_some() => {
                    if let Some(batch) = debouncer.flush_due(std::time::Instant::now()) {
                        self.project(&batch).await;
                    }
                }
            }
        }

        let exit = turn
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let outcome = self
            .resolve_exit(&mut debouncer, exit)
            .await;

        // Anything the stream left pending times out in the tracker too,
        // mirroring the reconstructor's synthetic results
        let pending: Vec<String> = state
            .reconstructor
            .session()
            .pending_tool_ids
            .iter()
            .cloned()
            .collect();
        for id in pending {
            state
                .tracker
                .complete_execution(&id, TIMEOUT_RESULT_PLACEHOLDER, false, ToolStatus::Timeout);
        }

        for note in state.reconstructor.finish_turn(outcome) {
            self.dispatch(&mut debouncer, note).await;
        }
        let rest = debouncer.flush_all();
        self.project(&rest).await;

        Ok(outcome)
    }

    /// Map the process's end into a turn outcome, surfacing remediation
    /// for error exits.
    async fn resolve_exit(
        &self,
        debouncer: &mut Debouncer,
        exit: Result<TurnExit, SupervisorError>,
    ) -> TurnOutcome {
        match exit {
            Ok(exit) => match exit.class {
                ExitClass::Success => TurnOutcome::Success,
                ExitClass::Aborted => TurnOutcome::Aborted,
                class => {
                    let mut message = class
                        .remediation()
                        .unwrap_or("The agent process failed.")
                        .to_string();
                    let tail = stderr_tail(&exit.stderr);
                    if !tail.is_empty() {
                        message.push_str("\n\n");
                        message.push_str(tail);
                    }
                    self.dispatch(debouncer, Notification::ErrorShown { message })
                        .await;
                    TurnOutcome::Failure
                }
            },
            Err(SupervisorError::Watchdog(timeout)) => {
                let message = format!(
                    "The agent produced no output for {} seconds and was terminated.",
                    timeout.as_secs()
                );
                self.dispatch(debouncer, Notification::ErrorShown { message })
                    .await;
                TurnOutcome::Failure
            }
            Err(e) => {
                self.dispatch(
                    debouncer,
                    Notification::ErrorShown {
                        message: e.to_string(),
                    },
                )
                .await;
                TurnOutcome::Failure
            }
        }
    }

    fn track(tracker: &mut ToolTracker, event: &StreamEvent, session_id: Option<&str>) {
        match event {
            StreamEvent::ToolInvocation {
                id,
                name,
                input,
                parent_id,
            } => {
                tracker.start_execution(id, name, input.clone(), session_id, parent_id.as_deref());
            }
            StreamEvent::ToolResult {
                id,
                result,
                is_error,
            } => {
                let status = if *is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Complete
                };
                tracker.complete_execution(id, result, *is_error, status);
            }
            _ => {}
        }
    }

    async fn dispatch(&self, debouncer: &mut Debouncer, note: Notification) {
        if let Some(batch) = debouncer.offer(note, std::time::Instant::now()) {
            self.project(&batch).await;
        }
    }

    async fn project(&self, batch: &[Notification]) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.bridge.broadcast(batch).await {
            tracing::warn!(error = %e, count = batch.len(), "dropping unprojected batch");
        }
    }
}

/// Last `STDERR_TAIL` characters on a char boundary
fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    let mut start = trimmed.len().saturating_sub(STDERR_TAIL);
    while start > 0 && !trimmed.is_char_boundary(start) {
        start -= 1;
    }
    trimmed.get(start..).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SinkError;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct CollectingSink {
        notes: AsyncMutex<Vec<Notification>>,
    }

    impl CollectingSink {
        async fn take(&self) -> Vec<Notification> {
            std::mem::take(&mut *self.notes.lock().await)
        }
    }

    #[async_trait]
    impl StateSink for CollectingSink {
        async fn apply(&self, batch: &[Notification]) -> Result<(), SinkError> {
            self.notes.lock().await.extend_from_slice(batch);
            Ok(())
        }
    }

    fn script_service(body: &str) -> (tempfile::TempDir, ConversationService, Arc<CollectingSink>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let command = AgentCommand::new(path.to_string_lossy().to_string())
            .with_idle_timeout(Duration::from_secs(10));
        let primary = Arc::new(CollectingSink::default());
        let mirror = Arc::new(CollectingSink::default());
        let service = ConversationService::new(command, primary.clone(), mirror);
        (dir, service, primary)
    }

    fn turn_script() -> String {
        [
            r#"{"type":"system","subtype":"init","session_id":"s1","model":"m"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Done."}],"usage":{"input_tokens":10,"output_tokens":5}}}"#,
            r#"{"type":"result","subtype":"success","total_cost_usd":0.02,"duration_ms":900}"#,
        ]
        .iter()
        .map(|line| format!("printf '%s\\n' '{line}'"))
        .collect::<Vec<_>>()
        .join("\n")
    }

    #[tokio::test]
    async fn full_turn_projects_the_whole_notification_sequence() {
        let (_dir, service, sink) = script_service(&turn_script());

        let outcome = service
            .send_message("hello", TurnOptions::default())
            .await
            .expect("turn runs");
        assert_eq!(outcome, TurnOutcome::Success);

        let notes = sink.take().await;
        assert!(matches!(notes.first(), Some(Notification::Processing { active: true })));
        assert!(notes.iter().any(|n| matches!(n,
            Notification::MessageAdded { segment } if segment.content == "hello")));
        assert!(notes.iter().any(|n| matches!(n,
            Notification::MessageAdded { segment } | Notification::MessageUpdated { segment }
                if segment.content == "Done.")));
        assert!(notes.iter().any(|n| matches!(n,
            Notification::TokenUsage { totals } if totals.input_tokens == 10)));

        let complete: Vec<_> = notes
            .iter()
            .filter(|n| matches!(n, Notification::TurnComplete { .. }))
            .collect();
        assert_eq!(complete.len(), 1);
        assert!(matches!(notes.last(), Some(Notification::Processing { active: false })));

        let session = service.session().await;
        assert_eq!(session.id.as_deref(), Some("s1"));
        assert!((session.total_cost_usd - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn turns_are_rejected_while_one_is_live() {
        let (_dir, service, _sink) = script_service("sleep 30");
        let service = Arc::new(service);

        let running = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.send_message("go", TurnOptions::default()).await })
        };
        while !service.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = service
            .send_message("again", TurnOptions::default())
            .await
            .expect_err("busy");
        assert!(matches!(err, ServiceError::Busy));
        let err = service.start_new_session().await.expect_err("busy");
        assert!(matches!(err, ServiceError::Busy));

        service.stop_request();
        let outcome = running.await.expect("join").expect("turn finishes");
        assert_eq!(outcome, TurnOutcome::Aborted);
    }

    #[tokio::test]
    async fn aborted_turn_completes_without_an_error() {
        let (_dir, service, sink) = script_service("sleep 30");
        let service = Arc::new(service);

        let running = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.send_message("go", TurnOptions::default()).await })
        };
        while !service.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.stop_request();
        service.stop_request(); // idempotent

        let outcome = running.await.expect("join").expect("turn finishes");
        assert_eq!(outcome, TurnOutcome::Aborted);

        let notes = sink.take().await;
        assert!(notes.iter().all(|n| !matches!(n, Notification::ErrorShown { .. })));
        assert!(notes.iter().any(|n| matches!(n,
            Notification::TurnComplete { outcome: TurnOutcome::Aborted })));
    }

    #[tokio::test]
    async fn auth_failure_surfaces_remediation_and_stderr() {
        let (_dir, service, sink) =
            script_service("echo 'You are not logged in' >&2\nexit 1");

        let outcome = service
            .send_message("go", TurnOptions::default())
            .await
            .expect("turn runs");
        assert_eq!(outcome, TurnOutcome::Failure);

        let notes = sink.take().await;
        let error = notes.iter().find_map(|n| match n {
            Notification::ErrorShown { message } => Some(message),
            _ => None,
        });
        let message = error.expect("error surfaced");
        assert!(message.contains("login flow"));
        assert!(message.contains("not logged in"));
        assert!(notes.iter().any(|n| matches!(n,
            Notification::TurnComplete { outcome: TurnOutcome::Failure })));
    }

    #[tokio::test]
    async fn dangling_tool_gets_a_synthetic_timeout() {
        let script = [
            r#"{"type":"system","subtype":"init","session_id":"s1","model":"m"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"read_file","input":{}}]}}"#,
        ]
        .iter()
        .map(|line| format!("printf '%s\\n' '{line}'"))
        .collect::<Vec<_>>()
        .join("\n");
        let (_dir, service, sink) = script_service(&script);

        let outcome = service
            .send_message("go", TurnOptions::default())
            .await
            .expect("turn runs");
        assert_eq!(outcome, TurnOutcome::Success);

        let notes = sink.take().await;
        let timeout = notes.iter().find_map(|n| match n {
            Notification::ToolResult { execution } if execution.id == "t1" => Some(execution),
            _ => None,
        });
        let execution = timeout.expect("synthetic result emitted");
        assert_eq!(execution.status, ToolStatus::Timeout);
        assert_eq!(
            execution.result.as_deref(),
            Some(TIMEOUT_RESULT_PLACEHOLDER)
        );

        // The tracker agrees with the reconstructor
        let state = service.state.lock().await;
        let stats = state.tracker.stats_for("read_file").expect("tracked");
        assert_eq!(stats.timeouts, 1);
        assert_eq!(state.reconstructor.session().pending_tool_ids.len(), 0);
    }

    #[tokio::test]
    async fn second_turn_resumes_the_established_session() {
        let (_dir, service, _sink) = script_service(&turn_script());

        service
            .send_message("first", TurnOptions::default())
            .await
            .expect("turn one");
        assert_eq!(service.session().await.id.as_deref(), Some("s1"));

        service
            .send_message("second", TurnOptions::default())
            .await
            .expect("turn two");

        // Both user messages live in the same session transcript
        let session = service.session().await;
        let user_count = session
            .segments
            .iter()
            .filter(|s| s.role == crate::session::Role::User)
            .count();
        assert_eq!(user_count, 2);
    }

    #[tokio::test]
    async fn new_session_clears_the_transcript() {
        let (_dir, service, _sink) = script_service(&turn_script());

        service
            .send_message("first", TurnOptions::default())
            .await
            .expect("turn");
        service.start_new_session().await.expect("reset");

        let session = service.session().await;
        assert!(session.id.is_none());
        assert!(session.segments.is_empty());
    }

    #[tokio::test]
    async fn permission_response_without_a_turn_reports_no_channel() {
        let (_dir, service, _sink) = script_service(&turn_script());
        assert!(!service.permission_response("t1", true).await);
    }

    #[test]
    fn stderr_tail_respects_char_boundaries() {
        let long = format!("{}é", "x".repeat(STDERR_TAIL));
        let tail = stderr_tail(&long);
        assert!(tail.len() <= STDERR_TAIL + 2);
        assert!(tail.ends_with('é'));
    }
}
