//! Tool-invocation lifecycle analytics
//!
//! Cross-cutting bookkeeping over tool executions, independent of how the
//! conversation is presented: a bounded completed-history ring, per-name
//! aggregate statistics with a running average, and per-session rollups.

use crate::session::ToolStatus;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Completed-history ring: trimmed back to [`COMPLETED_TRIM`] once it
/// grows past this.
pub const COMPLETED_CAP: usize = 1000;
pub const COMPLETED_TRIM: usize = 500;

/// An execution we have seen start but not finish
#[derive(Debug, Clone)]
struct ActiveExecution {
    name: String,
    #[allow(dead_code)] // Kept for post-hoc inspection of stuck tools
    input: Value,
    session_id: Option<String>,
    parent_id: Option<String>,
    started_at: Instant,
}

/// One finished execution, as retained in the history ring
#[derive(Debug, Clone)]
pub struct CompletedExecution {
    pub id: String,
    pub name: String,
    pub session_id: Option<String>,
    pub parent_id: Option<String>,
    pub duration: Duration,
    pub status: ToolStatus,
    pub is_error: bool,
    pub result: String,
}

/// Aggregate statistics for one tool name
#[derive(Debug, Clone, Default)]
pub struct ToolNameStats {
    pub executions: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl ToolNameStats {
    /// Percentage of executions that completed without error
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.successes as f64 / self.executions as f64 * 100.0
        }
    }

    fn record(&mut self, duration: Duration, status: ToolStatus, is_error: bool) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.executions += 1;
        #[allow(clippy::cast_precision_loss)]
        {
            // avg' = (avg * (n - 1) + d) / n
            let n = self.executions as f64;
            self.avg_duration_ms = (self.avg_duration_ms * (n - 1.0) + ms as f64) / n;
        }
        if self.executions == 1 {
            self.min_duration_ms = ms;
            self.max_duration_ms = ms;
        } else {
            self.min_duration_ms = self.min_duration_ms.min(ms);
            self.max_duration_ms = self.max_duration_ms.max(ms);
        }
        match status {
            ToolStatus::Timeout => self.timeouts += 1,
            _ if is_error => self.failures += 1,
            _ => self.successes += 1,
        }
    }
}

/// Per-session rollup, auto-created on first tool use
#[derive(Debug, Clone)]
pub struct SessionToolStats {
    pub session_id: String,
    pub tool_names: HashSet<String>,
    pub executions: u64,
    started_at: Instant,
    pub duration: Option<Duration>,
}

impl SessionToolStats {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            tool_names: HashSet::new(),
            executions: 0,
            started_at: Instant::now(),
            duration: None,
        }
    }
}

/// Tracker over the tool-invocation lifecycle
#[derive(Debug, Default)]
pub struct ToolTracker {
    active: HashMap<String, ActiveExecution>,
    completed: VecDeque<CompletedExecution>,
    by_name: HashMap<String, ToolNameStats>,
    sessions: HashMap<String, SessionToolStats>,
}

impl ToolTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an invocation entering flight.
    pub fn start_execution(
        &mut self,
        id: &str,
        name: &str,
        input: Value,
        session_id: Option<&str>,
        parent_id: Option<&str>,
    ) {
        if let Some(sid) = session_id {
            let session = self
                .sessions
                .entry(sid.to_string())
                .or_insert_with(|| SessionToolStats::new(sid.to_string()));
            session.tool_names.insert(name.to_string());
            session.executions += 1;
        }
        self.active.insert(
            id.to_string(),
            ActiveExecution {
                name: name.to_string(),
                input,
                session_id: session_id.map(ToString::to_string),
                parent_id: parent_id.map(ToString::to_string),
                started_at: Instant::now(),
            },
        );
    }

    /// Move an execution to the completed ring and fold it into the
    /// per-name statistics. Unknown ids are logged and ignored.
    pub fn complete_execution(
        &mut self,
        id: &str,
        result: &str,
        is_error: bool,
        status: ToolStatus,
    ) -> Option<&CompletedExecution> {
        let Some(active) = self.active.remove(id) else {
            tracing::warn!(tool_id = %id, "completion for untracked execution");
            return None;
        };
        let duration = active.started_at.elapsed();

        self.by_name
            .entry(active.name.clone())
            .or_default()
            .record(duration, status, is_error);

        self.completed.push_back(CompletedExecution {
            id: id.to_string(),
            name: active.name,
            session_id: active.session_id,
            parent_id: active.parent_id,
            duration,
            status,
            is_error,
            result: result.to_string(),
        });
        if self.completed.len() > COMPLETED_CAP {
            let excess = self.completed.len() - COMPLETED_TRIM;
            self.completed.drain(..excess);
        }
        self.completed.back()
    }

    /// Finalize a session's duration. Returns it if the session was known.
    pub fn end_session(&mut self, session_id: &str) -> Option<Duration> {
        let session = self.sessions.get_mut(session_id)?;
        let duration = session.started_at.elapsed();
        session.duration = Some(duration);
        Some(duration)
    }

    pub fn stats_for(&self, name: &str) -> Option<&ToolNameStats> {
        self.by_name.get(name)
    }

    pub fn session_stats(&self, session_id: &str) -> Option<&SessionToolStats> {
        self.sessions.get(session_id)
    }

    pub fn completed(&self) -> impl Iterator<Item = &CompletedExecution> {
        self.completed.iter()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
