//! Coalesces rapid notification bursts into batches.
//!
//! Pure over injected time: callers pass `Instant::now()` in and drive
//! flushing from `deadline()`, which keeps every policy decision
//! testable without sleeping.

use crate::notify::Notification;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct DebouncePolicy {
    /// Thinking deltas arrive fastest and tolerate the most lag
    pub thinking_delay: Duration,
    pub segment_delay: Duration,
    /// Flush regardless of timing once this many are queued
    pub batch_ceiling: usize,
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self {
            thinking_delay: Duration::from_millis(120),
            segment_delay: Duration::from_millis(40),
            batch_ceiling: 32,
        }
    }
}

#[derive(Debug)]
pub struct Debouncer {
    policy: DebouncePolicy,
    queue: Vec<Notification>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(policy: DebouncePolicy) -> Self {
        Self {
            policy,
            queue: Vec::new(),
            deadline: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// When the queued batch is due, if anything is queued
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Queue one notification. Returns a batch when this notification
    /// forces an immediate flush: terminal notifications never wait, and
    /// the ceiling bounds how much a flood can batch up.
    pub fn offer(&mut self, notification: Notification, now: Instant) -> Option<Vec<Notification>> {
        let terminal = notification.is_terminal();
        let delay = self.delay_for(&notification);
        self.queue.push(notification);

        if terminal || self.queue.len() >= self.policy.batch_ceiling {
            return Some(self.flush_all());
        }

        let due = now + delay;
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(due),
            None => due,
        });
        None
    }

    /// Take the batch if its deadline has passed.
    pub fn flush_due(&mut self, now: Instant) -> Option<Vec<Notification>> {
        match self.deadline {
            Some(due) if due <= now => Some(self.flush_all()),
            _ => None,
        }
    }

    /// Take everything queued, due or not. Used at turn teardown.
    pub fn flush_all(&mut self) -> Vec<Notification> {
        self.deadline = None;
        std::mem::take(&mut self.queue)
    }

    fn delay_for(&self, notification: &Notification) -> Duration {
        match notification {
            Notification::ThinkingUpdate { .. } => self.policy.thinking_delay,
            _ => self.policy.segment_delay,
        }
    }
}
