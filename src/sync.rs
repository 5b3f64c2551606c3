//! Dual-store projection
//!
//! The reconstructed conversation is mirrored into two independent
//! stores. A naive implementation observes a store update, writes it to
//! the other store, and triggers the observer again - an infinite ping.
//! The bridge prevents that with an explicit tri-state machine: a
//! projection in one direction blocks any projection starting while it
//! is in flight, instead of relying on suppression flags scattered
//! through callers.

mod debounce;

pub use debounce::{DebouncePolicy, Debouncer};

use crate::notify::Notification;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// What the bridge is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    ProjectingToPrimary,
    ProjectingToMirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToPrimary,
    ToMirror,
}

impl Direction {
    fn as_state(self) -> BridgeState {
        match self {
            Self::ToPrimary => BridgeState::ProjectingToPrimary,
            Self::ToMirror => BridgeState::ProjectingToMirror,
        }
    }
}

/// A store the bridge can project notification batches into.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn apply(&self, batch: &[Notification]) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("projection {requested:?} blocked: {in_flight:?} already in flight")]
    Blocked {
        requested: Direction,
        in_flight: BridgeState,
    },
    #[error("sink rejected batch: {0}")]
    Sink(#[from] SinkError),
}

/// Projects notification batches into two stores, one direction at a
/// time.
#[derive(Clone)]
pub struct StateBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    state: Mutex<BridgeState>,
    primary: Arc<dyn StateSink>,
    mirror: Arc<dyn StateSink>,
}

impl StateBridge {
    pub fn new(primary: Arc<dyn StateSink>, mirror: Arc<dyn StateSink>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                state: Mutex::new(BridgeState::Idle),
                primary,
                mirror,
            }),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.inner
            .state
            .lock()
            .map_or(BridgeState::Idle, |guard| *guard)
    }

    /// Project one batch in one direction. Fails fast if a projection is
    /// already in flight - callers retry on their next flush rather than
    /// queueing behind a store write.
    pub async fn project(
        &self,
        direction: Direction,
        batch: &[Notification],
    ) -> Result<(), BridgeError> {
        if batch.is_empty() {
            return Ok(());
        }
        {
            let mut state = self
                .inner
                .state
                .lock()
                .map_err(|_| SinkError("bridge state poisoned".into()))?;
            if *state != BridgeState::Idle {
                return Err(BridgeError::Blocked {
                    requested: direction,
                    in_flight: *state,
                });
            }
            *state = direction.as_state();
        }
        // The lock is released while the sink runs; the state value keeps
        // re-entrant projections out.
        let _reset = StateReset {
            inner: &self.inner,
        };

        let sink = match direction {
            Direction::ToPrimary => &self.inner.primary,
            Direction::ToMirror => &self.inner.mirror,
        };
        tracing::debug!(?direction, count = batch.len(), "projecting batch");
        sink.apply(batch).await?;
        Ok(())
    }

    /// Project one batch into both stores, primary first.
    pub async fn broadcast(&self, batch: &[Notification]) -> Result<(), BridgeError> {
        self.project(Direction::ToPrimary, batch).await?;
        self.project(Direction::ToMirror, batch).await?;
        Ok(())
    }
}

/// Returns the bridge to `Idle` however the projection ends
struct StateReset<'a> {
    inner: &'a BridgeInner,
}

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            *state = BridgeState::Idle;
        }
    }
}
