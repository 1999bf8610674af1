//! Distributed-lock leader election for the scheduler fleet.
//!
//! Exactly one worker process may fire cron timers at a time. Election is an
//! explicit two-state machine driven by a single `tick()` -- invokable
//! synchronously in tests instead of depending on wall-clock timers:
//!
//! - `Follower` tick: atomically set the lock key with a TTL if absent;
//!   success grants leadership.
//! - `Leader` tick: atomically extend the lock's expiration; a failed
//!   extension means the lock was lost and demotes immediately, so timers
//!   can be cancelled before another process starts firing.
//!
//! With no lock backend configured the elector unconditionally reports
//! leadership (documented single-instance fallback). A backend error keeps
//! the current state rather than flapping.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::repository::lock::LockBackend;

use super::error::EngineError;

// ---------------------------------------------------------------------------
// States and transitions
// ---------------------------------------------------------------------------

/// Election state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Follower,
    Leader,
}

/// Outcome of one election tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderTransition {
    /// Acquired the lock this tick: re-establish timers.
    BecameLeader,
    /// Renewed the lock (or the single-instance fallback is active).
    StillLeader,
    /// Lost the lock: cancel every local timer immediately.
    LostLeadership,
    /// Lock held elsewhere.
    StillFollower,
}

// ---------------------------------------------------------------------------
// LeaderElector
// ---------------------------------------------------------------------------

/// Leader election over a `LockBackend`, one instance per process.
pub struct LeaderElector {
    lock: Option<Arc<dyn LockBackend>>,
    key: String,
    holder_id: String,
    ttl: Duration,
    state: Mutex<LeaderState>,
}

impl LeaderElector {
    /// Create an elector. `lock: None` enables the single-instance fallback.
    pub fn new(lock: Option<Arc<dyn LockBackend>>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            lock,
            key: key.into(),
            holder_id: Uuid::now_v7().to_string(),
            ttl,
            state: Mutex::new(LeaderState::Follower),
        }
    }

    /// This process's unique holder id.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Current state.
    pub fn state(&self) -> LeaderState {
        *self.state.lock().expect("elector state poisoned")
    }

    /// Whether this process currently leads.
    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Run one election step: acquire when following, renew when leading.
    pub async fn tick(&self) -> Result<LeaderTransition, EngineError> {
        let Some(backend) = &self.lock else {
            // Single-instance fallback: no coordination, always the leader.
            let mut state = self.state.lock().expect("elector state poisoned");
            return Ok(match *state {
                LeaderState::Follower => {
                    *state = LeaderState::Leader;
                    tracing::info!("no lock backend configured, assuming leadership");
                    LeaderTransition::BecameLeader
                }
                LeaderState::Leader => LeaderTransition::StillLeader,
            });
        };

        match self.state() {
            LeaderState::Follower => {
                match backend
                    .try_acquire(&self.key, &self.holder_id, self.ttl)
                    .await
                {
                    Ok(true) => {
                        self.set_state(LeaderState::Leader);
                        tracing::info!(
                            key = self.key.as_str(),
                            holder = self.holder_id.as_str(),
                            "acquired scheduler leadership"
                        );
                        Ok(LeaderTransition::BecameLeader)
                    }
                    Ok(false) => Ok(LeaderTransition::StillFollower),
                    Err(e) => {
                        tracing::error!(error = %e, "lock backend unreachable during acquire");
                        Ok(LeaderTransition::StillFollower)
                    }
                }
            }
            LeaderState::Leader => {
                match backend.extend(&self.key, &self.holder_id, self.ttl).await {
                    Ok(true) => Ok(LeaderTransition::StillLeader),
                    Ok(false) => {
                        self.set_state(LeaderState::Follower);
                        tracing::warn!(
                            key = self.key.as_str(),
                            "scheduler lock lost, demoting to follower"
                        );
                        Ok(LeaderTransition::LostLeadership)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "lock backend unreachable during renewal");
                        Ok(LeaderTransition::StillLeader)
                    }
                }
            }
        }
    }

    /// Release the lock on clean shutdown so another process can take over
    /// without waiting for expiry. Idempotent.
    pub async fn release(&self) -> Result<(), EngineError> {
        if self.state() != LeaderState::Leader {
            return Ok(());
        }
        if let Some(backend) = &self.lock {
            backend
                .release(&self.key, &self.holder_id)
                .await
                .map_err(|e| EngineError::Infrastructure(e.to_string()))?;
        }
        self.set_state(LeaderState::Follower);
        tracing::info!(key = self.key.as_str(), "released scheduler leadership");
        Ok(())
    }

    fn set_state(&self, new: LeaderState) {
        *self.state.lock().expect("elector state poisoned") = new;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
