//! Task state machine
//!
//! The single table of legal lifecycle transitions. Stores call
//! [`TaskStatus::apply`] before mutating a record, so an illegal
//! transition can never be persisted.
//!
//! ```text
//!             claim              ack
//! Pending ────────────▶ Leased ───────▶ Acked (record removed)
//!                        │  ▲
//!   nack(retryable) /    │  │ claim
//!   lease expired        ▼  │
//!                  RetryScheduled
//!
//! Leased ── nack(permanent) / attempts exhausted ──▶ DeadLettered
//! DeadLettered ── requeue ──▶ Pending
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its first claim
    Pending,

    /// Held by exactly one worker until the lease expires
    Leased,

    /// Failed at least once, waiting for `available_at`
    RetryScheduled,

    /// Permanently failed, isolated in the dead-letter queue
    DeadLettered,

    /// Completed successfully; the record no longer exists
    Acked,
}

impl TaskStatus {
    /// Stable lowercase name, used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::RetryScheduled => "retry_scheduled",
            Self::DeadLettered => "dead_lettered",
            Self::Acked => "acked",
        }
    }

    /// Whether a task in this state may be handed to `claim` (time permitting)
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::RetryScheduled)
    }

    /// Whether a task in this state holds its dedupe key
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Leased | Self::RetryScheduled)
    }

    /// Whether no further automatic transition can leave this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DeadLettered | Self::Acked)
    }

    /// Apply an event, returning the next state
    ///
    /// Every pair not listed in the lifecycle table is rejected.
    pub fn apply(self, event: TaskEvent) -> Result<TaskStatus, TransitionError> {
        use TaskEvent::*;
        use TaskStatus::*;

        let next = match (self, event) {
            (Pending | RetryScheduled, Claim) => Leased,
            (Leased, Ack) => Acked,
            (Leased, RetryableFailure | LeaseExpired) => RetryScheduled,
            (Leased, PermanentFailure | AttemptsExhausted) => DeadLettered,
            (DeadLettered, Requeue) => Pending,
            (from, event) => return Err(TransitionError { from, event }),
        };

        Ok(next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "dead_lettered" => Ok(Self::DeadLettered),
            "acked" => Ok(Self::Acked),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Something that happens to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    /// A worker claimed the task
    Claim,

    /// The lease holder reported success
    Ack,

    /// The lease holder reported a failure worth retrying
    RetryableFailure,

    /// The lease holder reported a failure that must not be retried
    PermanentFailure,

    /// The retry policy has no attempts left
    AttemptsExhausted,

    /// The lease ran out without ack, nack or extension
    LeaseExpired,

    /// An operator replayed a dead letter
    Requeue,
}

/// A transition outside the lifecycle table
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {event:?} from {from}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub event: TaskEvent,
}
