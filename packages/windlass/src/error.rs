//! Structured error types for the engine.
//!
//! `WindlassError` is the only error type that crosses the engine API
//! boundary. `anyhow::Error` stays internal transport for effect closures
//! (`ctx.run`) and agent invokers; the invocation runner converts it at the
//! edge via [`WindlassError::from_effect`].

use thiserror::Error;

/// Why an invocation stopped without completing.
///
/// Suspension is a journaled fact, not an in-memory stack: the context writes
/// the pending journal entry, moves the task to `suspended`, and unwinds the
/// invocation body with this signal. The runner releases the lease and does
/// nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspensionReason {
    /// Waiting on an awakeable to be resolved or rejected.
    Awakeable { id: String },
    /// Waiting for a durable sleep deadline.
    Sleep { wake_at: String },
}

impl std::fmt::Display for SuspensionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuspensionReason::Awakeable { id } => write!(f, "awaiting awakeable {}", id),
            SuspensionReason::Sleep { wake_at } => write!(f, "sleeping until {}", wake_at),
        }
    }
}

/// Sealed engine error enum.
///
/// Boundary layers (HTTP, CLI) translate these to status codes and messages;
/// the engine itself never matches on error strings.
#[derive(Debug, Error)]
pub enum WindlassError {
    /// Bad identifier or payload shape. Rejected synchronously; never enters
    /// the store.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Resolve/reject on an awakeable that already left PENDING.
    #[error("awakeable {id} not pending (status: {status})")]
    NotPending { id: String, status: String },

    /// Virtual-object write contention. Non-fatal; the dispatcher surfaces
    /// the holder so the caller can queue or retry.
    #[error("write lock on ({entity}, {key}) held by {holder}")]
    LockHeld {
        entity: String,
        key: String,
        holder: String,
    },

    /// Journal op_type mismatch during replay. Fatal to the attempt and
    /// never retried.
    #[error("non-determinism at entry {index}: journal has {found}, caller expected {expected}")]
    NonDeterminism {
        index: i64,
        expected: String,
        found: String,
    },

    /// A fallible operation failed in a way that may succeed on retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A non-retriable failure. Ends the invocation as completed(failure).
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// An attempted lifecycle transition outside the allowed set. State is
    /// left unchanged.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Control-flow signal: the invocation yielded at a suspension point.
    #[error("invocation suspended: {0}")]
    Suspended(SuspensionReason),

    #[error("storage error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WindlassError {
    /// Classify an effect-closure error as transient (the default: network
    /// hiccups, timeouts) so the retry policy applies.
    pub fn from_effect(err: anyhow::Error) -> Self {
        WindlassError::Transient(err.to_string())
    }

    /// True for errors that skip retry and end the attempt as
    /// completed(failure).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WindlassError::Fatal(_)
                | WindlassError::NonDeterminism { .. }
                | WindlassError::Validation(_)
                | WindlassError::NotFound { .. }
        )
    }

    /// Failure code recorded on the journal entry / completion fields.
    pub fn failure_code(&self) -> &'static str {
        match self {
            WindlassError::Validation(_) => "validation",
            WindlassError::NotFound { .. } => "not-found",
            WindlassError::NotPending { .. } => "not-pending",
            WindlassError::LockHeld { .. } => "lock-held",
            WindlassError::NonDeterminism { .. } => "non-determinism",
            WindlassError::Transient(_) => "transient",
            WindlassError::Fatal(_) => "fatal",
            WindlassError::InvalidTransition { .. } => "invalid-transition",
            WindlassError::Suspended(_) => "suspended",
            WindlassError::Db(_) => "storage",
            WindlassError::Serialization(_) => "serialization",
        }
    }
}

/// Result alias used across the engine.
pub type Result<T, E = WindlassError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(WindlassError::Fatal("boom".into()).is_fatal());
        assert!(
            WindlassError::NonDeterminism {
                index: 2,
                expected: "run".into(),
                found: "sleep".into(),
            }
            .is_fatal()
        );
        assert!(!WindlassError::Transient("net".into()).is_fatal());
        assert!(!WindlassError::Suspended(SuspensionReason::Awakeable { id: "a".into() }).is_fatal());
    }

    #[test]
    fn effect_errors_default_to_transient() {
        let err = WindlassError::from_effect(anyhow::anyhow!("connection reset"));
        assert!(matches!(err, WindlassError::Transient(_)));
        assert_eq!(err.failure_code(), "transient");
    }

    #[test]
    fn suspension_reason_display_names_the_awakeable() {
        let reason = SuspensionReason::Awakeable { id: "prom_1abc".into() };
        assert_eq!(reason.to_string(), "awaiting awakeable prom_1abc");
    }
}
