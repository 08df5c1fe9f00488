//! Crate-wide error taxonomy.
//!
//! Pre-insert failures (timestamping, validation, persistence) abort the
//! push and are returned to the caller as variants of [`StoreError`].
//! Post-insert failures (projection, context indexing) are never returned;
//! they are reported through `hooks.on_error` as [`PostInsertError`].

use std::fmt;

use thiserror::Error;

/// Errors raised by the [`crate::hlc::Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HlcError {
    /// The remote timestamp is further ahead of local wall time than
    /// `max_offset_ms` allows.
    #[error("clock offset error: local-remote skew {skew_ms}ms exceeds max_offset_ms {max_offset_ms}ms")]
    ClockOffset { skew_ms: i64, max_offset_ms: i64 },

    /// The merged timestamp would advance `last_wall` by more than
    /// `tolerance_ms` in one step.
    #[error("forward jump error: wall time would advance by {jump_ms}ms, exceeding tolerance_ms {tolerance_ms}ms")]
    ForwardJump { jump_ms: i64, tolerance_ms: i64 },

    /// The wall clock reading exceeds the configured `max_wall_ms`.
    #[error("wall time overflow: reading {wall_ms}ms exceeds max_wall_ms {max_wall_ms}ms")]
    WallTimeOverflow { wall_ms: i64, max_wall_ms: i64 },
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Raised by the [`crate::validator::Registry`] when a record fails its
/// registered data/meta schema.
#[derive(Debug, Clone, Error)]
#[error("event failed validation: {errors:?}")]
pub struct EventParserError {
    pub errors: Vec<FieldError>,
}

/// Top-level error returned by the push/reduce pipeline in
/// [`crate::store::Store`]. Each variant corresponds to one of the
/// pre-insert transitions in spec.md §4.9/§4.10.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `push` was called with an unregistered event type.
    #[error("event type {0:?} is not registered")]
    EventMissing(String),

    /// The HLC rejected the timestamp being assigned or merged.
    #[error("clock error: {0}")]
    Clock(#[from] HlcError),

    /// The record failed data/meta schema validation.
    #[error("validation error: {0}")]
    Validation(#[from] EventParserError),

    /// The events provider rejected the insert.
    #[error("failed to insert event: {0}")]
    EventInsertion(#[source] anyhow::Error),

    /// Specialization of [`StoreError::EventInsertion`] for a duplicate id.
    #[error("duplicate event id {0}")]
    DuplicateEvent(String),

    /// The snapshots or contexts provider rejected a call made directly
    /// (not through the fire-and-forget projector/contextor fan-out).
    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),
}

/// Post-insert failures, surfaced to `hooks.on_error` only. The event that
/// triggered them remains durable regardless of their outcome.
#[derive(Debug, Error)]
pub enum PostInsertError {
    #[error("projection handler failed for event {event_id}: {source}")]
    Projection {
        event_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("context handler failed for event {event_id}: {source}")]
    Context {
        event_id: String,
        #[source]
        source: anyhow::Error,
    },
}
