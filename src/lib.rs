//! `causalog`: an append-only event store with causal ordering,
//! per-stream serialization, projection fan-out, context (secondary
//! index) derivation, and reducer-driven state reconstruction with
//! snapshotting.
//!
//! The [`store::Store`] façade ties the other modules together; start
//! there. [`provider::memory`] is a good first backend to reach for when
//! testing application code built on top of this crate.

pub mod contextor;
pub mod error;
pub mod event;
pub mod hlc;
pub mod projector;
pub mod provider;
pub mod queue;
pub mod reducer;
pub mod store;
pub mod validator;

pub use error::{EventParserError, FieldError, HlcError, PostInsertError, StoreError};
pub use event::{NewRecord, Record};
pub use hlc::{Clock, HlcConfig, Timestamp};
pub use reducer::{Aggregate, AggregateReducer, PendingEvent, Reducer, Root, Scope, StateReducer};
pub use store::{Hooks, SnapshotMode, Store, StoreBuilder};
