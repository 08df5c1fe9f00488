//! Pluggable persistence contract (spec.md §4.3).
//!
//! Three independent async traits. Any backend implementing all three is
//! a valid store. [`memory`] is the reference/testing implementation;
//! [`postgres`] (behind the `postgres` feature) is a second, relational
//! backend satisfying the same contract, grounded on
//! `eventually-postgres::store::EventStore`.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::Record;

/// Marker error a provider returns from `insert`/`insert_many` to signal a
/// duplicate `id`, letting [`crate::store::Store`] distinguish it from an
/// opaque storage failure via `anyhow::Error::downcast_ref`.
#[derive(Debug, Error)]
#[error("duplicate event id {0}")]
pub struct DuplicateIdError(pub String);

/// Sort direction for [`GetOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Filters events down to a set of registered types. An empty filter
/// matches every type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub types: Vec<String>,
}

impl Filter {
    pub fn matches(&self, r#type: &str) -> bool {
        self.types.is_empty() || self.types.iter().any(|t| t == r#type)
    }
}

/// Query options shared by [`EventsProvider::get`] and its stream-scoped
/// variants.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Only return events with `created` strictly greater than this
    /// cursor (used to resume a reduce from a snapshot, spec.md §4.9).
    pub cursor: Option<String>,
    pub direction: Option<Direction>,
    pub limit: Option<usize>,
    pub filter: Filter,
}

impl GetOptions {
    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or(Direction::Asc)
    }
}

/// Storage contract for events. All methods are async; implementations
/// MUST preserve submission order per stream (spec.md §4.3).
#[async_trait]
pub trait EventsProvider: Send + Sync {
    /// Writes one record. Fails if a record with the same `id` already
    /// exists (`StoreError::DuplicateEvent`, spec.md §4.3).
    async fn insert(&self, record: Record) -> anyhow::Result<()>;

    /// Batch insert, preserving submission order per stream.
    async fn insert_many(&self, records: Vec<Record>) -> anyhow::Result<()>;

    /// All events matching `options`, sorted by `created` (ties broken by
    /// `id` ascending, spec.md §4.3).
    async fn get(&self, options: &GetOptions) -> anyhow::Result<Vec<Record>>;

    /// Events for a single stream.
    async fn get_by_stream(&self, stream: &str, options: &GetOptions) -> anyhow::Result<Vec<Record>>;

    /// Events across several streams, merged and sorted as in [`EventsProvider::get`].
    async fn get_by_streams(&self, streams: &[String], options: &GetOptions) -> anyhow::Result<Vec<Record>>;

    /// Fetches a single event by id, if present.
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Record>>;

    /// True if any persisted event with the same `(stream, type)` has a
    /// `created` strictly greater than `record.created`.
    async fn check_outdated(&self, record: &Record) -> anyhow::Result<bool>;
}

/// A single context index mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOpKind {
    Insert,
    Remove,
}

/// A context operation emitted by a [`crate::contextor::Handler`], stamped
/// with the originating stream before being handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOp {
    pub op: ContextOpKind,
    pub key: String,
    pub stream: String,
}

/// Storage contract for the `(key, stream)` secondary index. Implementations
/// dedupe on the `(key, stream)` primary key by default (spec.md §3, §9
/// Open Question (b)).
#[async_trait]
pub trait ContextsProvider: Send + Sync {
    async fn insert(&self, key: &str, stream: &str) -> anyhow::Result<()>;
    async fn remove(&self, key: &str, stream: &str) -> anyhow::Result<()>;
    async fn get_by_key(&self, key: &str) -> anyhow::Result<Vec<String>>;

    /// Applies a batch of ops, e.g. the full list emitted for one record.
    async fn handle(&self, ops: &[ContextOp]) -> anyhow::Result<()> {
        for op in ops {
            match op.op {
                ContextOpKind::Insert => self.insert(&op.key, &op.stream).await?,
                ContextOpKind::Remove => self.remove(&op.key, &op.stream).await?,
            }
        }
        Ok(())
    }
}

/// A cached reducer result: the `created` timestamp of the last folded
/// event (`cursor`) and the folded `state`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub cursor: String,
    pub state: serde_json::Value,
}

/// Storage contract for `(reducerName, stream) -> latest snapshot`.
#[async_trait]
pub trait SnapshotsProvider: Send + Sync {
    /// Upserts by `(name, stream)`.
    async fn insert(&self, name: &str, stream: &str, cursor: &str, state: serde_json::Value) -> anyhow::Result<()>;
    async fn get_by_stream(&self, name: &str, stream: &str) -> anyhow::Result<Option<Snapshot>>;
    async fn remove(&self, name: &str, stream: &str) -> anyhow::Result<()>;
}

/// Sorts events by `created`, breaking ties by `id` ascending, per the
/// tie-break rule in spec.md §4.3. Shared by every provider implementation
/// so ordering is identical across backends.
pub(crate) fn sort_records(records: &mut [Record], direction: Direction) {
    records.sort_by(|a, b| {
        let ord = a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id));
        match direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    });
}

pub(crate) fn apply_cursor_and_limit(mut records: Vec<Record>, options: &GetOptions) -> Vec<Record> {
    if let Some(cursor) = &options.cursor {
        records.retain(|r| r.created.as_str() > cursor.as_str());
    }
    if !options.filter.types.is_empty() {
        records.retain(|r| options.filter.matches(&r.r#type));
    }
    sort_records(&mut records, options.direction());
    if let Some(limit) = options.limit {
        records.truncate(limit);
    }
    records
}
