//! Reducer/Aggregate: left-folding event sequences into state, with a
//! pending-event buffer for aggregate roots (spec.md §4.8).

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::event::Record;
use crate::provider::Filter;
use crate::store::Store;

/// Whether a [`Reducer`]'s `key` argument names a single stream or a
/// context (spec.md §4.9 reduce: "if reducer is stream-typed ... else
/// (context-typed)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Stream,
    Context,
}

/// Folds a sequence of persisted events, optionally resuming from a
/// previously cached `state`, into a new state value. Implemented either
/// directly (a plain [`StateReducer`]) or by wrapping an [`Aggregate`]
/// (an [`AggregateReducer`]) — the two flavors spec.md §4.8 describes.
pub trait Reducer: Send + Sync {
    /// The folded state type. Must round-trip through JSON since it is
    /// what gets cached by the [`crate::provider::SnapshotsProvider`].
    type State: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Unique name for this reducer, used as half of the snapshot key
    /// `(reducerName, stream)`.
    fn name(&self) -> &str;

    /// Whether `reduce`'s `key` is a stream id or a context key. Defaults
    /// to stream-typed.
    fn scope(&self) -> Scope {
        Scope::Stream
    }

    /// Restricts which event types are folded. Defaults to "all types".
    fn filter(&self) -> Filter {
        Filter::default()
    }

    /// Returns the state to report when there are no events to fold,
    /// given whatever snapshot state (if any) was cached.
    fn from_snapshot(&self, state: Option<Self::State>) -> Option<Self::State> {
        state
    }

    /// Left-folds `events` onto `state` (which may be `None` if no
    /// snapshot existed and this is the first reduce for the stream).
    fn reduce(&self, events: &[Record], state: Option<Self::State>) -> anyhow::Result<Self::State>;
}

/// A [`Reducer`] built directly from a fold function and an initial-state
/// constructor — the "state reducer" flavor of spec.md §4.8.
pub struct StateReducer<S, F, I>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync,
    F: Fn(S, &Record) -> anyhow::Result<S> + Send + Sync,
    I: Fn() -> S + Send + Sync,
{
    name: String,
    filter: Filter,
    scope: Scope,
    fold: F,
    initial_state: I,
    _state: PhantomData<S>,
}

impl<S, F, I> StateReducer<S, F, I>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync,
    F: Fn(S, &Record) -> anyhow::Result<S> + Send + Sync,
    I: Fn() -> S + Send + Sync,
{
    pub fn new(name: impl Into<String>, initial_state: I, fold: F) -> Self {
        Self {
            name: name.into(),
            filter: Filter::default(),
            scope: Scope::Stream,
            fold,
            initial_state,
            _state: PhantomData,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Marks this reducer as context-typed: its `reduce` key names a
    /// context, not a single stream.
    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

impl<S, F, I> Reducer for StateReducer<S, F, I>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync,
    F: Fn(S, &Record) -> anyhow::Result<S> + Send + Sync,
    I: Fn() -> S + Send + Sync,
{
    type State = S;

    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> Scope {
        self.scope
    }

    fn filter(&self) -> Filter {
        self.filter.clone()
    }

    fn reduce(&self, events: &[Record], state: Option<S>) -> anyhow::Result<S> {
        let mut state = state.unwrap_or_else(&self.initial_state);
        for event in events {
            state = (self.fold)(state, event)?;
        }
        Ok(state)
    }
}

/// An instance-based domain object that mutates itself as events are
/// applied — the "aggregate" flavor of spec.md §4.8. `apply` receives the
/// event's type name and JSON payload rather than the full [`Record`],
/// since that's all an aggregate needs to fold its own state and it is
/// also what's available before an event has been persisted (see [`Root`]).
pub trait Aggregate: Default + Serialize + DeserializeOwned + Clone + Send + Sync {
    fn apply(&mut self, event_type: &str, data: &serde_json::Value) -> anyhow::Result<()>;
}

/// A [`Reducer`] that instantiates an [`Aggregate`] (from a snapshot, or
/// `Default` if there is none) and applies each event to it in order.
pub struct AggregateReducer<T: Aggregate> {
    name: String,
    filter: Filter,
    scope: Scope,
    _aggregate: PhantomData<T>,
}

impl<T: Aggregate> AggregateReducer<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: Filter::default(),
            scope: Scope::Stream,
            _aggregate: PhantomData,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

impl<T: Aggregate> Reducer for AggregateReducer<T> {
    type State = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> Scope {
        self.scope
    }

    fn filter(&self) -> Filter {
        self.filter.clone()
    }

    fn reduce(&self, events: &[Record], state: Option<T>) -> anyhow::Result<T> {
        let mut instance = state.unwrap_or_default();
        for event in events {
            instance.apply(&event.r#type, &event.data)?;
        }
        Ok(instance)
    }
}

/// A staged domain event, buffered by a [`Root`] until [`Root::commit`]
/// pushes it through the [`Store`].
pub struct PendingEvent {
    pub r#type: String,
    pub data: serde_json::Value,
    pub meta: serde_json::Value,
}

/// An Aggregate Root: the entity applications interact with to load state,
/// record domain-driven changes, and commit them atomically (per-stream)
/// through the [`Store`]. Grounded on the teacher's `aggregate::Root` /
/// `Context` pending-event buffer (`take_uncommitted_events` + repository
/// `store`), adapted here to `Store::push_many`.
pub struct Root<T: Aggregate> {
    stream: String,
    state: T,
    pending: Vec<PendingEvent>,
}

impl<T: Aggregate> Root<T> {
    /// Wraps an existing (possibly freshly-`Default`) state for `stream`.
    pub fn new(stream: impl Into<String>, state: T) -> Self {
        Self {
            stream: stream.into(),
            state,
            pending: Vec::new(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    /// Records a new domain event: applies it to the local state
    /// immediately (so subsequent domain method calls observe it) and
    /// buffers it for the next [`Root::commit`].
    pub fn record(
        &mut self,
        r#type: impl Into<String>,
        data: serde_json::Value,
        meta: serde_json::Value,
    ) -> anyhow::Result<()> {
        let r#type = r#type.into();
        self.state.apply(&r#type, &data)?;
        self.pending.push(PendingEvent { r#type, data, meta });
        Ok(())
    }

    /// True if there are buffered events not yet committed.
    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pushes every buffered event through `store.push_many`, in the
    /// order they were recorded, and clears the buffer. A no-op if
    /// nothing is pending.
    pub async fn commit(&mut self, store: &Store) -> Result<(), crate::error::StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        let records = pending
            .into_iter()
            .map(|event| crate::event::NewRecord {
                stream: Some(self.stream.clone()),
                r#type: event.r#type,
                data: event.data,
                meta: event.meta,
            })
            .collect();

        store.push_many(records).await?;
        Ok(())
    }
}
