//! Event Store façade (spec.md §4.9): orchestrates the push pipeline and
//! the reduce/snapshot logic on top of the other components.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::contextor::{self, Contextor};
use crate::error::{PostInsertError, StoreError};
use crate::event::{self, NewRecord, Record};
use crate::hlc::{Clock, HlcConfig, Timestamp};
use crate::projector::{self, Projector, ProjectionSignals};
use crate::provider::{
    ContextsProvider, EventsProvider, Filter, GetOptions, SnapshotsProvider,
};
use crate::queue::StreamQueue;
use crate::reducer::Reducer;
use crate::validator;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Whether a snapshot is written automatically at the end of every
/// [`Store::reduce`] call, or only on explicit [`Store::create_snapshot`]
/// (spec.md §4.9, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Manual,
    Auto,
}

type EventsHook = Arc<dyn Fn(&[Record]) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&PostInsertError) + Send + Sync>;

/// Observer hooks: `on_events_inserted` is called after every successful
/// insert/insert_many (never fallible); `on_error` is the sole sink for
/// post-insert projector/contextor failures (spec.md §7).
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_events_inserted: Option<EventsHook>,
    pub on_error: Option<ErrorHook>,
}

/// Builder for a [`Store`] instance (spec.md §6).
pub struct StoreBuilder {
    events: Arc<dyn EventsProvider>,
    contexts: Arc<dyn ContextsProvider>,
    snapshots: Arc<dyn SnapshotsProvider>,
    hlc_config: HlcConfig,
    snapshot_mode: SnapshotMode,
    hooks: Hooks,
    queue_capacity: usize,
}

impl StoreBuilder {
    pub fn new(
        events: impl EventsProvider + 'static,
        contexts: impl ContextsProvider + 'static,
        snapshots: impl SnapshotsProvider + 'static,
    ) -> Self {
        Self {
            events: Arc::new(events),
            contexts: Arc::new(contexts),
            snapshots: Arc::new(snapshots),
            hlc_config: HlcConfig::default(),
            snapshot_mode: SnapshotMode::Manual,
            hooks: Hooks::default(),
            queue_capacity: 64,
        }
    }

    #[must_use]
    pub fn hlc_config(mut self, config: HlcConfig) -> Self {
        self.hlc_config = config;
        self
    }

    #[must_use]
    pub fn snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.snapshot_mode = mode;
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Store {
        Store {
            hlc: Clock::new(self.hlc_config),
            validators: RwLock::new(validator::Registry::new()),
            events: self.events,
            contexts: self.contexts,
            snapshots: self.snapshots,
            projector: RwLock::new(Projector::new()),
            contextor: RwLock::new(Contextor::new()),
            queue: StreamQueue::new(self.queue_capacity),
            snapshot_mode: self.snapshot_mode,
            hooks: self.hooks,
        }
    }
}

/// The Event Store façade (spec.md C9). Construct with [`Store::builder`].
pub struct Store {
    hlc: Clock,
    validators: RwLock<validator::Registry>,
    events: Arc<dyn EventsProvider>,
    contexts: Arc<dyn ContextsProvider>,
    snapshots: Arc<dyn SnapshotsProvider>,
    projector: RwLock<Projector>,
    contextor: RwLock<Contextor>,
    queue: StreamQueue,
    snapshot_mode: SnapshotMode,
    hooks: Hooks,
}

impl Store {
    pub fn builder(
        events: impl EventsProvider + 'static,
        contexts: impl ContextsProvider + 'static,
        snapshots: impl SnapshotsProvider + 'static,
    ) -> StoreBuilder {
        StoreBuilder::new(events, contexts, snapshots)
    }

    /// Registers an event type along with its optional data/meta
    /// validators (spec.md §6). Must not be called concurrently with
    /// `push`/`push_many` (spec.md §5).
    pub fn register_event(
        &self,
        r#type: impl Into<String>,
        data: Option<Box<dyn validator::Validator>>,
        meta: Option<Box<dyn validator::Validator>>,
    ) {
        self.validators.write().register(r#type, data, meta);
    }

    /// Registers a projection handler for an event type (spec.md §6).
    pub fn on_project(&self, r#type: impl Into<String>, handler: impl projector::Handler + 'static) {
        self.projector.write().on(r#type, handler);
    }

    /// Registers the (sole) contextor handler for an event type (spec.md §6).
    pub fn register_context(&self, r#type: impl Into<String>, handler: impl contextor::Handler + 'static) {
        self.contextor.write().register(r#type, handler);
    }

    /// Builds an unsent record: defaults the stream id if absent and
    /// stamps `created`/`recorded` from a fresh local timestamp
    /// (spec.md §4.2). `push` may later overwrite `recorded` again for
    /// locally-minted events, to reflect the later instant of acceptance.
    pub fn make_event(&self, draft: NewRecord) -> Result<Record, StoreError> {
        let ts = self.hlc.now()?;
        Ok(event::make_record(draft, ts))
    }

    /// Mints and pushes a single event locally (the common case).
    /// Equivalent to `make_event` followed by `push(.., hydrated: false)`.
    pub async fn push_new(&self, draft: NewRecord) -> Result<String, StoreError> {
        let record = self.make_event(draft)?;
        self.push(record, false).await
    }

    /// Pushes a single record through the full pipeline (spec.md §4.9).
    #[cfg_attr(feature = "tracing", instrument(skip(self, record), fields(r#type = %record.r#type, stream = %record.stream)))]
    pub async fn push(&self, mut record: Record, hydrated: bool) -> Result<String, StoreError> {
        if !self.validators.read().is_registered(&record.r#type) {
            return Err(StoreError::EventMissing(record.r#type));
        }

        if self.events.get_by_id(&record.id).await.map_err(StoreError::Provider)?.is_some() {
            // Idempotent no-op: identical (stream, type, created) submissions
            // share a deterministic id (spec.md §3, §8 property 1).
            return Ok(record.stream);
        }

        let outdated = self
            .events
            .check_outdated(&record)
            .await
            .map_err(StoreError::Provider)?;

        if hydrated {
            let remote = Timestamp::parse(&record.created)
                .ok_or_else(|| StoreError::Provider(anyhow::anyhow!("malformed created timestamp")))?;
            self.hlc.recv(remote)?;
        } else {
            record.recorded = self.hlc.now()?.to_key();
        }

        self.validators
            .read()
            .validate(&record.r#type, &record.data, &record.meta)?;

        self.insert_and_fan_out(record.clone(), hydrated, outdated).await?;

        Ok(record.stream)
    }

    /// Mints and pushes a batch of events, preserving submission order per
    /// stream (spec.md §4.9 `pushMany`).
    #[cfg_attr(feature = "tracing", instrument(skip(self, drafts), fields(count = drafts.len())))]
    pub async fn push_many(&self, drafts: Vec<NewRecord>) -> Result<(), StoreError> {
        let mut records = Vec::with_capacity(drafts.len());
        for draft in drafts {
            records.push(self.make_event(draft)?);
        }

        for record in &records {
            if !self.validators.read().is_registered(&record.r#type) {
                return Err(StoreError::EventMissing(record.r#type.clone()));
            }
            self.validators
                .read()
                .validate(&record.r#type, &record.data, &record.meta)?;
        }

        self.events
            .insert_many(records.clone())
            .await
            .map_err(StoreError::EventInsertion)?;

        if let Some(hook) = &self.hooks.on_events_inserted {
            hook(&records);
        }

        for record in &records {
            let outdated = self
                .events
                .check_outdated(record)
                .await
                .map_err(StoreError::Provider)?;
            self.fan_out(record.clone(), false, outdated).await;
        }

        Ok(())
    }

    async fn insert_and_fan_out(&self, record: Record, hydrated: bool, outdated: bool) -> Result<(), StoreError> {
        match self.events.insert(record.clone()).await {
            Ok(()) => {}
            Err(err) => {
                if let Some(dup) = err.downcast_ref::<crate::provider::DuplicateIdError>() {
                    return Err(StoreError::DuplicateEvent(dup.0.clone()));
                }
                return Err(StoreError::EventInsertion(err));
            }
        }

        if let Some(hook) = &self.hooks.on_events_inserted {
            hook(std::slice::from_ref(&record));
        }

        self.fan_out(record, hydrated, outdated).await;
        Ok(())
    }

    /// Runs the contextor and projector for `record`, serialized per
    /// stream via [`StreamQueue`]. Both run concurrently with each other;
    /// errors from either are reported via `hooks.on_error` and never
    /// propagate to the caller (spec.md §4.6, §4.7, §4.10).
    async fn fan_out(&self, record: Record, hydrated: bool, outdated: bool) {
        let contextor = self.contextor.read().clone();
        let projector = self.projector.read().clone();
        let contexts = self.contexts.clone();
        let error_hook = self.hooks.on_error.clone();

        let signals = ProjectionSignals { hydrated, outdated };
        let stream = record.stream.clone();

        self.queue
            .enqueue(&stream, async move {
                let (context_result, projection_errors) = tokio::join!(
                    contextor.push(&record, &*contexts),
                    projector.project(&record, signals)
                );

                if let Some(hook) = &error_hook {
                    if let Err(err) = context_result {
                        hook(&err);
                    }
                    for err in projection_errors {
                        hook(&err);
                    }
                }
            })
            .await;
    }

    /// Re-runs contextor and projector fan-out for already-persisted
    /// events, without re-inserting them (spec.md §6 `replay`). When
    /// `stream` is `None`, replays every event in the store.
    pub async fn replay(&self, stream: Option<&str>) -> Result<(), StoreError> {
        let records = match stream {
            Some(stream) => self
                .events
                .get_by_stream(stream, &GetOptions::default())
                .await
                .map_err(StoreError::Provider)?,
            None => self
                .events
                .get(&GetOptions::default())
                .await
                .map_err(StoreError::Provider)?,
        };

        for record in records {
            let outdated = self
                .events
                .check_outdated(&record)
                .await
                .map_err(StoreError::Provider)?;
            self.fan_out(record, true, outdated).await;
        }

        Ok(())
    }

    pub async fn get_events(&self, options: &GetOptions) -> Result<Vec<Record>, StoreError> {
        self.events.get(options).await.map_err(StoreError::Provider)
    }

    pub async fn get_events_by_stream(&self, stream: &str, options: &GetOptions) -> Result<Vec<Record>, StoreError> {
        self.events.get_by_stream(stream, options).await.map_err(StoreError::Provider)
    }

    pub async fn get_events_by_context(&self, key: &str, options: &GetOptions) -> Result<Vec<Record>, StoreError> {
        let streams = self.contexts.get_by_key(key).await.map_err(StoreError::Provider)?;
        self.events
            .get_by_streams(&streams, options)
            .await
            .map_err(StoreError::Provider)
    }

    /// Folds the stream or context named by `key` through `reducer`,
    /// resuming from any cached snapshot (spec.md §4.9 `reduce`). Whether
    /// `key` names a stream or a context is decided by `reducer.scope()`.
    #[cfg_attr(feature = "tracing", instrument(skip(self, reducer), fields(reducer = reducer.name())))]
    pub async fn reduce<R: Reducer>(&self, key: &str, reducer: &R) -> Result<Option<R::State>, StoreError> {
        let snapshot = self
            .snapshots
            .get_by_stream(reducer.name(), key)
            .await
            .map_err(StoreError::Provider)?;

        let (cursor, state) = match snapshot {
            Some(snap) => {
                let state: R::State =
                    serde_json::from_value(snap.state).map_err(|e| StoreError::Provider(e.into()))?;
                (Some(snap.cursor), Some(state))
            }
            None => (None, None),
        };

        let options = GetOptions {
            cursor,
            filter: reducer.filter(),
            ..GetOptions::default()
        };

        let events = self.fetch_events_for_key(key, reducer.scope(), &options).await?;

        if events.is_empty() {
            return Ok(reducer.from_snapshot(state));
        }

        let result = reducer
            .reduce(&events, state)
            .map_err(StoreError::Provider)?;

        if self.snapshot_mode == SnapshotMode::Auto {
            self.write_snapshot(key, reducer, &events, &result).await?;
        }

        Ok(Some(result))
    }

    async fn fetch_events_for_key(
        &self,
        key: &str,
        scope: crate::reducer::Scope,
        options: &GetOptions,
    ) -> Result<Vec<Record>, StoreError> {
        match scope {
            crate::reducer::Scope::Stream => self
                .events
                .get_by_stream(key, options)
                .await
                .map_err(StoreError::Provider),
            crate::reducer::Scope::Context => {
                let streams = self.contexts.get_by_key(key).await.map_err(StoreError::Provider)?;
                self.events
                    .get_by_streams(&streams, options)
                    .await
                    .map_err(StoreError::Provider)
            }
        }
    }

    async fn write_snapshot<R: Reducer>(
        &self,
        key: &str,
        reducer: &R,
        events: &[Record],
        result: &R::State,
    ) -> Result<(), StoreError> {
        let cursor = &events.last().expect("checked non-empty above").created;
        let state = serde_json::to_value(result).map_err(|e| StoreError::Provider(e.into()))?;
        self.snapshots
            .insert(reducer.name(), key, cursor, state)
            .await
            .map_err(StoreError::Provider)
    }

    /// Forces a snapshot write for `key`, regardless of [`SnapshotMode`].
    /// A no-op if there are no events to fold (spec.md §4.9 `createSnapshot`).
    pub async fn create_snapshot<R: Reducer>(&self, key: &str, reducer: &R) -> Result<(), StoreError> {
        let options = GetOptions {
            filter: reducer.filter(),
            ..GetOptions::default()
        };

        let events = self.fetch_events_for_key(key, reducer.scope(), &options).await?;

        if events.is_empty() {
            return Ok(());
        }

        let result = reducer.reduce(&events, None).map_err(StoreError::Provider)?;
        self.write_snapshot(key, reducer, &events, &result).await
    }

    pub async fn get_snapshot<R: Reducer>(&self, key: &str, reducer: &R) -> Result<Option<R::State>, StoreError> {
        let snapshot = self
            .snapshots
            .get_by_stream(reducer.name(), key)
            .await
            .map_err(StoreError::Provider)?;
        snapshot
            .map(|s| serde_json::from_value(s.state).map_err(|e| StoreError::Provider(e.into())))
            .transpose()
    }

    pub async fn delete_snapshot<R: Reducer>(&self, key: &str, reducer: &R) -> Result<(), StoreError> {
        self.snapshots
            .remove(reducer.name(), key)
            .await
            .map_err(StoreError::Provider)
    }
}

/// Helper to scope a query to a subset of event types; re-exported for
/// callers that want to filter `get_events*` without reaching into
/// `provider` directly.
pub fn types_filter(types: impl IntoIterator<Item = impl Into<String>>) -> Filter {
    Filter {
        types: types.into_iter().map(Into::into).collect(),
    }
}
