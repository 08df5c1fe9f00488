//! End-to-end scenarios against the in-memory provider triple, covering
//! the push/reduce/snapshot/context pipeline as a whole rather than any
//! single module in isolation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use causalog::hlc::{HlcConfig, Timestamp};
use causalog::provider::memory::{MemoryContexts, MemoryEvents, MemorySnapshots};
use causalog::provider::{ContextOp, ContextOpKind};
use causalog::reducer::{Scope, StateReducer};
use causalog::{NewRecord, Record, SnapshotMode, Store, StoreError};

fn new_store() -> Store {
    Store::builder(
        MemoryEvents::default(),
        MemoryContexts::default(),
        MemorySnapshots::default(),
    )
    .build()
}

fn user_created(name: &str) -> NewRecord {
    NewRecord {
        stream: None,
        r#type: "user:created".into(),
        data: serde_json::json!({"name": name}),
        meta: serde_json::json!({}),
    }
}

// S1: registering a type, pushing an event, and re-pushing the identical
// draft-turned-record is a no-op (spec.md §8 property 1).
#[tokio::test]
async fn push_is_idempotent_for_identical_records() {
    let store = new_store();
    store.register_event("user:created", None, None);

    let record = store.make_event(user_created("ada")).unwrap();

    let stream_a = store.push(record.clone(), false).await.unwrap();
    let stream_b = store.push(record.clone(), false).await.unwrap();

    assert_eq!(stream_a, stream_b);

    let events = store
        .get_events_by_stream(&stream_a, &Default::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn push_rejects_unregistered_event_types() {
    let store = new_store();
    let err = store.push_new(user_created("ada")).await.unwrap_err();
    assert!(matches!(err, StoreError::EventMissing(ref t) if t == "user:created"));
}

// S2: a contextor handler maintains a derived "all-users" secondary index.
#[tokio::test]
async fn contextor_maintains_secondary_index_across_streams() {
    let store = new_store();
    store.register_event("user:created", None, None);
    store.register_context("user:created", |record: &Record| {
        vec![ContextOp {
            op: ContextOpKind::Insert,
            key: "all-users".into(),
            stream: record.stream.clone(),
        }]
    });

    let s1 = store.push_new(user_created("ada")).await.unwrap();
    let s2 = store.push_new(user_created("grace")).await.unwrap();

    let events = store
        .get_events_by_context("all-users", &Default::default())
        .await
        .unwrap();
    let streams: Vec<_> = events.iter().map(|e| e.stream.clone()).collect();

    assert_eq!(events.len(), 2);
    assert!(streams.contains(&s1));
    assert!(streams.contains(&s2));
}

// S3: a context-scoped state reducer folds events across multiple streams.
#[tokio::test]
async fn context_scoped_reducer_folds_across_streams() {
    let store = new_store();
    store.register_event("user:created", None, None);
    store.register_context("user:created", |record: &Record| {
        vec![ContextOp {
            op: ContextOpKind::Insert,
            key: "all-users".into(),
            stream: record.stream.clone(),
        }]
    });

    store.push_new(user_created("ada")).await.unwrap();
    store.push_new(user_created("grace")).await.unwrap();
    store.push_new(user_created("hedy")).await.unwrap();

    let counter = StateReducer::new("user-count", || 0i64, |count, _event: &Record| Ok(count + 1))
        .with_scope(Scope::Context);

    let count = store.reduce("all-users", &counter).await.unwrap();
    assert_eq!(count, Some(3));
}

// S4: createSnapshot followed by reduce resumes from the cursor instead of
// re-folding events older than it.
#[tokio::test]
async fn create_snapshot_then_reduce_resumes_from_cursor() {
    let store = new_store();
    store.register_event("counter:incremented", None, None);

    let stream = "c1".to_string();
    for _ in 0..3 {
        store
            .push_new(NewRecord {
                stream: Some(stream.clone()),
                r#type: "counter:incremented".into(),
                data: serde_json::json!({}),
                meta: serde_json::json!({}),
            })
            .await
            .unwrap();
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_for_fold = seen.clone();
    let counter = StateReducer::new("counter", || 0i64, move |count, _event: &Record| {
        seen_for_fold.fetch_add(1, Ordering::SeqCst);
        Ok(count + 1)
    });

    store.create_snapshot(&stream, &counter).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 3);

    store
        .push_new(NewRecord {
            stream: Some(stream.clone()),
            r#type: "counter:incremented".into(),
            data: serde_json::json!({}),
            meta: serde_json::json!({}),
        })
        .await
        .unwrap();

    seen.store(0, Ordering::SeqCst);
    let state = store.reduce(&stream, &counter).await.unwrap();

    assert_eq!(state, Some(4));
    // Only the one event newer than the snapshot's cursor was re-folded.
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn get_snapshot_and_delete_snapshot_round_trip() {
    let store = new_store();
    store.register_event("counter:incremented", None, None);

    let stream = "c2".to_string();
    store
        .push_new(NewRecord {
            stream: Some(stream.clone()),
            r#type: "counter:incremented".into(),
            data: serde_json::json!({}),
            meta: serde_json::json!({}),
        })
        .await
        .unwrap();

    let counter = StateReducer::new("counter", || 0i64, |count, _event: &Record| Ok(count + 1));

    assert_eq!(store.get_snapshot(&stream, &counter).await.unwrap(), None);

    store.create_snapshot(&stream, &counter).await.unwrap();
    assert_eq!(store.get_snapshot(&stream, &counter).await.unwrap(), Some(1));

    store.delete_snapshot(&stream, &counter).await.unwrap();
    assert_eq!(store.get_snapshot(&stream, &counter).await.unwrap(), None);
}

// S5/Property 3: a hydrated (replicated) push with a remote timestamp
// behind local wall time still advances the clock causally; an excessive
// forward jump from a misbehaving peer is rejected and does not corrupt
// local clock state.
#[tokio::test]
async fn hydrated_push_merges_remote_timestamp_causally() {
    let store = new_store();
    store.register_event("user:created", None, None);

    let local_stream = store.push_new(user_created("ada")).await.unwrap();
    let local_events = store
        .get_events_by_stream(&local_stream, &Default::default())
        .await
        .unwrap();
    let local_ts = Timestamp::parse(&local_events[0].created).unwrap();

    let remote = Record {
        id: "remote-evt-1".into(),
        stream: "remote-stream".into(),
        r#type: "user:created".into(),
        data: serde_json::json!({"name": "grace"}),
        meta: serde_json::json!({}),
        created: Timestamp {
            wall_ms: local_ts.wall_ms,
            logical: local_ts.logical,
            node: 7,
        }
        .to_key(),
        recorded: String::new(),
    };

    store.push(remote, true).await.unwrap();

    let next_local = store.push_new(user_created("hedy")).await.unwrap();
    let next_events = store
        .get_events_by_stream(&next_local, &Default::default())
        .await
        .unwrap();
    let next_ts = Timestamp::parse(&next_events[0].created).unwrap();

    assert!(next_ts.to_key() > local_ts.to_key());
}

#[tokio::test]
async fn hydrated_push_with_excessive_forward_jump_fails() {
    let store = Store::builder(
        MemoryEvents::default(),
        MemoryContexts::default(),
        MemorySnapshots::default(),
    )
    .hlc_config(HlcConfig {
        tolerance_ms: 100,
        ..HlcConfig::default()
    })
    .build();
    store.register_event("user:created", None, None);

    let far_future = Timestamp {
        wall_ms: 9_999_999_999_999,
        logical: 0,
        node: 1,
    };

    let record = Record {
        id: "evt-far-future".into(),
        stream: "s1".into(),
        r#type: "user:created".into(),
        data: serde_json::json!({}),
        meta: serde_json::json!({}),
        created: far_future.to_key(),
        recorded: String::new(),
    };

    let err = store.push(record, true).await.unwrap_err();
    assert!(matches!(err, StoreError::Clock(_)));

    // The clock itself is undamaged: a subsequent local push still succeeds.
    let stream = store.push_new(user_created("ada")).await.unwrap();
    assert!(!stream.is_empty());
}

// Property: contextor removal ops retract a stream from a context.
#[tokio::test]
async fn contextor_remove_retracts_stream_from_context() {
    let store = new_store();
    store.register_event("user:created", None, None);
    store.register_event("user:deleted", None, None);
    store.register_context("user:created", |record: &Record| {
        vec![ContextOp {
            op: ContextOpKind::Insert,
            key: "all-users".into(),
            stream: record.stream.clone(),
        }]
    });
    store.register_context("user:deleted", |record: &Record| {
        vec![ContextOp {
            op: ContextOpKind::Remove,
            key: "all-users".into(),
            stream: record.stream.clone(),
        }]
    });

    let stream = store.push_new(user_created("ada")).await.unwrap();
    let events = store
        .get_events_by_context("all-users", &Default::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    store
        .push_new(NewRecord {
            stream: Some(stream),
            r#type: "user:deleted".into(),
            data: serde_json::json!({}),
            meta: serde_json::json!({}),
        })
        .await
        .unwrap();

    let events = store
        .get_events_by_context("all-users", &Default::default())
        .await
        .unwrap();
    assert!(events.is_empty());
}

// Property: pushing into two unrelated streams concurrently does not block
// on each other (per-stream serialization, not global serialization).
#[tokio::test]
async fn concurrent_pushes_to_different_streams_do_not_block_each_other() {
    let store = Arc::new(new_store());
    store.register_event("user:created", None, None);

    let store_a = store.clone();
    let store_b = store.clone();

    let (res_a, res_b) = tokio::join!(
        store_a.push_new(NewRecord {
            stream: Some("stream-a".into()),
            r#type: "user:created".into(),
            data: serde_json::json!({"name": "ada"}),
            meta: serde_json::json!({}),
        }),
        store_b.push_new(NewRecord {
            stream: Some("stream-b".into()),
            r#type: "user:created".into(),
            data: serde_json::json!({"name": "grace"}),
            meta: serde_json::json!({}),
        }),
    );

    assert_eq!(res_a.unwrap(), "stream-a");
    assert_eq!(res_b.unwrap(), "stream-b");
}

// Property: auto snapshot mode writes a snapshot after every reduce.
#[tokio::test]
async fn auto_snapshot_mode_writes_snapshot_after_reduce() {
    let store = Store::builder(
        MemoryEvents::default(),
        MemoryContexts::default(),
        MemorySnapshots::default(),
    )
    .snapshot_mode(SnapshotMode::Auto)
    .build();
    store.register_event("counter:incremented", None, None);

    let stream = "c3".to_string();
    store
        .push_new(NewRecord {
            stream: Some(stream.clone()),
            r#type: "counter:incremented".into(),
            data: serde_json::json!({}),
            meta: serde_json::json!({}),
        })
        .await
        .unwrap();

    let counter = StateReducer::new("counter", || 0i64, |count, _event: &Record| Ok(count + 1));

    assert_eq!(store.get_snapshot(&stream, &counter).await.unwrap(), None);
    store.reduce(&stream, &counter).await.unwrap();
    assert_eq!(store.get_snapshot(&stream, &counter).await.unwrap(), Some(1));
}

// Property: a type registered with a data validator rejects records that
// fail it, and the rejection leaves no event persisted.
#[tokio::test]
async fn validation_failure_leaves_nothing_persisted() {
    let store = new_store();
    store.register_event(
        "user:created",
        Some(Box::new(|value: &serde_json::Value| {
            if value.get("name").and_then(|v| v.as_str()).is_some() {
                vec![]
            } else {
                vec![causalog::FieldError {
                    field: "name".into(),
                    message: "must be a string".into(),
                }]
            }
        })),
        None,
    );

    let draft = NewRecord {
        stream: Some("s1".into()),
        r#type: "user:created".into(),
        data: serde_json::json!({}),
        meta: serde_json::json!({}),
    };

    let err = store.push_new(draft).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    let events = store.get_events_by_stream("s1", &Default::default()).await.unwrap();
    assert!(events.is_empty());
}

// Property: replaying already-persisted events re-runs fan-out without
// re-inserting or duplicating context rows.
#[tokio::test]
async fn replay_reruns_fan_out_without_duplicating_context_rows() {
    let store = new_store();
    store.register_event("user:created", None, None);
    store.register_context("user:created", |record: &Record| {
        vec![ContextOp {
            op: ContextOpKind::Insert,
            key: "all-users".into(),
            stream: record.stream.clone(),
        }]
    });

    let stream = store.push_new(user_created("ada")).await.unwrap();
    store.replay(Some(&stream)).await.unwrap();
    store.replay(None).await.unwrap();

    let events = store
        .get_events_by_context("all-users", &Default::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    let all = store.get_events(&Default::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}
