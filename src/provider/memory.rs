//! In-memory implementation of all three provider traits, grounded on
//! `eventually::event::store::InMemory`'s `Arc<RwLock<...>>` backend
//! pattern. This is the crate's reference implementation and primary
//! test harness.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::event::Record;
use crate::provider::{
    apply_cursor_and_limit, ContextsProvider, DuplicateIdError, EventsProvider, GetOptions,
    Snapshot, SnapshotsProvider,
};

/// In-memory [`EventsProvider`]. Duplicate ids are rejected, matching the
/// contract every other backend must uphold.
#[derive(Clone, Default)]
pub struct MemoryEvents {
    records: Arc<RwLock<HashMap<String, Record>>>,
}

#[async_trait]
impl EventsProvider for MemoryEvents {
    async fn insert(&self, record: Record) -> anyhow::Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(DuplicateIdError(record.id.clone()).into());
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn insert_many(&self, records_in: Vec<Record>) -> anyhow::Result<()> {
        let mut records = self.records.write();
        for record in &records_in {
            if records.contains_key(&record.id) {
                return Err(DuplicateIdError(record.id.clone()).into());
            }
        }
        for record in records_in {
            records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn get(&self, options: &GetOptions) -> anyhow::Result<Vec<Record>> {
        let records: Vec<Record> = self.records.read().values().cloned().collect();
        Ok(apply_cursor_and_limit(records, options))
    }

    async fn get_by_stream(&self, stream: &str, options: &GetOptions) -> anyhow::Result<Vec<Record>> {
        let records: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| r.stream == stream)
            .cloned()
            .collect();
        Ok(apply_cursor_and_limit(records, options))
    }

    async fn get_by_streams(&self, streams: &[String], options: &GetOptions) -> anyhow::Result<Vec<Record>> {
        let records: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| streams.iter().any(|s| s == &r.stream))
            .cloned()
            .collect();
        Ok(apply_cursor_and_limit(records, options))
    }

    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Record>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn check_outdated(&self, record: &Record) -> anyhow::Result<bool> {
        Ok(self.records.read().values().any(|r| {
            r.stream == record.stream && r.r#type == record.r#type && r.created.as_str() > record.created.as_str()
        }))
    }
}

/// In-memory [`ContextsProvider`], deduplicated on `(key, stream)` — the
/// documented default per spec.md §3, §9 Open Question (b).
#[derive(Clone, Default)]
pub struct MemoryContexts {
    rows: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

#[async_trait]
impl ContextsProvider for MemoryContexts {
    async fn insert(&self, key: &str, stream: &str) -> anyhow::Result<()> {
        let mut rows = self.rows.write();
        let streams = rows.entry(key.to_string()).or_default();
        if !streams.iter().any(|s| s == stream) {
            streams.push(stream.to_string());
        }
        Ok(())
    }

    async fn remove(&self, key: &str, stream: &str) -> anyhow::Result<()> {
        if let Some(streams) = self.rows.write().get_mut(key) {
            streams.retain(|s| s != stream);
        }
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.rows.read().get(key).cloned().unwrap_or_default())
    }
}

/// In-memory [`SnapshotsProvider`], keyed by `(name, stream)`. Each insert
/// replaces the prior row for that key — per spec.md §9 Open Question (c),
/// we keep only the latest snapshot, no history.
#[derive(Clone, Default)]
pub struct MemorySnapshots {
    rows: Arc<RwLock<HashMap<(String, String), Snapshot>>>,
}

#[async_trait]
impl SnapshotsProvider for MemorySnapshots {
    async fn insert(&self, name: &str, stream: &str, cursor: &str, state: serde_json::Value) -> anyhow::Result<()> {
        self.rows.write().insert(
            (name.to_string(), stream.to_string()),
            Snapshot {
                cursor: cursor.to_string(),
                state,
            },
        );
        Ok(())
    }

    async fn get_by_stream(&self, name: &str, stream: &str) -> anyhow::Result<Option<Snapshot>> {
        Ok(self
            .rows
            .read()
            .get(&(name.to_string(), stream.to_string()))
            .cloned())
    }

    async fn remove(&self, name: &str, stream: &str) -> anyhow::Result<()> {
        self.rows.write().remove(&(name.to_string(), stream.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::{Clock, HlcConfig};

    fn record(stream: &str, created: &str) -> Record {
        Record {
            id: format!("{stream}-{created}"),
            stream: stream.into(),
            r#type: "user:created".into(),
            data: serde_json::json!({}),
            meta: serde_json::json!({}),
            created: created.into(),
            recorded: created.into(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let events = MemoryEvents::default();
        let record = record("s1", "000000000000001:000000:00000");
        events.insert(record.clone()).await.unwrap();

        let err = events.insert(record).await.unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn get_by_stream_orders_by_created() {
        let events = MemoryEvents::default();
        let clock = Clock::new(HlcConfig::default());

        for _ in 0..3 {
            let ts = clock.now().unwrap();
            let rec = record("s1", &ts.to_key());
            events.insert(rec).await.unwrap();
        }

        let out = events.get_by_stream("s1", &GetOptions::default()).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].created < out[1].created);
        assert!(out[1].created < out[2].created);
    }

    #[tokio::test]
    async fn check_outdated_detects_newer_same_type_event() {
        let events = MemoryEvents::default();
        let older = record("s1", "000000000000001:000000:00000");
        let newer = record("s1", "000000000000002:000000:00000");

        events.insert(newer.clone()).await.unwrap();
        assert!(events.check_outdated(&older).await.unwrap());
        assert!(!events.check_outdated(&newer).await.unwrap());
    }

    #[tokio::test]
    async fn contexts_dedupe_on_key_and_stream() {
        let contexts = MemoryContexts::default();
        contexts.insert("all-users", "u1").await.unwrap();
        contexts.insert("all-users", "u1").await.unwrap();

        let rows = contexts.get_by_key("all-users").await.unwrap();
        assert_eq!(rows, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn snapshots_upsert_by_name_and_stream() {
        let snapshots = MemorySnapshots::default();
        snapshots
            .insert("counter", "all-users", "cursor-1", serde_json::json!({"count": 1}))
            .await
            .unwrap();
        snapshots
            .insert("counter", "all-users", "cursor-2", serde_json::json!({"count": 2}))
            .await
            .unwrap();

        let snap = snapshots.get_by_stream("counter", "all-users").await.unwrap().unwrap();
        assert_eq!(snap.cursor, "cursor-2");
        assert_eq!(snap.state, serde_json::json!({"count": 2}));
    }
}
