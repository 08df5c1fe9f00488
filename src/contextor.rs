//! Derivation of secondary-index (context) operations from events
//! (spec.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PostInsertError;
use crate::event::Record;
use crate::provider::{ContextOp, ContextsProvider};

/// A function computing the list of context operations for a given
/// record. Registered per event type.
pub trait Handler: Send + Sync {
    fn handle(&self, record: &Record) -> Vec<ContextOp>;
}

impl<F> Handler for F
where
    F: Fn(&Record) -> Vec<ContextOp> + Send + Sync,
{
    fn handle(&self, record: &Record) -> Vec<ContextOp> {
        self(record)
    }
}

/// Registry `type -> handler`. Unlike the projector, at most one handler
/// may be registered per type (spec.md §4.7: "if a handler exists").
#[derive(Default, Clone)]
pub struct Contextor {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Contextor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, r#type: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(r#type.into(), Arc::new(handler));
    }

    /// Computes and applies the context ops for `record`, if a handler is
    /// registered for its type. Each op is stamped with `record.stream`
    /// before being handed to the provider.
    pub async fn push(
        &self,
        record: &Record,
        contexts: &dyn ContextsProvider,
    ) -> Result<(), PostInsertError> {
        let Some(handler) = self.handlers.get(&record.r#type) else {
            return Ok(());
        };

        let ops = handler.handle(record);
        if ops.is_empty() {
            return Ok(());
        }

        contexts
            .handle(&ops)
            .await
            .map_err(|source| PostInsertError::Context {
                event_id: record.id.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryContexts;
    use crate::provider::ContextOpKind;

    fn sample_record(stream: &str) -> Record {
        Record {
            id: format!("evt-{stream}"),
            stream: stream.into(),
            r#type: "user:created".into(),
            data: serde_json::json!({}),
            meta: serde_json::json!({}),
            created: "ts1".into(),
            recorded: "ts1".into(),
        }
    }

    #[tokio::test]
    async fn insert_and_remove_ops_round_trip() {
        let mut contextor = Contextor::new();
        contextor.register("user:created", |record: &Record| {
            vec![ContextOp {
                op: ContextOpKind::Insert,
                key: "all-users".into(),
                stream: record.stream.clone(),
            }]
        });

        let provider = MemoryContexts::default();
        let record = sample_record("u1");

        contextor.push(&record, &provider).await.unwrap();
        let rows = provider.get_by_key("all-users").await.unwrap();
        assert_eq!(rows, vec!["u1".to_string()]);

        let mut remover = Contextor::new();
        remover.register("user:created", |record: &Record| {
            vec![ContextOp {
                op: ContextOpKind::Remove,
                key: "all-users".into(),
                stream: record.stream.clone(),
            }]
        });
        remover.push(&record, &provider).await.unwrap();

        let rows = provider.get_by_key("all-users").await.unwrap();
        assert!(rows.is_empty());
    }
}
