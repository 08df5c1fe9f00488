//! Subscription fan-out by event type (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PostInsertError;
use crate::event::Record;

/// Signals passed to a projection handler alongside the event.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionSignals {
    /// True iff the event arrived from an external source rather than
    /// being minted locally.
    pub hydrated: bool,
    /// True iff a newer event of the same `(stream, type)` already exists
    /// in storage at the time of projection.
    pub outdated: bool,
}

/// A handler invoked for every persisted event of a registered type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, record: &Record, signals: ProjectionSignals) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(&Record, ProjectionSignals) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, record: &Record, signals: ProjectionSignals) -> anyhow::Result<()> {
        self(record, signals).await
    }
}

/// Registry `type -> [handler]`. Handlers for a given event run
/// sequentially, in registration order; the caller (`Store::push`, via
/// [`crate::queue::StreamQueue`]) is responsible for per-stream ordering
/// across different `project` calls.
#[derive(Default, Clone)]
pub struct Projector {
    handlers: HashMap<String, Vec<Arc<dyn Handler>>>,
}

impl Projector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, r#type: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers
            .entry(r#type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invokes every handler registered for `record.type`, collecting
    /// errors rather than aborting on the first one — spec.md §4.6: handler
    /// errors never abort the insert, they are reported via `hooks.on_error`.
    pub async fn project(&self, record: &Record, signals: ProjectionSignals) -> Vec<PostInsertError> {
        let Some(handlers) = self.handlers.get(&record.r#type) else {
            return Vec::new();
        };

        let mut errors = Vec::new();
        for handler in handlers {
            if let Err(source) = handler.handle(record, signals).await {
                errors.push(PostInsertError::Projection {
                    event_id: record.id.clone(),
                    source,
                });
            }
        }
        errors
    }
}
