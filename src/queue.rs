//! Per-stream FIFO serialization (spec.md §4.5).
//!
//! Contextor and Projector side-effects for events on the same stream must
//! run in submission order, even under concurrent pushes to other streams.
//! One Tokio task per stream drains a bounded channel of boxed futures;
//! the task exits and its map entry is removed once the channel drains, so
//! the map doesn't grow unbounded under stream churn — grounded on spec.md
//! §9's own design note: "Promise-based per-stream serialization maps to a
//! worker task per stream reading a bounded channel."
//!
//! The map keeps the channel's `Sender` alive for as long as the entry
//! exists, so the worker loop can't detect "drained" by waiting for
//! `recv()` to return `None` — that would only happen once the map's own
//! clone dropped, which never happens while the entry is still there.
//! Instead each entry tracks a `pending` count of jobs accepted but not
//! yet finished; both the accept (in `sender_for`) and the completion
//! (in the worker loop) touch it under the same `workers` lock, so a
//! worker only removes its own entry when it observes the count at zero,
//! and a concurrent `sender_for` call for the same stream can never
//! observe a removed-but-still-draining entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Worker {
    sender: mpsc::Sender<Job>,
    pending: usize,
}

/// A map `stream -> single-worker FIFO`, used to serialize side-effects
/// per stream while letting different streams proceed concurrently.
#[derive(Clone)]
pub struct StreamQueue {
    workers: Arc<Mutex<HashMap<String, Worker>>>,
    capacity: usize,
}

impl StreamQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            workers: Arc::default(),
            capacity,
        }
    }

    /// Enqueues `job` for `stream`, returning a future that resolves once
    /// the job has run. At most one job per stream runs at a time;
    /// dropping the returned future does not remove the job from the
    /// queue (cancellation is advisory only, per spec.md §4.5).
    pub async fn enqueue<F, T>(&self, stream: &str, job: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let boxed: Job = Box::pin(async move {
            let result = job.await;
            // The receiver may have been dropped (cancellation); that's fine,
            // the job still ran to completion.
            let _ = tx.send(result);
        });

        self.sender_for(stream)
            .send(boxed)
            .await
            .expect("stream worker task does not exit while holding a live sender");

        rx.await.expect("stream worker task never drops the job before running it")
    }

    /// Returns a sender for `stream`'s worker, marking one more job as
    /// pending against it. Creates the worker if this is the first job for
    /// the stream (or the first since its previous worker drained).
    fn sender_for(&self, stream: &str) -> mpsc::Sender<Job> {
        let mut workers = self.workers.lock();

        if let Some(worker) = workers.get_mut(stream) {
            worker.pending += 1;
            return worker.sender.clone();
        }

        let (tx, mut rx) = mpsc::channel::<Job>(self.capacity);
        let workers_handle = self.workers.clone();
        let stream_key = stream.to_string();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;

                let mut workers = workers_handle.lock();
                if let Some(worker) = workers.get_mut(&stream_key) {
                    worker.pending -= 1;
                    if worker.pending == 0 {
                        workers.remove(&stream_key);
                        break;
                    }
                }
            }
        });

        workers.insert(
            stream.to_string(),
            Worker {
                sender: tx.clone(),
                pending: 1,
            },
        );
        tx
    }
}

impl Default for StreamQueue {
    fn default() -> Self {
        Self::new(64)
    }
}
