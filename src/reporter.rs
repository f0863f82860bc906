//! Batched completion reporting
//!
//! Executors and receivers produce completions one at a time; the
//! coordinator wants them in bulk. The reporter buckets ids per completion
//! kind and ships a bucket when it is full or old enough, in fixed-size
//! chunks sent concurrently. Delivery is fire and forget: a failed chunk is
//! logged, never re-queued, and the session end condition tolerates the gap
//! through its error counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::action::{ActionGroupId, CompletionKind, SessionId};
use crate::config::EngineConfig;
use crate::transport::CoordinatorClient;

/// Successes are bucketed per kind so each chunk maps to one coordinator
/// call; all errors share one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BucketKey {
    Done(CompletionKind),
    Error,
}

struct Bucket {
    ids: Vec<ActionGroupId>,
    opened_at: Instant,
}

struct Inner {
    session: SessionId,
    client: Arc<dyn CoordinatorClient>,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
    bucket_limit: usize,
    bucket_age: Duration,
    chunk_size: usize,
}

#[derive(Clone)]
pub struct ActionReporter {
    inner: Arc<Inner>,
}

impl ActionReporter {
    pub fn new(
        session: SessionId,
        client: Arc<dyn CoordinatorClient>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                client,
                buckets: Mutex::new(HashMap::new()),
                bucket_limit: config.report_bucket_limit,
                bucket_age: config.report_bucket_age,
                chunk_size: config.report_chunk_size,
            }),
        }
    }

    pub async fn report_success(&self, kind: CompletionKind, id: ActionGroupId) {
        self.push(BucketKey::Done(kind), id).await;
    }

    pub async fn report_error(&self, id: ActionGroupId) {
        self.push(BucketKey::Error, id).await;
    }

    async fn push(&self, key: BucketKey, id: ActionGroupId) {
        let full = {
            let mut buckets = self.inner.buckets.lock();
            let bucket = buckets.entry(key).or_insert_with(|| Bucket {
                ids: Vec::new(),
                opened_at: Instant::now(),
            });
            bucket.ids.push(id);
            if bucket.ids.len() >= self.inner.bucket_limit {
                buckets.remove(&key)
            } else {
                None
            }
        };
        if let Some(bucket) = full {
            self.send(key, bucket.ids).await;
        }
    }

    /// Ship every pending bucket regardless of size or age.
    pub async fn flush(&self) {
        let drained: Vec<(BucketKey, Bucket)> =
            self.inner.buckets.lock().drain().collect();
        for (key, bucket) in drained {
            self.send(key, bucket.ids).await;
        }
    }

    /// Ship buckets that sat unsent past the configured age.
    pub async fn flush_aged(&self) {
        let aged: Vec<(BucketKey, Bucket)> = {
            let mut buckets = self.inner.buckets.lock();
            let keys: Vec<BucketKey> = buckets
                .iter()
                .filter(|(_, b)| b.opened_at.elapsed() >= self.inner.bucket_age)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| buckets.remove(&k).map(|b| (k, b)))
                .collect()
        };
        for (key, bucket) in aged {
            self.send(key, bucket.ids).await;
        }
    }

    /// Background sweep for aged buckets, stopped through the token.
    pub fn spawn_age_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            let period = reporter.inner.bucket_age.min(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => reporter.flush_aged().await,
                }
            }
        })
    }

    async fn send(&self, key: BucketKey, ids: Vec<ActionGroupId>) {
        if ids.is_empty() {
            return;
        }
        debug!(?key, count = ids.len(), "shipping completion bucket");
        let mut chunks = JoinSet::new();
        for chunk in ids.chunks(self.inner.chunk_size) {
            let client = self.inner.client.clone();
            let session = self.inner.session.clone();
            let chunk = chunk.to_vec();
            chunks.spawn(async move {
                let outcome = match key {
                    BucketKey::Done(kind) => {
                        client.assert_action_done(&session, kind, &chunk).await
                    }
                    BucketKey::Error => client.assert_action_errors(&session, &chunk).await,
                };
                if let Err(e) = outcome {
                    warn!(?key, count = chunk.len(), %e, "completion chunk lost");
                }
            });
        }
        while chunks.join_next().await.is_some() {}
    }
}
