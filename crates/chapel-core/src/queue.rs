//! Durable operation queue and its drain routine.
//!
//! Mutations that could not reach the server are stored here and replayed
//! later, highest priority first and FIFO within a priority tier. At most
//! one drain runs at a time; an overlapping call returns immediately with a
//! skipped report so no operation is replayed twice concurrently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use chapel_store::QueueQuery;
use chapel_types::{HttpMethod, NewOperation, QueueStats, QueuedOperation};

use crate::SharedStore;
use crate::error::{Error, Result};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Default bound on a single replay.
pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Replays answered with 2xx.
    pub succeeded: u32,
    /// Replays the server reported as already applied or obsolete.
    pub conflicts: u32,
    /// Replays that failed this pass, including exhausted ones.
    pub failed: u32,
    /// Operations dropped after reaching their retry ceiling.
    pub exhausted: u32,
    /// Another drain was in flight; nothing was attempted.
    pub skipped: bool,
    /// Storage failures hit while recording replay results. The affected
    /// operations stay queued and are replayed again later.
    pub storage_errors: Vec<String>,
    pub duration: Duration,
}

impl DrainReport {
    /// Operations removed from the queue as delivered.
    pub fn success_count(&self) -> u32 {
        self.succeeded + self.conflicts
    }

    pub fn failed_count(&self) -> u32 {
        self.failed
    }

    /// Operations attempted in this pass.
    pub fn operations(&self) -> u32 {
        self.success_count() + self.failed
    }
}

enum Replay {
    Applied,
    Conflict(u16),
    Failed(String),
}

/// Whether a non-2xx answer means the mutation is already reflected
/// server-side.
fn is_conflict(method: HttpMethod, status: u16) -> bool {
    status == 409 || (method == HttpMethod::Delete && matches!(status, 404 | 410))
}

/// Durable list of pending mutations awaiting replay.
pub struct OperationQueue {
    store: SharedStore,
    transport: Arc<dyn Transport>,
    drain_lock: Mutex<()>,
    replay_timeout: Duration,
}

impl OperationQueue {
    pub fn new(store: SharedStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            drain_lock: Mutex::new(()),
            replay_timeout: DEFAULT_REPLAY_TIMEOUT,
        }
    }

    /// Bound each replay so a hung request cannot stall the drain.
    #[must_use]
    pub fn with_replay_timeout(mut self, timeout: Duration) -> Self {
        self.replay_timeout = timeout;
        self
    }

    /// Persist a mutation and return its id.
    pub async fn enqueue(&self, op: NewOperation) -> Result<String> {
        let op = QueuedOperation::from_new(op, OffsetDateTime::now_utc());
        self.store.lock().await.enqueue_operation(&op)?;
        info!(
            "Queued {} {} as {} ({} priority)",
            op.method, op.endpoint, op.id, op.priority
        );
        Ok(op.id)
    }

    /// Snapshot of the queue in replay order.
    pub async fn pending(&self) -> Result<Vec<QueuedOperation>> {
        Ok(self.store.lock().await.pending_operations()?)
    }

    pub async fn pending_matching(&self, query: &QueueQuery) -> Result<Vec<QueuedOperation>> {
        Ok(self.store.lock().await.query_operations(query)?)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.store.lock().await.queue_stats()?)
    }

    pub async fn len(&self) -> Result<u64> {
        Ok(self.store.lock().await.count_operations()?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.store.lock().await.delete_operation(id)?)
    }

    pub async fn clear(&self) -> Result<usize> {
        let n = self.store.lock().await.clear_queue()?;
        info!("Cleared {} queued operations", n);
        Ok(n)
    }

    /// Whether a drain is currently in flight.
    pub fn is_draining(&self) -> bool {
        self.drain_lock.try_lock().is_err()
    }

    /// Replay every queued operation once.
    ///
    /// Successes and conflicts are removed; failures bump `retry_count` and
    /// operations reaching `max_retries` are dropped and counted in
    /// [`DrainReport::exhausted`]. A storage failure on one operation is
    /// recorded in [`DrainReport::storage_errors`] and the pass continues.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already in progress, skipping");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        };

        let started = Instant::now();
        let ops = self.pending().await?;
        let mut report = DrainReport::default();

        if ops.is_empty() {
            debug!("Queue empty, nothing to drain");
            report.duration = started.elapsed();
            return Ok(report);
        }

        info!("Draining {} queued operation(s)", ops.len());

        for op in ops {
            let replay = self.replay(&op).await;
            if let Err(e) = self.settle(&op, replay, &mut report).await {
                error!(
                    "Failed to record replay result for {} {} ({}): {}",
                    op.method, op.endpoint, op.id, e
                );
                report.storage_errors.push(format!("{}: {}", op.id, e));
            }
        }

        report.duration = started.elapsed();
        info!(
            "Drain finished in {:?}: {} succeeded, {} conflicts, {} failed, {} dropped",
            report.duration, report.succeeded, report.conflicts, report.failed, report.exhausted
        );
        Ok(report)
    }

    /// Apply one replay result to the store and the report.
    async fn settle(
        &self,
        op: &QueuedOperation,
        replay: Replay,
        report: &mut DrainReport,
    ) -> Result<()> {
        match replay {
            Replay::Applied => {
                self.store.lock().await.delete_operation(&op.id)?;
                report.succeeded += 1;
                debug!("Replayed {} {} ({})", op.method, op.endpoint, op.id);
            }
            Replay::Conflict(status) => {
                self.store.lock().await.delete_operation(&op.id)?;
                report.conflicts += 1;
                info!(
                    "Server answered {} for {} {} ({}), treating as applied",
                    status, op.method, op.endpoint, op.id
                );
            }
            Replay::Failed(message) => {
                report.failed += 1;
                let retry_count = op.retry_count + 1;
                let store = self.store.lock().await;
                if retry_count >= op.max_retries {
                    store.delete_operation(&op.id)?;
                    report.exhausted += 1;
                    error!(
                        "Dropping {} {} ({}) after {} failed attempts: {}",
                        op.method, op.endpoint, op.id, retry_count, message
                    );
                } else {
                    store.record_operation_failure(
                        &op.id,
                        retry_count,
                        &message,
                        OffsetDateTime::now_utc(),
                    )?;
                    warn!(
                        "Replay of {} {} failed (attempt {}/{}): {}",
                        op.method, op.endpoint, retry_count, op.max_retries, message
                    );
                }
            }
        }
        Ok(())
    }

    async fn replay(&self, op: &QueuedOperation) -> Replay {
        let body = if op.method.has_body() {
            op.payload.clone()
        } else {
            None
        };
        let request = HttpRequest::new(op.method, op.endpoint.as_str())
            .header("Content-Type", "application/json")
            .headers(&op.headers)
            .body(body);

        let result = tokio::time::timeout(self.replay_timeout, self.transport.send(request))
            .await
            .unwrap_or_else(|_| {
                Err(Error::timeout(
                    format!("replay {}", op.id),
                    self.replay_timeout,
                ))
            });

        match result {
            Ok(HttpResponse { status, .. }) if (200..300).contains(&status) => Replay::Applied,
            Ok(HttpResponse { status, .. }) if is_conflict(op.method, status) => {
                Replay::Conflict(status)
            }
            Ok(HttpResponse { status, .. }) => {
                Replay::Failed(Error::http(op.endpoint.as_str(), status).to_string())
            }
            Err(e) => Replay::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use chapel_store::Store;
    use chapel_types::{OperationType, Priority};
    use serde_json::json;

    fn setup() -> (OperationQueue, Arc<MockTransport>) {
        let store = Arc::new(tokio::sync::Mutex::new(Store::open_in_memory().unwrap()));
        let mock = Arc::new(MockTransport::new());
        (OperationQueue::new(store, mock.clone()), mock)
    }

    fn put(endpoint: &str, priority: Priority) -> NewOperation {
        NewOperation::new(OperationType::Update, HttpMethod::Put, endpoint)
            .payload(json!({"status": "done"}))
            .priority(priority)
    }

    #[tokio::test]
    async fn test_enqueue_assigns_id() {
        let (queue, _) = setup();
        let id = queue.enqueue(put("/api/tasks/5", Priority::Normal)).await.unwrap();
        assert!(id.starts_with("op_"));

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(pending[0].endpoint, "/api/tasks/5");
    }

    #[tokio::test]
    async fn test_drain_priority_then_fifo() {
        let (queue, mock) = setup();
        mock.set_fallback(HttpResponse::new(200)).await;

        queue.enqueue(put("/api/o1", Priority::High)).await.unwrap();
        queue.enqueue(put("/api/o2", Priority::Normal)).await.unwrap();
        queue.enqueue(put("/api/o3", Priority::High)).await.unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.succeeded, 3);

        let order: Vec<String> = mock.requests().await.into_iter().map(|r| r.url).collect();
        assert_eq!(order, vec!["/api/o1", "/api/o3", "/api/o2"]);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_sends_body_and_headers() {
        let (queue, mock) = setup();
        mock.set_fallback(HttpResponse::new(200)).await;
        queue
            .enqueue(put("/api/tasks/5", Priority::Normal).header("X-Church", "7"))
            .await
            .unwrap();
        queue
            .enqueue(
                NewOperation::new(OperationType::Delete, HttpMethod::Delete, "/api/tasks/6")
                    .payload(json!({"ignored": true})),
            )
            .await
            .unwrap();

        queue.drain().await.unwrap();
        let requests = mock.requests().await;
        assert_eq!(requests[0].body, Some(json!({"status": "done"})));
        assert_eq!(requests[0].headers.get("X-Church").map(String::as_str), Some("7"));
        assert_eq!(
            requests[0].headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(requests[1].body, None);
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let (queue, mock) = setup();
        mock.set_offline(true);
        queue
            .enqueue(put("/api/tasks/5", Priority::Normal).max_retries(3))
            .await
            .unwrap();

        for attempt in 1..=2 {
            let report = queue.drain().await.unwrap();
            assert_eq!(report.failed, 1);
            assert_eq!(report.exhausted, 0);
            let pending = queue.pending().await.unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].retry_count, attempt);
            assert!(pending[0].last_error.is_some());
        }

        let report = queue.drain().await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_non_2xx_counts_as_failure() {
        let (queue, mock) = setup();
        mock.set_fallback(HttpResponse::new(500)).await;
        queue.enqueue(put("/api/tasks/5", Priority::Normal)).await.unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.failed_count(), 1);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_are_removed() {
        let (queue, mock) = setup();
        mock.respond(HttpMethod::Put, "/api/tasks/5", HttpResponse::new(409))
            .await;
        mock.respond(HttpMethod::Delete, "/api/tasks/6", HttpResponse::new(404))
            .await;
        queue.enqueue(put("/api/tasks/5", Priority::Normal)).await.unwrap();
        queue
            .enqueue(NewOperation::new(
                OperationType::Delete,
                HttpMethod::Delete,
                "/api/tasks/6",
            ))
            .await
            .unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.conflicts, 2);
        assert_eq!(report.success_count(), 2);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_replaying_applied_mutation_twice() {
        let (queue, mock) = setup();
        mock.respond(HttpMethod::Put, "/api/tasks/5", HttpResponse::new(200))
            .await;
        queue.enqueue(put("/api/tasks/5", Priority::Normal)).await.unwrap();
        queue.enqueue(put("/api/tasks/5", Priority::Normal)).await.unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_overlapping_drains_replay_once() {
        let (queue, mock) = setup();
        mock.set_fallback(HttpResponse::new(201)).await;
        mock.set_latency(Duration::from_millis(20));
        for i in 0..3 {
            queue
                .enqueue(put(&format!("/api/tasks/{}", i), Priority::Normal))
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(queue.drain(), queue.drain());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.skipped != b.skipped);
        assert_eq!(a.succeeded + b.succeeded, 3);
        assert_eq!(mock.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_replay_times_out() {
        let (queue, mock) = setup();
        let queue = queue.with_replay_timeout(Duration::from_secs(1));
        mock.set_latency(Duration::from_secs(60));
        queue.enqueue(put("/api/tasks/5", Priority::Normal)).await.unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        let pending = queue.pending().await.unwrap();
        assert!(pending[0].last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let (queue, _) = setup();
        let id = queue.enqueue(put("/api/a", Priority::Low)).await.unwrap();
        queue.enqueue(put("/api/b", Priority::Low)).await.unwrap();

        assert!(queue.remove(&id).await.unwrap());
        assert!(!queue.remove(&id).await.unwrap());
        assert_eq!(queue.clear().await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().total, 0);
    }

    /// Backend that removes the operation it is replaying from the store,
    /// so recording the failed attempt hits a storage error.
    struct VanishingTransport {
        store: SharedStore,
    }

    #[async_trait::async_trait]
    impl Transport for VanishingTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            if request.url == "/api/a" {
                return Err(Error::transport(&request.url, "network unreachable"));
            }
            let store = self.store.lock().await;
            for op in store.pending_operations().unwrap() {
                if op.endpoint == request.url {
                    store.delete_operation(&op.id).unwrap();
                }
            }
            Ok(HttpResponse::new(500))
        }
    }

    #[tokio::test]
    async fn test_storage_error_keeps_partial_report() {
        let store: SharedStore = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let transport = Arc::new(VanishingTransport {
            store: store.clone(),
        });
        let queue = OperationQueue::new(store, transport);
        queue
            .enqueue(put("/api/a", Priority::High).max_retries(1))
            .await
            .unwrap();
        queue.enqueue(put("/api/b", Priority::Normal)).await.unwrap();
        queue.enqueue(put("/api/c", Priority::Low)).await.unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.failed, 3);
        assert_eq!(report.storage_errors.len(), 2);
        assert!(queue.is_empty().await.unwrap());
    }
}
