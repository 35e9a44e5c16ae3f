//! Dynamic request batching
//!
//! Converts a high-concurrency stream of individual requests into a serial
//! stream of batches handed to a user-supplied compute callback. A batch is
//! dispatched when it reaches `max_batch_size` or when `batch_timeout` has
//! elapsed since its first request arrived, whichever comes first. Each
//! caller blocks in [`BatchCoalescer::submit`] until its own slot is filled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::utils::error::{MeshError, Result};

/// Batch-execution callback. Must return exactly one response per request,
/// index-aligned with the batch.
pub type ComputeFn<Req, Resp> =
    Arc<dyn Fn(Vec<Req>) -> BoxFuture<'static, Result<Vec<Resp>>> + Send + Sync>;

/// Why a batch was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    /// The batch reached `max_batch_size`.
    Full,
    /// The batch window expired with a partial batch.
    Timeout,
}

/// Configuration for the coalescer
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Hard upper bound on batch length.
    pub max_batch_size: usize,

    /// Maximum extra time a partial batch waits after its first request.
    pub batch_timeout: Duration,

    /// Maximum time a caller waits in `submit` for its response.
    pub submit_timeout: Duration,

    /// Ingress queue capacity; overflow fails fast with `QueueFull`.
    pub queue_capacity: usize,

    /// How long `stop` waits for the dispatch task before abandoning it.
    pub join_timeout: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            batch_timeout: Duration::from_millis(20),
            submit_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl CoalescerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(MeshError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(MeshError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batch processing metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoalescerMetrics {
    pub total_requests: u64,
    pub total_batches: u64,
    pub full_batches: u64,
    pub timeout_batches: u64,
    pub avg_batch_size: f64,
}

impl CoalescerMetrics {
    /// `trigger` is `None` for drain flushes (closed ingress); those count
    /// toward the totals but are neither FULL nor TIMEOUT batches.
    fn record_batch(&mut self, size: usize, trigger: Option<BatchTrigger>) {
        self.total_batches += 1;
        match trigger {
            Some(BatchTrigger::Full) => self.full_batches += 1,
            Some(BatchTrigger::Timeout) => self.timeout_batches += 1,
            None => {}
        }
        let n = self.total_batches as f64;
        self.avg_batch_size = (self.avg_batch_size * (n - 1.0) + size as f64) / n;
    }
}

/// A request waiting in the coalescer, paired with its completion slot.
struct Pending<Req, Resp> {
    id: Uuid,
    request: Req,
    slot: oneshot::Sender<Result<Resp>>,
}

struct DispatchState<Req, Resp> {
    /// Consumed by `start`; present only before the dispatch task exists.
    rx: Option<mpsc::Receiver<Pending<Req, Resp>>>,
    handle: Option<JoinHandle<()>>,
}

/// Groups concurrent requests into batches for a compute callback.
pub struct BatchCoalescer<Req, Resp> {
    tx: mpsc::Sender<Pending<Req, Resp>>,
    config: CoalescerConfig,
    compute: ComputeFn<Req, Resp>,
    metrics: Arc<Mutex<CoalescerMetrics>>,
    shutdown: CancellationToken,
    dispatch: Mutex<DispatchState<Req, Resp>>,
}

impl<Req, Resp> BatchCoalescer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(config: CoalescerConfig, compute: ComputeFn<Req, Resp>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            tx,
            config,
            compute,
            metrics: Arc::new(Mutex::new(CoalescerMetrics::default())),
            shutdown: CancellationToken::new(),
            dispatch: Mutex::new(DispatchState {
                rx: Some(rx),
                handle: None,
            }),
        }
    }

    /// Spawn the dispatch task. Idempotent.
    pub fn start(&self) {
        let mut state = self.dispatch.lock().unwrap();
        if let Some(rx) = state.rx.take() {
            let handle = tokio::spawn(dispatch_loop(
                rx,
                self.compute.clone(),
                self.metrics.clone(),
                self.shutdown.clone(),
                self.config.clone(),
            ));
            state.handle = Some(handle);
        }
    }

    /// Signal the dispatch task to drain and exit, then wait a bounded time
    /// for it to finish. Still-pending requests complete with `ShuttingDown`.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let (rx, handle) = {
            let mut state = self.dispatch.lock().unwrap();
            (state.rx.take(), state.handle.take())
        };

        // Never started: fail whatever was queued ourselves.
        if let Some(mut rx) = rx {
            rx.close();
            while let Ok(pending) = rx.try_recv() {
                let _ = pending.slot.send(Err(MeshError::ShuttingDown));
            }
        }

        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.config.join_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("dispatch task did not stop within join timeout, abandoning it");
                handle.abort();
            }
        }
    }

    /// Enqueue a request and wait for its response.
    ///
    /// Concurrent submits are safe. A caller whose `submit_timeout` expires
    /// gets `SubmitTimeout`; the request may still be dispatched afterwards
    /// (the slot write is non-blocking and simply lands in a dropped slot).
    pub async fn submit(&self, request: Req) -> Result<Resp> {
        if self.shutdown.is_cancelled() {
            return Err(MeshError::ShuttingDown);
        }

        let id = Uuid::new_v4();
        let (slot_tx, slot_rx) = oneshot::channel();
        let pending = Pending {
            id,
            request,
            slot: slot_tx,
        };

        self.tx.try_send(pending).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MeshError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => MeshError::ShuttingDown,
        })?;
        self.metrics.lock().unwrap().total_requests += 1;
        debug!(request_id = %id, "request enqueued for batching");

        match tokio::time::timeout(self.config.submit_timeout, slot_rx).await {
            Ok(Ok(result)) => result,
            // Slot dropped without a write: the dispatch task was abandoned.
            Ok(Err(_)) => Err(MeshError::ShuttingDown),
            Err(_) => Err(MeshError::SubmitTimeout),
        }
    }

    /// Consistent snapshot of the batching metrics.
    pub fn metrics(&self) -> CoalescerMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }
}

/// The single dispatch task: assembles batches and runs the compute callback.
///
/// Waits on the ingress are bounded by the remaining batch window once a
/// batch is open, and unbounded while it is empty.
async fn dispatch_loop<Req, Resp>(
    mut rx: mpsc::Receiver<Pending<Req, Resp>>,
    compute: ComputeFn<Req, Resp>,
    metrics: Arc<Mutex<CoalescerMetrics>>,
    shutdown: CancellationToken,
    config: CoalescerConfig,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let mut batch: Vec<Pending<Req, Resp>> = Vec::new();
    let mut deadline = Instant::now();

    loop {
        if batch.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(pending) => {
                        batch.push(pending);
                        deadline = Instant::now() + config.batch_timeout;
                        if batch.len() >= config.max_batch_size {
                            flush(&mut batch, Some(BatchTrigger::Full), &compute, &metrics).await;
                        }
                    }
                    None => break,
                },
            }
        } else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = tokio::time::timeout_at(deadline, rx.recv()) => match result {
                    Ok(Some(pending)) => {
                        batch.push(pending);
                        if batch.len() >= config.max_batch_size {
                            flush(&mut batch, Some(BatchTrigger::Full), &compute, &metrics).await;
                        }
                    }
                    // Channel closed: flush what we have and exit. Not a
                    // deadline expiry, so no trigger is attributed.
                    Ok(None) => {
                        flush(&mut batch, None, &compute, &metrics).await;
                        break;
                    }
                    // Batch window expired.
                    Err(_) => {
                        flush(&mut batch, Some(BatchTrigger::Timeout), &compute, &metrics).await;
                    }
                },
            }
        }
    }

    // Drain: everything still queued or assembled fails with ShuttingDown.
    for pending in batch.drain(..) {
        let _ = pending.slot.send(Err(MeshError::ShuttingDown));
    }
    rx.close();
    while let Ok(pending) = rx.try_recv() {
        let _ = pending.slot.send(Err(MeshError::ShuttingDown));
    }
}

async fn flush<Req, Resp>(
    batch: &mut Vec<Pending<Req, Resp>>,
    trigger: Option<BatchTrigger>,
    compute: &ComputeFn<Req, Resp>,
    metrics: &Arc<Mutex<CoalescerMetrics>>,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let size = batch.len();
    debug!(batch_size = size, ?trigger, "dispatching batch");

    let (requests, slots): (Vec<Req>, Vec<(Uuid, oneshot::Sender<Result<Resp>>)>) = batch
        .drain(..)
        .map(|p| (p.request, (p.id, p.slot)))
        .unzip();

    match (compute)(requests).await {
        Ok(responses) if responses.len() == size => {
            for (response, (_, slot)) in responses.into_iter().zip(slots) {
                let _ = slot.send(Ok(response));
            }
        }
        Ok(responses) => {
            // Index alignment broken; fail the whole batch rather than
            // guess which response belongs to which caller.
            let message = format!(
                "compute returned {} responses for a batch of {}",
                responses.len(),
                size
            );
            warn!("{}", message);
            for (id, slot) in slots {
                debug!(request_id = %id, "failing misaligned batch entry");
                let _ = slot.send(Err(MeshError::Compute(message.clone())));
            }
        }
        Err(err) => {
            let message = err.to_string();
            warn!(batch_size = size, error = %message, "batch compute failed");
            for (_, slot) in slots {
                let _ = slot.send(Err(MeshError::Compute(message.clone())));
            }
        }
    }

    metrics.lock().unwrap().record_batch(size, trigger);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_compute(batch_sizes: Arc<Mutex<Vec<usize>>>) -> ComputeFn<String, String> {
        Arc::new(move |batch: Vec<String>| {
            batch_sizes.lock().unwrap().push(batch.len());
            async move {
                Ok(batch
                    .into_iter()
                    .map(|req| format!("result_{}", req))
                    .collect())
            }
            .boxed()
        })
    }

    fn coalescer(
        max_batch_size: usize,
        timeout_ms: u64,
        compute: ComputeFn<String, String>,
    ) -> Arc<BatchCoalescer<String, String>> {
        let config = CoalescerConfig {
            max_batch_size,
            batch_timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        };
        let coalescer = Arc::new(BatchCoalescer::new(config, compute));
        coalescer.start();
        coalescer
    }

    #[tokio::test(start_paused = true)]
    async fn staggered_submits_batch_in_order() {
        let batch_sizes = Arc::new(Mutex::new(Vec::new()));
        let coalescer = coalescer(10, 50, echo_compute(batch_sizes.clone()));

        let mut handles = Vec::new();
        for i in 0..50u32 {
            let coalescer = coalescer.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2 * u64::from(i))).await;
                coalescer.submit(format!("req_{}", i)).await
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result, format!("result_req_{}", i));
        }

        let metrics = coalescer.metrics();
        assert_eq!(metrics.total_requests, 50);
        assert!(metrics.total_batches >= 5);

        let sizes = batch_sizes.lock().unwrap();
        assert_eq!(sizes.iter().sum::<usize>(), 50);
        assert!(sizes.iter().all(|&s| (1..=10).contains(&s)));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_fills_a_single_full_batch() {
        let batch_sizes = Arc::new(Mutex::new(Vec::new()));
        let coalescer = coalescer(32, 50, echo_compute(batch_sizes.clone()));

        let mut handles = Vec::new();
        for i in 0..32u32 {
            let coalescer = coalescer.clone();
            handles.push(tokio::spawn(
                async move { coalescer.submit(format!("req_{}", i)).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let metrics = coalescer.metrics();
        assert_eq!(metrics.total_batches, 1);
        assert_eq!(metrics.full_batches, 1);
        assert_eq!(metrics.timeout_batches, 0);
        assert!((metrics.avg_batch_size - 32.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_when_window_expires() {
        let dispatch_times = Arc::new(Mutex::new(Vec::new()));
        let times = dispatch_times.clone();
        let compute: ComputeFn<String, String> = Arc::new(move |batch: Vec<String>| {
            times.lock().unwrap().push(Instant::now());
            async move {
                Ok(batch
                    .into_iter()
                    .map(|req| format!("result_{}", req))
                    .collect())
            }
            .boxed()
        });
        let coalescer = coalescer(10, 50, compute);

        let started = Instant::now();
        let mut handles = Vec::new();
        for i in 0..3u32 {
            let coalescer = coalescer.clone();
            handles.push(tokio::spawn(
                async move { coalescer.submit(format!("req_{}", i)).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let metrics = coalescer.metrics();
        assert_eq!(metrics.total_batches, 1);
        assert_eq!(metrics.timeout_batches, 1);
        assert!((metrics.avg_batch_size - 3.0).abs() < f64::EPSILON);

        let dispatched_at = dispatch_times.lock().unwrap()[0];
        let waited = dispatched_at.duration_since(started);
        assert!(waited >= Duration::from_millis(50), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(60), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn compute_failure_is_contained_to_its_batch() {
        let compute: ComputeFn<String, String> = Arc::new(|batch: Vec<String>| {
            async move {
                if batch.iter().any(|req| req == "poison") {
                    return Err(MeshError::Compute("marker request".to_string()));
                }
                Ok(batch
                    .into_iter()
                    .map(|req| format!("result_{}", req))
                    .collect())
            }
            .boxed()
        });
        let coalescer = coalescer(8, 20, compute);

        let mut handles = Vec::new();
        for req in ["a", "poison", "b"] {
            let coalescer = coalescer.clone();
            handles.push(tokio::spawn(
                async move { coalescer.submit(req.to_string()).await },
            ));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(MeshError::Compute(_))));
        }

        // The coalescer stays healthy for unrelated work.
        let ok = coalescer.submit("ok".to_string()).await.unwrap();
        assert_eq!(ok, "result_ok");
        assert_eq!(coalescer.metrics().total_batches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_compute_times_out_the_caller() {
        let compute: ComputeFn<String, String> =
            Arc::new(|_batch| futures::future::pending().boxed());
        let coalescer = coalescer(4, 10, compute);

        let result = coalescer.submit("req".to_string()).await;
        assert!(matches!(result, Err(MeshError::SubmitTimeout)));
    }

    #[tokio::test]
    async fn bounded_queue_fails_fast_when_full() {
        let config = CoalescerConfig {
            max_batch_size: 4,
            queue_capacity: 1,
            ..Default::default()
        };
        let coalescer: Arc<BatchCoalescer<String, String>> = Arc::new(BatchCoalescer::new(
            config,
            Arc::new(|batch: Vec<String>| async move { Ok(batch) }.boxed()),
        ));
        // Dispatch deliberately not started so the first submit stays queued.
        let queued = coalescer.clone();
        let first = tokio::spawn(async move { queued.submit("first".to_string()).await });
        tokio::task::yield_now().await;

        let result = coalescer.submit("second".to_string()).await;
        assert!(matches!(result, Err(MeshError::QueueFull)));

        coalescer.stop().await;
        assert!(matches!(
            first.await.unwrap(),
            Err(MeshError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn closed_ingress_flushes_without_trigger_attribution() {
        let (tx, rx) = mpsc::channel(8);
        let metrics = Arc::new(Mutex::new(CoalescerMetrics::default()));
        let config = CoalescerConfig {
            max_batch_size: 10,
            // Far enough out that the deadline cannot be what flushes.
            batch_timeout: Duration::from_secs(3600),
            ..Default::default()
        };

        let mut slots = Vec::new();
        for i in 0..2u32 {
            let (slot_tx, slot_rx) = oneshot::channel();
            tx.send(Pending {
                id: Uuid::new_v4(),
                request: format!("req_{}", i),
                slot: slot_tx,
            })
            .await
            .unwrap();
            slots.push(slot_rx);
        }
        // Dropping the last sender closes the ingress mid-batch.
        drop(tx);

        dispatch_loop(
            rx,
            echo_compute(Arc::new(Mutex::new(Vec::new()))),
            metrics.clone(),
            CancellationToken::new(),
            config,
        )
        .await;

        for (i, slot) in slots.into_iter().enumerate() {
            assert_eq!(slot.await.unwrap().unwrap(), format!("result_req_{}", i));
        }

        let metrics = metrics.lock().unwrap();
        assert_eq!(metrics.total_batches, 1);
        assert_eq!(metrics.full_batches, 0);
        assert_eq!(metrics.timeout_batches, 0);
        assert!((metrics.avg_batch_size - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stop_fails_pending_and_rejects_new_submits() {
        let batch_sizes = Arc::new(Mutex::new(Vec::new()));
        let coalescer = coalescer(4, 10, echo_compute(batch_sizes));

        coalescer.stop().await;

        let result = coalescer.submit("late".to_string()).await;
        assert!(matches!(result, Err(MeshError::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn every_submit_completes_exactly_once() {
        let completions = Arc::new(AtomicUsize::new(0));
        let batch_sizes = Arc::new(Mutex::new(Vec::new()));
        let coalescer = coalescer(16, 5, echo_compute(batch_sizes));

        let mut handles = Vec::new();
        for i in 0..100u32 {
            let coalescer = coalescer.clone();
            let completions = completions.clone();
            handles.push(tokio::spawn(async move {
                let result = coalescer.submit(format!("req_{}", i)).await.unwrap();
                assert_eq!(result, format!("result_req_{}", i));
                completions.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(completions.load(Ordering::SeqCst), 100);
        assert_eq!(coalescer.metrics().total_requests, 100);
    }
}
