//! Worker pool scheduler: round-robin dispatch, crash eviction, one retry.
//!
//! The pool owns the set of workers, rotates through them per job, and
//! bridges each dispatch to its asynchronous completion through the bus. A
//! crashed worker is evicted by the supervisor and never replaced; under
//! sustained failures the pool can shrink to zero, at which point dispatch
//! reports a configuration failure instead of hanging.

use crate::{
    CompletionBus, JobId, JobOutcome, PoolOptions, RenderError, RenderRequest, RenderStats,
    StatsSnapshot, Worker, WorkerExit,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Ordered collection with a head-to-tail rotation cursor.
#[derive(Debug)]
pub struct Ring<W> {
    entries: VecDeque<W>,
}

impl<W> Ring<W> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: W) {
        self.entries.push_back(entry);
    }

    /// Round-robin checkout: return the head entry and move it to the tail.
    pub fn checkout(&mut self) -> Option<W>
    where
        W: Clone,
    {
        let entry = self.entries.pop_front()?;
        self.entries.push_back(entry.clone());
        Some(entry)
    }

    /// Remove the first entry matching `predicate`, preserving order.
    pub fn evict(&mut self, predicate: impl Fn(&W) -> bool) -> Option<W> {
        let position = self.entries.iter().position(predicate)?;
        self.entries.remove(position)
    }

    pub fn drain(&mut self) -> Vec<W> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<W> Default for Ring<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `attempt` once, and exactly once more if the first outcome is a
/// retryable failure. The second outcome is final either way.
pub(crate) async fn attempt_with_retry<F, Fut>(mut attempt: F) -> JobOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = JobOutcome>,
{
    match attempt().await {
        Ok(image) => Ok(image),
        Err(err) if err.is_retryable() => {
            info!("first render attempt failed, retrying once: {err}");
            attempt().await
        }
        Err(err) => Err(err),
    }
}

/// The caller-facing scheduler over a set of browser workers.
///
/// # Examples
///
/// ```rust,no_run
/// use render_pool::{PoolOptions, RenderPool, RenderRequest};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let options = PoolOptions {
///         worker_count: 2,
///         executable_path: Some("/usr/bin/chromium".into()),
///         ..Default::default()
///     };
///     let pool = RenderPool::launch(options).await?;
///
///     let request = RenderRequest {
///         source: "https://example.com".to_string(),
///         ..Default::default()
///     };
///     let image = pool.render(request).await?;
///     println!("captured {} bytes", image.byte_len());
///
///     pool.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct RenderPool {
    ring: Arc<Mutex<Ring<Arc<Worker>>>>,
    bus: Arc<CompletionBus>,
    stats: Arc<RenderStats>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl RenderPool {
    /// Launch the configured number of workers sequentially and start the
    /// crash supervisor.
    ///
    /// The browser executable must already be provisioned; a missing path or
    /// any worker failing to launch is fatal and propagated.
    pub async fn launch(options: PoolOptions) -> Result<Self, RenderError> {
        let executable = options.executable_path.clone().ok_or_else(|| {
            RenderError::Configuration("no browser executable configured".to_string())
        })?;

        let bus = Arc::new(CompletionBus::new());
        let stats = Arc::new(RenderStats::new());
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<WorkerExit>();

        let mut ring = Ring::new();
        let count = options.worker_count.max(1);
        for id in 0..count {
            let worker = Worker::launch(
                id,
                &options,
                &executable,
                bus.clone(),
                stats.clone(),
                exit_tx.clone(),
            )
            .await?;
            ring.push(Arc::new(worker));
        }
        info!("render pool ready with {count} worker(s)");

        let ring = Arc::new(Mutex::new(ring));
        let supervisor = {
            let ring = ring.clone();
            tokio::spawn(async move {
                while let Some(exit) = exit_rx.recv().await {
                    let mut ring = ring.lock().await;
                    if let Some(worker) =
                        ring.evict(|worker: &Arc<Worker>| worker.id == exit.worker_id)
                    {
                        warn!(
                            "[pool] evicted crashed worker {} with {} job(s) in flight ({} left)",
                            exit.worker_id,
                            worker.in_flight(),
                            ring.len()
                        );
                    }
                }
            })
        };

        Ok(Self {
            ring,
            bus,
            stats,
            supervisor,
        })
    }

    /// Render one request, re-attempting the whole job once if the first
    /// attempt fails for a transient reason (a worker that just crashed, a
    /// page that briefly failed to load).
    pub async fn render(&self, request: RenderRequest) -> JobOutcome {
        attempt_with_retry(|| self.dispatch(&request)).await
    }

    /// Single dispatch attempt: rotate the ring, hand the job over, await
    /// the correlated completion.
    async fn dispatch(&self, request: &RenderRequest) -> JobOutcome {
        let job_id: JobId = Uuid::new_v4();
        let worker = self
            .ring
            .lock()
            .await
            .checkout()
            .ok_or(RenderError::PoolExhausted)?;

        // Subscribe before handing the job over so completion cannot race
        // the registration.
        let ticket = self.bus.subscribe_once(&job_id.to_string());
        worker.run_job(job_id, request.clone());

        ticket.wait().await.unwrap_or(Err(RenderError::Delivery))
    }

    /// Workers currently in the ring.
    pub async fn worker_count(&self) -> usize {
        self.ring.lock().await.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop supervision and close every worker.
    pub async fn shutdown(&self) {
        self.supervisor.abort();
        let workers = self.ring.lock().await.drain();
        for worker in workers {
            worker.close().await;
        }
        info!("render pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageData;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn checkout_rotates_head_to_tail() {
        let mut ring = Ring::new();
        ring.push(0u32);
        ring.push(1);
        ring.push(2);

        // One full rotation assigns each entry exactly once.
        assert_eq!(ring.checkout(), Some(0));
        assert_eq!(ring.checkout(), Some(1));
        assert_eq!(ring.checkout(), Some(2));
        // The cursor wraps.
        assert_eq!(ring.checkout(), Some(0));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn eviction_shrinks_by_one_and_preserves_order() {
        let mut ring = Ring::new();
        ring.push(0u32);
        ring.push(1);
        ring.push(2);

        assert_eq!(ring.evict(|w| *w == 1), Some(1));
        assert_eq!(ring.len(), 2);

        assert_eq!(ring.checkout(), Some(0));
        assert_eq!(ring.checkout(), Some(2));
        assert_eq!(ring.checkout(), Some(0));
    }

    #[test]
    fn evicting_unknown_entry_is_a_noop() {
        let mut ring = Ring::new();
        ring.push(7u32);
        assert_eq!(ring.evict(|w| *w == 9), None);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn empty_ring_checks_out_nothing() {
        let mut ring: Ring<u32> = Ring::new();
        assert_eq!(ring.checkout(), None);
    }

    #[tokio::test]
    async fn retry_returns_second_attempt_success() {
        let calls = AtomicUsize::new(0);
        let outcome = attempt_with_retry(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(RenderError::EmptyImage)
                } else {
                    Ok(ImageData::Binary(vec![1]))
                }
            }
        })
        .await;

        assert!(outcome.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_returns_second_failure_and_stops() {
        let calls = AtomicUsize::new(0);
        let outcome = attempt_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RenderError::Navigation("net::ERR_FAILED".to_string())) }
        })
        .await;

        assert!(matches!(outcome, Err(RenderError::Navigation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let outcome = attempt_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RenderError::MissingSource) }
        })
        .await;

        assert!(matches!(outcome, Err(RenderError::MissingSource)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_success_skips_the_retry() {
        let calls = AtomicUsize::new(0);
        let outcome = attempt_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(ImageData::Binary(vec![9])) }
        })
        .await;

        assert!(outcome.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
