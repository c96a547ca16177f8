//! One managed browser process and its bookkeeping.
//!
//! A worker owns a launched Chrome process, the ledger of jobs currently in
//! flight on it, and a monitor task watching the process for disconnection.
//! On disconnect the worker announces its exit to the pool, force-fails every
//! ledgered job so no caller is left waiting, and closes what remains of the
//! process.

use crate::{
    browser_config, executor, CompletionBus, JobId, PoolOptions, RenderError, RenderRequest,
    RenderStats,
};
use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// Notice sent to the pool supervisor when a worker's browser goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_id: usize,
}

/// Ordered set of jobs currently in flight on one worker.
///
/// Pure bookkeeping: jobs on the same worker run concurrently, each on its
/// own page. The ledger only exists so a dying worker knows which callers to
/// unblock.
#[derive(Debug, Default)]
pub struct JobLedger {
    jobs: std::sync::Mutex<Vec<JobId>>,
}

impl JobLedger {
    pub fn insert(&self, job_id: JobId) {
        self.jobs.lock().unwrap().push(job_id);
    }

    pub fn remove(&self, job_id: &JobId) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(position) = jobs.iter().position(|id| id == job_id) {
            jobs.remove(position);
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<JobId> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }

    /// Publish `err` under every in-flight job id and clear the ledger.
    ///
    /// Returns how many jobs were failed.
    pub fn fail_all(&self, bus: &CompletionBus, err: RenderError) -> usize {
        let jobs = self.drain();
        for job_id in &jobs {
            bus.publish(&job_id.to_string(), Err(err.clone()));
        }
        jobs.len()
    }
}

/// One launched browser process plus its in-flight bookkeeping.
pub struct Worker {
    pub id: usize,
    browser: Arc<Mutex<Browser>>,
    ledger: Arc<JobLedger>,
    bus: Arc<CompletionBus>,
    stats: Arc<RenderStats>,
    timeouts: executor::Timeouts,
    monitor: tokio::task::JoinHandle<()>,
}

impl Worker {
    /// Launch the browser process and start watching it for disconnection.
    pub async fn launch(
        id: usize,
        options: &PoolOptions,
        executable: &Path,
        bus: Arc<CompletionBus>,
        stats: Arc<RenderStats>,
        exit_tx: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<Self, RenderError> {
        let config = browser_config(options, executable, id)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::LaunchFailed(e.to_string()))?;
        let browser = Arc::new(Mutex::new(browser));
        let ledger = Arc::new(JobLedger::default());

        // The handler stream carries protocol traffic for the whole process;
        // it ending means the browser closed or crashed.
        let monitor = {
            let browser = browser.clone();
            let ledger = ledger.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                loop {
                    match handler.next().await {
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!("[worker {id}] protocol handler error: {e}");
                            break;
                        }
                        None => break,
                    }
                }

                error!("[worker {id}] browser closed or crashed");
                // Eviction first, so the pool stops routing jobs here.
                let _ = exit_tx.send(WorkerExit { worker_id: id });
                let failed = ledger.fail_all(&bus, RenderError::WorkerDisconnected);
                if failed > 0 {
                    info!("[worker {id}] failed {failed} in-flight job(s)");
                }
                // Best-effort close of whatever is left of the process.
                let _ = browser.lock().await.close().await;
            })
        };

        info!("[worker {id}] browser launched");

        Ok(Self {
            id,
            browser,
            ledger,
            bus,
            stats,
            timeouts: executor::Timeouts {
                navigation: options.navigation_timeout,
                wait: options.wait_timeout,
            },
            monitor,
        })
    }

    /// Start `request` on this worker. Does not block the caller.
    ///
    /// The executor publishes the outcome under `job_id`; the ledger entry is
    /// removed once the attempt concludes, on every exit path.
    pub fn run_job(&self, job_id: JobId, request: RenderRequest) {
        self.ledger.insert(job_id);
        let opened = self.stats.record_page_opened();
        debug!(
            "[worker {}] job {job_id} started (pages opened: {opened})",
            self.id
        );

        let browser = self.browser.clone();
        let bus = self.bus.clone();
        let stats = self.stats.clone();
        let ledger = self.ledger.clone();
        let timeouts = self.timeouts;
        let worker_id = self.id;
        tokio::spawn(async move {
            let outcome = executor::run(&browser, &bus, &stats, job_id, request, timeouts).await;
            ledger.remove(&job_id);
            if let Err(err) = outcome {
                debug!("[worker {worker_id}] job {job_id} concluded with failure: {err}");
            }
        });
    }

    /// Jobs currently recorded on this worker.
    pub fn in_flight(&self) -> usize {
        self.ledger.len()
    }

    /// Deliberate shutdown: stop the crash monitor, then close the browser.
    pub async fn close(&self) {
        self.monitor.abort();
        let _ = self.browser.lock().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageData;
    use uuid::Uuid;

    #[test]
    fn ledger_insert_and_remove() {
        let ledger = JobLedger::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        ledger.insert(a);
        ledger.insert(b);
        assert_eq!(ledger.len(), 2);

        ledger.remove(&a);
        assert_eq!(ledger.len(), 1);

        // Removing an unknown id is a no-op.
        ledger.remove(&a);
        assert_eq!(ledger.len(), 1);

        ledger.remove(&b);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn fail_all_unblocks_every_waiter_exactly_once() {
        let bus = CompletionBus::new();
        let ledger = JobLedger::default();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ticket_a = bus.subscribe_once(&a.to_string());
        let ticket_b = bus.subscribe_once(&b.to_string());
        ledger.insert(a);
        ledger.insert(b);

        let failed = ledger.fail_all(&bus, RenderError::WorkerDisconnected);
        assert_eq!(failed, 2);
        assert!(ledger.is_empty());

        assert!(matches!(
            ticket_a.wait().await,
            Some(Err(RenderError::WorkerDisconnected))
        ));
        assert!(matches!(
            ticket_b.wait().await,
            Some(Err(RenderError::WorkerDisconnected))
        ));

        // A second sweep has nothing left to fail.
        assert_eq!(ledger.fail_all(&bus, RenderError::WorkerDisconnected), 0);
    }

    #[tokio::test]
    async fn completed_jobs_are_not_refailed() {
        let bus = CompletionBus::new();
        let ledger = JobLedger::default();

        let id = Uuid::new_v4();
        let ticket = bus.subscribe_once(&id.to_string());
        ledger.insert(id);

        // Executor delivers, worker removes the ledger entry.
        bus.publish(&id.to_string(), Ok(ImageData::Binary(vec![1, 2, 3])));
        ledger.remove(&id);

        assert_eq!(ledger.fail_all(&bus, RenderError::WorkerDisconnected), 0);
        assert!(matches!(ticket.wait().await, Some(Ok(_))));
    }
}
