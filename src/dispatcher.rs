use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::error::{DeliveryOutcome, DispatchError, FailureReason};
use crate::guard::UrlGuard;
use crate::storage::ConfigStore;
use crate::transport::WebhookTransport;
use crate::types::{DeliveryKey, DlqEntry, OverflowPolicy, PendingRetry, TriggerType};
use crate::worker::{metric_inc, shutdown_signalled, worker_loop, DeliveryJob, DeliveryReport, WorkerContext};

/// Delay before the next attempt, indexed by attempts already made.
pub const DEFAULT_BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Concurrent delivery attempts.
    pub worker_count: usize,
    /// Deliveries waiting for a worker.
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    pub dlq_capacity: usize,
    /// Re-run the SSRF guard before every attempt.
    pub revalidate_on_delivery: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_capacity: 1_000,
            overflow_policy: OverflowPolicy::DropNewest,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF.to_vec(),
            dlq_capacity: 10_000,
            revalidate_on_delivery: true,
        }
    }
}

impl DispatcherConfig {
    /// Wait after the given (1-based) failed attempt. Past the end of the
    /// schedule the last interval repeats.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Messages consumed by the scheduler task.
enum SchedulerMsg {
    Report(DeliveryReport),
    /// A restored retry to run at `ready_at`.
    Schedule { job: DeliveryJob, ready_at: Instant },
}

/// Bounded delivery pool with a retry scheduler.
///
/// Workers make single attempts; the scheduler owns the backoff timeline of
/// every delivery, persists retry state, and dead-letters exhausted ones.
pub struct Dispatcher {
    ready_tx: mpsc::Sender<DeliveryJob>,
    schedule_tx: mpsc::UnboundedSender<SchedulerMsg>,
    is_running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    dlq: Arc<Mutex<VecDeque<DlqEntry>>>,
    store: Arc<dyn ConfigStore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn ConfigStore>,
        transport: Arc<dyn WebhookTransport>,
        guard: UrlGuard,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<DeliveryReport>();
        let (schedule_tx, mut schedule_rx) = mpsc::unbounded_channel::<SchedulerMsg>();

        let ctx = Arc::new(WorkerContext {
            transport,
            store: Arc::clone(&store),
            revalidate: config.revalidate_on_delivery.then_some(guard),
            report_tx,
        });

        let mut handles = Vec::with_capacity(config.worker_count.max(1) + 1);
        for _ in 0..config.worker_count.max(1) {
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&shared_ready_rx),
                Arc::clone(&ctx),
                shutdown_rx.clone(),
            )));
        }

        let dlq = Arc::new(Mutex::new(VecDeque::new()));
        let is_running = Arc::new(AtomicBool::new(true));

        let scheduler = Scheduler {
            ready_tx: ready_tx.clone(),
            store: Arc::clone(&store),
            dlq: Arc::clone(&dlq),
            config: config.clone(),
            delay_heap: BinaryHeap::new(),
        };
        let mut scheduler_shutdown = shutdown_rx;
        handles.push(tokio::spawn(async move {
            let mut scheduler = scheduler;
            loop {
                let next_ready = scheduler.delay_heap.peek().map(|t| t.ready_at);
                let msg = tokio::select! {
                    biased;
                    _ = shutdown_signalled(&mut scheduler_shutdown) => break,
                    // Due retries go ahead of new reports.
                    _ = sleep_until(next_ready.unwrap_or_else(Instant::now)), if next_ready.is_some() => {
                        if !scheduler.release_due(&mut scheduler_shutdown).await {
                            break;
                        }
                        continue;
                    }
                    Some(report) = report_rx.recv() => SchedulerMsg::Report(report),
                    Some(msg) = schedule_rx.recv() => msg,
                };
                scheduler.handle(msg).await;
            }

            if !scheduler.delay_heap.is_empty() {
                info!(
                    pending = scheduler.delay_heap.len(),
                    "scheduler stopped with retries pending; they remain in the store"
                );
            }
        }));

        Self {
            ready_tx,
            schedule_tx,
            is_running,
            shutdown_tx,
            handles: parking_lot::Mutex::new(handles),
            dlq,
            store,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Queue the first attempt of a delivery.
    ///
    /// Never waits under [`OverflowPolicy::DropNewest`]; a full queue yields
    /// [`DispatchError::Backpressure`].
    pub async fn dispatch(&self, job: DeliveryJob) -> Result<(), DispatchError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatchError::Shutdown);
        }
        let tx = &self.ready_tx;

        // Persist before a worker can finish and clear it.
        let pending = pending_for(&job, Utc::now());
        if let Err(err) = self.store.record_pending(&pending).await {
            error!(key = %pending.key, error = %err, "failed to persist pending delivery");
        }

        let result = match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => match self.config.overflow_policy {
                OverflowPolicy::DropNewest => {
                    metric_inc("webhook.dispatch.backpressure");
                    Err(DispatchError::Backpressure)
                }
                OverflowPolicy::Block => tx.send(job).await.map_err(|_| DispatchError::Shutdown),
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Shutdown),
        };

        match result {
            Ok(()) => metric_inc("webhook.dispatch.enqueued"),
            Err(_) => {
                if let Err(err) = self.store.clear_pending(&pending.key).await {
                    warn!(key = %pending.key, error = %err, "failed to clear rejected delivery");
                }
            }
        }
        result
    }

    /// Re-schedule a persisted retry at its recorded time.
    pub fn schedule_restored(&self, job: DeliveryJob, delay: Duration) -> Result<(), DispatchError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatchError::Shutdown);
        }
        self.schedule_tx
            .send(SchedulerMsg::Schedule {
                job,
                ready_at: Instant::now() + delay,
            })
            .map_err(|_| DispatchError::Shutdown)
    }

    /// Record a delivery that never reached a worker.
    pub async fn dead_letter(
        &self,
        key: DeliveryKey,
        trigger_type: TriggerType,
        failure: impl Into<String>,
    ) {
        let entry = DlqEntry {
            key,
            trigger_type,
            last_payload: String::new(),
            failure: failure.into(),
            attempts: 0,
            created_at: Utc::now(),
        };
        push_dlq(entry, &self.dlq, &self.config, self.store.as_ref()).await;
    }

    /// Stop accepting work, abort in-flight attempts and wait for all tasks.
    ///
    /// Deliveries waiting for a retry keep their pending record in the
    /// store and are resumed by the next engine start. Idempotent.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn dlq_snapshot(&self) -> Vec<DlqEntry> {
        let guard = self.dlq.lock().await;
        guard.iter().cloned().collect()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Scheduler {
    ready_tx: mpsc::Sender<DeliveryJob>,
    store: Arc<dyn ConfigStore>,
    dlq: Arc<Mutex<VecDeque<DlqEntry>>>,
    config: DispatcherConfig,
    delay_heap: BinaryHeap<TimedJob>,
}

impl Scheduler {
    async fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Report(report) => self.handle_report(report).await,
            SchedulerMsg::Schedule { job, ready_at } => {
                self.delay_heap.push(TimedJob { ready_at, job });
            }
        }
    }

    /// Move due retries into the ready queue. Returns `false` on shutdown.
    async fn release_due(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let now = Instant::now();
        while self.delay_heap.peek().is_some_and(|t| t.ready_at <= now) {
            let Some(timed) = self.delay_heap.pop() else { break };
            let Some(job) = self.refresh(timed.job).await else { continue };
            let sent = tokio::select! {
                res = self.ready_tx.send(job) => res.is_ok(),
                _ = shutdown_signalled(shutdown) => false,
            };
            if !sent {
                return false;
            }
        }
        true
    }

    /// Swap in the stored config before a retry runs. Returns `None` when the
    /// config was deleted or disabled in the meantime.
    async fn refresh(&self, mut job: DeliveryJob) -> Option<DeliveryJob> {
        match self.store.get_config(job.config.id).await {
            Ok(Some(config)) if config.enabled => {
                job.config = config;
                Some(job)
            }
            Ok(_) => {
                info!(
                    config_id = %job.config.id,
                    event_id = %job.event.event_id,
                    "webhook config removed or disabled; retry dropped"
                );
                self.clear_pending(&job).await;
                None
            }
            Err(err) => {
                warn!(
                    config_id = %job.config.id,
                    error = %err,
                    "failed to reload webhook config; retrying with the queued copy"
                );
                Some(job)
            }
        }
    }

    async fn handle_report(&mut self, report: DeliveryReport) {
        let DeliveryReport {
            job,
            outcome,
            payload,
        } = report;
        let key = job.key();

        match outcome {
            DeliveryOutcome::Delivered { .. } => {
                metric_inc("webhook.delivery.delivered");
                self.clear_pending(&job).await;
            }
            DeliveryOutcome::Cancelled => {}
            DeliveryOutcome::Failed(reason) => {
                let attempt = job.attempts_made;
                if reason.is_retryable() && attempt < self.config.max_attempts {
                    let delay = self.config.backoff_after(attempt);
                    let next_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    if let Err(err) = self.store.record_pending(&pending_for(&job, next_at)).await {
                        error!(key = %key, error = %err, "failed to persist retry state");
                    }
                    metric_inc("webhook.delivery.retry_scheduled");
                    self.delay_heap.push(TimedJob {
                        ready_at: Instant::now() + delay,
                        job,
                    });
                } else {
                    self.exhaust(job, reason, payload).await;
                }
            }
        }
    }

    async fn exhaust(&mut self, job: DeliveryJob, reason: FailureReason, payload: String) {
        metric_inc("webhook.delivery.failed");
        error!(
            config_id = %job.config.id,
            event_id = %job.event.event_id,
            url = %job.config.url,
            attempts = job.attempts_made,
            error = %reason,
            "webhook delivery failed permanently"
        );

        let entry = DlqEntry {
            key: job.key(),
            trigger_type: job.trigger.trigger_type,
            last_payload: payload,
            failure: reason.to_string(),
            attempts: job.attempts_made,
            created_at: Utc::now(),
        };
        push_dlq(entry, &self.dlq, &self.config, self.store.as_ref()).await;
        self.clear_pending(&job).await;
    }

    async fn clear_pending(&self, job: &DeliveryJob) {
        if let Err(err) = self.store.clear_pending(&job.key()).await {
            warn!(key = %job.key(), error = %err, "failed to clear pending delivery");
        }
    }
}

fn pending_for(job: &DeliveryJob, next_attempt_at: chrono::DateTime<Utc>) -> PendingRetry {
    PendingRetry {
        key: job.key(),
        trigger: job.trigger.clone(),
        event: job.event.clone(),
        attempts_made: job.attempts_made,
        next_attempt_at,
    }
}

async fn push_dlq(
    entry: DlqEntry,
    dlq: &Mutex<VecDeque<DlqEntry>>,
    config: &DispatcherConfig,
    store: &dyn ConfigStore,
) {
    if let Err(err) = store.record_dead_letter(&entry).await {
        error!(key = %entry.key, error = %err, "failed to persist dead letter");
    }
    metric_inc("webhook.dlq.inserted");

    let mut guard = dlq.lock().await;
    guard.push_back(entry);
    while guard.len() > config.dlq_capacity {
        guard.pop_front();
    }
}

#[derive(Debug)]
struct TimedJob {
    ready_at: Instant,
    job: DeliveryJob,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_fixed_and_doubling() {
        let config = DispatcherConfig::default();
        let delays: Vec<u64> = (1..=5).map(|n| config.backoff_after(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(config.backoff_after(9), Duration::from_secs(16));
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn empty_schedule_retries_immediately() {
        let config = DispatcherConfig {
            backoff: Vec::new(),
            ..Default::default()
        };
        assert_eq!(config.backoff_after(1), Duration::ZERO);
    }

    #[test]
    fn timed_jobs_pop_earliest_first() {
        use crate::types::{InboundEvent, TriggerRule, WebhookConfigDraft, WebhookConfigId};
        let now = Utc::now();
        let config = WebhookConfigDraft::new("a", "https://a.example.com").into_config(WebhookConfigId(1), now, now);
        let job = DeliveryJob::new(config, TriggerRule::all(), InboundEvent::new("m", "c", "s", "t"));

        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        for secs in [4, 1, 2] {
            heap.push(TimedJob {
                ready_at: base + Duration::from_secs(secs),
                job: job.clone(),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop())
            .map(|t| (t.ready_at - base).as_secs())
            .collect();
        assert_eq!(order, vec![1, 2, 4]);
    }
}
