// ── Background scheduler ──
//
// A single worker task executes every submitted job: immediate,
// delayed, or recurring. Jobs are ordered by priority tier first, then
// by scheduled time within a tier, and the worker holds no scheduler
// lock while a job body runs -- so jobs may themselves submit or cancel
// jobs. Every asynchronous callback in the system flows through here,
// which keeps the event-channel task free to read the transport.
//
// A recurring job is re-inserted at `run_at + interval`, not
// `now + interval`, so cadence never drifts with execution latency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::CoreError;

/// How long `stop()` waits for the worker to finish its current job.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the idle sleep when the queue is empty.
const IDLE_WAIT: Duration = Duration::from_secs(60);

// ── Job types ────────────────────────────────────────────────────────

/// Priority tiers, scanned in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Handle for cancelling a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

pub type JobFuture = BoxFuture<'static, Result<(), CoreError>>;

/// A job body. `Fn` rather than `FnOnce` because recurring jobs run
/// repeatedly.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    run: JobFn,
    every: Option<Duration>,
}

type QueueKey = (Priority, Instant, JobId);

// ── Scheduler ────────────────────────────────────────────────────────

/// Handle to the single background worker. Cheaply cloneable.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue: Mutex<BTreeMap<QueueKey, Job>>,
    wake: Notify,
    next_id: AtomicU64,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create the scheduler and spawn its worker task.
    pub fn new() -> Self {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(worker_loop(Arc::clone(&inner)));
        *inner.worker.lock().expect("worker lock poisoned") = Some(handle);
        debug!("scheduler worker started");

        Self { inner }
    }

    /// Run a job as soon as the worker gets to it.
    pub fn submit(&self, priority: Priority, run: JobFn) -> JobId {
        self.queue_job(priority, Instant::now(), None, run)
    }

    /// Run a job once after `delay`.
    pub fn submit_in(&self, priority: Priority, delay: Duration, run: JobFn) -> JobId {
        self.queue_job(priority, Instant::now() + delay, None, run)
    }

    /// Run a job every `interval`, first firing one interval from now.
    pub fn submit_every(&self, priority: Priority, interval: Duration, run: JobFn) -> JobId {
        self.queue_job(priority, Instant::now() + interval, Some(interval), run)
    }

    fn queue_job(
        &self,
        priority: Priority,
        run_at: Instant,
        every: Option<Duration>,
        run: JobFn,
    ) -> JobId {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(?id, ?priority, recurring = every.is_some(), "queue job");

        let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
        queue.insert((priority, run_at, id), Job { run, every });
        drop(queue);

        self.inner.wake.notify_one();
        id
    }

    /// Remove a not-yet-fired job. Returns whether anything was removed.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
        let key = queue.keys().find(|(_, _, jid)| *jid == id).copied();
        match key {
            Some(key) => {
                queue.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Stop the worker after at most its current job.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.wake.notify_one();

        let handle = self.inner.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("scheduler worker did not stop in time");
            }
        }
        debug!("scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ── Worker ───────────────────────────────────────────────────────────

/// What one scan of the queue decided.
enum Scan {
    /// A job is due; it has been removed from the queue.
    Run(QueueKey, Job),
    /// Nothing due before this instant.
    Sleep(Instant),
}

/// Find the first due job: tiers in order, earliest job within each
/// tier. If a tier's earliest job is still in the future it only
/// contributes a wakeup deadline -- later jobs in that tier cannot be
/// due either.
fn scan_queue(queue: &mut BTreeMap<QueueKey, Job>, now: Instant) -> Scan {
    let mut deadline = now + IDLE_WAIT;
    let mut skip_tier: Option<Priority> = None;

    let mut due: Option<QueueKey> = None;
    for &(priority, run_at, id) in queue.keys() {
        if skip_tier == Some(priority) {
            continue;
        }
        if run_at <= now {
            due = Some((priority, run_at, id));
            break;
        }
        deadline = deadline.min(run_at);
        skip_tier = Some(priority);
    }

    match due {
        Some(key) => {
            let job = queue.remove(&key).expect("scanned key vanished");
            Scan::Run(key, job)
        }
        None => Scan::Sleep(deadline),
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>) {
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let scan = {
            let mut queue = inner.queue.lock().expect("queue lock poisoned");
            scan_queue(&mut queue, Instant::now())
        };

        match scan {
            Scan::Run((priority, run_at, id), job) => {
                trace!(?id, "job firing");
                if let Err(e) = (job.run)().await {
                    // The job failed; the queue carries on.
                    error!(?id, error = %e, "job failed");
                }

                if let Some(every) = job.every {
                    let mut queue = inner.queue.lock().expect("queue lock poisoned");
                    queue.insert((priority, run_at + every, id), job);
                }
            }
            Scan::Sleep(deadline) => {
                tokio::select! {
                    biased;
                    () = inner.cancel.cancelled() => break,
                    () = inner.wake.notified() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
        }
    }

    debug!("scheduler worker exiting");
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_job(log: &Arc<StdMutex<Vec<&'static str>>>, tag: &'static str) -> JobFn {
        let log = Arc::clone(log);
        Arc::new(move || {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().expect("log lock").push(tag);
                Ok(())
            })
        })
    }

    async fn drain(log: &Arc<StdMutex<Vec<&'static str>>>, expected: usize) {
        for _ in 0..200 {
            if log.lock().expect("log lock").len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_jobs_run_in_priority_order() {
        let scheduler = Scheduler::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        // Make them all due at the same instant so only the tier decides.
        let delay = Duration::from_millis(50);
        scheduler.submit_in(Priority::Low, delay, recording_job(&log, "low"));
        scheduler.submit_in(Priority::Normal, delay, recording_job(&log, "normal"));
        scheduler.submit_in(Priority::High, delay, recording_job(&log, "high"));

        drain(&log, 3).await;
        assert_eq!(*log.lock().expect("log lock"), vec!["high", "normal", "low"]);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn within_a_tier_time_decides() {
        let scheduler = Scheduler::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        scheduler.submit_in(Priority::Normal, Duration::from_millis(80), recording_job(&log, "b"));
        scheduler.submit_in(Priority::Normal, Duration::from_millis(20), recording_job(&log, "a"));

        drain(&log, 2).await;
        assert_eq!(*log.lock().expect("log lock"), vec!["a", "b"]);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_cadence_does_not_drift() {
        let scheduler = Scheduler::new();
        let start = Instant::now();
        let times = Arc::new(StdMutex::new(Vec::new()));

        let times_c = Arc::clone(&times);
        scheduler.submit_every(
            Priority::Normal,
            Duration::from_millis(100),
            Arc::new(move || {
                let times = Arc::clone(&times_c);
                Box::pin(async move {
                    times.lock().expect("times lock").push(Instant::now());
                    // A slow body must not push later firings back.
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
            }),
        );

        for _ in 0..200 {
            if times.lock().expect("times lock").len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let times = times.lock().expect("times lock").clone();
        assert!(times.len() >= 3);
        for (n, fired) in times.iter().take(3).enumerate() {
            let expected = start + Duration::from_millis(100 * (u64::try_from(n).expect("small") + 1));
            let delta = fired.duration_since(expected);
            assert!(
                delta < Duration::from_millis(20),
                "firing {n} drifted by {delta:?}"
            );
        }

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_jobs_never_fire() {
        let scheduler = Scheduler::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let id = scheduler.submit_in(Priority::Normal, Duration::from_millis(50), recording_job(&log, "x"));
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id), "second cancel finds nothing");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(log.lock().expect("log lock").is_empty());

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_job_does_not_break_the_queue() {
        let scheduler = Scheduler::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        scheduler.submit(
            Priority::Normal,
            Arc::new(|| {
                Box::pin(async { Err(CoreError::Internal("job exploded".into())) })
            }),
        );
        scheduler.submit(Priority::Normal, recording_job(&log, "after"));

        drain(&log, 1).await;
        assert_eq!(*log.lock().expect("log lock"), vec!["after"]);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_firings() {
        let scheduler = Scheduler::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        scheduler.submit_every(Priority::Normal, Duration::from_millis(50), recording_job(&log, "tick"));
        scheduler.stop().await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(log.lock().expect("log lock").is_empty());
    }
}
