// src/async_job.rs - Single worker job executor with cooperative discard
//
// Jobs run one at a time on a dedicated thread. A job handle (`AsyncJob`)
// tracks the last job it issued; issuing again discards the previous one.
// Discarding is cooperative: a queued job is skipped, a running job is told
// through `AsyncJobExecutionControl::is_discarded` and is expected to bail out.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Counters of what the executor did with the jobs it was given.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    issued: AtomicU64,
    started: AtomicU64,
    finished: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStatsSnapshot {
    pub issued: u64,
    pub started: u64,
    pub finished: u64,
    /// Discarded before they got to run
    pub skipped: u64,
}

impl ExecutorStats {
    fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            issued: self.issued.load(Ordering::SeqCst),
            started: self.started.load(Ordering::SeqCst),
            finished: self.finished.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Executor with exactly one worker thread.
pub struct AsyncJobExecutor {
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    stats: Arc<ExecutorStats>,
    pending: Arc<Pending>,
}

impl AsyncJobExecutor {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let pending = Arc::new(Pending::default());

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn({
                let pending = pending.clone();
                move || worker_loop(receiver, pending)
            })?;
        tracing::debug!("Async job executor '{}' started", name);

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            stats: Arc::new(ExecutorStats::default()),
            pending,
        })
    }

    /// Jobs never run in parallel.
    pub const fn worker_count() -> usize {
        1
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Block until every submitted job has run or been skipped.
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.drained.wait(&mut count);
        }
    }

    fn submit(&self, task: Task) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };

        *self.pending.count.lock() += 1;
        if sender.send(task).is_err() {
            tracing::warn!("Async job executor is gone, job dropped");
            self.pending.finish_one();
            return false;
        }
        true
    }

    /// Stop accepting jobs, let the queued ones run and join the worker.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("Async job worker panicked");
            }
        }
    }
}

impl Drop for AsyncJobExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Pending {
    fn finish_one(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }
}

fn worker_loop(receiver: Receiver<Task>, pending: Arc<Pending>) {
    for task in receiver.iter() {
        // Count the job as done even if it unwinds
        let _guard = PendingGuard(&pending);
        task();
    }
}

struct PendingGuard<'a>(&'a Pending);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Queued,
    Running,
    Finished,
}

#[derive(Debug)]
struct JobSlot {
    discarded: AtomicBool,
    phase: Mutex<JobPhase>,
    done: Condvar,
}

impl JobSlot {
    fn new() -> Self {
        Self {
            discarded: AtomicBool::new(false),
            phase: Mutex::new(JobPhase::Queued),
            done: Condvar::new(),
        }
    }

    fn set_phase(&self, phase: JobPhase) {
        *self.phase.lock() = phase;
        if phase == JobPhase::Finished {
            self.done.notify_all();
        }
    }

    fn is_finished(&self) -> bool {
        *self.phase.lock() == JobPhase::Finished
    }

    fn wait_finished(&self) {
        let mut phase = self.phase.lock();
        while *phase != JobPhase::Finished {
            self.done.wait(&mut phase);
        }
    }
}

struct FinishGuard(Arc<JobSlot>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.set_phase(JobPhase::Finished);
    }
}

/// Handed to a running job so it can notice it was discarded.
pub struct AsyncJobExecutionControl {
    slot: Arc<JobSlot>,
}

impl AsyncJobExecutionControl {
    pub fn is_discarded(&self) -> bool {
        self.slot.discarded.load(Ordering::SeqCst)
    }
}

/// Handle to the most recently issued job.
pub struct AsyncJob {
    executor: Arc<AsyncJobExecutor>,
    current: Mutex<Option<Arc<JobSlot>>>,
}

impl AsyncJob {
    pub fn new(executor: Arc<AsyncJobExecutor>) -> Self {
        Self {
            executor,
            current: Mutex::new(None),
        }
    }

    /// Discard the previous job (if any) and queue `job`.
    pub fn issue<F>(&self, job: F)
    where
        F: FnOnce(&AsyncJobExecutionControl) + Send + 'static,
    {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            previous.discarded.store(true, Ordering::SeqCst);
        }

        let slot = Arc::new(JobSlot::new());
        *current = Some(slot.clone());

        let stats = self.executor.stats.clone();
        stats.issued.fetch_add(1, Ordering::SeqCst);

        let task_slot = slot.clone();
        let task: Task = Box::new(move || {
            let _finish = FinishGuard(task_slot.clone());
            let control = AsyncJobExecutionControl { slot: task_slot };

            if control.is_discarded() {
                stats.skipped.fetch_add(1, Ordering::SeqCst);
                return;
            }

            control.slot.set_phase(JobPhase::Running);
            stats.started.fetch_add(1, Ordering::SeqCst);
            job(&control);
            stats.finished.fetch_add(1, Ordering::SeqCst);
        });

        if !self.executor.submit(task) {
            slot.set_phase(JobPhase::Finished);
        }
    }

    /// Mark the current job discarded and forget it. Returns immediately.
    pub fn discard(&self) {
        if let Some(slot) = self.current.lock().take() {
            slot.discarded.store(true, Ordering::SeqCst);
        }
    }

    /// Discard the current job and wait until it has stopped running.
    pub fn discard_and_wait(&self) {
        let slot = self.current.lock().take();
        if let Some(slot) = slot {
            slot.discarded.store(true, Ordering::SeqCst);
            slot.wait_finished();
        }
    }

    /// Whether the current job is queued or running.
    pub fn is_active(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|slot| !slot.is_finished())
    }

    /// Block until the current job finished (or was skipped).
    pub fn wait_finished(&self) {
        let slot = self.current.lock().clone();
        if let Some(slot) = slot {
            slot.wait_finished();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn executor() -> Arc<AsyncJobExecutor> {
        Arc::new(AsyncJobExecutor::new("test_worker").unwrap())
    }

    #[test]
    fn test_job_runs_and_finishes() {
        let job = AsyncJob::new(executor());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        job.issue(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        job.wait_finished();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!job.is_active());
    }

    #[test]
    fn test_reissue_skips_queued_job() {
        let executor = executor();
        let blocker = AsyncJob::new(executor.clone());
        let job = AsyncJob::new(executor.clone());
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // Occupy the worker so the next jobs stay queued
        blocker.issue(move |_| {
            let _ = release_rx.recv();
        });

        let ran = Arc::new(AtomicUsize::new(0));
        let r1 = ran.clone();
        job.issue(move |_| {
            r1.fetch_add(1, Ordering::SeqCst);
        });
        let r2 = ran.clone();
        job.issue(move |_| {
            r2.fetch_add(10, Ordering::SeqCst);
        });
        assert!(job.is_active());

        release_tx.send(()).unwrap();
        executor.wait_idle();

        assert_eq!(ran.load(Ordering::SeqCst), 10);
        let stats = executor.stats();
        assert_eq!(stats.issued, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.started, 2);
        assert_eq!(stats.finished, 2);
    }

    #[test]
    fn test_running_job_observes_discard() {
        let job = AsyncJob::new(executor());
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (observed_tx, observed_rx) = mpsc::channel::<bool>();

        job.issue(move |control| {
            started_tx.send(()).unwrap();
            while !control.is_discarded() {
                thread::yield_now();
            }
            observed_tx.send(true).unwrap();
        });

        started_rx.recv().unwrap();
        job.discard_and_wait();
        assert!(observed_rx.recv().unwrap());
        assert!(!job.is_active());
    }

    #[test]
    fn test_worker_count_is_one() {
        assert_eq!(AsyncJobExecutor::worker_count(), 1);
    }
}
