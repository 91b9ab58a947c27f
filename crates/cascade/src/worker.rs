use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use cascade_timing::{Duration, Instant, Repeater};
use cascade_utils::WorkerClass;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span};

use crate::{FilterId, error::QueueFault, runnable::Runnable};

/// Per-worker thread configuration: optional core pin plus the scheduling
/// class matching the media the worker drives.
#[derive(Clone, Debug, Default)]
pub struct WorkerConfig {
    pub name: String,
    pub core: Option<usize>,
    pub class: WorkerClass,
    /// Re-poll interval when no runnable has a wake time scheduled.
    pub idle_poll: Duration,
}

impl WorkerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), idle_poll: Duration::from_millis(10), ..Self::default() }
    }
}

/// Throughput counters sampled off the worker thread.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Outer scheduling passes.
    pub loops: u64,
    /// Passes in which at least one runnable was due.
    pub work_cycles: u64,
    /// Individual `run_process_frame` cycles driven, across all runnables.
    pub job_runs: u64,
    /// Frames handed to downstream queues (sum of enabled-peer commits).
    pub frames_forwarded: u64,
}

#[derive(Default)]
struct Counters {
    loops: AtomicU64,
    work_cycles: AtomicU64,
    job_runs: AtomicU64,
    frames_forwarded: AtomicU64,
}

struct Shared {
    run: AtomicBool,
    jobs: Mutex<Vec<Arc<dyn Runnable>>>,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
    fault: Mutex<Option<(FilterId, QueueFault)>>,
    counters: Counters,
}

/// A thread driving a cooperative set of runnables: wake the due ones, run
/// one cycle each, fast-wake co-located peers that just received frames,
/// then sleep until the earliest wake time. Restartable after `stop`.
pub struct Worker {
    config: WorkerConfig,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(mut config: WorkerConfig) -> Self {
        if config.idle_poll.is_zero() {
            config.idle_poll = Duration::from_millis(10);
        }
        Self {
            config,
            shared: Arc::new(Shared {
                run: AtomicBool::new(false),
                jobs: Mutex::new(Vec::new()),
                sleep_lock: Mutex::new(()),
                wakeup: Condvar::new(),
                fault: Mutex::new(None),
                counters: Counters::default(),
            }),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.run.load(Ordering::Acquire)
    }

    /// Ids of the runnables this worker drives.
    pub fn job_ids(&self) -> Vec<FilterId> {
        self.shared.jobs.lock().iter().map(|j| j.id()).collect()
    }

    /// Adds a runnable; effective immediately, even mid-run. The caller
    /// guarantees the runnable is not driven by any other worker.
    pub fn add_runnable(&self, runnable: Arc<dyn Runnable>) {
        let mut jobs = self.shared.jobs.lock();
        if jobs.iter().any(|j| j.id() == runnable.id()) {
            return;
        }
        jobs.push(runnable);
        drop(jobs);
        self.shared.wakeup.notify_one();
    }

    pub fn remove_runnable(&self, id: FilterId) {
        self.shared.jobs.lock().retain(|j| j.id() != id);
    }

    /// Marks every owned runnable running and spawns the thread. A no-op
    /// while already started.
    pub fn start(&mut self) {
        if self.handle.is_some() && self.is_running() {
            return;
        }
        // reclaim a finished thread before restarting
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        *self.shared.fault.lock() = None;
        for job in self.shared.jobs.lock().iter() {
            job.set_running();
        }
        self.shared.run.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let name = if config.name.is_empty() { "worker".to_owned() } else { config.name.clone() };
        self.handle = Some(
            std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&shared, &config))
                .expect("spawn worker thread"),
        );
    }

    /// Requests the loop to exit at its next boundary, joins the thread and
    /// unsets every owned runnable.
    pub fn stop(&mut self) {
        self.shared.run.store(false, Ordering::Release);
        self.shared.wakeup.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        for job in self.shared.jobs.lock().iter() {
            job.unset_running();
        }
    }

    /// The invariant violation that aborted the loop, if any.
    pub fn fault(&self) -> Option<(FilterId, QueueFault)> {
        *self.shared.fault.lock()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            loops: self.shared.counters.loops.load(Ordering::Relaxed),
            work_cycles: self.shared.counters.work_cycles.load(Ordering::Relaxed),
            job_runs: self.shared.counters.job_runs.load(Ordering::Relaxed),
            frames_forwarded: self.shared.counters.frames_forwarded.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.config.name)
            .field("running", &self.is_running())
            .field("jobs", &self.job_ids())
            .finish()
    }
}

fn worker_loop(shared: &Shared, config: &WorkerConfig) {
    let _span = info_span!("worker", name = %config.name).entered();
    config.class.apply(config.core);
    info!("worker started");

    let mut stats_log = Repeater::every(Duration::from_secs(10));
    stats_log.reset();

    while shared.run.load(Ordering::Acquire) {
        let now = Instant::now();
        let mut did_work = false;

        {
            let jobs = shared.jobs.lock();
            for job in jobs.iter() {
                if !job.is_running() || !job.ready(now) {
                    continue;
                }
                match job.run_process_frame() {
                    Ok(enabled) => {
                        did_work = true;
                        shared.counters.job_runs.fetch_add(1, Ordering::Relaxed);
                        shared
                            .counters
                            .frames_forwarded
                            .fetch_add(enabled.len() as u64, Ordering::Relaxed);
                        // peers on this worker that just got frames run
                        // without waiting out their hints
                        for peer in enabled {
                            if let Some(local) = jobs.iter().find(|j| j.id() == peer) {
                                local.wake_now();
                            }
                        }
                    }
                    Err(fault) => {
                        error!(filter = job.id(), label = job.label(), %fault, "invariant violation, aborting worker loop");
                        *shared.fault.lock() = Some((job.id(), fault));
                        job.quiesce();
                        shared.run.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }

        shared.counters.loops.fetch_add(1, Ordering::Relaxed);
        if did_work {
            shared.counters.work_cycles.fetch_add(1, Ordering::Relaxed);
        }
        stats_log.maybe(|_| {
            debug!(
                loops = shared.counters.loops.load(Ordering::Relaxed),
                work_cycles = shared.counters.work_cycles.load(Ordering::Relaxed),
                job_runs = shared.counters.job_runs.load(Ordering::Relaxed),
                frames_forwarded = shared.counters.frames_forwarded.load(Ordering::Relaxed),
                "worker stats"
            );
        });

        if !shared.run.load(Ordering::Acquire) {
            break;
        }

        // earliest wake across running jobs, recomputed after the run pass
        // so fast-woken peers are not slept past
        let earliest = shared
            .jobs
            .lock()
            .iter()
            .filter(|j| j.is_running())
            .map(|j| j.next_wake())
            .min();
        let timeout = match earliest {
            Some(at) => at.remaining().min(config.idle_poll),
            None => config.idle_poll,
        };
        if !timeout.is_zero() {
            let mut guard = shared.sleep_lock.lock();
            shared.wakeup.wait_for(&mut guard, timeout.into());
        }
    }

    info!("worker stopped");
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::runnable::{EnabledPeers, GroupCell};

    struct Ticker {
        state: crate::runnable::RunState,
        ticks: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl Ticker {
        fn new(id: FilterId, fail_after: Option<usize>) -> Arc<Self> {
            let state = crate::runnable::RunState::new();
            assert!(state.set_id(id));
            Arc::new(Self { state, ticks: AtomicUsize::new(0), fail_after })
        }
    }

    impl Runnable for Ticker {
        fn id(&self) -> FilterId {
            self.state.id()
        }
        fn set_id(&self, id: FilterId) -> bool {
            self.state.set_id(id)
        }
        fn label(&self) -> &str {
            "ticker"
        }
        fn next_wake(&self) -> Instant {
            self.state.next_wake()
        }
        fn wake_now(&self) {
            self.state.set_next_wake(Instant::ZERO);
        }
        fn run_process_frame(&self) -> Result<EnabledPeers, QueueFault> {
            let n = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if self.fail_after.is_some_and(|limit| n > limit) {
                return Err(QueueFault::CommitWithoutCheckout);
            }
            self.state.set_next_wake(Instant::now() + Duration::from_micros(200));
            Ok(EnabledPeers::default())
        }
        fn is_running(&self) -> bool {
            self.state.is_running()
        }
        fn set_running(&self) {
            self.state.set_running();
        }
        fn unset_running(&self) {
            self.state.unset_running();
        }
        fn quiesce(&self) {
            self.state.quiesce();
        }
        fn group_cell(&self) -> &GroupCell {
            self.state.group_cell()
        }
        fn group_ids(&self) -> Vec<FilterId> {
            self.state.group_ids()
        }
    }

    #[test]
    fn drives_runnables_and_restarts() {
        let ticker = Ticker::new(1, None);
        let mut worker = Worker::new(WorkerConfig::named("test"));
        worker.add_runnable(ticker.clone());

        worker.start();
        std::thread::sleep(std::time::Duration::from_millis(30));
        worker.stop();
        let first = ticker.ticks.load(Ordering::Relaxed);
        assert!(first > 0, "no ticks observed");
        assert!(!ticker.is_running());

        // every completed cycle is visible as throughput, not just "a pass
        // did something"
        let stats = worker.stats();
        assert_eq!(stats.job_runs, first as u64);
        assert!(stats.work_cycles <= stats.job_runs);

        worker.start();
        std::thread::sleep(std::time::Duration::from_millis(30));
        worker.stop();
        assert!(ticker.ticks.load(Ordering::Relaxed) > first, "no ticks after restart");
    }

    #[test]
    fn fault_aborts_loop_and_quiesces() {
        let bad = Ticker::new(7, Some(3));
        let mut worker = Worker::new(WorkerConfig::named("faulty"));
        worker.add_runnable(bad.clone());

        worker.start();
        for _ in 0..100 {
            if worker.fault().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(worker.fault(), Some((7, QueueFault::CommitWithoutCheckout)));
        assert!(!bad.is_running());
        assert!(!worker.is_running());
        worker.stop();
    }

    #[test]
    fn duplicate_adds_are_ignored() {
        let ticker = Ticker::new(3, None);
        let worker = Worker::new(WorkerConfig::named("dup"));
        worker.add_runnable(ticker.clone());
        worker.add_runnable(ticker);
        assert_eq!(worker.job_ids(), vec![3]);
    }
}
