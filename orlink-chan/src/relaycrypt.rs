//! Worker-thread offload for relay-cell encryption.
//!
//! This module is provisional: it implements the dispatcher, job, and
//! worker state machines and their locking discipline, but the
//! per-job cell queues are not populated yet, so no cells are
//! actually crypted off-thread.  The channel core is correct without
//! this module; it is compiled only with the `threaded-relaycrypt`
//! feature.
//!
//! Several of these structures have mutexes; observe these rules to
//! avoid deadlock:
//!
//! 1. Never hold the mutexes for two jobs or two workers
//!    simultaneously.
//!
//! 2. If you hold more than one mutex for different kinds of
//!    structure at once, acquire them in this order: dispatcher
//!    (jobs list), then worker, then job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Direction of cell flow on a circuit that a job crypts for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CellDirection {
    /// Cells flowing away from us, toward the far end of the circuit.
    Outbound,
    /// Cells flowing toward us.
    Inbound,
}

/// State of a relaycrypt job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum JobState {
    /// No cells are queued to be crypted, but the job object sticks
    /// around for when some next show up.  No worker holds it.
    Idle,
    /// Work is available and this job is eligible for dispatch, but
    /// hasn't been dispatched yet.
    Ready,
    /// A worker is processing this job.
    Running,
    /// A worker finished this job and found its circuit had died; it
    /// should be reaped.
    Dead,
}

/// State of a relaycrypt worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkerState {
    /// The worker was just created and hasn't gone idle yet.
    Starting,
    /// The worker is waiting to be dispatched.
    Idle,
    /// The worker is processing a job.
    Working,
    /// The worker has been told to exit and either has or is about
    /// to; the main thread should join it.
    Dead,
}

/// A per-(circuit, direction) crypt job.
pub struct RelaycryptJob {
    /// The circuit this job crypts for.
    circuit: u64,
    /// The direction it crypts.
    direction: CellDirection,
    /// Job state; take this lock for state changes and (eventually)
    /// queue access.
    state: Mutex<JobState>,
    /// True while the circuit is alive.  Written false at most once,
    /// by the main thread; workers may poll it without taking the job
    /// lock to notice that they should give up early.
    circ_alive: AtomicBool,
}

impl RelaycryptJob {
    /// Return the circuit this job serves.
    pub fn circuit(&self) -> u64 {
        self.circuit
    }
    /// Return the direction this job crypts.
    pub fn direction(&self) -> CellDirection {
        self.direction
    }
    /// Return this job's current state.
    pub fn state(&self) -> JobState {
        *self.state.lock().expect("relaycrypt job lock poisoned")
    }
}

/// Shared per-worker bookkeeping.
struct WorkerShared {
    /// Worker state; take this lock for state access.
    state: Mutex<WorkerState>,
    /// Set once by the main thread to tell the worker to exit the
    /// next time it looks for work.
    exit_flag: AtomicBool,
}

/// A worker thread, as tracked by the main thread.
struct Worker {
    /// The state shared with the worker thread.
    shared: Arc<WorkerShared>,
    /// The join handle, until the worker is reaped.
    join: Option<thread::JoinHandle<()>>,
}

/// Everything the dispatcher guards with its jobs lock.
struct JobsList {
    /// Every live job.
    jobs: Vec<Arc<RelaycryptJob>>,
}

/// The master structure tracking threaded relaycrypt status.
///
/// One of these exists per process; make it with
/// [`RelaycryptDispatcher::new`] and shut it down with
/// [`RelaycryptDispatcher::shutdown`].
pub struct RelaycryptDispatcher {
    /// The jobs list; take this lock to touch it.  The associated
    /// condvar wakes workers when a job becomes ready or an exit is
    /// requested.
    jobs: Mutex<JobsList>,
    /// Wakes idle workers.
    work_available: Condvar,
    /// The worker list.  Workers are added and removed only by the
    /// main thread.
    workers: Mutex<Vec<Worker>>,
}

impl RelaycryptDispatcher {
    /// Create a new dispatcher with no workers.
    ///
    /// Use [`RelaycryptDispatcher::set_num_workers`] afterwards to
    /// start some.
    pub fn new() -> Arc<Self> {
        Arc::new(RelaycryptDispatcher {
            jobs: Mutex::new(JobsList { jobs: Vec::new() }),
            work_available: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Adjust the number of worker threads to `n`.
    ///
    /// Surplus workers are flagged to exit and will be reaped by
    /// [`RelaycryptDispatcher::join_workers`].
    pub fn set_num_workers(self: &Arc<Self>, n: usize) {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        let live = workers
            .iter()
            .filter(|w| !w.shared.exit_flag.load(Ordering::SeqCst))
            .count();
        if live < n {
            for _ in live..n {
                let shared = Arc::new(WorkerShared {
                    state: Mutex::new(WorkerState::Starting),
                    exit_flag: AtomicBool::new(false),
                });
                let disp = Arc::clone(self);
                let thread_shared = Arc::clone(&shared);
                let join = thread::spawn(move || worker_main(&disp, &thread_shared));
                workers.push(Worker {
                    shared,
                    join: Some(join),
                });
            }
        } else {
            let mut surplus = live - n;
            for w in workers.iter() {
                if surplus == 0 {
                    break;
                }
                if !w.shared.exit_flag.load(Ordering::SeqCst) {
                    w.shared.exit_flag.store(true, Ordering::SeqCst);
                    surplus -= 1;
                }
            }
            drop(workers);
            // Take the jobs lock before notifying: this orders the
            // wakeup after any worker's exit-flag check, so no worker
            // can slip into its wait having missed both the flag and
            // the notification.
            let _jobs = self.jobs.lock().expect("jobs list lock poisoned");
            self.work_available.notify_all();
        }
    }

    /// Join workers that have exited (or, with `block`, every worker
    /// that has been flagged to exit), and remove them from the
    /// worker list.
    pub fn join_workers(&self, block: bool) {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        let mut remaining = Vec::new();
        for mut w in workers.drain(..) {
            let dead = *w.state_lock() == WorkerState::Dead;
            let flagged = w.shared.exit_flag.load(Ordering::SeqCst);
            if dead || (block && flagged) {
                if let Some(join) = w.join.take() {
                    let _ = join.join();
                }
            } else {
                remaining.push(w);
            }
        }
        *workers = remaining;
    }

    /// Return the number of workers not yet reaped.
    pub fn n_workers(&self) -> usize {
        self.workers.lock().expect("worker list lock poisoned").len()
    }

    /// Find or create the job for (`circuit`, `direction`).
    ///
    /// Main thread only.
    pub fn job_for(&self, circuit: u64, direction: CellDirection) -> Arc<RelaycryptJob> {
        let mut jobs = self.jobs.lock().expect("jobs list lock poisoned");
        if let Some(job) = jobs
            .jobs
            .iter()
            .find(|j| j.circuit == circuit && j.direction == direction)
        {
            return Arc::clone(job);
        }
        let job = Arc::new(RelaycryptJob {
            circuit,
            direction,
            state: Mutex::new(JobState::Idle),
            circ_alive: AtomicBool::new(true),
        });
        jobs.jobs.push(Arc::clone(&job));
        job
    }

    /// Mark a job as having work available and wake a worker.
    pub fn mark_ready(&self, job: &Arc<RelaycryptJob>) {
        {
            // Hold the jobs lock around the job-state change so a
            // worker scanning the list sees a consistent view; this
            // is the dispatcher-then-job order.
            let _jobs = self.jobs.lock().expect("jobs list lock poisoned");
            let mut state = job.state.lock().expect("relaycrypt job lock poisoned");
            if *state == JobState::Idle {
                *state = JobState::Ready;
            }
        }
        self.work_available.notify_one();
    }

    /// Note that the circuit behind `job` has closed.
    ///
    /// Main thread only; flips the lock-free liveness flag at most
    /// once.
    pub fn mark_circuit_dead(&self, job: &Arc<RelaycryptJob>) {
        job.circ_alive.store(false, Ordering::SeqCst);
    }

    /// Remove jobs that workers have marked Dead.
    pub fn reap_dead_jobs(&self) {
        let mut jobs = self.jobs.lock().expect("jobs list lock poisoned");
        jobs.jobs
            .retain(|j| *j.state.lock().expect("relaycrypt job lock poisoned") != JobState::Dead);
    }

    /// Shut down all active workers, join them, and drop all jobs.
    pub fn shutdown(self: &Arc<Self>) {
        self.set_num_workers(0);
        self.join_workers(true);
        let mut jobs = self.jobs.lock().expect("jobs list lock poisoned");
        jobs.jobs.clear();
    }

    /// Worker side: block until a job is ready, or until we are told
    /// to exit (in which case return None).
    fn worker_get_job(&self, shared: &WorkerShared) -> Option<Arc<RelaycryptJob>> {
        let mut jobs = self.jobs.lock().expect("jobs list lock poisoned");
        loop {
            if shared.exit_flag.load(Ordering::SeqCst) {
                return None;
            }
            let found = jobs.jobs.iter().find_map(|j| {
                let mut state = j.state.lock().expect("relaycrypt job lock poisoned");
                if *state == JobState::Ready {
                    *state = JobState::Running;
                    Some(Arc::clone(j))
                } else {
                    None
                }
            });
            if let Some(job) = found {
                return Some(job);
            }
            jobs = self
                .work_available
                .wait(jobs)
                .expect("jobs list lock poisoned");
        }
    }

    /// Worker side: return a finished job to the dispatcher.
    fn worker_release_job(&self, job: &Arc<RelaycryptJob>) {
        let mut state = job.state.lock().expect("relaycrypt job lock poisoned");
        *state = if job.circ_alive.load(Ordering::SeqCst) {
            JobState::Idle
        } else {
            JobState::Dead
        };
    }
}

impl Worker {
    /// Lock and return this worker's state.
    fn state_lock(&mut self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.shared.state.lock().expect("worker state lock poisoned")
    }
}

/// Main loop for relaycrypt worker threads.
fn worker_main(disp: &Arc<RelaycryptDispatcher>, shared: &Arc<WorkerShared>) {
    *shared.state.lock().expect("worker state lock poisoned") = WorkerState::Idle;
    while let Some(job) = disp.worker_get_job(shared) {
        *shared.state.lock().expect("worker state lock poisoned") = WorkerState::Working;
        // TODO: drain the job's cell queue here once the queues are
        // wired up to the circuit layer.
        disp.worker_release_job(&job);
        *shared.state.lock().expect("worker state lock poisoned") = WorkerState::Idle;
    }
    *shared.state.lock().expect("worker state lock poisoned") = WorkerState::Dead;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    /// Spin until `f` is true or a generous timeout passes.
    fn wait_for(mut f: impl FnMut() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn dispatch_and_idle() {
        let disp = RelaycryptDispatcher::new();
        disp.set_num_workers(2);
        assert_eq!(disp.n_workers(), 2);

        let job = disp.job_for(7, CellDirection::Outbound);
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(job.circuit(), 7);
        assert_eq!(job.direction(), CellDirection::Outbound);

        disp.mark_ready(&job);
        // A worker picks it up and, with nothing queued, parks it
        // back in Idle.
        wait_for(|| job.state() == JobState::Idle);

        disp.shutdown();
        assert_eq!(disp.n_workers(), 0);
    }

    #[test]
    fn job_identity() {
        let disp = RelaycryptDispatcher::new();
        let a = disp.job_for(1, CellDirection::Inbound);
        let b = disp.job_for(1, CellDirection::Inbound);
        let c = disp.job_for(1, CellDirection::Outbound);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        disp.shutdown();
    }

    #[test]
    fn dead_circuit_reaped() {
        let disp = RelaycryptDispatcher::new();
        disp.set_num_workers(1);

        let job = disp.job_for(3, CellDirection::Inbound);
        disp.mark_circuit_dead(&job);
        disp.mark_ready(&job);
        wait_for(|| job.state() == JobState::Dead);

        disp.reap_dead_jobs();
        // A fresh request makes a fresh job.
        let job2 = disp.job_for(3, CellDirection::Inbound);
        assert!(!Arc::ptr_eq(&job, &job2));
        assert_eq!(job2.state(), JobState::Idle);

        disp.shutdown();
    }

    #[test]
    fn workers_exit_on_shutdown() {
        let disp = RelaycryptDispatcher::new();
        disp.set_num_workers(3);
        assert_eq!(disp.n_workers(), 3);
        disp.set_num_workers(1);
        disp.join_workers(true);
        assert_eq!(disp.n_workers(), 1);
        disp.shutdown();
        assert_eq!(disp.n_workers(), 0);
    }
}
