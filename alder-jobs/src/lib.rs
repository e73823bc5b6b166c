//! Named job queues over a shared worker pool.
//!
//! Scripts are submitted to named queues; a pool of worker threads drains
//! a shared pending list, honoring each queue's concurrency cap. The pool
//! grows on demand up to the sum of the queue caps and shrinks as queues
//! are deleted. Waiters block on the owning queue's condition and receive
//! the job's results or its propagated error; detached jobs clean up
//! after themselves and can never be waited on.

mod types;

pub use types::{JobInfo, JobState, JobType, PoolInfo, QueueInfo};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Condvar;
use thiserror::Error;
use tracing::{debug, info, warn};

use alder_base::{Mutex, Time};
use alder_script::{EvaluatorFactory, ScriptError};
use types::Job;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("no such queue: {0}")]
    NoSuchQueue(String),

    #[error("queue {0} already exists")]
    DuplicateQueue(String),

    #[error("no such job: {0}")]
    NoSuchJob(String),

    #[error("job {0} already exists")]
    DuplicateJob(String),

    #[error("can't wait on detached job: {0}")]
    DetachedWait(String),

    #[error("can't wait on waited job: {0}")]
    AlreadyWaited(String),

    #[error("can't cancel job {0}, someone is waiting on it")]
    CancelWaited(String),

    #[error("wait timed out")]
    WaitTimeout,

    #[error("the specified queue is being deleted or the system is stopping")]
    ShuttingDown,

    #[error(transparent)]
    Script(ScriptError),
}

impl JobError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::WaitTimeout)
    }
}

/// Pool tuning; adjustable at runtime through [`JobPool::configure`].
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Workers exit after this many jobs; zero keeps them alive.
    pub jobs_per_thread: u32,
    /// Idle timeout for pooled workers; zero waits forever.
    pub timeout: Time,
    /// Jobs running at least this long are logged.
    pub log_min_duration: Time,
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            jobs_per_thread: 0,
            timeout: Time::ZERO,
            log_min_duration: Time::from_secs(1),
        }
    }
}

struct QueueState {
    name: String,
    desc: String,
    max_threads: usize,
    nrunning: usize,
    jobs: HashMap<String, Job>,
    next_id: u64,
    /// Waiters currently inside wait/waitany on this queue.
    ref_count: usize,
    delete_pending: bool,
    cond: Arc<Condvar>,
}

struct PoolState {
    queues: HashMap<String, QueueState>,
    /// Shared pending list: `(queue, job id)` in submission order.
    pending: VecDeque<(String, String)>,
    max_threads: usize,
    nthreads: usize,
    nidle: usize,
    next_thread_id: u64,
    next_gen_id: u64,
    stop: bool,
    config: JobsConfig,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Worker wakeup.
    cond: Condvar,
    factory: Arc<dyn EvaluatorFactory>,
}

/// Options for submitting one job.
#[derive(Debug, Clone, Default)]
pub struct QueueOpts {
    /// Run detached: results are discarded and the job is unwaitable.
    pub detached: bool,
    /// Insert at the head of the pending list.
    pub head: bool,
    /// Caller-chosen id, unique within the queue.
    pub job_id: Option<String>,
}

/// Handle to the job subsystem.
#[derive(Clone)]
pub struct JobPool {
    shared: Arc<Shared>,
}

impl JobPool {
    pub fn new(factory: Arc<dyn EvaluatorFactory>, config: JobsConfig) -> Self {
        JobPool {
            shared: Arc::new(Shared {
                state: Mutex::with_name("jobs", PoolState {
                    queues: HashMap::new(),
                    pending: VecDeque::new(),
                    max_threads: 0,
                    nthreads: 0,
                    nidle: 0,
                    next_thread_id: 0,
                    next_gen_id: 0,
                    stop: false,
                    config,
                }),
                cond: Condvar::new(),
                factory,
            }),
        }
    }

    /// Create a named queue with a concurrency cap.
    pub fn create(&self, name: &str, max_threads: usize, desc: &str) -> JobResult<()> {
        let mut state = self.shared.state.lock();
        if state.queues.contains_key(name) {
            return Err(JobError::DuplicateQueue(name.to_string()));
        }
        state.queues.insert(
            name.to_string(),
            QueueState {
                name: name.to_string(),
                desc: desc.to_string(),
                max_threads,
                nrunning: 0,
                jobs: HashMap::new(),
                next_id: 0,
                ref_count: 0,
                delete_pending: false,
                cond: Arc::new(Condvar::new()),
            },
        );
        state.max_threads += max_threads;
        debug!(queue = name, max_threads, "created job queue");
        Ok(())
    }

    /// Mark a queue for deletion. The queue disappears once it has no
    /// jobs and no waiters.
    pub fn delete(&self, name: &str) -> JobResult<()> {
        let mut state = self.shared.state.lock();
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| JobError::NoSuchQueue(name.to_string()))?;
        queue.delete_pending = true;
        queue.cond.notify_all();
        release_queue(&mut state, name);
        Ok(())
    }

    /// Submit a script; returns the job id.
    pub fn queue(&self, queue_name: &str, script: &str, opts: QueueOpts) -> JobResult<String> {
        let mut state = self.shared.state.lock();
        if state.stop {
            return Err(JobError::ShuttingDown);
        }
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| JobError::NoSuchQueue(queue_name.to_string()))?;
        if queue.delete_pending {
            return Err(JobError::ShuttingDown);
        }

        let id = match &opts.job_id {
            Some(id) if !id.is_empty() => {
                if queue.jobs.contains_key(id) {
                    return Err(JobError::DuplicateJob(id.clone()));
                }
                id.clone()
            }
            _ => loop {
                let candidate = format!("job{}", queue.next_id);
                queue.next_id += 1;
                if !queue.jobs.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let jtype = if opts.detached {
            JobType::Detached
        } else {
            JobType::NonDetached
        };
        queue
            .jobs
            .insert(id.clone(), Job::new(id.clone(), jtype, script.to_string()));

        let entry = (queue_name.to_string(), id.clone());
        if opts.head {
            state.pending.push_front(entry);
        } else {
            state.pending.push_back(entry);
        }

        let spawn = state.nidle == 0 && state.nthreads < state.max_threads;
        if spawn {
            state.nthreads += 1;
            let tid = state.next_thread_id;
            state.next_thread_id += 1;
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name(format!("alder-job:{tid:x}"))
                .spawn(move || job_worker(shared, tid))
                .unwrap_or_else(|e| alder_base::fatal("thread create", e));
        }
        drop(state);
        self.shared.cond.notify_all();
        Ok(id)
    }

    /// Block until the job completes and return its results.
    ///
    /// A timeout leaves the job in place for a later wait. Detached jobs
    /// and jobs already being waited on are rejected.
    pub fn wait(&self, queue_name: &str, job_id: &str, timeout: Option<Time>) -> JobResult<String> {
        let deadline = timeout.map(|t| Instant::now() + t.as_duration());
        let mut state = self.shared.state.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| JobError::NoSuchQueue(queue_name.to_string()))?;
        let job = queue
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NoSuchJob(job_id.to_string()))?;
        if job.jtype == JobType::Detached {
            return Err(JobError::DetachedWait(job_id.to_string()));
        }
        if job.waited {
            return Err(JobError::AlreadyWaited(job_id.to_string()));
        }
        job.waited = true;
        queue.ref_count += 1;
        let cond = Arc::clone(&queue.cond);

        loop {
            let queue = match state.queues.get_mut(queue_name) {
                Some(q) => q,
                None => return Err(JobError::NoSuchQueue(queue_name.to_string())),
            };
            match queue.jobs.get(job_id) {
                None => {
                    queue.ref_count -= 1;
                    release_queue(&mut state, queue_name);
                    return Err(JobError::NoSuchJob(job_id.to_string()));
                }
                Some(job) if job.state == JobState::Done => break,
                Some(_) => {}
            }
            match deadline {
                None => state.wait_on(&cond),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || state.wait_on_for(&cond, remaining).timed_out()
                    {
                        let queue = state
                            .queues
                            .get_mut(queue_name)
                            .ok_or_else(|| JobError::NoSuchQueue(queue_name.to_string()))?;
                        if let Some(job) = queue.jobs.get_mut(job_id) {
                            job.waited = false;
                        }
                        queue.ref_count -= 1;
                        release_queue(&mut state, queue_name);
                        warn!(queue = queue_name, job = job_id, "job wait timed out");
                        return Err(JobError::WaitTimeout);
                    }
                }
            }
        }

        // The job is done; collect and drop it.
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| JobError::NoSuchQueue(queue_name.to_string()))?;
        let job = queue
            .jobs
            .remove(job_id)
            .ok_or_else(|| JobError::NoSuchJob(job_id.to_string()))?;
        queue.ref_count -= 1;
        queue.cond.notify_all();
        release_queue(&mut state, queue_name);
        match job.error {
            Some(err) => Err(JobError::Script(err)),
            None => Ok(job.results),
        }
    }

    /// Block until any job in the queue is done.
    pub fn waitany(&self, queue_name: &str, timeout: Option<Time>) -> JobResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t.as_duration());
        let mut state = self.shared.state.lock();
        {
            let queue = state
                .queues
                .get_mut(queue_name)
                .ok_or_else(|| JobError::NoSuchQueue(queue_name.to_string()))?;
            queue.ref_count += 1;
        }
        let cond = {
            let queue = state.queues.get(queue_name).unwrap_or_else(|| unreachable!());
            Arc::clone(&queue.cond)
        };

        let result = loop {
            let queue = match state.queues.get(queue_name) {
                Some(q) => q,
                None => return Err(JobError::NoSuchQueue(queue_name.to_string())),
            };
            let any_done = queue.jobs.is_empty()
                || queue.jobs.values().any(|j| j.state == JobState::Done);
            if any_done {
                break Ok(());
            }
            match deadline {
                None => state.wait_on(&cond),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || state.wait_on_for(&cond, remaining).timed_out()
                    {
                        break Err(JobError::WaitTimeout);
                    }
                }
            }
        };

        if let Some(queue) = state.queues.get_mut(queue_name) {
            queue.ref_count -= 1;
        }
        release_queue(&mut state, queue_name);
        result
    }

    /// Cancel a job. Returns true iff the job was running; its evaluation
    /// is interrupted asynchronously.
    pub fn cancel(&self, queue_name: &str, job_id: &str) -> JobResult<bool> {
        let mut state = self.shared.state.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| JobError::NoSuchQueue(queue_name.to_string()))?;
        let job = queue
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NoSuchJob(job_id.to_string()))?;
        if job.waited {
            return Err(JobError::CancelWaited(job_id.to_string()));
        }
        job.cancelled = true;
        let running = job.state == JobState::Running;
        if let Some(interrupt) = &job.interrupt {
            interrupt.interrupt();
        }
        if job.state == JobState::Done {
            // Nothing left to interrupt; drop the record.
            queue.jobs.remove(job_id);
        }
        queue.cond.notify_all();
        release_queue(&mut state, queue_name);
        drop(state);
        self.shared.cond.notify_all();
        Ok(running)
    }

    pub fn exists(&self, queue_name: &str, job_id: &str) -> bool {
        let state = self.shared.state.lock();
        state
            .queues
            .get(queue_name)
            .map(|q| q.jobs.contains_key(job_id))
            .unwrap_or(false)
    }

    /// Ids of all jobs in a queue.
    pub fn jobs(&self, queue_name: &str) -> JobResult<Vec<String>> {
        let state = self.shared.state.lock();
        let queue = state
            .queues
            .get(queue_name)
            .ok_or_else(|| JobError::NoSuchQueue(queue_name.to_string()))?;
        Ok(queue.jobs.keys().cloned().collect())
    }

    /// Full job records of a queue.
    pub fn joblist(&self, queue_name: &str) -> JobResult<Vec<JobInfo>> {
        let state = self.shared.state.lock();
        let queue = state
            .queues
            .get(queue_name)
            .ok_or_else(|| JobError::NoSuchQueue(queue_name.to_string()))?;
        Ok(queue.jobs.values().map(Job::info).collect())
    }

    /// Names of all queues.
    pub fn queues(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        state.queues.keys().cloned().collect()
    }

    /// Full queue records.
    pub fn queuelist(&self) -> Vec<QueueInfo> {
        let state = self.shared.state.lock();
        state
            .queues
            .values()
            .map(|q| QueueInfo {
                name: q.name.clone(),
                desc: q.desc.clone(),
                max_threads: q.max_threads,
                nrunning: q.nrunning,
                delete_pending: q.delete_pending,
            })
            .collect()
    }

    /// Shared pool counters.
    pub fn threadlist(&self) -> PoolInfo {
        let state = self.shared.state.lock();
        PoolInfo {
            max_threads: state.max_threads,
            nthreads: state.nthreads,
            nidle: state.nidle,
            stop_pending: state.stop,
        }
    }

    /// Generate a fresh id usable with [`QueueOpts::job_id`].
    pub fn genid(&self) -> String {
        let mut state = self.shared.state.lock();
        let id = state.next_gen_id;
        state.next_gen_id += 1;
        format!("job{id}")
    }

    /// Replace the pool tuning knobs.
    pub fn configure(&self, config: JobsConfig) {
        let mut state = self.shared.state.lock();
        state.config = config;
    }

    pub fn config(&self) -> JobsConfig {
        self.shared.state.lock().config.clone()
    }

    /// Flag the pool for shutdown and wake all workers and waiters.
    pub fn start_shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.stop = true;
        for queue in state.queues.values() {
            queue.cond.notify_all();
        }
        drop(state);
        self.shared.cond.notify_all();
        info!("job pool shutdown started");
    }

    /// Wait for all workers to exit, up to `timeout`.
    pub fn wait_shutdown(&self, timeout: Time) {
        let deadline = Instant::now() + timeout.as_duration();
        let mut state = self.shared.state.lock();
        while state.nthreads > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || state.wait_on_for(&self.shared.cond, remaining).timed_out()
            {
                warn!(
                    nthreads = state.nthreads,
                    "timeout waiting for job workers to exit"
                );
                return;
            }
        }
        debug!("job pool shutdown complete");
    }
}

/// Drop a queue marked for deletion once it is idle and unreferenced.
fn release_queue(state: &mut PoolState, name: &str) {
    let remove = match state.queues.get(name) {
        Some(q) => q.delete_pending && q.ref_count == 0 && q.jobs.is_empty(),
        None => false,
    };
    if remove {
        if let Some(q) = state.queues.remove(name) {
            state.max_threads = state.max_threads.saturating_sub(q.max_threads);
            debug!(queue = name, "deleted job queue");
        }
    }
}

/// Scan the pending list for the first job whose queue has capacity.
fn next_job(state: &mut PoolState) -> Option<(String, String)> {
    let mut idx = 0;
    while idx < state.pending.len() {
        let queue_name = state.pending[idx].0.clone();
        match state.queues.get(&queue_name) {
            None => {
                // Queue vanished under the job; drop the entry.
                state.pending.remove(idx);
            }
            Some(queue) if queue.nrunning < queue.max_threads => {
                return state.pending.remove(idx);
            }
            Some(_) => idx += 1,
        }
    }
    None
}

/// Worker loop: pick jobs the caps allow, run them on a fresh evaluator,
/// publish results and wake the queue's waiters.
fn job_worker(shared: Arc<Shared>, tid: u64) {
    debug!(tid, "job worker starting");
    let mut state = shared.state.lock();
    let jpt = state.config.jobs_per_thread;
    let mut remaining = jpt;
    loop {
        state.nidle += 1;
        let idle_timeout = state.config.timeout;
        let deadline = if idle_timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + idle_timeout.as_duration())
        };

        let mut found = None;
        while !state.stop {
            found = next_job(&mut state);
            if found.is_some() {
                break;
            }
            match deadline {
                None => state.wait_on(&shared.cond),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() || state.wait_on_for(&shared.cond, left).timed_out() {
                        break;
                    }
                }
            }
        }
        state.nidle -= 1;
        let Some((queue_name, job_id)) = found else {
            break;
        };
        if state.stop {
            break;
        }

        let mut evaluator = shared.factory.create();
        let interrupt = evaluator.interrupt_handle();
        let script;
        {
            let Some(queue) = state.queues.get_mut(&queue_name) else {
                continue;
            };
            queue.nrunning += 1;
            let Some(job) = queue.jobs.get_mut(&job_id) else {
                queue.nrunning -= 1;
                continue;
            };
            job.state = JobState::Running;
            job.start_time = Time::now();
            job.interrupt = Some(interrupt.clone());
            if job.cancelled {
                interrupt.interrupt();
            }
            script = job.script.clone();
        }
        drop(state);

        debug!(tid, queue = %queue_name, job = %job_id, "running job");
        let outcome = evaluator.eval(&script, None);
        let end = Time::now();

        state = shared.state.lock();
        let log_min = state.config.log_min_duration;
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.nrunning = queue.nrunning.saturating_sub(1);
            if let Some(job) = queue.jobs.get_mut(&job_id) {
                job.state = JobState::Done;
                job.end_time = end;
                job.interrupt = None;
                let (elapsed, _) = Time::diff(end, job.start_time);
                if !log_min.is_zero() && elapsed >= log_min {
                    info!(queue = %queue_name, job = %job_id, %elapsed, script = %job.script,
                        "job duration");
                }
                match outcome {
                    Ok(results) => job.results = results,
                    Err(err) => {
                        if job.jtype == JobType::Detached {
                            warn!(queue = %queue_name, job = %job_id, error = %err,
                                "detached job failed");
                        }
                        job.error = Some(err);
                    }
                }
                if job.jtype == JobType::Detached {
                    queue.jobs.remove(&job_id);
                }
            }
            queue.cond.notify_all();
        }
        release_queue(&mut state, &queue_name);

        if jpt != 0 {
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
    }
    state.nthreads -= 1;
    debug!(tid, nthreads = state.nthreads, "job worker exiting");
    drop(state);
    shared.cond.notify_all();
}
