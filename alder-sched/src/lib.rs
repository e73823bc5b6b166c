//! Timer-heap scheduler.
//!
//! Events live in a hash keyed by id and, while waiting, in a binary
//! min-heap ordered by their next firing time. One dispatcher thread pops
//! due events: ordinary events run inline on the dispatcher, detached
//! events go to a small worker pool that grows on demand. Periodic events
//! are re-queued from their planned time rather than their completion
//! time, so a fixed interval does not drift.

mod event;
mod heap;

pub use event::{EventFlags, EventInfo};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Condvar;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, info, warn};

use alder_base::{Mutex, Time};
use event::Event;

pub type SchedResult<T> = Result<T, SchedError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("negative interval")]
    NegativeInterval,

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("no such event {0}")]
    NoSuchEvent(i32),
}

/// Callback invoked with the event id at each firing.
pub type SchedProc = Box<dyn FnMut(i32) + Send>;

/// Pool and overrun tuning.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Detached workers exit after this many events; zero keeps them alive.
    pub jobs_per_thread: u32,
    /// Inline events running longer than this are logged.
    pub max_elapsed: Time,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            jobs_per_thread: 0,
            max_elapsed: Time::from_secs(2),
        }
    }
}

struct SchedState {
    events: HashMap<i32, Event>,
    /// 1-based heap of event ids ordered by `nextqueue`.
    heap: Vec<i32>,
    /// Detached events ready for a worker, most recent first.
    fifo: Vec<i32>,
    next_id: i32,
    nthreads: usize,
    nidle: usize,
    dispatcher_running: bool,
    shutdown_pending: bool,
}

impl SchedState {
    fn new() -> Self {
        SchedState {
            events: HashMap::new(),
            heap: vec![0],
            fifo: Vec::new(),
            next_id: 0,
            nthreads: 0,
            nidle: 0,
            dispatcher_running: false,
            shutdown_pending: false,
        }
    }
}

struct Shared {
    state: Mutex<SchedState>,
    sched_cond: Condvar,
    event_cond: Condvar,
    config: SchedConfig,
}

/// Handle to the process scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(config: SchedConfig) -> Self {
        Scheduler {
            shared: Arc::new(Shared {
                state: Mutex::with_name("sched", SchedState::new()),
                sched_cond: Condvar::new(),
                event_cond: Condvar::new(),
                config,
            }),
        }
    }

    /// Start the dispatcher thread. Events may be registered beforehand.
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.dispatcher_running {
            return;
        }
        state.dispatcher_running = true;
        drop(state);

        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("alder-sched".to_string())
            .spawn(move || dispatcher(shared))
            .unwrap_or_else(|e| alder_base::fatal("thread create", e));
    }

    /// Register a one-shot event firing after `interval`.
    pub fn after(&self, interval: Time, proc: impl FnMut(i32) + Send + 'static) -> SchedResult<i32> {
        self.schedule(EventFlags::once(), interval, proc)
    }

    /// Register an event with explicit flags and interval.
    ///
    /// For daily and weekly events the interval carries the offset within
    /// the day or week, in seconds.
    pub fn schedule(
        &self,
        flags: EventFlags,
        interval: Time,
        proc: impl FnMut(i32) + Send + 'static,
    ) -> SchedResult<i32> {
        if interval.sec < 0 || interval.usec < 0 {
            return Err(SchedError::NegativeInterval);
        }
        let now = Time::now();
        let mut state = self.shared.state.lock();
        if state.shutdown_pending {
            return Err(SchedError::ShuttingDown);
        }
        let id = loop {
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1).max(0);
            if !state.events.contains_key(&id) {
                break id;
            }
        };
        let event = Event::new(id, flags, interval, now, Box::new(proc));
        state.events.insert(id, event);
        queue_event(&mut state, id, now);
        drop(state);
        self.shared.sched_cond.notify_one();
        Ok(id)
    }

    /// Daily event at `hour:minute:second` local time.
    pub fn schedule_daily(
        &self,
        hour: u32,
        minute: u32,
        second: u32,
        thread: bool,
        proc: impl FnMut(i32) + Send + 'static,
    ) -> SchedResult<i32> {
        let offset = i64::from(hour) * 3600 + i64::from(minute) * 60 + i64::from(second);
        let mut flags = EventFlags::default();
        flags.daily = true;
        flags.thread = thread;
        self.schedule(flags, Time::from_secs(offset), proc)
    }

    /// Weekly event on `day` (0 = Sunday) at `hour:minute` local time.
    pub fn schedule_weekly(
        &self,
        day: u32,
        hour: u32,
        minute: u32,
        thread: bool,
        proc: impl FnMut(i32) + Send + 'static,
    ) -> SchedResult<i32> {
        let offset = ((i64::from(day) * 24 + i64::from(hour)) * 60 + i64::from(minute)) * 60;
        let mut flags = EventFlags::default();
        flags.weekly = true;
        flags.thread = thread;
        self.schedule(flags, Time::from_secs(offset), proc)
    }

    /// Cancel an event. Returns true iff the event was waiting in the
    /// queue; an event cancelled mid-run is released by its runner.
    pub fn cancel(&self, id: i32) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown_pending {
            return false;
        }
        let Some(event) = state.events.get_mut(&id) else {
            return false;
        };
        if event.removed {
            return false;
        }
        event.removed = true;
        let qid = event.qid;
        let running = event.flags.running;
        if qid > 0 {
            heap::dequeue(&mut state, qid);
            state.events.remove(&id);
            true
        } else {
            // A running event is released by its runner; anything else
            // unqueued (paused) can go now.
            if !running {
                state.events.remove(&id);
            }
            false
        }
    }

    /// Alias for [`Scheduler::cancel`] that ignores the result.
    pub fn unschedule(&self, id: i32) {
        let _ = self.cancel(id);
    }

    /// Pause an event; a queued event is also dequeued.
    pub fn pause(&self, id: i32) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown_pending {
            return false;
        }
        let Some(event) = state.events.get_mut(&id) else {
            return false;
        };
        if event.removed || event.flags.paused {
            return false;
        }
        event.flags.paused = true;
        let qid = event.qid;
        if qid > 0 {
            heap::dequeue(&mut state, qid);
        }
        true
    }

    /// Resume a paused event, rescheduling from the current time.
    pub fn resume(&self, id: i32) -> bool {
        let now = Time::now();
        let mut state = self.shared.state.lock();
        if state.shutdown_pending {
            return false;
        }
        let Some(event) = state.events.get_mut(&id) else {
            return false;
        };
        if event.removed || !event.flags.paused {
            return false;
        }
        event.flags.paused = false;
        event.scheduled = now;
        queue_event(&mut state, id, now);
        drop(state);
        self.shared.sched_cond.notify_one();
        true
    }

    /// Timing and flag snapshot of every live event.
    pub fn snapshot(&self) -> Vec<EventInfo> {
        let state = self.shared.state.lock();
        state
            .events
            .values()
            .filter(|e| !e.removed)
            .map(Event::info)
            .collect()
    }

    /// Flag the scheduler for shutdown and wake everything.
    pub fn start_shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown_pending = true;
        drop(state);
        self.shared.sched_cond.notify_all();
        self.shared.event_cond.notify_all();
    }

    /// Wait for the dispatcher and workers to finish, up to `deadline`.
    pub fn wait_shutdown(&self, timeout: Time) {
        let deadline = std::time::Instant::now() + timeout.as_duration();
        let mut state = self.shared.state.lock();
        while state.dispatcher_running {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                warn!("timeout waiting for scheduler shutdown");
                return;
            }
            if state
                .wait_on_for(&self.shared.sched_cond, remaining)
                .timed_out()
            {
                warn!("timeout waiting for scheduler shutdown");
                return;
            }
        }
        debug!("scheduler shutdown complete");
    }

}

/// Compute the next firing time and push onto the heap.
///
/// Called with the state lock held. Paused events stay unqueued.
fn queue_event(state: &mut SchedState, id: i32, now: Time) {
    let Some(event) = state.events.get_mut(&id) else {
        return;
    };
    if event.flags.paused || event.qid > 0 {
        return;
    }
    if event.flags.daily || event.flags.weekly {
        event.nextqueue =
            event::next_civil_firing(event.scheduled, event.interval.sec, event.flags.weekly);
        event.scheduled = event.nextqueue;
    } else {
        let mut next = event.scheduled;
        next.incr(event.interval.sec, i64::from(event.interval.usec));
        event.scheduled = next;
        event.nextqueue = next;
        let (_, overdue) = Time::diff(next, now);
        if overdue == std::cmp::Ordering::Less {
            let mut soon = now;
            soon.incr(0, 10_000);
            event.nextqueue = soon;
            warn!(id, "scheduled event overlaps its interval; running late");
        }
    }
    heap::enqueue(state, id);
}

/// Dispatcher loop: fire due events, farm detached ones out to workers,
/// sleep until the next deadline.
fn dispatcher(shared: Arc<Shared>) {
    info!("scheduler starting");
    let mut state = shared.state.lock();
    while !state.shutdown_pending {
        let mut now = Time::now();
        let mut ready: SmallVec<[i32; 8]> = SmallVec::new();

        while state.heap.len() > 1 {
            let head = state.heap[1];
            let due = state
                .events
                .get(&head)
                .map(|e| e.nextqueue <= now)
                .unwrap_or(false);
            if !due {
                break;
            }
            heap::dequeue(&mut state, 1);
            let event = state.events.get_mut(&head).unwrap_or_else(|| unreachable!());
            if event.flags.once {
                // One-shot events leave the id space right away; the
                // runner drops the entry after the final run.
                event.removed = true;
            }
            event.lastqueue = now;
            if event.flags.thread {
                event.flags.running = true;
                event.laststart = now;
                state.fifo.push(head);
            } else {
                ready.push(head);
            }
        }

        if !state.fifo.is_empty() {
            if state.nidle == 0 {
                state.nidle += 1;
                state.nthreads += 1;
                let shared2 = Arc::clone(&shared);
                let n = state.nthreads;
                std::thread::Builder::new()
                    .name(format!("alder-sched:worker{n}"))
                    .spawn(move || event_worker(shared2))
                    .unwrap_or_else(|e| alder_base::fatal("thread create", e));
            }
            shared.event_cond.notify_one();
        }

        for id in ready {
            let proc = {
                let Some(event) = state.events.get_mut(&id) else {
                    continue;
                };
                event.laststart = now;
                event.flags.running = true;
                Arc::clone(&event.proc)
            };
            drop(state);
            (&mut *proc.lock())(id);
            now = Time::now();
            state = shared.state.lock();

            if let Some(event) = state.events.get_mut(&id) {
                let (elapsed, _) = Time::diff(now, event.laststart);
                if elapsed > shared.config.max_elapsed {
                    warn!(id, %elapsed, "scheduled proc took excessive time");
                }
                if event.removed {
                    state.events.remove(&id);
                } else {
                    event.flags.running = false;
                    event.lastend = now;
                    queue_event(&mut state, id, now);
                }
            }
        }

        if state.heap.len() <= 1 {
            state.wait_on(&shared.sched_cond);
        } else if !state.shutdown_pending {
            let head = state.heap[1];
            if let Some(event) = state.events.get(&head) {
                let (until, sign) = Time::diff(event.nextqueue, Time::now());
                if sign == std::cmp::Ordering::Greater {
                    state.wait_on_for(&shared.sched_cond, until.as_duration());
                }
            }
        }
    }

    info!("scheduler shutdown started");
    if state.nthreads > 0 {
        shared.event_cond.notify_all();
        while state.nthreads > 0 {
            state.wait_on_for(&shared.sched_cond, Duration::from_millis(100));
        }
    }
    state.events.clear();
    state.heap.truncate(1);
    state.fifo.clear();
    state.dispatcher_running = false;
    drop(state);
    shared.sched_cond.notify_all();
    info!("scheduler shutdown complete");
}

/// Worker loop for detached events.
fn event_worker(shared: Arc<Shared>) {
    let jpt = shared.config.jobs_per_thread;
    let mut remaining = jpt;
    debug!("sched worker starting");

    let mut state = shared.state.lock();
    loop {
        while state.fifo.is_empty() && !state.shutdown_pending {
            state.wait_on(&shared.event_cond);
        }
        let Some(id) = state.fifo.pop() else {
            break;
        };
        if !state.fifo.is_empty() {
            shared.event_cond.notify_one();
        }
        state.nidle -= 1;

        let proc = match state.events.get(&id) {
            Some(event) => Arc::clone(&event.proc),
            None => {
                state.nidle += 1;
                continue;
            }
        };
        drop(state);
        debug!(id, "sched worker running event");
        (&mut *proc.lock())(id);
        let now = Time::now();
        state = shared.state.lock();

        state.nidle += 1;
        if let Some(event) = state.events.get_mut(&id) {
            if event.removed {
                state.events.remove(&id);
            } else {
                event.flags.running = false;
                event.lastend = now;
                queue_event(&mut state, id, now);
            }
        }

        if jpt != 0 {
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
    }
    state.nthreads -= 1;
    state.nidle = state.nidle.saturating_sub(1);
    debug!(threads = state.nthreads, idle = state.nidle, "sched worker exiting");
    drop(state);
    shared.sched_cond.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtOrd};
    use std::sync::Arc as StdArc;

    fn scheduler() -> Scheduler {
        let s = Scheduler::new(SchedConfig::default());
        s.start();
        s
    }

    #[test]
    fn one_shot_fires_once() {
        let s = scheduler();
        let count = StdArc::new(AtomicU32::new(0));
        let c = StdArc::clone(&count);
        s.after(Time::from_millis(20), move |_| {
            c.fetch_add(1, AtOrd::SeqCst);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(AtOrd::SeqCst), 1);
        s.start_shutdown();
        s.wait_shutdown(Time::from_secs(2));
    }

    #[test]
    fn periodic_event_repeats_on_schedule() {
        let s = scheduler();
        let count = StdArc::new(AtomicU32::new(0));
        let c = StdArc::clone(&count);
        let id = s
            .schedule(EventFlags::default(), Time::from_millis(100), move |_| {
                c.fetch_add(1, AtOrd::SeqCst);
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(550));
        let fired = count.load(AtOrd::SeqCst);
        assert!(
            (4..=6).contains(&fired),
            "expected about 5 firings in 550ms, got {fired}"
        );
        assert!(s.cancel(id));
        s.start_shutdown();
        s.wait_shutdown(Time::from_secs(2));
    }

    #[test]
    fn detached_events_run_on_workers() {
        let s = scheduler();
        let seen = StdArc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = StdArc::clone(&seen);
        let mut flags = EventFlags::once();
        flags.thread = true;
        s.schedule(flags, Time::from_millis(10), move |id| {
            seen2.lock().push((id, std::thread::current().name().map(String::from)));
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let name = seen[0].1.clone().unwrap_or_default();
        assert!(name.starts_with("alder-sched:worker"), "ran on {name}");
        s.start_shutdown();
        s.wait_shutdown(Time::from_secs(2));
    }

    #[test]
    fn pause_stops_and_resume_restarts() {
        let s = scheduler();
        let count = StdArc::new(AtomicU32::new(0));
        let c = StdArc::clone(&count);
        let id = s
            .schedule(EventFlags::default(), Time::from_millis(30), move |_| {
                c.fetch_add(1, AtOrd::SeqCst);
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(s.pause(id));
        assert!(!s.pause(id), "second pause reports false");
        let frozen = count.load(AtOrd::SeqCst);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(count.load(AtOrd::SeqCst), frozen);
        assert!(s.resume(id));
        assert!(!s.resume(id), "resume of running event reports false");
        std::thread::sleep(Duration::from_millis(100));
        assert!(count.load(AtOrd::SeqCst) > frozen);
        s.cancel(id);
        s.start_shutdown();
        s.wait_shutdown(Time::from_secs(2));
    }

    #[test]
    fn cancel_unknown_event_is_false() {
        let s = scheduler();
        assert!(!s.cancel(9999));
        s.start_shutdown();
        s.wait_shutdown(Time::from_secs(2));
    }

    #[test]
    fn snapshot_reports_events() {
        let s = scheduler();
        let id = s
            .schedule(EventFlags::default(), Time::from_secs(3600), |_| {})
            .unwrap();
        let info = s.snapshot();
        let mine = info.iter().find(|e| e.id == id).expect("event listed");
        assert!(!mine.flags.once);
        assert!(mine.nextqueue > Time::now());
        s.cancel(id);
        s.start_shutdown();
        s.wait_shutdown(Time::from_secs(2));
    }
}
