//! Scheduled event records and civil-time firing computation.

use std::sync::Arc;

use chrono::{Datelike, Duration as CivilDuration, Local, LocalResult, NaiveDateTime, TimeZone};

use alder_base::Time;

use crate::SchedProc;

/// Scheduling flags for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags {
    /// Fire once, then discard.
    pub once: bool,
    /// Run detached on a worker instead of inline on the dispatcher.
    pub thread: bool,
    /// Fire daily at an offset from local midnight.
    pub daily: bool,
    /// Fire weekly at an offset from the start of the Sunday-based week.
    pub weekly: bool,
    /// Temporarily excluded from the queue.
    pub paused: bool,
    /// Currently executing.
    pub running: bool,
}

impl EventFlags {
    /// Flags for a plain one-shot event.
    pub fn once() -> Self {
        EventFlags {
            once: true,
            ..Default::default()
        }
    }

    /// Flags for a detached one-shot event.
    pub fn detached_once() -> Self {
        EventFlags {
            once: true,
            thread: true,
            ..Default::default()
        }
    }
}

pub(crate) struct Event {
    pub id: i32,
    /// Heap position; zero means not queued.
    pub qid: usize,
    pub flags: EventFlags,
    /// Unlinked from the id table; the runner drops it after the current
    /// run instead of re-queueing.
    pub removed: bool,
    pub nextqueue: Time,
    pub lastqueue: Time,
    pub laststart: Time,
    pub lastend: Time,
    pub scheduled: Time,
    pub interval: Time,
    pub proc: Arc<parking_lot::Mutex<SchedProc>>,
}

impl Event {
    pub fn new(id: i32, flags: EventFlags, interval: Time, now: Time, proc: SchedProc) -> Self {
        let unset = Time { sec: -1, usec: 0 };
        Event {
            id,
            qid: 0,
            flags,
            removed: false,
            nextqueue: Time::ZERO,
            lastqueue: unset,
            laststart: unset,
            lastend: unset,
            scheduled: now,
            interval,
            proc: Arc::new(parking_lot::Mutex::new(proc)),
        }
    }

    pub fn info(&self) -> EventInfo {
        EventInfo {
            id: self.id,
            flags: self.flags,
            nextqueue: self.nextqueue,
            lastqueue: self.lastqueue,
            laststart: self.laststart,
            lastend: self.lastend,
            interval: self.interval,
        }
    }
}

/// Introspection view of one event.
#[derive(Debug, Clone)]
pub struct EventInfo {
    pub id: i32,
    pub flags: EventFlags,
    pub nextqueue: Time,
    pub lastqueue: Time,
    pub laststart: Time,
    pub lastend: Time,
    pub interval: Time,
}

/// Next daily or weekly firing strictly after `scheduled`.
///
/// `offset_sec` counts from local midnight (daily) or from midnight of
/// the week's Sunday (weekly).
pub(crate) fn next_civil_firing(scheduled: Time, offset_sec: i64, weekly: bool) -> Time {
    let local = match Local.timestamp_opt(scheduled.sec, 0) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(dt, _) => dt,
        LocalResult::None => Local::now(),
    };
    let mut base = local.date_naive();
    if weekly {
        let back = i64::from(local.weekday().num_days_from_sunday());
        base -= CivilDuration::days(back);
    }
    let midnight = base
        .and_hms_opt(0, 0, 0)
        .unwrap_or_else(|| unreachable!("midnight always exists"));
    let mut target = midnight + CivilDuration::seconds(offset_sec);
    let mut next = local_timestamp(target);
    if next <= scheduled.sec {
        target += CivilDuration::days(if weekly { 7 } else { 1 });
        next = local_timestamp(target);
    }
    Time::from_secs(next)
}

fn local_timestamp(ndt: NaiveDateTime) -> i64 {
    match Local.from_local_datetime(&ndt) {
        LocalResult::Single(dt) => dt.timestamp(),
        LocalResult::Ambiguous(dt, _) => dt.timestamp(),
        // A DST gap; land just past it.
        LocalResult::None => match Local.from_local_datetime(&(ndt + CivilDuration::hours(1))) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.timestamp(),
            LocalResult::None => ndt.and_utc().timestamp(),
        },
    }
}
