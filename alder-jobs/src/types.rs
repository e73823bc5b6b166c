//! Job and queue records plus their introspection views.

use alder_base::Time;
use alder_script::{InterruptHandle, ScriptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Running,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    NonDetached,
    Detached,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::NonDetached => "nondetached",
            JobType::Detached => "detached",
        }
    }
}

pub(crate) struct Job {
    pub id: String,
    pub state: JobState,
    pub jtype: JobType,
    /// A waiter is currently blocked on this job.
    pub waited: bool,
    pub cancelled: bool,
    pub script: String,
    pub results: String,
    pub error: Option<ScriptError>,
    pub start_time: Time,
    pub end_time: Time,
    pub interrupt: Option<InterruptHandle>,
}

impl Job {
    pub fn new(id: String, jtype: JobType, script: String) -> Self {
        Job {
            id,
            state: JobState::Scheduled,
            jtype,
            waited: false,
            cancelled: false,
            script,
            results: String::new(),
            error: None,
            start_time: Time::now(),
            end_time: Time::ZERO,
            interrupt: None,
        }
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            state: self.state,
            jtype: self.jtype,
            script: self.script.clone(),
            results: self.results.clone(),
            error: self.error.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// Introspection view of one job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub state: JobState,
    pub jtype: JobType,
    pub script: String,
    pub results: String,
    pub error: Option<ScriptError>,
    pub start_time: Time,
    pub end_time: Time,
}

/// Introspection view of one queue.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub desc: String,
    pub max_threads: usize,
    pub nrunning: usize,
    pub delete_pending: bool,
}

/// Introspection view of the shared pool.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub max_threads: usize,
    pub nthreads: usize,
    pub nidle: usize,
    pub stop_pending: bool,
}
