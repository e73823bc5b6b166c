//! End-to-end job queue behavior against the scripted evaluator.

use std::time::{Duration, Instant};

use alder_base::Time;
use alder_jobs::{JobError, JobPool, JobState, JobsConfig, QueueOpts};
use alder_script::testing::ScriptedEvaluatorFactory;
use alder_script::{ScriptError, ScriptErrorCode};

fn pool_with(factory: ScriptedEvaluatorFactory) -> JobPool {
    JobPool::new(factory.build(), JobsConfig::default())
}

#[test]
fn wait_returns_the_script_result() {
    let pool = pool_with(ScriptedEvaluatorFactory::new().with_result("compute", "42"));
    pool.create("q", 2, "test queue").unwrap();
    let id = pool.queue("q", "compute", QueueOpts::default()).unwrap();
    assert_eq!(pool.wait("q", &id, None).unwrap(), "42");
    // The job record is consumed by the wait.
    assert!(!pool.exists("q", &id));
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn wait_propagates_script_errors() {
    let pool = pool_with(
        ScriptedEvaluatorFactory::new().with_error("boom", ScriptError::error("exploded")),
    );
    pool.create("q", 1, "").unwrap();
    let id = pool.queue("q", "boom", QueueOpts::default()).unwrap();
    match pool.wait("q", &id, None) {
        Err(JobError::Script(err)) => {
            assert_eq!(err.code, ScriptErrorCode::Error);
            assert_eq!(err.info, "exploded");
        }
        other => panic!("expected script error, got {other:?}"),
    }
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn wait_timeout_leaves_the_job_waitable() {
    let pool = pool_with(ScriptedEvaluatorFactory::new().with_sleep(
        "slow",
        Duration::from_millis(500),
        "finally",
    ));
    pool.create("q", 1, "").unwrap();
    let id = pool.queue("q", "slow", QueueOpts::default()).unwrap();

    let err = pool.wait("q", &id, Some(Time::from_millis(100))).unwrap_err();
    assert!(err.is_timeout());
    assert!(pool.exists("q", &id), "timed-out job stays in place");

    // A second wait without a timeout picks up the result.
    assert_eq!(pool.wait("q", &id, None).unwrap(), "finally");
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn detached_jobs_cannot_be_waited_on() {
    let pool = pool_with(ScriptedEvaluatorFactory::new().with_result("task", "ok"));
    pool.create("q", 1, "").unwrap();
    let id = pool
        .queue(
            "q",
            "task",
            QueueOpts {
                detached: true,
                ..Default::default()
            },
        )
        .unwrap();
    match pool.wait("q", &id, None) {
        Err(JobError::DetachedWait(_)) | Err(JobError::NoSuchJob(_)) => {}
        other => panic!("expected detached-wait rejection, got {other:?}"),
    }
    // Detached jobs clean themselves up.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!pool.exists("q", &id));
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn duplicate_ids_and_queues_are_rejected() {
    let pool = pool_with(ScriptedEvaluatorFactory::new().with_sleep(
        "slow",
        Duration::from_millis(300),
        "x",
    ));
    pool.create("q", 1, "").unwrap();
    assert!(matches!(
        pool.create("q", 1, ""),
        Err(JobError::DuplicateQueue(_))
    ));
    let opts = QueueOpts {
        job_id: Some("mine".to_string()),
        ..Default::default()
    };
    pool.queue("q", "slow", opts.clone()).unwrap();
    assert!(matches!(
        pool.queue("q", "slow", opts),
        Err(JobError::DuplicateJob(_))
    ));
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn queue_cap_serializes_jobs() {
    let pool = pool_with(ScriptedEvaluatorFactory::new().with_sleep(
        "slow",
        Duration::from_millis(120),
        "done",
    ));
    pool.create("solo", 1, "cap of one").unwrap();
    let started = Instant::now();
    let a = pool.queue("solo", "slow", QueueOpts::default()).unwrap();
    let b = pool.queue("solo", "slow", QueueOpts::default()).unwrap();
    assert_eq!(pool.wait("solo", &a, None).unwrap(), "done");
    assert_eq!(pool.wait("solo", &b, None).unwrap(), "done");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(240),
        "cap 1 must serialize: {elapsed:?}"
    );
    let info = pool
        .queuelist()
        .into_iter()
        .find(|q| q.name == "solo")
        .unwrap();
    assert_eq!(info.max_threads, 1);
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn cancel_interrupts_a_running_job() {
    let pool = pool_with(ScriptedEvaluatorFactory::new().with_sleep(
        "napping",
        Duration::from_secs(5),
        "never",
    ));
    pool.create("q", 1, "").unwrap();
    let id = pool.queue("q", "napping", QueueOpts::default()).unwrap();

    // Let the worker pick it up.
    let mut running = false;
    for _ in 0..100 {
        if pool
            .joblist("q")
            .unwrap()
            .iter()
            .any(|j| j.id == id && j.state == JobState::Running)
        {
            running = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(running, "job never started");

    assert!(pool.cancel("q", &id).unwrap(), "cancel reports running");
    match pool.wait("q", &id, Some(Time::from_secs(2))) {
        Err(JobError::Script(err)) => assert_eq!(err.code, ScriptErrorCode::Cancelled),
        other => panic!("expected cancelled job error, got {other:?}"),
    }
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn waitany_returns_once_something_is_done() {
    let pool = pool_with(
        ScriptedEvaluatorFactory::new()
            .with_sleep("slow", Duration::from_secs(3), "s")
            .with_result("quick", "q"),
    );
    pool.create("q", 2, "").unwrap();
    pool.queue("q", "slow", QueueOpts::default()).unwrap();
    let quick = pool.queue("q", "quick", QueueOpts::default()).unwrap();
    pool.waitany("q", Some(Time::from_secs(2))).unwrap();
    assert_eq!(pool.wait("q", &quick, None).unwrap(), "q");
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn delete_is_deferred_until_queue_drains() {
    let pool = pool_with(ScriptedEvaluatorFactory::new().with_sleep(
        "slow",
        Duration::from_millis(150),
        "x",
    ));
    pool.create("doomed", 1, "").unwrap();
    let id = pool.queue("doomed", "slow", QueueOpts::default()).unwrap();
    pool.delete("doomed").unwrap();
    // Queue still listed while its job lives.
    assert!(pool.queues().contains(&"doomed".to_string()));
    // New submissions are refused.
    assert!(matches!(
        pool.queue("doomed", "slow", QueueOpts::default()),
        Err(JobError::ShuttingDown)
    ));
    assert_eq!(pool.wait("doomed", &id, None).unwrap(), "x");
    assert!(!pool.queues().contains(&"doomed".to_string()));
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn pool_counters_and_genid() {
    let pool = pool_with(ScriptedEvaluatorFactory::new().with_result("task", "ok"));
    pool.create("a", 2, "").unwrap();
    pool.create("b", 3, "").unwrap();
    let info = pool.threadlist();
    assert_eq!(info.max_threads, 5);
    let g1 = pool.genid();
    let g2 = pool.genid();
    assert_ne!(g1, g2);
    assert!(g1.starts_with("job"));
    pool.start_shutdown();
    pool.wait_shutdown(Time::from_secs(2));
}

#[test]
fn configure_round_trips() {
    let pool = pool_with(ScriptedEvaluatorFactory::new());
    pool.configure(JobsConfig {
        jobs_per_thread: 7,
        timeout: Time::from_secs(30),
        log_min_duration: Time::from_millis(250),
    });
    let cfg = pool.config();
    assert_eq!(cfg.jobs_per_thread, 7);
    assert_eq!(cfg.timeout, Time::from_secs(30));
}
