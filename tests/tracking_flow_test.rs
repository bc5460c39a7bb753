use billable_time::api::{Caller, Tracker};
use billable_time::cache::MemoryCache;
use billable_time::clock::ManualClock;
use billable_time::db::{SqliteCache, SqliteGateway};
use billable_time::gateway::Gateway;
use billable_time::models::Scope;
use billable_time::timer::{StopOutcome, TimerState};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap()
}

struct Env {
    _dir: TempDir,
    gateway: Arc<SqliteGateway>,
    clock: Arc<ManualClock>,
    tracker: Tracker,
    caller: Caller,
}

fn env_with_memory_cache(ttl_secs: i64) -> Env {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(SqliteGateway::open(dir.path().join("tracker.db")).unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let cache = Arc::new(MemoryCache::new(Duration::seconds(ttl_secs), clock.clone()));
    let tracker = Tracker::new(gateway.clone(), cache, clock.clone());
    Env {
        _dir: dir,
        gateway,
        clock,
        tracker,
        caller: Caller::new("alice"),
    }
}

#[test]
fn test_start_wait_stop_summarize() {
    let env = env_with_memory_cache(30);
    let project = env
        .tracker
        .create_project(&env.caller, "Website", Some(80.0))
        .unwrap();
    let task = env
        .tracker
        .create_task(&env.caller, &project.id, "Landing page", None)
        .unwrap();

    let started = env.tracker.start(&env.caller, &task.id).unwrap();
    assert_eq!(started.started_at, t0());
    assert!(started.force_closed.is_empty());
    assert!(matches!(
        env.tracker.timer_state(&env.caller, &task.id).unwrap(),
        TimerState::Running { .. }
    ));

    env.clock.advance(Duration::seconds(125));
    let outcome = env.tracker.stop(&env.caller, &task.id).unwrap();
    assert_eq!(outcome.duration_seconds(), Some(125));

    let task_agg = env
        .tracker
        .summary(&env.caller, &Scope::Task(task.id.clone()))
        .unwrap();
    assert_eq!(task_agg.total_seconds, 125);
    assert!(!task_agg.running);

    let project_agg = env
        .tracker
        .summary(&env.caller, &Scope::Project(project.id.clone()))
        .unwrap();
    assert_eq!(project_agg.total_seconds, 125);
    assert_eq!(
        env.tracker.timer_state(&env.caller, &task.id).unwrap(),
        TimerState::Idle
    );
}

#[test]
fn test_second_stop_is_a_noop() {
    let env = env_with_memory_cache(30);
    let project = env
        .tracker
        .create_project(&env.caller, "Website", None)
        .unwrap();
    let task = env
        .tracker
        .create_task(&env.caller, &project.id, "Copy", None)
        .unwrap();
    env.tracker.start(&env.caller, &task.id).unwrap();
    env.clock.advance(Duration::seconds(10));
    env.tracker.stop(&env.caller, &task.id).unwrap();

    let again = env.tracker.stop(&env.caller, &task.id).unwrap();
    assert!(matches!(again, StopOutcome::NothingToStop { .. }));
    let intervals = env.tracker.intervals(&env.caller, &task.id).unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].duration_seconds, Some(10));
}

#[test]
fn test_double_start_closes_previous_interval() {
    let env = env_with_memory_cache(30);
    let project = env
        .tracker
        .create_project(&env.caller, "Website", None)
        .unwrap();
    let task = env
        .tracker
        .create_task(&env.caller, &project.id, "Copy", None)
        .unwrap();

    env.tracker.start(&env.caller, &task.id).unwrap();
    env.clock.advance(Duration::seconds(40));
    let second = env.tracker.start(&env.caller, &task.id).unwrap();
    assert_eq!(second.force_closed.len(), 1);
    assert_eq!(second.force_closed[0].duration_seconds, Some(40));

    let intervals = env.gateway.intervals_for_task(&task.id).unwrap();
    assert_eq!(intervals.iter().filter(|i| i.is_running).count(), 1);

    let agg = env
        .tracker
        .summary(&env.caller, &Scope::Task(task.id.clone()))
        .unwrap();
    assert_eq!(agg.total_seconds, 40);
    assert!(agg.running);
    assert_eq!(agg.running_started_at, Some(t0() + Duration::seconds(40)));
    env.clock.advance(Duration::seconds(5));
    assert_eq!(agg.live_seconds(env.tracker.now()), 45);
}

#[test]
fn test_cached_aggregate_served_until_invalidated() {
    let env = env_with_memory_cache(30);
    let project = env
        .tracker
        .create_project(&env.caller, "Website", None)
        .unwrap();
    let task = env
        .tracker
        .create_task(&env.caller, &project.id, "Copy", None)
        .unwrap();
    let scope = Scope::Task(task.id.clone());

    env.tracker.start(&env.caller, &task.id).unwrap();
    env.clock.advance(Duration::seconds(60));
    env.tracker.stop(&env.caller, &task.id).unwrap();
    assert_eq!(
        env.tracker.summary(&env.caller, &scope).unwrap().total_seconds,
        60
    );

    // A write that bypasses the timer leaves the cached value in place.
    let opened = env
        .gateway
        .open_interval(&task.id, "side-door", env.tracker.now())
        .unwrap();
    env.clock.advance(Duration::seconds(20));
    let closed = opened.interval.close_at(env.tracker.now());
    assert!(env.gateway.close_interval("side-door", closed).unwrap());
    assert_eq!(
        env.tracker.summary(&env.caller, &scope).unwrap().total_seconds,
        60
    );

    // Past the TTL the engine recomputes.
    env.clock.advance(Duration::seconds(31));
    assert_eq!(
        env.tracker.summary(&env.caller, &scope).unwrap().total_seconds,
        80
    );

    // Timer mutations invalidate immediately.
    env.tracker.start(&env.caller, &task.id).unwrap();
    env.clock.advance(Duration::seconds(5));
    env.tracker.stop(&env.caller, &task.id).unwrap();
    assert_eq!(
        env.tracker.summary(&env.caller, &scope).unwrap().total_seconds,
        85
    );
}

#[test]
fn test_sqlite_cache_shared_between_trackers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let clock = Arc::new(ManualClock::new(t0()));
    let caller = Caller::new("alice");

    let make_tracker = || {
        let gateway = SqliteGateway::open(&path).unwrap();
        let cache = Arc::new(SqliteCache::new(&gateway, Duration::seconds(30), clock.clone()));
        Tracker::new(Arc::new(gateway), cache, clock.clone())
    };
    let first = make_tracker();
    let second = make_tracker();

    let project = first.create_project(&caller, "Website", None).unwrap();
    let task = first
        .create_task(&caller, &project.id, "Copy", None)
        .unwrap();
    let scope = Scope::Project(project.id.clone());
    assert_eq!(second.summary(&caller, &scope).unwrap().total_seconds, 0);

    first.start(&caller, &task.id).unwrap();
    clock.advance(Duration::seconds(90));
    first.stop(&caller, &task.id).unwrap();

    // The stop in one tracker invalidated the entry the other one cached.
    assert_eq!(second.summary(&caller, &scope).unwrap().total_seconds, 90);
}
