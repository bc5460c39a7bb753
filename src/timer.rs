//! Timer state machine: per task a timer is either idle or running one
//! interval. The datastore stays the final authority; the state here is
//! always derived from the most recent running row.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::cache::AggregateCache;
use crate::clock::Clock;
use crate::error::{Result, TrackerError};
use crate::gateway::Gateway;
use crate::models::{ClosedInterval, Scope, Task, TimeInterval, billable_seconds};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TimerState {
    Idle,
    Running {
        interval_id: String,
        started_at: DateTime<Utc>,
    },
}

impl TimerState {
    pub fn from_latest(latest_running: Option<TimeInterval>) -> Self {
        match latest_running {
            Some(interval) => TimerState::Running {
                interval_id: interval.id,
                started_at: interval.started_at,
            },
            None => TimerState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TimerState::Running { .. })
    }
}

/// Result of a successful start.
#[derive(Debug, Clone, Serialize)]
pub struct Started {
    pub task_id: String,
    pub interval_id: String,
    pub started_at: DateTime<Utc>,
    /// Intervals that were still running and were closed first.
    pub force_closed: Vec<TimeInterval>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped {
        task_id: String,
        interval_id: String,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
    },
    /// Nothing was running; no row was touched.
    NothingToStop { task_id: String },
}

impl StopOutcome {
    pub fn duration_seconds(&self) -> Option<i64> {
        match self {
            StopOutcome::Stopped {
                duration_seconds, ..
            } => Some(*duration_seconds),
            StopOutcome::NothingToStop { .. } => None,
        }
    }
}

pub struct TimerMachine<'a> {
    gateway: &'a dyn Gateway,
    cache: &'a dyn AggregateCache,
    clock: &'a dyn Clock,
}

impl<'a> TimerMachine<'a> {
    pub fn new(
        gateway: &'a dyn Gateway,
        cache: &'a dyn AggregateCache,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            gateway,
            cache,
            clock,
        }
    }

    fn load_task(&self, task_id: &str) -> Result<Task> {
        self.gateway
            .find_task(task_id)?
            .ok_or_else(|| TrackerError::not_found("task", task_id))
    }

    pub fn state(&self, task_id: &str) -> Result<TimerState> {
        Ok(TimerState::from_latest(
            self.gateway.latest_running_interval(task_id)?,
        ))
    }

    /// Start a new interval, closing any interval still marked running.
    pub fn start(&self, task_id: &str) -> Result<Started> {
        let task = self.load_task(task_id)?;
        let now = self.clock.now();
        let interval_id = Uuid::new_v4().to_string();

        let opened = self.gateway.open_interval(&task.id, &interval_id, now)?;
        if !opened.closed.is_empty() {
            warn!(
                "task {}: force-closed {} interval(s) left running before start",
                task.id,
                opened.closed.len()
            );
        }
        self.invalidate(&task);
        info!("task {}: timer started at {}", task.id, now.to_rfc3339());

        Ok(Started {
            task_id: task.id,
            interval_id: opened.interval.id,
            started_at: opened.interval.started_at,
            force_closed: opened.closed,
        })
    }

    /// Stop the most recent running interval. Stopping an idle timer is a
    /// reported no-op.
    pub fn stop(&self, task_id: &str) -> Result<StopOutcome> {
        let task = self.load_task(task_id)?;

        let (interval_id, started_at) = match self.state(&task.id)? {
            TimerState::Idle => {
                debug!("task {}: stop with nothing running", task.id);
                return Ok(StopOutcome::NothingToStop { task_id: task.id });
            }
            TimerState::Running {
                interval_id,
                started_at,
            } => (interval_id, started_at),
        };

        let now = self.clock.now();
        let closed = ClosedInterval {
            ended_at: now,
            duration_seconds: billable_seconds(started_at, now),
        };
        if !self.gateway.close_interval(&interval_id, closed)? {
            // a concurrent stop got there first
            debug!("task {}: interval {interval_id} already closed", task.id);
            return Ok(StopOutcome::NothingToStop { task_id: task.id });
        }
        self.invalidate(&task);
        info!(
            "task {}: timer stopped after {}s",
            task.id, closed.duration_seconds
        );

        Ok(StopOutcome::Stopped {
            task_id: task.id,
            interval_id,
            started_at,
            ended_at: closed.ended_at,
            duration_seconds: closed.duration_seconds,
        })
    }

    /// Drop the cached task and project aggregates. The mutation has already
    /// committed, so a failing cache is retried once and then reported; the
    /// TTL bounds how long a missed scope can stay stale.
    fn invalidate(&self, task: &Task) {
        for scope in [
            Scope::Task(task.id.clone()),
            Scope::Project(task.project_id.clone()),
        ] {
            let Err(first) = self.cache.invalidate(&scope) else {
                continue;
            };
            warn!("failed to invalidate cached aggregate for {scope}, retrying: {first}");
            if let Err(e) = self.cache.invalidate(&scope) {
                error!("cached aggregate for {scope} may be stale until it expires: {e}");
            }
        }
    }
}
