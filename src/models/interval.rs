use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One contiguous start/stop timer record for a task.
///
/// `ended_at` and `duration_seconds` stay `None` while the interval is running
/// and are written exactly once, when it is closed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub is_running: bool,
}

/// Values written to a running interval when it is stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosedInterval {
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl TimeInterval {
    pub fn start(id: String, task_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            task_id,
            started_at,
            ended_at: None,
            duration_seconds: None,
            is_running: true,
        }
    }

    /// Compute the closing values for this interval at `ended_at`.
    pub fn close_at(&self, ended_at: DateTime<Utc>) -> ClosedInterval {
        ClosedInterval {
            ended_at,
            duration_seconds: billable_seconds(self.started_at, ended_at),
        }
    }

    /// Apply closing values in place.
    pub fn apply_close(&mut self, closed: ClosedInterval) {
        self.ended_at = Some(closed.ended_at);
        self.duration_seconds = Some(closed.duration_seconds);
        self.is_running = false;
    }

    /// Seconds contributed by a closed interval; 0 for a running one.
    ///
    /// Rows with a missing or negative duration fall back to the floored
    /// span between start and end, clamped at zero.
    pub fn closed_seconds(&self) -> i64 {
        if self.is_running {
            return 0;
        }
        match (self.duration_seconds, self.ended_at) {
            (Some(d), _) if d >= 0 => d,
            (_, Some(end)) => (end - self.started_at).num_seconds().max(0),
            _ => 0,
        }
    }
}

/// Billable seconds between two instants: rounded to the nearest second,
/// never less than one.
pub fn billable_seconds(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    let millis = (ended_at - started_at).num_milliseconds();
    let secs = (millis as f64 / 1000.0).round() as i64;
    secs.max(1)
}
