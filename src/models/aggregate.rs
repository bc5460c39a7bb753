use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an aggregate is computed over.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum Scope {
    Task(String),
    Project(String),
}

impl Scope {
    pub fn id(&self) -> &str {
        match self {
            Scope::Task(id) | Scope::Project(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Task(_) => "task",
            Scope::Project(_) => "project",
        }
    }

    /// Stable string form used as a cache key.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.kind(), self.id())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// Billable time for a task or project, derived from interval rows.
///
/// `total_seconds` holds closed durations only. `running` and
/// `running_started_at` describe the first open interval found so a client can
/// add live elapsed time itself; `running_task_ids` lists every task that has
/// an open interval.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub total_seconds: i64,
    pub running: bool,
    pub running_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_task_ids: Vec<String>,
}

impl AggregateResult {
    /// Closed seconds plus the elapsed time of the reported running interval.
    pub fn live_seconds(&self, now: DateTime<Utc>) -> i64 {
        let live = match self.running_started_at {
            Some(start) if self.running => (now - start).num_seconds().max(0),
            _ => 0,
        };
        self.total_seconds.saturating_add(live)
    }

    pub fn total_hours(&self) -> f64 {
        self.total_seconds as f64 / 3600.0
    }
}
