//! # Aggregation Module
//!
//! Turns interval rows into billable totals for a task or a project rollup.

use crate::error::Result;
use crate::gateway::Gateway;
use crate::models::{AggregateResult, Scope, TimeInterval};

/// Fold interval rows into an aggregate.
///
/// Only closed durations are summed. The first open interval encountered
/// defines `running_started_at`; every task with an open interval is listed in
/// `running_task_ids`. Totals are clamped at zero.
pub fn summarize_intervals(intervals: &[TimeInterval]) -> AggregateResult {
    let mut total_seconds: i64 = 0;
    let mut running_started_at = None;
    let mut running_task_ids: Vec<String> = Vec::new();

    for interval in intervals {
        if interval.is_running {
            if running_started_at.is_none() {
                running_started_at = Some(interval.started_at);
            }
            if !running_task_ids.contains(&interval.task_id) {
                running_task_ids.push(interval.task_id.clone());
            }
        } else {
            total_seconds = total_seconds.saturating_add(interval.closed_seconds());
        }
    }

    AggregateResult {
        total_seconds: total_seconds.max(0),
        running: running_started_at.is_some(),
        running_started_at,
        running_task_ids,
    }
}

/// Reads intervals through the gateway and summarizes them.
pub struct AggregationEngine<'a> {
    gateway: &'a dyn Gateway,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(gateway: &'a dyn Gateway) -> Self {
        Self { gateway }
    }

    pub fn summarize(&self, scope: &Scope) -> Result<AggregateResult> {
        let intervals = match scope {
            Scope::Task(task_id) => self.gateway.intervals_for_task(task_id)?,
            Scope::Project(project_id) => self.gateway.intervals_for_project(project_id)?,
        };
        Ok(summarize_intervals(&intervals))
    }
}
