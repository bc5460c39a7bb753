//! Persistence Gateway: the typed read/write surface the tracker runs on.
//!
//! Every mutation the engine performs goes through this trait. Implementations
//! must enforce the row-level guards themselves (conditional updates on
//! `is_running` and on an empty billed stamp) rather than trusting the caller's
//! earlier reads.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, TrackerError};
use crate::models::{
    ClosedInterval, Invoice, InvoiceStatus, Project, Task, TaskStatus, TimeInterval,
};

/// Rows touched by a successful close-then-open.
#[derive(Debug, Clone)]
pub struct OpenedInterval {
    pub interval: TimeInterval,
    /// Intervals that were still running and got force-closed.
    pub closed: Vec<TimeInterval>,
}

pub trait Gateway: Send + Sync {
    fn insert_project(&self, project: &Project) -> Result<()>;
    fn find_project(&self, project_id: &str) -> Result<Option<Project>>;

    fn insert_task(&self, task: &Task) -> Result<()>;
    fn find_task(&self, task_id: &str) -> Result<Option<Task>>;
    /// Returns false when the task does not exist.
    fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<bool>;
    fn tasks_for_project(&self, project_id: &str) -> Result<Vec<Task>>;

    /// Intervals for one task, oldest start first.
    fn intervals_for_task(&self, task_id: &str) -> Result<Vec<TimeInterval>>;
    /// Intervals for every task in the project, oldest start first.
    fn intervals_for_project(&self, project_id: &str) -> Result<Vec<TimeInterval>>;
    /// Most recently started interval still marked running.
    fn latest_running_interval(&self, task_id: &str) -> Result<Option<TimeInterval>>;
    /// Close every running interval for the task at `now`, then insert a new
    /// running one. Either both steps commit or neither does.
    fn open_interval(
        &self,
        task_id: &str,
        interval_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenedInterval>;
    /// Close an interval only if it is still running. Returns whether a row
    /// was updated.
    fn close_interval(&self, interval_id: &str, closed: ClosedInterval) -> Result<bool>;

    fn insert_invoice(&self, invoice: &Invoice) -> Result<()>;
    fn find_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>>;
    fn invoices_for_project(&self, project_id: &str) -> Result<Vec<Invoice>>;
    /// Stamp every task with the invoice id, all or nothing. Fails with
    /// `AlreadyBilled` if any task already carries a stamp.
    fn stamp_tasks_billed(&self, invoice_id: &str, task_ids: &[String]) -> Result<()>;
    /// Move an invoice from `from` to `to` only if it is still in `from`.
    fn update_invoice_status(
        &self,
        invoice_id: &str,
        from: InvoiceStatus,
        to: InvoiceStatus,
    ) -> Result<bool>;

    /// Persist an invoice and stamp every line-item task with its id.
    ///
    /// Fails with `AlreadyBilled` when another invoice claimed one of the
    /// tasks first; no payable invoice is left behind in that case. The
    /// default runs the insert and the stamps as two steps and cancels the
    /// fresh invoice on such a conflict. Any other stamp failure leaves the
    /// invoice in place and is reported as `Reconciliation`. Backends with
    /// transactions should do both steps atomically instead.
    fn create_invoice_billed(&self, invoice: &Invoice) -> Result<()> {
        self.insert_invoice(invoice)?;
        let task_ids = invoice.task_ids();
        match self.stamp_tasks_billed(&invoice.id, &task_ids) {
            Ok(()) => Ok(()),
            Err(conflict @ TrackerError::AlreadyBilled { .. }) => {
                match self.update_invoice_status(
                    &invoice.id,
                    invoice.status,
                    InvoiceStatus::Cancelled,
                ) {
                    Ok(_) => Err(conflict),
                    Err(e) => Err(TrackerError::Reconciliation {
                        invoice_id: invoice.id.clone(),
                        task_ids,
                        reason: format!("{conflict}; cancelling the invoice failed: {e}"),
                    }),
                }
            }
            Err(e) => Err(TrackerError::Reconciliation {
                invoice_id: invoice.id.clone(),
                task_ids,
                reason: e.to_string(),
            }),
        }
    }
}

/// Gateway operations that can be made to fail in [`MemoryGateway`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Read,
    OpenInterval,
    CloseInterval,
    InsertInvoice,
    StampTasks,
}

#[derive(Default)]
struct MemoryState {
    projects: HashMap<String, Project>,
    tasks: Vec<Task>,
    intervals: Vec<TimeInterval>,
    invoices: Vec<Invoice>,
    failures: HashMap<FailPoint, u32>,
}

impl MemoryState {
    fn trip(&mut self, point: FailPoint) -> Result<()> {
        if let Some(remaining) = self.failures.get_mut(&point)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(TrackerError::Persistence(format!(
                "injected failure at {point:?}"
            )));
        }
        Ok(())
    }

    fn sorted(mut intervals: Vec<TimeInterval>) -> Vec<TimeInterval> {
        intervals.sort_by_key(|i| i.started_at);
        intervals
    }
}

/// In-memory gateway used as a test double. All state sits behind one lock,
/// which gives every operation the same atomicity the SQLite transactions do.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls hitting `point` fail with a persistence error.
    pub fn fail_times(&self, point: FailPoint, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(point, times);
        }
    }

    /// Every interval row, in insertion order.
    pub fn all_intervals(&self) -> Vec<TimeInterval> {
        self.state
            .lock()
            .map(|s| s.intervals.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TrackerError::Persistence("memory store lock poisoned".into()))
    }
}

impl Gateway for MemoryGateway {
    fn insert_project(&self, project: &Project) -> Result<()> {
        let mut state = self.lock()?;
        state.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    fn find_project(&self, project_id: &str) -> Result<Option<Project>> {
        let mut state = self.lock()?;
        state.trip(FailPoint::Read)?;
        Ok(state.projects.get(project_id).cloned())
    }

    fn insert_task(&self, task: &Task) -> Result<()> {
        let mut state = self.lock()?;
        state.tasks.retain(|t| t.id != task.id);
        state.tasks.push(task.clone());
        Ok(())
    }

    fn find_task(&self, task_id: &str) -> Result<Option<Task>> {
        let mut state = self.lock()?;
        state.trip(FailPoint::Read)?;
        Ok(state.tasks.iter().find(|t| t.id == task_id).cloned())
    }

    fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<bool> {
        let mut state = self.lock()?;
        match state.tasks.iter_mut().find(|t| t.id == task_id) {
            Some(task) => {
                task.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn tasks_for_project(&self, project_id: &str) -> Result<Vec<Task>> {
        let mut state = self.lock()?;
        state.trip(FailPoint::Read)?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    fn intervals_for_task(&self, task_id: &str) -> Result<Vec<TimeInterval>> {
        let mut state = self.lock()?;
        state.trip(FailPoint::Read)?;
        Ok(MemoryState::sorted(
            state
                .intervals
                .iter()
                .filter(|i| i.task_id == task_id)
                .cloned()
                .collect(),
        ))
    }

    fn intervals_for_project(&self, project_id: &str) -> Result<Vec<TimeInterval>> {
        let mut state = self.lock()?;
        state.trip(FailPoint::Read)?;
        let intervals = state
            .intervals
            .iter()
            .filter(|i| {
                state
                    .tasks
                    .iter()
                    .any(|t| t.id == i.task_id && t.project_id == project_id)
            })
            .cloned()
            .collect();
        Ok(MemoryState::sorted(intervals))
    }

    fn latest_running_interval(&self, task_id: &str) -> Result<Option<TimeInterval>> {
        let mut state = self.lock()?;
        state.trip(FailPoint::Read)?;
        Ok(state
            .intervals
            .iter()
            .filter(|i| i.task_id == task_id && i.is_running)
            .max_by_key(|i| i.started_at)
            .cloned())
    }

    fn open_interval(
        &self,
        task_id: &str,
        interval_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OpenedInterval> {
        let mut state = self.lock()?;
        state.trip(FailPoint::OpenInterval)?;

        let mut closed = Vec::new();
        for interval in state
            .intervals
            .iter_mut()
            .filter(|i| i.task_id == task_id && i.is_running)
        {
            let values = interval.close_at(now);
            interval.apply_close(values);
            closed.push(interval.clone());
        }

        let interval = TimeInterval::start(interval_id.to_string(), task_id.to_string(), now);
        state.intervals.push(interval.clone());
        Ok(OpenedInterval { interval, closed })
    }

    fn close_interval(&self, interval_id: &str, closed: ClosedInterval) -> Result<bool> {
        let mut state = self.lock()?;
        state.trip(FailPoint::CloseInterval)?;
        match state
            .intervals
            .iter_mut()
            .find(|i| i.id == interval_id && i.is_running)
        {
            Some(interval) => {
                interval.apply_close(closed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn insert_invoice(&self, invoice: &Invoice) -> Result<()> {
        let mut state = self.lock()?;
        state.trip(FailPoint::InsertInvoice)?;
        state.invoices.push(invoice.clone());
        Ok(())
    }

    fn find_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>> {
        let mut state = self.lock()?;
        state.trip(FailPoint::Read)?;
        Ok(state.invoices.iter().find(|i| i.id == invoice_id).cloned())
    }

    fn invoices_for_project(&self, project_id: &str) -> Result<Vec<Invoice>> {
        let mut state = self.lock()?;
        state.trip(FailPoint::Read)?;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .iter()
            .filter(|i| i.project_id == project_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.generated_at);
        Ok(invoices)
    }

    fn stamp_tasks_billed(&self, invoice_id: &str, task_ids: &[String]) -> Result<()> {
        let mut state = self.lock()?;
        state.trip(FailPoint::StampTasks)?;

        // check every row before writing any, so a conflict leaves nothing stamped
        for task_id in task_ids {
            let task = state
                .tasks
                .iter()
                .find(|t| &t.id == task_id)
                .ok_or_else(|| TrackerError::not_found("task", task_id.clone()))?;
            if let Some(existing) = &task.billed_in_invoice_id {
                return Err(TrackerError::AlreadyBilled {
                    task_id: task_id.clone(),
                    invoice_id: existing.clone(),
                });
            }
        }
        for task in state.tasks.iter_mut().filter(|t| task_ids.contains(&t.id)) {
            task.billed_in_invoice_id = Some(invoice_id.to_string());
        }
        Ok(())
    }

    fn update_invoice_status(
        &self,
        invoice_id: &str,
        from: InvoiceStatus,
        to: InvoiceStatus,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        match state
            .invoices
            .iter_mut()
            .find(|i| i.id == invoice_id && i.status == from)
        {
            Some(invoice) => {
                invoice.status = to;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
