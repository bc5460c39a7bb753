//! Billing aggregator: turns completed, unbilled tasks into an invoice and
//! stamps each task with that invoice exactly once.

use chrono::Duration;
use log::{error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::AggregationEngine;
use crate::clock::Clock;
use crate::error::{NothingToBillReason, Result, TrackerError};
use crate::gateway::Gateway;
use crate::models::{
    ClientInfo, HoursSource, Invoice, InvoiceStatus, LineItem, Scope, Task, TaskStatus,
};

pub const DEFAULT_PAYMENT_TERMS_DAYS: i64 = 30;

/// Round to cents / hundredths of an hour.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reject rates that cannot produce a meaningful invoice.
pub fn validate_rate(rate: f64) -> Result<f64> {
    if rate.is_finite() && rate >= 0.0 {
        Ok(rate)
    } else {
        Err(TrackerError::InvalidInput(format!(
            "hourly rate must be a non-negative number, got {rate}"
        )))
    }
}

/// Split done tasks into (unbilled, already billed).
fn partition_billable(tasks: Vec<Task>) -> Result<Vec<Task>> {
    let (unbilled, billed): (Vec<Task>, Vec<Task>) = tasks
        .into_iter()
        .filter(|t| t.status == TaskStatus::Done)
        .partition(|t| !t.is_billed());

    if unbilled.is_empty() {
        let reason = if billed.is_empty() {
            NothingToBillReason::NoCompletedTasks
        } else {
            NothingToBillReason::AllCompletedTasksBilled
        };
        return Err(TrackerError::NothingToBill(reason));
    }
    Ok(unbilled)
}

/// Outcome of repairing an invoice whose stamps did not all land.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub invoice_id: String,
    /// Tasks that already pointed at this invoice.
    pub consistent: Vec<String>,
    /// Tasks stamped by this repair.
    pub restamped: Vec<String>,
    /// (task id, invoice id it is billed in, if any) for tasks that cannot
    /// belong to this invoice.
    pub conflicts: Vec<(String, Option<String>)>,
    pub cancelled: bool,
}

pub struct BillingAggregator<'a> {
    gateway: &'a dyn Gateway,
    clock: &'a dyn Clock,
    payment_terms: Duration,
}

impl<'a> BillingAggregator<'a> {
    pub fn new(gateway: &'a dyn Gateway, clock: &'a dyn Clock) -> Self {
        Self {
            gateway,
            clock,
            payment_terms: Duration::days(DEFAULT_PAYMENT_TERMS_DAYS),
        }
    }

    pub fn with_payment_terms_days(mut self, days: i64) -> Self {
        self.payment_terms = Duration::days(days.max(0));
        self
    }

    fn line_item(&self, task: &Task, rate: f64) -> Result<LineItem> {
        let tracked = AggregationEngine::new(self.gateway)
            .summarize(&Scope::Task(task.id.clone()))?
            .total_seconds;

        let (hours_worked, hours_source) = if tracked > 0 {
            (round2(tracked as f64 / 3600.0), HoursSource::Tracked)
        } else {
            (
                round2(task.estimate_hours.unwrap_or(0.0).max(0.0)),
                HoursSource::Estimate,
            )
        };

        Ok(LineItem {
            task_id: task.id.clone(),
            title: task.title.clone(),
            hours_worked,
            hourly_rate: rate,
            earnings: round2(hours_worked * rate),
            hours_source,
        })
    }

    /// Invoice every done, unbilled task in the project.
    ///
    /// Running the same call again only picks up tasks completed since, so a
    /// second call with no new work fails with `NothingToBill`. A run that
    /// loses the race for a task to an overlapping run fails with
    /// `AlreadyBilled` and leaves no pending invoice behind.
    pub fn generate_invoice(
        &self,
        project_id: &str,
        rate: f64,
        client: ClientInfo,
    ) -> Result<Invoice> {
        let rate = validate_rate(rate)?;
        self.gateway
            .find_project(project_id)?
            .ok_or_else(|| TrackerError::not_found("project", project_id))?;

        let unbilled = partition_billable(self.gateway.tasks_for_project(project_id)?)?;

        let task_details = unbilled
            .iter()
            .map(|task| self.line_item(task, rate))
            .collect::<Result<Vec<_>>>()?;
        let total_hours = round2(task_details.iter().map(|l| l.hours_worked).sum());
        let total_amount = round2(task_details.iter().map(|l| l.earnings).sum());

        let generated_at = self.clock.now();
        let invoice = Invoice {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            client,
            total_amount,
            total_hours,
            status: InvoiceStatus::Pending,
            task_details,
            generated_at,
            due_at: generated_at + self.payment_terms,
        };

        if let Err(e) = self.gateway.create_invoice_billed(&invoice) {
            match &e {
                TrackerError::Reconciliation { task_ids, .. } => error!(
                    "invoice {} persisted but billing stamps failed for tasks [{}]: {e}",
                    invoice.id,
                    task_ids.join(", ")
                ),
                TrackerError::AlreadyBilled { .. } => {
                    warn!("invoice {} not issued, a concurrent run billed first: {e}", invoice.id)
                }
                _ => {}
            }
            return Err(e);
        }

        info!(
            "invoice {} generated for project {}: {} task(s), {:.2}h, {:.2}",
            invoice.id,
            project_id,
            invoice.task_details.len(),
            invoice.total_hours,
            invoice.total_amount
        );
        Ok(invoice)
    }

    pub fn find_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        self.gateway
            .find_invoice(invoice_id)?
            .ok_or_else(|| TrackerError::not_found("invoice", invoice_id))
    }

    pub fn list_invoices(&self, project_id: &str) -> Result<Vec<Invoice>> {
        self.gateway.invoices_for_project(project_id)
    }

    /// Move an invoice to `to`, guarded by the current status.
    pub fn set_status(&self, invoice_id: &str, to: InvoiceStatus) -> Result<Invoice> {
        let mut invoice = self.find_invoice(invoice_id)?;
        let from = invoice.status;
        if !from.can_transition_to(to) {
            return Err(TrackerError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if !self.gateway.update_invoice_status(invoice_id, from, to)? {
            // someone else moved it between our read and the update
            let current = self.find_invoice(invoice_id)?.status;
            return Err(TrackerError::InvalidTransition {
                from: current.to_string(),
                to: to.to_string(),
            });
        }
        info!("invoice {invoice_id}: {from} -> {to}");
        invoice.status = to;
        Ok(invoice)
    }

    /// Mark pending invoices past their due date as overdue. Returns the ids
    /// that changed.
    pub fn sweep_overdue(&self, project_id: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut changed = Vec::new();
        for invoice in self.gateway.invoices_for_project(project_id)? {
            if invoice.status == InvoiceStatus::Pending
                && invoice.due_at < now
                && self.gateway.update_invoice_status(
                    &invoice.id,
                    InvoiceStatus::Pending,
                    InvoiceStatus::Overdue,
                )?
            {
                changed.push(invoice.id);
            }
        }
        if !changed.is_empty() {
            info!(
                "project {project_id}: {} invoice(s) marked overdue",
                changed.len()
            );
        }
        Ok(changed)
    }

    /// Repair an invoice left behind by a reconciliation error.
    ///
    /// Tasks still unbilled are stamped with the invoice. If any line-item task
    /// is missing or billed elsewhere, nothing is stamped and the invoice is
    /// cancelled instead.
    pub fn reconcile(&self, invoice_id: &str) -> Result<ReconcileReport> {
        let invoice = self.find_invoice(invoice_id)?;
        let mut report = ReconcileReport {
            invoice_id: invoice.id.clone(),
            ..ReconcileReport::default()
        };
        let mut unstamped = Vec::new();

        for line in &invoice.task_details {
            match self.gateway.find_task(&line.task_id)? {
                Some(task) => match task.billed_in_invoice_id {
                    Some(ref stamp) if stamp == &invoice.id => {
                        report.consistent.push(task.id.clone())
                    }
                    Some(other) => report.conflicts.push((task.id.clone(), Some(other))),
                    None => unstamped.push(task.id.clone()),
                },
                None => report.conflicts.push((line.task_id.clone(), None)),
            }
        }

        if report.conflicts.is_empty() {
            if !unstamped.is_empty() {
                self.gateway.stamp_tasks_billed(&invoice.id, &unstamped)?;
                info!(
                    "invoice {}: re-stamped {} task(s)",
                    invoice.id,
                    unstamped.len()
                );
            }
            report.restamped = unstamped;
            return Ok(report);
        }

        warn!(
            "invoice {}: {} line item(s) conflict with other invoices",
            invoice.id,
            report.conflicts.len()
        );
        if invoice.status.can_transition_to(InvoiceStatus::Cancelled) {
            report.cancelled = self.gateway.update_invoice_status(
                &invoice.id,
                invoice.status,
                InvoiceStatus::Cancelled,
            )?;
        }
        Ok(report)
    }
}
