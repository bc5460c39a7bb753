//! Operation boundary: resolves the caller's ownership before touching any
//! timer or billing state, and retries transient datastore failures on the
//! operations where a repeat is harmless.

use log::warn;
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;
use uuid::Uuid;

use crate::aggregate::AggregationEngine;
use crate::billing::{BillingAggregator, DEFAULT_PAYMENT_TERMS_DAYS, ReconcileReport, validate_rate};
use crate::cache::{AggregateCache, read_through};
use crate::clock::Clock;
use crate::error::{Result, TrackerError};
use crate::gateway::Gateway;
use crate::models::{
    AggregateResult, ClientInfo, Invoice, InvoiceStatus, Project, Scope, Task, TaskStatus,
    TimeInterval,
};
use crate::timer::{Started, StopOutcome, TimerMachine, TimerState};

pub const DEFAULT_RETRIES: u32 = 3;

/// Identity resolved by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

pub struct Tracker {
    gateway: Arc<dyn Gateway>,
    cache: Arc<dyn AggregateCache>,
    clock: Arc<dyn Clock>,
    retries: u32,
    payment_terms_days: i64,
}

impl Tracker {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache: Arc<dyn AggregateCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            cache,
            clock,
            retries: DEFAULT_RETRIES,
            payment_terms_days: DEFAULT_PAYMENT_TERMS_DAYS,
        }
    }

    /// Extra attempts for retry-safe operations after a persistence failure.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_payment_terms_days(mut self, days: i64) -> Self {
        self.payment_terms_days = days;
        self
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    fn timer(&self) -> TimerMachine<'_> {
        TimerMachine::new(
            self.gateway.as_ref(),
            self.cache.as_ref(),
            self.clock.as_ref(),
        )
    }

    fn billing(&self) -> BillingAggregator<'_> {
        BillingAggregator::new(self.gateway.as_ref(), self.clock.as_ref())
            .with_payment_terms_days(self.payment_terms_days)
    }

    fn with_retries_on<T>(&self, op: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match f() {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!("{op}: attempt {attempt} failed, retrying: {e}");
                    thread::sleep(StdDuration::from_millis(25 * u64::from(attempt)));
                }
                other => return other,
            }
        }
    }

    /// Projects owned by someone else are reported as missing.
    fn authorize_project(&self, caller: &Caller, project_id: &str) -> Result<Project> {
        match self.gateway.find_project(project_id)? {
            Some(project) if project.owner_id == caller.user_id => Ok(project),
            _ => Err(TrackerError::not_found("project", project_id)),
        }
    }

    fn authorize_task(&self, caller: &Caller, task_id: &str) -> Result<Task> {
        let task = self
            .gateway
            .find_task(task_id)?
            .ok_or_else(|| TrackerError::not_found("task", task_id))?;
        match self.authorize_project(caller, &task.project_id) {
            Ok(_) => Ok(task),
            Err(TrackerError::NotFound { .. }) => Err(TrackerError::not_found("task", task_id)),
            Err(e) => Err(e),
        }
    }

    fn authorize_invoice(&self, caller: &Caller, invoice_id: &str) -> Result<Invoice> {
        let invoice = self.billing().find_invoice(invoice_id)?;
        match self.authorize_project(caller, &invoice.project_id) {
            Ok(_) => Ok(invoice),
            Err(TrackerError::NotFound { .. }) => {
                Err(TrackerError::not_found("invoice", invoice_id))
            }
            Err(e) => Err(e),
        }
    }

    pub fn create_project(
        &self,
        caller: &Caller,
        name: &str,
        hourly_rate: Option<f64>,
    ) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(TrackerError::InvalidInput("project name is empty".into()));
        }
        let hourly_rate = hourly_rate.map(validate_rate).transpose()?;
        let project = Project {
            id: Uuid::new_v4().to_string(),
            owner_id: caller.user_id.clone(),
            name: name.trim().to_string(),
            hourly_rate,
        };
        self.gateway.insert_project(&project)?;
        Ok(project)
    }

    pub fn create_task(
        &self,
        caller: &Caller,
        project_id: &str,
        title: &str,
        estimate_hours: Option<f64>,
    ) -> Result<Task> {
        let project = self.authorize_project(caller, project_id)?;
        if let Some(est) = estimate_hours
            && !(est.is_finite() && est >= 0.0)
        {
            return Err(TrackerError::InvalidInput(format!(
                "estimate must be a non-negative number of hours, got {est}"
            )));
        }
        let task = Task {
            id: Uuid::new_v4().to_string(),
            project_id: project.id,
            title: title.trim().to_string(),
            status: TaskStatus::Todo,
            estimate_hours,
            billed_in_invoice_id: None,
        };
        self.gateway.insert_task(&task)?;
        Ok(task)
    }

    pub fn set_task_status(&self, caller: &Caller, task_id: &str, status: TaskStatus) -> Result<Task> {
        let mut task = self.authorize_task(caller, task_id)?;
        if !self.gateway.set_task_status(&task.id, status)? {
            return Err(TrackerError::not_found("task", task_id));
        }
        task.status = status;
        Ok(task)
    }

    /// Not retried: a repeated start closes and reopens the interval.
    pub fn start(&self, caller: &Caller, task_id: &str) -> Result<Started> {
        let task = self.authorize_task(caller, task_id)?;
        self.timer().start(&task.id)
    }

    pub fn stop(&self, caller: &Caller, task_id: &str) -> Result<StopOutcome> {
        self.with_retries_on("stop", || {
            let task = self.authorize_task(caller, task_id)?;
            self.timer().stop(&task.id)
        })
    }

    pub fn timer_state(&self, caller: &Caller, task_id: &str) -> Result<TimerState> {
        self.with_retries_on("timer state", || {
            let task = self.authorize_task(caller, task_id)?;
            self.timer().state(&task.id)
        })
    }

    pub fn summary(&self, caller: &Caller, scope: &Scope) -> Result<AggregateResult> {
        self.with_retries_on("summary", || {
            match scope {
                Scope::Task(id) => {
                    self.authorize_task(caller, id)?;
                }
                Scope::Project(id) => {
                    self.authorize_project(caller, id)?;
                }
            }
            read_through(self.cache.as_ref(), scope, || {
                AggregationEngine::new(self.gateway.as_ref()).summarize(scope)
            })
        })
    }

    pub fn intervals(&self, caller: &Caller, task_id: &str) -> Result<Vec<TimeInterval>> {
        self.with_retries_on("intervals", || {
            let task = self.authorize_task(caller, task_id)?;
            self.gateway.intervals_for_task(&task.id)
        })
    }

    /// Bill the project's completed, unbilled tasks. Without an explicit rate
    /// the project's default hourly rate applies.
    pub fn generate_invoice(
        &self,
        caller: &Caller,
        project_id: &str,
        rate: Option<f64>,
        client: ClientInfo,
    ) -> Result<Invoice> {
        let project = self.authorize_project(caller, project_id)?;
        let rate = rate.or(project.hourly_rate).ok_or_else(|| {
            TrackerError::InvalidInput(format!(
                "project {} has no default hourly rate; pass one explicitly",
                project.id
            ))
        })?;
        self.billing().generate_invoice(&project.id, rate, client)
    }

    pub fn invoice(&self, caller: &Caller, invoice_id: &str) -> Result<Invoice> {
        self.with_retries_on("invoice", || self.authorize_invoice(caller, invoice_id))
    }

    pub fn invoices(&self, caller: &Caller, project_id: &str) -> Result<Vec<Invoice>> {
        self.with_retries_on("invoices", || {
            let project = self.authorize_project(caller, project_id)?;
            self.billing().list_invoices(&project.id)
        })
    }

    pub fn set_invoice_status(
        &self,
        caller: &Caller,
        invoice_id: &str,
        status: InvoiceStatus,
    ) -> Result<Invoice> {
        let invoice = self.authorize_invoice(caller, invoice_id)?;
        self.billing().set_status(&invoice.id, status)
    }

    pub fn reconcile_invoice(&self, caller: &Caller, invoice_id: &str) -> Result<ReconcileReport> {
        let invoice = self.authorize_invoice(caller, invoice_id)?;
        self.billing().reconcile(&invoice.id)
    }

    pub fn sweep_overdue(&self, caller: &Caller, project_id: &str) -> Result<Vec<String>> {
        let project = self.authorize_project(caller, project_id)?;
        self.billing().sweep_overdue(&project.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::gateway::{FailPoint, MemoryGateway};
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        gw: Arc<MemoryGateway>,
        clock: Arc<ManualClock>,
        tracker: Tracker,
        owner: Caller,
    }

    fn fixture() -> Fixture {
        let gw = Arc::new(MemoryGateway::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let cache = Arc::new(MemoryCache::new(Duration::seconds(30), clock.clone()));
        let tracker = Tracker::new(gw.clone(), cache, clock.clone()).with_retries(2);
        Fixture {
            gw,
            clock,
            tracker,
            owner: Caller::new("alice"),
        }
    }

    #[test]
    fn test_foreign_task_is_not_found() {
        let fx = fixture();
        let project = fx.tracker.create_project(&fx.owner, "Site", None).unwrap();
        let task = fx
            .tracker
            .create_task(&fx.owner, &project.id, "Build", None)
            .unwrap();
        let mallory = Caller::new("mallory");

        assert!(matches!(
            fx.tracker.start(&mallory, &task.id),
            Err(TrackerError::NotFound { kind: "task", .. })
        ));
        assert!(matches!(
            fx.tracker.summary(&mallory, &Scope::Project(project.id.clone())),
            Err(TrackerError::NotFound { kind: "project", .. })
        ));
        assert!(matches!(
            fx.tracker
                .generate_invoice(&mallory, &project.id, Some(10.0), ClientInfo::default()),
            Err(TrackerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_stop_retries_transient_failures() {
        let fx = fixture();
        let project = fx.tracker.create_project(&fx.owner, "Site", None).unwrap();
        let task = fx
            .tracker
            .create_task(&fx.owner, &project.id, "Build", None)
            .unwrap();
        fx.tracker.start(&fx.owner, &task.id).unwrap();
        fx.clock.advance(Duration::seconds(20));

        fx.gw.fail_times(FailPoint::CloseInterval, 2);
        let outcome = fx.tracker.stop(&fx.owner, &task.id).unwrap();
        assert_eq!(outcome.duration_seconds(), Some(20));
    }

    #[test]
    fn test_retries_are_bounded() {
        let fx = fixture();
        let project = fx.tracker.create_project(&fx.owner, "Site", None).unwrap();
        let task = fx
            .tracker
            .create_task(&fx.owner, &project.id, "Build", None)
            .unwrap();
        fx.tracker.start(&fx.owner, &task.id).unwrap();

        fx.gw.fail_times(FailPoint::CloseInterval, 3);
        assert!(matches!(
            fx.tracker.stop(&fx.owner, &task.id),
            Err(TrackerError::Persistence(_))
        ));
    }

    #[test]
    fn test_start_is_not_retried() {
        let fx = fixture();
        let project = fx.tracker.create_project(&fx.owner, "Site", None).unwrap();
        let task = fx
            .tracker
            .create_task(&fx.owner, &project.id, "Build", None)
            .unwrap();

        fx.gw.fail_times(FailPoint::OpenInterval, 1);
        assert!(fx.tracker.start(&fx.owner, &task.id).is_err());
        assert!(fx.gw.all_intervals().is_empty());
    }

    #[test]
    fn test_invoice_rate_falls_back_to_project_rate() {
        let fx = fixture();
        let project = fx
            .tracker
            .create_project(&fx.owner, "Site", Some(40.0))
            .unwrap();
        let task = fx
            .tracker
            .create_task(&fx.owner, &project.id, "Build", Some(1.5))
            .unwrap();
        fx.tracker
            .set_task_status(&fx.owner, &task.id, TaskStatus::Done)
            .unwrap();

        let invoice = fx
            .tracker
            .generate_invoice(&fx.owner, &project.id, None, ClientInfo::default())
            .unwrap();
        assert_eq!(invoice.total_amount, 60.0);
        assert_eq!(invoice.task_details[0].hourly_rate, 40.0);
    }

    #[test]
    fn test_missing_rate_is_invalid_input() {
        let fx = fixture();
        let project = fx.tracker.create_project(&fx.owner, "Site", None).unwrap();
        assert!(matches!(
            fx.tracker
                .generate_invoice(&fx.owner, &project.id, None, ClientInfo::default()),
            Err(TrackerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let fx = fixture();
        assert!(fx.tracker.create_project(&fx.owner, "  ", None).is_err());
        assert!(fx.tracker.create_project(&fx.owner, "X", Some(-3.0)).is_err());
        let project = fx.tracker.create_project(&fx.owner, "X", None).unwrap();
        assert!(
            fx.tracker
                .create_task(&fx.owner, &project.id, "T", Some(f64::NAN))
                .is_err()
        );
    }
}
