use billable_time::api::{Caller, Tracker};
use billable_time::cache::NoCache;
use billable_time::clock::ManualClock;
use billable_time::db::SqliteGateway;
use billable_time::error::{NothingToBillReason, TrackerError};
use billable_time::gateway::Gateway;
use billable_time::models::{ClientInfo, HoursSource, InvoiceStatus, TaskStatus};
use chrono::{Duration, TimeZone, Utc};
use serial_test::serial;
use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn client() -> ClientInfo {
    ClientInfo {
        name: "Acme".to_string(),
        email: Some("ap@acme.test".to_string()),
        address: None,
    }
}

#[test]
fn test_invoice_bills_each_task_once() {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(SqliteGateway::open(dir.path().join("billing.db")).unwrap());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
    ));
    let tracker = Tracker::new(gateway.clone(), Arc::new(NoCache), clock.clone());
    let caller = Caller::new("alice");

    let project = tracker.create_project(&caller, "Website", None).unwrap();
    let a = tracker
        .create_task(&caller, &project.id, "Design", Some(2.0))
        .unwrap();
    let b = tracker
        .create_task(&caller, &project.id, "Build", None)
        .unwrap();
    let c = tracker
        .create_task(&caller, &project.id, "Launch", Some(1.0))
        .unwrap();

    tracker.start(&caller, &b.id).unwrap();
    clock.advance(Duration::seconds(3600));
    tracker.stop(&caller, &b.id).unwrap();

    tracker.set_task_status(&caller, &a.id, TaskStatus::Done).unwrap();
    tracker.set_task_status(&caller, &b.id, TaskStatus::Done).unwrap();
    tracker
        .set_task_status(&caller, &c.id, TaskStatus::InProgress)
        .unwrap();

    let invoice = tracker
        .generate_invoice(&caller, &project.id, Some(50.0), client())
        .unwrap();
    assert_eq!(invoice.total_amount, 150.0);
    assert_eq!(invoice.total_hours, 3.0);
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert_eq!(invoice.due_at - invoice.generated_at, Duration::days(30));
    assert_eq!(invoice.task_details.len(), 2);

    let line_a = invoice
        .task_details
        .iter()
        .find(|l| l.task_id == a.id)
        .unwrap();
    assert_eq!(line_a.hours_source, HoursSource::Estimate);
    assert_eq!(line_a.earnings, 100.0);
    let line_b = invoice
        .task_details
        .iter()
        .find(|l| l.task_id == b.id)
        .unwrap();
    assert_eq!(line_b.hours_source, HoursSource::Tracked);
    assert_eq!(line_b.hours_worked, 1.0);

    for id in [&a.id, &b.id] {
        let task = gateway.find_task(id).unwrap().unwrap();
        assert_eq!(task.billed_in_invoice_id.as_deref(), Some(invoice.id.as_str()));
    }
    assert!(gateway.find_task(&c.id).unwrap().unwrap().billed_in_invoice_id.is_none());

    // Nothing new is done, so a second run bills nothing and changes nothing.
    let err = tracker
        .generate_invoice(&caller, &project.id, Some(50.0), client())
        .unwrap_err();
    assert!(matches!(
        err,
        TrackerError::NothingToBill(NothingToBillReason::AllCompletedTasksBilled)
    ));
    assert_eq!(tracker.invoices(&caller, &project.id).unwrap().len(), 1);
    for id in [&a.id, &b.id] {
        let task = gateway.find_task(id).unwrap().unwrap();
        assert_eq!(task.billed_in_invoice_id.as_deref(), Some(invoice.id.as_str()));
    }

    // Finishing the last task produces a second invoice for it alone.
    tracker.set_task_status(&caller, &c.id, TaskStatus::Done).unwrap();
    let second = tracker
        .generate_invoice(&caller, &project.id, Some(50.0), client())
        .unwrap();
    assert_eq!(second.task_ids(), vec![c.id.clone()]);
    assert_eq!(second.total_amount, 50.0);

    let stored = tracker.invoice(&caller, &invoice.id).unwrap();
    assert_eq!(stored, invoice);
}

#[test]
fn test_invoice_lifecycle_persists() {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(SqliteGateway::open(dir.path().join("billing.db")).unwrap());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
    ));
    let tracker = Tracker::new(gateway, Arc::new(NoCache), clock.clone())
        .with_payment_terms_days(7);
    let caller = Caller::new("alice");

    let project = tracker.create_project(&caller, "Website", Some(60.0)).unwrap();
    let task = tracker
        .create_task(&caller, &project.id, "Audit", Some(0.5))
        .unwrap();
    tracker
        .set_task_status(&caller, &task.id, TaskStatus::Done)
        .unwrap();
    let invoice = tracker
        .generate_invoice(&caller, &project.id, None, client())
        .unwrap();
    assert_eq!(invoice.total_amount, 30.0);

    assert!(tracker.sweep_overdue(&caller, &project.id).unwrap().is_empty());
    clock.advance(Duration::days(8));
    assert_eq!(
        tracker.sweep_overdue(&caller, &project.id).unwrap(),
        vec![invoice.id.clone()]
    );

    let paid = tracker
        .set_invoice_status(&caller, &invoice.id, InvoiceStatus::Paid)
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert!(matches!(
        tracker.set_invoice_status(&caller, &invoice.id, InvoiceStatus::Pending),
        Err(TrackerError::InvalidTransition { .. })
    ));
    assert_eq!(
        tracker.invoice(&caller, &invoice.id).unwrap().status,
        InvoiceStatus::Paid
    );
}

#[test]
fn test_other_users_cannot_see_invoices() {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(SqliteGateway::open(dir.path().join("billing.db")).unwrap());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
    ));
    let tracker = Tracker::new(gateway, Arc::new(NoCache), clock);
    let alice = Caller::new("alice");
    let bob = Caller::new("bob");

    let project = tracker.create_project(&alice, "Website", Some(60.0)).unwrap();
    let task = tracker
        .create_task(&alice, &project.id, "Audit", Some(1.0))
        .unwrap();
    tracker
        .set_task_status(&alice, &task.id, TaskStatus::Done)
        .unwrap();
    let invoice = tracker
        .generate_invoice(&alice, &project.id, None, client())
        .unwrap();

    assert!(matches!(
        tracker.invoice(&bob, &invoice.id),
        Err(TrackerError::NotFound { kind: "invoice", .. })
    ));
    assert!(matches!(
        tracker.invoices(&bob, &project.id),
        Err(TrackerError::NotFound { kind: "project", .. })
    ));
}

/// Overlapping invoice runs on one database bill every task exactly once.
#[test]
#[serial]
fn test_concurrent_invoice_runs_bill_each_task_once() {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(SqliteGateway::open(dir.path().join("race.db")).unwrap());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
    ));
    let tracker = Arc::new(Tracker::new(gateway.clone(), Arc::new(NoCache), clock));
    let caller = Caller::new("alice");

    let project = tracker.create_project(&caller, "Website", Some(40.0)).unwrap();
    let mut task_ids = Vec::new();
    for i in 0..5 {
        let task = tracker
            .create_task(&caller, &project.id, &format!("Task {i}"), Some(1.0))
            .unwrap();
        tracker
            .set_task_status(&caller, &task.id, TaskStatus::Done)
            .unwrap();
        task_ids.push(task.id);
    }

    let runs = 6;
    let barrier = Arc::new(Barrier::new(runs));
    let handles: Vec<_> = (0..runs)
        .map(|i| {
            let tracker = tracker.clone();
            let caller = caller.clone();
            let project_id = project.id.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut attempts = 0;
                loop {
                    match tracker.generate_invoice(&caller, &project_id, None, client()) {
                        Err(TrackerError::Persistence(msg))
                            if (msg.contains("locked") || msg.contains("busy")) && attempts < 5 =>
                        {
                            attempts += 1;
                            thread::sleep(std::time::Duration::from_millis(20 * attempts));
                        }
                        Ok(invoice) => break Some(invoice),
                        Err(TrackerError::AlreadyBilled { .. })
                        | Err(TrackerError::NothingToBill(_)) => break None,
                        Err(e) => panic!("run {i} failed: {e:?}"),
                    }
                }
            })
        })
        .collect();

    let issued: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().expect("Thread panicked"))
        .collect();
    assert!(!issued.is_empty());

    let live: Vec<_> = tracker
        .invoices(&caller, &project.id)
        .unwrap()
        .into_iter()
        .filter(|i| i.status != InvoiceStatus::Cancelled)
        .collect();
    assert_eq!(live.len(), issued.len());

    let mut billed_in: HashMap<String, String> = HashMap::new();
    for invoice in &live {
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        for line in &invoice.task_details {
            assert!(
                billed_in
                    .insert(line.task_id.clone(), invoice.id.clone())
                    .is_none(),
                "task {} appears in more than one live invoice",
                line.task_id
            );
            let task = gateway.find_task(&line.task_id).unwrap().unwrap();
            assert_eq!(task.billed_in_invoice_id.as_deref(), Some(invoice.id.as_str()));
        }
    }
    for id in &task_ids {
        assert!(billed_in.contains_key(id), "task {id} was never billed");
    }
}
