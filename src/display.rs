use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::env;

#[cfg(feature = "colors")]
use owo_colors::OwoColorize;

// Provide a no-op color shim when "colors" feature is disabled
#[cfg(not(feature = "colors"))]
pub mod color_shim {
    use std::fmt::{self, Display, Formatter};

    #[derive(Clone)]
    pub struct Plain(pub String);

    impl Display for Plain {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    pub trait ColorizeShim {
        fn as_str(&self) -> &str;

        fn bright_black(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
        fn bright_white(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
        fn bright_green(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
        fn red(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
        fn yellow(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
        fn green(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
        fn cyan(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
        fn bold(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
        fn dimmed(&self) -> Plain {
            Plain(self.as_str().to_string())
        }
    }

    impl ColorizeShim for &str {
        fn as_str(&self) -> &str {
            self
        }
    }
    impl ColorizeShim for String {
        fn as_str(&self) -> &str {
            self.as_str()
        }
    }
    impl ColorizeShim for Plain {
        fn as_str(&self) -> &str {
            &self.0
        }
    }
}

#[cfg(not(feature = "colors"))]
use color_shim::ColorizeShim as OwoColorize;

use crate::billing::ReconcileReport;
use crate::error::TrackerError;
use crate::models::{
    AggregateResult, Invoice, InvoiceStatus, Project, Scope, Task, TaskStatus, TimeInterval,
};
use crate::timer::{Started, StopOutcome, TimerState};
use crate::utils::{format_currency, format_duration, format_hours, format_local_time};

fn colors_enabled() -> bool {
    env::var("NO_COLOR").is_err()
}

// Each painter falls back to the plain string under NO_COLOR.
fn dim(s: &str) -> String {
    if colors_enabled() {
        s.dimmed().to_string()
    } else {
        s.to_string()
    }
}

fn strong(s: &str) -> String {
    if colors_enabled() {
        s.bright_white().bold().to_string()
    } else {
        s.to_string()
    }
}

fn money(s: &str) -> String {
    if colors_enabled() {
        s.bright_green().bold().to_string()
    } else {
        s.to_string()
    }
}

fn accent(s: &str) -> String {
    if colors_enabled() {
        s.cyan().to_string()
    } else {
        s.to_string()
    }
}

fn invoice_status_colored(status: InvoiceStatus) -> String {
    let label = status.as_str();
    if !colors_enabled() {
        return label.to_string();
    }
    match status {
        InvoiceStatus::Paid => label.green().to_string(),
        InvoiceStatus::Pending => label.yellow().to_string(),
        InvoiceStatus::Overdue => label.red().bold().to_string(),
        InvoiceStatus::Cancelled => label.bright_black().to_string(),
    }
}

fn task_status_colored(status: TaskStatus) -> String {
    let label = status.as_str();
    if !colors_enabled() {
        return label.to_string();
    }
    match status {
        TaskStatus::Done => label.green().to_string(),
        TaskStatus::InProgress => label.yellow().to_string(),
        TaskStatus::Todo => label.bright_black().to_string(),
    }
}

pub fn render_project(project: &Project) -> String {
    let rate = project
        .hourly_rate
        .map(|r| format!("{}/h", format_currency(r)))
        .unwrap_or_else(|| "no default rate".to_string());
    format!(
        "{} {} {}",
        strong(&project.name),
        accent(&project.id),
        dim(&format!("({rate})"))
    )
}

pub fn render_task(task: &Task) -> String {
    let mut line = format!(
        "{} {} [{}]",
        strong(&task.title),
        accent(&task.id),
        task_status_colored(task.status)
    );
    if let Some(est) = task.estimate_hours {
        line.push_str(&dim(&format!(" est {}", format_hours(est))));
    }
    if let Some(inv) = &task.billed_in_invoice_id {
        line.push_str(&dim(&format!(" billed in {inv}")));
    }
    line
}

pub fn render_started(started: &Started) -> String {
    let mut out = format!(
        "{} timer for {} at {}",
        if colors_enabled() {
            "▶ started".green().bold().to_string()
        } else {
            "started".to_string()
        },
        accent(&started.task_id),
        format_local_time(started.started_at)
    );
    for closed in &started.force_closed {
        out.push('\n');
        out.push_str(&dim(&format!(
            "  closed interval {} left running since {} ({})",
            closed.id,
            format_local_time(closed.started_at),
            format_duration(closed.closed_seconds())
        )));
    }
    out
}

pub fn render_stop(outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::Stopped {
            task_id,
            ended_at,
            duration_seconds,
            ..
        } => format!(
            "{} timer for {} at {}: {}",
            if colors_enabled() {
                "■ stopped".yellow().bold().to_string()
            } else {
                "stopped".to_string()
            },
            accent(task_id),
            format_local_time(*ended_at),
            strong(&format_duration(*duration_seconds))
        ),
        StopOutcome::NothingToStop { task_id } => {
            dim(&format!("no timer running for {task_id}"))
        }
    }
}

pub fn render_timer_state(task_id: &str, state: &TimerState) -> String {
    match state {
        TimerState::Idle => format!("{} {}", accent(task_id), dim("idle")),
        TimerState::Running { started_at, .. } => format!(
            "{} running since {}",
            accent(task_id),
            format_local_time(*started_at)
        ),
    }
}

pub fn render_summary(scope: &Scope, agg: &AggregateResult, now: DateTime<Utc>) -> String {
    let mut out = format!(
        "{}: {} tracked ({})",
        scope,
        strong(&format_duration(agg.total_seconds)),
        format_hours(agg.total_hours())
    );
    if agg.running {
        let live = agg.live_seconds(now);
        out.push_str(&format!(
            "\n  {} {} incl. running time",
            accent("●"),
            format_duration(live)
        ));
        if agg.running_task_ids.len() > 1 {
            out.push_str(&dim(&format!(
                " ({} timers running)",
                agg.running_task_ids.len()
            )));
        }
    }
    out
}

pub fn render_intervals(task_id: &str, intervals: &[TimeInterval]) -> String {
    if intervals.is_empty() {
        return dim(&format!("no intervals recorded for {task_id}"));
    }
    let mut lines = Vec::with_capacity(intervals.len() + 1);
    lines.push(strong(&format!("intervals for {task_id}")));
    for i in intervals {
        let end = match i.ended_at {
            Some(end) => format_local_time(end),
            None => accent("running"),
        };
        let dur = if i.is_running {
            String::new()
        } else {
            format!("  {}", format_duration(i.closed_seconds()))
        };
        lines.push(format!(
            "  {} → {}{}",
            format_local_time(i.started_at),
            end,
            dur
        ));
    }
    lines.join("\n")
}

pub fn render_invoice(invoice: &Invoice) -> String {
    let mut lines = vec![format!(
        "{} {} [{}]",
        strong("invoice"),
        accent(&invoice.id),
        invoice_status_colored(invoice.status)
    )];
    lines.push(format!(
        "  client {}{}",
        invoice.client.name,
        invoice
            .client
            .email
            .as_deref()
            .map(|e| format!(" <{e}>"))
            .unwrap_or_default()
    ));
    lines.push(dim(&format!(
        "  generated {}  due {}",
        format_local_time(invoice.generated_at),
        format_local_time(invoice.due_at)
    )));
    for item in &invoice.task_details {
        lines.push(format!(
            "  {:<32} {:>8} × {:>8} = {:>10}  {}",
            item.title,
            format_hours(item.hours_worked),
            format_currency(item.hourly_rate),
            format_currency(item.earnings),
            dim(item.hours_source.as_str())
        ));
    }
    lines.push(format!(
        "  total {} for {}",
        money(&format_currency(invoice.total_amount)),
        format_hours(invoice.total_hours)
    ));
    lines.join("\n")
}

pub fn render_invoice_list(project_id: &str, invoices: &[Invoice]) -> String {
    if invoices.is_empty() {
        return dim(&format!("no invoices for {project_id}"));
    }
    invoices
        .iter()
        .map(|inv| {
            format!(
                "{} {} {:>10} {}",
                accent(&inv.id),
                format_local_time(inv.generated_at),
                format_currency(inv.total_amount),
                invoice_status_colored(inv.status)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_reconcile(report: &ReconcileReport) -> String {
    let mut lines = vec![format!("invoice {}", accent(&report.invoice_id))];
    if !report.restamped.is_empty() {
        lines.push(format!("  restamped {}", report.restamped.join(", ")));
    }
    if !report.consistent.is_empty() {
        lines.push(dim(&format!(
            "  {} task(s) already consistent",
            report.consistent.len()
        )));
    }
    for (task_id, billed_in) in &report.conflicts {
        let other = billed_in.as_deref().unwrap_or("missing");
        lines.push(format!("  conflict {task_id}: {other}"));
    }
    if report.cancelled {
        lines.push(invoice_status_colored(InvoiceStatus::Cancelled));
    }
    lines.join("\n")
}

/// Stable machine-readable name for an error, used in JSON output.
pub fn error_kind(err: &TrackerError) -> &'static str {
    match err {
        TrackerError::NotFound { .. } => "not_found",
        TrackerError::NothingToBill(_) => "nothing_to_bill",
        TrackerError::Persistence(_) => "persistence",
        TrackerError::Reconciliation { .. } => "reconciliation",
        TrackerError::AlreadyBilled { .. } => "already_billed",
        TrackerError::InvalidTransition { .. } => "invalid_transition",
        TrackerError::InvalidInput(_) => "invalid_input",
    }
}

pub fn error_json(err: &TrackerError) -> Value {
    let mut body = json!({
        "kind": error_kind(err),
        "message": err.to_string(),
    });
    match err {
        TrackerError::Reconciliation {
            invoice_id,
            task_ids,
            ..
        } => {
            body["invoice_id"] = json!(invoice_id);
            body["task_ids"] = json!(task_ids);
        }
        TrackerError::NotFound { kind, id } => {
            body["resource"] = json!(kind);
            body["id"] = json!(id);
        }
        _ => {}
    }
    json!({ "error": body })
}

pub fn summary_json(scope: &Scope, agg: &AggregateResult, now: DateTime<Utc>) -> Value {
    json!({
        "scope": scope.kind(),
        "id": scope.id(),
        "total_seconds": agg.total_seconds,
        "total_hours": (agg.total_hours() * 100.0).round() / 100.0,
        "running": agg.running,
        "running_started_at": agg.running_started_at.map(|d| d.to_rfc3339()),
        "running_task_ids": agg.running_task_ids,
        "live_seconds": agg.live_seconds(now),
    })
}

pub fn timer_state_json(task_id: &str, state: &TimerState) -> Value {
    let mut value = serde_json::to_value(state).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("task_id".to_string(), json!(task_id));
    }
    value
}
