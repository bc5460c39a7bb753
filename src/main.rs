use anyhow::{Context, Result};
use log::debug;
use std::process::ExitCode;
use std::sync::Arc;

use billable_time::api::{Caller, Tracker};
use billable_time::cache::{AggregateCache, NoCache};
use billable_time::cli::{Args, Command, InvoiceCommand, ProjectCommand, TaskCommand};
use billable_time::clock::{Clock, SystemClock};
use billable_time::db::{SqliteCache, SqliteGateway, default_db_path};
use billable_time::display::{
    error_json, render_intervals, render_invoice, render_invoice_list, render_project,
    render_reconcile, render_started, render_stop, render_summary, render_task,
    render_timer_state, summary_json, timer_state_json,
};
use billable_time::error::TrackerError;
use billable_time::models::{ClientInfo, Scope};
use billable_time::utils::{parse_bool_env, resolve_user, setup_logger};

/// What a command produced, ready for either output mode.
struct Rendered {
    text: String,
    json: serde_json::Value,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    setup_logger(args.debug)?;

    let db_path = match &args.db_path {
        Some(p) => p.clone(),
        None => default_db_path()?,
    };
    debug!("using database {}", db_path.display());
    let gateway = SqliteGateway::open(&db_path)
        .with_context(|| format!("open database {}", db_path.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache: Arc<dyn AggregateCache> = if parse_bool_env("BILLABLE_CACHE_DISABLE") {
        Arc::new(NoCache)
    } else {
        let ttl = chrono::Duration::seconds(args.cache_ttl);
        Arc::new(SqliteCache::new(&gateway, ttl, clock.clone()))
    };

    let tracker = Tracker::new(Arc::new(gateway), cache, clock)
        .with_retries(args.retries)
        .with_payment_terms_days(args.payment_terms_days);
    let caller = Caller::new(resolve_user(&args));

    match run(&tracker, &caller, &args.command) {
        Ok(out) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&out.json)?);
            } else {
                println!("{}", out.text);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&error_json(&err))?);
            } else {
                eprintln!("error: {err}");
            }
            Ok(exit_code_for(&err))
        }
    }
}

// Caller mistakes exit 1; datastore trouble exits 2.
fn exit_code_for(err: &TrackerError) -> ExitCode {
    match err {
        TrackerError::Persistence(_) | TrackerError::Reconciliation { .. } => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn run(tracker: &Tracker, caller: &Caller, command: &Command) -> Result<Rendered, TrackerError> {
    let rendered = match command {
        Command::Project {
            action: ProjectCommand::Add { name, rate },
        } => {
            let project = tracker.create_project(caller, name, *rate)?;
            Rendered {
                text: render_project(&project),
                json: serde_json::to_value(&project)?,
            }
        }
        Command::Task { action } => {
            let task = match action {
                TaskCommand::Add {
                    project,
                    title,
                    estimate,
                } => tracker.create_task(caller, project, title, *estimate)?,
                TaskCommand::Status { task_id, status } => {
                    tracker.set_task_status(caller, task_id, (*status).into())?
                }
            };
            Rendered {
                text: render_task(&task),
                json: serde_json::to_value(&task)?,
            }
        }
        Command::Start { task_id } => {
            let started = tracker.start(caller, task_id)?;
            Rendered {
                text: render_started(&started),
                json: serde_json::to_value(&started)?,
            }
        }
        Command::Stop { task_id } => {
            let outcome = tracker.stop(caller, task_id)?;
            Rendered {
                text: render_stop(&outcome),
                json: serde_json::to_value(&outcome)?,
            }
        }
        Command::State { task_id } => {
            let state = tracker.timer_state(caller, task_id)?;
            Rendered {
                text: render_timer_state(task_id, &state),
                json: timer_state_json(task_id, &state),
            }
        }
        Command::Summary(summary) => {
            let scope = match (&summary.task, &summary.project) {
                (Some(task), _) => Scope::Task(task.clone()),
                (None, Some(project)) => Scope::Project(project.clone()),
                (None, None) => {
                    return Err(TrackerError::InvalidInput(
                        "pass --task or --project".into(),
                    ));
                }
            };
            let agg = tracker.summary(caller, &scope)?;
            let now = tracker.now();
            Rendered {
                text: render_summary(&scope, &agg, now),
                json: summary_json(&scope, &agg, now),
            }
        }
        Command::Intervals { task_id } => {
            let intervals = tracker.intervals(caller, task_id)?;
            Rendered {
                text: render_intervals(task_id, &intervals),
                json: serde_json::to_value(&intervals)?,
            }
        }
        Command::Invoice { action } => run_invoice(tracker, caller, action)?,
    };
    Ok(rendered)
}

fn run_invoice(
    tracker: &Tracker,
    caller: &Caller,
    action: &InvoiceCommand,
) -> Result<Rendered, TrackerError> {
    let rendered = match action {
        InvoiceCommand::Generate {
            project,
            rate,
            client_name,
            client_email,
            client_address,
        } => {
            let client = ClientInfo {
                name: client_name.clone(),
                email: client_email.clone(),
                address: client_address.clone(),
            };
            let invoice = tracker.generate_invoice(caller, project, *rate, client)?;
            Rendered {
                text: render_invoice(&invoice),
                json: serde_json::to_value(&invoice)?,
            }
        }
        InvoiceCommand::Show { invoice_id } => {
            let invoice = tracker.invoice(caller, invoice_id)?;
            Rendered {
                text: render_invoice(&invoice),
                json: serde_json::to_value(&invoice)?,
            }
        }
        InvoiceCommand::List { project } => {
            let invoices = tracker.invoices(caller, project)?;
            Rendered {
                text: render_invoice_list(project, &invoices),
                json: serde_json::to_value(&invoices)?,
            }
        }
        InvoiceCommand::Status { invoice_id, status } => {
            let invoice = tracker.set_invoice_status(caller, invoice_id, (*status).into())?;
            Rendered {
                text: render_invoice(&invoice),
                json: serde_json::to_value(&invoice)?,
            }
        }
        InvoiceCommand::Reconcile { invoice_id } => {
            let report = tracker.reconcile_invoice(caller, invoice_id)?;
            Rendered {
                text: render_reconcile(&report),
                json: serde_json::to_value(&report)?,
            }
        }
        InvoiceCommand::Sweep { project } => {
            let marked = tracker.sweep_overdue(caller, project)?;
            let text = if marked.is_empty() {
                "no invoices became overdue".to_string()
            } else {
                format!("marked overdue: {}", marked.join(", "))
            };
            Rendered {
                text,
                json: serde_json::json!({ "overdue": marked }),
            }
        }
    };
    Ok(rendered)
}
