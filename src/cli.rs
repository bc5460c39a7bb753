use std::path::PathBuf;

use crate::api::DEFAULT_RETRIES;
use crate::billing::DEFAULT_PAYMENT_TERMS_DAYS;
use crate::cache::CACHE_TTL_SECONDS;
use crate::models::{InvoiceStatus, TaskStatus};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatusArg {
    Todo,
    InProgress,
    Done,
}

impl From<TaskStatusArg> for TaskStatus {
    fn from(arg: TaskStatusArg) -> Self {
        match arg {
            TaskStatusArg::Todo => TaskStatus::Todo,
            TaskStatusArg::InProgress => TaskStatus::InProgress,
            TaskStatusArg::Done => TaskStatus::Done,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatusArg {
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl From<InvoiceStatusArg> for InvoiceStatus {
    fn from(arg: InvoiceStatusArg) -> Self {
        match arg {
            InvoiceStatusArg::Pending => InvoiceStatus::Pending,
            InvoiceStatusArg::Paid => InvoiceStatus::Paid,
            InvoiceStatusArg::Overdue => InvoiceStatus::Overdue,
            InvoiceStatusArg::Cancelled => InvoiceStatus::Cancelled,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
pub enum ProjectCommand {
    /// Create a project owned by the current user
    Add {
        name: String,
        /// Default hourly rate used when an invoice is generated without --rate
        #[arg(long)]
        rate: Option<f64>,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum TaskCommand {
    /// Create a task in a project
    Add {
        #[arg(long)]
        project: String,
        title: String,
        /// Estimated hours, billed when no time was tracked
        #[arg(long)]
        estimate: Option<f64>,
    },
    /// Set a task's status: todo|in-progress|done
    Status {
        task_id: String,
        #[arg(value_enum)]
        status: TaskStatusArg,
    },
}

#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
pub struct SummaryArgs {
    /// Summarize one task
    #[arg(long)]
    pub task: Option<String>,

    /// Summarize every task in a project
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
pub enum InvoiceCommand {
    /// Invoice every completed, unbilled task in a project
    Generate {
        project: String,
        /// Hourly rate (defaults to the project's rate)
        #[arg(long)]
        rate: Option<f64>,
        #[arg(long)]
        client_name: String,
        #[arg(long)]
        client_email: Option<String>,
        #[arg(long)]
        client_address: Option<String>,
    },
    /// Show one invoice with its line items
    Show { invoice_id: String },
    /// List a project's invoices
    List { project: String },
    /// Move an invoice to a new status
    Status {
        invoice_id: String,
        #[arg(value_enum)]
        status: InvoiceStatusArg,
    },
    /// Re-stamp tasks of an invoice whose billing stamps failed
    Reconcile { invoice_id: String },
    /// Mark a project's pending invoices past due as overdue
    Sweep { project: String },
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Project management
    Project {
        #[command(subcommand)]
        action: ProjectCommand,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Start the timer for a task, closing any interval left running
    Start { task_id: String },
    /// Stop the running timer for a task (no-op when idle)
    Stop { task_id: String },
    /// Show whether a task's timer is running
    State { task_id: String },
    /// Billable time for a task or project
    Summary(SummaryArgs),
    /// List a task's recorded intervals
    Intervals { task_id: String },
    /// Invoicing
    Invoice {
        #[command(subcommand)]
        action: InvoiceCommand,
    },
}

#[derive(clap::Parser, Debug)]
#[command(name = "billable", version, about = "Time tracking and invoicing for billable work")]
pub struct Args {
    /// SQLite database file. Defaults to the platform data directory
    #[arg(long, env = "BILLABLE_DB_PATH", global = true)]
    pub db_path: Option<PathBuf>,

    /// Acting user; projects owned by someone else are invisible
    #[arg(long, env = "BILLABLE_USER", global = true)]
    pub user: Option<String>,

    /// Seconds an aggregate stays cached
    #[arg(
        long,
        env = "BILLABLE_CACHE_TTL",
        default_value_t = CACHE_TTL_SECONDS,
        value_parser = clap::value_parser!(i64).range(0..),
        global = true
    )]
    pub cache_ttl: i64,

    /// Extra attempts for retry-safe operations on transient datastore errors
    #[arg(long, env = "BILLABLE_RETRIES", default_value_t = DEFAULT_RETRIES, global = true)]
    pub retries: u32,

    /// Days until a generated invoice is due
    #[arg(
        long = "payment-terms",
        env = "BILLABLE_PAYMENT_TERMS_DAYS",
        default_value_t = DEFAULT_PAYMENT_TERMS_DAYS,
        global = true
    )]
    pub payment_terms_days: i64,

    /// Emit JSON instead of colored text
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug logging to stderr
    #[arg(
        long,
        env = "BILLABLE_DEBUG",
        global = true,
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn parse() -> Self {
        <Args as clap::Parser>::parse()
    }
}
