use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    /// Paid and cancelled invoices never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Pending, Overdue) | (Pending, Cancelled) | (Overdue, Paid) | (Overdue, Cancelled)
        )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(InvoiceStatus::Pending),
            "paid" => Ok(InvoiceStatus::Paid),
            "overdue" => Ok(InvoiceStatus::Overdue),
            "cancelled" | "canceled" => Ok(InvoiceStatus::Cancelled),
            other => Err(format!("unknown invoice status: {other}")),
        }
    }
}

/// Where a line item's hours came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoursSource {
    Tracked,
    Estimate,
}

impl HoursSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoursSource::Tracked => "tracked",
            HoursSource::Estimate => "estimate",
        }
    }
}

impl FromStr for HoursSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tracked" => Ok(HoursSource::Tracked),
            "estimate" => Ok(HoursSource::Estimate),
            other => Err(format!("unknown hours source: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub task_id: String,
    pub title: String,
    pub hours_worked: f64,
    pub hourly_rate: f64,
    pub earnings: f64,
    pub hours_source: HoursSource,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub email: Option<String>,
    pub address: Option<String>,
}

/// An invoice and its line items. The task set is fixed at creation; only
/// `status` moves afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub project_id: String,
    pub client: ClientInfo,
    pub total_amount: f64,
    pub total_hours: f64,
    pub status: InvoiceStatus,
    pub task_details: Vec<LineItem>,
    pub generated_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

impl Invoice {
    pub fn task_ids(&self) -> Vec<String> {
        self.task_details.iter().map(|l| l.task_id.clone()).collect()
    }
}
