pub mod aggregate;
pub mod interval;
pub mod invoice;
pub mod task;

pub use aggregate::{AggregateResult, Scope};
pub use interval::{ClosedInterval, TimeInterval, billable_seconds};
pub use invoice::{ClientInfo, HoursSource, Invoice, InvoiceStatus, LineItem};
pub use task::{Project, Task, TaskStatus};
