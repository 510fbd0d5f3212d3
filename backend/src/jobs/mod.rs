// Background Jobs
//
// The resume scan and cron-trigger refresh run on tokio-cron-scheduler; the
// order poller runs its own interval loop.

pub mod order_poller;
pub mod scheduler;

pub use order_poller::{OrderPoller, PgPollerState, PollerStateStore};
pub use scheduler::{JobResult, JobScheduler};
