// Background Jobs Service
//
// Scheduled background jobs for the flowops control plane.
// Jobs are scheduled using tokio-cron-scheduler and run automatically at specified intervals.

pub mod drift_scan;
pub mod scheduler;

pub use drift_scan::DriftScanJob;
pub use scheduler::{run_drift_scan, JobConfig, JobHistory, JobResult, JobScheduler};
