//! Remote workers: handles, job tracking and binary discovery.

mod handle;
mod locate;
pub mod monitor;

pub use handle::{ConnectionParams, LaunchParams, RemoteWorkerHandle, WorkerAddress};
pub use locate::find_worker_binary;
pub use monitor::{JobMonitor, JobState, JobStatusProbe, scan_job_id};
