//! Core engine for the moor remote execution host.
//!
//! This crate provides:
//! - Supervision of out-of-process workers (launch, readiness, teardown)
//! - Remote worker handles with registration and external-failure tracking
//! - A length-prefixed IPC protocol and pooled worker connections
//! - Per-group admission scheduling
//! - Client-facing execution sessions with statement polling and cancellation

pub mod config;
pub mod error;
pub mod host;
pub mod ipc;
pub mod process;
pub mod scheduler;
pub mod session;
pub mod worker;

pub use config::{HostConfig, PortRange};
pub use error::{Error, Result};
pub use host::{Host, SessionBuilder};
pub use ipc::{ConnectionPool, PooledConnection, RegistrationServer, WorkerConnection, WorkerRegistry};
pub use process::{LaunchCommand, ProcessSupervisor, SupervisorOptions, WorkerProcessState};
pub use scheduler::{AdmissionPermit, AdmissionScheduler, SchedulerRegistry};
pub use session::{
    EngineMode, ExecuteResult, ExecutionSession, FragmentType, LocalOptions, ResultFragment,
    StatementId, StatementRecord, StatementStatus,
};
pub use worker::{
    ConnectionParams, JobMonitor, JobState, JobStatusProbe, LaunchParams, RemoteWorkerHandle,
    WorkerAddress,
};
