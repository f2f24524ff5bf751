//! Inter-process communication between the host and worker processes.
//!
//! This module provides the framed wire protocol, pooled command
//! connections to running workers, and the registration endpoint workers
//! call back into.

mod pool;
pub mod protocol;
mod registration;

pub use pool::{ConnectionPool, PooledConnection, WorkerConnection};
pub use protocol::{
    HostEvent, HostReply, WorkerCommand, WorkerResponse, read_message, write_message,
};
pub use registration::{RegistrationServer, WorkerRegistry};
