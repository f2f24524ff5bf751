//! OS-level worker process management.
//!
//! This module launches worker processes, captures their launch output
//! and tracks their lifecycle state.

pub mod command;
pub mod output;
mod state;
mod supervisor;

pub use command::{LaunchCommand, shell_quote};
pub use output::{LineListener, OutputBuffer};
pub use state::WorkerProcessState;
pub use supervisor::{ProcessSupervisor, SupervisorOptions};
