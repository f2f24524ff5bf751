//! Worker process lifecycle states.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a supervised worker process.
///
/// ```text
/// NEW --launch--> LAUNCHED --registered--> RUNNING
/// RUNNING --exit(0)--> COMPLETED
/// RUNNING --exit(!=0) | stop--> TERMINATED
/// LAUNCHED --timeout | spawn error | early exit--> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerProcessState {
    New,
    Launched,
    Running,
    Completed,
    Terminated,
    Failed,
}

impl WorkerProcessState {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Failed)
    }

    /// The process is no longer waiting to become ready.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::New | Self::Launched)
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: Self) -> bool {
        use WorkerProcessState::*;
        matches!(
            (self, next),
            (New, Launched)
                | (Launched, Running)
                | (Launched, Failed)
                | (Launched, Terminated)
                | (Running, Completed)
                | (Running, Terminated)
        )
    }
}

impl fmt::Display for WorkerProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Launched => "LAUNCHED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
