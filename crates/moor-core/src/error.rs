//! Error types for moor-core.

use thiserror::Error;

/// Result type for moor-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in moor-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The worker process could not be spawned, or exited before registering.
    #[error("failed to launch worker process: {message}{}", render_output(output))]
    Launch { message: String, output: String },

    /// The worker process was spawned but never called back.
    #[error(
        "worker process did not register within {} seconds{}",
        timeout_ms / 1000,
        render_output(output)
    )]
    RegistrationTimeout { timeout_ms: u64, output: String },

    /// An external job monitor reported that the worker's job died.
    #[error("worker terminated externally: {0}")]
    ExternalTermination(String),

    /// The worker is not (or no longer) accepting requests.
    #[error("worker is not running: {0}")]
    WorkerNotRunning(String),

    /// An RPC to a running worker failed.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Framing or protocol violation on an IPC stream.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Statement not found in the session.
    #[error("statement not found: {0}")]
    StatementNotFound(String),

    /// Invalid operation (e.g., restarting a handle).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid host configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

fn render_output(output: &str) -> String {
    if output.trim().is_empty() {
        "\n(no launch output captured)".to_string()
    } else {
        format!("\n--- launch output ---\n{}", output.trim_end())
    }
}

impl Error {
    /// Whether this error came out of a failed `start()` attempt.
    ///
    /// Launch failures and registration timeouts are handled the same way
    /// by callers: the handle is dead and a fresh one must be built.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Error::Launch { .. } | Error::RegistrationTimeout { .. })
    }

    /// Captured worker output attached to a launch failure.
    pub fn launch_output(&self) -> Option<&str> {
        match self {
            Error::Launch { output, .. } | Error::RegistrationTimeout { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }

    /// Operator-facing recovery hint, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::RegistrationTimeout { .. } => Some(
                "increase `connect_timeout_ms` (or MOOR_CONNECT_TIMEOUT_MS) if the worker needs longer to boot",
            ),
            Error::Launch { .. } => {
                Some("check the worker runner path and that the registration address is reachable from the worker")
            }
            Error::ExternalTermination(_) => {
                Some("the worker's cluster job was stopped; start a new session")
            }
            Error::Config(_) => Some("see HostConfig for the accepted keys and MOOR_* overrides"),
            _ => None,
        }
    }

    /// Render the error followed by its hint.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{self}\nhint: {hint}"),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_includes_output() {
        let err = Error::Launch {
            message: "process exited with code 3 before registering".to_string(),
            output: "boom: missing JAVA_HOME\n".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("exited with code 3"));
        assert!(rendered.contains("boom: missing JAVA_HOME"));
        assert!(err.is_launch_failure());
    }

    #[test]
    fn test_registration_timeout_with_empty_output() {
        let err = Error::RegistrationTimeout {
            timeout_ms: 2000,
            output: String::new(),
        };
        assert!(err.to_string().contains("within 2 seconds"));
        assert!(err.to_string().contains("no launch output captured"));
        assert_eq!(err.launch_output(), Some(""));
        assert!(err.with_hint().contains("connect_timeout_ms"));
    }

    #[test]
    fn test_dispatch_error_is_not_launch_failure() {
        let err = Error::Dispatch("connection reset".to_string());
        assert!(!err.is_launch_failure());
        assert!(err.hint().is_none());
    }
}
