//! Statement records and their status lifecycle.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-statement options, e.g. `type=single` for stream engines.
pub type LocalOptions = BTreeMap<String, String>;

/// Opaque statement identifier, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatementId(String);

impl StatementId {
    pub fn generate() -> Self {
        Self(format!("stmt_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StatementId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for StatementId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a submitted statement.
///
/// `Pending -> Running -> {Finished, Error, Abort}`. `Error` means the
/// statement's own code failed; `Abort` means execution was interrupted
/// from outside (cancelled, or the worker died mid-run).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementStatus {
    Pending,
    Running,
    Finished,
    Error,
    Abort,
}

impl StatementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Abort)
    }

    /// Running or any later state.
    pub fn has_started(self) -> bool {
        self != Self::Pending
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Finished | Self::Error | Self::Abort => 2,
        }
    }
}

impl fmt::Display for StatementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Abort => "ABORT",
        };
        f.write_str(name)
    }
}

/// Kind of a result fragment.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FragmentType {
    Text,
    /// Tab-separated rows, first row is the header.
    Table,
    Html,
    Other(String),
}

impl fmt::Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("TEXT"),
            Self::Table => f.write_str("TABLE"),
            Self::Html => f.write_str("HTML"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// One typed piece of a statement's output.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct ResultFragment {
    pub kind: FragmentType,
    pub data: String,
}

impl ResultFragment {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            kind: FragmentType::Text,
            data: data.into(),
        }
    }

    pub fn table(data: impl Into<String>) -> Self {
        Self {
            kind: FragmentType::Table,
            data: data.into(),
        }
    }
}

/// A submitted statement and everything known about it.
#[derive(Debug, Clone)]
pub struct StatementRecord {
    pub id: StatementId,
    pub code: String,
    pub local_options: LocalOptions,
    status: StatementStatus,
    results: Vec<ResultFragment>,
    job_urls: Vec<String>,
}

impl StatementRecord {
    pub fn new(id: StatementId, code: impl Into<String>, local_options: LocalOptions) -> Self {
        Self {
            id,
            code: code.into(),
            local_options,
            status: StatementStatus::Pending,
            results: Vec::new(),
            job_urls: Vec::new(),
        }
    }

    pub fn status(&self) -> StatementStatus {
        self.status
    }

    pub fn results(&self) -> &[ResultFragment] {
        &self.results
    }

    pub fn job_urls(&self) -> &[String] {
        &self.job_urls
    }

    /// Move forward to a non-terminal status. Terminal records and
    /// backwards moves are refused.
    pub fn advance(&mut self, next: StatementStatus) -> bool {
        if self.status.is_terminal() || next.is_terminal() || next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }

    /// Record the terminal outcome. Only the first completion sticks.
    pub fn complete(
        &mut self,
        status: StatementStatus,
        results: Vec<ResultFragment>,
        job_urls: Vec<String>,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.results = results;
        self.job_urls = job_urls;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StatementRecord {
        StatementRecord::new(StatementId::from("s1"), "pwd", LocalOptions::new())
    }

    #[test]
    fn test_lifecycle() {
        let mut r = record();
        assert_eq!(r.status(), StatementStatus::Pending);
        assert!(r.advance(StatementStatus::Running));
        assert!(!r.advance(StatementStatus::Pending));
        assert!(r.complete(
            StatementStatus::Finished,
            vec![ResultFragment::text("/tmp\n")],
            vec![]
        ));
        assert_eq!(r.results().len(), 1);
    }

    #[test]
    fn test_terminal_record_is_immutable() {
        let mut r = record();
        assert!(r.complete(StatementStatus::Abort, vec![], vec![]));
        assert!(!r.complete(StatementStatus::Finished, vec![ResultFragment::text("late")], vec![]));
        assert!(!r.advance(StatementStatus::Running));
        assert_eq!(r.status(), StatementStatus::Abort);
        assert!(r.results().is_empty());
    }

    #[test]
    fn test_complete_requires_terminal_status() {
        let mut r = record();
        assert!(!r.complete(StatementStatus::Running, vec![], vec![]));
        assert_eq!(r.status(), StatementStatus::Pending);
    }

    #[test]
    fn test_pending_can_complete_directly() {
        let mut r = record();
        assert!(r.complete(StatementStatus::Abort, vec![], vec![]));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(StatementId::generate(), StatementId::generate());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&StatementStatus::Abort).unwrap();
        assert_eq!(json, "\"ABORT\"");
    }
}
