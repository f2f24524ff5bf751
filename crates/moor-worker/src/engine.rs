//! Shell statement engine.
//!
//! Each statement runs as `<shell> -c` in its own process group, with
//! stderr folded into stdout. Cancellation kills the whole group.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};

use moor_core::session::{EngineMode, LocalOptions, ResultFragment, StatementStatus, parallelism};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable carrying the `parallelism` local option.
const PARALLELISM_ENV: &str = "MOOR_PARALLELISM";

/// Marker printed by cluster launchers next to the job's web UI.
const TRACKING_URL_MARKER: &str = "Tracking URL: ";

/// Terminal outcome of one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: StatementStatus,
    pub fragments: Vec<ResultFragment>,
    pub job_urls: Vec<String>,
}

impl Completion {
    fn aborted() -> Self {
        Self {
            status: StatementStatus::Abort,
            fragments: Vec::new(),
            job_urls: Vec::new(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: StatementStatus::Error,
            fragments: vec![ResultFragment::text(message)],
            job_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Running {
    pid: Option<u32>,
    cancelled: bool,
}

/// Ids remembered per bookkeeping set; the oldest are forgotten first.
const REMEMBERED_IDS: usize = 1024;

/// Insertion-ordered id set holding at most `REMEMBERED_IDS` entries.
#[derive(Debug, Default)]
struct RecentIds {
    ids: FxHashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > REMEMBERED_IDS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn remove(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.order.retain(|queued| queued != id);
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug, Default)]
struct EngineState {
    running: FxHashMap<String, Running>,
    /// Cancels that arrived before their statement; consumed on arrival.
    early_cancel: RecentIds,
    /// Recently finished statements, so late cancels are not remembered.
    done: RecentIds,
}

pub struct ShellEngine {
    shell: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    state: Mutex<EngineState>,
}

impl ShellEngine {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: None,
            env: Vec::new(),
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Extra environment for every statement.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a statement to completion.
    pub async fn run(&self, statement_id: &str, code: &str, options: &LocalOptions) -> Completion {
        let resolved = EngineMode::from_options(options)
            .and_then(|mode| Ok((mode, parallelism(options)?)));
        let (mode, parallelism) = match resolved {
            Ok(resolved) => resolved,
            Err(message) => {
                let mut state = self.state();
                state.early_cancel.remove(statement_id);
                state.done.insert(statement_id);
                return Completion::error(message);
            }
        };

        {
            let mut state = self.state();
            if state.early_cancel.remove(statement_id) {
                info!(statement_id, "statement cancelled before it started");
                state.done.insert(statement_id);
                return Completion::aborted();
            }
            state.running.insert(statement_id.to_string(), Running::default());
        }

        let completion = self.execute(statement_id, code, mode, parallelism).await;

        let mut state = self.state();
        let cancelled = state
            .running
            .remove(statement_id)
            .is_some_and(|r| r.cancelled);
        state.done.insert(statement_id);
        if cancelled {
            info!(statement_id, "statement aborted");
            return Completion::aborted();
        }
        completion
    }

    async fn execute(
        &self,
        statement_id: &str,
        code: &str,
        mode: EngineMode,
        parallelism: Option<u32>,
    ) -> Completion {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{code}"))
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(parallelism) = parallelism {
            cmd.env(PARALLELISM_ENV, parallelism.to_string());
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Completion::error(format!("failed to start {}: {}", self.shell, e)),
        };

        let pid = child.id();
        let cancelled_meanwhile = {
            let mut state = self.state();
            match state.running.get_mut(statement_id) {
                Some(running) => {
                    running.pid = pid;
                    running.cancelled
                }
                None => false,
            }
        };
        if cancelled_meanwhile {
            kill_group(pid);
        }
        debug!(statement_id, ?pid, "statement started");

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => return Completion::error(format!("failed to wait for statement: {e}")),
        };
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let job_urls = tracking_urls(&text);

        if output.status.success() {
            Completion {
                status: StatementStatus::Finished,
                fragments: mode.emit(&text),
                job_urls,
            }
        } else {
            let code = exit_value(&output.status);
            debug!(statement_id, code, "statement failed");
            Completion {
                status: StatementStatus::Error,
                fragments: vec![
                    ResultFragment::text(text),
                    ResultFragment::text(format!("ExitValue: {code}")),
                ],
                job_urls,
            }
        }
    }

    /// Cancel a statement. Returns whether it was running.
    ///
    /// A cancel for an id not seen yet is remembered, so the statement is
    /// aborted as soon as it arrives.
    pub fn cancel(&self, statement_id: &str) -> bool {
        let mut state = self.state();
        if let Some(running) = state.running.get_mut(statement_id) {
            running.cancelled = true;
            info!(statement_id, pid = ?running.pid, "cancelling statement");
            kill_group(running.pid);
            return true;
        }
        if !state.done.contains(statement_id) {
            state.early_cancel.insert(statement_id);
        }
        false
    }

    /// Cancel everything still running.
    pub fn cancel_all(&self) {
        let mut state = self.state();
        for (id, running) in state.running.iter_mut() {
            warn!(statement_id = %id, "killing statement on shutdown");
            running.cancelled = true;
            kill_group(running.pid);
        }
    }

    pub fn running_count(&self) -> usize {
        self.state().running.len()
    }
}

fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn exit_value(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn tracking_urls(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (_, rest) = line.split_once(TRACKING_URL_MARKER)?;
            rest.split_whitespace().next().map(str::to_string)
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use moor_core::session::FragmentType;

    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> LocalOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_batch_output() {
        let engine = ShellEngine::new("sh");
        let done = engine.run("s1", "echo hello; echo oops >&2", &opts(&[])).await;
        assert_eq!(done.status, StatementStatus::Finished);
        assert_eq!(done.fragments, vec![ResultFragment::text("hello\noops\n")]);
    }

    #[tokio::test]
    async fn test_failure_reports_exit_value() {
        let engine = ShellEngine::new("sh");
        let done = engine.run("s1", "echo partial; exit 3", &opts(&[])).await;
        assert_eq!(done.status, StatementStatus::Error);
        assert_eq!(done.fragments[0].data, "partial\n");
        assert_eq!(done.fragments[1].data, "ExitValue: 3");
    }

    #[tokio::test]
    async fn test_unknown_mode_is_statement_error() {
        let engine = ShellEngine::new("sh");
        let done = engine.run("s1", "echo x", &opts(&[("type", "bogus")])).await;
        assert_eq!(done.status, StatementStatus::Error);
        assert_eq!(done.fragments[0].data, "Unrecognized stream type: bogus");
    }

    #[tokio::test]
    async fn test_parallelism_reaches_statement() {
        let engine = ShellEngine::new("sh");
        let done = engine
            .run("s1", "echo \"p=$MOOR_PARALLELISM\"", &opts(&[("parallelism", "3")]))
            .await;
        assert_eq!(done.fragments, vec![ResultFragment::text("p=3\n")]);

        let bad = engine
            .run("s2", "echo x", &opts(&[("parallelism", "0")]))
            .await;
        assert_eq!(bad.status, StatementStatus::Error);
        assert_eq!(bad.fragments[0].data, "Invalid parallelism: 0");
    }

    #[tokio::test]
    async fn test_snapshot_mode() {
        let engine = ShellEngine::new("sh");
        let done = engine
            .run("s1", "echo 1; echo 2; echo 3", &opts(&[("type", "single")]))
            .await;
        assert_eq!(done.fragments, vec![ResultFragment::text("3")]);
    }

    #[tokio::test]
    async fn test_changelog_mode_emits_table() {
        let engine = ShellEngine::new("sh");
        let script = r"printf 'k\tv\n+\ta\t1\n-\ta\t1\n+\ta\t2\n'";
        let done = engine.run("s1", script, &opts(&[("type", "retract")])).await;
        assert_eq!(done.fragments[0].kind, FragmentType::Table);
        assert_eq!(done.fragments[0].data, "k\tv\na\t2\n");
    }

    #[tokio::test]
    async fn test_cancel_kills_process_group() {
        let engine = Arc::new(ShellEngine::new("sh"));
        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.run("s1", "sleep 30; echo done", &LocalOptions::new()).await });

        while engine.running_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.cancel("s1"));

        let done = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, StatementStatus::Abort);
        assert_eq!(engine.running_count(), 0);
    }

    #[tokio::test]
    async fn test_early_cancel_aborts_on_arrival() {
        let engine = ShellEngine::new("sh");
        assert!(!engine.cancel("s1"));
        let done = engine.run("s1", "echo never", &LocalOptions::new()).await;
        assert_eq!(done.status, StatementStatus::Abort);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_ignored() {
        let engine = ShellEngine::new("sh");
        engine.run("s1", "true", &LocalOptions::new()).await;
        assert!(!engine.cancel("s1"));
        assert_eq!(engine.state().early_cancel.len(), 0);
    }

    #[tokio::test]
    async fn test_early_cancel_is_consumed() {
        let engine = ShellEngine::new("sh");
        engine.cancel("s1");
        assert_eq!(engine.state().early_cancel.len(), 1);
        engine.run("s1", "true", &LocalOptions::new()).await;
        assert_eq!(engine.state().early_cancel.len(), 0);

        // A rerun of the same id is not aborted again.
        let done = engine.run("s1", "echo again", &LocalOptions::new()).await;
        assert_eq!(done.status, StatementStatus::Finished);
    }

    #[test]
    fn test_bookkeeping_is_bounded() {
        let engine = ShellEngine::new("sh");
        for i in 0..REMEMBERED_IDS + 50 {
            engine.cancel(&format!("never-arrives-{i}"));
        }
        let state = engine.state();
        assert_eq!(state.early_cancel.len(), REMEMBERED_IDS);
        assert!(!state.early_cancel.contains("never-arrives-0"));
        assert!(state.early_cancel.contains(&format!("never-arrives-{}", REMEMBERED_IDS + 49)));
    }

    #[tokio::test]
    async fn test_finished_ids_are_bounded() {
        let engine = ShellEngine::new("sh");
        {
            let mut state = engine.state();
            for i in 0..REMEMBERED_IDS + 10 {
                state.done.insert(&format!("old-{i}"));
            }
        }
        engine.run("latest", "true", &LocalOptions::new()).await;
        let state = engine.state();
        assert_eq!(state.done.len(), REMEMBERED_IDS);
        assert!(state.done.contains("latest"));
        assert!(!state.done.contains("old-0"));
    }

    #[test]
    fn test_tracking_urls() {
        let out = "INFO Client: Tracking URL: http://rm:8088/proxy/application_1_1/\nother\n";
        assert_eq!(tracking_urls(out), vec!["http://rm:8088/proxy/application_1_1/".to_string()]);
    }
}
