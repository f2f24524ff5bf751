//! Client-facing execution sessions.
//!
//! An [`ExecutionSession`] is bound to one [`RemoteWorkerHandle`]. It keeps
//! a document of submitted statements, dispatches each one through the
//! group's [`AdmissionScheduler`], and exposes polling, push and
//! cancellation by statement id. Worker processes and sockets never show
//! through this API.

mod mode;
mod statement;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ipc::{WorkerCommand, WorkerConnection, WorkerRegistry, WorkerResponse};
use crate::scheduler::{AdmissionScheduler, SchedulerRegistry};
use crate::worker::RemoteWorkerHandle;

pub use mode::{EngineMode, MODE_OPTION, PARALLELISM_OPTION, WINDOW_OPTION, parallelism};
pub use statement::{
    FragmentType, LocalOptions, ResultFragment, StatementId, StatementRecord, StatementStatus,
};

/// Snapshot of a statement, as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecuteResult {
    pub statement_id: StatementId,
    pub status: StatementStatus,
    pub results: Vec<ResultFragment>,
    pub job_urls: Vec<String>,
}

impl ExecuteResult {
    fn of(record: &StatementRecord) -> Self {
        Self {
            statement_id: record.id.clone(),
            status: record.status(),
            results: record.results().to_vec(),
            job_urls: record.job_urls().to_vec(),
        }
    }

    /// Text of all TEXT fragments, concatenated.
    pub fn text(&self) -> String {
        self.results
            .iter()
            .filter(|f| f.kind == FragmentType::Text)
            .map(|f| f.data.as_str())
            .collect()
    }
}

impl fmt::Display for ExecuteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} [{}]", self.statement_id, self.status)?;
        for fragment in &self.results {
            if fragment.kind != FragmentType::Text {
                writeln!(f, "%{}", fragment.kind.to_string().to_lowercase())?;
            }
            f.write_str(&fragment.data)?;
            if !fragment.data.ends_with('\n') {
                writeln!(f)?;
            }
        }
        for url in &self.job_urls {
            writeln!(f, "job: {url}")?;
        }
        Ok(())
    }
}

struct Entry {
    record: StatementRecord,
    status_tx: watch::Sender<StatementStatus>,
    cancel_tx: watch::Sender<bool>,
    dispatched: bool,
}

/// The session's logical document: statements in submission order.
struct Document {
    id: String,
    order: Vec<StatementId>,
    entries: FxHashMap<StatementId, Entry>,
}

impl Document {
    fn entry(&self, id: &StatementId) -> Result<&Entry> {
        self.entries
            .get(id)
            .ok_or_else(|| Error::StatementNotFound(id.to_string()))
    }

    fn entry_mut(&mut self, id: &StatementId) -> Result<&mut Entry> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| Error::StatementNotFound(id.to_string()))
    }
}

/// State reachable from the per-statement tasks.
struct Shared {
    handle: Arc<RemoteWorkerHandle>,
    scheduler: Arc<AdmissionScheduler>,
    document: Mutex<Document>,
}

impl Shared {
    fn document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, id: &StatementId, next: StatementStatus) {
        let mut doc = self.document();
        if let Ok(entry) = doc.entry_mut(id)
            && entry.record.advance(next)
        {
            entry.status_tx.send_replace(next);
        }
    }

    fn finish(
        &self,
        id: &StatementId,
        status: StatementStatus,
        results: Vec<ResultFragment>,
        job_urls: Vec<String>,
    ) {
        let mut doc = self.document();
        let Ok(entry) = doc.entry_mut(id) else {
            return;
        };
        if entry.record.complete(status, results, job_urls) {
            debug!(statement_id = %id, %status, "statement finished");
            entry.status_tx.send_replace(status);
        }
    }

    /// Mark a statement as handed to the worker, unless it was cancelled
    /// while waiting for admission.
    fn mark_dispatched(&self, id: &StatementId) -> bool {
        let mut doc = self.document();
        match doc.entry_mut(id) {
            Ok(entry) if !*entry.cancel_tx.borrow() => {
                entry.dispatched = true;
                true
            }
            _ => false,
        }
    }
}

/// Deregistration performed when the session stops.
struct HostLinks {
    registry: Arc<WorkerRegistry>,
    schedulers: Arc<SchedulerRegistry>,
}

/// A client session on one remote worker.
pub struct ExecutionSession {
    interpreter: String,
    user: Option<String>,
    shared: Arc<Shared>,
    poll_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    links: Mutex<Option<HostLinks>>,
    stopped: AtomicBool,
}

impl ExecutionSession {
    pub fn new(
        interpreter: impl Into<String>,
        user: Option<String>,
        handle: Arc<RemoteWorkerHandle>,
        scheduler: Arc<AdmissionScheduler>,
        poll_interval: Duration,
    ) -> Self {
        let document = Document {
            id: format!("doc_{}", uuid::Uuid::new_v4().simple()),
            order: Vec::new(),
            entries: FxHashMap::default(),
        };
        Self {
            interpreter: interpreter.into(),
            user,
            shared: Arc::new(Shared {
                handle,
                scheduler,
                document: Mutex::new(document),
            }),
            poll_interval,
            tasks: Mutex::new(Vec::new()),
            links: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Deregister the worker from these registries when the session stops.
    pub(crate) fn with_host_links(
        self,
        registry: Arc<WorkerRegistry>,
        schedulers: Arc<SchedulerRegistry>,
    ) -> Self {
        *self.links.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(HostLinks { registry, schedulers });
        self
    }

    /// Id of the session's document.
    pub fn session_id(&self) -> String {
        self.shared.document().id.clone()
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn handle(&self) -> &Arc<RemoteWorkerHandle> {
        &self.shared.handle
    }

    pub fn scheduler(&self) -> &Arc<AdmissionScheduler> {
        &self.shared.scheduler
    }

    /// Start the worker. Launch failures are returned here.
    pub async fn start(&self) -> Result<()> {
        info!(
            session_id = %self.session_id(),
            interpreter = %self.interpreter,
            group_id = self.shared.handle.group_id(),
            "starting session"
        );
        if let Err(e) = self.shared.handle.start(self.user.as_deref()).await {
            self.release_links();
            return Err(e);
        }
        Ok(())
    }

    /// Interactive endpoint advertised by the worker, if any.
    pub fn web_url(&self) -> Option<String> {
        self.shared.handle.web_url()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && self.shared.handle.is_running()
    }

    /// Queue `code` for execution and return immediately.
    ///
    /// Statement failures are reported through the statement's status,
    /// never as an error here.
    pub fn submit(&self, code: impl Into<String>, local_options: LocalOptions) -> Result<ExecuteResult> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("session is stopped".to_string()));
        }
        if !self.shared.handle.is_running() {
            let reason = self
                .shared
                .handle
                .error_message()
                .unwrap_or_else(|| format!("worker is {}", self.shared.handle.state()));
            return Err(Error::WorkerNotRunning(reason));
        }

        let id = StatementId::generate();
        let code = code.into();
        let record = StatementRecord::new(id.clone(), code.clone(), local_options.clone());
        let snapshot = ExecuteResult::of(&record);
        {
            let mut doc = self.shared.document();
            let (status_tx, _) = watch::channel(StatementStatus::Pending);
            let (cancel_tx, _) = watch::channel(false);
            doc.order.push(id.clone());
            doc.entries.insert(
                id.clone(),
                Entry {
                    record,
                    status_tx,
                    cancel_tx,
                    dispatched: false,
                },
            );
        }
        debug!(statement_id = %id, "statement submitted");

        let task = tokio::spawn(run_statement(self.shared.clone(), id, code, local_options));
        let mut tasks = self.tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(snapshot)
    }

    /// Submit and wait for the terminal result.
    pub async fn execute(
        &self,
        code: impl Into<String>,
        local_options: LocalOptions,
    ) -> Result<ExecuteResult> {
        let submitted = self.submit(code, local_options)?;
        self.wait_until_finished(&submitted.statement_id).await
    }

    pub fn status(&self, id: &StatementId) -> Result<ExecuteResult> {
        let doc = self.shared.document();
        Ok(ExecuteResult::of(&doc.entry(id)?.record))
    }

    /// All statements in submission order.
    pub fn statements(&self) -> Vec<ExecuteResult> {
        let doc = self.shared.document();
        doc.order
            .iter()
            .filter_map(|id| doc.entries.get(id))
            .map(|e| ExecuteResult::of(&e.record))
            .collect()
    }

    /// Poll until the statement has started (or already ended).
    pub async fn wait_until_running(&self, id: &StatementId) -> Result<ExecuteResult> {
        self.poll_until(id, |s| s.has_started()).await
    }

    /// Poll until the statement is terminal. Fails once the session is
    /// stopped with the statement still in flight.
    pub async fn wait_until_finished(&self, id: &StatementId) -> Result<ExecuteResult> {
        self.poll_until(id, |s| s.is_terminal()).await
    }

    async fn poll_until(
        &self,
        id: &StatementId,
        done: impl Fn(StatementStatus) -> bool,
    ) -> Result<ExecuteResult> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let result = self.status(id)?;
            if done(result.status) {
                return Ok(result);
            }
            if self.stopped.load(Ordering::Acquire) {
                return Err(Error::InvalidOperation(format!(
                    "session is stopped; statement {id} left {}",
                    result.status
                )));
            }
        }
    }

    /// Push-based status updates. The receiver sees the current status
    /// first, and the channel's last value is the terminal status. The
    /// channel closes without one if the session stops first.
    pub fn watch_status(&self, id: &StatementId) -> Result<watch::Receiver<StatementStatus>> {
        Ok(self.shared.document().entry(id)?.status_tx.subscribe())
    }

    /// Request cancellation of a pending or running statement.
    ///
    /// The statement becomes `Abort` once the cancellation takes effect:
    /// immediately for statements still waiting for admission, otherwise
    /// when the worker reports it. Cancelling a finished statement does
    /// nothing.
    pub async fn cancel(&self, id: &StatementId) -> Result<()> {
        let dispatched = {
            let doc = self.shared.document();
            let entry = doc.entry(id)?;
            if entry.record.status().is_terminal() {
                debug!(statement_id = %id, status = %entry.record.status(), "cancel after completion ignored");
                return Ok(());
            }
            entry.cancel_tx.send_replace(true);
            entry.dispatched
        };
        if !dispatched {
            debug!(statement_id = %id, "cancelled before dispatch");
            return Ok(());
        }

        let statement_id = id.to_string();
        let found = self
            .shared
            .handle
            .control(move |conn: &mut WorkerConnection| {
                Box::pin(async move {
                    match conn.call(&WorkerCommand::CancelStatement { statement_id }).await? {
                        WorkerResponse::CancelRequested { found, .. } => Ok(found),
                        WorkerResponse::Error { message } => Err(Error::Dispatch(message)),
                        other => Err(Error::Ipc(format!("Unexpected response to cancel: {:?}", other))),
                    }
                })
            })
            .await?;
        info!(statement_id = %id, found, "cancel requested");
        Ok(())
    }

    /// Stop the worker. Statements keep the last status they reached.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session_id = %self.session_id(), "stopping session");
        for task in self.tasks().drain(..) {
            task.abort();
        }
        // Close the status channels of in-flight statements so watchers
        // see the end instead of waiting for a terminal status.
        for entry in self.shared.document().entries.values_mut() {
            if !entry.record.status().is_terminal() {
                let (fresh, _) = watch::channel(entry.record.status());
                drop(std::mem::replace(&mut entry.status_tx, fresh));
            }
        }
        self.shared.handle.stop().await;
        self.release_links();
    }

    fn release_links(&self) {
        let links = self.links.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(links) = links {
            let group_id = self.shared.handle.group_id();
            links.registry.deregister(group_id);
            links.schedulers.remove(group_id);
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("session_id", &self.session_id())
            .field("interpreter", &self.interpreter)
            .field("handle", &self.shared.handle)
            .finish()
    }
}

type Outcome = (StatementStatus, Vec<ResultFragment>, Vec<String>);

async fn run_statement(shared: Arc<Shared>, id: StatementId, code: String, options: LocalOptions) {
    let mut cancel_rx = match shared.document().entry(&id) {
        Ok(entry) => entry.cancel_tx.subscribe(),
        Err(_) => return,
    };

    let admitted = tokio::select! {
        permit = shared.scheduler.acquire() => Some(permit),
        _ = cancel_rx.wait_for(|cancelled| *cancelled) => None,
    };
    let _permit = match admitted {
        Some(Ok(permit)) => permit,
        Some(Err(e)) => {
            shared.finish(&id, StatementStatus::Abort, vec![ResultFragment::text(e.to_string())], vec![]);
            return;
        }
        None => {
            shared.finish(&id, StatementStatus::Abort, vec![], vec![]);
            return;
        }
    };
    if !shared.mark_dispatched(&id) {
        shared.finish(&id, StatementStatus::Abort, vec![], vec![]);
        return;
    }

    let command = WorkerCommand::RunStatement {
        statement_id: id.to_string(),
        code,
        local_options: options.into_iter().collect(),
    };
    let progress = shared.clone();
    let progress_id = id.clone();
    let outcome = shared
        .handle
        .dispatch(move |conn: &mut WorkerConnection| {
            Box::pin(run_on_worker(conn, command, progress, progress_id))
        })
        .await;

    match outcome {
        Ok((status, results, job_urls)) => shared.finish(&id, status, results, job_urls),
        Err(e) => {
            warn!(statement_id = %id, error = %e, "statement dispatch failed");
            shared.finish(&id, StatementStatus::Abort, vec![ResultFragment::text(e.to_string())], vec![]);
        }
    }
}

async fn run_on_worker(
    conn: &mut WorkerConnection,
    command: WorkerCommand,
    shared: Arc<Shared>,
    id: StatementId,
) -> Result<Outcome> {
    conn.send(&command).await?;
    loop {
        match conn.recv().await? {
            WorkerResponse::StatementStarted { .. } => shared.advance(&id, StatementStatus::Running),
            WorkerResponse::StatementCompleted {
                status,
                fragments,
                job_urls,
                ..
            } => {
                conn.finish_request();
                return Ok((status, fragments, job_urls));
            }
            WorkerResponse::Error { message } => {
                conn.finish_request();
                return Ok((StatementStatus::Error, vec![ResultFragment::text(message)], vec![]));
            }
            other => {
                return Err(Error::Ipc(format!("Unexpected response to statement: {:?}", other)));
            }
        }
    }
}
