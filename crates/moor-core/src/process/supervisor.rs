//! Supervision of a single worker OS process.
//!
//! `ProcessSupervisor` spawns the process, captures its launch output,
//! publishes state transitions on a watch channel, and tears the process
//! down with SIGTERM followed by SIGKILL.
//!
//! Readiness is decoupled from process existence: the process is only
//! `Running` once someone who observed the worker register calls
//! [`ProcessSupervisor::on_process_running`].

use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::LaunchCommand;
use super::output::{LineListener, OutputBuffer};
use super::state::WorkerProcessState;

/// How long to wait for output readers to drain after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// An exit with code 0 before registration is a hand-off, not a failure.
    pub one_shot: bool,
    /// Time between SIGTERM and SIGKILL on stop.
    pub grace_period: Duration,
    /// Bytes of launch output retained.
    pub output_limit: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            one_shot: false,
            grace_period: Duration::from_secs(3),
            output_limit: 64 * 1024,
        }
    }
}

struct Diagnostics {
    output: OutputBuffer,
    error: Option<String>,
    exit_code: Option<i32>,
    timed_out: bool,
    pid: Option<u32>,
}

/// State shared with the background exit and capture tasks.
struct Shared {
    state: watch::Sender<WorkerProcessState>,
    diag: Mutex<Diagnostics>,
    one_shot: bool,
}

impl Shared {
    fn diag(&self) -> MutexGuard<'_, Diagnostics> {
        self.diag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> WorkerProcessState {
        *self.state.borrow()
    }

    /// Apply `next` if it is a legal edge from the current state.
    fn transition(&self, next: WorkerProcessState) -> bool {
        self.transition_with(next, |_| {})
    }

    /// Like `transition`, running `on_apply` under the state lock so the
    /// diagnostics are in place before any waiter wakes.
    fn transition_with(
        &self,
        next: WorkerProcessState,
        on_apply: impl FnOnce(&mut Diagnostics),
    ) -> bool {
        let mut from = None;
        let mut on_apply = Some(on_apply);
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }
            if let Some(f) = on_apply.take() {
                f(&mut self.diag());
            }
            from = Some(*current);
            *current = next;
            true
        });
        match from {
            Some(from) => {
                debug!(%from, to = %next, "worker process state change");
                true
            }
            None => false,
        }
    }

    fn on_exit(&self, code: i32) {
        self.diag().exit_code = Some(code);
        let mut change = None;
        let mut handed_off = false;
        self.state.send_if_modified(|current| {
            let next = match *current {
                WorkerProcessState::Launched if code == 0 && self.one_shot => {
                    handed_off = true;
                    return false;
                }
                WorkerProcessState::Launched => {
                    self.diag().error =
                        Some(format!("process exited with code {code} before registering"));
                    WorkerProcessState::Failed
                }
                WorkerProcessState::Running if code == 0 => WorkerProcessState::Completed,
                WorkerProcessState::Running => WorkerProcessState::Terminated,
                _ => return false,
            };
            change = Some((*current, next));
            *current = next;
            true
        });

        match change {
            Some((from, to)) => info!(code, %from, %to, "worker process exited"),
            None if handed_off => {
                info!("launcher exited with code 0 in one-shot mode; still awaiting registration")
            }
            None => debug!(code, state = %self.current(), "exit after terminal state ignored"),
        }
    }
}

struct Control {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns one worker OS process.
pub struct ProcessSupervisor {
    command: LaunchCommand,
    options: SupervisorOptions,
    shared: Arc<Shared>,
    listener: Option<LineListener>,
    control: Mutex<Option<Control>>,
}

impl ProcessSupervisor {
    pub fn new(command: LaunchCommand, options: SupervisorOptions) -> Self {
        let (state, _) = watch::channel(WorkerProcessState::New);
        let shared = Arc::new(Shared {
            state,
            diag: Mutex::new(Diagnostics {
                output: OutputBuffer::new(options.output_limit),
                error: None,
                exit_code: None,
                timed_out: false,
                pid: None,
            }),
            one_shot: options.one_shot,
        });
        Self {
            command,
            options,
            shared,
            listener: None,
            control: Mutex::new(None),
        }
    }

    /// Observe each captured launch-output line.
    pub fn with_listener(mut self, listener: LineListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn command(&self) -> &LaunchCommand {
        &self.command
    }

    pub fn state(&self) -> WorkerProcessState {
        self.shared.current()
    }

    /// Receiver that sees every state transition.
    pub fn subscribe(&self) -> watch::Receiver<WorkerProcessState> {
        self.shared.state.subscribe()
    }

    pub fn error_message(&self) -> Option<String> {
        self.shared.diag().error.clone()
    }

    /// Captured launch output, for diagnostics.
    pub fn launch_output(&self) -> String {
        self.shared.diag().output.contents()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.shared.diag().exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.diag().pid
    }

    /// Whether the last `wait_for_ready` gave up on the timeout.
    pub fn timed_out(&self) -> bool {
        self.shared.diag().timed_out
    }

    /// Spawn the process. Must be called from within a tokio runtime.
    ///
    /// Spawn errors do not surface here; they move the supervisor to
    /// `Failed` with the error recorded.
    pub fn launch(&self) {
        // Launched is published before spawning so a registration racing
        // with the spawn always finds a state it can move to Running.
        if !self.shared.transition(WorkerProcessState::Launched) {
            warn!(state = %self.state(), "launch() ignored: process already launched");
            return;
        }
        info!(command = %self.command, "launching worker process");

        let mut child = match self.command.to_tokio().spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn '{}': {}", self.command.program, e);
                warn!("{message}");
                self.shared
                    .transition_with(WorkerProcessState::Failed, |diag| {
                        diag.error = Some(message)
                    });
                return;
            }
        };

        let pid = child.id();
        self.shared.diag().pid = pid;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture(
                stdout,
                "stdout",
                self.shared.clone(),
                self.listener.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture(
                stderr,
                "stderr",
                self.shared.clone(),
                self.listener.clone(),
            )));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            child,
            pid,
            stop_rx,
            self.options.grace_period,
            self.shared.clone(),
            readers,
        ));
        *self.control() = Some(Control { stop_tx, task });
    }

    /// Wait until the process is running, has failed, or `timeout` elapses.
    ///
    /// A timeout while still `Launched` forces `Failed`. Launch-output
    /// capture stops when this returns.
    pub async fn wait_for_ready(&self, timeout: Duration) -> WorkerProcessState {
        if self.state() == WorkerProcessState::New {
            return WorkerProcessState::New;
        }

        let mut rx = self.subscribe();
        let settled = tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| state.is_settled()).await.map(|state| *state)
        })
        .await;

        self.shared.diag().output.stop_capture();

        if settled.is_err() {
            let message = format!("launch timed out after {} ms", timeout.as_millis());
            if self
                .shared
                .transition_with(WorkerProcessState::Failed, |diag| {
                    diag.timed_out = true;
                    diag.error = Some(message);
                })
            {
                warn!(timeout_ms = timeout.as_millis() as u64, "worker process launch timed out");
            }
        }
        self.state()
    }

    /// The worker registered itself. Returns false if it is too late
    /// (the process already reached a terminal state).
    pub fn on_process_running(&self) -> bool {
        let applied = self.shared.transition(WorkerProcessState::Running);
        if applied {
            info!(pid = ?self.pid(), "worker process is running");
        }
        applied
    }

    /// Mark a user-initiated stop. Later exits are then ignored.
    pub fn mark_terminated(&self) -> bool {
        self.shared.transition(WorkerProcessState::Terminated)
    }

    /// Stop the process: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Idempotent; returns once the process has been reaped.
    pub async fn stop(&self) {
        if self.mark_terminated() {
            info!(pid = ?self.pid(), "stopping worker process");
        }
        let control = self.control().take();
        let Some(Control { stop_tx, task }) = control else {
            return;
        };
        // The receiver is gone if the process already exited.
        let _ = stop_tx.send(());
        if let Err(e) = task.await {
            warn!(error = %e, "worker supervision task ended abnormally");
        }
    }

    fn control(&self) -> MutexGuard<'_, Option<Control>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("command", &self.command)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

enum Finish {
    Exited(io::Result<ExitStatus>),
    StopRequested,
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    shared: Arc<Shared>,
    readers: Vec<JoinHandle<()>>,
) {
    // A dropped sender (supervisor dropped) is treated as a stop request.
    let finish = tokio::select! {
        status = child.wait() => Finish::Exited(status),
        _ = stop_rx => Finish::StopRequested,
    };
    let status = match finish {
        Finish::Exited(status) => status,
        Finish::StopRequested => terminate(&mut child, pid, grace).await,
    };

    let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, futures::future::join_all(readers)).await;

    let code = match status {
        Ok(status) => exit_code(&status),
        Err(e) => {
            warn!(error = %e, "failed to wait for worker process");
            -1
        }
    };
    shared.on_exit(code);
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    signal_group(pid, libc::SIGTERM);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(?pid, grace_ms = grace.as_millis() as u64, "worker ignored SIGTERM; killing");
            #[cfg(unix)]
            signal_group(pid, libc::SIGKILL);
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

/// Signal the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: i32) {
    let Some(pid) = pid else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pid, signal, error = %err, "failed to signal worker process group");
        }
    }
}

fn exit_code(status: &ExitStatus) -> i32 {
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

async fn capture<R>(
    stream: R,
    source: &'static str,
    shared: Arc<Shared>,
    listener: Option<LineListener>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                debug!(target: "moor::worker_output", source, "{line}");
                let captured = shared.diag().output.push_line(line);
                if captured && let Some(listener) = &listener {
                    listener(line);
                }
            }
            Err(e) => {
                debug!(source, error = %e, "worker output stream closed");
                break;
            }
        }
    }
}
