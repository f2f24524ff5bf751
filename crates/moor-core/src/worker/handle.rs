//! Host-side handle to one remote worker process.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, PortRange};
use crate::error::{Error, Result};
use crate::ipc::{ConnectionPool, WorkerCommand, WorkerConnection, WorkerResponse};
use crate::process::{
    LaunchCommand, LineListener, ProcessSupervisor, SupervisorOptions, WorkerProcessState,
};

use super::monitor::{JobMonitor, scan_job_id};

/// How a worker is launched.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    /// Worker binary (or a wrapper script) plus its base arguments and
    /// environment. Launch flags are appended to it.
    pub runner: LaunchCommand,
    pub interpreter_dir: PathBuf,
    pub local_repo_dir: PathBuf,
    pub port_range: PortRange,
    /// Launch over `remote_shell` on this host instead of locally.
    pub remote_host: Option<String>,
    pub remote_shell: String,
    pub impersonate: bool,
    /// Principals that never get `--user`, even with impersonation on.
    pub impersonation_exempt: Vec<String>,
    pub one_shot: bool,
    pub output_capture_limit: usize,
    pub stop_grace_period: Duration,
}

impl LaunchParams {
    pub fn from_config(config: &HostConfig, runner: LaunchCommand) -> Result<Self> {
        Ok(Self {
            runner,
            interpreter_dir: config.interpreter_dir.clone(),
            local_repo_dir: config.local_repo_dir.clone(),
            port_range: config.port_range.parse()?,
            remote_host: config.remote_host.clone(),
            remote_shell: config.remote_shell.clone(),
            impersonate: config.impersonation_enabled,
            impersonation_exempt: config.impersonation_exempt.clone(),
            one_shot: config.one_shot_launch,
            output_capture_limit: config.output_capture_limit,
            stop_grace_period: config.stop_grace_period(),
        })
    }
}

/// Where the worker calls back to, and how the host talks to it.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub registration_host: String,
    pub registration_port: u16,
    pub connect_timeout: Duration,
    pub pool_size: usize,
}

impl ConnectionParams {
    /// `registration_port` is the port actually bound, which differs from
    /// the configured one when that is 0.
    pub fn from_config(config: &HostConfig, registration_port: u16) -> Self {
        Self {
            registration_host: config.registration_host.clone(),
            registration_port,
            connect_timeout: config.connect_timeout(),
            pool_size: config.connection_pool_size,
        }
    }
}

/// Address a worker registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAddress {
    pub host: String,
    pub port: u16,
    pub web_url: Option<String>,
}

impl WorkerAddress {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Default)]
struct HandleState {
    supervisor: Option<Arc<ProcessSupervisor>>,
    address: Option<WorkerAddress>,
    external_error: Option<String>,
    pool: Option<ConnectionPool>,
    jobs: Vec<String>,
}

/// Owns one worker process for one interpreter group.
///
/// A handle is started once. After it fails or stops, a new handle has to
/// be built.
pub struct RemoteWorkerHandle {
    group_id: String,
    setting_name: String,
    launch: LaunchParams,
    connection: ConnectionParams,
    monitor: Arc<JobMonitor>,
    self_ref: Weak<RemoteWorkerHandle>,
    inner: Mutex<HandleState>,
}

impl RemoteWorkerHandle {
    pub fn new(
        group_id: impl Into<String>,
        setting_name: impl Into<String>,
        launch: LaunchParams,
        connection: ConnectionParams,
        monitor: Arc<JobMonitor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            group_id: group_id.into(),
            setting_name: setting_name.into(),
            launch,
            connection,
            monitor,
            self_ref: self_ref.clone(),
            inner: Mutex::new(HandleState::default()),
        })
    }

    fn inner(&self) -> MutexGuard<'_, HandleState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn setting_name(&self) -> &str {
        &self.setting_name
    }

    fn supervisor(&self) -> Option<Arc<ProcessSupervisor>> {
        self.inner().supervisor.clone()
    }

    /// The user the worker runs as, if impersonation applies.
    fn impersonated_user<'u>(&self, user: Option<&'u str>) -> Option<&'u str> {
        let user = user?;
        if !self.launch.impersonate || self.launch.impersonation_exempt.iter().any(|p| p == user) {
            return None;
        }
        Some(user)
    }

    /// The full launch command for `user`.
    pub fn build_command(&self, user: Option<&str>) -> LaunchCommand {
        let mut cmd = self
            .launch
            .runner
            .clone()
            .arg("--callback-host")
            .arg(&self.connection.registration_host)
            .arg("--callback-port")
            .arg(self.connection.registration_port.to_string())
            .arg("--port-range")
            .arg(self.launch.port_range.to_string())
            .arg("--group-id")
            .arg(&self.group_id)
            .arg("--interpreter-dir")
            .arg(self.launch.interpreter_dir.display().to_string())
            .arg("--local-repo")
            .arg(self.launch.local_repo_dir.display().to_string())
            .arg("--setting-name")
            .arg(&self.setting_name);
        if let Some(user) = self.impersonated_user(user) {
            cmd = cmd.arg("--user").arg(user);
        }
        if let Some(host) = &self.launch.remote_host {
            cmd = cmd.wrap_remote(&self.launch.remote_shell, host);
        }
        cmd
    }

    fn job_listener(&self) -> LineListener {
        let owner = self.self_ref.clone();
        Arc::new(move |line: &str| {
            if let Some(job_id) = scan_job_id(line)
                && let Some(handle) = owner.upgrade()
            {
                handle.track_job(job_id);
            }
        })
    }

    fn track_job(&self, job_id: &str) {
        self.monitor.add_job(job_id, self.self_ref.clone());
        let mut inner = self.inner();
        if !inner.jobs.iter().any(|j| j == job_id) {
            inner.jobs.push(job_id.to_string());
        }
    }

    /// Launch the worker and wait for it to register.
    ///
    /// Fails with [`Error::RegistrationTimeout`] if no callback arrives
    /// within the connect timeout, or [`Error::Launch`] if the process could
    /// not be spawned or exited first. Both carry the captured launch output.
    pub async fn start(&self, user: Option<&str>) -> Result<()> {
        let supervisor = {
            let mut inner = self.inner();
            if inner.supervisor.is_some() {
                return Err(Error::InvalidOperation(format!(
                    "worker {} was already started",
                    self.group_id
                )));
            }
            let options = SupervisorOptions {
                one_shot: self.launch.one_shot,
                grace_period: self.launch.stop_grace_period,
                output_limit: self.launch.output_capture_limit,
            };
            let supervisor = Arc::new(
                ProcessSupervisor::new(self.build_command(user), options)
                    .with_listener(self.job_listener()),
            );
            inner.supervisor = Some(supervisor.clone());
            supervisor
        };

        info!(group_id = %self.group_id, setting = %self.setting_name, "starting worker");
        supervisor.launch();
        let state = supervisor
            .wait_for_ready(self.connection.connect_timeout)
            .await;

        if let Some(reason) = self.external_error() {
            self.teardown(&supervisor).await;
            return Err(Error::ExternalTermination(reason));
        }
        if state == WorkerProcessState::Running {
            info!(group_id = %self.group_id, address = ?self.address(), "worker is running");
            return Ok(());
        }

        let output = supervisor.launch_output();
        let err = if supervisor.timed_out() {
            Error::RegistrationTimeout {
                timeout_ms: self.connection.connect_timeout.as_millis() as u64,
                output,
            }
        } else {
            Error::Launch {
                message: supervisor
                    .error_message()
                    .unwrap_or_else(|| format!("worker ended in state {state}")),
                output,
            }
        };
        warn!(group_id = %self.group_id, error = %err, "worker failed to start");
        self.teardown(&supervisor).await;
        Err(err)
    }

    /// The worker registered at `address`. Returns false if the handle is not
    /// waiting for a registration (never started, or already terminal).
    pub fn process_started(&self, address: WorkerAddress) -> bool {
        let mut inner = self.inner();
        let Some(supervisor) = inner.supervisor.clone() else {
            warn!(group_id = %self.group_id, "registration for a worker that was never started");
            return false;
        };
        if inner.pool.is_some() {
            debug!(group_id = %self.group_id, "duplicate registration ignored");
            return supervisor.state() == WorkerProcessState::Running;
        }
        // Pool first, so start() finds it as soon as it wakes.
        let pool = ConnectionPool::new(
            address.socket_addr(),
            self.connection.pool_size,
            self.connection.connect_timeout,
        );
        inner.pool = Some(pool);
        inner.address = Some(address);
        if supervisor.on_process_running() {
            true
        } else {
            if let Some(pool) = inner.pool.take() {
                pool.close();
            }
            false
        }
    }

    /// The worker, or the job behind it, was stopped externally.
    pub fn process_stopped(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(group_id = %self.group_id, %reason, "worker stopped externally");
        let supervisor = {
            let mut inner = self.inner();
            inner.external_error = Some(reason);
            inner.supervisor.clone()
        };
        if let Some(supervisor) = supervisor {
            supervisor.mark_terminated();
        }
    }

    pub fn is_running(&self) -> bool {
        let inner = self.inner();
        inner.external_error.is_none()
            && inner
                .supervisor
                .as_ref()
                .is_some_and(|s| s.state() == WorkerProcessState::Running)
    }

    pub fn state(&self) -> WorkerProcessState {
        self.supervisor()
            .map(|s| s.state())
            .unwrap_or(WorkerProcessState::New)
    }

    /// Last error: an external stop reason, else the supervisor's error.
    pub fn error_message(&self) -> Option<String> {
        let inner = self.inner();
        inner
            .external_error
            .clone()
            .or_else(|| inner.supervisor.as_ref().and_then(|s| s.error_message()))
    }

    fn external_error(&self) -> Option<String> {
        self.inner().external_error.clone()
    }

    pub fn address(&self) -> Option<WorkerAddress> {
        self.inner().address.clone()
    }

    pub fn web_url(&self) -> Option<String> {
        self.inner().address.as_ref().and_then(|a| a.web_url.clone())
    }

    /// Cluster job ids seen in this worker's launch output.
    pub fn jobs(&self) -> Vec<String> {
        self.inner().jobs.clone()
    }

    /// Launch output captured so far.
    pub fn launch_output(&self) -> String {
        self.supervisor()
            .map(|s| s.launch_output())
            .unwrap_or_default()
    }

    /// Run `op` on a pooled connection. The connection goes back to the pool
    /// however `op` ends.
    pub async fn dispatch<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut WorkerConnection) -> BoxFuture<'c, Result<T>>,
    {
        let pool = {
            let inner = self.inner();
            if let Some(reason) = &inner.external_error {
                return Err(Error::WorkerNotRunning(format!("{}: {}", self.group_id, reason)));
            }
            inner.pool.clone()
        };
        let pool = pool.ok_or_else(|| {
            Error::WorkerNotRunning(format!("{} has no registered address", self.group_id))
        })?;
        let mut conn = pool.checkout().await?;
        op(&mut *conn).await
    }

    /// Run `op` on a fresh connection outside the pool. Used for control
    /// messages (cancellation) that must not wait behind statements holding
    /// every pooled connection.
    pub async fn control<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut WorkerConnection) -> BoxFuture<'c, Result<T>>,
    {
        if !self.is_running() {
            return Err(Error::WorkerNotRunning(self.group_id.clone()));
        }
        let address = self
            .address()
            .ok_or_else(|| Error::WorkerNotRunning(format!("{} has no registered address", self.group_id)))?;
        let mut conn =
            WorkerConnection::connect(&address.socket_addr(), self.connection.connect_timeout).await?;
        op(&mut conn).await
    }

    /// Stop the worker: ask it to shut down if it is running, then stop the
    /// process. Shutdown errors are logged, never returned.
    pub async fn stop(&self) {
        let was_running = self.is_running();
        let (supervisor, pool) = {
            let mut inner = self.inner();
            (inner.supervisor.clone(), inner.pool.take())
        };
        let Some(supervisor) = supervisor else {
            return;
        };
        supervisor.mark_terminated();

        if let Some(pool) = &pool {
            if was_running {
                self.request_shutdown(pool).await;
            }
            pool.close();
        }
        self.teardown(&supervisor).await;
        info!(group_id = %self.group_id, "worker stopped");
    }

    async fn request_shutdown(&self, pool: &ConnectionPool) {
        let shutdown = async {
            let mut conn = pool.checkout().await?;
            conn.call(&WorkerCommand::Shutdown).await
        };
        match tokio::time::timeout(self.launch.stop_grace_period, shutdown).await {
            Ok(Ok(WorkerResponse::ShuttingDown)) => {
                debug!(group_id = %self.group_id, "worker acknowledged shutdown")
            }
            Ok(Ok(other)) => {
                warn!(group_id = %self.group_id, response = ?other, "unexpected shutdown response")
            }
            Ok(Err(e)) => warn!(group_id = %self.group_id, error = %e, "shutdown request failed"),
            Err(_) => warn!(group_id = %self.group_id, "shutdown request timed out"),
        }
    }

    async fn teardown(&self, supervisor: &ProcessSupervisor) {
        if let Some(pool) = self.inner().pool.take() {
            pool.close();
        }
        supervisor.stop().await;
        self.monitor.remove_owner(&self.self_ref);
    }
}

impl Drop for RemoteWorkerHandle {
    fn drop(&mut self) {
        self.monitor.remove_owner(&self.self_ref);
    }
}

impl std::fmt::Debug for RemoteWorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWorkerHandle")
            .field("group_id", &self.group_id)
            .field("setting_name", &self.setting_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use tokio::io::BufStream;
    use tokio::net::TcpListener;

    use super::*;
    use crate::ipc::{read_message, write_message};

    /// Answers Ping and CancelStatement; hangs up on anything else.
    async fn control_worker() -> WorkerAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut stream = BufStream::new(stream);
                    while let Ok(Some(cmd)) = read_message::<_, WorkerCommand>(&mut stream).await {
                        let reply = match cmd {
                            WorkerCommand::Ping => WorkerResponse::Pong,
                            WorkerCommand::CancelStatement { statement_id } => {
                                WorkerResponse::CancelRequested {
                                    statement_id,
                                    found: false,
                                }
                            }
                            _ => return,
                        };
                        if write_message(&mut stream, &reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        WorkerAddress {
            host: "127.0.0.1".to_string(),
            port,
            web_url: None,
        }
    }

    fn params(script: &str) -> LaunchParams {
        LaunchParams {
            runner: LaunchCommand::new("sh").arg("-c").arg(script),
            interpreter_dir: PathBuf::from("/opt/moor/interpreter/sh"),
            local_repo_dir: PathBuf::from("/opt/moor/local-repo/sh"),
            port_range: PortRange::any(),
            remote_host: None,
            remote_shell: "ssh".to_string(),
            impersonate: false,
            impersonation_exempt: vec!["anonymous".to_string()],
            one_shot: false,
            output_capture_limit: 4096,
            stop_grace_period: Duration::from_millis(300),
        }
    }

    fn conn(timeout_ms: u64) -> ConnectionParams {
        ConnectionParams {
            registration_host: "127.0.0.1".to_string(),
            registration_port: 40000,
            connect_timeout: Duration::from_millis(timeout_ms),
            pool_size: 2,
        }
    }

    fn handle(launch: LaunchParams, timeout_ms: u64) -> Arc<RemoteWorkerHandle> {
        RemoteWorkerHandle::new("sh-test", "sh", launch, conn(timeout_ms), JobMonitor::new())
    }

    fn addr() -> WorkerAddress {
        WorkerAddress {
            host: "127.0.0.1".to_string(),
            port: 1,
            web_url: None,
        }
    }

    /// Calls `process_started` once the handle has launched.
    fn register_after_launch(handle: &Arc<RemoteWorkerHandle>, address: WorkerAddress) {
        let handle = handle.clone();
        tokio::spawn(async move {
            while handle.state() != WorkerProcessState::Launched {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.process_started(address);
        });
    }

    #[test]
    fn test_command_carries_launch_flags() {
        let h = handle(params("true"), 1000);
        let cmd = h.build_command(Some("alice"));
        let args = cmd.args.join(" ");
        assert!(args.contains("--callback-host 127.0.0.1 --callback-port 40000"));
        assert!(args.contains("--port-range :"));
        assert!(args.contains("--group-id sh-test"));
        assert!(args.contains("--interpreter-dir /opt/moor/interpreter/sh"));
        assert!(args.contains("--local-repo /opt/moor/local-repo/sh"));
        assert!(args.contains("--setting-name sh"));
        assert!(!args.contains("--user"));
    }

    #[test]
    fn test_impersonation_skips_exempt_principals() {
        let h = handle(
            LaunchParams {
                impersonate: true,
                ..params("true")
            },
            1000,
        );
        assert!(h.build_command(Some("alice")).args.ends_with(&["--user".to_string(), "alice".to_string()]));
        assert!(!h.build_command(Some("anonymous")).args.contains(&"--user".to_string()));
        assert!(!h.build_command(None).args.contains(&"--user".to_string()));
    }

    #[test]
    fn test_remote_host_wraps_command() {
        let h = handle(
            LaunchParams {
                remote_host: Some("emr-worker-1".to_string()),
                ..params("true")
            },
            1000,
        );
        let cmd = h.build_command(None);
        assert_eq!(cmd.program, "ssh");
        assert_eq!(cmd.args[0], "emr-worker-1");
        assert!(cmd.args[1].contains("--group-id sh-test"));
    }

    #[tokio::test]
    async fn test_start_waits_for_registration() {
        let h = handle(params("sleep 30"), 5000);
        register_after_launch(
            &h,
            WorkerAddress {
                web_url: Some("http://127.0.0.1:4040".to_string()),
                ..addr()
            },
        );

        h.start(None).await.unwrap();
        assert!(h.is_running());
        assert_eq!(h.state(), WorkerProcessState::Running);
        assert_eq!(h.web_url().as_deref(), Some("http://127.0.0.1:4040"));

        // Idempotent.
        assert!(h.process_started(addr()));

        h.stop().await;
        assert!(!h.is_running());
        assert_eq!(h.state(), WorkerProcessState::Terminated);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_registration_timeout_carries_output() {
        let h = handle(params("echo booting; sleep 30"), 500);
        let start = Instant::now();
        let err = h.start(None).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, Error::RegistrationTimeout { timeout_ms: 500, .. }));
        assert!(err.launch_output().unwrap().contains("booting"));
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(h.state(), WorkerProcessState::Failed);
    }

    #[tokio::test]
    async fn test_early_exit_is_launch_error() {
        let h = handle(params("echo 'bad interpreter dir' >&2; exit 2"), 5000);
        let err = h.start(None).await.unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
        assert!(err.to_string().contains("bad interpreter dir"));
        assert!(!h.is_running());
    }

    #[tokio::test]
    async fn test_handle_is_not_restartable() {
        let h = handle(params("exit 1"), 1000);
        assert!(h.start(None).await.is_err());
        assert!(matches!(h.start(None).await, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_process_stopped_is_immediate() {
        let h = handle(params("sleep 30"), 5000);
        register_after_launch(&h, addr());
        h.start(None).await.unwrap();

        h.process_stopped("killed");
        assert!(!h.is_running());
        assert_eq!(h.error_message().as_deref(), Some("killed"));

        h.process_stopped("killed again");
        assert_eq!(h.error_message().as_deref(), Some("killed again"));

        let err = h
            .dispatch(|c: &mut WorkerConnection| Box::pin(c.ping()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerNotRunning(_)));
        h.stop().await;
    }

    #[tokio::test]
    async fn test_dispatch_before_registration_fails() {
        let h = handle(params("true"), 1000);
        let err = h
            .dispatch(|c: &mut WorkerConnection| Box::pin(c.ping()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerNotRunning(_)));
    }

    #[tokio::test]
    async fn test_launch_output_registers_cluster_job() {
        let monitor = JobMonitor::new();
        let h = RemoteWorkerHandle::new(
            "spark-1",
            "spark",
            params("echo 'Submitted application application_1700_0007'; sleep 30"),
            conn(5000),
            monitor.clone(),
        );
        register_after_launch(&h, addr());
        h.start(None).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while monitor.owner("application_1700_0007").is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let owner = monitor.owner("application_1700_0007").unwrap();
        assert_eq!(owner.group_id(), "spark-1");
        assert_eq!(h.jobs(), vec!["application_1700_0007".to_string()]);
        drop(owner);

        assert!(monitor.report_job_stopped("application_1700_0007", "killed by user"));
        assert!(!h.is_running());
        assert!(h.error_message().unwrap().contains("killed by user"));

        h.stop().await;
        assert!(monitor.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_goes_over_control_connection() {
        let h = handle(params("sleep 30"), 5000);
        register_after_launch(&h, control_worker().await);
        h.start(None).await.unwrap();

        // Hold every pooled connection; control requests must not queue behind them.
        let pool = h.inner().pool.clone().unwrap();
        let _held: Vec<_> = futures::future::join_all((0..pool.size()).map(|_| pool.checkout()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(pool.available(), 0);

        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            h.control(|c: &mut WorkerConnection| {
                Box::pin(async move {
                    let cancel = WorkerCommand::CancelStatement {
                        statement_id: "stmt_1".to_string(),
                    };
                    c.call(&cancel).await
                })
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            reply,
            WorkerResponse::CancelRequested {
                statement_id: "stmt_1".to_string(),
                found: false,
            }
        );
        drop(_held);
        h.stop().await;

        let err = h
            .control(|c: &mut WorkerConnection| Box::pin(c.ping()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerNotRunning(_)));
    }

    #[tokio::test]
    async fn test_failed_dispatches_release_pool_slots() {
        let h = handle(params("sleep 30"), 5000);
        register_after_launch(&h, control_worker().await);
        h.start(None).await.unwrap();
        let pool = h.inner().pool.clone().unwrap();

        for _ in 0..5 {
            // The worker hangs up on Shutdown before answering.
            let err = h
                .dispatch(|c: &mut WorkerConnection| {
                    Box::pin(async move { c.call(&WorkerCommand::Shutdown).await })
                })
                .await;
            assert!(err.is_err());
        }
        assert_eq!(pool.available(), pool.size());
        assert_eq!(pool.idle_count(), 0);

        h.dispatch(|c: &mut WorkerConnection| Box::pin(c.ping()))
            .await
            .unwrap();
        assert_eq!(pool.available(), pool.size());
        assert_eq!(pool.idle_count(), 1);
        assert!(h.is_running());
        h.stop().await;
    }
}
