//! The host: registration endpoint plus the process-wide services sessions
//! share.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::config::HostConfig;
use crate::error::Result;
use crate::ipc::{RegistrationServer, WorkerRegistry};
use crate::process::LaunchCommand;
use crate::scheduler::SchedulerRegistry;
use crate::session::ExecutionSession;
use crate::worker::{
    ConnectionParams, JobMonitor, LaunchParams, RemoteWorkerHandle, find_worker_binary,
};

/// Entry point for launching workers and opening sessions on them.
pub struct Host {
    config: HostConfig,
    registry: Arc<WorkerRegistry>,
    monitor: Arc<JobMonitor>,
    schedulers: Arc<SchedulerRegistry>,
    server: RegistrationServer,
}

impl Host {
    /// Validate `config` and bind the registration endpoint.
    pub async fn start(config: HostConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(WorkerRegistry::new());
        let server = RegistrationServer::bind(
            &config.registration_host,
            config.registration_port,
            registry.clone(),
        )
        .await?;
        info!(addr = %server.local_addr(), "host started");
        Ok(Self {
            config,
            registry,
            monitor: JobMonitor::new(),
            schedulers: Arc::new(SchedulerRegistry::new()),
            server,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registration_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<JobMonitor> {
        &self.monitor
    }

    pub fn schedulers(&self) -> &Arc<SchedulerRegistry> {
        &self.schedulers
    }

    /// Start configuring a session for `interpreter`.
    pub fn session(&self, interpreter: impl Into<String>) -> SessionBuilder<'_> {
        SessionBuilder {
            host: self,
            interpreter: interpreter.into(),
            user: None,
            properties: BTreeMap::new(),
            runner: None,
        }
    }

    pub async fn shutdown(&self) {
        self.monitor.shutdown();
        self.server.shutdown().await;
        info!("host stopped");
    }
}

/// Builder for an [`ExecutionSession`]; see [`Host::session`].
pub struct SessionBuilder<'h> {
    host: &'h Host,
    interpreter: String,
    user: Option<String>,
    properties: BTreeMap<String, String>,
    runner: Option<LaunchCommand>,
}

impl SessionBuilder<'_> {
    /// The user the session runs for, used for impersonation.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Interpreter property, exported into the worker's environment.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, props: impl IntoIterator<Item = (String, String)>) -> Self {
        self.properties.extend(props);
        self
    }

    /// Launch through `runner` instead of the located `moor-worker` binary.
    pub fn runner(mut self, runner: LaunchCommand) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Create the worker handle and session. Nothing is launched until
    /// [`ExecutionSession::start`].
    pub fn build(self) -> Result<ExecutionSession> {
        let host = self.host;
        let config = &host.config;

        let runner = match self.runner {
            Some(runner) => runner,
            None => {
                let bin = find_worker_binary(config.worker_path.as_ref())?;
                LaunchCommand::new(bin.display().to_string())
            }
        }
        .envs(self.properties);

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let group_id = format!("{}-{}", self.interpreter, &suffix[..8]);

        let handle = RemoteWorkerHandle::new(
            group_id.clone(),
            self.interpreter.clone(),
            LaunchParams::from_config(config, runner)?,
            ConnectionParams::from_config(config, host.registration_addr().port()),
            host.monitor.clone(),
        );
        host.registry.register(&handle);
        let scheduler = host
            .schedulers
            .create_or_get(&group_id, config.max_concurrency);

        Ok(ExecutionSession::new(
            self.interpreter,
            self.user,
            handle,
            scheduler,
            config.poll_interval(),
        )
        .with_host_links(host.registry.clone(), host.schedulers.clone()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Error;

    fn config() -> HostConfig {
        HostConfig {
            connect_timeout_ms: 500,
            ..HostConfig::default()
        }
    }

    #[tokio::test]
    async fn test_session_registers_worker_group() {
        let host = Host::start(config()).await.unwrap();
        assert_ne!(host.registration_addr().port(), 0);

        let session = host
            .session("sh")
            .runner(LaunchCommand::new("sh").arg("-c").arg("sleep 30"))
            .property("MOOR_TEST_FLAG", "1")
            .build()
            .unwrap();

        let group_id = session.handle().group_id().to_string();
        assert!(group_id.starts_with("sh-"));
        assert!(host.registry().get(&group_id).is_some());
        assert!(host.schedulers().get(&group_id).is_some());
        assert_eq!(session.scheduler().max_concurrency(), 10);

        let cmd = session.handle().build_command(None);
        assert_eq!(cmd.env.get("MOOR_TEST_FLAG").map(String::as_str), Some("1"));
        let port = host.registration_addr().port().to_string();
        assert!(cmd.args.contains(&port));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_releases_group() {
        let host = Host::start(config()).await.unwrap();
        let session = host
            .session("sh")
            .runner(LaunchCommand::new("sh").arg("-c").arg("echo never registering; sleep 30"))
            .build()
            .unwrap();
        let group_id = session.handle().group_id().to_string();

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::RegistrationTimeout { .. }));
        assert!(err.to_string().contains("never registering"));
        assert!(host.registry().get(&group_id).is_none());
        assert!(host.schedulers().get(&group_id).is_none());
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let bad = HostConfig {
            max_concurrency: 0,
            ..HostConfig::default()
        };
        assert!(matches!(Host::start(bad).await, Err(Error::Config(_))));
    }
}
