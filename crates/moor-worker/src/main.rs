//! moor worker process.
//!
//! Launched by the host with its registration address and group id. The
//! worker binds a command port, registers itself with the host, then
//! executes shell statements until told to shut down.

mod engine;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use moor_core::PortRange;
use moor_core::ipc::HostEvent;
use tokio::sync::Notify;
use tracing::info;

use crate::engine::ShellEngine;

/// Exit code after SIGTERM, as a shell would report it.
const SIGTERM_EXIT: i32 = 128 + 15;

#[derive(Parser, Debug)]
#[command(name = "moor-worker")]
#[command(about = "Shell-engine worker process for moor")]
#[command(version)]
struct Args {
    /// Host registration endpoint address
    #[arg(long)]
    callback_host: String,

    /// Host registration endpoint port
    #[arg(long)]
    callback_port: u16,

    /// Ports to listen on, as from:to (either side optional)
    #[arg(long, default_value = ":")]
    port_range: PortRange,

    /// Worker group id to register under
    #[arg(long)]
    group_id: String,

    /// Interpreter installation directory
    #[arg(long, default_value = ".")]
    interpreter_dir: PathBuf,

    /// Local dependency repository
    #[arg(long)]
    local_repo: Option<PathBuf>,

    /// Interpreter setting this worker serves
    #[arg(long)]
    setting_name: String,

    /// User statements run on behalf of
    #[arg(long)]
    user: Option<String>,

    /// Address the host should use to reach this worker
    #[arg(long, env = "MOOR_WORKER_ADVERTISE_HOST", default_value = "127.0.0.1")]
    advertise_host: String,

    /// Address to bind the command port on. Defaults to the advertised
    /// address; pass 0.0.0.0 explicitly to listen on every interface.
    #[arg(long, env = "MOOR_WORKER_BIND_HOST")]
    bind_host: Option<String>,

    /// Interactive web endpoint to advertise, if any
    #[arg(long, env = "MOOR_WORKER_WEB_URL")]
    web_url: Option<String>,

    /// Shell used to run statements
    #[arg(long, env = "MOOR_WORKER_SHELL", default_value = "sh")]
    shell: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn bind_host(&self) -> &str {
        self.bind_host.as_deref().unwrap_or(&self.advertise_host)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr, which the host captures as launch output.
    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !args.interpreter_dir.is_dir() {
        bail!(
            "interpreter dir {} does not exist",
            args.interpreter_dir.display()
        );
    }
    info!(
        group_id = %args.group_id,
        setting = %args.setting_name,
        interpreter_dir = %args.interpreter_dir.display(),
        local_repo = ?args.local_repo,
        user = ?args.user,
        "moor-worker starting"
    );

    let mut engine = ShellEngine::new(&args.shell);
    if let Some(user) = &args.user {
        engine = engine.env("MOOR_USER", user);
    }
    let engine = Arc::new(engine);

    let bind_host = args.bind_host();
    let listener = server::bind_in_range(bind_host, &args.port_range).await?;
    let port = listener.local_addr()?.port();
    info!(bind_host, port, "listening for host commands");

    let shutdown = Arc::new(Notify::new());
    let serving = tokio::spawn(server::serve(listener, engine.clone(), shutdown.clone()));

    let callback = format!("{}:{}", args.callback_host, args.callback_port);
    server::register(
        &callback,
        &HostEvent::ProcessStarted {
            group_id: args.group_id.clone(),
            host: args.advertise_host.clone(),
            port,
            web_url: args.web_url.clone(),
        },
    )
    .await?;
    info!(%callback, "registered with host");

    let code = wait_for_exit(&shutdown).await?;
    engine.cancel_all();
    serving.abort();
    info!(code, "moor-worker exiting");
    std::process::exit(code);
}

/// Resolve to the process exit code: 0 on a host shutdown request,
/// 143 on SIGTERM.
async fn wait_for_exit(shutdown: &Notify) -> anyhow::Result<i32> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = shutdown.notified() => Ok(0),
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                Ok(SIGTERM_EXIT)
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = shutdown.notified() => Ok(0),
            _ = tokio::signal::ctrl_c() => Ok(SIGTERM_EXIT),
        }
    }
}
