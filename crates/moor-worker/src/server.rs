//! Worker-side networking: command listener and host registration.

use std::sync::Arc;

use anyhow::{Context, bail};
use moor_core::PortRange;
use moor_core::ipc::{
    HostEvent, HostReply, WorkerCommand, WorkerResponse, read_message, write_message,
};
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::engine::ShellEngine;

/// Bind the first free port in `range`.
pub async fn bind_in_range(host: &str, range: &PortRange) -> anyhow::Result<TcpListener> {
    let mut last_err = None;
    for port in range.candidates() {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e).with_context(|| format!("no free port on {host} in range {range}")),
        None => bail!("port range {range} is empty"),
    }
}

/// Announce this worker to the host's registration endpoint.
pub async fn register(callback: &str, event: &HostEvent) -> anyhow::Result<()> {
    let stream = TcpStream::connect(callback)
        .await
        .with_context(|| format!("cannot reach host registration endpoint {callback}"))?;
    let mut stream = BufStream::new(stream);
    write_message(&mut stream, event).await?;
    match read_message::<_, HostReply>(&mut stream).await? {
        Some(HostReply::Ack) => Ok(()),
        Some(HostReply::Rejected { reason }) => bail!("host rejected registration: {reason}"),
        None => bail!("host closed the registration connection without replying"),
    }
}

/// Accept host connections until shutdown is requested.
pub async fn serve(listener: TcpListener, engine: Arc<ShellEngine>, shutdown: Arc<Notify>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "host connected");
        let _ = stream.set_nodelay(true);
        tokio::spawn(handle_connection(stream, engine.clone(), shutdown.clone()));
    }
}

async fn handle_connection(stream: TcpStream, engine: Arc<ShellEngine>, shutdown: Arc<Notify>) {
    let mut stream = BufStream::new(stream);
    loop {
        let cmd = match read_message::<_, WorkerCommand>(&mut stream).await {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "dropping malformed command stream");
                return;
            }
        };

        let (response, exit) = match cmd {
            WorkerCommand::Ping => (WorkerResponse::Pong, false),
            WorkerCommand::RunStatement {
                statement_id,
                code,
                local_options,
            } => {
                let started = WorkerResponse::StatementStarted {
                    statement_id: statement_id.clone(),
                };
                if write_message(&mut stream, &started).await.is_err() {
                    engine.cancel(&statement_id);
                    return;
                }
                let options = local_options.into_iter().collect();
                let done = engine.run(&statement_id, &code, &options).await;
                info!(%statement_id, status = %done.status, "statement completed");
                (
                    WorkerResponse::StatementCompleted {
                        statement_id,
                        status: done.status,
                        fragments: done.fragments,
                        job_urls: done.job_urls,
                    },
                    false,
                )
            }
            WorkerCommand::CancelStatement { statement_id } => {
                let found = engine.cancel(&statement_id);
                (WorkerResponse::CancelRequested { statement_id, found }, false)
            }
            WorkerCommand::Shutdown => {
                info!("shutdown requested by host");
                (WorkerResponse::ShuttingDown, true)
            }
        };

        if let Err(e) = write_message(&mut stream, &response).await {
            debug!(error = %e, "failed to send response");
            return;
        }
        if exit {
            shutdown.notify_one();
            return;
        }
    }
}
