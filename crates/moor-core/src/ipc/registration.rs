//! Host-side registration endpoint.
//!
//! Workers call back to this endpoint once they listen for commands
//! (`ProcessStarted`) and again if they learn their job is going away
//! (`ProcessStopped`). Events are routed by group id to the owning
//! [`RemoteWorkerHandle`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rustc_hash::FxHashMap;
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::worker::{RemoteWorkerHandle, WorkerAddress};

use super::protocol::{HostEvent, HostReply, read_message, write_message};

/// Group id -> handle lookup for incoming worker events.
///
/// Holds weak references; a dropped handle simply stops receiving events.
#[derive(Default)]
pub struct WorkerRegistry {
    handles: Mutex<FxHashMap<String, Weak<RemoteWorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, FxHashMap<String, Weak<RemoteWorkerHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: &Arc<RemoteWorkerHandle>) {
        let group_id = handle.group_id().to_string();
        debug!(%group_id, "registering worker handle");
        self.handles().insert(group_id, Arc::downgrade(handle));
    }

    pub fn deregister(&self, group_id: &str) {
        self.handles().remove(group_id);
    }

    pub fn get(&self, group_id: &str) -> Option<Arc<RemoteWorkerHandle>> {
        let mut handles = self.handles();
        let handle = handles.get(group_id)?.upgrade();
        if handle.is_none() {
            handles.remove(group_id);
        }
        handle
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a worker event to its handle.
    pub fn route(&self, event: HostEvent) -> HostReply {
        let Some(handle) = self.get(event.group_id()) else {
            warn!(group_id = event.group_id(), "event for unknown worker group");
            return HostReply::Rejected {
                reason: format!("unknown group id: {}", event.group_id()),
            };
        };
        match event {
            HostEvent::ProcessStarted {
                host, port, web_url, ..
            } => {
                if handle.process_started(WorkerAddress { host, port, web_url }) {
                    HostReply::Ack
                } else {
                    HostReply::Rejected {
                        reason: format!("worker {} is no longer launching", handle.group_id()),
                    }
                }
            }
            HostEvent::ProcessStopped { reason, .. } => {
                handle.process_stopped(reason);
                HostReply::Ack
            }
        }
    }
}

/// TCP listener accepting [`HostEvent`]s from workers.
pub struct RegistrationServer {
    local_addr: SocketAddr,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RegistrationServer {
    /// Bind and start accepting. Port 0 picks a free port.
    pub async fn bind(host: &str, port: u16, registry: Arc<WorkerRegistry>) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            Error::Config(format!("cannot bind registration endpoint {}:{}: {}", host, port, e))
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "registration endpoint listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, registry, shutdown_rx));
        Ok(Self {
            local_addr,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Idempotent.
    pub async fn shutdown(&self) {
        let tx = self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<WorkerRegistry>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("registration endpoint shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "worker connected to registration endpoint");
                    tokio::spawn(serve_events(stream, registry.clone()));
                }
                Err(e) => warn!(error = %e, "registration accept failed"),
            },
        }
    }
}

async fn serve_events(stream: TcpStream, registry: Arc<WorkerRegistry>) {
    let mut stream = BufStream::new(stream);
    loop {
        let event = match read_message::<_, HostEvent>(&mut stream).await {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "dropping malformed registration stream");
                return;
            }
        };
        debug!(?event, "worker event");
        let reply = registry.route(event);
        if let Err(e) = write_message(&mut stream, &reply).await {
            debug!(error = %e, "failed to reply to worker event");
            return;
        }
    }
}
