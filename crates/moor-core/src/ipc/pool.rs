//! Pooled TCP connections to a running worker.
//!
//! `ConnectionPool` bounds the number of concurrent connections with a
//! semaphore. A [`PooledConnection`] guard holds one permit and returns its
//! connection to the idle list on drop, so a connection is released on
//! every exit path of a dispatch, including errors and cancellation.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

/// One framed connection to a worker.
#[derive(Debug)]
pub struct WorkerConnection {
    stream: BufStream<TcpStream>,
    peer: String,
    /// Requests sent whose response has not been read yet.
    pending: usize,
    broken: bool,
}

impl WorkerConnection {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Dispatch(format!(
                    "timed out connecting to worker at {} after {} ms",
                    addr,
                    timeout.as_millis()
                ))
            })?
            .map_err(|e| Error::Dispatch(format!("failed to connect to worker at {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        debug!(peer = addr, "connected to worker");
        Ok(Self {
            stream: BufStream::new(stream),
            peer: addr.to_string(),
            pending: 0,
            broken: false,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether this connection can be handed to another caller.
    pub fn is_reusable(&self) -> bool {
        !self.broken && self.pending == 0
    }

    pub async fn send(&mut self, cmd: &WorkerCommand) -> Result<()> {
        trace!(peer = %self.peer, ?cmd, "sending command");
        self.pending += 1;
        if let Err(e) = write_message(&mut self.stream, cmd).await {
            self.broken = true;
            return Err(e);
        }
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<WorkerResponse> {
        match read_message::<_, WorkerResponse>(&mut self.stream).await {
            Ok(Some(resp)) => {
                trace!(peer = %self.peer, ?resp, "received response");
                Ok(resp)
            }
            Ok(None) => {
                self.broken = true;
                Err(Error::Dispatch(format!("worker at {} closed the connection", self.peer)))
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Mark the most recent request as fully answered.
    ///
    /// Requests that produce several responses (e.g. `RunStatement`) call
    /// this after reading the last one.
    pub fn finish_request(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    /// Send a command and read its single response.
    pub async fn call(&mut self, cmd: &WorkerCommand) -> Result<WorkerResponse> {
        self.send(cmd).await?;
        let resp = self.recv().await?;
        self.finish_request();
        Ok(resp)
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.call(&WorkerCommand::Ping).await? {
            WorkerResponse::Pong => Ok(()),
            other => Err(Error::Ipc(format!("Unexpected response to ping: {:?}", other))),
        }
    }
}

struct PoolInner {
    addr: String,
    size: usize,
    connect_timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<WorkerConnection>>,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<WorkerConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded pool of connections to one worker address.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, size: usize, connect_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                addr: addr.into(),
                size,
                connect_timeout,
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::with_capacity(size)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Permits not currently checked out.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Borrow a connection, waiting for a free slot if all are in use.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::WorkerNotRunning("connection pool is closed".to_string()));
        }
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::WorkerNotRunning("connection pool is closed".to_string()))?;

        let reused = self.inner.idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => WorkerConnection::connect(&self.inner.addr, self.inner.connect_timeout).await?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Drop idle connections and refuse further checkouts. Connections
    /// still checked out are discarded when their guards drop.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        let dropped = std::mem::take(&mut *self.inner.idle()).len();
        debug!(addr = %self.inner.addr, dropped, "connection pool closed");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.inner.addr)
            .field("size", &self.inner.size)
            .field("available", &self.available())
            .finish()
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection {
    // Only None while dropping.
    conn: Option<WorkerConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = WorkerConnection;

    fn deref(&self) -> &WorkerConnection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut WorkerConnection {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if conn.is_reusable() && !self.pool.closed.load(Ordering::Acquire) {
            self.pool.idle().push(conn);
        } else {
            trace!(peer = %conn.peer, "discarding worker connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    /// Answers Ping with Pong; closes the connection on anything else.
    async fn fake_worker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut stream = BufStream::new(stream);
                    while let Ok(Some(cmd)) = read_message::<_, WorkerCommand>(&mut stream).await {
                        if cmd != WorkerCommand::Ping {
                            return;
                        }
                        if write_message(&mut stream, &WorkerResponse::Pong).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn dead_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let pool = ConnectionPool::new(fake_worker().await, 2, Duration::from_secs(2));
        {
            let mut conn = pool.checkout().await.unwrap();
            conn.ping().await.unwrap();
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.idle_count(), 1);

        let mut conn = pool.checkout().await.unwrap();
        conn.ping().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_operations_do_not_leak_permits() {
        let pool = ConnectionPool::new(fake_worker().await, 3, Duration::from_secs(2));
        for _ in 0..10 {
            let mut conn = pool.checkout().await.unwrap();
            // The fake worker hangs up on anything but Ping.
            let err = conn.call(&WorkerCommand::Shutdown).await;
            assert!(err.is_err());
        }
        assert_eq!(pool.available(), pool.size());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failures_do_not_leak_permits() {
        let pool = ConnectionPool::new(dead_addr().await, 2, Duration::from_secs(1));
        for _ in 0..5 {
            assert!(matches!(pool.checkout().await, Err(Error::Dispatch(_))));
        }
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_not_reused() {
        let pool = ConnectionPool::new(fake_worker().await, 1, Duration::from_secs(2));
        {
            let mut conn = pool.checkout().await.unwrap();
            conn.send(&WorkerCommand::Ping).await.unwrap();
            // Dropped with a response still unread.
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_checkout_waits_for_free_slot() {
        let pool = ConnectionPool::new(fake_worker().await, 1, Duration::from_secs(2));
        let held = pool.checkout().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(100), pool.checkout()).await;
        assert!(waiting.is_err());

        drop(held);
        let conn = tokio::time::timeout(Duration::from_secs(1), pool.checkout()).await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_checkout() {
        let pool = ConnectionPool::new(fake_worker().await, 2, Duration::from_secs(2));
        let conn = pool.checkout().await.unwrap();
        pool.close();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.checkout().await, Err(Error::WorkerNotRunning(_))));
    }
}
