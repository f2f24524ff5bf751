//! IPC protocol messages between the host and moor worker processes.
//!
//! Every message travels as a length-prefixed rkyv frame over TCP:
//! a 4-byte length (u32 LE) followed by the rkyv-encoded body.
//!
//! Two conversations use this framing:
//! - host -> worker: [`WorkerCommand`] answered by [`WorkerResponse`]
//! - worker -> host registration: [`HostEvent`] answered by [`HostReply`]

use rkyv::api::high::HighValidator;
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor::Strategy;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::session::{ResultFragment, StatementStatus};

/// Frames above this size are rejected as corrupt.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Command sent from the host to a running worker.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Liveness check.
    Ping,

    /// Start executing a statement. The worker replies with
    /// `StatementStarted` once the code is running, and later with
    /// `StatementCompleted` on the same connection.
    RunStatement {
        statement_id: String,
        code: String,
        local_options: Vec<(String, String)>,
    },

    /// Interrupt a statement. Unknown ids are remembered so a cancel that
    /// overtakes its `RunStatement` still takes effect.
    CancelStatement { statement_id: String },

    /// Exit the worker process.
    Shutdown,
}

/// Response sent from a worker to the host.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    Pong,

    StatementStarted {
        statement_id: String,
    },

    StatementCompleted {
        statement_id: String,
        status: StatementStatus,
        fragments: Vec<ResultFragment>,
        job_urls: Vec<String>,
    },

    CancelRequested {
        statement_id: String,
        /// Whether the statement was running at the time.
        found: bool,
    },

    ShuttingDown,

    /// The command could not be handled at all.
    Error {
        message: String,
    },
}

/// Lifecycle event sent by a worker to the host's registration endpoint.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum HostEvent {
    /// The worker is listening and ready for commands.
    ProcessStarted {
        group_id: String,
        host: String,
        port: u16,
        web_url: Option<String>,
    },

    /// The worker (or the cluster job behind it) is going away.
    ProcessStopped { group_id: String, reason: String },
}

impl HostEvent {
    pub fn group_id(&self) -> &str {
        match self {
            HostEvent::ProcessStarted { group_id, .. } | HostEvent::ProcessStopped { group_id, .. } => {
                group_id
            }
        }
    }
}

/// The host's answer to a [`HostEvent`].
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum HostReply {
    Ack,
    Rejected { reason: String },
}

/// Serializer strategy required by [`encode`].
pub type FrameSerializer<'a> = Strategy<
    rkyv::ser::Serializer<AlignedVec, rkyv::ser::allocator::ArenaHandle<'a>, rkyv::ser::sharing::Share>,
    rkyv::rancor::Error,
>;

/// Encode a message body (without the length prefix).
pub fn encode(message: &impl for<'a> Serialize<FrameSerializer<'a>>) -> Result<AlignedVec> {
    rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))
}

/// Decode a message body, validating it first.
///
/// Frames arrive over TCP, so every archive is checked before it is
/// deserialized. A corrupt or hostile frame is a serialization error.
pub fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rkyv::rancor::Error>>
        + Deserialize<T, Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    rkyv::from_bytes::<T, rkyv::rancor::Error>(bytes)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

/// Write one length-prefixed frame and flush.
pub async fn write_message<W>(
    writer: &mut W,
    message: &impl for<'a> Serialize<FrameSerializer<'a>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(message)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())))?;

    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rkyv::rancor::Error>>
        + Deserialize<T, Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e)));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    decode(&bytes).map(Some)
}
