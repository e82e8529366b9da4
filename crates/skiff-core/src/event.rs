//! Events processed by the transfer engine.
//!
//! Every stimulus (user call, inbound chunk, handler registration) becomes one
//! [`Event`]. The engine translates the routed part of it into a
//! [`ContextEvent`] for the single context it concerns.

use crate::chunk::{Chunk, ProtocolVersion};
use crate::config::TransferConfig;
use crate::context::TransferType;
use crate::handler::SharedHandler;
use crate::sink::ChunkSink;
use crate::status::Status;
use crate::stream::{Reader, Writer};
use crossbeam_channel::Sender;
use std::fmt;

/// Callback receiving the final status of a client transfer
pub type CompletionFn = Box<dyn FnOnce(Status) + Send>;

/// Identifies one of the four outbound chunk streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    /// Chunks of client reads (client receives)
    ClientRead = 0,
    /// Chunks of client writes (client transmits)
    ClientWrite = 1,
    /// Chunks of server reads (server transmits)
    ServerRead = 2,
    /// Chunks of server writes (server receives)
    ServerWrite = 3,
}

impl StreamId {
    /// Stream carrying chunks of a transfer
    #[must_use]
    pub fn for_transfer(is_client: bool, transfer_type: TransferType) -> Self {
        match (is_client, transfer_type) {
            (true, TransferType::Receive) => Self::ClientRead,
            (true, TransferType::Transmit) => Self::ClientWrite,
            (false, TransferType::Transmit) => Self::ServerRead,
            (false, TransferType::Receive) => Self::ServerWrite,
        }
    }
}

/// Stream a client transfer moves data through
pub enum ClientStream {
    /// Destination of a read
    Read(Box<dyn Writer>),
    /// Source of a write
    Write(Box<dyn Reader>),
}

impl ClientStream {
    /// Transfer type from the client's perspective
    #[must_use]
    pub fn transfer_type(&self) -> TransferType {
        match self {
            Self::Read(_) => TransferType::Receive,
            Self::Write(_) => TransferType::Transmit,
        }
    }
}

/// Parameters of a new client transfer
pub struct ClientTransferStart {
    /// Caller-facing handle
    pub handle_id: u32,
    /// Session id proposed to the server
    pub session_id: u32,
    /// Resource to read or write
    pub resource_id: u32,
    /// Per-transfer configuration; its protocol version is the one requested
    pub config: TransferConfig,
    /// Offset to resume from
    pub initial_offset: u64,
    /// Data stream
    pub stream: ClientStream,
    /// Invoked once with the final status
    pub on_completion: CompletionFn,
}

/// Parameters of a new server transfer, taken from a peer's initial chunk
#[derive(Debug, Clone)]
pub struct ServerTransferStart {
    /// Transfer type from the server's perspective
    pub transfer_type: TransferType,
    /// Session id
    pub session_id: u32,
    /// Resource requested
    pub resource_id: u32,
    /// Version to run the transfer with
    pub protocol_version: ProtocolVersion,
    /// Server transfer configuration
    pub config: TransferConfig,
    /// Offset to resume from
    pub initial_offset: u64,
    /// The chunk that opened the transfer
    pub chunk: Chunk,
}

impl ServerTransferStart {
    /// Derive a server transfer from the chunk a client opened it with
    ///
    /// The version is the lower of the client's and `config.protocol_version`.
    /// Legacy transfers are keyed by resource id.
    #[must_use]
    pub fn from_initial_chunk(chunk: Chunk, transfer_type: TransferType, config: TransferConfig) -> Self {
        let protocol_version = chunk.protocol_version().min(config.protocol_version);
        let resource_id = chunk.resource_id().unwrap_or_else(|| chunk.session_id());
        let session_id = if protocol_version == ProtocolVersion::Legacy {
            resource_id
        } else {
            chunk.desired_session_id().unwrap_or_else(|| chunk.session_id())
        };
        Self {
            transfer_type,
            session_id,
            resource_id,
            protocol_version,
            config,
            initial_offset: chunk.initial_offset().unwrap_or(0),
            chunk,
        }
    }
}

/// An event staged for the transfer thread
pub enum Event {
    /// Start a client transfer
    NewClientTransfer(ClientTransferStart),
    /// Start a server transfer
    NewServerTransfer(ServerTransferStart),
    /// Encoded chunk received by the client
    ClientChunk(Vec<u8>),
    /// Encoded chunk received by the server
    ServerChunk(Vec<u8>),
    /// End a client transfer
    EndClientTransfer {
        /// Handle of the transfer
        handle_id: u32,
        /// Final status
        status: Status,
        /// Tell the peer, or drop the transfer silently
        send_status_chunk: bool,
    },
    /// End a server transfer
    EndServerTransfer {
        /// Session of the transfer
        session_id: u32,
        /// Final status
        status: Status,
        /// Tell the peer, or drop the transfer silently
        send_status_chunk: bool,
    },
    /// Revise the total size of a client transfer
    UpdateClientTransfer {
        /// Handle of the transfer
        handle_id: u32,
        /// New total size in bytes
        transfer_size_bytes: u64,
    },
    /// Register a handler
    AddTransferHandler(SharedHandler),
    /// Unregister the handler for a resource; `ack` fires once removed
    RemoveTransferHandler {
        /// Resource id
        resource_id: u32,
        /// Completion signal
        ack: Sender<()>,
    },
    /// Install an outbound sink
    SetStream {
        /// Which stream
        stream: StreamId,
        /// Destination
        sink: Box<dyn ChunkSink>,
    },
    /// Abort every transfer and stop
    Terminate,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewClientTransfer(start) => f
                .debug_struct("NewClientTransfer")
                .field("handle_id", &start.handle_id)
                .field("session_id", &start.session_id)
                .field("resource_id", &start.resource_id)
                .finish(),
            Self::NewServerTransfer(start) => f
                .debug_struct("NewServerTransfer")
                .field("session_id", &start.session_id)
                .field("resource_id", &start.resource_id)
                .finish(),
            Self::ClientChunk(data) => write!(f, "ClientChunk({} bytes)", data.len()),
            Self::ServerChunk(data) => write!(f, "ServerChunk({} bytes)", data.len()),
            Self::EndClientTransfer { handle_id, status, .. } => {
                write!(f, "EndClientTransfer({handle_id}, {status})")
            }
            Self::EndServerTransfer { session_id, status, .. } => {
                write!(f, "EndServerTransfer({session_id}, {status})")
            }
            Self::UpdateClientTransfer { handle_id, transfer_size_bytes } => {
                write!(f, "UpdateClientTransfer({handle_id}, {transfer_size_bytes})")
            }
            Self::AddTransferHandler(_) => f.write_str("AddTransferHandler"),
            Self::RemoveTransferHandler { resource_id, .. } => {
                write!(f, "RemoveTransferHandler({resource_id})")
            }
            Self::SetStream { stream, .. } => write!(f, "SetStream({stream:?})"),
            Self::Terminate => f.write_str("Terminate"),
        }
    }
}

/// Event delivered to a single context
pub(crate) enum ContextEvent {
    StartClient(ClientTransferStart),
    StartServer(ServerTransferStart, SharedHandler),
    Chunk(Chunk),
    Timeout,
    End { status: Status, send_status_chunk: bool },
    UpdateTransferSize(u64),
    Abort(Status),
    RetryHandshake,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_for_transfer() {
        assert_eq!(
            StreamId::for_transfer(true, TransferType::Receive),
            StreamId::ClientRead
        );
        assert_eq!(
            StreamId::for_transfer(false, TransferType::Receive),
            StreamId::ServerWrite
        );
        assert_eq!(
            StreamId::for_transfer(false, TransferType::Transmit),
            StreamId::ServerRead
        );
    }

    #[test]
    fn test_event_debug() {
        let event = Event::EndClientTransfer {
            handle_id: 4,
            status: Status::Cancelled,
            send_status_chunk: true,
        };
        assert_eq!(format!("{event:?}"), "EndClientTransfer(4, CANCELLED)");
    }
}
