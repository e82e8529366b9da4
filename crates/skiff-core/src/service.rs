//! Server side: serve registered resources to remote clients.
//!
//! Chunks arrive on two streams. The read stream carries transfers in which
//! the server transmits; the write stream carries transfers in which it
//! receives. A chunk that opens a transfer starts a new server context, every
//! other chunk is routed to the context with its session id.

use crate::chunk::{Chunk, ProtocolVersion};
use crate::config::TransferConfig;
use crate::context::TransferType;
use crate::error::Result;
use crate::event::{ServerTransferStart, StreamId};
use crate::handler::SharedHandler;
use crate::sink::ChunkSink;
use crate::status::Status;
use crate::thread::TransferThread;
use std::sync::Arc;

/// Server-side transfer service
#[derive(Debug)]
pub struct TransferService {
    thread: Arc<TransferThread>,
    config: TransferConfig,
}

impl TransferService {
    /// Create a service; `config.protocol_version` is the highest version
    /// the service negotiates
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config` is invalid.
    pub fn new(thread: Arc<TransferThread>, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { thread, config })
    }

    /// Highest protocol version this service speaks
    #[must_use]
    pub fn max_protocol_version(&self) -> ProtocolVersion {
        self.config.protocol_version
    }

    /// Install the sinks carrying chunks of reads and writes to clients
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn connect<R, W>(&self, read_stream: R, write_stream: W) -> Result<()>
    where
        R: ChunkSink + 'static,
        W: ChunkSink + 'static,
    {
        self.thread.set_stream(StreamId::ServerRead, read_stream)?;
        self.thread.set_stream(StreamId::ServerWrite, write_stream)
    }

    /// Register a resource handler
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn register_handler(&self, handler: SharedHandler) -> Result<()> {
        self.thread.add_transfer_handler(handler)
    }

    /// Unregister the handler for `resource_id`, aborting its transfers
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn unregister_handler(&self, resource_id: u32) -> Result<()> {
        self.thread.remove_transfer_handler(resource_id)
    }

    /// Handle a chunk from the read stream (the server transmits)
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk is malformed or the transfer thread has
    /// stopped.
    pub fn handle_read_chunk(&self, data: &[u8]) -> Result<()> {
        self.handle_chunk(data, TransferType::Transmit)
    }

    /// Handle a chunk from the write stream (the server receives)
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk is malformed or the transfer thread has
    /// stopped.
    pub fn handle_write_chunk(&self, data: &[u8]) -> Result<()> {
        self.handle_chunk(data, TransferType::Receive)
    }

    /// End a server transfer
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn end_transfer(&self, session_id: u32, status: Status, send_status_chunk: bool) -> Result<()> {
        self.thread.end_server_transfer(session_id, status, send_status_chunk)
    }

    fn handle_chunk(&self, data: &[u8], transfer_type: TransferType) -> Result<()> {
        let chunk = match Chunk::decode(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(
                    "Malformed chunk on {:?} stream: {} ({})",
                    transfer_type,
                    e,
                    hex::encode(&data[..data.len().min(32)])
                );
                return Err(e.into());
            }
        };

        if !chunk.is_initial_chunk() {
            return self.thread.process_server_chunk(data);
        }

        let start = self.server_start(chunk, transfer_type);
        tracing::debug!(
            "New {:?} request for resource {} (session {}, {:?})",
            transfer_type,
            start.resource_id,
            start.session_id,
            start.protocol_version
        );
        self.thread.start_server_transfer(start)
    }

    fn server_start(&self, chunk: Chunk, transfer_type: TransferType) -> ServerTransferStart {
        ServerTransferStart::from_initial_chunk(chunk, transfer_type, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;
    use crate::config::ThreadConfig;

    fn service(version: ProtocolVersion) -> TransferService {
        let thread = Arc::new(TransferThread::spawn(ThreadConfig::default()).unwrap());
        let config = TransferConfig {
            protocol_version: version,
            ..TransferConfig::default()
        };
        TransferService::new(thread, config).unwrap()
    }

    #[test]
    fn test_start_negotiates_version() {
        let service = service(ProtocolVersion::V2);
        let chunk = Chunk::new(ProtocolVersion::V2, ChunkType::Start)
            .with_desired_session_id(44)
            .with_resource_id(3)
            .with_initial_offset(12);
        let start = service.server_start(chunk, TransferType::Transmit);
        assert_eq!(start.session_id, 44);
        assert_eq!(start.resource_id, 3);
        assert_eq!(start.protocol_version, ProtocolVersion::V2);
        assert_eq!(start.initial_offset, 12);
    }

    #[test]
    fn test_legacy_service_downgrades() {
        let service = service(ProtocolVersion::Legacy);
        let chunk = Chunk::new(ProtocolVersion::V2, ChunkType::Start)
            .with_desired_session_id(44)
            .with_resource_id(3);
        let start = service.server_start(chunk, TransferType::Receive);
        assert_eq!(start.protocol_version, ProtocolVersion::Legacy);
        assert_eq!(start.session_id, 3);
    }

    #[test]
    fn test_malformed_chunk_rejected() {
        let service = service(ProtocolVersion::V2);
        assert!(matches!(
            service.handle_read_chunk(&[0x80]),
            Err(crate::Error::Chunk(_))
        ));
    }
}
