//! Client API: start reads and writes of remote resources.

use crate::chunk::ProtocolVersion;
use crate::config::TransferConfig;
use crate::error::Result;
use crate::event::{ClientStream, ClientTransferStart, StreamId};
use crate::sink::ChunkSink;
use crate::status::Status;
use crate::stream::{Reader, Writer};
use crate::thread::TransferThread;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifies a client transfer for cancellation and updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(u32);

impl TransferHandle {
    /// Numeric handle id
    #[must_use]
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Per-transfer overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    /// Replaces the client's default configuration
    pub config: Option<TransferConfig>,
    /// Resume from this offset (requires the current protocol version)
    pub initial_offset: u64,
}

/// Starts transfers on a shared [`TransferThread`]
#[derive(Debug)]
pub struct Client {
    thread: Arc<TransferThread>,
    config: TransferConfig,
    next_handle_id: AtomicU32,
    next_session_id: AtomicU32,
}

/// Next non-zero value of a wrapping counter
fn next_id(counter: &AtomicU32) -> u32 {
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

impl Client {
    /// Create a client with the default transfer configuration
    #[must_use]
    pub fn new(thread: Arc<TransferThread>) -> Self {
        Self {
            thread,
            config: TransferConfig::default(),
            next_handle_id: AtomicU32::new(1),
            next_session_id: AtomicU32::new(1),
        }
    }

    /// Create a client with its own default transfer configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config` is invalid.
    pub fn with_config(thread: Arc<TransferThread>, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(thread)
        })
    }

    /// Default transfer configuration
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Install the sinks carrying chunks of reads and writes to the server
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn connect<R, W>(&self, read_stream: R, write_stream: W) -> Result<()>
    where
        R: ChunkSink + 'static,
        W: ChunkSink + 'static,
    {
        self.thread.set_stream(StreamId::ClientRead, read_stream)?;
        self.thread.set_stream(StreamId::ClientWrite, write_stream)
    }

    /// Read `resource_id` into `writer`
    ///
    /// `on_completion` runs on the transfer thread with the final status.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn read<W, F>(&self, resource_id: u32, writer: W, on_completion: F) -> Result<TransferHandle>
    where
        W: Writer + 'static,
        F: FnOnce(Status) + Send + 'static,
    {
        self.read_with(resource_id, writer, TransferOptions::default(), on_completion)
    }

    /// Read `resource_id` into `writer` with per-transfer options
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or the transfer thread has
    /// stopped.
    pub fn read_with<W, F>(
        &self,
        resource_id: u32,
        writer: W,
        options: TransferOptions,
        on_completion: F,
    ) -> Result<TransferHandle>
    where
        W: Writer + 'static,
        F: FnOnce(Status) + Send + 'static,
    {
        self.start(
            resource_id,
            ClientStream::Read(Box::new(writer)),
            options,
            Box::new(on_completion),
        )
    }

    /// Write the contents of `reader` to `resource_id`
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn write<R, F>(&self, resource_id: u32, reader: R, on_completion: F) -> Result<TransferHandle>
    where
        R: Reader + 'static,
        F: FnOnce(Status) + Send + 'static,
    {
        self.write_with(resource_id, reader, TransferOptions::default(), on_completion)
    }

    /// Write the contents of `reader` to `resource_id` with per-transfer options
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or the transfer thread has
    /// stopped.
    pub fn write_with<R, F>(
        &self,
        resource_id: u32,
        reader: R,
        options: TransferOptions,
        on_completion: F,
    ) -> Result<TransferHandle>
    where
        R: Reader + 'static,
        F: FnOnce(Status) + Send + 'static,
    {
        self.start(
            resource_id,
            ClientStream::Write(Box::new(reader)),
            options,
            Box::new(on_completion),
        )
    }

    fn start(
        &self,
        resource_id: u32,
        stream: ClientStream,
        options: TransferOptions,
        on_completion: crate::event::CompletionFn,
    ) -> Result<TransferHandle> {
        let config = options.config.unwrap_or(self.config);
        config.validate()?;

        let handle_id = next_id(&self.next_handle_id);
        // Legacy servers key transfers by resource id.
        let session_id = if config.protocol_version == ProtocolVersion::Legacy {
            resource_id
        } else {
            next_id(&self.next_session_id)
        };

        tracing::debug!(
            "Client {:?} of resource {} (handle {}, session {})",
            stream.transfer_type(),
            resource_id,
            handle_id,
            session_id
        );

        self.thread.start_client_transfer(ClientTransferStart {
            handle_id,
            session_id,
            resource_id,
            config,
            initial_offset: options.initial_offset,
            stream,
            on_completion,
        })?;
        Ok(TransferHandle(handle_id))
    }

    /// Cancel a transfer, notifying the server
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn cancel(&self, handle: TransferHandle) -> Result<()> {
        self.thread.cancel_client_transfer(handle.0)
    }

    /// Tell a write how many bytes its reader will produce
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn set_transfer_size(&self, handle: TransferHandle, transfer_size_bytes: u64) -> Result<()> {
        self.thread.update_client_transfer(handle.0, transfer_size_bytes)
    }

    /// Hand a chunk received from the server to the transfer thread
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer thread has stopped.
    pub fn handle_chunk(&self, data: &[u8]) -> Result<()> {
        self.thread.process_client_chunk(data)
    }
}
