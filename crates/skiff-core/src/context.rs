//! Per-transfer state machine.
//!
//! A [`Context`] drives one transfer from either end of the channel. It is
//! owned by the transfer engine and only ever touched from the transfer
//! thread, so it holds no locks of its own. Every stimulus arrives through
//! [`Context::handle_event`] together with the current time and the sink that
//! outbound chunks for this transfer go to.
//!
//! Lifecycle:
//!
//! ```text
//! Inactive -> Initiating -> Waiting <-> Transmitting
//!                              ^  \
//!                              |   Recovery
//!                              v
//!                         Terminating -> Completed -> Inactive
//! ```
//!
//! Legacy transfers have no start handshake and begin in `Waiting`.

use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::config::{TransferConfig, TransferParameters};
use crate::event::{ClientStream, ClientTransferStart, CompletionFn, ContextEvent, ServerTransferStart};
use crate::handler::{self, SharedHandler};
use crate::sink::ChunkSink;
use crate::status::Status;
use crate::window::{Window, WindowAction};
use std::mem;
use std::time::{Duration, Instant};

/// Direction of a transfer from one endpoint's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    /// This endpoint sends data
    Transmit,
    /// This endpoint receives data
    Receive,
}

/// State of a transfer context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Slot is free
    Inactive,
    /// Start handshake in flight
    Initiating,
    /// Awaiting the next chunk from the peer
    Waiting,
    /// Sending data chunks
    Transmitting,
    /// Receiver saw an unexpected offset and asked for a retransmission
    Recovery,
    /// Final status sent, awaiting acknowledgement
    Terminating,
    /// Transfer finished; stragglers are answered with the final chunk
    Completed,
}

/// Per-call environment of a context: the clock and the outbound channel
pub(crate) struct Io<'a> {
    now: Instant,
    sink: Option<&'a mut dyn ChunkSink>,
    mtu: usize,
}

impl<'a> Io<'a> {
    pub(crate) fn new(now: Instant, sink: Option<&'a mut dyn ChunkSink>, mtu: usize) -> Self {
        Self { now, sink, mtu }
    }

    fn send(&mut self, chunk: &Chunk) -> Result<(), Status> {
        let data = chunk.encode_with_limit(self.mtu).map_err(|e| {
            tracing::error!("Failed to encode {:?} chunk: {}", chunk.chunk_type(), e);
            Status::Internal
        })?;
        match self.sink.as_mut() {
            Some(sink) => sink.write(&data),
            None => Err(Status::Unavailable),
        }
    }
}

/// Role-specific behavior of the two context variants
pub(crate) trait EndpointHooks {
    /// Release the stream and report `status`; returns the status the
    /// transfer actually ends with
    fn final_cleanup(&mut self, transfer_type: TransferType, status: Status) -> Status;

    /// Total size of the transmitted resource, if known
    fn transfer_size_bytes(&mut self) -> Option<u64>;

    /// Move the transmit stream to `offset`
    fn seek_reader(&mut self, offset: u64) -> Result<(), Status>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status>;

    fn write(&mut self, data: &[u8]) -> Result<(), Status>;

    fn write_limit(&mut self) -> Option<u64>;
}

/// The stream side of a context
pub(crate) enum Endpoint {
    /// No stream held
    Idle,
    Client {
        on_completion: Option<CompletionFn>,
        stream: ClientStream,
        transfer_size: Option<u64>,
    },
    Server {
        handler: SharedHandler,
    },
}

impl EndpointHooks for Endpoint {
    fn final_cleanup(&mut self, transfer_type: TransferType, status: Status) -> Status {
        match self {
            Self::Idle => status,
            Self::Client { on_completion, .. } => {
                if let Some(callback) = on_completion.take() {
                    callback(status);
                }
                status
            }
            Self::Server { handler } => {
                let result = handler::lock(handler).finalize(transfer_type, status);
                match result {
                    Ok(()) => status,
                    Err(e) => {
                        tracing::warn!("Handler finalize failed: {}", e);
                        if status.is_ok() { Status::DataLoss } else { status }
                    }
                }
            }
        }
    }

    fn transfer_size_bytes(&mut self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Client {
                stream,
                transfer_size,
                ..
            } => transfer_size.or_else(|| match stream {
                ClientStream::Write(reader) => reader.size_bytes(),
                ClientStream::Read(_) => None,
            }),
            Self::Server { handler } => {
                let mut guard = handler::lock(handler);
                let size = guard.reader().and_then(|r| r.size_bytes());
                size
            }
        }
    }

    fn seek_reader(&mut self, offset: u64) -> Result<(), Status> {
        match self {
            Self::Client {
                stream: ClientStream::Write(reader),
                ..
            } => reader.seek(offset),
            Self::Server { handler } => {
                let mut guard = handler::lock(handler);
                let result = match guard.reader() {
                    Some(reader) => reader.seek(offset),
                    None => Err(Status::FailedPrecondition),
                };
                result
            }
            _ => Err(Status::FailedPrecondition),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        match self {
            Self::Client {
                stream: ClientStream::Write(reader),
                ..
            } => reader.read(buf),
            Self::Server { handler } => {
                let mut guard = handler::lock(handler);
                let result = match guard.reader() {
                    Some(reader) => reader.read(buf),
                    None => Err(Status::FailedPrecondition),
                };
                result
            }
            _ => Err(Status::FailedPrecondition),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Status> {
        match self {
            Self::Client {
                stream: ClientStream::Read(writer),
                ..
            } => writer.write(data),
            Self::Server { handler } => {
                let mut guard = handler::lock(handler);
                let result = match guard.writer() {
                    Some(writer) => writer.write(data),
                    None => Err(Status::FailedPrecondition),
                };
                result
            }
            _ => Err(Status::FailedPrecondition),
        }
    }

    fn write_limit(&mut self) -> Option<u64> {
        match self {
            Self::Client {
                stream: ClientStream::Read(writer),
                ..
            } => writer.write_limit(),
            Self::Server { handler } => {
                let mut guard = handler::lock(handler);
                let limit = guard.writer().and_then(|w| w.write_limit());
                limit
            }
            _ => None,
        }
    }
}

/// Map a reader seek failure to the status the transfer ends with
fn seek_failure_status(status: Status) -> Status {
    match status {
        Status::OutOfRange => Status::Internal,
        Status::Unimplemented => Status::Unimplemented,
        _ => Status::DataLoss,
    }
}

/// State machine of a single transfer
pub(crate) struct Context {
    session_id: u32,
    resource_id: u32,
    handle_id: u32,
    is_client: bool,
    transfer_type: TransferType,
    desired_protocol_version: ProtocolVersion,
    configured_protocol_version: ProtocolVersion,
    state: TransferState,
    endpoint: Endpoint,
    config: TransferConfig,
    params: TransferParameters,
    window: Window,
    offset: u64,
    initial_offset: u64,
    window_end_offset: u64,
    max_chunk_size_bytes: u32,
    chunk_delay: Duration,
    retries: u32,
    lifetime_retries: u32,
    next_timeout: Option<Instant>,
    last_chunk_sent: ChunkType,
    last_chunk_offset: u64,
    status: Option<Status>,
    contact_made: bool,
    final_chunk: Option<Chunk>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create an inactive context
    pub(crate) fn new() -> Self {
        let config = TransferConfig::default();
        Self {
            session_id: 0,
            resource_id: 0,
            handle_id: 0,
            is_client: false,
            transfer_type: TransferType::Transmit,
            desired_protocol_version: ProtocolVersion::LATEST,
            configured_protocol_version: ProtocolVersion::LATEST,
            state: TransferState::Inactive,
            endpoint: Endpoint::Idle,
            params: config.parameters(),
            max_chunk_size_bytes: config.max_chunk_size_bytes,
            chunk_delay: config.min_chunk_delay(),
            config,
            window: Window::new(),
            offset: 0,
            initial_offset: 0,
            window_end_offset: 0,
            retries: 0,
            lifetime_retries: 0,
            next_timeout: None,
            last_chunk_sent: ChunkType::Data,
            last_chunk_offset: 0,
            status: None,
            contact_made: false,
            final_chunk: None,
        }
    }

    pub(crate) fn session_id(&self) -> u32 {
        self.session_id
    }

    pub(crate) fn resource_id(&self) -> u32 {
        self.resource_id
    }

    pub(crate) fn handle_id(&self) -> u32 {
        self.handle_id
    }

    pub(crate) fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub(crate) fn state(&self) -> TransferState {
        self.state
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.next_timeout
    }

    pub(crate) fn last_chunk_sent(&self) -> ChunkType {
        self.last_chunk_sent
    }

    pub(crate) fn configured_protocol_version(&self) -> ProtocolVersion {
        self.configured_protocol_version
    }

    #[cfg(test)]
    pub(crate) fn window(&self) -> &Window {
        &self.window
    }

    #[cfg(test)]
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    #[cfg(test)]
    pub(crate) fn retries(&self) -> (u32, u32) {
        (self.retries, self.lifetime_retries)
    }

    /// Check whether the transfer is in progress
    pub(crate) fn active(&self) -> bool {
        matches!(
            self.state,
            TransferState::Initiating
                | TransferState::Waiting
                | TransferState::Transmitting
                | TransferState::Recovery
                | TransferState::Terminating
        )
    }

    /// Advance the state machine
    pub(crate) fn handle_event(&mut self, event: ContextEvent, io: &mut Io<'_>) {
        match event {
            ContextEvent::StartClient(start) => self.start_client(start, io),
            ContextEvent::StartServer(start, handler) => self.start_server(start, handler, io),
            ContextEvent::Chunk(chunk) => self.handle_chunk(chunk, io),
            ContextEvent::Timeout => self.handle_timeout(io),
            ContextEvent::End {
                status,
                send_status_chunk,
            } => {
                if send_status_chunk {
                    self.terminate(status, io);
                } else {
                    self.abort(status);
                }
            }
            ContextEvent::UpdateTransferSize(bytes) => {
                if let Endpoint::Client { transfer_size, .. } = &mut self.endpoint {
                    *transfer_size = Some(bytes);
                }
            }
            ContextEvent::Abort(status) => self.abort(status),
            ContextEvent::RetryHandshake => self.retry_handshake(io),
        }
    }

    fn reset(
        &mut self,
        session_id: u32,
        resource_id: u32,
        transfer_type: TransferType,
        config: TransferConfig,
        initial_offset: u64,
    ) {
        *self = Self {
            session_id,
            resource_id,
            transfer_type,
            desired_protocol_version: config.protocol_version,
            configured_protocol_version: config.protocol_version,
            params: config.parameters(),
            max_chunk_size_bytes: config.max_chunk_size_bytes.max(1),
            chunk_delay: config.min_chunk_delay(),
            config,
            offset: initial_offset,
            initial_offset,
            window_end_offset: initial_offset,
            last_chunk_offset: initial_offset,
            ..Self::new()
        };
    }

    fn set_timeout(&mut self, now: Instant, after: Duration) {
        self.next_timeout = Some(now + after);
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            tracing::debug!(
                "Transfer {} state transition: {:?} -> {:?}",
                self.session_id,
                self.state,
                state
            );
            self.state = state;
        }
    }

    fn start_client(&mut self, start: ClientTransferStart, io: &mut Io<'_>) {
        let transfer_type = start.stream.transfer_type();
        self.reset(
            start.session_id,
            start.resource_id,
            transfer_type,
            start.config,
            start.initial_offset,
        );
        self.handle_id = start.handle_id;
        self.is_client = true;
        self.endpoint = Endpoint::Client {
            on_completion: Some(start.on_completion),
            stream: start.stream,
            transfer_size: None,
        };
        self.set_state(TransferState::Initiating);
        self.set_timeout(io.now, self.config.initial_chunk_timeout());

        tracing::info!(
            "Starting {:?} transfer {} for resource {} (handle {}, {:?})",
            transfer_type,
            self.session_id,
            self.resource_id,
            self.handle_id,
            self.desired_protocol_version
        );

        let legacy = self.desired_protocol_version == ProtocolVersion::Legacy;
        if legacy && self.initial_offset != 0 {
            tracing::warn!("Transfer {}: legacy protocol cannot resume", self.session_id);
            self.terminate(Status::Unimplemented, io);
            return;
        }

        if transfer_type == TransferType::Transmit && self.initial_offset != 0 {
            if let Err(e) = self.endpoint.seek_reader(self.initial_offset) {
                self.terminate(seek_failure_status(e), io);
                return;
            }
        }

        if transfer_type == TransferType::Receive {
            self.recompute_window(WindowAction::Begin);
        }

        if legacy {
            self.configured_protocol_version = ProtocolVersion::Legacy;
            self.set_state(TransferState::Waiting);
        }
        self.send_start(io);
    }

    fn start_server(&mut self, start: ServerTransferStart, handler: SharedHandler, io: &mut Io<'_>) {
        self.reset(
            start.session_id,
            start.resource_id,
            start.transfer_type,
            TransferConfig {
                protocol_version: start.protocol_version,
                ..start.config
            },
            start.initial_offset,
        );
        self.contact_made = true;
        self.set_state(TransferState::Initiating);

        tracing::info!(
            "Starting {:?} server transfer {} for resource {} ({:?})",
            start.transfer_type,
            self.session_id,
            self.resource_id,
            start.protocol_version
        );

        let prepared = handler::lock(&handler).prepare(start.transfer_type, start.initial_offset);
        if let Err(e) = prepared {
            let status = match e {
                Status::PermissionDenied
                | Status::Unimplemented
                | Status::ResourceExhausted
                | Status::OutOfRange
                | Status::InvalidArgument
                | Status::NotFound => e,
                _ => Status::FailedPrecondition,
            };
            tracing::warn!(
                "Transfer {}: handler for resource {} failed to prepare: {}",
                self.session_id,
                self.resource_id,
                e
            );
            self.terminate(status, io);
            return;
        }
        self.endpoint = Endpoint::Server { handler };

        if start.protocol_version == ProtocolVersion::Legacy {
            self.set_state(TransferState::Waiting);
            match start.transfer_type {
                TransferType::Receive => self.update_and_send_parameters(WindowAction::Begin, io),
                TransferType::Transmit => self.handle_parameters(&start.chunk, io),
            }
            return;
        }

        self.send_start_ack(io);
    }

    fn handle_chunk(&mut self, chunk: Chunk, io: &mut Io<'_>) {
        match self.state {
            TransferState::Inactive => {
                tracing::debug!("Transfer {} inactive; dropping chunk", self.session_id);
                return;
            }
            TransferState::Completed => {
                if chunk.chunk_type() == ChunkType::CompletionAck {
                    self.set_state(TransferState::Inactive);
                } else {
                    self.resend_final_chunk(io);
                }
                return;
            }
            TransferState::Terminating => {
                self.handle_chunk_terminating(&chunk, io);
                return;
            }
            _ => {}
        }

        self.retries = 0;
        self.contact_made = true;

        if chunk.is_terminating_chunk() {
            self.handle_termination(chunk.status().unwrap_or(Status::Unknown), io);
            return;
        }

        if self.state == TransferState::Initiating {
            self.handle_initiating(chunk, io);
            return;
        }

        match self.transfer_type {
            TransferType::Transmit => self.handle_transmit_chunk(&chunk, io),
            TransferType::Receive => self.handle_receive_chunk(&chunk, io),
        }
    }

    fn handle_chunk_terminating(&mut self, chunk: &Chunk, io: &mut Io<'_>) {
        match chunk.chunk_type() {
            ChunkType::CompletionAck => {
                self.next_timeout = None;
                self.set_state(TransferState::Inactive);
            }
            ChunkType::Completion => {
                let ack = self.completion_ack();
                if let Err(e) = io.send(&ack) {
                    tracing::warn!("Transfer {}: failed to send completion ack: {}", self.session_id, e);
                }
                self.final_chunk = Some(ack);
                self.next_timeout = None;
                self.set_state(TransferState::Completed);
            }
            _ => self.resend_final_chunk(io),
        }
    }

    fn handle_initiating(&mut self, chunk: Chunk, io: &mut Io<'_>) {
        let legacy_reply = chunk.is_legacy()
            && matches!(
                chunk.chunk_type(),
                ChunkType::Data | ChunkType::ParametersRetransmit | ChunkType::ParametersContinue
            );

        if self.is_client && legacy_reply {
            tracing::info!(
                "Transfer {}: peer replied with legacy chunk; falling back to legacy session {}",
                self.session_id,
                chunk.session_id()
            );
            self.session_id = chunk.session_id();
            self.configured_protocol_version = ProtocolVersion::Legacy;
            self.set_state(TransferState::Waiting);
            match self.transfer_type {
                TransferType::Transmit => self.handle_transmit_chunk(&chunk, io),
                TransferType::Receive => self.handle_receive_chunk(&chunk, io),
            }
            return;
        }

        match (self.is_client, chunk.chunk_type()) {
            (true, ChunkType::StartAck) => {
                let offered = chunk.initial_offset().unwrap_or(0);
                if offered != self.initial_offset {
                    tracing::warn!(
                        "Transfer {}: server resumed at {} instead of {}",
                        self.session_id,
                        offered,
                        self.initial_offset
                    );
                    self.terminate(Status::Unimplemented, io);
                    return;
                }
                self.configured_protocol_version =
                    self.desired_protocol_version.min(chunk.protocol_version());
                self.set_state(TransferState::Waiting);
                if self.transfer_type == TransferType::Receive {
                    self.recompute_window(WindowAction::FirstParameters);
                }
                self.send_start_ack_confirmation(io);
            }
            (false, ChunkType::StartAckConfirmation) => {
                self.configured_protocol_version =
                    self.desired_protocol_version.min(chunk.protocol_version());
                self.set_state(TransferState::Waiting);
                match self.transfer_type {
                    TransferType::Transmit => self.handle_parameters(&chunk, io),
                    TransferType::Receive => {
                        self.update_and_send_parameters(WindowAction::FirstParameters, io);
                    }
                }
            }
            (_, other) => {
                tracing::debug!(
                    "Transfer {}: ignoring {:?} chunk during handshake",
                    self.session_id,
                    other
                );
            }
        }
    }

    fn handle_transmit_chunk(&mut self, chunk: &Chunk, io: &mut Io<'_>) {
        match chunk.chunk_type() {
            ChunkType::ParametersRetransmit
            | ChunkType::ParametersContinue
            | ChunkType::StartAckConfirmation
            | ChunkType::Start => self.handle_parameters(chunk, io),
            ChunkType::StartAck if self.is_client => self.send_start_ack_confirmation(io),
            other => {
                tracing::debug!(
                    "Transfer {}: transmitter ignoring {:?} chunk",
                    self.session_id,
                    other
                );
            }
        }
    }

    /// Apply transfer parameters from the receiver and send what they allow
    fn handle_parameters(&mut self, chunk: &Chunk, io: &mut Io<'_>) {
        let Some(window_end) = chunk.window_end_offset() else {
            tracing::warn!(
                "Transfer {}: parameters chunk without a window",
                self.session_id
            );
            self.terminate(Status::InvalidArgument, io);
            return;
        };

        let retransmit = chunk.requests_transmission_from_offset();
        if retransmit {
            if chunk.offset() != self.offset {
                tracing::debug!(
                    "Transfer {}: seeking from {} to {}",
                    self.session_id,
                    self.offset,
                    chunk.offset()
                );
                if let Err(e) = self.endpoint.seek_reader(chunk.offset()) {
                    tracing::warn!("Transfer {}: seek failed: {}", self.session_id, e);
                    self.terminate(seek_failure_status(e), io);
                    return;
                }
                self.offset = chunk.offset();
            }
        } else if window_end <= self.window_end_offset {
            tracing::debug!(
                "Transfer {}: stale window end {} (current {})",
                self.session_id,
                window_end,
                self.window_end_offset
            );
            return;
        }

        self.window_end_offset = window_end;
        if let Some(max) = chunk.max_chunk_size_bytes() {
            self.max_chunk_size_bytes = max.min(self.config.max_chunk_size_bytes).max(1);
        }
        if let Some(delay) = chunk.min_delay_microseconds() {
            self.chunk_delay = Duration::from_micros(u64::from(delay)).max(self.config.min_chunk_delay());
        }

        if self.window_end_offset <= self.offset {
            let at_end = self
                .endpoint
                .transfer_size_bytes()
                .is_some_and(|size| self.offset >= size);
            if !at_end {
                if retransmit {
                    tracing::warn!(
                        "Transfer {}: receiver offered an empty window at {}",
                        self.session_id,
                        self.offset
                    );
                    self.terminate(Status::ResourceExhausted, io);
                }
                return;
            }
        }

        self.set_state(TransferState::Transmitting);
        self.transmit_next_chunk(io);
    }

    fn transmit_next_chunk(&mut self, io: &mut Io<'_>) {
        let header = Chunk::new(self.configured_protocol_version, ChunkType::Data)
            .with_session_id(self.session_id)
            .with_offset(self.offset);
        let budget = header.max_payload_len(io.mtu);
        let window_remaining = self.window_end_offset.saturating_sub(self.offset);
        let max_len = (window_remaining.min(u64::from(self.max_chunk_size_bytes)) as usize).min(budget);

        let mut buf = vec![0u8; max_len];
        let mut end_of_stream = false;
        let len = if max_len == 0 {
            0
        } else {
            match self.endpoint.read(&mut buf) {
                Ok(0) | Err(Status::OutOfRange) => {
                    end_of_stream = true;
                    0
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Transfer {}: read failed: {}", self.session_id, e);
                    self.terminate(Status::DataLoss, io);
                    return;
                }
            }
        };
        buf.truncate(len);

        let next_offset = self.offset + len as u64;
        let size = self.endpoint.transfer_size_bytes();
        let is_final = end_of_stream || size.is_some_and(|s| next_offset >= s);

        if len == 0 && !is_final {
            self.set_state(TransferState::Waiting);
            self.set_timeout(io.now, self.config.timeout());
            return;
        }

        let mut chunk = header.with_payload(buf);
        if is_final {
            chunk = chunk.with_remaining_bytes(0);
        } else if let Some(size) = size {
            chunk = chunk.with_remaining_bytes(size - next_offset);
        }

        if let Err(e) = io.send(&chunk) {
            tracing::error!("Transfer {}: failed to send data chunk: {}", self.session_id, e);
            self.terminate(Status::Internal, io);
            return;
        }

        self.last_chunk_sent = ChunkType::Data;
        self.last_chunk_offset = self.offset;
        self.offset = next_offset;

        if is_final || self.offset >= self.window_end_offset {
            if is_final {
                tracing::debug!(
                    "Transfer {}: sent final chunk at offset {}",
                    self.session_id,
                    self.last_chunk_offset
                );
            }
            self.set_state(TransferState::Waiting);
            self.set_timeout(io.now, self.config.timeout());
        } else {
            self.set_state(TransferState::Transmitting);
            self.set_timeout(io.now, self.chunk_delay);
        }
    }

    fn handle_receive_chunk(&mut self, chunk: &Chunk, io: &mut Io<'_>) {
        match chunk.chunk_type() {
            ChunkType::Data => self.handle_receive_data(chunk, io),
            ChunkType::StartAck if self.is_client => self.send_start_ack_confirmation(io),
            ChunkType::StartAckConfirmation if !self.is_client => {
                self.send_parameters(ChunkType::ParametersRetransmit, io);
            }
            other => {
                tracing::debug!(
                    "Transfer {}: receiver ignoring {:?} chunk",
                    self.session_id,
                    other
                );
            }
        }
    }

    fn handle_receive_data(&mut self, chunk: &Chunk, io: &mut Io<'_>) {
        if self.state == TransferState::Recovery {
            if chunk.offset() != self.offset {
                if chunk.offset() == self.last_chunk_offset {
                    tracing::debug!(
                        "Transfer {}: repeated offset {}; resending parameters",
                        self.session_id,
                        chunk.offset()
                    );
                    self.update_and_send_parameters(WindowAction::Retransmit, io);
                    if !self.active() || self.state == TransferState::Terminating {
                        return;
                    }
                }
                tracing::debug!(
                    "Transfer {}: waiting for offset {}, ignoring {}",
                    self.session_id,
                    self.offset,
                    chunk.offset()
                );
                self.last_chunk_offset = chunk.offset();
                self.set_timeout(io.now, self.config.timeout());
                return;
            }
            tracing::debug!(
                "Transfer {}: received expected offset {}; leaving recovery",
                self.session_id,
                self.offset
            );
            self.set_state(TransferState::Waiting);
        }

        if chunk.offset() != self.offset {
            tracing::debug!(
                "Transfer {}: expected offset {}, got {}; requesting retransmission",
                self.session_id,
                self.offset,
                chunk.offset()
            );
            self.set_state(TransferState::Recovery);
            self.last_chunk_offset = chunk.offset();
            self.update_and_send_parameters(WindowAction::Retransmit, io);
            return;
        }

        let payload = chunk.payload();
        let end = self.offset + payload.len() as u64;
        if end > self.window_end_offset {
            tracing::error!(
                "Transfer {}: chunk ends at {} past window end {}",
                self.session_id,
                end,
                self.window_end_offset
            );
            self.terminate(Status::Internal, io);
            return;
        }

        if !payload.is_empty() {
            if let Err(e) = self.endpoint.write(payload) {
                tracing::error!("Transfer {}: write failed: {}", self.session_id, e);
                self.terminate(Status::DataLoss, io);
                return;
            }
        }
        self.offset = end;

        if chunk.remaining_bytes() == Some(0) {
            tracing::info!(
                "Transfer {}: received all {} bytes",
                self.session_id,
                self.offset - self.initial_offset
            );
            self.terminate(Status::Ok, io);
            return;
        }

        if self.offset == self.window_end_offset {
            self.update_and_send_parameters(WindowAction::Extend, io);
            return;
        }

        let remaining_window = self.window_end_offset - self.offset;
        let threshold = u64::from(self.window.size() / self.params.extend_window_divisor().max(1));
        // Legacy transmitters treat every parameters chunk as a retransmit request.
        let can_extend_early = self.configured_protocol_version != ProtocolVersion::Legacy;
        if can_extend_early && remaining_window <= threshold {
            self.update_and_send_parameters(WindowAction::Extend, io);
            return;
        }

        self.set_timeout(io.now, self.config.timeout());
    }

    fn recompute_window(&mut self, action: WindowAction) {
        let limit = self.endpoint.write_limit();
        let size = self.window.update(action, &self.params, limit);
        self.window_end_offset = self.offset + u64::from(size);
    }

    fn update_and_send_parameters(&mut self, action: WindowAction, io: &mut Io<'_>) {
        self.recompute_window(action);
        let chunk_type = match action {
            WindowAction::Extend => ChunkType::ParametersContinue,
            _ => ChunkType::ParametersRetransmit,
        };
        self.send_parameters(chunk_type, io);
    }

    fn with_parameters(&self, chunk: Chunk) -> Chunk {
        let chunk = chunk
            .with_offset(self.offset)
            .with_window_end_offset(self.window_end_offset)
            .with_max_chunk_size_bytes(self.params.max_chunk_size_bytes())
            .with_min_delay_microseconds(self.config.min_chunk_delay_us);
        if chunk.is_legacy() || chunk.chunk_type() == ChunkType::Start {
            let pending = u32::try_from(self.window_end_offset - self.offset).unwrap_or(u32::MAX);
            chunk.with_pending_bytes(pending)
        } else {
            chunk
        }
    }

    fn send_parameters(&mut self, chunk_type: ChunkType, io: &mut Io<'_>) {
        let chunk = self.with_parameters(
            Chunk::new(self.configured_protocol_version, chunk_type).with_session_id(self.session_id),
        );
        tracing::debug!(
            "Transfer {}: sending {:?} offset={} window_end={}",
            self.session_id,
            chunk_type,
            self.offset,
            self.window_end_offset
        );
        self.send_or_terminate(&chunk, self.config.timeout(), io);
    }

    fn send_start(&mut self, io: &mut Io<'_>) {
        let chunk = if self.desired_protocol_version == ProtocolVersion::Legacy {
            match self.transfer_type {
                TransferType::Transmit => {
                    Chunk::new(ProtocolVersion::Legacy, ChunkType::Start).with_session_id(self.session_id)
                }
                TransferType::Receive => self.with_parameters(
                    Chunk::new(ProtocolVersion::Legacy, ChunkType::ParametersRetransmit)
                        .with_session_id(self.session_id),
                ),
            }
        } else {
            let chunk = Chunk::new(self.desired_protocol_version, ChunkType::Start)
                .with_desired_session_id(self.session_id)
                .with_resource_id(self.resource_id)
                .with_initial_offset(self.initial_offset);
            match self.transfer_type {
                TransferType::Transmit => chunk,
                TransferType::Receive => self.with_parameters(chunk),
            }
        };
        self.send_or_terminate(&chunk, self.config.initial_chunk_timeout(), io);
    }

    fn send_start_ack(&mut self, io: &mut Io<'_>) {
        let chunk = Chunk::new(self.configured_protocol_version, ChunkType::StartAck)
            .with_session_id(self.session_id)
            .with_resource_id(self.resource_id)
            .with_initial_offset(self.initial_offset);
        self.send_or_terminate(&chunk, self.config.initial_chunk_timeout(), io);
    }

    fn send_start_ack_confirmation(&mut self, io: &mut Io<'_>) {
        let chunk = Chunk::new(self.configured_protocol_version, ChunkType::StartAckConfirmation)
            .with_session_id(self.session_id);
        let chunk = match self.transfer_type {
            TransferType::Receive => self.with_parameters(chunk),
            TransferType::Transmit => chunk,
        };
        self.send_or_terminate(&chunk, self.config.timeout(), io);
    }

    /// Send a non-data chunk that the peer must answer and wait `timeout` for it
    fn send_or_terminate(&mut self, chunk: &Chunk, timeout: Duration, io: &mut Io<'_>) {
        match io.send(chunk) {
            Ok(()) => {
                self.last_chunk_sent = chunk.chunk_type();
                self.set_timeout(io.now, timeout);
            }
            Err(e) => {
                tracing::error!(
                    "Transfer {}: failed to send {:?} chunk: {}",
                    self.session_id,
                    chunk.chunk_type(),
                    e
                );
                self.terminate(Status::Internal, io);
            }
        }
    }

    fn handle_timeout(&mut self, io: &mut Io<'_>) {
        match self.state {
            TransferState::Transmitting => self.transmit_next_chunk(io),
            TransferState::Initiating
            | TransferState::Waiting
            | TransferState::Recovery
            | TransferState::Terminating => {
                self.set_timeout(io.now, self.config.timeout());
                self.retry(io);
            }
            TransferState::Inactive | TransferState::Completed => self.next_timeout = None,
        }
    }

    fn retry(&mut self, io: &mut Io<'_>) {
        if self.retries == self.config.max_retries
            || self.lifetime_retries == self.config.max_lifetime_retries
        {
            if self.state == TransferState::Terminating {
                tracing::warn!(
                    "Transfer {}: no completion ack after {} retries; giving up",
                    self.session_id,
                    self.retries
                );
                self.next_timeout = None;
                self.set_state(TransferState::Inactive);
                return;
            }
            tracing::error!(
                "Transfer {}: peer unresponsive after {} retries ({} lifetime)",
                self.session_id,
                self.retries,
                self.lifetime_retries
            );
            self.terminate(Status::DeadlineExceeded, io);
            return;
        }

        self.retries += 1;
        self.lifetime_retries += 1;
        tracing::debug!(
            "Transfer {}: retry {}/{} in {:?}",
            self.session_id,
            self.retries,
            self.config.max_retries,
            self.state
        );

        if self.state == TransferState::Terminating {
            self.resend_final_chunk(io);
            return;
        }

        if self.state == TransferState::Initiating
            || self.last_chunk_sent == ChunkType::StartAckConfirmation
        {
            self.retry_handshake(io);
            return;
        }

        match self.transfer_type {
            TransferType::Receive => self.send_parameters(ChunkType::ParametersRetransmit, io),
            TransferType::Transmit => {
                if self.last_chunk_sent != ChunkType::Data {
                    if self.is_client {
                        self.send_start(io);
                    }
                    return;
                }
                if let Err(e) = self.endpoint.seek_reader(self.last_chunk_offset) {
                    tracing::warn!(
                        "Transfer {}: cannot rewind to {}: {}",
                        self.session_id,
                        self.last_chunk_offset,
                        e
                    );
                    self.terminate(Status::DeadlineExceeded, io);
                    return;
                }
                self.offset = self.last_chunk_offset;
                self.transmit_next_chunk(io);
            }
        }
    }

    fn retry_handshake(&mut self, io: &mut Io<'_>) {
        if self.is_client {
            if self.state == TransferState::Initiating {
                self.send_start(io);
            } else {
                self.send_start_ack_confirmation(io);
            }
        } else {
            self.send_start_ack(io);
        }
    }

    fn completion_ack(&self) -> Chunk {
        Chunk::new(self.configured_protocol_version, ChunkType::CompletionAck)
            .with_session_id(self.session_id)
    }

    fn resend_final_chunk(&mut self, io: &mut Io<'_>) {
        let chunk = match &self.final_chunk {
            Some(chunk) => chunk.clone(),
            None => Chunk::completion(
                self.configured_protocol_version,
                self.session_id,
                self.status.unwrap_or(Status::Unknown),
            ),
        };
        if let Err(e) = io.send(&chunk) {
            tracing::warn!("Transfer {}: failed to resend final chunk: {}", self.session_id, e);
        }
    }

    fn finish(&mut self, status: Status) -> Status {
        let mut endpoint = mem::replace(&mut self.endpoint, Endpoint::Idle);
        let status = endpoint.final_cleanup(self.transfer_type, status);
        if self.status.is_none() {
            self.status = Some(status);
        }
        status
    }

    /// Locally end the transfer with `status`
    fn terminate(&mut self, status: Status, io: &mut Io<'_>) {
        if !self.active() || self.state == TransferState::Terminating {
            return;
        }

        let status = self.finish(status);
        tracing::info!("Transfer {} terminating with {}", self.session_id, status);

        let skip_handshake = self.configured_protocol_version == ProtocolVersion::Legacy
            || self.state == TransferState::Initiating;
        if skip_handshake {
            self.next_timeout = None;
            self.set_state(TransferState::Completed);
        } else {
            self.retries = 0;
            self.set_timeout(io.now, self.config.timeout());
            self.set_state(TransferState::Terminating);
        }

        let chunk = Chunk::completion(self.configured_protocol_version, self.session_id, status);
        if self.contact_made {
            match io.send(&chunk) {
                Ok(()) => self.last_chunk_sent = ChunkType::Completion,
                Err(e) => tracing::warn!(
                    "Transfer {}: failed to send final status: {}",
                    self.session_id,
                    e
                ),
            }
        }
        self.final_chunk = Some(chunk);
    }

    /// The peer ended the transfer with `status`
    fn handle_termination(&mut self, status: Status, io: &mut Io<'_>) {
        let status = self.finish(status);
        tracing::info!("Transfer {} completed by peer with {}", self.session_id, status);

        let skip_handshake = self.configured_protocol_version == ProtocolVersion::Legacy
            || self.state == TransferState::Initiating;
        self.next_timeout = None;
        self.set_state(TransferState::Completed);

        if skip_handshake {
            self.final_chunk = None;
            return;
        }
        let ack = self.completion_ack();
        if let Err(e) = io.send(&ack) {
            tracing::warn!("Transfer {}: failed to send completion ack: {}", self.session_id, e);
        }
        self.final_chunk = Some(ack);
    }

    /// Drop the transfer without telling the peer
    fn abort(&mut self, status: Status) {
        if self.active() {
            tracing::info!("Transfer {} aborted with {}", self.session_id, status);
            self.finish(status);
        }
        self.next_timeout = None;
        self.set_state(TransferState::Inactive);
    }
}
