//! Transfer engine: owns every transfer context and routes events to them.
//!
//! The engine is single-threaded and never reads the clock itself; callers
//! pass the current [`Instant`] with every event and timeout sweep. The
//! [`TransferThread`](crate::TransferThread) drives one from a dedicated OS
//! thread, while tests can drive one directly to simulate time.

use crate::chunk::{Chunk, ChunkType, ProtocolVersion};
use crate::config::ThreadConfig;
use crate::context::{Context, Io, TransferState};
use crate::event::{ClientTransferStart, ContextEvent, Event, ServerTransferStart, StreamId};
use crate::handler::{self, SharedHandler};
use crate::sink::ChunkSink;
use crate::status::Status;
use std::time::Instant;

/// Number of bytes of an undecodable chunk included in logs
const LOGGED_PREFIX_LEN: usize = 32;

type Sinks = [Option<Box<dyn ChunkSink>>; 4];

/// Run one event through a context, with the sink of `stream`
fn run(
    ctx: &mut Context,
    sinks: &mut Sinks,
    stream: StreamId,
    mtu: usize,
    now: Instant,
    event: ContextEvent,
) {
    let sink: Option<&mut dyn ChunkSink> = match sinks[stream as usize].as_mut() {
        Some(sink) => Some(&mut **sink),
        None => None,
    };
    ctx.handle_event(event, &mut Io::new(now, sink, mtu));
}

/// Every client and server transfer of one endpoint
pub struct TransferEngine {
    config: ThreadConfig,
    client_contexts: Vec<Context>,
    server_contexts: Vec<Context>,
    handlers: Vec<(u32, SharedHandler)>,
    sinks: Sinks,
}

impl TransferEngine {
    /// Create an engine with the context pools sized by `config`
    #[must_use]
    pub fn new(config: ThreadConfig) -> Self {
        let client_contexts = (0..config.client_capacity).map(|_| Context::new()).collect();
        let server_contexts = (0..config.server_capacity).map(|_| Context::new()).collect();
        Self {
            config,
            client_contexts,
            server_contexts,
            handlers: Vec::new(),
            sinks: [None, None, None, None],
        }
    }

    /// Configuration the engine was built with
    #[must_use]
    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    /// Number of transfers in progress
    #[must_use]
    pub fn active_transfers(&self) -> usize {
        self.client_contexts
            .iter()
            .chain(&self.server_contexts)
            .filter(|ctx| ctx.active())
            .count()
    }

    /// State of the client transfer with `handle_id`, if one holds a slot
    #[must_use]
    pub fn client_transfer_state(&self, handle_id: u32) -> Option<TransferState> {
        self.client_contexts
            .iter()
            .find(|ctx| ctx.state() != TransferState::Inactive && ctx.handle_id() == handle_id)
            .map(Context::state)
    }

    /// State of the server transfer with `session_id`, if one holds a slot
    #[must_use]
    pub fn server_transfer_state(&self, session_id: u32) -> Option<TransferState> {
        self.server_contexts
            .iter()
            .find(|ctx| ctx.state() != TransferState::Inactive && ctx.session_id() == session_id)
            .map(Context::state)
    }

    /// Earliest pending context timeout
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.client_contexts
            .iter()
            .chain(&self.server_contexts)
            .filter_map(Context::next_timeout)
            .min()
    }

    /// Fire every context timeout due at or before `now`
    pub fn handle_timeouts(&mut self, now: Instant) {
        let mtu = self.config.mtu_bytes;
        for ctx in &mut self.client_contexts {
            if ctx.next_timeout().is_some_and(|deadline| deadline <= now) {
                let stream = StreamId::for_transfer(true, ctx.transfer_type());
                run(ctx, &mut self.sinks, stream, mtu, now, ContextEvent::Timeout);
            }
        }
        for ctx in &mut self.server_contexts {
            if ctx.next_timeout().is_some_and(|deadline| deadline <= now) {
                let stream = StreamId::for_transfer(false, ctx.transfer_type());
                run(ctx, &mut self.sinks, stream, mtu, now, ContextEvent::Timeout);
            }
        }
    }

    /// Process one event
    pub fn handle_event(&mut self, event: Event, now: Instant) {
        tracing::trace!("Transfer engine event: {:?}", event);
        match event {
            Event::NewClientTransfer(start) => self.start_client_transfer(start, now),
            Event::NewServerTransfer(start) => self.start_server_transfer(start, now),
            Event::ClientChunk(data) => self.handle_client_chunk(&data, now),
            Event::ServerChunk(data) => self.handle_server_chunk(&data, now),
            Event::EndClientTransfer {
                handle_id,
                status,
                send_status_chunk,
            } => {
                let end = ContextEvent::End {
                    status,
                    send_status_chunk,
                };
                match self.find_client_by_handle(handle_id) {
                    Some(index) => self.run_client(index, end, now),
                    None => tracing::debug!("No active client transfer with handle {}", handle_id),
                }
            }
            Event::EndServerTransfer {
                session_id,
                status,
                send_status_chunk,
            } => {
                let end = ContextEvent::End {
                    status,
                    send_status_chunk,
                };
                let index = self
                    .server_contexts
                    .iter()
                    .position(|ctx| ctx.active() && ctx.session_id() == session_id);
                match index {
                    Some(index) => self.run_server(index, end, now),
                    None => tracing::debug!("No active server transfer with session {}", session_id),
                }
            }
            Event::UpdateClientTransfer {
                handle_id,
                transfer_size_bytes,
            } => {
                if let Some(index) = self.find_client_by_handle(handle_id) {
                    self.run_client(
                        index,
                        ContextEvent::UpdateTransferSize(transfer_size_bytes),
                        now,
                    );
                }
            }
            Event::AddTransferHandler(handler) => self.add_handler(handler),
            Event::RemoveTransferHandler { resource_id, ack } => {
                self.remove_handler(resource_id, now);
                // The caller may have given up waiting.
                let _ = ack.send(());
            }
            Event::SetStream { stream, sink } => {
                tracing::debug!("Installed sink for {:?}", stream);
                self.sinks[stream as usize] = Some(sink);
            }
            Event::Terminate => self.abort_all(Status::Aborted, now),
        }
    }

    /// Abort every transfer in progress without notifying peers
    pub fn abort_all(&mut self, status: Status, now: Instant) {
        for index in 0..self.client_contexts.len() {
            if self.client_contexts[index].state() != TransferState::Inactive {
                self.run_client(index, ContextEvent::Abort(status), now);
            }
        }
        for index in 0..self.server_contexts.len() {
            if self.server_contexts[index].state() != TransferState::Inactive {
                self.run_server(index, ContextEvent::Abort(status), now);
            }
        }
    }

    fn run_client(&mut self, index: usize, event: ContextEvent, now: Instant) {
        let ctx = &mut self.client_contexts[index];
        let stream = StreamId::for_transfer(true, ctx.transfer_type());
        run(ctx, &mut self.sinks, stream, self.config.mtu_bytes, now, event);
    }

    fn run_server(&mut self, index: usize, event: ContextEvent, now: Instant) {
        let ctx = &mut self.server_contexts[index];
        let stream = StreamId::for_transfer(false, ctx.transfer_type());
        run(ctx, &mut self.sinks, stream, self.config.mtu_bytes, now, event);
    }

    fn find_client_by_handle(&self, handle_id: u32) -> Option<usize> {
        self.client_contexts
            .iter()
            .position(|ctx| ctx.active() && ctx.handle_id() == handle_id)
    }

    /// Pick a slot for a new transfer: a free one, else one that has completed
    fn free_slot(contexts: &[Context]) -> Option<usize> {
        contexts
            .iter()
            .position(|ctx| ctx.state() == TransferState::Inactive)
            .or_else(|| {
                contexts
                    .iter()
                    .position(|ctx| ctx.state() == TransferState::Completed)
            })
    }

    /// Find the context holding `session_id`, preferring one still in progress
    /// over one that has completed
    fn find_by_session(contexts: &[Context], session_id: u32) -> Option<usize> {
        contexts
            .iter()
            .position(|ctx| ctx.active() && ctx.session_id() == session_id)
            .or_else(|| {
                contexts.iter().position(|ctx| {
                    ctx.state() == TransferState::Completed && ctx.session_id() == session_id
                })
            })
    }

    fn start_client_transfer(&mut self, start: ClientTransferStart, now: Instant) {
        let index = match Self::find_by_session(&self.client_contexts, start.session_id) {
            Some(index) => {
                if self.client_contexts[index].active() {
                    tracing::info!(
                        "Client session {} restarted; aborting the transfer holding it",
                        start.session_id
                    );
                }
                self.run_client(index, ContextEvent::Abort(Status::Aborted), now);
                index
            }
            None => match Self::free_slot(&self.client_contexts) {
                Some(index) => index,
                None => {
                    tracing::warn!(
                        "No free client context for transfer of resource {}",
                        start.resource_id
                    );
                    (start.on_completion)(Status::ResourceExhausted);
                    return;
                }
            },
        };
        let stream = StreamId::for_transfer(true, start.stream.transfer_type());
        let ctx = &mut self.client_contexts[index];
        run(
            ctx,
            &mut self.sinks,
            stream,
            self.config.mtu_bytes,
            now,
            ContextEvent::StartClient(start),
        );
    }

    fn start_server_transfer(&mut self, start: ServerTransferStart, now: Instant) {
        let stream = StreamId::for_transfer(false, start.transfer_type);

        let handler = self
            .handlers
            .iter()
            .find(|(id, _)| *id == start.resource_id)
            .map(|(_, handler)| handler.clone());
        let Some(handler) = handler else {
            tracing::warn!("No handler registered for resource {}", start.resource_id);
            self.send_status(stream, start.protocol_version, start.session_id, Status::NotFound);
            return;
        };

        let existing = Self::find_by_session(&self.server_contexts, start.session_id);

        let index = match existing {
            Some(index) => {
                let ctx = &self.server_contexts[index];
                if ctx.state() == TransferState::Initiating
                    && ctx.last_chunk_sent() == ChunkType::StartAck
                {
                    tracing::debug!(
                        "Duplicate start for session {}; resending start ack",
                        start.session_id
                    );
                    self.run_server(index, ContextEvent::RetryHandshake, now);
                    return;
                }
                if ctx.active() {
                    tracing::info!("Restarting server transfer for session {}", start.session_id);
                }
                self.run_server(index, ContextEvent::Abort(Status::Aborted), now);
                index
            }
            None => match Self::free_slot(&self.server_contexts) {
                Some(index) => index,
                None => {
                    tracing::warn!(
                        "No free server context for session {} (resource {})",
                        start.session_id,
                        start.resource_id
                    );
                    self.send_status(
                        stream,
                        start.protocol_version,
                        start.session_id,
                        Status::ResourceExhausted,
                    );
                    return;
                }
            },
        };

        let ctx = &mut self.server_contexts[index];
        run(
            ctx,
            &mut self.sinks,
            stream,
            self.config.mtu_bytes,
            now,
            ContextEvent::StartServer(start, handler),
        );
    }

    fn decode(data: &[u8]) -> Option<Chunk> {
        match Chunk::decode(data) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                tracing::warn!(
                    "Dropping undecodable chunk ({} bytes, {}): {}",
                    data.len(),
                    e,
                    hex::encode(&data[..data.len().min(LOGGED_PREFIX_LEN)])
                );
                None
            }
        }
    }

    fn handle_client_chunk(&mut self, data: &[u8], now: Instant) {
        let Some(chunk) = Self::decode(data) else {
            return;
        };
        let id = chunk.session_id();

        let in_progress = self
            .client_contexts
            .iter()
            .position(|ctx| ctx.active() && ctx.session_id() == id);
        // A legacy server answers a handshake with the resource id as session id.
        let index = in_progress
            .or_else(|| {
                if !chunk.is_legacy() {
                    return None;
                }
                self.client_contexts.iter().position(|ctx| {
                    ctx.state() == TransferState::Initiating
                        && ctx.configured_protocol_version() != ProtocolVersion::Legacy
                        && ctx.resource_id() == id
                })
            })
            .or_else(|| Self::find_by_session(&self.client_contexts, id));

        match index {
            Some(index) => self.run_client(index, ContextEvent::Chunk(chunk), now),
            None => tracing::debug!(
                "Dropping {:?} chunk for unknown client session {}",
                chunk.chunk_type(),
                id
            ),
        }
    }

    fn handle_server_chunk(&mut self, data: &[u8], now: Instant) {
        let Some(chunk) = Self::decode(data) else {
            return;
        };
        let id = chunk.session_id();
        match Self::find_by_session(&self.server_contexts, id) {
            Some(index) => self.run_server(index, ContextEvent::Chunk(chunk), now),
            None => tracing::debug!(
                "Dropping {:?} chunk for unknown server session {}",
                chunk.chunk_type(),
                id
            ),
        }
    }

    fn send_status(&mut self, stream: StreamId, version: ProtocolVersion, session_id: u32, status: Status) {
        let chunk = Chunk::completion(version, session_id, status);
        match self.sinks[stream as usize].as_mut() {
            Some(sink) => {
                if let Err(e) = sink.write(&chunk.encode()) {
                    tracing::warn!("Failed to send {} for session {}: {}", status, session_id, e);
                }
            }
            None => tracing::warn!("No sink for {:?}; dropping {} status", stream, status),
        }
    }

    fn add_handler(&mut self, handler: SharedHandler) {
        let resource_id = handler::lock(&handler).resource_id();
        if let Some(slot) = self.handlers.iter_mut().find(|(id, _)| *id == resource_id) {
            tracing::warn!("Replacing handler for resource {}", resource_id);
            slot.1 = handler;
            return;
        }
        tracing::debug!("Registered handler for resource {}", resource_id);
        self.handlers.push((resource_id, handler));
    }

    fn remove_handler(&mut self, resource_id: u32, now: Instant) {
        for index in 0..self.server_contexts.len() {
            let ctx = &self.server_contexts[index];
            if ctx.active() && ctx.resource_id() == resource_id {
                self.run_server(index, ContextEvent::Abort(Status::Aborted), now);
            }
        }
        let before = self.handlers.len();
        self.handlers.retain(|(id, _)| *id != resource_id);
        if self.handlers.len() == before {
            tracing::debug!("No handler registered for resource {}", resource_id);
        } else {
            tracing::debug!("Unregistered handler for resource {}", resource_id);
        }
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("active_transfers", &self.active_transfers())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
