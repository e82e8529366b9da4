//! Dedicated thread running a [`TransferEngine`].
//!
//! Callers stage one event at a time: a single token circulates between the
//! callers and the loop, and whoever holds it may place the next event. The
//! loop hands the token back once the event has been processed, so the staged
//! event slot is never overwritten.
//!
//! Completion callbacks and chunk sinks run on the transfer thread. They must
//! not call back into the [`TransferThread`] and wait for the result.

use crate::config::ThreadConfig;
use crate::engine::TransferEngine;
use crate::error::{Error, Result};
use crate::event::{ClientTransferStart, Event, ServerTransferStart, StreamId};
use crate::handler::SharedHandler;
use crate::sink::ChunkSink;
use crate::status::Status;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Handle to the transfer thread
pub struct TransferThread {
    events: Sender<Event>,
    tokens: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl TransferThread {
    /// Spawn the transfer thread
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the thread cannot
    /// be spawned.
    pub fn spawn(config: ThreadConfig) -> Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = bounded::<Event>(1);
        let (token_tx, token_rx) = bounded::<()>(1);
        token_tx.send(()).map_err(|_| Error::Terminated)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let engine = TransferEngine::new(config);
        let max_poll = config.max_poll_interval();
        let loop_shutdown = shutdown.clone();
        let mailbox = Mailbox {
            events: event_rx,
            token_tx,
            token_rx: token_rx.clone(),
        };
        let handle = thread::Builder::new()
            .name("skiff-transfer".into())
            .spawn(move || run_loop(engine, &mailbox, &loop_shutdown, max_poll))?;
        let thread_id = handle.thread().id();

        tracing::info!(
            "Transfer thread started (client capacity {}, server capacity {})",
            config.client_capacity,
            config.server_capacity
        );

        Ok(Self {
            events: event_tx,
            tokens: token_rx,
            shutdown,
            handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Check whether the thread has been told to stop
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn stage(&self, event: Event) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::Terminated);
        }
        self.tokens.recv().map_err(|_| Error::Terminated)?;
        self.events.send(event).map_err(|_| Error::Terminated)
    }

    /// Start a client transfer
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn start_client_transfer(&self, start: ClientTransferStart) -> Result<()> {
        self.stage(Event::NewClientTransfer(start))
    }

    /// Start a server transfer
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn start_server_transfer(&self, start: ServerTransferStart) -> Result<()> {
        self.stage(Event::NewServerTransfer(start))
    }

    /// Hand an encoded chunk received by the client to the thread
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn process_client_chunk(&self, data: &[u8]) -> Result<()> {
        self.stage(Event::ClientChunk(data.to_vec()))
    }

    /// Hand an encoded chunk received by the server to the thread
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn process_server_chunk(&self, data: &[u8]) -> Result<()> {
        self.stage(Event::ServerChunk(data.to_vec()))
    }

    /// End a client transfer with `status`
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn end_client_transfer(&self, handle_id: u32, status: Status, send_status_chunk: bool) -> Result<()> {
        self.stage(Event::EndClientTransfer {
            handle_id,
            status,
            send_status_chunk,
        })
    }

    /// End a server transfer with `status`
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn end_server_transfer(&self, session_id: u32, status: Status, send_status_chunk: bool) -> Result<()> {
        self.stage(Event::EndServerTransfer {
            session_id,
            status,
            send_status_chunk,
        })
    }

    /// Cancel a client transfer, telling the server
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn cancel_client_transfer(&self, handle_id: u32) -> Result<()> {
        self.end_client_transfer(handle_id, Status::Cancelled, true)
    }

    /// Revise the total size of a client write
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn update_client_transfer(&self, handle_id: u32, transfer_size_bytes: u64) -> Result<()> {
        self.stage(Event::UpdateClientTransfer {
            handle_id,
            transfer_size_bytes,
        })
    }

    /// Register a handler
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn add_transfer_handler(&self, handler: SharedHandler) -> Result<()> {
        self.stage(Event::AddTransferHandler(handler))
    }

    /// Unregister the handler for `resource_id`, aborting its transfers.
    ///
    /// Blocks until the thread has removed the handler, so it must not be
    /// called from the transfer thread itself.
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn remove_transfer_handler(&self, resource_id: u32) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.stage(Event::RemoveTransferHandler {
            resource_id,
            ack: ack_tx,
        })?;
        ack_rx.recv().map_err(|_| Error::Terminated)
    }

    /// Install the sink for one outbound stream
    ///
    /// # Errors
    ///
    /// Returns `Error::Terminated` if the thread has stopped.
    pub fn set_stream(&self, stream: StreamId, sink: impl ChunkSink + 'static) -> Result<()> {
        self.stage(Event::SetStream {
            stream,
            sink: Box::new(sink),
        })
    }

    /// Abort every transfer and stop the thread.
    ///
    /// Events staged before the call are processed first. Joins the thread
    /// unless called from it. Later calls do nothing.
    pub fn terminate(&self) {
        let first = !self.shutdown.swap(true, Ordering::AcqRel);
        if thread::current().id() == self.thread_id {
            // The loop notices the flag once the current event is done.
            return;
        }
        if first && self.tokens.recv().is_ok() {
            let _ = self.events.send(Event::Terminate);
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Transfer thread panicked");
            }
        }
    }
}

impl Drop for TransferThread {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for TransferThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferThread")
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

/// Loop side of the staging handoff
struct Mailbox {
    events: Receiver<Event>,
    token_tx: Sender<()>,
    token_rx: Receiver<()>,
}

impl Mailbox {
    fn release_token(&self) {
        // Only one token exists, so the slot is always free here.
        let _ = self.token_tx.try_send(());
    }
}

fn run_loop(mut engine: TransferEngine, mailbox: &Mailbox, shutdown: &AtomicBool, max_poll: Duration) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            settle(&mut engine, mailbox);
            break;
        }

        let now = Instant::now();
        engine.handle_timeouts(now);

        let wait = engine
            .next_deadline()
            .map_or(max_poll, |deadline| {
                deadline.saturating_duration_since(Instant::now()).min(max_poll)
            });

        match mailbox.events.recv_timeout(wait) {
            Ok(Event::Terminate) => break,
            Ok(event) => {
                engine.handle_event(event, Instant::now());
                mailbox.release_token();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("Transfer thread handle dropped");
                break;
            }
        }
    }

    engine.handle_event(Event::Terminate, Instant::now());
    tracing::info!("Transfer thread stopped");
}

/// Process whatever is still being staged until the loop holds the token,
/// after which nothing more can be staged
fn settle(engine: &mut TransferEngine, mailbox: &Mailbox) {
    loop {
        select! {
            recv(mailbox.token_rx) -> _ => return,
            recv(mailbox.events) -> event => match event {
                Ok(Event::Terminate) | Err(_) => return,
                Ok(event) => {
                    engine.handle_event(event, Instant::now());
                    mailbox.release_token();
                }
            },
        }
    }
}
