//! # Skiff Core
//!
//! Chunked, windowed and resumable transfer of byte streams over a
//! message-oriented channel.
//!
//! This crate provides:
//! - The chunk wire codec, in current and legacy encodings
//! - The per-transfer state machine (handshake, windowing, retries, completion)
//! - A transfer engine multiplexing client and server transfers
//! - A dedicated transfer thread with a staged-event queue
//! - [`Client`] and [`TransferService`] front ends
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐          ┌────────────────────────┐
//! │        Client        │          │    TransferService     │
//! │  read / write / ...  │          │  handlers by resource  │
//! ├──────────────────────┴──────────┴────────────────────────┤
//! │                    TransferThread                         │
//! │          (one staged event, deadlines, sinks)            │
//! ├──────────────────────────────────────────────────────────┤
//! │                    TransferEngine                         │
//! │        (context pools, routing by session id)            │
//! ├──────────────────────────────────────────────────────────┤
//! │                       Context                             │
//! │   (handshake, window, retransmission, termination)       │
//! ├──────────────────────────────────────────────────────────┤
//! │                        Chunk                              │
//! │              (protobuf-compatible wire codec)            │
//! └──────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod client;
pub mod config;
mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod service;
pub mod sink;
pub mod status;
pub mod stream;
pub mod thread;
pub mod window;

pub use chunk::{Chunk, ChunkType, ProtocolVersion};
pub use client::{Client, TransferHandle, TransferOptions};
pub use config::{Config, ThreadConfig, TransferConfig, TransferParameters};
pub use context::{TransferState, TransferType};
pub use engine::TransferEngine;
pub use error::{ChunkError, ConfigError, Error, Result};
pub use event::{ClientStream, ClientTransferStart, CompletionFn, Event, ServerTransferStart, StreamId};
pub use handler::{BufferHandler, Handler, SharedHandler, shared};
pub use service::TransferService;
pub use sink::{ChannelSink, ChunkSink};
pub use status::Status;
pub use stream::{MemoryReader, MemoryWriter, Reader, SharedBuffer, Unseekable, Writer};
pub use thread::TransferThread;
pub use window::{TransmitPhase, Window, WindowAction};
