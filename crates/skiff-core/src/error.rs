//! Error types for the skiff transfer engine.

use crate::status::Status;
use thiserror::Error;

/// Top-level errors
#[derive(Debug, Error)]
pub enum Error {
    /// Chunk encoding or decoding error
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Transfer failed with a status
    #[error("transfer failed: {0}")]
    Status(#[from] Status),

    /// The transfer thread could not be spawned
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transfer thread is no longer running
    #[error("transfer thread terminated")]
    Terminated,
}

/// Chunk-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// Input ended in the middle of a field
    #[error("chunk truncated")]
    Truncated,

    /// Varint longer than ten bytes
    #[error("varint overflow")]
    VarintOverflow,

    /// Wire type not used by the chunk encoding
    #[error("invalid wire type {wire_type} for field {field}")]
    InvalidWireType {
        /// Field number
        field: u32,
        /// Wire type found
        wire_type: u8,
    },

    /// Field number zero
    #[error("invalid field number 0")]
    InvalidFieldNumber,

    /// Value out of range for a 32-bit field
    #[error("field {0} exceeds 32 bits")]
    FieldOverflow(u32),

    /// Unknown chunk type value
    #[error("invalid chunk type: {0}")]
    InvalidChunkType(u64),

    /// Unknown protocol version value
    #[error("invalid protocol version: {0}")]
    InvalidProtocolVersion(u64),

    /// Chunk carries no session or transfer identifier
    #[error("chunk has no session identifier")]
    MissingSessionId,

    /// Terminal chunk carries a payload
    #[error("terminal chunk carries a payload")]
    UnexpectedPayload,

    /// Encoded chunk does not fit the channel MTU
    #[error("encoded chunk is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Encoded size
        size: usize,
        /// Maximum allowed
        limit: usize,
    },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// TOML parse failure
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization failure
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// I/O failure reading a config file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
