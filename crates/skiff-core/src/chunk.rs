//! Chunk encoding and decoding for the transfer wire protocol.
//!
//! Chunks use the protobuf wire format (varint and length-delimited fields
//! keyed by field number). Every optional field is tracked as "set" or "not
//! set" so that a zero offset or window is never confused with an absent one.
//!
//! Version 2 chunks always carry an explicit `type` field. Legacy chunks never
//! do; their type is inferred from the fields that are present.

use crate::error::ChunkError;
use crate::status::Status;
use serde::{Deserialize, Serialize};

/// Field numbers of the chunk message
mod field {
    pub const TRANSFER_ID: u32 = 1;
    pub const PENDING_BYTES: u32 = 2;
    pub const MAX_CHUNK_SIZE_BYTES: u32 = 3;
    pub const MIN_DELAY_MICROSECONDS: u32 = 4;
    pub const OFFSET: u32 = 5;
    pub const DATA: u32 = 6;
    pub const REMAINING_BYTES: u32 = 7;
    pub const STATUS: u32 = 8;
    pub const WINDOW_END_OFFSET: u32 = 9;
    pub const TYPE: u32 = 10;
    pub const RESOURCE_ID: u32 = 11;
    pub const SESSION_ID: u32 = 12;
    pub const PROTOCOL_VERSION: u32 = 13;
    pub const DESIRED_SESSION_ID: u32 = 14;
    pub const INITIAL_OFFSET: u32 = 15;
}

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Worst-case bytes added to a data chunk header by its payload key and
/// length prefix plus a `remaining_bytes` field.
pub const DATA_FIELD_OVERHEAD: usize = 1 + 5 + 1 + 10;

/// Transfer protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProtocolVersion {
    /// Original protocol without a handshake or completion acknowledgement
    Legacy = 1,
    /// Protocol with the start handshake and session ids
    V2 = 2,
}

impl ProtocolVersion {
    /// Newest version this implementation speaks
    pub const LATEST: Self = Self::V2;

    /// Decode a wire value. Versions newer than ours are treated as [`Self::LATEST`].
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::InvalidProtocolVersion` for 0.
    pub fn from_wire(value: u64) -> Result<Self, ChunkError> {
        match value {
            0 => Err(ChunkError::InvalidProtocolVersion(value)),
            1 => Ok(Self::Legacy),
            _ => Ok(Self::LATEST),
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

/// Chunk types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkType {
    /// Payload data
    Data = 0,
    /// Transfer initiation
    Start = 1,
    /// Transfer parameters requesting (re)transmission from an offset
    ParametersRetransmit = 2,
    /// Transfer parameters extending the current window
    ParametersContinue = 3,
    /// Terminal status
    Completion = 4,
    /// Acknowledgement of a terminal status
    CompletionAck = 5,
    /// Server response to `Start`
    StartAck = 6,
    /// Client confirmation of `StartAck`
    StartAckConfirmation = 7,
}

impl TryFrom<u64> for ChunkType {
    type Error = ChunkError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Start),
            2 => Ok(Self::ParametersRetransmit),
            3 => Ok(Self::ParametersContinue),
            4 => Ok(Self::Completion),
            5 => Ok(Self::CompletionAck),
            6 => Ok(Self::StartAck),
            7 => Ok(Self::StartAckConfirmation),
            _ => Err(ChunkError::InvalidChunkType(value)),
        }
    }
}

impl ChunkType {
    /// Terminal chunks close a transfer and never carry data or window fields
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completion | Self::CompletionAck)
    }

    /// Chunks exchanged during the start handshake
    #[must_use]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Start | Self::StartAck | Self::StartAckConfirmation)
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    protocol_version: ProtocolVersion,
    chunk_type: ChunkType,
    session_id: u32,
    desired_session_id: Option<u32>,
    resource_id: Option<u32>,
    offset: u64,
    window_end_offset: Option<u64>,
    pending_bytes: Option<u32>,
    max_chunk_size_bytes: Option<u32>,
    min_delay_microseconds: Option<u32>,
    remaining_bytes: Option<u64>,
    initial_offset: Option<u64>,
    payload: Vec<u8>,
    status: Option<Status>,
}

impl Chunk {
    /// Create an empty chunk of the given version and type
    #[must_use]
    pub fn new(protocol_version: ProtocolVersion, chunk_type: ChunkType) -> Self {
        Self {
            protocol_version,
            chunk_type,
            session_id: 0,
            desired_session_id: None,
            resource_id: None,
            offset: 0,
            window_end_offset: None,
            pending_bytes: None,
            max_chunk_size_bytes: None,
            min_delay_microseconds: None,
            remaining_bytes: None,
            initial_offset: None,
            payload: Vec::new(),
            status: None,
        }
    }

    /// Create a terminal status chunk
    #[must_use]
    pub fn completion(protocol_version: ProtocolVersion, session_id: u32, status: Status) -> Self {
        Self::new(protocol_version, ChunkType::Completion)
            .with_session_id(session_id)
            .with_status(status)
    }

    /// Set the session id
    #[must_use]
    pub fn with_session_id(mut self, id: u32) -> Self {
        self.session_id = id;
        self
    }

    /// Set the session id proposed by the initiator of a `Start`
    #[must_use]
    pub fn with_desired_session_id(mut self, id: u32) -> Self {
        self.desired_session_id = Some(id);
        self.session_id = id;
        self
    }

    /// Set the resource id
    #[must_use]
    pub fn with_resource_id(mut self, id: u32) -> Self {
        self.resource_id = Some(id);
        self
    }

    /// Set the offset
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Set the end of the receive window
    #[must_use]
    pub fn with_window_end_offset(mut self, end: u64) -> Self {
        self.window_end_offset = Some(end);
        self
    }

    /// Set the legacy pending byte count
    #[must_use]
    pub fn with_pending_bytes(mut self, pending: u32) -> Self {
        self.pending_bytes = Some(pending);
        self
    }

    /// Set the maximum chunk size the receiver accepts
    #[must_use]
    pub fn with_max_chunk_size_bytes(mut self, size: u32) -> Self {
        self.max_chunk_size_bytes = Some(size);
        self
    }

    /// Set the minimum delay between data chunks
    #[must_use]
    pub fn with_min_delay_microseconds(mut self, delay: u32) -> Self {
        self.min_delay_microseconds = Some(delay);
        self
    }

    /// Set the number of bytes remaining after this chunk
    #[must_use]
    pub fn with_remaining_bytes(mut self, remaining: u64) -> Self {
        self.remaining_bytes = Some(remaining);
        self
    }

    /// Set the offset a resumed transfer starts from
    #[must_use]
    pub fn with_initial_offset(mut self, offset: u64) -> Self {
        self.initial_offset = Some(offset);
        self
    }

    /// Set the payload
    #[must_use]
    pub fn with_payload(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.payload = data.into();
        self
    }

    /// Set the terminal status
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Protocol version the chunk is encoded with
    #[must_use]
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Chunk type
    #[must_use]
    pub fn chunk_type(&self) -> ChunkType {
        self.chunk_type
    }

    /// Session id (legacy: the transfer id)
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Session id proposed in a `Start`
    #[must_use]
    pub fn desired_session_id(&self) -> Option<u32> {
        self.desired_session_id
    }

    /// Resource id
    #[must_use]
    pub fn resource_id(&self) -> Option<u32> {
        self.resource_id
    }

    /// Offset
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// End of the receive window
    #[must_use]
    pub fn window_end_offset(&self) -> Option<u64> {
        self.window_end_offset
    }

    /// Legacy pending byte count
    #[must_use]
    pub fn pending_bytes(&self) -> Option<u32> {
        self.pending_bytes
    }

    /// Maximum chunk size the receiver accepts
    #[must_use]
    pub fn max_chunk_size_bytes(&self) -> Option<u32> {
        self.max_chunk_size_bytes
    }

    /// Minimum delay between data chunks
    #[must_use]
    pub fn min_delay_microseconds(&self) -> Option<u32> {
        self.min_delay_microseconds
    }

    /// Bytes remaining after this chunk
    #[must_use]
    pub fn remaining_bytes(&self) -> Option<u64> {
        self.remaining_bytes
    }

    /// Offset a resumed transfer starts from
    #[must_use]
    pub fn initial_offset(&self) -> Option<u64> {
        self.initial_offset
    }

    /// Payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Terminal status
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Check for the legacy protocol
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.protocol_version == ProtocolVersion::Legacy
    }

    /// Check whether this chunk begins a new transfer.
    ///
    /// Legacy transfers have no `Start` handshake for reads: a parameters chunk
    /// at offset zero opens the transfer.
    #[must_use]
    pub fn is_initial_chunk(&self) -> bool {
        match self.chunk_type {
            ChunkType::Start => true,
            ChunkType::ParametersRetransmit => {
                self.is_legacy() && self.offset == 0 && self.payload.is_empty()
            }
            _ => false,
        }
    }

    /// Check for a chunk terminating the transfer
    #[must_use]
    pub fn is_terminating_chunk(&self) -> bool {
        self.chunk_type == ChunkType::Completion
    }

    /// Check for the transmitter's last data chunk
    #[must_use]
    pub fn is_final_transmit_chunk(&self) -> bool {
        self.chunk_type == ChunkType::Data && self.remaining_bytes == Some(0)
    }

    /// Check whether this parameters chunk asks the transmitter to (re)start at its offset
    #[must_use]
    pub fn requests_transmission_from_offset(&self) -> bool {
        matches!(
            self.chunk_type,
            ChunkType::ParametersRetransmit | ChunkType::StartAckConfirmation | ChunkType::Start
        )
    }

    /// Largest payload a data chunk with this header can carry within `mtu` bytes
    #[must_use]
    pub fn max_payload_len(&self, mtu: usize) -> usize {
        mtu.saturating_sub(self.encoded_len() + DATA_FIELD_OVERHEAD)
    }

    /// Encoded size in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut counter = Counter(0);
        self.write_fields(&mut counter);
        counter.0
    }

    /// Encode into a new buffer
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_fields(&mut buf);
        buf
    }

    /// Encode, failing if the result exceeds `limit` bytes
    ///
    /// # Errors
    ///
    /// Returns `ChunkError::TooLarge` if the encoding does not fit.
    pub fn encode_with_limit(&self, limit: usize) -> Result<Vec<u8>, ChunkError> {
        let size = self.encoded_len();
        if size > limit {
            return Err(ChunkError::TooLarge { size, limit });
        }
        Ok(self.encode())
    }

    fn carries_offset(&self) -> bool {
        matches!(
            self.chunk_type,
            ChunkType::Data | ChunkType::ParametersRetransmit | ChunkType::ParametersContinue
        ) || self.window_end_offset.is_some()
            || self.pending_bytes.is_some()
            || self.offset != 0
    }

    fn write_fields(&self, out: &mut impl Sink) {
        if self.is_legacy() {
            put_varint_field(out, field::TRANSFER_ID, u64::from(self.session_id));
        } else {
            put_varint_field(out, field::TYPE, self.chunk_type as u64);
            if self.chunk_type == ChunkType::Start {
                let desired = self.desired_session_id.unwrap_or(self.session_id);
                put_varint_field(out, field::DESIRED_SESSION_ID, u64::from(desired));
                // Legacy servers identify the resource by transfer id.
                if let Some(resource_id) = self.resource_id {
                    put_varint_field(out, field::TRANSFER_ID, u64::from(resource_id));
                }
            } else {
                put_varint_field(out, field::SESSION_ID, u64::from(self.session_id));
            }
            if let Some(resource_id) = self.resource_id {
                put_varint_field(out, field::RESOURCE_ID, u64::from(resource_id));
            }
            if self.chunk_type.is_handshake() {
                put_varint_field(out, field::PROTOCOL_VERSION, self.protocol_version as u64);
            }
        }

        if self.chunk_type.is_terminal() {
            if let Some(status) = self.status {
                put_varint_field(out, field::STATUS, u64::from(status.code()));
            }
            return;
        }

        if self.carries_offset() {
            put_varint_field(out, field::OFFSET, self.offset);
        }
        if let Some(pending) = self.pending_bytes {
            put_varint_field(out, field::PENDING_BYTES, u64::from(pending));
        }
        if let Some(end) = self.window_end_offset {
            put_varint_field(out, field::WINDOW_END_OFFSET, end);
        }
        if let Some(size) = self.max_chunk_size_bytes {
            put_varint_field(out, field::MAX_CHUNK_SIZE_BYTES, u64::from(size));
        }
        if let Some(delay) = self.min_delay_microseconds {
            put_varint_field(out, field::MIN_DELAY_MICROSECONDS, u64::from(delay));
        }
        if let Some(initial) = self.initial_offset {
            put_varint_field(out, field::INITIAL_OFFSET, initial);
        }
        if self.chunk_type == ChunkType::Data {
            if !self.payload.is_empty() {
                put_key(out, field::DATA, WIRE_LEN);
                put_varint(out, self.payload.len() as u64);
                out.put(&self.payload);
            }
            if let Some(remaining) = self.remaining_bytes {
                put_varint_field(out, field::REMAINING_BYTES, remaining);
            }
        }
    }

    /// Decode a chunk from raw bytes
    ///
    /// # Errors
    ///
    /// Returns a `ChunkError` if the input is not a well-formed chunk.
    pub fn decode(data: &[u8]) -> Result<Self, ChunkError> {
        let mut fields = RawFields::default();
        let mut pos = 0;

        while pos < data.len() {
            let key = read_varint(data, &mut pos)?;
            let field_number = u32::try_from(key >> 3).map_err(|_| ChunkError::InvalidFieldNumber)?;
            let wire_type = (key & 0x7) as u8;
            if field_number == 0 {
                return Err(ChunkError::InvalidFieldNumber);
            }

            if field_number == field::DATA {
                if wire_type != WIRE_LEN {
                    return Err(ChunkError::InvalidWireType { field: field_number, wire_type });
                }
                let bytes = read_len_delimited(data, &mut pos)?;
                fields.data = Some(bytes.to_vec());
                continue;
            }

            if (field::TRANSFER_ID..=field::INITIAL_OFFSET).contains(&field_number) {
                if wire_type != WIRE_VARINT {
                    return Err(ChunkError::InvalidWireType { field: field_number, wire_type });
                }
                let value = read_varint(data, &mut pos)?;
                fields.set(field_number, value);
                continue;
            }

            skip_field(data, &mut pos, field_number, wire_type)?;
        }

        fields.into_chunk()
    }
}

/// Field values as read off the wire, before interpretation
#[derive(Default)]
struct RawFields {
    transfer_id: Option<u64>,
    pending_bytes: Option<u64>,
    max_chunk_size_bytes: Option<u64>,
    min_delay_microseconds: Option<u64>,
    offset: Option<u64>,
    data: Option<Vec<u8>>,
    remaining_bytes: Option<u64>,
    status: Option<u64>,
    window_end_offset: Option<u64>,
    chunk_type: Option<u64>,
    resource_id: Option<u64>,
    session_id: Option<u64>,
    protocol_version: Option<u64>,
    desired_session_id: Option<u64>,
    initial_offset: Option<u64>,
}

impl RawFields {
    fn set(&mut self, field_number: u32, value: u64) {
        let slot = match field_number {
            field::TRANSFER_ID => &mut self.transfer_id,
            field::PENDING_BYTES => &mut self.pending_bytes,
            field::MAX_CHUNK_SIZE_BYTES => &mut self.max_chunk_size_bytes,
            field::MIN_DELAY_MICROSECONDS => &mut self.min_delay_microseconds,
            field::OFFSET => &mut self.offset,
            field::REMAINING_BYTES => &mut self.remaining_bytes,
            field::STATUS => &mut self.status,
            field::WINDOW_END_OFFSET => &mut self.window_end_offset,
            field::TYPE => &mut self.chunk_type,
            field::RESOURCE_ID => &mut self.resource_id,
            field::SESSION_ID => &mut self.session_id,
            field::PROTOCOL_VERSION => &mut self.protocol_version,
            field::DESIRED_SESSION_ID => &mut self.desired_session_id,
            field::INITIAL_OFFSET => &mut self.initial_offset,
            _ => return,
        };
        *slot = Some(value);
    }

    fn infer_legacy_type(&self) -> ChunkType {
        let has_data = self.data.as_ref().is_some_and(|d| !d.is_empty());
        if self.status.is_some() {
            ChunkType::Completion
        } else if has_data || self.remaining_bytes.is_some() {
            ChunkType::Data
        } else if self.window_end_offset.is_some() || self.pending_bytes.is_some() {
            ChunkType::ParametersRetransmit
        } else if self.offset.is_some() {
            ChunkType::Data
        } else {
            ChunkType::Start
        }
    }

    fn into_chunk(self) -> Result<Chunk, ChunkError> {
        let is_v2 = self.chunk_type.is_some()
            || self.session_id.is_some()
            || self.desired_session_id.is_some()
            || self.protocol_version.is_some();

        let protocol_version = match (is_v2, self.protocol_version) {
            (false, _) => ProtocolVersion::Legacy,
            (true, Some(v)) => ProtocolVersion::from_wire(v)?,
            (true, None) => ProtocolVersion::V2,
        };

        let chunk_type = match self.chunk_type {
            Some(t) => ChunkType::try_from(t)?,
            None => self.infer_legacy_type(),
        };

        let desired_session_id = self
            .desired_session_id
            .map(|v| to_u32(v, field::DESIRED_SESSION_ID))
            .transpose()?;
        let transfer_id = self.transfer_id.map(|v| to_u32(v, field::TRANSFER_ID)).transpose()?;

        let session_id = match (is_v2, self.session_id, desired_session_id) {
            (true, Some(id), _) => to_u32(id, field::SESSION_ID)?,
            (true, None, Some(desired)) => desired,
            (true, None, None) => transfer_id.ok_or(ChunkError::MissingSessionId)?,
            (false, _, _) => transfer_id.ok_or(ChunkError::MissingSessionId)?,
        };

        let resource_id = match self.resource_id {
            Some(id) => Some(to_u32(id, field::RESOURCE_ID)?),
            None if !is_v2 => transfer_id,
            None if chunk_type == ChunkType::Start => transfer_id,
            None => None,
        };

        let payload = self.data.unwrap_or_default();
        if chunk_type.is_terminal() && !payload.is_empty() {
            return Err(ChunkError::UnexpectedPayload);
        }

        let offset = self.offset.unwrap_or(0);
        let pending_bytes = self
            .pending_bytes
            .map(|v| to_u32(v, field::PENDING_BYTES))
            .transpose()?;
        let window_end_offset = self
            .window_end_offset
            .or_else(|| pending_bytes.map(|p| offset.saturating_add(u64::from(p))));

        Ok(Chunk {
            protocol_version,
            chunk_type,
            session_id,
            desired_session_id,
            resource_id,
            offset,
            window_end_offset,
            pending_bytes,
            max_chunk_size_bytes: self
                .max_chunk_size_bytes
                .map(|v| to_u32(v, field::MAX_CHUNK_SIZE_BYTES))
                .transpose()?,
            min_delay_microseconds: self
                .min_delay_microseconds
                .map(|v| to_u32(v, field::MIN_DELAY_MICROSECONDS))
                .transpose()?,
            remaining_bytes: self.remaining_bytes,
            initial_offset: self.initial_offset,
            payload,
            status: self
                .status
                .map(|v| to_u32(v, field::STATUS).map(Status::from_code))
                .transpose()?,
        })
    }
}

fn to_u32(value: u64, field_number: u32) -> Result<u32, ChunkError> {
    u32::try_from(value).map_err(|_| ChunkError::FieldOverflow(field_number))
}

trait Sink {
    fn put(&mut self, bytes: &[u8]);
}

impl Sink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

struct Counter(usize);

impl Sink for Counter {
    fn put(&mut self, bytes: &[u8]) {
        self.0 += bytes.len();
    }
}

fn put_varint(out: &mut impl Sink, mut value: u64) {
    let mut buf = [0u8; 10];
    let mut len = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    out.put(&buf[..len]);
}

fn put_key(out: &mut impl Sink, field_number: u32, wire_type: u8) {
    put_varint(out, (u64::from(field_number) << 3) | u64::from(wire_type));
}

fn put_varint_field(out: &mut impl Sink, field_number: u32, value: u64) {
    put_key(out, field_number, WIRE_VARINT);
    put_varint(out, value);
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, ChunkError> {
    let mut value = 0u64;
    for i in 0..10 {
        let byte = *data.get(*pos).ok_or(ChunkError::Truncated)?;
        *pos += 1;
        if i == 9 && byte > 0x01 {
            return Err(ChunkError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ChunkError::VarintOverflow)
}

fn read_len_delimited<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ChunkError> {
    let len = usize::try_from(read_varint(data, pos)?).map_err(|_| ChunkError::Truncated)?;
    let end = pos.checked_add(len).ok_or(ChunkError::Truncated)?;
    let bytes = data.get(*pos..end).ok_or(ChunkError::Truncated)?;
    *pos = end;
    Ok(bytes)
}

fn skip_field(data: &[u8], pos: &mut usize, field_number: u32, wire_type: u8) -> Result<(), ChunkError> {
    let skip = match wire_type {
        WIRE_VARINT => {
            read_varint(data, pos)?;
            return Ok(());
        }
        WIRE_LEN => {
            read_len_delimited(data, pos)?;
            return Ok(());
        }
        WIRE_FIXED64 => 8,
        WIRE_FIXED32 => 4,
        _ => return Err(ChunkError::InvalidWireType { field: field_number, wire_type }),
    };
    let end = pos.checked_add(skip).ok_or(ChunkError::Truncated)?;
    if end > data.len() {
        return Err(ChunkError::Truncated);
    }
    *pos = end;
    Ok(())
}
