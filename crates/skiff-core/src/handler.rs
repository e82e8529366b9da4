//! Resource handlers serving server-side transfers.
//!
//! A handler is registered for one resource id and hands out the stream a
//! server transfer reads from or writes to. `prepare` is called when a
//! transfer starts and `finalize` exactly once when it ends.

use crate::context::TransferType;
use crate::status::Status;
use crate::stream::{MemoryReader, MemoryWriter, Reader, SharedBuffer, Writer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handler shared between the registry and the transfers using it
pub type SharedHandler = Arc<Mutex<dyn Handler>>;

/// Provider of the byte stream behind a resource id
pub trait Handler: Send {
    /// Resource served by this handler
    fn resource_id(&self) -> u32;

    /// Prepare a stream for a transfer of the given type (server perspective)
    /// starting at `initial_offset`
    ///
    /// # Errors
    ///
    /// Returns a status if the transfer cannot be served.
    fn prepare(&mut self, transfer_type: TransferType, initial_offset: u64) -> Result<(), Status>;

    /// Release the stream once the transfer ends with `status`
    ///
    /// # Errors
    ///
    /// Returns a status if committing the transfer failed.
    fn finalize(&mut self, transfer_type: TransferType, status: Status) -> Result<(), Status>;

    /// Stream for a transmitting transfer
    fn reader(&mut self) -> Option<&mut dyn Reader>;

    /// Stream for a receiving transfer
    fn writer(&mut self) -> Option<&mut dyn Writer>;
}

/// Wrap a handler for registration
pub fn shared<H: Handler + 'static>(handler: H) -> SharedHandler {
    Arc::new(Mutex::new(handler))
}

pub(crate) fn lock(handler: &SharedHandler) -> MutexGuard<'_, dyn Handler + 'static> {
    handler.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handler serving reads from and writes into a [`SharedBuffer`]
#[derive(Debug)]
pub struct BufferHandler {
    resource_id: u32,
    buffer: SharedBuffer,
    readable: bool,
    writable: bool,
    write_limit: Option<usize>,
    reader: Option<MemoryReader>,
    writer: Option<MemoryWriter>,
    finalize_count: usize,
    last_status: Option<Status>,
}

impl BufferHandler {
    /// Create a handler that can be read and written
    #[must_use]
    pub fn new(resource_id: u32, buffer: SharedBuffer) -> Self {
        Self {
            resource_id,
            buffer,
            readable: true,
            writable: true,
            write_limit: None,
            reader: None,
            writer: None,
            finalize_count: 0,
            last_status: None,
        }
    }

    /// Create a handler that only serves reads
    #[must_use]
    pub fn read_only(resource_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            writable: false,
            ..Self::new(resource_id, SharedBuffer::from(data.into()))
        }
    }

    /// Create a handler that only accepts writes
    #[must_use]
    pub fn write_only(resource_id: u32, buffer: SharedBuffer) -> Self {
        Self {
            readable: false,
            ..Self::new(resource_id, buffer)
        }
    }

    /// Bound the size of written data
    #[must_use]
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Buffer backing the resource
    #[must_use]
    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// Number of times `finalize` has been called
    #[must_use]
    pub fn finalize_count(&self) -> usize {
        self.finalize_count
    }

    /// Status passed to the most recent `finalize`
    #[must_use]
    pub fn last_status(&self) -> Option<Status> {
        self.last_status
    }
}

impl Handler for BufferHandler {
    fn resource_id(&self) -> u32 {
        self.resource_id
    }

    fn prepare(&mut self, transfer_type: TransferType, initial_offset: u64) -> Result<(), Status> {
        match transfer_type {
            TransferType::Transmit => {
                if !self.readable {
                    return Err(Status::PermissionDenied);
                }
                let mut reader = MemoryReader::new(self.buffer.contents());
                reader.seek(initial_offset)?;
                self.reader = Some(reader);
            }
            TransferType::Receive => {
                if !self.writable {
                    return Err(Status::PermissionDenied);
                }
                let offset = usize::try_from(initial_offset).map_err(|_| Status::OutOfRange)?;
                if offset > self.buffer.len() {
                    return Err(Status::OutOfRange);
                }
                self.buffer.lock().truncate(offset);
                let mut writer = match self.write_limit {
                    Some(limit) => MemoryWriter::with_capacity_limit(self.buffer.clone(), limit),
                    None => MemoryWriter::new(self.buffer.clone()),
                };
                writer.seek(initial_offset)?;
                self.writer = Some(writer);
            }
        }
        Ok(())
    }

    fn finalize(&mut self, transfer_type: TransferType, status: Status) -> Result<(), Status> {
        match transfer_type {
            TransferType::Transmit => self.reader = None,
            TransferType::Receive => self.writer = None,
        }
        self.finalize_count += 1;
        self.last_status = Some(status);
        Ok(())
    }

    fn reader(&mut self) -> Option<&mut dyn Reader> {
        self.reader.as_mut().map(|r| r as &mut dyn Reader)
    }

    fn writer(&mut self) -> Option<&mut dyn Writer> {
        self.writer.as_mut().map(|w| w as &mut dyn Writer)
    }
}
