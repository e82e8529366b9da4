//! Byte stream traits used by transfers, with in-memory implementations.
//!
//! Streams report failures as [`Status`] codes. A [`Reader`] signals the end of
//! its data with `Err(Status::OutOfRange)`. Seeking is optional and defaults
//! to `Err(Status::Unimplemented)`.

use crate::status::Status;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Source of bytes for a transmitting transfer
pub trait Reader: Send {
    /// Read up to `buf.len()` bytes
    ///
    /// # Errors
    ///
    /// Returns `Status::OutOfRange` once the stream is exhausted, or any other
    /// status on failure.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status>;

    /// Move the read position to `offset`
    ///
    /// # Errors
    ///
    /// Returns `Status::Unimplemented` if the stream cannot seek, or
    /// `Status::OutOfRange` if `offset` is past the end.
    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        let _ = offset;
        Err(Status::Unimplemented)
    }

    /// Total size in bytes, if known
    fn size_bytes(&self) -> Option<u64> {
        None
    }
}

/// Sink for bytes of a receiving transfer
pub trait Writer: Send {
    /// Write all of `data` at the current position
    ///
    /// # Errors
    ///
    /// Returns a status if the data cannot be stored.
    fn write(&mut self, data: &[u8]) -> Result<(), Status>;

    /// Move the write position to `offset`
    ///
    /// # Errors
    ///
    /// Returns `Status::Unimplemented` if the stream cannot seek.
    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        let _ = offset;
        Err(Status::Unimplemented)
    }

    /// Bytes that can still be written, if bounded
    fn write_limit(&self) -> Option<u64> {
        None
    }
}

impl<R: Reader + ?Sized> Reader for Box<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        (**self).read(buf)
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        (**self).seek(offset)
    }

    fn size_bytes(&self) -> Option<u64> {
        (**self).size_bytes()
    }
}

impl<W: Writer + ?Sized> Writer for Box<W> {
    fn write(&mut self, data: &[u8]) -> Result<(), Status> {
        (**self).write(data)
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        (**self).seek(offset)
    }

    fn write_limit(&self) -> Option<u64> {
        (**self).write_limit()
    }
}

/// Byte buffer shared between a writer and whoever inspects the result
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Current length
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check for an empty buffer
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<Vec<u8>> for SharedBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }
}

/// Seekable reader over an in-memory byte slice
#[derive(Debug, Clone)]
pub struct MemoryReader {
    data: Arc<[u8]>,
    position: usize,
}

impl MemoryReader {
    /// Create a reader positioned at the start of `data`
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    /// Current read position
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Reader for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        let remaining = &self.data[self.position..];
        if remaining.is_empty() {
            return Err(Status::OutOfRange);
        }
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        let offset = usize::try_from(offset).map_err(|_| Status::OutOfRange)?;
        if offset > self.data.len() {
            return Err(Status::OutOfRange);
        }
        self.position = offset;
        Ok(())
    }

    fn size_bytes(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Seekable writer into a [`SharedBuffer`], optionally bounded
#[derive(Debug, Clone)]
pub struct MemoryWriter {
    buffer: SharedBuffer,
    position: usize,
    capacity: Option<usize>,
}

impl MemoryWriter {
    /// Create an unbounded writer
    #[must_use]
    pub fn new(buffer: SharedBuffer) -> Self {
        Self {
            buffer,
            position: 0,
            capacity: None,
        }
    }

    /// Create a writer that refuses to grow past `capacity` bytes
    #[must_use]
    pub fn with_capacity_limit(buffer: SharedBuffer, capacity: usize) -> Self {
        Self {
            buffer,
            position: 0,
            capacity: Some(capacity),
        }
    }

    /// Buffer written to
    #[must_use]
    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }
}

impl Writer for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), Status> {
        let end = self.position + data.len();
        if self.capacity.is_some_and(|cap| end > cap) {
            return Err(Status::ResourceExhausted);
        }
        let mut buf = self.buffer.lock();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[self.position..end].copy_from_slice(data);
        self.position = end;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        let offset = usize::try_from(offset).map_err(|_| Status::OutOfRange)?;
        if offset > self.buffer.len() || self.capacity.is_some_and(|cap| offset > cap) {
            return Err(Status::OutOfRange);
        }
        self.position = offset;
        Ok(())
    }

    fn write_limit(&self) -> Option<u64> {
        self.capacity
            .map(|cap| cap.saturating_sub(self.position) as u64)
    }
}

/// Wrapper hiding the seek support of a reader
#[derive(Debug, Clone)]
pub struct Unseekable<R>(pub R);

impl<R: Reader> Reader for Unseekable<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        self.0.read(buf)
    }

    fn size_bytes(&self) -> Option<u64> {
        self.0.size_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_reader_exhaustion() {
        let mut reader = MemoryReader::new(vec![1u8, 2, 3, 4, 5]);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Ok(4));
        assert_eq!(reader.read(&mut buf), Ok(1));
        assert_eq!(buf[0], 5);
        assert_eq!(reader.read(&mut buf), Err(Status::OutOfRange));
        assert_eq!(reader.size_bytes(), Some(5));
    }

    #[test]
    fn test_memory_reader_seek() {
        let mut reader = MemoryReader::new(vec![0u8, 1, 2, 3]);
        reader.seek(2).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), Ok(2));
        assert_eq!(&buf[..2], &[2, 3]);
        assert_eq!(reader.seek(5), Err(Status::OutOfRange));
    }

    #[test]
    fn test_unseekable() {
        let mut reader = Unseekable(MemoryReader::new(vec![0u8; 4]));
        assert_eq!(reader.seek(0), Err(Status::Unimplemented));
        assert_eq!(reader.size_bytes(), Some(4));
    }

    #[test]
    fn test_memory_writer_overwrite_after_seek() {
        let buffer = SharedBuffer::new();
        let mut writer = MemoryWriter::new(buffer.clone());
        writer.write(b"abcdef").unwrap();
        writer.seek(2).unwrap();
        writer.write(b"XY").unwrap();
        assert_eq!(buffer.contents(), b"abXYef");
        assert_eq!(writer.write_limit(), None);
    }

    #[test]
    fn test_memory_writer_limit() {
        let buffer = SharedBuffer::new();
        let mut writer = MemoryWriter::with_capacity_limit(buffer.clone(), 4);
        assert_eq!(writer.write_limit(), Some(4));
        writer.write(b"abc").unwrap();
        assert_eq!(writer.write_limit(), Some(1));
        assert_eq!(writer.write(b"de"), Err(Status::ResourceExhausted));
        assert_eq!(buffer.len(), 3);
    }
}
