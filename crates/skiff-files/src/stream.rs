//! File streams.

use skiff_core::{Reader, Status, Writer};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Map an I/O error to the status a transfer reports
#[must_use]
pub fn io_status(err: &io::Error) -> Status {
    match err.kind() {
        io::ErrorKind::NotFound => Status::NotFound,
        io::ErrorKind::PermissionDenied => Status::PermissionDenied,
        io::ErrorKind::AlreadyExists => Status::AlreadyExists,
        io::ErrorKind::UnexpectedEof => Status::OutOfRange,
        io::ErrorKind::StorageFull => Status::ResourceExhausted,
        _ => Status::DataLoss,
    }
}

/// Seekable reader over a file
#[derive(Debug)]
pub struct FileReader {
    file: File,
    size: u64,
}

impl FileReader {
    /// Open `path` for reading
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Reader for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        match self.file.read(buf) {
            Ok(0) if !buf.is_empty() => Err(Status::OutOfRange),
            Ok(n) => Ok(n),
            Err(e) => {
                tracing::warn!("File read failed: {}", e);
                Err(io_status(&e))
            }
        }
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        if offset > self.size {
            return Err(Status::OutOfRange);
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|e| io_status(&e))
    }

    fn size_bytes(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// Seekable writer into a file
#[derive(Debug)]
pub struct FileWriter {
    file: File,
    position: u64,
    limit: Option<u64>,
}

impl FileWriter {
    /// Create or truncate `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file,
            position: 0,
            limit: None,
        })
    }

    /// Open `path` to continue writing at `offset`, dropping anything after it
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, or
    /// `io::ErrorKind::UnexpectedEof` if it is shorter than `offset`.
    pub fn resume<P: AsRef<Path>>(path: P, offset: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        if file.metadata()?.len() < offset {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file is shorter than the resume offset",
            ));
        }
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            file,
            position: offset,
            limit: None,
        })
    }

    /// Refuse to grow the file past `limit` bytes
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Flush data and metadata to disk
    ///
    /// # Errors
    ///
    /// Returns an error if syncing fails.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Writer for FileWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), Status> {
        let end = self.position + data.len() as u64;
        if self.limit.is_some_and(|limit| end > limit) {
            return Err(Status::ResourceExhausted);
        }
        self.file.write_all(data).map_err(|e| {
            tracing::warn!("File write failed: {}", e);
            io_status(&e)
        })?;
        self.position = end;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| io_status(&e))?;
        self.position = offset;
        Ok(())
    }

    fn write_limit(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_reader_reads_and_seeks() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"0123456789").unwrap();
        temp.flush().unwrap();

        let mut reader = FileReader::open(temp.path()).unwrap();
        assert_eq!(reader.size_bytes(), Some(10));
        reader.seek(6).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), Ok(4));
        assert_eq!(&buf[..4], b"6789");
        assert_eq!(reader.read(&mut buf), Err(Status::OutOfRange));
        assert_eq!(reader.seek(11), Err(Status::OutOfRange));
    }

    #[test]
    fn test_file_writer_resume_truncates() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"abcdefgh").unwrap();
        temp.flush().unwrap();

        let mut writer = FileWriter::resume(temp.path(), 4).unwrap();
        writer.write(b"XY").unwrap();
        writer.sync().unwrap();
        assert_eq!(std::fs::read(temp.path()).unwrap(), b"abcdXY");

        let err = FileWriter::resume(temp.path(), 100).unwrap_err();
        assert_eq!(io_status(&err), Status::OutOfRange);
    }

    #[test]
    fn test_file_writer_limit() {
        let temp = NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(temp.path()).unwrap().with_limit(4);
        assert_eq!(writer.write_limit(), Some(4));
        writer.write(b"abc").unwrap();
        assert_eq!(writer.write_limit(), Some(1));
        assert_eq!(writer.write(b"de"), Err(Status::ResourceExhausted));
    }

    #[test]
    fn test_missing_file_status() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileReader::open(dir.path().join("missing")).unwrap_err();
        assert_eq!(io_status(&err), Status::NotFound);
    }
}
