//! Resource handler backed by a file on disk.

use crate::stream::{FileReader, FileWriter, io_status};
use skiff_core::{Handler, Reader, Status, TransferType, Writer};
use std::path::{Path, PathBuf};

/// Serves one file as a resource.
///
/// Reads stream the file from the requested offset. Writes create the file,
/// or, when resuming, keep its first `initial_offset` bytes and continue from
/// there. Written data is synced to disk before a successful transfer is
/// reported.
#[derive(Debug)]
pub struct FileHandler {
    resource_id: u32,
    path: PathBuf,
    readable: bool,
    writable: bool,
    write_limit: Option<u64>,
    reader: Option<FileReader>,
    writer: Option<FileWriter>,
}

impl FileHandler {
    /// Serve `path` for reads and writes
    #[must_use]
    pub fn new(resource_id: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            resource_id,
            path: path.into(),
            readable: true,
            writable: true,
            write_limit: None,
            reader: None,
            writer: None,
        }
    }

    /// Serve `path` for reads only
    #[must_use]
    pub fn read_only(resource_id: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            writable: false,
            ..Self::new(resource_id, path)
        }
    }

    /// Serve `path` for writes only
    #[must_use]
    pub fn write_only(resource_id: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            readable: false,
            ..Self::new(resource_id, path)
        }
    }

    /// Bound the size of written files
    #[must_use]
    pub fn with_write_limit(mut self, limit: u64) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Path of the served file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Handler for FileHandler {
    fn resource_id(&self) -> u32 {
        self.resource_id
    }

    fn prepare(&mut self, transfer_type: TransferType, initial_offset: u64) -> Result<(), Status> {
        match transfer_type {
            TransferType::Transmit => {
                if !self.readable {
                    return Err(Status::PermissionDenied);
                }
                let mut reader = FileReader::open(&self.path).map_err(|e| io_status(&e))?;
                reader.seek(initial_offset)?;
                tracing::debug!(
                    "Serving {} from offset {}",
                    self.path.display(),
                    initial_offset
                );
                self.reader = Some(reader);
            }
            TransferType::Receive => {
                if !self.writable {
                    return Err(Status::PermissionDenied);
                }
                let writer = if initial_offset == 0 {
                    FileWriter::create(&self.path)
                } else {
                    FileWriter::resume(&self.path, initial_offset)
                }
                .map_err(|e| io_status(&e))?;
                let writer = match self.write_limit {
                    Some(limit) => writer.with_limit(limit),
                    None => writer,
                };
                tracing::debug!(
                    "Receiving into {} from offset {}",
                    self.path.display(),
                    initial_offset
                );
                self.writer = Some(writer);
            }
        }
        Ok(())
    }

    fn finalize(&mut self, transfer_type: TransferType, status: Status) -> Result<(), Status> {
        self.reader = None;
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        if transfer_type == TransferType::Receive && status.is_ok() {
            writer.sync().map_err(|e| {
                tracing::error!("Failed to sync {}: {}", self.path.display(), e);
                Status::DataLoss
            })?;
            tracing::info!("Stored {}", self.path.display());
        }
        Ok(())
    }

    fn reader(&mut self) -> Option<&mut dyn Reader> {
        self.reader.as_mut().map(|r| r as &mut dyn Reader)
    }

    fn writer(&mut self) -> Option<&mut dyn Writer> {
        self.writer.as_mut().map(|w| w as &mut dyn Writer)
    }
}
