//! Transfer result codes.
//!
//! A [`Status`] is both the terminal result of a transfer (delivered to the
//! completion callback or carried in the final chunk) and the error type of
//! the stream and handler traits. Numeric values are fixed on the wire.

use thiserror::Error;

/// Result code of a transfer or of a stream operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum Status {
    /// Success
    #[error("OK")]
    Ok = 0,
    /// Cancelled by the caller
    #[error("CANCELLED")]
    Cancelled = 1,
    /// Unknown error
    #[error("UNKNOWN")]
    Unknown = 2,
    /// Malformed request, e.g. a parameters chunk without a window
    #[error("INVALID_ARGUMENT")]
    InvalidArgument = 3,
    /// Retry budget exhausted
    #[error("DEADLINE_EXCEEDED")]
    DeadlineExceeded = 4,
    /// No handler registered for the resource
    #[error("NOT_FOUND")]
    NotFound = 5,
    /// Resource already exists
    #[error("ALREADY_EXISTS")]
    AlreadyExists = 6,
    /// Handler denied access to the resource
    #[error("PERMISSION_DENIED")]
    PermissionDenied = 7,
    /// No free transfer slot, or an empty window while data remains
    #[error("RESOURCE_EXHAUSTED")]
    ResourceExhausted = 8,
    /// Handler rejected the transfer
    #[error("FAILED_PRECONDITION")]
    FailedPrecondition = 9,
    /// Superseded by a newer transfer on the same session
    #[error("ABORTED")]
    Aborted = 10,
    /// Stream exhausted or seek past the end
    #[error("OUT_OF_RANGE")]
    OutOfRange = 11,
    /// Operation not supported (e.g. seeking)
    #[error("UNIMPLEMENTED")]
    Unimplemented = 12,
    /// Protocol invariant violated
    #[error("INTERNAL")]
    Internal = 13,
    /// Peer or channel unavailable
    #[error("UNAVAILABLE")]
    Unavailable = 14,
    /// Handler read/write failure
    #[error("DATA_LOSS")]
    DataLoss = 15,
    /// Missing credentials
    #[error("UNAUTHENTICATED")]
    Unauthenticated = 16,
}

impl Status {
    /// Decode a wire status code. Unrecognized codes map to [`Status::Unknown`].
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Wire code
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Check for success
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Convert into a `Result`, mapping `Ok` to `Ok(())`
    ///
    /// # Errors
    ///
    /// Returns `self` when it is not [`Status::Ok`].
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }
}

impl From<Result<(), Status>> for Status {
    fn from(result: Result<(), Status>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(status) => status,
        }
    }
}
