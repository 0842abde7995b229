//! Error types shared by every stage of the flashing pipeline.
//!
//! Each [`Error`] maps onto a stable [`ErrorKind`], and [`Error::report`]
//! flattens it into an [`ErrorReport`] that front-ends can hold on to after
//! polling, since the error itself is not `Clone`.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The category of a failure, independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthorizationDenied,
    RelaunchRequired,
    SystemDevice,
    DeviceNotFound,
    DeviceDisconnected,
    DownloadFailed,
    ChecksumMismatch,
    DecompressionFailed,
    WriteFailed,
    VerificationMismatch,
    ImageTooLarge,
    OperationCancelled,
    CacheError,
    OperationAlreadyActive,
    Config,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AuthorizationDenied => "authorization denied",
            ErrorKind::RelaunchRequired => "relaunch required",
            ErrorKind::SystemDevice => "system device",
            ErrorKind::DeviceNotFound => "device not found",
            ErrorKind::DeviceDisconnected => "device disconnected",
            ErrorKind::DownloadFailed => "download failed",
            ErrorKind::ChecksumMismatch => "checksum mismatch",
            ErrorKind::DecompressionFailed => "decompression failed",
            ErrorKind::WriteFailed => "write failed",
            ErrorKind::VerificationMismatch => "verification mismatch",
            ErrorKind::ImageTooLarge => "image too large",
            ErrorKind::OperationCancelled => "operation cancelled",
            ErrorKind::CacheError => "cache error",
            ErrorKind::OperationAlreadyActive => "operation already active",
            ErrorKind::Config => "configuration error",
            ErrorKind::Io => "I/O error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authorization denied for {}: {reason}", .path.display())]
    AuthorizationDenied { path: PathBuf, reason: String },

    #[error("Restarted with elevated privileges; start the operation again from the new process")]
    RelaunchRequired,

    #[error("Refusing to write to {}: it is, or may be, a system disk", .0.display())]
    SystemDevice(PathBuf),

    #[error("Device not found: {}", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("Device {} was disconnected", .0.display())]
    DeviceDisconnected(PathBuf),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error(
        "Write failed at byte {offset}: {source}. The device is now partially written and must be flashed again"
    )]
    WriteFailed { offset: u64, source: io::Error },

    #[error("Verification failed: data read back from the device does not match the image")]
    VerificationMismatch,

    #[error("Image is {image} bytes but the device only holds {capacity} bytes")]
    ImageTooLarge { image: u64, capacity: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Another download or flash operation is already running")]
    OperationAlreadyActive,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AuthorizationDenied { .. } => ErrorKind::AuthorizationDenied,
            Error::RelaunchRequired => ErrorKind::RelaunchRequired,
            Error::SystemDevice(_) => ErrorKind::SystemDevice,
            Error::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Error::DeviceDisconnected(_) => ErrorKind::DeviceDisconnected,
            Error::DownloadFailed(_) => ErrorKind::DownloadFailed,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::DecompressionFailed(_) => ErrorKind::DecompressionFailed,
            Error::WriteFailed { .. } => ErrorKind::WriteFailed,
            Error::VerificationMismatch => ErrorKind::VerificationMismatch,
            Error::ImageTooLarge { .. } => ErrorKind::ImageTooLarge,
            Error::Cancelled => ErrorKind::OperationCancelled,
            Error::Cache(_) => ErrorKind::CacheError,
            Error::OperationAlreadyActive => ErrorKind::OperationAlreadyActive,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the caller can resolve this failure without starting over.
    ///
    /// Only a checksum mismatch qualifies: the downloaded file is kept and the
    /// user may accept it unverified or discard it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ChecksumMismatch { .. })
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// A cloneable, serializable summary of an [`Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
