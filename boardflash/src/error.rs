//! Error types for boardflash.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionState;
use crate::transport::StreamSide;

/// Result type for boardflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for boardflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The user dismissed the device chooser while acquiring for the bootloader.
    #[error("No port selected")]
    NoPortSelected,

    /// No port was chosen for monitoring and none was retained from a previous owner.
    #[error("Port selection failed: no port chosen and none retained")]
    PortSelectionFailed,

    /// The session is already owned by another component.
    #[error("Port already owned ({owner})")]
    AlreadyOwned {
        /// Current owner of the session.
        owner: SessionState,
    },

    /// A stream side is already held by another reader or writer.
    #[error("{0} stream is already locked")]
    AlreadyLocked(StreamSide),

    /// The port could not be opened.
    #[error("Failed to open {port}: {reason}")]
    PortOpenFailed {
        /// Port name.
        port: String,
        /// Underlying cause.
        reason: String,
    },

    /// The stream locks did not clear after the bootloader released the port.
    #[error("Port {port} still locked after {}ms", waited.as_millis())]
    UnlockTimeout {
        /// Port name.
        port: String,
        /// How long the coordinator waited.
        waited: Duration,
    },

    /// The flash offset is not a hexadecimal number.
    #[error("Invalid offset: '{0}'")]
    InvalidOffset(String),

    /// The upload chunk size is zero.
    #[error("Invalid chunk size: must be at least 1 byte")]
    InvalidChunkSize,

    /// A chunk write failed mid-transfer.
    #[error("Transfer failed after {sent}/{total} bytes: {source}")]
    TransferFailed {
        /// Bytes written before the failure.
        sent: usize,
        /// Payload length.
        total: usize,
        /// Write error.
        #[source]
        source: io::Error,
    },

    /// The operation was cancelled.
    #[error("Cancelled after {sent} bytes")]
    Cancelled {
        /// Bytes written before the cancellation was observed.
        sent: usize,
    },

    /// No serial device matching the device class was found.
    #[error("No {0} serial device found")]
    DeviceNotFound(String),

    /// There is no open port to operate on.
    #[error("Port not connected")]
    NotConnected,

    /// Opaque failure reported by the bootloader client.
    #[error("Device protocol error: {0}")]
    DeviceProtocol(String),

    /// Unsupported device class or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error only reflects the user backing out of a prompt.
    pub fn is_selection_cancelled(&self) -> bool {
        matches!(self, Self::NoPortSelected | Self::PortSelectionFailed)
    }

    /// Whether this error is an input validation failure raised before any I/O.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::InvalidOffset(_) | Self::InvalidChunkSize)
    }
}
