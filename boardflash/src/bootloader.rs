//! Contract for packet-protocol bootloader clients.
//!
//! Chip bootloader protocols (SLIP framing, stub upload, compressed flash
//! writes, digest verification) live in external libraries. A session only
//! needs the operations below, so any library can be plugged in through a
//! [`BootloaderConnector`] that wraps a [`TransportHandle`].

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sink::LogSink;
use crate::transport::TransportHandle;

/// One binary to write at a flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    /// Flash address.
    pub address: u32,
    /// Image bytes.
    pub data: Vec<u8>,
}

impl FlashImage {
    /// Create an image.
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }
}

/// How the flash-size field in the image header is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashSizePolicy {
    /// Leave the header as built.
    #[default]
    Keep,
    /// Patch the header with the detected flash size.
    Detect,
}

/// Per-image progress callback: `(file_index, written, total)`.
pub type FlashProgress<'a> = &'a mut dyn FnMut(usize, usize, usize);

/// Options for [`BootloaderClient::write_firmware`].
pub struct WriteOptions<'a> {
    /// Erase the whole chip before writing.
    pub erase_all: bool,
    /// Compress data on the wire.
    pub compress: bool,
    /// Flash-size header policy.
    pub flash_size: FlashSizePolicy,
    /// Verify written data after each image.
    pub verify: bool,
    /// Progress sink.
    pub progress: FlashProgress<'a>,
}

impl fmt::Debug for WriteOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOptions")
            .field("erase_all", &self.erase_all)
            .field("compress", &self.compress)
            .field("flash_size", &self.flash_size)
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

impl<'a> WriteOptions<'a> {
    /// Options used for a single-image flash from the session: no chip
    /// erase, compressed, header kept, verified.
    pub fn single_image(progress: FlashProgress<'a>) -> Self {
        Self {
            erase_all: false,
            compress: true,
            flash_size: FlashSizePolicy::Keep,
            verify: true,
            progress,
        }
    }
}

/// A connected bootloader protocol client.
///
/// The client owns the transport handle (and both of its stream locks)
/// from [`BootloaderConnector::attach`] until [`BootloaderClient::into_handle`].
/// Failures are reported as [`Error::DeviceProtocol`] carrying the
/// library's message.
pub trait BootloaderClient: Send {
    /// Sync with the ROM bootloader.
    fn connect(&mut self) -> Result<()>;

    /// Read the chip name.
    fn identify(&mut self) -> Result<String>;

    /// Erase the entire flash.
    fn erase_all(&mut self) -> Result<()>;

    /// Write images to flash.
    fn write_firmware(&mut self, images: &[FlashImage], options: WriteOptions<'_>) -> Result<()>;

    /// Tear down the protocol session and close the port.
    fn disconnect(&mut self) -> Result<()>;

    /// Give the transport handle back. Stream locks held by the client are
    /// released when its last worker finishes with them.
    fn into_handle(self: Box<Self>) -> TransportHandle;
}

/// Builds bootloader clients over a transport handle.
pub trait BootloaderConnector: Send {
    /// Wrap `handle` in a client talking at `baud`, logging to `terminal`.
    fn attach(
        &mut self,
        handle: TransportHandle,
        baud: u32,
        terminal: Arc<dyn LogSink>,
    ) -> Result<Box<dyn BootloaderClient>>;
}

/// Parse a hexadecimal flash offset as typed by the user.
///
/// Accepts an optional `0x`/`0X` prefix and `_` separators.
pub fn parse_flash_offset(text: &str) -> Result<u32> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .replace('_', "");
    if digits.is_empty() {
        return Err(Error::InvalidOffset(text.to_string()));
    }
    u32::from_str_radix(&digits, 16).map_err(|_| Error::InvalidOffset(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flash_offset() {
        assert_eq!(parse_flash_offset("0x10000").unwrap(), 0x10000);
        assert_eq!(parse_flash_offset("0X1000").unwrap(), 0x1000);
        assert_eq!(parse_flash_offset("8000").unwrap(), 0x8000);
        assert_eq!(parse_flash_offset(" 0x0001_0000 ").unwrap(), 0x10000);
        assert_eq!(parse_flash_offset("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_flash_offset_rejects_garbage() {
        for bad in ["", "0x", "zz", "0x1g", "-1", "0x1_0000_0000"] {
            let err = parse_flash_offset(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidOffset(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn test_single_image_options() {
        let mut calls = 0;
        let mut progress = |_: usize, _: usize, _: usize| calls += 1;
        let mut options = WriteOptions::single_image(&mut progress);
        assert!(!options.erase_all);
        assert!(options.compress);
        assert_eq!(options.flash_size, FlashSizePolicy::Keep);
        (options.progress)(0, 1, 1);
        assert_eq!(calls, 1);
    }
}
