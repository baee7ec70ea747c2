//! # boardflash
//!
//! A library for sharing one serial port between the tools that flash and
//! watch ESP32 and BW16 development boards.
//!
//! This crate provides:
//!
//! - A transport handle with exclusive reader/writer locks and DTR/RTS control
//! - A cancellable serial monitor with streaming UTF-8 decoding
//! - A paced, chunked raw uploader with progress reporting
//! - A session coordinator that hands the port between a bootloader client,
//!   the monitor and the uploader
//! - Serial port discovery filtered by device class
//!
//! The chip bootloader protocol itself is not implemented here: it plugs in
//! through the [`BootloaderConnector`] / [`BootloaderClient`] traits.
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use boardflash::{Coordinator, DeviceClass, MemorySink, NativeHost};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = Arc::new(MemorySink::new(DeviceClass::Bw16.channel()));
//!     let host = NativeHost::new().with_preferred(Some("/dev/ttyUSB0".into()));
//!     let mut session = Coordinator::new(DeviceClass::Bw16, host, sink.clone());
//!
//!     session.acquire_for_monitor()?;
//!     let image = std::fs::read("km0_km4_image2.bin")?;
//!     session.upload("km0_km4_image2.bin", &image, |p| {
//!         println!("{}%", p.percent());
//!     })?;
//!     session.release_from_monitor();
//!
//!     for line in sink.lines() {
//!         println!("{line}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootloader;
pub mod cancel;
pub mod device;
pub mod error;
pub mod host;
pub mod monitor;
pub mod port;
pub mod session;
pub mod sink;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeHost, NativePort, NativePortEnumerator};
pub use {
    bootloader::{
        BootloaderClient, BootloaderConnector, FlashImage, FlashSizePolicy, WriteOptions,
        parse_flash_offset,
    },
    cancel::CancelToken,
    device::{DetectedPort, DeviceClass, DeviceKind, TransportKind, UsbFilter},
    error::{Error, Result},
    host::{auto_detect_port, discover_ports, discover_ports_for},
    monitor::{
        MonitorExit, MonitorOutcome, SerialMonitor, clean_monitor_text, clock_time,
        drain_utf8_lossy, format_monitor_output,
    },
    port::{Port, PortEnumerator, PortHost, PortInfo, SerialConfig},
    session::{Controls, Coordinator, SessionConfig, SessionState},
    sink::{LogEntry, LogSink, MemorySink},
    transport::{
        ExclusiveLease, OpenOutcome, Signals, StreamReader, StreamSide, StreamWriter,
        TransportHandle,
    },
    upload::{ChunkedUploader, Progress, UploadOptions, UploadReport},
};
