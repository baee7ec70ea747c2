//! Port abstraction for serial communication.
//!
//! This module provides the `Port` trait that the transport handle, the serial
//! monitor and the chunked uploader are written against, plus the `PortHost`
//! trait through which a session asks its environment for a device:
//!
//! ```text
//! +-------------+   +-----------------+   +------------------+
//! | Coordinator |-->| TransportHandle |-->|    Port trait    |
//! +------+------+   +-----------------+   +--------+---------+
//!        |                                         |
//!        v                                         v
//! +------+------+                         +--------+---------+
//! |  PortHost   |------- open() -------->| NativePort       |
//! | (chooser)   |                         |   (serialport)   |
//! +-------------+                         +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use boardflash::port::Port;
//!
//! fn pulse_reset(port: &mut dyn Port) -> boardflash::Result<()> {
//!     port.set_dtr(false)?;
//!     port.set_rts(true)?;
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//!     port.set_rts(false)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::device::UsbFilter;
use crate::error::Result;

/// How a device is opened. Boards here always talk 8N1 without
/// handshaking, so only the speed and read timeout vary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device path handed to the OS.
    pub port_name: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Longest a single read may block.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Read timeout used unless a caller shortens it after opening.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Settings for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Identity of a device offered by the chooser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor id, absent for built-in UARTs.
    pub vid: Option<u16>,
    /// USB product id.
    pub pid: Option<u16>,
    /// Manufacturer descriptor.
    pub manufacturer: Option<String>,
    /// Product descriptor.
    pub product: Option<String>,
    /// Serial-number descriptor.
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port info carrying only a name, for ports given explicitly by the user.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

/// An open byte stream to a board, plus the modem lines used to reset it.
pub trait Port: Read + Write + Send {
    /// Change how long a read may block.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Current line speed.
    fn baud_rate(&self) -> u32;

    /// Device path this port was opened from.
    fn name(&self) -> &str;

    /// Drive DTR.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Drive RTS.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Open a second handle onto the same physical connection.
    ///
    /// Used to split a port into an independent reader and writer.
    fn try_clone_port(&self) -> Result<Box<dyn Port>>;

    /// Release the OS handle. Later I/O fails with `NotConnected`.
    fn close(&mut self) -> Result<()>;
}

/// The environment a session runs in: a device chooser plus a way to open
/// the chosen device.
///
/// The CLI implements this with port discovery and an interactive prompt;
/// tests implement it with scripted in-memory ports.
pub trait PortHost: Send {
    /// Ask the user to pick a device matching one of `filters`.
    ///
    /// Returns `Ok(None)` when the user cancels the chooser.
    fn request_port(&mut self, filters: &[UsbFilter]) -> Result<Option<PortInfo>>;

    /// Open the given device.
    fn open(&mut self, info: &PortInfo, config: &SerialConfig) -> Result<Box<dyn Port>>;
}

/// Enumeration of the serial devices present on the host.
pub trait PortEnumerator {
    /// Every device the OS reports, USB or not.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Find ports accepted by any of the given filters.
    fn find_matching(filters: &[UsbFilter]) -> Result<Vec<PortInfo>> {
        let ports = Self::list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| match (p.vid, p.pid) {
                (Some(vid), Some(pid)) => filters.iter().any(|f| f.matches(vid, pid)),
                _ => false,
            })
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativeHost, NativePort, NativePortEnumerator};
