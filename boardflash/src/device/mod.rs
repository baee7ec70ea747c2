//! Device discovery and classification utilities.
//!
//! Two layers live here: [`DeviceKind`] classifies the USB bridge behind a
//! serial port, while [`DeviceClass`] describes the board family a session
//! talks to (which bridges it accepts, its baud rates, whether the monitor
//! pulses reset, and how raw uploads are paced).

use std::fmt;
use std::time::Duration;

#[cfg(feature = "native")]
use log::{debug, trace};

/// How a discovered port is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// UART bridge or USB CDC-ACM.
    Serial,
    /// Anything the enumerator could not place.
    Unknown,
}

/// USB bridge chip sitting between the host and the board's UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// WCH CH340 / CH341.
    Ch340,
    /// Silicon Labs CP2102 / CP2104 family.
    Cp210x,
    /// FTDI FT232 and multi-channel siblings.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Espressif native USB (USB-Serial-JTAG or USB-OTG CDC).
    Espressif,
    /// Realtek USB device (BW16 / RTL8720DN boards).
    Realtek,
    /// Vendor not in the table.
    Unknown,
}

impl DeviceKind {
    /// Look up the bridge for a USB identity.
    ///
    /// Espressif and Realtek parts are matched on vendor alone.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        match (vid, pid) {
            (0x1A86, 0x7523 | 0x7522 | 0x5523 | 0x5512 | 0x55D4) => Self::Ch340,
            (0x10C4, 0xEA60 | 0xEA70 | 0xEA71 | 0xEA63) => Self::Cp210x,
            (0x0403, 0x6001 | 0x6010 | 0x6011 | 0x6014 | 0x6015) => Self::Ftdi,
            (0x067B, 0x2303 | 0x23A3 | 0x23C3 | 0x23D3) => Self::Prolific,
            (0x303A, _) => Self::Espressif,
            (0x0BDA, _) => Self::Realtek,
            _ => Self::Unknown,
        }
    }

    /// Label shown in port listings.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Espressif => "Espressif USB",
            Self::Realtek => "Realtek",
            Self::Unknown => "Unknown",
        }
    }

    /// `false` only for [`DeviceKind::Unknown`].
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// USB vendor/product filter offered to the device chooser.
///
/// A missing product id matches every product of the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsbFilter {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id, `None` for any.
    pub product_id: Option<u16>,
}

impl UsbFilter {
    /// Filter for one exact VID/PID pair.
    #[must_use]
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: Some(product_id),
        }
    }

    /// Filter accepting any product of a vendor.
    #[must_use]
    pub const fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: None,
        }
    }

    /// Whether a device with this VID/PID passes the filter.
    #[must_use]
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vendor_id == vid && self.product_id.is_none_or(|p| p == pid)
    }
}

impl fmt::Display for UsbFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.product_id {
            Some(pid) => write!(f, "{:04x}:{pid:04x}", self.vendor_id),
            None => write!(f, "{:04x}:*", self.vendor_id),
        }
    }
}

const ESP32_FILTERS: &[UsbFilter] = &[
    UsbFilter::new(0x10C4, 0xEA60),
    UsbFilter::new(0x1A86, 0x7523),
    UsbFilter::new(0x303A, 0x1001),
    UsbFilter::new(0x303A, 0x8002),
];

const BW16_FILTERS: &[UsbFilter] = &[
    UsbFilter::new(0x10C4, 0xEA60),
    UsbFilter::new(0x1A86, 0x7523),
    UsbFilter::vendor(0x0BDA),
];

/// Board family a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceClass {
    /// ESP32-family chip, flashed through its ROM bootloader.
    Esp32,
    /// BW16 (RTL8720DN) board, fed raw bytes over the serial link.
    Bw16,
}

impl DeviceClass {
    /// All supported device classes.
    pub const ALL: [Self; 2] = [Self::Esp32, Self::Bw16];

    /// Short display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Esp32 => "ESP32",
            Self::Bw16 => "BW16",
        }
    }

    /// USB filters for the device chooser.
    pub fn filters(&self) -> &'static [UsbFilter] {
        match self {
            Self::Esp32 => ESP32_FILTERS,
            Self::Bw16 => BW16_FILTERS,
        }
    }

    /// Console channel the session logs to.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Esp32 => "esp-console",
            Self::Bw16 => "bw16-console",
        }
    }

    /// Baud rate for the bootloader link.
    pub fn bootloader_baud(&self) -> u32 {
        115_200
    }

    /// Baud rate for the serial monitor and raw uploads.
    pub fn monitor_baud(&self) -> u32 {
        115_200
    }

    /// Whether starting the monitor pulses DTR/RTS to reboot the chip.
    pub fn resets_on_monitor(&self) -> bool {
        matches!(self, Self::Esp32)
    }

    /// Whether the class is flashed through a bootloader client.
    pub fn uses_bootloader(&self) -> bool {
        matches!(self, Self::Esp32)
    }

    /// Whether the class accepts raw chunked uploads.
    pub fn accepts_raw_upload(&self) -> bool {
        matches!(self, Self::Bw16)
    }

    /// Default raw-upload chunk size in bytes.
    pub fn default_chunk_size(&self) -> usize {
        256
    }

    /// Default pause between raw-upload chunks.
    pub fn default_chunk_delay(&self) -> Duration {
        Duration::from_millis(50)
    }

    /// Whether a discovered port belongs to this class.
    pub fn accepts(&self, port: &DetectedPort) -> bool {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => self.filters().iter().any(|f| f.matches(vid, pid)),
            _ => false,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A serial port as seen during discovery, with whatever USB metadata the OS reported.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// OS path or name, `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// How the port is reached.
    pub transport: TransportKind,
    /// Bridge chip derived from VID/PID.
    pub device: DeviceKind,
    /// USB vendor id.
    pub vid: Option<u16>,
    /// USB product id.
    pub pid: Option<u16>,
    /// iManufacturer string.
    pub manufacturer: Option<String>,
    /// iProduct string.
    pub product: Option<String>,
    /// iSerialNumber string.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Device classes whose filters accept this port.
    pub fn classes(&self) -> Vec<DeviceClass> {
        DeviceClass::ALL
            .into_iter()
            .filter(|class| class.accepts(self))
            .collect()
    }
}

impl From<&DetectedPort> for crate::port::PortInfo {
    fn from(port: &DetectedPort) -> Self {
        Self {
            name: port.name.clone(),
            vid: port.vid,
            pid: port.pid,
            manufacturer: port.manufacturer.clone(),
            product: port.product.clone(),
            serial_number: port.serial.clone(),
        }
    }
}

impl From<crate::port::PortInfo> for DetectedPort {
    fn from(info: crate::port::PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            transport: TransportKind::Serial,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// One line per port: name, bridge, product and the boards it may carry.
impl fmt::Display for DetectedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        match (self.device.is_known(), self.vid, self.pid) {
            (true, ..) => write!(f, " [{}]", self.device.name())?,
            (false, Some(vid), Some(pid)) => write!(f, " [{vid:04X}:{pid:04X}]")?,
            _ => {},
        }
        if let Some(product) = &self.product {
            write!(f, " - {product}")?;
        }
        let classes = self.classes();
        if let Some((first, rest)) = classes.split_first() {
            write!(f, " ({first}")?;
            for class in rest {
                write!(f, ", {class}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Enumerate serial ports and classify their USB bridges.
///
/// Enumeration failures are logged and yield an empty list.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    let infos = NativePortEnumerator::list_ports().unwrap_or_else(|e| {
        debug!("Serial port enumeration failed: {e}");
        Vec::new()
    });
    infos
        .into_iter()
        .map(DetectedPort::from)
        .inspect(|port| {
            trace!("Port {} classified as {:?}", port.name, port.device);
        })
        .collect()
}

/// Without a native backend there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}
