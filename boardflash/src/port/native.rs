//! Desktop backend: [`NativePort`] wraps a `serialport` handle and
//! [`NativeHost`] picks devices from the OS enumeration.

use {
    crate::{
        device::UsbFilter,
        error::{Error, Result},
        port::{Port, PortEnumerator, PortHost, PortInfo, SerialConfig},
    },
    log::{debug, trace},
    serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// A `serialport` device behind the [`Port`] trait.
///
/// After [`Port::close`] reads and writes fail with `NotConnected`, while
/// line and timeout changes are only recorded.
pub struct NativePort {
    device: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open `config.port_name` as 8N1 without handshaking.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let device = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.timeout)
            .open()?;

        Ok(Self {
            device: Some(device),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn stream(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.device
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }

    /// Apply `op` to the open device; a closed port ignores it.
    fn control<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&mut dyn SerialPort) -> serialport::Result<()>,
    {
        match self.device.as_deref_mut() {
            Some(device) => Ok(op(device)?),
            None => Ok(()),
        }
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.control(|d| d.set_timeout(timeout))?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.control(|d| d.set_baud_rate(baud_rate))?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("{}: DTR={}", self.name, u8::from(level));
        self.control(|d| d.write_data_terminal_ready(level))
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("{}: RTS={}", self.name, u8::from(level));
        self.control(|d| d.write_request_to_send(level))
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        let device = self.device.as_ref().ok_or(Error::NotConnected)?;
        Ok(Box::new(Self {
            device: Some(device.try_clone()?),
            name: self.name.clone(),
            timeout: self.timeout,
            baud_rate: self.baud_rate,
        }))
    }

    fn close(&mut self) -> Result<()> {
        if self.device.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

/// Lists devices through `serialport::available_ports`.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;
        Ok(ports.into_iter().map(port_info).collect())
    }
}

fn port_info(p: serialport::SerialPortInfo) -> PortInfo {
    let mut info = PortInfo::named(p.port_name);
    if let serialport::SerialPortType::UsbPort(usb) = p.port_type {
        info.vid = Some(usb.vid);
        info.pid = Some(usb.pid);
        info.manufacturer = usb.manufacturer;
        info.product = usb.product;
        info.serial_number = usb.serial_number;
    }
    info
}

/// Chooser callback used by [`NativeHost`] when several ports match.
pub type PortChooser = Box<dyn FnMut(&[PortInfo]) -> Result<Option<PortInfo>> + Send>;

/// [`PortHost`] backed by the operating system's serial ports.
///
/// Selection order: an explicitly preferred port, then the single port
/// matching the device filters, then the chooser callback (if any).
#[derive(Default)]
pub struct NativeHost {
    preferred: Option<String>,
    include_unmatched: bool,
    chooser: Option<PortChooser>,
}

impl NativeHost {
    /// Create a host that auto-selects a single matching port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always select this port, bypassing discovery.
    #[must_use]
    pub fn with_preferred(mut self, port: Option<String>) -> Self {
        self.preferred = port;
        self
    }

    /// Offer every serial port, not only those matching the filters.
    #[must_use]
    pub fn include_unmatched(mut self, include: bool) -> Self {
        self.include_unmatched = include;
        self
    }

    /// Install a chooser for ambiguous selections.
    #[must_use]
    pub fn with_chooser(mut self, chooser: PortChooser) -> Self {
        self.chooser = Some(chooser);
        self
    }
}

impl PortHost for NativeHost {
    fn request_port(&mut self, filters: &[UsbFilter]) -> Result<Option<PortInfo>> {
        if let Some(name) = &self.preferred {
            return Ok(Some(PortInfo::named(name.clone())));
        }

        let candidates = if self.include_unmatched {
            NativePortEnumerator::list_ports()?
        } else {
            NativePortEnumerator::find_matching(filters)?
        };
        debug!("{} candidate port(s) for selection", candidates.len());

        if candidates.len() == 1 && self.chooser.is_none() {
            return Ok(candidates.into_iter().next());
        }
        match self.chooser.as_mut() {
            Some(choose) => choose(&candidates),
            None => Ok(None),
        }
    }

    fn open(&mut self, info: &PortInfo, config: &SerialConfig) -> Result<Box<dyn Port>> {
        let mut config = config.clone();
        config.port_name.clone_from(&info.name);
        Ok(Box::new(NativePort::open(&config)?))
    }
}
