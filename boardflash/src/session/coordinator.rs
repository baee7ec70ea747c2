use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::bootloader::{
    BootloaderClient, BootloaderConnector, FlashImage, WriteOptions, parse_flash_offset,
};
use crate::cancel::CancelToken;
use crate::device::{DeviceClass, UsbFilter};
use crate::error::{Error, Result};
use crate::monitor::{MonitorOutcome, SerialMonitor};
use crate::port::{PortHost, SerialConfig};
use crate::session::state::{Controls, SessionState};
use crate::sink::LogSink;
use crate::transport::{Signals, TransportHandle};
use crate::upload::{ChunkedUploader, Progress, UploadOptions, UploadReport};

/// How long the bootloader's stream locks may linger after disconnect.
pub const DEFAULT_UNLOCK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Hold time for each step of the reset pulse.
pub const DEFAULT_RESET_HOLD: Duration = Duration::from_millis(100);

/// Called after every ownership change with the new state and controls.
pub type StateListener = Box<dyn FnMut(SessionState, Controls) + Send>;

/// Tunables for a [`Coordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Baud rate handed to the bootloader client.
    pub bootloader_baud: u32,
    /// Baud rate the monitor opens the port at.
    pub monitor_baud: u32,
    /// Bound on the post-bootloader unlock wait.
    pub unlock_timeout: Duration,
    /// Hold time for each reset pulse step.
    pub reset_hold: Duration,
    /// Pulse reset when the monitor starts.
    pub reset_on_monitor: bool,
    /// Raw upload pacing.
    pub upload: UploadOptions,
    /// Additional USB filters offered to the chooser.
    pub extra_filters: Vec<UsbFilter>,
}

impl SessionConfig {
    /// Defaults for a device class.
    pub fn for_class(class: DeviceClass) -> Self {
        Self {
            bootloader_baud: class.bootloader_baud(),
            monitor_baud: class.monitor_baud(),
            unlock_timeout: DEFAULT_UNLOCK_TIMEOUT,
            reset_hold: DEFAULT_RESET_HOLD,
            reset_on_monitor: class.resets_on_monitor(),
            upload: UploadOptions::for_class(class),
            extra_filters: Vec::new(),
        }
    }
}

enum Ownership {
    Idle { retained: Option<TransportHandle> },
    Bootloader { client: Box<dyn BootloaderClient> },
    Monitor {
        handle: TransportHandle,
        monitor: SerialMonitor,
    },
    Uploader,
}

impl Ownership {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle { .. } => SessionState::Idle,
            Self::Bootloader { .. } => SessionState::Bootloader,
            Self::Monitor { .. } => SessionState::Monitor,
            Self::Uploader => SessionState::Uploader,
        }
    }
}

/// Console wording that differs between the two device pages.
struct Wording {
    open_error: &'static str,
    read_error: &'static str,
    stopped: &'static str,
}

impl Wording {
    fn for_class(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Esp32 => Self {
                open_error: "Monitor Error",
                read_error: "Serial Error",
                stopped: "Serial Monitor Stopped. Connect to flash again.",
            },
            DeviceClass::Bw16 => Self {
                open_error: "Connection Error",
                read_error: "Read Error",
                stopped: "Serial Monitor Stopped.",
            },
        }
    }
}

/// Owns the serial port of one device-class session and moves it between
/// the bootloader client, the serial monitor and the raw uploader.
///
/// Every operation logs its outcome to the session's console sink. A failed
/// operation leaves the session in the last safe state and returns the
/// error; no failure poisons the session.
pub struct Coordinator<H: PortHost> {
    class: DeviceClass,
    config: SessionConfig,
    host: H,
    sink: Arc<dyn LogSink>,
    connector: Option<Box<dyn BootloaderConnector>>,
    ownership: Ownership,
    last_state: SessionState,
    chip: Option<String>,
    upload_cancel: CancelToken,
    listener: Option<StateListener>,
}

impl<H: PortHost> Coordinator<H> {
    /// Create an idle session for `class`.
    pub fn new(class: DeviceClass, host: H, sink: Arc<dyn LogSink>) -> Self {
        Self {
            class,
            config: SessionConfig::for_class(class),
            host,
            sink,
            connector: None,
            ownership: Ownership::Idle { retained: None },
            last_state: SessionState::Idle,
            chip: None,
            upload_cancel: CancelToken::new(),
            listener: None,
        }
    }

    /// Replace the default configuration.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the bootloader client factory.
    #[must_use]
    pub fn with_connector(mut self, connector: Box<dyn BootloaderConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Register a callback for ownership changes.
    pub fn on_state_change(&mut self, listener: StateListener) {
        self.listener = Some(listener);
    }

    /// Device class of this session.
    pub fn device_class(&self) -> DeviceClass {
        self.class
    }

    /// Active configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current owner.
    pub fn state(&self) -> SessionState {
        self.ownership.state()
    }

    /// Enabled actions for the current owner.
    pub fn controls(&self) -> Controls {
        Controls::for_state(self.class, self.state())
    }

    /// Chip name reported by the bootloader, while connected.
    pub fn chip_name(&self) -> Option<&str> {
        self.chip.as_deref()
    }

    /// Name of the port the session holds or retains.
    pub fn port_name(&self) -> Option<&str> {
        match &self.ownership {
            Ownership::Idle {
                retained: Some(handle),
            }
            | Ownership::Monitor { handle, .. } => Some(handle.name()),
            _ => None,
        }
    }

    /// Whether an idle session still remembers a port for reuse.
    pub fn has_retained_port(&self) -> bool {
        matches!(self.ownership, Ownership::Idle { retained: Some(_) })
    }

    /// Token that cancels the upload in progress.
    pub fn upload_cancel_token(&self) -> CancelToken {
        self.upload_cancel.clone()
    }

    /// Mutable access to the port host.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    fn log(&self, line: &str) {
        self.sink.append_line(line);
    }

    fn filters(&self) -> Vec<UsbFilter> {
        let mut filters = self.class.filters().to_vec();
        filters.extend(self.config.extra_filters.iter().copied());
        filters
    }

    fn take_ownership(&mut self) -> Ownership {
        mem::replace(&mut self.ownership, Ownership::Idle { retained: None })
    }

    fn set_ownership(&mut self, ownership: Ownership) {
        self.ownership = ownership;
        let state = self.ownership.state();
        if state != self.last_state {
            debug!("{} session: {} -> {}", self.class, self.last_state, state);
            self.last_state = state;
            let controls = Controls::for_state(self.class, state);
            if let Some(listener) = self.listener.as_mut() {
                listener(state, controls);
            }
        }
    }

    /// Choose a device and connect the bootloader client to it.
    ///
    /// Returns the chip name on success.
    pub fn acquire_for_bootloader(&mut self) -> Result<String> {
        let state = self.state();
        if state != SessionState::Idle {
            self.log("Already connected.");
            return Err(Error::AlreadyOwned { owner: state });
        }
        if self.connector.is_none() {
            let err = Error::Unsupported(format!("no bootloader client for {}", self.class));
            self.log(&format!("Error: {err}"));
            return Err(err);
        }

        let filters = self.filters();
        let info = match self.host.request_port(&filters) {
            Ok(Some(info)) => info,
            Ok(None) => {
                self.log("No port selected.");
                return Err(Error::NoPortSelected);
            },
            Err(e) => {
                self.log(&format!("Error: {e}"));
                return Err(e);
            },
        };

        // A port retained from an earlier monitor run is superseded.
        if let Ownership::Idle {
            retained: Some(mut old),
        } = self.take_ownership()
        {
            if let Err(e) = old.close() {
                warn!("Could not close {}: {e}", old.name());
            }
        }

        self.log("Connecting...");
        self.log("Note: If connection fails, hold BOOT button.");

        let handle = TransportHandle::new(info);
        let baud = self.config.bootloader_baud;
        let terminal = Arc::clone(&self.sink);
        let attached = match self.connector.as_mut() {
            Some(connector) => connector.attach(handle, baud, terminal),
            None => Err(Error::Unsupported(self.class.to_string())),
        };
        let mut client = match attached {
            Ok(client) => client,
            Err(e) => {
                self.log(&format!("Connection Error: {e}"));
                self.log("Try holding BOOT button while connecting.");
                return Err(e);
            },
        };

        match client.connect().and_then(|()| client.identify()) {
            Ok(chip) => {
                info!("Connected to {chip}");
                self.log(&format!("Connected to {chip}"));
                self.chip = Some(chip.clone());
                self.set_ownership(Ownership::Bootloader { client });
                Ok(chip)
            },
            Err(e) => {
                self.log(&format!("Connection Error: {e}"));
                self.log("Try holding BOOT button while connecting.");
                if let Err(d) = client.disconnect() {
                    warn!("Disconnect after failed connect: {d}");
                }
                drop(client.into_handle());
                self.set_ownership(Ownership::Idle { retained: None });
                Err(e)
            },
        }
    }

    /// Disconnect the bootloader client and keep its port for the monitor.
    ///
    /// Waits up to the configured unlock timeout for the client's stream
    /// locks to clear; a timeout is logged as a warning and otherwise
    /// ignored. Does nothing unless the bootloader owns the session.
    pub fn release_from_bootloader(&mut self) {
        let mut client = match self.take_ownership() {
            Ownership::Bootloader { client } => client,
            other => {
                self.ownership = other;
                return;
            },
        };

        if let Err(e) = client.disconnect() {
            warn!("Bootloader disconnect failed: {e}");
            self.log(&format!("Disconnect warning: {e}"));
        }
        let handle = client.into_handle();
        if let Err(e) = handle.wait_for_unlock(self.config.unlock_timeout) {
            warn!("{e}");
            self.log(&format!("Disconnect warning: {e}"));
        }

        self.chip = None;
        self.set_ownership(Ownership::Idle {
            retained: Some(handle),
        });
    }

    /// Start the serial monitor.
    ///
    /// Reuses the retained port (releasing the bootloader first if it owns
    /// the session) and only prompts when there is none. Opening a port that
    /// is already open is fine.
    pub fn acquire_for_monitor(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Idle => {},
            SessionState::Bootloader => self.release_from_bootloader(),
            owner @ (SessionState::Monitor | SessionState::Uploader) => {
                self.log("Already connected.");
                return Err(Error::AlreadyOwned { owner });
            },
        }
        let wording = Wording::for_class(self.class);

        let retained = match self.take_ownership() {
            Ownership::Idle { retained } => retained,
            other => {
                let owner = other.state();
                self.ownership = other;
                return Err(Error::AlreadyOwned { owner });
            },
        };
        let mut handle = match retained {
            Some(handle) => handle,
            None => {
                let filters = self.filters();
                match self.host.request_port(&filters) {
                    Ok(Some(info)) => TransportHandle::new(info),
                    Ok(None) => {
                        self.log("No port selected.");
                        return Err(Error::PortSelectionFailed);
                    },
                    Err(e) => {
                        self.log(&format!("{}: {e}", wording.open_error));
                        return Err(e);
                    },
                }
            },
        };

        let baud = self.config.monitor_baud;
        let serial = SerialConfig::new(handle.name(), baud);
        if let Err(e) = handle.open(&mut self.host, &serial) {
            self.log(&format!("{}: {e}", wording.open_error));
            self.set_ownership(Ownership::Idle {
                retained: Some(handle),
            });
            return Err(e);
        }
        match self.class {
            DeviceClass::Esp32 => self.log(&format!("Serial Monitor Started ({baud} baud)")),
            DeviceClass::Bw16 => self.log(&format!("Port Opened ({baud})")),
        }

        if self.config.reset_on_monitor {
            self.pulse_reset_lines(&mut handle);
        }

        let monitor = handle
            .reader()
            .and_then(|reader| SerialMonitor::spawn(reader, Arc::clone(&self.sink), wording.read_error));
        match monitor {
            Ok(monitor) => {
                info!("Monitoring {} at {baud} baud", handle.name());
                self.set_ownership(Ownership::Monitor { handle, monitor });
                Ok(())
            },
            Err(e) => {
                self.log(&format!("{}: {e}", wording.open_error));
                self.set_ownership(Ownership::Idle {
                    retained: Some(handle),
                });
                Err(e)
            },
        }
    }

    fn pulse_reset_lines(&self, handle: &mut TransportHandle) {
        let hold = self.config.reset_hold;
        let mut pulse = || -> Result<()> {
            handle.set_signals(Signals::new(false, true))?;
            thread::sleep(hold);
            handle.set_signals(Signals::new(true, false))?;
            thread::sleep(hold);
            handle.set_signals(Signals::new(false, false))
        };
        if let Err(e) = pulse() {
            warn!("Reset pulse failed: {e}");
            self.log(&format!("Reset signal warning: {e}"));
        }
    }

    /// Pulse DTR/RTS to reboot the chip into its application.
    ///
    /// Signal failures are logged and never fatal; only the absence of an
    /// open port is an error.
    pub fn pulse_reset(&mut self) -> Result<()> {
        let mut ownership = self.take_ownership();
        let result = match &mut ownership {
            Ownership::Monitor { handle, .. } => {
                self.pulse_reset_lines(handle);
                Ok(())
            },
            Ownership::Idle {
                retained: Some(handle),
            } if handle.is_open() => {
                self.pulse_reset_lines(handle);
                Ok(())
            },
            _ => Err(Error::NotConnected),
        };
        self.ownership = ownership;
        if let Err(e) = &result {
            self.log(&format!("Reset signal warning: {e}"));
        }
        result
    }

    /// Stop the serial monitor. The port stays open and is retained, so a
    /// later monitor run or raw upload reuses it without prompting.
    ///
    /// Returns how the read loop ended, or `None` when no monitor was
    /// running (in which case nothing is logged).
    pub fn release_from_monitor(&mut self) -> Option<MonitorOutcome> {
        let (handle, monitor) = match self.take_ownership() {
            Ownership::Monitor { handle, monitor } => (handle, monitor),
            other => {
                self.ownership = other;
                return None;
            },
        };

        let outcome = monitor.stop();
        debug!("Monitor on {} stopped after {} bytes", handle.name(), outcome.bytes_received);
        self.log(Wording::for_class(self.class).stopped);
        self.set_ownership(Ownership::Idle {
            retained: Some(handle),
        });
        Some(outcome)
    }

    /// Collect a monitor whose read loop ended on its own (device gone,
    /// read error), returning the session to idle.
    pub fn poll_monitor(&mut self) -> Option<MonitorOutcome> {
        match &self.ownership {
            Ownership::Monitor { monitor, .. } if monitor.is_finished() => {},
            _ => return None,
        }
        let Ownership::Monitor { handle, monitor } = self.take_ownership() else {
            return None;
        };

        let outcome = monitor.join();
        debug!("Monitor on {} ended: {:?}", handle.name(), outcome.exit);
        self.set_ownership(Ownership::Idle {
            retained: Some(handle),
        });
        Some(outcome)
    }

    /// Write `payload` at the hexadecimal `offset` through the bootloader.
    ///
    /// The offset is validated before anything touches the device.
    pub fn flash<F>(
        &mut self,
        name: &str,
        payload: &[u8],
        offset: &str,
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(Progress),
    {
        let sink = Arc::clone(&self.sink);
        let address = match parse_flash_offset(offset) {
            Ok(address) => address,
            Err(e) => {
                sink.append_line(&format!("Flash failed: {e}"));
                return Err(e);
            },
        };
        let Ownership::Bootloader { client } = &mut self.ownership else {
            sink.append_line(&format!("Flash failed: {}", Error::NotConnected));
            return Err(Error::NotConnected);
        };

        sink.append_line(&format!("Flashing {name} at {offset}..."));
        info!("Flashing {} bytes at 0x{address:08X}", payload.len());
        let images = [FlashImage::new(address, payload.to_vec())];
        let mut progress = |_index: usize, written: usize, total: usize| {
            on_progress(Progress {
                transferred: written,
                total,
            });
        };

        match client.write_firmware(&images, WriteOptions::single_image(&mut progress)) {
            Ok(()) => {
                sink.append_line("Flashing complete! Please RESET the board.");
                Ok(())
            },
            Err(e) => {
                sink.append_line(&format!("Flash failed: {e}"));
                Err(e)
            },
        }
    }

    /// Erase the whole flash through the bootloader.
    pub fn erase(&mut self) -> Result<()> {
        let sink = Arc::clone(&self.sink);
        let Ownership::Bootloader { client } = &mut self.ownership else {
            sink.append_line(&format!("Erase failed: {}", Error::NotConnected));
            return Err(Error::NotConnected);
        };

        sink.append_line("Erasing flash...");
        match client.erase_all() {
            Ok(()) => {
                sink.append_line("Erase complete! Please RESET the board.");
                Ok(())
            },
            Err(e) => {
                sink.append_line(&format!("Erase failed: {e}"));
                Err(e)
            },
        }
    }

    /// Send `payload` as a paced raw upload.
    ///
    /// Only classes that accept raw uploads may call this. Needs an open
    /// port: either alongside the running monitor, or a retained open port
    /// while idle (the session is owned by the uploader for the duration).
    pub fn upload<F>(&mut self, name: &str, payload: &[u8], on_progress: F) -> Result<UploadReport>
    where
        F: FnMut(Progress),
    {
        if !self.class.accepts_raw_upload() {
            let err = Error::Unsupported(format!("raw upload to {}", self.class));
            self.log(&format!("Upload Error: {err}"));
            return Err(err);
        }
        self.upload_cancel.reset();
        let uploader =
            ChunkedUploader::new(self.config.upload).with_cancel(self.upload_cancel.clone());
        let sink = Arc::clone(&self.sink);

        if let Ownership::Monitor { handle, .. } = &self.ownership {
            return run_upload(&uploader, handle, sink.as_ref(), name, payload, on_progress);
        }

        let handle = match self.take_ownership() {
            Ownership::Idle {
                retained: Some(handle),
            } if handle.is_open() => handle,
            other => {
                self.ownership = other;
                sink.append_line("Port not writable.");
                return Err(Error::NotConnected);
            },
        };

        self.set_ownership(Ownership::Uploader);
        let result = run_upload(&uploader, &handle, sink.as_ref(), name, payload, on_progress);
        self.set_ownership(Ownership::Idle {
            retained: Some(handle),
        });
        result
    }

    /// Clear the session console.
    pub fn clear_log(&self) {
        self.sink.clear();
    }

    /// Release whichever component owns the port and close it.
    pub fn shutdown(&mut self) {
        match self.take_ownership() {
            Ownership::Bootloader { mut client } => {
                if let Err(e) = client.disconnect() {
                    warn!("Bootloader disconnect failed: {e}");
                }
                let mut handle = client.into_handle();
                if handle.wait_for_unlock(self.config.unlock_timeout).is_ok() {
                    close_quietly(&mut handle);
                }
            },
            Ownership::Monitor {
                mut handle,
                monitor,
            } => {
                monitor.stop();
                close_quietly(&mut handle);
            },
            Ownership::Idle {
                retained: Some(mut handle),
            } => close_quietly(&mut handle),
            Ownership::Idle { retained: None } | Ownership::Uploader => {},
        }
        self.chip = None;
        self.set_ownership(Ownership::Idle { retained: None });
        debug!("{} session shut down", self.class);
    }
}

impl<H: PortHost> Drop for Coordinator<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Close on teardown, where a failure can only be reported.
fn close_quietly(handle: &mut TransportHandle) {
    if let Err(e) = handle.close() {
        warn!("Could not close {}: {e}", handle.name());
    }
}

fn run_upload<F>(
    uploader: &ChunkedUploader,
    handle: &TransportHandle,
    sink: &dyn LogSink,
    name: &str,
    payload: &[u8],
    mut on_progress: F,
) -> Result<UploadReport>
where
    F: FnMut(Progress),
{
    sink.append_line(&format!("Uploading {name} ({} bytes)...", payload.len()));
    let result = uploader.upload(handle, payload, |p| {
        sink.append_line(&format!("Sent {}/{} bytes", p.transferred, p.total));
        on_progress(p);
    });
    match &result {
        Ok(report) => {
            info!(
                "Uploaded {} bytes in {} chunks ({:?})",
                report.bytes_sent, report.chunks, report.elapsed
            );
            sink.append_line("Upload finished.");
        },
        Err(e) => sink.append_line(&format!("Upload Error: {e}")),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::test_support::{FakeConnector, MockHost, MockPort, SignalCall};

    fn quick_config(class: DeviceClass) -> SessionConfig {
        SessionConfig {
            unlock_timeout: Duration::from_millis(100),
            reset_hold: Duration::from_millis(1),
            upload: UploadOptions::new(256, Duration::ZERO),
            ..SessionConfig::for_class(class)
        }
    }

    fn esp_session(port: &MockPort) -> (Coordinator<MockHost>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new("esp-console"));
        let coordinator = Coordinator::new(DeviceClass::Esp32, MockHost::new(port), sink.clone())
            .with_config(quick_config(DeviceClass::Esp32))
            .with_connector(Box::new(FakeConnector::default()));
        (coordinator, sink)
    }

    fn bw16_session(port: &MockPort) -> (Coordinator<MockHost>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new("bw16-console"));
        let coordinator = Coordinator::new(DeviceClass::Bw16, MockHost::new(port), sink.clone())
            .with_config(quick_config(DeviceClass::Bw16));
        (coordinator, sink)
    }

    #[test]
    fn test_bootloader_connect_logs_chip() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, sink) = esp_session(&port);

        let chip = session.acquire_for_bootloader().unwrap();
        assert_eq!(chip, "ESP32-S3");
        assert_eq!(session.state(), SessionState::Bootloader);
        assert_eq!(session.chip_name(), Some("ESP32-S3"));
        assert_eq!(
            sink.lines(),
            vec![
                "Connecting...",
                "Note: If connection fails, hold BOOT button.",
                "Connected to ESP32-S3",
            ]
        );

        let err = session.acquire_for_bootloader().unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyOwned {
                owner: SessionState::Bootloader
            }
        ));
    }

    #[test]
    fn test_bootloader_connect_failure_returns_to_idle() {
        let port = MockPort::new("/dev/ttyUSB0");
        let sink = Arc::new(MemorySink::new("esp-console"));
        let mut session = Coordinator::new(DeviceClass::Esp32, MockHost::new(&port), sink.clone())
            .with_config(quick_config(DeviceClass::Esp32))
            .with_connector(Box::new(FakeConnector {
                fail_connect: true,
                ..FakeConnector::default()
            }));

        let err = session.acquire_for_bootloader().unwrap_err();
        assert!(matches!(err, Error::DeviceProtocol(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(sink.has_line_containing("Connection Error: "));
        assert!(sink.has_line_containing("Try holding BOOT button while connecting."));
    }

    #[test]
    fn test_bootloader_requires_connector() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, _sink) = bw16_session(&port);
        assert!(matches!(
            session.acquire_for_bootloader(),
            Err(Error::Unsupported(_))
        ));
        assert_eq!(session.host_mut().prompts, 0);
    }

    #[test]
    fn test_release_from_monitor_when_idle_is_silent() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, sink) = esp_session(&port);
        assert!(session.release_from_monitor().is_none());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn test_monitor_pulses_reset_for_esp32_only() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut esp, _) = esp_session(&port);
        esp.acquire_for_monitor().unwrap();
        assert_eq!(
            port.state().signals,
            vec![
                SignalCall::Dtr(false),
                SignalCall::Rts(true),
                SignalCall::Dtr(true),
                SignalCall::Rts(false),
                SignalCall::Dtr(false),
                SignalCall::Rts(false),
            ]
        );
        esp.release_from_monitor().unwrap();

        let bw16_port = MockPort::new("/dev/ttyUSB1");
        let (mut bw16, sink) = bw16_session(&bw16_port);
        bw16.acquire_for_monitor().unwrap();
        assert!(bw16_port.state().signals.is_empty());
        assert_eq!(sink.lines(), vec!["Port Opened (115200)"]);
    }

    #[test]
    fn test_reset_signal_failure_is_only_a_warning() {
        let port = MockPort::new("/dev/ttyUSB0");
        port.state().fail_signals = true;
        let (mut session, sink) = esp_session(&port);

        session.acquire_for_monitor().unwrap();
        assert_eq!(session.state(), SessionState::Monitor);
        assert!(sink.has_line_containing("Reset signal warning: "));
    }

    #[test]
    fn test_reset_without_open_port_is_logged() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, sink) = esp_session(&port);
        session.acquire_for_bootloader().unwrap();
        let before = sink.lines().len();

        let err = session.pulse_reset().unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(session.state(), SessionState::Bootloader);
        assert_eq!(
            sink.lines()[before..],
            [format!("Reset signal warning: {}", Error::NotConnected)]
        );

        let idle_port = MockPort::new("/dev/ttyUSB1");
        let (mut idle, idle_sink) = bw16_session(&idle_port);
        assert!(idle.pulse_reset().is_err());
        assert!(idle_sink.has_line_containing("Reset signal warning: "));
    }

    #[test]
    fn test_monitor_cancelled_selection() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, sink) = esp_session(&port);
        session.host_mut().offer = false;

        let err = session.acquire_for_monitor().unwrap_err();
        assert!(matches!(err, Error::PortSelectionFailed));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(sink.lines(), vec!["No port selected."]);
    }

    #[test]
    fn test_upload_requires_open_port() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, sink) = bw16_session(&port);
        let err = session.upload("fw.bin", b"abc", |_| {}).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(sink.lines(), vec!["Port not writable."]);
    }

    #[test]
    fn test_upload_alongside_monitor() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, sink) = bw16_session(&port);
        session.acquire_for_monitor().unwrap();

        let report = session.upload("fw.bin", &[7u8; 300], |_| {}).unwrap();
        assert_eq!(report.bytes_sent, 300);
        assert_eq!(session.state(), SessionState::Monitor);
        assert_eq!(
            sink.lines(),
            vec![
                "Port Opened (115200)",
                "Uploading fw.bin (300 bytes)...",
                "Sent 256/300 bytes",
                "Sent 300/300 bytes",
                "Upload finished.",
            ]
        );
    }

    #[test]
    fn test_esp32_rejects_raw_upload() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, sink) = esp_session(&port);
        session.acquire_for_monitor().unwrap();
        assert!(!session.controls().upload);
        let writes_before = port.state().writes.len();

        let err = session.upload("x.bin", &[0u8; 8], |_| {}).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(session.state(), SessionState::Monitor);
        assert_eq!(port.state().writes.len(), writes_before);
        assert!(sink.has_line_containing("Upload Error: "));
    }

    #[test]
    fn test_state_listener_sees_transitions() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, _) = esp_session(&port);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        session.on_state_change(Box::new(move |state, controls| {
            record.lock().unwrap().push((state, controls.connect_label));
        }));

        session.acquire_for_bootloader().unwrap();
        session.acquire_for_monitor().unwrap();
        session.release_from_monitor().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SessionState::Bootloader, "Connected"),
                (SessionState::Idle, "Connect"),
                (SessionState::Monitor, "Monitor Active"),
                (SessionState::Idle, "Connect"),
            ]
        );
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, _) = esp_session(&port);
        session.acquire_for_monitor().unwrap();
        session.shutdown();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.has_retained_port());
        assert!(port.state().closed);
    }

    #[test]
    fn test_upload_from_idle_with_open_port() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, sink) = bw16_session(&port);
        session.acquire_for_monitor().unwrap();
        session.release_from_monitor().unwrap();
        assert!(sink.has_line_containing("Serial Monitor Stopped."));

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        session.on_state_change(Box::new(move |state, controls| {
            record.lock().unwrap().push((state, controls.enabled().len()));
        }));

        let report = session.upload("fw.bin", &[1u8; 10], |_| {}).unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(SessionState::Uploader, 0), (SessionState::Idle, 1)]
        );
        assert!(session.has_retained_port());
    }

    #[test]
    fn test_monitor_restart_reuses_open_port() {
        let port = MockPort::new("/dev/ttyUSB0");
        let (mut session, _) = bw16_session(&port);
        session.acquire_for_monitor().unwrap();
        session.release_from_monitor().unwrap();
        session.acquire_for_monitor().unwrap();

        assert_eq!(session.state(), SessionState::Monitor);
        assert_eq!(session.host_mut().prompts, 1);
        assert_eq!(session.host_mut().opens, 1);
    }

    #[test]
    fn test_poll_monitor_collects_finished_loop() {
        let port = MockPort::new("/dev/ttyUSB0");
        port.push_read(crate::test_support::ScriptedRead::Eof);
        let (mut session, _) = bw16_session(&port);
        session.acquire_for_monitor().unwrap();

        let mut outcome = None;
        for _ in 0..100 {
            outcome = session.poll_monitor();
            if outcome.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            outcome.map(|o| o.exit),
            Some(crate::monitor::MonitorExit::EndOfStream)
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.has_retained_port());
    }
}
