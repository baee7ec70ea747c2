//! ESP32 ROM bootloader client backed by the `espflash` crate.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use boardflash::{
    BootloaderClient, BootloaderConnector, Error, ExclusiveLease, FlashImage, LogSink, Result,
    TransportHandle, WriteOptions,
};
use espflash::connection::{Connection, ResetAfterOperation, ResetBeforeOperation};
use espflash::flasher::Flasher;
use espflash::image_format::Segment;
use espflash::target::ProgressCallbacks;
use log::{debug, info};
use serialport::{SerialPortType, UsbPortInfo};

/// Opens espflash connections on the session's port.
#[derive(Debug, Default)]
pub(crate) struct EspflashConnector;

impl BootloaderConnector for EspflashConnector {
    fn attach(
        &mut self,
        handle: TransportHandle,
        baud: u32,
        terminal: Arc<dyn LogSink>,
    ) -> Result<Box<dyn BootloaderClient>> {
        // espflash drives the port through its own native handle; the lease
        // keeps the monitor and uploader off it meanwhile.
        let lease = handle.lease()?;
        Ok(Box::new(EspflashClient {
            handle,
            lease: Some(lease),
            baud,
            terminal,
            flasher: None,
        }))
    }
}

struct EspflashClient {
    handle: TransportHandle,
    lease: Option<ExclusiveLease>,
    baud: u32,
    terminal: Arc<dyn LogSink>,
    flasher: Option<Flasher>,
}

fn protocol_error(e: impl std::fmt::Display) -> Error {
    Error::DeviceProtocol(e.to_string())
}

impl EspflashClient {
    fn flasher(&mut self) -> Result<&mut Flasher> {
        self.flasher.as_mut().ok_or(Error::NotConnected)
    }

    fn usb_info(&self) -> UsbPortInfo {
        let found = serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.port_name == self.handle.name());
        match found.map(|p| p.port_type) {
            Some(SerialPortType::UsbPort(info)) => info,
            _ => UsbPortInfo {
                vid: 0,
                pid: 0,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        }
    }
}

impl BootloaderClient for EspflashClient {
    fn connect(&mut self) -> Result<()> {
        let serial = serialport::new(self.handle.name(), self.baud)
            .timeout(Duration::from_millis(3000))
            .open_native()?;
        let connection = Connection::new(
            serial,
            self.usb_info(),
            ResetAfterOperation::HardReset,
            ResetBeforeOperation::DefaultReset,
            self.baud,
        );
        debug!("Syncing with ROM bootloader on {}", self.handle.name());
        let flasher =
            Flasher::connect(connection, true, true, true, None, None).map_err(protocol_error)?;
        self.flasher = Some(flasher);
        Ok(())
    }

    fn identify(&mut self) -> Result<String> {
        let info = self.flasher()?.device_info().map_err(protocol_error)?;
        info!("Detected {} ({} flash)", info.chip, info.flash_size);
        Ok(info.chip.to_string())
    }

    fn erase_all(&mut self) -> Result<()> {
        self.flasher()?.erase_flash().map_err(protocol_error)
    }

    fn write_firmware(&mut self, images: &[FlashImage], options: WriteOptions<'_>) -> Result<()> {
        if options.erase_all {
            self.erase_all()?;
        }
        debug!(
            "Writing {} image(s), compress={} verify={} flash_size={:?}",
            images.len(),
            options.compress,
            options.verify,
            options.flash_size
        );
        let segments: Vec<Segment<'_>> = images
            .iter()
            .map(|image| Segment {
                addr: image.address,
                data: Cow::Borrowed(&image.data),
            })
            .collect();
        let mut progress = SegmentProgress {
            addresses: images.iter().map(|i| i.address).collect(),
            index: 0,
            total: 0,
            report: options.progress,
            terminal: Arc::clone(&self.terminal),
        };
        self.flasher()?
            .write_bins_to_flash(&segments, &mut progress)
            .map_err(protocol_error)
    }

    fn disconnect(&mut self) -> Result<()> {
        // Dropping the flasher closes espflash's handle on the port.
        self.flasher = None;
        self.lease = None;
        Ok(())
    }

    fn into_handle(self: Box<Self>) -> TransportHandle {
        let this = *self;
        this.handle
    }
}

/// Maps espflash's per-segment callbacks onto `(index, written, total)`.
struct SegmentProgress<'a> {
    addresses: Vec<u32>,
    index: usize,
    total: usize,
    report: &'a mut dyn FnMut(usize, usize, usize),
    terminal: Arc<dyn LogSink>,
}

impl ProgressCallbacks for SegmentProgress<'_> {
    fn init(&mut self, addr: u32, total: usize) {
        self.index = self
            .addresses
            .iter()
            .position(|a| *a == addr)
            .unwrap_or(self.index);
        self.total = total;
        (self.report)(self.index, 0, total);
    }

    fn update(&mut self, current: usize) {
        (self.report)(self.index, current.min(self.total), self.total);
    }

    fn verifying(&mut self) {
        self.terminal.append_line("Verifying...");
    }

    fn finish(&mut self, skipped: bool) {
        if skipped {
            self.terminal
                .append_line(&format!("Segment {} unchanged, skipped.", self.index + 1));
        }
        (self.report)(self.index, self.total, self.total);
    }
}
