//! Host-side utilities for serial port discovery.

use log::info;

use crate::device::{DetectedPort, DeviceClass};
use crate::error::{Error, Result};

/// Discover all available serial ports.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    crate::device::detect_ports()
}

/// Discover serial ports whose USB identity matches a device class.
#[must_use]
pub fn discover_ports_for(class: DeviceClass) -> Vec<DetectedPort> {
    discover_ports()
        .into_iter()
        .filter(|p| class.accepts(p))
        .collect()
}

/// Auto-detect the single port for a device class.
///
/// Fails when no port matches; when several match, the first is used.
pub fn auto_detect_port(class: DeviceClass) -> Result<DetectedPort> {
    let mut ports = discover_ports_for(class);
    if ports.is_empty() {
        return Err(Error::DeviceNotFound(class.to_string()));
    }

    let port = ports.remove(0);
    info!(
        "Auto-detected {} port {} ({})",
        class,
        port.name,
        port.device.name()
    );
    Ok(port)
}
