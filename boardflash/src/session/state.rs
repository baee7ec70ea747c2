//! Session ownership states and the controls each state enables.

use std::fmt;

use crate::device::DeviceClass;

/// Which component owns a session's serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Nobody; a port may still be retained for reuse.
    Idle,
    /// A bootloader client holds the port.
    Bootloader,
    /// The serial monitor holds the readable side.
    Monitor,
    /// A raw upload holds the writable side.
    Uploader,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Bootloader => "bootloader",
            Self::Monitor => "monitor",
            Self::Uploader => "uploader",
        })
    }
}

/// Enablement of every user action for one (device class, state) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    /// Connect (bootloader for ESP32, raw link for BW16).
    pub connect: bool,
    /// Flash a firmware image.
    pub flash: bool,
    /// Erase the whole flash.
    pub erase: bool,
    /// Start the serial monitor.
    pub monitor_start: bool,
    /// Stop the serial monitor.
    pub monitor_stop: bool,
    /// Raw upload.
    pub upload: bool,
    /// Caption of the connect control.
    pub connect_label: &'static str,
}

impl Controls {
    const NONE: Self = Self {
        connect: false,
        flash: false,
        erase: false,
        monitor_start: false,
        monitor_stop: false,
        upload: false,
        connect_label: "Connect",
    };

    /// Controls for `state` in a session of `class`.
    pub fn for_state(class: DeviceClass, state: SessionState) -> Self {
        match (class, state) {
            (_, SessionState::Idle) => Self {
                connect: true,
                ..Self::NONE
            },
            (_, SessionState::Uploader) => Self {
                connect_label: "Uploading",
                ..Self::NONE
            },
            (DeviceClass::Esp32, SessionState::Bootloader) => Self {
                flash: true,
                erase: true,
                monitor_start: true,
                connect_label: "Connected",
                ..Self::NONE
            },
            (DeviceClass::Esp32, SessionState::Monitor) => Self {
                monitor_stop: true,
                connect_label: "Monitor Active",
                ..Self::NONE
            },
            (DeviceClass::Bw16, SessionState::Monitor) => Self {
                monitor_stop: true,
                upload: true,
                connect_label: "Connected",
                ..Self::NONE
            },
            // BW16 never hands its port to a bootloader client.
            (DeviceClass::Bw16, SessionState::Bootloader) => Self {
                connect_label: "Connected",
                ..Self::NONE
            },
        }
    }

    /// Names of the enabled actions, in display order.
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            (self.connect, "connect"),
            (self.flash, "flash"),
            (self.erase, "erase"),
            (self.monitor_start, "monitor"),
            (self.monitor_stop, "stop"),
            (self.upload, "upload"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esp32_controls_follow_owner() {
        let idle = Controls::for_state(DeviceClass::Esp32, SessionState::Idle);
        assert_eq!(idle.enabled(), vec!["connect"]);
        assert_eq!(idle.connect_label, "Connect");

        let boot = Controls::for_state(DeviceClass::Esp32, SessionState::Bootloader);
        assert_eq!(boot.enabled(), vec!["flash", "erase", "monitor"]);
        assert_eq!(boot.connect_label, "Connected");

        let monitor = Controls::for_state(DeviceClass::Esp32, SessionState::Monitor);
        assert_eq!(monitor.enabled(), vec!["stop"]);
        assert_eq!(monitor.connect_label, "Monitor Active");
    }

    #[test]
    fn test_bw16_controls_follow_owner() {
        let idle = Controls::for_state(DeviceClass::Bw16, SessionState::Idle);
        assert_eq!(idle.enabled(), vec!["connect"]);

        let monitor = Controls::for_state(DeviceClass::Bw16, SessionState::Monitor);
        assert_eq!(monitor.enabled(), vec!["stop", "upload"]);
        assert_eq!(monitor.connect_label, "Connected");
    }

    #[test]
    fn test_uploader_disables_everything() {
        for class in DeviceClass::ALL {
            let controls = Controls::for_state(class, SessionState::Uploader);
            assert!(controls.enabled().is_empty());
            assert_eq!(controls.connect_label, "Uploading");
        }
    }
}
