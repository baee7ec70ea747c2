//! `boardflash.toml` handling.
//!
//! Settings are layered, later layers winning: the per-user file under the
//! platform config directory, then `./boardflash.toml`, then `BOARDFLASH_*`
//! environment variables and finally flags. Environment and flags are
//! applied by clap; this module only deals with the two files, or with the
//! single file named by `--config`.

use boardflash::{DeviceClass, SessionConfig, UploadOptions, UsbFilter};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCAL_CONFIG: &str = "boardflash.toml";
const GLOBAL_CONFIG: &str = "config.toml";

/// Extra VID/PID pair accepted by the port chooser.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// Vendor id.
    pub vid: u16,
    /// Product id.
    pub pid: u16,
}

impl From<UsbDevice> for UsbFilter {
    fn from(device: UsbDevice) -> Self {
        UsbFilter::new(device.vid, device.pid)
    }
}

/// `[port]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Device used without prompting, like `--port`.
    pub serial: Option<String>,
    /// Extra USB devices offered by the chooser.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// ESP32 session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EspConfig {
    /// Bootloader baud rate.
    pub baud: Option<u32>,
    /// Monitor baud rate.
    pub monitor_baud: Option<u32>,
    /// How long to wait for the bootloader to let go of the port.
    pub unlock_timeout_ms: Option<u64>,
}

/// BW16 session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bw16Config {
    /// Monitor and upload baud rate.
    pub baud: Option<u32>,
    /// Raw upload chunk size in bytes.
    pub chunk_size: Option<usize>,
    /// Pause between raw upload chunks.
    pub chunk_delay_ms: Option<u64>,
}

/// Parsed `boardflash.toml`; every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// `[port]`.
    #[serde(default)]
    pub port: PortConfig,
    /// `[esp]`.
    #[serde(default)]
    pub esp: EspConfig,
    /// `[bw16]`.
    #[serde(default)]
    pub bw16: Bw16Config,
}

/// Replace `slot` when the higher layer set a value.
fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl Config {
    /// Merge the per-user file and the local file, in that order.
    pub fn load() -> Self {
        let layers = Self::global_config_path()
            .into_iter()
            .chain(std::iter::once(PathBuf::from(LOCAL_CONFIG)));

        let mut config = Self::default();
        for path in layers {
            if let Some(layer) = Self::read_layer(&path) {
                debug!("Config layer {} applied", path.display());
                config.merge(layer);
            }
        }
        config
    }

    /// Use exactly one file (`--config`); defaults when it is unusable.
    pub fn load_from_path(path: &Path) -> Self {
        Self::read_layer(path).unwrap_or_else(|| {
            warn!("Ignoring {}: falling back to built-in defaults", path.display());
            Self::default()
        })
    }

    /// Parse one file. Absent files are silent; unreadable or malformed
    /// ones are reported and skipped.
    fn read_layer(path: &Path) -> Option<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot read {}: {e}", path.display());
                return None;
            },
        };
        toml::from_str(&text)
            .inspect_err(|e| warn!("Malformed config {}: {e}", path.display()))
            .ok()
    }

    /// Per-user config directory, e.g. `~/.config/boardflash` on Linux.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "boardflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// `config.toml` inside [`Config::global_config_dir`].
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG))
    }

    fn merge(&mut self, other: Self) {
        overlay(&mut self.port.serial, other.port.serial);
        for device in other.port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        overlay(&mut self.esp.baud, other.esp.baud);
        overlay(&mut self.esp.monitor_baud, other.esp.monitor_baud);
        overlay(&mut self.esp.unlock_timeout_ms, other.esp.unlock_timeout_ms);

        overlay(&mut self.bw16.baud, other.bw16.baud);
        overlay(&mut self.bw16.chunk_size, other.bw16.chunk_size);
        overlay(&mut self.bw16.chunk_delay_ms, other.bw16.chunk_delay_ms);
    }

    /// Session settings for `class`, with `baud_override` (from `--baud`)
    /// taking precedence over the file.
    pub fn session_config(&self, class: DeviceClass, baud_override: Option<u32>) -> SessionConfig {
        let mut session = SessionConfig::for_class(class);
        session.extra_filters = self.port.usb_device.iter().copied().map(Into::into).collect();

        match class {
            DeviceClass::Esp32 => {
                if let Some(baud) = baud_override.or(self.esp.baud) {
                    session.bootloader_baud = baud;
                }
                if let Some(baud) = self.esp.monitor_baud {
                    session.monitor_baud = baud;
                }
                if let Some(ms) = self.esp.unlock_timeout_ms {
                    session.unlock_timeout = Duration::from_millis(ms);
                }
            },
            DeviceClass::Bw16 => {
                if let Some(baud) = baud_override.or(self.bw16.baud) {
                    session.bootloader_baud = baud;
                    session.monitor_baud = baud;
                }
                session.upload = UploadOptions::new(
                    self.bw16.chunk_size.unwrap_or(session.upload.chunk_size),
                    self.bw16
                        .chunk_delay_ms
                        .map_or(session.upload.inter_chunk_delay, Duration::from_millis),
                );
            },
        }
        session
    }

    /// Add a VID/PID to the chooser filters and persist it.
    ///
    /// Written to the local file when one exists, otherwise to the per-user
    /// file. Other settings in the target file are preserved.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }
        self.port.usb_device.push(device);

        let target = Self::save_target()?;
        let mut stored = Self::read_layer(&target).unwrap_or_default();
        stored.port.usb_device.push(device);
        fs::write(&target, toml::to_string_pretty(&stored)?)?;
        info!("Remembered USB device {vid:04x}:{pid:04x} in {}", target.display());
        Ok(())
    }

    fn save_target() -> anyhow::Result<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            return Ok(local);
        }
        match Self::global_config_dir() {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                Ok(dir.join(GLOBAL_CONFIG))
            },
            None => Ok(local),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_sets_nothing() {
        let config = Config::default();
        assert!(config.port.serial.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.esp.baud.is_none());
        assert!(config.bw16.chunk_size.is_none());
    }

    #[test]
    fn test_usb_device_into_filter() {
        let filter: UsbFilter = UsbDevice { vid: 0x1A86, pid: 0x7523 }.into();
        assert_eq!(filter, UsbFilter::new(0x1A86, 0x7523));
    }

    #[test]
    fn test_config_merge_overrides_set_values_only() {
        let mut base = Config::default();
        base.port.serial = Some("/dev/ttyUSB0".to_string());
        base.esp.baud = Some(115200);

        let mut other = Config::default();
        other.esp.baud = Some(921600);
        other.bw16.chunk_size = Some(512);

        base.merge(other);
        assert_eq!(base.port.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.esp.baud, Some(921600));
        assert_eq!(base.bw16.chunk_size, Some(512));
    }

    #[test]
    fn test_config_merge_usb_devices_dedup() {
        let ch340 = UsbDevice { vid: 0x1A86, pid: 0x7523 };
        let cp2102 = UsbDevice { vid: 0x10C4, pid: 0xEA60 };
        let mut lower = Config {
            port: PortConfig { serial: None, usb_device: vec![ch340] },
            ..Config::default()
        };
        let upper = Config {
            port: PortConfig { serial: None, usb_device: vec![ch340, cp2102] },
            ..Config::default()
        };

        lower.merge(upper);
        assert_eq!(lower.port.usb_device, vec![ch340, cp2102]);
    }

    #[test]
    fn test_parse_all_sections() {
        let text = r#"
[port]
serial = "/dev/ttyUSB0"

[[port.usb_device]]
vid = 6790
pid = 29987

[esp]
baud = 460800
unlock_timeout_ms = 3000

[bw16]
chunk_size = 128
chunk_delay_ms = 20
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.port.usb_device, vec![UsbDevice { vid: 6790, pid: 29987 }]);
        assert_eq!(config.esp.baud, Some(460800));
        assert_eq!(config.esp.unlock_timeout_ms, Some(3000));
        assert_eq!(config.bw16.chunk_size, Some(128));
        assert_eq!(config.bw16.chunk_delay_ms, Some(20));
    }

    #[test]
    fn test_parse_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.serial.is_none());
        assert!(config.esp.monitor_baud.is_none());
    }

    #[test]
    fn test_session_config_defaults() {
        let session = Config::default().session_config(DeviceClass::Bw16, None);
        assert_eq!(session, SessionConfig::for_class(DeviceClass::Bw16));
    }

    #[test]
    fn test_session_config_applies_file_and_override() {
        let mut config = Config::default();
        config.esp.baud = Some(460800);
        config.esp.unlock_timeout_ms = Some(2500);
        config.bw16.chunk_size = Some(64);
        config.bw16.chunk_delay_ms = Some(5);
        config.port.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x55D4 });

        let esp = config.session_config(DeviceClass::Esp32, None);
        assert_eq!(esp.bootloader_baud, 460800);
        assert_eq!(esp.monitor_baud, 115200);
        assert_eq!(esp.unlock_timeout, Duration::from_millis(2500));
        assert_eq!(esp.extra_filters, vec![UsbFilter::new(0x1A86, 0x55D4)]);

        let esp = config.session_config(DeviceClass::Esp32, Some(921600));
        assert_eq!(esp.bootloader_baud, 921600);

        let bw16 = config.session_config(DeviceClass::Bw16, Some(57600));
        assert_eq!(bw16.monitor_baud, 57600);
        assert_eq!(bw16.upload.chunk_size, 64);
        assert_eq!(bw16.upload.inter_chunk_delay, Duration::from_millis(5));
    }

    #[test]
    fn test_explicit_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        fs::write(
            &path,
            r#"
[port]
serial = "/dev/ttyACM2"
[bw16]
baud = 57600
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyACM2"));
        assert_eq!(config.bw16.baud, Some(57600));
    }

    #[test]
    fn test_load_from_path_unparsable_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[esp\nbaud = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.esp.baud.is_none());
    }

    #[test]
    fn test_missing_explicit_file_uses_defaults() {
        let config = Config::load_from_path(Path::new("/no/such/dir/boardflash.toml"));
        assert!(config.port.serial.is_none());
    }

    #[test]
    fn test_global_path_lives_in_project_dir() {
        if let Some(path) = Config::global_config_path() {
            assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(GLOBAL_CONFIG));
            assert!(path.to_string_lossy().contains("boardflash"));
        }
    }
}
