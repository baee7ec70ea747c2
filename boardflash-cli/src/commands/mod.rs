//! Command implementations.
//!
//! Each board family and utility command lives in its own module; they all
//! drive a [`Coordinator`] built by [`open_session`].

pub(crate) mod bw16;
pub(crate) mod completions;
pub(crate) mod esp;
pub(crate) mod monitor;
pub(crate) mod ports;
pub(crate) mod session;

use anyhow::{Context, Result};
use boardflash::{BootloaderConnector, Coordinator, DeviceClass, LogSink, NativeHost};
use log::debug;
use rust_i18n::t;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::serial::{SerialOptions, build_host};
use crate::terminal::ConsoleSink;
use crate::{Cli, interrupt};

/// A session wired to the terminal.
pub(crate) struct Session {
    pub coordinator: Coordinator<NativeHost>,
    pub console: Arc<ConsoleSink>,
}

/// Build a `class` session from CLI options and configuration.
pub(crate) fn open_session(cli: &Cli, config: &Config, class: DeviceClass) -> Session {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };
    let host = build_host(&options, config, class);
    let console = Arc::new(ConsoleSink::new(class.channel()));
    let sink: Arc<dyn LogSink> = console.clone();

    let session_config = config.session_config(class, cli.baud);
    debug!("{class} session: {session_config:?}");
    let mut coordinator = Coordinator::new(class, host, sink).with_config(session_config);
    if class.uses_bootloader() {
        if let Some(connector) = bootloader_connector() {
            coordinator = coordinator.with_connector(connector);
        }
    }
    interrupt::cancel_on_interrupt(coordinator.upload_cancel_token());

    Session {
        coordinator,
        console,
    }
}

#[cfg(feature = "espflash")]
fn bootloader_connector() -> Option<Box<dyn BootloaderConnector>> {
    Some(Box::new(crate::esp_loader::EspflashConnector))
}

#[cfg(not(feature = "espflash"))]
fn bootloader_connector() -> Option<Box<dyn BootloaderConnector>> {
    None
}

/// Read a firmware file, naming it in the error.
pub(crate) fn read_firmware(path: &Path) -> Result<(String, Vec<u8>)> {
    let data = fs::read(path)
        .with_context(|| t!("error.read_firmware", path = path.display().to_string()))?;
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    Ok((name, data))
}
