//! `boardflash esp ...`: ROM bootloader flashing and monitoring.

use anyhow::{Context, Result};
use boardflash::{DeviceClass, parse_flash_offset};
use log::info;
use rust_i18n::t;

use super::{Session, monitor, open_session, read_firmware};
use crate::config::Config;
use crate::terminal::{DeviceView, transfer_bar};
use crate::{Cli, CliError, EspAction, use_fancy_output};

pub(crate) fn run(cli: &Cli, config: Config, action: &EspAction) -> Result<()> {
    match action {
        EspAction::Flash {
            firmware,
            offset,
            monitor: then_monitor,
            view,
        } => {
            // Reject a bad offset before prompting for a port.
            parse_flash_offset(offset).map_err(|e| CliError::Usage(e.to_string()))?;
            let (name, data) = read_firmware(firmware)?;

            let mut session = open_session(cli, &config, DeviceClass::Esp32);
            session.console.set_view(DeviceView::from(*view));
            connect(&mut session)?;
            flash(cli, &mut session, &name, &data, offset)?;

            if *then_monitor {
                eprintln!();
                monitor::run_foreground(&mut session)?;
            } else {
                session.coordinator.release_from_bootloader();
            }
            Ok(())
        },
        EspAction::Erase => {
            let mut session = open_session(cli, &config, DeviceClass::Esp32);
            connect(&mut session)?;
            session.coordinator.erase().context(t!("esp.erase_failed").to_string())?;
            session.coordinator.release_from_bootloader();
            Ok(())
        },
        EspAction::Monitor { view } => {
            let mut session = open_session(cli, &config, DeviceClass::Esp32);
            session.console.set_view(DeviceView::from(*view));
            monitor::run_foreground(&mut session)
        },
    }
}

fn connect(session: &mut Session) -> Result<()> {
    let chip = session.coordinator.acquire_for_bootloader()?;
    info!("Bootloader session open on {chip}");
    Ok(())
}

fn flash(cli: &Cli, session: &mut Session, name: &str, data: &[u8], offset: &str) -> Result<()> {
    let pb = transfer_bar(!cli.quiet && use_fancy_output(), name.to_string());
    session.console.attach_progress(&pb);
    let result = session
        .coordinator
        .flash(name, data, offset, |p| pb.set_position(u64::from(p.percent())));
    session.console.detach_progress();

    match result {
        Ok(()) => {
            pb.finish_and_clear();
            Ok(())
        },
        Err(e) => {
            pb.abandon();
            Err(e).context(t!("esp.flash_failed", file = name).to_string())
        },
    }
}
