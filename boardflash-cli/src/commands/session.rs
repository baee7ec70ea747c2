//! `boardflash session <board>`: an interactive session for one board.
//!
//! Every control of the flasher page is a command here. A command is only
//! accepted while the coordinator state enables it, and the enabled set is
//! printed whenever the owner of the port changes. The monitor runs in the
//! background so `stop` and `upload` can be typed while output streams.

use anyhow::Result;
use boardflash::{Controls, Coordinator, DeviceClass, NativeHost, SessionState};
use console::style;
use log::debug;
use rust_i18n::t;
use std::io::{self, BufRead, Write as _};

use super::{Session, open_session, read_firmware};
use crate::config::Config;
use crate::interrupt::{clear_interrupted_flag, was_interrupted};
use crate::terminal::transfer_bar;
use crate::{Cli, use_fancy_output};

const DEFAULT_FLASH_OFFSET: &str = "0x10000";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Connect,
    Flash { file: String, offset: String },
    Erase,
    Monitor,
    Stop,
    Upload { file: String },
    Reset,
    Clear,
    Status,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(None);
        };
        let command = match head {
            "connect" => Self::Connect,
            "flash" => {
                let file = words.next().ok_or_else(|| t!("session.usage_flash").to_string())?;
                Self::Flash {
                    file: file.to_string(),
                    offset: words.next().unwrap_or(DEFAULT_FLASH_OFFSET).to_string(),
                }
            },
            "erase" => Self::Erase,
            "monitor" => Self::Monitor,
            "stop" => Self::Stop,
            "upload" => {
                let file = words.next().ok_or_else(|| t!("session.usage_upload").to_string())?;
                Self::Upload {
                    file: file.to_string(),
                }
            },
            "reset" => Self::Reset,
            "clear" => Self::Clear,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(t!("session.unknown_command", command = other).to_string()),
        };
        Ok(Some(command))
    }

    /// Whether `controls` enables this command. Housekeeping commands are
    /// always available.
    fn is_enabled(&self, controls: &Controls) -> bool {
        match self {
            Self::Connect => controls.connect,
            Self::Flash { .. } => controls.flash,
            Self::Erase => controls.erase,
            Self::Monitor => controls.monitor_start,
            Self::Stop => controls.monitor_stop,
            Self::Upload { .. } => controls.upload,
            Self::Reset | Self::Clear | Self::Status | Self::Help | Self::Quit => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Flash { .. } => "flash",
            Self::Erase => "erase",
            Self::Monitor => "monitor",
            Self::Stop => "stop",
            Self::Upload { .. } => "upload",
            Self::Reset => "reset",
            Self::Clear => "clear",
            Self::Status => "status",
            Self::Help => "help",
            Self::Quit => "quit",
        }
    }
}

/// Render the control bar for `controls`.
fn controls_line(class: DeviceClass, state: SessionState, controls: &Controls) -> String {
    let enabled = controls.enabled();
    let actions = if enabled.is_empty() {
        "-".to_string()
    } else {
        enabled.join(" | ")
    };
    format!("{class} {} ({state}): {actions}", controls.connect_label)
}

pub(crate) fn run(cli: &Cli, config: Config, class: DeviceClass) -> Result<()> {
    let mut session = open_session(cli, &config, class);
    session
        .coordinator
        .on_state_change(Box::new(move |state, controls| {
            eprintln!("{}", style(controls_line(class, state, &controls)).dim());
        }));

    eprintln!("{}", style(t!("session.banner", board = class.name())).bold());
    print_help(class);
    show_status(&session.coordinator);

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("{} ", style(format!("{}>", class.name().to_lowercase())).cyan());
        let _ = io::stderr().flush();

        let Some(line) = lines.next() else {
            // Ctrl-D
            eprintln!();
            break;
        };
        let line = line?;

        // Ctrl-C at the prompt only stops a running monitor.
        if was_interrupted() {
            clear_interrupted_flag();
            session.coordinator.release_from_monitor();
        }
        session.coordinator.poll_monitor();

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("{} {message}", style("?").yellow());
                continue;
            },
        };
        if command == Command::Quit {
            break;
        }
        if !command.is_enabled(&session.coordinator.controls()) {
            eprintln!(
                "{} {}",
                style("✗").red(),
                t!("session.disabled", command = command.name())
            );
            continue;
        }
        execute(cli, &mut session, command);
    }

    session.coordinator.shutdown();
    Ok(())
}

fn execute(cli: &Cli, session: &mut Session, command: Command) {
    let coordinator = &mut session.coordinator;
    // Failures are already on the console; the session carries on.
    let result: Result<()> = match command {
        Command::Connect => match coordinator.device_class() {
            DeviceClass::Esp32 => coordinator.acquire_for_bootloader().map(drop).map_err(Into::into),
            DeviceClass::Bw16 => coordinator.acquire_for_monitor().map_err(Into::into),
        },
        Command::Flash { file, offset } => read_firmware(file.as_ref()).and_then(|(name, data)| {
            let pb = transfer_bar(!cli.quiet && use_fancy_output(), name.clone());
            session.console.attach_progress(&pb);
            let result = coordinator.flash(&name, &data, &offset, |p| {
                pb.set_position(u64::from(p.percent()));
            });
            session.console.detach_progress();
            pb.finish_and_clear();
            result.map_err(Into::into)
        }),
        Command::Erase => coordinator.erase().map_err(Into::into),
        Command::Monitor => coordinator.acquire_for_monitor().map_err(Into::into),
        Command::Stop => {
            coordinator.release_from_monitor();
            Ok(())
        },
        Command::Upload { file } => read_firmware(file.as_ref()).and_then(|(name, data)| {
            let pb = transfer_bar(!cli.quiet && use_fancy_output(), name.clone());
            session.console.attach_progress(&pb);
            let result = coordinator.upload(&name, &data, |p| {
                pb.set_position(u64::from(p.percent()));
            });
            session.console.detach_progress();
            pb.finish_and_clear();
            result.map(drop).map_err(Into::into)
        }),
        Command::Reset => coordinator.pulse_reset().map_err(Into::into),
        Command::Clear => {
            coordinator.clear_log();
            Ok(())
        },
        Command::Status => {
            show_status(coordinator);
            Ok(())
        },
        Command::Help => {
            print_help(coordinator.device_class());
            Ok(())
        },
        Command::Quit => Ok(()),
    };
    if let Err(e) = result {
        debug!("Session command failed: {e:#}");
        if e.downcast_ref::<boardflash::Error>().is_none() {
            // Not a coordinator failure, so nothing was logged yet.
            eprintln!("{} {e:#}", style(t!("error.prefix")).red().bold());
        }
    }
}

fn show_status(coordinator: &Coordinator<NativeHost>) {
    let state = coordinator.state();
    eprintln!(
        "{}",
        controls_line(coordinator.device_class(), state, &coordinator.controls())
    );
    if let Some(port) = coordinator.port_name() {
        eprintln!("  {}", t!("session.status_port", port = port));
    }
    if let Some(chip) = coordinator.chip_name() {
        eprintln!("  {}", t!("session.status_chip", chip = chip));
    }
}

fn print_help(class: DeviceClass) {
    let key = match class {
        DeviceClass::Esp32 => "session.help_esp32",
        DeviceClass::Bw16 => "session.help_bw16",
    };
    eprintln!("{}", style(t!(key)).dim());
}
