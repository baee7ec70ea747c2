//! Interactive serial port selection.
//!
//! Builds the [`NativeHost`] a session prompts through:
//! - `--port` (or `[port] serial` from the config) bypasses discovery
//! - a single recognized port is picked automatically
//! - several candidates are offered in a dialoguer prompt
//! - `--non-interactive` never prompts

use {
    crate::config::Config,
    boardflash::{DeviceClass, DeviceKind, Error, NativeHost, PortInfo},
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    rust_i18n::t,
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer every port, not only those matching the board's USB filters.
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
    /// Ask even when a single recognized port was found.
    pub confirm_port: bool,
}

/// Build the port host for a `class` session.
pub fn build_host(options: &SerialOptions, config: &Config, class: DeviceClass) -> NativeHost {
    let preferred = options.port.clone().or_else(|| {
        let configured = config.port.serial.clone();
        if let Some(name) = &configured {
            debug!("Using port from config: {name}");
        }
        configured
    });

    let options = options.clone();
    let mut config = config.clone();
    NativeHost::new()
        .with_preferred(preferred)
        .include_unmatched(options.list_all_ports)
        .with_chooser(Box::new(move |candidates: &[PortInfo]| {
            choose_port(candidates, &options, &mut config, class)
        }))
}

fn choose_port(
    candidates: &[PortInfo],
    options: &SerialOptions,
    config: &mut Config,
    class: DeviceClass,
) -> boardflash::Result<Option<PortInfo>> {
    if options.non_interactive {
        return pick_non_interactive(candidates, class).map(Some);
    }
    match candidates {
        [] => Err(Error::DeviceNotFound(class.to_string())),
        [only] if !options.confirm_port => {
            info!("Auto-selected port: {}", port_label(only));
            Ok(Some(only.clone()))
        },
        [only] => {
            ensure_interactive_terminal()?;
            confirm_single_port(only)
        },
        _ => {
            ensure_interactive_terminal()?;
            let chosen = select_port_interactive(candidates)?;
            if let Some(port) = &chosen {
                ask_remember_port(port, config)?;
            }
            Ok(chosen)
        },
    }
}

/// Deterministic selection: exactly one candidate or a usage error.
fn pick_non_interactive(candidates: &[PortInfo], class: DeviceClass) -> boardflash::Result<PortInfo> {
    match candidates {
        [only] => Ok(only.clone()),
        [] => Err(Error::DeviceNotFound(class.to_string())),
        _ => Err(Error::Config(t!("serial.multiple_ports").to_string())),
    }
}

fn ensure_interactive_terminal() -> boardflash::Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(Error::Config(t!("serial.interactive_requires_tty").to_string()))
    }
}

/// A dismissed prompt is a cancelled selection, not a failure.
fn map_prompt_error<T>(result: Result<Option<T>, DialoguerError>) -> boardflash::Result<Option<T>> {
    match result {
        Ok(value) => Ok(value),
        Err(DialoguerError::IO(io_err)) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            Ok(None)
        },
        Err(DialoguerError::IO(io_err)) => Err(Error::Io(io_err)),
    }
}

/// One-line description of a port for prompts and logs.
pub fn port_label(port: &PortInfo) -> String {
    let device = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => {
            let kind = DeviceKind::from_vid_pid(vid, pid);
            if kind.is_known() {
                format!(" [{}]", kind.name())
            } else {
                format!(" ({vid:04X}:{pid:04X})")
            }
        },
        _ => String::new(),
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();
    format!("{}{device}{product}", port.name)
}

fn select_port_interactive(ports: &[PortInfo]) -> boardflash::Result<Option<PortInfo>> {
    eprintln!(
        "{} {}",
        style("ℹ").blue(),
        t!("serial.detected_ports", count = ports.len())
    );

    // Keep labels on one line in narrow terminals.
    let term_width = usize::from(console::Term::stderr().size().1);
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| console::truncate_str(&port_label(port), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = map_prompt_error(
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt(t!("serial.select_prompt").to_string())
            .items(&labels)
            .default(0)
            .interact_opt(),
    )?;
    Ok(selection.and_then(|index| ports.get(index).cloned()))
}

fn confirm_single_port(port: &PortInfo) -> boardflash::Result<Option<PortInfo>> {
    let confirmed = map_prompt_error(
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(t!("serial.confirm_use", port = port_label(port)).to_string())
            .default(true)
            .interact_opt(),
    )?
    .unwrap_or(false);
    Ok(confirmed.then(|| port.clone()))
}

/// Offer to remember an unrecognized USB adapter for future sessions.
fn ask_remember_port(port: &PortInfo, config: &mut Config) -> boardflash::Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if DeviceKind::from_vid_pid(vid, pid).is_known()
        || config.port.usb_device.iter().any(|d| d.vid == vid && d.pid == pid)
    {
        return Ok(());
    }

    let confirmed = map_prompt_error(
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(t!("serial.remember_prompt").to_string())
            .default(false)
            .interact_opt(),
    )?
    .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }
    Ok(())
}
