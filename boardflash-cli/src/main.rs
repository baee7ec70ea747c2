//! boardflash CLI - flash and monitor ESP32 and BW16 boards over one serial port.
//!
//! ESP32 boards are flashed and erased through the ROM bootloader when the
//! `espflash` feature is on. BW16 boards receive raw, paced uploads. Either
//! board can be monitored, one command at a time or from an interactive
//! `session` that enables commands the way the flasher page does. Help text
//! is served in English or Simplified Chinese.

use anyhow::Result;
use clap::{Args, FromArgMatches as _, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
#[cfg(feature = "espflash")]
mod esp_loader;
mod help;
mod interrupt;
mod serial;
mod terminal;

use boardflash::DeviceClass;
use config::Config;
use terminal::DeviceView;

rust_i18n::i18n!("locales", fallback = "en");

/// Recorded once in `main` before any output.
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Spinners and bars only when stderr is a colour terminal.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Flash and monitor ESP32 and BW16 boards.
///
/// `--port`, `--baud`, `--lang` and `--non-interactive` also read
/// `BOARDFLASH_PORT`, `BOARDFLASH_BAUD`, `BOARDFLASH_LANG` and
/// `BOARDFLASH_NON_INTERACTIVE`.
#[derive(Parser, Debug)]
#[command(name = "boardflash")]
#[command(version, about)]
#[command(after_help = "Configuration: boardflash.toml or <config dir>/boardflash/config.toml")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (prompted for if not specified).
    #[arg(short, long, global = true, env = "BOARDFLASH_PORT")]
    pub port: Option<String>,

    /// Baud rate override (bootloader rate for ESP32, link rate for BW16).
    #[arg(short, long, global = true, env = "BOARDFLASH_BAUD")]
    pub baud: Option<u32>,

    /// Message language: `en` or `zh-CN`.
    #[arg(long, global = true, env = "BOARDFLASH_LANG")]
    pub lang: Option<String>,

    /// More logging; repeat for trace output.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Never prompt; ambiguous port choices fail.
    #[arg(long, global = true, env = "BOARDFLASH_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Confirm port selection even when a single port matches.
    #[arg(long, global = true)]
    pub confirm_port: bool,

    /// Offer all available ports, not only recognized USB adapters.
    #[arg(long, global = true)]
    pub list_all_ports: bool,

    /// Read settings from this file only.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Board families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Board {
    /// ESP32 family (ROM bootloader).
    Esp32,
    /// BW16 / RTL8720DN (raw serial upload).
    Bw16,
}

impl From<Board> for DeviceClass {
    fn from(board: Board) -> Self {
        match board {
            Board::Esp32 => DeviceClass::Esp32,
            Board::Bw16 => DeviceClass::Bw16,
        }
    }
}

/// How device output is printed.
#[derive(Args, Clone, Copy, Debug, Default)]
pub(crate) struct MonitorArgs {
    /// Prefix every device line with the local time.
    #[arg(long)]
    pub timestamp: bool,

    /// Strip control characters from device output.
    #[arg(long)]
    pub clean: bool,
}

impl From<MonitorArgs> for DeviceView {
    fn from(args: MonitorArgs) -> Self {
        Self {
            timestamp: args.timestamp,
            clean: args.clean,
        }
    }
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// ESP32 boards: flash, erase and monitor.
    Esp {
        #[command(subcommand)]
        action: EspAction,
    },

    /// BW16 boards: raw upload and monitor.
    Bw16 {
        #[command(subcommand)]
        action: Bw16Action,
    },

    /// Show serial ports and the boards they may carry.
    ListPorts {
        /// Print a JSON array on stdout.
        #[arg(long)]
        json: bool,

        /// Only show ports matching a board's USB adapters.
        #[arg(long, value_enum)]
        board: Option<Board>,
    },

    /// Interactive session for one board.
    Session {
        /// Board family.
        #[arg(value_enum)]
        board: Board,
    },

    /// Print or install a shell completion script.
    Completions {
        /// Target shell; `--install` falls back to `$SHELL`.
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Write the script where the shell loads it.
        #[arg(long)]
        install: bool,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum EspAction {
    /// Flash a firmware binary through the ROM bootloader.
    Flash {
        /// Firmware binary file.
        firmware: PathBuf,

        /// Flash offset in hexadecimal.
        #[arg(short, long, default_value = "0x10000")]
        offset: String,

        /// Keep the port and stream device output afterwards.
        #[arg(long)]
        monitor: bool,

        #[command(flatten)]
        view: MonitorArgs,
    },

    /// Erase the entire flash.
    Erase,

    /// Open the serial monitor (resets the board first).
    Monitor {
        #[command(flatten)]
        view: MonitorArgs,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum Bw16Action {
    /// Send a firmware image over the raw serial link.
    Upload {
        /// Firmware binary file.
        firmware: PathBuf,

        /// Bytes per chunk.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Pause between chunks in milliseconds.
        #[arg(long)]
        chunk_delay_ms: Option<u64>,

        /// Keep monitoring after the upload.
        #[arg(long)]
        monitor: bool,

        #[command(flatten)]
        view: MonitorArgs,
    },

    /// Open the serial monitor.
    Monitor {
        #[command(flatten)]
        view: MonitorArgs,
    },
}

/// Failures classified for the exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad input caught before touching a device.
    #[error("{0}")]
    Usage(String),
    /// The user backed out.
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for a failed run: 2 for usage errors, 130 for cancellation,
/// 1 for everything else.
pub(crate) fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return match cli {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    if let Some(e) = err.downcast_ref::<boardflash::Error>() {
        if e.is_selection_cancelled() || matches!(e, boardflash::Error::Cancelled { .. }) {
            return 130;
        }
        if e.is_input_error()
            || matches!(
                e,
                boardflash::Error::DeviceNotFound(_) | boardflash::Error::Config(_)
            )
        {
            return 2;
        }
    }
    1
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn main() {
    let raw_args: Vec<String> = env::args().collect();

    // --lang is read before clap so help output is localized too.
    let locale = help::early_lang(&raw_args)
        .or_else(|| env::var("BOARDFLASH_LANG").ok())
        .map_or_else(help::detect_locale, |lang| help::match_locale(&lang));
    rust_i18n::set_locale(locale);

    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let matches = help::build_localized_command().get_matches_from(&raw_args);
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    init_logging(&cli);
    debug!(
        "boardflash v{} (locale: {locale}, verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style(rust_i18n::t!("error.prefix")).red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::Esp { action } => {
            interrupt::install();
            commands::esp::run(cli, config, action)
        },
        Commands::Bw16 { action } => {
            interrupt::install();
            commands::bw16::run(cli, config, action)
        },
        Commands::ListPorts { json, board } => {
            commands::ports::cmd_list_ports(*json, board.map(DeviceClass::from));
            Ok(())
        },
        Commands::Session { board } => {
            interrupt::install();
            commands::session::run(cli, config, DeviceClass::from(*board))
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else if let Some(shell) = shell {
                commands::completions::cmd_completions(*shell);
                Ok(())
            } else {
                Err(CliError::Usage(rust_i18n::t!("completions.shell_required").to_string()).into())
            }
        },
    }
}
