//! `boardflash bw16 ...`: raw serial upload and monitoring.

use anyhow::{Context, Result};
use boardflash::{DeviceClass, UploadOptions};
use console::style;
use rust_i18n::t;
use std::time::Duration;

use super::{monitor, open_session, read_firmware};
use crate::config::Config;
use crate::terminal::{DeviceView, transfer_bar};
use crate::{Bw16Action, Cli, CliError, use_fancy_output};

pub(crate) fn run(cli: &Cli, mut config: Config, action: &Bw16Action) -> Result<()> {
    match action {
        Bw16Action::Upload {
            firmware,
            chunk_size,
            chunk_delay_ms,
            monitor: keep_monitoring,
            view,
        } => {
            if chunk_size.is_some() {
                config.bw16.chunk_size = *chunk_size;
            }
            if chunk_delay_ms.is_some() {
                config.bw16.chunk_delay_ms = *chunk_delay_ms;
            }
            let pacing = config.session_config(DeviceClass::Bw16, cli.baud).upload;
            validate_pacing(&pacing)?;
            let (name, data) = read_firmware(firmware)?;

            let mut session = open_session(cli, &config, DeviceClass::Bw16);
            session.console.set_view(DeviceView::from(*view));
            // The link is the monitor; the upload shares its open port.
            session.coordinator.acquire_for_monitor()?;

            let pb = transfer_bar(!cli.quiet && use_fancy_output(), name.clone());
            session.console.attach_progress(&pb);
            let result = session
                .coordinator
                .upload(&name, &data, |p| pb.set_position(u64::from(p.percent())));
            session.console.detach_progress();
            let report = match result {
                Ok(report) => {
                    pb.finish_and_clear();
                    report
                },
                Err(e) => {
                    pb.abandon();
                    session.coordinator.release_from_monitor();
                    return Err(e).context(t!("bw16.upload_failed", file = name).to_string());
                },
            };

            if !cli.quiet {
                eprintln!(
                    "{} {}",
                    style("✓").green().bold(),
                    t!(
                        "bw16.upload_summary",
                        bytes = report.bytes_sent,
                        chunks = report.chunks,
                        secs = format!("{:.1}", report.elapsed.as_secs_f64())
                    )
                );
            }

            if *keep_monitoring {
                monitor::run_foreground(&mut session)
            } else {
                // Let the board's reply to the last chunk reach the console.
                std::thread::sleep(Duration::from_millis(200));
                session.coordinator.release_from_monitor();
                Ok(())
            }
        },
        Bw16Action::Monitor { view } => {
            let mut session = open_session(cli, &config, DeviceClass::Bw16);
            session.console.set_view(DeviceView::from(*view));
            monitor::run_foreground(&mut session)
        },
    }
}

fn validate_pacing(options: &UploadOptions) -> Result<()> {
    options
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()).into())
}
