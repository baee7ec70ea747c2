//! Foreground serial monitor.
//!
//! The coordinator's read loop runs on its own thread and streams into the
//! console sink; this module only waits for it to end or for Ctrl-C.

use anyhow::Result;
use boardflash::{MonitorExit, MonitorOutcome, NativeHost};
use console::style;
use log::debug;
use rust_i18n::t;
use std::thread;
use std::time::Duration;

use super::Session;
use crate::interrupt::{clear_interrupted_flag, was_interrupted};

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Start the monitor (unless already running) and block until it ends.
pub(crate) fn run_foreground(session: &mut Session) -> Result<()> {
    if session.coordinator.state() != boardflash::SessionState::Monitor {
        session.coordinator.acquire_for_monitor()?;
    }
    eprintln!("{}", style(t!("monitor.exit_hint")).dim());
    let outcome = watch(&mut session.coordinator);
    debug!("Monitor ended: {outcome:?}");
    match outcome.exit {
        MonitorExit::Failed(reason) => Err(anyhow::anyhow!(reason)),
        MonitorExit::EndOfStream | MonitorExit::Cancelled => Ok(()),
    }
}

/// Wait for the running monitor to finish, stopping it on Ctrl-C.
pub(crate) fn watch(coordinator: &mut boardflash::Coordinator<NativeHost>) -> MonitorOutcome {
    loop {
        if was_interrupted() {
            clear_interrupted_flag();
            if let Some(outcome) = coordinator.release_from_monitor() {
                return outcome;
            }
        }
        if let Some(outcome) = coordinator.poll_monitor() {
            return outcome;
        }
        if coordinator.state() != boardflash::SessionState::Monitor {
            // Nothing left to watch.
            return MonitorOutcome {
                exit: MonitorExit::Cancelled,
                bytes_received: 0,
            };
        }
        thread::sleep(WATCH_INTERVAL);
    }
}
