//! Terminal rendering of session output.
//!
//! Status lines go to stderr as `[HH:MM:SS] message`; device output is
//! streamed to stdout unchanged (optionally timestamped per line).

use boardflash::{LogSink, clean_monitor_text, clock_time, format_monitor_output};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write as _};
use std::sync::{Mutex, PoisonError};

/// How device output is rendered.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DeviceView {
    /// Prefix every device line with the local clock.
    pub timestamp: bool,
    /// Drop control characters other than newlines and tabs.
    pub clean: bool,
}

#[derive(Default)]
struct ConsoleState {
    device_at_line_start: bool,
    progress: Option<ProgressBar>,
}

/// [`LogSink`] that writes to the terminal.
pub(crate) struct ConsoleSink {
    channel: &'static str,
    view: Mutex<DeviceView>,
    state: Mutex<ConsoleState>,
}

impl ConsoleSink {
    pub(crate) fn new(channel: &'static str) -> Self {
        Self {
            channel,
            view: Mutex::new(DeviceView::default()),
            state: Mutex::new(ConsoleState {
                device_at_line_start: true,
                progress: None,
            }),
        }
    }

    /// Channel this console renders.
    pub(crate) fn channel(&self) -> &'static str {
        self.channel
    }

    pub(crate) fn set_view(&self, view: DeviceView) {
        *self.view.lock().unwrap_or_else(PoisonError::into_inner) = view;
    }

    /// Route status lines around `bar` until [`ConsoleSink::detach_progress`].
    pub(crate) fn attach_progress(&self, bar: &ProgressBar) {
        self.state().progress = Some(bar.clone());
    }

    pub(crate) fn detach_progress(&self) {
        self.state().progress = None;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogSink for ConsoleSink {
    fn clear(&self) {
        let term = console::Term::stderr();
        if term.is_term() {
            let _ = term.clear_screen();
        }
    }

    fn append_line(&self, line: &str) {
        let mut state = self.state();
        let rendered = format!("{} {line}", style(format!("[{}]", clock_time())).dim());
        // Device text may have left the cursor mid-line.
        let lead = if state.device_at_line_start { "" } else { "\n" };
        state.device_at_line_start = true;
        match &state.progress {
            Some(bar) => bar.suspend(|| eprintln!("{lead}{rendered}")),
            None => eprintln!("{lead}{rendered}"),
        }
    }

    fn append_fragment(&self, text: &str) {
        let view = *self.view.lock().unwrap_or_else(PoisonError::into_inner);
        let text = if view.clean {
            clean_monitor_text(text)
        } else {
            text.to_string()
        };
        let mut state = self.state();
        let out = format_monitor_output(&text, view.timestamp, &mut state.device_at_line_start);
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(out.as_bytes());
        let _ = stdout.flush();
    }
}

/// Percentage bar for a transfer; hidden in quiet mode or without a TTY.
pub(crate) fn transfer_bar(visible: bool, message: String) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_message(message);
    pb
}
