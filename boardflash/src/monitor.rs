//! Serial monitor: a cancellable read loop that streams device output to a
//! console sink, plus the text helpers used to render it.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use log::{debug, error, warn};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::sink::LogSink;
use crate::transport::StreamReader;

const CLOCK_FORMAT: &str = "%H:%M:%S";

/// Upper bound on how long a single read blocks, and so on cancel latency.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

const READ_BUFFER_SIZE: usize = 1024;

/// How a monitor read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// The device closed the stream.
    EndOfStream,
    /// The loop observed its cancel token.
    Cancelled,
    /// A read failed; the message was also written to the sink.
    Failed(String),
}

/// Summary returned when a monitor loop finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorOutcome {
    /// Why the loop stopped.
    pub exit: MonitorExit,
    /// Total bytes read from the device.
    pub bytes_received: usize,
}

/// Read from `reader` until end of data, a read error, or cancellation.
///
/// Device text is decoded as streaming lossy UTF-8 and appended to `sink` as
/// fragments. Read errors are reported to the sink as `<error_label>: ...`
/// and end the loop without propagating. The reader lock is released before
/// returning.
pub fn run_monitor(
    mut reader: StreamReader,
    sink: &dyn LogSink,
    cancel: &CancelToken,
    error_label: &str,
) -> MonitorOutcome {
    if let Err(e) = reader.set_timeout(READ_POLL_INTERVAL) {
        warn!("Could not shorten monitor read timeout: {e}");
    }

    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut pending = Vec::new();
    let mut bytes_received = 0usize;

    let exit = loop {
        if cancel.is_cancelled() {
            break MonitorExit::Cancelled;
        }
        match reader.read(&mut buf) {
            Ok(0) => break MonitorExit::EndOfStream,
            Ok(n) => {
                bytes_received += n;
                pending.extend_from_slice(&buf[..n]);
                let text = drain_utf8_lossy(&mut pending);
                if !text.is_empty() {
                    sink.append_fragment(&text);
                }
            },
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {},
            Err(e) => {
                error!("Serial read failed: {e}");
                sink.append_line(&format!("{error_label}: {e}"));
                break MonitorExit::Failed(e.to_string());
            },
        }
    };

    if !pending.is_empty() {
        sink.append_fragment(&String::from_utf8_lossy(&pending));
    }
    reader.release();
    debug!("Monitor loop ended: {exit:?} after {bytes_received} bytes");

    MonitorOutcome {
        exit,
        bytes_received,
    }
}

/// Monitor loop running on its own thread.
pub struct SerialMonitor {
    cancel: CancelToken,
    worker: Option<JoinHandle<MonitorOutcome>>,
}

impl SerialMonitor {
    /// Start the read loop on a dedicated thread.
    ///
    /// Read errors are logged to `sink` prefixed with `error_label`.
    pub fn spawn(
        reader: StreamReader,
        sink: Arc<dyn LogSink>,
        error_label: &'static str,
    ) -> Result<Self> {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let worker = thread::Builder::new()
            .name("serial-monitor".into())
            .spawn(move || run_monitor(reader, sink.as_ref(), &token, error_label))?;

        Ok(Self {
            cancel,
            worker: Some(worker),
        })
    }

    /// Whether the loop has already ended on its own.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the loop and wait for it to release the reader.
    pub fn stop(self) -> MonitorOutcome {
        self.cancel.cancel();
        self.join()
    }

    /// Wait for the loop to end without cancelling it.
    pub fn join(mut self) -> MonitorOutcome {
        match self.worker.take() {
            Some(worker) => worker.join().unwrap_or_else(|_| MonitorOutcome {
                exit: MonitorExit::Failed("monitor thread panicked".into()),
                bytes_received: 0,
            }),
            None => MonitorOutcome {
                exit: MonitorExit::Cancelled,
                bytes_received: 0,
            },
        }
    }
}

impl Drop for SerialMonitor {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cancel.cancel();
            let _ = worker.join();
        }
    }
}

/// Drain buffered bytes into displayable UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Filter non-printable control characters for cleaner monitor output.
///
/// Keeps `\n`, `\t` and printable Unicode chars, turns `\r` into `\n`, and
/// drops other control characters.
pub fn clean_monitor_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\n' | '\t' => out.push(ch),
            '\r' => out.push('\n'),
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }
    out
}

/// Local time of day as `HH:MM:SS`.
pub fn clock_time() -> String {
    Local::now().format(CLOCK_FORMAT).to_string()
}

/// Format monitor output, optionally prefixing each new line with a timestamp.
///
/// `at_line_start` carries line state across calls so fragments that split a
/// line do not get a second prefix.
pub fn format_monitor_output(text: &str, timestamp: bool, at_line_start: &mut bool) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let prefix = timestamp.then(|| format!("[{}] ", clock_time()));

    let mut out = String::with_capacity(normalized.len() + 16);
    for c in normalized.chars() {
        if c == '\n' {
            out.push('\n');
            *at_line_start = true;
            continue;
        }
        if *at_line_start {
            if let Some(prefix) = &prefix {
                out.push_str(prefix);
            }
            *at_line_start = false;
        }
        out.push(c);
    }

    out
}
