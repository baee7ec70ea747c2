//! Exclusive ownership of one physical serial connection.
//!
//! A [`TransportHandle`] starts closed when a device is chosen, is opened by
//! whichever component currently owns the session, and hands out at most one
//! [`StreamReader`] and one [`StreamWriter`] at a time. Each stream is a
//! cloned port handle guarded by an atomic lock flag that is cleared exactly
//! once when the guard is released or dropped.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::{Port, PortHost, PortInfo, SerialConfig};

/// Poll interval while waiting for stream locks to clear.
const UNLOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Side of the duplex byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    /// Incoming bytes.
    Readable,
    /// Outgoing bytes.
    Writable,
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Readable => f.write_str("Readable"),
            Self::Writable => f.write_str("Writable"),
        }
    }
}

/// DTR/RTS line levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signals {
    /// Data Terminal Ready.
    pub dtr: bool,
    /// Request To Send.
    pub rts: bool,
}

impl Signals {
    /// Create a signal state.
    pub const fn new(dtr: bool, rts: bool) -> Self {
        Self { dtr, rts }
    }
}

/// Result of [`TransportHandle::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The port was opened by this call.
    Opened,
    /// The port was already open; the call only adjusted the baud rate.
    AlreadyOpen,
}

#[derive(Debug, Default)]
struct StreamLocks {
    readable: AtomicBool,
    writable: AtomicBool,
}

impl StreamLocks {
    fn flag(&self, side: StreamSide) -> &AtomicBool {
        match side {
            StreamSide::Readable => &self.readable,
            StreamSide::Writable => &self.writable,
        }
    }

    fn is_locked(&self, side: StreamSide) -> bool {
        self.flag(side).load(Ordering::Acquire)
    }

    fn try_lock(self: &Arc<Self>, side: StreamSide) -> Result<LockGuard> {
        self.flag(side)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyLocked(side))?;
        debug!("{side} stream locked");
        Ok(LockGuard {
            locks: Arc::clone(self),
            side,
            held: true,
        })
    }
}

/// Holds one stream lock; clears it exactly once.
#[derive(Debug)]
struct LockGuard {
    locks: Arc<StreamLocks>,
    side: StreamSide,
    held: bool,
}

impl LockGuard {
    fn release(&mut self) {
        if self.held {
            self.held = false;
            self.locks.flag(self.side).store(false, Ordering::Release);
            debug!("{} stream released", self.side);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive owner of one serial connection.
pub struct TransportHandle {
    info: PortInfo,
    port: Option<Box<dyn Port>>,
    locks: Arc<StreamLocks>,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("port", &self.info.name)
            .field("open", &self.is_open())
            .field("locks", &self.locks)
            .finish()
    }
}

impl TransportHandle {
    /// Create a closed handle for a chosen device.
    pub fn new(info: PortInfo) -> Self {
        Self {
            info,
            port: None,
            locks: Arc::default(),
        }
    }

    /// Device information the handle was created from.
    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    /// Port name/path.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Whether the port is open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Current baud rate, if open.
    pub fn baud_rate(&self) -> Option<u32> {
        self.port.as_ref().map(|p| p.baud_rate())
    }

    /// Open the port through `host`.
    ///
    /// Opening an already-open handle is not an error: the baud rate is
    /// switched to the requested one and [`OpenOutcome::AlreadyOpen`] returned.
    pub fn open<H: PortHost + ?Sized>(
        &mut self,
        host: &mut H,
        config: &SerialConfig,
    ) -> Result<OpenOutcome> {
        if let Some(port) = self.port.as_mut() {
            debug!("{} already open", self.info.name);
            if port.baud_rate() != config.baud_rate {
                port.set_baud_rate(config.baud_rate)?;
            }
            return Ok(OpenOutcome::AlreadyOpen);
        }

        let port = host
            .open(&self.info, config)
            .map_err(|e| Error::PortOpenFailed {
                port: self.info.name.clone(),
                reason: e.to_string(),
            })?;
        debug!("Opened {} at {} baud", self.info.name, config.baud_rate);
        self.port = Some(port);
        Ok(OpenOutcome::Opened)
    }

    /// Close the port. Fails while a reader or writer is still active.
    pub fn close(&mut self) -> Result<()> {
        for side in [StreamSide::Readable, StreamSide::Writable] {
            if self.locks.is_locked(side) {
                return Err(Error::AlreadyLocked(side));
            }
        }
        if let Some(mut port) = self.port.take() {
            port.close()?;
            debug!("Closed {}", self.info.name);
        }
        Ok(())
    }

    /// Claim the readable side.
    pub fn reader(&self) -> Result<StreamReader> {
        let port = self.port.as_ref().ok_or(Error::NotConnected)?;
        let guard = self.locks.try_lock(StreamSide::Readable)?;
        // A failed clone drops the guard, which clears the lock again.
        let port = port.try_clone_port()?;
        Ok(StreamReader { port, guard })
    }

    /// Claim the writable side.
    pub fn writer(&self) -> Result<StreamWriter> {
        let port = self.port.as_ref().ok_or(Error::NotConnected)?;
        let guard = self.locks.try_lock(StreamSide::Writable)?;
        let port = port.try_clone_port()?;
        Ok(StreamWriter { port, guard })
    }

    /// Claim both sides on behalf of a packet-protocol client.
    ///
    /// Works on a closed handle too, so a client that opens the device itself
    /// still keeps other components off it.
    pub fn lease(&self) -> Result<ExclusiveLease> {
        let reader = self.locks.try_lock(StreamSide::Readable)?;
        let writer = self.locks.try_lock(StreamSide::Writable)?;
        Ok(ExclusiveLease {
            _reader: reader,
            _writer: writer,
        })
    }

    /// Whether the readable side is claimed.
    pub fn is_reader_locked(&self) -> bool {
        self.locks.is_locked(StreamSide::Readable)
    }

    /// Whether the writable side is claimed.
    pub fn is_writer_locked(&self) -> bool {
        self.locks.is_locked(StreamSide::Writable)
    }

    /// Whether neither side is claimed.
    pub fn is_unlocked(&self) -> bool {
        !self.is_reader_locked() && !self.is_writer_locked()
    }

    /// Wait until both stream locks are clear, giving up after `timeout`.
    pub fn wait_for_unlock(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.is_unlocked() {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(Error::UnlockTimeout {
                    port: self.info.name.clone(),
                    waited,
                });
            }
            thread::sleep(UNLOCK_POLL_INTERVAL.min(timeout - waited));
        }
    }

    /// Drive the DTR and RTS lines.
    pub fn set_signals(&mut self, signals: Signals) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        trace!("Signals dtr={} rts={}", signals.dtr, signals.rts);
        port.set_dtr(signals.dtr)?;
        port.set_rts(signals.rts)
    }
}

/// Claimed readable side of a [`TransportHandle`].
pub struct StreamReader {
    port: Box<dyn Port>,
    guard: LockGuard,
}

impl StreamReader {
    /// Set how long a single read may block.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)
    }

    /// Release the readable side.
    pub fn release(mut self) {
        self.guard.release();
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

/// Claimed writable side of a [`TransportHandle`].
pub struct StreamWriter {
    port: Box<dyn Port>,
    guard: LockGuard,
}

impl StreamWriter {
    /// Release the writable side.
    pub fn release(mut self) {
        self.guard.release();
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

/// Both stream locks held by a bootloader client.
#[derive(Debug)]
pub struct ExclusiveLease {
    _reader: LockGuard,
    _writer: LockGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockHost, MockPort, SignalCall};

    fn open_handle(port: &MockPort) -> TransportHandle {
        let mut host = MockHost::new(port);
        let mut handle = TransportHandle::new(PortInfo::named(port.name()));
        handle
            .open(&mut host, &SerialConfig::new(port.name(), 115_200))
            .unwrap();
        handle
    }

    #[test]
    fn test_new_handle_is_closed() {
        let handle = TransportHandle::new(PortInfo::named("/dev/ttyUSB0"));
        assert!(!handle.is_open());
        assert!(handle.is_unlocked());
        assert!(matches!(handle.reader(), Err(Error::NotConnected)));
        assert!(matches!(handle.writer(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_open_twice_is_benign() {
        let port = MockPort::new("/dev/ttyUSB0");
        let mut host = MockHost::new(&port);
        let mut handle = TransportHandle::new(PortInfo::named("/dev/ttyUSB0"));

        let config = SerialConfig::new("/dev/ttyUSB0", 115_200);
        assert_eq!(handle.open(&mut host, &config).unwrap(), OpenOutcome::Opened);
        let faster = SerialConfig::new("/dev/ttyUSB0", 921_600);
        assert_eq!(
            handle.open(&mut host, &faster).unwrap(),
            OpenOutcome::AlreadyOpen
        );
        assert_eq!(host.opens, 1);
        assert_eq!(handle.baud_rate(), Some(921_600));
    }

    #[test]
    fn test_single_reader_and_writer() {
        let port = MockPort::new("/dev/ttyUSB0");
        let handle = open_handle(&port);

        let reader = handle.reader().unwrap();
        assert!(matches!(
            handle.reader(),
            Err(Error::AlreadyLocked(StreamSide::Readable))
        ));

        let writer = handle.writer().unwrap();
        assert!(matches!(
            handle.writer(),
            Err(Error::AlreadyLocked(StreamSide::Writable))
        ));

        reader.release();
        assert!(!handle.is_reader_locked());
        assert!(handle.is_writer_locked());

        drop(writer);
        assert!(handle.is_unlocked());
    }

    #[test]
    fn test_released_guard_never_clears_a_newer_lock() {
        let port = MockPort::new("/dev/ttyUSB0");
        let handle = open_handle(&port);

        let first = handle.reader().unwrap();
        first.release();
        let _second = handle.reader().unwrap();
        // The first guard is gone; the second claim must still be in force.
        assert!(handle.is_reader_locked());
    }

    #[test]
    fn test_lease_blocks_streams_and_close() {
        let port = MockPort::new("/dev/ttyUSB0");
        let mut handle = open_handle(&port);

        let lease = handle.lease().unwrap();
        assert!(handle.reader().is_err());
        assert!(handle.writer().is_err());
        assert!(matches!(handle.close(), Err(Error::AlreadyLocked(_))));

        drop(lease);
        handle.close().unwrap();
        assert!(!handle.is_open());
        assert!(port.state().closed);
    }

    #[test]
    fn test_wait_for_unlock() {
        let port = MockPort::new("/dev/ttyUSB0");
        let handle = open_handle(&port);
        handle.wait_for_unlock(Duration::from_millis(10)).unwrap();

        let lease = handle.lease().unwrap();
        let err = handle
            .wait_for_unlock(Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::UnlockTimeout { .. }));

        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(lease);
        });
        handle.wait_for_unlock(Duration::from_secs(2)).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn test_set_signals_order() {
        let port = MockPort::new("/dev/ttyUSB0");
        let mut handle = open_handle(&port);
        handle.set_signals(Signals::new(false, true)).unwrap();
        assert_eq!(
            port.state().signals,
            vec![SignalCall::Dtr(false), SignalCall::Rts(true)]
        );
    }

    #[test]
    fn test_stream_io_goes_to_port() {
        let port = MockPort::new("/dev/ttyUSB0");
        let handle = open_handle(&port);

        let mut writer = handle.writer().unwrap();
        writer.write_all(b"hello").unwrap();
        writer.flush().unwrap();
        assert_eq!(port.written(), b"hello");

        port.push_read(crate::test_support::ScriptedRead::Data(b"ok".to_vec()));
        let mut reader = handle.reader().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");
    }
}
