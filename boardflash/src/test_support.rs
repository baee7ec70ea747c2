//! In-memory ports and hosts shared by the unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::bootloader::{BootloaderClient, BootloaderConnector, FlashImage, WriteOptions};
use crate::device::UsbFilter;
use crate::error::{Error, Result};
use crate::port::{Port, PortHost, PortInfo, SerialConfig};
use crate::sink::LogSink;
use crate::transport::{ExclusiveLease, TransportHandle};

/// One scripted outcome for a `read` call.
#[derive(Debug, Clone)]
pub enum ScriptedRead {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCall {
    Dtr(bool),
    Rts(bool),
}

#[derive(Debug, Default)]
pub struct MockState {
    pub reads: VecDeque<ScriptedRead>,
    pub writes: Vec<Vec<u8>>,
    pub signals: Vec<SignalCall>,
    pub fail_write_at: Option<usize>,
    pub fail_signals: bool,
    pub closed: bool,
    pub baud_rate: u32,
}

/// Clone-able mock port; every clone shares the same state.
#[derive(Clone)]
pub struct MockPort {
    name: String,
    timeout: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            timeout: Duration::from_millis(5),
            state: Arc::new(Mutex::new(MockState {
                baud_rate: 115_200,
                ..MockState::default()
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn push_read(&self, read: ScriptedRead) {
        self.state().reads.push_back(read);
    }

    pub fn written(&self) -> Vec<u8> {
        self.state().writes.concat()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let next = self.state().reads.pop_front();
        match next {
            Some(ScriptedRead::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.state()
                        .reads
                        .push_front(ScriptedRead::Data(data[n..].to_vec()));
                }
                Ok(n)
            },
            Some(ScriptedRead::Eof) => Ok(0),
            Some(ScriptedRead::Fail(kind)) => Err(io::Error::new(kind, "scripted read failure")),
            None => {
                thread::sleep(self.timeout);
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            },
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.fail_write_at == Some(state.writes.len()) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        state.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.state().baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.state().baud_rate
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        let mut state = self.state();
        if state.fail_signals {
            return Err(Error::Io(io::Error::other("signal lines unsupported")));
        }
        state.signals.push(SignalCall::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        let mut state = self.state();
        if state.fail_signals {
            return Err(Error::Io(io::Error::other("signal lines unsupported")));
        }
        state.signals.push(SignalCall::Rts(level));
        Ok(())
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }
}

/// Host that always offers one mock port and counts prompts and opens.
pub struct MockHost {
    pub port: MockPort,
    pub offer: bool,
    pub prompts: usize,
    pub opens: usize,
}

impl MockHost {
    pub fn new(port: &MockPort) -> Self {
        Self {
            port: port.clone(),
            offer: true,
            prompts: 0,
            opens: 0,
        }
    }
}

impl PortHost for MockHost {
    fn request_port(&mut self, _filters: &[UsbFilter]) -> Result<Option<PortInfo>> {
        self.prompts += 1;
        Ok(self.offer.then(|| PortInfo::named(self.port.name())))
    }

    fn open(&mut self, _info: &PortInfo, config: &SerialConfig) -> Result<Box<dyn Port>> {
        self.opens += 1;
        let mut port = self.port.clone();
        port.set_baud_rate(config.baud_rate)?;
        Ok(Box::new(port))
    }
}

/// Bootloader connector whose clients hold the transport lease and record
/// what they were asked to do.
pub struct FakeConnector {
    pub chip: String,
    pub fail_connect: bool,
    pub linger: Option<Duration>,
    pub flashed: Arc<Mutex<Vec<FlashImage>>>,
    pub erased: Arc<Mutex<usize>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            chip: "ESP32-S3".into(),
            fail_connect: false,
            linger: None,
            flashed: Arc::default(),
            erased: Arc::default(),
        }
    }
}

impl BootloaderConnector for FakeConnector {
    fn attach(
        &mut self,
        handle: TransportHandle,
        _baud: u32,
        _terminal: Arc<dyn LogSink>,
    ) -> Result<Box<dyn BootloaderClient>> {
        let lease = handle.lease()?;
        Ok(Box::new(FakeClient {
            handle,
            lease: Some(lease),
            chip: self.chip.clone(),
            fail_connect: self.fail_connect,
            linger: self.linger,
            flashed: Arc::clone(&self.flashed),
            erased: Arc::clone(&self.erased),
        }))
    }
}

struct FakeClient {
    handle: TransportHandle,
    lease: Option<ExclusiveLease>,
    chip: String,
    fail_connect: bool,
    linger: Option<Duration>,
    flashed: Arc<Mutex<Vec<FlashImage>>>,
    erased: Arc<Mutex<usize>>,
}

impl BootloaderClient for FakeClient {
    fn connect(&mut self) -> Result<()> {
        if self.fail_connect {
            return Err(Error::DeviceProtocol(
                "Failed to connect with the device".into(),
            ));
        }
        Ok(())
    }

    fn identify(&mut self) -> Result<String> {
        Ok(self.chip.clone())
    }

    fn erase_all(&mut self) -> Result<()> {
        *self.erased.lock().unwrap() += 1;
        Ok(())
    }

    fn write_firmware(
        &mut self,
        images: &[FlashImage],
        mut options: WriteOptions<'_>,
    ) -> Result<()> {
        for (index, image) in images.iter().enumerate() {
            let total = image.data.len();
            (options.progress)(index, total / 2, total);
            (options.progress)(index, total, total);
        }
        self.flashed.lock().unwrap().extend_from_slice(images);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let (Some(lease), Some(linger)) = (self.lease.take(), self.linger) {
            // Simulates a protocol read loop that notices the disconnect late.
            thread::spawn(move || {
                thread::sleep(linger);
                drop(lease);
            });
        }
        Ok(())
    }

    fn into_handle(self: Box<Self>) -> TransportHandle {
        let this = *self;
        this.handle
    }
}
