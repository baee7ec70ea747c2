//! Scripted ports, hosts and bootloader clients for the session tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use boardflash::{
    BootloaderClient, BootloaderConnector, Error, ExclusiveLease, FlashImage, LogSink, Port,
    PortHost, PortInfo, Result, SerialConfig, TransportHandle, UsbFilter, WriteOptions,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Default)]
pub struct Wire {
    pub incoming: VecDeque<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
    pub signals: Vec<(&'static str, bool)>,
    pub fail_write_at: Option<usize>,
    pub baud_rate: u32,
}

/// In-memory serial line; clones share the same wire.
#[derive(Clone)]
pub struct ScriptedPort {
    name: String,
    timeout: Duration,
    wire: Arc<Mutex<Wire>>,
}

impl ScriptedPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::from_millis(5),
            wire: Arc::default(),
        }
    }

    pub fn wire(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap()
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.wire().incoming.push_back(bytes.to_vec());
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let next = self.wire().incoming.pop_front();
        match next {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            },
            None => {
                thread::sleep(self.timeout);
                Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
            },
        }
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.wire();
        if wire.fail_write_at == Some(wire.writes.len()) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        wire.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.wire().baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.wire().baud_rate
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.wire().signals.push(("dtr", level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.wire().signals.push(("rts", level));
        Ok(())
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Host with a scripted chooser answer; counts prompts and opens.
pub struct ScriptedHost {
    pub port: ScriptedPort,
    pub answer: Option<String>,
    pub prompts: Arc<Mutex<usize>>,
    pub opens: Arc<Mutex<usize>>,
}

impl ScriptedHost {
    pub fn offering(port: &ScriptedPort) -> Self {
        Self {
            port: port.clone(),
            answer: Some(port.name().to_string()),
            prompts: Arc::default(),
            opens: Arc::default(),
        }
    }

    pub fn cancelling(port: &ScriptedPort) -> Self {
        Self {
            answer: None,
            ..Self::offering(port)
        }
    }
}

impl PortHost for ScriptedHost {
    fn request_port(&mut self, _filters: &[UsbFilter]) -> Result<Option<PortInfo>> {
        *self.prompts.lock().unwrap() += 1;
        Ok(self.answer.clone().map(PortInfo::named))
    }

    fn open(&mut self, _info: &PortInfo, config: &SerialConfig) -> Result<Box<dyn Port>> {
        *self.opens.lock().unwrap() += 1;
        let mut port = self.port.clone();
        port.set_baud_rate(config.baud_rate)?;
        Ok(Box::new(port))
    }
}

/// Connector for a pretend ROM bootloader.
#[derive(Default)]
pub struct PretendLoader {
    pub linger: Option<Duration>,
    pub flashed: Arc<Mutex<Vec<FlashImage>>>,
    pub erases: Arc<Mutex<usize>>,
}

impl BootloaderConnector for PretendLoader {
    fn attach(
        &mut self,
        handle: TransportHandle,
        _baud: u32,
        terminal: Arc<dyn LogSink>,
    ) -> Result<Box<dyn BootloaderClient>> {
        let lease = handle.lease()?;
        Ok(Box::new(PretendClient {
            handle,
            lease: Some(lease),
            linger: self.linger,
            terminal,
            flashed: Arc::clone(&self.flashed),
            erases: Arc::clone(&self.erases),
        }))
    }
}

struct PretendClient {
    handle: TransportHandle,
    lease: Option<ExclusiveLease>,
    linger: Option<Duration>,
    terminal: Arc<dyn LogSink>,
    flashed: Arc<Mutex<Vec<FlashImage>>>,
    erases: Arc<Mutex<usize>>,
}

impl BootloaderClient for PretendClient {
    fn connect(&mut self) -> Result<()> {
        self.terminal.append_fragment("esptool sync\n");
        Ok(())
    }

    fn identify(&mut self) -> Result<String> {
        Ok("ESP32".into())
    }

    fn erase_all(&mut self) -> Result<()> {
        *self.erases.lock().unwrap() += 1;
        Ok(())
    }

    fn write_firmware(
        &mut self,
        images: &[FlashImage],
        mut options: WriteOptions<'_>,
    ) -> Result<()> {
        if images.iter().any(|i| i.data.is_empty()) {
            return Err(Error::DeviceProtocol("empty image".into()));
        }
        for (index, image) in images.iter().enumerate() {
            let total = image.data.len();
            for written in (1024..total).step_by(1024).chain([total]) {
                (options.progress)(index, written, total);
            }
        }
        self.flashed.lock().unwrap().extend_from_slice(images);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let lease = self.lease.take();
        if let Some(linger) = self.linger {
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
