//! Serialized Modbus RTU transactions over one serial port.
//!
//! RS-485 is half-duplex, so a [`TransportLink`] holds a single async lock
//! for the whole duration of every transaction: request out, reply or
//! timeout in. Failures never surface as errors here. Reads return `None`
//! and writes return `false`, and the reason is logged and counted.
//!
//! A timed-out transaction abandons its stream. The next transaction
//! reopens the port with an empty input buffer, so a late reply is never
//! taken as the answer to a different request.

use std::fmt::{self, Debug};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use crate::wiretap::{CapturedFrame, DEFAULT_CAPACITY, WiretapLog, WiretapStream};

/// Bus speed used by the adapters.
pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// Default per-transaction timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Quiet time after opening a serial port, before its input is cleared.
const OPEN_SETTLE: Duration = Duration::from_millis(50);

/// A byte stream a link can run the RTU codec over.
pub trait LinkStream: AsyncRead + AsyncWrite + Debug + Unpin + Send + 'static {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Debug + Unpin + Send + 'static {}

type StreamFactory = Box<dyn Fn() -> io::Result<Box<dyn LinkStream>> + Send + Sync>;

/// How a link (re)opens its stream.
enum Opener {
    Serial,
    Factory(StreamFactory),
    /// A stream handed over once; it cannot be reopened.
    Fixed,
}

impl Debug for Opener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opener::Serial => f.write_str("Serial"),
            Opener::Factory(_) => f.write_str("Factory"),
            Opener::Fixed => f.write_str("Fixed"),
        }
    }
}

/// Per-link settings. Framing is always 8 data bits, no parity, 1 stop bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub baud_rate: u32,
    /// Capture every frame for diagnostics.
    pub wiretap: bool,
    pub wiretap_capacity: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            wiretap: false,
            wiretap_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Transaction counters for one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub transactions: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub exceptions: u64,
}

#[derive(Debug, Default)]
struct LinkCounters {
    transactions: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    exceptions: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    ReadHolding { start: u16, count: u16 },
    ReadInput { start: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::ReadHolding { start, count } => {
                write!(f, "read {} holding @ 0x{:04X}", count, start)
            }
            Request::ReadInput { start, count } => {
                write!(f, "read {} input @ 0x{:04X}", count, start)
            }
            Request::WriteSingle { address, value } => {
                write!(f, "write 0x{:04X} -> 0x{:04X}", value, address)
            }
        }
    }
}

enum Reply {
    Words(Vec<u16>),
    Written,
}

/// One physical serial port and its client context.
#[derive(Debug)]
pub struct TransportLink {
    port: String,
    settings: LinkSettings,
    opener: Opener,
    ctx: Mutex<Option<Context>>,
    /// A stream is attached.
    connected: AtomicBool,
    /// Closed by the owner; nothing reopens it except `connect`.
    closed: AtomicBool,
    wiretap: WiretapLog,
    counters: LinkCounters,
}

impl TransportLink {
    /// Create a closed link for the serial device `port`.
    pub fn new(port: impl Into<String>, settings: LinkSettings) -> Self {
        Self::with_opener(port.into(), settings, Opener::Serial)
    }

    fn with_opener(port: String, settings: LinkSettings, opener: Opener) -> Self {
        let wiretap = WiretapLog::new(settings.wiretap_capacity);
        Self {
            port,
            settings,
            opener,
            ctx: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(true),
            wiretap,
            counters: LinkCounters::default(),
        }
    }

    /// Create an open link over an already connected byte stream.
    ///
    /// The stream cannot be replaced, so the link stays down after its
    /// first timeout.
    pub fn from_stream<S: LinkStream>(
        port: impl Into<String>,
        settings: LinkSettings,
        stream: S,
    ) -> Self {
        let mut link = Self::with_opener(port.into(), settings, Opener::Fixed);
        let ctx = link.attach(stream);
        link.install(ctx);
        link
    }

    /// Create an open link whose stream comes from `connect`, called again
    /// whenever the link has to reopen.
    pub fn with_connector<S, F>(
        port: impl Into<String>,
        settings: LinkSettings,
        connect: F,
    ) -> io::Result<Self>
    where
        S: LinkStream,
        F: Fn() -> io::Result<S> + Send + Sync + 'static,
    {
        let factory: StreamFactory =
            Box::new(move || connect().map(|s| Box::new(s) as Box<dyn LinkStream>));
        let first = factory()?;

        let mut link = Self::with_opener(port.into(), settings, Opener::Factory(factory));
        let ctx = link.attach(first);
        link.install(ctx);
        Ok(link)
    }

    fn install(&mut self, ctx: Context) {
        *self.ctx.get_mut() = Some(ctx);
        self.connected.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
    }

    fn attach<S: LinkStream>(&self, stream: S) -> Context {
        // The slave is set per transaction.
        let slave = Slave::broadcast();
        if self.settings.wiretap {
            let tapped = WiretapStream::new(stream, self.port.as_str(), self.wiretap.clone());
            rtu::attach_slave(tapped, slave)
        } else {
            rtu::attach_slave(stream, slave)
        }
    }

    /// Open the port. Idempotent; returns `false` on any failure.
    pub async fn connect(&self) -> bool {
        let mut ctx = self.ctx.lock().await;
        if ctx.is_some() {
            return true;
        }

        match self.open().await {
            Ok(opened) => {
                *ctx = Some(opened);
                self.connected.store(true, Ordering::SeqCst);
                self.closed.store(false, Ordering::SeqCst);
                info!(
                    port = %self.port,
                    baud = self.settings.baud_rate,
                    wiretap = self.settings.wiretap,
                    "Opened serial port"
                );
                true
            }
            Err(e) => {
                warn!(port = %self.port, error = %e, "Failed to open serial port");
                false
            }
        }
    }

    /// Close the port. Waits for an in-flight transaction to finish.
    pub async fn disconnect(&self) {
        let mut ctx = self.ctx.lock().await;
        if ctx.take().is_some() {
            info!(port = %self.port, "Closed serial port");
        }
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn open(&self) -> io::Result<Context> {
        let stream: Box<dyn LinkStream> = match &self.opener {
            Opener::Serial => Box::new(self.open_serial().await?),
            Opener::Factory(connect) => connect()?,
            Opener::Fixed => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "stream cannot be reopened",
                ));
            }
        };
        Ok(self.attach(stream))
    }

    async fn open_serial(&self) -> io::Result<tokio_serial::SerialStream> {
        let builder = tokio_serial::new(&self.port, self.settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One);
        let serial = tokio_serial::SerialStream::open(&builder).map_err(io::Error::from)?;

        tokio::time::sleep(OPEN_SETTLE).await;
        if let Err(e) = serial.clear(ClearBuffer::Input) {
            warn!(port = %self.port, error = %e, "Failed to clear serial input buffer");
        }
        Ok(serial)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            transactions: self.counters.transactions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            exceptions: self.counters.exceptions.load(Ordering::Relaxed),
        }
    }

    /// Frames captured so far (empty unless wiretap is enabled).
    pub fn captured_frames(&self) -> Vec<CapturedFrame> {
        self.wiretap.frames()
    }

    /// Read holding registers (function 0x03).
    pub async fn read_registers(
        &self,
        slave: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Option<Vec<u16>> {
        self.read(slave, Request::ReadHolding { start, count }, count, timeout)
            .await
    }

    /// Read input registers (function 0x04).
    pub async fn read_input_registers(
        &self,
        slave: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Option<Vec<u16>> {
        self.read(slave, Request::ReadInput { start, count }, count, timeout)
            .await
    }

    /// Write a single holding register (function 0x06).
    pub async fn write_register(
        &self,
        slave: u8,
        address: u16,
        value: u16,
        timeout: Duration,
    ) -> bool {
        matches!(
            self.transact(slave, Request::WriteSingle { address, value }, timeout)
                .await,
            Some(Reply::Written)
        )
    }

    async fn read(
        &self,
        slave: u8,
        request: Request,
        count: u16,
        timeout: Duration,
    ) -> Option<Vec<u16>> {
        match self.transact(slave, request, timeout).await? {
            Reply::Words(words) if words.len() == usize::from(count) => Some(words),
            Reply::Words(words) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    port = %self.port,
                    slave,
                    expected = count,
                    received = words.len(),
                    "Short response to {}",
                    request
                );
                None
            }
            Reply::Written => None,
        }
    }

    /// Run one request/response exchange with the lock held throughout.
    async fn transact(&self, slave: u8, request: Request, timeout: Duration) -> Option<Reply> {
        let mut guard = self.ctx.lock().await;
        if guard.is_none() && !self.closed.load(Ordering::SeqCst) {
            match self.open().await {
                Ok(ctx) => {
                    debug!(port = %self.port, "Reopened link");
                    *guard = Some(ctx);
                    self.connected.store(true, Ordering::SeqCst);
                }
                Err(e) => warn!(port = %self.port, error = %e, "Failed to reopen link"),
            }
        }

        let Some(ctx) = guard.as_mut() else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            debug!(port = %self.port, slave, "Link closed, dropping {}", request);
            return None;
        };

        self.counters.transactions.fetch_add(1, Ordering::Relaxed);
        self.wiretap.begin_transaction();
        ctx.set_slave(Slave(slave));

        let call = async {
            match request {
                Request::ReadHolding { start, count } => ctx
                    .read_holding_registers(start, count)
                    .await
                    .map(|r| r.map(Reply::Words)),
                Request::ReadInput { start, count } => ctx
                    .read_input_registers(start, count)
                    .await
                    .map(|r| r.map(Reply::Words)),
                Request::WriteSingle { address, value } => ctx
                    .write_single_register(address, value)
                    .await
                    .map(|r| r.map(|()| Reply::Written)),
            }
        };

        let outcome = tokio::time::timeout(timeout, call).await;
        match outcome {
            Ok(Ok(Ok(reply))) => {
                debug!(port = %self.port, slave, "{} ok", request);
                Some(reply)
            }
            Ok(Ok(Err(exception))) => {
                self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(port = %self.port, slave, "Exception response to {}: {:?}", request, exception);
                None
            }
            Ok(Err(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(port = %self.port, slave, error = %e, "Transport error during {}", request);
                None
            }
            Err(_) => {
                // Drop the stream with whatever part of the reply it holds.
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    port = %self.port,
                    slave,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out during {}",
                    request
                );
                None
            }
        }
    }
}
