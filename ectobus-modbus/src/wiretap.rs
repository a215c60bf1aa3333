//! Byte-level capture of serial traffic.
//!
//! [`WiretapStream`] sits between the RTU codec and the serial port and
//! records what goes over the wire without altering it.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Default number of frames kept per link.
pub const DEFAULT_CAPACITY: usize = 256;

/// Largest RTU frame on the wire.
pub const MAX_ADU_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

/// One burst of bytes in a single direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturedFrame {
    pub direction: Direction,
    pub at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_hex")]
    pub bytes: Vec<u8>,
}

impl CapturedFrame {
    pub fn hex(&self) -> String {
        to_hex(&self.bytes)
    }
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_hex(bytes))
}

/// Space separated upper-case hex dump.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Default)]
struct Ring {
    frames: VecDeque<CapturedFrame>,
    /// The next chunk starts a new frame.
    sealed: bool,
}

/// Bounded ring of captured frames, shared between a stream and its link.
///
/// Within one transaction, consecutive chunks in the same direction are
/// merged, so a request and its reply show up as one TX and one RX entry
/// even when the OS splits them. A frame never grows past
/// [`MAX_ADU_SIZE`].
#[derive(Debug, Clone)]
pub struct WiretapLog {
    ring: Arc<Mutex<Ring>>,
    capacity: usize,
}

impl WiretapLog {
    pub fn new(capacity: usize) -> Self {
        let ring = Ring {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            sealed: false,
        };
        Self {
            ring: Arc::new(Mutex::new(ring)),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the current frame; called before each request goes out.
    pub fn begin_transaction(&self) {
        self.lock().sealed = true;
    }

    fn record(&self, direction: Direction, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let mut guard = self.lock();
        let ring = &mut *guard;
        let sealed = std::mem::take(&mut ring.sealed);
        match ring.frames.back_mut() {
            Some(last)
                if !sealed
                    && last.direction == direction
                    && last.bytes.len() + bytes.len() <= MAX_ADU_SIZE =>
            {
                last.bytes.extend_from_slice(bytes)
            }
            _ => {
                if ring.frames.len() == self.capacity {
                    ring.frames.pop_front();
                }
                ring.frames.push_back(CapturedFrame {
                    direction,
                    at: Utc::now(),
                    bytes: bytes.to_vec(),
                });
            }
        }
    }

    /// Copy of the captured frames, oldest first.
    pub fn frames(&self) -> Vec<CapturedFrame> {
        self.lock().frames.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut ring = self.lock();
        ring.frames.clear();
        ring.sealed = false;
    }
}

impl Default for WiretapLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Transparent stream wrapper that records TX and RX bytes.
#[derive(Debug)]
pub struct WiretapStream<S> {
    inner: S,
    port: String,
    log: WiretapLog,
}

impl<S> WiretapStream<S> {
    pub fn new(inner: S, port: impl Into<String>, log: WiretapLog) -> Self {
        Self {
            inner,
            port: port.into(),
            log,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for WiretapStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &poll {
            let received = &buf.filled()[before..];
            if received.is_empty() {
                debug!(port = %this.port, "RX: end of stream");
            } else {
                debug!(port = %this.port, "RX: {}", to_hex(received));
                this.log.record(Direction::Rx, received);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WiretapStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);

        if let Poll::Ready(Ok(written)) = &poll {
            let sent = &buf[..*written];
            debug!(port = %this.port, "TX: {}", to_hex(sent));
            this.log.record(Direction::Tx, sent);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
