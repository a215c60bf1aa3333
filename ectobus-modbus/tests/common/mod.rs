//! In-process Modbus RTU slave for integration tests.
//!
//! The simulator speaks real RTU frames (with CRC) over a
//! `tokio::io::duplex` pipe, so the client side runs the production
//! codec unchanged.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crc::{CRC_16_MODBUS, Crc};
use ectobus_modbus::transport::{LinkSettings, TransportLink};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus exception: illegal data address.
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
/// Modbus exception: slave device failure.
pub const SLAVE_DEVICE_FAILURE: u8 = 0x04;

/// A request seen by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seen {
    pub slave: u8,
    pub function: u8,
    pub address: u16,
    /// Register count for reads, value for writes.
    pub value: u16,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct SlaveState {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    /// Per-address read sequences; the last value sticks.
    scripts: HashMap<u16, VecDeque<u16>>,
    silent: bool,
    exception: Option<u8>,
}

impl SlaveState {
    fn read_holding(&mut self, address: u16) -> u16 {
        if let Some(script) = self.scripts.get_mut(&address) {
            if script.len() > 1 {
                if let Some(value) = script.pop_front() {
                    return value;
                }
            }
            if let Some(value) = script.front() {
                return *value;
            }
        }
        self.holding.get(&address).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Bus {
    slaves: HashMap<u8, SlaveState>,
    delay: Duration,
    seen: Vec<Seen>,
}

/// Shared handle to the simulated bus.
#[derive(Debug, Clone, Default)]
pub struct Simulator {
    bus: Arc<Mutex<Bus>>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slave<R>(&self, slave: u8, f: impl FnOnce(&mut SlaveState) -> R) -> R {
        let mut bus = self.bus.lock().unwrap();
        f(bus.slaves.entry(slave).or_default())
    }

    /// Make `slave` answer, with an empty register map.
    pub fn add_slave(&self, slave: u8) {
        self.with_slave(slave, |_| ());
    }

    pub fn set_holding(&self, slave: u8, address: u16, value: u16) {
        self.with_slave(slave, |s| {
            s.holding.insert(address, value);
        });
    }

    pub fn set_holding_block(&self, slave: u8, start: u16, values: &[u16]) {
        self.with_slave(slave, |s| {
            for (offset, value) in values.iter().enumerate() {
                s.holding.insert(start + offset as u16, *value);
            }
        });
    }

    pub fn set_input(&self, slave: u8, address: u16, value: u16) {
        self.with_slave(slave, |s| {
            s.input.insert(address, value);
        });
    }

    /// Successive holding reads of `address` return `values` in order.
    pub fn script(&self, slave: u8, address: u16, values: &[u16]) {
        self.with_slave(slave, |s| {
            s.scripts.insert(address, values.iter().copied().collect());
        });
    }

    /// A silent slave swallows requests without answering.
    pub fn set_silent(&self, slave: u8, silent: bool) {
        self.with_slave(slave, |s| s.silent = silent);
    }

    pub fn set_exception(&self, slave: u8, code: Option<u8>) {
        self.with_slave(slave, |s| s.exception = code);
    }

    /// Delay before every response.
    pub fn set_delay(&self, delay: Duration) {
        self.bus.lock().unwrap().delay = delay;
    }

    pub fn holding(&self, slave: u8, address: u16) -> Option<u16> {
        let bus = self.bus.lock().unwrap();
        bus.slaves.get(&slave)?.holding.get(&address).copied()
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.bus.lock().unwrap().seen.clone()
    }

    pub fn clear_requests(&self) {
        self.bus.lock().unwrap().seen.clear();
    }

    /// Start serving on a new pipe and return the client end.
    pub fn spawn(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(serve(server, self.bus.clone()));
        client
    }

    /// Open link to the simulated bus. Every reopen gets a fresh pipe.
    pub fn link(&self, settings: LinkSettings) -> Arc<TransportLink> {
        let sim = self.clone();
        let link = TransportLink::with_connector("sim0", settings, move || Ok(sim.spawn()))
            .expect("simulator pipe");
        Arc::new(link)
    }
}

async fn serve(mut stream: DuplexStream, bus: Arc<Mutex<Bus>>) {
    // Every request used here (0x03, 0x04, 0x06) is eight bytes long.
    let mut frame = [0u8; 8];

    loop {
        if stream.read_exact(&mut frame).await.is_err() {
            break;
        }
        if CRC_MODBUS.checksum(&frame[..6]).to_le_bytes() != frame[6..] {
            continue;
        }

        let (reply, delay) = {
            let mut bus = bus.lock().unwrap();
            (handle(&mut bus, &frame), bus.delay)
        };

        let Some(reply) = reply else { continue };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if stream.write_all(&reply).await.is_err() {
            break;
        }
    }
}

fn handle(bus: &mut Bus, frame: &[u8; 8]) -> Option<Vec<u8>> {
    let slave = frame[0];
    let function = frame[1];
    let address = u16::from_be_bytes([frame[2], frame[3]]);
    let value = u16::from_be_bytes([frame[4], frame[5]]);

    bus.seen.push(Seen {
        slave,
        function,
        address,
        value,
        at: Instant::now(),
    });

    let state = bus.slaves.get_mut(&slave)?;
    if state.silent {
        return None;
    }

    let mut pdu = vec![slave];
    if let Some(code) = state.exception {
        pdu.extend_from_slice(&[function | 0x80, code]);
        return Some(with_crc(pdu));
    }

    match function {
        0x03 | 0x04 => {
            pdu.push(function);
            pdu.push((value * 2) as u8);
            for addr in address..address + value {
                let word = if function == 0x03 {
                    state.read_holding(addr)
                } else {
                    state.input.get(&addr).copied().unwrap_or(0)
                };
                pdu.extend_from_slice(&word.to_be_bytes());
            }
        }
        0x06 => {
            state.holding.insert(address, value);
            pdu.extend_from_slice(&frame[1..6]);
        }
        _ => pdu.extend_from_slice(&[function | 0x80, 0x01]),
    }

    Some(with_crc(pdu))
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = CRC_MODBUS.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Identity block for a device.
pub fn identity_block(uid: u32, address: u8, type_code: u8, channels: u8) -> [u16; 4] {
    [
        ((uid >> 16) & 0xFF) as u16,
        (uid & 0xFFFF) as u16,
        u16::from(address),
        (u16::from(type_code) << 8) | u16::from(channels),
    ]
}

/// Simulated OpenTherm boiler adapter at `slave`.
pub fn boiler(sim: &Simulator, slave: u8) {
    sim.set_holding_block(slave, 0x0000, &identity_block(0x8A_BC01, slave, 0x14, 0));
}

/// Simulated contact splitter at `slave`.
pub fn contact_splitter(sim: &Simulator, slave: u8, channels: u8) {
    sim.set_holding_block(slave, 0x0000, &identity_block(0x90_0001, slave, 0x59, channels));
}

pub const TIMEOUT: Duration = Duration::from_millis(200);
