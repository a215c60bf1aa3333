//! Modbus RTU master core for Ectocontrol adapters.
//!
//! Polls boiler adapters (OpenTherm, eBus, Navien) and contact splitters
//! on a shared RS-485 bus and exposes their state as typed, cached values.
//!
//! # Layers
//!
//! - [`transport`] - One serial port, one transaction at a time
//! - [`registry`] - Reference-counted sharing of ports between devices
//! - [`gateway`] - Per-slave typed getters, setters and commands
//! - [`coordinator`] - Periodic polling with retry and availability tracking
//!
//! # Wire
//!
//! ```text
//! 19200 baud, 8N1, functions 0x03 / 0x04 / 0x06
//! identity  0x0000-0x0003
//! live      0x0010-0x003F
//! status    0x0040-0x006F
//! commands  0x0080 (code) / 0x0081 (result)
//! ```

pub mod cache;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod gateway;
pub mod identity;
pub mod registers;
pub mod registry;
pub mod transport;
pub mod wiretap;

pub use cache::{CacheHandle, CacheWriter, RegisterCache};
pub use command::{Command, CommandError, CommandPolicy};
pub use coordinator::{CoordinatorConfig, CoordinatorEvent, CoordinatorHandle, PollingCoordinator};
pub use gateway::{BoilerGateway, ContactGateway, ContactState, DeviceGateway};
pub use identity::{DeviceIdentity, DeviceType, IdentityError};
pub use registry::{LinkError, LinkRegistry};
pub use transport::{LinkSettings, TransportLink};
