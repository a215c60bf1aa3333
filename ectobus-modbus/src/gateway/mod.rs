//! Per-device gateways.
//!
//! A gateway turns the raw register cache of one slave into typed values
//! and turns typed setpoints into register writes. Which gateway drives a
//! slave is decided once, from the type code in its identity block.
//!
//! ```ignore
//! let (gateway, writer) = DeviceGateway::create(link, 1, &tables, timeout).await?;
//! let coordinator = PollingCoordinator::spawn(&gateway, writer, config);
//!
//! if let DeviceGateway::Boiler(boiler) = &gateway {
//!     println!("CH: {:?}", boiler.ch_temperature());
//!     boiler.set_ch_setpoint(45.0).await;
//! }
//! ```

mod boiler;
mod contact;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::{CacheHandle, CacheWriter, cache_pair};
use crate::identity::{self, DeviceFamily, DeviceIdentity, IdentityError};
use crate::registers::{ReadBlock, RegisterKind, RegisterTables};
use crate::transport::TransportLink;

pub use boiler::{AdapterType, BoilerGateway, format_uptime};
pub use contact::{ChannelError, ContactGateway, ContactState};

/// State shared by every gateway variant.
#[derive(Debug, Clone)]
pub(crate) struct GatewayCore {
    link: Arc<TransportLink>,
    slave_id: u8,
    identity: DeviceIdentity,
    cache: CacheHandle,
    timeout: Duration,
    /// Serializes read-modify-write of bit registers across clones.
    bit_writes: Arc<Mutex<()>>,
}

impl GatewayCore {
    pub(crate) fn new(
        link: Arc<TransportLink>,
        slave_id: u8,
        identity: DeviceIdentity,
        cache: CacheHandle,
        timeout: Duration,
    ) -> Self {
        Self {
            link,
            slave_id,
            identity,
            cache,
            timeout,
            bit_writes: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub(crate) async fn write(&self, address: u16, value: u16) -> bool {
        let ok = self
            .link
            .write_register(self.slave_id, address, value, self.timeout)
            .await;
        if !ok {
            warn!(
                slave = self.slave_id,
                "Failed to write 0x{:04X} to 0x{:04X}", value, address
            );
        }
        ok
    }

    pub(crate) async fn read_holding(&self, address: u16, count: u16) -> Option<Vec<u16>> {
        self.link
            .read_registers(self.slave_id, address, count, self.timeout)
            .await
    }

    /// Read-modify-write of one bit, patching the cache on success.
    pub(crate) async fn set_bit(&self, address: u16, bit: u8, enabled: bool) -> bool {
        if bit > 15 {
            warn!(slave = self.slave_id, bit, "Bit index out of range");
            return false;
        }

        let _guard = self.bit_writes.lock().await;
        let current = self.cache.get(address).unwrap_or(0);
        let mask = 1u16 << bit;
        let value = if enabled { current | mask } else { current & !mask };

        debug!(
            slave = self.slave_id,
            "Bit write 0x{:04X}: bit={} enabled={} 0x{:04X} -> 0x{:04X}",
            address,
            bit,
            enabled,
            current,
            value
        );

        if !self.write(address, value).await {
            return false;
        }
        self.cache.patch(address, value);
        true
    }
}

/// A gateway for one slave, specialised by device family.
#[derive(Debug, Clone)]
pub enum DeviceGateway {
    Boiler(BoilerGateway),
    ContactSplitter(ContactGateway),
}

impl DeviceGateway {
    /// Read the slave's identity and build the matching gateway.
    ///
    /// Also returns the cache writer, which belongs to the coordinator
    /// that will poll this gateway.
    pub async fn create(
        link: Arc<TransportLink>,
        slave_id: u8,
        tables: &RegisterTables,
        timeout: Duration,
    ) -> Result<(Self, CacheWriter), IdentityError> {
        let identity = identity::read_identity(&link, slave_id, timeout).await?;
        let (writer, cache) = cache_pair();
        let core = GatewayCore::new(link, slave_id, identity, cache, timeout);

        let gateway = match identity.family() {
            Some(DeviceFamily::Boiler) => {
                DeviceGateway::Boiler(BoilerGateway::new(core, tables.boiler.clone()))
            }
            Some(DeviceFamily::ContactSplitter) => {
                DeviceGateway::ContactSplitter(ContactGateway::new(core, tables.contact.clone()))
            }
            None => {
                return Err(IdentityError::UnsupportedType(
                    identity.device_type.code(),
                ));
            }
        };

        Ok((gateway, writer))
    }

    fn core(&self) -> &GatewayCore {
        match self {
            DeviceGateway::Boiler(g) => &g.core,
            DeviceGateway::ContactSplitter(g) => &g.core,
        }
    }

    fn core_mut(&mut self) -> &mut GatewayCore {
        match self {
            DeviceGateway::Boiler(g) => &mut g.core,
            DeviceGateway::ContactSplitter(g) => &mut g.core,
        }
    }

    /// Re-read the identity block.
    ///
    /// The stored identity is only updated when the device still belongs
    /// to the same family as this gateway.
    pub async fn read_identity(&mut self) -> Result<DeviceIdentity, IdentityError> {
        let core = self.core();
        let fresh = identity::read_identity(&core.link, core.slave_id, core.timeout).await?;

        let current = core.identity;
        if fresh.family() != current.family() {
            return Err(IdentityError::TypeChanged {
                expected: current.device_type,
                found: fresh.device_type,
            });
        }

        self.core_mut().identity = fresh;
        Ok(fresh)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.core().identity
    }

    pub fn family(&self) -> DeviceFamily {
        match self {
            DeviceGateway::Boiler(_) => DeviceFamily::Boiler,
            DeviceGateway::ContactSplitter(_) => DeviceFamily::ContactSplitter,
        }
    }

    pub fn slave_id(&self) -> u8 {
        self.core().slave_id
    }

    pub fn device_uid_hex(&self) -> String {
        self.core().identity.uid_hex()
    }

    /// Blocks the coordinator reads each cycle.
    pub fn read_plan(&self) -> Vec<ReadBlock> {
        match self {
            DeviceGateway::Boiler(g) => g.read_plan(),
            DeviceGateway::ContactSplitter(g) => g.read_plan(),
        }
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.core().cache
    }

    /// The link this gateway talks through, for diagnostics.
    pub fn link(&self) -> &Arc<TransportLink> {
        &self.core().link
    }

    pub fn timeout(&self) -> Duration {
        self.core().timeout
    }

    /// Set or clear one bit of a holding register (read-modify-write).
    ///
    /// The current value comes from the cache (missing counts as 0). On a
    /// successful write the cache is patched right away; on failure it is
    /// left as it was.
    pub async fn set_bit(&self, address: u16, bit: u8, enabled: bool) -> bool {
        self.core().set_bit(address, bit, enabled).await
    }

    pub fn as_boiler(&self) -> Option<&BoilerGateway> {
        match self {
            DeviceGateway::Boiler(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_contact_splitter(&self) -> Option<&ContactGateway> {
        match self {
            DeviceGateway::ContactSplitter(g) => Some(g),
            _ => None,
        }
    }
}

/// Read one block through `link` using the right function code.
pub(crate) async fn read_block(
    link: &TransportLink,
    slave: u8,
    block: &ReadBlock,
    timeout: Duration,
) -> Option<Vec<u16>> {
    match block.kind {
        RegisterKind::Holding => {
            link.read_registers(slave, block.start, block.count, timeout)
                .await
        }
        RegisterKind::Input => {
            link.read_input_registers(slave, block.start, block.count, timeout)
                .await
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::core_with_cache;
    use super::*;
    use crate::identity::DeviceType;

    #[tokio::test]
    async fn test_set_bit_failure_leaves_cache() {
        let (core, _writer) = core_with_cache(DeviceType::OpenThermV2, 0, &[(0x0039, 0b10)]);

        // The link is closed, so the write fails.
        assert!(!core.set_bit(0x0039, 0, true).await);
        assert_eq!(core.cache.get(0x0039), Some(0b10));
    }

    #[tokio::test]
    async fn test_set_bit_rejects_bad_index() {
        let (core, _writer) = core_with_cache(DeviceType::OpenThermV2, 0, &[]);
        assert!(!core.set_bit(0x0039, 16, true).await);
        assert_eq!(core.link.stats().failures, 0);
    }

    #[test]
    fn test_variant_accessors() {
        let (core, _writer) = core_with_cache(DeviceType::ContactSplitter, 4, &[]);
        let gateway = DeviceGateway::ContactSplitter(ContactGateway::new(
            core,
            Default::default(),
        ));

        assert_eq!(gateway.family(), DeviceFamily::ContactSplitter);
        assert!(gateway.as_boiler().is_none());
        assert!(gateway.as_contact_splitter().is_some());
        assert_eq!(gateway.device_uid_hex(), "800001");
        assert_eq!(gateway.slave_id(), 1);
    }
}
