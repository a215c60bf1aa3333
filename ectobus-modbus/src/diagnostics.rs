//! Serializable snapshot of a device for troubleshooting.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::coordinator::{CoordinatorHandle, CoordinatorState};
use crate::gateway::DeviceGateway;
use crate::transport::LinkStats;
use crate::wiretap::CapturedFrame;

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub uid: String,
    pub device_type: String,
    pub type_code: u8,
    pub channel_count: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub port: String,
    pub baud_rate: u32,
    pub connected: bool,
    pub stats: LinkStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<CapturedFrame>,
}

/// Everything known about one device at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub name: String,
    pub slave_id: u8,
    pub identity: IdentitySummary,
    /// Raw cache contents keyed by `"0x0010"`-style addresses.
    pub registers: BTreeMap<String, u16>,
    pub link: LinkSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorState>,
}

impl DiagnosticsSnapshot {
    pub fn collect(
        name: impl Into<String>,
        gateway: &DeviceGateway,
        coordinator: Option<&CoordinatorHandle>,
    ) -> Self {
        let identity = gateway.identity();
        let link = gateway.link();

        let registers = gateway
            .cache()
            .snapshot()
            .iter()
            .map(|(addr, value)| (format!("0x{:04X}", addr), value))
            .collect();

        Self {
            name: name.into(),
            slave_id: gateway.slave_id(),
            identity: IdentitySummary {
                uid: identity.uid_hex(),
                device_type: identity.device_type.name().to_string(),
                type_code: identity.device_type.code(),
                channel_count: identity.channel_count,
            },
            registers,
            link: LinkSummary {
                port: link.port().to_string(),
                baud_rate: link.settings().baud_rate,
                connected: link.is_connected(),
                stats: link.stats(),
                frames: link.captured_frames(),
            },
            coordinator: coordinator.map(CoordinatorHandle::state),
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ContactGateway;
    use crate::gateway::test_support::core_with_cache;
    use crate::identity::DeviceType;

    #[test]
    fn test_collect_without_coordinator() {
        let (core, _writer) =
            core_with_cache(DeviceType::ContactSplitter, 4, &[(0x0010, 0x0005)]);
        let gateway = DeviceGateway::ContactSplitter(ContactGateway::new(core, Default::default()));

        let snapshot = DiagnosticsSnapshot::collect("contacts", &gateway, None);
        assert_eq!(snapshot.identity.uid, "800001");
        assert_eq!(snapshot.identity.type_code, 0x59);
        assert_eq!(snapshot.registers.get("0x0010"), Some(&5));
        assert!(!snapshot.link.connected);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["name"], "contacts");
        assert_eq!(json["registers"]["0x0010"], 5);
        assert!(json.get("coordinator").is_none());
        assert!(json["link"].get("frames").is_none());
    }
}
