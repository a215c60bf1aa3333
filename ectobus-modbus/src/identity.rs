//! Device identity block (registers 0x0000-0x0003).

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::TransportLink;

/// First register of the identity block.
pub const IDENTITY_START: u16 = 0x0000;

/// Number of registers in the identity block.
pub const IDENTITY_COUNT: u16 = 4;

/// Unique ids are allocated from the top half of the 24-bit space.
pub const UID_RANGE: std::ops::RangeInclusive<u32> = 0x80_0000..=0xFF_FFFF;

/// Highest channel count of the contact splitter.
pub const MAX_CONTACT_CHANNELS: u8 = 10;

/// Reasons an identity block is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity block could not be read")]
    ReadFailed,
    #[error("unique id 0x{0:06X} outside 0x800000-0xFFFFFF")]
    InvalidUid(u32),
    #[error("unsupported device type 0x{0:02X}")]
    UnsupportedType(u8),
    #[error("channel count {count} outside 1-{max}")]
    InvalidChannelCount { count: u8, max: u8 },
    #[error("device type changed from {expected} to {found}")]
    TypeChanged {
        expected: DeviceType,
        found: DeviceType,
    },
}

/// Which gateway variant drives a device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    Boiler,
    ContactSplitter,
}

/// Device type code from the high byte of register 0x0003.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    OpenThermV1,
    OpenThermV2,
    Ebus,
    Navien,
    TemperatureSensor,
    HumiditySensor,
    ContactSensor,
    ContactSplitter,
    Relay2,
    Relay10,
    Unknown(u8),
}

impl DeviceType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x11 => DeviceType::OpenThermV1,
            0x14 => DeviceType::OpenThermV2,
            0x15 => DeviceType::Ebus,
            0x16 => DeviceType::Navien,
            0x22 => DeviceType::TemperatureSensor,
            0x23 => DeviceType::HumiditySensor,
            0x50 => DeviceType::ContactSensor,
            0x59 => DeviceType::ContactSplitter,
            0xC0 => DeviceType::Relay2,
            0xC1 => DeviceType::Relay10,
            other => DeviceType::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            DeviceType::OpenThermV1 => 0x11,
            DeviceType::OpenThermV2 => 0x14,
            DeviceType::Ebus => 0x15,
            DeviceType::Navien => 0x16,
            DeviceType::TemperatureSensor => 0x22,
            DeviceType::HumiditySensor => 0x23,
            DeviceType::ContactSensor => 0x50,
            DeviceType::ContactSplitter => 0x59,
            DeviceType::Relay2 => 0xC0,
            DeviceType::Relay10 => 0xC1,
            DeviceType::Unknown(code) => *code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::OpenThermV1 => "OpenTherm Adapter v1",
            DeviceType::OpenThermV2 => "OpenTherm Adapter v2",
            DeviceType::Ebus => "eBus Adapter",
            DeviceType::Navien => "Navien Adapter",
            DeviceType::TemperatureSensor => "Temperature Sensor",
            DeviceType::HumiditySensor => "Humidity Sensor",
            DeviceType::ContactSensor => "Universal Contact Sensor",
            DeviceType::ContactSplitter => "Contact Sensor Splitter",
            DeviceType::Relay2 => "2-Channel Relay",
            DeviceType::Relay10 => "10-Channel Relay",
            DeviceType::Unknown(_) => "Unknown",
        }
    }

    /// Gateway variant for this type, if the core supports it.
    pub fn family(&self) -> Option<DeviceFamily> {
        match self {
            DeviceType::OpenThermV2 | DeviceType::Ebus | DeviceType::Navien => {
                Some(DeviceFamily::Boiler)
            }
            DeviceType::ContactSplitter => Some(DeviceFamily::ContactSplitter),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Identity of one adapter on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    /// 24-bit unique id.
    pub uid: u32,
    pub device_type: DeviceType,
    /// Channel count, or variant count for adapters without channels.
    pub channel_count: u8,
    /// Address the adapter reports for itself. Informational only.
    pub reported_address: u8,
}

impl DeviceIdentity {
    /// Parse and validate the identity block.
    ///
    /// Layout: reg0 low byte is the UID high byte, reg1 holds the UID
    /// middle and low bytes, reg2 low byte the reported address, reg3 the
    /// type (high byte) and channel count (low byte).
    pub fn from_registers(regs: &[u16]) -> Result<Self, IdentityError> {
        let [r0, r1, r2, r3] = match regs {
            [r0, r1, r2, r3, ..] => [*r0, *r1, *r2, *r3],
            _ => return Err(IdentityError::ReadFailed),
        };

        let uid = (u32::from(r0 & 0xFF) << 16) | u32::from(r1);
        if !UID_RANGE.contains(&uid) {
            return Err(IdentityError::InvalidUid(uid));
        }

        let device_type = DeviceType::from_code((r3 >> 8) as u8);
        let channel_count = (r3 & 0xFF) as u8;

        match device_type.family() {
            None => return Err(IdentityError::UnsupportedType(device_type.code())),
            Some(DeviceFamily::ContactSplitter)
                if !(1..=MAX_CONTACT_CHANNELS).contains(&channel_count) =>
            {
                return Err(IdentityError::InvalidChannelCount {
                    count: channel_count,
                    max: MAX_CONTACT_CHANNELS,
                });
            }
            Some(_) => {}
        }

        Ok(Self {
            uid,
            device_type,
            channel_count,
            reported_address: (r2 & 0xFF) as u8,
        })
    }

    /// Lower-case six digit hex form of the unique id.
    pub fn uid_hex(&self) -> String {
        format!("{:06x}", self.uid)
    }

    pub fn family(&self) -> Option<DeviceFamily> {
        self.device_type.family()
    }
}

/// Read and validate the identity block of `slave`.
pub async fn read_identity(
    link: &TransportLink,
    slave: u8,
    timeout: Duration,
) -> Result<DeviceIdentity, IdentityError> {
    let Some(regs) = link
        .read_registers(slave, IDENTITY_START, IDENTITY_COUNT, timeout)
        .await
    else {
        warn!(slave, port = %link.port(), "Failed to read identity block");
        return Err(IdentityError::ReadFailed);
    };

    let identity = DeviceIdentity::from_registers(&regs).inspect_err(|e| {
        warn!(slave, error = %e, "Rejected identity block");
    })?;

    debug!(
        slave,
        uid = %identity.uid_hex(),
        device_type = %identity.device_type,
        channels = identity.channel_count,
        "Read device identity"
    );

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boiler_identity() {
        let identity =
            DeviceIdentity::from_registers(&[0x0080, 0x0001, 0x0003, 0x1400]).unwrap();

        assert_eq!(identity.uid, 0x800001);
        assert_eq!(identity.uid_hex(), "800001");
        assert_eq!(identity.device_type, DeviceType::OpenThermV2);
        assert_eq!(identity.family(), Some(DeviceFamily::Boiler));
        assert_eq!(identity.reported_address, 3);
    }

    #[test]
    fn test_reserved_byte_ignored() {
        // High byte of reg0 is reserved.
        let identity =
            DeviceIdentity::from_registers(&[0xAB8A, 0xBCDE, 0x0000, 0x1600]).unwrap();
        assert_eq!(identity.uid, 0x8ABCDE);
        assert_eq!(identity.device_type, DeviceType::Navien);
    }

    #[test]
    fn test_uid_bounds() {
        assert_eq!(
            DeviceIdentity::from_registers(&[0x007F, 0xFFFF, 0, 0x1400]),
            Err(IdentityError::InvalidUid(0x7FFFFF))
        );
        assert!(DeviceIdentity::from_registers(&[0x00FF, 0xFFFF, 0, 0x1400]).is_ok());
        assert!(DeviceIdentity::from_registers(&[0x0080, 0x0000, 0, 0x1400]).is_ok());
    }

    #[test]
    fn test_unsupported_type() {
        assert_eq!(
            DeviceIdentity::from_registers(&[0x0080, 0x0001, 0, 0xC002]),
            Err(IdentityError::UnsupportedType(0xC0))
        );
        assert_eq!(
            DeviceIdentity::from_registers(&[0x0080, 0x0001, 0, 0x7700]),
            Err(IdentityError::UnsupportedType(0x77))
        );
    }

    #[test]
    fn test_contact_channel_bounds() {
        for count in [1u16, 4, 8, 10] {
            let identity =
                DeviceIdentity::from_registers(&[0x0080, 0x0001, 0, 0x5900 | count]).unwrap();
            assert_eq!(u16::from(identity.channel_count), count);
        }

        for count in [0u8, 11, 0xFF] {
            assert_eq!(
                DeviceIdentity::from_registers(&[0x0080, 0x0001, 0, 0x5900 | u16::from(count)]),
                Err(IdentityError::InvalidChannelCount { count, max: 10 })
            );
        }
    }

    #[test]
    fn test_short_block() {
        assert_eq!(
            DeviceIdentity::from_registers(&[0x0080, 0x0001, 0]),
            Err(IdentityError::ReadFailed)
        );
    }

    #[test]
    fn test_device_type_codes() {
        for code in [0x11, 0x14, 0x15, 0x16, 0x22, 0x23, 0x50, 0x59, 0xC0, 0xC1, 0x42] {
            assert_eq!(DeviceType::from_code(code).code(), code);
        }
        assert_eq!(DeviceType::from_code(0x42), DeviceType::Unknown(0x42));
        assert_eq!(DeviceType::Ebus.to_string(), "eBus Adapter (0x15)");
        assert_eq!(DeviceType::OpenThermV1.family(), None);
    }
}
