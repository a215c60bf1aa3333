//! Device availability status.

use serde::{Deserialize, Serialize};

/// Device availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device is responding normally.
    Online,
    /// Device is not responding.
    Offline,
    /// Device has failed recent polls but is still considered available.
    Degraded,
    /// Device status is unknown (never polled).
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Whether consumers should treat the device as available.
    pub fn is_available(&self) -> bool {
        !matches!(self, DeviceStatus::Offline)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}
