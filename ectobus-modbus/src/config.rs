//! Service configuration.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use ectobus_common::{Error, LoggingConfig, Result, ServiceConfig};
use serde::{Deserialize, Serialize};

use crate::coordinator::{CoordinatorConfig, RetryPolicy};
use crate::registers::RegisterTables;
use crate::transport::{DEFAULT_BAUD_RATE, LinkSettings};
use crate::wiretap::DEFAULT_CAPACITY;

/// Valid slave addresses on an adapter bus.
pub const SLAVE_ID_RANGE: std::ops::RangeInclusive<u8> = 1..=32;
pub const POLL_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 5..=300;
pub const RETRY_COUNT_RANGE: std::ops::RangeInclusive<u32> = 0..=10;
pub const READ_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 100..=60_000;

/// Complete service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EctobusConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    pub modbus: ModbusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Devices to poll
    pub devices: Vec<DeviceConfig>,

    /// Overrides of the built-in register tables
    #[serde(default)]
    pub registers: RegisterTables,
}

/// Configuration for a single adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (used in logs and diagnostics)
    pub name: String,

    /// Serial port path (e.g. "/dev/ttyUSB0")
    pub port: String,

    /// Modbus slave address (1-32)
    pub slave_id: u8,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Poll interval in seconds (5-300)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Retries per poll cycle (0-10)
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Base delay between retries in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Per-transaction timeout in milliseconds (100-60000)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Capture raw frames for diagnostics
    #[serde(default)]
    pub debug_modbus: bool,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_poll_interval() -> u64 {
    15
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_read_timeout() -> u64 {
    3000
}

impl DeviceConfig {
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            baud_rate: self.baud_rate,
            wiretap: self.debug_modbus,
            wiretap_capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            name: self.name.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            retry: RetryPolicy {
                max_retries: self.retry_count,
                base_delay: Duration::from_millis(self.retry_delay_ms),
            },
            read_timeout: self.read_timeout(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("Device name cannot be empty"));
        }
        if self.port.is_empty() {
            return Err(Error::validation(format!(
                "Device '{}': port cannot be empty",
                self.name
            )));
        }
        if !SLAVE_ID_RANGE.contains(&self.slave_id) {
            return Err(Error::validation(format!(
                "Device '{}': slave_id must be 1-32",
                self.name
            )));
        }
        if self.baud_rate == 0 {
            return Err(Error::validation(format!(
                "Device '{}': baud_rate must be positive",
                self.name
            )));
        }
        if !POLL_INTERVAL_RANGE.contains(&self.poll_interval_secs) {
            return Err(Error::validation(format!(
                "Device '{}': poll_interval_secs must be 5-300",
                self.name
            )));
        }
        if !RETRY_COUNT_RANGE.contains(&self.retry_count) {
            return Err(Error::validation(format!(
                "Device '{}': retry_count must be 0-10",
                self.name
            )));
        }
        if !READ_TIMEOUT_RANGE.contains(&self.read_timeout_ms) {
            return Err(Error::validation(format!(
                "Device '{}': read_timeout_ms must be 100-60000",
                self.name
            )));
        }
        Ok(())
    }
}

impl ServiceConfig for EctobusConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> Result<()> {
        if self.modbus.devices.is_empty() {
            return Err(Error::validation("At least one device must be configured"));
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        let mut links: HashMap<&str, &DeviceConfig> = HashMap::new();

        for device in &self.modbus.devices {
            device.validate()?;

            if !names.insert(device.name.as_str()) {
                return Err(Error::validation(format!(
                    "Duplicate device name '{}'",
                    device.name
                )));
            }
            if !addresses.insert((device.port.as_str(), device.slave_id)) {
                return Err(Error::validation(format!(
                    "Device '{}': slave {} on {} is already configured",
                    device.name, device.slave_id, device.port
                )));
            }

            // Devices on one port share a single link.
            let first = *links.entry(device.port.as_str()).or_insert(device);
            if first.link_settings() != device.link_settings() {
                return Err(Error::validation(format!(
                    "Device '{}': link settings on {} differ from device '{}' \
                     (baud_rate and debug_modbus must match per port)",
                    device.name, device.port, first.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{RegisterKind, Width};
    use std::io::Write;

    const MINIMAL: &str = r#"
    {
        modbus: {
            devices: [
                { name: "boiler", port: "/dev/ttyUSB0", slave_id: 1 },
            ],
        },
    }
    "#;

    #[test]
    fn test_defaults() {
        let config = EctobusConfig::parse(MINIMAL).unwrap();
        let device = &config.modbus.devices[0];

        assert_eq!(config.logging.level, "info");
        assert_eq!(device.baud_rate, 19200);
        assert_eq!(device.poll_interval_secs, 15);
        assert_eq!(device.retry_count, 3);
        assert_eq!(device.retry_delay_ms, 500);
        assert_eq!(device.read_timeout_ms, 3000);
        assert!(!device.debug_modbus);
        assert_eq!(config.modbus.registers, RegisterTables::default());
    }

    #[test]
    fn test_coordinator_config() {
        let config = EctobusConfig::parse(
            r#"{
                modbus: {
                    devices: [{
                        name: "boiler", port: "/dev/ttyUSB0", slave_id: 2,
                        poll_interval_secs: 30, retry_count: 5,
                        retry_delay_ms: 250, read_timeout_ms: 1500,
                        debug_modbus: true,
                    }],
                },
            }"#,
        )
        .unwrap();
        let device = &config.modbus.devices[0];

        let coordinator = device.coordinator_config();
        assert_eq!(coordinator.name, "boiler");
        assert_eq!(coordinator.poll_interval, Duration::from_secs(30));
        assert_eq!(coordinator.retry.max_retries, 5);
        assert_eq!(coordinator.retry.base_delay, Duration::from_millis(250));
        assert_eq!(coordinator.read_timeout, Duration::from_millis(1500));
        assert!(device.link_settings().wiretap);
    }

    #[test]
    fn test_register_overrides() {
        let config = EctobusConfig::parse(
            r#"{
                modbus: {
                    devices: [{ name: "contacts", port: "/dev/ttyUSB0", slave_id: 3 }],
                    registers: {
                        boiler: { pressure: { address: 26, width: "u8_high", scale: 10.0 } },
                        contact: { kind: "holding" },
                    },
                },
            }"#,
        )
        .unwrap();

        assert_eq!(config.modbus.registers.boiler.pressure.width, Width::U8High);
        assert_eq!(config.modbus.registers.contact.kind, RegisterKind::Holding);
    }

    #[test]
    fn test_rejects_invalid_devices() {
        let cases = [
            (r#"{ modbus: { devices: [] } }"#, "At least one device"),
            (
                r#"{ modbus: { devices: [{ name: "", port: "/dev/ttyUSB0", slave_id: 1 }] } }"#,
                "name cannot be empty",
            ),
            (
                r#"{ modbus: { devices: [{ name: "b", port: "/dev/ttyUSB0", slave_id: 33 }] } }"#,
                "slave_id must be 1-32",
            ),
            (
                r#"{ modbus: { devices: [{ name: "b", port: "/dev/ttyUSB0", slave_id: 1, poll_interval_secs: 2 }] } }"#,
                "poll_interval_secs",
            ),
            (
                r#"{ modbus: { devices: [{ name: "b", port: "/dev/ttyUSB0", slave_id: 1, retry_count: 11 }] } }"#,
                "retry_count",
            ),
            (
                r#"{ modbus: { devices: [{ name: "b", port: "/dev/ttyUSB0", slave_id: 1, read_timeout_ms: 50 }] } }"#,
                "read_timeout_ms",
            ),
            (
                r#"{ modbus: { devices: [{ name: "b", port: "/dev/ttyUSB0", slave_id: 1, baud_rate: 0 }] } }"#,
                "baud_rate",
            ),
        ];

        for (content, expected) in cases {
            let err = EctobusConfig::parse(content).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "{} did not mention {}",
                err,
                expected
            );
        }
    }

    #[test]
    fn test_rejects_duplicates() {
        let names = r#"{ modbus: { devices: [
            { name: "a", port: "/dev/ttyUSB0", slave_id: 1 },
            { name: "a", port: "/dev/ttyUSB0", slave_id: 2 },
        ] } }"#;
        assert!(
            EctobusConfig::parse(names)
                .unwrap_err()
                .to_string()
                .contains("Duplicate device name")
        );

        let addresses = r#"{ modbus: { devices: [
            { name: "a", port: "/dev/ttyUSB0", slave_id: 1 },
            { name: "b", port: "/dev/ttyUSB0", slave_id: 1 },
        ] } }"#;
        assert!(
            EctobusConfig::parse(addresses)
                .unwrap_err()
                .to_string()
                .contains("already configured")
        );

        let other_bus = r#"{ modbus: { devices: [
            { name: "a", port: "/dev/ttyUSB0", slave_id: 1 },
            { name: "b", port: "/dev/ttyUSB1", slave_id: 1 },
        ] } }"#;
        assert!(EctobusConfig::parse(other_bus).is_ok());
    }

    #[test]
    fn test_rejects_mismatched_link_settings() {
        let baud = r#"{ modbus: { devices: [
            { name: "boiler", port: "/dev/ttyUSB0", slave_id: 1 },
            { name: "contacts", port: "/dev/ttyUSB0", slave_id: 2, baud_rate: 9600 },
        ] } }"#;
        let err = EctobusConfig::parse(baud).unwrap_err().to_string();
        assert!(err.contains("'contacts'"));
        assert!(err.contains("'boiler'"));

        let wiretap = r#"{ modbus: { devices: [
            { name: "boiler", port: "/dev/ttyUSB0", slave_id: 1, debug_modbus: true },
            { name: "contacts", port: "/dev/ttyUSB0", slave_id: 2 },
        ] } }"#;
        assert!(EctobusConfig::parse(wiretap).is_err());

        let shared = r#"{ modbus: { devices: [
            { name: "boiler", port: "/dev/ttyUSB0", slave_id: 1, baud_rate: 9600, poll_interval_secs: 30 },
            { name: "contacts", port: "/dev/ttyUSB0", slave_id: 2, baud_rate: 9600 },
            { name: "other", port: "/dev/ttyUSB1", slave_id: 1, debug_modbus: true },
        ] } }"#;
        assert!(EctobusConfig::parse(shared).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = EctobusConfig::load(file.path()).unwrap();
        assert_eq!(config.modbus.devices[0].name, "boiler");

        let missing = EctobusConfig::load("/nonexistent/ectobus.json5");
        assert!(matches!(missing, Err(Error::ConfigNotFound { .. })));
    }
}
