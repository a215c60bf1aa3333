//! Boiler adapters (OpenTherm, eBus, Navien).

use serde::Serialize;
use tracing::{debug, warn};

use super::GatewayCore;
use crate::cache::RegisterCache;
use crate::command::{self, Command, CommandError, CommandPolicy};
use crate::registers::{BoilerRegisterMap, ReadBlock, Register, RegisterStatus, Setpoint};

/// Boiler bus the adapter is wired to (status register bits 0-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterType {
    OpenTherm,
    Ebus,
    Navien,
    Reserved(u8),
}

impl AdapterType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => AdapterType::OpenTherm,
            1 => AdapterType::Ebus,
            2 => AdapterType::Navien,
            other => AdapterType::Reserved(other),
        }
    }
}

impl std::fmt::Display for AdapterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterType::OpenTherm => write!(f, "OpenTherm"),
            AdapterType::Ebus => write!(f, "eBus"),
            AdapterType::Navien => write!(f, "Navien"),
            AdapterType::Reserved(code) => write!(f, "Reserved (0x{:02X})", code),
        }
    }
}

/// Format an uptime in seconds as `"2d 5h 30m"`.
pub fn format_uptime(seconds: u32) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{}m", minutes));
    }
    parts.join(" ")
}

/// Gateway for a boiler adapter.
///
/// Getters read the last polled snapshot and never touch the bus.
/// Setters issue one write each and report whether it succeeded.
#[derive(Debug, Clone)]
pub struct BoilerGateway {
    pub(super) core: GatewayCore,
    map: BoilerRegisterMap,
    commands: CommandPolicy,
}

impl BoilerGateway {
    pub(crate) fn new(core: GatewayCore, map: BoilerRegisterMap) -> Self {
        Self {
            core,
            map,
            commands: CommandPolicy::default(),
        }
    }

    /// Override the command result polling policy.
    pub fn with_command_policy(mut self, policy: CommandPolicy) -> Self {
        self.commands = policy;
        self
    }

    pub fn register_map(&self) -> &BoilerRegisterMap {
        &self.map
    }

    pub(crate) fn read_plan(&self) -> Vec<ReadBlock> {
        self.map.poll.clone()
    }

    fn snapshot(&self) -> std::sync::Arc<RegisterCache> {
        self.core.cache.snapshot()
    }

    /// Decode `reg`, honouring the status block for validated registers.
    fn value(&self, reg: &Register) -> Option<f64> {
        let cache = self.snapshot();
        if reg.validated && !self.status_ok(&cache, reg.address) {
            return None;
        }
        reg.decode(&cache)
    }

    fn int(&self, reg: &Register) -> Option<i64> {
        let cache = self.snapshot();
        if reg.validated && !self.status_ok(&cache, reg.address) {
            return None;
        }
        reg.decode_raw(&cache)
    }

    fn status_ok(&self, cache: &RegisterCache, address: u16) -> bool {
        match RegisterStatus::lookup(cache, address) {
            None | Some(RegisterStatus::Valid) => true,
            Some(status) => {
                debug!(
                    slave = self.core.slave_id,
                    "Register 0x{:04X} unavailable: {}", address, status
                );
                false
            }
        }
    }

    /// Status of a live register (0x0010-0x003F) from the status block.
    pub fn register_status(&self, address: u16) -> Option<RegisterStatus> {
        RegisterStatus::lookup(&self.snapshot(), address)
    }

    pub fn adapter_type(&self) -> Option<AdapterType> {
        let raw = self.core.cache.get(self.map.adapter_status)?;
        Some(AdapterType::from_bits((raw & 0x07) as u8))
    }

    /// Whether the adapter has a working link to the boiler.
    pub fn is_boiler_connected(&self) -> Option<bool> {
        self.map.boiler_connected.decode(&self.snapshot())
    }

    pub fn hw_version(&self) -> Option<u8> {
        self.int(&self.map.hw_version).and_then(|v| u8::try_from(v).ok())
    }

    pub fn sw_version(&self) -> Option<u8> {
        self.int(&self.map.sw_version).and_then(|v| u8::try_from(v).ok())
    }

    /// Adapter uptime in seconds.
    pub fn adapter_uptime(&self) -> Option<u32> {
        self.int(&self.map.uptime).and_then(|v| u32::try_from(v).ok())
    }

    pub fn adapter_uptime_formatted(&self) -> Option<String> {
        self.adapter_uptime().map(format_uptime)
    }

    /// Central heating flow temperature, °C.
    pub fn ch_temperature(&self) -> Option<f64> {
        self.value(&self.map.ch_temperature)
    }

    /// Domestic hot water temperature, °C.
    pub fn dhw_temperature(&self) -> Option<f64> {
        self.value(&self.map.dhw_temperature)
    }

    /// Circuit pressure, bar.
    pub fn pressure(&self) -> Option<f64> {
        self.value(&self.map.pressure)
    }

    /// DHW flow rate, l/min.
    pub fn flow_rate(&self) -> Option<f64> {
        self.value(&self.map.flow_rate)
    }

    /// Burner modulation, %.
    pub fn modulation_level(&self) -> Option<u8> {
        self.int(&self.map.modulation_level)
            .and_then(|v| u8::try_from(v).ok())
    }

    pub fn burner_on(&self) -> Option<bool> {
        self.map.burner_on.decode(&self.snapshot())
    }

    pub fn heating_active(&self) -> Option<bool> {
        self.map.heating_active.decode(&self.snapshot())
    }

    pub fn dhw_active(&self) -> Option<bool> {
        self.map.dhw_active.decode(&self.snapshot())
    }

    pub fn main_error(&self) -> Option<u16> {
        self.int(&self.map.main_error).and_then(|v| u16::try_from(v).ok())
    }

    pub fn additional_error(&self) -> Option<u16> {
        self.int(&self.map.additional_error)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Outdoor temperature, °C.
    pub fn outdoor_temperature(&self) -> Option<i8> {
        self.int(&self.map.outdoor_temperature)
            .and_then(|v| i8::try_from(v).ok())
    }

    pub fn manufacturer_code(&self) -> Option<u16> {
        self.int(&self.map.manufacturer_code)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn model_code(&self) -> Option<u16> {
        self.int(&self.map.model_code).and_then(|v| u16::try_from(v).ok())
    }

    /// OpenTherm error flags. Only OpenTherm adapters report them.
    pub fn opentherm_error(&self) -> Option<i8> {
        if self.adapter_type()? != AdapterType::OpenTherm {
            return None;
        }
        self.int(&self.map.opentherm_error)
            .and_then(|v| i8::try_from(v).ok())
    }

    /// Setpoint the boiler is currently working to, °C.
    pub fn ch_setpoint_active(&self) -> Option<f64> {
        self.value(&self.map.ch_setpoint_active)
    }

    /// Requested central heating setpoint, °C.
    pub fn ch_setpoint(&self) -> Option<f64> {
        self.value(&self.map.ch_setpoint.register)
    }

    pub fn ch_min_limit(&self) -> Option<f64> {
        self.value(&self.map.ch_min_limit.register)
    }

    pub fn ch_max_limit(&self) -> Option<f64> {
        self.value(&self.map.ch_max_limit.register)
    }

    pub fn dhw_min_limit(&self) -> Option<f64> {
        self.value(&self.map.dhw_min_limit)
    }

    pub fn dhw_max_limit(&self) -> Option<f64> {
        self.value(&self.map.dhw_max_limit)
    }

    pub fn dhw_setpoint(&self) -> Option<f64> {
        self.value(&self.map.dhw_setpoint.register)
    }

    pub fn max_modulation(&self) -> Option<f64> {
        self.value(&self.map.max_modulation.register)
    }

    /// Heating circuit enable switch.
    pub fn heating_enabled(&self) -> Option<bool> {
        self.map.heating_enabled.decode(&self.snapshot())
    }

    /// DHW circuit enable switch.
    pub fn dhw_enabled(&self) -> Option<bool> {
        self.map.dhw_enabled.decode(&self.snapshot())
    }

    async fn write_setpoint(&self, name: &str, setpoint: Setpoint, value: f64) -> bool {
        let Some(raw) = setpoint.encode(value) else {
            warn!(
                slave = self.core.slave_id,
                "Rejected {} {}: not representable", name, value
            );
            return false;
        };
        debug!(
            slave = self.core.slave_id,
            "Setting {} to {} (raw 0x{:04X})", name, value, raw
        );
        self.core.write(setpoint.address(), raw).await
    }

    pub async fn set_ch_setpoint(&self, celsius: f64) -> bool {
        self.write_setpoint("CH setpoint", self.map.ch_setpoint, celsius)
            .await
    }

    pub async fn set_dhw_setpoint(&self, celsius: f64) -> bool {
        self.write_setpoint("DHW setpoint", self.map.dhw_setpoint, celsius)
            .await
    }

    pub async fn set_max_modulation(&self, percent: f64) -> bool {
        if !(0.0..=100.0).contains(&percent) {
            warn!(slave = self.core.slave_id, percent, "Max modulation outside 0-100");
            return false;
        }
        self.write_setpoint("max modulation", self.map.max_modulation, percent)
            .await
    }

    pub async fn set_ch_min_limit(&self, celsius: f64) -> bool {
        self.write_setpoint("CH min limit", self.map.ch_min_limit, celsius)
            .await
    }

    pub async fn set_ch_max_limit(&self, celsius: f64) -> bool {
        self.write_setpoint("CH max limit", self.map.ch_max_limit, celsius)
            .await
    }

    pub async fn set_heating_enabled(&self, enabled: bool) -> bool {
        let flag = self.map.heating_enabled;
        self.core.set_bit(flag.address, flag.bit, enabled).await
    }

    pub async fn set_dhw_enabled(&self, enabled: bool) -> bool {
        let flag = self.map.dhw_enabled;
        self.core.set_bit(flag.address, flag.bit, enabled).await
    }

    pub async fn reboot_adapter(&self) -> Result<(), CommandError> {
        self.execute(Command::RebootAdapter).await
    }

    pub async fn reset_boiler_errors(&self) -> Result<(), CommandError> {
        self.execute(Command::ResetErrors).await
    }

    async fn execute(&self, command: Command) -> Result<(), CommandError> {
        command::execute(&self.core, self.map.commands, command, &self.commands).await
    }
}
