//! Register tables and raw value decoding.
//!
//! Every field an adapter exposes is described by a [`Register`]: where it
//! lives, which part of the 16-bit word carries it, how it is scaled and
//! which raw value means "no data". The tables are plain data with the
//! hardware defaults, and can be overridden from configuration.

use serde::{Deserialize, Serialize};

use crate::cache::RegisterCache;

/// Offset from a live register to its entry in the status block.
pub const STATUS_OFFSET: u16 = 0x30;

/// Live registers that have a status entry.
pub const STATUS_RANGE: std::ops::RangeInclusive<u16> = 0x0010..=0x003F;

/// Which part of the register(s) a field occupies and how it is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Width {
    /// Full word, unsigned.
    U16,
    /// Full word, two's complement.
    I16,
    /// High byte, unsigned.
    U8High,
    /// Low byte, unsigned.
    U8Low,
    /// High byte, two's complement.
    I8High,
    /// Low byte, two's complement.
    I8Low,
    /// Two consecutive words, high word first.
    U32,
}

impl Width {
    fn extract(&self, address: u16, cache: &RegisterCache) -> Option<u32> {
        let word = cache.get(address)?;
        let raw = match self {
            Width::U16 | Width::I16 => u32::from(word),
            Width::U8High | Width::I8High => u32::from(word >> 8),
            Width::U8Low | Width::I8Low => u32::from(word & 0xFF),
            Width::U32 => {
                let low = cache.get(address.checked_add(1)?)?;
                (u32::from(word) << 16) | u32::from(low)
            }
        };
        Some(raw)
    }

    fn to_signed(&self, raw: u32) -> i64 {
        match self {
            Width::I16 => i64::from(raw as u16 as i16),
            Width::I8High | Width::I8Low => i64::from(raw as u8 as i8),
            _ => i64::from(raw),
        }
    }

    /// Pack an integer into the word layout, or `None` if it does not fit.
    fn pack(&self, value: i64) -> Option<u16> {
        match self {
            Width::U16 => u16::try_from(value).ok(),
            Width::I16 => i16::try_from(value).ok().map(|v| v as u16),
            Width::U8High => u8::try_from(value).ok().map(|v| u16::from(v) << 8),
            Width::U8Low => u8::try_from(value).ok().map(u16::from),
            Width::I8High => i8::try_from(value).ok().map(|v| u16::from(v as u8) << 8),
            Width::I8Low => i8::try_from(value).ok().map(|v| u16::from(v as u8)),
            Width::U32 => None,
        }
    }
}

fn default_scale() -> f64 {
    1.0
}

/// One field of a device's register map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Register {
    /// Register address.
    pub address: u16,
    /// Field layout.
    pub width: Width,
    /// Divisor applied after sign conversion.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Raw field value meaning "unavailable".
    #[serde(default)]
    pub sentinel: Option<u32>,
    /// Whether the status block must report the register as valid.
    #[serde(default)]
    pub validated: bool,
}

impl Register {
    /// Unscaled field with no sentinel.
    pub const fn new(address: u16, width: Width) -> Self {
        Self {
            address,
            width,
            scale: 1.0,
            sentinel: None,
            validated: false,
        }
    }

    pub const fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub const fn sentinel(mut self, sentinel: u32) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    pub const fn validated(mut self) -> Self {
        self.validated = true;
        self
    }

    /// Sign-converted field value, or `None` if missing or the sentinel.
    ///
    /// The sentinel is compared against the unconverted field so that an
    /// "unavailable" marker is never reinterpreted as a number.
    pub fn decode_raw(&self, cache: &RegisterCache) -> Option<i64> {
        let raw = self.width.extract(self.address, cache)?;
        if self.sentinel == Some(raw) {
            return None;
        }
        Some(self.width.to_signed(raw))
    }

    /// Engineering value: sign-converted field divided by the scale.
    pub fn decode(&self, cache: &RegisterCache) -> Option<f64> {
        self.decode_raw(cache).map(|v| v as f64 / self.scale)
    }

    /// Raw word for an engineering value, or `None` if not representable.
    pub fn encode(&self, value: f64) -> Option<u16> {
        let scaled = (value * self.scale).round();
        if !scaled.is_finite() {
            return None;
        }
        self.width.pack(scaled as i64)
    }
}

/// A single bit of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub address: u16,
    pub bit: u8,
}

impl Flag {
    pub const fn new(address: u16, bit: u8) -> Self {
        Self { address, bit }
    }

    pub fn decode(&self, cache: &RegisterCache) -> Option<bool> {
        let word = cache.get(self.address)?;
        Some(word.checked_shr(u32::from(self.bit))? & 1 == 1)
    }
}

/// A writable field whose write layout differs from its read layout.
///
/// The adapters report byte-sized setpoints in the high byte but accept
/// writes in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    /// How the current value is read back.
    pub register: Register,
    /// How a new value is written.
    pub write_width: Width,
}

impl Setpoint {
    pub const fn new(register: Register, write_width: Width) -> Self {
        Self {
            register,
            write_width,
        }
    }

    pub fn address(&self) -> u16 {
        self.register.address
    }

    pub fn decode(&self, cache: &RegisterCache) -> Option<f64> {
        self.register.decode(cache)
    }

    pub fn encode(&self, value: f64) -> Option<u16> {
        Register {
            width: self.write_width,
            ..self.register
        }
        .encode(value)
    }
}

/// Per-register status reported in the status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    Valid,
    NotInitialized,
    NotSupported,
    ReadWriteError,
    Other(i16),
}

impl RegisterStatus {
    pub fn from_raw(raw: u16) -> Self {
        match raw as i16 {
            0 => RegisterStatus::Valid,
            1 => RegisterStatus::NotInitialized,
            -1 => RegisterStatus::NotSupported,
            -2 => RegisterStatus::ReadWriteError,
            other => RegisterStatus::Other(other),
        }
    }

    /// Status block address for a live register, if it has one.
    pub fn address_for(register: u16) -> Option<u16> {
        STATUS_RANGE
            .contains(&register)
            .then(|| register + STATUS_OFFSET)
    }

    /// Look up the status of `register` in a cache snapshot.
    pub fn lookup(cache: &RegisterCache, register: u16) -> Option<Self> {
        Self::address_for(register)
            .and_then(|addr| cache.get(addr))
            .map(Self::from_raw)
    }
}

impl std::fmt::Display for RegisterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterStatus::Valid => write!(f, "valid"),
            RegisterStatus::NotInitialized => write!(f, "not initialized"),
            RegisterStatus::NotSupported => write!(f, "not supported by boiler"),
            RegisterStatus::ReadWriteError => write!(f, "read/write error"),
            RegisterStatus::Other(code) => write!(f, "unknown status {}", code),
        }
    }
}

/// Modbus table a read block targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Function 0x03.
    Holding,
    /// Function 0x04.
    Input,
}

/// One contiguous read issued by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBlock {
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
}

impl std::fmt::Display for ReadBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
        };
        write!(f, "{} {} @ 0x{:04X}", self.count, kind, self.start)
    }
}

/// Command and result registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRegisters {
    pub command: u16,
    pub result: u16,
}

/// Register map of the boiler adapters (OpenTherm, eBus, Navien).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoilerRegisterMap {
    /// Registers read every poll cycle.
    pub poll: Vec<ReadBlock>,
    /// Adapter status word: bits 0-2 adapter type, bit 3 boiler link.
    pub adapter_status: u16,
    pub boiler_connected: Flag,
    pub hw_version: Register,
    pub sw_version: Register,
    pub uptime: Register,
    pub ch_temperature: Register,
    pub dhw_temperature: Register,
    pub pressure: Register,
    pub flow_rate: Register,
    pub modulation_level: Register,
    pub burner_on: Flag,
    pub heating_active: Flag,
    pub dhw_active: Flag,
    pub main_error: Register,
    pub additional_error: Register,
    pub outdoor_temperature: Register,
    pub manufacturer_code: Register,
    pub model_code: Register,
    pub opentherm_error: Register,
    pub ch_setpoint_active: Register,
    pub ch_setpoint: Setpoint,
    pub ch_min_limit: Setpoint,
    pub ch_max_limit: Setpoint,
    pub dhw_min_limit: Register,
    pub dhw_max_limit: Register,
    pub dhw_setpoint: Setpoint,
    pub max_modulation: Setpoint,
    pub heating_enabled: Flag,
    pub dhw_enabled: Flag,
    pub commands: CommandRegisters,
}

impl Default for BoilerRegisterMap {
    fn default() -> Self {
        let byte_high = |address| Register::new(address, Width::U8High).sentinel(0xFF);
        let word = |address| Register::new(address, Width::U16).sentinel(0xFFFF);

        Self {
            poll: vec![
                ReadBlock {
                    kind: RegisterKind::Holding,
                    start: 0x0010,
                    count: 23,
                },
                ReadBlock {
                    kind: RegisterKind::Holding,
                    start: 0x0031,
                    count: 9,
                },
                ReadBlock {
                    kind: RegisterKind::Holding,
                    start: *STATUS_RANGE.start() + STATUS_OFFSET,
                    count: *STATUS_RANGE.end() - *STATUS_RANGE.start() + 1,
                },
            ],
            adapter_status: 0x0010,
            boiler_connected: Flag::new(0x0010, 3),
            hw_version: byte_high(0x0011),
            sw_version: Register::new(0x0011, Width::U8Low).sentinel(0xFF),
            uptime: Register::new(0x0012, Width::U32).sentinel(0xFFFF_FFFF),
            ch_temperature: Register::new(0x0018, Width::I16)
                .scale(10.0)
                .sentinel(0x7FFF)
                .validated(),
            dhw_temperature: Register::new(0x0019, Width::U16)
                .scale(10.0)
                .sentinel(0x7FFF)
                .validated(),
            pressure: Register::new(0x001A, Width::U8Low)
                .scale(10.0)
                .sentinel(0xFF)
                .validated(),
            flow_rate: Register::new(0x001B, Width::U8Low)
                .scale(10.0)
                .sentinel(0xFF)
                .validated(),
            modulation_level: Register::new(0x001C, Width::U8Low)
                .sentinel(0xFF)
                .validated(),
            burner_on: Flag::new(0x001D, 0),
            heating_active: Flag::new(0x001D, 1),
            dhw_active: Flag::new(0x001D, 2),
            main_error: word(0x001E),
            additional_error: word(0x001F),
            outdoor_temperature: Register::new(0x0020, Width::I8High)
                .sentinel(0x7F)
                .validated(),
            manufacturer_code: word(0x0021),
            model_code: word(0x0022),
            opentherm_error: Register::new(0x0023, Width::I8High).sentinel(0x7F),
            ch_setpoint_active: Register::new(0x0026, Width::I16)
                .scale(256.0)
                .sentinel(0x7FFF)
                .validated(),
            ch_setpoint: Setpoint::new(
                Register::new(0x0031, Width::I16)
                    .scale(10.0)
                    .sentinel(0x7FFF)
                    .validated(),
                Width::I16,
            ),
            ch_min_limit: Setpoint::new(byte_high(0x0033), Width::U8Low),
            ch_max_limit: Setpoint::new(byte_high(0x0034), Width::U8Low),
            dhw_min_limit: byte_high(0x0035),
            dhw_max_limit: byte_high(0x0036),
            dhw_setpoint: Setpoint::new(byte_high(0x0037), Width::U8Low),
            max_modulation: Setpoint::new(byte_high(0x0038), Width::U8Low),
            heating_enabled: Flag::new(0x0039, 0),
            dhw_enabled: Flag::new(0x0039, 1),
            commands: CommandRegisters {
                command: 0x0080,
                result: 0x0081,
            },
        }
    }
}

/// Register map of the contact splitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactRegisterMap {
    /// Table holding the channel bitfields.
    pub kind: RegisterKind,
    /// Bitfield for channels 1-8.
    pub base: u16,
    /// Bitfield for channels 9 and up.
    pub extended: u16,
}

impl Default for ContactRegisterMap {
    fn default() -> Self {
        Self {
            kind: RegisterKind::Input,
            base: 0x0010,
            extended: 0x0011,
        }
    }
}

/// Register maps for every supported gateway variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterTables {
    pub boiler: BoilerRegisterMap,
    pub contact: ContactRegisterMap,
}
