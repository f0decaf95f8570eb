//! LoRa band, modulation and gateway configuration.
//!
//! Modulation parameters are small enums whose discriminants are the codes
//! the SX127x registers use; conversion from raw numbers goes through
//! `TryFrom` so an out-of-range value is rejected before any register is
//! touched. The deployed gateway settings are collected in [`GatewayConfig`].

use super::csma::CarrierSenseConfig;
use std::fmt;

/// Frequency band the gateway is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// 433 MHz ISM band.
    Band433,
    /// 470 MHz (China) band.
    Band470,
    /// EU 863-870 MHz band.
    Band868,
    /// US 902-928 MHz band.
    Band900,
}

impl Band {
    /// Channel (FRF register value) used when no explicit channel is set.
    pub fn default_channel(self) -> u32 {
        match self {
            Self::Band433 => CH_00_433,
            Self::Band470 => CH_00_470,
            Self::Band868 => CH_10_868,
            Self::Band900 => CH_05_900,
        }
    }
}

impl Default for Band {
    fn default() -> Self {
        #[cfg(feature = "band-470")]
        return Self::Band470;
        #[cfg(feature = "band-868")]
        return Self::Band868;
        #[cfg(feature = "band-900")]
        return Self::Band900;
        #[cfg(not(any(feature = "band-470", feature = "band-868", feature = "band-900")))]
        Self::Band433
    }
}

// ==================== Channels ====================
// FRF register values (Fstep = 32 MHz / 2^19).

pub const CH_04_868: u32 = 0xD7CCCC;
pub const CH_05_868: u32 = 0xD7E000;
pub const CH_06_868: u32 = 0xD7F333;
pub const CH_07_868: u32 = 0xD80666;
pub const CH_08_868: u32 = 0xD81999;
pub const CH_09_868: u32 = 0xD82CCC;
pub const CH_10_868: u32 = 0xD84CCC;
pub const CH_11_868: u32 = 0xD86000;
pub const CH_12_868: u32 = 0xD87333;
pub const CH_13_868: u32 = 0xD88666;
pub const CH_14_868: u32 = 0xD89999;
pub const CH_15_868: u32 = 0xD8ACCC;
pub const CH_16_868: u32 = 0xD8C000;
pub const CH_17_868: u32 = 0xD90000;
/// 868.1 MHz, the LoRaWAN test channel.
pub const CH_18_868: u32 = 0xD90666;

pub const CH_00_900: u32 = 0xE1C51E;
pub const CH_01_900: u32 = 0xE24F5C;
pub const CH_02_900: u32 = 0xE2D999;
pub const CH_03_900: u32 = 0xE363D7;
pub const CH_04_900: u32 = 0xE3EE14;
pub const CH_05_900: u32 = 0xE47851;
pub const CH_06_900: u32 = 0xE5028F;
pub const CH_07_900: u32 = 0xE58CCC;
pub const CH_08_900: u32 = 0xE6170A;
pub const CH_09_900: u32 = 0xE6A147;
pub const CH_10_900: u32 = 0xE72B85;
pub const CH_11_900: u32 = 0xE7B5C2;
/// 915 MHz.
pub const CH_12_900: u32 = 0xE4C000;

pub const CH_00_470: u32 = 0x758000;
pub const CH_01_470: u32 = 0x759338;
pub const CH_02_470: u32 = 0x75A65C;
pub const CH_03_470: u32 = 0x75B980;

pub const CH_00_433: u32 = 0x6C5333;
pub const CH_01_433: u32 = 0x6C6666;
pub const CH_02_433: u32 = 0x6C7999;
pub const CH_03_433: u32 = 0x6C9333;

/// Largest value the 24-bit FRF register can hold.
pub const MAX_CHANNEL: u32 = 0xFF_FFFF;

// ==================== Radio defaults ====================

/// Sync word shared by every node of the network.
pub const DEFAULT_SYNC_WORD: u8 = 0x34;
pub const DEFAULT_PREAMBLE_LENGTH: u16 = 8;
/// Gateway node address.
pub const DEFAULT_NODE_ADDRESS: u8 = 1;
pub const DEFAULT_MODE: u8 = 11;
pub const DEFAULT_MAX_DBM: u8 = 20;
/// Delay after a configuration write before it is read back.
pub const DEFAULT_SETTLE_MS: u32 = 100;
/// Delay between receiving a frame and transmitting its ACK.
pub const DEFAULT_ACK_TURNAROUND_MS: u32 = 500;

/// Configuration validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric value is outside its legal set.
    OutOfRange { field: &'static str, value: u32 },
    /// A combination of values is not allowed.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { field, value } => {
                write!(f, "{} out of range: {}", field, value)
            }
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// LoRa signal bandwidth. Discriminants are the SX1276 register codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Bandwidth {
    Bw7_8 = 0,
    Bw10_4 = 1,
    Bw15_6 = 2,
    Bw20_8 = 3,
    Bw31_25 = 4,
    Bw41_7 = 5,
    Bw62_5 = 6,
    Bw125 = 7,
    Bw250 = 8,
    Bw500 = 9,
}

impl Bandwidth {
    pub const ALL: [Bandwidth; 10] = [
        Self::Bw7_8,
        Self::Bw10_4,
        Self::Bw15_6,
        Self::Bw20_8,
        Self::Bw31_25,
        Self::Bw41_7,
        Self::Bw62_5,
        Self::Bw125,
        Self::Bw250,
        Self::Bw500,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn hz(self) -> u32 {
        match self {
            Self::Bw7_8 => 7_800,
            Self::Bw10_4 => 10_400,
            Self::Bw15_6 => 15_600,
            Self::Bw20_8 => 20_800,
            Self::Bw31_25 => 31_250,
            Self::Bw41_7 => 41_700,
            Self::Bw62_5 => 62_500,
            Self::Bw125 => 125_000,
            Self::Bw250 => 250_000,
            Self::Bw500 => 500_000,
        }
    }
}

impl TryFrom<u8> for Bandwidth {
    type Error = ConfigError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or(ConfigError::OutOfRange {
                field: "bandwidth",
                value: code as u32,
            })
    }
}

/// Forward error correction rate 4/5 .. 4/8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingRate {
    Cr4_5 = 1,
    Cr4_6 = 2,
    Cr4_7 = 3,
    Cr4_8 = 4,
}

impl CodingRate {
    /// Register code (1..=4).
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Denominator of the rate (5..=8).
    pub fn denominator(self) -> u8 {
        self as u8 + 4
    }
}

impl TryFrom<u8> for CodingRate {
    type Error = ConfigError;

    /// Accepts the register code (1..=4).
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Cr4_5),
            2 => Ok(Self::Cr4_6),
            3 => Ok(Self::Cr4_7),
            4 => Ok(Self::Cr4_8),
            _ => Err(ConfigError::OutOfRange {
                field: "coding rate",
                value: code as u32,
            }),
        }
    }
}

/// Chips per symbol as a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpreadingFactor {
    Sf6 = 6,
    Sf7 = 7,
    Sf8 = 8,
    Sf9 = 9,
    Sf10 = 10,
    Sf11 = 11,
    Sf12 = 12,
}

impl SpreadingFactor {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SpreadingFactor {
    type Error = ConfigError;

    fn try_from(sf: u8) -> Result<Self, Self::Error> {
        match sf {
            6 => Ok(Self::Sf6),
            7 => Ok(Self::Sf7),
            8 => Ok(Self::Sf8),
            9 => Ok(Self::Sf9),
            10 => Ok(Self::Sf10),
            11 => Ok(Self::Sf11),
            12 => Ok(Self::Sf12),
            _ => Err(ConfigError::OutOfRange {
                field: "spreading factor",
                value: sf as u32,
            }),
        }
    }
}

/// Whether the PHY header is sent (explicit) or agreed out of band (implicit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    Explicit,
    Implicit,
}

/// Low-data-rate optimisation is mandatory for 125 kHz at SF11 and SF12.
pub fn requires_low_data_rate_optimize(bw: Bandwidth, sf: SpreadingFactor) -> bool {
    bw == Bandwidth::Bw125 && sf >= SpreadingFactor::Sf11
}

/// Named output power levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerLevel {
    /// 'L'
    Low,
    /// 'H'
    High,
    /// 'M'
    Max,
    /// 'x', PA_BOOST around 14 dBm.
    Boost,
    /// 'X', PA_BOOST with the high-power DAC, 20 dBm.
    Max20dBm,
}

impl PowerLevel {
    pub fn letter(self) -> char {
        match self {
            Self::Low => 'L',
            Self::High => 'H',
            Self::Max => 'M',
            Self::Boost => 'x',
            Self::Max20dBm => 'X',
        }
    }
}

impl TryFrom<char> for PowerLevel {
    type Error = ConfigError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c {
            'L' => Ok(Self::Low),
            'H' => Ok(Self::High),
            'M' => Ok(Self::Max),
            'x' => Ok(Self::Boost),
            'X' => Ok(Self::Max20dBm),
            _ => Err(ConfigError::OutOfRange {
                field: "power level",
                value: c as u32,
            }),
        }
    }
}

/// One of the canonical LoRa mode presets (1..=11), all at CR 4/5.
///
/// | mode | SF | BW |
/// |------|----|----|
/// | 1 | 12 | 125 |
/// | 2 | 12 | 250 |
/// | 3 | 10 | 125 |
/// | 4 | 12 | 500 |
/// | 5 | 10 | 250 |
/// | 6 | 11 | 500 |
/// | 7 | 9 | 250 |
/// | 8 | 9 | 500 |
/// | 9 | 8 | 500 |
/// | 10 | 7 | 500 |
/// | 11 | 12 | 125 (network sync word) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePreset(u8);

impl ModePreset {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 11;

    pub fn new(mode: u8) -> Result<Self, ConfigError> {
        if (Self::MIN..=Self::MAX).contains(&mode) {
            Ok(Self(mode))
        } else {
            Err(ConfigError::OutOfRange {
                field: "mode",
                value: mode as u32,
            })
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn coding_rate(self) -> CodingRate {
        CodingRate::Cr4_5
    }

    pub fn spreading_factor(self) -> SpreadingFactor {
        use SpreadingFactor::*;
        match self.0 {
            1 | 2 | 4 | 11 => Sf12,
            3 | 5 => Sf10,
            6 => Sf11,
            7 | 8 => Sf9,
            9 => Sf8,
            _ => Sf7,
        }
    }

    pub fn bandwidth(self) -> Bandwidth {
        use Bandwidth::*;
        match self.0 {
            1 | 3 | 11 => Bw125,
            2 | 5 | 7 => Bw250,
            _ => Bw500,
        }
    }

    /// Sync word programmed with the preset.
    pub fn sync_word(self) -> u8 {
        DEFAULT_SYNC_WORD
    }
}

impl Default for ModePreset {
    fn default() -> Self {
        Self(DEFAULT_MODE)
    }
}

impl TryFrom<u8> for ModePreset {
    type Error = ConfigError;

    fn try_from(mode: u8) -> Result<Self, Self::Error> {
        Self::new(mode)
    }
}

/// Settings the gateway applies at start-up.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub band: Band,
    /// Overrides the band's default channel.
    pub channel: Option<u32>,
    pub mode: ModePreset,
    pub node_address: u8,
    pub power: PowerLevel,
    pub pa_boost: bool,
    pub carrier_sense: CarrierSenseConfig,
    /// Enforce the hourly airtime budget.
    pub limit_toa: bool,
    /// Send and accept frames without the link header.
    pub raw_format: bool,
    /// Two-byte network key prefixed to every frame.
    pub net_key: Option<[u8; 2]>,
    /// Accept frames for any destination.
    pub receive_all: bool,
    /// Re-send every received frame to this address instead of reporting it.
    pub relay: Option<u8>,
    pub settle_ms: u32,
    pub ack_turnaround_ms: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            band: Band::default(),
            channel: None,
            mode: ModePreset::default(),
            node_address: DEFAULT_NODE_ADDRESS,
            power: PowerLevel::Max20dBm,
            pa_boost: true,
            carrier_sense: CarrierSenseConfig::default(),
            limit_toa: false,
            raw_format: false,
            net_key: None,
            receive_all: false,
            relay: None,
            settle_ms: DEFAULT_SETTLE_MS,
            ack_turnaround_ms: DEFAULT_ACK_TURNAROUND_MS,
        }
    }
}

impl GatewayConfig {
    /// Channel that will actually be programmed.
    pub fn effective_channel(&self) -> u32 {
        self.channel.unwrap_or_else(|| self.band.default_channel())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let channel = self.effective_channel();
        if channel == 0 || channel > MAX_CHANNEL {
            return Err(ConfigError::OutOfRange {
                field: "channel",
                value: channel,
            });
        }
        if self.node_address == 0 {
            return Err(ConfigError::Invalid(
                "node address 0 is the broadcast address",
            ));
        }
        if self.power == PowerLevel::Max20dBm && !self.pa_boost {
            return Err(ConfigError::Invalid("20 dBm output requires PA_BOOST"));
        }
        if let Some(next_hop) = self.relay {
            if next_hop == self.node_address {
                return Err(ConfigError::Invalid("relay target is this node"));
            }
        }
        if self.settle_ms > 1_000 {
            return Err(ConfigError::OutOfRange {
                field: "settle_ms",
                value: self.settle_ms,
            });
        }
        if self.ack_turnaround_ms > 5_000 {
            return Err(ConfigError::OutOfRange {
                field: "ack_turnaround_ms",
                value: self.ack_turnaround_ms,
            });
        }
        self.carrier_sense
            .validate()
            .map_err(|_| ConfigError::Invalid("carrier sense settings"))
    }
}
