//! Chip variant strategy.
//!
//! The SX1272 and SX1276 share the register map but pack several modem
//! fields differently. [`Board`] is chosen once from REG_VERSION and answers
//! every layout question, so the driver never compares chip ids itself.

use super::config::{Bandwidth, CodingRate};
use super::regs::{
    PA_MAX_POWER_SX1276, REG_MODEM_CONFIG1, REG_MODEM_CONFIG2, REG_MODEM_CONFIG3, VERSION_SX1272,
    VERSION_SX1276,
};

const SX1272_BW_125: u8 = 0x00;
const SX1272_BW_250: u8 = 0x01;
const SX1272_BW_500: u8 = 0x02;

/// A single flag bit inside one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegBit {
    pub register: u8,
    pub mask: u8,
}

impl RegBit {
    const fn new(register: u8, bit: u8) -> Self {
        Self {
            register,
            mask: 1 << bit,
        }
    }

    pub fn is_set(self, value: u8) -> bool {
        value & self.mask != 0
    }

    pub fn apply(self, value: u8, on: bool) -> u8 {
        if on {
            value | self.mask
        } else {
            value & !self.mask
        }
    }
}

/// SX127x chip variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    Sx1272,
    /// SX1276/77/78/79.
    Sx1276,
}

impl Board {
    /// Identify the chip from the REG_VERSION value.
    pub fn detect(version: u8) -> Option<Self> {
        match version {
            VERSION_SX1272 => Some(Self::Sx1272),
            VERSION_SX1276 => Some(Self::Sx1276),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sx1272 => "SX1272",
            Self::Sx1276 => "SX1276",
        }
    }

    pub fn supports_bandwidth(self, bw: Bandwidth) -> bool {
        match self {
            Self::Sx1272 => matches!(bw, Bandwidth::Bw125 | Bandwidth::Bw250 | Bandwidth::Bw500),
            Self::Sx1276 => true,
        }
    }

    fn bandwidth_shift(self) -> u8 {
        match self {
            Self::Sx1272 => 6,
            Self::Sx1276 => 4,
        }
    }

    fn bandwidth_mask(self) -> u8 {
        match self {
            Self::Sx1272 => 0xC0,
            Self::Sx1276 => 0xF0,
        }
    }

    /// Replace the bandwidth field of MODEM_CONFIG1.
    ///
    /// Returns `None` if the chip cannot run this bandwidth.
    pub fn encode_bandwidth(self, config1: u8, bw: Bandwidth) -> Option<u8> {
        let code = match self {
            Self::Sx1272 => match bw {
                Bandwidth::Bw125 => SX1272_BW_125,
                Bandwidth::Bw250 => SX1272_BW_250,
                Bandwidth::Bw500 => SX1272_BW_500,
                _ => return None,
            },
            Self::Sx1276 => bw.code(),
        };
        Some((config1 & !self.bandwidth_mask()) | (code << self.bandwidth_shift()))
    }

    pub fn decode_bandwidth(self, config1: u8) -> Option<Bandwidth> {
        let code = (config1 & self.bandwidth_mask()) >> self.bandwidth_shift();
        match self {
            Self::Sx1272 => match code {
                SX1272_BW_125 => Some(Bandwidth::Bw125),
                SX1272_BW_250 => Some(Bandwidth::Bw250),
                SX1272_BW_500 => Some(Bandwidth::Bw500),
                _ => None,
            },
            Self::Sx1276 => Bandwidth::try_from(code).ok(),
        }
    }

    fn coding_rate_shift(self) -> u8 {
        match self {
            Self::Sx1272 => 3,
            Self::Sx1276 => 1,
        }
    }

    /// Replace the coding-rate field of MODEM_CONFIG1.
    pub fn encode_coding_rate(self, config1: u8, cr: CodingRate) -> u8 {
        let shift = self.coding_rate_shift();
        (config1 & !(0x07 << shift)) | (cr.code() << shift)
    }

    pub fn decode_coding_rate(self, config1: u8) -> Option<CodingRate> {
        CodingRate::try_from((config1 >> self.coding_rate_shift()) & 0x07).ok()
    }

    /// Set = implicit header.
    pub fn implicit_header_bit(self) -> RegBit {
        match self {
            Self::Sx1272 => RegBit::new(REG_MODEM_CONFIG1, 2),
            Self::Sx1276 => RegBit::new(REG_MODEM_CONFIG1, 0),
        }
    }

    pub fn crc_bit(self) -> RegBit {
        match self {
            Self::Sx1272 => RegBit::new(REG_MODEM_CONFIG1, 1),
            Self::Sx1276 => RegBit::new(REG_MODEM_CONFIG2, 2),
        }
    }

    pub fn low_data_rate_optimize_bit(self) -> RegBit {
        match self {
            Self::Sx1272 => RegBit::new(REG_MODEM_CONFIG1, 0),
            Self::Sx1276 => RegBit::new(REG_MODEM_CONFIG3, 3),
        }
    }

    pub fn agc_auto_bit(self) -> RegBit {
        match self {
            Self::Sx1272 => RegBit::new(REG_MODEM_CONFIG2, 2),
            Self::Sx1276 => RegBit::new(REG_MODEM_CONFIG3, 2),
        }
    }

    pub fn pa_dac_register(self) -> u8 {
        match self {
            Self::Sx1272 => 0x5A,
            Self::Sx1276 => 0x4D,
        }
    }

    /// Offset added to REG_RSSI_VALUE_LORA to get dBm.
    pub fn rssi_offset(self) -> i16 {
        match self {
            Self::Sx1272 => -139,
            Self::Sx1276 => -157,
        }
    }

    /// The RX chain needs image calibration after power-up.
    pub fn has_image_calibration(self) -> bool {
        self == Self::Sx1276
    }

    /// Bits ORed into every REG_PA_CONFIG value (SX1276 MaxPower).
    pub fn pa_max_power_bits(self) -> u8 {
        match self {
            Self::Sx1272 => 0x00,
            Self::Sx1276 => PA_MAX_POWER_SX1276,
        }
    }

    /// OutputPower field for `dbm` on the RFO pin.
    pub fn rfo_power_code(self, dbm: u8) -> u8 {
        match self {
            Self::Sx1272 => dbm + 1,
            Self::Sx1276 => dbm,
        }
    }
}
