//! LoRa time-on-air calculation.
//!
//! Calculates the transmission duration of a frame from payload size and
//! modulation parameters, using the standard Semtech formula (SX1272/76
//! datasheet, section 4.1.1.7). The payload CRC is always counted and the
//! programmed preamble length gets the 4 extra symbols the modem adds.
//!
//! # Example
//!
//! ```
//! use quark_gw::lora::{airtime_ms, airtime_us, LoRaParams};
//!
//! let params = LoRaParams::default();
//! let us = airtime_us(20, &params);
//! assert_eq!(us, 1_449_984);
//! assert_eq!(airtime_ms(20, &params), 1450);
//! ```

use super::config::{
    requires_low_data_rate_optimize, Bandwidth, CodingRate, HeaderMode, SpreadingFactor,
    DEFAULT_PREAMBLE_LENGTH,
};

/// LoRa modulation parameters for airtime calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoRaParams {
    pub spreading_factor: SpreadingFactor,
    pub bandwidth: Bandwidth,
    pub coding_rate: CodingRate,
    /// Programmed preamble length (REG_PREAMBLE_*), not including the 4
    /// symbols the modem appends.
    pub preamble_symbols: u16,
    pub header: HeaderMode,
    pub low_data_rate_optimize: bool,
}

impl Default for LoRaParams {
    /// Gateway defaults: BW 125 kHz, SF12, CR 4/5, explicit header.
    fn default() -> Self {
        Self::new(
            SpreadingFactor::Sf12,
            Bandwidth::Bw125,
            CodingRate::Cr4_5,
            DEFAULT_PREAMBLE_LENGTH,
            HeaderMode::Explicit,
        )
    }
}

impl LoRaParams {
    /// Build parameters with the low-data-rate flag derived from BW/SF.
    pub fn new(
        spreading_factor: SpreadingFactor,
        bandwidth: Bandwidth,
        coding_rate: CodingRate,
        preamble_symbols: u16,
        header: HeaderMode,
    ) -> Self {
        Self {
            spreading_factor,
            bandwidth,
            coding_rate,
            preamble_symbols,
            header,
            low_data_rate_optimize: requires_low_data_rate_optimize(bandwidth, spreading_factor),
        }
    }

    /// Symbol duration in whole microseconds (truncated).
    pub fn symbol_duration_us(&self) -> u64 {
        (1u64 << self.spreading_factor.value()) * 1_000_000 / self.bandwidth.hz() as u64
    }
}

/// Calculate frame airtime in microseconds, rounded up.
///
/// `payload_len` is the number of bytes handed to the modem, link header
/// included.
pub fn airtime_us(payload_len: usize, params: &LoRaParams) -> u64 {
    let sf = params.spreading_factor.value() as i64;
    let de = i64::from(params.low_data_rate_optimize);
    let h = match params.header {
        HeaderMode::Explicit => 0,
        HeaderMode::Implicit => 1,
    };

    // 8*PL - 4*SF + 28 + 16*CRC - 20*H, CRC always on
    let numerator = 8 * payload_len as i64 - 4 * sf + 28 + 16 - 20 * h;
    let denominator = 4 * (sf - 2 * de);
    let blocks = if numerator > 0 {
        (numerator + denominator - 1) / denominator
    } else {
        0
    };
    let n_payload = 8 + blocks as u64 * params.coding_rate.denominator() as u64;

    // In quarter symbols: programmed preamble + 4, plus 4.25, plus payload.
    let quarters = 4 * (params.preamble_symbols as u64 + 4) + 17 + 4 * n_payload;

    // T = quarters / 4 * 2^SF / BW seconds, rounded up to whole microseconds
    let num = quarters * (1u64 << sf) * 1_000_000;
    let den = 4 * params.bandwidth.hz() as u64;
    num.div_ceil(den)
}

/// Airtime in milliseconds as charged against the duty-cycle budget.
///
/// Always at least one millisecond more than the truncated value.
pub fn airtime_ms(payload_len: usize, params: &LoRaParams) -> u32 {
    (airtime_us(payload_len, params) / 1000 + 1) as u32
}
