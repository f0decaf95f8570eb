//! Modem configuration and signal quality.
//!
//! Every setter validates its argument before touching the chip, then runs
//! in standby (restoring the previous mode afterwards), writes, waits the
//! settle delay and reads the value back. Getters refresh the cached
//! [`RadioSettings`].

use super::board::Board;
use super::clock::Clock;
use super::config::{
    requires_low_data_rate_optimize, Band, Bandwidth, CodingRate, ConfigError, HeaderMode,
    ModePreset, PowerLevel, SpreadingFactor, CH_04_868, DEFAULT_NODE_ADDRESS,
    DEFAULT_PREAMBLE_LENGTH, MAX_CHANNEL,
};
use super::packet::decode_snr;
use super::radio::{RadioError, Sx127x};
use super::regs::*;
use super::transport::RegisterBus;
use log::{debug, info, warn};
use rand_core::RngCore;

/// `set_lora` attempts before giving up.
const MODE_CHANGE_ATTEMPTS: u8 = 8;
/// REG_RSSI_VALUE_LORA samples averaged by `get_rssi`.
const RSSI_SAMPLES: i32 = 5;

/// Modem the chip is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modem {
    LoRa,
    Fsk,
}

/// Cached chip configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioSettings {
    pub modem: Modem,
    pub bandwidth: Bandwidth,
    pub coding_rate: CodingRate,
    pub spreading_factor: SpreadingFactor,
    /// 24-bit FRF register value.
    pub channel: u32,
    /// Raw REG_PA_CONFIG value.
    pub power: u8,
    pub sync_word: u8,
    pub header: HeaderMode,
    pub crc: bool,
    pub preamble_length: u16,
    pub payload_length: u8,
    pub node_address: u8,
    pub max_current_ma: u16,
    /// Uncalibrated die temperature reading.
    pub temperature: i8,
    pub mode: ModePreset,
    pub low_data_rate_optimize: bool,
}

impl Default for RadioSettings {
    /// SX127x power-on values, with the gateway's node address.
    fn default() -> Self {
        Self {
            modem: Modem::LoRa,
            bandwidth: Bandwidth::Bw125,
            coding_rate: CodingRate::Cr4_5,
            spreading_factor: SpreadingFactor::Sf7,
            channel: 0x6C_8000,
            power: 0x4F,
            sync_word: 0x12,
            header: HeaderMode::Explicit,
            crc: false,
            preamble_length: DEFAULT_PREAMBLE_LENGTH,
            payload_length: 1,
            node_address: DEFAULT_NODE_ADDRESS,
            max_current_ma: 100,
            temperature: 0,
            mode: ModePreset::default(),
            low_data_rate_optimize: false,
        }
    }
}

/// Signal quality of the last measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalQuality {
    /// dB, quarter-dB steps truncated.
    pub snr: i8,
    /// REG_PKT_SNR_VALUE as read.
    pub raw_snr: u8,
    /// Channel RSSI in dBm.
    pub rssi: i16,
    /// RSSI of the last packet in dBm.
    pub rssi_packet: i16,
}

/// Current limit for an OCP trim value.
pub fn ocp_current_ma(trim: u8) -> u16 {
    let trim = (trim & 0x1F) as u16;
    if trim <= 15 {
        45 + 5 * trim
    } else if trim <= 27 {
        10 * trim - 30
    } else {
        240
    }
}

/// Packet RSSI from the raw REG_PKT_RSSI_VALUE.
///
/// `offset` already includes the low-frequency port correction.
pub fn packet_rssi(offset: i16, raw: u8, snr: i8) -> i16 {
    let dbm = if snr < 0 {
        offset as f64 + raw as f64 + snr as f64 * 0.25
    } else {
        offset as f64 + raw as f64 * 16.0 / 15.0
    };
    dbm as i16
}

impl<B, C, R> Sx127x<B, C, R>
where
    B: RegisterBus,
    C: Clock,
    R: RngCore,
{
    pub(super) fn ensure_lora(&self) -> Result<(), RadioError> {
        match self.settings.modem {
            Modem::LoRa => Ok(()),
            Modem::Fsk => Err(RadioError::InvalidParameter(ConfigError::Invalid(
                "not available in FSK mode",
            ))),
        }
    }

    // ---- modem and operating mode ----

    /// Switch the chip to the LoRa modem, ending in standby.
    pub fn set_lora(&mut self) -> Result<(), RadioError> {
        for attempt in 1..=MODE_CHANGE_ATTEMPTS {
            self.write(REG_OP_MODE, FSK_SLEEP_MODE)?;
            self.write(REG_OP_MODE, LORA_SLEEP_MODE)?;
            self.write(REG_OP_MODE, LORA_STANDBY_MODE)?;
            self.settle();
            let mode = self.op_mode()?;
            if mode == LORA_STANDBY_MODE {
                self.settings.modem = Modem::LoRa;
                debug!("LoRa mode set after {} attempt(s)", attempt);
                return Ok(());
            }
            debug!("LoRa mode attempt {} read 0x{:02X}", attempt, mode);
        }
        warn!("chip did not enter LoRa mode");
        Err(RadioError::ModeChangeFailed)
    }

    /// Switch the chip to the FSK modem, ending in standby.
    pub fn set_fsk(&mut self) -> Result<(), RadioError> {
        self.write(REG_OP_MODE, LORA_SLEEP_MODE)?;
        self.write(REG_OP_MODE, FSK_SLEEP_MODE)?;
        self.write(REG_OP_MODE, FSK_STANDBY_MODE)?;
        self.settle();
        if self.op_mode()? != FSK_STANDBY_MODE {
            warn!("chip did not enter FSK mode");
            return Err(RadioError::ModeChangeFailed);
        }
        self.settings.modem = Modem::Fsk;
        debug!("FSK mode set");
        Ok(())
    }

    pub fn set_sleep_mode(&mut self) -> Result<(), RadioError> {
        let (standby, sleep) = match self.settings.modem {
            Modem::LoRa => (LORA_STANDBY_MODE, LORA_SLEEP_MODE),
            Modem::Fsk => (FSK_STANDBY_MODE, FSK_SLEEP_MODE),
        };
        self.write(REG_OP_MODE, standby)?;
        self.settle();
        self.write(REG_OP_MODE, sleep)?;
        if self.op_mode()? != sleep {
            return Err(RadioError::ModeChangeFailed);
        }
        debug!("sleep mode set");
        Ok(())
    }

    /// Apply a mode preset: coding rate, spreading factor, bandwidth and
    /// sync word.
    pub fn set_mode(&mut self, preset: ModePreset) -> Result<(), RadioError> {
        self.board()?;
        self.ensure_lora()?;
        self.with_standby(|radio| {
            radio.set_coding_rate(preset.coding_rate())?;
            radio.set_spreading_factor(preset.spreading_factor())?;
            radio.set_bandwidth(preset.bandwidth())?;
            radio.set_sync_word(preset.sync_word())
        })?;
        self.settings.mode = preset;
        info!(
            "mode {} set: SF{} BW {} Hz CR 4/{}",
            preset.index(),
            preset.spreading_factor().value(),
            preset.bandwidth().hz(),
            preset.coding_rate().denominator()
        );
        Ok(())
    }

    /// Tune to the band's default channel and apply `preset`.
    pub fn configure(&mut self, band: Band, preset: ModePreset) -> Result<(), RadioError> {
        self.set_channel(band.default_channel())?;
        self.set_mode(preset)
    }

    // ---- modulation ----

    fn hardware_bandwidth(&mut self, board: Board) -> Result<Bandwidth, RadioError> {
        let config1 = self.read(REG_MODEM_CONFIG1)?;
        board
            .decode_bandwidth(config1)
            .ok_or(RadioError::UnknownRegisterValue {
                register: REG_MODEM_CONFIG1,
                value: config1,
            })
    }

    fn hardware_spreading_factor(&mut self) -> Result<SpreadingFactor, RadioError> {
        let config2 = self.read(REG_MODEM_CONFIG2)?;
        SpreadingFactor::try_from(config2 >> 4).map_err(|_| RadioError::UnknownRegisterValue {
            register: REG_MODEM_CONFIG2,
            value: config2,
        })
    }

    pub fn set_bandwidth(&mut self, bw: Bandwidth) -> Result<(), RadioError> {
        let board = self.board()?;
        if !board.supports_bandwidth(bw) {
            return Err(RadioError::InvalidParameter(ConfigError::OutOfRange {
                field: "bandwidth",
                value: bw.hz(),
            }));
        }
        self.ensure_lora()?;
        self.with_standby(|radio| {
            let config1 = radio.read(REG_MODEM_CONFIG1)?;
            let wrote = board
                .encode_bandwidth(config1, bw)
                .ok_or(RadioError::InvalidParameter(ConfigError::OutOfRange {
                    field: "bandwidth",
                    value: bw.hz(),
                }))?;
            radio.write(REG_MODEM_CONFIG1, wrote)?;

            let sf = radio.hardware_spreading_factor()?;
            let ldro = requires_low_data_rate_optimize(bw, sf);
            radio.update_bit(board.low_data_rate_optimize_bit(), ldro)?;
            radio.settle();

            let read = radio.read(REG_MODEM_CONFIG1)?;
            if board.decode_bandwidth(read) != Some(bw) {
                return Err(RadioError::VerifyFailed {
                    register: REG_MODEM_CONFIG1,
                    wrote,
                    read,
                });
            }
            radio.verify_bit(board.low_data_rate_optimize_bit(), ldro)?;
            radio.settings.bandwidth = bw;
            radio.settings.low_data_rate_optimize = ldro;
            debug!("bandwidth {} Hz set (LDRO {})", bw.hz(), ldro);
            Ok(())
        })
    }

    pub fn get_bandwidth(&mut self) -> Result<Bandwidth, RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let bw = self.hardware_bandwidth(board)?;
        self.settings.bandwidth = bw;
        Ok(bw)
    }

    pub fn set_coding_rate(&mut self, cr: CodingRate) -> Result<(), RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        self.with_standby(|radio| {
            let config1 = radio.read(REG_MODEM_CONFIG1)?;
            let wrote = board.encode_coding_rate(config1, cr);
            radio.write(REG_MODEM_CONFIG1, wrote)?;
            radio.settle();
            let read = radio.read(REG_MODEM_CONFIG1)?;
            if board.decode_coding_rate(read) != Some(cr) {
                return Err(RadioError::VerifyFailed {
                    register: REG_MODEM_CONFIG1,
                    wrote,
                    read,
                });
            }
            radio.settings.coding_rate = cr;
            debug!("coding rate 4/{} set", cr.denominator());
            Ok(())
        })
    }

    pub fn get_coding_rate(&mut self) -> Result<CodingRate, RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let config1 = self.read(REG_MODEM_CONFIG1)?;
        let cr = board
            .decode_coding_rate(config1)
            .ok_or(RadioError::UnknownRegisterValue {
                register: REG_MODEM_CONFIG1,
                value: config1,
            })?;
        self.settings.coding_rate = cr;
        Ok(cr)
    }

    /// SF6 switches to implicit header, every other SF to explicit header.
    /// AGC auto is always turned on and the low-data-rate bit follows the
    /// current bandwidth.
    pub fn set_spreading_factor(&mut self, sf: SpreadingFactor) -> Result<(), RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        self.with_standby(|radio| {
            let config2 = radio.read(REG_MODEM_CONFIG2)?;
            let wrote = (config2 & 0x0F) | (sf.value() << 4);
            radio.write(REG_MODEM_CONFIG2, wrote)?;

            let implicit = sf == SpreadingFactor::Sf6;
            let (optimize, threshold) = if implicit {
                (DETECT_OPTIMIZE_SF6, DETECTION_THRESHOLD_SF6)
            } else {
                (DETECT_OPTIMIZE_SF7_12, DETECTION_THRESHOLD_SF7_12)
            };
            radio.update_bit(board.implicit_header_bit(), implicit)?;
            let detect = radio.read(REG_DETECT_OPTIMIZE)?;
            radio.write(REG_DETECT_OPTIMIZE, (detect & 0xF8) | optimize)?;
            radio.write(REG_DETECTION_THRESHOLD, threshold)?;
            radio.update_bit(board.agc_auto_bit(), true)?;

            let bw = radio.hardware_bandwidth(board)?;
            let ldro = requires_low_data_rate_optimize(bw, sf);
            radio.update_bit(board.low_data_rate_optimize_bit(), ldro)?;
            radio.settle();

            let read = radio.read(REG_MODEM_CONFIG2)?;
            if read >> 4 != sf.value() {
                return Err(RadioError::VerifyFailed {
                    register: REG_MODEM_CONFIG2,
                    wrote,
                    read,
                });
            }
            radio.verify_bit(board.implicit_header_bit(), implicit)?;
            let detect = radio.read(REG_DETECT_OPTIMIZE)?;
            if detect & 0x07 != optimize {
                return Err(RadioError::VerifyFailed {
                    register: REG_DETECT_OPTIMIZE,
                    wrote: (detect & 0xF8) | optimize,
                    read: detect,
                });
            }
            radio.expect_register(REG_DETECTION_THRESHOLD, threshold)?;
            radio.verify_bit(board.agc_auto_bit(), true)?;
            radio.verify_bit(board.low_data_rate_optimize_bit(), ldro)?;

            radio.settings.spreading_factor = sf;
            radio.settings.header = if implicit {
                HeaderMode::Implicit
            } else {
                HeaderMode::Explicit
            };
            radio.settings.low_data_rate_optimize = ldro;
            debug!("SF{} set (LDRO {})", sf.value(), ldro);
            Ok(())
        })
    }

    pub fn get_spreading_factor(&mut self) -> Result<SpreadingFactor, RadioError> {
        self.ensure_lora()?;
        let sf = self.hardware_spreading_factor()?;
        self.settings.spreading_factor = sf;
        Ok(sf)
    }

    pub fn set_header(&mut self, header: HeaderMode) -> Result<(), RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let implicit = header == HeaderMode::Implicit;
        if !implicit && self.hardware_spreading_factor()? == SpreadingFactor::Sf6 {
            return Err(RadioError::InvalidParameter(ConfigError::Invalid(
                "SF6 requires implicit header",
            )));
        }
        self.with_standby(|radio| {
            radio.update_bit(board.implicit_header_bit(), implicit)?;
            radio.settle();
            radio.verify_bit(board.implicit_header_bit(), implicit)?;
            radio.settings.header = header;
            debug!("{:?} header set", header);
            Ok(())
        })
    }

    pub fn get_header(&mut self) -> Result<HeaderMode, RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let bit = board.implicit_header_bit();
        let value = self.read(bit.register)?;
        let header = if bit.is_set(value) {
            HeaderMode::Implicit
        } else {
            HeaderMode::Explicit
        };
        self.settings.header = header;
        Ok(header)
    }

    pub fn set_crc(&mut self, on: bool) -> Result<(), RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        self.with_standby(|radio| {
            radio.update_bit(board.crc_bit(), on)?;
            radio.settle();
            radio.verify_bit(board.crc_bit(), on)?;
            radio.settings.crc = on;
            debug!("CRC {}", if on { "on" } else { "off" });
            Ok(())
        })
    }

    pub fn get_crc(&mut self) -> Result<bool, RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let bit = board.crc_bit();
        let value = self.read(bit.register)?;
        self.settings.crc = bit.is_set(value);
        Ok(self.settings.crc)
    }

    // ---- frequency and framing ----

    /// Program the 24-bit FRF value (one of the `CH_*` constants, or any
    /// other non-zero register value).
    pub fn set_channel(&mut self, channel: u32) -> Result<(), RadioError> {
        if channel == 0 || channel > MAX_CHANNEL {
            return Err(RadioError::InvalidParameter(ConfigError::OutOfRange {
                field: "channel",
                value: channel,
            }));
        }
        self.with_standby(|radio| {
            let bytes = [(channel >> 16) as u8, (channel >> 8) as u8, channel as u8];
            radio.write(REG_FRF_MSB, bytes[0])?;
            radio.write(REG_FRF_MID, bytes[1])?;
            radio.write(REG_FRF_LSB, bytes[2])?;
            radio.settle();
            radio.expect_register(REG_FRF_MSB, bytes[0])?;
            radio.expect_register(REG_FRF_MID, bytes[1])?;
            radio.expect_register(REG_FRF_LSB, bytes[2])?;
            radio.settings.channel = channel;
            debug!("channel 0x{:06X} set", channel);
            Ok(())
        })
    }

    pub fn get_channel(&mut self) -> Result<u32, RadioError> {
        let msb = self.read(REG_FRF_MSB)? as u32;
        let mid = self.read(REG_FRF_MID)? as u32;
        let lsb = self.read(REG_FRF_LSB)? as u32;
        self.settings.channel = (msb << 16) | (mid << 8) | lsb;
        Ok(self.settings.channel)
    }

    pub fn set_sync_word(&mut self, sync_word: u8) -> Result<(), RadioError> {
        self.ensure_lora()?;
        self.with_standby(|radio| {
            radio.write(REG_SYNC_WORD, sync_word)?;
            radio.settle();
            radio.expect_register(REG_SYNC_WORD, sync_word)?;
            radio.settings.sync_word = sync_word;
            debug!("sync word 0x{:02X} set", sync_word);
            Ok(())
        })
    }

    pub fn get_sync_word(&mut self) -> Result<u8, RadioError> {
        self.ensure_lora()?;
        self.settings.sync_word = self.read(REG_SYNC_WORD)?;
        Ok(self.settings.sync_word)
    }

    pub fn set_preamble_length(&mut self, length: u16) -> Result<(), RadioError> {
        self.ensure_lora()?;
        self.with_standby(|radio| {
            let [msb, lsb] = length.to_be_bytes();
            radio.write(REG_PREAMBLE_MSB_LORA, msb)?;
            radio.write(REG_PREAMBLE_LSB_LORA, lsb)?;
            radio.settle();
            radio.expect_register(REG_PREAMBLE_MSB_LORA, msb)?;
            radio.expect_register(REG_PREAMBLE_LSB_LORA, lsb)?;
            radio.settings.preamble_length = length;
            debug!("preamble length {} set", length);
            Ok(())
        })
    }

    pub fn get_preamble_length(&mut self) -> Result<u16, RadioError> {
        self.ensure_lora()?;
        let msb = self.read(REG_PREAMBLE_MSB_LORA)?;
        let lsb = self.read(REG_PREAMBLE_LSB_LORA)?;
        self.settings.preamble_length = u16::from_be_bytes([msb, lsb]);
        Ok(self.settings.preamble_length)
    }

    /// Frame length the modem sends, or accepts at most while receiving.
    pub fn set_packet_length(&mut self, length: u8) -> Result<(), RadioError> {
        self.ensure_lora()?;
        self.with_standby(|radio| {
            radio.write(REG_PAYLOAD_LENGTH_LORA, length)?;
            radio.settle();
            radio.expect_register(REG_PAYLOAD_LENGTH_LORA, length)?;
            radio.settings.payload_length = length;
            Ok(())
        })
    }

    pub fn get_payload_length(&mut self) -> Result<u8, RadioError> {
        self.ensure_lora()?;
        self.settings.payload_length = self.read(REG_PAYLOAD_LENGTH_LORA)?;
        Ok(self.settings.payload_length)
    }

    /// Program the node address register (broadcast register set to 0) and
    /// use `address` for receive filtering.
    pub fn set_node_address(&mut self, address: u8) -> Result<(), RadioError> {
        if address == 0 {
            return Err(RadioError::InvalidParameter(ConfigError::Invalid(
                "node address 0 is the broadcast address",
            )));
        }
        self.with_fsk_registers(|radio| {
            radio.write(REG_NODE_ADRS, address)?;
            radio.write(REG_BROADCAST_ADRS, 0x00)?;
            radio.settle();
            radio.expect_register(REG_NODE_ADRS, address)?;
            radio.expect_register(REG_BROADCAST_ADRS, 0x00)
        })?;
        self.settings.node_address = address;
        info!("node address {} set", address);
        Ok(())
    }

    pub fn get_node_address(&mut self) -> Result<u8, RadioError> {
        let address = self.with_fsk_registers(|radio| radio.read(REG_NODE_ADRS))?;
        self.settings.node_address = address;
        Ok(address)
    }

    // ---- output power ----

    fn write_ocp(&mut self, trim: u8) -> Result<(), RadioError> {
        self.with_standby(|radio| {
            let wrote = trim | OCP_ON;
            radio.write(REG_OCP, wrote)?;
            radio.settle();
            radio.expect_register(REG_OCP, wrote)?;
            radio.settings.max_current_ma = ocp_current_ma(trim);
            Ok(())
        })
    }

    fn write_pa_config(&mut self, value: u8) -> Result<(), RadioError> {
        self.write(REG_PA_CONFIG, value)?;
        self.settle();
        self.expect_register(REG_PA_CONFIG, value)?;
        self.settings.power = value;
        Ok(())
    }

    /// Set one of the named output power levels.
    pub fn set_power(&mut self, level: PowerLevel) -> Result<(), RadioError> {
        let board = self.board()?;
        let (pa, dac, trim) = match level {
            PowerLevel::Low => (0x03, Some(PA_DAC_DEFAULT), 0x0B),
            PowerLevel::High => (0x07, Some(PA_DAC_DEFAULT), 0x0B),
            PowerLevel::Max => (0x0F, Some(PA_DAC_DEFAULT), 0x0B),
            PowerLevel::Boost => (0x0C | PA_BOOST, None, 0x10),
            PowerLevel::Max20dBm => (0x0F | PA_BOOST, Some(PA_DAC_HIGH_POWER), 0x12),
        };
        let value = pa | board.pa_max_power_bits();
        self.with_standby(|radio| {
            if let Some(dac) = dac {
                radio.write(board.pa_dac_register(), dac)?;
            }
            radio.write_ocp(trim)?;
            radio.write_pa_config(value)
        })?;
        debug!("power '{}' set (PA_CONFIG 0x{:02X})", level.letter(), value);
        Ok(())
    }

    /// Set the output power in dBm: 20, or 0..=14 (2..=14 on PA_BOOST).
    pub fn set_power_dbm(&mut self, dbm: u8) -> Result<(), RadioError> {
        if dbm == 20 {
            return self.set_power(PowerLevel::Max20dBm);
        }
        let board = self.board()?;
        if dbm > 14 || (self.pa_boost && dbm < 2) {
            return Err(RadioError::InvalidParameter(ConfigError::OutOfRange {
                field: "power dBm",
                value: dbm as u32,
            }));
        }
        let code = if self.pa_boost {
            (dbm - 2) | PA_BOOST
        } else {
            board.rfo_power_code(dbm)
        };
        let value = code | board.pa_max_power_bits();
        let trim = if dbm > 10 { 0x10 } else { 0x0B };
        self.with_standby(|radio| {
            radio.write(board.pa_dac_register(), PA_DAC_DEFAULT)?;
            radio.write_ocp(trim)?;
            radio.write_pa_config(value)
        })?;
        debug!("power {} dBm set (PA_CONFIG 0x{:02X})", dbm, value);
        Ok(())
    }

    /// Raw REG_PA_CONFIG value.
    pub fn get_power(&mut self) -> Result<u8, RadioError> {
        self.settings.power = self.read(REG_PA_CONFIG)?;
        Ok(self.settings.power)
    }

    /// Set the over-current protection trim (0..=0x1B).
    pub fn set_max_current(&mut self, trim: u8) -> Result<(), RadioError> {
        if trim > OCP_TRIM_MAX {
            return Err(RadioError::InvalidParameter(ConfigError::OutOfRange {
                field: "OCP trim",
                value: trim as u32,
            }));
        }
        self.write_ocp(trim)?;
        debug!("max current {} mA set", self.settings.max_current_ma);
        Ok(())
    }

    /// Current limit in mA.
    pub fn get_max_current(&mut self) -> Result<u16, RadioError> {
        let ocp = self.read(REG_OCP)?;
        self.settings.max_current_ma = ocp_current_ma(ocp);
        Ok(self.settings.max_current_ma)
    }

    // ---- diagnostics ----

    pub fn get_temperature(&mut self) -> Result<i8, RadioError> {
        let raw = self.with_fsk_registers(|radio| radio.read(REG_TEMP))?;
        self.settings.temperature = raw as i8;
        Ok(self.settings.temperature)
    }

    /// Refresh every cached setting from the chip.
    pub fn get_regs(&mut self) -> Result<RadioSettings, RadioError> {
        let mode = self.op_mode()?;
        self.settings.modem = if mode & 0x80 != 0 {
            Modem::LoRa
        } else {
            Modem::Fsk
        };
        self.get_power()?;
        self.get_channel()?;
        if self.settings.modem == Modem::LoRa {
            self.get_bandwidth()?;
            self.get_coding_rate()?;
            self.get_spreading_factor()?;
            self.get_crc()?;
            self.get_header()?;
            self.get_sync_word()?;
            self.get_preamble_length()?;
            self.get_payload_length()?;
        }
        self.get_node_address()?;
        self.get_max_current()?;
        self.get_temperature()?;
        debug!("registers refreshed: {:?}", self.settings);
        Ok(self.settings)
    }

    // ---- signal quality ----

    /// SNR of the last packet in dB.
    pub fn get_snr(&mut self) -> Result<i8, RadioError> {
        self.ensure_lora()?;
        let raw = self.read(REG_PKT_SNR_VALUE)?;
        self.signal.raw_snr = raw;
        self.signal.snr = decode_snr(raw);
        Ok(self.signal.snr)
    }

    /// Channel RSSI in dBm, averaged over five samples.
    pub fn get_rssi(&mut self) -> Result<i16, RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let mut sum = 0i32;
        for _ in 0..RSSI_SAMPLES {
            sum += self.read(REG_RSSI_VALUE_LORA)? as i32;
        }
        let rssi = board.rssi_offset() + (sum / RSSI_SAMPLES) as i16;
        self.signal.rssi = rssi;
        Ok(rssi)
    }

    /// RSSI of the last packet in dBm. Uses the SNR from the last
    /// [`get_snr`](Self::get_snr).
    pub fn get_rssi_packet(&mut self) -> Result<i16, RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let mut offset = board.rssi_offset();
        if self.settings.channel < CH_04_868 {
            offset -= 7;
        }
        let raw = self.read(REG_PKT_RSSI_VALUE)?;
        let rssi = packet_rssi(offset, raw, self.signal.snr);
        self.signal.rssi_packet = rssi;
        Ok(rssi)
    }
}
