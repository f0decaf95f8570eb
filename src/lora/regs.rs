//! SX1272/76 register map and bit constants.
//!
//! Several addresses are shared between the LoRa and FSK register banks; only
//! the LoRa meaning is named here except where the driver needs the FSK view
//! (node address registers, temperature, image calibration).

pub const REG_FIFO: u8 = 0x00;
pub const REG_OP_MODE: u8 = 0x01;
pub const REG_FRF_MSB: u8 = 0x06;
pub const REG_FRF_MID: u8 = 0x07;
pub const REG_FRF_LSB: u8 = 0x08;
pub const REG_PA_CONFIG: u8 = 0x09;
pub const REG_PA_RAMP: u8 = 0x0A;
pub const REG_OCP: u8 = 0x0B;
pub const REG_LNA: u8 = 0x0C;
pub const REG_FIFO_ADDR_PTR: u8 = 0x0D;
pub const REG_FIFO_TX_BASE_ADDR: u8 = 0x0E;
pub const REG_FIFO_RX_BASE_ADDR: u8 = 0x0F;
pub const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;
pub const REG_IRQ_FLAGS: u8 = 0x12;
pub const REG_RX_NB_BYTES: u8 = 0x13;
pub const REG_PKT_SNR_VALUE: u8 = 0x19;
pub const REG_PKT_RSSI_VALUE: u8 = 0x1A;
pub const REG_RSSI_VALUE_LORA: u8 = 0x1B;
pub const REG_HOP_CHANNEL: u8 = 0x1C;
pub const REG_MODEM_CONFIG1: u8 = 0x1D;
pub const REG_MODEM_CONFIG2: u8 = 0x1E;
pub const REG_SYMB_TIMEOUT_LSB: u8 = 0x1F;
pub const REG_PREAMBLE_MSB_LORA: u8 = 0x20;
pub const REG_PREAMBLE_LSB_LORA: u8 = 0x21;
pub const REG_PAYLOAD_LENGTH_LORA: u8 = 0x22;
pub const REG_FIFO_RX_BYTE_ADDR: u8 = 0x25;
pub const REG_MODEM_CONFIG3: u8 = 0x26;
pub const REG_DETECT_OPTIMIZE: u8 = 0x31;
pub const REG_NODE_ADRS: u8 = 0x33;
pub const REG_BROADCAST_ADRS: u8 = 0x34;
pub const REG_DETECTION_THRESHOLD: u8 = 0x37;
pub const REG_SYNC_WORD: u8 = 0x39;
pub const REG_IMAGE_CAL: u8 = 0x3B;
pub const REG_TEMP: u8 = 0x3C;
pub const REG_VERSION: u8 = 0x42;

// Operating modes (REG_OP_MODE values).
pub const FSK_SLEEP_MODE: u8 = 0x00;
pub const FSK_STANDBY_MODE: u8 = 0x01;
pub const LORA_SLEEP_MODE: u8 = 0x80;
pub const LORA_STANDBY_MODE: u8 = 0x81;
pub const LORA_TX_MODE: u8 = 0x83;
pub const LORA_RX_MODE: u8 = 0x85;
pub const LORA_CAD_MODE: u8 = 0x87;
/// LoRa standby with the FSK register bank mapped in (node address, temperature).
pub const LORA_STANDBY_FSK_REGS_MODE: u8 = 0xC1;

// REG_IRQ_FLAGS bits.
pub const IRQ_RX_DONE: u8 = 0x40;
pub const IRQ_PAYLOAD_CRC_ERROR: u8 = 0x20;
pub const IRQ_VALID_HEADER: u8 = 0x10;
pub const IRQ_TX_DONE: u8 = 0x08;
pub const IRQ_CAD_DONE: u8 = 0x04;
pub const IRQ_CAD_DETECTED: u8 = 0x01;
pub const IRQ_ALL: u8 = 0xFF;

/// REG_HOP_CHANNEL bit 6: the received header announced a payload CRC.
pub const HOP_CHANNEL_CRC_ON_PAYLOAD: u8 = 0x40;

pub const IMAGE_CAL_MASK: u8 = 0xBF;
pub const IMAGE_CAL_START: u8 = 0x40;
pub const IMAGE_CAL_RUNNING: u8 = 0x20;

pub const LNA_MAX_GAIN: u8 = 0x23;
pub const PA_RAMP_LOW_PN_TX_PLL_OFF: u8 = 0x08;
pub const PA_BOOST: u8 = 0x80;
/// SX1276 MaxPower = 7, Pmax = 15 dBm.
pub const PA_MAX_POWER_SX1276: u8 = 0x70;
pub const PA_DAC_HIGH_POWER: u8 = 0x87;
pub const PA_DAC_DEFAULT: u8 = 0x84;
pub const OCP_ON: u8 = 0x20;
pub const OCP_TRIM_MAX: u8 = 0x1B;

pub const DETECT_OPTIMIZE_SF6: u8 = 0x05;
pub const DETECTION_THRESHOLD_SF6: u8 = 0x0C;
pub const DETECT_OPTIMIZE_SF7_12: u8 = 0x03;
pub const DETECTION_THRESHOLD_SF7_12: u8 = 0x0A;

/// FIFO offset where outbound frames (data and ACK) are assembled.
pub const FIFO_TX_BASE: u8 = 0x80;
pub const FIFO_RX_BASE: u8 = 0x00;

pub const VERSION_SX1272: u8 = 0x22;
pub const VERSION_SX1276: u8 = 0x12;
