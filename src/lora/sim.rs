//! Simulated SX127x transceivers sharing one radio channel.
//!
//! Each [`SimRadio`] is a register file that implements [`RegisterBus`], so
//! the real driver runs against it unchanged. Radios created from the same
//! [`SimAir`] hear each other:
//!
//! - TX mode takes `REG_PAYLOAD_LENGTH_LORA` bytes from the TX base of the
//!   FIFO, queues them at every other radio, raises TxDone and drops back to
//!   standby.
//! - A queued frame is delivered the next time the radio is read while in RX
//!   mode and no previous RxDone is pending. Frames sent on another channel
//!   or with another sync word are dropped at delivery.
//! - CAD completes at once and reports the configured channel activity.
//! - IRQ flags are write-1-to-clear.
//!
//! Registers can be stuck at a value to provoke verification failures, and a
//! radio can be disconnected to provoke bus errors.
//!
//! # Example
//!
//! ```
//! use quark_gw::lora::{RegisterBus, SimAir, SimFrame};
//!
//! let air = SimAir::new();
//! let mut radio = air.sx1276();
//! assert_eq!(radio.read_register(0x42).unwrap(), 0x12);
//! radio.inject(SimFrame::new(vec![1, 0x10, 2, 0, b'x']));
//! assert_eq!(radio.pending_frames(), 1);
//! ```

use super::board::Board;
use super::regs::*;
use super::transport::{BusError, RegisterBus};
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const REGISTER_COUNT: usize = 0x80;
const FIFO_SIZE: usize = 256;

/// A frame in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFrame {
    pub bytes: Vec<u8>,
    /// FRF of the sender, `None` to match any channel.
    pub channel: Option<u32>,
    /// Sync word of the sender, `None` to match any.
    pub sync_word: Option<u8>,
    /// The header announced a payload CRC.
    pub crc_on: bool,
    /// The payload CRC fails at the receiver.
    pub corrupted: bool,
    /// REG_PKT_SNR_VALUE at the receiver.
    pub snr_raw: u8,
    /// REG_PKT_RSSI_VALUE at the receiver.
    pub rssi_raw: u8,
}

impl SimFrame {
    /// A clean frame heard at +10 dB SNR on any channel.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            channel: None,
            sync_word: None,
            crc_on: true,
            corrupted: false,
            snr_raw: 0x28,
            rssi_raw: 0x50,
        }
    }

    pub fn corrupted(mut self) -> Self {
        self.corrupted = true;
        self
    }

    pub fn with_snr_raw(mut self, snr_raw: u8) -> Self {
        self.snr_raw = snr_raw;
        self
    }

    pub fn without_crc(mut self) -> Self {
        self.crc_on = false;
        self
    }
}

struct SimNode {
    version: u8,
    regs: [u8; REGISTER_COUNT],
    fifo: [u8; FIFO_SIZE],
    inbox: VecDeque<SimFrame>,
    stuck: HashMap<u8, u8>,
    channel_activity: bool,
    rssi_raw: u8,
    tx_log: Vec<Vec<u8>>,
    mode_log: Vec<u8>,
    connected: bool,
}

impl SimNode {
    fn new(version: u8) -> Self {
        let mut regs = [0u8; REGISTER_COUNT];
        regs[REG_OP_MODE as usize] = FSK_STANDBY_MODE;
        regs[REG_FRF_MSB as usize] = 0x6C;
        regs[REG_FRF_MID as usize] = 0x80;
        regs[REG_PA_CONFIG as usize] = 0x4F;
        regs[REG_PA_RAMP as usize] = 0x09;
        regs[REG_OCP as usize] = 0x2B;
        regs[REG_LNA as usize] = 0x20;
        regs[REG_FIFO_TX_BASE_ADDR as usize] = FIFO_TX_BASE;
        regs[REG_FIFO_RX_BASE_ADDR as usize] = FIFO_RX_BASE;
        regs[REG_PREAMBLE_LSB_LORA as usize] = 0x08;
        regs[REG_PAYLOAD_LENGTH_LORA as usize] = 0x01;
        regs[REG_SYMB_TIMEOUT_LSB as usize] = 0x64;
        regs[REG_DETECT_OPTIMIZE as usize] = 0xC3;
        regs[REG_DETECTION_THRESHOLD as usize] = 0x0A;
        regs[REG_SYNC_WORD as usize] = 0x12;
        regs[REG_IMAGE_CAL as usize] = 0x82;
        regs[REG_TEMP as usize] = 0x19;
        regs[REG_VERSION as usize] = version;
        match Board::detect(version) {
            Some(Board::Sx1272) => {
                regs[REG_MODEM_CONFIG1 as usize] = 0x08;
                regs[REG_MODEM_CONFIG2 as usize] = 0x70;
            }
            _ => {
                regs[REG_MODEM_CONFIG1 as usize] = 0x72;
                regs[REG_MODEM_CONFIG2 as usize] = 0x70;
            }
        }
        if let Some(board) = Board::detect(version) {
            regs[board.pa_dac_register() as usize] = PA_DAC_DEFAULT;
        }
        Self {
            version,
            regs,
            fifo: [0; FIFO_SIZE],
            inbox: VecDeque::new(),
            stuck: HashMap::new(),
            channel_activity: false,
            rssi_raw: 0x28,
            tx_log: Vec::new(),
            mode_log: Vec::new(),
            connected: true,
        }
    }

    fn reg(&self, address: u8) -> u8 {
        self.regs[(address & 0x7F) as usize]
    }

    fn set_reg(&mut self, address: u8, value: u8) {
        self.regs[(address & 0x7F) as usize] = value;
    }

    fn channel(&self) -> u32 {
        (self.reg(REG_FRF_MSB) as u32) << 16
            | (self.reg(REG_FRF_MID) as u32) << 8
            | self.reg(REG_FRF_LSB) as u32
    }

    fn crc_enabled(&self) -> bool {
        match Board::detect(self.version) {
            Some(board) => {
                let bit = board.crc_bit();
                bit.is_set(self.reg(bit.register))
            }
            None => true,
        }
    }

    /// Deliver the next queued frame if the radio is listening.
    fn poll_air(&mut self) {
        if self.reg(REG_OP_MODE) != LORA_RX_MODE || self.reg(REG_IRQ_FLAGS) & IRQ_RX_DONE != 0 {
            return;
        }
        while let Some(frame) = self.inbox.pop_front() {
            let channel_ok = frame.channel.map_or(true, |ch| ch == self.channel());
            let sync_ok = frame
                .sync_word
                .map_or(true, |sw| sw == self.reg(REG_SYNC_WORD));
            if !channel_ok || !sync_ok {
                trace!("sim: dropping frame on another channel or network");
                continue;
            }
            let base = self.reg(REG_FIFO_RX_BASE_ADDR);
            let len = frame.bytes.len().min(FIFO_SIZE);
            for (i, b) in frame.bytes.iter().take(len).enumerate() {
                self.fifo[(base as usize + i) % FIFO_SIZE] = *b;
            }
            self.set_reg(REG_RX_NB_BYTES, len as u8);
            self.set_reg(REG_FIFO_RX_CURRENT_ADDR, base);
            self.set_reg(REG_FIFO_RX_BYTE_ADDR, base.wrapping_add(len as u8));
            self.set_reg(REG_PKT_SNR_VALUE, frame.snr_raw);
            self.set_reg(REG_PKT_RSSI_VALUE, frame.rssi_raw);
            let hop = if frame.crc_on {
                HOP_CHANNEL_CRC_ON_PAYLOAD
            } else {
                0
            };
            self.set_reg(REG_HOP_CHANNEL, hop);
            let mut irq = self.reg(REG_IRQ_FLAGS) | IRQ_VALID_HEADER | IRQ_RX_DONE;
            if frame.corrupted {
                irq |= IRQ_PAYLOAD_CRC_ERROR;
            }
            self.set_reg(REG_IRQ_FLAGS, irq);
            trace!("sim: delivered {} byte frame", len);
            return;
        }
    }

    fn read(&mut self, address: u8) -> u8 {
        self.poll_air();
        let address = address & 0x7F;
        if let Some(value) = self.stuck.get(&address) {
            return *value;
        }
        match address {
            REG_FIFO => {
                let ptr = self.reg(REG_FIFO_ADDR_PTR);
                self.set_reg(REG_FIFO_ADDR_PTR, ptr.wrapping_add(1));
                self.fifo[ptr as usize]
            }
            REG_RSSI_VALUE_LORA => self.rssi_raw,
            _ => self.reg(address),
        }
    }

    /// Returns a frame to put on the air, if this write started a TX.
    fn write(&mut self, address: u8, value: u8) -> Option<SimFrame> {
        let address = address & 0x7F;
        if self.stuck.contains_key(&address) {
            return None;
        }
        match address {
            REG_FIFO => {
                let ptr = self.reg(REG_FIFO_ADDR_PTR);
                self.fifo[ptr as usize] = value;
                self.set_reg(REG_FIFO_ADDR_PTR, ptr.wrapping_add(1));
            }
            REG_IRQ_FLAGS => {
                let flags = self.reg(REG_IRQ_FLAGS) & !value;
                self.set_reg(REG_IRQ_FLAGS, flags);
            }
            REG_VERSION => {}
            REG_IMAGE_CAL => self.set_reg(REG_IMAGE_CAL, value & !IMAGE_CAL_RUNNING),
            REG_OP_MODE => return self.set_mode(value),
            _ => self.set_reg(address, value),
        }
        None
    }

    fn set_mode(&mut self, mode: u8) -> Option<SimFrame> {
        self.mode_log.push(mode);
        match mode {
            LORA_TX_MODE => {
                let base = self.reg(REG_FIFO_TX_BASE_ADDR) as usize;
                let len = self.reg(REG_PAYLOAD_LENGTH_LORA) as usize;
                let bytes: Vec<u8> = (0..len).map(|i| self.fifo[(base + i) % FIFO_SIZE]).collect();
                self.tx_log.push(bytes.clone());
                let irq = self.reg(REG_IRQ_FLAGS) | IRQ_TX_DONE;
                self.set_reg(REG_IRQ_FLAGS, irq);
                self.set_reg(REG_OP_MODE, LORA_STANDBY_MODE);
                Some(SimFrame {
                    channel: Some(self.channel()),
                    sync_word: Some(self.reg(REG_SYNC_WORD)),
                    crc_on: self.crc_enabled(),
                    ..SimFrame::new(bytes)
                })
            }
            LORA_CAD_MODE => {
                let mut irq = self.reg(REG_IRQ_FLAGS) | IRQ_CAD_DONE;
                if self.channel_activity {
                    irq |= IRQ_CAD_DETECTED;
                }
                self.set_reg(REG_IRQ_FLAGS, irq);
                self.set_reg(REG_OP_MODE, LORA_STANDBY_MODE);
                None
            }
            _ => {
                self.set_reg(REG_OP_MODE, mode);
                None
            }
        }
    }
}

struct AirMember {
    id: usize,
    node: Arc<Mutex<SimNode>>,
}

/// Shared radio channel.
#[derive(Clone, Default)]
pub struct SimAir {
    members: Arc<Mutex<Vec<AirMember>>>,
}

impl SimAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a radio reporting `version` in REG_VERSION.
    pub fn add_radio(&self, version: u8) -> SimRadio {
        let node = Arc::new(Mutex::new(SimNode::new(version)));
        let mut members = lock(&self.members);
        let id = members.len();
        members.push(AirMember {
            id,
            node: Arc::clone(&node),
        });
        SimRadio {
            id,
            node,
            air: self.clone(),
        }
    }

    pub fn sx1276(&self) -> SimRadio {
        self.add_radio(VERSION_SX1276)
    }

    pub fn sx1272(&self) -> SimRadio {
        self.add_radio(VERSION_SX1272)
    }

    fn broadcast(&self, from: usize, frame: SimFrame) {
        let members = lock(&self.members);
        for member in members.iter().filter(|m| m.id != from) {
            lock(&member.node).inbox.push_back(frame.clone());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking test thread must not wedge the other radios
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one simulated transceiver. Clones refer to the same radio.
#[derive(Clone)]
pub struct SimRadio {
    id: usize,
    node: Arc<Mutex<SimNode>>,
    air: SimAir,
}

impl SimRadio {
    fn node(&self) -> MutexGuard<'_, SimNode> {
        lock(&self.node)
    }

    /// Queue a frame as if another node had sent it.
    pub fn inject(&self, frame: SimFrame) {
        self.node().inbox.push_back(frame);
    }

    pub fn pending_frames(&self) -> usize {
        self.node().inbox.len()
    }

    /// Make CAD report (or stop reporting) activity.
    pub fn set_channel_activity(&self, active: bool) {
        self.node().channel_activity = active;
    }

    /// Raw REG_RSSI_VALUE_LORA value.
    pub fn set_rssi_raw(&self, raw: u8) {
        self.node().rssi_raw = raw;
    }

    /// Ignore writes to `address` and read back `value`.
    pub fn stick_register(&self, address: u8, value: u8) {
        self.node().stuck.insert(address & 0x7F, value);
    }

    pub fn unstick_register(&self, address: u8) {
        self.node().stuck.remove(&(address & 0x7F));
    }

    /// Set a register directly, bypassing write side effects.
    pub fn poke(&self, address: u8, value: u8) {
        self.node().set_reg(address, value);
    }

    /// Register value without read side effects.
    pub fn peek(&self, address: u8) -> u8 {
        self.node().reg(address)
    }

    /// Copy of the whole register file.
    pub fn snapshot(&self) -> [u8; REGISTER_COUNT] {
        self.node().regs
    }

    pub fn mode(&self) -> u8 {
        self.peek(REG_OP_MODE)
    }

    /// Every OP_MODE value written so far.
    pub fn mode_log(&self) -> Vec<u8> {
        self.node().mode_log.clone()
    }

    /// Every frame transmitted so far.
    pub fn tx_log(&self) -> Vec<Vec<u8>> {
        self.node().tx_log.clone()
    }

    pub fn disconnect(&self) {
        self.node().connected = false;
    }

    pub fn reconnect(&self) {
        self.node().connected = true;
    }
}

impl RegisterBus for SimRadio {
    fn read_register(&mut self, address: u8) -> Result<u8, BusError> {
        let mut node = self.node();
        if !node.connected {
            return Err(BusError::Disconnected);
        }
        Ok(node.read(address))
    }

    fn write_register(&mut self, address: u8, value: u8) -> Result<(), BusError> {
        let frame = {
            let mut node = self.node();
            if !node.connected {
                return Err(BusError::Disconnected);
            }
            node.write(address, value)
        };
        if let Some(frame) = frame {
            trace!("sim: radio {} transmits {} bytes", self.id, frame.bytes.len());
            self.air.broadcast(self.id, frame);
        }
        Ok(())
    }
}
