//! SX1272/76 LoRa transceiver driver.
//!
//! [`Sx127x`] owns the register bus and every piece of link state: the
//! cached radio settings, the outbound and inbound packets, the duty-cycle
//! budget and the carrier-sense configuration. It drives the chip through
//! Sleep, Standby, Receive, Transmit and CAD, always leaving it in a known
//! mode with interrupt flags cleared.
//!
//! Every wait is a [`poll_until`] on a register flag against the injected
//! [`Clock`].
//!
//! Configuration setters live in `settings.rs`, channel activity detection
//! in `cad.rs`.

use super::airtime::{airtime_ms, LoRaParams};
use super::board::{Board, RegBit};
use super::clock::{poll_until, Clock, PollOutcome};
use super::config::{ConfigError, DEFAULT_ACK_TURNAROUND_MS, DEFAULT_SETTLE_MS};
use super::csma::{CarrierSenseConfig, CsmaError};
use super::duty_cycle::ToaBudget;
use super::packet::{
    AckFrame, AckMismatch, FrameError, FrameLayout, Packet, PacketType, ReceptionStatus,
    ACK_LENGTH, BROADCAST_0, MAX_PAYLOAD, MAX_TIMEOUT, MAX_WAIT, PKT_FLAG_ACK_REQ,
};
use super::regs::*;
use super::settings::{Modem, RadioSettings, SignalQuality};
use super::transport::{BusError, RegisterBus};
use log::{debug, info, warn};
use rand_core::{OsRng, RngCore};
use std::fmt;

/// Upper bound for one image calibration run (ms).
const IMAGE_CAL_TIMEOUT_MS: u64 = 100;

/// Symbol timeout LSB used while listening.
const SYMB_TIMEOUT_SF10_12: u8 = 0x05;
const SYMB_TIMEOUT_SF6_9: u8 = 0x08;

/// LoRa transceiver driver.
///
/// Generic over the register transport, the clock and the RNG used for
/// carrier-sense backoff.
pub struct Sx127x<B, C, R = OsRng> {
    pub(super) bus: B,
    pub(super) clock: C,
    pub(super) rng: R,
    pub(super) board: Option<Board>,
    pub(super) settings: RadioSettings,
    pub(super) signal: SignalQuality,
    pub(super) carrier_sense: CarrierSenseConfig,
    pub(super) pa_boost: bool,
    pub(super) settle_ms: u32,
    budget: ToaBudget,
    layout: FrameLayout,
    ack_turnaround_ms: u32,
    packet_number: u8,
    retries: u8,
    request_ack: bool,
    next_type: Option<PacketType>,
    packet_sent: Packet,
    packet_received: Packet,
    ack_requested: bool,
    last_ack: Option<AckFrame>,
    reception: ReceptionStatus,
    current_toa_ms: u32,
    initialized: bool,
}

impl<B: RegisterBus, C: Clock> Sx127x<B, C, OsRng> {
    /// Create a driver seeded from the operating system RNG.
    ///
    /// Nothing is sent to the chip until [`init`](Self::init).
    pub fn new(bus: B, clock: C) -> Self {
        Self::with_rng(bus, clock, OsRng)
    }
}

impl<B, C, R> Sx127x<B, C, R>
where
    B: RegisterBus,
    C: Clock,
    R: RngCore,
{
    pub fn with_rng(bus: B, clock: C, rng: R) -> Self {
        Self {
            bus,
            clock,
            rng,
            board: None,
            settings: RadioSettings::default(),
            signal: SignalQuality::default(),
            carrier_sense: CarrierSenseConfig::default(),
            pa_boost: true,
            settle_ms: DEFAULT_SETTLE_MS,
            budget: ToaBudget::hourly(),
            layout: FrameLayout::default(),
            ack_turnaround_ms: DEFAULT_ACK_TURNAROUND_MS,
            packet_number: 0,
            retries: 0,
            request_ack: false,
            next_type: None,
            packet_sent: Packet::default(),
            packet_received: Packet::default(),
            ack_requested: false,
            last_ack: None,
            reception: ReceptionStatus::Correct,
            current_toa_ms: 0,
            initialized: false,
        }
    }

    /// Detect the chip and bring it up in LoRa mode with CRC on.
    pub fn init(&mut self) -> Result<Board, RadioError> {
        let version = self.bus.read_register(REG_VERSION)?;
        let board = Board::detect(version).ok_or(RadioError::UnsupportedChip(version))?;
        self.board = Some(board);
        info!("{} detected (version 0x{:02X})", board.name(), version);

        if board.has_image_calibration() {
            self.calibrate_rx_chain()?;
        }
        self.set_lora()?;
        self.set_crc(true)?;
        self.get_preamble_length()?;

        self.initialized = true;
        info!("{} ready in LoRa mode", board.name());
        Ok(board)
    }

    /// Put the chip to sleep. [`init`](Self::init) must run again before
    /// the next send or receive.
    pub fn off(&mut self) -> Result<(), RadioError> {
        self.initialized = false;
        self.set_sleep_mode()?;
        info!("radio off");
        Ok(())
    }

    fn calibrate_rx_chain(&mut self) -> Result<(), RadioError> {
        debug!("running RX chain calibration");
        self.write(REG_PA_CONFIG, 0x00)?;
        self.run_image_calibration()?;
        self.set_channel(super::config::CH_17_868)?;
        self.run_image_calibration()
    }

    fn run_image_calibration(&mut self) -> Result<(), RadioError> {
        let value = self.read(REG_IMAGE_CAL)?;
        self.write(REG_IMAGE_CAL, (value & IMAGE_CAL_MASK) | IMAGE_CAL_START)?;
        let deadline = self.clock.now_ms() + IMAGE_CAL_TIMEOUT_MS;
        let bus = &mut self.bus;
        let outcome = poll_until(&self.clock, deadline, 1, || {
            Ok::<_, BusError>(bus.read_register(REG_IMAGE_CAL)? & IMAGE_CAL_RUNNING == 0)
        })?;
        match outcome {
            PollOutcome::Satisfied => Ok(()),
            PollOutcome::TimedOut => {
                warn!("image calibration did not finish");
                Err(RadioError::Timeout)
            }
        }
    }

    // ---- accessors ----

    /// Detected chip, once [`init`](Self::init) has read it.
    pub fn chip(&self) -> Option<Board> {
        self.board
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Cached configuration, as last written or read back.
    pub fn settings(&self) -> &RadioSettings {
        &self.settings
    }

    /// SNR and RSSI from the last measurement.
    pub fn signal(&self) -> SignalQuality {
        self.signal
    }

    /// Last received packet.
    pub fn last_packet(&self) -> &Packet {
        &self.packet_received
    }

    /// Last packet handed to the modem.
    pub fn last_sent(&self) -> &Packet {
        &self.packet_sent
    }

    /// Last ACK received, valid or not.
    pub fn last_ack(&self) -> Option<&AckFrame> {
        self.last_ack.as_ref()
    }

    /// The last received packet asked for an acknowledgment.
    pub fn ack_requested(&self) -> bool {
        self.ack_requested
    }

    pub fn reception(&self) -> ReceptionStatus {
        self.reception
    }

    pub fn packet_number(&self) -> u8 {
        self.packet_number
    }

    /// Sequence number the next new packet will carry.
    pub fn set_packet_number(&mut self, packnum: u8) {
        self.packet_number = packnum;
    }

    pub fn node_address(&self) -> u8 {
        self.settings.node_address
    }

    /// Change the address stamped on outgoing frames and used for receive
    /// filtering, without touching the chip's node address register.
    pub fn set_local_address(&mut self, address: u8) {
        self.settings.node_address = address;
    }

    pub fn carrier_sense_config(&self) -> &CarrierSenseConfig {
        &self.carrier_sense
    }

    pub fn set_carrier_sense(&mut self, config: CarrierSenseConfig) -> Result<(), RadioError> {
        config.validate()?;
        self.carrier_sense = config;
        Ok(())
    }

    /// Send and accept frames without the 4-byte link header.
    pub fn set_raw_format(&mut self, raw: bool) {
        self.layout.raw = raw;
    }

    /// Prefix every frame with a 2-byte network key and drop frames that
    /// carry another key.
    pub fn set_net_key(&mut self, key: Option<[u8; 2]>) {
        self.layout.net_key = key;
    }

    pub fn frame_layout(&self) -> FrameLayout {
        self.layout
    }

    /// Route the output stage through PA_BOOST (used by `set_power_dbm`).
    pub fn set_pa_boost(&mut self, pa_boost: bool) {
        self.pa_boost = pa_boost;
    }

    /// Delay after configuration writes before reading them back.
    pub fn set_settle_ms(&mut self, ms: u32) {
        self.settle_ms = ms;
    }

    /// Delay between receiving a frame and sending its ACK.
    pub fn set_ack_turnaround_ms(&mut self, ms: u32) {
        self.ack_turnaround_ms = ms;
    }

    /// Type byte of new packets, flags included, until changed again.
    /// Types other than DATA/ACK keep only their flag bits.
    pub fn set_packet_type(&mut self, ptype: PacketType) {
        self.next_type = Some(ptype);
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Release the register bus.
    pub fn into_bus(self) -> B {
        self.bus
    }

    // ---- time on air ----

    pub(super) fn lora_params(&self) -> LoRaParams {
        LoRaParams {
            spreading_factor: self.settings.spreading_factor,
            bandwidth: self.settings.bandwidth,
            coding_rate: self.settings.coding_rate,
            preamble_symbols: self.settings.preamble_length,
            header: self.settings.header,
            low_data_rate_optimize: self.settings.low_data_rate_optimize,
        }
    }

    /// Airtime of a frame of `frame_len` bytes with the current settings, in
    /// the milliseconds the duty-cycle budget is charged in.
    pub fn get_toa(&self, frame_len: usize) -> u32 {
        airtime_ms(frame_len, &self.lora_params())
    }

    /// Turn on duty-cycle limiting. Returns the remaining allowance (ms).
    pub fn limit_toa(&mut self) -> i64 {
        let now = self.clock.now_ms();
        let remaining = self.budget.enable_limit(now);
        info!("ToA limiting on, {} ms left in this cycle", remaining);
        remaining
    }

    pub fn get_remaining_toa(&mut self) -> i64 {
        let now = self.clock.now_ms();
        self.budget.remaining(now)
    }

    /// Charge `toa_ms` against the budget. Returns the allowance left.
    pub fn remove_toa(&mut self, toa_ms: u32) -> i64 {
        let now = self.clock.now_ms();
        self.budget.commit(now, toa_ms)
    }

    pub fn is_limiting_toa(&self) -> bool {
        self.budget.is_limiting()
    }

    fn reserve_airtime(&mut self, frame_len: usize) -> Result<(), RadioError> {
        if !self.budget.is_limiting() {
            return Ok(());
        }
        let toa = self.get_toa(frame_len);
        let now = self.clock.now_ms();
        if !self.budget.reserve(now, toa) {
            warn!(
                "not enough airtime left: {} ms needed, {} ms remaining",
                toa,
                self.budget.remaining(now)
            );
            return Err(RadioError::InsufficientAirtime);
        }
        self.current_toa_ms = toa;
        Ok(())
    }

    // ---- register helpers ----

    pub(super) fn read(&mut self, address: u8) -> Result<u8, RadioError> {
        Ok(self.bus.read_register(address)?)
    }

    pub(super) fn write(&mut self, address: u8, value: u8) -> Result<(), RadioError> {
        Ok(self.bus.write_register(address, value)?)
    }

    pub(super) fn board(&self) -> Result<Board, RadioError> {
        self.board.ok_or(RadioError::NotInitialized)
    }

    fn ensure_ready(&self) -> Result<(), RadioError> {
        if self.initialized {
            Ok(())
        } else {
            Err(RadioError::NotInitialized)
        }
    }

    pub(super) fn op_mode(&mut self) -> Result<u8, RadioError> {
        self.read(REG_OP_MODE)
    }

    pub(super) fn standby_mode(&self) -> u8 {
        match self.settings.modem {
            Modem::LoRa => LORA_STANDBY_MODE,
            Modem::Fsk => FSK_STANDBY_MODE,
        }
    }

    pub(super) fn settle(&self) {
        if self.settle_ms > 0 {
            self.clock.delay_ms(self.settle_ms);
        }
    }

    /// Run `f` in standby and restore the previous mode afterwards, on
    /// every exit path.
    pub(super) fn with_standby<T, F>(&mut self, f: F) -> Result<T, RadioError>
    where
        F: FnOnce(&mut Self) -> Result<T, RadioError>,
    {
        let standby = self.standby_mode();
        let previous = self.op_mode()?;
        if previous != standby {
            self.write(REG_OP_MODE, standby)?;
        }
        let result = f(self);
        if previous != standby {
            let restored = self.write(REG_OP_MODE, previous);
            let value = result?;
            restored?;
            return Ok(value);
        }
        result
    }

    /// Run `f` with the FSK register bank mapped in (node address,
    /// temperature) and restore the previous mode afterwards.
    pub(super) fn with_fsk_registers<T, F>(&mut self, f: F) -> Result<T, RadioError>
    where
        F: FnOnce(&mut Self) -> Result<T, RadioError>,
    {
        let previous = self.op_mode()?;
        if self.settings.modem == Modem::LoRa {
            self.write(REG_OP_MODE, LORA_STANDBY_FSK_REGS_MODE)?;
        }
        let result = f(self);
        if self.settings.modem == Modem::LoRa {
            let restored = self.write(REG_OP_MODE, previous);
            let value = result?;
            restored?;
            return Ok(value);
        }
        result
    }

    pub(super) fn update_bit(&mut self, bit: RegBit, on: bool) -> Result<(), RadioError> {
        let value = self.read(bit.register)?;
        self.write(bit.register, bit.apply(value, on))
    }

    pub(super) fn verify_bit(&mut self, bit: RegBit, on: bool) -> Result<(), RadioError> {
        let read = self.read(bit.register)?;
        if bit.is_set(read) == on {
            Ok(())
        } else {
            Err(RadioError::VerifyFailed {
                register: bit.register,
                wrote: bit.apply(read, on),
                read,
            })
        }
    }

    pub(super) fn expect_register(&mut self, register: u8, wrote: u8) -> Result<(), RadioError> {
        let read = self.read(register)?;
        if read == wrote {
            Ok(())
        } else {
            warn!(
                "register 0x{:02X} reads 0x{:02X}, wrote 0x{:02X}",
                register, read, wrote
            );
            Err(RadioError::VerifyFailed {
                register,
                wrote,
                read,
            })
        }
    }

    /// Clear every IRQ flag, passing through standby if needed.
    pub(super) fn clear_flags(&mut self) -> Result<(), RadioError> {
        let standby = self.standby_mode();
        let previous = self.op_mode()?;
        if previous != standby {
            self.write(REG_OP_MODE, standby)?;
        }
        self.write(REG_IRQ_FLAGS, IRQ_ALL)?;
        if previous != standby {
            self.write(REG_OP_MODE, previous)?;
        }
        Ok(())
    }

    fn enter_standby(&mut self) -> Result<(), RadioError> {
        let standby = self.standby_mode();
        self.write(REG_OP_MODE, standby)
    }

    fn wait_for_irq(&mut self, mask: u8, deadline_ms: u64) -> Result<PollOutcome, RadioError> {
        let bus = &mut self.bus;
        Ok(poll_until(&self.clock, deadline_ms, 1, || {
            Ok::<_, BusError>(bus.read_register(REG_IRQ_FLAGS)? & mask != 0)
        })?)
    }

    fn write_fifo(&mut self, offset: u8, bytes: &[u8]) -> Result<(), RadioError> {
        self.write(REG_FIFO_ADDR_PTR, offset)?;
        for byte in bytes {
            self.write(REG_FIFO, *byte)?;
        }
        Ok(())
    }

    fn read_fifo(&mut self, len: usize) -> Result<Vec<u8>, RadioError> {
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read(REG_FIFO)?);
        }
        Ok(bytes)
    }

    // ---- send path ----

    /// Send `payload` to `dst` and wait up to `wait_ms` for TX done.
    ///
    /// Payloads longer than the frame allows are truncated; the number of
    /// payload bytes actually sent is returned.
    pub fn send_packet_timeout(
        &mut self,
        dst: u8,
        payload: &[u8],
        wait_ms: u32,
    ) -> Result<usize, RadioError> {
        self.ensure_ready()?;
        let max = MAX_PAYLOAD.min(self.layout.max_payload());
        let sent = payload.len().min(max);
        if sent < payload.len() {
            warn!("payload truncated from {} to {} bytes", payload.len(), sent);
        }
        let payload = &payload[..sent];

        self.reserve_airtime(self.layout.overhead() + sent)?;
        self.sense_before_send()?;

        self.retries = 0;
        self.load_frame(Some((dst, payload)))?;
        self.send_with_timeout(wait_ms)?;
        Ok(sent)
    }

    /// [`send_packet_timeout`](Self::send_packet_timeout) with the
    /// ACK-request flag, then wait up to `wait_ms` for the matching ACK.
    pub fn send_packet_timeout_ack(
        &mut self,
        dst: u8,
        payload: &[u8],
        wait_ms: u32,
    ) -> Result<usize, RadioError> {
        self.request_ack = true;
        let result = self
            .send_packet_timeout(dst, payload, wait_ms)
            .and_then(|sent| self.get_ack(wait_ms).map(|()| sent));
        self.request_ack = false;
        result
    }

    /// Send the last packet again with the same header, bumping the retry
    /// counter.
    ///
    /// The first retry announces one byte more than the original frame.
    pub fn resend_last(&mut self, wait_ms: u32) -> Result<(), RadioError> {
        self.ensure_ready()?;
        if self.packet_sent.length == 0 {
            return Err(RadioError::InvalidParameter(ConfigError::Invalid(
                "no packet to resend",
            )));
        }
        self.retries = self.retries.saturating_add(1);
        let frame_len = self.packet_sent.length as usize + usize::from(self.retries == 1);
        self.reserve_airtime(frame_len)?;
        self.sense_before_send()?;
        info!(
            "retrying packet {} (retry {})",
            self.packet_sent.packnum, self.retries
        );
        self.load_frame(None)?;
        self.send_with_timeout(wait_ms)
    }

    fn sense_before_send(&mut self) -> Result<(), RadioError> {
        if !self.carrier_sense.is_active() {
            return Ok(());
        }
        let report = self.carrier_sense(false)?;
        if report.is_free() {
            Ok(())
        } else {
            Err(RadioError::ChannelBusy)
        }
    }

    /// Build the outbound frame and write it to the FIFO. `None` re-sends
    /// the previous packet.
    fn load_frame(&mut self, new: Option<(u8, &[u8])>) -> Result<(), RadioError> {
        let previous = self.op_mode()?;
        self.clear_flags()?;
        self.enter_standby()?;
        self.reception = ReceptionStatus::Correct;

        match new {
            Some((dst, payload)) => {
                let ptype = match self.next_type {
                    Some(t) if t.is_known() => t,
                    Some(t) => PacketType::DATA.with_flags(t.flags()),
                    None => PacketType::DATA,
                };
                self.packet_sent = Packet {
                    dst,
                    ptype,
                    src: self.settings.node_address,
                    packnum: self.packet_number,
                    length: (self.layout.overhead() + payload.len()) as u8,
                    data: payload.to_vec(),
                    retry: 0,
                };
                self.packet_number = self.packet_number.wrapping_add(1);
            }
            None => {
                if self.retries == 1 {
                    self.packet_sent.length = self.packet_sent.length.saturating_add(1);
                }
                self.packet_sent.retry = self.retries;
            }
        }

        if self.request_ack {
            self.packet_sent.ptype = self.packet_sent.ptype.with_flags(PKT_FLAG_ACK_REQ);
        }

        let length = self.packet_sent.length;
        self.set_packet_length(length)?;
        let frame = self.packet_sent.encode(&self.layout);
        self.write_fifo(FIFO_TX_BASE, &frame)?;
        debug!(
            "frame loaded: dst {} type 0x{:02X} src {} seq {} len {}",
            self.packet_sent.dst,
            self.packet_sent.ptype.0,
            self.packet_sent.src,
            self.packet_sent.packnum,
            length
        );
        self.write(REG_OP_MODE, previous)
    }

    /// Transmit whatever is loaded and wait for TX done.
    fn send_with_timeout(&mut self, wait_ms: u32) -> Result<(), RadioError> {
        let deadline = self.clock.now_ms() + wait_ms as u64;
        self.clear_flags()?;
        self.write(REG_OP_MODE, LORA_TX_MODE)?;
        let outcome = self.wait_for_irq(IRQ_TX_DONE, deadline)?;
        let result = match outcome {
            PollOutcome::Satisfied => {
                if self.budget.is_limiting() {
                    let left = self.remove_toa(self.current_toa_ms);
                    debug!("{} ms of airtime left", left);
                }
                debug!("packet sent");
                Ok(())
            }
            PollOutcome::TimedOut => {
                warn!("TX done not raised within {} ms", wait_ms);
                self.enter_standby()?;
                Err(RadioError::Timeout)
            }
        };
        self.clear_flags()?;
        result
    }

    // ---- receive path ----

    /// Listen for up to `wait_ms` for a frame addressed to this node (or
    /// broadcast). Answers with an ACK if the frame asks for one.
    pub fn receive_packet_timeout(&mut self, wait_ms: u32) -> Result<&Packet, RadioError> {
        self.receive_with(wait_ms, true)?;
        if self.ack_requested && self.reception == ReceptionStatus::Correct {
            self.send_ack()?;
        }
        Ok(&self.packet_received)
    }

    /// Listen for up to `wait_ms` and take any frame, whatever its
    /// destination. No ACK is sent.
    pub fn receive_all(&mut self, wait_ms: u32) -> Result<&Packet, RadioError> {
        self.receive_with(wait_ms, false)?;
        Ok(&self.packet_received)
    }

    fn receive_with(&mut self, wait_ms: u32, filter: bool) -> Result<(), RadioError> {
        self.ensure_ready()?;
        if wait_ms > MAX_WAIT {
            return Err(RadioError::InvalidParameter(ConfigError::OutOfRange {
                field: "receive wait",
                value: wait_ms,
            }));
        }
        self.ack_requested = false;
        let outcome = self.receive_frame(wait_ms, filter);
        let released = self.release_receiver();
        outcome?;
        released
    }

    /// Enter continuous RX with the maximum payload length.
    fn start_receive(&mut self) -> Result<(), RadioError> {
        self.enter_standby()?;
        self.write(REG_PA_RAMP, PA_RAMP_LOW_PN_TX_PLL_OFF)?;
        self.write(REG_LNA, LNA_MAX_GAIN)?;
        self.write(REG_FIFO_ADDR_PTR, FIFO_RX_BASE)?;
        let symb_timeout = if self.settings.spreading_factor.value() >= 10 {
            SYMB_TIMEOUT_SF10_12
        } else {
            SYMB_TIMEOUT_SF6_9
        };
        self.write(REG_SYMB_TIMEOUT_LSB, symb_timeout)?;
        self.write(REG_FIFO_RX_BYTE_ADDR, FIFO_RX_BASE)?;
        self.set_packet_length(u8::MAX)?;
        self.write(REG_OP_MODE, LORA_RX_MODE)?;
        debug!("listening");
        Ok(())
    }

    /// Wait for a valid header and check the destination.
    ///
    /// While an ACK is awaited the frame carries no network key.
    fn wait_header(&mut self, wait_ms: u32, awaiting_ack: bool) -> Result<u8, RadioError> {
        let deadline = self.clock.now_ms() + wait_ms as u64;
        if !self.wait_for_irq(IRQ_VALID_HEADER, deadline)?.is_satisfied() {
            self.enter_standby()?;
            return Err(RadioError::NoPacket);
        }

        let bus = &mut self.bus;
        let first_bytes = poll_until(&self.clock, deadline, 1, || {
            Ok::<_, BusError>(bus.read_register(REG_FIFO_RX_BYTE_ADDR)? != 0)
        })?;
        if !first_bytes.is_satisfied() {
            self.enter_standby()?;
            return Err(RadioError::NoPacket);
        }

        let mut key_ok = true;
        if let Some(key) = self.layout.net_key {
            if !awaiting_ack {
                let theirs = [self.read(REG_FIFO)?, self.read(REG_FIFO)?];
                key_ok = theirs == key;
                if !key_ok {
                    debug!("net key {:02X?} is not ours", theirs);
                }
            }
        }
        let dst = self.read(REG_FIFO)?;
        let addressed = dst == self.settings.node_address || dst == BROADCAST_0 || self.layout.raw;
        if key_ok && addressed {
            Ok(dst)
        } else {
            debug!("frame for {} dropped", dst);
            self.enter_standby()?;
            Err(RadioError::NotForMe(dst))
        }
    }

    /// Wait for RX done and check the payload CRC. Leaves the radio in
    /// standby.
    fn wait_packet(&mut self, wait_ms: u32) -> Result<(), RadioError> {
        let deadline = self.clock.now_ms() + wait_ms as u64;
        let outcome = self.wait_for_irq(IRQ_RX_DONE, deadline)?;
        let flags = self.read(REG_IRQ_FLAGS)?;
        let crc_on = self.read(REG_HOP_CHANNEL)? & HOP_CHANNEL_CRC_ON_PAYLOAD != 0;
        self.enter_standby()?;
        if !outcome.is_satisfied() {
            return Err(RadioError::NoPacket);
        }
        if crc_on && flags & IRQ_PAYLOAD_CRC_ERROR != 0 {
            warn!("payload CRC error");
            self.reception = ReceptionStatus::Incorrect;
            return Err(RadioError::IncorrectPacket);
        }
        self.reception = ReceptionStatus::Correct;
        Ok(())
    }

    fn receive_frame(&mut self, wait_ms: u32, filter: bool) -> Result<(), RadioError> {
        self.start_receive()?;
        let payload_wait = if filter {
            self.wait_header(wait_ms, false)?;
            MAX_TIMEOUT
        } else {
            wait_ms
        };
        self.wait_packet(payload_wait)?;

        self.write(REG_FIFO_ADDR_PTR, FIFO_RX_BASE)?;
        let length = self.read(REG_RX_NB_BYTES)? as usize;
        let frame = self.read_fifo(length)?;
        let packet = match Packet::decode(&frame, &self.layout) {
            Ok(packet) => packet,
            Err(FrameError::UnknownType(t)) => {
                warn!("unknown packet type 0x{:02X}", t);
                self.reception = ReceptionStatus::IncorrectType;
                return Err(RadioError::IncorrectPacketType(t));
            }
            Err(e) => {
                warn!("{}", e);
                self.reception = ReceptionStatus::Incorrect;
                return Err(RadioError::IncorrectPacket);
            }
        };

        self.ack_requested = !self.layout.raw && packet.ptype.ack_requested();
        self.packet_received = packet;
        self.get_snr()?;
        self.get_rssi_packet()?;
        debug!(
            "received from {} seq {} ({} bytes, SNR {} dB, RSSI {} dBm)",
            self.packet_received.src,
            self.packet_received.packnum,
            self.packet_received.data.len(),
            self.signal.snr,
            self.signal.rssi_packet
        );
        if self.ack_requested {
            info!("ACK requested by {}", self.packet_received.src);
        }
        Ok(())
    }

    fn release_receiver(&mut self) -> Result<(), RadioError> {
        self.enter_standby()?;
        self.write(REG_FIFO_ADDR_PTR, FIFO_RX_BASE)?;
        self.clear_flags()
    }

    // ---- acknowledgments ----

    /// Load the ACK for the last received packet.
    fn set_ack(&mut self) -> Result<(), RadioError> {
        self.reserve_airtime(ACK_LENGTH)?;
        self.clear_flags()?;
        self.enter_standby()?;
        self.set_packet_length(ACK_LENGTH as u8)?;

        let snr_raw = self.read(REG_PKT_SNR_VALUE)?;
        let ack = AckFrame::reply_to(&self.packet_received, self.reception, snr_raw);
        self.write_fifo(FIFO_TX_BASE, &ack.to_bytes())?;
        self.reception = ReceptionStatus::Correct;
        if self.ack_turnaround_ms > 0 {
            self.clock.delay_ms(self.ack_turnaround_ms);
        }
        Ok(())
    }

    fn send_ack(&mut self) -> Result<(), RadioError> {
        self.set_ack()?;
        self.send_with_timeout(MAX_TIMEOUT)?;
        info!(
            "ACK sent to {} for seq {}",
            self.packet_received.src, self.packet_received.packnum
        );
        Ok(())
    }

    /// Wait for the ACK of the packet just sent.
    fn get_ack(&mut self, wait_ms: u32) -> Result<(), RadioError> {
        let outcome = self.receive_ack(wait_ms);
        let released = self.release_receiver();
        outcome?;
        released
    }

    fn receive_ack(&mut self, wait_ms: u32) -> Result<(), RadioError> {
        self.start_receive()?;
        match self.wait_header(wait_ms, true) {
            Ok(_) => {}
            Err(RadioError::NoPacket) | Err(RadioError::NotForMe(_)) => {
                warn!("no ACK within {} ms", wait_ms);
                return Err(RadioError::AckMissing);
            }
            Err(e) => return Err(e),
        }
        match self.wait_packet(MAX_TIMEOUT) {
            Ok(()) => {}
            Err(RadioError::NoPacket) | Err(RadioError::IncorrectPacket) => {
                return Err(RadioError::AckMissing)
            }
            Err(e) => return Err(e),
        }

        let length = self.read(REG_RX_NB_BYTES)? as usize;
        if length != ACK_LENGTH {
            warn!("{} byte frame is not an ACK", length);
            return Err(RadioError::AckMissing);
        }
        self.write(REG_FIFO_ADDR_PTR, FIFO_RX_BASE)?;
        let mut bytes = [0u8; ACK_LENGTH];
        for byte in bytes.iter_mut() {
            *byte = self.read(REG_FIFO)?;
        }
        let ack = AckFrame::from_bytes(&bytes);
        self.last_ack = Some(ack);
        debug!("peer heard us at SNR {} dB", ack.snr());

        match ack.matches(&self.packet_sent) {
            Ok(()) => {
                info!("ACK received for seq {}", ack.packnum);
                Ok(())
            }
            Err(mismatch) => {
                warn!("invalid ACK: {}", mismatch);
                Err(RadioError::AckInvalid(mismatch))
            }
        }
    }
}

/// Radio errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// Register transport error.
    Bus(BusError),
    /// `init` has not completed.
    NotInitialized,
    /// REG_VERSION holds an unknown chip id.
    UnsupportedChip(u8),
    /// Requested value is not in its legal set. Nothing was written.
    InvalidParameter(ConfigError),
    /// A register did not read back as written.
    VerifyFailed { register: u8, wrote: u8, read: u8 },
    /// A register holds a value outside its legal set.
    UnknownRegisterValue { register: u8, value: u8 },
    /// The chip did not enter the requested operating mode.
    ModeChangeFailed,
    /// TX done (or calibration) not signalled in time.
    Timeout,
    /// No frame arrived in time.
    NoPacket,
    /// Payload CRC failed or the frame was malformed.
    IncorrectPacket,
    /// Type byte is neither DATA nor ACK.
    IncorrectPacketType(u8),
    /// Frame for another node.
    NotForMe(u8),
    /// No ACK arrived in time.
    AckMissing,
    /// An ACK arrived but does not acknowledge the packet sent.
    AckInvalid(AckMismatch),
    /// Duty-cycle budget too small for this frame.
    InsufficientAirtime,
    /// Carrier sense found the channel busy.
    ChannelBusy,
}

impl RadioError {
    /// Expected outcome of an unreliable shared channel rather than a fault.
    pub fn is_protocol_condition(&self) -> bool {
        matches!(
            self,
            Self::NoPacket
                | Self::IncorrectPacket
                | Self::IncorrectPacketType(_)
                | Self::NotForMe(_)
                | Self::AckMissing
                | Self::AckInvalid(_)
                | Self::InsufficientAirtime
                | Self::ChannelBusy
        )
    }
}

impl From<BusError> for RadioError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

impl From<ConfigError> for RadioError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidParameter(e)
    }
}

impl From<CsmaError> for RadioError {
    fn from(e: CsmaError) -> Self {
        match e {
            CsmaError::InvalidConfig(reason) => Self::InvalidParameter(ConfigError::Invalid(reason)),
        }
    }
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(e) => write!(f, "bus error: {}", e),
            Self::NotInitialized => write!(f, "radio not initialized"),
            Self::UnsupportedChip(v) => write!(f, "unsupported chip version 0x{:02X}", v),
            Self::InvalidParameter(e) => write!(f, "invalid parameter: {}", e),
            Self::VerifyFailed {
                register,
                wrote,
                read,
            } => write!(
                f,
                "register 0x{:02X} verify failed: wrote 0x{:02X}, read 0x{:02X}",
                register, wrote, read
            ),
            Self::UnknownRegisterValue { register, value } => write!(
                f,
                "register 0x{:02X} holds unknown value 0x{:02X}",
                register, value
            ),
            Self::ModeChangeFailed => write!(f, "mode change failed"),
            Self::Timeout => write!(f, "radio timeout"),
            Self::NoPacket => write!(f, "no packet received"),
            Self::IncorrectPacket => write!(f, "incorrect packet"),
            Self::IncorrectPacketType(t) => write!(f, "incorrect packet type 0x{:02X}", t),
            Self::NotForMe(dst) => write!(f, "packet for node {}", dst),
            Self::AckMissing => write!(f, "ACK missing"),
            Self::AckInvalid(m) => write!(f, "ACK invalid: {}", m),
            Self::InsufficientAirtime => write!(f, "insufficient airtime"),
            Self::ChannelBusy => write!(f, "channel busy"),
        }
    }
}

impl std::error::Error for RadioError {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lora::csma::tests::StepRng;
    use crate::lora::{AckMismatch, ManualClock, SimAir, SimFrame, SimRadio, StdClock};
    use std::thread;

    pub(crate) type SimDriver = Sx127x<SimRadio, ManualClock, StepRng>;

    pub(crate) fn settled_driver_on(sim: &SimRadio, clock: &ManualClock, settle_ms: u32) -> SimDriver {
        let mut radio = Sx127x::with_rng(sim.clone(), clock.clone(), StepRng::new(0));
        radio.set_settle_ms(settle_ms);
        radio.set_ack_turnaround_ms(0);
        radio.init().unwrap();
        radio
    }

    pub(crate) fn driver_on(sim: &SimRadio, clock: &ManualClock) -> SimDriver {
        settled_driver_on(sim, clock, 0)
    }

    fn single() -> (SimAir, SimRadio, ManualClock, SimDriver) {
        let air = SimAir::new();
        let sim = air.sx1276();
        let clock = ManualClock::new();
        let radio = driver_on(&sim, &clock);
        (air, sim, clock, radio)
    }

    #[test]
    fn test_init_detects_chip() {
        let air = SimAir::new();
        let clock = ManualClock::new();
        let radio = driver_on(&air.sx1272(), &clock);
        assert_eq!(radio.chip(), Some(Board::Sx1272));
        assert!(radio.is_initialized());
        assert!(radio.settings().crc);

        let mut bad = Sx127x::with_rng(air.add_radio(0x55), clock, StepRng::new(0));
        assert!(matches!(bad.init(), Err(RadioError::UnsupportedChip(0x55))));
        assert!(matches!(
            bad.send_packet_timeout(2, b"x", 100),
            Err(RadioError::NotInitialized)
        ));
    }

    #[test]
    fn test_sx1276_init_calibrates_image() {
        let (_air, sim, _clock, radio) = single();
        assert_eq!(radio.settings().channel, crate::lora::config::CH_17_868);
        assert_eq!(sim.peek(REG_PA_CONFIG), 0x00);
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);
    }

    #[test]
    fn test_image_calibration_timeout() {
        let air = SimAir::new();
        let sim = air.sx1276();
        sim.stick_register(REG_IMAGE_CAL, 0x82 | IMAGE_CAL_RUNNING);
        let mut radio = Sx127x::with_rng(sim, ManualClock::new(), StepRng::new(0));
        radio.set_settle_ms(0);
        assert!(matches!(radio.init(), Err(RadioError::Timeout)));
        assert!(!radio.is_initialized());
    }

    #[test]
    fn test_send_frame_layout() {
        let (air, sim, _clock, mut radio) = single();
        let peer = air.sx1276();

        assert_eq!(radio.send_packet_timeout(2, b"hello", 1000).unwrap(), 5);
        assert_eq!(sim.tx_log(), vec![b"\x02\x10\x01\x00hello".to_vec()]);
        assert_eq!(radio.packet_number(), 1);
        assert_eq!(radio.last_sent().length, 9);
        assert_eq!(peer.pending_frames(), 1);
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);
        assert_eq!(sim.peek(REG_IRQ_FLAGS), 0);

        radio.send_packet_timeout(3, b"!", 1000).unwrap();
        assert_eq!(sim.tx_log()[1], b"\x03\x10\x01\x01!".to_vec());
    }

    #[test]
    fn test_send_truncates_payload() {
        let (_air, sim, _clock, mut radio) = single();
        let payload = vec![0xAB; 300];
        assert_eq!(radio.send_packet_timeout(2, &payload, 1000).unwrap(), MAX_PAYLOAD);
        assert_eq!(sim.tx_log()[0].len(), 255);

        radio.set_net_key(Some([0x12, 0x34]));
        assert_eq!(radio.send_packet_timeout(2, &payload, 1000).unwrap(), 249);
        assert_eq!(&sim.tx_log()[1][..3], &[0x12, 0x34, 0x02]);
    }

    #[test]
    fn test_packet_type_applies_until_changed() {
        let (_air, sim, _clock, mut radio) = single();
        radio.set_packet_type(PacketType(PKT_FLAG_ACK_REQ));
        radio.send_packet_timeout(2, b"a", 1000).unwrap();
        radio.send_packet_timeout(2, b"b", 1000).unwrap();
        radio.set_packet_type(PacketType::DATA);
        radio.send_packet_timeout(2, b"c", 1000).unwrap();
        let types: Vec<u8> = sim.tx_log().iter().map(|f| f[1]).collect();
        assert_eq!(types, vec![0x18, 0x18, 0x10]);
    }

    #[test]
    fn test_first_retry_sends_one_extra_byte() {
        let (_air, sim, _clock, mut radio) = single();
        assert!(matches!(
            radio.resend_last(1000),
            Err(RadioError::InvalidParameter(_))
        ));

        radio.send_packet_timeout(2, b"abc", 1000).unwrap();
        radio.resend_last(1000).unwrap();
        radio.resend_last(1000).unwrap();
        let log = sim.tx_log();
        assert_eq!(log[0].len(), 7);
        assert_eq!(log[1].len(), 8);
        assert_eq!(log[2].len(), 8);
        assert_eq!(&log[1][..7], &log[0][..]);
        assert_eq!(radio.last_sent().retry, 2);
        assert_eq!(radio.packet_number(), 1);
    }

    #[test]
    fn test_tx_timeout_leaves_standby() {
        let (_air, sim, clock, mut radio) = single();
        sim.stick_register(REG_IRQ_FLAGS, 0x00);
        let start = clock.now_ms();
        assert!(matches!(
            radio.send_packet_timeout(2, b"x", 500),
            Err(RadioError::Timeout)
        ));
        assert!(clock.now_ms() - start >= 500);
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);
    }

    #[test]
    fn test_receive_data_frame() {
        let (_air, sim, _clock, mut radio) = single();
        sim.inject(SimFrame::new(b"\x01\x10\x05\x07hi".to_vec()).with_snr_raw(0x28));

        let packet = radio.receive_packet_timeout(1000).unwrap().clone();
        assert_eq!(packet.src, 5);
        assert_eq!(packet.dst, 1);
        assert_eq!(packet.packnum, 7);
        assert_eq!(packet.data, b"hi".to_vec());
        assert_eq!(radio.signal().snr, 10);
        assert_eq!(radio.reception(), ReceptionStatus::Correct);
        assert!(!radio.ack_requested());
        assert!(sim.tx_log().is_empty());
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);
        assert_eq!(sim.peek(REG_IRQ_FLAGS), 0);
    }

    #[test]
    fn test_receive_broadcast() {
        let (_air, sim, _clock, mut radio) = single();
        sim.inject(SimFrame::new(b"\x00\x10\x09\x00all".to_vec()));
        assert_eq!(radio.receive_packet_timeout(1000).unwrap().src, 9);
    }

    #[test]
    fn test_frame_for_other_node() {
        let (_air, sim, _clock, mut radio) = single();
        sim.inject(SimFrame::new(b"\x09\x10\x05\x00xyz".to_vec()));

        assert!(matches!(
            radio.receive_packet_timeout(1000),
            Err(RadioError::NotForMe(9))
        ));
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);
        assert_eq!(sim.peek(REG_IRQ_FLAGS), 0);
    }

    #[test]
    fn test_receive_all_ignores_destination() {
        let (_air, sim, _clock, mut radio) = single();
        sim.inject(SimFrame::new(b"\x09\x18\x05\x00xyz".to_vec()));
        let packet = radio.receive_all(1000).unwrap();
        assert_eq!(packet.dst, 9);
        assert_eq!(packet.data, b"xyz".to_vec());
        // promiscuous receive never answers
        assert!(sim.tx_log().is_empty());
    }

    #[test]
    fn test_net_key_mismatch_is_not_for_me() {
        let (_air, sim, _clock, mut radio) = single();
        radio.set_net_key(Some([0x12, 0x34]));
        sim.inject(SimFrame::new(b"\x55\x66\x01\x10\x05\x00x".to_vec()));
        assert!(matches!(
            radio.receive_packet_timeout(1000),
            Err(RadioError::NotForMe(1))
        ));

        sim.inject(SimFrame::new(b"\x12\x34\x01\x10\x05\x00x".to_vec()));
        assert_eq!(radio.receive_packet_timeout(1000).unwrap().data, b"x".to_vec());
    }

    #[test]
    fn test_raw_format_accepts_anything() {
        let (_air, sim, _clock, mut radio) = single();
        radio.set_raw_format(true);
        sim.inject(SimFrame::new(b"\x77raw bytes".to_vec()));
        let packet = radio.receive_packet_timeout(1000).unwrap();
        assert_eq!(packet.data, b"\x77raw bytes".to_vec());
    }

    #[test]
    fn test_receive_timeout_is_no_packet() {
        let (_air, sim, clock, mut radio) = single();
        let start = clock.now_ms();
        assert!(matches!(
            radio.receive_packet_timeout(2000),
            Err(RadioError::NoPacket)
        ));
        assert!(clock.now_ms() - start >= 2000);
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);

        assert!(matches!(
            radio.receive_packet_timeout(MAX_WAIT + 1),
            Err(RadioError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_crc_failure_sends_no_ack() {
        let (_air, sim, _clock, mut radio) = single();
        sim.inject(SimFrame::new(b"\x01\x18\x05\x03a".to_vec()).corrupted());

        assert!(matches!(
            radio.receive_packet_timeout(1000),
            Err(RadioError::IncorrectPacket)
        ));
        assert_eq!(radio.reception(), ReceptionStatus::Incorrect);
        assert!(sim.tx_log().is_empty());
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);
        assert_eq!(sim.peek(REG_IRQ_FLAGS), 0);
    }

    #[test]
    fn test_crc_error_ignored_without_crc() {
        let (_air, sim, _clock, mut radio) = single();
        sim.inject(
            SimFrame::new(b"\x01\x10\x05\x03a".to_vec())
                .corrupted()
                .without_crc(),
        );
        assert!(radio.receive_packet_timeout(1000).is_ok());
    }

    #[test]
    fn test_unknown_packet_type() {
        let (_air, sim, _clock, mut radio) = single();
        sim.inject(SimFrame::new(b"\x01\x30\x05\x03a".to_vec()));
        assert!(matches!(
            radio.receive_packet_timeout(1000),
            Err(RadioError::IncorrectPacketType(0x30))
        ));
        assert_eq!(radio.reception(), ReceptionStatus::IncorrectType);
    }

    #[test]
    fn test_ack_reply_layout() {
        let (_air, sim, _clock, mut radio) = single();
        sim.inject(SimFrame::new(b"\x01\x18\x05\x03a".to_vec()).with_snr_raw(0x1C));

        radio.receive_packet_timeout(1000).unwrap();
        assert!(radio.ack_requested());
        assert_eq!(sim.tx_log(), vec![vec![0x05, 0x20, 0x01, 0x03, 0x02, 0x00, 0x1C]]);
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);
    }

    #[test]
    fn test_ack_missing() {
        let (_air, sim, _clock, mut radio) = single();
        assert!(matches!(
            radio.send_packet_timeout_ack(2, b"ping", 1000),
            Err(RadioError::AckMissing)
        ));
        assert_eq!(sim.tx_log()[0][1], 0x18);

        // the next plain send does not ask for an ACK
        radio.send_packet_timeout(2, b"ping", 1000).unwrap();
        assert_eq!(sim.tx_log()[1][1], 0x10);
    }

    #[test]
    fn test_ack_checked_against_sent_packet() {
        let (_air, sim, _clock, mut radio) = single();

        sim.inject(SimFrame::new(vec![0x01, 0x20, 0x02, 0x63, 0x02, 0x00, 0x28]));
        assert!(matches!(
            radio.send_packet_timeout_ack(2, b"one", 1000),
            Err(RadioError::AckInvalid(AckMismatch::PacketNumber {
                expected: 0,
                got: 0x63
            }))
        ));

        sim.inject(SimFrame::new(vec![0x01, 0x20, 0x02, 0x01, 0x02, 0x00, 0x28]));
        radio.send_packet_timeout_ack(2, b"two", 1000).unwrap();
        let ack = radio.last_ack().unwrap();
        assert_eq!(ack.packnum, 1);
        assert_eq!(ack.snr(), 10);
    }

    #[test]
    fn test_short_frame_is_not_an_ack() {
        let (_air, sim, _clock, mut radio) = single();

        sim.inject(SimFrame::new(vec![0x01, 0x20, 0x02, 0x00, 0x02, 0x00, 0x28]));
        radio.send_packet_timeout_ack(2, b"one", 1000).unwrap();

        // header of a valid ACK for seq 1, the rest of the FIFO still holds
        // the previous ACK
        sim.inject(SimFrame::new(vec![0x01, 0x20, 0x02, 0x01]));
        assert!(matches!(
            radio.send_packet_timeout_ack(2, b"two", 1000),
            Err(RadioError::AckMissing)
        ));
        assert_eq!(radio.last_ack().unwrap().packnum, 0);
        assert_eq!(sim.mode(), LORA_STANDBY_MODE);
        assert_eq!(sim.peek(REG_IRQ_FLAGS), 0);
    }

    #[test]
    fn test_airtime_budget() {
        let (_air, sim, _clock, mut radio) = single();
        assert_eq!(radio.limit_toa(), 36_000);
        let toa = radio.get_toa(4 + 5);
        radio.send_packet_timeout(2, b"hello", 1000).unwrap();
        assert_eq!(radio.get_remaining_toa(), 36_000 - toa as i64);

        radio.remove_toa(36_000);
        assert!(matches!(
            radio.send_packet_timeout(2, b"hello", 1000),
            Err(RadioError::InsufficientAirtime)
        ));
        assert_eq!(sim.tx_log().len(), 1);
    }

    #[test]
    fn test_ack_needs_airtime_too() {
        let (_air, sim, _clock, mut radio) = single();
        radio.limit_toa();
        radio.remove_toa(36_000);
        sim.inject(SimFrame::new(b"\x01\x18\x05\x03a".to_vec()));
        assert!(matches!(
            radio.receive_packet_timeout(1000),
            Err(RadioError::InsufficientAirtime)
        ));
        assert_eq!(radio.last_packet().src, 5);
        assert!(sim.tx_log().is_empty());
    }

    #[test]
    fn test_busy_channel_blocks_send() {
        let (_air, sim, _clock, mut radio) = single();
        radio
            .set_carrier_sense(crate::lora::CarrierSenseConfig {
                difs_retries: 2,
                ..crate::lora::CarrierSenseConfig::enabled()
            })
            .unwrap();
        sim.set_channel_activity(true);
        assert!(matches!(
            radio.send_packet_timeout(2, b"x", 1000),
            Err(RadioError::ChannelBusy)
        ));
        assert!(sim.tx_log().is_empty());

        sim.set_channel_activity(false);
        radio.send_packet_timeout(2, b"x", 1000).unwrap();
        assert_eq!(sim.tx_log().len(), 1);
    }

    #[test]
    fn test_invalid_carrier_sense_config() {
        let (_air, _sim, _clock, mut radio) = single();
        let result = radio.set_carrier_sense(crate::lora::CarrierSenseConfig {
            overall_retries: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(RadioError::InvalidParameter(_))));
    }

    #[test]
    fn test_bus_fault_and_off() {
        let (_air, sim, _clock, mut radio) = single();
        sim.disconnect();
        assert!(matches!(
            radio.send_packet_timeout(2, b"x", 1000),
            Err(RadioError::Bus(BusError::Disconnected))
        ));
        sim.reconnect();

        radio.off().unwrap();
        assert_eq!(sim.mode(), LORA_SLEEP_MODE);
        assert!(matches!(
            radio.receive_packet_timeout(1000),
            Err(RadioError::NotInitialized)
        ));
    }

    #[test]
    fn test_protocol_conditions() {
        assert!(RadioError::NoPacket.is_protocol_condition());
        assert!(RadioError::NotForMe(3).is_protocol_condition());
        assert!(RadioError::InsufficientAirtime.is_protocol_condition());
        assert!(!RadioError::Timeout.is_protocol_condition());
        assert!(!RadioError::Bus(BusError::Disconnected).is_protocol_condition());
        assert_eq!(RadioError::Timeout.to_string(), "radio timeout");
    }

    #[test]
    fn test_two_nodes_exchange_acked_packet() {
        let _ = env_logger::builder().is_test(true).try_init();
        let air = SimAir::new();
        let sim_a = air.sx1276();
        let sim_b = air.sx1276();

        let receiver = thread::spawn(move || {
            let mut b = Sx127x::new(sim_b, StdClock::new());
            b.set_settle_ms(0);
            b.set_ack_turnaround_ms(10);
            b.init().unwrap();
            b.set_node_address(2).unwrap();
            let packet = b.receive_packet_timeout(5_000).unwrap().clone();
            (packet, b.ack_requested())
        });

        let mut a = Sx127x::new(sim_a, StdClock::new());
        a.set_settle_ms(0);
        a.init().unwrap();
        a.set_node_address(1).unwrap();
        thread::sleep(std::time::Duration::from_millis(20));
        let sent = a.send_packet_timeout_ack(2, &[0x41, 0x42], 5_000).unwrap();
        assert_eq!(sent, 2);

        let ack = *a.last_ack().unwrap();
        assert_eq!(ack.dst, 1);
        assert_eq!(ack.src, 2);
        assert_eq!(ack.packnum, a.last_sent().packnum);
        assert_eq!(ack.length, 2);
        assert_eq!(ack.status, ReceptionStatus::Correct.code());

        let (packet, ack_requested) = receiver.join().unwrap();
        assert!(ack_requested);
        assert_eq!(packet.src, 1);
        assert_eq!(packet.data, vec![0x41, 0x42]);
    }
}
