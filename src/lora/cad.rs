//! Channel activity detection on the SX127x.
//!
//! [`RadioProbe`] borrows the register bus and clock of a driver and runs
//! the CAD primitive for the carrier-sense algorithm in `csma.rs`.

use super::board::Board;
use super::clock::{poll_until, Clock, PollOutcome};
use super::csma::{self, CadTiming, ChannelProbe, SenseReport};
use super::radio::{RadioError, Sx127x};
use super::regs::*;
use super::transport::{BusError, RegisterBus};
use log::{debug, info, warn};
use rand_core::RngCore;

/// Per-CAD deadline (ms).
const CAD_TIMEOUT_MS: u64 = 100;
/// CAD runs that may time out before the burst counts as busy.
const CAD_ERROR_RETRIES: u8 = 3;
/// Extra wait after one symbol before the RSSI sample is taken (µs).
const RSSI_SAMPLE_DELAY_US: u64 = 240;
const RSSI_SAMPLES: i32 = 5;

/// CAD and RSSI access for one carrier-sense run.
struct RadioProbe<'a, B, C> {
    bus: &'a mut B,
    clock: &'a C,
    board: Board,
    symbol_us: u64,
    last_rssi: Option<i16>,
}

impl<'a, B: RegisterBus, C: Clock> RadioProbe<'a, B, C> {
    fn new(bus: &'a mut B, clock: &'a C, board: Board, symbol_us: u64) -> Self {
        Self {
            bus,
            clock,
            board,
            symbol_us,
            last_rssi: None,
        }
    }

    /// One CAD run: `Some(activity)` when CAD done was raised in time.
    fn run_once(&mut self, rssi_sum: &mut i32, rssi_count: &mut i32) -> Result<Option<bool>, BusError> {
        self.bus.write_register(REG_IRQ_FLAGS, IRQ_ALL)?;
        let start_us = self.clock.now_us();
        self.bus.write_register(REG_OP_MODE, LORA_CAD_MODE)?;

        let bus = &mut *self.bus;
        let clock = self.clock;
        let sample_after_us = self.symbol_us + RSSI_SAMPLE_DELAY_US;
        let mut sampled = false;
        let deadline = clock.now_ms() + CAD_TIMEOUT_MS;
        let outcome = poll_until(clock, deadline, 1, || {
            if !sampled && clock.now_us().saturating_sub(start_us) > sample_after_us {
                *rssi_sum += bus.read_register(REG_RSSI_VALUE_LORA)? as i32;
                *rssi_count += 1;
                sampled = true;
            }
            Ok::<_, BusError>(bus.read_register(REG_IRQ_FLAGS)? & IRQ_CAD_DONE != 0)
        })?;

        match outcome {
            PollOutcome::Satisfied => {
                let flags = self.bus.read_register(REG_IRQ_FLAGS)?;
                Ok(Some(flags & IRQ_CAD_DETECTED != 0))
            }
            PollOutcome::TimedOut => Ok(None),
        }
    }
}

impl<B: RegisterBus, C: Clock> ChannelProbe for RadioProbe<'_, B, C> {
    type Error = RadioError;

    fn cad(&mut self, count: u8) -> Result<bool, RadioError> {
        let previous = self.bus.read_register(REG_OP_MODE)?;
        self.bus.write_register(REG_OP_MODE, LORA_STANDBY_MODE)?;

        let mut free = true;
        let mut remaining = count;
        let mut errors_left = CAD_ERROR_RETRIES;
        let mut rssi_sum = 0;
        let mut rssi_count = 0;

        while remaining > 0 {
            match self.run_once(&mut rssi_sum, &mut rssi_count)? {
                Some(true) => {
                    free = false;
                    break;
                }
                Some(false) => remaining -= 1,
                None => {
                    warn!("CAD done not raised within {} ms", CAD_TIMEOUT_MS);
                    errors_left -= 1;
                    if errors_left == 0 {
                        free = false;
                        break;
                    }
                }
            }
        }

        if rssi_count > 0 {
            self.last_rssi = Some(self.board.rssi_offset() + (rssi_sum / rssi_count) as i16);
        }
        self.bus.write_register(REG_IRQ_FLAGS, IRQ_ALL)?;
        self.bus.write_register(REG_OP_MODE, previous)?;
        debug!(
            "{} CAD run(s): {}",
            count,
            if free { "free" } else { "activity" }
        );
        Ok(free)
    }

    fn rssi(&mut self) -> Result<i16, RadioError> {
        let mut sum = 0i32;
        for _ in 0..RSSI_SAMPLES {
            sum += self.bus.read_register(REG_RSSI_VALUE_LORA)? as i32;
        }
        let rssi = self.board.rssi_offset() + (sum / RSSI_SAMPLES) as i16;
        self.last_rssi = Some(rssi);
        Ok(rssi)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.clock.delay_ms(ms);
    }
}

impl<B, C, R> Sx127x<B, C, R>
where
    B: RegisterBus,
    C: Clock,
    R: RngCore,
{
    /// Run `count` CAD cycles. `true` means no activity was seen.
    ///
    /// The mean RSSI sampled during the cycles is kept in
    /// [`signal`](Self::signal).
    pub fn do_cad(&mut self, count: u8) -> Result<bool, RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let symbol_us = self.lora_params().symbol_duration_us();
        let mut probe = RadioProbe::new(&mut self.bus, &self.clock, board, symbol_us);
        let free = probe.cad(count)?;
        if let Some(rssi) = probe.last_rssi {
            self.signal.rssi = rssi;
        }
        Ok(free)
    }

    /// Run the full carrier-sense procedure with the configured settings
    /// and the slot timings of the current mode preset.
    pub fn carrier_sense(&mut self, only_once: bool) -> Result<SenseReport, RadioError> {
        let board = self.board()?;
        self.ensure_lora()?;
        let timing = CadTiming::for_mode(self.settings.mode);
        let symbol_us = self.lora_params().symbol_duration_us();
        let mut probe = RadioProbe::new(&mut self.bus, &self.clock, board, symbol_us);
        let report = csma::carrier_sense(
            &self.carrier_sense,
            timing,
            only_once,
            &mut probe,
            &mut self.rng,
        )?;
        if let Some(rssi) = probe.last_rssi {
            self.signal.rssi = rssi;
        }
        if report.is_free() {
            debug!("channel free after {} CAD burst(s)", report.cad_bursts);
        } else {
            info!("channel busy after {} CAD burst(s)", report.cad_bursts);
        }
        Ok(report)
    }
}
