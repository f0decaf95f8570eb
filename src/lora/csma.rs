//! Listen-before-talk channel access for LoRa.
//!
//! Before a frame goes out the channel is probed with bursts of Channel
//! Activity Detection (CAD). A busy burst backs off for a random number
//! (1..=7) of DIFS periods, DIFS being three SIFS slots of the current LoRa
//! mode. A free burst can optionally be confirmed after a random number of
//! CAD slots (extended IFS). Finally the ambient RSSI must drop below a
//! threshold; if it never does the whole procedure starts over.
//!
//! The slot tables are shared with every other node of the network and must
//! not change.
//!
//! # Algorithm
//!
//! 1. Disabled, or zero CAD repeats: the channel is free.
//! 2. CAD burst. Busy: wait `SIFS * 3 * w`, then retry, at most
//!    `difs_retries` bursts in all; the last busy burst still gets its wait
//!    (only-once mode gives up at once, without waiting).
//!    Free with extended IFS: wait `CAD * w`, run one confirmation burst whose
//!    result is only logged.
//! 3. Sample RSSI up to `rssi_retries` times, 1 ms apart, until it is at or
//!    below the threshold. If it never is, go back to 2, at most
//!    `overall_retries` times.
//!
//! The radio-facing side is the [`ChannelProbe`] trait, so the algorithm runs
//! unchanged against hardware, the simulator or a scripted probe.

use super::config::ModePreset;
use log::{debug, warn};
use rand_core::RngCore;

/// SIFS slot in milliseconds, indexed by LoRa mode (1..=10).
pub const SIFS_VALUE: [u8; 11] = [0, 183, 94, 44, 47, 23, 24, 12, 12, 7, 4];

/// CAD duration in milliseconds, indexed by LoRa mode (1..=10).
pub const CAD_VALUE: [u8; 11] = [0, 62, 31, 16, 16, 8, 9, 5, 3, 1, 1];

/// Slot durations for one LoRa mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadTiming {
    pub sifs_ms: u32,
    pub cad_ms: u32,
}

impl CadTiming {
    /// Timings for a mode preset. Mode 11 is mode 1 with a different sync
    /// word and shares its slots.
    pub fn for_mode(mode: ModePreset) -> Self {
        let index = match mode.index() {
            11 => 1,
            i => i as usize,
        };
        Self {
            sifs_ms: SIFS_VALUE[index] as u32,
            cad_ms: CAD_VALUE[index] as u32,
        }
    }

    pub fn difs_ms(&self) -> u32 {
        self.sifs_ms * 3
    }
}

/// Configuration for carrier sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarrierSenseConfig {
    pub enabled: bool,
    /// CAD repeats per burst. 0 disables carrier sense.
    pub send_cad_number: u8,
    /// Confirm a free burst after a random number of CAD slots.
    pub extended_ifs: bool,
    /// Check the ambient RSSI after CAD reports a free channel.
    pub rssi_on_send: bool,
    /// Channel is busy while RSSI is above this level.
    pub rssi_threshold_dbm: i16,
    pub rssi_retries: u8,
    /// Busy bursts tolerated before giving up.
    pub difs_retries: u8,
    /// Full CAD + RSSI rounds before giving up.
    pub overall_retries: u8,
}

impl Default for CarrierSenseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            send_cad_number: 9,
            extended_ifs: false,
            rssi_on_send: true,
            rssi_threshold_dbm: -90,
            rssi_retries: 8,
            difs_retries: 8,
            overall_retries: 3,
        }
    }
}

impl CarrierSenseConfig {
    /// Enabled with the default parameters.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), CsmaError> {
        if self.difs_retries == 0 {
            return Err(CsmaError::InvalidConfig("difs_retries must be > 0"));
        }
        if self.overall_retries == 0 {
            return Err(CsmaError::InvalidConfig("overall_retries must be > 0"));
        }
        if self.overall_retries > 20 {
            return Err(CsmaError::InvalidConfig("overall_retries must be <= 20"));
        }
        if self.rssi_on_send && self.rssi_retries == 0 {
            return Err(CsmaError::InvalidConfig(
                "rssi_retries must be > 0 when rssi_on_send is set",
            ));
        }
        if self.rssi_threshold_dbm > -40 {
            return Err(CsmaError::InvalidConfig(
                "rssi_threshold_dbm must be <= -40 dBm",
            ));
        }
        if self.rssi_threshold_dbm < -140 {
            return Err(CsmaError::InvalidConfig(
                "rssi_threshold_dbm must be >= -140 dBm",
            ));
        }
        Ok(())
    }

    /// Whether any check will run at all.
    pub fn is_active(&self) -> bool {
        self.enabled && self.send_cad_number > 0
    }
}

/// Errors that can occur in CSMA operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsmaError {
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for CsmaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid CSMA config: {}", msg),
        }
    }
}

impl std::error::Error for CsmaError {}

/// Radio operations carrier sense needs.
pub trait ChannelProbe {
    type Error;

    /// Run `count` CAD cycles. `true` means no activity was detected.
    fn cad(&mut self, count: u8) -> Result<bool, Self::Error>;

    /// Current channel RSSI in dBm.
    fn rssi(&mut self) -> Result<i16, Self::Error>;

    fn delay_ms(&mut self, ms: u32);
}

/// Verdict of one carrier-sense run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ignoring the verdict could cause transmission on a busy channel"]
pub enum ChannelState {
    Free,
    Busy,
}

/// Everything that happened during one carrier-sense run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseReport {
    pub state: ChannelState,
    /// CAD bursts run, confirmations included.
    pub cad_bursts: u32,
    /// Every wait, in milliseconds, in the order taken.
    pub backoffs_ms: Vec<u32>,
    pub rssi_samples: Vec<i16>,
    /// An extended-IFS confirmation burst saw activity.
    pub confirmation_failed: bool,
}

impl SenseReport {
    fn new() -> Self {
        Self {
            state: ChannelState::Free,
            cad_bursts: 0,
            backoffs_ms: Vec::new(),
            rssi_samples: Vec::new(),
            confirmation_failed: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == ChannelState::Free
    }

    fn finish(mut self, state: ChannelState) -> Self {
        self.state = state;
        self
    }
}

/// Random multiplier in 1..=7.
fn backoff_slots<R: RngCore>(rng: &mut R) -> u32 {
    rng.next_u32() % 7 + 1
}

/// Run carrier sense. With `only_once`, the first busy burst reports busy
/// without backing off.
pub fn carrier_sense<P, R>(
    config: &CarrierSenseConfig,
    timing: CadTiming,
    only_once: bool,
    probe: &mut P,
    rng: &mut R,
) -> Result<SenseReport, P::Error>
where
    P: ChannelProbe,
    R: RngCore,
{
    let mut report = SenseReport::new();
    if !config.is_active() {
        return Ok(report);
    }

    let cad_number = config.send_cad_number;
    let mut rounds_left = config.overall_retries;

    loop {
        let mut difs_left = config.difs_retries;
        loop {
            report.cad_bursts += 1;
            if probe.cad(cad_number)? {
                debug!("CAD burst {}: free", report.cad_bursts);
                if config.extended_ifs {
                    let wait = timing.cad_ms * backoff_slots(rng);
                    debug!("extended IFS wait {} ms", wait);
                    report.backoffs_ms.push(wait);
                    probe.delay_ms(wait);

                    report.cad_bursts += 1;
                    if !probe.cad(cad_number)? {
                        warn!("extended IFS confirmation saw activity");
                        report.confirmation_failed = true;
                    }
                }
                break;
            }

            debug!("CAD burst {}: busy", report.cad_bursts);
            if only_once {
                return Ok(report.finish(ChannelState::Busy));
            }
            let wait = timing.difs_ms() * backoff_slots(rng);
            debug!("DIFS backoff {} ms", wait);
            report.backoffs_ms.push(wait);
            probe.delay_ms(wait);

            difs_left -= 1;
            if difs_left == 0 {
                warn!("channel busy after {} CAD bursts", report.cad_bursts);
                return Ok(report.finish(ChannelState::Busy));
            }
        }

        if !config.rssi_on_send {
            return Ok(report.finish(ChannelState::Free));
        }

        for _ in 0..config.rssi_retries {
            let rssi = probe.rssi()?;
            report.rssi_samples.push(rssi);
            debug!("RSSI {} dBm", rssi);
            if rssi <= config.rssi_threshold_dbm {
                return Ok(report.finish(ChannelState::Free));
            }
            probe.delay_ms(1);
        }

        rounds_left -= 1;
        if rounds_left == 0 {
            warn!("RSSI stayed above {} dBm", config.rssi_threshold_dbm);
            return Ok(report.finish(ChannelState::Busy));
        }
        debug!("RSSI too high, restarting carrier sense");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// RNG returning an incrementing counter.
    pub(crate) struct StepRng {
        next: u32,
    }

    impl StepRng {
        pub(crate) fn new(start: u32) -> Self {
            Self { next: start }
        }
    }

    impl RngCore for StepRng {
        fn next_u32(&mut self) -> u32 {
            let value = self.next;
            self.next = self.next.wrapping_add(1);
            value
        }

        fn next_u64(&mut self) -> u64 {
            self.next_u32() as u64
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    /// Probe that replays scripted CAD and RSSI results.
    #[derive(Default)]
    struct ScriptedProbe {
        cad: VecDeque<bool>,
        rssi: VecDeque<i16>,
        cad_calls: usize,
        delays: Vec<u32>,
    }

    impl ScriptedProbe {
        fn new(cad: &[bool], rssi: &[i16]) -> Self {
            Self {
                cad: cad.iter().copied().collect(),
                rssi: rssi.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl ChannelProbe for ScriptedProbe {
        type Error = ();

        fn cad(&mut self, _count: u8) -> Result<bool, ()> {
            self.cad_calls += 1;
            self.cad.pop_front().ok_or(())
        }

        fn rssi(&mut self) -> Result<i16, ()> {
            self.rssi.pop_front().ok_or(())
        }

        fn delay_ms(&mut self, ms: u32) {
            self.delays.push(ms);
        }
    }

    fn mode(m: u8) -> CadTiming {
        CadTiming::for_mode(ModePreset::new(m).unwrap())
    }

    #[test]
    fn test_tables() {
        assert_eq!(SIFS_VALUE, [0, 183, 94, 44, 47, 23, 24, 12, 12, 7, 4]);
        assert_eq!(CAD_VALUE, [0, 62, 31, 16, 16, 8, 9, 5, 3, 1, 1]);
        assert_eq!(mode(1), CadTiming { sifs_ms: 183, cad_ms: 62 });
        assert_eq!(mode(10), CadTiming { sifs_ms: 4, cad_ms: 1 });
        assert_eq!(mode(11), mode(1));
        assert_eq!(mode(3).difs_ms(), 132);
    }

    #[test]
    fn test_default_config() {
        let config = CarrierSenseConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.send_cad_number, 9);
        assert_eq!(config.rssi_threshold_dbm, -90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = CarrierSenseConfig {
            difs_retries: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CsmaError::InvalidConfig(_))
        ));

        let config = CarrierSenseConfig {
            rssi_threshold_dbm: -20,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CarrierSenseConfig {
            rssi_retries: 0,
            rssi_on_send: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disabled_is_free_without_cad() {
        let mut probe = ScriptedProbe::default();
        let mut rng = StepRng::new(0);
        let config = CarrierSenseConfig {
            enabled: true,
            send_cad_number: 0,
            ..Default::default()
        };
        let report = carrier_sense(&config, mode(1), false, &mut probe, &mut rng).unwrap();
        assert!(report.is_free());
        assert_eq!(probe.cad_calls, 0);
        assert_eq!(report.cad_bursts, 0);

        let report = carrier_sense(
            &CarrierSenseConfig::default(),
            mode(1),
            false,
            &mut probe,
            &mut rng,
        )
        .unwrap();
        assert!(report.is_free());
        assert_eq!(probe.cad_calls, 0);
    }

    #[test]
    fn test_free_channel_quiet_rssi() {
        let mut probe = ScriptedProbe::new(&[true], &[-120]);
        let mut rng = StepRng::new(0);
        let report = carrier_sense(
            &CarrierSenseConfig::enabled(),
            mode(1),
            false,
            &mut probe,
            &mut rng,
        )
        .unwrap();
        assert_eq!(report.state, ChannelState::Free);
        assert_eq!(report.cad_bursts, 1);
        assert!(report.backoffs_ms.is_empty());
        assert_eq!(report.rssi_samples, vec![-120]);
    }

    #[test]
    fn test_busy_then_free_backs_off_difs() {
        let mut probe = ScriptedProbe::new(&[false, false, true], &[-100]);
        // draws 0 and 1 give 1 and 2 slots
        let mut rng = StepRng::new(0);
        let report = carrier_sense(
            &CarrierSenseConfig::enabled(),
            mode(3),
            false,
            &mut probe,
            &mut rng,
        )
        .unwrap();
        assert!(report.is_free());
        assert_eq!(report.cad_bursts, 3);
        assert_eq!(report.backoffs_ms, vec![132, 264]);
        assert_eq!(probe.delays, vec![132, 264]);
    }

    #[test]
    fn test_only_once_returns_busy_immediately() {
        let mut probe = ScriptedProbe::new(&[false, true], &[]);
        let mut rng = StepRng::new(0);
        let report = carrier_sense(
            &CarrierSenseConfig::enabled(),
            mode(1),
            true,
            &mut probe,
            &mut rng,
        )
        .unwrap();
        assert_eq!(report.state, ChannelState::Busy);
        assert_eq!(probe.cad_calls, 1);
        assert!(probe.delays.is_empty());
    }

    #[test]
    fn test_difs_retries_exhausted() {
        let mut probe = ScriptedProbe::new(&[false; 8], &[]);
        let mut rng = StepRng::new(0);
        let report = carrier_sense(
            &CarrierSenseConfig::enabled(),
            mode(10),
            false,
            &mut probe,
            &mut rng,
        )
        .unwrap();
        assert_eq!(report.state, ChannelState::Busy);
        assert_eq!(report.cad_bursts, 8);
        // every busy burst backs off, the last one included
        assert_eq!(report.backoffs_ms.len(), 8);
        assert_eq!(probe.delays, report.backoffs_ms);
        assert!(report.rssi_samples.is_empty());
    }

    #[test]
    fn test_extended_ifs_confirmation_failure_is_only_logged() {
        let mut probe = ScriptedProbe::new(&[true, false], &[-110]);
        let mut rng = StepRng::new(6);
        let config = CarrierSenseConfig {
            extended_ifs: true,
            ..CarrierSenseConfig::enabled()
        };
        let report = carrier_sense(&config, mode(1), false, &mut probe, &mut rng).unwrap();
        assert!(report.is_free());
        assert!(report.confirmation_failed);
        assert_eq!(report.cad_bursts, 2);
        // draw 6 gives 7 CAD slots of 62 ms
        assert_eq!(report.backoffs_ms, vec![434]);
    }

    #[test]
    fn test_rssi_settles_below_threshold() {
        let mut probe = ScriptedProbe::new(&[true], &[-60, -70, -95]);
        let mut rng = StepRng::new(0);
        let report = carrier_sense(
            &CarrierSenseConfig::enabled(),
            mode(1),
            false,
            &mut probe,
            &mut rng,
        )
        .unwrap();
        assert!(report.is_free());
        assert_eq!(report.rssi_samples, vec![-60, -70, -95]);
        assert_eq!(probe.delays, vec![1, 1]);
    }

    #[test]
    fn test_noisy_rssi_restarts_then_gives_up() {
        let mut probe = ScriptedProbe::new(&[true, true, true], &[-50; 24]);
        let mut rng = StepRng::new(0);
        let report = carrier_sense(
            &CarrierSenseConfig::enabled(),
            mode(1),
            false,
            &mut probe,
            &mut rng,
        )
        .unwrap();
        assert_eq!(report.state, ChannelState::Busy);
        assert_eq!(report.cad_bursts, 3);
        assert_eq!(report.rssi_samples.len(), 24);
    }

    #[test]
    fn test_rssi_check_can_be_skipped() {
        let mut probe = ScriptedProbe::new(&[true], &[]);
        let mut rng = StepRng::new(0);
        let config = CarrierSenseConfig {
            rssi_on_send: false,
            ..CarrierSenseConfig::enabled()
        };
        let report = carrier_sense(&config, mode(1), false, &mut probe, &mut rng).unwrap();
        assert!(report.is_free());
        assert!(report.rssi_samples.is_empty());
    }

    #[test]
    fn test_probe_errors_propagate() {
        let mut probe = ScriptedProbe::default();
        let mut rng = StepRng::new(0);
        let result = carrier_sense(
            &CarrierSenseConfig::enabled(),
            mode(1),
            false,
            &mut probe,
            &mut rng,
        );
        assert_eq!(result, Err(()));
    }

    #[test]
    fn test_backoff_slots_range() {
        let mut rng = StepRng::new(0);
        for i in 0..14u32 {
            assert_eq!(backoff_slots(&mut rng), i % 7 + 1);
        }
    }
}
