//! Gateway receive loop.
//!
//! [`GatewayLink`] owns the driver, applies a [`GatewayConfig`] and turns
//! each receive cycle into an [`Uplink`] report, or relays the frame to the
//! next hop when configured as a relay. A fault that is not an ordinary
//! channel condition powers the radio off and runs the setup again.

use crate::lora::{
    Board, Clock, ConfigError, GatewayConfig, Packet, PacketType, RadioError, RegisterBus,
    Sx127x, MAX_TIMEOUT,
};
use log::{debug, error, info, warn};
use rand_core::{OsRng, RngCore};
use std::fmt;

/// Payload bytes printed per uplink line.
pub const MAX_LINE_PAYLOAD: usize = 100;

/// One received sensor frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub src: u8,
    pub seq: u8,
    /// dB
    pub snr: i8,
    /// Packet RSSI in dBm.
    pub rssi: i16,
    pub payload: Vec<u8>,
}

impl fmt::Display for Uplink {
    /// `src,SNR,RSSI,payload`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.payload[..self.payload.len().min(MAX_LINE_PAYLOAD)];
        write!(
            f,
            "{},{},{},{}",
            self.src,
            self.snr,
            self.rssi,
            String::from_utf8_lossy(shown)
        )
    }
}

pub struct GatewayLink<B, C, R = OsRng> {
    radio: Sx127x<B, C, R>,
    config: GatewayConfig,
    resets: u32,
}

impl<B, C, R> GatewayLink<B, C, R>
where
    B: RegisterBus,
    C: Clock,
    R: RngCore,
{
    /// Wrap a driver. The configuration is checked here, the radio is not
    /// touched until [`setup`](Self::setup).
    pub fn new(radio: Sx127x<B, C, R>, config: GatewayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            radio,
            config,
            resets: 0,
        })
    }

    /// Bring the radio up with the gateway settings.
    pub fn setup(&mut self) -> Result<Board, RadioError> {
        let config = &self.config;
        let radio = &mut self.radio;

        radio.set_settle_ms(config.settle_ms);
        radio.set_ack_turnaround_ms(config.ack_turnaround_ms);
        let board = radio.init()?;

        radio.set_channel(config.effective_channel())?;
        radio.set_mode(config.mode)?;
        radio.set_pa_boost(config.pa_boost);
        radio.set_power(config.power)?;
        radio.set_node_address(config.node_address)?;
        radio.set_raw_format(config.raw_format);
        radio.set_net_key(config.net_key);

        let mut carrier_sense = config.carrier_sense;
        if config.relay.is_some() {
            carrier_sense.enabled = true;
        }
        radio.set_carrier_sense(carrier_sense)?;
        if config.limit_toa && !radio.is_limiting_toa() {
            radio.limit_toa();
        }

        info!(
            "gateway {} up on channel 0x{:06X}, mode {}, power '{}'{}",
            config.node_address,
            config.effective_channel(),
            config.mode.index(),
            config.power.letter(),
            match config.relay {
                Some(next_hop) => format!(", relaying to {}", next_hop),
                None => String::new(),
            }
        );
        Ok(board)
    }

    /// Run one receive cycle of up to [`MAX_TIMEOUT`] ms.
    ///
    /// Returns the uplink to report, or `None` when nothing was received or
    /// the frame was relayed.
    pub fn poll(&mut self) -> Result<Option<Uplink>, RadioError> {
        let received = if self.config.receive_all {
            self.radio.receive_all(MAX_TIMEOUT).cloned()
        } else {
            self.radio.receive_packet_timeout(MAX_TIMEOUT).cloned()
        };

        let packet = match received {
            Ok(packet) => packet,
            Err(RadioError::NoPacket) => {
                debug!("nothing received");
                return Ok(None);
            }
            Err(e) if e.is_protocol_condition() => {
                warn!("receive error: {}", e);
                return Ok(None);
            }
            Err(e) => {
                error!("receive error: {}, resetting radio", e);
                self.reset()?;
                return Ok(None);
            }
        };

        if let Some(next_hop) = self.config.relay {
            self.relay(&packet, next_hop);
            return Ok(None);
        }

        let signal = self.radio.signal();
        let uplink = Uplink {
            src: packet.src,
            seq: packet.packnum,
            snr: signal.snr,
            rssi: signal.rssi_packet,
            payload: packet.data,
        };
        info!("{}", uplink);
        Ok(Some(uplink))
    }

    fn reset(&mut self) -> Result<(), RadioError> {
        self.resets += 1;
        if let Err(e) = self.radio.off() {
            debug!("radio off failed: {}", e);
        }
        info!("resetting radio module");
        self.setup().map(|_| ())
    }

    /// Send `packet` on to `next_hop` under its original source, sequence
    /// number and type.
    fn relay(&mut self, packet: &Packet, next_hop: u8) {
        let own_address = self.radio.node_address();
        self.radio.set_local_address(packet.src);
        self.radio.set_packet_number(packet.packnum);
        self.radio.set_packet_type(packet.ptype);

        match self
            .radio
            .send_packet_timeout(next_hop, &packet.data, MAX_TIMEOUT)
        {
            Ok(_) => info!(
                "relayed packet {} from {} to {}",
                packet.packnum, packet.src, next_hop
            ),
            Err(e) => warn!("relay to {} failed: {}", next_hop, e),
        }

        self.radio.set_local_address(own_address);
        self.radio.set_packet_type(PacketType::DATA);
    }

    /// Times the radio was reset after a fault.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn radio(&self) -> &Sx127x<B, C, R> {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut Sx127x<B, C, R> {
        &mut self.radio
    }

    pub fn into_radio(self) -> Sx127x<B, C, R> {
        self.radio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::config::{Band, CH_00_433};
    use crate::lora::regs::{REG_NODE_ADRS, REG_PA_CONFIG, REG_SYNC_WORD};
    use crate::lora::{BusError, ManualClock, PowerLevel, SimAir, SimFrame, SimRadio};

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            band: Band::Band433,
            settle_ms: 0,
            ack_turnaround_ms: 0,
            ..Default::default()
        }
    }

    fn gateway(sim: &SimRadio, config: GatewayConfig) -> GatewayLink<SimRadio, ManualClock> {
        let radio = Sx127x::new(sim.clone(), ManualClock::new());
        let mut gw = GatewayLink::new(radio, config).unwrap();
        gw.setup().unwrap();
        gw
    }

    #[test]
    fn test_uplink_line() {
        let uplink = Uplink {
            src: 5,
            seq: 3,
            snr: -4,
            rssi: -101,
            payload: b"t=21.5".to_vec(),
        };
        assert_eq!(uplink.to_string(), "5,-4,-101,t=21.5");

        let long = Uplink {
            payload: vec![b'a'; 150],
            ..uplink
        };
        assert_eq!(long.to_string().len(), "5,-4,-101,".len() + MAX_LINE_PAYLOAD);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let air = SimAir::new();
        let radio = Sx127x::new(air.sx1276(), ManualClock::new());
        let config = GatewayConfig {
            node_address: 0,
            ..test_config()
        };
        assert!(GatewayLink::new(radio, config).is_err());
    }

    #[test]
    fn test_setup_applies_config() {
        let air = SimAir::new();
        let sim = air.sx1276();
        let gw = gateway(&sim, test_config());

        let settings = gw.radio().settings();
        assert_eq!(settings.channel, CH_00_433);
        assert_eq!(settings.mode.index(), 11);
        assert_eq!(settings.spreading_factor.value(), 12);
        assert!(settings.low_data_rate_optimize);
        assert_eq!(sim.peek(REG_SYNC_WORD), 0x34);
        assert_eq!(sim.peek(REG_NODE_ADRS), 1);
        assert_eq!(sim.peek(REG_PA_CONFIG), 0xFF);
        assert!(!gw.radio().carrier_sense_config().enabled);
    }

    #[test]
    fn test_poll_reports_uplink() {
        let air = SimAir::new();
        let sim = air.sx1276();
        let mut gw = gateway(&sim, test_config());

        assert_eq!(gw.poll().unwrap(), None);

        sim.inject(SimFrame::new(b"\x01\x10\x05\x09hello".to_vec()));
        let uplink = gw.poll().unwrap().unwrap();
        assert_eq!(uplink.src, 5);
        assert_eq!(uplink.seq, 9);
        assert_eq!(uplink.snr, 10);
        // 433 MHz port: -157 - 7 + 80 * 16 / 15
        assert_eq!(uplink.rssi, -78);
        assert_eq!(uplink.to_string(), "5,10,-78,hello");
    }

    #[test]
    fn test_poll_acks_sensor() {
        let air = SimAir::new();
        let sim = air.sx1276();
        let mut gw = gateway(&sim, test_config());

        sim.inject(SimFrame::new(b"\x01\x18\x05\x02x".to_vec()));
        assert!(gw.poll().unwrap().is_some());
        assert_eq!(sim.tx_log().last().unwrap()[..5], [0x05, 0x20, 0x01, 0x02, 0x02]);
    }

    #[test]
    fn test_poll_skips_protocol_conditions() {
        let air = SimAir::new();
        let sim = air.sx1276();
        let mut gw = gateway(&sim, test_config());

        sim.inject(SimFrame::new(b"\x01\x10\x05\x02x".to_vec()).corrupted());
        assert_eq!(gw.poll().unwrap(), None);
        sim.inject(SimFrame::new(b"\x04\x10\x05\x02x".to_vec()));
        assert_eq!(gw.poll().unwrap(), None);
        assert_eq!(gw.resets(), 0);
    }

    #[test]
    fn test_fault_resets_radio() {
        let air = SimAir::new();
        let sim = air.sx1276();
        let mut gw = gateway(&sim, test_config());

        sim.disconnect();
        assert!(matches!(
            gw.poll(),
            Err(RadioError::Bus(BusError::Disconnected))
        ));
        assert_eq!(gw.resets(), 1);

        sim.reconnect();
        assert_eq!(gw.poll().unwrap(), None);
        assert_eq!(gw.resets(), 2);
        assert!(gw.radio().is_initialized());

        sim.inject(SimFrame::new(b"\x01\x10\x05\x09ok".to_vec()));
        assert_eq!(gw.poll().unwrap().unwrap().payload, b"ok".to_vec());
    }

    #[test]
    fn test_receive_all_reports_foreign_frames() {
        let air = SimAir::new();
        let sim = air.sx1276();
        let config = GatewayConfig {
            receive_all: true,
            ..test_config()
        };
        let mut gw = gateway(&sim, config);

        sim.inject(SimFrame::new(b"\x08\x10\x05\x01hey".to_vec()));
        assert_eq!(gw.poll().unwrap().unwrap().payload, b"hey".to_vec());
    }

    #[test]
    fn test_relay_keeps_sender_header() {
        let air = SimAir::new();
        let sim = air.sx1276();
        let next_hop = air.sx1276();
        let config = GatewayConfig {
            relay: Some(7),
            power: PowerLevel::Max,
            ..test_config()
        };
        let mut gw = gateway(&sim, config);
        assert!(gw.radio().carrier_sense_config().enabled);

        sim.inject(SimFrame::new(b"\x01\x10\x05\x09data".to_vec()));
        assert_eq!(gw.poll().unwrap(), None);

        assert_eq!(
            sim.tx_log().last().unwrap(),
            &b"\x07\x10\x05\x09data".to_vec()
        );
        assert_eq!(next_hop.pending_frames(), 1);
        assert_eq!(gw.radio().node_address(), 1);
        assert_eq!(gw.radio().packet_number(), 10);
    }
}
