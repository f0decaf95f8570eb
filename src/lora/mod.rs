//! LoRa radio support.
//!
//! This module contains:
//! - [`regs`]: SX127x register map and bit values
//! - [`config`]: Bands, channels, modulation parameters and gateway settings
//! - `board`: SX1272/SX1276 register layout differences
//! - `transport`: Register access over SPI (or the simulator)
//! - `clock`: Time source and bounded polling
//! - `airtime`: Time-on-air calculation for LoRa packets
//! - `duty_cycle`: Hourly airtime budget
//! - `csma`: Carrier sense before transmitting
//! - `packet`: Link-layer frames and ACKs
//! - `radio`: SX1272/76 driver (`settings`, `cad` extend it)
//! - `sim`: Simulated transceiver and shared air

mod airtime;
mod board;
mod cad;
mod clock;
pub mod config;
mod csma;
mod duty_cycle;
mod packet;
mod radio;
pub mod regs;
mod settings;
mod sim;
mod transport;

pub use airtime::{airtime_ms, airtime_us, LoRaParams};
pub use board::{Board, RegBit};
pub use clock::{poll_until, Clock, ManualClock, PollOutcome, StdClock};
pub use config::{
    Band, Bandwidth, CodingRate, ConfigError, GatewayConfig, HeaderMode, ModePreset, PowerLevel,
    SpreadingFactor,
};
pub use csma::{
    carrier_sense, CadTiming, CarrierSenseConfig, ChannelProbe, ChannelState, CsmaError,
    SenseReport,
};
pub use duty_cycle::ToaBudget;
pub use packet::{
    decode_snr, AckFrame, AckMismatch, FrameError, FrameLayout, Packet, PacketType,
    ReceptionStatus, ACK_LENGTH, BROADCAST_0, DEFAULT_NET_KEY, MAX_PAYLOAD, MAX_TIMEOUT, MAX_WAIT,
};
pub use radio::{RadioError, Sx127x};
pub use settings::{ocp_current_ma, packet_rssi, Modem, RadioSettings, SignalQuality};
pub use sim::{SimAir, SimFrame, SimRadio};
pub use transport::{BusError, RegisterBus, SpiBus};
