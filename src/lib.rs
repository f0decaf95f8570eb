//! LoRa gateway link layer for SX1272/SX1276 transceivers.
//!
//! The driver and the gateway loop are platform-independent and can be
//! tested on the host against the simulated transceiver in [`lora`].

pub mod gateway;
pub mod lora;

// Re-export commonly used items
pub use gateway::{GatewayLink, Uplink};
pub use lora::{
    airtime_ms, Band, Board, GatewayConfig, ModePreset, Packet, PowerLevel, RadioError, Sx127x,
    ToaBudget,
};
