//! Gateway demo on the simulated air.
//!
//! Runs the gateway loop against a simulated SX1276 while a sensor node on
//! a second thread sends acknowledged readings. Uplinks are printed as
//! `src,SNR,RSSI,payload` lines on stdout.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quark-gw
//! cargo run --bin quark-gw --no-default-features --features band-868
//! ```

use log::{error, info, warn};
use quark_gw::lora::{SimAir, SimRadio, StdClock, MAX_TIMEOUT};
use quark_gw::{GatewayConfig, GatewayLink, Sx127x};
use std::thread;
use std::time::Duration;

const GATEWAY_ADDRESS: u8 = 1;
const SENSOR_ADDRESS: u8 = 6;
const SENSOR_PERIOD: Duration = Duration::from_secs(10);

fn run_sensor(sim: SimRadio, config: GatewayConfig) {
    let mut radio = Sx127x::new(sim, StdClock::new());
    radio.set_settle_ms(config.settle_ms);
    let setup = radio
        .init()
        .and_then(|_| radio.set_channel(config.effective_channel()))
        .and_then(|_| radio.set_mode(config.mode))
        .and_then(|_| radio.set_node_address(SENSOR_ADDRESS));
    if let Err(e) = setup {
        error!("sensor setup failed: {}", e);
        return;
    }

    let mut reading = 0u32;
    loop {
        let payload = format!("\\!TC/{}.{}", 20 + reading % 5, reading % 10);
        match radio.send_packet_timeout_ack(GATEWAY_ADDRESS, payload.as_bytes(), MAX_TIMEOUT) {
            Ok(_) => info!("sensor: reading {} acknowledged", reading),
            Err(e) => warn!("sensor: reading {} not acknowledged: {}", reading, e),
        }
        reading += 1;
        thread::sleep(SENSOR_PERIOD);
    }
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== LoRa gateway starting ===");

    let config = GatewayConfig {
        node_address: GATEWAY_ADDRESS,
        ..Default::default()
    };

    let air = SimAir::new();
    let gateway_radio = air.sx1276();
    let sensor_radio = air.sx1276();

    let radio = Sx127x::new(gateway_radio, StdClock::new());
    let mut gateway = match GatewayLink::new(radio, config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("invalid gateway configuration: {}", e);
            std::process::exit(1);
        }
    };

    match gateway.setup() {
        Ok(board) => info!("radio detected: {:?}", board),
        Err(e) => {
            error!("radio setup failed: {}", e);
            std::process::exit(1);
        }
    }

    let sensor_config = gateway.config().clone();
    thread::spawn(move || run_sensor(sensor_radio, sensor_config));

    info!("Entering receive loop (Ctrl+C to exit)...");
    loop {
        match gateway.poll() {
            Ok(Some(uplink)) => println!("{}", uplink),
            Ok(None) => {}
            Err(e) => {
                error!("radio reset failed: {}, retrying", e);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}
