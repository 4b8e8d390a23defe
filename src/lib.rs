//! Aerobridge — LoRa air-quality sensor fleet gateway with Modbus RTU bridging
//!
//! This crate runs on every node of a small fleet of air-quality sensors that
//! talk to each other over a serial-attached LoRa transceiver. Sender nodes
//! periodically transmit one delimited telemetry frame; the single receiver
//! node decodes frames from the whole fleet into a fixed register table and
//! serves that table to a building-automation master as Modbus RTU holding
//! registers over a second serial device.
//!
//! The public modules cover the radio-link protocol engine (transceiver
//! configuration handshake, frame codec), the device registry behind the
//! Modbus bridge, and the provisioning helpers that derive each node's radio
//! address from its hardware identifier.

pub mod audit;
#[doc(hidden)]
pub mod boot;
pub mod bridge;
#[doc(hidden)]
pub mod cli;
pub mod codec;
pub mod config;
pub mod gateway;
pub mod link;
pub mod provision;
pub mod registry;
pub mod sender;
pub mod sensor;
