//! tether-core — wire packet format, envelope framing and configuration.
//! Every other Tether crate depends on this one.

pub mod config;
pub mod envelope;
pub mod wire;

pub use config::TetherConfig;
pub use wire::{MessageId, Packet, PacketKind, WireError};
