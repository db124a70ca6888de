//! Zaber ASCII protocol: request encoding, reply parsing and an async client
//! for daisy-chained devices sharing one serial line or TCP socket.

pub mod async_client;
pub mod command;
pub mod reply;

pub use async_client::{ExchangeError, ZaberDevice};
pub use command::{Instruction, Request};
pub use reply::{ParseError, Reply, Warnings};

/// Ratio between a `maxspeed` setting and microsteps per second.
pub const SPEED_FACTOR: f64 = 1.6384;

/// Converts engineering units to microsteps.
pub fn to_native(value: f64, steps_per_unit: f64) -> i64 {
    (value * steps_per_unit).round() as i64
}

/// Converts microsteps to engineering units.
pub fn from_native(steps: i64, steps_per_unit: f64) -> f64 {
    steps as f64 / steps_per_unit
}

/// Converts a speed in units per second to a `maxspeed` setting.
pub fn speed_to_native(speed: f64, steps_per_unit: f64) -> u64 {
    (speed * steps_per_unit * SPEED_FACTOR).round().max(0.0) as u64
}
