#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Runtime for a bus of PROPAR instruments: one driver, gate and poller per
//! serial port, a health board keeping flaky addresses from poisoning the
//! rotation, and a registry tying it all together.

pub mod config;
pub mod driver;
pub mod gate;
pub mod health;
pub mod instrument;
pub mod link;
pub mod poller;
pub mod registry;
pub mod scanner;
pub mod support;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testlink;

pub use crate::registry::Manifold;
pub use crate::support::{BusError, BusResult};
