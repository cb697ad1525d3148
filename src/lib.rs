//! # wan-failover
//!
//! Failover connection manager for a multi-WAN gateway: watches Ethernet,
//! Wi-Fi client and cellular (dual-SIM) uplinks through NetworkManager and
//! ModemManager, and keeps the highest-priority reachable one active.

#[macro_use]
extern crate log;

pub mod activation;
pub mod config;
pub mod dbus_iface;
pub mod engine;
pub mod errors;
pub mod mirror;
pub mod model;
pub mod modem_client;
pub mod net_client;
pub mod prober;
pub mod rate_limit;
pub mod timeouts;

pub use errors::FailoverError;

/// Process exit code used when the configuration file is missing, unreadable
/// or fails validation. Matches the well-known code the MQTT mirror and
/// service supervisor key off of.
pub const EXIT_NOT_CONFIGURED: i32 = 6;
