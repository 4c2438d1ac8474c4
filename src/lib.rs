//! Lockwire — WireGuard tunnel bring-up with an iptables killswitch
//!
//! Lockwire establishes an encrypted point-to-point tunnel to a VPN relay and
//! enforces that no traffic leaves the host outside that tunnel. Bring-up is a
//! strict sequence: the outbound firewall goes default-deny before the tunnel
//! interface exists, the relay's real address is allow-listed so the handshake
//! can reach it, then the device is created and configured, split default
//! routes force general egress through the tunnel, and a perpetual probe
//! reports the observed public address.
//!
//! The daemon is thread-based: a single startup thread runs the bring-up
//! state machine, then the control-socket accept loop and the connectivity
//! monitor run until process exit.

pub mod config;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod firewall;
pub mod keys;
pub mod monitor;
pub mod orchestrator;
pub mod relay;
pub mod routes;

pub use error::{Error, Result};
