//! Tunnel lifecycle orchestration
//!
//! Bring-up is a linear state machine with no cycles:
//!
//! `Init -> FirewallInitialized -> DeviceCreated -> DeviceConfigured ->
//! RoutesInstalled -> Monitoring`
//!
//! The order is load-bearing. Default-deny must engage before the tunnel
//! interface exists, and the relay's real endpoint must be allow-listed
//! before anything tries to reach it — otherwise the tunnel's own handshake
//! packets are dropped by the killswitch. Routes come last: installing them
//! against a half-configured device would blackhole the host.
//!
//! No step is retried here; a supervisor restarting the process is the retry
//! mechanism. The lock file tells that supervisor whether the previous run
//! died cleanly.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::descriptor::PeerDescriptor;
use crate::device::Tunnel;
use crate::error::Result;
use crate::firewall::Firewall;
use crate::monitor::Monitor;
use crate::routes::RouteTable;

/// Named bring-up states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    FirewallInitialized,
    DeviceCreated,
    DeviceConfigured,
    RoutesInstalled,
    Monitoring,
}

/// Sequences firewall, device, and routing into one consistent state
pub struct Orchestrator<F, T, R> {
    firewall: F,
    tunnel: T,
    routes: R,
    killswitch: bool,
    listen_port: u16,
    phase: Phase,
}

impl<F: Firewall, T: Tunnel, R: RouteTable> Orchestrator<F, T, R> {
    pub fn new(firewall: F, tunnel: T, routes: R, killswitch: bool, listen_port: u16) -> Self {
        Self {
            firewall,
            tunnel,
            routes,
            killswitch,
            listen_port,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive the state machine from `Init` to `RoutesInstalled`.
    ///
    /// Any error aborts the whole bring-up; the caller owns lock-file
    /// cleanup and process exit.
    pub fn up(&mut self, descriptor: &PeerDescriptor) -> Result<()> {
        info!(
            "Bringing up tunnel to {}:{}",
            descriptor.endpoint_address, descriptor.endpoint_port
        );

        if self.killswitch {
            self.firewall.initialize()?;
            self.firewall.allow(&descriptor.endpoint_address)?;
        } else {
            info!("Killswitch disabled, leaving firewall untouched");
        }
        self.advance(Phase::FirewallInitialized);

        self.tunnel.create()?;
        self.advance(Phase::DeviceCreated);

        self.tunnel.configure(descriptor, self.listen_port)?;
        self.advance(Phase::DeviceConfigured);

        // The tunnel can carry traffic without its control socket; a failed
        // listener is degraded operation, not a failed bring-up.
        if let Err(e) = self.tunnel.start_control_listener() {
            warn!("Control socket unavailable, running degraded: {}", e);
        }

        self.routes.install_endpoint_bypass(descriptor)?;
        self.routes.install_default_routes(descriptor)?;
        self.advance(Phase::RoutesInstalled);

        Ok(())
    }

    /// Enter the terminal `Monitoring` state and never return
    pub fn watch(&mut self, monitor: &Monitor) -> ! {
        self.advance(Phase::Monitoring);
        monitor.run_forever()
    }

    fn advance(&mut self, next: Phase) {
        debug!("Phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }
}

/// Lock file marking an active bring-up, at `/tmp/<name>.lock`
pub fn lock_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{}.lock", name))
}

/// Create or remove the lock file. Best-effort: the file is a marker for
/// external supervisors, never a correctness dependency.
pub fn set_lock_file(name: &str, active: bool) {
    let path = lock_path(name);
    if active {
        info!("Creating lock file {:?}", path);
        if let Err(e) = std::fs::write(&path, "") {
            warn!("Failed to create lock file {:?}: {}", path, e);
        }
    } else {
        info!("Removing lock file {:?}", path);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove lock file {:?}: {}", path, e);
            }
        }
    }
}
