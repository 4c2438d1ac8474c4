//! Lockwire daemon — WireGuard tunnel bring-up with an iptables killswitch
//!
//! Bootstrap order: read environment configuration, create the lock file,
//! optionally sync descriptors from the relay control plane, pick one
//! descriptor at random, then hand everything to the orchestrator. Any fatal
//! error removes the lock file and exits non-zero; a supervisor restarting
//! the process is the retry mechanism.

use clap::Parser;
use tracing::{error, info, warn};

use lockwire::config::{self, Config};
use lockwire::descriptor::PeerDescriptor;
use lockwire::device::WgDevice;
use lockwire::error::{Error, Result};
use lockwire::firewall::FirewallGuard;
use lockwire::monitor::{Monitor, PROBE_INTERVAL};
use lockwire::orchestrator::{self, Orchestrator};
use lockwire::relay::RelayApi;
use lockwire::routes::RouteManager;

const LOCK_NAME: &str = "lockwire";
const TUNNEL_MTU: u16 = 1420;

#[derive(Parser)]
#[command(
    name = "lockwire",
    version,
    about = "WireGuard tunnel bring-up with an iptables killswitch"
)]
struct Cli {
    /// Tunnel interface name
    #[arg(long, default_value = "wg0")]
    interface: String,

    /// Physical uplink interface
    #[arg(long, default_value = "eth0")]
    uplink: String,

    /// Local WireGuard listen port
    #[arg(long, default_value_t = 51820)]
    listen_port: u16,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let config = Config::from_env();
    orchestrator::set_lock_file(LOCK_NAME, true);

    if let Err(e) = run(&cli, &config) {
        error!("Fatal: {}", e);
        orchestrator::set_lock_file(LOCK_NAME, false);
        std::process::exit(1);
    }
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    if config.disable_killswitch {
        warn!("Kill switch disabled — traffic may leave outside the tunnel");
    }

    if config.relay_account.is_empty() {
        info!("No relay account provided, skipping control-plane sync");
    } else {
        let api = RelayApi::new(&config.relay_account);
        match api.sync_descriptors(config) {
            Ok(created) => info!("Control-plane sync done, {} descriptor(s) created", created),
            Err(e) => warn!("Control-plane sync failed, using existing descriptors: {}", e),
        }
    }

    let path = config::pick_random_descriptor(&config.descriptor_dir)?.ok_or_else(|| {
        Error::Config(format!(
            "no descriptor files found in {:?}",
            config.descriptor_dir
        ))
    })?;
    let descriptor = PeerDescriptor::load(&path)?;

    let firewall = FirewallGuard::new(&cli.interface);
    let device = WgDevice::new(&cli.interface, TUNNEL_MTU);
    let routes = RouteManager::new(&cli.interface, &cli.uplink);
    let mut orchestrator = Orchestrator::new(
        firewall,
        device,
        routes,
        !config.disable_killswitch,
        cli.listen_port,
    );
    orchestrator.up(&descriptor)?;

    let monitor = Monitor::new(PROBE_INTERVAL)?;
    orchestrator.watch(&monitor)
}
