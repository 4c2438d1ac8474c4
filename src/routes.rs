//! Routing table management
//!
//! Installs the split default route that forces general egress through the
//! tunnel, and the host route that keeps the relay's real address reachable
//! via the physical uplink (traffic to the relay must not try to ride the
//! tunnel it carries).
//!
//! The split installs BOTH halves of the address space (`0.0.0.0/1` and
//! `128.0.0.0/1`); together they shadow the physical default route without
//! replacing it, so no cleanup is needed on exit. Leaving either half out
//! would leave a gap through which traffic egresses unencrypted.

use std::net::Ipv4Addr;
use std::process::Command;

use tracing::{info, warn};

use crate::descriptor::{parse_ipv4_cidr, PeerDescriptor};
use crate::error::{Error, Result};

/// The two complementary half-space ranges routed via the tunnel
pub const SPLIT_RANGES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

/// Routing operations the orchestrator sequences
pub trait RouteTable {
    /// Assign the tunnel address, bring the link up, and install both
    /// half-space routes via the tunnel. Failure is fatal.
    fn install_default_routes(&mut self, descriptor: &PeerDescriptor) -> Result<()>;

    /// Install the host route to the relay's real address via the physical
    /// uplink's gateway. An already-present route is tolerated.
    fn install_endpoint_bypass(&mut self, descriptor: &PeerDescriptor) -> Result<()>;
}

/// Route manager shelling out to ip(8)
pub struct RouteManager {
    tunnel_iface: String,
    physical_iface: String,
}

impl RouteManager {
    pub fn new(tunnel_iface: &str, physical_iface: &str) -> Self {
        Self {
            tunnel_iface: tunnel_iface.to_string(),
            physical_iface: physical_iface.to_string(),
        }
    }

    /// Next-hop gateway of the physical uplink.
    ///
    /// Reads the kernel default route first; only when the uplink has no
    /// default route does this fall back to the first-address-of-subnet
    /// convention (`a.b.c.1`), which is wrong on networks that don't follow
    /// it.
    pub fn resolve_default_gateway(&self) -> Result<Ipv4Addr> {
        let routes = run_ip(&["route", "show", "default"])?;
        if let Some(gateway) = parse_default_route(&routes, &self.physical_iface) {
            info!("Default gateway (kernel route): {}", gateway);
            return Ok(gateway);
        }

        let addrs = run_ip(&["-4", "addr", "show", "dev", &self.physical_iface])?;
        let (addr, _) = parse_interface_address(&addrs).ok_or_else(|| {
            Error::Route(format!(
                "no IPv4 address on {} to derive a gateway from",
                self.physical_iface
            ))
        })?;
        let gateway = heuristic_gateway(addr);
        info!("Default gateway (subnet heuristic): {}", gateway);
        Ok(gateway)
    }
}

impl RouteTable for RouteManager {
    fn install_default_routes(&mut self, descriptor: &PeerDescriptor) -> Result<()> {
        info!(
            "Installing split default routes via {}",
            self.tunnel_iface
        );

        match ip_mutate(&["addr", "add", &descriptor.address, "dev", &self.tunnel_iface])? {
            Outcome::Applied => {}
            Outcome::Duplicate => {
                info!("Address {} already assigned", descriptor.address)
            }
            Outcome::Failed(reason) => {
                return Err(Error::Route(format!(
                    "failed to assign {} to {}: {}",
                    descriptor.address, self.tunnel_iface, reason
                )))
            }
        }

        match ip_mutate(&["link", "set", "dev", &self.tunnel_iface, "up"])? {
            Outcome::Failed(reason) => {
                return Err(Error::Route(format!(
                    "failed to bring up {}: {}",
                    self.tunnel_iface, reason
                )))
            }
            _ => {}
        }

        for range in SPLIT_RANGES {
            match ip_mutate(&["route", "add", range, "dev", &self.tunnel_iface])? {
                Outcome::Applied => {}
                Outcome::Duplicate => info!("Route {} already present", range),
                Outcome::Failed(reason) => {
                    return Err(Error::Route(format!(
                        "failed to add route {} via {}: {}",
                        range, self.tunnel_iface, reason
                    )))
                }
            }
        }
        Ok(())
    }

    fn install_endpoint_bypass(&mut self, descriptor: &PeerDescriptor) -> Result<()> {
        let gateway = self.resolve_default_gateway()?;
        let host_route = format!("{}/32", descriptor.endpoint_address);
        info!(
            "Installing endpoint bypass: {} via {} dev {}",
            host_route, gateway, self.physical_iface
        );

        match ip_mutate(&[
            "route",
            "add",
            &host_route,
            "via",
            &gateway.to_string(),
            "dev",
            &self.physical_iface,
        ])? {
            Outcome::Applied => Ok(()),
            Outcome::Duplicate => {
                warn!("Endpoint bypass route already exists: {}", host_route);
                Ok(())
            }
            Outcome::Failed(reason) => Err(Error::Route(format!(
                "failed to add endpoint bypass {}: {}",
                host_route, reason
            ))),
        }
    }
}

/// What happened to one ip(8) mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Duplicate,
    Failed(String),
}

/// Classify an ip(8) exit: an already-present object is not a failure
pub fn classify(success: bool, stderr: &str) -> Outcome {
    if success {
        Outcome::Applied
    } else if stderr.contains("File exists") {
        Outcome::Duplicate
    } else {
        Outcome::Failed(stderr.trim().to_string())
    }
}

fn ip_mutate(args: &[&str]) -> Result<Outcome> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| Error::Route(format!("failed to run ip: {}", e)))?;
    Ok(classify(
        output.status.success(),
        &String::from_utf8_lossy(&output.stderr),
    ))
}

fn run_ip(args: &[&str]) -> Result<String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| Error::Route(format!("failed to run ip: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Route(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parse `ip route show default` output, preferring a route on the given
/// interface over any other default route.
pub fn parse_default_route(output: &str, iface: &str) -> Option<Ipv4Addr> {
    let mut fallback = None;
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            continue;
        }
        let via = tokens
            .windows(2)
            .find(|w| w[0] == "via")
            .and_then(|w| w[1].parse::<Ipv4Addr>().ok());
        let dev = tokens.windows(2).find(|w| w[0] == "dev").map(|w| w[1]);
        match (via, dev) {
            (Some(gw), Some(d)) if d == iface => return Some(gw),
            (Some(gw), _) if fallback.is_none() => fallback = Some(gw),
            _ => {}
        }
    }
    fallback
}

/// Pull the first `inet a.b.c.d/nn` out of `ip -4 addr show` output
pub fn parse_interface_address(output: &str) -> Option<(Ipv4Addr, u8)> {
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if let Some(w) = tokens.windows(2).find(|w| w[0] == "inet") {
            if let Ok(parsed) = parse_ipv4_cidr(w[1]) {
                return Some(parsed);
            }
        }
    }
    None
}

/// Conventional first-address-of-subnet gateway (`a.b.c.1`)
pub fn heuristic_gateway(addr: Ipv4Addr) -> Ipv4Addr {
    let octets = addr.octets();
    Ipv4Addr::new(octets[0], octets[1], octets[2], 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route_prefers_interface() {
        let output = "\
default via 10.0.0.1 dev wlan0 proto dhcp metric 600
default via 192.168.1.1 dev eth0 proto dhcp metric 100
";
        assert_eq!(
            parse_default_route(output, "eth0"),
            Some("192.168.1.1".parse().unwrap())
        );
        assert_eq!(
            parse_default_route(output, "wlan0"),
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_default_route_falls_back_to_any_default() {
        let output = "default via 10.0.0.1 dev wlan0\n";
        assert_eq!(
            parse_default_route(output, "eth0"),
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_default_route_empty() {
        assert_eq!(parse_default_route("", "eth0"), None);
        assert_eq!(parse_default_route("10.1.0.0/16 dev eth0\n", "eth0"), None);
    }

    #[test]
    fn test_parse_interface_address() {
        let output = "\
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP group default qlen 1000
    inet 192.168.1.57/24 brd 192.168.1.255 scope global dynamic eth0
       valid_lft 85907sec preferred_lft 85907sec
";
        assert_eq!(
            parse_interface_address(output),
            Some(("192.168.1.57".parse().unwrap(), 24))
        );
        assert_eq!(parse_interface_address("no addresses here"), None);
    }

    #[test]
    fn test_heuristic_gateway() {
        assert_eq!(
            heuristic_gateway("192.168.1.57".parse().unwrap()),
            "192.168.1.1".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_classify_duplicate_is_not_failure() {
        assert_eq!(classify(true, ""), Outcome::Applied);
        assert_eq!(
            classify(false, "RTNETLINK answers: File exists"),
            Outcome::Duplicate
        );
        assert!(matches!(
            classify(false, "RTNETLINK answers: Operation not permitted"),
            Outcome::Failed(_)
        ));
    }

    #[test]
    fn test_split_ranges_cover_full_address_space() {
        // 0.0.0.0/1 plus 128.0.0.0/1 is every unicast destination; a single
        // half would leave the other half egressing in the clear.
        let parsed: Vec<_> = SPLIT_RANGES
            .iter()
            .map(|r| parse_ipv4_cidr(r).unwrap())
            .collect();
        assert_eq!(parsed[0], ("0.0.0.0".parse().unwrap(), 1));
        assert_eq!(parsed[1], ("128.0.0.0".parse().unwrap(), 1));
    }
}
