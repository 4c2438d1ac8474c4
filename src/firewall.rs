//! Outbound firewall killswitch
//!
//! Owns the host's `filter/OUTPUT` chain. `initialize` flushes the chain and
//! flips the default policy to DROP, allow-listing the tunnel interface and
//! loopback in the same breath, so from that point nothing leaves the host
//! except through the tunnel or an explicit allow rule.
//!
//! The guard keeps an in-memory mirror of the chain. Because `initialize`
//! starts from a flushed chain, the mirror stays authoritative for the
//! process lifetime, which is what makes `allow` and `toggle_dns` idempotent
//! without querying the kernel.

use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const CHAIN: &str = "OUTPUT";

/// Firewall operations the orchestrator sequences
pub trait Firewall {
    /// Flush the outbound chain, default-deny it, and allow-list the tunnel
    /// interface and loopback. Must complete before the tunnel exists.
    fn initialize(&mut self) -> Result<()>;

    /// Append an allow rule for a specific destination address. Idempotent.
    fn allow(&mut self, destination: &str) -> Result<()>;

    /// Add or remove the outbound udp/53 accept rule. Removing an absent
    /// rule is not an error.
    fn toggle_dns(&mut self, enabled: bool) -> Result<()>;
}

/// Default action for the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Drop,
}

/// One rule in the outbound chain, stored as its iptables argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule(Vec<String>);

impl Rule {
    fn new(args: &[&str]) -> Self {
        Self(args.iter().map(|s| s.to_string()).collect())
    }

    /// Accept everything leaving through an interface
    pub fn accept_out_interface(iface: &str) -> Self {
        Self::new(&["-o", iface, "-j", "ACCEPT"])
    }

    /// Accept everything addressed to a destination
    pub fn accept_destination(dest: &str) -> Self {
        Self::new(&["-d", dest, "-j", "ACCEPT"])
    }

    /// Accept outbound DNS over UDP
    pub fn accept_dns() -> Self {
        Self::new(&["-p", "udp", "-m", "udp", "--dport", "53", "-j", "ACCEPT"])
    }

    fn args(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

/// Ordered rule list plus default action, mirroring the kernel chain
#[derive(Debug)]
pub struct RuleSet {
    policy: Policy,
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            policy: Policy::Accept,
            rules: Vec::new(),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rules.contains(rule)
    }

    /// Append a rule unless an identical one is already present.
    /// Returns false on the duplicate no-op.
    pub fn insert(&mut self, rule: Rule) -> bool {
        if self.contains(&rule) {
            return false;
        }
        self.rules.push(rule);
        true
    }

    /// Remove a rule. Returns false when no such rule exists.
    pub fn remove(&mut self, rule: &Rule) -> bool {
        match self.rules.iter().position(|r| r == rule) {
            Some(idx) => {
                self.rules.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Killswitch over the host iptables OUTPUT chain
pub struct FirewallGuard {
    tunnel_iface: String,
    chain: RuleSet,
}

impl FirewallGuard {
    pub fn new(tunnel_iface: &str) -> Self {
        Self {
            tunnel_iface: tunnel_iface.to_string(),
            chain: RuleSet::new(),
        }
    }

    fn append_unique(&mut self, rule: Rule) -> Result<()> {
        if self.chain.contains(&rule) {
            debug!("Rule already present, skipping: {:?}", rule);
            return Ok(());
        }
        let mut args = vec!["-A", CHAIN];
        args.extend(rule.args());
        run_iptables(&args)?;
        self.chain.insert(rule);
        Ok(())
    }
}

impl Firewall for FirewallGuard {
    fn initialize(&mut self) -> Result<()> {
        info!("Initializing outbound firewall (default-deny)");
        run_iptables(&["-F", CHAIN])?;
        self.chain.clear();
        run_iptables(&["-P", CHAIN, "DROP"])?;
        self.chain.set_policy(Policy::Drop);
        let tunnel_rule = Rule::accept_out_interface(&self.tunnel_iface);
        self.append_unique(tunnel_rule)?;
        self.append_unique(Rule::accept_out_interface("lo"))?;
        Ok(())
    }

    fn allow(&mut self, destination: &str) -> Result<()> {
        info!("Allowing destination: {}", destination);
        self.append_unique(Rule::accept_destination(destination))
    }

    fn toggle_dns(&mut self, enabled: bool) -> Result<()> {
        info!("Toggling outbound DNS to: {}", enabled);
        let rule = Rule::accept_dns();
        if enabled {
            self.append_unique(rule)
        } else {
            if !self.chain.contains(&rule) {
                warn!("DNS rule not present, nothing to remove");
                return Ok(());
            }
            let mut args = vec!["-D", CHAIN];
            args.extend(rule.args());
            run_iptables(&args)?;
            self.chain.remove(&rule);
            Ok(())
        }
    }
}

fn run_iptables(args: &[&str]) -> Result<()> {
    let output = Command::new("iptables")
        .args(["-t", "filter"])
        .args(args)
        .output()
        .map_err(|e| Error::Firewall(format!("failed to run iptables: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Firewall(format!(
            "iptables {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
