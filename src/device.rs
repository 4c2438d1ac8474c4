//! Tunnel device lifecycle
//!
//! Creates the virtual network interface through the Linux TUN driver and
//! holds the cryptographic session parameters the control socket serves.
//! Configuration is full-replace: applying a descriptor swaps the whole peer
//! set, so a half-applied session is never observable.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use crate::control;
use crate::descriptor::{parse_ipv4_cidr, PeerDescriptor};
use crate::error::{Error, Result};
use crate::keys;

// TUNSETIFF = _IOW('T', 202, c_int) on x86/ARM
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Tunnel operations the orchestrator sequences
pub trait Tunnel {
    /// Allocate the virtual interface at the OS level
    fn create(&mut self) -> Result<()>;

    /// Apply the cryptographic session from a descriptor, replacing any
    /// previously configured peer set wholesale
    fn configure(&mut self, descriptor: &PeerDescriptor, listen_port: u16) -> Result<()>;

    /// Start the control-socket accept loop for device introspection
    fn start_control_listener(&mut self) -> Result<()>;
}

/// One configured peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub public_key: [u8; keys::KEY_LEN],
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<(Ipv4Addr, u8)>,
}

/// Live session parameters, shared with the control socket
#[derive(Default)]
pub struct SessionState {
    pub private_key: Option<[u8; keys::KEY_LEN]>,
    pub listen_port: u16,
    pub peer: Option<PeerSession>,
}

/// The tunnel device: TUN interface plus session state
pub struct WgDevice {
    name: String,
    mtu: u16,
    tun: Option<TunDevice>,
    state: Arc<Mutex<SessionState>>,
}

impl WgDevice {
    pub fn new(name: &str, mtu: u16) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            tun: None,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    /// Shared handle to the session state
    pub fn session(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }

    /// Interface name, as the kernel reports it once the device exists
    pub fn interface(&self) -> &str {
        self.tun.as_ref().map(|t| t.name()).unwrap_or(&self.name)
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state lock poisoned")
    }
}

impl Tunnel for WgDevice {
    fn create(&mut self) -> Result<()> {
        info!("Creating tunnel interface {} (mtu {})", self.name, self.mtu);
        let tun = TunDevice::create(&self.name)?;
        set_mtu(tun.name(), self.mtu)?;
        self.tun = Some(tun);
        Ok(())
    }

    fn configure(&mut self, descriptor: &PeerDescriptor, listen_port: u16) -> Result<()> {
        info!("Configuring device {}", self.name);

        // Validate everything before touching shared state, so a bad
        // descriptor leaves the previous session intact.
        let secret = keys::parse_private_key(&descriptor.private_key)?;
        let public = keys::parse_public_key(&descriptor.public_key)?;
        let endpoint_ip: Ipv4Addr = descriptor.endpoint_address.parse().map_err(|_| {
            Error::Device(format!(
                "malformed endpoint address '{}'",
                descriptor.endpoint_address
            ))
        })?;
        let endpoint = SocketAddr::from((endpoint_ip, descriptor.endpoint_port));
        let mut allowed_ips = Vec::with_capacity(descriptor.allowed_ips.len());
        for range in &descriptor.allowed_ips {
            allowed_ips.push(parse_ipv4_cidr(range)?);
        }

        let mut state = self.lock_state();
        *state = SessionState {
            private_key: Some(secret.to_bytes()),
            listen_port,
            peer: Some(PeerSession {
                public_key: *public.as_bytes(),
                endpoint,
                allowed_ips,
            }),
        };
        info!(
            "Session configured with peer {} at {}",
            descriptor.public_key, endpoint
        );
        Ok(())
    }

    fn start_control_listener(&mut self) -> Result<()> {
        // The accept loop runs detached until process exit; a failed accept
        // stops it with a warning, which is degraded operation, not an error.
        let _accept_loop = control::spawn_listener(&self.name, self.state.clone())?;
        Ok(())
    }
}

fn set_mtu(iface: &str, mtu: u16) -> Result<()> {
    let output = Command::new("ip")
        .args(["link", "set", "dev", iface, "mtu", &mtu.to_string()])
        .output()
        .map_err(|e| Error::Device(format!("failed to run ip: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Device(format!(
            "failed to set mtu on {}: {}",
            iface,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// A Linux TUN device
struct TunDevice {
    fd: RawFd,
    name: String,
}

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl TunDevice {
    /// Open /dev/net/tun and bind the named interface to it
    fn create(name: &str) -> Result<Self> {
        let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::Device(format!(
                "failed to open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Device(format!(
                "ioctl TUNSETIFF failed for {}: {} (interface in use, or not running as root?)",
                name, err
            )));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();
        Ok(Self {
            fd,
            name: actual_name,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn descriptor() -> PeerDescriptor {
        let local = KeyPair::generate();
        let relay = KeyPair::generate();
        PeerDescriptor {
            private_key: local.private_key_base64(),
            public_key: relay.public_key_base64(),
            endpoint_address: "203.0.113.9".into(),
            endpoint_port: 51820,
            allowed_ips: vec!["0.0.0.0/0".into()],
            address: "10.64.0.2/32".into(),
        }
    }

    #[test]
    fn test_configure_sets_exactly_one_peer() {
        let mut dev = WgDevice::new("wg-test", 1420);
        let desc = descriptor();
        dev.configure(&desc, 51820).unwrap();

        let state = dev.session();
        let state = state.lock().unwrap();
        assert_eq!(state.listen_port, 51820);
        let peer = state.peer.as_ref().unwrap();
        assert_eq!(
            peer.public_key,
            *crate::keys::parse_public_key(&desc.public_key)
                .unwrap()
                .as_bytes()
        );
        assert_eq!(peer.endpoint, "203.0.113.9:51820".parse().unwrap());
        assert_eq!(peer.allowed_ips, vec![("0.0.0.0".parse().unwrap(), 0)]);
    }

    #[test]
    fn test_configure_is_full_replace() {
        let mut dev = WgDevice::new("wg-test", 1420);
        let first = descriptor();
        let second = descriptor();
        dev.configure(&first, 51820).unwrap();
        dev.configure(&second, 51820).unwrap();

        let state = dev.session();
        let state = state.lock().unwrap();
        let peer = state.peer.as_ref().unwrap();
        assert_eq!(
            peer.public_key,
            *crate::keys::parse_public_key(&second.public_key)
                .unwrap()
                .as_bytes()
        );
    }

    #[test]
    fn test_configure_twice_same_descriptor_is_stable() {
        let mut dev = WgDevice::new("wg-test", 1420);
        let desc = descriptor();
        dev.configure(&desc, 51820).unwrap();
        let before = dev.session().lock().unwrap().peer.clone();
        dev.configure(&desc, 51820).unwrap();
        let after = dev.session().lock().unwrap().peer.clone();
        assert_eq!(before, after);
    }

    #[test]
    fn test_bad_key_material_is_fatal_and_leaves_state_untouched() {
        let mut dev = WgDevice::new("wg-test", 1420);
        let good = descriptor();
        dev.configure(&good, 51820).unwrap();

        let mut bad = descriptor();
        bad.private_key = "short".into();
        assert!(dev.configure(&bad, 51820).is_err());

        let state = dev.session();
        let state = state.lock().unwrap();
        assert_eq!(
            state.peer.as_ref().unwrap().public_key,
            *crate::keys::parse_public_key(&good.public_key)
                .unwrap()
                .as_bytes()
        );
    }

    #[test]
    fn test_malformed_endpoint_address_is_fatal() {
        let mut dev = WgDevice::new("wg-test", 1420);
        let mut desc = descriptor();
        desc.endpoint_address = "relay.example.net".into();
        assert!(dev.configure(&desc, 51820).is_err());
    }

    #[test]
    fn test_malformed_allowed_ip_is_fatal() {
        let mut dev = WgDevice::new("wg-test", 1420);
        let mut desc = descriptor();
        desc.allowed_ips = vec!["0.0.0.0".into()];
        assert!(dev.configure(&desc, 51820).is_err());
    }
}
