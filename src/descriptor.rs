//! Peer descriptor files
//!
//! A descriptor is the line-oriented `Key=Value` file describing one tunnel
//! session: local private key and tunnel address, the relay's public key,
//! real endpoint, and the ranges to route through the tunnel. Where a field
//! carries a comma-separated list only the first entry is honored.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};

/// Immutable parameters for one tunnel session
#[derive(Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Local private key, base64 (never logged)
    pub private_key: String,
    /// Relay's public key, base64
    pub public_key: String,
    /// Relay's real network address
    pub endpoint_address: String,
    /// Relay's listen port
    pub endpoint_port: u16,
    /// CIDR ranges to route through the tunnel
    pub allowed_ips: Vec<String>,
    /// This host's address inside the tunnel, CIDR form
    pub address: String,
}

impl fmt::Debug for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerDescriptor")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("endpoint_address", &self.endpoint_address)
            .field("endpoint_port", &self.endpoint_port)
            .field("allowed_ips", &self.allowed_ips)
            .field("address", &self.address)
            .finish()
    }
}

impl PeerDescriptor {
    /// Parse a descriptor from its on-disk text form.
    ///
    /// Unknown keys are ignored. A malformed `Endpoint` (missing or invalid
    /// port) is a hard error; so is any required field left unset.
    pub fn parse(text: &str) -> Result<Self> {
        let mut private_key = String::new();
        let mut public_key = String::new();
        let mut endpoint_address = String::new();
        let mut endpoint_port: u16 = 0;
        let mut allowed_ips: Vec<String> = Vec::new();
        let mut address = String::new();

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "PrivateKey" => private_key = value.to_string(),
                "PublicKey" => public_key = value.to_string(),
                "AllowedIPs" => {
                    allowed_ips = vec![first_entry(value).to_string()];
                }
                "Endpoint" => {
                    let Some((host, port)) = value.rsplit_once(':') else {
                        return Err(Error::Descriptor(format!(
                            "malformed Endpoint '{}': missing port",
                            value
                        )));
                    };
                    endpoint_address = host.to_string();
                    endpoint_port = port.parse().map_err(|_| {
                        Error::Descriptor(format!("malformed Endpoint port '{}'", port))
                    })?;
                }
                "Address" => address = first_entry(value).to_string(),
                _ => {}
            }
        }

        let descriptor = Self {
            private_key,
            public_key,
            endpoint_address,
            endpoint_port,
            allowed_ips,
            address,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<()> {
        if self.private_key.is_empty() {
            return Err(Error::Descriptor("missing PrivateKey".into()));
        }
        if self.public_key.is_empty() {
            return Err(Error::Descriptor("missing PublicKey".into()));
        }
        if self.endpoint_address.is_empty() {
            return Err(Error::Descriptor("missing Endpoint".into()));
        }
        if self.endpoint_port == 0 {
            return Err(Error::Descriptor("Endpoint port out of range".into()));
        }
        if self.allowed_ips.is_empty() {
            return Err(Error::Descriptor("missing AllowedIPs".into()));
        }
        if self.address.is_empty() {
            return Err(Error::Descriptor("missing Address".into()));
        }
        Ok(())
    }

    /// Read and parse a descriptor file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Reading tunnel descriptor from {:?}", path);
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Render the descriptor in its fixed-order on-disk form
    pub fn serialize(&self) -> String {
        format!(
            "[Interface]\nPrivateKey={}\nAddress={}\n[Peer]\nPublicKey={}\nAllowedIPs={}\nEndpoint={}:{}\n",
            self.private_key,
            self.address,
            self.public_key,
            self.allowed_ips.join(","),
            self.endpoint_address,
            self.endpoint_port,
        )
    }

    /// Write the descriptor to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        info!("Saving tunnel descriptor to {:?}", path);
        std::fs::write(path, self.serialize())?;
        Ok(())
    }
}

fn first_entry(csv: &str) -> &str {
    csv.split(',').next().unwrap_or("").trim()
}

/// Parse an IPv4 CIDR range like `10.64.0.2/32`
pub fn parse_ipv4_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| Error::Descriptor(format!("malformed CIDR '{}'", s)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Descriptor(format!("malformed CIDR address '{}'", s)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::Descriptor(format!("malformed CIDR prefix '{}'", s)))?;
    if prefix > 32 {
        return Err(Error::Descriptor(format!("CIDR prefix out of range '{}'", s)));
    }
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PeerDescriptor {
        PeerDescriptor {
            private_key: "A".into(),
            public_key: "B".into(),
            endpoint_address: "203.0.113.9".into(),
            endpoint_port: 51820,
            allowed_ips: vec!["0.0.0.0/0".into()],
            address: "10.64.0.2/32".into(),
        }
    }

    #[test]
    fn test_parse_basic() {
        let text = "\
[Interface]
PrivateKey = A
Address = 10.64.0.2/32
[Peer]
PublicKey = B
AllowedIPs = 0.0.0.0/0, ::/0
Endpoint = 203.0.113.9:51820
";
        let d = PeerDescriptor::parse(text).unwrap();
        assert_eq!(d, sample());
    }

    #[test]
    fn test_round_trip() {
        let d = sample();
        let parsed = PeerDescriptor::parse(&d.serialize()).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_first_csv_entry_wins() {
        let text = "PrivateKey=A\nPublicKey=B\nEndpoint=1.2.3.4:51820\nAllowedIPs=10.0.0.0/8,192.168.0.0/16\nAddress=10.64.0.2/32,fc00::2/128\n";
        let d = PeerDescriptor::parse(text).unwrap();
        assert_eq!(d.allowed_ips, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(d.address, "10.64.0.2/32");
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let text = "PrivateKey=A\nPublicKey=B\nEndpoint=1.2.3.4:51820\nAllowedIPs=0.0.0.0/0\nAddress=10.64.0.2/32\nDNS=100.64.0.4\nPersistentKeepalive=25\n";
        assert!(PeerDescriptor::parse(text).is_ok());
    }

    #[test]
    fn test_value_may_contain_equals() {
        let text = "PrivateKey=AbC=\nPublicKey=B=\nEndpoint=1.2.3.4:51820\nAllowedIPs=0.0.0.0/0\nAddress=10.64.0.2/32\n";
        let d = PeerDescriptor::parse(text).unwrap();
        assert_eq!(d.private_key, "AbC=");
        assert_eq!(d.public_key, "B=");
    }

    #[test]
    fn test_malformed_endpoint_is_fatal() {
        let text = "PrivateKey=A\nPublicKey=B\nEndpoint=notanaddress\nAllowedIPs=0.0.0.0/0\nAddress=10.64.0.2/32\n";
        let err = PeerDescriptor::parse(text).unwrap_err();
        assert!(matches!(err, Error::Descriptor(_)));
    }

    #[test]
    fn test_endpoint_port_must_be_numeric() {
        let text = "PrivateKey=A\nPublicKey=B\nEndpoint=1.2.3.4:http\nAllowedIPs=0.0.0.0/0\nAddress=10.64.0.2/32\n";
        assert!(PeerDescriptor::parse(text).is_err());
    }

    #[test]
    fn test_missing_allowed_ips_is_fatal() {
        let text = "PrivateKey=A\nPublicKey=B\nEndpoint=1.2.3.4:51820\nAddress=10.64.0.2/32\n";
        assert!(PeerDescriptor::parse(text).is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let rendered = format!("{:?}", sample());
        assert!(!rendered.contains("\"A\""));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_parse_ipv4_cidr() {
        assert_eq!(
            parse_ipv4_cidr("10.64.0.2/32").unwrap(),
            ("10.64.0.2".parse().unwrap(), 32)
        );
        assert!(parse_ipv4_cidr("10.64.0.2").is_err());
        assert!(parse_ipv4_cidr("10.64.0.2/33").is_err());
        assert!(parse_ipv4_cidr("banana/24").is_err());
    }
}
