//! Relay control-plane client
//!
//! Authenticated REST client for the VPN provider: fetches the WireGuard
//! relay roster, registers this host's keypair, and materializes one peer
//! descriptor file per relay in the selected countries. All of this runs
//! before bring-up; the tunnel itself never depends on it.

use std::path::Path;

use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::descriptor::PeerDescriptor;
use crate::error::{Error, Result};
use crate::keys::KeyPair;

/// Production control-plane base URL
pub const DEFAULT_BASE_URL: &str = "https://api.mullvad.net/";

/// Relays listen on the conventional WireGuard port
pub const RELAY_LISTEN_PORT: u16 = 51820;

/// Persisted keypair file inside the descriptor directory
const KEYPAIR_FILE: &str = ".relay.keypair";

/// Keypair persisted across runs, JSON on disk
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    #[serde(rename = "privateKey")]
    pub private_key: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Relay roster as served by the control plane
#[derive(Debug, Deserialize)]
pub struct RelayRoster {
    pub countries: Vec<Country>,
}

#[derive(Debug, Deserialize)]
pub struct Country {
    pub name: String,
    pub code: String,
    pub cities: Vec<City>,
}

#[derive(Debug, Deserialize)]
pub struct City {
    pub name: String,
    pub code: String,
    pub relays: Vec<Relay>,
}

#[derive(Debug, Deserialize)]
pub struct Relay {
    pub hostname: String,
    pub ipv4_addr_in: String,
    pub public_key: String,
}

/// A keypair the control plane knows about, with its assigned tunnel address
#[derive(Debug, Deserialize)]
pub struct RegisteredKey {
    pub id: String,
    pub pubkey: String,
    pub ipv4_address: String,
}

#[derive(Serialize)]
struct AddKey<'a> {
    pubkey: &'a str,
}

/// Authenticated control-plane client
pub struct RelayApi {
    account: String,
    base_url: String,
    client: Client,
}

impl RelayApi {
    pub fn new(account: &str) -> Self {
        Self::with_base_url(account, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(account: &str, base_url: &str) -> Self {
        Self {
            account: account.to_string(),
            base_url: base_url.to_string(),
            client: Client::new(),
        }
    }

    fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .header(AUTHORIZATION, format!("Token {}", self.account))
            .send()?;
        if !response.status().is_success() {
            return Err(Error::ControlPlane(format!(
                "GET {} failed: {}",
                endpoint,
                response.status()
            )));
        }
        Ok(response.json()?)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, endpoint: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .header(AUTHORIZATION, format!("Token {}", self.account))
            .json(body)
            .send()?;
        if !response.status().is_success() {
            return Err(Error::ControlPlane(format!(
                "POST {} failed: {}",
                endpoint,
                response.status()
            )));
        }
        Ok(response.json()?)
    }

    /// Fetch the public WireGuard relay roster
    pub fn fetch_relays(&self) -> Result<RelayRoster> {
        info!("Fetching relay roster");
        self.get("public/relays/wireguard/v1/")
    }

    /// Look the keypair up on the control plane, registering it on 404
    pub fn register_keypair(&self, keypair: &StoredKeypair) -> Result<RegisteredKey> {
        let endpoint = format!("app/v1/wireguard-keys/{}", keypair.public_key);
        let response = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .header(AUTHORIZATION, format!("Token {}", self.account))
            .send()?;

        if response.status().is_success() {
            return Ok(response.json()?);
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(Error::ControlPlane(format!(
                "keypair lookup failed: {}",
                response.status()
            )));
        }

        info!("Registering new keypair with control plane");
        self.post(
            "app/v1/wireguard-keys",
            &AddKey {
                pubkey: &keypair.public_key,
            },
        )
    }

    /// Write one descriptor per relay in the configured countries.
    /// Existing files are left alone. Returns how many were created.
    pub fn sync_descriptors(&self, config: &Config) -> Result<usize> {
        let keypair = ensure_keypair(&config.descriptor_dir)?;
        let key = self.register_keypair(&keypair)?;
        info!("Keypair registered, tunnel address {}", key.ipv4_address);

        let roster = self.fetch_relays()?;
        info!("Got relays for {} countries", roster.countries.len());

        let mut created = 0;
        for country in &roster.countries {
            if !country_selected(&country.name, &country.code, &config.relay_countries) {
                continue;
            }
            for city in &country.cities {
                for relay in &city.relays {
                    let path = config
                        .descriptor_dir
                        .join(format!("relay-{}.conf", relay.hostname));
                    let descriptor = PeerDescriptor {
                        private_key: keypair.private_key.clone(),
                        public_key: relay.public_key.clone(),
                        endpoint_address: relay.ipv4_addr_in.clone(),
                        endpoint_port: RELAY_LISTEN_PORT,
                        allowed_ips: vec!["0.0.0.0/0".into()],
                        address: key.ipv4_address.clone(),
                    };
                    if write_descriptor_if_absent(&path, &descriptor)? {
                        info!("Created descriptor for {}", relay.hostname);
                        created += 1;
                    }
                }
            }
        }
        Ok(created)
    }
}

/// Load the persisted keypair, generating and saving one on first run
pub fn ensure_keypair(dir: &Path) -> Result<StoredKeypair> {
    let path = dir.join(KEYPAIR_FILE);
    if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        return Ok(serde_json::from_str(&text)?);
    }

    info!("Generating new control-plane keypair");
    let generated = KeyPair::generate();
    let stored = StoredKeypair {
        private_key: generated.private_key_base64(),
        public_key: generated.public_key_base64(),
    };
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, serde_json::to_string_pretty(&stored)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(stored)
}

/// Write a descriptor unless the file already exists.
/// Returns true when a file was created.
pub fn write_descriptor_if_absent(path: &Path, descriptor: &PeerDescriptor) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    descriptor.save(path)?;
    Ok(true)
}

/// Country filter matches on lower-cased full name or on code
fn country_selected(name: &str, code: &str, filter: &[String]) -> bool {
    let name = name.to_lowercase();
    filter.iter().any(|entry| *entry == name || entry == code)
}
