//! WireGuard key material
//!
//! X25519 keys travel in two encodings: base64 in descriptor files and the
//! control-plane API, lowercase hex on the control socket.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Raw key length in bytes
pub const KEY_LEN: usize = 32;

/// X25519 keypair for one tunnel session
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key as a base64 string
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Get the private key as a base64 string
    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

fn decode32(b64: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::Key(format!("invalid base64: {}", e)))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::Key(format!(
            "invalid key length: {} (expected {})",
            bytes.len(),
            KEY_LEN
        )));
    }
    let mut arr = [0u8; KEY_LEN];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Parse a base64-encoded private key
pub fn parse_private_key(b64: &str) -> Result<StaticSecret> {
    Ok(StaticSecret::from(decode32(b64)?))
}

/// Parse a base64-encoded public key
pub fn parse_public_key(b64: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(decode32(b64)?))
}

/// Encode raw key bytes as lowercase hex (control socket encoding)
pub fn key_to_hex(key: &[u8; KEY_LEN]) -> String {
    hex::encode(key)
}

/// Decode a hex-encoded key from the control socket
pub fn key_from_hex(s: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(s.trim()).map_err(|e| Error::Key(format!("invalid hex: {}", e)))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::Key(format!(
            "invalid key length: {} (expected {})",
            bytes.len(),
            KEY_LEN
        )));
    }
    let mut arr = [0u8; KEY_LEN];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Convert between the two wire encodings: base64 in, hex out
pub fn base64_to_hex(b64: &str) -> Result<String> {
    Ok(key_to_hex(&decode32(b64)?))
}

/// Convert between the two wire encodings: hex in, base64 out
pub fn hex_to_base64(s: &str) -> Result<String> {
    Ok(BASE64.encode(key_from_hex(s)?))
}
