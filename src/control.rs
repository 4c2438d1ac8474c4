//! Device control socket
//!
//! A Unix socket named after the tunnel interface, speaking the line-oriented
//! `get=1`/`set=1` convention of userspace WireGuard devices: keys travel as
//! lowercase hex, a request body ends at a blank line, and every response is
//! terminated by `errno=<n>` plus a blank line.
//!
//! The accept loop runs on its own thread and hands each connection to a
//! fresh thread. Set requests are parsed and validated in full before the
//! session lock is taken, so concurrent reconfiguration is serialized and a
//! partially-applied session is never observable.

use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::descriptor::parse_ipv4_cidr;
use crate::device::{PeerSession, SessionState};
use crate::error::{Error, Result};
use crate::keys;

/// Directory holding per-interface control sockets
pub const SOCKET_DIR: &str = "/var/run/wireguard";

/// Control socket path for an interface
pub fn socket_path(iface: &str) -> PathBuf {
    Path::new(SOCKET_DIR).join(format!("{}.sock", iface))
}

/// Bind the interface's control socket and start the accept loop
pub fn spawn_listener(iface: &str, state: Arc<Mutex<SessionState>>) -> Result<JoinHandle<()>> {
    let path = socket_path(iface);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A stale socket from a previous run would make bind fail.
    let _ = std::fs::remove_file(&path);
    spawn_listener_at(&path, state)
}

/// Accept-loop entry point with an explicit socket path
pub fn spawn_listener_at(path: &Path, state: Arc<Mutex<SessionState>>) -> Result<JoinHandle<()>> {
    let listener = UnixListener::bind(path)
        .map_err(|e| Error::Control(format!("failed to bind {}: {}", path.display(), e)))?;
    info!("Control socket listening on {:?}", path);

    let handle = thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    let state = state.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &state) {
                            debug!("Control connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Control socket accept failed, listener stopping: {}", e);
                    break;
                }
            }
        }
    });
    Ok(handle)
}

fn handle_connection(stream: UnixStream, state: &Mutex<SessionState>) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let mut first = String::new();
    reader.read_line(&mut first)?;
    match first.trim() {
        "get=1" => {
            let response = {
                let session = state.lock().expect("session state lock poisoned");
                render_get(&session)
            };
            writer.write_all(response.as_bytes())?;
        }
        "set=1" => {
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
                    break;
                }
                lines.push(line.trim().to_string());
            }
            let errno = match parse_set(&lines) {
                Ok(request) => {
                    let mut session = state.lock().expect("session state lock poisoned");
                    apply_set(&mut session, request);
                    0
                }
                Err(e) => {
                    debug!("Rejected set request: {}", e);
                    1
                }
            };
            writer.write_all(format!("errno={}\n\n", errno).as_bytes())?;
        }
        other => {
            debug!("Unknown control request: {:?}", other);
            writer.write_all(b"errno=1\n\n")?;
        }
    }
    Ok(())
}

/// Render the current session for a `get=1` request
pub fn render_get(state: &SessionState) -> String {
    let mut out = String::new();
    if let Some(key) = &state.private_key {
        out.push_str(&format!("private_key={}\n", keys::key_to_hex(key)));
    }
    out.push_str(&format!("listen_port={}\n", state.listen_port));
    if let Some(peer) = &state.peer {
        out.push_str(&format!("public_key={}\n", keys::key_to_hex(&peer.public_key)));
        out.push_str(&format!("endpoint={}\n", peer.endpoint));
        for (addr, prefix) in &peer.allowed_ips {
            out.push_str(&format!("allowed_ip={}/{}\n", addr, prefix));
        }
    }
    out.push_str("errno=0\n\n");
    out
}

/// A validated `set=1` request body
#[derive(Debug, Default, PartialEq)]
pub struct SetRequest {
    pub private_key: Option<[u8; keys::KEY_LEN]>,
    pub listen_port: Option<u16>,
    pub replace_peers: bool,
    pub peer: Option<PeerSession>,
}

struct PeerLines {
    public_key: [u8; keys::KEY_LEN],
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<(Ipv4Addr, u8)>,
}

/// Parse a `set=1` body. The whole request is validated before anything is
/// applied; this device holds a single peer, so the last peer section wins.
pub fn parse_set(lines: &[String]) -> Result<SetRequest> {
    let mut request = SetRequest::default();
    let mut peer: Option<PeerLines> = None;

    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::Control(format!("malformed line '{}'", line)));
        };
        match key {
            "private_key" => request.private_key = Some(keys::key_from_hex(value)?),
            "listen_port" => {
                request.listen_port = Some(
                    value
                        .parse()
                        .map_err(|_| Error::Control(format!("bad listen_port '{}'", value)))?,
                )
            }
            "replace_peers" => request.replace_peers = value == "true",
            "public_key" => {
                if let Some(done) = peer.take() {
                    request.peer = Some(finish_peer(done)?);
                }
                peer = Some(PeerLines {
                    public_key: keys::key_from_hex(value)?,
                    endpoint: None,
                    allowed_ips: Vec::new(),
                });
            }
            "endpoint" => {
                let section = peer
                    .as_mut()
                    .ok_or_else(|| Error::Control("endpoint outside peer section".into()))?;
                section.endpoint = Some(
                    value
                        .parse()
                        .map_err(|_| Error::Control(format!("bad endpoint '{}'", value)))?,
                );
            }
            "allowed_ip" => {
                let section = peer
                    .as_mut()
                    .ok_or_else(|| Error::Control("allowed_ip outside peer section".into()))?;
                section.allowed_ips.push(parse_ipv4_cidr(value)?);
            }
            _ => {}
        }
    }

    if let Some(done) = peer.take() {
        request.peer = Some(finish_peer(done)?);
    }
    Ok(request)
}

fn finish_peer(lines: PeerLines) -> Result<PeerSession> {
    let endpoint = lines
        .endpoint
        .ok_or_else(|| Error::Control("peer section missing endpoint".into()))?;
    if lines.allowed_ips.is_empty() {
        return Err(Error::Control("peer section missing allowed_ip".into()));
    }
    Ok(PeerSession {
        public_key: lines.public_key,
        endpoint,
        allowed_ips: lines.allowed_ips,
    })
}

/// Apply a validated request under one lock acquisition
pub fn apply_set(state: &mut SessionState, request: SetRequest) {
    if let Some(key) = request.private_key {
        state.private_key = Some(key);
    }
    if let Some(port) = request.listen_port {
        state.listen_port = port;
    }
    if request.replace_peers || request.peer.is_some() {
        state.peer = request.peer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn state_with_peer() -> SessionState {
        SessionState {
            private_key: Some([0x11; 32]),
            listen_port: 51820,
            peer: Some(PeerSession {
                public_key: [0x22; 32],
                endpoint: "203.0.113.9:51820".parse().unwrap(),
                allowed_ips: vec![("0.0.0.0".parse().unwrap(), 0)],
            }),
        }
    }

    #[test]
    fn test_render_get() {
        let rendered = render_get(&state_with_peer());
        assert!(rendered.starts_with(&format!("private_key={}\n", "11".repeat(32))));
        assert!(rendered.contains("listen_port=51820\n"));
        assert!(rendered.contains(&format!("public_key={}\n", "22".repeat(32))));
        assert!(rendered.contains("endpoint=203.0.113.9:51820\n"));
        assert!(rendered.contains("allowed_ip=0.0.0.0/0\n"));
        assert!(rendered.ends_with("errno=0\n\n"));
    }

    #[test]
    fn test_parse_set_full_session() {
        let lines: Vec<String> = [
            format!("private_key={}", "33".repeat(32)),
            "listen_port=51821".to_string(),
            "replace_peers=true".to_string(),
            format!("public_key={}", "44".repeat(32)),
            "endpoint=198.51.100.4:51820".to_string(),
            "allowed_ip=0.0.0.0/1".to_string(),
            "allowed_ip=128.0.0.0/1".to_string(),
        ]
        .into();
        let request = parse_set(&lines).unwrap();
        assert_eq!(request.private_key, Some([0x33; 32]));
        assert_eq!(request.listen_port, Some(51821));
        assert!(request.replace_peers);
        let peer = request.peer.unwrap();
        assert_eq!(peer.public_key, [0x44; 32]);
        assert_eq!(peer.allowed_ips.len(), 2);
    }

    #[test]
    fn test_parse_set_rejects_incomplete_peer() {
        let lines = vec![format!("public_key={}", "44".repeat(32))];
        assert!(parse_set(&lines).is_err());
    }

    #[test]
    fn test_apply_set_replaces_peer_wholesale() {
        let mut state = state_with_peer();
        let request = SetRequest {
            replace_peers: true,
            ..Default::default()
        };
        apply_set(&mut state, request);
        assert!(state.peer.is_none());
        assert_eq!(state.listen_port, 51820);
    }

    #[test]
    fn test_get_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-test.sock");
        let state = Arc::new(Mutex::new(state_with_peer()));
        let _listener = spawn_listener_at(&path, state).unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"get=1\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.contains("listen_port=51820\n"));
        assert!(response.ends_with("errno=0\n\n"));
    }

    #[test]
    fn test_set_over_socket_mutates_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-test.sock");
        let state = Arc::new(Mutex::new(state_with_peer()));
        let _listener = spawn_listener_at(&path, state.clone()).unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"set=1\nlisten_port=51900\n\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert_eq!(response, "errno=0\n\n");
        assert_eq!(state.lock().unwrap().listen_port, 51900);
    }
}
