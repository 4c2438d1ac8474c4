//! Connectivity monitor
//!
//! A perpetual liveness probe: fetch the host's public address through the
//! tunnel and log it. Observability only — a failing probe is logged and the
//! loop keeps ticking; nothing here repairs a broken tunnel.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;

/// Public what-is-my-IP endpoint, plain HTTP, body is the address
pub const PROBE_URL: &str = "http://icanhazip.com/";

/// Per-probe timeout, bounded so a slow probe can't pile onto the next tick
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default tick interval
pub const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Tunnel liveness probe
pub struct Monitor {
    client: reqwest::blocking::Client,
    url: String,
    interval: Duration,
}

impl Monitor {
    pub fn new(interval: Duration) -> Result<Self> {
        Self::with_url(PROBE_URL, interval)
    }

    pub fn with_url(url: &str, interval: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            interval,
        })
    }

    /// One bounded probe; returns the observed public address
    pub fn probe(&self) -> Result<String> {
        let response = self.client.get(&self.url).send()?.error_for_status()?;
        Ok(response.text()?.trim().to_string())
    }

    /// Probe once immediately, then on every tick, forever
    pub fn run_forever(&self) -> ! {
        loop {
            match self.probe() {
                Ok(address) => info!("Tunnel connected, public address: {}", address),
                Err(e) => warn!("Connectivity probe failed: {}", e),
            }
            std::thread::sleep(self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    // One-shot HTTP server on a random loopback port
    fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_probe_reports_body_trimmed() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\n203.0.113.9\n",
        );
        let monitor = Monitor::with_url(&url, PROBE_INTERVAL).unwrap();
        assert_eq!(monitor.probe().unwrap(), "203.0.113.9");
    }

    #[test]
    fn test_probe_non_success_is_an_error() {
        let url = serve_once("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let monitor = Monitor::with_url(&url, PROBE_INTERVAL).unwrap();
        assert!(monitor.probe().is_err());
    }

    #[test]
    fn test_probe_connection_refused_is_an_error() {
        let monitor = Monitor::with_url("http://127.0.0.1:1/", PROBE_INTERVAL).unwrap();
        assert!(monitor.probe().is_err());
    }
}
