//! Public address lookup through an HTTP IP echo service.

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::NatConfig;

/// Errors from the public address lookup.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The HTTP request failed or timed out.
    #[error("ip lookup request failed: {0}")]
    Request(String),

    /// The service answered with something other than an IP address.
    #[error("ip lookup returned an invalid address: {0}")]
    InvalidAddress(String),
}

/// Determines the address under which this host is seen from the internet.
pub trait PublicIpResolver: Send + Sync {
    /// Performs the lookup.
    fn resolve(&self) -> Result<IpAddr, LookupError>;
}

#[derive(Debug, Deserialize)]
struct IpEcho {
    ip: String,
}

/// [`PublicIpResolver`] querying a JSON echo service such as ipify.
///
/// The service must answer with `{"ip": "<address>"}`.
#[derive(Debug, Clone)]
pub struct HttpPublicIpResolver {
    url: String,
    timeout: Duration,
}

impl HttpPublicIpResolver {
    /// Creates a resolver for `url` with a hard request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    /// Creates a resolver from the `[nat]` configuration section.
    pub fn from_config(config: &NatConfig) -> Self {
        Self::new(config.public_ip_url.clone(), config.public_ip_timeout())
    }
}

impl PublicIpResolver for HttpPublicIpResolver {
    fn resolve(&self) -> Result<IpAddr, LookupError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .build()
            .map_err(|e| LookupError::Request(e.to_string()))?;

        let echo: IpEcho = client
            .get(&self.url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.json())
            .map_err(|e| LookupError::Request(e.to_string()))?;

        debug!("IP echo service reported {}", echo.ip);
        parse_ip(&echo.ip)
    }
}

fn parse_ip(raw: &str) -> Result<IpAddr, LookupError> {
    raw.trim()
        .parse()
        .map_err(|_| LookupError::InvalidAddress(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    /// Serves exactly one HTTP response with `body` on a loopback port.
    fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        });
        format!("http://{}/?format=json", addr)
    }

    #[test]
    fn test_parse_ip() {
        assert_eq!(
            parse_ip("203.0.113.7").unwrap(),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
        assert!(parse_ip("2001:db8::1").unwrap().is_ipv6());
        assert!(matches!(
            parse_ip("not-an-ip"),
            Err(LookupError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_resolve_from_echo_service() {
        let url = serve_once("200 OK", r#"{"ip":"198.51.100.23"}"#);
        let resolver = HttpPublicIpResolver::new(url, Duration::from_secs(5));
        assert_eq!(
            resolver.resolve().unwrap(),
            "198.51.100.23".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_resolve_error_status() {
        let url = serve_once("500 Internal Server Error", "{}");
        let resolver = HttpPublicIpResolver::new(url, Duration::from_secs(5));
        assert!(matches!(resolver.resolve(), Err(LookupError::Request(_))));
    }

    #[test]
    fn test_resolve_garbage_body() {
        let url = serve_once("200 OK", r#"{"ip":"localhost"}"#);
        let resolver = HttpPublicIpResolver::new(url, Duration::from_secs(5));
        assert!(matches!(
            resolver.resolve(),
            Err(LookupError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_resolve_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let resolver = HttpPublicIpResolver::new(
            format!("http://127.0.0.1:{}/", port),
            Duration::from_millis(500),
        );
        assert!(resolver.resolve().is_err());
    }
}
