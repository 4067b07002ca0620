//! Small networking helpers shared by the services.

use crate::error::{FerrioError, Result};
use std::time::Duration;
use tokio::net::TcpStream;

/// All outbound connects are bounded so a dead peer never stalls a caller.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Validate and normalize a `host:port` entry.
pub fn parse_host_port(value: &str) -> Result<String> {
    let trimmed = value.trim();
    let (host_raw, port_raw) = trimmed.rsplit_once(':').ok_or_else(|| {
        FerrioError::Config(format!("invalid address '{}': expected host:port", trimmed))
    })?;

    let host = host_raw.trim();
    let port = port_raw.trim();
    if host.is_empty() || port.is_empty() {
        return Err(FerrioError::Config(format!(
            "invalid address '{}': expected host:port",
            trimmed
        )));
    }

    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(FerrioError::Config(format!(
            "invalid address '{}': expected host:port",
            trimmed
        )));
    }

    let parsed_port = port.parse::<u16>().map_err(|_| {
        FerrioError::Config(format!("invalid address '{}': port must be u16", trimmed))
    })?;

    Ok(format!("{}:{}", host, parsed_port))
}

/// Parse a comma-separated list of `host:port` entries, skipping blanks.
pub fn parse_address_list(raw: &str) -> Result<Vec<String>> {
    let mut parsed = Vec::new();
    for token in raw.split(',') {
        let entry = token.trim();
        if entry.is_empty() {
            continue;
        }
        parsed.push(parse_host_port(entry)?);
    }

    if parsed.is_empty() {
        return Err(FerrioError::Config(
            "address list has no valid host:port entries".to_string(),
        ));
    }

    Ok(parsed)
}

/// Best-effort local IPv4 detection for the advertised address. The probe
/// socket never sends a packet; connect only fixes the outbound interface.
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("10.255.255.255:1")?;
        Ok(socket.local_addr()?.ip().to_string())
    };

    match probe() {
        Ok(ip) if ip != "0.0.0.0" => ip,
        _ => "127.0.0.1".to_string(),
    }
}

/// Connect with the shared bound, mapping elapsed timers to [`FerrioError::Timeout`].
pub async fn connect(addr: &str) -> Result<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(error.into()),
        Err(_) => Err(FerrioError::Timeout(format!("connect to {}", addr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_host_port() {
        assert_eq!(parse_host_port(" 10.0.0.1:5367 ").unwrap(), "10.0.0.1:5367");
        assert!(parse_host_port("nohost").is_err());
        assert!(parse_host_port("host:notaport").is_err());
        assert!(parse_host_port(":5367").is_err());
    }

    #[test]
    fn parses_comma_lists() {
        let list = parse_address_list("a:1, b:2,,c:3").unwrap();
        assert_eq!(list, vec!["a:1", "b:2", "c:3"]);
        assert!(parse_address_list(" , ").is_err());
    }
}
