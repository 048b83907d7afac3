//! Tor integration: ephemeral hidden services via the control port, and
//! outbound dials through the local SOCKS5 proxy.
//!
//! The control-port exchange is a tiny line protocol used only at start and
//! stop, so it runs on a plain blocking socket. The ephemeral onion service
//! lives exactly as long as the control connection, so the controller keeps
//! its stream open for the node's lifetime.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream as StdTcpStream;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::error::{P2pError, Result};

pub const SOCKS_ADDR: &str = "127.0.0.1:9050";
pub const CONTROL_ADDR: &str = "127.0.0.1:9051";

/// Remediation text shown when no Tor daemon is reachable.
pub const TOR_HELP: &str = "no Tor daemon on 127.0.0.1:9050/9051. Install and start it: \
    `sudo apt install tor && sudo systemctl start tor`";

/// Quick reachability probe of the SOCKS proxy.
pub fn proxy_reachable() -> bool {
    match SOCKS_ADDR.parse() {
        Ok(addr) => StdTcpStream::connect_timeout(&addr, Duration::from_secs(3)).is_ok(),
        Err(_) => false,
    }
}

/// Holds the control connection that keeps an ephemeral v3 onion service
/// alive.
pub struct TorController {
    reader: BufReader<StdTcpStream>,
    service_id: Option<String>,
}

impl TorController {
    /// Connect to the control port and authenticate (cookie-less / null
    /// authentication, the Debian default for local users).
    pub fn connect() -> Result<Self> {
        let stream = StdTcpStream::connect(CONTROL_ADDR)
            .map_err(|_| P2pError::TorUnavailable(TOR_HELP.to_string()))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .map_err(P2pError::Io)?;

        let mut controller = Self {
            reader: BufReader::new(stream),
            service_id: None,
        };
        let reply = controller.command("AUTHENTICATE \"\"")?;
        if !reply.iter().any(|line| line.starts_with("250")) {
            return Err(P2pError::TorControl(format!(
                "authentication refused: {}",
                reply.join(" / ")
            )));
        }
        Ok(controller)
    }

    /// Create an ephemeral `ED25519-V3` onion service mapping `virt_port`
    /// to a local port, returning the `<id>.onion` address.
    pub fn add_onion(&mut self, virt_port: u16, local_port: u16) -> Result<String> {
        let command = format!(
            "ADD_ONION NEW:ED25519-V3 Flags=DiscardPK Port={virt_port},127.0.0.1:{local_port}"
        );
        let reply = self.command(&command)?;
        let service_id = parse_add_onion_reply(&reply).ok_or_else(|| {
            P2pError::TorControl(format!("ADD_ONION failed: {}", reply.join(" / ")))
        })?;

        self.service_id = Some(service_id.clone());
        let onion = format!("{service_id}.onion");
        info!(onion = %onion, virt_port, local_port, "hidden service ready");
        Ok(onion)
    }

    /// Tear the service down explicitly (it would also die with the control
    /// connection).
    pub fn remove_onion(&mut self) {
        if let Some(service_id) = self.service_id.take() {
            if let Err(e) = self.command(&format!("DEL_ONION {service_id}")) {
                warn!(error = %e, "DEL_ONION failed");
            }
        }
    }

    fn command(&mut self, line: &str) -> Result<Vec<String>> {
        self.reader
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .map_err(P2pError::Io)?;

        let mut reply = Vec::new();
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).map_err(P2pError::Io)?;
            if read == 0 {
                return Err(P2pError::TorControl("control connection closed".to_string()));
            }
            let line = line.trim_end().to_string();
            // Final line of a reply has a space after the status code;
            // continuation lines use '-' or '+'.
            let done = line.len() >= 4 && line.as_bytes()[3] == b' ';
            reply.push(line);
            if done {
                return Ok(reply);
            }
        }
    }
}

impl Drop for TorController {
    fn drop(&mut self) {
        self.remove_onion();
    }
}

/// Extract the ServiceID from an ADD_ONION reply.
pub fn parse_add_onion_reply(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        line.strip_prefix("250-ServiceID=")
            .map(|id| id.to_string())
    })
}

/// Build the SOCKS5 CONNECT request for a domain target.
pub fn socks5_connect_request(host: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

/// Open a TCP stream to `host:port` through the local SOCKS5 proxy.
/// Hostname resolution happens inside Tor, so `.onion` targets work and no
/// DNS request ever leaves the machine.
pub async fn socks5_connect(host: &str, port: u16) -> Result<TcpStream> {
    if host.len() > 255 {
        return Err(P2pError::AddressParse("hostname too long".to_string()));
    }
    let mut stream = TcpStream::connect(SOCKS_ADDR)
        .await
        .map_err(|_| P2pError::TorUnavailable(TOR_HELP.to_string()))?;

    // Greeting: version 5, one method, no authentication.
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [0x05, 0x00] {
        return Err(P2pError::TorControl("SOCKS5 method refused".to_string()));
    }

    stream
        .write_all(&socks5_connect_request(host, port))
        .await?;
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(P2pError::TorControl(format!(
            "SOCKS5 connect refused (code {})",
            header[1]
        )));
    }
    // Drain the bound address the proxy reports back.
    match header[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await?;
        }
        other => {
            return Err(P2pError::TorControl(format!(
                "SOCKS5 unknown address type {other}"
            )));
        }
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_id_from_reply() {
        let reply = vec![
            "250-ServiceID=abcdefghijklmnop".to_string(),
            "250 OK".to_string(),
        ];
        assert_eq!(
            parse_add_onion_reply(&reply).as_deref(),
            Some("abcdefghijklmnop")
        );
    }

    #[test]
    fn missing_service_id_is_none() {
        let reply = vec!["550 Unspecified Tor error".to_string()];
        assert!(parse_add_onion_reply(&reply).is_none());
    }

    #[test]
    fn connect_request_encodes_domain() {
        let request = socks5_connect_request("example.onion", 55320);
        assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x03]);
        assert_eq!(request[4] as usize, "example.onion".len());
        assert_eq!(&request[5..18], b"example.onion");
        assert_eq!(&request[18..], &55320u16.to_be_bytes());
    }
}
