//! Connection URL parsing
//!
//! The command line takes the vehicle address as a URL:
//!  - `tcp://[server_host][:server_port]`
//!  - `udp://[bind_host][:bind_port]`
//!  - `serial:///path/to/serial/dev[:baudrate]`
//!
//! For example, to connect to the PX4 simulator use `udp://:14540`.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

const DEFAULT_TCP_HOST: &str = "127.0.0.1";
const DEFAULT_TCP_PORT: u16 = 5760;
const DEFAULT_UDP_HOST: &str = "0.0.0.0";
const DEFAULT_UDP_PORT: u16 = 14540;
const DEFAULT_SERIAL_BAUD: u32 = 57600;

/// Parsed vehicle connection URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUrl {
    /// TCP client connection to a server (simulator, telemetry bridge)
    Tcp {
        /// Server host
        host: String,
        /// Server port
        port: u16,
    },
    /// UDP listener, the vehicle is expected to send to this address
    Udp {
        /// Local bind address
        host: String,
        /// Local bind port
        port: u16,
    },
    /// Serial device
    Serial {
        /// Device path, for example `/dev/ttyUSB0`
        path: String,
        /// Baudrate
        baud: u32,
    },
}

impl ConnectionUrl {
    /// Parse a connection URL
    ///
    /// Missing hosts and ports are replaced by defaults: `127.0.0.1:5760` for TCP, all interfaces on
    /// port 14540 for UDP and 57600 baud for serial.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::InvalidUrl(format!("missing scheme in '{}'", url)))?;

        match scheme {
            "tcp" => {
                let (host, port) = split_host_port(rest, DEFAULT_TCP_HOST, DEFAULT_TCP_PORT)?;
                Ok(ConnectionUrl::Tcp { host, port })
            }
            "udp" => {
                let (host, port) = split_host_port(rest, DEFAULT_UDP_HOST, DEFAULT_UDP_PORT)?;
                Ok(ConnectionUrl::Udp { host, port })
            }
            "serial" => {
                if !rest.starts_with('/') {
                    return Err(Error::InvalidUrl(format!(
                        "serial device path must be absolute, got '{}'",
                        rest
                    )));
                }
                let (path, baud) = match rest.rsplit_once(':') {
                    Some((path, baud)) => (path, parse_number(baud, "baudrate")?),
                    None => (rest, DEFAULT_SERIAL_BAUD),
                };
                if path.len() < 2 {
                    return Err(Error::InvalidUrl("missing serial device path".to_owned()));
                }
                Ok(ConnectionUrl::Serial {
                    path: path.to_owned(),
                    baud,
                })
            }
            other => Err(Error::InvalidUrl(format!("unknown scheme '{}'", other))),
        }
    }

    /// Address string understood by [`mavlink::connect`]
    pub fn to_mavlink_address(&self) -> String {
        match self {
            ConnectionUrl::Tcp { host, port } => format!("tcpout:{}:{}", host, port),
            ConnectionUrl::Udp { host, port } => format!("udpin:{}:{}", host, port),
            ConnectionUrl::Serial { path, baud } => format!("serial:{}:{}", path, baud),
        }
    }
}

impl FromStr for ConnectionUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionUrl::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectionUrl::Udp { host, port } => write!(f, "udp://{}:{}", host, port),
            ConnectionUrl::Serial { path, baud } => write!(f, "serial://{}:{}", path, baud),
        }
    }
}

fn split_host_port(rest: &str, default_host: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, parse_number(port, "port")?),
        None => (rest, default_port),
    };
    let host = if host.is_empty() { default_host } else { host };
    Ok((host.to_owned(), port))
}

fn parse_number<T: FromStr>(text: &str, what: &str) -> Result<T> {
    text.parse()
        .map_err(|_| Error::InvalidUrl(format!("invalid {} '{}'", what, text)))
}
