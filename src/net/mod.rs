//! Axons and the endpoint that owns them.
//!
//! An axon is an authenticated link to another node. Every protocol carries
//! the same contract on top of its native delivery: the dialer sends a hello
//! naming itself, the acceptor asks its [`NetHandler`] to verify the origin
//! and answers with the raw `#hsuc` token, and from then on application
//! payloads flow in both directions. TCP and QUIC streams frame payloads with
//! a 6-byte header (see [`frame`]); WebSocket messages are sent as-is.
//!
//! Liveness of stream axons is watched by a heartbeat that pings idle links
//! and closes the ones that never answered the previous ping.

use std::{fmt, str::FromStr, time::Duration};

use futures::future::BoxFuture;
use typed_builder::TypedBuilder;

mod axon;
mod endpoint;
mod error;
pub mod frame;
mod handshake;
mod link;
mod netwatch;
mod origin;
mod quic;
mod registry;
mod tcp;
mod ws;

pub use axon::Axon;
pub use endpoint::Endpoint;
pub use error::Error;
pub use handshake::Hello;
pub use origin::Origin;
pub use registry::AxonRegistry;

/// Prefix of the handshake header, followed by the protocol name.
pub const HEADER_PREFIX: &str = "GANGLION/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    /// Reliable delivery over UDP, carried by QUIC streams.
    Quic,
    Ws,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> Result<Self, Error> {
        match scheme {
            "tcp" => Ok(Protocol::Tcp),
            "udp" | "quic" => Ok(Protocol::Quic),
            "ws" => Ok(Protocol::Ws),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Quic => "quic",
            Protocol::Ws => "ws",
        }
    }

    /// The header a dialer puts in its hello, e.g. `GANGLION/TCP`.
    pub fn header(self) -> String {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Quic => "QUIC",
            Protocol::Ws => "WS",
        };
        format!("{HEADER_PREFIX}{name}")
    }

    /// Whether the heartbeat watches axons of this protocol.
    pub fn keepalive(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Quic)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A parsed endpoint url: `tcp://host:port`, `udp://host:port`,
/// `quic://host:port` or `ws://host:port/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub proto: Protocol,
    /// `host:port`.
    pub addr: String,
    /// Request path, WebSocket only. Starts with `/`.
    pub path: String,
}

impl Target {
    pub fn host(&self) -> &str {
        match self.addr.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.addr,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.addr.rsplit_once(':')?.1.parse().ok()
    }

    /// The same url with its port replaced.
    pub fn with_port(&self, port: u16) -> String {
        format!(
            "{}://{}:{}{}",
            self.proto.scheme(),
            self.host(),
            port,
            self.path
        )
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
        let proto = Protocol::from_scheme(scheme)?;
        let (addr, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let port_ok = addr
            .rsplit_once(':')
            .map_or(false, |(host, port)| {
                !host.is_empty() && port.parse::<u16>().is_ok()
            });
        if !port_ok {
            Err(Error::InvalidUrl(url.to_string()))?
        }
        let path = match (proto, path) {
            (Protocol::Ws, "") => "/".to_string(),
            (Protocol::Ws, path) => path.to_string(),
            (_, _) => String::new(),
        };
        Ok(Self {
            proto,
            addr: addr.to_string(),
            path,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.proto.scheme(), self.addr, self.path)
    }
}

/// Transport settings shared by every listener and dialer of an endpoint.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NetConfig {
    /// How often the heartbeat walks stream axons.
    #[builder(default = Duration::from_secs(2))]
    pub heartbeat_interval: Duration,
    /// Silence after which an axon is pinged.
    #[builder(default = Duration::from_secs(2))]
    pub idle_threshold: Duration,
    /// Upper bound on both sides of the handshake.
    #[builder(default = Duration::from_secs(6))]
    pub handshake_timeout: Duration,
    /// Size of a single socket read.
    #[builder(default = 8192)]
    pub read_buffer: usize,
    /// PEM certificate chain for QUIC listeners. A self-signed certificate is
    /// generated when absent.
    #[builder(default, setter(strip_option))]
    pub tls_cert: Option<Vec<u8>>,
    /// PEM PKCS#8 private key matching `tls_cert`.
    #[builder(default, setter(strip_option))]
    pub tls_key: Option<Vec<u8>>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The callbacks an [`Endpoint`] drives.
pub trait NetHandler: Send + Sync + 'static {
    /// Resolves the origin a dialer presented to the node id its axon is
    /// registered under, or rejects it.
    fn check_node(&self, origin: &str) -> Result<String, Error>;

    fn on_connect(&self, _node_id: &str) {}

    /// A payload arrived. Control messages never get here.
    fn on_message(&self, node_id: &str, msg: Vec<u8>) -> BoxFuture<'_, ()>;

    /// An admitted axon went away. Fired once per axon.
    fn on_close(&self, _node_id: &str, _reason: &Error) {}

    /// A connection failed before it was admitted.
    fn on_error(&self, _err: Error) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_parse() {
        let t: Target = "tcp://127.0.0.1:7000".parse().unwrap();
        assert_eq!(t.proto, Protocol::Tcp);
        assert_eq!(t.addr, "127.0.0.1:7000");
        assert_eq!(t.path, "");
        assert_eq!(t.port(), Some(7000));

        let t: Target = "udp://h:1".parse().unwrap();
        assert_eq!(t.proto, Protocol::Quic);

        let t: Target = "ws://h:80".parse().unwrap();
        assert_eq!(t.path, "/");
        let t: Target = "ws://h:80/gate".parse().unwrap();
        assert_eq!(t.path, "/gate");
        assert_eq!(t.with_port(81), "ws://h:81/gate");
        assert_eq!(t.to_string(), "ws://h:80/gate");
    }

    #[test]
    fn bad_urls_are_refused() {
        assert!(matches!(
            "http://h:1".parse::<Target>(),
            Err(Error::UnsupportedProtocol(_))
        ));
        assert!("tcp://h".parse::<Target>().is_err());
        assert!("tcp://:1".parse::<Target>().is_err());
        assert!("tcp://h:port".parse::<Target>().is_err());
        assert!("h:1".parse::<Target>().is_err());
    }

    #[test]
    fn headers_name_the_protocol() {
        assert_eq!(Protocol::Tcp.header(), "GANGLION/TCP");
        assert_eq!(Protocol::Quic.header(), "GANGLION/QUIC");
        assert_eq!(Protocol::Ws.header(), "GANGLION/WS");
        assert!(Protocol::Quic.keepalive());
        assert!(!Protocol::Ws.keepalive());
    }

    #[test]
    fn config_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.handshake_timeout, Duration::from_secs(6));
        assert!(config.tls_cert.is_none());
    }
}
