mod file;

pub use file::{LocalRouteSpec, PeerConfigSpec, PeerType};

use std::fmt;
use std::io::{self, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;

use crate::utils::ParseError;

/// Parse a TOML config file and return a ServerConfig
pub fn from_file(path: &str) -> Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_file(path)?;
    ServerConfig::from_spec(spec).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: Ipv4Addr,
    pub default_as: u32,
    pub listen: SocketAddr,
    pub api: SocketAddr,
    pub poll_interval: u16,
    pub sniff_timeout: u16,
    pub local_routes: Vec<LocalRoute>,
    pub peers: Vec<Arc<PeerConfig>>,
}

/// Where a peer's connections come from and how they are matched
#[derive(Clone, Debug, PartialEq)]
pub enum PeerKind {
    /// Matched by TCP source address, dialled out unless passive
    Addressed {
        addr: IpAddr,
        port: u16,
        passive: bool,
    },
    /// Dialled out to a relay endpoint, never matched inbound
    ActiveRelayed { host: String, port: u16 },
    /// Inbound from any source, matched by the AS carried in its OPEN
    PassiveRelayed,
}

/// Stable name of a configured peer, used to find it again for removal
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerKey {
    Addr(IpAddr),
    Host(String, u16),
    Mesh(u32),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerKey::Addr(addr) => write!(f, "{}", addr),
            PeerKey::Host(host, port) => write!(f, "{}:{}", host, port),
            PeerKey::Mesh(asn) => write!(f, "mesh-as{}", asn),
        }
    }
}

impl FromStr for PeerKey {
    type Err = ParseError;

    fn from_str(value: &str) -> std::result::Result<Self, ParseError> {
        if let Some(asn) = value.strip_prefix("mesh-as") {
            let asn = asn
                .parse()
                .map_err(|_| ParseError::new(format!("Invalid mesh peer '{}'", value)))?;
            return Ok(PeerKey::Mesh(asn));
        }
        if let Ok(addr) = value.parse::<IpAddr>() {
            return Ok(PeerKey::Addr(addr));
        }
        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| ParseError::new(format!("Invalid port in '{}'", value)))?;
                Ok(PeerKey::Host(host.to_string(), port))
            }
            _ => Err(ParseError::new(format!("Not a valid peer: '{}'", value))),
        }
    }
}

/// In-Memory Server representation of a Peer config
///   Has missing PeerConfigSpec items defaulted to Server values
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub kind: PeerKind,
    pub remote_as: u32,
    pub local_as: u32,
    pub local_router_id: Ipv4Addr,
    pub enabled: bool,
    pub hold_timer: u16,
    pub route_server: bool,
}

impl PeerConfig {
    pub fn new(kind: PeerKind, remote_as: u32, local_as: u32, local_router_id: Ipv4Addr) -> Self {
        Self {
            kind,
            remote_as,
            local_as,
            local_router_id,
            enabled: true,
            hold_timer: file::Defaults::hold_timer(),
            route_server: false,
        }
    }

    // Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }

    pub fn key(&self) -> PeerKey {
        match &self.kind {
            PeerKind::Addressed { addr, .. } => PeerKey::Addr(*addr),
            PeerKind::ActiveRelayed { host, port } => PeerKey::Host(host.clone(), *port),
            PeerKind::PassiveRelayed => PeerKey::Mesh(self.remote_as),
        }
    }

    pub fn peer_type(&self) -> PeerType {
        match self.kind {
            PeerKind::Addressed { .. } => PeerType::Addressed,
            PeerKind::ActiveRelayed { .. } => PeerType::ActiveRelayed,
            PeerKind::PassiveRelayed => PeerType::PassiveRelayed,
        }
    }

    /// Address to match inbound connections against
    pub fn remote_addr(&self) -> Option<IpAddr> {
        match self.kind {
            PeerKind::Addressed { addr, .. } => Some(addr),
            _ => None,
        }
    }

    /// Inbound connections are matched on the AS from their OPEN
    pub fn any_source(&self) -> bool {
        self.kind == PeerKind::PassiveRelayed
    }

    /// Configured remote is a name that must be resolved before dialling
    pub fn is_hostname(&self) -> bool {
        match &self.kind {
            PeerKind::ActiveRelayed { host, .. } => host.parse::<IpAddr>().is_err(),
            _ => false,
        }
    }

    /// Host and port to dial for outbound sessions, if any
    pub fn dial_target(&self) -> Option<(String, u16)> {
        match &self.kind {
            PeerKind::Addressed {
                addr,
                port,
                passive: false,
            } => Some((addr.to_string(), *port)),
            PeerKind::ActiveRelayed { host, port } => Some((host.clone(), *port)),
            _ => None,
        }
    }
}

/// Prefix originated locally and advertised to every peer
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRoute {
    pub prefix: Ipv4Network,
    pub next_hop: Ipv4Addr,
}

impl ServerConfig {
    /// Server config with no peers or local routes
    pub fn new(router_id: Ipv4Addr, default_as: u32) -> Self {
        Self {
            router_id,
            default_as,
            listen: SocketAddr::from(([0, 0, 0, 0], 179)),
            api: SocketAddr::from(([127, 0, 0, 1], 8080)),
            poll_interval: 30,
            sniff_timeout: 5,
            local_routes: vec![],
            peers: vec![],
        }
    }

    fn from_spec(spec: file::ServerConfigSpec) -> std::result::Result<Self, ParseError> {
        if spec.sniff_timeout == 0 || spec.sniff_timeout > file::Defaults::hold_timer() {
            return Err(ParseError::new(format!(
                "sniff_timeout must be between 1 and {} seconds",
                file::Defaults::hold_timer()
            )));
        }
        if spec.poll_interval == 0 {
            return Err(ParseError::new("poll_interval must be at least 1 second".to_string()));
        }
        let mut config = Self::new(spec.router_id, spec.default_as);
        config.listen = spec.listen;
        config.api = spec.api;
        config.poll_interval = spec.poll_interval;
        config.sniff_timeout = spec.sniff_timeout;
        config.local_routes = spec
            .local_routes
            .iter()
            .map(|route| config.local_route_from_spec(route))
            .collect();
        config.peers = spec
            .peers
            .iter()
            .map(|peer| config.peer_from_spec(peer).map(Arc::new))
            .collect::<std::result::Result<_, _>>()?;
        Ok(config)
    }

    pub fn local_route_from_spec(&self, spec: &LocalRouteSpec) -> LocalRoute {
        LocalRoute {
            prefix: spec.prefix,
            next_hop: spec.next_hop.unwrap_or(self.router_id),
        }
    }

    /// Validate a peer spec, filling in server-wide defaults
    pub fn peer_from_spec(&self, spec: &PeerConfigSpec) -> std::result::Result<PeerConfig, ParseError> {
        if spec.hold_timer == 1 || spec.hold_timer == 2 {
            return Err(ParseError::new(format!(
                "hold_timer must be 0 or at least 3 seconds (got {})",
                spec.hold_timer
            )));
        }
        let kind = match spec.kind {
            PeerType::Addressed => {
                if spec.host.is_some() {
                    return Err(ParseError::new(
                        "addressed peers are matched by remote_ip, not host".to_string(),
                    ));
                }
                let addr = spec.remote_ip.ok_or_else(|| {
                    ParseError::new(format!("addressed peer AS{} needs a remote_ip", spec.remote_as))
                })?;
                PeerKind::Addressed {
                    addr,
                    port: spec.dest_port,
                    passive: spec.passive,
                }
            }
            PeerType::ActiveRelayed => {
                let host = match (&spec.host, spec.remote_ip) {
                    (Some(host), _) => host.clone(),
                    (None, Some(addr)) => addr.to_string(),
                    (None, None) => {
                        return Err(ParseError::new(format!(
                            "active-relayed peer AS{} needs a host",
                            spec.remote_as
                        )))
                    }
                };
                PeerKind::ActiveRelayed {
                    host,
                    port: spec.dest_port,
                }
            }
            PeerType::PassiveRelayed => {
                if spec.remote_ip.is_some() || spec.host.is_some() {
                    return Err(ParseError::new(format!(
                        "passive-relayed peer AS{} is matched by AS only, remove remote_ip/host",
                        spec.remote_as
                    )));
                }
                PeerKind::PassiveRelayed
            }
        };
        Ok(PeerConfig {
            kind,
            remote_as: spec.remote_as,
            local_as: spec.local_as.unwrap_or(self.default_as),
            local_router_id: spec.local_router_id.unwrap_or(self.router_id),
            enabled: spec.enabled,
            hold_timer: spec.hold_timer,
            route_server: spec.route_server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerConfig {
        ServerConfig::new(Ipv4Addr::new(1, 1, 1, 1), 65001)
    }

    #[test]
    fn test_from_file() {
        let config = from_file("./demos/config.toml").unwrap();
        assert_eq!(config.peers.len(), 3);
        assert_eq!(
            config.local_routes[0],
            LocalRoute {
                prefix: "10.0.1.0/24".parse().unwrap(),
                next_hop: Ipv4Addr::new(1, 1, 1, 1),
            }
        );
        let keys: Vec<String> = config.peers.iter().map(|p| p.key().to_string()).collect();
        assert_eq!(
            keys,
            vec!["172.16.0.2", "relay.example.net:14179", "mesh-as65004"]
        );
        assert!(config.peers[1].is_hostname());
        assert!(config.peers[2].any_source());
        assert_eq!(config.peers[0].local_as, 65001);
        assert_eq!(config.peers[0].dial_target(), None);
    }

    #[test]
    fn test_peer_kinds() {
        let mut spec = PeerConfigSpec::new(PeerType::Addressed, 65002);
        assert!(server().peer_from_spec(&spec).is_err());
        spec.remote_ip = Some(IpAddr::from([10, 0, 0, 2]));
        let peer = server().peer_from_spec(&spec).unwrap();
        assert_eq!(peer.remote_addr(), Some(IpAddr::from([10, 0, 0, 2])));
        assert_eq!(peer.dial_target(), Some(("10.0.0.2".to_string(), 179)));
        assert!(!peer.any_source());

        let mut spec = PeerConfigSpec::new(PeerType::ActiveRelayed, 65003);
        spec.remote_ip = Some(IpAddr::from([203, 0, 113, 7]));
        let peer = server().peer_from_spec(&spec).unwrap();
        assert!(!peer.is_hostname());
        assert_eq!(peer.remote_addr(), None);

        let mut spec = PeerConfigSpec::new(PeerType::PassiveRelayed, 65004);
        let peer = server().peer_from_spec(&spec).unwrap();
        assert!(peer.any_source());
        assert_eq!(peer.dial_target(), None);
        spec.host = Some("relay.example.net".to_string());
        assert!(server().peer_from_spec(&spec).is_err());
    }

    #[test]
    fn test_server_timers() {
        let parse = |extra: &str| {
            let text = format!("router_id = \"1.1.1.1\"\ndefault_as = 65001\n{}", extra);
            let spec: file::ServerConfigSpec = toml::from_str(&text).unwrap();
            ServerConfig::from_spec(spec)
        };
        let config = parse("").unwrap();
        assert_eq!((config.poll_interval, config.sniff_timeout), (30, 5));
        assert_eq!(parse("poll_interval = 1").unwrap().poll_interval, 1);
        assert!(parse("poll_interval = 0").is_err());
        assert!(parse("sniff_timeout = 0").is_err());
        assert!(parse("sniff_timeout = 181").is_err());
    }

    #[test]
    fn test_invalid_hold_timer() {
        let mut spec = PeerConfigSpec::new(PeerType::PassiveRelayed, 65004);
        spec.hold_timer = 2;
        assert!(server().peer_from_spec(&spec).is_err());
        spec.hold_timer = 0;
        assert!(server().peer_from_spec(&spec).is_ok());
    }

    #[test]
    fn test_peer_key_parsing() {
        for key in &[
            PeerKey::Addr(IpAddr::from([172, 16, 0, 2])),
            PeerKey::Addr("2001:db8::2".parse().unwrap()),
            PeerKey::Host("relay.example.net".to_string(), 14179),
            PeerKey::Host("203.0.113.7".to_string(), 179),
            PeerKey::Mesh(65004),
        ] {
            assert_eq!(&key.to_string().parse::<PeerKey>().unwrap(), key);
        }
        assert!("relay.example.net".parse::<PeerKey>().is_err());
        assert!("mesh-asX".parse::<PeerKey>().is_err());
    }
}
