use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ipnetwork::Ipv4Network;
use serde::{self, Deserialize, Serialize};
use toml;

pub(super) struct Defaults {}

impl Defaults {
    fn kind() -> PeerType {
        PeerType::Addressed
    }

    fn enabled() -> bool {
        true
    }

    fn passive() -> bool {
        false
    }

    fn route_server() -> bool {
        false
    }

    fn poll_interval() -> u16 {
        30
    }

    pub(super) fn hold_timer() -> u16 {
        180
    }

    fn sniff_timeout() -> u16 {
        5
    }

    fn dest_port() -> u16 {
        179
    }

    fn listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 179))
    }

    fn api() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 8080))
    }
}

/// How a peer's connections are matched to its session
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PeerType {
    /// Identified by the TCP source address
    Addressed,
    /// Reached by dialling a relay hostname/port
    ActiveRelayed,
    /// Behind a relay, identified by the AS in its OPEN
    PassiveRelayed,
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            PeerType::Addressed => "addressed",
            PeerType::ActiveRelayed => "active-relayed",
            PeerType::PassiveRelayed => "passive-relayed",
        };
        write!(f, "{}", word)
    }
}

/// Config (toml) representation of a Peer Config
///
/// Also accepted as-is by the `add_peer` API call.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeerConfigSpec {
    #[serde(default = "Defaults::kind")]
    pub kind: PeerType,
    pub remote_as: u32,
    // Required for addressed peers
    pub remote_ip: Option<IpAddr>,
    // Required for active-relayed peers, may be an IP literal
    pub host: Option<String>,
    pub local_as: Option<u32>,
    pub local_router_id: Option<Ipv4Addr>,

    #[serde(default = "Defaults::enabled")]
    pub enabled: bool,

    // Only listen to incoming TCP sessions for passive peers
    // And don't attempt outbound TCP connections
    #[serde(default = "Defaults::passive")]
    pub passive: bool,

    // Timer to keep peers active
    // Will send keepalives every 1/3rd of this value
    #[serde(default = "Defaults::hold_timer")]
    pub hold_timer: u16,

    // Destination port for BGP session
    // Used when initiating connection to peer
    #[serde(default = "Defaults::dest_port")]
    pub dest_port: u16,

    // Re-advertise routes learned over iBGP to other iBGP peers
    #[serde(default = "Defaults::route_server")]
    pub route_server: bool,
}

impl PeerConfigSpec {
    pub fn new(kind: PeerType, remote_as: u32) -> Self {
        Self {
            kind,
            remote_as,
            remote_ip: None,
            host: None,
            local_as: None,
            local_router_id: None,
            enabled: Defaults::enabled(),
            passive: Defaults::passive(),
            hold_timer: Defaults::hold_timer(),
            dest_port: Defaults::dest_port(),
            route_server: Defaults::route_server(),
        }
    }
}

/// Prefix originated by this speaker
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LocalRouteSpec {
    pub prefix: Ipv4Network,
    // Defaults to the router ID
    pub next_hop: Option<Ipv4Addr>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Global Router-ID (can be overriden per-peer in peer config)
    pub(super) router_id: Ipv4Addr,
    // Global ASN (can be overriden per-peer in peer config)
    pub(super) default_as: u32,
    // BGP listener
    #[serde(default = "Defaults::listen")]
    pub(super) listen: SocketAddr,
    // JSON-RPC API listener
    #[serde(default = "Defaults::api")]
    pub(super) api: SocketAddr,
    // Inverval to poll idle peers (outbound connection)
    #[serde(default = "Defaults::poll_interval")]
    pub(super) poll_interval: u16,
    // Seconds to wait for the OPEN of an unaddressed connection
    #[serde(default = "Defaults::sniff_timeout")]
    pub(super) sniff_timeout: u16,
    #[serde(default = "Vec::new")]
    pub(super) local_routes: Vec<LocalRouteSpec>,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::parse_toml(&contents)
    }

    pub(super) fn parse_toml(contents: &str) -> io::Result<Self> {
        toml::from_str(contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
