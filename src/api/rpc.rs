use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{self, Deserialize, Serialize};

use crate::config::PeerConfigSpec;

#[rpc(client, server)]
pub trait Api {
    #[method(name = "show_peers")]
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>>;
    #[method(name = "show_peer_detail")]
    async fn show_peer_detail(&self) -> RpcResult<Vec<PeerDetail>>;
    #[method(name = "show_routes_learned")]
    async fn show_routes_learned(&self, from_peer: Option<String>) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "show_routes_advertised")]
    async fn show_routes_advertised(&self, to_peer: Option<String>) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "add_peer")]
    async fn add_peer(&self, peer: PeerConfigSpec) -> RpcResult<PeerSummary>;
    #[method(name = "remove_peer")]
    async fn remove_peer(&self, peer: String) -> RpcResult<PeerSummary>;
    #[method(name = "advertise_route")]
    async fn advertise_route(&self, route: RouteSpec) -> RpcResult<LearnedRoute>;
    #[method(name = "withdraw_route")]
    async fn withdraw_route(&self, prefix: Ipv4Network) -> RpcResult<LearnedRoute>;
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PeerSummary {
    /// Peer key, E.g. "172.16.0.2", "relay.example.net:179" or "mesh-as65002"
    pub peer: String,
    pub kind: String,
    pub enabled: bool,
    pub router_id: Option<Ipv4Addr>,
    pub remote_asn: u32,
    pub local_asn: u32,
    pub msg_received: Option<u64>,
    pub msg_sent: Option<u64>,
    pub connect_time: Option<i64>,
    pub uptime: Option<String>,
    pub state: String,
    pub prefixes_received: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PeerDetail {
    pub summary: PeerSummary,
    pub hold_timer: u16,
    pub hold_timer_interval: u16,
    pub route_server: bool,
    pub last_received: Option<String>,
    pub last_sent: Option<String>,
    // TCP Stream info Local, Remote
    pub tcp_connection: Option<(String, String)>,
    pub prefixes_sent: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LearnedRoute {
    pub source: String,
    pub received_at: i64,
    pub age: String,
    pub prefix: Ipv4Network,
    pub next_hop: Ipv4Addr,
    pub origin: String,
    pub as_path: String,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub communities: Vec<String>,
    /// Selected as the best route for its prefix
    pub best: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SpecAttributes {
    pub origin: Option<String>,
    #[serde(default = "Vec::new")]
    pub as_path: Vec<String>,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    #[serde(default = "Vec::new")]
    pub communities: Vec<String>,
}

/// API Input for Route to advertise to peers
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RouteSpec {
    /// Prefix to advertise (E.g. "100.1.0.0/16")
    pub prefix: Ipv4Network,
    /// Next-hop to reach this prefix, defaults to the router ID
    pub next_hop: Option<Ipv4Addr>,
    #[serde(flatten, default = "SpecAttributes::default")]
    pub attributes: SpecAttributes,
}

impl RouteSpec {
    pub fn new(prefix: Ipv4Network, next_hop: Option<Ipv4Addr>) -> Self {
        Self {
            prefix,
            next_hop,
            attributes: SpecAttributes::default(),
        }
    }
}
