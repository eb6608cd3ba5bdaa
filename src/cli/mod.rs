//! # meshbgpd CLI
//!
//! The same binary runs the daemon and talks to a running instance over its JSON-RPC API.
//! It uses the default API endpoint (localhost:8080),
//! but you can point to a remote daemon using the `--host` and `--port` options.
//!
//! # Show Commands
//!
//! ## Neighbors
//!
//! Peer summary:
//! ```sh
//! $ meshbgpd show neighbors
//!  Neighbor                Kind             Router ID  AS     MsgRcvd  MsgSent  Uptime    State        PfxRcd
//! -------------------------------------------------------------------------------------------------------------
//!  172.16.0.2              addressed        2.2.2.2    65002  76       70       00:11:27  Established  4
//!  relay.example.net:179   active-relayed              65003                              Idle         0
//!  mesh-as65004            passive-relayed  4.4.4.4    65004  29       28       00:11:33  Established  2
//! ```
//!
//! Peer Detail:
//! ```sh
//! $ meshbgpd show neighbors detail
//! BGP neighbor is mesh-as65004 (passive-relayed),  remote AS 65004, local AS 65001
//!   BGP version 4,  remote router-id 4.4.4.4
//!     Local address: 10.0.0.1:179
//!     Remote address: 198.51.100.7:40312
//!   BGP state = Established, up for 00:11:59
//!   Hold time is 90, keepalive interval is 30
//!     Last read 00:00:03, last write 00:00:11
//!
//!   Message Statistics:
//!                       Sent      Received
//!     Total             30        29
//!     Prefixes          5         2
//! ```
//!
//! ## Routes
//!
//! ```sh
//! $ meshbgpd show routes learned mesh-as65004
//!     Received From  Prefix       Next Hop  Age       Origin  Local Pref  Metric  AS Path  Communities
//! ------------------------------------------------------------------------------------------------------
//!  *  mesh-as65004   4.4.4.4/32   4.4.4.4   00:07:54  IGP                         65004
//! ```
//! (`*` marks the best route for a prefix)
//!
//! # Peers and Routes
//! ```sh
//! $ meshbgpd peer add passive-relayed 65005
//! $ meshbgpd peer remove mesh-as65005
//! $ meshbgpd advertise 10.10.10.0/24 --local-pref 500 --communities "65001:100"
//! $ meshbgpd withdraw 10.10.10.0/24
//! ```

use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use colored::*;
use ipnetwork::Ipv4Network;
use itertools::Itertools;
use jsonrpsee::http_client::HttpClientBuilder;

use crate::api::{ApiClient, RouteSpec};
use crate::config::{PeerConfigSpec, PeerType};

mod display;
mod table;

use display::{AdvertisedRouteRow, LearnedRouteRow, PeerSummaryRow};

#[derive(Parser, Debug)]
#[clap(name = "meshbgpd", rename_all = "kebab-case")]
/// BGP speaker for relayed mesh peers
pub struct Args {
    #[clap(subcommand)]
    pub cmd: Command,
    #[clap(long, default_value = "127.0.0.1")]
    pub host: String,
    #[clap(short, long, default_value_t = 8080)]
    pub port: u16,
    /// API Listening address/port (E.g. 127.0.0.1:8080). If not provided, will fall back to config file value
    #[clap(long)]
    pub api: Option<SocketAddr>,
    /// Show debug logs (additive for trace logs)
    #[clap(short, parse(from_occurrences), global = true)]
    pub verbose: u8,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Command {
    /// Run the daemon
    Run(RunOptions),
    /// View peers and routes
    #[clap(alias = "s", subcommand)]
    Show(Show),
    /// Add or remove peers at runtime
    #[clap(subcommand)]
    Peer(Peer),
    /// Originate a route and advertise it to every peer
    Advertise(Route),
    /// Stop originating a route advertised from the API
    Withdraw(Withdraw),
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct RunOptions {
    /// Path to config.toml
    pub config_path: String,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Show {
    /// View configured neighbors and session details
    /// (* prefix means peer is disabled)
    #[clap(alias = "n", visible_alias = "peers")]
    Neighbors(NeighborOptions),
    #[clap(alias = "r", subcommand)]
    Routes(Routes),
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum ShowOptions {
    /// Show expanded details
    #[clap(alias = "d")]
    Detail,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct NeighborOptions {
    #[clap(subcommand)]
    options: Option<ShowOptions>,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Routes {
    Learned(RouteOptions),
    Advertised(RouteOptions),
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct RouteOptions {
    /// Peer to filter on (E.g. "172.16.0.2", "relay.example.net:179", "mesh-as65002")
    #[clap()]
    peer: Option<String>,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Peer {
    Add(AddPeer),
    Remove(RemovePeer),
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct AddPeer {
    /// Peer kind [addressed, active-relayed, passive-relayed]
    #[clap()]
    kind: String,
    /// Remote AS, also used to identify passive-relayed peers
    #[clap()]
    remote_as: u32,
    /// Remote address (addressed peers)
    #[clap(long)]
    remote_ip: Option<IpAddr>,
    /// Relay hostname (active-relayed peers)
    #[clap(long)]
    host: Option<String>,
    /// Destination port when dialling
    #[clap(long)]
    dest_port: Option<u16>,
    #[clap(long)]
    local_as: Option<u32>,
    #[clap(long)]
    hold_timer: Option<u16>,
    /// Only accept inbound connections
    #[clap(long)]
    passive: bool,
    /// Re-advertise iBGP routes to other iBGP peers
    #[clap(long)]
    route_server: bool,
    /// Add the peer but don't start sessions
    #[clap(long)]
    disabled: bool,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct RemovePeer {
    /// Peer to remove (E.g. "172.16.0.2", "relay.example.net:179", "mesh-as65002")
    #[clap()]
    peer: String,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct Route {
    /// Prefix to advertise
    #[clap()]
    prefix: Ipv4Network,
    /// Next Hop for this route, defaults to the router ID
    #[clap()]
    next_hop: Option<Ipv4Addr>,
    /// Origin (defaults to Incomplete)
    #[clap(short, long)]
    origin: Option<String>,
    /// AS Path (e.g. --as-path "100 200 65000.100"), defaults to an empty path
    #[clap(short, long)]
    as_path: Option<String>,
    #[clap(short = 'p', long)]
    local_pref: Option<u32>,
    /// Multi-exit-discriminator
    #[clap(long)]
    med: Option<u32>,
    /// Communities (e.g. --communities "65000:100 65000:200")
    #[clap(short, long)]
    communities: Option<String>,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct Withdraw {
    /// Prefix to stop advertising
    #[clap()]
    prefix: Ipv4Network,
}

fn parse_peer_type(kind: &str) -> Result<PeerType, String> {
    match kind.to_lowercase().as_str() {
        "addressed" => Ok(PeerType::Addressed),
        "active-relayed" => Ok(PeerType::ActiveRelayed),
        "passive-relayed" => Ok(PeerType::PassiveRelayed),
        _ => Err(format!(
            "Invalid peer kind '{}', must be one of: [addressed, active-relayed, passive-relayed]",
            kind
        )),
    }
}

impl AddPeer {
    fn to_spec(&self) -> Result<PeerConfigSpec, String> {
        let mut spec = PeerConfigSpec::new(parse_peer_type(&self.kind)?, self.remote_as);
        spec.remote_ip = self.remote_ip;
        spec.host = self.host.clone();
        spec.local_as = self.local_as;
        spec.passive = self.passive;
        spec.route_server = self.route_server;
        spec.enabled = !self.disabled;
        if let Some(port) = self.dest_port {
            spec.dest_port = port;
        }
        if let Some(hold_timer) = self.hold_timer {
            spec.hold_timer = hold_timer;
        }
        Ok(spec)
    }
}

impl Route {
    fn to_spec(&self) -> RouteSpec {
        let mut spec = RouteSpec::new(self.prefix, self.next_hop);
        spec.attributes.origin = self.origin.clone();
        spec.attributes.local_pref = self.local_pref;
        spec.attributes.multi_exit_disc = self.med;
        if let Some(as_path) = &self.as_path {
            spec.attributes.as_path = as_path.split_whitespace().map(|asn| asn.to_string()).collect();
        }
        if let Some(communities) = &self.communities {
            spec.attributes.communities = communities
                .split_whitespace()
                .map(|comm| comm.to_string())
                .collect();
        }
        spec
    }
}

async fn run_cmd(args: &Args) -> Result<(), Box<dyn Error>> {
    let client = {
        let base = match args.api {
            Some(api) => format!("http://{}", api),
            None => format!("http://{}:{}", args.host, args.port),
        };
        HttpClientBuilder::default().build(base)?
    };
    match &args.cmd {
        Command::Show(show) => match show {
            Show::Neighbors(options) => {
                if matches!(options.options, Some(ShowOptions::Detail)) {
                    let peers: Vec<_> = client.show_peer_detail().await?;
                    for peer in peers {
                        let summ = peer.summary;
                        let mut lines: Vec<String> = Vec::with_capacity(16);
                        lines.push(format!(
                            "BGP neighbor is {} ({}),  remote AS {}, local AS {}",
                            summ.peer, summ.kind, summ.remote_asn, summ.local_asn
                        ));
                        if !summ.enabled {
                            lines.push("*Peer is Disabled".to_string());
                        }
                        if peer.route_server {
                            lines.push("Route server client".to_string());
                        }
                        if let Some(router_id) = summ.router_id {
                            lines.push(format!("BGP version 4,  remote router-id {}", router_id));
                        }
                        if let Some((local, remote)) = peer.tcp_connection {
                            lines.push(format!("  Local address: {}", local));
                            lines.push(format!("  Remote address: {}", remote));
                        }
                        match summ.uptime {
                            Some(uptime) => {
                                lines.push(format!("BGP state = {}, up for {}", summ.state, uptime))
                            }
                            None => lines.push(format!("BGP state = {}", summ.state)),
                        }
                        lines.push(format!(
                            "Hold time is {}, keepalive interval is {}",
                            peer.hold_timer, peer.hold_timer_interval,
                        ));
                        if let (Some(read), Some(write)) = (&peer.last_received, &peer.last_sent) {
                            lines.push(format!("  Last read {}, last write {}", read, write));
                        }
                        if let Some(err) = &peer.last_error {
                            lines.push(format!("Last error: {}", err));
                        }
                        lines.push("".to_owned());
                        if let (Some(sent), Some(rcvd)) = (summ.msg_sent, summ.msg_received) {
                            lines.push("Message Statistics:".to_string());
                            lines.push("                    Sent      Received".to_string());
                            lines.push(format!("  Total             {:<10}{}", sent, rcvd));
                            lines.push(format!(
                                "  Prefixes          {:<10}{}",
                                peer.prefixes_sent.unwrap_or_default(),
                                summ.prefixes_received.unwrap_or_default()
                            ));
                        }
                        println!("{}\n", lines.join("\n  "));
                    }
                } else {
                    let mut table = table::OutputTable::new();
                    for peer in client.show_peers().await? {
                        table.add_row(&PeerSummaryRow(peer));
                    }
                    table.print();
                }
            }
            Show::Routes(routes) => match routes {
                Routes::Learned(options) => {
                    let routes = client.show_routes_learned(options.peer.clone()).await?;
                    let mut table = table::OutputTable::new();
                    for route in routes {
                        table.add_row(&LearnedRouteRow(route));
                    }
                    table.print();
                }
                Routes::Advertised(options) => {
                    let routes = client.show_routes_advertised(options.peer.clone()).await?;
                    // One table per peer
                    for (peer, routes) in &routes.into_iter().group_by(|r| r.source.clone()) {
                        println!("{}", peer.bold());
                        let mut table = table::OutputTable::new();
                        for route in routes {
                            table.add_row(&AdvertisedRouteRow(route));
                        }
                        table.print();
                        println!();
                    }
                }
            },
        },
        Command::Peer(peer) => match peer {
            Peer::Add(options) => {
                let spec = options.to_spec()?;
                let summary = client.add_peer(spec).await?;
                println!("Added peer {}:", summary.peer);
                let mut table = table::OutputTable::new();
                table.add_row(&PeerSummaryRow(summary));
                table.print();
            }
            Peer::Remove(options) => {
                let summary = client.remove_peer(options.peer.clone()).await?;
                println!("Removed peer {}", summary.peer);
            }
        },
        Command::Advertise(route) => match client.advertise_route(route.to_spec()).await {
            Ok(advertised) => {
                println!("Added route to RIB for announcement:");
                let mut table = table::OutputTable::new();
                table.add_row(&LearnedRouteRow(advertised));
                table.print();
            }
            Err(err) => eprintln!("Error adding route: {}", err),
        },
        Command::Withdraw(withdraw) => {
            let withdrawn = client.withdraw_route(withdraw.prefix).await?;
            println!("Withdrew {} from announcement", withdrawn.prefix);
        }
        // Handled in main
        Command::Run(_) => return Err("Use `run` to start the daemon".into()),
    }
    Ok(())
}

/// Interactive commands (other than running the daemon)
pub async fn query_bgpd(args: &Args) {
    if let Err(err) = run_cmd(args).await {
        eprintln!("{}", err.to_string().red());
    }
}
