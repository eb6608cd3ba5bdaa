use std::collections::HashMap;
use std::net::SocketAddr;

use ipnetwork::Ipv4Network;
use jsonrpsee::core::{Error, RpcResult};
use jsonrpsee::http_server::{HttpServerBuilder, HttpServerHandle};
use log::info;

use super::peers::{peer_to_detail, peer_to_summary};
use super::routes::{parse_route_spec, route_to_learned};
use super::rpc::{ApiServer, LearnedRoute, PeerDetail, PeerSummary, RouteSpec};
use crate::config::{PeerConfigSpec, PeerKey};
use crate::handler::Server;
use crate::rib::{Route, RouteSource};
use crate::session::{PeerEntry, PeerId};

#[async_trait::async_trait]
impl ApiServer for Server {
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>> {
        let peers = self.peers().await;
        let rib = self.inner.rib.read().await;
        Ok(peers
            .iter()
            .map(|peer| {
                let pfx_rcvd = rib.routes_from(peer.id).len() as u64;
                peer_to_summary(peer, Some(pfx_rcvd))
            })
            .collect())
    }

    async fn show_peer_detail(&self) -> RpcResult<Vec<PeerDetail>> {
        let peers = self.peers().await;
        let rib = self.inner.rib.read().await;
        Ok(peers
            .iter()
            .map(|peer| {
                let pfx_rcvd = rib.routes_from(peer.id).len() as u64;
                peer_to_detail(peer, Some(pfx_rcvd))
            })
            .collect())
    }

    async fn show_routes_learned(&self, from_peer: Option<String>) -> RpcResult<Vec<LearnedRoute>> {
        let names = peer_names(&self.peers().await);
        let from_peer = match from_peer {
            Some(peer) => Some(self.find_peer(&peer).await?.id),
            None => None,
        };
        let rib = self.inner.rib.read().await;
        let routes = rib
            .snapshot()
            .into_iter()
            .filter(|entry| match from_peer {
                Some(id) => entry.route.source == RouteSource::Peer(id),
                None => true,
            })
            .map(|entry| route_to_learned(&entry.route, source_name(&names, &entry.route), entry.best))
            .collect();
        Ok(routes)
    }

    async fn show_routes_advertised(&self, to_peer: Option<String>) -> RpcResult<Vec<LearnedRoute>> {
        let peers = match to_peer {
            Some(peer) => vec![self.find_peer(&peer).await?],
            None => self.peers().await,
        };
        let rib = self.inner.rib.read().await;
        let routes = peers
            .iter()
            .flat_map(|peer| {
                let name = peer.config.key().to_string();
                rib.advertised_to(peer.id)
                    .into_iter()
                    .map(move |route| route_to_learned(&route, name.clone(), true))
            })
            .collect();
        Ok(routes)
    }

    async fn add_peer(&self, peer: PeerConfigSpec) -> RpcResult<PeerSummary> {
        let config = self
            .inner
            .config
            .peer_from_spec(&peer)
            .map_err(|err| Error::Custom(err.to_string()))?;
        let key = config.key();
        self.inner
            .sessions
            .add_peer(config)
            .await
            .map_err(|err| Error::Custom(err.to_string()))?;
        let entry = self.find_peer(&key.to_string()).await?;
        info!("Added peer {} from API", key);
        Ok(peer_to_summary(&entry, None))
    }

    async fn remove_peer(&self, peer: String) -> RpcResult<PeerSummary> {
        let key = parse_peer_key(&peer)?;
        let entry = Server::remove_peer(self, &key)
            .await
            .map_err(|err| Error::Custom(err.to_string()))?;
        info!("Removed peer {} from API", key);
        Ok(peer_to_summary(&entry, None))
    }

    async fn advertise_route(&self, route: RouteSpec) -> RpcResult<LearnedRoute> {
        let route = parse_route_spec(&route, self.inner.config.router_id)
            .map_err(|err| Error::Custom(err.to_string()))?;
        let route = Server::advertise_route(self, route)
            .await
            .map_err(|err| Error::Custom(err.to_string()))?;
        Ok(route_to_learned(&route, route.source.to_string(), true))
    }

    async fn withdraw_route(&self, prefix: Ipv4Network) -> RpcResult<LearnedRoute> {
        match Server::withdraw_route(self, prefix).await {
            Some(route) => Ok(route_to_learned(&route, route.source.to_string(), false)),
            None => Err(Error::Custom(format!("{} was not advertised from the API", prefix))),
        }
    }
}

impl Server {
    /// Serve the JSON-RPC API on `socket`; the server stops when the handle is stopped
    ///
    /// Returns the bound address, which differs from `socket` when port 0 is requested.
    pub async fn serve_rpc_api(
        &self,
        socket: SocketAddr,
    ) -> Result<(SocketAddr, HttpServerHandle), Error> {
        let server = HttpServerBuilder::default().build(socket).await?;
        let bound = server.local_addr()?;
        info!("Starting JSON-RPC server on {}...", bound);
        let handle = server.start(self.clone().into_rpc())?;
        Ok((bound, handle))
    }

    async fn find_peer(&self, peer: &str) -> RpcResult<PeerEntry> {
        let key = parse_peer_key(peer)?;
        self.inner
            .sessions
            .find(&key)
            .await
            .ok_or_else(|| Error::Custom(format!("No peer {} configured", key)))
    }
}

fn parse_peer_key(peer: &str) -> RpcResult<PeerKey> {
    peer.parse().map_err(|err: crate::utils::ParseError| Error::Custom(err.to_string()))
}

fn peer_names(peers: &[PeerEntry]) -> HashMap<PeerId, String> {
    peers
        .iter()
        .map(|peer| (peer.id, peer.config.key().to_string()))
        .collect()
}

// Removed peers no longer have a name, fall back to the id
fn source_name(names: &HashMap<PeerId, String>, route: &Route) -> String {
    match route.source {
        RouteSource::Peer(id) => names.get(&id).cloned().unwrap_or_else(|| id.to_string()),
        source => source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use jsonrpsee::http_client::HttpClientBuilder;

    use super::*;
    use crate::config::{PeerType, ServerConfig};

    fn server() -> Server {
        let mut config = ServerConfig::new(Ipv4Addr::new(1, 1, 1, 1), 65001);
        config.listen = "127.0.0.1:0".parse().unwrap();
        Server::new(config)
    }

    #[tokio::test]
    async fn test_peer_methods() {
        let server = server();
        let mut spec = PeerConfigSpec::new(PeerType::PassiveRelayed, 65002);
        spec.passive = true;
        let summary = ApiServer::add_peer(&server, spec.clone()).await.unwrap();
        assert_eq!(summary.peer, "mesh-as65002");
        assert_eq!(summary.kind, "passive-relayed");
        assert_eq!(summary.local_asn, 65001);
        assert_eq!(summary.state, "Idle");

        // Same AS can't be matched twice
        assert!(ApiServer::add_peer(&server, spec).await.is_err());
        let mut bad = PeerConfigSpec::new(PeerType::Addressed, 65003);
        bad.hold_timer = 2;
        assert!(ApiServer::add_peer(&server, bad).await.is_err());

        let peers = server.show_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].prefixes_received, Some(0));
        let detail = server.show_peer_detail().await.unwrap();
        assert_eq!(detail[0].hold_timer, 180);
        assert!(detail[0].tcp_connection.is_none());

        let removed = ApiServer::remove_peer(&server, "mesh-as65002".to_string())
            .await
            .unwrap();
        assert_eq!(removed.remote_asn, 65002);
        assert!(ApiServer::remove_peer(&server, "mesh-as65002".to_string())
            .await
            .is_err());
        assert!(server.show_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_route_methods() {
        let server = server();
        let mut spec = RouteSpec::new("10.1.0.0/16".parse().unwrap(), None);
        spec.attributes.communities = vec!["65001:10".to_string()];
        let learned = ApiServer::advertise_route(&server, spec).await.unwrap();
        assert_eq!(learned.source, "API");
        assert_eq!(learned.next_hop, Ipv4Addr::new(1, 1, 1, 1));

        let routes = server.show_routes_learned(None).await.unwrap();
        let prefixes: Vec<String> = routes.iter().map(|r| r.prefix.to_string()).collect();
        assert_eq!(prefixes, vec!["1.1.1.1/32", "10.1.0.0/16"]);
        assert!(routes.iter().all(|r| r.best));
        assert_eq!(routes[0].source, "Config");

        // Unknown peer filter
        assert!(server
            .show_routes_learned(Some("10.0.0.9".to_string()))
            .await
            .is_err());
        assert!(server.show_routes_advertised(None).await.unwrap().is_empty());

        let withdrawn = ApiServer::withdraw_route(&server, "10.1.0.0/16".parse().unwrap())
            .await
            .unwrap();
        assert!(!withdrawn.best);
        assert!(ApiServer::withdraw_route(&server, "10.1.0.0/16".parse().unwrap())
            .await
            .is_err());

        // The identity route belongs to the config
        assert!(ApiServer::withdraw_route(&server, "1.1.1.1/32".parse().unwrap())
            .await
            .is_err());
        let identity = RouteSpec::new("1.1.1.1/32".parse().unwrap(), None);
        assert!(ApiServer::advertise_route(&server, identity).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_rpc_api() {
        let server = server();
        let mut spec = PeerConfigSpec::new(PeerType::PassiveRelayed, 65002);
        spec.passive = true;
        ApiServer::add_peer(&server, spec).await.unwrap();

        let (addr, handle) = server
            .serve_rpc_api("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        let client = HttpClientBuilder::default()
            .build(format!("http://{}", addr))
            .unwrap();
        let peers = crate::api::ApiClient::show_peers(&client).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer, "mesh-as65002");
        let routes = crate::api::ApiClient::show_routes_learned(&client, None)
            .await.unwrap();
        assert_eq!(routes[0].prefix.to_string(), "1.1.1.1/32");
        handle.stop().unwrap();
    }
}
