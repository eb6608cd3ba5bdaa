use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use tokio::sync::{watch, RwLock};

use crate::config::{PeerConfig, PeerKey, ServerConfig};
use crate::rib::{NotOwner, Rib, Route, RouteSource};
use crate::session::{bind_listener, PeerEntry, PeerId, RegistryError, SessionManager};

/// A running BGP speaker: configured peers, their sessions and the shared RIB
///
/// Cheap to clone; every clone refers to the same speaker.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) sessions: SessionManager,
    pub(crate) rib: Arc<RwLock<Rib>>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Build the RIB (identity route plus configured local routes).
    /// Nothing is started until `start` or `listen` is called.
    pub fn new(config: ServerConfig) -> Self {
        let mut rib = Rib::new(config.router_id);
        for local in &config.local_routes {
            if let Err(err) = rib.originate(Route::new(local.prefix, local.next_hop, RouteSource::Config)) {
                warn!("Skipping local route: {}", err);
            }
        }
        let rib = Arc::new(RwLock::new(rib));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                sessions: SessionManager::new(rib.clone()),
                rib,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.inner.config.clone()
    }

    /// Register configured peers, accept BGP connections and start dialling
    pub async fn start(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        for peer in &self.inner.config.peers {
            self.add_peer(peer.as_ref().clone()).await?;
        }
        debug!("Registered {} configured peers", self.inner.config.peers.len());
        let addr = self.listen(self.inner.config.listen)?;
        self.start_poller();
        Ok(addr)
    }

    /// Bind the BGP listener and spawn the dispatcher, returning the bound address
    pub fn listen(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = bind_listener(addr)?;
        let bound = listener.local_addr()?;
        let sniff_timeout = Duration::from_secs(self.inner.config.sniff_timeout.into());
        let dispatcher = self.inner.sessions.dispatcher(sniff_timeout);
        info!("Starting BGP server on {}...", bound);
        tokio::spawn(dispatcher.run(listener, self.inner.shutdown.subscribe()));
        Ok(bound)
    }

    pub fn start_poller(&self) {
        let interval = Duration::from_secs(self.inner.config.poll_interval.into());
        let poller = self.inner.sessions.poller(interval);
        debug!("Starting {}", poller);
        tokio::spawn(poller.run(self.inner.shutdown.subscribe()));
    }

    pub async fn add_peer(&self, config: PeerConfig) -> Result<PeerId, RegistryError> {
        self.inner.sessions.add_peer(config).await
    }

    pub async fn remove_peer(&self, key: &PeerKey) -> Result<PeerEntry, RegistryError> {
        self.inner.sessions.remove_peer(key).await
    }

    pub async fn peers(&self) -> Vec<PeerEntry> {
        self.inner.sessions.peers().await
    }

    /// Originate a route from the API and advertise it to every established peer
    ///
    /// Prefixes originated from config (the identity route included) are refused.
    pub async fn advertise_route(&self, route: Route) -> Result<Route, NotOwner> {
        let mut route = route;
        route.source = RouteSource::Api;
        self.inner.rib.write().await.originate(route.clone())?;
        Ok(route)
    }

    /// Stop originating `prefix` if it came from the API, returning the removed route
    pub async fn withdraw_route(&self, prefix: Ipv4Network) -> Option<Route> {
        self.inner.rib.write().await.remove_local(prefix, RouteSource::Api)
    }

    /// Stop accepting and dialling, then close every session
    pub async fn shutdown(&self) {
        info!("Stopping BGP server...");
        // Receivers may already be gone if nothing was started
        let _ = self.inner.shutdown.send(true);
        self.inner.sessions.shutdown().await;
    }
}
