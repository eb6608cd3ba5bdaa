use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::{mpsc, watch, RwLock};

use super::{Dispatcher, PeerEntry, PeerId, Poller, Registry, RegistryError};
use super::{Session, SessionCommand, SessionStatus};
use crate::config::{PeerConfig, PeerKey};
use crate::rib::Rib;

/// Owns the peer registry and the lifecycle of every session task
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<RwLock<Registry>>,
    rib: Arc<RwLock<Rib>>,
}

impl SessionManager {
    pub fn new(rib: Arc<RwLock<Rib>>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::new())),
            rib,
        }
    }

    /// Register a peer and start its (Idle) session task
    ///
    /// Conflicts are detected before anything is registered or spawned.
    pub async fn add_peer(&self, config: PeerConfig) -> Result<PeerId, RegistryError> {
        let config = Arc::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::idle(config.hold_timer));
        let id = self
            .registry
            .write()
            .await
            .insert(config.clone(), status_rx, tx)?;
        info!("Added peer {} [{}]", config.key(), config.peer_type());
        let session = Session::new(id, config, rx, status_tx, self.rib.clone());
        tokio::spawn(session.serve());
        Ok(id)
    }

    /// Unregister a peer; its session sends a Cease and withdraws its routes
    pub async fn remove_peer(&self, key: &PeerKey) -> Result<PeerEntry, RegistryError> {
        let entry = self.registry.write().await.remove(key)?;
        entry.send(SessionCommand::Shutdown);
        info!("Removed peer {}", key);
        Ok(entry)
    }

    pub async fn peers(&self) -> Vec<PeerEntry> {
        self.registry.read().await.iter().cloned().collect()
    }

    pub async fn find(&self, key: &PeerKey) -> Option<PeerEntry> {
        self.registry.read().await.find(key).cloned()
    }

    pub fn dispatcher(&self, sniff_timeout: Duration) -> Dispatcher {
        Dispatcher::new(self.registry.clone(), sniff_timeout)
    }

    pub fn poller(&self, interval: Duration) -> Poller {
        Poller::new(self.registry.clone(), interval)
    }

    /// Stop every session
    pub async fn shutdown(&self) {
        let entries = self.registry.write().await.drain();
        for entry in entries {
            entry.send(SessionCommand::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use futures::{SinkExt, StreamExt};
    use ipnetwork::Ipv4Network;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::config::PeerKind;
    use crate::message::{Message, Open, Origin, PathAttribute, Update};
    use crate::session::codec::MessageCodec;
    use crate::session::dispatcher::bind_listener;
    use crate::session::SessionState;

    const LOCAL_ID: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

    type Remote = Framed<TcpStream, MessageCodec>;

    struct Speaker {
        manager: SessionManager,
        rib: Arc<RwLock<Rib>>,
        addr: SocketAddr,
        _shutdown: watch::Sender<bool>,
    }

    async fn speaker() -> Speaker {
        speaker_with_id(LOCAL_ID).await
    }

    async fn speaker_with_id(router_id: Ipv4Addr) -> Speaker {
        let rib = Arc::new(RwLock::new(Rib::new(router_id)));
        let manager = SessionManager::new(rib.clone());
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = manager.dispatcher(Duration::from_secs(2));
        tokio::spawn(dispatcher.run(listener, shutdown_rx));
        Speaker {
            manager,
            rib,
            addr,
            _shutdown: shutdown,
        }
    }

    fn mesh(remote_as: u32) -> PeerConfig {
        PeerConfig::new(PeerKind::PassiveRelayed, remote_as, 65001, LOCAL_ID)
    }

    async fn recv(remote: &mut Remote) -> Option<Message> {
        timeout(Duration::from_secs(5), remote.next())
            .await
            .expect("Message within timeout")
            .map(|message| message.expect("Valid message"))
    }

    /// Connect and complete the OPEN exchange as the remote peer
    async fn handshake(addr: SocketAddr, asn: u32, router_id: Ipv4Addr) -> Remote {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());
        remote
            .send(Message::Open(Open::new(asn, 90, router_id)))
            .await
            .unwrap();
        assert!(matches!(recv(&mut remote).await, Some(Message::Open(_))));
        assert_eq!(recv(&mut remote).await, Some(Message::KeepAlive));
        remote.send(Message::KeepAlive).await.unwrap();
        remote
    }

    fn announce(prefixes: &[&str], as_path: Vec<u32>, next_hop: Ipv4Addr) -> Message {
        Message::Update(Update::announce(
            vec![
                PathAttribute::Origin(Origin::Igp),
                PathAttribute::AsPath(as_path),
                PathAttribute::NextHop(next_hop),
            ],
            prefixes.iter().map(|p| p.parse().unwrap()).collect(),
        ))
    }

    /// Read UPDATEs until one matches
    async fn recv_update<F>(remote: &mut Remote, matches: F) -> Update
    where
        F: Fn(&Update) -> bool,
    {
        loop {
            match recv(remote).await {
                Some(Message::Update(update)) if matches(&update) => return update,
                Some(Message::Update(_)) | Some(Message::KeepAlive) => continue,
                other => panic!("Expected UPDATE, got {:?}", other),
            }
        }
    }

    async fn wait_for_state(entry: &PeerEntry, state: SessionState) {
        let mut status = entry.status.clone();
        timeout(Duration::from_secs(5), async {
            while status.borrow().state != state {
                status.changed().await.unwrap();
            }
        })
        .await
        .expect("State reached within timeout");
    }

    async fn wait_for_routes(rib: &Arc<RwLock<Rib>>, id: PeerId, count: usize) {
        timeout(Duration::from_secs(5), async {
            while rib.read().await.routes_from(id).len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Routes within timeout");
    }

    #[tokio::test]
    async fn test_mesh_peer_established_from_sniffed_open() {
        let speaker = speaker().await;
        let id = speaker.manager.add_peer(mesh(65002)).await.unwrap();
        let entry = speaker.manager.find(&PeerKey::Mesh(65002)).await.unwrap();

        let remote_id = Ipv4Addr::new(5, 5, 5, 5);
        let mut remote = handshake(speaker.addr, 65002, remote_id).await;
        wait_for_state(&entry, SessionState::Established).await;
        assert_eq!(entry.status().remote_router_id, Some(remote_id));

        // Our identity route is the first thing advertised
        let update = recv_update(&mut remote, |_| true).await;
        assert_eq!(update.announced, vec!["1.1.1.1/32".parse().unwrap()]);

        // And theirs is attributed to the session
        remote
            .send(announce(&["5.5.5.5/32"], vec![65002], remote_id))
            .await
            .unwrap();
        wait_for_routes(&speaker.rib, id, 1).await;
        let rib = speaker.rib.read().await;
        let route = rib.best_route(&"5.5.5.5/32".parse().unwrap()).unwrap();
        assert_eq!(route.source, crate::rib::RouteSource::Peer(id));
    }

    #[tokio::test]
    async fn test_unknown_as_leaves_registry_untouched() {
        let speaker = speaker().await;
        speaker.manager.add_peer(mesh(65002)).await.unwrap();
        let entry = speaker.manager.find(&PeerKey::Mesh(65002)).await.unwrap();

        let stream = TcpStream::connect(speaker.addr).await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());
        remote
            .send(Message::Open(Open::new(65099, 90, Ipv4Addr::new(9, 9, 9, 9))))
            .await
            .unwrap();
        match recv(&mut remote).await {
            Some(Message::Notification(notif)) => assert_eq!((notif.code, notif.subcode), (2, 2)),
            other => panic!("Expected NOTIFICATION, got {:?}", other),
        }
        assert!(recv(&mut remote).await.is_none());

        assert_eq!(speaker.manager.peers().await.len(), 1);
        let status = entry.status();
        assert_eq!(status.state, SessionState::Idle);
        assert!(status.last_error.is_none());
        assert!(status.connection.is_none());
    }

    #[tokio::test]
    async fn test_routes_relayed_between_peers() {
        let speaker = speaker().await;
        let p1 = speaker.manager.add_peer(mesh(65002)).await.unwrap();
        let p2 = speaker.manager.add_peer(mesh(65003)).await.unwrap();
        let p2_entry = speaker.manager.find(&PeerKey::Mesh(65003)).await.unwrap();

        let p1_id = Ipv4Addr::new(2, 2, 2, 2);
        let mut remote1 = handshake(speaker.addr, 65002, p1_id).await;
        let mut remote2 = handshake(speaker.addr, 65003, Ipv4Addr::new(3, 3, 3, 3)).await;
        wait_for_state(&p2_entry, SessionState::Established).await;

        let prefix: Ipv4Network = "10.0.12.0/24".parse().unwrap();
        remote1
            .send(announce(&["10.0.12.0/24"], vec![65002], p1_id))
            .await
            .unwrap();
        let update = recv_update(&mut remote2, |u| u.announced.contains(&prefix)).await;
        assert_eq!(update.as_path(), Some(&[65001, 65002][..]));
        assert_eq!(update.next_hop(), Some(LOCAL_ID));
        {
            let rib = speaker.rib.read().await;
            assert!(rib.advertised_to(p2).iter().any(|r| r.prefix == prefix));
            assert!(!rib.advertised_to(p1).iter().any(|r| r.prefix == prefix));
        }

        // P1 goes away: its routes leave the RIB and P2 hears about it
        drop(remote1);
        let update = recv_update(&mut remote2, |u| u.withdrawn.contains(&prefix)).await;
        assert!(update.announced.is_empty());
        wait_for_routes(&speaker.rib, p1, 0).await;
        assert!(speaker.rib.read().await.best_route(&prefix).is_none());
    }

    #[tokio::test]
    async fn test_addressed_peer_matched_without_sniff() {
        let speaker = speaker().await;
        let kind = PeerKind::Addressed {
            addr: IpAddr::from([127, 0, 0, 1]),
            port: 179,
            passive: true,
        };
        speaker
            .manager
            .add_peer(PeerConfig::new(kind, 65002, 65001, LOCAL_ID))
            .await
            .unwrap();

        // The session speaks first, no OPEN is needed to identify us
        let stream = TcpStream::connect(speaker.addr).await.unwrap();
        let mut remote = Framed::new(stream, MessageCodec::new());
        assert!(matches!(recv(&mut remote).await, Some(Message::Open(_))));
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let speaker = speaker().await;
        let id = speaker.manager.add_peer(mesh(65002)).await.unwrap();
        assert!(matches!(
            speaker.manager.add_peer(mesh(65002)).await,
            Err(RegistryError::Conflict(..))
        ));

        let remote_id = Ipv4Addr::new(2, 2, 2, 2);
        let mut remote = handshake(speaker.addr, 65002, remote_id).await;
        remote
            .send(announce(&["10.2.0.0/16"], vec![65002], remote_id))
            .await
            .unwrap();
        wait_for_routes(&speaker.rib, id, 1).await;

        speaker.manager.remove_peer(&PeerKey::Mesh(65002)).await.unwrap();
        loop {
            match recv(&mut remote).await {
                Some(Message::Notification(notif)) => {
                    assert_eq!((notif.code, notif.subcode), (6, 3));
                    break;
                }
                Some(_) => continue,
                None => panic!("Connection closed without NOTIFICATION"),
            }
        }
        wait_for_routes(&speaker.rib, id, 0).await;
        assert!(speaker.manager.peers().await.is_empty());
        assert!(matches!(
            speaker.manager.remove_peer(&PeerKey::Mesh(65002)).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    fn dialled(port: u16, remote_as: u32, local_as: u32, router_id: Ipv4Addr) -> PeerConfig {
        let kind = PeerKind::Addressed {
            addr: IpAddr::from([127, 0, 0, 1]),
            port,
            passive: false,
        };
        PeerConfig::new(kind, remote_as, local_as, router_id)
    }

    fn assert_cease(message: Option<Message>) {
        match message {
            Some(Message::Notification(notif)) => assert_eq!((notif.code, notif.subcode), (6, 7)),
            other => panic!("Expected Cease NOTIFICATION, got {:?}", other),
        }
    }

    /// Let the speaker dial a hand-driven remote, then dial back in with `remote_id`
    /// while the outbound session waits in OpenSent
    async fn collide(remote_id: Ipv4Addr) -> (Speaker, PeerEntry, Remote, Remote) {
        let speaker = speaker().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        speaker
            .manager
            .add_peer(dialled(port, 65002, 65001, LOCAL_ID))
            .await
            .unwrap();
        let entry = speaker
            .manager
            .find(&PeerKey::Addr(IpAddr::from([127, 0, 0, 1])))
            .await
            .unwrap();

        assert_eq!(speaker.manager.poller(Duration::from_secs(30)).poll().await, 1);
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut outbound = Framed::new(stream, MessageCodec::new());
        assert!(matches!(recv(&mut outbound).await, Some(Message::Open(_))));
        wait_for_state(&entry, SessionState::OpenSent).await;

        let mut inbound = Framed::new(TcpStream::connect(speaker.addr).await.unwrap(), MessageCodec::new());
        inbound
            .send(Message::Open(Open::new(65002, 90, remote_id)))
            .await
            .unwrap();
        (speaker, entry, outbound, inbound)
    }

    #[tokio::test]
    async fn test_collision_higher_remote_id_wins() {
        let (speaker, entry, mut outbound, mut inbound) = collide(Ipv4Addr::new(5, 5, 5, 5)).await;

        // Our dialled connection gives way
        assert_cease(recv(&mut outbound).await);
        assert!(matches!(recv(&mut inbound).await, Some(Message::Open(_))));
        assert_eq!(recv(&mut inbound).await, Some(Message::KeepAlive));
        inbound.send(Message::KeepAlive).await.unwrap();
        wait_for_state(&entry, SessionState::Established).await;

        let (local, _) = entry.status().connection.unwrap();
        assert_eq!(local, speaker.addr);
    }

    #[tokio::test]
    async fn test_collision_lower_remote_id_loses() {
        let remote_id = Ipv4Addr::new(1, 0, 0, 9);
        let (_speaker, entry, mut outbound, mut inbound) = collide(remote_id).await;

        // Their connection is refused and ours carries on
        assert_cease(recv(&mut inbound).await);
        assert!(recv(&mut inbound).await.is_none());
        outbound
            .send(Message::Open(Open::new(65002, 90, remote_id)))
            .await
            .unwrap();
        assert_eq!(recv(&mut outbound).await, Some(Message::KeepAlive));
        outbound.send(Message::KeepAlive).await.unwrap();
        wait_for_state(&entry, SessionState::Established).await;

        let (local, remote) = entry.status().connection.unwrap();
        assert_eq!(remote, outbound.get_ref().local_addr().unwrap());
        assert_eq!(local, outbound.get_ref().peer_addr().unwrap());
    }

    #[tokio::test]
    async fn test_simultaneous_dials_settle_on_one_connection() {
        let (a_id, b_id) = (Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2));
        let a = speaker_with_id(a_id).await;
        let b = speaker_with_id(b_id).await;
        a.manager
            .add_peer(dialled(b.addr.port(), 65002, 65001, a_id))
            .await
            .unwrap();
        b.manager
            .add_peer(dialled(a.addr.port(), 65001, 65002, b_id))
            .await
            .unwrap();
        let key = PeerKey::Addr(IpAddr::from([127, 0, 0, 1]));
        let a_entry = a.manager.find(&key).await.unwrap();
        let b_entry = b.manager.find(&key).await.unwrap();

        let a_poller = a.manager.poller(Duration::from_secs(30));
        let b_poller = b.manager.poller(Duration::from_secs(30));
        tokio::join!(a_poller.poll(), b_poller.poll());
        wait_for_state(&a_entry, SessionState::Established).await;
        wait_for_state(&b_entry, SessionState::Established).await;

        // Let the losing connection finish closing
        tokio::time::sleep(Duration::from_millis(500)).await;
        let a_status = a_entry.status();
        let b_status = b_entry.status();
        assert_eq!(a_status.state, SessionState::Established);
        assert_eq!(b_status.state, SessionState::Established);
        assert_eq!(a_status.remote_router_id, Some(b_id));
        assert_eq!(b_status.remote_router_id, Some(a_id));
        // Both ends of the same TCP connection
        let (a_local, a_remote) = a_status.connection.unwrap();
        let (b_local, b_remote) = b_status.connection.unwrap();
        assert_eq!((a_local, a_remote), (b_remote, b_local));
    }
}
