use std::cmp;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{future, SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::codec::{read_message, MessageCodec, MessageProtocol};
use super::dispatcher::notify;
use super::{Connection, Direction, HoldTimer, MessageCounts, PeerId, SessionCommand, SessionRx};
use super::{SessionError, SessionState, SessionStatus};
use crate::config::PeerConfig;
use crate::message::{Message, Notification, Open, Update};
use crate::rib::{PeerPolicy, Rib, Route, Subscriber};
use crate::utils::format_time_as_elapsed;

// Wait for the peer's OPEN on a colliding connection
const COLLISION_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// BGP finite state machine for one configured peer
///
/// Owned by its own task for as long as the peer is configured. Connections
/// are handed in over the command channel already identified; a connection
/// that arrived through the dispatcher's sniff carries the OPEN that was read
/// off it so the exchange can continue as if nothing had been consumed.
pub struct Session {
    pub(crate) id: PeerId,
    pub(crate) config: Arc<PeerConfig>,
    label: String,
    pub(crate) state: SessionState,
    protocol: Option<MessageProtocol>,
    direction: Option<Direction>,
    pending_open: Option<Open>,
    hold_timer: HoldTimer,
    counts: MessageCounts,
    remote_router_id: Option<Ipv4Addr>,
    connection: Option<(SocketAddr, SocketAddr)>,
    connect_time: Option<DateTime<Utc>>,
    established_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    rx: SessionRx,
    outbound: Option<mpsc::UnboundedReceiver<Update>>,
    status: watch::Sender<SessionStatus>,
    rib: Arc<RwLock<Rib>>,
}

impl Session {
    pub fn new(
        id: PeerId,
        config: Arc<PeerConfig>,
        rx: SessionRx,
        status: watch::Sender<SessionStatus>,
        rib: Arc<RwLock<Rib>>,
    ) -> Session {
        let hold_timer = config.hold_timer;
        Session {
            id,
            label: config.key().to_string(),
            config,
            state: SessionState::Idle,
            protocol: None,
            direction: None,
            pending_open: None,
            hold_timer: HoldTimer::new(hold_timer),
            counts: MessageCounts::new(),
            remote_router_id: None,
            connection: None,
            connect_time: None,
            established_at: None,
            last_error: None,
            rx,
            outbound: None,
            status,
            rib,
        }
    }

    /// Process commands until the peer is removed
    ///
    /// Each identified connection is run to completion; a connection that
    /// displaces the current one is picked up straight away.
    pub async fn serve(mut self) {
        while let Some(command) = self.rx.recv().await {
            let mut next = match command {
                SessionCommand::Connected(connection) => Some(connection),
                SessionCommand::Shutdown => break,
            };
            while let Some(connection) = next.take() {
                self.accept_connection(connection);
                match self.run().await {
                    Ok(newer) => {
                        self.close(SessionError::Displaced).await;
                        next = Some(newer);
                    }
                    Err(SessionError::Deconfigured) => {
                        self.close(SessionError::Deconfigured).await;
                        debug!("[{}] Session task stopped", self.label);
                        return;
                    }
                    Err(err) => self.close(err).await,
                }
            }
        }
        debug!("[{}] Session task stopped", self.label);
    }

    /// Bind a connection to this session, replacing any previous one
    pub fn accept_connection(&mut self, connection: Connection) {
        let Connection {
            stream,
            pending_open,
            direction,
        } = connection;
        self.connection = stream.local_addr().ok().zip(stream.peer_addr().ok());
        debug!(
            "[{}] {:?} connection accepted {}",
            self.label,
            direction,
            self.connection
                .map(|(_, remote)| remote.to_string())
                .unwrap_or_default(),
        );
        self.protocol = Some(Framed::new(stream, MessageCodec::new()));
        self.direction = Some(direction);
        self.pending_open = pending_open;
        self.hold_timer = HoldTimer::new(self.config.hold_timer);
        self.counts = MessageCounts::new();
        self.connect_time = Some(Utc::now());
        self.last_error = None;
        self.publish();
    }

    /// Drive the bound connection until it fails or is displaced
    ///
    /// Returns the newer connection that should replace this one.
    pub async fn run(&mut self) -> Result<Connection, SessionError> {
        let open = Open::new(
            self.config.local_as,
            self.config.hold_timer,
            self.config.local_router_id,
        );
        self.send_message(Message::Open(open)).await?;
        self.update_state(SessionState::OpenSent);

        if let Some(open) = self.pending_open.take() {
            trace!("[{}] Replaying OPEN from identification", self.label);
            self.counts.increment_received();
            self.hold_timer.received();
            self.process_message(Message::Open(open)).await?;
        }
        self.publish();

        loop {
            tokio::select! {
                message = recv_message(&mut self.protocol) => {
                    let message = message?;
                    trace!("[{}] Incoming: {}", self.label, message.kind());
                    self.counts.increment_received();
                    self.hold_timer.received();
                    self.process_message(message).await?;
                    self.publish();
                },
                keepalive = self.hold_timer.keepalive_due() => {
                    let should_send = keepalive?;
                    if should_send && self.state != SessionState::OpenSent {
                        self.send_message(Message::KeepAlive).await?;
                        self.publish();
                    }
                },
                Some(update) = next_outbound(&mut self.outbound) => {
                    self.send_update(update).await?;
                    self.publish();
                },
                command = self.rx.recv() => {
                    match command {
                        Some(SessionCommand::Connected(newer)) => {
                            if let Some(newer) = self.resolve_collision(newer).await {
                                return Ok(newer);
                            }
                        }
                        Some(SessionCommand::Shutdown) | None => {
                            return Err(SessionError::Deconfigured);
                        }
                    }
                },
            }
        }
    }

    /// Pick between the running connection and a newer one for the same peer,
    /// returning the newer one if it should take over
    ///
    /// When one connection was dialled by us and the other by the peer, and
    /// the running one is not yet Established, the connection opened by the
    /// speaker with the higher BGP identifier is kept (RFC 4271 [6.8]). A
    /// newer inbound connection otherwise replaces the running one, and a
    /// redundant outbound one is dropped.
    async fn resolve_collision(&mut self, mut newer: Connection) -> Option<Connection> {
        let current = match self.direction {
            Some(direction) if self.state != SessionState::Established => direction,
            _ => return self.inbound_only(newer).await,
        };
        if current == newer.direction {
            return self.inbound_only(newer).await;
        }
        let known = newer
            .pending_open
            .as_ref()
            .map(|open| open.router_id)
            .or(self.remote_router_id);
        let remote_id = match known {
            Some(remote_id) => remote_id,
            // The peer speaks first on any connection it has bound; the OPEN is kept for replay
            None => match timeout(COLLISION_OPEN_TIMEOUT, read_message(&mut newer.stream)).await {
                Ok(Ok(Message::Open(open))) => {
                    let remote_id = open.router_id;
                    newer.pending_open = Some(open);
                    remote_id
                }
                _ => {
                    debug!("[{}] No OPEN on colliding connection, dropping it", self.label);
                    return None;
                }
            },
        };
        let keep_ours = self.config.local_router_id > remote_id;
        let keep_newer = keep_ours == (newer.direction == Direction::Outbound);
        debug!(
            "[{}] Connection collision with {}: keeping the {} connection",
            self.label,
            remote_id,
            if keep_ours { "outbound" } else { "inbound" },
        );
        if keep_newer {
            Some(newer)
        } else {
            notify(&mut newer.stream, Notification::cease(7)).await;
            None
        }
    }

    // Newer inbound connections take over, outbound ones are redundant
    async fn inbound_only(&self, mut newer: Connection) -> Option<Connection> {
        match newer.direction {
            Direction::Inbound => Some(newer),
            Direction::Outbound => {
                debug!("[{}] Already connected, dropping outbound connection", self.label);
                notify(&mut newer.stream, Notification::cease(7)).await;
                None
            }
        }
    }

    pub async fn process_message(&mut self, message: Message) -> Result<(), SessionError> {
        use SessionState::*;
        match (self.state, message) {
            (_, Message::Notification(notification)) => {
                Err(SessionError::NotificationReceived(notification))
            }
            (OpenSent, Message::Open(open)) => {
                self.open_received(open)?;
                self.send_message(Message::KeepAlive).await?;
                self.update_state(OpenConfirm);
                Ok(())
            }
            (OpenConfirm, Message::KeepAlive) => {
                self.update_state(Established);
                self.subscribe().await;
                Ok(())
            }
            (Established, Message::KeepAlive) => Ok(()),
            (Established, Message::Update(update)) => self.handle_update(update).await,
            (state, message) => {
                debug!("[{}] Unexpected {} in {}", self.label, message.kind(), state);
                Err(SessionError::FiniteStateMachine(fsm_err_for_state(state)))
            }
        }
    }

    /// Validate the peer's OPEN and negotiate from it
    fn open_received(&mut self, open: Open) -> Result<(), SessionError> {
        if open.asn != self.config.remote_as {
            return Err(SessionError::OpenAsnMismatch(open.asn, self.config.remote_as));
        }
        if open.router_id == self.config.local_router_id {
            return Err(SessionError::BadIdentifier(open.router_id));
        }
        let hold_timer = cmp::min(open.hold_time, self.config.hold_timer);
        debug!(
            "[{}] Received OPEN from {} [hold_time={}, {} capabilities]",
            self.label,
            open.router_id,
            hold_timer,
            open.capabilities.len()
        );
        self.hold_timer = HoldTimer::new(hold_timer);
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.codec_mut().four_octet_asn = open.supports_four_octet_asn();
        }
        self.remote_router_id = Some(open.router_id);
        Ok(())
    }

    /// Start receiving RIB changes, beginning with the full initial advertisement
    async fn subscribe(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(rx);
        self.established_at = Some(Utc::now());
        let policy = PeerPolicy {
            ibgp: !self.config.is_ebgp(),
            route_server: self.config.route_server,
        };
        let subscriber = Subscriber::new(
            tx,
            policy,
            self.config.local_as,
            self.config.remote_as,
            self.config.local_router_id,
        );
        self.rib.write().await.subscribe(self.id, subscriber);
        info!(
            "[{}] Session established with {}",
            self.label,
            self.remote_router_id
                .map(|id| id.to_string())
                .unwrap_or_default()
        );
    }

    /// Apply a received UPDATE to the RIB under this session's attribution
    pub async fn handle_update(&mut self, update: Update) -> Result<(), SessionError> {
        update.validate().map_err(SessionError::Malformed)?;
        if update.is_end_of_rib() {
            debug!("[{}] Received End-of-RIB", self.label);
            return Ok(());
        }
        let looped = update
            .as_path()
            .map(|path| path.contains(&self.config.local_as))
            .unwrap_or(false);
        let announced = if looped {
            debug!(
                "[{}] Ignoring {} prefixes with AS{} in path",
                self.label,
                update.announced.len(),
                self.config.local_as
            );
            vec![]
        } else {
            Route::from_update(&update, self.id)
        };
        trace!(
            "[{}] UPDATE [{} withdrawn, {} announced]",
            self.label,
            update.withdrawn.len(),
            announced.len()
        );
        self.counts.add_prefixes_received(announced.len());
        self.rib
            .write()
            .await
            .apply_update(self.id, &update.withdrawn, announced);
        Ok(())
    }

    /// Tear down the current connection, if any, and return to Idle
    pub async fn close(&mut self, reason: SessionError) {
        if self.protocol.is_some() {
            if let Some(notification) = reason.notification() {
                if let Err(err) = self.send_message(Message::Notification(notification)).await {
                    debug!("[{}] Could not send NOTIFICATION: {}", self.label, err);
                }
            }
        }
        self.protocol = None;
        self.direction = None;
        self.pending_open = None;
        self.outbound = None;
        self.connection = None;
        self.connect_time = None;
        self.established_at = None;
        self.remote_router_id = None;
        self.hold_timer = HoldTimer::new(self.config.hold_timer);
        {
            let mut rib = self.rib.write().await;
            rib.unsubscribe(self.id);
            rib.withdraw_all(self.id);
        }
        match reason {
            SessionError::Deconfigured | SessionError::Displaced => {
                info!("[{}] {}", self.label, reason);
            }
            _ => warn!("[{}] {}", self.label, reason),
        }
        self.last_error = Some(reason.to_string());
        self.update_state(SessionState::Idle);
        self.publish();
    }

    async fn send_update(&mut self, update: Update) -> Result<(), SessionError> {
        self.counts.add_prefixes_sent(update.announced.len());
        self.send_message(Message::Update(update)).await
    }

    // Send a message, and flush the send buffer afterwards
    async fn send_message(&mut self, message: Message) -> Result<(), SessionError> {
        let protocol = self
            .protocol
            .as_mut()
            .ok_or(SessionError::TransportClosed)?;
        trace!("[{}] Outgoing: {}", self.label, message.kind());
        protocol.send(message).await?;
        self.counts.increment_sent();
        self.hold_timer.sent();
        Ok(())
    }

    fn update_state(&mut self, new_state: SessionState) {
        if self.state != new_state {
            debug!("[{}] went from {} to {}", self.label, self.state, new_state);
        }
        self.state = new_state;
    }

    /// Share the current state with the registry and API
    fn publish(&self) {
        let connected = self.protocol.is_some();
        let status = SessionStatus {
            state: self.state,
            remote_router_id: self.remote_router_id,
            connection: self.connection,
            established_at: self.established_at,
            last_received: Some(self.hold_timer.last_received()).filter(|_| connected),
            last_sent: Some(self.hold_timer.last_sent()).filter(|_| connected),
            hold_time: self.hold_timer.hold_time(),
            counts: self.counts,
            last_error: self.last_error.clone(),
        };
        // Receivers only go away once the peer is removed
        let _ = self.status.send(status);
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Session {} state={} uptime={} hold_time={}>",
            self.label,
            self.state,
            self.connect_time
                .map(format_time_as_elapsed)
                .unwrap_or_default(),
            self.hold_timer,
        )
    }
}

async fn recv_message(protocol: &mut Option<MessageProtocol>) -> Result<Message, SessionError> {
    match protocol {
        Some(protocol) => match protocol.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(err)) => Err(err.into()),
            // Framed stream is exhausted, remote side closed connection
            None => Err(SessionError::TransportClosed),
        },
        None => Err(SessionError::TransportClosed),
    }
}

async fn next_outbound(outbound: &mut Option<mpsc::UnboundedReceiver<Update>>) -> Option<Update> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

fn fsm_err_for_state(state: SessionState) -> u8 {
    use SessionState::*;
    match state {
        OpenSent => 1,
        OpenConfirm => 2,
        Established => 3,
        Idle => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;
    use crate::config::PeerKind;
    use crate::message::{notification, Origin, PathAttribute};
    use crate::session::SessionTx;

    const LOCAL_ID: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
    const REMOTE_ID: Ipv4Addr = Ipv4Addr::new(2, 2, 2, 2);

    type Remote = Framed<TcpStream, MessageCodec>;

    struct Harness {
        tx: SessionTx,
        status: watch::Receiver<SessionStatus>,
        rib: Arc<RwLock<Rib>>,
        task: JoinHandle<()>,
    }

    fn start(remote_as: u32) -> Harness {
        start_with(PeerConfig::new(PeerKind::PassiveRelayed, remote_as, 65001, LOCAL_ID))
    }

    fn start_with(config: PeerConfig) -> Harness {
        let config = Arc::new(config);
        let rib = Arc::new(RwLock::new(Rib::new(LOCAL_ID)));
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::idle(config.hold_timer));
        let session = Session::new(PeerId(1), config, rx, status_tx, rib.clone());
        let task = tokio::spawn(session.serve());
        Harness { tx, status, rib, task }
    }

    async fn pair() -> (TcpStream, Remote) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = TcpStream::connect(addr).await.unwrap();
        let (local, _) = listener.accept().await.unwrap();
        (local, Framed::new(remote, MessageCodec::new()))
    }

    async fn recv(remote: &mut Remote) -> Message {
        timeout(Duration::from_secs(5), remote.next())
            .await
            .expect("Message within timeout")
            .expect("Stream open")
            .expect("Valid message")
    }

    async fn wait_for(status: &mut watch::Receiver<SessionStatus>, state: SessionState) {
        timeout(Duration::from_secs(5), async {
            while status.borrow().state != state {
                status.changed().await.unwrap();
            }
        })
        .await
        .expect("State reached within timeout");
    }

    /// Bring a session up with an OPEN replayed from identification
    async fn establish(harness: &mut Harness) -> Remote {
        establish_with(harness, Open::new(65002, 90, REMOTE_ID), true).await
    }

    /// Bring a session up, either replaying `open` or sending it over the wire
    async fn establish_with(harness: &mut Harness, open: Open, replay: bool) -> Remote {
        let (local, mut remote) = pair().await;
        let pending_open = if replay { Some(open.clone()) } else { None };
        let connection = Connection::inbound(local, pending_open);
        assert!(harness.tx.send(SessionCommand::Connected(connection)).is_ok());

        match recv(&mut remote).await {
            Message::Open(open) => {
                assert_eq!(open.asn, 65001);
                assert_eq!(open.router_id, LOCAL_ID);
            }
            other => panic!("Expected OPEN, got {:?}", other),
        }
        // A replayed OPEN is answered without the peer sending anything
        if !replay {
            remote.send(Message::Open(open)).await.unwrap();
        }
        assert_eq!(recv(&mut remote).await, Message::KeepAlive);
        remote.send(Message::KeepAlive).await.unwrap();
        wait_for(&mut harness.status, SessionState::Established).await;
        remote
    }

    #[tokio::test]
    async fn test_replayed_open_establishes() {
        let mut harness = start(65002);
        let mut remote = establish(&mut harness).await;
        {
            let status = harness.status.borrow();
            assert_eq!(status.remote_router_id, Some(REMOTE_ID));
            assert_eq!(status.hold_time, 90);
        }

        // Initial advertisement carries the identity route
        match recv(&mut remote).await {
            Message::Update(update) => {
                assert_eq!(update.announced, vec!["1.1.1.1/32".parse().unwrap()]);
                assert_eq!(update.as_path(), Some(&[65001][..]));
            }
            other => panic!("Expected UPDATE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wire_open_matches_replayed_open() {
        let open = Open::new(65002, 90, REMOTE_ID);
        let mut outcomes = vec![];
        for replay in [true, false] {
            let mut harness = start(65002);
            let mut remote = establish_with(&mut harness, open.clone(), replay).await;
            let update = match recv(&mut remote).await {
                Message::Update(update) => update,
                other => panic!("Expected UPDATE, got {:?}", other),
            };
            let status = harness.status.borrow().clone();
            outcomes.push((
                status.state,
                status.remote_router_id,
                status.hold_time,
                status.counts.received(),
                update,
            ));
        }
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(outcomes[0].0, SessionState::Established);
        assert_eq!(outcomes[0].1, Some(REMOTE_ID));
        assert_eq!(outcomes[0].3, 2);
        assert_eq!(outcomes[0].4.announced, vec!["1.1.1.1/32".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_hold_timer_expiry() {
        let mut harness = start(65002);
        let mut remote = establish_with(&mut harness, Open::new(65002, 3, REMOTE_ID), true).await;
        assert_eq!(harness.status.borrow().hold_time, 3);
        let update = Update::announce(
            vec![
                PathAttribute::Origin(Origin::Igp),
                PathAttribute::AsPath(vec![65002]),
                PathAttribute::NextHop(REMOTE_ID),
            ],
            vec!["10.2.0.0/16".parse().unwrap()],
        );
        remote.send(Message::Update(update)).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while harness.status.borrow().counts.prefixes_received() < 1 {
                harness.status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(harness.rib.read().await.routes_from(PeerId(1)).len(), 1);

        // Go quiet: the session keeps sending KEEPALIVEs, then gives up
        loop {
            match recv(&mut remote).await {
                Message::Notification(notif) => {
                    assert_eq!((notif.code, notif.subcode), (notification::HOLD_TIMER_EXPIRED, 0));
                    break;
                }
                Message::Update(_) | Message::KeepAlive => continue,
                other => panic!("Expected NOTIFICATION, got {:?}", other),
            }
        }
        wait_for(&mut harness.status, SessionState::Idle).await;
        assert!(harness.rib.read().await.routes_from(PeerId(1)).is_empty());
        let status = harness.status.borrow().clone();
        assert!(status.last_error.unwrap().contains("Hold time expired"));
    }

    #[tokio::test]
    async fn test_open_asn_mismatch() {
        let mut harness = start(65009);
        let (local, mut remote) = pair().await;
        let connection = Connection::inbound(local, Some(Open::new(65002, 90, REMOTE_ID)));
        assert!(harness.tx.send(SessionCommand::Connected(connection)).is_ok());

        assert!(matches!(recv(&mut remote).await, Message::Open(_)));
        match recv(&mut remote).await {
            Message::Notification(notif) => {
                assert_eq!(notif.code, notification::OPEN_MESSAGE_ERROR);
                assert_eq!(notif.subcode, 2);
            }
            other => panic!("Expected NOTIFICATION, got {:?}", other),
        }
        timeout(Duration::from_secs(5), async {
            while harness.status.borrow().last_error.is_none() {
                harness.status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(harness.status.borrow().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_own_router_id_rejected() {
        let harness = start(65002);
        let (local, mut remote) = pair().await;
        let connection = Connection::inbound(local, Some(Open::new(65002, 90, LOCAL_ID)));
        assert!(harness.tx.send(SessionCommand::Connected(connection)).is_ok());

        assert!(matches!(recv(&mut remote).await, Message::Open(_)));
        match recv(&mut remote).await {
            Message::Notification(notif) => assert_eq!((notif.code, notif.subcode), (2, 3)),
            other => panic!("Expected NOTIFICATION, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_learned_routes_withdrawn_on_close() {
        let mut harness = start(65002);
        let mut remote = establish(&mut harness).await;
        let update = Update::announce(
            vec![
                PathAttribute::Origin(Origin::Igp),
                PathAttribute::AsPath(vec![65002]),
                PathAttribute::NextHop(REMOTE_ID),
            ],
            vec!["10.2.0.0/16".parse().unwrap(), "10.3.0.0/16".parse().unwrap()],
        );
        remote.send(Message::Update(update)).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while harness.status.borrow().counts.prefixes_received() < 2 {
                harness.status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(harness.rib.read().await.routes_from(PeerId(1)).len(), 2);

        drop(remote);
        wait_for(&mut harness.status, SessionState::Idle).await;
        assert!(harness.rib.read().await.routes_from(PeerId(1)).is_empty());
        // Withdrawing again is harmless
        assert!(harness.rib.write().await.withdraw_all(PeerId(1)).is_empty());
    }

    #[tokio::test]
    async fn test_looped_path_ignored() {
        let mut harness = start(65002);
        let mut remote = establish(&mut harness).await;
        let update = Update::announce(
            vec![
                PathAttribute::Origin(Origin::Igp),
                PathAttribute::AsPath(vec![65002, 65001]),
                PathAttribute::NextHop(REMOTE_ID),
            ],
            vec!["10.2.0.0/16".parse().unwrap()],
        );
        remote.send(Message::Update(update)).await.unwrap();
        remote.send(Message::KeepAlive).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while harness.status.borrow().counts.received() < 3 {
                harness.status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(harness.rib.read().await.routes_from(PeerId(1)).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_sends_cease() {
        let mut harness = start(65002);
        let mut remote = establish(&mut harness).await;
        assert!(harness.tx.send(SessionCommand::Shutdown).is_ok());

        loop {
            match recv(&mut remote).await {
                Message::Notification(notif) => {
                    assert_eq!((notif.code, notif.subcode), (notification::CEASE, 3));
                    break;
                }
                Message::Update(_) | Message::KeepAlive => continue,
                other => panic!("Expected NOTIFICATION, got {:?}", other),
            }
        }
        timeout(Duration::from_secs(5), harness.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_newer_connection_displaces() {
        let mut harness = start(65002);
        let mut first = establish(&mut harness).await;
        let mut second = establish(&mut harness).await;

        loop {
            match recv(&mut first).await {
                Message::Notification(notif) => {
                    assert_eq!((notif.code, notif.subcode), (notification::CEASE, 7));
                    break;
                }
                Message::Update(_) | Message::KeepAlive => continue,
                other => panic!("Expected NOTIFICATION, got {:?}", other),
            }
        }
        assert!(matches!(recv(&mut second).await, Message::Update(_)));
    }
}
