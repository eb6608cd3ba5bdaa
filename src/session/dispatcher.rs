use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use log::{debug, info, trace, warn};
use net2::TcpBuilder;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;

use super::codec::{read_message, CodecError};
use super::{Connection, PeerEntry, PeerId, Registry, SessionCommand, SessionState};
use crate::config::PeerKey;
use crate::message::{notification, Message, Notification, Open};

/// Why an inbound connection was not handed to a session
///
/// Only ever affects the one connection, the listener keeps running.
#[derive(Debug)]
pub enum DispatchError {
    /// No OPEN could be read to identify the peer. [remote, reason]
    UnidentifiedPeer(SocketAddr, String),
    /// OPEN carried an AS no any-source peer is configured for. [remote, asn]
    UnknownMeshPeer(SocketAddr, u32),
    /// Address is not configured and no peers are matched by AS
    UnmatchedConnection(SocketAddr),
    /// Matched a peer that is administratively disabled
    PeerDisabled(PeerKey),
    /// Matched peer already has a live established session
    SessionActive(PeerKey),
    /// Matched peer was removed while the connection was being identified
    SessionGone(PeerKey),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use DispatchError::*;
        match self {
            UnidentifiedPeer(remote, reason) => {
                write!(f, "Could not identify connection from {}: {}", remote, reason)
            }
            UnknownMeshPeer(remote, asn) => {
                write!(f, "Connection from {} with unknown AS{}", remote, asn)
            }
            UnmatchedConnection(remote) => {
                write!(f, "Unexpected connection from {}: Not a configured peer", remote)
            }
            PeerDisabled(key) => write!(f, "Connection for disabled peer {}", key),
            SessionActive(key) => {
                write!(f, "Connection for {}: Already have an existing session", key)
            }
            SessionGone(key) => write!(f, "Peer {} was removed", key),
        }
    }
}

impl error::Error for DispatchError {}

/// Matches inbound connections to configured peers
///
/// Peers with a known address are matched on the remote IP without reading
/// anything. Otherwise the first message is read off the socket and the
/// AS from its OPEN picks the peer; the OPEN travels with the connection so
/// the session can replay it.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RwLock<Registry>>,
    sniff_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<RwLock<Registry>>, sniff_timeout: Duration) -> Self {
        Self {
            registry,
            sniff_timeout,
        }
    }

    /// Accept connections until `shutdown` changes
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                incoming = listener.accept() => {
                    match incoming {
                        Ok((stream, remote)) => {
                            debug!("Incoming new connection from {}", remote);
                            let dispatcher = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = dispatcher.dispatch(stream, remote).await {
                                    warn!("{}", err);
                                }
                            });
                        }
                        Err(err) => warn!("Incoming connection failed: {}", err),
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Stopped accepting BGP connections");
    }

    /// Identify a single inbound connection and hand it to its session
    pub async fn dispatch(&self, stream: TcpStream, remote: SocketAddr) -> Result<PeerId, DispatchError> {
        let (entry, mut stream, open) = self.identify(stream, remote).await?;
        let key = entry.config.key();

        if !entry.config.enabled {
            notify(&mut stream, Notification::cease(2)).await;
            return Err(DispatchError::PeerDisabled(key));
        }
        let status = entry.status();
        if status.state == SessionState::Established && !status.is_stale(Utc::now()) {
            notify(&mut stream, Notification::cease(7)).await;
            return Err(DispatchError::SessionActive(key));
        }
        if !entry.send(SessionCommand::Connected(Connection::inbound(stream, open))) {
            return Err(DispatchError::SessionGone(key));
        }
        debug!("Connection from {} handed to {} ({})", remote, key, entry.id);
        Ok(entry.id)
    }

    async fn identify(
        &self,
        mut stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<(PeerEntry, TcpStream, Option<Open>), DispatchError> {
        let addr = canonical_addr(remote.ip());
        let (by_addr, has_mesh_peers) = {
            let registry = self.registry.read().await;
            (registry.by_addr(&addr).cloned(), registry.has_mesh_peers())
        };
        if let Some(entry) = by_addr {
            trace!("{} matched by address", remote);
            return Ok((entry, stream, None));
        }
        if !has_mesh_peers {
            return Err(DispatchError::UnmatchedConnection(remote));
        }

        let open = self.sniff_open(&mut stream, remote).await?;
        let entry = self.registry.read().await.by_asn(open.asn).cloned();
        match entry {
            Some(entry) => {
                trace!("{} matched by AS{}", remote, open.asn);
                Ok((entry, stream, Some(open)))
            }
            None => {
                notify(
                    &mut stream,
                    Notification::new(notification::OPEN_MESSAGE_ERROR, 2),
                )
                .await;
                Err(DispatchError::UnknownMeshPeer(remote, open.asn))
            }
        }
    }

    // Read the first message, which must be an OPEN, within the sniff timeout
    async fn sniff_open(&self, stream: &mut TcpStream, remote: SocketAddr) -> Result<Open, DispatchError> {
        match timeout(self.sniff_timeout, read_message(stream)).await {
            Ok(Ok(Message::Open(open))) => Ok(open),
            Ok(Ok(other)) => {
                notify(stream, Notification::new(notification::FSM_ERROR, 0)).await;
                Err(DispatchError::UnidentifiedPeer(
                    remote,
                    format!("expected OPEN, received {}", other.kind()),
                ))
            }
            Ok(Err(CodecError::Malformed(err))) => {
                notify(stream, err.notification()).await;
                Err(DispatchError::UnidentifiedPeer(remote, err.to_string()))
            }
            Ok(Err(CodecError::Io(err))) => Err(DispatchError::UnidentifiedPeer(remote, err.to_string())),
            Err(_) => Err(DispatchError::UnidentifiedPeer(
                remote,
                format!("no OPEN within {}s", self.sniff_timeout.as_secs_f32()),
            )),
        }
    }
}

/// Bind a listening socket with SO_REUSEADDR and hand it to tokio
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let builder = match addr {
        SocketAddr::V4(_) => TcpBuilder::new_v4()?,
        SocketAddr::V6(_) => TcpBuilder::new_v6()?,
    };
    builder.reuse_address(true)?;
    builder.bind(addr)?;
    let listener = builder.listen(128)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// Best effort NOTIFICATION on a connection that is about to be dropped
pub(super) async fn notify(stream: &mut TcpStream, notification: Notification) {
    let mut buf = BytesMut::new();
    match Message::Notification(notification).encode(&mut buf, true) {
        Ok(()) => {
            if let Err(err) = stream.write_all(&buf).await {
                trace!("Could not send NOTIFICATION: {}", err);
            }
        }
        Err(err) => trace!("Could not encode NOTIFICATION: {}", err),
    }
    let _ = stream.shutdown().await;
}

// IPv4 peers reaching a dual-stack listener show up as ::ffff:a.b.c.d
fn canonical_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            if octets[..10].iter().all(|o| *o == 0) && octets[10] == 0xff && octets[11] == 0xff {
                IpAddr::V4(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
            } else {
                addr
            }
        }
        IpAddr::V4(_) => addr,
    }
}
