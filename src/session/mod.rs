pub mod codec;
mod dispatcher;
mod hold_timer;
mod manager;
mod message_counts;
mod poller;
mod registry;
mod session;

use std::convert::From;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use chrono::{DateTime, Duration, Utc};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::message::{notification, MessageError, Notification, Open};

pub use dispatcher::{bind_listener, DispatchError, Dispatcher};
use hold_timer::HoldTimer;
pub use manager::SessionManager;
pub use message_counts::MessageCounts;
pub use poller::Poller;
pub use registry::{PeerEntry, PeerId, Registry, RegistryError};
pub use session::Session;

pub type SessionTx = mpsc::UnboundedSender<SessionCommand>;
pub type SessionRx = mpsc::UnboundedReceiver<SessionCommand>;

/// Control messages for a running session task
#[derive(Debug)]
pub enum SessionCommand {
    /// A connection was identified as belonging to this peer
    Connected(Connection),
    /// Peer was removed, close any connection and stop
    Shutdown,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A TCP stream handed to a session, with the OPEN already read off it (if any)
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub pending_open: Option<Open>,
    pub direction: Direction,
}

impl Connection {
    pub fn inbound(stream: TcpStream, pending_open: Option<Open>) -> Self {
        Self {
            stream,
            pending_open,
            direction: Direction::Inbound,
        }
    }

    pub fn outbound(stream: TcpStream) -> Self {
        Self {
            stream,
            pending_open: None,
            direction: Direction::Outbound,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            SessionState::Idle => "Idle",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

/// Snapshot of a session, published by its task for everyone else to read
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub remote_router_id: Option<Ipv4Addr>,
    // (local, remote)
    pub connection: Option<(SocketAddr, SocketAddr)>,
    pub established_at: Option<DateTime<Utc>>,
    pub last_received: Option<DateTime<Utc>>,
    pub last_sent: Option<DateTime<Utc>>,
    // Negotiated once OPENs are exchanged, configured before that
    pub hold_time: u16,
    pub counts: MessageCounts,
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn idle(hold_time: u16) -> Self {
        Self {
            state: SessionState::Idle,
            remote_router_id: None,
            connection: None,
            established_at: None,
            last_received: None,
            last_sent: None,
            hold_time,
            counts: MessageCounts::new(),
            last_error: None,
        }
    }

    /// Established, but nothing heard from the peer for a full hold time
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.state != SessionState::Established || self.hold_time == 0 {
            return false;
        }
        match self.last_received {
            Some(last) => now.signed_duration_since(last) >= Duration::seconds(self.hold_time.into()),
            None => true,
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Peer De-configured
    Deconfigured,
    /// Replaced by a newer connection for the same peer
    Displaced,
    /// Received an unexpected ASN. [received, expected]
    OpenAsnMismatch(u32, u32),
    /// Peer presented our own router ID. [router_id]
    BadIdentifier(Ipv4Addr),
    /// Finite State Machine error, unexpected transition [minor_err_codes]
    FiniteStateMachine(u8),
    /// Hold time expired. [hold_time]
    HoldTimeExpired(u16),
    /// Undecodable message from the peer
    Malformed(MessageError),
    /// Peer sent a NOTIFICATION
    NotificationReceived(Notification),
    /// Remote side closed the connection
    TransportClosed,
    /// Something happened in transport. [reason]
    TransportError(String),
}

impl SessionError {
    /// NOTIFICATION to send before closing, if the peer should get one
    pub fn notification(&self) -> Option<Notification> {
        use SessionError::*;
        match self {
            Deconfigured => Some(Notification::cease(3)),
            // Connection collision resolution
            Displaced => Some(Notification::cease(7)),
            OpenAsnMismatch(..) => Some(Notification::new(notification::OPEN_MESSAGE_ERROR, 2)),
            BadIdentifier(_) => Some(Notification::new(notification::OPEN_MESSAGE_ERROR, 3)),
            FiniteStateMachine(minor) => Some(Notification::new(notification::FSM_ERROR, *minor)),
            HoldTimeExpired(_) => Some(Notification::new(notification::HOLD_TIMER_EXPIRED, 0)),
            Malformed(err) => Some(err.notification()),
            NotificationReceived(_) | TransportClosed | TransportError(_) => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Session Error: ")?;
        use SessionError::*;
        match self {
            Deconfigured => write!(f, "Peer De-configured")?,
            Displaced => write!(f, "Replaced by a newer connection")?,
            OpenAsnMismatch(r, e) => {
                write!(f, "Open ASN Mismatch (received={}, expected={})", r, e)?;
            }
            BadIdentifier(id) => write!(f, "Peer uses our router ID {}", id)?,
            HoldTimeExpired(h) => write!(f, "Hold time expired after {} seconds", h)?,
            FiniteStateMachine(minor) => write!(f, "Finite State Machine err [{}]", minor)?,
            Malformed(err) => write!(f, "{}", err)?,
            NotificationReceived(n) => write!(f, "NOTIFICATION received: {}", n)?,
            TransportClosed => write!(f, "Connection closed by peer")?,
            TransportError(r) => write!(f, "Transport error [{}]", r)?,
        }
        Ok(())
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::TransportError(error.to_string())
    }
}

impl From<codec::CodecError> for SessionError {
    fn from(error: codec::CodecError) -> Self {
        match error {
            codec::CodecError::Io(err) => SessionError::from(err),
            codec::CodecError::Malformed(err) => SessionError::Malformed(err),
        }
    }
}

impl error::Error for SessionError {}
