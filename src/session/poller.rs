use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, timeout};

use super::{Connection, PeerEntry, Registry, SessionCommand, SessionState};

const TCP_INIT_TIMEOUT_MS: u16 = 3000;
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically dials peers that are configured for outbound sessions
/// (addressed non-passive and active-relayed) while their session is Idle
pub struct Poller {
    registry: Arc<RwLock<Registry>>,
    interval: Duration,
}

impl Poller {
    pub fn new(registry: Arc<RwLock<Registry>>, interval: Duration) -> Self {
        Self {
            registry,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = interval(self.interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.poll().await;
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Poller stopped");
    }

    /// Start a dial attempt for every idle outbound peer, returning how many
    pub async fn poll(&self) -> usize {
        let idle_peers: Vec<PeerEntry> = self
            .registry
            .read()
            .await
            .iter()
            .filter(|peer| peer.config.enabled && peer.config.dial_target().is_some())
            .filter(|peer| peer.status().state == SessionState::Idle)
            .cloned()
            .collect();
        let count = idle_peers.len();
        for peer in idle_peers {
            tokio::spawn(async move {
                let key = peer.config.key();
                if let Err(err) = connect(peer).await {
                    trace!("Initiating BGP session with {} failed: {}", key, err);
                }
            });
        }
        count
    }
}

impl fmt::Display for Poller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Poller interval={}s>", self.interval.as_secs())
    }
}

async fn connect(peer: PeerEntry) -> Result<(), io::Error> {
    let (host, port) = match peer.config.dial_target() {
        Some(target) => target,
        None => return Ok(()),
    };
    let connect = TcpStream::connect((host.as_str(), port));
    let stream = timeout(Duration::from_millis(TCP_INIT_TIMEOUT_MS.into()), connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    trace!(
        "Attempting connection to peer {} [from {}]",
        peer.config.key(),
        stream.local_addr()?,
    );
    // An inbound connection may have been bound while dialling
    if peer.status().state != SessionState::Idle {
        debug!("{} is no longer idle, dropping outbound connection", peer.config.key());
        return Ok(());
    }
    if !peer.send(SessionCommand::Connected(Connection::outbound(stream))) {
        debug!("{} was removed while dialling", peer.config.key());
    }
    Ok(())
}
