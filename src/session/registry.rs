use std::collections::{BTreeMap, HashMap};
use std::error;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{SessionCommand, SessionStatus, SessionTx};
use crate::config::{PeerConfig, PeerKey};

/// Opaque handle of a configured peer, valid until the peer is removed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub(crate) u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything the rest of the speaker needs to reach a peer's session task
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub id: PeerId,
    pub config: Arc<PeerConfig>,
    pub status: watch::Receiver<SessionStatus>,
    pub tx: SessionTx,
}

impl PeerEntry {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Returns false if the session task is gone
    pub fn send(&self, command: SessionCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

#[derive(Debug)]
pub enum RegistryError {
    /// Peer overlaps an existing entry. [key, reason]
    Conflict(PeerKey, String),
    /// No peer with this key
    NotFound(PeerKey),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryError::Conflict(key, reason) => {
                write!(f, "Peer {} conflicts with an existing peer: {}", key, reason)
            }
            RegistryError::NotFound(key) => write!(f, "No peer {} configured", key),
        }
    }
}

impl error::Error for RegistryError {}

/// Configured peers, indexed for connection identification
///
/// `peers` owns the entries; the indexes only hold ids. A peer is listed in
/// at most one of `by_addr` (addressed peers) and `by_asn` (any-source
/// peers). Active-relayed peers are in neither since they are never
/// matched inbound.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: u32,
    peers: BTreeMap<PeerId, PeerEntry>,
    by_key: HashMap<PeerKey, PeerId>,
    by_addr: HashMap<IpAddr, PeerId>,
    by_asn: HashMap<u32, PeerId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `config` could be added without touching the indexes
    pub fn check(&self, config: &PeerConfig) -> Result<(), RegistryError> {
        let key = config.key();
        if self.by_key.contains_key(&key) {
            return Err(RegistryError::Conflict(key, "already configured".to_string()));
        }
        if let Some(addr) = config.remote_addr() {
            if let Some(existing) = self.by_addr.get(&addr).and_then(|id| self.peers.get(id)) {
                return Err(RegistryError::Conflict(
                    key,
                    format!("address {} is used by {}", addr, existing.config.key()),
                ));
            }
        }
        if config.any_source() {
            if let Some(existing) = self.by_asn.get(&config.remote_as).and_then(|id| self.peers.get(id)) {
                return Err(RegistryError::Conflict(
                    key,
                    format!("AS{} is already matched to {}", config.remote_as, existing.config.key()),
                ));
            }
        }
        Ok(())
    }

    pub fn insert(
        &mut self,
        config: Arc<PeerConfig>,
        status: watch::Receiver<SessionStatus>,
        tx: SessionTx,
    ) -> Result<PeerId, RegistryError> {
        self.check(&config)?;
        let id = PeerId(self.next_id);
        self.next_id += 1;

        self.by_key.insert(config.key(), id);
        if let Some(addr) = config.remote_addr() {
            self.by_addr.insert(addr, id);
        } else if config.any_source() {
            self.by_asn.insert(config.remote_as, id);
        }
        debug!("Registered peer {} as {}", config.key(), id);
        self.peers.insert(
            id,
            PeerEntry {
                id,
                config,
                status,
                tx,
            },
        );
        Ok(id)
    }

    /// Remove a peer from the master list and every index
    pub fn remove(&mut self, key: &PeerKey) -> Result<PeerEntry, RegistryError> {
        let id = self
            .by_key
            .remove(key)
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
        self.by_addr.retain(|_, peer| *peer != id);
        self.by_asn.retain(|_, peer| *peer != id);
        let entry = self
            .peers
            .remove(&id)
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
        debug!("Unregistered peer {} ({})", key, id);
        Ok(entry)
    }

    /// Remove every peer, returning them for shutdown
    pub fn drain(&mut self) -> Vec<PeerEntry> {
        self.by_key.clear();
        self.by_addr.clear();
        self.by_asn.clear();
        std::mem::take(&mut self.peers).into_iter().map(|(_, entry)| entry).collect()
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerEntry> {
        self.peers.get(&id)
    }

    pub fn find(&self, key: &PeerKey) -> Option<&PeerEntry> {
        self.by_key.get(key).and_then(|id| self.peers.get(id))
    }

    pub fn by_addr(&self, addr: &IpAddr) -> Option<&PeerEntry> {
        self.by_addr.get(addr).and_then(|id| self.peers.get(id))
    }

    pub fn by_asn(&self, asn: u32) -> Option<&PeerEntry> {
        self.by_asn.get(&asn).and_then(|id| self.peers.get(id))
    }

    /// Are there peers that can only be identified from their OPEN
    pub fn has_mesh_peers(&self) -> bool {
        !self.by_asn.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
