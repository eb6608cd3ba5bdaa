use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use log::{trace, warn};
use tokio::sync::mpsc;

use super::{Route, RouteSource};
use crate::message::{prefix_len, Origin, Update, HEADER_LEN, MAX_MESSAGE_LEN};
use crate::session::PeerId;

/// Most prefixes packed into one outbound UPDATE
const MAX_PREFIXES_PER_UPDATE: usize = 500;
/// Bytes left for attributes and prefixes once the header and both length fields are written
const UPDATE_ROOM: usize = MAX_MESSAGE_LEN - HEADER_LEN - 4;
/// Encoded size of a /25 to /32
const MAX_PREFIX_LEN: usize = 5;
/// LOCAL_PREF attached to iBGP advertisements that don't carry one
const DEFAULT_LOCAL_PREF: u32 = 100;

/// How a peer takes part in route reflection
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PeerPolicy {
    pub ibgp: bool,
    pub route_server: bool,
}

// Everything that must match for prefixes to share an UPDATE
type PathKey = (Ipv4Addr, Origin, Vec<u32>, Option<u32>, Option<u32>, Vec<u32>);

/// An Established session's view of the RIB (Adj-RIB-Out)
///
/// Tracks what was last sent so withdrawals only go to peers that received
/// the prefix, and unchanged routes are never re-sent.
#[derive(Debug)]
pub struct Subscriber {
    tx: mpsc::UnboundedSender<Update>,
    policy: PeerPolicy,
    local_as: u32,
    remote_as: u32,
    router_id: Ipv4Addr,
    advertised: BTreeMap<Ipv4Network, Route>,
}

impl Subscriber {
    pub fn new(
        tx: mpsc::UnboundedSender<Update>,
        policy: PeerPolicy,
        local_as: u32,
        remote_as: u32,
        router_id: Ipv4Addr,
    ) -> Self {
        Self {
            tx,
            policy,
            local_as,
            remote_as,
            router_id,
            advertised: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> PeerPolicy {
        self.policy
    }

    pub fn advertised(&self) -> impl Iterator<Item = &Route> {
        self.advertised.values()
    }

    /// The route as it should be sent to this peer, or None if it must not be
    ///
    /// `origin` is the policy of the session the route was learned from
    /// (None for local routes).
    pub fn export(&self, id: PeerId, route: &Route, origin: Option<PeerPolicy>) -> Option<Route> {
        if route.source == RouteSource::Peer(id) {
            return None;
        }
        if let Some(origin) = origin {
            if origin.ibgp && self.policy.ibgp && !origin.route_server && !self.policy.route_server {
                return None;
            }
        }

        let mut exported = route.clone();
        if self.policy.ibgp {
            if exported.local_pref.is_none() {
                exported.local_pref = Some(DEFAULT_LOCAL_PREF);
            }
            if route.source.is_local() {
                exported.next_hop = self.router_id;
            }
        } else {
            // The peer would drop it anyway
            if route.as_path.contains(&self.remote_as) {
                return None;
            }
            exported.as_path.insert(0, self.local_as);
            exported.next_hop = self.router_id;
            exported.local_pref = None;
            if !route.source.is_local() {
                exported.med = None;
            }
        }
        Some(exported)
    }

    /// Bring the Adj-RIB-Out in line with the current best routes for `prefixes`
    /// and queue the resulting UPDATEs
    pub(super) fn sync<'a, F>(&mut self, id: PeerId, prefixes: &[Ipv4Network], best: F)
    where
        F: Fn(&Ipv4Network) -> Option<(&'a Route, Option<PeerPolicy>)>,
    {
        let mut withdrawn: Vec<Ipv4Network> = vec![];
        let mut announced: BTreeMap<PathKey, Vec<Ipv4Network>> = BTreeMap::new();
        let mut replaced: BTreeSet<Ipv4Network> = BTreeSet::new();

        for prefix in prefixes {
            let desired = best(prefix).and_then(|(route, origin)| self.export(id, route, origin));
            match desired {
                Some(route) => {
                    if let Some(previous) = self.advertised.get(prefix) {
                        if previous.same_path(&route) {
                            continue;
                        }
                    }
                    announced.entry(path_key(&route)).or_default().push(*prefix);
                    if self.advertised.insert(*prefix, route).is_some() {
                        replaced.insert(*prefix);
                    }
                }
                None => {
                    if self.advertised.remove(prefix).is_some() {
                        withdrawn.push(*prefix);
                    }
                }
            }
        }

        let mut updates = vec![];
        for (_, prefixes) in announced {
            let attributes = match self.advertised.get(&prefixes[0]) {
                Some(route) => route.attributes(),
                None => continue,
            };
            let attributes_len = Update::attributes_len(&attributes);
            if attributes_len + MAX_PREFIX_LEN > UPDATE_ROOM {
                warn!(
                    "Not advertising {} prefixes to {}: {} bytes of attributes leave no room for NLRI",
                    prefixes.len(),
                    id,
                    attributes_len
                );
                // Whatever the peer holds for these is now stale
                for prefix in prefixes {
                    self.advertised.remove(&prefix);
                    if replaced.contains(&prefix) {
                        withdrawn.push(prefix);
                    }
                }
                continue;
            }
            for chunk in pack(&prefixes, UPDATE_ROOM - attributes_len) {
                updates.push(Update::announce(attributes.clone(), chunk));
            }
        }

        for chunk in pack(&withdrawn, UPDATE_ROOM) {
            self.send(id, Update::withdraw(chunk));
        }
        for update in updates {
            self.send(id, update);
        }
    }

    fn send(&self, id: PeerId, update: Update) {
        trace!(
            "Queueing UPDATE for {} [{} withdrawn, {} announced]",
            id,
            update.withdrawn.len(),
            update.announced.len()
        );
        // Closed queue means the session is on its way down and will unsubscribe
        let _ = self.tx.send(update);
    }
}

// Split prefixes into runs that fit in `room` bytes and MAX_PREFIXES_PER_UPDATE
fn pack(prefixes: &[Ipv4Network], room: usize) -> Vec<Vec<Ipv4Network>> {
    let mut packed = vec![];
    let mut current = vec![];
    let mut used = 0;
    for prefix in prefixes {
        let len = prefix_len(prefix);
        if !current.is_empty() && (used + len > room || current.len() == MAX_PREFIXES_PER_UPDATE) {
            packed.push(mem::take(&mut current));
            used = 0;
        }
        current.push(*prefix);
        used += len;
    }
    if !current.is_empty() {
        packed.push(current);
    }
    packed
}

fn path_key(route: &Route) -> PathKey {
    (
        route.next_hop,
        route.origin,
        route.as_path.clone(),
        route.local_pref,
        route.med,
        route.communities.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(ibgp: bool, route_server: bool) -> (Subscriber, mpsc::UnboundedReceiver<Update>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote_as = if ibgp { 65001 } else { 65002 };
        let policy = PeerPolicy { ibgp, route_server };
        (
            Subscriber::new(tx, policy, 65001, remote_as, Ipv4Addr::new(1, 1, 1, 1)),
            rx,
        )
    }

    fn learned(prefix: &str, from: u32, as_path: Vec<u32>) -> Route {
        let mut route = Route::new(
            prefix.parse().unwrap(),
            Ipv4Addr::new(10, 0, 0, 9),
            RouteSource::Peer(peer_id(from)),
        );
        route.as_path = as_path;
        route
    }

    fn peer_id(n: u32) -> PeerId {
        PeerId(n)
    }

    #[test]
    fn test_export_ebgp() {
        let (sub, _rx) = subscriber(false, false);
        let route = learned("10.10.0.0/16", 3, vec![65003]);
        let exported = sub.export(peer_id(7), &route, Some(PeerPolicy { ibgp: false, route_server: false }));
        let exported = exported.unwrap();
        assert_eq!(exported.as_path, vec![65001, 65003]);
        assert_eq!(exported.next_hop, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(exported.local_pref, None);

        // Path already contains the peer's AS
        let looped = learned("10.11.0.0/16", 3, vec![65003, 65002]);
        assert!(sub.export(peer_id(7), &looped, None).is_none());
        // Never back to where it came from
        assert!(sub.export(peer_id(3), &route, None).is_none());
    }

    #[test]
    fn test_export_ibgp_split_horizon() {
        let ibgp = Some(PeerPolicy { ibgp: true, route_server: false });
        let route = learned("10.10.0.0/16", 3, vec![]);

        let (sub, _rx) = subscriber(true, false);
        assert!(sub.export(peer_id(7), &route, ibgp).is_none());
        // Learned over eBGP is fine
        let exported = sub.export(peer_id(7), &route, Some(PeerPolicy { ibgp: false, route_server: false }));
        assert_eq!(exported.unwrap().local_pref, Some(DEFAULT_LOCAL_PREF));

        // Either side flagged as route server reflects
        let (hub, _rx) = subscriber(true, true);
        assert!(hub.export(peer_id(7), &route, ibgp).is_some());
        assert!(sub
            .export(peer_id(7), &route, Some(PeerPolicy { ibgp: true, route_server: true }))
            .is_some());
    }

    #[test]
    fn test_sync_groups_and_withdraws() {
        let (mut sub, mut rx) = subscriber(false, false);
        let a = learned("10.1.0.0/16", 3, vec![65003]);
        let b = learned("10.2.0.0/16", 3, vec![65003]);
        let c = learned("10.3.0.0/16", 4, vec![65004, 65005]);
        let routes = vec![a.clone(), b.clone(), c.clone()];
        let prefixes: Vec<Ipv4Network> = routes.iter().map(|r| r.prefix).collect();

        sub.sync(peer_id(7), &prefixes, |p| {
            routes.iter().find(|r| r.prefix == *p).map(|r| (r, None))
        });
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        let mut sizes = vec![first.announced.len(), second.announced.len()];
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
        assert_eq!(sub.advertised().count(), 3);

        // Unchanged routes are not sent again
        sub.sync(peer_id(7), &prefixes, |p| {
            routes.iter().find(|r| r.prefix == *p).map(|r| (r, None))
        });
        assert!(rx.try_recv().is_err());

        // Withdrawn only once, and only what was advertised
        let gone = vec![c.prefix, "10.99.0.0/16".parse().unwrap()];
        sub.sync(peer_id(7), &gone, |_| None);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.withdrawn, vec![c.prefix]);
        sub.sync(peer_id(7), &gone, |_| None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sync_chunks_large_groups() {
        let (mut sub, mut rx) = subscriber(false, false);
        let routes: Vec<Route> = (0..1200u32)
            .map(|n| {
                let prefix = format!("10.{}.{}.0/24", n / 256, n % 256);
                learned(&prefix, 3, vec![65003])
            })
            .collect();
        let prefixes: Vec<Ipv4Network> = routes.iter().map(|r| r.prefix).collect();
        sub.sync(peer_id(7), &prefixes, |p| {
            routes.iter().find(|r| r.prefix == *p).map(|r| (r, None))
        });
        let sizes: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|u| u.announced.len())
            .collect();
        assert_eq!(sizes, vec![500, 500, 200]);
    }

    #[test]
    fn test_sync_splits_by_encoded_size() {
        use bytes::BytesMut;

        use crate::message::Message;

        let (mut sub, mut rx) = subscriber(false, false);
        let routes: Vec<Route> = (0..500u32)
            .map(|n| {
                let prefix = format!("10.0.{}.{}/32", n / 256, n % 256);
                let mut route = learned(&prefix, 2, vec![65002]);
                route.communities = (0..400).collect();
                route
            })
            .collect();
        let prefixes: Vec<Ipv4Network> = routes.iter().map(|r| r.prefix).collect();
        sub.sync(peer_id(7), &prefixes, |p| {
            routes.iter().find(|r| r.prefix == *p).map(|r| (r, None))
        });

        let updates: Vec<Update> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(updates.len() > 1);
        for update in &updates {
            for four_octet_asn in [true, false] {
                let mut buf = BytesMut::new();
                Message::Update(update.clone())
                    .encode(&mut buf, four_octet_asn)
                    .unwrap();
                assert!(buf.len() <= MAX_MESSAGE_LEN);
            }
        }
        let sent: usize = updates.iter().map(|u| u.announced.len()).sum();
        assert_eq!(sent, 500);
        assert_eq!(sub.advertised().count(), 500);
    }

    #[test]
    fn test_sync_skips_oversized_attributes() {
        let (mut sub, mut rx) = subscriber(false, false);
        let small = learned("10.1.0.0/16", 3, vec![65003]);
        sub.sync(peer_id(7), &[small.prefix], |_| Some((&small, None)));
        assert_eq!(rx.try_recv().unwrap().announced, vec![small.prefix]);

        // New best path whose communities alone exceed a message
        let mut huge = small.clone();
        huge.communities = (0..1100).collect();
        let other = learned("10.2.0.0/16", 3, vec![65003]);
        let mut big_other = other.clone();
        big_other.communities = huge.communities.clone();
        let routes = vec![huge, big_other];
        sub.sync(peer_id(7), &[small.prefix, other.prefix], |p| {
            routes.iter().find(|r| r.prefix == *p).map(|r| (r, None))
        });
        // The stale advertisement is withdrawn, the never-sent prefix is not
        let update = rx.try_recv().unwrap();
        assert_eq!(update.withdrawn, vec![small.prefix]);
        assert!(update.announced.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(sub.advertised().count(), 0);
    }
}
