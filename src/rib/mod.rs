mod session;

pub use session::{PeerPolicy, Subscriber};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use log::trace;

use crate::message::{Origin, PathAttribute, Update};
use crate::session::PeerId;
use crate::utils::format_time_as_elapsed;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteSource {
    Api,
    Config,
    Peer(PeerId),
}

impl RouteSource {
    /// Originated by this speaker
    pub fn is_local(&self) -> bool {
        !matches!(self, RouteSource::Peer(_))
    }
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use RouteSource::*;
        let display = match self {
            Api => "API".to_string(),
            Config => "Config".to_string(),
            Peer(id) => id.to_string(),
        };
        write!(f, "{}", display)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub prefix: Ipv4Network,
    pub next_hop: Ipv4Addr,
    pub origin: Origin,
    pub as_path: Vec<u32>,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
    pub communities: Vec<u32>,
    pub source: RouteSource,
    pub learned_at: DateTime<Utc>,
}

impl Route {
    pub fn new(prefix: Ipv4Network, next_hop: Ipv4Addr, source: RouteSource) -> Self {
        Self {
            prefix,
            next_hop,
            origin: Origin::Igp,
            as_path: vec![],
            local_pref: None,
            med: None,
            communities: vec![],
            source,
            learned_at: Utc::now(),
        }
    }

    /// Announced prefixes of an UPDATE (already validated) as routes from `peer`
    pub fn from_update(update: &Update, peer: PeerId) -> Vec<Route> {
        let next_hop = match update.next_hop() {
            Some(next_hop) => next_hop,
            None => return vec![],
        };
        let learned_at = Utc::now();
        // Prefix is filled in per announcement
        let mut template = Route::new(Ipv4Network::from(next_hop), next_hop, RouteSource::Peer(peer));
        template.learned_at = learned_at;
        for attribute in &update.attributes {
            match attribute {
                PathAttribute::Origin(origin) => template.origin = *origin,
                PathAttribute::AsPath(path) => template.as_path = path.clone(),
                PathAttribute::LocalPref(pref) => template.local_pref = Some(*pref),
                PathAttribute::MultiExitDisc(med) => template.med = Some(*med),
                PathAttribute::Communities(communities) => template.communities = communities.clone(),
                _ => (),
            }
        }
        update
            .announced
            .iter()
            .map(|prefix| Route {
                prefix: *prefix,
                ..template.clone()
            })
            .collect()
    }

    /// Same path and attributes, regardless of when it was learned
    pub fn same_path(&self, other: &Route) -> bool {
        self.prefix == other.prefix
            && self.next_hop == other.next_hop
            && self.origin == other.origin
            && self.as_path == other.as_path
            && self.local_pref == other.local_pref
            && self.med == other.med
            && self.communities == other.communities
            && self.source == other.source
    }

    pub fn attributes(&self) -> Vec<PathAttribute> {
        let mut attributes = vec![
            PathAttribute::Origin(self.origin),
            PathAttribute::AsPath(self.as_path.clone()),
            PathAttribute::NextHop(self.next_hop),
        ];
        if let Some(med) = self.med {
            attributes.push(PathAttribute::MultiExitDisc(med));
        }
        if let Some(pref) = self.local_pref {
            attributes.push(PathAttribute::LocalPref(pref));
        }
        if !self.communities.is_empty() {
            attributes.push(PathAttribute::Communities(self.communities.clone()));
        }
        attributes
    }

    // Lower sorts first: local routes, then shortest AS path, then oldest
    fn preference(&self) -> (bool, usize, DateTime<Utc>, RouteSource) {
        (
            !self.source.is_local(),
            self.as_path.len(),
            self.learned_at,
            self.source,
        )
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Route {} via {} source={} age={}>",
            self.prefix,
            self.next_hop,
            self.source,
            format_time_as_elapsed(self.learned_at),
        )
    }
}

/// A local route change refused because another source originates the prefix
#[derive(Debug, Clone, PartialEq)]
pub struct NotOwner {
    pub prefix: Ipv4Network,
    pub owner: RouteSource,
}

impl fmt::Display for NotOwner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} is originated by {}", self.prefix, self.owner)
    }
}

impl error::Error for NotOwner {}

/// Prefixes whose best route changed after a RIB operation
#[derive(Debug, Default, PartialEq)]
pub struct RibChanges {
    pub updated: Vec<Ipv4Network>,
    pub removed: Vec<Ipv4Network>,
}

impl RibChanges {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// A route in a RIB snapshot, flagged if it is the best one for its prefix
#[derive(Debug, Clone)]
pub struct RibEntry {
    pub route: Route,
    pub best: bool,
}

/// Routing table shared by every session
///
/// Holds locally originated routes, the routes learned from each session
/// (Adj-RIB-In) and the best route per prefix. Every change to a best route
/// is pushed to the subscribed sessions other than the one it came from.
#[derive(Debug)]
pub struct Rib {
    router_id: Ipv4Addr,
    local: BTreeMap<Ipv4Network, Route>,
    learned: HashMap<PeerId, BTreeMap<Ipv4Network, Route>>,
    best: BTreeMap<Ipv4Network, RouteSource>,
    subscribers: BTreeMap<PeerId, Subscriber>,
}

impl Rib {
    /// New RIB holding the identity route of `router_id`
    pub fn new(router_id: Ipv4Addr) -> Self {
        let mut rib = Self {
            router_id,
            local: BTreeMap::new(),
            learned: HashMap::new(),
            best: BTreeMap::new(),
            subscribers: BTreeMap::new(),
        };
        let identity = Route::new(Ipv4Network::from(router_id), router_id, RouteSource::Config);
        let prefix = identity.prefix;
        rib.mutate(vec![prefix], |rib| {
            rib.local.insert(prefix, identity);
        });
        rib
    }

    /// The `{router-id}/32` host route this speaker always advertises
    pub fn identity_prefix(&self) -> Ipv4Network {
        Ipv4Network::from(self.router_id)
    }

    /// Add or replace a locally originated route
    ///
    /// A prefix already originated by a different local source (API or
    /// config) is left untouched.
    pub fn originate(&mut self, route: Route) -> Result<RibChanges, NotOwner> {
        let prefix = route.prefix;
        if let Some(existing) = self.local.get(&prefix) {
            if existing.source != route.source {
                return Err(NotOwner {
                    prefix,
                    owner: existing.source,
                });
            }
        }
        Ok(self.mutate(vec![prefix], |rib| {
            rib.local.insert(prefix, route);
        }))
    }

    /// Stop originating a prefix on behalf of `source`
    ///
    /// Only a route originated by that same source is removed, and the
    /// identity route never is.
    pub fn remove_local(&mut self, prefix: Ipv4Network, source: RouteSource) -> Option<Route> {
        if prefix == self.identity_prefix() {
            return None;
        }
        match self.local.get(&prefix) {
            Some(route) if route.source == source => (),
            _ => return None,
        }
        let mut removed = None;
        self.mutate(vec![prefix], |rib| removed = rib.local.remove(&prefix));
        removed
    }

    pub fn learn(&mut self, peer: PeerId, routes: Vec<Route>) -> RibChanges {
        self.apply_update(peer, &[], routes)
    }

    pub fn withdraw(&mut self, peer: PeerId, prefixes: &[Ipv4Network]) -> RibChanges {
        self.apply_update(peer, prefixes, vec![])
    }

    /// Drop every route learned from `peer`. Safe to call repeatedly.
    pub fn withdraw_all(&mut self, peer: PeerId) -> RibChanges {
        let prefixes: Vec<Ipv4Network> = match self.learned.get(&peer) {
            Some(routes) => routes.keys().copied().collect(),
            None => return RibChanges::default(),
        };
        trace!("Withdrawing {} routes from {}", prefixes.len(), peer);
        self.mutate(prefixes, |rib| {
            rib.learned.remove(&peer);
        })
    }

    /// Apply the withdrawals then announcements of one UPDATE in a single step
    pub fn apply_update(
        &mut self,
        peer: PeerId,
        withdrawn: &[Ipv4Network],
        announced: Vec<Route>,
    ) -> RibChanges {
        let prefixes = withdrawn
            .iter()
            .copied()
            .chain(announced.iter().map(|r| r.prefix))
            .collect();
        self.mutate(prefixes, |rib| {
            let routes = rib.learned.entry(peer).or_insert_with(BTreeMap::new);
            for prefix in withdrawn {
                routes.remove(prefix);
            }
            for mut route in announced {
                route.source = RouteSource::Peer(peer);
                routes.insert(route.prefix, route);
            }
            if routes.is_empty() {
                rib.learned.remove(&peer);
            }
        })
    }

    /// Start re-advertising to an Established session
    ///
    /// The session's queue immediately receives every best route it is
    /// allowed to see, the identity route included.
    pub fn subscribe(&mut self, peer: PeerId, subscriber: Subscriber) {
        trace!("{} subscribed to RIB updates", peer);
        self.subscribers.insert(peer, subscriber);
        let prefixes: Vec<Ipv4Network> = self.best.keys().copied().collect();
        self.fanout(&prefixes, Some(peer));
    }

    pub fn unsubscribe(&mut self, peer: PeerId) {
        if self.subscribers.remove(&peer).is_some() {
            trace!("{} unsubscribed from RIB updates", peer);
        }
    }

    pub fn best_route(&self, prefix: &Ipv4Network) -> Option<&Route> {
        self.best
            .get(prefix)
            .and_then(|source| self.lookup(*source, prefix))
    }

    pub fn routes_from(&self, peer: PeerId) -> Vec<&Route> {
        match self.learned.get(&peer) {
            Some(routes) => routes.values().collect(),
            None => vec![],
        }
    }

    pub fn local_routes(&self) -> Vec<&Route> {
        self.local.values().collect()
    }

    /// Routes as last sent to `peer` (Adj-RIB-Out)
    pub fn advertised_to(&self, peer: PeerId) -> Vec<Route> {
        match self.subscribers.get(&peer) {
            Some(subscriber) => subscriber.advertised().cloned().collect(),
            None => vec![],
        }
    }

    /// Every stored route, local first then per peer, sorted by prefix
    pub fn snapshot(&self) -> Vec<RibEntry> {
        let mut peers: Vec<&PeerId> = self.learned.keys().collect();
        peers.sort();
        let mut entries: Vec<RibEntry> = self
            .local
            .values()
            .chain(peers.into_iter().flat_map(|p| self.learned[p].values()))
            .map(|route| RibEntry {
                route: route.clone(),
                best: self.best.get(&route.prefix) == Some(&route.source),
            })
            .collect();
        entries.sort_by_key(|e| (e.route.prefix, !e.best));
        entries
    }

    pub fn len(&self) -> usize {
        self.best.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }

    fn lookup(&self, source: RouteSource, prefix: &Ipv4Network) -> Option<&Route> {
        lookup(&self.local, &self.learned, source, prefix)
    }

    fn select_best(&self, prefix: &Ipv4Network) -> Option<RouteSource> {
        self.local
            .get(prefix)
            .into_iter()
            .chain(self.learned.values().filter_map(|routes| routes.get(prefix)))
            .min_by_key(|route| route.preference())
            .map(|route| route.source)
    }

    /// Run `change`, then re-select the best route of every touched prefix
    /// and push the differences to subscribers
    fn mutate<F>(&mut self, prefixes: Vec<Ipv4Network>, change: F) -> RibChanges
    where
        F: FnOnce(&mut Self),
    {
        let prefixes: BTreeSet<Ipv4Network> = prefixes.into_iter().collect();
        let before: Vec<(Ipv4Network, Option<Route>)> = prefixes
            .iter()
            .map(|prefix| (*prefix, self.best_route(prefix).cloned()))
            .collect();

        change(self);

        let mut changes = RibChanges::default();
        for (prefix, before) in before {
            match self.select_best(&prefix) {
                Some(source) => self.best.insert(prefix, source),
                None => self.best.remove(&prefix),
            };
            match (before, self.best_route(&prefix)) {
                (Some(before), Some(after)) if before.same_path(after) => (),
                (None, None) => (),
                (_, Some(_)) => changes.updated.push(prefix),
                (Some(_), None) => changes.removed.push(prefix),
            }
        }
        if !changes.is_empty() {
            trace!(
                "RIB changed: {} updated, {} removed",
                changes.updated.len(),
                changes.removed.len()
            );
            let touched: Vec<Ipv4Network> = changes
                .updated
                .iter()
                .chain(changes.removed.iter())
                .copied()
                .collect();
            self.fanout(&touched, None);
        }
        changes
    }

    /// Bring subscribers (or only `only`) in line with the best routes for `prefixes`
    fn fanout(&mut self, prefixes: &[Ipv4Network], only: Option<PeerId>) {
        let Rib {
            local,
            learned,
            best,
            subscribers,
            ..
        } = self;
        let (local, learned, best) = (&*local, &*learned, &*best);
        let policies: HashMap<PeerId, PeerPolicy> = subscribers
            .iter()
            .map(|(id, subscriber)| (*id, subscriber.policy()))
            .collect();
        let policies = &policies;
        for (id, subscriber) in subscribers.iter_mut() {
            if only.map(|peer| peer != *id).unwrap_or(false) {
                continue;
            }
            subscriber.sync(*id, prefixes, move |prefix| {
                let source = *best.get(prefix)?;
                let route = lookup(local, learned, source, prefix)?;
                let origin = match source {
                    RouteSource::Peer(origin) => policies.get(&origin).copied(),
                    _ => None,
                };
                Some((route, origin))
            });
        }
    }
}

fn lookup<'a>(
    local: &'a BTreeMap<Ipv4Network, Route>,
    learned: &'a HashMap<PeerId, BTreeMap<Ipv4Network, Route>>,
    source: RouteSource,
    prefix: &Ipv4Network,
) -> Option<&'a Route> {
    match source {
        RouteSource::Peer(peer) => learned.get(&peer).and_then(|routes| routes.get(prefix)),
        _ => local.get(prefix).filter(|route| route.source == source),
    }
}
