use prettytable::{cell, row, Row};

use super::table::ToRow;
use crate::api::{LearnedRoute, PeerSummary};
use crate::utils::{maybe_string, u32_to_dotted, EMPTY_VALUE};

pub struct PeerSummaryRow(pub PeerSummary);

impl ToRow for PeerSummaryRow {
    fn columns() -> Row {
        row![
            "Neighbor", "Kind", "Router ID", "AS", "MsgRcvd", "MsgSent", "Uptime", "State", "PfxRcd"
        ]
    }

    fn to_row(&self) -> Row {
        let peer = &self.0;
        row![
            if peer.enabled {
                peer.peer.clone()
            } else {
                format!("*{}", peer.peer)
            },
            peer.kind,
            maybe_string(peer.router_id.as_ref()),
            u32_to_dotted(peer.remote_asn, '.'),
            maybe_string(peer.msg_received.as_ref()),
            maybe_string(peer.msg_sent.as_ref()),
            maybe_string(peer.uptime.as_ref()),
            peer.state,
            maybe_string(peer.prefixes_received.as_ref()),
        ]
    }
}

pub struct LearnedRouteRow(pub LearnedRoute);

impl ToRow for LearnedRouteRow {
    fn columns() -> Row {
        route_columns("Received From")
    }

    fn to_row(&self) -> Row {
        route_row(&self.0)
    }
}

pub struct AdvertisedRouteRow(pub LearnedRoute);

impl ToRow for AdvertisedRouteRow {
    fn columns() -> Row {
        route_columns("Advertised To")
    }

    fn to_row(&self) -> Row {
        route_row(&self.0)
    }
}

fn route_columns(source: &str) -> Row {
    row![
        " ",
        source,
        "Prefix",
        "Next Hop",
        "Age",
        "Origin",
        "Local Pref",
        "Metric",
        "AS Path",
        "Communities",
    ]
}

fn route_row(route: &LearnedRoute) -> Row {
    row![
        if route.best { "*" } else { EMPTY_VALUE },
        route.source,
        route.prefix,
        route.next_hop,
        route.age,
        route.origin,
        maybe_string(route.local_pref.as_ref()),
        maybe_string(route.multi_exit_disc.as_ref()),
        route.as_path,
        route.communities.join(" "),
    ]
}
