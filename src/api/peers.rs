use crate::api::rpc::{PeerDetail, PeerSummary};
use crate::session::{PeerEntry, SessionState};
use crate::utils::format_time_as_elapsed;

pub fn peer_to_summary(peer: &PeerEntry, prefixes_received: Option<u64>) -> PeerSummary {
    let status = peer.status();
    let config = &peer.config;
    let connected = status.connection.is_some();
    PeerSummary {
        peer: config.key().to_string(),
        kind: config.peer_type().to_string(),
        enabled: config.enabled,
        router_id: status.remote_router_id,
        remote_asn: config.remote_as,
        local_asn: config.local_as,
        msg_received: Some(status.counts.received()).filter(|_| connected),
        msg_sent: Some(status.counts.sent()).filter(|_| connected),
        connect_time: status.established_at.map(|time| time.timestamp()),
        uptime: status.established_at.map(format_time_as_elapsed),
        state: if config.enabled {
            status.state.to_string()
        } else {
            "Disabled".to_string()
        },
        prefixes_received,
    }
}

pub fn peer_to_detail(peer: &PeerEntry, prefixes_received: Option<u64>) -> PeerDetail {
    let status = peer.status();
    let established = status.state == SessionState::Established;
    PeerDetail {
        summary: peer_to_summary(peer, prefixes_received),
        hold_timer: status.hold_time,
        hold_timer_interval: status.hold_time / 3,
        route_server: peer.config.route_server,
        last_received: status.last_received.map(format_time_as_elapsed),
        last_sent: status.last_sent.map(format_time_as_elapsed),
        tcp_connection: status
            .connection
            .map(|(local, remote)| (local.to_string(), remote.to_string())),
        prefixes_sent: Some(status.counts.prefixes_sent()).filter(|_| established),
        last_error: status.last_error,
    }
}
