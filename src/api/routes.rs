use crate::api::rpc::{LearnedRoute, RouteSpec};
use crate::rib::{Route, RouteSource};
use crate::utils::{
    as_path_from_str, as_path_to_string, community_from_str, community_to_string,
    format_time_as_elapsed, origin_from_str, ParseError,
};
use std::net::Ipv4Addr;

use crate::message::Origin;

pub fn route_to_learned(route: &Route, source: String, best: bool) -> LearnedRoute {
    LearnedRoute {
        source,
        received_at: route.learned_at.timestamp(),
        age: format_time_as_elapsed(route.learned_at),
        prefix: route.prefix,
        next_hop: route.next_hop,
        origin: route.origin.to_string(),
        as_path: as_path_to_string(&route.as_path),
        local_pref: route.local_pref,
        multi_exit_disc: route.med,
        communities: route
            .communities
            .iter()
            .map(|c| community_to_string(*c))
            .collect(),
        best,
    }
}

/// Build a locally originated route from API input
pub fn parse_route_spec(spec: &RouteSpec, router_id: Ipv4Addr) -> Result<Route, ParseError> {
    let mut route = Route::new(
        spec.prefix,
        spec.next_hop.unwrap_or(router_id),
        RouteSource::Api,
    );
    let attributes = &spec.attributes;
    route.origin = match &attributes.origin {
        Some(origin) => origin_from_str(origin)?,
        None => Origin::Incomplete,
    };
    route.as_path = as_path_from_str(&attributes.as_path.join(" "))?;
    route.local_pref = attributes.local_pref;
    route.med = attributes.multi_exit_disc;
    route.communities = attributes
        .communities
        .iter()
        .map(|c| community_from_str(c))
        .collect::<Result<_, _>>()?;
    Ok(route)
}
