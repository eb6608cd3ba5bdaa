mod handler;
mod peers;
mod routes;
pub mod rpc;

pub use rpc::{ApiClient, LearnedRoute, PeerDetail, PeerSummary, RouteSpec, SpecAttributes};
