pub mod api;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
mod handler;
pub mod message;
pub mod rib;
pub mod session;
pub mod utils;

pub use config::{from_file, ServerConfig};
pub use handler::Server;
