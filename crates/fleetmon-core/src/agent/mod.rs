//! Role agents
//!
//! One agent per declared role: [`client::ClientAgent`] owns the
//! monitoring agent on one host, [`server::ServerAgent`] owns the
//! time-series database and dashboard server (and embeds a client agent
//! for its own host's package needs).

pub mod client;
pub mod server;
