//! fleetmon-core: installation orchestration
//!
//! Sequences the per-host operations that install the monitoring stack:
//! package installation, service lifecycle, configuration delivery and
//! post-install verification, across one server role and many client
//! roles. Execution is strictly sequential within a run; a non-blocking
//! file lock keeps concurrent runs against the same configuration apart.

pub mod agent;
pub mod collectd;
pub mod config;
pub mod error;
pub mod host;
pub mod lock;
pub mod orchestrator;
pub mod poll;
pub mod stack;

pub use agent::client::{ClientAgent, ClientFeatures};
pub use agent::server::ServerAgent;
pub use collectd::CollectdConfig;
pub use config::{ClientDecl, ConfigError, ServerDecl, SfaDecl, SshHostDecl, Topology};
pub use error::InstallError;
pub use host::Host;
pub use lock::{InstallLock, LockError};
pub use orchestrator::{HostFactory, Orchestrator, SshHostFactory};
pub use poll::{PollTimeout, Retry};
pub use stack::{CqSpec, Stack};
