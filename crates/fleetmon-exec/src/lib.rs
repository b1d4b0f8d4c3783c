//! fleetmon-exec: remote execution and file delivery
//!
//! Provides the host handle used by every installation step: a trait for
//! running shell commands and shipping files, with SSH and local implementations.

pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use local::LocalExecutor;
pub use result::{CommandResult, ConnectionInfo};
pub use ssh::SshExecutor;
pub use traits::RemoteExecutor;
