//! Error types for fleetmon-pkg

use thiserror::Error;

/// Errors that can occur during package operations
#[derive(Error, Debug)]
pub enum PackageError {
    /// No file in the media listing matches the package pattern
    #[error("no RPM matching [{pattern}] under [{dir}]")]
    PackageNotFound {
        /// Pattern that was searched for
        pattern: String,
        /// Media directory that was searched
        dir: String,
    },

    /// Media listing for a package kind has not been scanned yet
    #[error("media listing for {0} not scanned")]
    NotScanned(&'static str),

    /// Unsupported distribution
    #[error("unsupported distribution: {0}")]
    UnsupportedDistro(String),

    /// A generated filename pattern failed to compile
    #[error("invalid package pattern [{pattern}]: {source}")]
    Pattern {
        /// The offending pattern
        pattern: String,
        /// Compilation failure
        source: regex::Error,
    },

    /// Command execution failed
    #[error("command [{command}] failed: {status} - {stderr}")]
    CommandFailed {
        /// Command that was run
        command: String,
        /// Exit status
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Execution error from remote executor
    #[error("execution error: {0}")]
    ExecutionError(String),
}
