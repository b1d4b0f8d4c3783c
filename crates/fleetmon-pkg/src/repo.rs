//! RPM media tree: cached listings and rpm(8) operations

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, error, info, instrument};

use fleetmon_exec::result::CommandResult;
use fleetmon_exec::traits::RemoteExecutor;

use crate::error::PackageError;
use crate::types::{Distro, PackageKind};

/// The RPM portion of the installation medium as present on one host.
///
/// Listings are populated once by [`RpmTree::scan`] after the medium has
/// been delivered; every later lookup is a pattern match over the cached
/// file names, never a fresh directory walk.
pub struct RpmTree {
    executor: Arc<dyn RemoteExecutor>,
    /// Host label for logs
    host: String,
    /// `<media>/RPMS`
    rpm_root: PathBuf,
    distro: Distro,
    listings: HashMap<PackageKind, Vec<String>>,
}

impl RpmTree {
    /// Create a tree rooted at `<media_dir>/RPMS` for the given distro.
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        host: impl Into<String>,
        media_dir: impl Into<PathBuf>,
        distro: Distro,
    ) -> Self {
        Self {
            executor,
            host: host.into(),
            rpm_root: media_dir.into().join("RPMS"),
            distro,
            listings: HashMap::new(),
        }
    }

    /// Directory carrying RPMs of the given kind
    #[must_use]
    pub fn dir(&self, kind: PackageKind) -> PathBuf {
        match kind.subdir() {
            Some(sub) => self.rpm_root.join(self.distro.dir_name()).join(sub),
            None => self.rpm_root.clone(),
        }
    }

    /// Enumerate every kind's directory and cache the file listings.
    ///
    /// RHEL6 media carries no server packages; that listing is left empty
    /// rather than failing the scan.
    ///
    /// # Errors
    /// Fails if any other listing command fails.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn scan(&mut self) -> Result<(), PackageError> {
        for kind in [
            PackageKind::Dependent,
            PackageKind::Collectd,
            PackageKind::Xml,
            PackageKind::Server,
        ] {
            if kind == PackageKind::Server && self.distro == Distro::Rhel6 {
                self.listings.insert(kind, Vec::new());
                continue;
            }

            let dir = self.dir(kind);
            let result = self.checked_run(&format!("ls {}", dir.display())).await?;
            let names: Vec<String> = result
                .stdout
                .split_whitespace()
                .map(str::to_string)
                .collect();
            debug!(kind = %kind, count = names.len(), "scanned media listing");
            self.listings.insert(kind, names);
        }

        info!(host = %self.host, "media listings cached");
        Ok(())
    }

    /// Resolve a package base name to a concrete RPM file name of the
    /// given kind.
    ///
    /// # Errors
    /// Returns `PackageNotFound` when no cached listing entry matches the
    /// distro's filename pattern for `name`.
    pub fn resolve(&self, kind: PackageKind, name: &str) -> Result<String, PackageError> {
        let listing = self
            .listings
            .get(&kind)
            .ok_or(PackageError::NotScanned(kind.name()))?;

        let pattern = self.distro.rpm_pattern(name);
        let re = Regex::new(&pattern).map_err(|source| PackageError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;

        for fname in listing {
            if re.is_match(fname) {
                debug!(pattern = %pattern, fname = %fname, "matched package file");
                return Ok(fname.clone());
            }
        }

        Err(PackageError::PackageNotFound {
            pattern,
            dir: self.dir(kind).display().to_string(),
        })
    }

    /// Whether an exact package is installed on the host
    ///
    /// # Errors
    /// Fails only on executor errors; "not installed" is `Ok(false)`.
    pub async fn is_installed(&self, name: &str) -> Result<bool, PackageError> {
        let result = self
            .executor
            .run(&format!("rpm -q {name}"))
            .await
            .map_err(|e| PackageError::ExecutionError(e.to_string()))?;
        Ok(result.success())
    }

    /// Install one package of the given kind from the medium.
    ///
    /// # Errors
    /// Fails if the name resolves to no file or rpm(8) fails.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn install(&self, kind: PackageKind, name: &str) -> Result<(), PackageError> {
        let fname = self.resolve(kind, name)?;
        let dir = self.dir(kind);
        self.checked_run(&format!("cd {} && rpm -ivh {}", dir.display(), fname))
            .await?;
        info!(host = %self.host, package = %name, file = %fname, "installed RPM");
        Ok(())
    }

    /// Remove every installed package whose name contains `name`.
    ///
    /// Matches the unconditional-wipe step of a reinstall: stale versions
    /// and sub-packages go away together. A host with no matching package
    /// is a no-op, not an error.
    ///
    /// # Errors
    /// Fails if the query or the erase command fails.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn uninstall_matching(&self, name: &str) -> Result<(), PackageError> {
        let query = format!("rpm -qa | grep {name}");
        let result = self
            .executor
            .run(&query)
            .await
            .map_err(|e| PackageError::ExecutionError(e.to_string()))?;

        // grep exits 1 with empty output when nothing is installed
        if result.status == 1 && result.stdout.is_empty() {
            return Ok(());
        }
        if !result.success() {
            error!(
                host = %self.host,
                command = %query,
                status = result.status,
                stdout = %result.stdout,
                stderr = %result.stderr,
                "package query failed"
            );
            return Err(PackageError::CommandFailed {
                command: query,
                status: result.status,
                stderr: result.stderr,
            });
        }

        self.checked_run(&format!("rpm -qa | grep {name} | xargs rpm -e --nodeps"))
            .await?;
        info!(host = %self.host, package = %name, "uninstalled matching RPMs");
        Ok(())
    }

    /// Uninstall-then-install a package
    ///
    /// # Errors
    /// Fails if either half fails.
    pub async fn reinstall(&self, kind: PackageKind, name: &str) -> Result<(), PackageError> {
        self.uninstall_matching(name).await?;
        self.install(kind, name).await
    }

    /// Run a command, logging and failing on non-zero exit
    async fn checked_run(&self, command: &str) -> Result<CommandResult, PackageError> {
        let result = self
            .executor
            .run(command)
            .await
            .map_err(|e| PackageError::ExecutionError(e.to_string()))?;

        if !result.success() {
            error!(
                host = %self.host,
                command = %command,
                status = result.status,
                stdout = %result.stdout,
                stderr = %result.stderr,
                "command failed"
            );
            return Err(PackageError::CommandFailed {
                command: command.to_string(),
                status: result.status,
                stderr: result.stderr,
            });
        }

        Ok(result)
    }
}

impl std::fmt::Debug for RpmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpmTree")
            .field("host", &self.host)
            .field("rpm_root", &self.rpm_root)
            .field("distro", &self.distro)
            .field("scanned", &!self.listings.is_empty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use fleetmon_exec::error::ExecError;

    use super::*;

    /// Executor that answers `ls` with a fixed listing
    struct ListingExecutor {
        listing: &'static str,
    }

    #[async_trait]
    impl RemoteExecutor for ListingExecutor {
        async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
            let stdout = if cmd.starts_with("ls ") {
                self.listing.to_string()
            } else {
                String::new()
            };
            Ok(CommandResult {
                status: 0,
                stdout,
                stderr: String::new(),
                duration: Duration::from_millis(1),
            })
        }

        async fn run_with_timeout(
            &self,
            cmd: &str,
            _timeout: Duration,
        ) -> Result<CommandResult, ExecError> {
            self.run(cmd).await
        }

        async fn send_file(
            &self,
            _local: &std::path::Path,
            _remote: &std::path::Path,
        ) -> Result<(), ExecError> {
            Ok(())
        }

        async fn send_tree(
            &self,
            _local: &std::path::Path,
            _remote_dir: &std::path::Path,
        ) -> Result<(), ExecError> {
            Ok(())
        }

        fn executor_type(&self) -> &'static str {
            "mock"
        }
    }

    async fn scanned_tree(listing: &'static str) -> RpmTree {
        let executor = Arc::new(ListingExecutor { listing });
        let mut tree = RpmTree::new(executor, "c1", "/var/log/fleetmon/ISO", Distro::Rhel7);
        tree.scan().await.unwrap();
        tree
    }

    #[tokio::test]
    async fn test_resolve_matches_base_name_only() {
        let tree = scanned_tree(
            "collectd-5.7.2-1.el7.x86_64.rpm\n\
             collectd-lustre-5.7.2-1.el7.x86_64.rpm\n\
             libcollectdclient-5.7.2-1.el7.x86_64.rpm",
        )
        .await;

        assert_eq!(
            tree.resolve(PackageKind::Collectd, "collectd").unwrap(),
            "collectd-5.7.2-1.el7.x86_64.rpm"
        );
        assert_eq!(
            tree.resolve(PackageKind::Collectd, "libcollectdclient")
                .unwrap(),
            "libcollectdclient-5.7.2-1.el7.x86_64.rpm"
        );
    }

    #[tokio::test]
    async fn test_resolve_missing_package() {
        let tree = scanned_tree("influxdb-1.3.1.x86_64.rpm").await;
        let err = tree.resolve(PackageKind::Server, "grafana").unwrap_err();
        assert!(matches!(err, PackageError::PackageNotFound { .. }));
    }

    #[test]
    fn test_resolve_before_scan() {
        let executor = Arc::new(ListingExecutor { listing: "" });
        let tree = RpmTree::new(executor, "c1", "/tmp/ISO", Distro::Rhel7);
        assert!(matches!(
            tree.resolve(PackageKind::Collectd, "collectd"),
            Err(PackageError::NotScanned(_))
        ));
    }

    #[test]
    fn test_kind_directories() {
        let executor = Arc::new(ListingExecutor { listing: "" });
        let tree = RpmTree::new(executor, "c1", "/ws/ISO", Distro::Rhel7);
        assert_eq!(
            tree.dir(PackageKind::Dependent),
            PathBuf::from("/ws/ISO/RPMS/rhel7/dependent")
        );
        assert_eq!(tree.dir(PackageKind::Xml), PathBuf::from("/ws/ISO/RPMS"));
    }
}
