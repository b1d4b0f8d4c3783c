//! Distribution and package-kind definitions

use fleetmon_exec::traits::RemoteExecutor;

use crate::error::PackageError;

/// Supported operating system families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distro {
    /// RHEL/CentOS 6
    Rhel6,
    /// RHEL/CentOS 7
    Rhel7,
}

impl Distro {
    /// Media subdirectory carrying this distro's RPMs
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Distro::Rhel6 => "rhel6",
            Distro::Rhel7 => "rhel7",
        }
    }

    /// RPM filename pattern for a package base name on this distro.
    ///
    /// Upstream packages (influxdb, grafana) carry no dist tag, so the
    /// `.elN` component is optional.
    #[must_use]
    pub fn rpm_pattern(&self, name: &str) -> String {
        let el = match self {
            Distro::Rhel6 => "el6",
            Distro::Rhel7 => "el7",
        };
        format!(
            r"^{}-\d[\w.]*(-[\w.]+)?(\.{el}(\.centos)?)?\.(x86_64|noarch)\.rpm$",
            regex::escape(name)
        )
    }

    /// Parse the content of /etc/redhat-release
    #[must_use]
    pub fn from_redhat_release(release: &str) -> Option<Distro> {
        if release.contains("release 7") {
            Some(Distro::Rhel7)
        } else if release.contains("release 6") {
            Some(Distro::Rhel6)
        } else {
            None
        }
    }

    /// Detect the distribution of the machine behind `executor`.
    ///
    /// # Errors
    /// Returns `UnsupportedDistro` for anything that is not a RHEL6/RHEL7
    /// family host.
    pub async fn detect(executor: &dyn RemoteExecutor) -> Result<Distro, PackageError> {
        let result = executor
            .run("cat /etc/redhat-release")
            .await
            .map_err(|e| PackageError::ExecutionError(e.to_string()))?;

        if !result.success() {
            return Err(PackageError::UnsupportedDistro(
                "no /etc/redhat-release".to_string(),
            ));
        }

        Distro::from_redhat_release(&result.stdout)
            .ok_or_else(|| PackageError::UnsupportedDistro(result.stdout.trim().to_string()))
    }
}

impl std::fmt::Display for Distro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// The four fixed package categories on the installation medium.
///
/// Each kind is bound to its own media subdirectory and cached listing;
/// there is no general plugin system behind this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageKind {
    /// Third-party prerequisites (yajl, lm_sensors, ...)
    Dependent,
    /// The collectd agent bundle
    Collectd,
    /// The metadata-definition package shipped at the media root
    Xml,
    /// Server-side packages (influxdb, grafana)
    Server,
}

impl PackageKind {
    /// Subdirectory under the per-distro media directory, or `None` for
    /// kinds living at the media RPM root.
    #[must_use]
    pub fn subdir(&self) -> Option<&'static str> {
        match self {
            PackageKind::Dependent => Some("dependent"),
            PackageKind::Collectd => Some("collectd"),
            PackageKind::Server => Some("server"),
            PackageKind::Xml => None,
        }
    }

    /// Kind name for logs and errors
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            PackageKind::Dependent => "dependent",
            PackageKind::Collectd => "collectd",
            PackageKind::Xml => "xml",
            PackageKind::Server => "server",
        }
    }
}

impl std::fmt::Display for PackageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redhat_release_parse() {
        assert_eq!(
            Distro::from_redhat_release("CentOS Linux release 7.4.1708 (Core)"),
            Some(Distro::Rhel7)
        );
        assert_eq!(
            Distro::from_redhat_release("CentOS release 6.9 (Final)"),
            Some(Distro::Rhel6)
        );
        assert_eq!(
            Distro::from_redhat_release("Fedora release 26 (Twenty Six)"),
            None
        );
    }

    #[test]
    fn test_rpm_pattern_matches_dist_tagged() {
        let pattern = Distro::Rhel7.rpm_pattern("collectd");
        let re = regex::Regex::new(&pattern).unwrap();
        assert!(re.is_match("collectd-5.7.2-1.el7.x86_64.rpm"));
        assert!(re.is_match("collectd-5.7.2-1.el7.centos.x86_64.rpm"));
        // sub-packages must not match the base name
        assert!(!re.is_match("collectd-lustre-5.7.2-1.el7.x86_64.rpm"));
        assert!(!re.is_match("libcollectdclient-5.7.2-1.el7.x86_64.rpm"));
    }

    #[test]
    fn test_rpm_pattern_matches_upstream_untagged() {
        let re = regex::Regex::new(&Distro::Rhel7.rpm_pattern("influxdb")).unwrap();
        assert!(re.is_match("influxdb-1.3.1.x86_64.rpm"));

        let re = regex::Regex::new(&Distro::Rhel7.rpm_pattern("grafana")).unwrap();
        assert!(re.is_match("grafana-4.4.1-1.x86_64.rpm"));
    }

    #[test]
    fn test_rpm_pattern_matches_lettered_release() {
        let re = regex::Regex::new(&Distro::Rhel7.rpm_pattern("lm_sensors")).unwrap();
        assert!(re.is_match("lm_sensors-3.4.0-4.20160601gitf9185e5.el7.x86_64.rpm"));
    }

    #[test]
    fn test_rpm_pattern_rejects_source_and_debug() {
        let re = regex::Regex::new(&Distro::Rhel7.rpm_pattern("collectd")).unwrap();
        assert!(!re.is_match("collectd-5.7.2-1.el7.src.rpm"));
        assert!(!re.is_match("collectd-5.7.2-1.el7.x86_64.rpm.sig"));
    }
}
