//! Collectd configuration model
//!
//! An ordered set of global options, an ordered set of plugin blocks and
//! the list of measurements the verification step expects to see in the
//! time-series store. Built once from the client's feature flags, then
//! rendered on demand; rendering is deterministic.

use crate::config::SfaDecl;

/// Sample interval of the throwaway configuration pushed before
/// verification
pub const INTERVAL_TEST: u64 = 1;
/// Sample interval of the configuration left in place after a
/// successful install
pub const INTERVAL_FINAL: u64 = 60;

/// Rendered file names kept in the workspace for audit
pub const CONFIG_TEST_FNAME: &str = "collectd.conf.test";
/// See [`CONFIG_TEST_FNAME`]
pub const CONFIG_FINAL_FNAME: &str = "collectd.conf.final";

/// One collectd configuration
#[derive(Debug, Clone)]
pub struct CollectdConfig {
    /// Global option name -> value, in insertion order
    globals: Vec<(String, String)>,
    /// Plugin name -> block text (empty for a bare LoadPlugin), in
    /// insertion order
    plugins: Vec<(String, String)>,
    /// Measurements expected to show up during verification
    checks: Vec<String>,
}

impl CollectdConfig {
    /// Base configuration: default plugin set, metrics shipped to
    /// `server_host`.
    #[must_use]
    pub fn new(interval: u64, server_host: &str) -> Self {
        let mut config = Self {
            globals: Vec::new(),
            plugins: Vec::new(),
            checks: Vec::new(),
        };

        config.set_global("Interval", interval);
        config.set_global("WriteQueueLimitHigh", 1_000_000);
        config.set_global("WriteQueueLimitLow", 800_000);

        config.plugin_syslog("err");
        config.plugin_memory();
        config.plugin_cpu();
        config.plugin_df();
        config.plugin_load();
        config.plugin_sensors();
        config.plugin_disk();
        config.plugin_uptime();
        config.plugin_users();
        config.plugin_write_tsdb(server_host);

        config
    }

    /// Set or overwrite a global option, keeping insertion order
    pub fn set_global(&mut self, name: &str, value: impl ToString) {
        let value = value.to_string();
        if let Some(entry) = self.globals.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.globals.push((name.to_string(), value));
        }
    }

    /// Configured sample interval
    #[must_use]
    pub fn interval(&self) -> Option<&str> {
        self.globals
            .iter()
            .find(|(n, _)| n == "Interval")
            .map(|(_, v)| v.as_str())
    }

    /// Measurements the verification step polls for
    #[must_use]
    pub fn checks(&self) -> &[String] {
        &self.checks
    }

    fn add_plugin(&mut self, name: &str, block: impl Into<String>) {
        self.plugins.push((name.to_string(), block.into()));
    }

    fn plugin_syslog(&mut self, log_level: &str) {
        self.add_plugin(
            "syslog",
            format!(
                "<Plugin \"syslog\">\n    LogLevel {log_level}\n</Plugin>\n"
            ),
        );
    }

    fn plugin_memory(&mut self) {
        self.add_plugin("memory", "");
    }

    /// Aggregate per-core samples; only the host-wide average leaves the
    /// post-cache chain.
    fn plugin_cpu(&mut self) {
        self.add_plugin(
            "cpu",
            "\nLoadPlugin aggregation\n\
             <Plugin \"aggregation\">\n\
             \x20   <Aggregation>\n\
             \x20       Plugin \"cpu\"\n\
             \x20       Type \"cpu\"\n\
             \x20       GroupBy \"Host\"\n\
             \x20       GroupBy \"TypeInstance\"\n\
             \x20       CalculateAverage true\n\
             \x20   </Aggregation>\n\
             </Plugin>\n\
             \n\
             LoadPlugin match_regex\n\
             <Chain \"PostCache\">\n\
             \x20   <Rule>\n\
             \x20       <Match regex>\n\
             \x20           Plugin \"^cpu$\"\n\
             \x20           PluginInstance \"^[0-9]+$\"\n\
             \x20       </Match>\n\
             \x20       <Target write>\n\
             \x20           Plugin \"aggregation\"\n\
             \x20       </Target>\n\
             \x20       Target stop\n\
             \x20   </Rule>\n\
             \x20   Target \"write\"\n\
             </Chain>\n",
        );
    }

    fn plugin_df(&mut self) {
        self.add_plugin(
            "df",
            "<Plugin \"df\">\n    MountPoint \"/\"\n    IgnoreSelected false\n</Plugin>\n",
        );
    }

    fn plugin_load(&mut self) {
        self.add_plugin("load", "");
    }

    fn plugin_sensors(&mut self) {
        self.add_plugin("sensors", "");
    }

    fn plugin_disk(&mut self) {
        self.add_plugin("disk", "");
    }

    fn plugin_uptime(&mut self) {
        self.add_plugin("uptime", "");
    }

    fn plugin_users(&mut self) {
        self.add_plugin("users", "");
    }

    fn plugin_write_tsdb(&mut self, host: &str) {
        self.add_plugin(
            "write_tsdb",
            format!(
                "<Plugin \"write_tsdb\">\n\
                 \x20   <Node>\n\
                 \x20       Host \"{host}\"\n\
                 \x20       Port \"4242\"\n\
                 \x20       DeriveRate true\n\
                 \x20   </Node>\n\
                 </Plugin>\n"
            ),
        );
        // Memory arrives on every host; it doubles as the liveness check
        // for the write path itself.
        self.checks.push("memory".to_string());
    }

    /// Enable the Lustre plugin for the declared server roles
    pub fn enable_lustre(&mut self, oss: bool, mds: bool) {
        let mut block = String::from("<Plugin \"lustre\">\n");
        if oss {
            block.push_str("    Oss true\n");
        }
        if mds {
            block.push_str("    Mds true\n");
        }
        block.push_str("</Plugin>\n");
        self.add_plugin("lustre", block);

        if oss {
            self.checks.push("ost_stats_bytes".to_string());
        }
        if mds {
            self.checks.push("md_stats".to_string());
        }
    }

    /// Enable the accelerator-layer plugin
    pub fn enable_ime(&mut self) {
        self.add_plugin("ime", "<Plugin \"ime\">\n</Plugin>\n");
        self.checks.push("ime_stats".to_string());
    }

    /// Enable polling of one storage array
    pub fn enable_sfa(&mut self, sfa: &SfaDecl) {
        self.add_plugin(
            "sfa",
            format!(
                "<Plugin \"sfa\">\n\
                 \x20   <Array>\n\
                 \x20       Name \"{}\"\n\
                 \x20       Controller0 \"{}\"\n\
                 \x20       Controller1 \"{}\"\n\
                 \x20   </Array>\n\
                 </Plugin>\n",
                sfa.name, sfa.controller0_host, sfa.controller1_host
            ),
        );
    }

    /// Enable the high-speed-fabric plugin
    pub fn enable_infiniband(&mut self) {
        self.add_plugin("infiniband", "<Plugin \"infiniband\">\n</Plugin>\n");
        self.checks.push("infiniband".to_string());
    }

    /// Render the configuration file text
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::from(
            "# Collectd configuration generated by fleetmon\n\
             # Changes are overwritten on the next installation run\n\n",
        );

        for (name, value) in &self.globals {
            text.push_str(&format!("{name} {value}\n"));
        }
        text.push('\n');

        for (name, block) in &self.plugins {
            text.push_str(&format!("LoadPlugin {name}\n"));
            text.push_str(block);
            text.push('\n');
        }

        text
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sfa(name: &str, c0: &str, c1: &str) -> SfaDecl {
        SfaDecl {
            name: name.to_string(),
            controller0_host: c0.to_string(),
            controller1_host: c1.to_string(),
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let mut first = CollectdConfig::new(INTERVAL_TEST, "server1");
        first.enable_lustre(true, false);
        first.enable_infiniband();

        let mut second = CollectdConfig::new(INTERVAL_TEST, "server1");
        second.enable_lustre(true, false);
        second.enable_infiniband();

        assert_eq!(first.render(), second.render());
        assert_eq!(first.render(), first.render());
    }

    #[test]
    fn test_interval_round_trip() {
        let config = CollectdConfig::new(INTERVAL_FINAL, "server1");
        assert_eq!(config.interval(), Some("60"));
        assert!(config.render().contains("Interval 60\n"));

        let config = CollectdConfig::new(INTERVAL_TEST, "server1");
        assert_eq!(config.interval(), Some("1"));
        assert!(config.render().contains("Interval 1\n"));
    }

    #[test]
    fn test_base_plugin_set() {
        let config = CollectdConfig::new(INTERVAL_TEST, "server1");
        let text = config.render();
        for plugin in [
            "syslog", "memory", "cpu", "df", "load", "sensors", "disk", "uptime", "users",
            "write_tsdb",
        ] {
            assert!(
                text.contains(&format!("LoadPlugin {plugin}\n")),
                "missing plugin {plugin}"
            );
        }
        assert!(text.contains("Host \"server1\""));
        assert!(text.contains("Port \"4242\""));
        assert_eq!(config.checks(), ["memory"]);
    }

    #[test]
    fn test_feature_plugins_add_checks() {
        let mut config = CollectdConfig::new(INTERVAL_TEST, "server1");
        config.enable_lustre(true, true);
        config.enable_ime();
        config.enable_sfa(&sfa("sfa0", "10.0.0.1", "10.0.0.2"));

        assert_eq!(
            config.checks(),
            ["memory", "ost_stats_bytes", "md_stats", "ime_stats"]
        );
        let text = config.render();
        assert!(text.contains("Oss true"));
        assert!(text.contains("Mds true"));
        assert!(text.contains("Controller0 \"10.0.0.1\""));
    }

    #[test]
    fn test_set_global_overwrites_in_place() {
        let mut config = CollectdConfig::new(INTERVAL_TEST, "server1");
        config.set_global("Interval", 60);

        let text = config.render();
        let interval_pos = text.find("Interval 60").unwrap();
        let queue_pos = text.find("WriteQueueLimitHigh").unwrap();
        assert!(interval_pos < queue_pos, "Interval must keep its position");
        assert!(!text.contains("Interval 1\n"));
    }
}
