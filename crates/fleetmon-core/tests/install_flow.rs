//! End-to-end orchestration tests against scripted executors and mock
//! HTTP services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_contains};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleetmon_client::influxdb::build_continuous_query;
use fleetmon_core::config::SshHostDecl;
use fleetmon_core::error::InstallError;
use fleetmon_core::lock::InstallLock;
use fleetmon_core::orchestrator::{HostFactory, Orchestrator};
use fleetmon_core::poll::Retry;
use fleetmon_core::stack::{CqSpec, Stack};
use fleetmon_core::Topology;
use fleetmon_exec::error::ExecError;
use fleetmon_exec::result::CommandResult;
use fleetmon_exec::traits::RemoteExecutor;

/// Every command and transfer issued during a run, in order
#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    fn record(&self, host: &str, entry: String) {
        self.log.lock().unwrap().push((host.to_string(), entry));
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().clone()
    }

    fn position(&self, host: &str, needle: &str) -> Option<usize> {
        self.entries()
            .iter()
            .position(|(h, c)| h == host && c.contains(needle))
    }

    fn count(&self, host: &str, needle: &str) -> usize {
        self.entries()
            .iter()
            .filter(|(h, c)| h == host && c.contains(needle))
            .count()
    }
}

const RPM_LISTING: &str = "collectd-5.7.2-1.el7.x86_64.rpm\n\
    libcollectdclient-5.7.2-1.el7.x86_64.rpm\n\
    xml_definition-2.0-1.el7.noarch.rpm\n\
    influxdb-1.3.1.x86_64.rpm\n\
    grafana-4.4.1-1.x86_64.rpm\n\
    yajl-2.0.4-4.el7.x86_64.rpm\n\
    lm_sensors-libs-3.4.0-4.el7.x86_64.rpm\n\
    zeromq3-3.2.5-1.el7.x86_64.rpm";

/// Scripted executor: every host looks like a fresh CentOS 7 box with
/// the medium listings available and nothing installed yet.
struct ScriptedExecutor {
    host: String,
    recorder: Arc<Recorder>,
}

impl ScriptedExecutor {
    fn new(host: impl Into<String>, recorder: Arc<Recorder>) -> Self {
        Self {
            host: host.into(),
            recorder,
        }
    }

    fn respond(&self, cmd: &str) -> CommandResult {
        let (status, stdout) = if cmd.contains("cat /etc/redhat-release") {
            (0, "CentOS Linux release 7.4.1708 (Core)".to_string())
        } else if cmd.contains("rpm -qa | grep") {
            // nothing installed -> nothing to wipe
            (1, String::new())
        } else if cmd.contains("rpm -q ") {
            // no package is pre-installed
            (1, String::new())
        } else if cmd.starts_with("ls ") {
            (0, RPM_LISTING.to_string())
        } else {
            (0, String::new())
        };

        CommandResult {
            status,
            stdout,
            stderr: String::new(),
            duration: Duration::from_millis(1),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.recorder.record(&self.host, cmd.to_string());
        Ok(self.respond(cmd))
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run(cmd).await
    }

    async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), ExecError> {
        self.recorder.record(
            &self.host,
            format!("<send_file {} {}>", local.display(), remote.display()),
        );
        Ok(())
    }

    async fn send_tree(&self, local: &Path, remote_dir: &Path) -> Result<(), ExecError> {
        self.recorder.record(
            &self.host,
            format!("<send_tree {} {}>", local.display(), remote_dir.display()),
        );
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedFactory {
    recorder: Arc<Recorder>,
    created: AtomicUsize,
}

impl ScriptedFactory {
    fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            created: AtomicUsize::new(0),
        }
    }

    fn executors_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl HostFactory for ScriptedFactory {
    fn executor(&self, decl: &SshHostDecl) -> Result<Arc<dyn RemoteExecutor>, InstallError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedExecutor::new(
            &decl.hostname,
            Arc::clone(&self.recorder),
        )))
    }

    fn local(&self) -> Arc<dyn RemoteExecutor> {
        Arc::new(ScriptedExecutor::new("<local>", Arc::clone(&self.recorder)))
    }
}

/// Fast polling and mock service ports, one dashboard, one downsampling
/// rule
fn test_stack(grafana_port: u16, influxdb_port: u16) -> Stack {
    let fast = Retry::new(Duration::from_millis(10), Duration::from_secs(2));
    let mut stack = Stack::default();
    stack.grafana_port = grafana_port;
    stack.influxdb_port = influxdb_port;
    stack.poll.service = fast;
    stack.poll.grafana = fast;
    stack.poll.database = fast;
    stack.poll.data = fast;
    stack.dashboards = vec![("Cluster Status".to_string(), "cluster_status.json".to_string())];
    stack.continuous_queries = vec![CqSpec {
        measurement: "ost_stats_bytes".to_string(),
        groups: vec!["optype".to_string(), "fs_name".to_string()],
        interval: "1m".to_string(),
    }];
    stack
}

async fn mount_grafana_happy(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/datasources/name/esmon_datasource"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/datasources"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/dashboards/db/cluster-status"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/dashboards/db"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn mount_influx_happy(server: &MockServer) {
    // Freshness queries ask for epoch seconds; CQ management does not
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(query_param("epoch", "s"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "series": [{
                    "columns": ["time", "value", "fqdn"],
                    "values": [[1_500_000_000, 42.0, "localhost"]]
                }]
            }]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(query_param_contains("q", "CONTINUOUS QUERY"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(server)
        .await;
}

/// Staged media directory with the dashboard payload the stack expects
fn staged_media(dir: &Path) -> PathBuf {
    let media = dir.join("media");
    std::fs::create_dir_all(media.join("dashboards")).unwrap();
    std::fs::write(
        media.join("dashboards/cluster_status.json"),
        serde_json::to_string(&json!({"id": null, "title": "Cluster Status"})).unwrap(),
    )
    .unwrap();
    media
}

fn two_host_topology() -> Topology {
    Topology::parse(
        r"
ssh_hosts:
  - host_id: s1
    hostname: 127.0.0.1
  - host_id: c1
    hostname: localhost
server_host:
  host_id: s1
client_hosts:
  - host_id: c1
",
    )
    .unwrap()
}

#[tokio::test]
async fn server_install_precedes_client_install() {
    let grafana = MockServer::start().await;
    let influx = MockServer::start().await;
    mount_grafana_happy(&grafana).await;
    mount_influx_happy(&influx).await;

    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(ScriptedFactory::new(Arc::clone(&recorder)));
    let orchestrator = Orchestrator::new(
        test_stack(grafana.address().port(), influx.address().port()),
        factory,
    );

    let dir = tempfile::tempdir().unwrap();
    let media = staged_media(dir.path());
    let workspace = dir.path().join("workspace");
    let topology = two_host_topology();

    orchestrator
        .install_mounted(&workspace, &topology, &media)
        .await
        .unwrap();

    // The data store is installed on the server before any client
    // package is touched
    let server_install = recorder
        .position("127.0.0.1", "rpm -ivh influxdb")
        .expect("server installed influxdb");
    let client_install = recorder
        .position("localhost", "rpm -ivh collectd")
        .expect("client installed collectd");
    assert!(server_install < client_install);

    // erase=false, drop=false: plain create, never a drop
    assert_eq!(recorder.count("127.0.0.1", "DROP DATABASE"), 0);
    assert!(recorder.count("127.0.0.1", "CREATE DATABASE esmon_database") >= 1);

    // Two-phase rollout on the client: test config, start, final config,
    // restart, in that order
    let first_push = recorder
        .position("localhost", "<send_file")
        .expect("test configuration pushed");
    let start = recorder
        .position("localhost", "service collectd start")
        .expect("agent started");
    let restart = recorder
        .position("localhost", "service collectd restart")
        .expect("agent restarted");
    assert!(first_push < start);
    assert!(start < restart);
    assert_eq!(recorder.count("localhost", "<send_file"), 2);
}

#[tokio::test]
async fn shared_server_client_host_transfers_media_once() {
    let grafana = MockServer::start().await;
    let influx = MockServer::start().await;
    mount_grafana_happy(&grafana).await;
    mount_influx_happy(&influx).await;

    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(ScriptedFactory::new(Arc::clone(&recorder)));
    let orchestrator = Orchestrator::new(
        test_stack(grafana.address().port(), influx.address().port()),
        factory,
    );

    let dir = tempfile::tempdir().unwrap();
    let media = staged_media(dir.path());
    let workspace = dir.path().join("workspace");
    let topology = Topology::parse(
        r"
ssh_hosts:
  - host_id: s1
    hostname: 127.0.0.1
server_host:
  host_id: s1
client_hosts:
  - host_id: s1
",
    )
    .unwrap();

    orchestrator
        .install_mounted(&workspace, &topology, &media)
        .await
        .unwrap();

    assert_eq!(recorder.count("127.0.0.1", "<send_tree"), 1);
}

#[tokio::test]
async fn duplicate_host_id_fails_before_any_contact() {
    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(ScriptedFactory::new(Arc::clone(&recorder)));
    let orchestrator = Orchestrator::new(test_stack(3000, 8086), factory.clone());

    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("fleetmon.conf");
    std::fs::write(
        &config,
        r"
ssh_hosts:
  - host_id: s1
    hostname: a
  - host_id: s1
    hostname: b
server_host:
  host_id: s1
client_hosts: []
",
    )
    .unwrap();

    let err = orchestrator
        .install(&dir.path().join("workspace"), &config)
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::Config(_)));
    assert_eq!(factory.executors_created(), 0);
    assert!(recorder.entries().is_empty());
}

#[tokio::test]
async fn duplicate_sfa_controller_fails_validation() {
    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(ScriptedFactory::new(Arc::clone(&recorder)));
    let orchestrator = Orchestrator::new(test_stack(3000, 8086), factory.clone());

    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("fleetmon.conf");
    std::fs::write(
        &config,
        r"
ssh_hosts:
  - host_id: s1
    hostname: a
  - host_id: c1
    hostname: b
server_host:
  host_id: s1
client_hosts:
  - host_id: c1
    sfas:
      - name: sfa0
        controller0_host: 10.0.0.1
        controller1_host: 10.0.0.2
      - name: sfa1
        controller0_host: 10.0.0.1
        controller1_host: 10.0.0.3
",
    )
    .unwrap();

    let err = orchestrator
        .install(&dir.path().join("workspace"), &config)
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::Config(_)));
    assert_eq!(factory.executors_created(), 0);
}

#[tokio::test]
async fn second_run_fails_on_lock_contention() {
    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(ScriptedFactory::new(Arc::clone(&recorder)));
    let orchestrator = Orchestrator::new(test_stack(3000, 8086), factory.clone());

    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("fleetmon.conf");
    std::fs::write(&config, "ssh_hosts: []").unwrap();

    let _held = InstallLock::acquire(&config).unwrap();

    let err = orchestrator
        .install(&dir.path().join("workspace"), &config)
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::ConcurrentRun(_)));
    // No remote host was mutated, or even contacted
    assert_eq!(factory.executors_created(), 0);
    assert!(recorder.entries().is_empty());
}

#[tokio::test]
async fn restart_only_run_mounts_and_restarts() {
    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(ScriptedFactory::new(Arc::clone(&recorder)));
    let orchestrator = Orchestrator::new(test_stack(3000, 8086), factory);

    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("fleetmon.conf");
    std::fs::write(
        &config,
        r"
ssh_hosts:
  - host_id: s1
    hostname: 127.0.0.1
  - host_id: c1
    hostname: localhost
server_host:
  host_id: s1
  reinstall: false
client_hosts:
  - host_id: c1
clients_reinstall: false
iso_path: /tmp/fleetmon.iso
",
    )
    .unwrap();

    orchestrator
        .install(&dir.path().join("workspace"), &config)
        .await
        .unwrap();

    // Medium mounted and cleaned up on the installer machine
    assert_eq!(recorder.count("<local>", "mount -o loop"), 1);
    assert_eq!(recorder.count("<local>", "umount"), 1);

    // No installs anywhere, just an agent restart per client
    assert_eq!(recorder.count("127.0.0.1", "rpm -ivh"), 0);
    assert_eq!(recorder.count("localhost", "rpm -ivh"), 0);
    assert_eq!(recorder.count("localhost", "service collectd restart"), 1);

    // The audit copy landed in the workspace
    assert!(dir.path().join("workspace/fleetmon.conf").exists());
}

#[tokio::test]
async fn continuous_query_conflict_drops_and_retries_once() {
    let influx = MockServer::start().await;
    let grafana = MockServer::start().await;
    mount_grafana_happy(&grafana).await;

    let create = build_continuous_query(
        "esmon_database",
        "cq_ost_stats_bytes",
        "cqm_ost_stats_bytes",
        "ost_stats_bytes",
        &["optype", "fs_name"],
        "1m",
    );
    let drop = "DROP CONTINUOUS QUERY cq_ost_stats_bytes ON \"esmon_database\";";

    // First creation conflicts, the drop succeeds, the retry succeeds
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(query_param("q", create.as_str()))
        .respond_with(ResponseTemplate::new(400).set_body_string("already exists"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&influx)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(query_param("q", drop))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .expect(1)
        .mount(&influx)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(query_param("q", create.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .expect(1)
        .mount(&influx)
        .await;

    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(ScriptedFactory::new(Arc::clone(&recorder)));
    let orchestrator = Orchestrator::new(
        test_stack(grafana.address().port(), influx.address().port()),
        factory,
    );

    let dir = tempfile::tempdir().unwrap();
    let media = staged_media(dir.path());
    let workspace = dir.path().join("workspace");
    let topology = two_host_topology();

    // The influx freshness mock is intentionally absent: keep the run to
    // the server phase by disabling client reinstalls
    let mut topology = topology;
    topology.clients_reinstall = false;

    orchestrator
        .install_mounted(&workspace, &topology, &media)
        .await
        .unwrap();
}
