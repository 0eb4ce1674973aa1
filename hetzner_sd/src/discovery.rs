//! Discover servers and keep the `file_sd` output current.
//!
//! The [`Discoverer`] asks the Robot webservice for the servers of every
//! configured project and maps them into target groups. The [`Server`] drives
//! it on a fixed interval and hands the groups to the
//! [`crate::adapter::Adapter`].
//!
//! ## Metrics
//!
//! `prometheus_hetzner_sd_request_duration_seconds`: Histogram of webservice request latency, per project
//! `prometheus_hetzner_sd_request_failures_total`: Failed webservice requests, per project
//! `prometheus_hetzner_sd_targets`: Number of discovered targets, per project
//!

use std::{collections::BTreeMap, time::Instant};

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{Adapter, Group},
    config::{self, Credential},
    robot,
};

const ADDRESS_LABEL: &str = "__address__";
const META_PREFIX: &str = "__meta_hetzner_";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Discoverer`] and [`Server`]
pub enum Error {
    /// A webservice client could not be built.
    #[error("Failed to build client for project {project}: {source}")]
    Client {
        /// The project of the failing client
        project: String,
        /// Underlying client error
        #[source]
        source: robot::Error,
    },
}

/// Queries every project and tracks which sources were seen.
#[derive(Debug)]
pub struct Discoverer {
    clients: Vec<(String, robot::Client)>,
    /// Sources reported by the last successful request, per project.
    lasts: FxHashMap<String, FxHashSet<String>>,
}

impl Discoverer {
    /// Create a new [`Discoverer`] with one client per credential.
    ///
    /// # Errors
    ///
    /// Function will error if any client cannot be built.
    pub fn new(endpoint: &str, credentials: &[Credential]) -> Result<Self, Error> {
        let clients = credentials
            .iter()
            .map(|credential| {
                robot::Client::new(endpoint, credential, robot::REQUEST_TIMEOUT)
                    .map(|client| (credential.project.clone(), client))
                    .map_err(|source| Error::Client {
                        project: credential.project.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            clients,
            lasts: FxHashMap::default(),
        })
    }

    /// Query every project once and return the resulting groups.
    ///
    /// Sources a project reported last time but not now come back as deleted
    /// groups. A project whose request fails reports nothing, neither new
    /// groups nor deletions, so its previous targets stay in the output.
    pub async fn refresh(&mut self) -> Vec<Group> {
        let mut groups = Vec::new();

        for (project, client) in &self.clients {
            let labels = vec![("project".to_string(), project.clone())];
            let start = Instant::now();
            let result = client.servers().await;
            histogram!("prometheus_hetzner_sd_request_duration_seconds", &labels)
                .record(start.elapsed().as_secs_f64());

            let servers = match result {
                Ok(servers) => servers,
                Err(err) => {
                    warn!("Failed to fetch servers for project {project}: {err}");
                    counter!("prometheus_hetzner_sd_request_failures_total", &labels).increment(1);
                    continue;
                }
            };
            debug!(
                "Requested servers for project {project}, count: {count}",
                count = servers.len()
            );

            let mut current = FxHashSet::default();
            for server in &servers {
                let Some(group) = server_group(project, server) else {
                    debug!(
                        "Skipping server {number} without IPv4 address",
                        number = server.server_number
                    );
                    continue;
                };
                debug!("Server added, project: {project}, source: {}", group.source);
                current.insert(group.source.clone());
                groups.push(group);
            }
            gauge!("prometheus_hetzner_sd_targets", &labels).set(current.len() as f64);

            if let Some(last) = self.lasts.get(project) {
                for source in last.difference(&current) {
                    debug!("Server deleted, project: {project}, source: {source}");
                    groups.push(Group::deleted(source.clone()));
                }
            }
            self.lasts.insert(project.clone(), current);
        }

        groups
    }
}

/// Map a server into its target group, `None` if it has no IPv4 address.
fn server_group(project: &str, server: &robot::Server) -> Option<Group> {
    let address = server.server_ip.as_deref().filter(|ip| !ip.is_empty())?;

    let mut labels = BTreeMap::new();
    labels.insert(ADDRESS_LABEL.to_string(), address.to_string());
    let mut meta = |name: &str, value: String| {
        labels.insert(format!("{META_PREFIX}{name}"), value);
    };
    meta("project", project.to_string());
    meta("number", server.server_number.to_string());
    meta("name", server.server_name.clone());
    meta("product", server.product.clone());
    meta("dc", server.dc.clone());
    meta("ipv4", address.to_string());
    meta("ipv6", server.server_ipv6_net.clone().unwrap_or_default());
    meta("traffic", server.traffic.clone());
    meta("flatrate", server.flatrate.unwrap_or_default().to_string());
    meta("status", server.status.clone());
    meta("throttled", server.throttled.unwrap_or_default().to_string());
    meta("cancelled", server.cancelled.to_string());
    meta("paid_until", server.paid_until.clone());

    Some(Group {
        source: format!("hetzner/{}", server.server_number),
        targets: vec![address.to_string()],
        labels,
    })
}

/// The discovery server, refreshing the output until shutdown.
#[derive(Debug)]
pub struct Server {
    discoverer: Discoverer,
    adapter: Adapter,
    refresh: Duration,
    shutdown: hetzner_sd_signal::Watcher,
}

impl Server {
    /// Create a new [`Server`] from the `target` section of the config.
    ///
    /// # Errors
    ///
    /// Function will error if a webservice client cannot be built.
    pub fn new(
        config: &config::Target,
        shutdown: hetzner_sd_signal::Watcher,
    ) -> Result<Self, Error> {
        Ok(Self {
            discoverer: Discoverer::new(&config.endpoint, &config.credentials)?,
            adapter: Adapter::new(config.file.clone()),
            refresh: config.refresh_interval(),
            shutdown,
        })
    }

    /// Run this [`Server`] to completion
    ///
    /// Discovery runs immediately and then once per refresh interval. Failed
    /// writes are logged and retried on the next tick.
    ///
    /// # Errors
    ///
    /// None are known.
    pub async fn run(mut self) -> Result<(), Error> {
        info!(
            "Discovery running for {projects} projects at {refresh:?} interval, writing {output}",
            projects = self.discoverer.clients.len(),
            refresh = self.refresh,
            output = self.adapter.output().display(),
        );

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);

        let mut poll = time::interval(self.refresh);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let groups = tokio::select! {
                        groups = self.discoverer.refresh() => groups,
                        () = &mut shutdown_wait => {
                            info!("shutdown signal received during refresh");
                            return Ok(());
                        }
                    };
                    if let Err(err) = self.adapter.update(groups).await {
                        error!("Failed to write output: {err}");
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use metrics_util::{
        MetricKind,
        debugging::{DebugValue, DebuggingRecorder},
    };
    use serde_json::{Value, json};
    use warp::{Filter, http::StatusCode};

    use super::*;
    use crate::robot::tests::{TWO_SERVERS, USER_SECRET, credential, mock_robot};

    fn endpoint(addr: SocketAddr) -> String {
        format!("http://{addr}")
    }

    fn project(name: &str) -> Credential {
        Credential {
            project: name.to_string(),
            ..credential()
        }
    }

    #[test]
    fn server_group_labels() {
        let server = robot::Server {
            server_ip: Some("123.123.123.123".to_string()),
            server_ipv6_net: None,
            server_number: 321,
            server_name: "server1".to_string(),
            product: "DS 3000".to_string(),
            dc: "NBG1-DC1".to_string(),
            traffic: "5 TB".to_string(),
            flatrate: Some(true),
            status: "ready".to_string(),
            throttled: None,
            cancelled: false,
            paid_until: "2010-09-02".to_string(),
        };

        let group = server_group("prod", &server).expect("server has an address");
        assert_eq!(group.source, "hetzner/321");
        assert_eq!(group.targets, vec!["123.123.123.123".to_string()]);

        let expected: BTreeMap<String, String> = [
            ("__address__", "123.123.123.123"),
            ("__meta_hetzner_project", "prod"),
            ("__meta_hetzner_number", "321"),
            ("__meta_hetzner_name", "server1"),
            ("__meta_hetzner_product", "DS 3000"),
            ("__meta_hetzner_dc", "NBG1-DC1"),
            ("__meta_hetzner_ipv4", "123.123.123.123"),
            ("__meta_hetzner_ipv6", ""),
            ("__meta_hetzner_traffic", "5 TB"),
            ("__meta_hetzner_flatrate", "true"),
            ("__meta_hetzner_status", "ready"),
            ("__meta_hetzner_throttled", "false"),
            ("__meta_hetzner_cancelled", "false"),
            ("__meta_hetzner_paid_until", "2010-09-02"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(group.labels, expected);
    }

    #[test]
    fn server_without_ipv4_is_skipped() {
        let server = robot::Server {
            server_ip: None,
            server_ipv6_net: Some("2a01:4f8:111:4221::".to_string()),
            server_number: 7,
            server_name: String::new(),
            product: String::new(),
            dc: String::new(),
            traffic: String::new(),
            flatrate: None,
            status: String::new(),
            throttled: None,
            cancelled: false,
            paid_until: String::new(),
        };
        assert_eq!(server_group("prod", &server), None);
    }

    #[tokio::test]
    async fn refresh_maps_servers_of_every_project() {
        let addr = mock_robot(TWO_SERVERS, StatusCode::OK, USER_SECRET);
        let mut discoverer =
            Discoverer::new(&endpoint(addr), &[project("first")]).expect("discoverer not built");

        let groups = discoverer.refresh().await;
        let sources: Vec<&str> = groups.iter().map(|g| g.source.as_str()).collect();
        assert_eq!(sources, ["hetzner/321", "hetzner/421"]);
        assert_eq!(groups[1].labels["__meta_hetzner_cancelled"], "true");
        assert_eq!(groups[1].labels["__meta_hetzner_project"], "first");

        // Same answer again: no deletions.
        let groups = discoverer.refresh().await;
        assert!(groups.iter().all(|g| !g.targets.is_empty()));
    }

    #[tokio::test]
    async fn vanished_servers_are_deleted() {
        const ONE_SERVER: &str = r#"[{"server": {"server_ip": "124.124.124.124", "server_number": 421}}]"#;
        let full = mock_robot(TWO_SERVERS, StatusCode::OK, USER_SECRET);
        let partial = mock_robot(ONE_SERVER, StatusCode::OK, USER_SECRET);

        let mut discoverer =
            Discoverer::new(&endpoint(full), &[project("first")]).expect("discoverer not built");
        discoverer.refresh().await;

        // Point the same project at the smaller listing.
        discoverer.clients[0].1 =
            robot::Client::new(&endpoint(partial), &credential(), robot::REQUEST_TIMEOUT)
                .expect("client not built");
        let groups = discoverer.refresh().await;

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].source, "hetzner/421");
        assert_eq!(groups[1], Group::deleted("hetzner/321".to_string()));
    }

    #[test]
    fn failed_project_keeps_targets_and_counts_failure() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime could not be built");

        let groups = metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let good = mock_robot(TWO_SERVERS, StatusCode::OK, USER_SECRET);
                let bad = mock_robot(TWO_SERVERS, StatusCode::OK, "Basic bm9ib2R5Om5vdGhpbmc=");

                let mut discoverer = Discoverer::new(&endpoint(good), &[project("first")])
                    .expect("discoverer not built");
                discoverer.refresh().await;

                discoverer.clients[0].1 =
                    robot::Client::new(&endpoint(bad), &credential(), robot::REQUEST_TIMEOUT)
                        .expect("client not built");
                discoverer.refresh().await
            })
        });
        assert!(groups.is_empty(), "a failed project must not delete targets");

        let snapshot = snapshotter.snapshot().into_vec();
        let failures = snapshot
            .iter()
            .find(|(key, _, _, _)| {
                key.kind() == MetricKind::Counter
                    && key.key().name() == "prometheus_hetzner_sd_request_failures_total"
            })
            .map(|(_, _, _, value)| value);
        assert_eq!(failures, Some(&DebugValue::Counter(1)));

        let requests = snapshot
            .iter()
            .find(|(key, _, _, _)| {
                key.kind() == MetricKind::Histogram
                    && key.key().name() == "prometheus_hetzner_sd_request_duration_seconds"
            })
            .map(|(_, _, _, value)| value);
        assert!(matches!(requests, Some(DebugValue::Histogram(v)) if v.len() == 2));

        // The gauge still reflects the last successful request.
        let targets = snapshot
            .iter()
            .find(|(key, _, _, _)| {
                key.kind() == MetricKind::Gauge
                    && key.key().name() == "prometheus_hetzner_sd_targets"
            })
            .map(|(key, _, _, value)| (key.key().labels().cloned().collect::<Vec<_>>(), value));
        let (labels, value) = targets.expect("targets gauge not recorded");
        assert_eq!(labels, vec![metrics::Label::new("project", "first")]);
        assert_eq!(value, &DebugValue::Gauge(2.0_f64.into()));
    }

    #[tokio::test]
    async fn shutdown_interrupts_slow_refresh() {
        let route = warp::path("server").then(|| async {
            time::sleep(Duration::from_secs(8)).await;
            warp::reply::with_status(TWO_SERVERS.to_string(), StatusCode::OK)
        });
        let (addr, fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(fut);

        let dir = tempfile::tempdir().expect("directory could not be created");
        let target = config::Target {
            file: dir.path().join("hetzner.json"),
            refresh: 60,
            endpoint: endpoint(addr),
            credentials: vec![credential()],
        };
        let (watcher, broadcaster) = hetzner_sd_signal::signal();
        let server = Server::new(&target, watcher).expect("server not built");
        let handle = tokio::spawn(server.run());

        time::sleep(Duration::from_millis(300)).await;
        time::timeout(Duration::from_secs(2), broadcaster.signal_and_wait())
            .await
            .expect("server did not shut down during refresh");
        handle
            .await
            .expect("server task panicked")
            .expect("server returned an error");
        assert!(!target.file.exists());
    }

    #[tokio::test]
    async fn server_writes_output_until_shutdown() {
        let addr = mock_robot(TWO_SERVERS, StatusCode::OK, USER_SECRET);
        let dir = tempfile::tempdir().expect("directory could not be created");
        let output = dir.path().join("hetzner.json");

        let target = config::Target {
            file: output.clone(),
            refresh: 1,
            endpoint: endpoint(addr),
            credentials: vec![credential()],
        };
        let (watcher, broadcaster) = hetzner_sd_signal::signal();
        let server = Server::new(&target, watcher).expect("server not built");
        let handle = tokio::spawn(server.run());

        let mut written = None;
        for _ in 0..50 {
            if let Ok(contents) = tokio::fs::read_to_string(&output).await {
                written = Some(contents);
                break;
            }
            time::sleep(Duration::from_millis(100)).await;
        }
        let written: Value =
            serde_json::from_str(&written.expect("output never written")).expect("invalid json");
        assert_eq!(written[0]["targets"], json!(["123.123.123.123"]));
        assert_eq!(written[1]["labels"]["__meta_hetzner_name"], json!("server2"));

        time::timeout(Duration::from_secs(5), broadcaster.signal_and_wait())
            .await
            .expect("server did not shut down");
        handle
            .await
            .expect("server task panicked")
            .expect("server returned an error");
    }
}
