use chrono::Local;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::dispatch;
use crate::model::{
    FaultKind, Operation, ReplicaMember, ReplicationInfo, ServerFault, ServerStatus, Snapshot,
};
use crate::server::{
    DriverTransport, Fetch, Registry, ServerConnection, StatusSample, TransportError,
};

/// Everything one server contributed to a cycle.
struct ServerCycle {
    server: String,
    operations: Vec<Operation>,
    status: Option<StatusSample>,
    replica_members: Vec<ReplicaMember>,
    replication_info: Vec<ReplicationInfo>,
    fault: Option<ServerFault>,
}

impl ServerCycle {
    fn new(server: String) -> Self {
        Self {
            server,
            operations: Vec::new(),
            status: None,
            replica_members: Vec::new(),
            replication_info: Vec::new(),
            fault: None,
        }
    }
}

/// Drives the fetch-merge-publish cycle. Single writer of the snapshot
/// channel; every reader observes complete snapshots only.
pub struct Poller<T> {
    registry: Arc<Registry<T>>,
    refresh: Duration,
    auto_kill_secs: Option<u64>,
    tx: watch::Sender<Arc<Snapshot>>,
    previous_status: HashMap<String, StatusSample>,
    cycle: u64,
}

impl<T> Poller<T>
where
    T: DriverTransport + Clone + Send + Sync + 'static,
{
    pub fn new(
        registry: Arc<Registry<T>>,
        refresh: Duration,
        auto_kill_secs: Option<u64>,
        tx: watch::Sender<Arc<Snapshot>>,
    ) -> Self {
        Self {
            registry,
            refresh,
            auto_kill_secs,
            tx,
            previous_status: HashMap::new(),
            cycle: 0,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let snapshot = Arc::new(self.poll_once().await);
            if self.tx.send(snapshot.clone()).is_err() {
                // All readers are gone; nothing left to publish for.
                break;
            }
            if let Some(age_secs) = self.auto_kill_secs {
                let report =
                    dispatch::batch_kill(&self.registry, &snapshot, age_secs, None).await;
                if report.attempted > 0 {
                    debug!(
                        attempted = report.attempted,
                        failed = report.failed.len(),
                        "auto-kill pass finished"
                    );
                }
                for key in &report.failed {
                    warn!(%key, "auto-kill attempt failed");
                }
            }
        }
    }

    /// One fetch-merge cycle. Fetches fan out concurrently, one task per
    /// server; a failed server contributes a fault and zero operations and
    /// never disturbs the rest.
    pub async fn poll_once(&mut self) -> Snapshot {
        let started = Local::now();
        self.cycle += 1;

        let mut set = JoinSet::new();
        for conn in self.registry.connections() {
            let caps = conn.capabilities();
            if !(caps.operations || caps.status || caps.replica_set || caps.replication_info) {
                continue;
            }
            let conn = conn.clone();
            set.spawn(async move { collect_server(conn).await });
        }

        let mut operations = Vec::new();
        let mut faults = Vec::new();
        let mut statuses = Vec::new();
        let mut replica_members = Vec::new();
        let mut replication_info = Vec::new();

        while let Some(joined) = set.join_next().await {
            let cycle = match joined {
                Ok(cycle) => cycle,
                Err(error) => {
                    warn!("server fetch task failed to join: {error}");
                    continue;
                }
            };
            operations.extend(cycle.operations);
            replica_members.extend(cycle.replica_members);
            replication_info.extend(cycle.replication_info);
            if let Some(fault) = cycle.fault {
                faults.push(fault);
            }
            if let Some(sample) = cycle.status {
                let previous = self.previous_status.get(&cycle.server);
                statuses.push(derive_status(&cycle.server, previous, &sample));
                self.previous_status.insert(cycle.server, sample);
            }
        }

        // Join order is completion order; fix it for reproducible rendering.
        faults.sort_by(|a, b| a.server.cmp(&b.server));
        statuses.sort_by(|a, b| a.server.cmp(&b.server));
        replica_members.sort_by(|a, b| (&a.set, &a.name).cmp(&(&b.set, &b.name)));
        replication_info.sort_by(|a, b| a.server.cmp(&b.server));

        Snapshot::build(
            self.cycle,
            started,
            operations,
            faults,
            statuses,
            replica_members,
            replication_info,
        )
    }
}

async fn collect_server<T: DriverTransport>(conn: ServerConnection<T>) -> ServerCycle {
    let mut cycle = ServerCycle::new(conn.name().to_string());
    let caps = conn.capabilities();

    if caps.operations {
        match conn.fetch_operations().await {
            Ok(operations) => cycle.operations = operations,
            Err(error) => {
                cycle.fault = Some(fault(conn.name(), &error));
                return cycle;
            }
        }
    }

    if caps.status {
        match conn.fetch_status().await {
            Ok(Fetch::Data(sample)) => cycle.status = Some(sample),
            Ok(Fetch::Unavailable) => {}
            Err(error) => {
                if caps.operations {
                    warn!(server = conn.name(), "status fetch failed: {error}");
                } else {
                    cycle.fault = Some(fault(conn.name(), &error));
                    return cycle;
                }
            }
        }
    }

    if caps.replica_set {
        match conn.fetch_replica_set().await {
            Ok(Fetch::Data(members)) => cycle.replica_members = members,
            Ok(Fetch::Unavailable) => {}
            // Standalone servers reject replSetGetStatus; not a fault.
            Err(error) => debug!(server = conn.name(), "replica set fetch failed: {error}"),
        }
    }

    if caps.replication_info {
        match conn.fetch_replication_info().await {
            Ok(Fetch::Data(info)) => cycle.replication_info = info,
            Ok(Fetch::Unavailable) => {}
            Err(error) => debug!(server = conn.name(), "replication info fetch failed: {error}"),
        }
    }

    cycle
}

fn fault(server: &str, error: &TransportError) -> ServerFault {
    let kind = match error {
        TransportError::Timeout => FaultKind::Timeout,
        _ => FaultKind::Connection,
    };
    ServerFault {
        server: server.to_string(),
        kind,
        message: error.to_string(),
        at: Local::now(),
    }
}

fn derive_status(
    server: &str,
    previous: Option<&StatusSample>,
    sample: &StatusSample,
) -> ServerStatus {
    let elapsed_secs = previous
        .map(|prev| sample.uptime_millis.saturating_sub(prev.uptime_millis) as f64 / 1000.0)
        .unwrap_or(0.0);
    let rate = |current: u64, prev_value: u64| {
        if elapsed_secs > 0.0 {
            current.saturating_sub(prev_value) as f64 / elapsed_secs
        } else {
            0.0
        }
    };

    ServerStatus {
        server: server.to_string(),
        queries_per_sec: previous
            .map(|prev| rate(sample.opcounters_total, prev.opcounters_total))
            .unwrap_or(0.0),
        active_clients: sample.active_clients,
        queued: sample.queued,
        flushes_per_sec: previous
            .map(|prev| rate(sample.flushes, prev.flushes))
            .unwrap_or(0.0),
        connections_current: sample.connections_current,
        connections_total: sample.connections_current + sample.connections_available,
        resident_mb: sample.resident_mb,
        mapped_mb: sample.mapped_mb,
        bytes_in: sample.bytes_in,
        bytes_out: sample.bytes_out,
        page_faults_per_sec: previous
            .map(|prev| rate(sample.page_faults, prev.page_faults))
            .unwrap_or(0.0),
    }
}
