use chrono::{DateTime, Local};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

/// Per-server switches controlling which fetches run each cycle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Capabilities {
    pub status: bool,
    pub replication_info: bool,
    pub replica_set: bool,
    pub operations: bool,
    pub replication_operations: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            status: true,
            replication_info: true,
            replica_set: true,
            operations: true,
            replication_operations: true,
        }
    }
}

/// One configured server. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ServerTarget {
    pub name: String,
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub capabilities: Capabilities,
}

impl ServerTarget {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            username: None,
            password: None,
            capabilities: Capabilities::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OperationKind {
    Normal,
    ReplicationTailing,
}

/// Unique key of an operation within one snapshot.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OpKey {
    pub server: String,
    pub opid: String,
}

impl Display for OpKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.server, self.opid)
    }
}

/// An in-progress unit of work on one server, rebuilt every poll cycle.
#[derive(Debug, Clone)]
pub struct Operation {
    pub key: OpKey,
    pub namespace: String,
    pub duration_secs: Option<u64>,
    pub kind: OperationKind,
    pub op_type: String,
    pub client: String,
    pub active: bool,
    pub waiting_for_lock: bool,
    /// The exact command/query document captured at fetch time. Explain is
    /// issued with this value, never with a display-formatted copy.
    pub query: Value,
}

/// Classifies an operation as replication/oplog tailing.
///
/// Heuristic: a getmore on an oplog namespace is the tailing cursor a
/// secondary keeps open on its sync source; an operation with an empty
/// namespace or one on `local.sources` is the legacy master/slave equivalent.
pub fn classify_operation(op_type: &str, namespace: &str) -> OperationKind {
    if op_type == "getmore" && namespace.starts_with("local.oplog.") {
        return OperationKind::ReplicationTailing;
    }
    if !op_type.is_empty() && (namespace.is_empty() || namespace == "local.sources") {
        return OperationKind::ReplicationTailing;
    }
    OperationKind::Normal
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FaultKind {
    Timeout,
    Connection,
}

impl Display for FaultKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connection => write!(f, "connection error"),
        }
    }
}

/// Recorded instead of operations when a server's fetch failed this cycle.
#[derive(Debug, Clone)]
pub struct ServerFault {
    pub server: String,
    pub kind: FaultKind,
    pub message: String,
    pub at: DateTime<Local>,
}

/// One status row per status-capable server, with rates computed against the
/// previous cycle's raw counters.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub server: String,
    pub queries_per_sec: f64,
    pub active_clients: u64,
    pub queued: u64,
    pub flushes_per_sec: f64,
    pub connections_current: u64,
    pub connections_total: u64,
    pub resident_mb: u64,
    pub mapped_mb: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub page_faults_per_sec: f64,
}

/// One replica-set member as reported by a replica-set-capable server.
#[derive(Debug, Clone)]
pub struct ReplicaMember {
    pub name: String,
    pub set: String,
    pub state: String,
    pub uptime_secs: u64,
    pub lag_secs: Option<i64>,
    pub optime: String,
    pub ping_ms: Option<u64>,
}

/// Legacy master/slave replication source info from `local.sources`.
#[derive(Debug, Clone)]
pub struct ReplicationInfo {
    pub server: String,
    pub source: String,
    pub synced_to: Option<DateTime<Local>>,
}

/// One cycle's fully merged, immutable view of the fleet.
///
/// Published wholesale by the poller; never patched in place. The positional
/// index is only meaningful within the snapshot that produced it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: u64,
    pub at: DateTime<Local>,
    pub operations: Vec<Operation>,
    pub faults: Vec<ServerFault>,
    pub statuses: Vec<ServerStatus>,
    pub replica_members: Vec<ReplicaMember>,
    pub replication_info: Vec<ReplicationInfo>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            id: 0,
            at: Local::now(),
            operations: Vec::new(),
            faults: Vec::new(),
            statuses: Vec::new(),
            replica_members: Vec::new(),
            replication_info: Vec::new(),
        }
    }

    pub fn build(
        id: u64,
        at: DateTime<Local>,
        mut operations: Vec<Operation>,
        faults: Vec<ServerFault>,
        statuses: Vec<ServerStatus>,
        replica_members: Vec<ReplicaMember>,
        replication_info: Vec<ReplicationInfo>,
    ) -> Self {
        dedupe_operations(&mut operations);
        sort_operations(&mut operations);
        Self {
            id,
            at,
            operations,
            faults,
            statuses,
            replica_members,
            replication_info,
        }
    }

    pub fn operation_at(&self, index: usize) -> Option<&Operation> {
        self.operations.get(index)
    }

    pub fn find(&self, key: &OpKey) -> Option<&Operation> {
        self.operations.iter().find(|op| &op.key == key)
    }

    pub fn fault_for(&self, server: &str) -> Option<&ServerFault> {
        self.faults.iter().find(|fault| fault.server == server)
    }
}

/// Duration descending, ties by (server, opid) ascending. Operations without
/// a reported duration sort last.
pub fn sort_operations(operations: &mut [Operation]) {
    operations.sort_by(|a, b| {
        b.duration_secs
            .cmp(&a.duration_secs)
            .then_with(|| a.key.cmp(&b.key))
    });
}

fn dedupe_operations(operations: &mut Vec<Operation>) {
    let mut seen = HashSet::new();
    operations.retain(|op| seen.insert(op.key.clone()));
}

/// An operator-chosen row, pinned to the snapshot it was rendered from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Selection {
    pub snapshot_id: u64,
    pub index: usize,
    pub key: OpKey,
}
