use chrono::{DateTime, Local, TimeZone, Utc};
use serde_json::Value;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::debug;

use crate::model::{
    Capabilities, OpKey, Operation, OperationKind, ReplicaMember, ReplicationInfo, ServerTarget,
    classify_operation,
};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("deadline exceeded")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("driver error: {0}")]
    Driver(String),
    #[error("malformed driver output: {0}")]
    Parse(String),
}

/// Result of a capability-gated fetch.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Fetch<T> {
    Data(T),
    Unavailable,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KillOutcome {
    Killed,
    /// The target finished naturally before the kill landed. Success.
    AlreadyGone,
}

/// Raw serverStatus counters for one cycle. Rates are derived by the poller
/// against the previous cycle's sample.
#[derive(Debug, Clone, Default)]
pub struct StatusSample {
    pub uptime_millis: u64,
    pub opcounters_total: u64,
    pub active_clients: u64,
    pub queued: u64,
    pub flushes: u64,
    pub connections_current: u64,
    pub connections_available: u64,
    pub resident_mb: u64,
    pub mapped_mb: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub page_faults: u64,
}

/// Evaluates one JavaScript expression against a server and returns the
/// expression's value as JSON. The trait seam keeps the poller and the
/// dispatcher testable without a live server.
pub trait DriverTransport: Send + Sync {
    fn eval(
        &self,
        target: &ServerTarget,
        db: &str,
        script: &str,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;
}

/// Production transport: shells out to the MongoDB shell with `--eval`.
#[derive(Debug, Clone)]
pub struct MongoShell {
    binary: String,
}

impl MongoShell {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl DriverTransport for MongoShell {
    async fn eval(
        &self,
        target: &ServerTarget,
        db: &str,
        script: &str,
    ) -> Result<Value, TransportError> {
        let uri = if target.address.starts_with("mongodb://") {
            target.address.clone()
        } else {
            format!("mongodb://{}/{db}", target.address)
        };

        let mut cmd = TokioCommand::new(&self.binary);
        cmd.arg(&uri)
            .arg("--quiet")
            .arg("--norc")
            .arg("--eval")
            .arg(format!("EJSON.stringify(({script}))"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(username) = &target.username {
            cmd.arg("--username").arg(username);
        }
        if let Some(password) = &target.password {
            cmd.arg("--password").arg(password);
        }

        debug!(server = %target.name, %db, "running shell eval");
        let output = cmd
            .output()
            .await
            .map_err(|error| TransportError::Connection(error.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("econnrefused")
                || lowered.contains("network")
                || lowered.contains("no reachable servers")
                || lowered.contains("server selection")
            {
                return Err(TransportError::Connection(message));
            }
            return Err(TransportError::Driver(message));
        }

        // The shell may prefix warnings; the payload is the last line.
        let payload = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default();
        serde_json::from_str(payload).map_err(|error| TransportError::Parse(error.to_string()))
    }
}

/// One per configured server, constructed once at startup and reused across
/// cycles. Every remote call is bounded by a deadline strictly shorter than
/// the refresh interval; a failed call marks the cycle faulted for this
/// server only and the next cycle simply tries again.
#[derive(Debug, Clone)]
pub struct ServerConnection<T> {
    target: ServerTarget,
    transport: T,
    deadline: Duration,
}

impl<T: DriverTransport> ServerConnection<T> {
    pub fn new(target: ServerTarget, transport: T, deadline: Duration) -> Self {
        Self {
            target,
            transport,
            deadline,
        }
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.target.capabilities
    }

    async fn run(&self, db: &str, script: &str) -> Result<Value, TransportError> {
        match timeout(self.deadline, self.transport.eval(&self.target, db, script)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Fetches the server's in-progress operations. Replication-tailing
    /// operations are dropped here when the target's flag disables them, so
    /// they never reach the merge.
    pub async fn fetch_operations(&self) -> Result<Vec<Operation>, TransportError> {
        let value = self.run("admin", "db.adminCommand({ currentOp: true })").await?;
        let inprog = value
            .get("inprog")
            .and_then(Value::as_array)
            .ok_or_else(|| TransportError::Parse("currentOp reply without inprog".to_string()))?;

        let mut operations = Vec::with_capacity(inprog.len());
        for doc in inprog {
            let Some(operation) = self.convert_operation(doc) else {
                continue;
            };
            if operation.kind == OperationKind::ReplicationTailing
                && !self.target.capabilities.replication_operations
            {
                continue;
            }
            operations.push(operation);
        }
        Ok(operations)
    }

    fn convert_operation(&self, doc: &Value) -> Option<Operation> {
        let opid = opid_string(doc.get("opid")?)?;
        let op_type = str_field(doc, "op");
        let namespace = str_field(doc, "ns");
        let duration_secs = doc
            .get("secs_running")
            .and_then(as_u64_lenient)
            .or_else(|| {
                doc.get("microsecs_running")
                    .and_then(as_u64_lenient)
                    .map(|micros| micros / 1_000_000)
            });
        let query = doc
            .get("command")
            .or_else(|| doc.get("query"))
            .cloned()
            .unwrap_or(Value::Null);

        Some(Operation {
            kind: classify_operation(&op_type, &namespace),
            key: OpKey {
                server: self.target.name.clone(),
                opid,
            },
            namespace,
            duration_secs,
            op_type,
            client: str_field(doc, "client"),
            active: doc.get("active").and_then(Value::as_bool).unwrap_or(true),
            waiting_for_lock: doc
                .get("waitingForLock")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            query,
        })
    }

    pub async fn fetch_status(&self) -> Result<Fetch<StatusSample>, TransportError> {
        if !self.target.capabilities.status {
            return Ok(Fetch::Unavailable);
        }
        let value = self.run("admin", "db.serverStatus()").await?;
        let opcounters_total = value
            .get("opcounters")
            .and_then(Value::as_object)
            .map(|counters| counters.values().filter_map(as_u64_lenient).sum())
            .unwrap_or(0);
        Ok(Fetch::Data(StatusSample {
            uptime_millis: pointer_u64(&value, "/uptimeMillis"),
            opcounters_total,
            active_clients: pointer_u64(&value, "/globalLock/activeClients/total"),
            queued: pointer_u64(&value, "/globalLock/currentQueue/total"),
            flushes: pointer_u64(&value, "/backgroundFlushing/flushes"),
            connections_current: pointer_u64(&value, "/connections/current"),
            connections_available: pointer_u64(&value, "/connections/available"),
            resident_mb: pointer_u64(&value, "/mem/resident"),
            mapped_mb: pointer_u64(&value, "/mem/mapped"),
            bytes_in: pointer_u64(&value, "/network/bytesIn"),
            bytes_out: pointer_u64(&value, "/network/bytesOut"),
            page_faults: pointer_u64(&value, "/extra_info/page_faults"),
        }))
    }

    /// Replica-set membership as seen by this server. Arbiters carry no data
    /// and are skipped, matching what an operator cares about here.
    pub async fn fetch_replica_set(&self) -> Result<Fetch<Vec<ReplicaMember>>, TransportError> {
        if !self.target.capabilities.replica_set {
            return Ok(Fetch::Unavailable);
        }
        let value = self
            .run("admin", "db.adminCommand({ replSetGetStatus: 1 })")
            .await?;
        let set = str_field(&value, "set");
        let now = value.get("date").and_then(parse_date);
        let members = value
            .get("members")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut rows = Vec::new();
        for member in members {
            let state = str_field(member, "stateStr");
            if state == "ARBITER" {
                continue;
            }
            let optime_date = member.get("optimeDate").and_then(parse_date);
            let lag_secs = match (now, optime_date) {
                (Some(now), Some(optime)) => Some((now - optime).num_seconds()),
                _ => None,
            };
            rows.push(ReplicaMember {
                name: str_field(member, "name"),
                set: set.clone(),
                state,
                uptime_secs: member.get("uptime").and_then(as_u64_lenient).unwrap_or(0),
                lag_secs,
                optime: optime_date
                    .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
                    .unwrap_or_default(),
                ping_ms: member.get("pingMs").and_then(as_u64_lenient),
            });
        }
        Ok(Fetch::Data(rows))
    }

    pub async fn fetch_replication_info(
        &self,
    ) -> Result<Fetch<Vec<ReplicationInfo>>, TransportError> {
        if !self.target.capabilities.replication_info {
            return Ok(Fetch::Unavailable);
        }
        let value = self
            .run("local", "db.getSiblingDB('local').sources.findOne()")
            .await?;
        if value.is_null() {
            return Ok(Fetch::Data(Vec::new()));
        }
        Ok(Fetch::Data(vec![ReplicationInfo {
            server: self.target.name.clone(),
            source: str_field(&value, "host"),
            synced_to: value
                .get("syncedTo")
                .and_then(parse_date)
                .map(|at| at.with_timezone(&Local)),
        }]))
    }

    /// Kills one operation. A target that already finished is reported as
    /// `AlreadyGone`, not as an error.
    pub async fn kill_operation(&self, opid: &str) -> Result<KillOutcome, TransportError> {
        let literal = opid_literal(opid);
        let script = format!("db.adminCommand({{ killOp: 1, op: {literal} }})");
        match self.run("admin", &script).await {
            Ok(_) => Ok(KillOutcome::Killed),
            Err(TransportError::Driver(message)) if is_not_found(&message) => {
                Ok(KillOutcome::AlreadyGone)
            }
            Err(error) => Err(error),
        }
    }

    /// Runs explain for the exact query document captured at snapshot time.
    pub async fn explain_operation(
        &self,
        namespace: &str,
        query: &Value,
    ) -> Result<Value, TransportError> {
        let (database, collection) = namespace.split_once('.').ok_or_else(|| {
            TransportError::Driver(format!("namespace '{namespace}' has no collection"))
        })?;
        let filter = query
            .get("filter")
            .or_else(|| query.get("$query"))
            .unwrap_or(query);
        let serialized = serde_json::to_string(filter)
            .map_err(|error| TransportError::Parse(error.to_string()))?;
        let script = format!(
            "db.getSiblingDB({}).getCollection({}).find({serialized}).explain('executionStats')",
            js_string(database),
            js_string(collection),
        );
        self.run(database, &script).await
    }
}

/// All connections for the monitoring session, built once at startup and
/// shared by reference with the poller and the dispatcher.
pub struct Registry<T> {
    connections: Vec<ServerConnection<T>>,
}

impl<T: DriverTransport + Clone> Registry<T> {
    pub fn new(targets: Vec<ServerTarget>, transport: T, deadline: Duration) -> Self {
        let connections = targets
            .into_iter()
            .map(|target| ServerConnection::new(target, transport.clone(), deadline))
            .collect();
        Self { connections }
    }
}

impl<T: DriverTransport> Registry<T> {
    pub fn connections(&self) -> &[ServerConnection<T>] {
        &self.connections
    }

    pub fn get(&self, server: &str) -> Option<&ServerConnection<T>> {
        self.connections.iter().find(|conn| conn.name() == server)
    }
}

fn is_not_found(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("no such op")
        || lowered.contains("cannot find op")
        || lowered.contains("couldn't find op")
}

fn opid_literal(opid: &str) -> String {
    // Plain mongod opids are numeric; mongos opids look like "shard01:123"
    // and must be passed as strings.
    if opid.parse::<i64>().is_ok() {
        opid.to_string()
    } else {
        js_string(opid)
    }
}

fn js_string(raw: &str) -> String {
    let escaped = raw.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn str_field(doc: &Value, field: &str) -> String {
    doc.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn pointer_u64(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(as_u64_lenient).unwrap_or(0)
}

fn as_u64_lenient(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|float| float.max(0.0) as u64))
        .or_else(|| {
            value
                .get("$numberLong")
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse().ok())
        })
}

fn opid_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(number) => Some(number.to_string()),
        Value::String(raw) => Some(raw.clone()),
        Value::Object(_) => value
            .get("$numberLong")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|at| at.with_timezone(&Utc)),
        Value::Object(_) => {
            let inner = value.get("$date")?;
            match inner {
                Value::String(raw) => DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .map(|at| at.with_timezone(&Utc)),
                Value::Number(millis) => millis
                    .as_i64()
                    .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
                Value::Object(_) => inner
                    .get("$numberLong")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
                _ => None,
            }
        }
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeTransport;
    use super::*;
    use crate::model::ServerTarget;
    use serde_json::json;

    fn connection(transport: FakeTransport) -> ServerConnection<FakeTransport> {
        ServerConnection::new(
            ServerTarget::new("db1", "db1.internal:27017"),
            transport,
            Duration::from_millis(750),
        )
    }

    #[tokio::test]
    async fn converts_current_op_documents() {
        let transport = FakeTransport::default().with_operations(
            "db1",
            json!([
                {
                    "opid": 4512,
                    "op": "query",
                    "ns": "app.items",
                    "secs_running": 33,
                    "client": "10.1.2.3:44000",
                    "active": true,
                    "command": { "find": "items", "filter": { "state": "open" } }
                },
                {
                    "opid": { "$numberLong": "7001" },
                    "op": "getmore",
                    "ns": "app.feed",
                    "microsecs_running": 2_500_000u64,
                    "query": { "getMore": 1 }
                }
            ]),
        );
        let ops = connection(transport).fetch_operations().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].key.opid, "4512");
        assert_eq!(ops[0].duration_secs, Some(33));
        assert_eq!(
            ops[0].query,
            json!({ "find": "items", "filter": { "state": "open" } })
        );
        assert_eq!(ops[1].key.opid, "7001");
        assert_eq!(ops[1].duration_secs, Some(2));
    }

    #[tokio::test]
    async fn drops_tailing_operations_when_flag_disabled() {
        let transport = FakeTransport::default().with_operations(
            "db1",
            json!([
                { "opid": 1, "op": "getmore", "ns": "local.oplog.rs", "secs_running": 9000 },
                { "opid": 2, "op": "query", "ns": "app.items", "secs_running": 5 }
            ]),
        );
        let mut target = ServerTarget::new("db1", "db1.internal:27017");
        target.capabilities.replication_operations = false;
        let conn = ServerConnection::new(target, transport, Duration::from_millis(750));
        let ops = conn.fetch_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].key.opid, "2");
    }

    #[tokio::test]
    async fn keeps_tailing_operations_when_flag_enabled() {
        let transport = FakeTransport::default().with_operations(
            "db1",
            json!([
                { "opid": 1, "op": "getmore", "ns": "local.oplog.rs", "secs_running": 9000 }
            ]),
        );
        let ops = connection(transport).fetch_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::ReplicationTailing);
    }

    #[tokio::test]
    async fn kill_not_found_is_already_gone() {
        let transport = FakeTransport::default().kill_reports_not_found("4512");
        let outcome = connection(transport).kill_operation("4512").await.unwrap();
        assert_eq!(outcome, KillOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn kill_success_is_killed() {
        let transport = FakeTransport::default();
        let outcome = connection(transport).kill_operation("4512").await.unwrap();
        assert_eq!(outcome, KillOutcome::Killed);
    }

    #[tokio::test]
    async fn kill_connection_error_propagates() {
        let transport = FakeTransport::default()
            .failing_kill("4512", TransportError::Connection("refused".to_string()));
        let error = connection(transport)
            .kill_operation("4512")
            .await
            .unwrap_err();
        assert!(matches!(error, TransportError::Connection(_)));
    }

    #[tokio::test]
    async fn disabled_capability_reports_unavailable() {
        let mut target = ServerTarget::new("db1", "db1.internal:27017");
        target.capabilities.status = false;
        target.capabilities.replica_set = false;
        let conn = ServerConnection::new(
            target,
            FakeTransport::default(),
            Duration::from_millis(750),
        );
        assert!(matches!(
            conn.fetch_status().await.unwrap(),
            Fetch::Unavailable
        ));
        assert!(matches!(
            conn.fetch_replica_set().await.unwrap(),
            Fetch::Unavailable
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out() {
        let transport =
            FakeTransport::default().with_delay("db1", Duration::from_secs(10));
        let error = connection(transport).fetch_operations().await.unwrap_err();
        assert!(matches!(error, TransportError::Timeout));
    }

    #[tokio::test]
    async fn explain_sends_captured_filter_verbatim() {
        let transport = FakeTransport::default();
        let conn = connection(transport.clone());
        let query = json!({ "find": "items", "filter": { "age": { "$gt": 9 } } });
        conn.explain_operation("app.items", &query).await.unwrap();

        let call = transport
            .calls()
            .into_iter()
            .find(|call| call.script.contains(".explain("))
            .expect("explain call recorded");
        assert!(call.script.contains(r#"{"age":{"$gt":9}}"#));
        assert!(call.script.contains(r#"getSiblingDB("app")"#));
        assert!(call.script.contains(r#"getCollection("items")"#));
    }

    #[tokio::test]
    async fn explain_rejects_namespace_without_collection() {
        let conn = connection(FakeTransport::default());
        let error = conn
            .explain_operation("admin", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(error, TransportError::Driver(_)));
    }

    #[test]
    fn replica_set_dates_parse_in_both_ejson_forms() {
        let relaxed = json!({ "$date": "2026-08-28T10:00:00.000Z" });
        let canonical = json!({ "$date": { "$numberLong": "1756375200000" } });
        assert!(parse_date(&relaxed).is_some());
        assert!(parse_date(&canonical).is_some());
    }

    #[test]
    fn opid_literal_quotes_sharded_opids() {
        assert_eq!(opid_literal("4512"), "4512");
        assert_eq!(opid_literal("shard01:4512"), "\"shard01:4512\"");
    }
}
