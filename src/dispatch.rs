use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::model::{OpKey, Operation, Selection, Snapshot};
use crate::server::{DriverTransport, KillOutcome, Registry, TransportError};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The selected operation is no longer present in the current snapshot.
    #[error("selection is stale; the operation is no longer running")]
    StaleSelection,
    #[error("no configured server named '{0}'")]
    UnknownServer(String),
    #[error("operation has no explainable query")]
    NotExplainable,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outcome of a kill-older-than batch. A non-empty failure set is reported,
/// never raised: every candidate got its attempt first.
#[derive(Debug, Clone, Default)]
pub struct BatchKillReport {
    pub attempted: usize,
    pub failed: Vec<OpKey>,
}

/// Interprets operator actions against the last published snapshot, so what
/// the operator saw is exactly what gets acted on.
pub struct Dispatcher<T> {
    registry: Arc<Registry<T>>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
}

impl<T> Dispatcher<T>
where
    T: DriverTransport + Clone + Send + Sync + 'static,
{
    pub fn new(registry: Arc<Registry<T>>, snapshot_rx: watch::Receiver<Arc<Snapshot>>) -> Self {
        Self {
            registry,
            snapshot_rx,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Resolves a selection against the current snapshot. When the snapshot
    /// the operator selected from has been superseded, the selection is
    /// honored only if its operation still exists; it is never reapplied to
    /// whatever now occupies the same index.
    fn resolve(&self, selection: &Selection) -> Result<(Arc<Snapshot>, Operation), DispatchError> {
        let current = self.current();
        let operation = if current.id == selection.snapshot_id {
            current
                .operation_at(selection.index)
                .filter(|op| op.key == selection.key)
                .cloned()
        } else {
            current.find(&selection.key).cloned()
        };
        operation
            .map(|op| (current.clone(), op))
            .ok_or(DispatchError::StaleSelection)
    }

    pub async fn explain(&self, selection: &Selection) -> Result<Value, DispatchError> {
        let (_snapshot, operation) = self.resolve(selection)?;
        if operation.namespace.is_empty() || operation.query.is_null() {
            return Err(DispatchError::NotExplainable);
        }
        let conn = self
            .registry
            .get(&operation.key.server)
            .ok_or_else(|| DispatchError::UnknownServer(operation.key.server.clone()))?;
        let plan = conn
            .explain_operation(&operation.namespace, &operation.query)
            .await?;
        Ok(plan)
    }

    pub async fn kill(&self, selection: &Selection) -> Result<KillOutcome, DispatchError> {
        let (_snapshot, operation) = self.resolve(selection)?;
        let conn = self
            .registry
            .get(&operation.key.server)
            .ok_or_else(|| DispatchError::UnknownServer(operation.key.server.clone()))?;
        let outcome = conn.kill_operation(&operation.key.opid).await?;
        info!(key = %operation.key, ?outcome, "kill dispatched");
        Ok(outcome)
    }

    /// Kills every operation in the current snapshot at least `age_secs` old,
    /// optionally restricted to one server.
    pub async fn kill_older_than(&self, age_secs: u64, scope: Option<&str>) -> BatchKillReport {
        let snapshot = self.current();
        batch_kill(&self.registry, &snapshot, age_secs, scope).await
    }
}

/// Shared by the dispatcher and the poller's auto-kill pass. A failed kill
/// never stops the remaining candidates from getting their attempt.
pub async fn batch_kill<T>(
    registry: &Registry<T>,
    snapshot: &Snapshot,
    age_secs: u64,
    scope: Option<&str>,
) -> BatchKillReport
where
    T: DriverTransport,
{
    let mut report = BatchKillReport::default();
    for operation in &snapshot.operations {
        // Sorted by duration descending with unknown durations last, so the
        // first non-candidate ends the scan.
        match operation.duration_secs {
            Some(secs) if secs >= age_secs => {}
            _ => break,
        }
        if let Some(server) = scope
            && operation.key.server != server
        {
            continue;
        }

        report.attempted += 1;
        let Some(conn) = registry.get(&operation.key.server) else {
            warn!(key = %operation.key, "batch kill target has no configured server");
            report.failed.push(operation.key.clone());
            continue;
        };
        match conn.kill_operation(&operation.key.opid).await {
            Ok(_) => {}
            Err(error) => {
                warn!(key = %operation.key, "batch kill attempt failed: {error}");
                report.failed.push(operation.key.clone());
            }
        }
    }
    report
}
