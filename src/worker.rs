//! Background backup worker
//!
//! Accepts change notifications from request paths without blocking them,
//! flushes accumulated changes as incremental snapshots on a fixed cadence,
//! and takes periodic full backups. One sync cycle runs at a time: the
//! receiver lives behind an async mutex, so a timer tick, a manual
//! `force_sync`, and the shutdown flush serialize instead of racing.
//!
//! A failed upload never loses data: the drained batch is retained in
//! arrival order and retried, with newer changes appended after it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::BackupConfig;
use crate::errors::Result;
use crate::graph_export::{GraphExporter, GraphSession};
use crate::relational_export::{RelationalExporter, RelationalSession};
use crate::repository::BackupRepository;
use crate::snapshot::{
    BackupKind, ChangeEvent, ChangeGroup, ChangeType, IncrementalBatch, SnapshotMetadata,
    SnapshotPayload,
};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Stopping,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Point-in-time view of the worker, for admin/status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub queue_depth: usize,
    pub pending_count: usize,
    pub total_synced: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_full_backup_time: Option<DateTime<Utc>>,
    pub sync_interval_secs: u64,
    pub full_backup_enabled: bool,
    pub full_backup_interval_secs: u64,
}

struct SyncState {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    /// Drained but not yet uploaded changes, in arrival order
    pending: Vec<ChangeEvent>,
}

struct Lifecycle {
    state: WorkerState,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

struct WorkerInner {
    config: BackupConfig,
    repository: Arc<BackupRepository>,
    graph_exporter: GraphExporter,
    relational_exporter: RelationalExporter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
    sync_state: tokio::sync::Mutex<SyncState>,
    queue_depth: AtomicUsize,
    pending_count: AtomicUsize,
    total_synced: AtomicU64,
    last_sync_time: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_full_backup_time: parking_lot::Mutex<Option<DateTime<Utc>>>,
    lifecycle: parking_lot::Mutex<Lifecycle>,
}

/// Group drained changes into an incremental batch keyed by
/// `{entity_type}_{change_type}`
fn build_batch(pending: &[ChangeEvent], end_time: DateTime<Utc>) -> IncrementalBatch {
    let mut changes: BTreeMap<String, ChangeGroup> = BTreeMap::new();
    for event in pending {
        let key = format!("{}_{}", event.entity_type, event.change_type.as_str());
        changes
            .entry(key)
            .or_default()
            .entities
            .push(event.clone().into());
    }
    IncrementalBatch {
        backup_type: BackupKind::Incremental,
        start_time: pending.iter().map(|e| e.timestamp).min(),
        end_time,
        change_count: pending.len(),
        changes,
    }
}

impl WorkerInner {
    /// Drain the queue into the retained batch and upload it. Returns the
    /// number of changes synced (0 when there was nothing to do).
    async fn sync_once(&self) -> Result<usize> {
        let mut state = self.sync_state.lock().await;

        while let Ok(event) = state.rx.try_recv() {
            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            state.pending.push(event);
        }
        self.pending_count.store(state.pending.len(), Ordering::Relaxed);

        if state.pending.is_empty() {
            debug!("No pending changes, skipping incremental sync");
            return Ok(0);
        }

        let now = Utc::now();
        let batch = build_batch(&state.pending, now);
        let count = batch.change_count;
        let payload = SnapshotPayload::incremental(batch);
        let description = format!("Incremental backup with {count} changes");

        match self
            .repository
            .upload_snapshot(&payload, BackupKind::Incremental, Some(description))
            .await
        {
            Ok((key, _)) => {
                state.pending.clear();
                self.pending_count.store(0, Ordering::Relaxed);
                self.total_synced.fetch_add(count as u64, Ordering::Relaxed);
                *self.last_sync_time.lock() = Some(now);
                info!(key = %key, changes = count, "Incremental sync complete");
                Ok(count)
            }
            Err(e) => {
                // Batch stays in `pending`; next cycle retries it with any
                // newer changes appended after
                warn!(
                    changes = count,
                    error = %e,
                    "Incremental sync failed, retaining changes for retry"
                );
                Err(e)
            }
        }
    }

    /// Export both stores and upload one full snapshot
    async fn full_backup_once(
        &self,
        kind: BackupKind,
        description: Option<String>,
    ) -> Result<(String, SnapshotMetadata)> {
        let graph = self.graph_exporter.export_all().await?;
        let relational = self.relational_exporter.export_all().await?;
        let payload = SnapshotPayload::full(graph, relational);

        let (key, metadata) = self
            .repository
            .upload_snapshot(&payload, kind, description)
            .await?;
        *self.last_full_backup_time.lock() = Some(metadata.timestamp);
        info!(
            key = %key,
            nodes = metadata.neo4j_node_count,
            edges = metadata.neo4j_edge_count,
            users = metadata.postgres_record_count,
            "Full backup complete"
        );
        Ok((key, metadata))
    }

    async fn sync_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.sync_interval_secs);
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(e) = self.sync_once().await {
                        warn!(error = %e, "Scheduled incremental sync failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Sync loop shutting down");
                    break;
                }
            }
        }
    }

    async fn full_backup_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.full_backup_interval_secs);
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    match self.full_backup_once(BackupKind::Scheduled, None).await {
                        Ok(_) => {
                            // Best-effort sweep; failures wait for the next cycle
                            if let Err(e) = self
                                .repository
                                .apply_retention(
                                    self.config.manual_retention_days,
                                    self.config.scheduled_retention_days,
                                    Utc::now(),
                                )
                                .await
                            {
                                warn!(error = %e, "Retention sweep failed");
                            }
                        }
                        Err(e) => error!(error = %e, "Scheduled full backup failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Full backup loop shutting down");
                    break;
                }
            }
        }
    }
}

/// The backup worker: change intake plus background sync and full-backup
/// tasks. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct BackupWorker {
    inner: Arc<WorkerInner>,
}

impl BackupWorker {
    pub fn new(
        config: BackupConfig,
        repository: Arc<BackupRepository>,
        graph: Arc<dyn GraphSession>,
        relational: Arc<dyn RelationalSession>,
    ) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(WorkerInner {
                config,
                repository,
                graph_exporter: GraphExporter::new(graph),
                relational_exporter: RelationalExporter::new(relational),
                tx,
                sync_state: tokio::sync::Mutex::new(SyncState {
                    rx,
                    pending: Vec::new(),
                }),
                queue_depth: AtomicUsize::new(0),
                pending_count: AtomicUsize::new(0),
                total_synced: AtomicU64::new(0),
                last_sync_time: parking_lot::Mutex::new(None),
                last_full_backup_time: parking_lot::Mutex::new(None),
                lifecycle: parking_lot::Mutex::new(Lifecycle {
                    state: WorkerState::Stopped,
                    shutdown_tx: None,
                    tasks: Vec::new(),
                }),
            }),
        })
    }

    /// Record a change event. Never blocks and never fails the caller's
    /// request path; the event is timestamped at call time.
    pub fn track(&self, event: ChangeEvent) {
        // Count before sending: the sync task decrements as it drains, and
        // the counter must never drop below zero
        self.inner.queue_depth.fetch_add(1, Ordering::Relaxed);
        if self.inner.tx.send(event).is_err() {
            self.inner.queue_depth.fetch_sub(1, Ordering::Relaxed);
            warn!("Change tracker channel closed, dropping event");
        }
    }

    /// Convenience form of [`track`](Self::track)
    pub fn track_change(
        &self,
        change_type: ChangeType,
        entity_type: &str,
        entity_id: &str,
        data: Option<serde_json::Value>,
    ) {
        self.track(ChangeEvent {
            timestamp: Utc::now(),
            change_type,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            metadata: BTreeMap::new(),
        });
    }

    /// Start the background sync and full-backup tasks. Idempotent.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state == WorkerState::Running {
            debug!("Worker already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            Arc::clone(&self.inner).sync_loop(shutdown_rx.clone()),
        ));
        if self.inner.config.full_backup_enabled {
            tasks.push(tokio::spawn(
                Arc::clone(&self.inner).full_backup_loop(shutdown_rx),
            ));
        }

        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.tasks = tasks;
        lifecycle.state = WorkerState::Running;
        info!(
            sync_interval_secs = self.inner.config.sync_interval_secs,
            full_backup_enabled = self.inner.config.full_backup_enabled,
            "Backup worker started"
        );
    }

    /// Stop the background tasks and flush remaining changes. Changes that
    /// still fail to upload are reported lost in the log, never silently.
    pub async fn stop(&self) {
        let (shutdown_tx, tasks) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state != WorkerState::Running {
                return;
            }
            lifecycle.state = WorkerState::Stopping;
            (lifecycle.shutdown_tx.take(), std::mem::take(&mut lifecycle.tasks))
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task panicked during shutdown");
            }
        }

        // Final flush of whatever the loops did not get to
        match self.inner.sync_once().await {
            Ok(0) => {}
            Ok(n) => info!(changes = n, "Final sync on shutdown complete"),
            Err(e) => {
                let retained = self.inner.pending_count.load(Ordering::Relaxed);
                error!(
                    error = %e,
                    retained = retained,
                    "Final sync on shutdown failed, unsynced changes remain"
                );
            }
        }

        self.inner.lifecycle.lock().state = WorkerState::Stopped;
        info!("Backup worker stopped");
    }

    /// Run one incremental sync cycle immediately, serialized with the
    /// scheduled cycles
    pub async fn force_sync(&self) -> Result<usize> {
        self.inner.sync_once().await
    }

    /// Take a full backup now with the given kind and description
    pub async fn backup_now(
        &self,
        kind: BackupKind,
        description: Option<String>,
    ) -> Result<(String, SnapshotMetadata)> {
        self.inner.full_backup_once(kind, description).await
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lifecycle.lock().state
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            is_running: self.state() == WorkerState::Running,
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            pending_count: self.inner.pending_count.load(Ordering::Relaxed),
            total_synced: self.inner.total_synced.load(Ordering::Relaxed),
            last_sync_time: *self.inner.last_sync_time.lock(),
            last_full_backup_time: *self.inner.last_full_backup_time.lock(),
            sync_interval_secs: self.inner.config.sync_interval_secs,
            full_backup_enabled: self.inner.config.full_backup_enabled,
            full_backup_interval_secs: self.inner.config.full_backup_interval_secs,
        }
    }

    pub fn repository(&self) -> &Arc<BackupRepository> {
        &self.inner.repository
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(entity_type: &str, change_type: ChangeType, id: &str) -> ChangeEvent {
        ChangeEvent {
            timestamp: Utc::now(),
            change_type,
            entity_type: entity_type.to_string(),
            entity_id: id.to_string(),
            data: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_build_batch_groups_by_entity_and_change_type() {
        let pending = vec![
            event("episode", ChangeType::Create, "ep-1"),
            event("episode", ChangeType::Create, "ep-2"),
            event("node", ChangeType::Delete, "n-9"),
        ];
        let batch = build_batch(&pending, Utc::now());

        assert_eq!(batch.change_count, 3);
        assert_eq!(batch.changes["episode_create"].entities.len(), 2);
        assert_eq!(batch.changes["episode_create"].entities[0].id, "ep-1");
        assert_eq!(batch.changes["node_delete"].entities.len(), 1);
        assert_eq!(batch.start_time, Some(pending[0].timestamp));
        assert_eq!(batch.backup_type, BackupKind::Incremental);
    }

    #[test]
    fn test_build_batch_empty() {
        let batch = build_batch(&[], Utc::now());
        assert_eq!(batch.change_count, 0);
        assert!(batch.start_time.is_none());
        assert!(batch.changes.is_empty());
    }

    #[test]
    fn test_worker_state_names() {
        assert_eq!(WorkerState::Stopped.as_str(), "stopped");
        assert_eq!(WorkerState::Running.as_str(), "running");
        assert_eq!(WorkerState::Stopping.as_str(), "stopping");
    }
}
