//! Restore engine
//!
//! Replays a full snapshot into live stores. Graph ids are not stable, so
//! nodes are recreated and an old-id to new-id map (scoped to one restore
//! call) rewires edges; an edge whose endpoint did not come back is skipped
//! and counted, never guessed. Relational users restore by upsert: match
//! on email first, otherwise insert with the original UUID.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{BackupError, Result};
use crate::graph_export::GraphSession;
use crate::relational_export::RelationalSession;
use crate::repository::BackupRepository;
use crate::snapshot::{
    GraphSnapshot, GraphStatistics, RelationalSnapshot, RelationalStatistics, SnapshotMetadata,
};

/// What to restore and how to treat existing data
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub restore_graph: bool,
    pub restore_relational: bool,
    /// Clear the graph store (edges first, then nodes) before replaying
    pub clear_existing: bool,
    /// Update users matched by email instead of touching only missing ones
    pub update_existing_users: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            restore_graph: true,
            restore_relational: true,
            clear_existing: true,
            update_existing_users: true,
        }
    }
}

/// Accurate account of what one restore actually did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreSummary {
    pub backup_key: String,
    pub nodes_restored: u64,
    pub edges_restored: u64,
    /// Edges whose source or target node was absent from the snapshot
    pub edges_skipped: u64,
    pub users_created: u64,
    pub users_updated: u64,
    /// Statistics recorded in the snapshot at export time
    pub graph_statistics: Option<GraphStatistics>,
    pub relational_statistics: Option<RelationalStatistics>,
    pub metadata: Option<SnapshotMetadata>,
}

/// Replays snapshots from a [`BackupRepository`] into live stores
pub struct RestoreEngine {
    repository: Arc<BackupRepository>,
    graph: Arc<dyn GraphSession>,
    relational: Arc<dyn RelationalSession>,
}

impl RestoreEngine {
    pub fn new(
        repository: Arc<BackupRepository>,
        graph: Arc<dyn GraphSession>,
        relational: Arc<dyn RelationalSession>,
    ) -> Self {
        Self {
            repository,
            graph,
            relational,
        }
    }

    /// Restore a full snapshot by key
    pub async fn restore(&self, key: &str, options: &RestoreOptions) -> Result<RestoreSummary> {
        let payload = self.repository.download_snapshot(key).await?;
        if payload.graph.is_none() && payload.relational.is_none() {
            return Err(BackupError::RestoreFailed(format!(
                "{key} is not a full backup snapshot"
            )));
        }

        let mut summary = RestoreSummary {
            backup_key: key.to_string(),
            graph_statistics: payload.graph.as_ref().map(|g| g.statistics.clone()),
            relational_statistics: payload.relational.as_ref().map(|r| r.statistics.clone()),
            metadata: payload.metadata.clone(),
            ..Default::default()
        };

        if options.restore_graph {
            match &payload.graph {
                Some(graph) => self.restore_graph(graph, options, &mut summary).await?,
                None => warn!(key = %key, "Snapshot has no graph section, skipping graph restore"),
            }
        }

        if options.restore_relational {
            match &payload.relational {
                Some(relational) => {
                    self.restore_relational(relational, options, &mut summary)
                        .await?
                }
                None => {
                    warn!(key = %key, "Snapshot has no relational section, skipping user restore")
                }
            }
        }

        info!(
            key = %key,
            nodes = summary.nodes_restored,
            edges = summary.edges_restored,
            edges_skipped = summary.edges_skipped,
            users_created = summary.users_created,
            users_updated = summary.users_updated,
            "Restore complete"
        );
        Ok(summary)
    }

    async fn restore_graph(
        &self,
        snapshot: &GraphSnapshot,
        options: &RestoreOptions,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        if options.clear_existing {
            let edges = self.graph.delete_all_edges().await?;
            let nodes = self.graph.delete_all_nodes().await?;
            info!(nodes = nodes, edges = edges, "Cleared graph store before restore");
        }

        // Old export-time id -> freshly assigned id, valid for this call only
        let mut id_map: HashMap<i64, i64> = HashMap::with_capacity(snapshot.nodes.len());

        for node in &snapshot.nodes {
            let new_id = self
                .graph
                .create_node(node.labels.clone(), node.properties.clone())
                .await?;
            id_map.insert(node.id, new_id);
            summary.nodes_restored += 1;
        }

        for edge in &snapshot.edges {
            let (Some(&source), Some(&target)) =
                (id_map.get(&edge.source_id), id_map.get(&edge.target_id))
            else {
                warn!(
                    edge_id = edge.id,
                    edge_type = %edge.edge_type,
                    source_id = edge.source_id,
                    target_id = edge.target_id,
                    "Skipping edge with unresolved endpoint"
                );
                summary.edges_skipped += 1;
                continue;
            };
            self.graph
                .create_edge(source, target, &edge.edge_type, edge.properties.clone())
                .await?;
            summary.edges_restored += 1;
        }

        Ok(())
    }

    async fn restore_relational(
        &self,
        snapshot: &RelationalSnapshot,
        options: &RestoreOptions,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        for user in &snapshot.users {
            let existing = self.relational.find_user_id_by_email(&user.email).await?;
            match existing {
                Some(_) if options.update_existing_users => {
                    self.relational.update_user_by_email(user).await?;
                    summary.users_updated += 1;
                }
                Some(_) => {}
                None => {
                    self.relational.upsert_user(user).await?;
                    summary.users_created += 1;
                }
            }
        }
        // OAuth accounts and API keys are informational in backups: tokens
        // are masked and key material is absent, so there is nothing usable
        // to write back
        Ok(())
    }

    /// Cold-start bootstrap: if the graph store is empty and a full backup
    /// exists, restore the most recent one. A populated store or an empty
    /// repository is a no-op; a failed emptiness probe propagates rather
    /// than guessing.
    pub async fn initialize_from_latest_backup(&self) -> Result<Option<RestoreSummary>> {
        let node_count = self.graph.node_count().await?;
        if node_count > 0 {
            info!(nodes = node_count, "Graph store already populated, skipping bootstrap");
            return Ok(None);
        }

        let Some(latest) = self.repository.latest_full_backup().await? else {
            info!("No full backups found, starting with empty stores");
            return Ok(None);
        };

        info!(key = %latest.key, "Bootstrapping empty stores from latest full backup");
        let options = RestoreOptions {
            // Store is known empty, nothing to clear
            clear_existing: false,
            ..Default::default()
        };
        self.restore(&latest.key, &options).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_export::{GraphExporter, MemoryGraph};
    use crate::relational_export::{MemoryRelational, RelationalExporter};
    use crate::snapshot::{
        BackupKind, EdgeRecord, NodeRecord, PropMap, PropValue, SnapshotPayload, UserRecord,
    };
    use crate::store::MemoryBlobStore;
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        repository: Arc<BackupRepository>,
        graph: Arc<MemoryGraph>,
        relational: Arc<MemoryRelational>,
        engine: RestoreEngine,
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(BackupRepository::new(
            Arc::new(MemoryBlobStore::new()),
            "backups",
        ));
        let graph = Arc::new(MemoryGraph::new());
        let relational = Arc::new(MemoryRelational::new());
        let engine = RestoreEngine::new(
            Arc::clone(&repository),
            graph.clone() as Arc<dyn GraphSession>,
            relational.clone() as Arc<dyn RelationalSession>,
        );
        Fixture {
            repository,
            graph,
            relational,
            engine,
        }
    }

    fn user(email: &str) -> UserRecord {
        UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            created_at: Some(Utc::now()),
            updated_at: None,
            is_active: true,
            metadata: serde_json::Map::new(),
        }
    }

    async fn upload_full(fx: &Fixture) -> String {
        let graph = GraphExporter::new(fx.graph.clone()).export_all().await.unwrap();
        let relational = RelationalExporter::new(fx.relational.clone())
            .export_all()
            .await
            .unwrap();
        let payload = SnapshotPayload::full(graph, relational);
        let (key, _) = fx
            .repository
            .upload_snapshot(&payload, BackupKind::Manual, None)
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn test_full_cycle_remaps_graph_ids() {
        let fx = fixture();
        let a = fx
            .graph
            .create_node(
                vec!["Entity".to_string()],
                [("name".to_string(), PropValue::Text("a".to_string()))].into(),
            )
            .await
            .unwrap();
        let b = fx
            .graph
            .create_node(vec!["Entity".to_string()], PropMap::new())
            .await
            .unwrap();
        fx.graph
            .create_edge(a, b, "RELATES_TO", PropMap::new())
            .await
            .unwrap();
        fx.relational.insert_user(user("a@example.com"));

        let key = upload_full(&fx).await;
        let summary = fx
            .engine
            .restore(&key, &RestoreOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.nodes_restored, 2);
        assert_eq!(summary.edges_restored, 1);
        assert_eq!(summary.edges_skipped, 0);
        assert_eq!(fx.graph.node_count().await.unwrap(), 2);

        // Ids were reassigned, the edge follows the remapping
        let nodes = fx.graph.fetch_nodes().await.unwrap();
        assert!(nodes.iter().all(|n| n.id != a && n.id != b));
        let edges = fx.graph.fetch_edges().await.unwrap();
        let ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
        assert!(ids.contains(&edges[0].source_id));
        assert!(ids.contains(&edges[0].target_id));
    }

    #[tokio::test]
    async fn test_unresolved_edges_are_skipped_and_counted() {
        let fx = fixture();
        let snapshot = GraphSnapshot {
            nodes: vec![NodeRecord {
                id: 1,
                labels: vec!["Entity".to_string()],
                properties: PropMap::new(),
            }],
            edges: vec![
                EdgeRecord {
                    id: 10,
                    edge_type: "RELATES_TO".to_string(),
                    source_id: 1,
                    // Node 2 is not in the snapshot
                    target_id: 2,
                    properties: PropMap::new(),
                },
            ],
            statistics: GraphStatistics::default(),
        };
        let payload = SnapshotPayload::full(snapshot, Default::default());
        let (key, _) = fx
            .repository
            .upload_snapshot(&payload, BackupKind::Manual, None)
            .await
            .unwrap();

        let summary = fx
            .engine
            .restore(&key, &RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.nodes_restored, 1);
        assert_eq!(summary.edges_restored, 0);
        assert_eq!(summary.edges_skipped, 1);
    }

    #[tokio::test]
    async fn test_user_restore_is_idempotent() {
        let fx = fixture();
        fx.relational.insert_user(user("a@example.com"));
        let key = upload_full(&fx).await;

        let first = fx
            .engine
            .restore(&key, &RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(first.users_created, 0);
        assert_eq!(first.users_updated, 1);
        assert_eq!(fx.relational.user_count(), 1);

        // Restoring into an emptied store recreates with the original UUID
        let original = fx.relational.user_by_email("a@example.com").unwrap();
        let fx2 = fixture();
        let engine = RestoreEngine::new(
            fx.repository.clone(),
            fx2.graph.clone() as Arc<dyn GraphSession>,
            fx2.relational.clone() as Arc<dyn RelationalSession>,
        );
        let second = engine.restore(&key, &RestoreOptions::default()).await.unwrap();
        assert_eq!(second.users_created, 1);
        assert_eq!(
            fx2.relational.user_by_email("a@example.com").unwrap().id,
            original.id
        );
    }

    #[tokio::test]
    async fn test_restore_rejects_incremental_snapshot() {
        let fx = fixture();
        let payload = SnapshotPayload::incremental(crate::snapshot::IncrementalBatch {
            backup_type: BackupKind::Incremental,
            start_time: None,
            end_time: Utc::now(),
            change_count: 0,
            changes: Default::default(),
        });
        let (key, _) = fx
            .repository
            .upload_snapshot(&payload, BackupKind::Incremental, None)
            .await
            .unwrap();

        let err = fx
            .engine
            .restore(&key, &RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::RestoreFailed(_)));
    }

    #[tokio::test]
    async fn test_bootstrap_skips_populated_store() {
        let fx = fixture();
        fx.graph
            .create_node(vec!["Entity".to_string()], PropMap::new())
            .await
            .unwrap();
        upload_full(&fx).await;

        let result = fx.engine.initialize_from_latest_backup().await.unwrap();
        assert!(result.is_none());
        assert_eq!(fx.graph.node_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_restores_into_empty_store() {
        let fx = fixture();
        fx.graph
            .create_node(vec!["Entity".to_string()], PropMap::new())
            .await
            .unwrap();
        fx.relational.insert_user(user("a@example.com"));
        let _key = upload_full(&fx).await;

        // Fresh empty stores against the same repository
        let empty_graph = Arc::new(MemoryGraph::new());
        let empty_relational = Arc::new(MemoryRelational::new());
        let engine = RestoreEngine::new(
            fx.repository.clone(),
            empty_graph.clone() as Arc<dyn GraphSession>,
            empty_relational.clone() as Arc<dyn RelationalSession>,
        );

        let summary = engine.initialize_from_latest_backup().await.unwrap().unwrap();
        assert_eq!(summary.nodes_restored, 1);
        assert_eq!(empty_graph.node_count().await.unwrap(), 1);
        assert_eq!(empty_relational.user_count(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_noop_without_backups() {
        let fx = fixture();
        let result = fx.engine.initialize_from_latest_backup().await.unwrap();
        assert!(result.is_none());
    }
}
