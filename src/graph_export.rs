//! Graph store export
//!
//! [`GraphSession`] is the seam to the graph database; [`GraphExporter`]
//! turns a session into a [`GraphSnapshot`]: all nodes ordered by id, all
//! edges, provider temporal values rewritten to ISO-8601 strings, and
//! aggregate statistics computed from the fetched records.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::{BackupError, Result};
use crate::snapshot::{
    normalize_prop_map, EdgeRecord, GraphSnapshot, GraphStatistics, NodeRecord, PropMap,
};

/// Connection to a graph store, scoped to what backup and restore need
#[async_trait]
pub trait GraphSession: Send + Sync {
    /// Total node count; used to probe for an empty graph
    async fn node_count(&self) -> Result<u64>;

    /// All nodes, ordered by internal id ascending
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>>;

    /// All edges, in any stable order
    async fn fetch_edges(&self) -> Result<Vec<EdgeRecord>>;

    /// Create a node, returning the store-assigned id
    async fn create_node(&self, labels: Vec<String>, properties: PropMap) -> Result<i64>;

    /// Create an edge between two existing nodes
    async fn create_edge(
        &self,
        source_id: i64,
        target_id: i64,
        edge_type: &str,
        properties: PropMap,
    ) -> Result<i64>;

    /// Remove every edge, returning the removed count
    async fn delete_all_edges(&self) -> Result<u64>;

    /// Remove every node. Fails if edges still exist.
    async fn delete_all_nodes(&self) -> Result<u64>;
}

/// Statistics grouping key for a node's label set: sorted labels joined
/// with `:`, or `unlabeled` for a bare node
pub fn label_key(labels: &[String]) -> String {
    if labels.is_empty() {
        return "unlabeled".to_string();
    }
    let mut sorted: Vec<&str> = labels.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(":")
}

/// Produces full graph snapshots from a [`GraphSession`]
pub struct GraphExporter {
    session: Arc<dyn GraphSession>,
}

impl GraphExporter {
    pub fn new(session: Arc<dyn GraphSession>) -> Self {
        Self { session }
    }

    /// Export every node and edge with normalized properties and computed
    /// statistics
    pub async fn export_all(&self) -> Result<GraphSnapshot> {
        let mut nodes = self.session.fetch_nodes().await?;
        nodes.sort_by_key(|n| n.id);
        let edges = self.session.fetch_edges().await?;

        let mut node_counts_by_label: BTreeMap<String, u64> = BTreeMap::new();
        let nodes: Vec<NodeRecord> = nodes
            .into_iter()
            .map(|n| {
                *node_counts_by_label.entry(label_key(&n.labels)).or_insert(0) += 1;
                NodeRecord {
                    id: n.id,
                    labels: n.labels,
                    properties: normalize_prop_map(n.properties),
                }
            })
            .collect();

        let mut edge_counts_by_type: BTreeMap<String, u64> = BTreeMap::new();
        let edges: Vec<EdgeRecord> = edges
            .into_iter()
            .map(|e| {
                *edge_counts_by_type.entry(e.edge_type.clone()).or_insert(0) += 1;
                EdgeRecord {
                    id: e.id,
                    edge_type: e.edge_type,
                    source_id: e.source_id,
                    target_id: e.target_id,
                    properties: normalize_prop_map(e.properties),
                }
            })
            .collect();

        let statistics = GraphStatistics {
            total_nodes: nodes.len() as u64,
            total_edges: edges.len() as u64,
            node_counts_by_label,
            edge_counts_by_type,
        };

        info!(
            nodes = statistics.total_nodes,
            edges = statistics.total_edges,
            "Exported graph snapshot"
        );
        Ok(GraphSnapshot {
            nodes,
            edges,
            statistics,
        })
    }
}

struct StoredEdge {
    edge_type: String,
    source_id: i64,
    target_id: i64,
    properties: PropMap,
}

#[derive(Default)]
struct GraphInner {
    next_id: i64,
    nodes: BTreeMap<i64, (Vec<String>, PropMap)>,
    edges: BTreeMap<i64, StoredEdge>,
}

/// In-memory graph store for tests and local runs. Ids are monotonic and
/// never reused, so a restored graph gets fresh ids like a real store.
#[derive(Default)]
pub struct MemoryGraph {
    inner: Mutex<GraphInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphSession for MemoryGraph {
    async fn node_count(&self) -> Result<u64> {
        Ok(self.inner.lock().nodes.len() as u64)
    }

    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .iter()
            .map(|(id, (labels, properties))| NodeRecord {
                id: *id,
                labels: labels.clone(),
                properties: properties.clone(),
            })
            .collect())
    }

    async fn fetch_edges(&self) -> Result<Vec<EdgeRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .edges
            .iter()
            .map(|(id, e)| EdgeRecord {
                id: *id,
                edge_type: e.edge_type.clone(),
                source_id: e.source_id,
                target_id: e.target_id,
                properties: e.properties.clone(),
            })
            .collect())
    }

    async fn create_node(&self, labels: Vec<String>, properties: PropMap) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.nodes.insert(id, (labels, properties));
        debug!(node_id = id, "Created node");
        Ok(id)
    }

    async fn create_edge(
        &self,
        source_id: i64,
        target_id: i64,
        edge_type: &str,
        properties: PropMap,
    ) -> Result<i64> {
        let mut inner = self.inner.lock();
        if !inner.nodes.contains_key(&source_id) {
            return Err(BackupError::NotFound(format!("node {source_id}")));
        }
        if !inner.nodes.contains_key(&target_id) {
            return Err(BackupError::NotFound(format!("node {target_id}")));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.edges.insert(
            id,
            StoredEdge {
                edge_type: edge_type.to_string(),
                source_id,
                target_id,
                properties,
            },
        );
        Ok(id)
    }

    async fn delete_all_edges(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let removed = inner.edges.len() as u64;
        inner.edges.clear();
        Ok(removed)
    }

    async fn delete_all_nodes(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if !inner.edges.is_empty() {
            return Err(BackupError::ExportFailed(
                "cannot delete nodes while edges exist".to_string(),
            ));
        }
        let removed = inner.nodes.len() as u64;
        inner.nodes.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PropValue;
    use chrono::Utc;

    fn props(pairs: &[(&str, PropValue)]) -> PropMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_label_key() {
        assert_eq!(label_key(&[]), "unlabeled");
        assert_eq!(label_key(&["Entity".to_string()]), "Entity");
        assert_eq!(
            label_key(&["Episodic".to_string(), "Entity".to_string()]),
            "Entity:Episodic"
        );
    }

    #[tokio::test]
    async fn test_export_orders_nodes_and_computes_stats() {
        let graph = Arc::new(MemoryGraph::new());
        let a = graph
            .create_node(vec!["Entity".to_string()], PropMap::new())
            .await
            .unwrap();
        let b = graph
            .create_node(vec!["Entity".to_string()], PropMap::new())
            .await
            .unwrap();
        let c = graph.create_node(vec![], PropMap::new()).await.unwrap();
        graph
            .create_edge(a, b, "RELATES_TO", PropMap::new())
            .await
            .unwrap();
        graph
            .create_edge(b, c, "RELATES_TO", PropMap::new())
            .await
            .unwrap();
        graph
            .create_edge(a, c, "MENTIONS", PropMap::new())
            .await
            .unwrap();

        let snapshot = GraphExporter::new(graph).export_all().await.unwrap();

        let ids: Vec<i64> = snapshot.nodes.iter().map(|n| n.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        assert_eq!(snapshot.statistics.total_nodes, 3);
        assert_eq!(snapshot.statistics.total_edges, 3);
        assert_eq!(snapshot.statistics.node_counts_by_label["Entity"], 2);
        assert_eq!(snapshot.statistics.node_counts_by_label["unlabeled"], 1);
        assert_eq!(snapshot.statistics.edge_counts_by_type["RELATES_TO"], 2);
        assert_eq!(snapshot.statistics.edge_counts_by_type["MENTIONS"], 1);
    }

    #[tokio::test]
    async fn test_export_normalizes_temporal_properties() {
        let graph = Arc::new(MemoryGraph::new());
        let dt = Utc::now();
        graph
            .create_node(
                vec!["Episodic".to_string()],
                props(&[("created_at", PropValue::DateTime(dt))]),
            )
            .await
            .unwrap();

        let snapshot = GraphExporter::new(graph).export_all().await.unwrap();
        assert_eq!(
            snapshot.nodes[0].properties["created_at"],
            PropValue::Text(dt.to_rfc3339())
        );
    }

    #[tokio::test]
    async fn test_edge_requires_existing_endpoints() {
        let graph = MemoryGraph::new();
        let a = graph
            .create_node(vec!["Entity".to_string()], PropMap::new())
            .await
            .unwrap();
        let err = graph
            .create_edge(a, 999, "RELATES_TO", PropMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_all_nodes_requires_edges_cleared_first() {
        let graph = MemoryGraph::new();
        let a = graph.create_node(vec![], PropMap::new()).await.unwrap();
        let b = graph.create_node(vec![], PropMap::new()).await.unwrap();
        graph
            .create_edge(a, b, "RELATES_TO", PropMap::new())
            .await
            .unwrap();

        assert!(graph.delete_all_nodes().await.is_err());
        assert_eq!(graph.delete_all_edges().await.unwrap(), 1);
        assert_eq!(graph.delete_all_nodes().await.unwrap(), 2);
        assert_eq!(graph.node_count().await.unwrap(), 0);
    }
}
