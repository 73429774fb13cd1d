//! Snapshot data model and codec
//!
//! Everything that goes over the wire to the blob store lives here: the
//! typed property values exported from the graph store, node/edge/user
//! records, incremental change batches, deletion snapshots, and the
//! gzip+JSON codec that turns a payload into a self-describing compressed
//! blob and back.
//!
//! All datetime values are normalized to ISO-8601 strings before encoding,
//! so a decoded payload reproduces the encoded one exactly.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use uuid::Uuid;

use crate::errors::{BackupError, Result};

/// Version tag recorded in every snapshot's metadata block
pub const SOURCE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Property values
// ============================================================================

/// Property map on a graph node or edge
pub type PropMap = BTreeMap<String, PropValue>;

/// A graph property value: typed where the schema is known, with list/map
/// fallbacks for forward-compatible nesting.
///
/// `DateTime` only ever appears in freshly fetched records; the exporter
/// rewrites it to an ISO-8601 `Text` before anything is encoded, so decoded
/// payloads contain strings (untagged decode resolves strings to `Text`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PropValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PropValue>),
    Map(PropMap),
    DateTime(DateTime<Utc>),
}

impl PropValue {
    /// Rewrite every provider-native temporal value to an ISO-8601 string,
    /// recursively through nested maps and lists.
    pub fn normalize_temporal(self) -> PropValue {
        match self {
            PropValue::DateTime(dt) => PropValue::Text(dt.to_rfc3339()),
            PropValue::List(items) => {
                PropValue::List(items.into_iter().map(PropValue::normalize_temporal).collect())
            }
            PropValue::Map(map) => PropValue::Map(normalize_prop_map(map)),
            other => other,
        }
    }
}

/// Normalize every value in a property map. See [`PropValue::normalize_temporal`].
pub fn normalize_prop_map(map: PropMap) -> PropMap {
    map.into_iter()
        .map(|(k, v)| (k, v.normalize_temporal()))
        .collect()
}

// ============================================================================
// Graph records
// ============================================================================

/// Exported graph node. The id is the provider's internal id at export
/// time and is NOT stable across restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: i64,
    pub labels: Vec<String>,
    #[serde(default)]
    pub properties: PropMap,
}

/// Exported directed edge, referencing nodes by export-time ids
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub source_id: i64,
    pub target_id: i64,
    #[serde(default)]
    pub properties: PropMap,
}

/// Aggregate counts over one graph export
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphStatistics {
    pub node_counts_by_label: BTreeMap<String, u64>,
    pub edge_counts_by_type: BTreeMap<String, u64>,
    pub total_nodes: u64,
    pub total_edges: u64,
}

/// Full graph export: all nodes, all edges, aggregate statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
    pub statistics: GraphStatistics,
}

// ============================================================================
// Relational records
// ============================================================================

/// Exported relational identity record. Unlike graph ids, the UUID is
/// stable across restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Exported OAuth account; tokens are masked at export and the raw values
/// never reach a backup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OauthAccountRecord {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub provider_user_id: String,
    pub access_token_masked: Option<String>,
    pub refresh_token_masked: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Exported API key record; only the display prefix is stored, never key
/// material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key_prefix: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Aggregate counts over one relational export. Optional counts are absent
/// when the corresponding table does not exist in the target schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelationalStatistics {
    pub user_count: u64,
    pub active_user_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_account_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_api_key_count: Option<u64>,
}

/// Full relational export
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelationalSnapshot {
    pub users: Vec<UserRecord>,
    pub oauth: Vec<OauthAccountRecord>,
    pub api_keys: Vec<ApiKeyRecord>,
    pub statistics: RelationalStatistics,
}

// ============================================================================
// Change events and incremental batches
// ============================================================================

/// Kind of a tracked data change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A single recorded mutation notification, immutable once created.
/// Owned exclusively by the change tracker until flushed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub timestamp: DateTime<Utc>,
    pub change_type: ChangeType,
    /// Free-form tag: "node", "edge", "user", "episode", ...
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One change as stored inside an incremental batch group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl From<ChangeEvent> for ChangeEntry {
    fn from(event: ChangeEvent) -> Self {
        Self {
            id: event.entity_id,
            timestamp: event.timestamp,
            data: event.data,
            metadata: event.metadata,
        }
    }
}

/// Changes of one `{entity_type}_{change_type}` group, in arrival order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChangeGroup {
    pub entities: Vec<ChangeEntry>,
}

/// The incremental section of a snapshot: all changes flushed in one sync
/// cycle, grouped by `{entity_type}_{change_type}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncrementalBatch {
    pub backup_type: BackupKind,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub change_count: usize,
    pub changes: BTreeMap<String, ChangeGroup>,
}

// ============================================================================
// Deletion snapshots
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletionMetadata {
    pub timestamp: DateTime<Utc>,
    pub item_type: String,
    pub item_count: usize,
    pub reason: String,
}

/// Protected pre-deletion snapshot: the exact items about to be destroyed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletionSnapshot {
    pub deletion_metadata: DeletionMetadata,
    pub deleted_items: Vec<serde_json::Value>,
}

// ============================================================================
// Snapshot payload and metadata
// ============================================================================

/// Backup type, encoded into both the key path and the metadata block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Scheduled,
    Incremental,
    PreDeletion,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Incremental => "incremental",
            Self::PreDeletion => "pre_deletion",
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-describing metadata block attached to every encoded snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    pub timestamp: DateTime<Utc>,
    pub backup_type: BackupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub neo4j_node_count: u64,
    pub neo4j_edge_count: u64,
    pub postgres_record_count: u64,
    #[serde(default)]
    pub deleted_items: Vec<String>,
    pub source_version: String,
}

/// Decoded snapshot payload. The `neo4j`/`postgres` wire names are kept so
/// blobs stay readable by the original tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPayload {
    #[serde(rename = "neo4j", default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphSnapshot>,
    #[serde(rename = "postgres", default, skip_serializing_if = "Option::is_none")]
    pub relational: Option<RelationalSnapshot>,
    #[serde(flatten)]
    pub incremental: Option<IncrementalBatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SnapshotMetadata>,
}

impl SnapshotPayload {
    /// Payload for a full graph + relational backup
    pub fn full(graph: GraphSnapshot, relational: RelationalSnapshot) -> Self {
        Self {
            graph: Some(graph),
            relational: Some(relational),
            incremental: None,
            metadata: None,
        }
    }

    /// Payload for an incremental change batch
    pub fn incremental(batch: IncrementalBatch) -> Self {
        Self {
            graph: None,
            relational: None,
            incremental: Some(batch),
            metadata: None,
        }
    }

    fn node_count(&self) -> u64 {
        self.graph.as_ref().map(|g| g.nodes.len() as u64).unwrap_or(0)
    }

    fn edge_count(&self) -> u64 {
        self.graph.as_ref().map(|g| g.edges.len() as u64).unwrap_or(0)
    }

    fn user_count(&self) -> u64 {
        self.relational
            .as_ref()
            .map(|r| r.users.len() as u64)
            .unwrap_or(0)
    }
}

// ============================================================================
// Codec
// ============================================================================

fn gzip_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| BackupError::Serialization(format!("gzip: {e}")))?;
    encoder
        .finish()
        .map_err(|e| BackupError::Serialization(format!("gzip: {e}")))
}

fn gunzip_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| BackupError::CorruptSnapshot(format!("decompression failed: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| BackupError::CorruptSnapshot(format!("parse failed: {e}")))
}

/// Attach a metadata block (counts derived from payload shape) and compress.
/// Returns the blob bytes together with the metadata that was embedded.
pub fn encode(
    payload: &SnapshotPayload,
    kind: BackupKind,
    description: Option<String>,
    timestamp: DateTime<Utc>,
) -> Result<(Vec<u8>, SnapshotMetadata)> {
    let metadata = SnapshotMetadata {
        timestamp,
        backup_type: kind,
        description,
        neo4j_node_count: payload.node_count(),
        neo4j_edge_count: payload.edge_count(),
        postgres_record_count: payload.user_count(),
        deleted_items: Vec::new(),
        source_version: SOURCE_VERSION.to_string(),
    };

    let mut enriched = payload.clone();
    enriched.metadata = Some(metadata.clone());

    let bytes = gzip_json(&enriched)?;
    Ok((bytes, metadata))
}

/// Decompress and parse a snapshot blob. Fails with CorruptSnapshot if the
/// bytes do not decompress or do not parse.
pub fn decode(bytes: &[u8]) -> Result<SnapshotPayload> {
    gunzip_json(bytes)
}

/// Compress a deletion snapshot (its metadata lives inside the body)
pub fn encode_deletion(snapshot: &DeletionSnapshot) -> Result<Vec<u8>> {
    gzip_json(snapshot)
}

/// Inverse of [`encode_deletion`]
pub fn decode_deletion(bytes: &[u8]) -> Result<DeletionSnapshot> {
    gunzip_json(bytes)
}
