//! Backup repository: key layout and blob-store persistence
//!
//! Owns the naming scheme under the configured prefix and everything that
//! touches the blob store: uploading encoded snapshots with tags and a
//! content digest, downloading and decoding, listing, protected deletes,
//! and the age-based retention sweep.
//!
//! Key layout:
//!   `{prefix}/{backup_type}/{YYYYMMDD_HHMMSS}_backup.json.gz`
//!   `{prefix}/deletions/_{YYYYMMDD_HHMMSS}_{item_type}_deletion.json.gz`
//!
//! The underscore after `deletions/` marks protected objects that the
//! admin delete path refuses to remove.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{BackupError, Result};
use crate::snapshot::{
    self, BackupKind, DeletionMetadata, DeletionSnapshot, SnapshotMetadata, SnapshotPayload,
};
use crate::store::{BlobInfo, BlobStore};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const CONTENT_TYPE: &str = "application/gzip";

/// Persistence layer for encoded snapshots over any [`BlobStore`]
pub struct BackupRepository {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl BackupRepository {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn snapshot_key(&self, kind: BackupKind, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}_backup.json.gz",
            self.prefix,
            kind.as_str(),
            timestamp.format(TIMESTAMP_FORMAT)
        )
    }

    fn deletion_key(&self, item_type: &str, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}/deletions/_{}_{}_deletion.json.gz",
            self.prefix,
            timestamp.format(TIMESTAMP_FORMAT),
            item_type
        )
    }

    /// Whether a key names a protected deletion backup
    pub fn is_protected(&self, key: &str) -> bool {
        key.starts_with(&format!("{}/deletions/_", self.prefix))
    }

    /// Encode and upload a snapshot, returning the stored key and the
    /// metadata that was embedded in the blob
    pub async fn upload_snapshot(
        &self,
        payload: &SnapshotPayload,
        kind: BackupKind,
        description: Option<String>,
    ) -> Result<(String, SnapshotMetadata)> {
        self.upload_snapshot_at(payload, kind, description, Utc::now())
            .await
    }

    /// Like [`upload_snapshot`](Self::upload_snapshot) with an explicit
    /// timestamp, which also fixes the key name
    pub async fn upload_snapshot_at(
        &self,
        payload: &SnapshotPayload,
        kind: BackupKind,
        description: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<(String, SnapshotMetadata)> {
        let (bytes, metadata) = snapshot::encode(payload, kind, description.clone(), timestamp)?;
        let key = self.snapshot_key(kind, timestamp);

        let mut tags = BTreeMap::new();
        tags.insert("backup-type".to_string(), kind.as_str().to_string());
        tags.insert(
            "timestamp".to_string(),
            timestamp.format(TIMESTAMP_FORMAT).to_string(),
        );
        tags.insert("content-digest".to_string(), sha256_hex(&bytes));
        if let Some(desc) = description {
            tags.insert("description".to_string(), desc);
        }

        let size = bytes.len();
        self.store
            .put(&key, bytes, CONTENT_TYPE, tags)
            .await?;

        info!(
            key = %key,
            backup_type = %kind,
            size_bytes = size,
            "Uploaded backup snapshot"
        );
        Ok((key, metadata))
    }

    /// Download and decode a snapshot by key
    pub async fn download_snapshot(&self, key: &str) -> Result<SnapshotPayload> {
        let bytes = self.store.get(key).await?;
        let payload = snapshot::decode(&bytes)?;
        debug!(key = %key, size_bytes = bytes.len(), "Downloaded backup snapshot");
        Ok(payload)
    }

    /// List stored backups, newest first, optionally filtered by kind
    pub async fn list_backups(
        &self,
        kind: Option<BackupKind>,
        max: usize,
    ) -> Result<Vec<BlobInfo>> {
        let prefix = match kind {
            Some(k) => format!("{}/{}/", self.prefix, k.as_str()),
            None => format!("{}/", self.prefix),
        };
        self.store.list(&prefix, max).await
    }

    /// Most recent full (scheduled or manual) backup, if any
    pub async fn latest_full_backup(&self) -> Result<Option<BlobInfo>> {
        let mut candidates = self.list_backups(Some(BackupKind::Scheduled), 1).await?;
        candidates.extend(self.list_backups(Some(BackupKind::Manual), 1).await?);
        candidates.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(candidates.into_iter().next())
    }

    /// Delete a backup by key. Deletion backups are protected and the
    /// request fails without touching the store.
    pub async fn delete_backup(&self, key: &str) -> Result<()> {
        if self.is_protected(key) {
            warn!(key = %key, "Refusing to delete protected deletion backup");
            return Err(BackupError::ProtectedBackup(key.to_string()));
        }
        self.store.delete(key).await?;
        info!(key = %key, "Deleted backup");
        Ok(())
    }

    /// Persist a protected pre-deletion snapshot of the given items
    pub async fn save_deletion_backup(
        &self,
        item_type: &str,
        reason: &str,
        items: Vec<serde_json::Value>,
    ) -> Result<String> {
        self.save_deletion_backup_at(item_type, reason, items, Utc::now())
            .await
    }

    pub async fn save_deletion_backup_at(
        &self,
        item_type: &str,
        reason: &str,
        items: Vec<serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<String> {
        let item_count = items.len();
        let deletion = DeletionSnapshot {
            deletion_metadata: DeletionMetadata {
                timestamp,
                item_type: item_type.to_string(),
                item_count,
                reason: reason.to_string(),
            },
            deleted_items: items,
        };
        let bytes = snapshot::encode_deletion(&deletion)?;
        let key = self.deletion_key(item_type, timestamp);

        let mut tags = BTreeMap::new();
        tags.insert("backup-type".to_string(), "deletion".to_string());
        tags.insert("item-type".to_string(), item_type.to_string());
        tags.insert("protected".to_string(), "true".to_string());
        tags.insert("content-digest".to_string(), sha256_hex(&bytes));

        self.store.put(&key, bytes, CONTENT_TYPE, tags).await?;
        info!(
            key = %key,
            item_type = item_type,
            item_count = item_count,
            "Saved protected deletion backup"
        );
        Ok(key)
    }

    /// Download and decode a deletion backup by key
    pub async fn download_deletion_backup(&self, key: &str) -> Result<DeletionSnapshot> {
        let bytes = self.store.get(key).await?;
        snapshot::decode_deletion(&bytes)
    }

    /// Age-based retention sweep: manual backups past `manual_days` and
    /// scheduled backups past `scheduled_days` are removed. Incremental
    /// and deletion backups are never touched. Returns removed count.
    ///
    /// Backup age comes from the timestamp baked into the key, not store
    /// mtimes, so a re-uploaded old blob still expires on schedule.
    pub async fn apply_retention(
        &self,
        manual_days: i64,
        scheduled_days: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut removed = 0usize;
        for (kind, days) in [
            (BackupKind::Manual, manual_days),
            (BackupKind::Scheduled, scheduled_days),
        ] {
            let cutoff = now - Duration::days(days);
            let backups = self.list_backups(Some(kind), usize::MAX).await?;
            for info in backups {
                let Some(stamp) = parse_key_timestamp(&info.key) else {
                    warn!(key = %info.key, "Skipping backup with unparseable timestamp");
                    continue;
                };
                if stamp < cutoff {
                    self.store.delete(&info.key).await?;
                    removed += 1;
                    info!(
                        key = %info.key,
                        backup_type = %kind,
                        age_days = (now - stamp).num_days(),
                        "Expired backup removed by retention sweep"
                    );
                }
            }
        }
        Ok(removed)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Extract the `YYYYMMDD_HHMMSS` stamp from a backup key's file name
fn parse_key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let name = key.rsplit('/').next()?;
    let stamp = name.strip_prefix('_').unwrap_or(name);
    // Keys are not necessarily ours; a foreign file name may put a
    // multibyte character inside the slice range
    if stamp.len() < 15 || !stamp.is_char_boundary(15) {
        return None;
    }
    NaiveDateTime::parse_from_str(&stamp[..15], TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{GraphSnapshot, RelationalSnapshot};
    use crate::store::MemoryBlobStore;
    use chrono::TimeZone;

    fn repo() -> BackupRepository {
        BackupRepository::new(Arc::new(MemoryBlobStore::new()), "backups")
    }

    fn empty_payload() -> SnapshotPayload {
        SnapshotPayload::full(GraphSnapshot::default(), RelationalSnapshot::default())
    }

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let repo = repo();
        let payload = empty_payload();
        let (key, metadata) = repo
            .upload_snapshot_at(
                &payload,
                BackupKind::Manual,
                Some("pre-upgrade".to_string()),
                ts(2025, 6, 1, 12, 0, 0),
            )
            .await
            .unwrap();

        assert_eq!(key, "backups/manual/20250601_120000_backup.json.gz");
        assert_eq!(metadata.backup_type, BackupKind::Manual);

        let decoded = repo.download_snapshot(&key).await.unwrap();
        assert_eq!(decoded.graph, payload.graph);
        assert_eq!(decoded.metadata.unwrap().description.as_deref(), Some("pre-upgrade"));
    }

    #[tokio::test]
    async fn test_list_filters_by_kind_newest_first() {
        let repo = repo();
        let payload = empty_payload();
        for (kind, stamp) in [
            (BackupKind::Manual, ts(2025, 6, 1, 0, 0, 0)),
            (BackupKind::Scheduled, ts(2025, 6, 2, 0, 0, 0)),
            (BackupKind::Scheduled, ts(2025, 6, 3, 0, 0, 0)),
        ] {
            repo.upload_snapshot_at(&payload, kind, None, stamp)
                .await
                .unwrap();
        }

        let scheduled = repo
            .list_backups(Some(BackupKind::Scheduled), 10)
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 2);
        assert!(scheduled[0].key.contains("20250603"));

        let all = repo.list_backups(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_deletion_backups_are_protected() {
        let repo = repo();
        let key = repo
            .save_deletion_backup_at(
                "nodes",
                "manual_deletion",
                vec![serde_json::json!({"id": 7})],
                ts(2025, 6, 1, 9, 30, 0),
            )
            .await
            .unwrap();

        assert_eq!(
            key,
            "backups/deletions/_20250601_093000_nodes_deletion.json.gz"
        );
        assert!(repo.is_protected(&key));

        let err = repo.delete_backup(&key).await.unwrap_err();
        assert!(matches!(err, BackupError::ProtectedBackup(_)));

        // Still readable after the refused delete
        let back = repo.download_deletion_backup(&key).await.unwrap();
        assert_eq!(back.deletion_metadata.item_count, 1);
        assert_eq!(back.deletion_metadata.item_type, "nodes");
    }

    #[tokio::test]
    async fn test_delete_unprotected_backup() {
        let repo = repo();
        let (key, _) = repo
            .upload_snapshot_at(&empty_payload(), BackupKind::Manual, None, ts(2025, 6, 1, 0, 0, 0))
            .await
            .unwrap();

        repo.delete_backup(&key).await.unwrap();
        assert!(matches!(
            repo.download_snapshot(&key).await.unwrap_err(),
            BackupError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_retention_expires_old_full_backups_only() {
        let repo = repo();
        let payload = empty_payload();
        let now = ts(2025, 7, 1, 0, 0, 0);

        // 40 days old: manual expires (30d), scheduled survives (90d)
        let old = ts(2025, 5, 22, 0, 0, 0);
        repo.upload_snapshot_at(&payload, BackupKind::Manual, None, old)
            .await
            .unwrap();
        repo.upload_snapshot_at(&payload, BackupKind::Scheduled, None, old)
            .await
            .unwrap();
        // Fresh manual survives
        repo.upload_snapshot_at(&payload, BackupKind::Manual, None, ts(2025, 6, 30, 0, 0, 0))
            .await
            .unwrap();
        // Old incrementals and deletions are never swept
        repo.upload_snapshot_at(&payload, BackupKind::Incremental, None, ts(2024, 1, 1, 0, 0, 0))
            .await
            .unwrap();
        repo.save_deletion_backup_at("users", "gdpr", vec![], ts(2024, 1, 1, 0, 0, 0))
            .await
            .unwrap();

        let removed = repo.apply_retention(30, 90, now).await.unwrap();
        assert_eq!(removed, 1);

        let all = repo.list_backups(None, 100).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(!all
            .iter()
            .any(|b| b.key == "backups/manual/20250522_000000_backup.json.gz"));
    }

    #[tokio::test]
    async fn test_latest_full_backup_prefers_newest() {
        let repo = repo();
        let payload = empty_payload();
        assert!(repo.latest_full_backup().await.unwrap().is_none());

        repo.upload_snapshot_at(&payload, BackupKind::Scheduled, None, ts(2025, 6, 1, 0, 0, 0))
            .await
            .unwrap();
        repo.upload_snapshot_at(&payload, BackupKind::Manual, None, ts(2025, 6, 5, 0, 0, 0))
            .await
            .unwrap();

        let latest = repo.latest_full_backup().await.unwrap().unwrap();
        assert!(latest.key.contains("manual/20250605"));
    }

    #[test]
    fn test_parse_key_timestamp() {
        let key = "backups/scheduled/20250601_120000_backup.json.gz";
        assert_eq!(parse_key_timestamp(key), Some(ts(2025, 6, 1, 12, 0, 0)));
        assert!(parse_key_timestamp("backups/scheduled/garbage.json.gz").is_none());
        // Foreign file names with multibyte characters must not panic
        assert!(parse_key_timestamp("backups/manual/メモのバックアップ.json.gz").is_none());
        assert!(parse_key_timestamp("backups/manual/2025年06月01日_バックアップ.gz").is_none());
    }
}
