//! Relational store export
//!
//! [`RelationalSession`] is the seam to the relational database.
//! [`RelationalExporter`] produces a [`RelationalSnapshot`], masking OAuth
//! token material on the way out and degrading gracefully when optional
//! tables are absent from the target schema: a missing table yields an
//! empty section with its count omitted from statistics, never an error.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::errors::Result;
use crate::snapshot::{
    ApiKeyRecord, OauthAccountRecord, RelationalSnapshot, RelationalStatistics, UserRecord,
};

/// OAuth account as fetched from the store, tokens still in the clear.
/// Only the masked [`OauthAccountRecord`] form ever reaches a backup.
#[derive(Debug, Clone)]
pub struct OauthAccountRow {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub provider_user_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Connection to the relational store, scoped to export and restore
#[async_trait]
pub trait RelationalSession: Send + Sync {
    /// Whether a table exists in the connected schema
    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn fetch_users(&self) -> Result<Vec<UserRecord>>;

    async fn fetch_oauth_accounts(&self) -> Result<Vec<OauthAccountRow>>;

    async fn fetch_api_keys(&self) -> Result<Vec<ApiKeyRecord>>;

    async fn find_user_id_by_email(&self, email: &str) -> Result<Option<Uuid>>;

    /// Update an existing row matched by email, keeping its current id
    async fn update_user_by_email(&self, user: &UserRecord) -> Result<()>;

    /// Insert with the record's original id; on id conflict, update in place
    async fn upsert_user(&self, user: &UserRecord) -> Result<()>;
}

/// Mask a secret for storage: `***` plus the last 8 characters, enough to
/// correlate with provider dashboards without being usable
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    let tail_start = chars.len().saturating_sub(8);
    let tail: String = chars[tail_start..].iter().collect();
    format!("***{tail}")
}

fn mask_row(row: OauthAccountRow) -> OauthAccountRecord {
    OauthAccountRecord {
        id: row.id,
        user_id: row.user_id,
        provider: row.provider,
        provider_user_id: row.provider_user_id,
        access_token_masked: row.access_token.as_deref().map(mask_secret),
        refresh_token_masked: row.refresh_token.as_deref().map(mask_secret),
        expires_at: row.expires_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

/// Produces relational snapshots from a [`RelationalSession`]
pub struct RelationalExporter {
    session: Arc<dyn RelationalSession>,
}

impl RelationalExporter {
    pub fn new(session: Arc<dyn RelationalSession>) -> Self {
        Self { session }
    }

    /// Export users, OAuth accounts, and API keys with statistics. Each
    /// section is probed with `table_exists` first; probe failures
    /// propagate, absent tables degrade to empty.
    pub async fn export_all(&self) -> Result<RelationalSnapshot> {
        if !self.session.table_exists("users").await? {
            info!("users table absent, exporting empty relational snapshot");
            return Ok(RelationalSnapshot::default());
        }

        let users = self.session.fetch_users().await?;
        let active_user_count = users.iter().filter(|u| u.is_active).count() as u64;

        let mut statistics = RelationalStatistics {
            user_count: users.len() as u64,
            active_user_count,
            ..Default::default()
        };

        let oauth = if self.session.table_exists("oauth_accounts").await? {
            let rows = self.session.fetch_oauth_accounts().await?;
            statistics.oauth_account_count = Some(rows.len() as u64);
            rows.into_iter().map(mask_row).collect()
        } else {
            info!("oauth_accounts table absent, skipping");
            Vec::new()
        };

        let api_keys = if self.session.table_exists("api_keys").await? {
            let keys = self.session.fetch_api_keys().await?;
            statistics.api_key_count = Some(keys.len() as u64);
            statistics.active_api_key_count =
                Some(keys.iter().filter(|k| k.is_active).count() as u64);
            keys
        } else {
            info!("api_keys table absent, skipping");
            Vec::new()
        };

        info!(
            users = statistics.user_count,
            oauth_accounts = oauth.len(),
            api_keys = api_keys.len(),
            "Exported relational snapshot"
        );
        Ok(RelationalSnapshot {
            users,
            oauth,
            api_keys,
            statistics,
        })
    }
}

#[derive(Default)]
struct RelationalInner {
    tables: BTreeSet<String>,
    users: BTreeMap<Uuid, UserRecord>,
    oauth: Vec<OauthAccountRow>,
    api_keys: Vec<ApiKeyRecord>,
}

/// In-memory relational store for tests and local runs
pub struct MemoryRelational {
    inner: Mutex<RelationalInner>,
}

impl Default for MemoryRelational {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelational {
    /// Store with the full schema present
    pub fn new() -> Self {
        Self::with_tables(&["users", "oauth_accounts", "api_keys"])
    }

    /// Store with only the named tables, for schema-drift scenarios
    pub fn with_tables(tables: &[&str]) -> Self {
        let inner = RelationalInner {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.inner.lock().users.insert(user.id, user);
    }

    pub fn insert_oauth_account(&self, row: OauthAccountRow) {
        self.inner.lock().oauth.push(row);
    }

    pub fn insert_api_key(&self, key: ApiKeyRecord) {
        self.inner.lock().api_keys.push(key);
    }

    pub fn user_count(&self) -> usize {
        self.inner.lock().users.len()
    }

    pub fn user_by_email(&self, email: &str) -> Option<UserRecord> {
        self.inner
            .lock()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
    }
}

#[async_trait]
impl RelationalSession for MemoryRelational {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.inner.lock().tables.contains(table))
    }

    async fn fetch_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.inner.lock().users.values().cloned().collect())
    }

    async fn fetch_oauth_accounts(&self) -> Result<Vec<OauthAccountRow>> {
        Ok(self.inner.lock().oauth.clone())
    }

    async fn fetch_api_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        Ok(self.inner.lock().api_keys.clone())
    }

    async fn find_user_id_by_email(&self, email: &str) -> Result<Option<Uuid>> {
        Ok(self
            .inner
            .lock()
            .users
            .values()
            .find(|u| u.email == email)
            .map(|u| u.id))
    }

    async fn update_user_by_email(&self, user: &UserRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.users.values_mut().find(|u| u.email == user.email) {
            existing.is_active = user.is_active;
            existing.metadata = user.metadata.clone();
            existing.updated_at = user.updated_at;
        }
        Ok(())
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        self.inner.lock().users.insert(user.id, user.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(email: &str, active: bool) -> UserRecord {
        UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            created_at: Some(Utc::now()),
            updated_at: None,
            is_active: active,
            metadata: serde_json::Map::new(),
        }
    }

    fn oauth_row(token: &str) -> OauthAccountRow {
        OauthAccountRow {
            id: "oa-1".to_string(),
            user_id: "u-1".to_string(),
            provider: "github".to_string(),
            provider_user_id: "gh-42".to_string(),
            access_token: Some(token.to_string()),
            refresh_token: None,
            expires_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("gho_abcdefgh12345678"), "***12345678");
        // Short secrets still get the sentinel, nothing is revealed extra
        assert_eq!(mask_secret("short"), "***short");
        assert_eq!(mask_secret(""), "***");
    }

    #[test]
    fn test_mask_secret_multibyte_tail() {
        // Must not panic on non-ASCII boundaries
        let masked = mask_secret("tökén-ßecret-日本語トークン");
        assert!(masked.starts_with("***"));
    }

    #[tokio::test]
    async fn test_export_masks_tokens_and_counts() {
        let store = Arc::new(MemoryRelational::new());
        store.insert_user(user("a@example.com", true));
        store.insert_user(user("b@example.com", false));
        store.insert_oauth_account(oauth_row("gho_abcdefgh12345678"));

        let snapshot = RelationalExporter::new(store).export_all().await.unwrap();

        assert_eq!(snapshot.statistics.user_count, 2);
        assert_eq!(snapshot.statistics.active_user_count, 1);
        assert_eq!(snapshot.statistics.oauth_account_count, Some(1));
        assert_eq!(snapshot.statistics.api_key_count, Some(0));
        assert_eq!(
            snapshot.oauth[0].access_token_masked.as_deref(),
            Some("***12345678")
        );
        assert!(snapshot.oauth[0].refresh_token_masked.is_none());
    }

    #[tokio::test]
    async fn test_export_degrades_when_optional_tables_absent() {
        let store = Arc::new(MemoryRelational::with_tables(&["users"]));
        store.insert_user(user("a@example.com", true));

        let snapshot = RelationalExporter::new(store).export_all().await.unwrap();

        assert_eq!(snapshot.statistics.user_count, 1);
        assert!(snapshot.oauth.is_empty());
        assert!(snapshot.api_keys.is_empty());
        assert_eq!(snapshot.statistics.oauth_account_count, None);
        assert_eq!(snapshot.statistics.api_key_count, None);
        assert_eq!(snapshot.statistics.active_api_key_count, None);
    }

    #[tokio::test]
    async fn test_export_empty_when_users_table_absent() {
        let store = Arc::new(MemoryRelational::with_tables(&[]));
        let snapshot = RelationalExporter::new(store).export_all().await.unwrap();
        assert_eq!(snapshot, RelationalSnapshot::default());
    }

    #[tokio::test]
    async fn test_upsert_and_update_by_email() {
        let store = MemoryRelational::new();
        let mut u = user("a@example.com", true);
        store.upsert_user(&u).await.unwrap();
        assert_eq!(store.user_count(), 1);

        // Same id again updates in place
        u.is_active = false;
        store.upsert_user(&u).await.unwrap();
        assert_eq!(store.user_count(), 1);
        assert!(!store.user_by_email("a@example.com").unwrap().is_active);

        // Update by email keeps the existing id
        let mut replacement = user("a@example.com", true);
        replacement.id = Uuid::new_v4();
        store.update_user_by_email(&replacement).await.unwrap();
        let stored = store.user_by_email("a@example.com").unwrap();
        assert_eq!(stored.id, u.id);
        assert!(stored.is_active);
    }
}
