//! Local durable store — SQLite in WAL mode.
//!
//! Two tables back the whole daemon:
//! - `settings` — generic key→value rows (anonymous balance record, cached
//!   favorites, cached mission book, device key, linked account id).
//! - `purchase_records` — append-only purchase audit log. Never read to
//!   derive a balance; the ledger mutates its counter directly.

use anyhow::{Context as _, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// One audit entry per credited purchase transaction.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct PurchaseRecordRow {
    /// ULID — lexicographic order is creation order.
    pub id: String,
    /// Identity that received the credits ("anonymous:<device-key>" or
    /// "user:<user-id>").
    pub identity: String,
    pub product_id: String,
    pub credits_granted: i64,
    pub created_at: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding it
    /// are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("creditd.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            use sqlx::ConnectOptions as _;
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             )",
        )
        .execute(pool)
        .await
        .context("failed to create settings table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS purchase_records (
                 id              TEXT PRIMARY KEY,
                 identity        TEXT NOT NULL,
                 product_id      TEXT NOT NULL,
                 credits_granted INTEGER NOT NULL,
                 created_at      TEXT NOT NULL
             )",
        )
        .execute(pool)
        .await
        .context("failed to create purchase_records table")?;

        Ok(())
    }

    // ─── Settings (key→value) ───────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Purchase audit log ─────────────────────────────────────────────────

    /// Append one audit row for a credited purchase. Append-only — rows are
    /// never updated or deleted.
    pub async fn append_purchase_record(
        &self,
        identity: &str,
        product_id: &str,
        credits_granted: i64,
    ) -> Result<PurchaseRecordRow> {
        let id = ulid::Ulid::new().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO purchase_records (id, identity, product_id, credits_granted, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(identity)
        .bind(product_id)
        .bind(credits_granted)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(PurchaseRecordRow {
            id,
            identity: identity.to_string(),
            product_id: product_id.to_string(),
            credits_granted,
            created_at: now,
        })
    }

    pub async fn list_purchase_records(&self) -> Result<Vec<PurchaseRecordRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM purchase_records ORDER BY id DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    pub async fn count_purchase_records(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM purchase_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn settings_roundtrip_and_overwrite() {
        let (_dir, storage) = test_storage().await;

        assert_eq!(storage.get_setting("balance").await.unwrap(), None);

        storage.set_setting("balance", "3").await.unwrap();
        assert_eq!(
            storage.get_setting("balance").await.unwrap().as_deref(),
            Some("3")
        );

        storage.set_setting("balance", "2").await.unwrap();
        assert_eq!(
            storage.get_setting("balance").await.unwrap().as_deref(),
            Some("2")
        );

        storage.delete_setting("balance").await.unwrap();
        assert_eq!(storage.get_setting("balance").await.unwrap(), None);
    }

    #[tokio::test]
    async fn purchase_records_append_only_ordering() {
        let (_dir, storage) = test_storage().await;

        storage
            .append_purchase_record("anonymous:abc", "credits_small", 5)
            .await
            .unwrap();
        storage
            .append_purchase_record("user:u1", "credits_medium", 20)
            .await
            .unwrap();

        let records = storage.list_purchase_records().await.unwrap();
        assert_eq!(records.len(), 2);
        // Newest first (ULIDs sort by creation time).
        assert_eq!(records[0].product_id, "credits_medium");
        assert_eq!(records[0].credits_granted, 20);
        assert_eq!(records[1].identity, "anonymous:abc");

        assert_eq!(storage.count_purchase_records().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reopen_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::new(dir.path()).await.unwrap();
            storage.set_setting("device_key", "feed").await.unwrap();
        }
        let storage = Storage::new(dir.path()).await.unwrap();
        assert_eq!(
            storage.get_setting("device_key").await.unwrap().as_deref(),
            Some("feed")
        );
    }
}
