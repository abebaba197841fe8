// SPDX-License-Identifier: MIT
//! Persisted coordinator state (SQLite, WAL mode).
//!
//! A single `settings` key-value table backs the persisted key-space shared
//! between coordinator instances: identity token, tenant code, logout epoch,
//! and the permanent-disable flag. The stale-instance guard reads these every
//! tick, so all accessors go through short timeout-guarded queries.

use anyhow::{Context as _, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking a guard tick indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// Persisted key-space. Only the stale-instance guard and the logout
// orchestrator write the logout epoch and disable keys; everyone may read.
const KEY_IDENTITY_TOKEN: &str = "identity_token";
const KEY_TENANT_CODE: &str = "tenant_code";
const KEY_LOGOUT_EPOCH: &str = "logout_epoch_millis";
const KEY_DISABLE_FLAG: &str = "permanent_disable_flag";
const KEY_DISABLE_EPOCH: &str = "permanent_disable_epoch";

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

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("trakd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Pinned to a single connection — every
    /// pooled connection would otherwise get its own private `:memory:` db.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
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
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await
        .context("failed to create settings table")?;
        Ok(())
    }

    // ─── Generic settings access ─────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        with_timeout(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM settings WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(v,)| v))
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn delete_setting(&self, key: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM settings WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    // ─── Identity ────────────────────────────────────────────────────────────

    pub async fn identity_token(&self) -> Result<Option<String>> {
        self.get_setting(KEY_IDENTITY_TOKEN).await
    }

    pub async fn tenant_code(&self) -> Result<Option<String>> {
        self.get_setting(KEY_TENANT_CODE).await
    }

    pub async fn set_identity(&self, identity_token: &str, tenant_code: &str) -> Result<()> {
        self.set_setting(KEY_IDENTITY_TOKEN, identity_token).await?;
        self.set_setting(KEY_TENANT_CODE, tenant_code).await
    }

    /// Remove the identity keys but keep the logout epoch and disable keys —
    /// those defend against a stale instance that outlives this one.
    pub async fn clear_identity(&self) -> Result<()> {
        self.delete_setting(KEY_IDENTITY_TOKEN).await?;
        self.delete_setting(KEY_TENANT_CODE).await
    }

    // ─── Logout epoch ────────────────────────────────────────────────────────

    pub async fn logout_epoch_millis(&self) -> Result<Option<i64>> {
        Ok(self
            .get_setting(KEY_LOGOUT_EPOCH)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    pub async fn set_logout_epoch_millis(&self, epoch_ms: i64) -> Result<()> {
        self.set_setting(KEY_LOGOUT_EPOCH, &epoch_ms.to_string())
            .await
    }

    // ─── Permanent disable ───────────────────────────────────────────────────

    /// Returns the epoch-milliseconds timestamp the flag was set at, or `None`
    /// when the flag is clear.
    pub async fn permanent_disable(&self) -> Result<Option<i64>> {
        let flag = self.get_setting(KEY_DISABLE_FLAG).await?;
        if flag.as_deref() != Some("true") {
            return Ok(None);
        }
        Ok(self
            .get_setting(KEY_DISABLE_EPOCH)
            .await?
            .and_then(|v| v.parse().ok())
            .or(Some(0)))
    }

    pub async fn set_permanent_disable(&self, epoch_ms: i64) -> Result<()> {
        self.set_setting(KEY_DISABLE_FLAG, "true").await?;
        self.set_setting(KEY_DISABLE_EPOCH, &epoch_ms.to_string())
            .await
    }

    pub async fn clear_permanent_disable(&self) -> Result<()> {
        self.delete_setting(KEY_DISABLE_FLAG).await?;
        self.delete_setting(KEY_DISABLE_EPOCH).await
    }

    // ─── Teardown support ────────────────────────────────────────────────────

    /// True when no identity keys remain persisted. Used by the logout
    /// completeness verification.
    pub async fn identity_absent(&self) -> Result<bool> {
        Ok(self.identity_token().await?.is_none() && self.tenant_code().await?.is_none())
    }
}
