use std::{path::Path, time::Duration};

use async_trait::async_trait;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};

use super::{ContainerUpdate, Store, StoreError};
use crate::types::{ContainerStatus, LogEntry, TrackedContainer};

const CONTAINER_COLUMNS: &str = "id, runtime_id, name, alias, server_name, added_at, swapped_at, status, max_period, max_lines, last_log_timestamp";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECTIONS: u32 = 10;

/// `SQLite` backed [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
    in_memory: bool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file at `path` and ensures
    /// the schema exists.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Sqlx(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            in_memory: false,
        };
        store.create_schema().await?;
        log::info!("Opened database at {path:?}");
        Ok(store)
    }

    /// Fresh in-memory database with the production schema.
    ///
    /// Every connection to `:memory:` sees its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            in_memory: true,
        };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                runtime_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                alias TEXT NOT NULL DEFAULT '',
                server_name TEXT NOT NULL DEFAULT '',
                added_at INTEGER NOT NULL,
                swapped_at INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'unknown',
                max_period INTEGER NOT NULL DEFAULT 0,
                max_lines INTEGER NOT NULL DEFAULT 0,
                last_log_timestamp INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS logs (
                id TEXT PRIMARY KEY,
                tracked_container_id TEXT NOT NULL,
                runtime_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                message TEXT NOT NULL,
                FOREIGN KEY (tracked_container_id) REFERENCES containers(id) ON DELETE CASCADE
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_logs_unique ON logs(tracked_container_id, timestamp, message)",
            "CREATE INDEX IF NOT EXISTS idx_logs_container_timestamp ON logs(tracked_container_id, timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_containers_name ON containers(name)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn row_to_container(row: &SqliteRow) -> Result<TrackedContainer, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(TrackedContainer {
        id: row.try_get("id")?,
        runtime_id: row.try_get("runtime_id")?,
        name: row.try_get("name")?,
        alias: row.try_get("alias")?,
        server_name: row.try_get("server_name")?,
        added_at: row.try_get("added_at")?,
        swapped_at: row.try_get("swapped_at")?,
        status: status.parse().unwrap_or_default(),
        max_period_seconds: row.try_get("max_period")?,
        max_line_count: row.try_get("max_lines")?,
        last_log_timestamp: row.try_get("last_log_timestamp")?,
    })
}

fn row_to_log(row: &SqliteRow) -> Result<LogEntry, sqlx::Error> {
    Ok(LogEntry {
        id: row.try_get("id")?,
        tracked_container_id: row.try_get("tracked_container_id")?,
        runtime_id: row.try_get("runtime_id")?,
        timestamp: row.try_get("timestamp")?,
        message: row.try_get("message")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_container(&self, container: &TrackedContainer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO containers (
                id, runtime_id, name, alias, server_name, added_at, swapped_at,
                status, max_period, max_lines, last_log_timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&container.id)
        .bind(&container.runtime_id)
        .bind(&container.name)
        .bind(&container.alias)
        .bind(&container.server_name)
        .bind(container.added_at)
        .bind(container.swapped_at)
        .bind(container.status.as_ref())
        .bind(container.max_period_seconds)
        .bind(container.max_line_count)
        .bind(container.last_log_timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<Option<TrackedContainer>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_container).transpose()?)
    }

    async fn list_containers(&self) -> Result<Vec<TrackedContainer>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers ORDER BY added_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(row_to_container)
            .collect::<Result<_, _>>()?)
    }

    async fn find_by_runtime_id(
        &self,
        runtime_id: &str,
    ) -> Result<Option<TrackedContainer>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE runtime_id = ?"
        ))
        .bind(runtime_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_container).transpose()?)
    }

    async fn containers_with_policy(&self) -> Result<Vec<TrackedContainer>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE max_period > 0 OR max_lines > 0"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(row_to_container)
            .collect::<Result<_, _>>()?)
    }

    async fn update_container(
        &self,
        id: &str,
        update: &ContainerUpdate,
    ) -> Result<TrackedContainer, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE containers
            SET name = ?, alias = ?, server_name = ?, max_period = ?, max_lines = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(&update.alias)
        .bind(&update.server_name)
        .bind(update.policy.max_period_seconds)
        .bind(update.policy.max_line_count)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Container '{id}'")));
        }

        self.get_container(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Container '{id}'")))
    }

    async fn swap_runtime(
        &self,
        id: &str,
        new_runtime_id: &str,
        new_name: &str,
        swapped_at: i64,
        marker: &LogEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE containers SET runtime_id = ?, name = ?, swapped_at = ? WHERE id = ?",
        )
        .bind(new_runtime_id)
        .bind(new_name)
        .bind(swapped_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Container '{id}'")));
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO logs (id, tracked_container_id, runtime_id, timestamp, message)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&marker.id)
        .bind(&marker.tracked_container_id)
        .bind(&marker.runtime_id)
        .bind(marker.timestamp)
        .bind(&marker.message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ContainerStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE containers SET status = ? WHERE id = ?")
            .bind(status.as_ref())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM logs WHERE tracked_container_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM containers WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_checkpoint(&self, id: &str, timestamp: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE containers SET last_log_timestamp = ? WHERE id = ? AND last_log_timestamp < ?",
        )
        .bind(timestamp)
        .bind(id)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_log(&self, entry: &LogEntry) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO logs (id, tracked_container_id, runtime_id, timestamp, message)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.tracked_container_id)
        .bind(&entry.runtime_id)
        .bind(entry.timestamp)
        .bind(&entry.message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_logs(
        &self,
        tracked_container_id: &str,
        limit: i64,
        before: Option<i64>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tracked_container_id, runtime_id, timestamp, message
            FROM logs
            WHERE tracked_container_id = ? AND (? IS NULL OR timestamp < ?)
            ORDER BY timestamp DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(tracked_container_id)
        .bind(before)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_log).collect::<Result<_, _>>()?)
    }

    async fn count_logs(&self, tracked_container_id: &str) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM logs WHERE tracked_container_id = ?",
        )
        .bind(tracked_container_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn latest_log_timestamp(
        &self,
        tracked_container_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        let latest = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(timestamp) FROM logs WHERE tracked_container_id = ?",
        )
        .bind(tracked_container_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn delete_oldest_logs(
        &self,
        tracked_container_id: &str,
        count: i64,
    ) -> Result<u64, StoreError> {
        if count <= 0 {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM logs WHERE id IN (
                SELECT id FROM logs
                WHERE tracked_container_id = ?
                ORDER BY timestamp ASC, rowid ASC
                LIMIT ?
            )
            "#,
        )
        .bind(tracked_container_id)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_logs_before(
        &self,
        tracked_container_id: &str,
        cutoff: i64,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM logs WHERE tracked_container_id = ? AND timestamp < ?")
                .bind(tracked_container_id)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn delete_orphan_logs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM logs WHERE tracked_container_id NOT IN (SELECT id FROM containers)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn checkpoint_wal(&self) -> Result<(), StoreError> {
        if self.in_memory {
            return Ok(());
        }
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
impl SqliteStore {
    /// Inserts a log row bypassing the foreign key, to simulate rows left
    /// behind by a removal that did not cascade.
    pub async fn insert_orphan_log(&self, entry: &LogEntry) {
        let mut conn = self.pool.acquire().await.unwrap();
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO logs (id, tracked_container_id, runtime_id, timestamp, message) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.tracked_container_id)
        .bind(&entry.runtime_id)
        .bind(entry.timestamp)
        .bind(&entry.message)
        .execute(&mut *conn)
        .await
        .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await
            .unwrap();
    }
}
