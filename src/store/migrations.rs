// dispatcher - distributed download orchestration cluster
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Schema migrations for the SQLite backend.
//!
//! Tracked in a `_migrations` table so `migrate()` is safe to call on
//! every startup.

use sqlx::SqlitePool;

use crate::error::Result;

async fn run_migration<F>(pool: &SqlitePool, id: i64, name: &str, future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let already_applied: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM _migrations WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    if already_applied.is_some() {
        return Ok(());
    }

    future.await?;

    sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;

    tracing::info!(migration = name, "applied migration");
    Ok(())
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    run_migration(pool, 1, "create_initial_schema", async {
        create_initial_schema(pool).await
    })
    .await?;

    Ok(())
}

async fn create_initial_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL,
            worker_id TEXT,
            engine_gid TEXT,
            options TEXT NOT NULL DEFAULT '{}',
            progress REAL NOT NULL DEFAULT 0,
            download_speed INTEGER,
            error_message TEXT,
            result TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_worker_id ON tasks(worker_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            hostname TEXT NOT NULL,
            address TEXT NOT NULL,
            port INTEGER NOT NULL,
            status TEXT NOT NULL,
            connected_at TEXT NOT NULL,
            last_heartbeat TEXT NOT NULL,
            capabilities TEXT NOT NULL DEFAULT '{}',
            current_tasks TEXT NOT NULL DEFAULT '[]',
            total_slots INTEGER NOT NULL DEFAULT 5,
            used_slots INTEGER NOT NULL DEFAULT 0,
            health_metrics TEXT NOT NULL DEFAULT '{}',
            error_history TEXT NOT NULL DEFAULT '[]',
            performance_stats TEXT NOT NULL DEFAULT '{}'
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn migration_creates_expected_tables() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(n,)| n).collect();
        assert!(names.contains(&"tasks".to_string()));
        assert!(names.contains(&"workers".to_string()));
        assert!(names.contains(&"_migrations".to_string()));
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();

        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM _migrations")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
