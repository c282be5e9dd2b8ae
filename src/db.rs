use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::Result;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        // The UNIQUE constraint on token is what the issuer's retry loop
        // relies on; insertion on collision must fail.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                token TEXT UNIQUE NOT NULL,
                ciphertext_path TEXT NOT NULL,
                original_name TEXT NOT NULL,
                mime_type TEXT,
                size INTEGER NOT NULL DEFAULT 0,
                password_hash TEXT,
                max_views INTEGER NOT NULL DEFAULT 10,
                age_limit_days INTEGER NOT NULL DEFAULT 7,
                views INTEGER NOT NULL DEFAULT 0,
                owner_id TEXT NOT NULL,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // No foreign key on file_id: audit entries outlive their file.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS access_logs (
                id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                ip TEXT NOT NULL,
                user_agent TEXT,
                accessed_by TEXT,
                country TEXT,
                region TEXT,
                city TEXT,
                outcome TEXT NOT NULL,
                viewed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_token ON files(token)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_owner_id ON files(owner_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_access_logs_file_id ON access_logs(file_id)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn defaulted_created_at_parses_as_rfc3339() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("schema.db").to_str().unwrap())
            .await
            .unwrap();
        db.run_migrations().await.unwrap();

        // Row inserted without an explicit created_at must still satisfy the
        // age arithmetic, which parses the column as RFC3339
        sqlx::query(
            "INSERT INTO files (id, token, ciphertext_path, original_name, owner_id)
             VALUES ('f1', 'tok', 'path', 'name', 'owner-1')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let (created_at,): (String,) = sqlx::query_as("SELECT created_at FROM files WHERE id = 'f1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&created_at).is_ok());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("twice.db").to_str().unwrap())
            .await
            .unwrap();
        db.run_migrations().await.unwrap();
        db.run_migrations().await.unwrap();
    }
}
