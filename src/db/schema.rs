use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT,
                url TEXT,
                category TEXT,
                severity TEXT,
                location TEXT,
                confidence REAL,
                entities TEXT,
                keywords TEXT,
                reasoning TEXT,
                classified_by TEXT,
                processed BOOLEAN NOT NULL DEFAULT 0,
                processing_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_articles_processed ON articles (processed);
            CREATE INDEX IF NOT EXISTS idx_articles_category ON articles (category, severity);

            CREATE TABLE IF NOT EXISTS processing_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER NOT NULL,
                priority TEXT NOT NULL DEFAULT 'MEDIUM',
                status TEXT NOT NULL DEFAULT 'PENDING',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                error TEXT,
                duration_ms INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                processed_at INTEGER,
                FOREIGN KEY (article_id) REFERENCES articles (id) ON DELETE CASCADE
            );
            -- At most one active (PENDING/PROCESSING) row per article.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_active_article
                ON processing_queue (article_id)
                WHERE status IN ('PENDING', 'PROCESSING');
            CREATE INDEX IF NOT EXISTS idx_queue_status ON processing_queue (status);
            CREATE INDEX IF NOT EXISTS idx_queue_claim
                ON processing_queue (status, priority, created_at);

            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                config TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 10,
                request_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                average_latency_ms INTEGER,
                estimated_cost REAL NOT NULL DEFAULT 0,
                last_used INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_providers_enabled ON providers (enabled, priority);
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Database schema initialized");
        Ok(())
    }
}
