use chrono::Utc;
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::Database;
use crate::classifier::ClassificationResult;
use crate::TARGET_DB;

/// The slice of an article the classifier needs, plus identity fields used
/// when writing results back.
#[derive(Clone, Debug)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub source: Option<String>,
    pub url: Option<String>,
}

impl Database {
    /// Inserts a bare article row. The RSS layer owns article creation; this
    /// exists for seeding and tests.
    #[instrument(target = "db_query", level = "info", skip(self, title, content))]
    pub async fn insert_article(
        &self,
        title: &str,
        content: &str,
        source: Option<&str>,
        url: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO articles (title, content, source, url, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(title)
        .bind(content)
        .bind(source)
        .bind(url)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_article(&self, id: i64) -> Result<Option<Article>, sqlx::Error> {
        let row = sqlx::query("SELECT id, title, content, source, url FROM articles WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|row| Article {
            id: row.get("id"),
            title: row.get("title"),
            content: row.get("content"),
            source: row.get("source"),
            url: row.get("url"),
        }))
    }

    /// Articles that have never been classified, oldest first. Feeds the
    /// enqueue CLI path.
    pub async fn unprocessed_article_ids(&self, limit: i64) -> Result<Vec<i64>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id FROM articles WHERE processed = 0 ORDER BY created_at ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    /// Writes a classification onto the article record and clears any
    /// previous processing error.
    #[instrument(target = "db_query", level = "info", skip(self, result))]
    pub async fn apply_classification(
        &self,
        article_id: i64,
        result: &ClassificationResult,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().timestamp();
        let entities = serde_json::to_string(&result.entities)
            .map_err(|e| sqlx::Error::Protocol(format!("entities not serializable: {}", e)))?;
        let keywords = serde_json::to_string(&result.keywords)
            .map_err(|e| sqlx::Error::Protocol(format!("keywords not serializable: {}", e)))?;

        sqlx::query(
            r#"
            UPDATE articles
            SET category = ?1, severity = ?2, location = ?3, confidence = ?4,
                entities = ?5, keywords = ?6, reasoning = ?7, classified_by = ?8,
                processed = 1, processing_error = NULL, updated_at = ?9
            WHERE id = ?10
            "#,
        )
        .bind(result.category.as_str())
        .bind(result.severity.as_str())
        .bind(result.location.as_str())
        .bind(result.confidence)
        .bind(entities)
        .bind(keywords)
        .bind(&result.reasoning)
        .bind(&result.provider)
        .bind(now)
        .bind(article_id)
        .execute(self.pool())
        .await?;

        debug!(
            target: TARGET_DB,
            "Article {} classified as {}/{} by {}",
            article_id,
            result.category.as_str(),
            result.severity.as_str(),
            result.provider
        );
        Ok(())
    }

    /// Records a classification failure against the article for operator
    /// inspection without marking it processed.
    pub async fn record_processing_error(
        &self,
        article_id: i64,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE articles SET processing_error = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(error)
            .bind(now)
            .bind(article_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
