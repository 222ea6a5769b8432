use chrono::Utc;
use sqlx::Row;
use tracing::{debug, info, instrument, warn};

use super::core::Database;
use crate::{Priority, QueueStatus, TARGET_DB};

/// One persisted unit of classification work tied to a single article.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub id: i64,
    pub article_id: i64,
    pub priority: Priority,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// An active (PENDING/PROCESSING) item already exists for the article.
    Skipped,
}

#[derive(Clone, Debug, Default)]
pub struct BulkEnqueueResult {
    pub added: usize,
    pub skipped: usize,
    pub errors: Vec<(i64, String)>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RetryOutcome {
    /// FAILED items with retry credits left, returned to PENDING.
    pub requeued: u64,
    /// Terminally failed items left untouched.
    pub exhausted: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueMetrics {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub success_rate: f64,
    pub average_processing_ms: f64,
}

fn priority_rank(priority: Priority) -> u8 {
    match priority {
        Priority::High => 0,
        Priority::Medium => 1,
        Priority::Low => 2,
    }
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<QueueItem, sqlx::Error> {
    let priority_str: String = row.get("priority");
    let status_str: String = row.get("status");
    let priority = Priority::parse(&priority_str)
        .ok_or_else(|| sqlx::Error::Protocol(format!("invalid priority: {}", priority_str)))?;
    let status = QueueStatus::parse(&status_str)
        .ok_or_else(|| sqlx::Error::Protocol(format!("invalid status: {}", status_str)))?;

    Ok(QueueItem {
        id: row.get("id"),
        article_id: row.get("article_id"),
        priority,
        status,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        error: row.get("error"),
        duration_ms: row.get("duration_ms"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        processed_at: row.get("processed_at"),
    })
}

const ITEM_COLUMNS: &str = "id, article_id, priority, status, retry_count, max_retries, \
     error, duration_ms, created_at, updated_at, processed_at";

impl Database {
    /// Adds a PENDING item for the article unless an active item already
    /// exists, in which case the enqueue is reported as skipped.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn enqueue(
        &self,
        article_id: i64,
        priority: Priority,
        max_retries: i64,
    ) -> Result<EnqueueOutcome, sqlx::Error> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO processing_queue (article_id, priority, status, max_retries, created_at, updated_at)
            VALUES (?1, ?2, 'PENDING', ?3, ?4, ?4)
            ON CONFLICT (article_id) WHERE status IN ('PENDING', 'PROCESSING') DO NOTHING
            "#,
        )
        .bind(article_id)
        .bind(priority.as_str())
        .bind(max_retries)
        .bind(now)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            debug!(target: TARGET_DB, "Article {} already has an active queue item, skipping", article_id);
            Ok(EnqueueOutcome::Skipped)
        } else {
            debug!(target: TARGET_DB, "Article {} enqueued with priority {}", article_id, priority.as_str());
            Ok(EnqueueOutcome::Added)
        }
    }

    /// Enqueues a set of articles with per-item isolation: one failing
    /// insert never aborts the rest.
    #[instrument(target = "db_query", level = "info", skip(self, article_ids))]
    pub async fn bulk_enqueue(
        &self,
        article_ids: &[i64],
        priority: Priority,
        max_retries: i64,
    ) -> Result<BulkEnqueueResult, sqlx::Error> {
        let mut result = BulkEnqueueResult::default();
        for &article_id in article_ids {
            match self.enqueue(article_id, priority, max_retries).await {
                Ok(EnqueueOutcome::Added) => result.added += 1,
                Ok(EnqueueOutcome::Skipped) => result.skipped += 1,
                Err(e) => {
                    warn!(target: TARGET_DB, "Failed to enqueue article {}: {:?}", article_id, e);
                    result.errors.push((article_id, e.to_string()));
                }
            }
        }
        info!(
            target: TARGET_DB,
            "Bulk enqueue: {} added, {} skipped, {} errors",
            result.added, result.skipped, result.errors.len()
        );
        Ok(result)
    }

    /// Atomically claims up to `limit` PENDING items, HIGH before MEDIUM
    /// before LOW, oldest first within a priority. The claim is a single
    /// conditional update, so concurrent callers never double-assign an
    /// item.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueItem>, sqlx::Error> {
        let now = Utc::now().timestamp();
        let rows = sqlx::query(&format!(
            r#"
            UPDATE processing_queue
            SET status = 'PROCESSING', updated_at = ?1
            WHERE status = 'PENDING'
              AND id IN (
                  SELECT id FROM processing_queue
                  WHERE status = 'PENDING'
                  ORDER BY CASE priority WHEN 'HIGH' THEN 0 WHEN 'MEDIUM' THEN 1 ELSE 2 END,
                           created_at ASC, id ASC
                  LIMIT ?2
              )
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(row_to_item(row)?);
        }
        // RETURNING does not promise the subquery's ordering.
        items.sort_by_key(|item| (priority_rank(item.priority), item.created_at, item.id));

        debug!(target: TARGET_DB, "Claimed {} of up to {} items", items.len(), limit);
        Ok(items)
    }

    /// PROCESSING -> COMPLETED; stamps processed_at, clears the last error,
    /// records how long classification took.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn complete_item(&self, id: i64, duration_ms: i64) -> Result<bool, sqlx::Error> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE processing_queue
            SET status = 'COMPLETED', error = NULL, duration_ms = ?1,
                processed_at = ?2, updated_at = ?2
            WHERE id = ?3 AND status = 'PROCESSING'
            "#,
        )
        .bind(duration_ms)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Consumes a retry credit: back to PENDING while credits remain,
    /// terminally FAILED once exhausted. A no-op on items that are not
    /// PROCESSING (a failure report against a terminal item is rejected).
    #[instrument(target = "db_query", level = "info", skip(self, error))]
    pub async fn fail_item(&self, id: i64, error: &str) -> Result<bool, sqlx::Error> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE processing_queue
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 < max_retries THEN 'PENDING' ELSE 'FAILED' END,
                error = ?1,
                updated_at = ?2
            WHERE id = ?3 AND status = 'PROCESSING'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            warn!(target: TARGET_DB, "Failure reported for item {} not in PROCESSING, ignored", id);
            return Ok(false);
        }
        debug!(target: TARGET_DB, "Item {} failed: {}", id, error);
        Ok(true)
    }

    /// Re-queues FAILED items that still have retry credits; terminally
    /// failed items are left inspectable and only counted.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn retry_failed(&self) -> Result<RetryOutcome, sqlx::Error> {
        let now = Utc::now().timestamp();
        let exhausted: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processing_queue WHERE status = 'FAILED' AND retry_count >= max_retries",
        )
        .fetch_one(self.pool())
        .await?;

        let requeued = sqlx::query(
            r#"
            UPDATE processing_queue
            SET status = 'PENDING', error = NULL, updated_at = ?1
            WHERE status = 'FAILED' AND retry_count < max_retries
            "#,
        )
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();

        info!(target: TARGET_DB, "Retry sweep: {} requeued, {} exhausted", requeued, exhausted);
        Ok(RetryOutcome {
            requeued,
            exhausted: exhausted as u64,
        })
    }

    /// Returns PROCESSING items untouched for longer than `older_than_secs`
    /// to PENDING. Covers executions that crashed mid-batch and never
    /// reported completion or failure.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn requeue_stuck(&self, older_than_secs: i64) -> Result<u64, sqlx::Error> {
        let now = Utc::now().timestamp();
        let requeued = sqlx::query(
            r#"
            UPDATE processing_queue
            SET status = 'PENDING', updated_at = ?1
            WHERE status = 'PROCESSING' AND updated_at < ?2
            "#,
        )
        .bind(now)
        .bind(now - older_than_secs)
        .execute(self.pool())
        .await?
        .rows_affected();

        if requeued > 0 {
            warn!(target: TARGET_DB, "Requeued {} stuck PROCESSING items", requeued);
        }
        Ok(requeued)
    }

    pub async fn pending_count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM processing_queue WHERE status = 'PENDING'")
            .fetch_one(self.pool())
            .await
    }

    /// Counts by status plus success rate and rolling average processing
    /// time. The four counts always sum to the table's row count.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn queue_metrics(&self) -> Result<QueueMetrics, sqlx::Error> {
        let rows = sqlx::query("SELECT status, COUNT(*) as count FROM processing_queue GROUP BY status")
            .fetch_all(self.pool())
            .await?;

        let mut metrics = QueueMetrics::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Pending) => metrics.pending = count,
                Some(QueueStatus::Processing) => metrics.processing = count,
                Some(QueueStatus::Completed) => metrics.completed = count,
                Some(QueueStatus::Failed) => metrics.failed = count,
                None => warn!(target: TARGET_DB, "Unknown queue status in metrics: {}", status),
            }
        }

        let finished = metrics.completed + metrics.failed;
        metrics.success_rate = if finished > 0 {
            metrics.completed as f64 / finished as f64
        } else {
            0.0
        };

        let average: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(duration_ms) FROM processing_queue WHERE status = 'COMPLETED' AND duration_ms IS NOT NULL",
        )
        .fetch_one(self.pool())
        .await?;
        metrics.average_processing_ms = average.unwrap_or(0.0);

        Ok(metrics)
    }

    /// Inspection listing, newest first, optionally filtered by status.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn queue_items(
        &self,
        status: Option<QueueStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, sqlx::Error> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {ITEM_COLUMNS} FROM processing_queue WHERE status = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
                ))
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {ITEM_COLUMNS} FROM processing_queue \
                     ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
        };

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(row_to_item(row)?);
        }
        Ok(items)
    }

    pub async fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM processing_queue WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_item).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;

    async fn test_db_with_articles(count: usize) -> (Database, Vec<i64>) {
        let db = Database::new_in_memory().await.expect("in-memory db");
        let mut ids = Vec::with_capacity(count);
        for n in 0..count {
            let id = db
                .insert_article(
                    &format!("Article {}", n),
                    "AI hiring tool shows bias against applicants.",
                    Some("unit-test"),
                    None,
                )
                .await
                .expect("insert article");
            ids.push(id);
        }
        (db, ids)
    }

    #[tokio::test]
    async fn test_enqueue_skips_active_duplicate() {
        let (db, ids) = test_db_with_articles(1).await;

        assert_eq!(
            db.enqueue(ids[0], Priority::Medium, 3).await.unwrap(),
            EnqueueOutcome::Added
        );
        // Second enqueue while PENDING is a reported skip.
        assert_eq!(
            db.enqueue(ids[0], Priority::High, 3).await.unwrap(),
            EnqueueOutcome::Skipped
        );

        // Still skipped while PROCESSING.
        let claimed = db.claim_batch(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(
            db.enqueue(ids[0], Priority::High, 3).await.unwrap(),
            EnqueueOutcome::Skipped
        );

        // A terminal item no longer blocks re-enqueueing.
        assert!(db.complete_item(claimed[0].id, 42).await.unwrap());
        assert_eq!(
            db.enqueue(ids[0], Priority::High, 3).await.unwrap(),
            EnqueueOutcome::Added
        );
    }

    #[tokio::test]
    async fn test_claim_order_follows_priority_then_age() {
        let (db, ids) = test_db_with_articles(4).await;
        let priorities = [
            Priority::Low,
            Priority::High,
            Priority::Medium,
            Priority::High,
        ];
        for (article_id, priority) in ids.iter().zip(priorities) {
            db.enqueue(*article_id, priority, 3).await.unwrap();
        }

        let claimed = db.claim_batch(4).await.unwrap();
        let order: Vec<i64> = claimed.iter().map(|item| item.article_id).collect();
        // HIGH (older), HIGH (newer), MEDIUM, LOW.
        assert_eq!(order, vec![ids[1], ids[3], ids[2], ids[0]]);
        assert!(claimed
            .iter()
            .all(|item| item.status == QueueStatus::Processing));
    }

    #[tokio::test]
    async fn test_no_double_claim_under_concurrency() {
        let (db, ids) = test_db_with_articles(6).await;
        for article_id in &ids {
            db.enqueue(*article_id, Priority::Medium, 3).await.unwrap();
        }

        let claims = futures::future::join_all((0..4).map(|_| {
            let db = db.clone();
            async move { db.claim_batch(3).await.unwrap() }
        }))
        .await;

        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for batch in claims {
            for item in batch {
                assert!(seen.insert(item.id), "item {} claimed twice", item.id);
                total += 1;
            }
        }
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let (db, ids) = test_db_with_articles(1).await;
        db.enqueue(ids[0], Priority::Medium, 3).await.unwrap();

        // Three failed attempts burn all credits.
        for attempt in 0..3 {
            let claimed = db.claim_batch(1).await.unwrap();
            assert_eq!(claimed.len(), 1, "claim on attempt {}", attempt);
            assert!(db.fail_item(claimed[0].id, "provider exploded").await.unwrap());
        }

        let item = db.queue_items(None, 10, 0).await.unwrap().remove(0);
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.error.as_deref(), Some("provider exploded"));

        // Nothing left to claim, and a fourth failure report is rejected.
        assert!(db.claim_batch(1).await.unwrap().is_empty());
        assert!(!db.fail_item(item.id, "again").await.unwrap());

        // The terminal item is reported, not requeued.
        let outcome = db.retry_failed().await.unwrap();
        assert_eq!(outcome.requeued, 0);
        assert_eq!(outcome.exhausted, 1);
    }

    #[tokio::test]
    async fn test_complete_clears_error_and_stamps() {
        let (db, ids) = test_db_with_articles(1).await;
        db.enqueue(ids[0], Priority::High, 3).await.unwrap();

        let claimed = db.claim_batch(1).await.unwrap();
        db.fail_item(claimed[0].id, "flaky").await.unwrap();
        let reclaimed = db.claim_batch(1).await.unwrap();
        assert_eq!(reclaimed[0].error.as_deref(), Some("flaky"));

        assert!(db.complete_item(reclaimed[0].id, 1234).await.unwrap());
        let item = db.get_queue_item(reclaimed[0].id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert!(item.error.is_none());
        assert!(item.processed_at.is_some());
        assert_eq!(item.duration_ms, Some(1234));
    }

    #[tokio::test]
    async fn test_metrics_counts_sum_to_total() {
        let (db, ids) = test_db_with_articles(5).await;
        for article_id in &ids {
            db.enqueue(*article_id, Priority::Medium, 1).await.unwrap();
        }

        let claimed = db.claim_batch(3).await.unwrap();
        db.complete_item(claimed[0].id, 100).await.unwrap();
        db.complete_item(claimed[1].id, 300).await.unwrap();
        // max_retries = 1: a single failure is terminal.
        db.fail_item(claimed[2].id, "bad article").await.unwrap();

        let claimed = db.claim_batch(1).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let metrics = db.queue_metrics().await.unwrap();
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.processing, 1);
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(
            metrics.pending + metrics.processing + metrics.completed + metrics.failed,
            5
        );
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.average_processing_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_bulk_enqueue_isolates_items() {
        let (db, ids) = test_db_with_articles(3).await;
        db.enqueue(ids[1], Priority::Low, 3).await.unwrap();

        let result = db
            .bulk_enqueue(&[ids[0], ids[1], ids[2]], Priority::Medium, 3)
            .await
            .unwrap();
        assert_eq!(result.added, 2);
        assert_eq!(result.skipped, 1);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_stuck_only_touches_old_processing() {
        let (db, ids) = test_db_with_articles(2).await;
        db.enqueue(ids[0], Priority::Medium, 3).await.unwrap();
        db.enqueue(ids[1], Priority::Medium, 3).await.unwrap();
        let claimed = db.claim_batch(2).await.unwrap();

        // Backdate one claim beyond the threshold.
        sqlx::query("UPDATE processing_queue SET updated_at = updated_at - 7200 WHERE id = ?1")
            .bind(claimed[0].id)
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(db.requeue_stuck(3600).await.unwrap(), 1);
        let stuck = db.get_queue_item(claimed[0].id).await.unwrap().unwrap();
        let fresh = db.get_queue_item(claimed[1].id).await.unwrap().unwrap();
        assert_eq!(stuck.status, QueueStatus::Pending);
        assert_eq!(fresh.status, QueueStatus::Processing);
    }
}
