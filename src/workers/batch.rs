use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::classifier::Classifier;
use crate::db::queue::QueueItem;
use crate::db::Database;
use crate::environment::ProcessingConfig;
use crate::TARGET_WORKER;

/// What a single batch accomplished. `processed` counts every claimed
/// item, success or failure.
#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub processing_ms: u64,
}

/// Claims one batch from the queue and runs each item through the
/// classifier sequentially. Per-item failures are recorded against the
/// item and never abort the rest of the batch; only queue-level storage
/// failures surface as errors.
pub struct BatchWorker {
    db: Database,
    classifier: Classifier,
    config: ProcessingConfig,
}

impl BatchWorker {
    pub fn new(db: Database, classifier: Classifier, config: ProcessingConfig) -> Self {
        BatchWorker {
            db,
            classifier,
            config,
        }
    }

    pub async fn process_batch(&self, requested_size: Option<usize>) -> Result<BatchOutcome> {
        let started = Instant::now();
        let size = self.config.clamp_batch_size(requested_size);
        let items = self
            .db
            .claim_batch(size)
            .await
            .context("failed to claim batch")?;

        let mut outcome = BatchOutcome::default();
        for (n, item) in items.iter().enumerate() {
            // Pace sequential provider calls; no delay before the first.
            if n > 0 && self.config.item_delay_ms > 0 {
                sleep(Duration::from_millis(self.config.item_delay_ms)).await;
            }

            outcome.processed += 1;
            match self.process_item(item).await {
                Ok(()) => outcome.successful += 1,
                Err(e) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!("item {}: {:#}", item.id, e));
                }
            }
        }

        outcome.processing_ms = started.elapsed().as_millis() as u64;
        if outcome.processed > 0 {
            info!(
                target: TARGET_WORKER,
                "Batch done: {} processed, {} ok, {} failed ({}ms)",
                outcome.processed,
                outcome.successful,
                outcome.failed,
                outcome.processing_ms
            );
        }
        Ok(outcome)
    }

    /// Classify one claimed item and persist the result. Any error path
    /// reports the failure on the queue item so its retry credits are
    /// consumed.
    async fn process_item(&self, item: &QueueItem) -> Result<()> {
        let started = Instant::now();

        let article = match self.db.get_article(item.article_id).await {
            Ok(Some(article)) => article,
            Ok(None) => {
                // Cascade deletes remove queue rows with their article,
                // so this covers claims that raced such a delete.
                let message = format!("article {} not found", item.article_id);
                self.report_failure(item, &message).await;
                return Err(anyhow::anyhow!(message));
            }
            Err(e) => {
                let message = format!("failed to load article {}: {}", item.article_id, e);
                self.report_failure(item, &message).await;
                return Err(anyhow::Error::new(e).context("failed to load article"));
            }
        };

        // Infallible: falls back to keyword classification internally.
        let result = self.classifier.classify(&article).await;

        if let Err(e) = self.db.apply_classification(article.id, &result).await {
            let message = format!("failed to store classification: {}", e);
            self.report_failure(item, &message).await;
            return Err(anyhow::Error::new(e).context("failed to store classification"));
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        if let Err(e) = self.db.complete_item(item.id, duration_ms).await {
            // The classification itself is stored; only the status write
            // failed. Try to burn a retry credit so the item is not left
            // PROCESSING; the stuck sweep recovers it if that write
            // fails too.
            if let Err(fail) = self
                .db
                .fail_item(item.id, "failed to record completion")
                .await
            {
                warn!(
                    target: TARGET_WORKER,
                    "Failed to record failure for item {}: {}", item.id, fail
                );
            }
            return Err(anyhow::Error::new(e).context("failed to mark item completed"));
        }
        Ok(())
    }

    async fn report_failure(&self, item: &QueueItem, message: &str) {
        if let Err(e) = self.db.fail_item(item.id, message).await {
            warn!(target: TARGET_WORKER, "Failed to record failure for item {}: {}", item.id, e);
        }
        if let Err(e) = self.db.record_processing_error(item.article_id, message).await {
            warn!(
                target: TARGET_WORKER,
                "Failed to record processing error for article {}: {}", item.article_id, e
            );
        }
    }
}
