use anyhow::Result;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use super::batch::{BatchOutcome, BatchWorker};
use crate::db::Database;
use crate::environment::ProcessingConfig;
use crate::TARGET_WORKER;

/// Accumulated state of one processing chain. A session can be resumed
/// by a later run, carrying its counters and budgets forward so the
/// combined work stays bounded.
#[derive(Clone, Debug)]
pub struct ProcessingSession {
    pub session_id: String,
    pub started_at: Instant,
    pub batch_count: u32,
    pub total_processed: usize,
    pub max_batches: u32,
    pub max_execution_time: Duration,
}

impl ProcessingSession {
    pub fn new(config: &ProcessingConfig) -> Self {
        ProcessingSession {
            session_id: Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            batch_count: 0,
            total_processed: 0,
            max_batches: config.max_batches,
            max_execution_time: Duration::from_secs(config.max_execution_time_secs),
        }
    }
}

/// Why a chain ended. Every variant is a completion, not an error; the
/// queue is left consistent in all cases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// No PENDING work remained.
    CompletedEmpty,
    /// The session's batch budget was spent.
    CompletedMaxBatches,
    /// The session's wall-clock budget was spent.
    CompletedMaxTime,
    /// A batch ran but claimed nothing, so looping again would spin.
    CompletedNoProgress,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::CompletedEmpty => "COMPLETED_EMPTY",
            StopReason::CompletedMaxBatches => "COMPLETED_MAX_BATCHES",
            StopReason::CompletedMaxTime => "COMPLETED_MAX_TIME",
            StopReason::CompletedNoProgress => "COMPLETED_NO_PROGRESS",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ChainOutcome {
    pub session_id: String,
    pub stop_reason: StopReason,
    /// Iterations the session entered, including the one that tripped a
    /// guard. A fresh run against an empty queue therefore reports 1.
    pub batch_count: u32,
    pub total_processed: usize,
    pub elapsed_ms: u64,
}

/// Session guards, evaluated at the top of each iteration after
/// `batch_count` has been incremented, in fixed order: batch budget,
/// then time budget, then remaining work.
fn preflight(session: &ProcessingSession, pending: i64) -> Option<StopReason> {
    if session.batch_count > session.max_batches {
        Some(StopReason::CompletedMaxBatches)
    } else if session.started_at.elapsed() >= session.max_execution_time {
        Some(StopReason::CompletedMaxTime)
    } else if pending == 0 {
        Some(StopReason::CompletedEmpty)
    } else {
        None
    }
}

/// Decision after a batch has run. A batch that claimed nothing while
/// preflight saw pending work means a rival session owns the remaining
/// items; looping again would spin on their claims.
fn postflight(outcome: &BatchOutcome) -> Option<StopReason> {
    if outcome.processed == 0 {
        Some(StopReason::CompletedNoProgress)
    } else {
        None
    }
}

/// Runs batches back to back until a session guard trips. This is the
/// drain loop for the whole queue; a single bounded batch is
/// [`BatchWorker::process_batch`].
pub struct AutoProcessor {
    db: Database,
    worker: BatchWorker,
    config: ProcessingConfig,
}

impl AutoProcessor {
    pub fn new(db: Database, worker: BatchWorker, config: ProcessingConfig) -> Self {
        AutoProcessor { db, worker, config }
    }

    /// Drive a chain to one of the [`StopReason`] completions. Passing a
    /// session resumes it; otherwise a fresh one is started.
    pub async fn run(&self, session: Option<ProcessingSession>) -> Result<ChainOutcome> {
        let mut session = match session {
            Some(session) => {
                info!(
                    target: TARGET_WORKER,
                    "Resuming session {} at batch {} ({} processed so far)",
                    session.session_id,
                    session.batch_count,
                    session.total_processed
                );
                session
            }
            None => {
                let session = ProcessingSession::new(&self.config);
                info!(target: TARGET_WORKER, "Starting session {}", session.session_id);
                session
            }
        };

        // Reclaim work abandoned by a crashed run before draining.
        match self.db.requeue_stuck(self.config.stuck_after_secs).await {
            Ok(0) => {}
            Ok(n) => info!(target: TARGET_WORKER, "Recovered {} stuck item(s) before draining", n),
            Err(e) => warn!(target: TARGET_WORKER, "Stuck-item sweep failed: {}", e),
        }

        let stop_reason = loop {
            session.batch_count += 1;
            let pending = self.db.pending_count().await?;
            if let Some(reason) = preflight(&session, pending) {
                break reason;
            }

            let outcome = self.worker.process_batch(None).await?;
            session.total_processed += outcome.processed;
            info!(
                target: TARGET_WORKER,
                "Session {} batch {}/{}: {} processed ({} total)",
                session.session_id,
                session.batch_count,
                session.max_batches,
                outcome.processed,
                session.total_processed
            );

            if let Some(reason) = postflight(&outcome) {
                break reason;
            }

            if self.config.batch_delay_ms > 0 {
                sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
        };

        let elapsed_ms = session.started_at.elapsed().as_millis() as u64;
        info!(
            target: TARGET_WORKER,
            "Session {} finished: {} after {} batch(es), {} item(s), {}ms",
            session.session_id,
            stop_reason,
            session.batch_count,
            session.total_processed,
            elapsed_ms
        );
        Ok(ChainOutcome {
            session_id: session.session_id,
            stop_reason,
            batch_count: session.batch_count,
            total_processed: session.total_processed,
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::providers::ProviderRegistry;
    use crate::{Priority, QueueStatus};
    use std::sync::Arc;

    fn test_config(batch_size: usize, max_batches: u32) -> ProcessingConfig {
        ProcessingConfig {
            batch_size,
            max_batches,
            item_delay_ms: 0,
            batch_delay_ms: 0,
            ..ProcessingConfig::default()
        }
    }

    async fn test_processor(config: ProcessingConfig) -> (AutoProcessor, Database) {
        let db = Database::new_in_memory().await.unwrap();
        let registry = Arc::new(ProviderRegistry::new(db.clone()));
        let worker = BatchWorker::new(db.clone(), Classifier::new(registry), config.clone());
        (AutoProcessor::new(db.clone(), worker, config), db)
    }

    async fn seed_queue(db: &Database, count: usize) {
        for n in 0..count {
            let id = db
                .insert_article(&format!("Article {}", n), "AI bias content.", None, None)
                .await
                .unwrap();
            db.enqueue(id, Priority::Medium, 3).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_drains_queue_and_stops_empty() {
        let (processor, db) = test_processor(test_config(2, 20)).await;
        seed_queue(&db, 3).await;

        let outcome = processor.run(None).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::CompletedEmpty);
        // Two working iterations plus the one that found the queue empty.
        assert_eq!(outcome.batch_count, 3);
        assert_eq!(outcome.total_processed, 3);

        let items = db.queue_items(None, 10, 0).await.unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.status == QueueStatus::Completed));
    }

    #[tokio::test]
    async fn test_stops_when_batch_budget_spent() {
        let (processor, db) = test_processor(test_config(1, 2)).await;
        seed_queue(&db, 4).await;

        let outcome = processor.run(None).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::CompletedMaxBatches);
        // Exactly two batches ran before the budget tripped.
        assert_eq!(outcome.total_processed, 2);
        assert_eq!(db.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resumed_session_carries_budget_forward() {
        let config = test_config(1, 3);
        let (processor, db) = test_processor(config.clone()).await;
        seed_queue(&db, 5).await;

        // A prior run already spent two of the three batches.
        let mut session = ProcessingSession::new(&config);
        session.batch_count = 2;
        session.total_processed = 2;

        let outcome = processor.run(Some(session)).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::CompletedMaxBatches);
        // Only one batch of budget remained, so one more item was done.
        assert_eq!(outcome.total_processed, 3);
        assert_eq!(db.pending_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_empty_queue_stops_before_any_batch() {
        let (processor, _db) = test_processor(test_config(5, 20)).await;
        let outcome = processor.run(None).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::CompletedEmpty);
        assert_eq!(outcome.batch_count, 1);
        assert_eq!(outcome.total_processed, 0);
    }

    #[tokio::test]
    async fn test_stuck_items_are_recovered_at_start() {
        let mut config = test_config(5, 20);
        config.stuck_after_secs = 3600;
        let (processor, db) = test_processor(config).await;
        seed_queue(&db, 1).await;

        // Simulate a crashed worker: claim, then backdate past the
        // stuck threshold.
        let claimed = db.claim_batch(1).await.unwrap();
        sqlx::query("UPDATE processing_queue SET updated_at = updated_at - 7200 WHERE id = ?1")
            .bind(claimed[0].id)
            .execute(db.pool())
            .await
            .unwrap();

        let outcome = processor.run(None).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::CompletedEmpty);
        assert_eq!(outcome.total_processed, 1);
        let item = db.get_queue_item(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
    }

    #[test]
    fn test_guard_order_is_batches_then_time_then_empty() {
        let config = test_config(5, 2);
        let mut session = ProcessingSession::new(&config);

        session.batch_count = 1;
        assert_eq!(preflight(&session, 10), None);
        assert_eq!(preflight(&session, 0), Some(StopReason::CompletedEmpty));

        // The budget trips strictly above the limit, never at it.
        session.batch_count = 2;
        assert_eq!(preflight(&session, 10), None);
        session.batch_count = 3;
        assert_eq!(preflight(&session, 10), Some(StopReason::CompletedMaxBatches));

        // Batch budget outranks the time budget.
        session.max_execution_time = Duration::ZERO;
        assert_eq!(preflight(&session, 10), Some(StopReason::CompletedMaxBatches));

        session.batch_count = 1;
        assert_eq!(preflight(&session, 10), Some(StopReason::CompletedMaxTime));
        assert_eq!(preflight(&session, 0), Some(StopReason::CompletedMaxTime));
    }

    #[tokio::test]
    async fn test_rival_claim_between_guard_and_batch_stops_chain() {
        let config = test_config(5, 20);
        let db = Database::new_in_memory().await.unwrap();
        let registry = Arc::new(ProviderRegistry::new(db.clone()));
        let worker = BatchWorker::new(db.clone(), Classifier::new(registry), config.clone());
        seed_queue(&db, 2).await;

        // Interleave the race by hand: the guard sees pending work, a
        // rival session then claims everything, and the batch runs dry.
        let mut session = ProcessingSession::new(&config);
        session.batch_count += 1;
        let pending = db.pending_count().await.unwrap();
        assert_eq!(pending, 2);
        assert_eq!(preflight(&session, pending), None);

        let rival = db.claim_batch(5).await.unwrap();
        assert_eq!(rival.len(), 2);

        let outcome = worker.process_batch(None).await.unwrap();
        assert_eq!(outcome.processed, 0);
        assert_eq!(postflight(&outcome), Some(StopReason::CompletedNoProgress));
    }

    #[test]
    fn test_batch_with_progress_continues() {
        let outcome = BatchOutcome {
            processed: 1,
            successful: 0,
            failed: 1,
            ..Default::default()
        };
        // Failures still count as progress; only an empty claim stops.
        assert_eq!(postflight(&outcome), None);
        assert_eq!(
            postflight(&BatchOutcome::default()),
            Some(StopReason::CompletedNoProgress)
        );
    }

    #[test]
    fn test_stop_reason_codes() {
        assert_eq!(StopReason::CompletedEmpty.to_string(), "COMPLETED_EMPTY");
        assert_eq!(
            StopReason::CompletedNoProgress.to_string(),
            "COMPLETED_NO_PROGRESS"
        );
    }
}
