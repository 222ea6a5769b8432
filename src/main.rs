use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use biaswatch::classifier::Classifier;
use biaswatch::db::Database;
use biaswatch::environment::{get_env_or, ProcessingConfig};
use biaswatch::logging::configure_logging;
use biaswatch::providers::{ProviderConfig, ProviderRegistry};
use biaswatch::workers::{AutoProcessor, BatchWorker};
use biaswatch::{Priority, QueueStatus, TARGET_WORKER};

#[derive(Parser)]
#[command(name = "biaswatch", about = "AI discrimination news classification queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue unclassified articles, or specific article ids, for processing.
    Enqueue {
        /// Specific article ids; when empty, unprocessed articles are queued.
        article_ids: Vec<i64>,
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Cap on unprocessed articles picked up when no ids are given.
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Claim and classify a single batch.
    Process {
        #[arg(long)]
        size: Option<usize>,
    },
    /// Drain the queue batch by batch until a session budget trips.
    Auto,
    /// Return retryable FAILED items to the queue.
    RetryFailed,
    /// Return PROCESSING items abandoned by a crashed run to the queue.
    Sweep {
        #[arg(long)]
        older_than_secs: Option<i64>,
    },
    /// Show queue counts, success rate, and average processing time.
    Metrics,
    /// List queue items, newest first.
    Items {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Manage classification providers.
    #[command(subcommand)]
    Providers(ProvidersCommand),
}

#[derive(Subcommand)]
enum ProvidersCommand {
    List,
    /// Register a provider from a tagged JSON config, e.g.
    /// {"type":"ollama","host":"http://localhost","port":11434,...}
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 10)]
        priority: i64,
        #[arg(long)]
        config: String,
    },
    Remove {
        id: String,
    },
    Health {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_logging();

    let config = ProcessingConfig::from_env();
    let database_path = get_env_or("DATABASE_PATH", "biaswatch.db");
    let db = Database::new(&database_path)
        .await
        .context("failed to open database")?;
    let registry = Arc::new(ProviderRegistry::new(db.clone()));

    match cli.command {
        Command::Enqueue {
            article_ids,
            priority,
            limit,
        } => {
            let priority = Priority::parse(&priority)
                .ok_or_else(|| anyhow!("unknown priority '{}'", priority))?;
            let ids = if article_ids.is_empty() {
                db.unprocessed_article_ids(limit).await?
            } else {
                article_ids
            };
            let result = db.bulk_enqueue(&ids, priority, config.max_retries).await?;
            println!(
                "Enqueued {} article(s), skipped {} with active items, {} error(s)",
                result.added,
                result.skipped,
                result.errors.len()
            );
            for (article_id, error) in &result.errors {
                println!("  article {}: {}", article_id, error);
            }
        }
        Command::Process { size } => {
            let worker = BatchWorker::new(db.clone(), Classifier::new(registry), config);
            let outcome = worker.process_batch(size).await?;
            println!(
                "Processed {} item(s): {} ok, {} failed in {}ms",
                outcome.processed, outcome.successful, outcome.failed, outcome.processing_ms
            );
            for error in &outcome.errors {
                println!("  {}", error);
            }
        }
        Command::Auto => {
            let worker = BatchWorker::new(db.clone(), Classifier::new(registry), config.clone());
            let processor = AutoProcessor::new(db.clone(), worker, config);
            let outcome = processor.run(None).await?;
            info!(target: TARGET_WORKER, "Session {} stopped: {}", outcome.session_id, outcome.stop_reason);
            println!(
                "Session {}: {} after {} batch(es), {} item(s), {}ms",
                outcome.session_id,
                outcome.stop_reason,
                outcome.batch_count,
                outcome.total_processed,
                outcome.elapsed_ms
            );
        }
        Command::RetryFailed => {
            let outcome = db.retry_failed().await?;
            println!(
                "Requeued {} item(s); {} exhausted their retries",
                outcome.requeued, outcome.exhausted
            );
        }
        Command::Sweep { older_than_secs } => {
            let threshold = older_than_secs.unwrap_or(config.stuck_after_secs);
            let requeued = db.requeue_stuck(threshold).await?;
            println!("Requeued {} stuck item(s)", requeued);
        }
        Command::Metrics => {
            let metrics = db.queue_metrics().await?;
            println!("pending:     {}", metrics.pending);
            println!("processing:  {}", metrics.processing);
            println!("completed:   {}", metrics.completed);
            println!("failed:      {}", metrics.failed);
            println!("success:     {:.1}%", metrics.success_rate * 100.0);
            println!("avg time:    {:.0}ms", metrics.average_processing_ms);
        }
        Command::Items {
            status,
            limit,
            offset,
        } => {
            let status = status
                .map(|value| {
                    QueueStatus::parse(&value).ok_or_else(|| anyhow!("unknown status '{}'", value))
                })
                .transpose()?;
            let items = db.queue_items(status, limit, offset).await?;
            for item in items {
                println!(
                    "#{} article {} {} {} retries {}/{}{}",
                    item.id,
                    item.article_id,
                    item.priority.as_str(),
                    item.status.as_str(),
                    item.retry_count,
                    item.max_retries,
                    item.error
                        .as_deref()
                        .map(|e| format!(" error: {}", e))
                        .unwrap_or_default()
                );
            }
        }
        Command::Providers(command) => run_providers(command, &registry).await?,
    }

    Ok(())
}

async fn run_providers(command: ProvidersCommand, registry: &ProviderRegistry) -> Result<()> {
    match command {
        ProvidersCommand::List => {
            for provider in registry.list_providers().await? {
                println!(
                    "{} '{}' {} priority {} {} ({} requests, {:.1}% errors)",
                    provider.id,
                    provider.name,
                    provider.config.kind(),
                    provider.priority,
                    if provider.enabled { "enabled" } else { "disabled" },
                    provider.request_count,
                    provider.error_rate() * 100.0
                );
            }
        }
        ProvidersCommand::Add {
            name,
            priority,
            config,
        } => {
            let config: ProviderConfig =
                serde_json::from_str(&config).context("invalid provider config JSON")?;
            let provider = registry.create_provider(&name, config, priority).await?;
            println!("Created provider {} '{}'", provider.id, provider.name);
        }
        ProvidersCommand::Remove { id } => {
            if registry.delete_provider(&id).await? {
                println!("Deleted provider {}", id);
            } else {
                println!("No provider with id {}", id);
            }
        }
        ProvidersCommand::Health { id } => {
            let health = registry.check_health(&id).await?;
            println!(
                "{} ({}ms, {:.1}% errors){}",
                health.status.as_str(),
                health.response_time_ms,
                health.error_rate * 100.0,
                health
                    .error
                    .as_deref()
                    .map(|e| format!(" - {}", e))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}
