use chrono::Utc;
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::core::Database;
use crate::providers::{ProviderConfig, ProviderPatch, ProviderRecord};
use crate::TARGET_DB;

fn row_to_provider(row: &sqlx::sqlite::SqliteRow) -> Result<ProviderRecord, sqlx::Error> {
    let config_json: String = row.get("config");
    let config: ProviderConfig = serde_json::from_str(&config_json)
        .map_err(|e| sqlx::Error::Protocol(format!("invalid provider config: {}", e)))?;

    Ok(ProviderRecord {
        id: row.get("id"),
        name: row.get("name"),
        config,
        enabled: row.get("enabled"),
        priority: row.get("priority"),
        request_count: row.get("request_count"),
        success_count: row.get("success_count"),
        error_count: row.get("error_count"),
        average_latency_ms: row.get("average_latency_ms"),
        estimated_cost: row.get("estimated_cost"),
        last_used: row.get("last_used"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const PROVIDER_COLUMNS: &str = "id, name, kind, config, enabled, priority, request_count, \
     success_count, error_count, average_latency_ms, estimated_cost, last_used, \
     created_at, updated_at";

impl Database {
    #[instrument(target = "db_query", level = "info", skip(self, config))]
    pub async fn insert_provider(
        &self,
        name: &str,
        config: &ProviderConfig,
        priority: i64,
    ) -> Result<ProviderRecord, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let config_json = serde_json::to_string(config)
            .map_err(|e| sqlx::Error::Protocol(format!("provider config not serializable: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO providers (id, name, kind, config, enabled, priority, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(config.kind())
        .bind(&config_json)
        .bind(priority)
        .bind(now)
        .execute(self.pool())
        .await?;

        info!(target: TARGET_DB, "Provider '{}' ({}) created with priority {}", name, config.kind(), priority);
        self.get_provider(&id)
            .await?
            .ok_or_else(|| sqlx::Error::RowNotFound)
    }

    pub async fn get_provider(&self, id: &str) -> Result<Option<ProviderRecord>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_provider).transpose()
    }

    /// All configured providers, ranked: priority ascending, then name so
    /// the ordering is deterministic for equal priorities.
    pub async fn list_providers(&self) -> Result<Vec<ProviderRecord>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY priority ASC, name ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_provider).collect()
    }

    pub async fn enabled_providers(&self) -> Result<Vec<ProviderRecord>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE enabled = 1 \
             ORDER BY priority ASC, name ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_provider).collect()
    }

    #[instrument(target = "db_query", level = "info", skip(self, patch))]
    pub async fn update_provider(
        &self,
        id: &str,
        patch: &ProviderPatch,
    ) -> Result<Option<ProviderRecord>, sqlx::Error> {
        let Some(existing) = self.get_provider(id).await? else {
            return Ok(None);
        };

        let name = patch.name.as_deref().unwrap_or(&existing.name);
        let enabled = patch.enabled.unwrap_or(existing.enabled);
        let priority = patch.priority.unwrap_or(existing.priority);
        let config = patch.config.as_ref().unwrap_or(&existing.config);
        let config_json = serde_json::to_string(config)
            .map_err(|e| sqlx::Error::Protocol(format!("provider config not serializable: {}", e)))?;
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE providers
            SET name = ?1, kind = ?2, config = ?3, enabled = ?4, priority = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(name)
        .bind(config.kind())
        .bind(&config_json)
        .bind(enabled)
        .bind(priority)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        debug!(target: TARGET_DB, "Provider {} updated", id);
        self.get_provider(id).await
    }

    pub async fn delete_provider(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM providers WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append-only usage feedback after every invocation attempt. The
    /// latency average is cumulative: all SET expressions read the
    /// pre-update row, so `request_count` is the old total.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn record_provider_usage(
        &self,
        id: &str,
        success: bool,
        latency_ms: i64,
        cost: f64,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE providers
            SET request_count = request_count + 1,
                success_count = success_count + CASE WHEN ?1 THEN 1 ELSE 0 END,
                error_count = error_count + CASE WHEN ?1 THEN 0 ELSE 1 END,
                average_latency_ms = CAST(
                    (COALESCE(average_latency_ms, 0) * request_count + ?2) / (request_count + 1)
                    AS INTEGER),
                estimated_cost = estimated_cost + ?3,
                last_used = ?4,
                updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(success)
        .bind(latency_ms)
        .bind(cost)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderConfig;

    fn ollama_config(model: &str) -> ProviderConfig {
        ProviderConfig::Ollama {
            host: "http://localhost".to_string(),
            port: 11434,
            model: model.to_string(),
            temperature: 0.0,
            timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_ranking_is_priority_then_name() {
        let db = Database::new_in_memory().await.unwrap();
        db.insert_provider("zeta", &ollama_config("a"), 1).await.unwrap();
        db.insert_provider("alpha", &ollama_config("b"), 1).await.unwrap();
        db.insert_provider("first", &ollama_config("c"), 0).await.unwrap();

        let names: Vec<String> = db
            .list_providers()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["first", "alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_usage_counters_and_cumulative_latency() {
        let db = Database::new_in_memory().await.unwrap();
        let provider = db.insert_provider("p", &ollama_config("m"), 5).await.unwrap();

        db.record_provider_usage(&provider.id, true, 100, 0.0).await.unwrap();
        db.record_provider_usage(&provider.id, true, 300, 0.0).await.unwrap();
        db.record_provider_usage(&provider.id, false, 500, 0.0).await.unwrap();

        let provider = db.get_provider(&provider.id).await.unwrap().unwrap();
        assert_eq!(provider.request_count, 3);
        assert_eq!(provider.success_count, 2);
        assert_eq!(provider.error_count, 1);
        // (100 -> 100, (100+300)/2 -> 200, (200*2+500)/3 -> 300)
        assert_eq!(provider.average_latency_ms, Some(300));
        assert!(provider.last_used.is_some());
        assert!((provider.error_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_patch_and_delete() {
        let db = Database::new_in_memory().await.unwrap();
        let provider = db.insert_provider("p", &ollama_config("m"), 5).await.unwrap();

        let patch = ProviderPatch {
            enabled: Some(false),
            priority: Some(1),
            ..Default::default()
        };
        let updated = db.update_provider(&provider.id, &patch).await.unwrap().unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.priority, 1);
        assert_eq!(updated.name, "p");

        assert!(db.enabled_providers().await.unwrap().is_empty());
        assert!(db.delete_provider(&provider.id).await.unwrap());
        assert!(!db.delete_provider(&provider.id).await.unwrap());
    }
}
