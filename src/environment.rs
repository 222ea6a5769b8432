use std::env;

/// Runtime knobs for the queue and workers. Every value has a documented
/// default and a hard upper cap so a single invocation's worst-case cost
/// stays bounded no matter what the environment requests.
#[derive(Clone, Debug)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub max_batches: u32,
    pub max_execution_time_secs: u64,
    pub item_delay_ms: u64,
    pub batch_delay_ms: u64,
    pub provider_timeout_secs: u64,
    pub max_retries: i64,
    pub stuck_after_secs: i64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            batch_size: 5,
            max_batches: 20,
            max_execution_time_secs: 240,
            item_delay_ms: 1000,
            batch_delay_ms: 2000,
            provider_timeout_secs: 30,
            max_retries: 3,
            stuck_after_secs: 600,
        }
    }
}

impl ProcessingConfig {
    pub fn from_env() -> Self {
        let defaults = ProcessingConfig::default();
        ProcessingConfig {
            batch_size: get_env_capped("BATCH_SIZE", defaults.batch_size as u64, 50) as usize,
            max_batches: get_env_capped("MAX_BATCHES", defaults.max_batches as u64, 100) as u32,
            max_execution_time_secs: get_env_capped(
                "MAX_EXECUTION_TIME_SECS",
                defaults.max_execution_time_secs,
                600,
            ),
            item_delay_ms: get_env_capped("ITEM_DELAY_MS", defaults.item_delay_ms, 10_000),
            batch_delay_ms: get_env_capped("BATCH_DELAY_MS", defaults.batch_delay_ms, 30_000),
            provider_timeout_secs: get_env_capped(
                "PROVIDER_TIMEOUT_SECS",
                defaults.provider_timeout_secs,
                120,
            ),
            max_retries: get_env_capped("MAX_RETRIES", defaults.max_retries as u64, 10) as i64,
            stuck_after_secs: get_env_capped(
                "STUCK_AFTER_SECS",
                defaults.stuck_after_secs as u64,
                86_400,
            ) as i64,
        }
    }

    /// Clamp a caller-requested batch size to the configured limit.
    pub fn clamp_batch_size(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.batch_size).clamp(1, 50)
    }
}

/// Retrieves a numeric environment variable, falling back to `default` when
/// unset or unparseable, and clamping to `cap`.
pub fn get_env_capped(var: &str, default: u64, cap: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
        .min(cap)
}

pub fn get_env_or(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessingConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.max_batches, 20);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_env_capped() {
        std::env::set_var("BIASWATCH_TEST_KNOB", "9000");
        assert_eq!(get_env_capped("BIASWATCH_TEST_KNOB", 5, 50), 50);
        std::env::set_var("BIASWATCH_TEST_KNOB", "17");
        assert_eq!(get_env_capped("BIASWATCH_TEST_KNOB", 5, 50), 17);
        std::env::set_var("BIASWATCH_TEST_KNOB", "not-a-number");
        assert_eq!(get_env_capped("BIASWATCH_TEST_KNOB", 5, 50), 5);
        std::env::remove_var("BIASWATCH_TEST_KNOB");
        assert_eq!(get_env_capped("BIASWATCH_TEST_KNOB", 5, 50), 5);
    }

    #[test]
    fn test_clamp_batch_size() {
        let config = ProcessingConfig::default();
        assert_eq!(config.clamp_batch_size(None), 5);
        assert_eq!(config.clamp_batch_size(Some(10)), 10);
        assert_eq!(config.clamp_batch_size(Some(500)), 50);
        assert_eq!(config.clamp_batch_size(Some(0)), 1);
    }
}
