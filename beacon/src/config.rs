use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use envconfig::Envconfig;

use crate::checksum::DEFAULT_CHECKSUM_PARAM;
use crate::sinks::pool::PoolSettings;
use crate::sinks::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    /// Directory for the JSON lines file sink, disabled when unset.
    pub file_sink_dir: Option<String>,

    #[envconfig(default = "67108864")]
    pub file_sink_roll_bytes: u64,

    #[envconfig(default = "false")]
    pub kafka_enabled: bool,

    #[envconfig(nested = true)]
    pub mapping: MappingConfig,

    #[envconfig(nested = true)]
    pub pool: PoolConfig,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct MappingConfig {
    /// 1 for JSON mapping rules, 2 for a mapping script, unset for the
    /// builtin mapping.
    pub mapping_version: Option<u32>,
    pub mapping_schema_path: Option<String>,
    pub mapping_rules_path: Option<String>,

    #[envconfig(default = "false")]
    pub discard_corrupted: bool,

    #[envconfig(default = "false")]
    pub discard_duplicates: bool,

    #[envconfig(default = "1000000")]
    pub duplicate_memory_size: NonZeroUsize,

    #[envconfig(default = "1000")]
    pub user_agent_cache_size: u64,

    #[envconfig(default = "x")]
    pub checksum_param: String,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            mapping_version: None,
            mapping_schema_path: None,
            mapping_rules_path: None,
            discard_corrupted: false,
            discard_duplicates: false,
            duplicate_memory_size: NonZeroUsize::new(1_000_000).unwrap_or(NonZeroUsize::MIN),
            user_agent_cache_size: 1000,
            checksum_param: DEFAULT_CHECKSUM_PARAM.to_string(),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct PoolConfig {
    #[envconfig(from = "SINK_WORKERS", default = "2")]
    pub workers: usize,
    #[envconfig(from = "SINK_QUEUE_SIZE", default = "1000")]
    pub queue_size: usize,
    #[envconfig(from = "SINK_MAX_BATCH_SIZE", default = "100")]
    pub max_batch_size: usize,
    #[envconfig(from = "SINK_FLUSH_INTERVAL_MS", default = "1000")]
    pub flush_interval_ms: u64,
    /// Attempts per batch before its records are reported as failed,
    /// retried forever when unset.
    #[envconfig(from = "SINK_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,
    #[envconfig(from = "SINK_RETRY_INITIAL_MS", default = "100")]
    pub retry_initial_ms: u64,
    #[envconfig(from = "SINK_RETRY_MAX_MS", default = "10000")]
    pub retry_max_ms: u64,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            workers: config.workers,
            queue_size: config.queue_size,
            max_batch_size: config.max_batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            retry: RetryPolicy::new(
                2,
                Duration::from_millis(config.retry_initial_ms),
                Some(Duration::from_millis(config.retry_max_ms)),
                config.max_attempts,
            ),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "beacon_events")]
    pub kafka_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_from_empty_environment() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.address, "127.0.0.1:3000".parse().unwrap());
        assert!(!config.kafka_enabled);
        assert_eq!(config.mapping.mapping_version, None);
        assert!(!config.mapping.discard_corrupted);
        assert_eq!(config.mapping.duplicate_memory_size.get(), 1_000_000);
        assert_eq!(config.mapping.checksum_param, "x");
        assert_eq!(config.pool.max_attempts, None);
    }

    #[test]
    fn pool_settings_from_environment() {
        let env: HashMap<String, String> = [
            ("SINK_WORKERS", "8"),
            ("SINK_FLUSH_INTERVAL_MS", "250"),
            ("SINK_MAX_ATTEMPTS", "3"),
            ("MAPPING_VERSION", "2"),
            ("DISCARD_DUPLICATES", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = Config::init_from_hashmap(&env).unwrap();

        let settings = PoolSettings::from(&config.pool);
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.flush_interval, Duration::from_millis(250));
        assert!(settings.retry.should_retry(2));
        assert!(!settings.retry.should_retry(3));
        assert_eq!(config.mapping.mapping_version, Some(2));
        assert!(config.mapping.discard_duplicates);
    }

    #[test]
    fn zero_duplicate_memory_is_rejected() {
        let env: HashMap<String, String> =
            [("DUPLICATE_MEMORY_SIZE".to_string(), "0".to_string())].into();
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
