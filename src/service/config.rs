use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::log::{Block, StartPosition};
use crate::utils::ProgressInterval;

use super::{AppError, AppResult};

pub const ENV_PREFIX: &str = "STREAMCLAIM";
pub const DEFAULT_CONFIG_FILE: &str = "conf.toml";

/// Variables the first deployments were configured with, still honoured.
const LEGACY_ENV: [(&str, &str); 3] = [
    ("STREAM_NAME", "stream.key"),
    ("CUSTOMER_GROUPNAME", "stream.group"),
    ("REDIS_PASSWORD", "redis.password"),
];

/// Legacy variables holding a count.
const LEGACY_NUMERIC_ENV: [(&str, &str); 2] = [
    ("Publishing_message_num", "stream.message_count"),
    ("Max_retry", "retry.max_retry"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub key: String,
    pub group: String,
    /// `$` (new entries only), `0` (whole log) or an explicit entry id
    pub group_start: String,
    /// how many messages the publisher appends
    pub message_count: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            key: "mystream".to_string(),
            group: "mygroup".to_string(),
            group_start: "$".to_string(),
            message_count: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// empty means a random identity per process
    pub identity: String,
    pub read_count: usize,
    /// 0 blocks until entries arrive
    pub block_ms: u64,
    /// acknowledged entries to wait for, defaults to `stream.message_count`
    pub target_count: Option<u64>,
    /// drain this identity's own pending entries before reading new ones
    pub replay_own_pending: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            identity: "consumer-1".to_string(),
            read_count: 1,
            block_ms: 0,
            target_count: None,
            replay_own_pending: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimerConfig {
    pub identity: String,
    /// Minimum idle time before a pending entry may be claimed.
    ///
    /// Must stay well above the worst-case time the group consumer needs for
    /// one entry, otherwise the reclaimer steals entries that are slow rather
    /// than abandoned and they get processed twice.
    pub idle_threshold_ms: u64,
    pub batch_size: usize,
    /// sleep after a full scan that claimed nothing
    pub idle_pause_ms: u64,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            identity: "reclaimer-1".to_string(),
            idle_threshold_ms: 300_000,
            batch_size: 100,
            idle_pause_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// attempts per logical operation, including the first one
    pub max_retry: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retry: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// one node connects standalone, several connect as a cluster
    pub nodes: Vec<String>,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            nodes: (7000..=7005).map(|port| format!(":{}", port)).collect(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_dir: String,
    pub otlp_enabled: bool,
    pub stdout_metrics: bool,
    /// every n-th appended and acknowledged entry is logged at INFO, the
    /// rest at DEBUG; 0 keeps them all at DEBUG
    pub progress_interval: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            otlp_enabled: false,
            stdout_metrics: false,
            progress_interval: 1000,
        }
    }
}

impl TelemetryConfig {
    pub fn progress(&self) -> ProgressInterval {
        ProgressInterval::new(self.progress_interval)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    pub stream: StreamConfig,
    pub consumer: ConsumerConfig,
    pub reclaimer: ReclaimerConfig,
    pub retry: RetryConfig,
    pub redis: RedisConfig,
    pub telemetry: TelemetryConfig,
}

impl ConsumerConfig {
    pub fn block(&self) -> Block {
        Block::from_millis(self.block_ms)
    }
}

impl ReclaimerConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn idle_pause(&self) -> Duration {
        Duration::from_millis(self.idle_pause_ms)
    }
}

impl StreamConfig {
    pub fn start_position(&self) -> AppResult<StartPosition> {
        self.group_start.parse().map_err(|_| {
            AppError::InvalidValue(format!("stream.group_start: {}", self.group_start))
        })
    }
}

/// Parse a legacy count variable, a set but unparsable value is an error.
fn legacy_count(var: &str, raw: Option<String>) -> AppResult<Option<u64>> {
    raw.map(|raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|_| AppError::InvalidValue(format!("{var}: expected a count, got {raw:?}")))
    })
    .transpose()
}

impl ClaimConfig {
    /// Load defaults, then `path` (or an optional `./conf.toml`), then
    /// `STREAMCLAIM__SECTION__KEY` variables, then the legacy variables.
    pub fn set_up_config(path: Option<&Path>) -> AppResult<ClaimConfig> {
        Self::load(path, ENV_PREFIX, true)
    }

    fn load(path: Option<&Path>, env_prefix: &str, legacy_env: bool) -> AppResult<ClaimConfig> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
        };
        let mut builder = config::Config::builder().add_source(file).add_source(
            config::Environment::with_prefix(env_prefix)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("redis.nodes")
                .try_parsing(true),
        );
        if legacy_env {
            for (var, key) in LEGACY_ENV {
                builder = builder.set_override_option(key, std::env::var(var).ok())?;
            }
            for (var, key) in LEGACY_NUMERIC_ENV {
                let value = legacy_count(var, std::env::var(var).ok())?;
                builder = builder.set_override_option(key, value)?;
            }
        }

        let mut claim_config: ClaimConfig = builder.build()?.try_deserialize()?;
        claim_config.validate()?;
        Ok(claim_config)
    }

    /// Reject settings the workers cannot run with and fill generated values.
    pub fn validate(&mut self) -> AppResult<()> {
        if self.stream.key.trim().is_empty() {
            return Err(AppError::InvalidValue("stream.key is empty".into()));
        }
        if self.stream.group.trim().is_empty() {
            return Err(AppError::InvalidValue("stream.group is empty".into()));
        }
        self.stream.start_position()?;
        if self.retry.max_retry == 0 {
            return Err(AppError::InvalidValue(
                "retry.max_retry must be at least 1".into(),
            ));
        }
        if self.consumer.read_count == 0 {
            return Err(AppError::InvalidValue(
                "consumer.read_count must be at least 1".into(),
            ));
        }
        if self.reclaimer.batch_size == 0 {
            return Err(AppError::InvalidValue(
                "reclaimer.batch_size must be at least 1".into(),
            ));
        }
        if self.reclaimer.idle_threshold_ms == 0 {
            return Err(AppError::InvalidValue(
                "reclaimer.idle_threshold_ms must be positive".into(),
            ));
        }

        if self.consumer.identity.trim().is_empty() {
            self.consumer.identity = format!("consumer-{}", Uuid::new_v4().simple());
        }
        if self.reclaimer.identity.trim().is_empty() {
            self.reclaimer.identity = format!("reclaimer-{}", Uuid::new_v4().simple());
        }
        if self.consumer.identity == self.reclaimer.identity {
            warn!(
                identity = %self.consumer.identity,
                "consumer and reclaimer share an identity, reclaimed entries stay with the same owner"
            );
        }
        if self.consumer.block_ms > 0 && self.reclaimer.idle_threshold_ms <= self.consumer.block_ms {
            warn!(
                idle_threshold_ms = self.reclaimer.idle_threshold_ms,
                block_ms = self.consumer.block_ms,
                "reclaimer idle threshold is not above the consumer's read block, slow entries may be claimed twice"
            );
        }
        Ok(())
    }

    /// Redis endpoints, required only for the redis backend.
    pub fn redis_nodes(&self) -> AppResult<&[String]> {
        if self.redis.nodes.is_empty() {
            return Err(AppError::InvalidValue("redis.nodes is empty".into()));
        }
        Ok(&self.redis.nodes)
    }

    pub fn target_count(&self) -> u64 {
        self.consumer
            .target_count
            .unwrap_or(self.stream.message_count)
    }

    /// Copy safe to print.
    pub fn redacted(&self) -> ClaimConfig {
        let mut copy = self.clone();
        if copy.redis.password.is_some() {
            copy.redis.password = Some("******".to_string());
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_match_the_cluster_deployment() {
        let mut config = ClaimConfig::default();
        config.validate().unwrap();
        assert_eq!(config.reclaimer.idle_threshold(), Duration::from_secs(300));
        assert_eq!(config.reclaimer.batch_size, 100);
        assert_eq!(config.consumer.read_count, 1);
        assert_eq!(config.consumer.block(), Block::Forever);
        assert_eq!(config.redis.nodes.len(), 6);
        assert_eq!(config.target_count(), config.stream.message_count);
        assert_eq!(config.stream.start_position().unwrap(), StartPosition::Latest);
        assert_eq!(config.telemetry.progress_interval, 1000);
    }

    #[test]
    fn file_values_override_defaults() {
        let file = toml_file(
            r#"
            [stream]
            key = "orders"
            group = "billing"
            message_count = 5

            [reclaimer]
            idle_threshold_ms = 2000

            [retry]
            max_retry = 5

            [telemetry]
            progress_interval = 0

            [redis]
            nodes = ["redis://10.0.0.1:6379"]
            "#,
        );
        let config = ClaimConfig::load(Some(file.path()), "STREAMCLAIM_TEST_FILE", false).unwrap();
        assert_eq!(config.stream.key, "orders");
        assert_eq!(config.stream.group, "billing");
        assert_eq!(config.target_count(), 5);
        assert_eq!(config.reclaimer.idle_threshold_ms, 2000);
        assert_eq!(config.reclaimer.batch_size, 100);
        assert_eq!(config.retry.max_retry, 5);
        assert!(!config.telemetry.progress().is_tick(0));
        assert_eq!(config.redis_nodes().unwrap(), ["redis://10.0.0.1:6379"]);
    }

    #[test]
    fn environment_overrides_file() {
        let file = toml_file("[stream]\nkey = \"from-file\"\n");
        std::env::set_var("STREAMCLAIM_TEST_ENV__STREAM__KEY", "from-env");
        std::env::set_var("STREAMCLAIM_TEST_ENV__REDIS__NODES", "a:1,b:2");
        let config = ClaimConfig::load(Some(file.path()), "STREAMCLAIM_TEST_ENV", false).unwrap();
        std::env::remove_var("STREAMCLAIM_TEST_ENV__STREAM__KEY");
        std::env::remove_var("STREAMCLAIM_TEST_ENV__REDIS__NODES");

        assert_eq!(config.stream.key, "from-env");
        assert_eq!(config.redis.nodes, vec!["a:1".to_string(), "b:2".to_string()]);
    }

    #[test]
    fn legacy_count_variables_are_parsed() {
        assert_eq!(legacy_count("Max_retry", None).unwrap(), None);
        assert_eq!(
            legacy_count("Max_retry", Some(" 5 ".to_string())).unwrap(),
            Some(5)
        );
        for bad in ["", "three", "-1", "2.5"] {
            let err = legacy_count("Max_retry", Some(bad.to_string())).unwrap_err();
            assert!(matches!(err, AppError::InvalidValue(message) if message.starts_with("Max_retry")));
        }
    }

    #[test]
    fn legacy_variables_override_file_and_prefixed_env() {
        // the only test loading with legacy variables on, they are process-wide
        let file = toml_file("[stream]\nmessage_count = 5\n\n[retry]\nmax_retry = 2\n");
        std::env::set_var("Publishing_message_num", "20000");
        std::env::set_var("Max_retry", "7");
        let config = ClaimConfig::load(Some(file.path()), "STREAMCLAIM_TEST_LEGACY", true);
        std::env::set_var("Max_retry", "lots");
        let invalid = ClaimConfig::load(Some(file.path()), "STREAMCLAIM_TEST_LEGACY", true);
        std::env::remove_var("Publishing_message_num");
        std::env::remove_var("Max_retry");

        let config = config.unwrap();
        assert_eq!(config.stream.message_count, 20_000);
        assert_eq!(config.target_count(), 20_000);
        assert_eq!(config.retry.max_retry, 7);
        assert!(matches!(invalid, Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = ClaimConfig::load(
            Some(Path::new("/definitely/not/here.toml")),
            "STREAMCLAIM_TEST_MISSING",
            false,
        );
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let mut config = ClaimConfig::default();
        config.retry.max_retry = 0;
        assert!(config.validate().is_err());

        let mut config = ClaimConfig::default();
        config.reclaimer.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ClaimConfig::default();
        config.stream.group_start = "yesterday".into();
        assert!(config.validate().is_err());

        let mut config = ClaimConfig::default();
        config.redis.nodes.clear();
        assert!(config.redis_nodes().is_err());
    }

    #[test]
    fn empty_identity_gets_generated() {
        let mut config = ClaimConfig::default();
        config.consumer.identity = String::new();
        config.validate().unwrap();
        assert!(config.consumer.identity.starts_with("consumer-"));
        assert!(config.consumer.identity.len() > "consumer-".len());
    }

    #[test]
    fn redacted_hides_password() {
        let mut config = ClaimConfig::default();
        config.redis.password = Some("s3cret".into());
        let printed = format!("{:?}", config.redacted());
        assert!(!printed.contains("s3cret"));
    }
}
