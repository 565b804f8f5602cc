use crate::gray_release::GrayReleaseRule;
use crate::store::{AppNamespace, Release};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_RELEASE_TOPIC: &str = "config-release";

/// Upper bound for `long_poll.timeout_secs`, one hour
pub const MAX_LONG_POLL_TIMEOUT_SECS: u64 = 3600;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("{0} must be greater than 0")]
    MustBePositive(&'static str),

    #[error("long_poll.timeout_secs cannot exceed {MAX_LONG_POLL_TIMEOUT_SECS}, got {0}")]
    TimeoutTooLarge(u64),

    #[error("Release topic cannot be empty")]
    EmptyTopic,

    #[error("Duplicate app namespace: {0}")]
    DuplicateAppNamespace(String),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    fn with_port(port: u16) -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener::with_port(8080)
    }
}

fn default_admin_listener() -> Listener {
    Listener::with_port(8081)
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct LongPollConfig {
    /// How long a poll stays parked before it is answered with "not modified"
    pub timeout_secs: u64,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        LongPollConfig { timeout_secs: 60 }
    }
}

impl LongPollConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Fan-outs above this size go to the background workers, which also use it
    /// as the slice size
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub workers: usize,
    /// Batches each worker may have queued. Once full, fan-outs are delivered
    /// inline instead.
    pub queue_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            batch_size: 100,
            batch_interval_ms: 100,
            workers: 1,
            queue_size: 64,
        }
    }
}

impl DeliveryConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ScannerConfig {
    pub interval_ms: u64,
    /// Maximum number of messages read from the log per round trip
    pub batch_size: usize,
    pub topic: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            interval_ms: 1000,
            batch_size: 500,
            topic: DEFAULT_RELEASE_TOPIC.into(),
        }
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct InstanceCacheConfig {
    pub ttl_secs: u64,
    pub max_capacity: u64,
}

impl Default for InstanceCacheConfig {
    fn default() -> Self {
        InstanceCacheConfig {
            ttl_secs: 70,
            max_capacity: 50_000,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub long_poll: LongPollConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub instance_cache: InstanceCacheConfig,
    /// Seed data for the in-memory stores
    #[serde(default)]
    pub app_namespaces: Vec<AppNamespace>,
    #[serde(default)]
    pub releases: Vec<Release>,
    #[serde(default)]
    pub gray_release_rules: Vec<GrayReleaseRule>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            admin_listener: default_admin_listener(),
            long_poll: LongPollConfig::default(),
            delivery: DeliveryConfig::default(),
            scanner: ScannerConfig::default(),
            instance_cache: InstanceCacheConfig::default(),
            app_namespaces: Vec::new(),
            releases: Vec::new(),
            gray_release_rules: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        let positive = [
            ("long_poll.timeout_secs", self.long_poll.timeout_secs as u128),
            ("delivery.batch_size", self.delivery.batch_size as u128),
            ("delivery.workers", self.delivery.workers as u128),
            ("delivery.queue_size", self.delivery.queue_size as u128),
            ("scanner.interval_ms", self.scanner.interval_ms as u128),
            ("scanner.batch_size", self.scanner.batch_size as u128),
            ("instance_cache.ttl_secs", self.instance_cache.ttl_secs as u128),
            ("instance_cache.max_capacity", self.instance_cache.max_capacity as u128),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ValidationError::MustBePositive(name));
            }
        }

        if self.long_poll.timeout_secs > MAX_LONG_POLL_TIMEOUT_SECS {
            return Err(ValidationError::TimeoutTooLarge(self.long_poll.timeout_secs));
        }

        if self.scanner.topic.is_empty() {
            return Err(ValidationError::EmptyTopic);
        }

        let mut seen = HashSet::new();
        for namespace in &self.app_namespaces {
            if !seen.insert((namespace.app_id.as_str(), namespace.name.to_lowercase())) {
                return Err(ValidationError::DuplicateAppNamespace(format!(
                    "{}/{}",
                    namespace.app_id, namespace.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let yaml = r#"
listener:
    host: "0.0.0.0"
    port: 8080
admin_listener:
    host: "127.0.0.1"
    port: 8081
long_poll:
    timeout_secs: 30
delivery:
    batch_size: 50
scanner:
    interval_ms: 500
app_namespaces:
    - app_id: app
      name: application
    - app_id: infra
      name: TEAM.shared
      is_public: true
releases:
    - id: 1
      app_id: app
      cluster_name: default
      namespace_name: application
gray_release_rules:
    - app_id: app
      cluster_name: default
      namespace_name: application
      branch_name: canary
      release_id: 2
      rule_items:
        - client_app_id: client
          client_ips: ["10.0.0.1"]
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(config.long_poll.timeout(), Duration::from_secs(30));
        assert_eq!(config.delivery.batch_size, 50);
        // Unset fields in a section keep their defaults
        assert_eq!(config.delivery.batch_interval(), Duration::from_millis(100));
        assert_eq!(config.delivery.workers, 1);
        assert_eq!(config.scanner.topic, DEFAULT_RELEASE_TOPIC);
        assert_eq!(config.instance_cache, InstanceCacheConfig::default());
        assert!(config.app_namespaces[1].is_public);
        assert_eq!(config.gray_release_rules[0].rule_items.len(), 1);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config, Config::default());
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.admin_listener.port, 8081);
        assert_eq!(config.long_poll.timeout_secs, 60);
        assert_eq!(config.instance_cache.ttl_secs, 70);
        assert_eq!(config.instance_cache.max_capacity, 50_000);
    }

    #[test]
    fn test_validation_errors() {
        let base_config: Config = serde_yaml::from_str("{}").unwrap();

        let mut config = base_config.clone();
        config.admin_listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config = base_config.clone();
        config.delivery.batch_size = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::MustBePositive("delivery.batch_size"))
        );

        let mut config = base_config.clone();
        config.long_poll.timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MustBePositive(_))
        ));

        let mut config = base_config.clone();
        config.long_poll.timeout_secs = u64::MAX;
        assert_eq!(
            config.validate(),
            Err(ValidationError::TimeoutTooLarge(u64::MAX))
        );
        config.long_poll.timeout_secs = MAX_LONG_POLL_TIMEOUT_SECS;
        assert!(config.validate().is_ok());

        let mut config = base_config.clone();
        config.delivery.queue_size = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::MustBePositive("delivery.queue_size"))
        );

        let mut config = base_config.clone();
        config.scanner.topic = String::new();
        assert_eq!(config.validate(), Err(ValidationError::EmptyTopic));

        let mut config = base_config;
        config.app_namespaces = vec![
            AppNamespace::new("app", "FX.billing", false),
            AppNamespace::new("app", "fx.billing", false),
        ];
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateAppNamespace(_))
        ));
    }

    #[test]
    fn test_deserialization_errors() {
        assert!(serde_yaml::from_str::<Config>("listener: {host: \"0.0.0.0\"}").is_err());
        assert!(serde_yaml::from_str::<Config>("long_poll: {timeout_secs: soon}").is_err());
        assert!(serde_yaml::from_str::<Config>("app_namespaces: [{app_id: app}]").is_err());
    }
}
