use notifier::config::Config as NotifierConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "herald".to_string()
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                level: debug
                sentry_dsn: https://key@sentry.example.com/1
            notifier:
                listener:
                    host: 0.0.0.0
                    port: 9080
                long_poll:
                    timeout_secs: 30
                delivery:
                    batch_size: 200
                    workers: 4
                app_namespaces:
                    - app_id: checkout
                      name: application
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "herald");

        let logging = config.common.logging.expect("logging config");
        assert_eq!(logging.level, "debug");
        assert!(logging.sentry_dsn.is_some());

        let notifier = config.notifier;
        assert_eq!(notifier.listener.port, 9080);
        assert_eq!(notifier.admin_listener.port, 8081);
        assert_eq!(notifier.long_poll.timeout_secs, 30);
        assert_eq!(notifier.delivery.batch_size, 200);
        assert_eq!(notifier.delivery.batch_interval_ms, 100);
        assert_eq!(notifier.delivery.workers, 4);
        assert_eq!(notifier.app_namespaces.len(), 1);
        assert_eq!(notifier.validate(), Ok(()));
    }

    #[test]
    fn empty_sections_use_defaults() {
        let tmp = write_tmp_file("logging: {}\n");
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.common.metrics, None);
        assert_eq!(
            config.common.logging,
            Some(LoggingConfig {
                level: "info".into(),
                sentry_dsn: None
            })
        );
        assert_eq!(config.notifier.listener.port, 8080);
        assert_eq!(config.notifier.long_poll.timeout_secs, 60);
        assert_eq!(config.notifier.scanner.topic, "config-release");
    }

    #[test]
    fn load_errors() {
        let missing = Config::from_file(std::path::Path::new("/nonexistent/herald.yaml"));
        assert!(matches!(missing, Err(ConfigError::LoadError(_))));

        let tmp = write_tmp_file("notifier:\n    long_poll:\n        timeout_secs: soon\n");
        let invalid = Config::from_file(tmp.path());
        assert!(matches!(invalid, Err(ConfigError::ParseError(_))));
    }
}
