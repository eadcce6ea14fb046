//! Process-wide `tracing` subscriber setup.

use crate::ports::config_port::ConfigPort;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn from_config(config: &dyn ConfigPort) -> Self {
        Self {
            level: config
                .get_string("logging", "level")
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| "info".to_string()),
            json: config.get_bool("logging", "json", false),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level. Calling this twice is a no-op.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    #[test]
    fn defaults_when_section_missing() {
        let config = FileConfigAdapter::from_string("").unwrap();
        assert_eq!(LoggingConfig::from_config(&config), LoggingConfig::default());
    }

    #[test]
    fn reads_level_and_json() {
        let config =
            FileConfigAdapter::from_string("[logging]\nlevel = posrecon=debug\njson = true\n")
                .unwrap();
        let logging = LoggingConfig::from_config(&config);
        assert_eq!(logging.level, "posrecon=debug");
        assert!(logging.json);
    }

    #[test]
    fn init_twice_does_not_panic() {
        let logging = LoggingConfig::default();
        init_logging(&logging);
        init_logging(&logging);
    }
}
