//! Configuration loader with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;

use crate::domain::error::ConfigError;
use crate::domain::models::Config;

/// Loads and validates the engine configuration.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `stratagem.yaml` in the working directory
    /// 3. `stratagem.local.yaml` (optional local overrides)
    /// 4. Environment variables (`STRATAGEM_*`, `__` as separator)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("stratagem.yaml"))
            .merge(Yaml::file("stratagem.local.yaml"))
            .merge(Env::prefixed("STRATAGEM_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from an explicit file, for tests and one-off runs.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a loaded configuration.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.executor.max_steps == 0 {
            return Err(ConfigError::InvalidExecutorSetting {
                field: "max_steps",
                value: "0".to_string(),
            });
        }
        if config.executor.recent_messages_keep == 0 {
            return Err(ConfigError::InvalidExecutorSetting {
                field: "recent_messages_keep",
                value: "0".to_string(),
            });
        }
        if config.executor.max_output_length == 0 {
            return Err(ConfigError::InvalidExecutorSetting {
                field: "max_output_length",
                value: "0".to_string(),
            });
        }

        for server in &config.tool_servers {
            if server.name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "tool server name cannot be empty".to_string(),
                ));
            }
            if server.command.is_empty() {
                return Err(ConfigError::ToolServerMissingCommand(server.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn test_zero_max_steps_rejected() {
        let mut config = Config::default();
        config.executor.max_steps = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidExecutorSetting { field: "max_steps", .. })
        ));
    }

    #[test]
    fn test_empty_database_path_rejected() {
        let mut config = Config::default();
        config.database.path = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyDatabasePath)
        ));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "chatty".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_tool_server_without_command_rejected() {
        let mut config = Config::default();
        config.tool_servers.push(crate::domain::models::ToolServerConfig {
            name: "broken".to_string(),
            command: String::new(),
            args: vec![],
            env: std::collections::HashMap::new(),
            transport: "stdio".to_string(),
        });
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ToolServerMissingCommand(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "executor:\n  max_steps: 7\nhuman_in_the_loop: true"
        )
        .unwrap();
        file.flush().unwrap();
        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.executor.max_steps, 7);
        assert!(config.human_in_the_loop);
    }
}
