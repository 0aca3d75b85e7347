use anyhow::{Context, Result};
use meshkit::{ClientConfig, RegistryConfig, ServiceDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides, e.g. `MESH__REGISTRY__SERVICE_TTL=2m`
pub const ENV_PREFIX: &str = "MESH__";

/// Host configuration: library sections plus agent and logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Defaults for every service client
    #[serde(default)]
    pub client: ClientConfig,
    /// Logging configuration (optional, uses defaults if None).
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    /// Instances registered at startup
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    pub name: String,
    /// Keep statically configured services alive by heart-beating them
    pub heartbeat_services: bool,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Relative log file paths are resolved against this directory
    pub log_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "meshkit-agent".to_string(),
            heartbeat_services: true,
            heartbeat_interval: Duration::from_secs(30),
            log_dir: ".".to_string(),
        }
    }
}

/// Logging configuration - maps target prefixes to their logging settings.
/// Key "default" is the catch-all for logs that don't match an explicit prefix.
pub type LoggingConfig = HashMap<String, LogSection>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    #[serde(default = "default_console_level")]
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // empty: no file sink
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

fn default_console_level() -> String {
    "info".to_string()
}

pub fn default_logging_config() -> LoggingConfig {
    HashMap::from([(
        "default".to_string(),
        LogSection {
            console_level: "info".to_string(),
            file: "logs/meshkit-agent.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    )])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            registry: RegistryConfig::default(),
            client: ClientConfig::default(),
            logging: Some(default_logging_config()),
            services: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Layered loading: defaults → YAML file → `MESH__*` environment variables.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let path = config_path.as_ref();
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }

        // logging stays None unless YAML/ENV provide it
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to extract config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults (still honouring `MESH__*`) when no file is given.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        use figment::{
            providers::{Env, Serialized},
            Figment,
        };

        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let config: AppConfig = Figment::new()
                    .merge(Serialized::defaults(AppConfig::default()))
                    .merge(Env::prefixed(ENV_PREFIX).split("__"))
                    .extract()
                    .context("Failed to extract default config")?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for def in &self.services {
            if def.endpoints.is_empty() {
                anyhow::bail!("service '{}' must declare at least one endpoint", def.name);
            }
        }
        if self.registry.health_check_interval.is_zero() {
            anyhow::bail!("registry.health_check_interval must be greater than zero");
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let logging = self.logging.get_or_insert_with(default_logging_config);
        let section = logging
            .entry("default".to_string())
            .or_insert_with(|| LogSection {
                console_level: default_console_level(),
                file: String::new(),
                file_level: String::new(),
                max_age_days: None,
                max_backups: None,
                max_size_mb: None,
            });
        match args.verbose {
            0 => {}
            1 => section.console_level = "debug".to_string(),
            _ => section.console_level = "trace".to_string(),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.agent.log_dir)
    }
}

/// Command line flags that override loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// `-v` count: 1 lowers console logging to debug, 2+ to trace
    pub verbose: u8,
}
