//! Configuration management
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML file,
//! `ROOMLINK__SECTION__KEY` environment variables, and finally `PORT`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "roomlink.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ice: IceConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Browser origin allowed to reach the relay cross-origin
    pub allowed_origin: String,
    pub enable_metrics: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    /// The single STUN server handed to every peer connection
    pub stun_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub negotiation_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3001,
                allowed_origin: "http://localhost:3000".to_string(),
                enable_metrics: true,
            },
            ice: IceConfig {
                stun_url: "stun:stun.l.google.com:19302".to_string(),
            },
            client: ClientConfig {
                signaling_url: "ws://localhost:3001/ws".to_string(),
                negotiation_timeout_secs: 30,
                sweep_interval_secs: 5,
            },
        }
    }
}

impl Config {
    /// Load from `path` (or `roomlink.toml` if present) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("ROOMLINK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("server.port", std::env::var("PORT").ok())?
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.negotiation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "client.negotiation_timeout_secs must be positive".to_string(),
            ));
        }
        if self.client.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "client.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if !self.ice.stun_url.starts_with("stun:") {
            return Err(ConfigError::Invalid(format!(
                "ice.stun_url must be a stun: URL, got {}",
                self.ice.stun_url
            )));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.client.negotiation_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.client.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.server.allowed_origin, "http://localhost:3000");
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("roomlink-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[server]\nallowed_origin = \"https://rooms.example\"\n\n[client]\nnegotiation_timeout_secs = 10\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server.allowed_origin, "https://rooms.example");
        assert_eq!(config.client.negotiation_timeout_secs, 10);
        assert_eq!(config.ice, Config::default().ice);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = std::env::temp_dir().join("roomlink-does-not-exist.toml");
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = Config::default();
        config.client.negotiation_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
