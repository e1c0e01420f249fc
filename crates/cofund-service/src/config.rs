//! Configuration for cofundd

use cofund_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine tunables and storage backend
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            gateway: GatewayConfig::default(),
            jobs: JobsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,

    /// Shared secret expected in `x-admin-token` on admin routes
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8092)),
            admin_token: default_admin_token(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Secret the webhook signing key is derived from
    #[serde(default = "default_webhook_secret")]
    pub webhook_secret: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            webhook_secret: default_webhook_secret(),
        }
    }
}

/// Background job intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_schedule_interval")]
    pub withdrawal_schedule_interval_secs: u64,

    #[serde(default = "default_process_interval")]
    pub withdrawal_process_interval_secs: u64,

    #[serde(default = "default_boost_expiry_interval")]
    pub boost_expiry_interval_secs: u64,

    #[serde(default = "default_stale_sweep_interval")]
    pub stale_pledge_sweep_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            withdrawal_schedule_interval_secs: default_schedule_interval(),
            withdrawal_process_interval_secs: default_process_interval(),
            boost_expiry_interval_secs: default_boost_expiry_interval(),
            stale_pledge_sweep_interval_secs: default_stale_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_admin_token() -> String {
    "cofund-local-admin".to_string()
}

fn default_webhook_secret() -> String {
    "cofund-local-webhook-secret".to_string()
}

fn default_schedule_interval() -> u64 {
    6 * 60 * 60
}

fn default_process_interval() -> u64 {
    60 * 60
}

fn default_boost_expiry_interval() -> u64 {
    60
}

fn default_stale_sweep_interval() -> u64 {
    60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Defaults, then the optional file, then `COFUND__*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `COFUND__ENGINE__BOOST_CAP=20`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ServiceConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("COFUND")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cofund_core::StorageConfig;

    #[test]
    fn defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8092);
        assert!(matches!(config.engine.storage, StorageConfig::Memory));
        assert_eq!(config.engine.boost_cap, 10);
        assert!(config.jobs.enabled);
        assert_eq!(config.jobs.boost_expiry_interval_secs, 60);
    }

    #[test]
    fn load_without_file_matches_defaults() {
        let config = ServiceConfig::load(None).unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.server.admin_token, "cofund-local-admin");
    }
}
