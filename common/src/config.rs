// Configuration management with layered configuration (file, env, CLI)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub rabbitmq: RabbitMqConfig,
    /// Glob pattern matching one YAML definition file per jobber
    pub include: String,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub jobber_log: JobberLogConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RabbitMqConfig {
    /// Candidate brokers as `host:port`, tried in order
    pub brokers: Vec<String>,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_reconnect_interval_ms() -> u64 {
    2000
}

fn default_autostart() -> bool {
    false
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    pub timeout_seconds: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self { timeout_seconds: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobberLogConfig {
    pub max_size_mb: u64,
    pub max_backups: usize,
}

impl Default for JobberLogConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 100,
            max_backups: 30,
        }
    }
}

impl JobberLogConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default = "default_json_logs")]
    pub json: bool,
    pub metrics_port: Option<u16>,
}

fn default_json_logs() -> bool {
    true
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
            metrics_port: None,
        }
    }
}

impl RabbitMqConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Build the AMQP URI for one candidate broker
    pub fn uri_for(&self, host: &str) -> String {
        let vhost = self.vhost.trim_start_matches('/');
        let vhost = if vhost.is_empty() {
            "%2f".to_string()
        } else {
            encode_component(vhost)
        };

        format!(
            "amqp://{}:{}@{}/{}",
            encode_component(&self.user),
            encode_component(&self.password),
            host,
            vhost
        )
    }

    /// URIs for every configured broker, in connection order
    pub fn uris(&self) -> Vec<String> {
        self.brokers.iter().map(|host| self.uri_for(host)).collect()
    }
}

fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

impl Settings {
    /// Load configuration from a specific directory, optionally layering an explicit file on top
    pub fn load_from_path<P: AsRef<Path>>(
        config_dir: P,
        config_file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Settings::default();

        let mut builder = Config::builder()
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", i64::from(defaults.server.port))?
            .set_default("rabbitmq.brokers", defaults.rabbitmq.brokers)?
            .set_default("rabbitmq.user", defaults.rabbitmq.user)?
            .set_default("rabbitmq.password", defaults.rabbitmq.password)?
            .set_default("include", defaults.include)?
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false));

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("JOBBER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("rabbitmq.brokers")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.rabbitmq.brokers.is_empty() {
            return Err("At least one RabbitMQ broker must be configured".to_string());
        }
        if self.rabbitmq.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err("RabbitMQ broker address cannot be empty".to_string());
        }
        if self.rabbitmq.reconnect_interval_ms == 0 {
            return Err("RabbitMQ reconnect_interval_ms must be greater than 0".to_string());
        }

        if self.include.trim().is_empty() {
            return Err("Jobber include pattern cannot be empty".to_string());
        }

        if self.forward.timeout_seconds == 0 {
            return Err("Forward timeout_seconds must be greater than 0".to_string());
        }

        if self.jobber_log.max_size_mb == 0 {
            return Err("Jobber log max_size_mb must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            rabbitmq: RabbitMqConfig {
                brokers: vec!["localhost:5672".to_string()],
                user: "guest".to_string(),
                password: "guest".to_string(),
                vhost: String::new(),
                reconnect_interval_ms: default_reconnect_interval_ms(),
                autostart: default_autostart(),
            },
            include: "config/jobbers/*.yaml".to_string(),
            forward: ForwardConfig::default(),
            jobber_log: JobberLogConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
