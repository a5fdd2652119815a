use std::collections::BTreeMap;
use std::{env, fs, path::Path};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::topology::{ExchangeDefinition, QueueDefinition};
use crate::transport::ExchangeKind;

pub const DEFAULT_SERVER: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USER: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";

/// Environment variable naming the config file when no path is given.
pub const CONFIG_PATH_ENV: &str = "AMQP_HELPER_CONFIG";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct QueueConfig {
    pub binding: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ExchangeConfig {
    #[serde(rename = "type", default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Passed to the transport untouched.
    pub ssl: Option<toml::Value>,
    /// Passed to the transport untouched.
    pub auth_mechanism: Option<String>,
    pub exchanges: BTreeMap<String, ExchangeConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileConfig {
    server: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    ssl: Option<toml::Value>,
    #[serde(alias = "authMechanism")]
    auth_mechanism: Option<String>,
    #[serde(default)]
    exchanges: BTreeMap<String, ExchangeConfig>,
}

/// Parameters handed to a [`Connector`](crate::transport::Connector).
#[derive(Clone, PartialEq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub ssl: Option<toml::Value>,
    pub auth_mechanism: Option<String>,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .field("auth_mechanism", &self.auth_mechanism)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from(FileConfig::default())
    }
}

impl From<FileConfig> for Config {
    fn from(file: FileConfig) -> Self {
        Config {
            server: file.server.unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            port: file.port.unwrap_or(DEFAULT_PORT),
            user: file.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            password: file.password.unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
            ssl: file.ssl,
            auth_mechanism: file.auth_mechanism,
            exchanges: file.exchanges,
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(raw)?;
        Ok(file.into())
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: defaults, then file values, then `AMQP_HELPER_*` variables.
    /// Without a path, `AMQP_HELPER_CONFIG` is consulted; with neither, only
    /// defaults and environment apply.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let effective_path = path
            .map(|s| s.to_string())
            .or_else(|| env::var(CONFIG_PATH_ENV).ok());

        let mut config = match effective_path {
            Some(p) => Self::from_toml_str(&fs::read_to_string(p)?)?,
            None => Config::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `AMQP_HELPER_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AMQP_HELPER_SERVER") {
            self.server = v;
        }

        if let Some(v) = lookup("AMQP_HELPER_PORT") {
            self.port = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("AMQP_HELPER_PORT: {e}")))?;
        }

        if let Some(v) = lookup("AMQP_HELPER_USER") {
            self.user = v;
        }

        if let Some(v) = lookup("AMQP_HELPER_PASSWORD") {
            self.password = v;
        }

        if let Some(v) = lookup("AMQP_HELPER_AUTH_MECHANISM") {
            self.auth_mechanism = Some(v);
        }

        Ok(())
    }

    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.server.clone(),
            port: self.port,
            login: self.user.clone(),
            password: self.password.clone(),
            ssl: self.ssl.clone(),
            auth_mechanism: self.auth_mechanism.clone(),
        }
    }

    pub fn rpc_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}",
            self.user, self.password, self.server, self.port
        )
    }

    /// Exchange definitions named after their table keys.
    pub fn exchange_definitions(&self) -> Vec<ExchangeDefinition> {
        self.exchanges
            .iter()
            .map(|(name, ex)| {
                ex.queues.iter().fold(
                    ExchangeDefinition::new(name.as_str(), ex.kind),
                    |def, (queue, q)| {
                        def.with_queue(QueueDefinition {
                            name: queue.clone(),
                            binding: q.binding.clone(),
                        })
                    },
                )
            })
            .collect()
    }
}

/// Reads `path`, then applies `AMQP_HELPER_*` environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    load_config_with(path, |key| env::var(key).ok())
}

fn load_config_with<P, F>(path: P, lookup: F) -> Result<Config, anyhow::Error>
where
    P: AsRef<Path>,
    F: Fn(&str) -> Option<String>,
{
    let raw: String = fs::read_to_string(path)?;
    let mut config: Config = Config::from_toml_str(&raw)?;
    config.apply_overrides(lookup)?;
    Ok(config)
}
