//! Configuration for binaries.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Controller endpoint: where the agent and CLI dial, and where the server
/// binds.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerDetails {
    pub host: String,
    pub port: u16,
}

/// Agent-side knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentDetails {
    /// Executor parallelism.
    pub workers: usize,
    /// Seconds between polling cycle starts.
    pub poll_interval_secs: u64,
    /// Overrides the machine-derived identity when set.
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerDetails,
    pub agent: AgentDetails,
}

impl Settings {
    /// Layered load: built-in defaults, then the config file (`--config`
    /// path, or `config/default.*` if present), then `RINGTAIL_*`
    /// environment variables (`RINGTAIL_SERVER__PORT=9999`).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8888_i64)?
            .set_default("agent.workers", 10_i64)?
            .set_default("agent.poll_interval_secs", 10_i64)?;

        builder = match path {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("config/default").required(false)),
        };

        builder
            .add_source(Environment::with_prefix("RINGTAIL").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Startup validation; failures here are fatal with a clear message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message(
                "server port must be between 1 and 65535".into(),
            ));
        }
        if self.server.host.is_empty() {
            return Err(ConfigError::Message("server host cannot be empty".into()));
        }
        Ok(())
    }
}
