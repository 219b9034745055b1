// crates/relay/src/config.rs
//! Command-line and environment configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;
use crate::relay::RelaySettings;
use crate::telemetry::LogFormat;

/// Default port for the server.
pub const DEFAULT_PORT: u16 = 8002;

/// What happens to an in-flight job when its session disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DisconnectPolicy {
    /// Keep running; later progress events are dropped.
    #[default]
    Detach,
    /// Abort the job at its next suspension point.
    Cancel,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "mlgen-relay", version, about = "MCP relay for backend ML project generation")]
pub struct Config {
    /// Address to bind the session endpoint to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Base URL of the generation backend.
    #[arg(long, env = "BACKEND_URL", default_value = "http://127.0.0.1:8000")]
    pub backend_url: String,

    /// End-to-end timeout for one backend job, in seconds.
    #[arg(long, env = "JOB_TIMEOUT_SECS", default_value_t = 3600)]
    pub job_timeout_secs: u64,

    /// Destination used when a tool call does not name one.
    #[arg(long, env = "DOWNLOAD_DIR", default_value = "./Project_Directory/")]
    pub download_dir: String,

    #[arg(long, env = "ON_DISCONNECT", value_enum, default_value_t = DisconnectPolicy::Detach)]
    pub on_disconnect: DisconnectPolicy,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.host.parse().map_err(|source| ConfigError::BindAddr {
            addr: self.host.clone(),
            source,
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn relay_settings(&self) -> Result<RelaySettings, ConfigError> {
        reqwest::Url::parse(&self.backend_url).map_err(|e| ConfigError::BackendUrl {
            url: self.backend_url.clone(),
            message: e.to_string(),
        })?;
        Ok(RelaySettings {
            backend_url: self.backend_url.clone(),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            default_destination: self.download_dir.clone(),
        })
    }
}
