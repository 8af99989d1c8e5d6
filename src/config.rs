//! Configuration loaded from TOML, with `${VAR}` expansion and per-field defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS. `*` allows any origin.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Docker,
    /// Plain host processes in per-session directories. No isolation.
    Host,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: Backend,
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub network: String,
    /// Initial working directory of a Docker environment.
    pub home_dir: String,
    /// Parent directory of host-backend environments.
    pub host_root: PathBuf,
    pub docker_bin: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub command_timeout_secs: u64,
    pub inactivity_limit_secs: u64,
    pub lifetime_limit_secs: u64,
    pub gc_interval_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Docker,
            image: "python:3.10-alpine".to_string(),
            memory: "128m".to_string(),
            cpus: "0.5".to_string(),
            network: "none".to_string(),
            home_dir: "/home".to_string(),
            host_root: PathBuf::from("/tmp/shellbox"),
            docker_bin: "docker".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            command_timeout_secs: 5,
            inactivity_limit_secs: 10 * 60,
            lifetime_limit_secs: 60 * 60,
            gc_interval_secs: 60,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn inactivity_limit(&self) -> Duration {
        Duration::from_secs(self.inactivity_limit_secs)
    }

    pub fn lifetime_limit(&self) -> Duration {
        Duration::from_secs(self.lifetime_limit_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

impl Config {
    /// Load a config file. Variables like `${DOCKER_BIN}` are expanded before parsing.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::env(content).map_err(|e| ConfigError::Expand {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        let config: Config = toml::from_str(&expanded).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sessions;
        if s.max_sessions == 0 {
            return Err(ConfigError::Invalid("sessions.max_sessions must be at least 1".into()));
        }
        for (name, value) in [
            ("command_timeout_secs", s.command_timeout_secs),
            ("inactivity_limit_secs", s.inactivity_limit_secs),
            ("lifetime_limit_secs", s.lifetime_limit_secs),
            ("gc_interval_secs", s.gc_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("sessions.{name} must be positive")));
            }
        }
        if !self.runtime.home_dir.starts_with('/') {
            return Err(ConfigError::Invalid("runtime.home_dir must be absolute".into()));
        }
        Ok(())
    }
}
